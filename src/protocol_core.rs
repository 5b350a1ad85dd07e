//! Frame codec and path helpers shared by the transport and the dispatcher
//!
//! Wire format: `LEN (4, little-endian u32) | JSON`, where `LEN` counts the
//! prefix itself plus the JSON body.

use anyhow::{bail, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::path::{Component, Path, PathBuf};

use crate::error::ProtocolError;
use crate::message::ControlMessage;
use crate::protocol::{LENGTH_PREFIX_LEN, MAX_FRAME_SIZE};

/// Validate frame payload size against MAX_FRAME_SIZE
pub fn validate_frame_size(size: usize) -> Result<(), ProtocolError> {
    if size > MAX_FRAME_SIZE {
        return Err(ProtocolError::Frame(format!(
            "payload too large: {} bytes (max: {})",
            size, MAX_FRAME_SIZE
        )));
    }
    Ok(())
}

/// Build the 4-byte length prefix for a JSON body of `payload_len` bytes
pub fn build_length_prefix(payload_len: usize) -> Result<[u8; 4], ProtocolError> {
    validate_frame_size(payload_len)?;
    let declared = (payload_len + LENGTH_PREFIX_LEN) as u32;
    Ok(declared.to_le_bytes())
}

/// Parse a length prefix. Returns the JSON body length it announces.
pub fn parse_length_prefix(prefix: [u8; 4]) -> Result<usize, ProtocolError> {
    let declared = u32::from_le_bytes(prefix) as usize;
    if declared < LENGTH_PREFIX_LEN {
        return Err(ProtocolError::Frame(format!(
            "declared length {} shorter than prefix",
            declared
        )));
    }
    let payload_len = declared - LENGTH_PREFIX_LEN;
    validate_frame_size(payload_len)?;
    Ok(payload_len)
}

/// Encode a message into one contiguous frame (prefix + JSON).
///
/// Queued as a single outbound item so a reconnect can never separate the
/// prefix from its body.
pub fn encode_frame(msg: &ControlMessage) -> Result<Bytes, ProtocolError> {
    let json = msg.to_json()?;
    let prefix = build_length_prefix(json.len())?;
    let mut out = BytesMut::with_capacity(LENGTH_PREFIX_LEN + json.len());
    out.extend_from_slice(&prefix);
    out.extend_from_slice(&json);
    Ok(out.freeze())
}

/// Reassembles frames from arbitrarily split or coalesced reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Extract the next complete JSON body, if one is buffered.
    ///
    /// A bad prefix leaves the stream unrecoverable: the buffer is dropped
    /// and the error returned.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        if self.buf.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }
        let mut prefix = [0u8; 4];
        prefix.copy_from_slice(&self.buf[..LENGTH_PREFIX_LEN]);
        let payload_len = match parse_length_prefix(prefix) {
            Ok(n) => n,
            Err(e) => {
                self.buf.clear();
                return Err(e);
            }
        };
        if self.buf.len() < LENGTH_PREFIX_LEN + payload_len {
            return Ok(None);
        }
        self.buf.advance(LENGTH_PREFIX_LEN);
        Ok(Some(self.buf.split_to(payload_len).freeze()))
    }
}

/// Resolve a peer-supplied relative path safely under a root directory.
/// Rejects absolute paths, parent components and NUL bytes, then makes sure
/// symlinks do not lead outside the root.
pub fn normalize_under_root(root: &Path, p: &Path) -> Result<PathBuf> {
    use Component::{CurDir, Normal, ParentDir, Prefix, RootDir};

    if p.to_string_lossy().contains('\0') {
        bail!("path contains NUL byte");
    }

    let mut safe = PathBuf::new();
    for component in p.components() {
        match component {
            CurDir => {}
            Normal(s) => safe.push(s),
            ParentDir | RootDir | Prefix(_) => {
                bail!("path contains disallowed component: {:?}", component);
            }
        }
    }
    if safe.as_os_str().is_empty() {
        bail!("empty path");
    }

    let root = root.canonicalize().unwrap_or_else(|_| root.to_path_buf());
    let joined = root.join(&safe);
    let final_path = if joined.exists() {
        joined.canonicalize()?
    } else {
        joined
    };
    if !final_path.starts_with(&root) {
        bail!("path {:?} escapes root {:?}", p, root);
    }
    Ok(final_path)
}

/// Create directory with parent creation
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.is_dir() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}
