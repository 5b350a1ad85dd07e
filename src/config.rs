//! Agent configuration file.
//!
//! Every field has a default so an empty file, or no file at all, yields a
//! working agent for the standard device layout.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{error, info};
use xmltree::Element;

use crate::protocol::timeouts;
use crate::transport::TransportOptions;

pub const DEFAULT_HOST: &str = "47.96.186.209";
pub const DEFAULT_PORT: u16 = 10896;
pub const DEFAULT_LINK_INFO: &str = "/root/Antwork/ws/config/link_info.json";
pub const DEFAULT_COMM_ENV: &str = "/root/Antwork/ws/config/comm_env.xml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub upload: UploadConfig,
    pub timing: TimingConfig,
    pub transport: TransportConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Link-info JSON; when readable it overrides host and port. An empty
    /// path disables the lookup.
    pub link_info: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            link_info: Some(PathBuf::from(DEFAULT_LINK_INFO)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub workspace: PathBuf,
    pub log_dir: PathBuf,
    pub firmware_dir: PathBuf,
    pub update_config: PathBuf,
    pub install_info: PathBuf,
    pub identity: PathBuf,
    /// `comm_env.xml`; its `file_upload_rpc@upload_dir` is the upload URL.
    pub comm_env: Option<PathBuf>,
    pub journal: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let ws = PathBuf::from("/root/Antwork/ws");
        Self {
            log_dir: ws.join("log"),
            update_config: ws.join("config/update_config.json"),
            identity: ws.join("config/hardware.xml"),
            workspace: ws,
            firmware_dir: PathBuf::from("/firmware"),
            install_info: PathBuf::from("/root/Antwork/install_info"),
            comm_env: Some(PathBuf::from(DEFAULT_COMM_ENV)),
            journal: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Used when `paths.comm_env` gives no upload URL.
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub heartbeat_ms: u64,
    pub progress_interval_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub reboot_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: timeouts::HEARTBEAT_MS,
            progress_interval_ms: timeouts::PROGRESS_INTERVAL_MS,
            reconnect_initial_ms: timeouts::RECONNECT_INITIAL_MS,
            reconnect_max_ms: timeouts::RECONNECT_MAX_MS,
            reboot_delay_ms: timeouts::REBOOT_DELAY_MS,
        }
    }
}

impl TimingConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn reboot_delay(&self) -> Duration {
        Duration::from_millis(self.reboot_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Outbound queue capacity; 0 means unbounded.
    pub max_queue: usize,
    pub reboot_command: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_queue: 0,
            reboot_command: "reboot".to_string(),
        }
    }
}

impl AgentConfig {
    pub fn parse(text: &str) -> Result<Self> {
        let config: AgentConfig = toml::from_str(text).context("parse agent config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("read agent config {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("in {}", path.display()))
    }

    /// Load `path` if given, defaults otherwise; then apply link info and
    /// the comm env upload URL.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        config.apply_link_info();
        config.apply_comm_env();
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            bail!("server.host must not be empty");
        }
        if self.server.port == 0 {
            bail!("server.port must be non-zero");
        }
        let t = &self.timing;
        if t.heartbeat_ms == 0 {
            bail!("timing.heartbeat_ms must be non-zero");
        }
        if t.reconnect_initial_ms == 0 || t.reconnect_max_ms < t.reconnect_initial_ms {
            bail!(
                "timing: need 0 < reconnect_initial_ms ({}) <= reconnect_max_ms ({})",
                t.reconnect_initial_ms,
                t.reconnect_max_ms
            );
        }
        Ok(())
    }

    /// Override host/port from the link-info file. Failures keep the
    /// configured endpoint.
    pub fn apply_link_info(&mut self) {
        let Some(path) = self.server.link_info.clone().filter(|p| !p.as_os_str().is_empty()) else {
            return;
        };
        let parsed = std::fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))
            .and_then(|text| parse_link_info(&text));
        match parsed {
            Ok((host, port)) => {
                info!(link_info = %path.display(), %host, port, "endpoint from link info");
                self.server.host = host;
                self.server.port = port;
            }
            Err(e) => error!(
                link_info = %path.display(),
                error = %format!("{:#}", e),
                "link info unusable; keeping configured endpoint"
            ),
        }
    }

    /// Take the upload URL from `comm_env.xml`. Failures keep `upload.url`.
    pub fn apply_comm_env(&mut self) {
        let Some(path) = self.paths.comm_env.clone().filter(|p| !p.as_os_str().is_empty()) else {
            return;
        };
        let parsed = std::fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))
            .and_then(|text| parse_comm_env(&text));
        match parsed {
            Ok(url) => {
                info!(comm_env = %path.display(), upload_url = %url, "upload URL from comm env");
                self.upload.url = url;
            }
            Err(e) => error!(
                comm_env = %path.display(),
                error = %format!("{:#}", e),
                upload_url = %self.upload.url,
                "comm env unusable; keeping configured upload URL"
            ),
        }
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            reconnect_initial: Duration::from_millis(self.timing.reconnect_initial_ms),
            reconnect_max: Duration::from_millis(self.timing.reconnect_max_ms),
            max_queue: match self.transport.max_queue {
                0 => None,
                n => Some(n),
            },
            ..TransportOptions::default()
        }
    }
}

/// `{"msg":{"update":{"ip":"…","port":"…"}}}`; the port may be a string
/// or a number.
pub fn parse_link_info(text: &str) -> Result<(String, u16)> {
    let doc: Value = serde_json::from_str(text).context("link info is not JSON")?;
    let update = doc
        .pointer("/msg/update")
        .context("link info has no msg.update")?;
    let host = update
        .get("ip")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .context("link info has no ip")?
        .to_string();
    let port = match update.get("port") {
        Some(Value::String(s)) => s.trim().parse::<u16>().ok(),
        Some(Value::Number(n)) => n.as_u64().and_then(|n| u16::try_from(n).ok()),
        _ => None,
    }
    .filter(|p| *p != 0)
    .context("link info has no valid port")?;
    Ok((host, port))
}

/// `<root><file_upload_rpc upload_dir="…"/></root>`
pub fn parse_comm_env(text: &str) -> Result<String> {
    let root = Element::parse(text.as_bytes())
        .map_err(|e| anyhow!("comm env is not XML: {}", e))?;
    if root.name != "root" {
        bail!("comm env root is <{}>, expected <root>", root.name);
    }
    root.get_child("file_upload_rpc")
        .and_then(|el| el.attributes.get("upload_dir"))
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .context("comm env has no file_upload_rpc upload_dir")
}
