//! HTTP collaborators: firmware download, file upload, and the reboot hook

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Progress of one transfer as seen by the downloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub downloaded: u64,
    /// Content length when the server sent one.
    pub total: Option<u64>,
}

/// Fetches a URL into a file.
///
/// The progress callback belongs to this one call, so any number of
/// transfers may run at once.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: &mut (dyn FnMut(TransferProgress) + Send),
    ) -> Result<u64>;
}

#[async_trait]
pub trait Uploader: Send + Sync {
    async fn upload(&self, file: &Path, url: &str, name: &str) -> Result<()>;
}

/// Fire-and-forget host reboot.
pub trait Rebooter: Send + Sync {
    fn reboot(&self) -> Result<()>;
}

pub struct HttpDownloader {
    client: reqwest::Client,
}

impl HttpDownloader {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("otagent/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: &mut (dyn FnMut(TransferProgress) + Send),
    ) -> Result<u64> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("request {}", url))?;
        if !response.status().is_success() {
            bail!("HTTP {} from {}", response.status(), url);
        }
        let total = response.content_length();
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("create {}", dest.display()))?;

        let mut downloaded = 0u64;
        while let Some(chunk) = response.chunk().await.context("read body")? {
            file.write_all(&chunk)
                .await
                .with_context(|| format!("write {}", dest.display()))?;
            downloaded += chunk.len() as u64;
            progress(TransferProgress { downloaded, total });
        }
        file.flush().await?;
        if let Some(expected) = total {
            if downloaded != expected {
                bail!("short download: {} of {} bytes", downloaded, expected);
            }
        }
        debug!(url, bytes = downloaded, "download finished");
        Ok(downloaded)
    }
}

/// Multipart upload with fields `file` and `name`.
///
/// Log files keep growing while they are uploaded, so the upload reads a
/// `.bak` snapshot that is removed afterwards.
pub struct HttpUploader {
    client: reqwest::Client,
}

impl HttpUploader {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("otagent/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("build HTTP client")?;
        Ok(Self { client })
    }
}

fn backup_path(file: &Path) -> PathBuf {
    let mut name = file.as_os_str().to_owned();
    name.push(".bak");
    PathBuf::from(name)
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, file: &Path, url: &str, name: &str) -> Result<()> {
        let backup = backup_path(file);
        tokio::fs::copy(file, &backup)
            .await
            .with_context(|| format!("snapshot {}", file.display()))?;

        let result = async {
            let data = tokio::fs::read(&backup)
                .await
                .with_context(|| format!("read {}", backup.display()))?;
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| name.to_string());
            let form = reqwest::multipart::Form::new()
                .part("file", reqwest::multipart::Part::bytes(data).file_name(file_name))
                .text("name", name.to_string());
            let response = self
                .client
                .post(url)
                .multipart(form)
                .send()
                .await
                .with_context(|| format!("post {}", url))?;
            if !response.status().is_success() {
                bail!("HTTP {} from {}", response.status(), url);
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;

        if let Err(e) = tokio::fs::remove_file(&backup).await {
            warn!(path = %backup.display(), error = %e, "failed to remove upload snapshot");
        }
        result
    }
}

pub struct SystemReboot {
    pub command: String,
}

impl Rebooter for SystemReboot {
    fn reboot(&self) -> Result<()> {
        info!(command = %self.command, "rebooting host");
        let mut parts = self.command.split_whitespace();
        let program = parts.next().context("empty reboot command")?;
        Command::new(program)
            .args(parts)
            .spawn()
            .with_context(|| format!("spawn {}", self.command))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backup_path_appends_suffix() {
        assert_eq!(backup_path(Path::new("/ws/log/app.log")), PathBuf::from("/ws/log/app.log.bak"));
    }

    #[test]
    fn test_empty_reboot_command_is_an_error() {
        let reboot = SystemReboot { command: "  ".into() };
        assert!(reboot.reboot().is_err());
    }

    #[cfg(unix)]
    #[test]
    fn test_reboot_spawns_command() {
        let reboot = SystemReboot { command: "true --ignored".into() };
        assert!(reboot.reboot().is_ok());
    }
}
