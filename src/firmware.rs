//! Firmware update workflow: request validation and the background download

use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::dispatch::Outbox;
use crate::error::ProtocolError;
use crate::journal::{sha256_file, DownloadStatus, JournalEntry, UpdateJournal};
use crate::message::{ControlMessage, Envelope};
use crate::protocol::{field, opcode, update_status, FIRMWARE_SUFFIX};
use crate::transfer::{Downloader, TransferProgress};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

/// A validated 0x000A request.
#[derive(Debug, Clone, PartialEq)]
pub struct FirmwareRequest {
    pub url: String,
    /// Declared archive size in MB.
    pub size_mb: f64,
    pub version: String,
    /// `<platform>-<version>.tar.gz`
    pub file_name: String,
}

impl FirmwareRequest {
    pub fn declared_bytes(&self) -> u64 {
        (self.size_mb * BYTES_PER_MB) as u64
    }
}

/// Extract the version token from `…<platform>-<version>.tar.gz…`.
///
/// Uses the last occurrence of the platform, so a platform name that also
/// appears in the host or directory part does not confuse it.
pub fn firmware_version<'a>(url: &'a str, platform: &str) -> Result<&'a str, ProtocolError> {
    let invalid = |reason: &str| ProtocolError::InvalidField {
        field: field::URL,
        reason: reason.to_string(),
    };
    if platform.is_empty() {
        return Err(invalid("device platform unknown"));
    }
    let platform_pos = url
        .rfind(platform)
        .ok_or_else(|| invalid("URL does not name this platform"))?;
    let suffix_pos = url
        .find(FIRMWARE_SUFFIX)
        .ok_or_else(|| invalid("URL is not a .tar.gz archive"))?;
    // skip the separator after the platform
    let start = platform_pos + platform.len() + 1;
    match url.get(start..suffix_pos) {
        Some(version) if suffix_pos > start => Ok(version),
        _ => Err(invalid("no version between platform and suffix")),
    }
}

/// Validate a firmware request against the installed software.
pub fn parse_firmware_request(
    msg: &ControlMessage,
    platform: &str,
    installed_version: &str,
) -> Result<FirmwareRequest, ProtocolError> {
    let size_mb = msg.data_f64(field::FIRMWARE_SIZE)?;
    let url = msg.data_str(field::URL)?;
    if !size_mb.is_finite() || size_mb < 0.0 {
        return Err(ProtocolError::OutOfRange {
            field: field::FIRMWARE_SIZE,
            value: size_mb,
        });
    }
    let version = firmware_version(url, platform)?;
    // installed versions carry the platform prefix, URLs may not
    if version == installed_version || format!("{}-{}", platform, version) == installed_version {
        return Err(ProtocolError::SameVersion(version.to_string()));
    }
    Ok(FirmwareRequest {
        url: url.to_string(),
        size_mb,
        version: version.to_string(),
        file_name: format!("{}-{}{}", platform, version, FIRMWARE_SUFFIX),
    })
}

/// Lets through at most one event per interval. The first event passes.
#[derive(Debug, Clone)]
pub struct ProgressThrottle {
    interval: Duration,
    last: Option<Instant>,
}

impl ProgressThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
        }
    }

    pub fn ready(&mut self, now: Instant) -> bool {
        match self.last {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last = Some(now);
                true
            }
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// (percent, bytes per second), both rounded to two decimals. Percent is
/// measured against the declared size when there is one.
pub fn progress_figures(progress: TransferProgress, declared_bytes: u64, elapsed: Duration) -> (f64, f64) {
    let total = if declared_bytes > 0 {
        Some(declared_bytes)
    } else {
        progress.total.filter(|t| *t > 0)
    };
    let percent = total
        .map(|t| progress.downloaded as f64 / t as f64 * 100.0)
        .unwrap_or(0.0);
    let secs = elapsed.as_secs_f64();
    let speed = if secs > 0.0 {
        progress.downloaded as f64 / secs
    } else {
        0.0
    };
    (round2(percent), round2(speed))
}

/// Everything a download task needs, owned so it can outlive the request.
pub struct DownloadJob {
    pub envelope: Envelope,
    pub url: String,
    pub dest: PathBuf,
    pub declared_bytes: u64,
    pub progress_interval: Duration,
    pub outbox: Arc<dyn Outbox>,
    pub downloader: Arc<dyn Downloader>,
    pub journal: Option<Arc<UpdateJournal>>,
}

impl DownloadJob {
    fn record(&self, entry: &JournalEntry) {
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.add_entry(entry) {
                warn!(path = %journal.path().display(), error = %e, "update journal write failed");
            }
        }
    }

    fn report_status(&self, status: i64) {
        self.outbox.send_message(
            &self
                .envelope
                .report(opcode::REPORT_UPDATE_STATUS, json!({ field::STATUS: status })),
        );
    }
}

/// Run one download to completion, reporting status and throttled progress.
/// Returns whether the transfer succeeded.
pub async fn run_download(job: DownloadJob) -> bool {
    let job_id = Uuid::new_v4().to_string();
    info!(%job_id, url = %job.url, dest = %job.dest.display(), "firmware download started");
    job.record(&JournalEntry::new(&job_id, &job.url, &job.dest, DownloadStatus::Started));
    job.report_status(update_status::DOWNLOADING);

    let started = Instant::now();
    let mut throttle = ProgressThrottle::new(job.progress_interval);
    let envelope = job.envelope;
    let declared = job.declared_bytes;
    let outbox = Arc::clone(&job.outbox);
    let mut on_progress = |progress: TransferProgress| {
        let now = Instant::now();
        if !throttle.ready(now) {
            return;
        }
        let (percent, speed) = progress_figures(progress, declared, now.duration_since(started));
        outbox.send_message(&envelope.report(
            opcode::REPORT_UPDATE_PROGRESS,
            json!({ field::PERCENT: percent, field::DOWNLOAD_SPEED: speed }),
        ));
    };

    let result = job
        .downloader
        .download(&job.url, &job.dest, &mut on_progress)
        .await;

    match result {
        Ok(bytes) => {
            let dest = job.dest.clone();
            let digest = match tokio::task::spawn_blocking(move || sha256_file(&dest)).await {
                Ok(Ok(d)) => Some(d),
                Ok(Err(e)) => {
                    warn!(error = %e, "could not hash firmware archive");
                    None
                }
                Err(e) => {
                    warn!(error = %e, "hash task failed");
                    None
                }
            };
            info!(%job_id, bytes, sha256 = digest.as_deref().unwrap_or("-"), "firmware download finished");
            let mut entry = JournalEntry::new(&job_id, &job.url, &job.dest, DownloadStatus::Completed);
            entry.bytes = bytes;
            entry.sha256 = digest;
            job.record(&entry);
            job.report_status(update_status::DOWNLOAD_SUCCEEDED);
            true
        }
        Err(e) => {
            error!(%job_id, error = %format!("{:#}", e), "firmware download failed");
            if job.dest.exists() {
                if let Err(rm) = std::fs::remove_file(&job.dest) {
                    warn!(path = %job.dest.display(), error = %rm, "could not remove partial download");
                }
            }
            let mut entry = JournalEntry::new(&job_id, &job.url, &job.dest, DownloadStatus::Failed);
            entry.error = Some(format!("{:#}", e));
            job.record(&entry);
            job.report_status(update_status::DOWNLOAD_FAILED);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ack;

    fn request(data: serde_json::Value) -> ControlMessage {
        ControlMessage {
            id: 0,
            dev_type: 0,
            ack: ack::NOT_ACK,
            msg_set: 0,
            msg_id: 0x0A,
            msg_data: Some(data),
        }
    }

    #[test]
    fn test_firmware_version_extraction() {
        assert_eq!(
            firmware_version("http://h/fw/TX2-test-0302.tar.gz", "TX2").unwrap(),
            "test-0302"
        );
        // last occurrence wins
        assert_eq!(
            firmware_version("http://TX2.mirror/TX2/TX2-v9.tar.gz", "TX2").unwrap(),
            "v9"
        );
        assert!(firmware_version("http://h/fw/OTHER-1.tar.gz", "TX2").is_err());
        assert!(firmware_version("http://h/fw/TX2-1.zip", "TX2").is_err());
        assert!(firmware_version("http://h/fw/TX2.tar.gz", "TX2").is_err());
        assert!(firmware_version("http://h/fw/TX2-1.tar.gz", "").is_err());
    }

    #[test]
    fn test_parse_firmware_request() {
        let msg = request(json!({"Firmware Size": 12.5, "URL": "http://h/TX2-test-0302.tar.gz"}));
        let req = parse_firmware_request(&msg, "TX2", "TX2-test-0301").unwrap();
        assert_eq!(req.version, "test-0302");
        assert_eq!(req.file_name, "TX2-test-0302.tar.gz");
        assert_eq!(req.declared_bytes(), 13_107_200);
    }

    #[test]
    fn test_parse_firmware_request_same_version() {
        let msg = request(json!({"Firmware Size": 1, "URL": "http://h/TX2-test-0301.tar.gz"}));
        assert!(matches!(
            parse_firmware_request(&msg, "TX2", "TX2-test-0301"),
            Err(ProtocolError::SameVersion(_))
        ));
        assert!(matches!(
            parse_firmware_request(&msg, "TX2", "test-0301"),
            Err(ProtocolError::SameVersion(_))
        ));
    }

    #[test]
    fn test_parse_firmware_request_missing_fields() {
        let no_url = request(json!({"Firmware Size": 1}));
        assert!(matches!(
            parse_firmware_request(&no_url, "TX2", "TX2-1"),
            Err(ProtocolError::MissingField("URL"))
        ));
        let no_size = request(json!({"URL": "http://h/TX2-2.tar.gz"}));
        assert!(parse_firmware_request(&no_size, "TX2", "TX2-1").is_err());
        let bad_size = request(json!({"Firmware Size": -3, "URL": "http://h/TX2-2.tar.gz"}));
        assert!(matches!(
            parse_firmware_request(&bad_size, "TX2", "TX2-1"),
            Err(ProtocolError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_throttle_limits_rate() {
        let mut throttle = ProgressThrottle::new(Duration::from_secs(2));
        let t0 = Instant::now();
        let mut passed = 0;
        // a callback every 10 ms for 5 seconds
        for i in 0..500u64 {
            if throttle.ready(t0 + Duration::from_millis(i * 10)) {
                passed += 1;
            }
        }
        // t=0, t=2s, t=4s
        assert_eq!(passed, 3);
    }

    #[test]
    fn test_progress_figures() {
        let p = TransferProgress {
            downloaded: 512 * 1024,
            total: Some(4 * 1024 * 1024),
        };
        // declared size wins over content length
        let (percent, speed) = progress_figures(p, 1024 * 1024, Duration::from_secs(2));
        assert_eq!(percent, 50.0);
        assert_eq!(speed, 262_144.0);

        let (percent, _) = progress_figures(p, 0, Duration::from_secs(1));
        assert_eq!(percent, 12.5);

        let unknown = TransferProgress { downloaded: 10, total: None };
        assert_eq!(progress_figures(unknown, 0, Duration::ZERO), (0.0, 0.0));

        let third = TransferProgress { downloaded: 1, total: Some(3) };
        assert_eq!(progress_figures(third, 0, Duration::from_secs(1)).0, 33.33);
    }
}
