//! Request dispatch for the management protocol.
//!
//! The [`Dispatcher`] owns the [`UpdateSession`] and turns each decoded
//! request into zero or more outbound messages. Long-running work (firmware
//! downloads, uploads, the post-id-change reboot) runs in spawned tasks that
//! hold `Arc` handles to their collaborators, never to the dispatcher.

use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::ProtocolError;
use crate::firmware::{parse_firmware_request, run_download, DownloadJob};
use crate::fs_enum::dir_tree;
use crate::journal::UpdateJournal;
use crate::message::ControlMessage;
use crate::protocol::{field, opcode, return_code};
use crate::protocol_core::{ensure_dir_exists, normalize_under_root};
use crate::session::{parse_hour, UpdateConfig, UpdatePolicy, UpdateSession};
use crate::store::DeviceStore;
use crate::transfer::{Downloader, Rebooter, Uploader};

/// Sink for outbound messages. Implementations must not block and must not
/// reorder: one call is one wire message.
pub trait Outbox: Send + Sync {
    fn send_message(&self, msg: &ControlMessage);
}

/// External services the dispatcher delegates to.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn DeviceStore>,
    pub downloader: Arc<dyn Downloader>,
    pub uploader: Arc<dyn Uploader>,
    pub rebooter: Arc<dyn Rebooter>,
    pub journal: Option<Arc<UpdateJournal>>,
}

#[derive(Debug, Clone)]
pub struct DispatchSettings {
    /// Root that upload file names are resolved under.
    pub workspace: PathBuf,
    pub log_dir: PathBuf,
    pub firmware_dir: PathBuf,
    pub upload_url: String,
    pub progress_interval: Duration,
    pub reboot_delay: Duration,
}

pub struct Dispatcher {
    session: UpdateSession,
    outbox: Arc<dyn Outbox>,
    services: Collaborators,
    settings: DispatchSettings,
    background: Vec<JoinHandle<()>>,
}

fn opcode_label(op: u16) -> String {
    format!("0x{:04X}", op)
}

impl Dispatcher {
    pub fn new(
        session: UpdateSession,
        outbox: Arc<dyn Outbox>,
        services: Collaborators,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            session,
            outbox,
            services,
            settings,
            background: Vec::new(),
        }
    }

    pub fn session(&self) -> &UpdateSession {
        &self.session
    }

    /// Decode one frame payload and handle it. Undecodable payloads carry no
    /// usable opcode, so they are logged and dropped without a reply.
    pub async fn handle_frame(&mut self, payload: &[u8]) {
        match ControlMessage::from_json(payload) {
            Ok(msg) => self.handle_message(msg).await,
            Err(e) => warn!(
                error = %e,
                payload = %String::from_utf8_lossy(payload),
                "dropping undecodable frame"
            ),
        }
    }

    pub async fn handle_message(&mut self, msg: ControlMessage) {
        let op = msg.opcode();
        debug!(opcode = %opcode_label(op), ack = msg.ack, "request received");
        self.background.retain(|h| !h.is_finished());

        match op {
            opcode::REPORT_IDENTITY => self.reply(op, self.session.identity_data()),
            opcode::REPORT_VERSION => self.reply(op, self.session.version_data()),
            opcode::REPORT_DEVICE_STATUS => self.reply(op, self.session.status_data()),
            opcode::REPORT_UPDATE_CONFIG => self.reply(op, self.session.update_config_data()),
            opcode::SET_UPDATE_CONFIG => self.set_update_config(&msg),
            opcode::UPDATE_FIRMWARE => self.update_firmware(&msg),
            opcode::LOG_TREE => self.report_log_tree(),
            opcode::UPLOAD_FILE => self.upload_file(msg),
            opcode::CHANGE_ID => self.change_id(&msg),
            opcode::REBOOT | opcode::CLEAR_LOG => {
                info!(opcode = %opcode_label(op), "deprecated request ignored");
            }
            _ => warn!(opcode = %opcode_label(op), "unknown opcode ignored"),
        }
    }

    /// Periodic keep-alive, addressed with the current device id.
    pub fn heartbeat(&self) {
        self.outbox.send_message(&self.session.envelope().heartbeat());
    }

    /// Wait for every spawned download, upload and reboot task.
    pub async fn wait_idle(&mut self) {
        for handle in self.background.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "background task panicked");
            }
        }
    }

    fn reply(&self, op: u16, data: Value) {
        self.outbox.send_message(&self.session.envelope().report(op, data));
    }

    fn ack_code(&self, op: u16, code: i64) {
        self.outbox.send_message(&self.session.envelope().ack_code(op, code));
    }

    fn set_update_config(&mut self, msg: &ControlMessage) {
        let op = opcode::SET_UPDATE_CONFIG;
        let config = match parse_update_config(msg) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "update config rejected");
                self.ack_code(op, return_code::FAIL);
                return;
            }
        };
        if let Err(e) = self.services.store.save_update_config(&config) {
            error!(error = %format!("{:#}", e), "failed to persist update config");
            self.ack_code(op, return_code::FAIL);
            return;
        }
        info!(
            policy = %config.policy,
            open = config.open_hour,
            close = config.close_hour,
            "update config changed"
        );
        self.session.update_config = config;
        self.ack_code(op, return_code::SUCCESS);
    }

    fn update_firmware(&mut self, msg: &ControlMessage) {
        let op = opcode::UPDATE_FIRMWARE;
        let request = match parse_firmware_request(
            msg,
            &self.session.identity.platform,
            &self.session.software_version,
        ) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, installed = %self.session.software_version, "firmware request rejected");
                self.ack_code(op, return_code::FIRMWARE_PARAM_ERROR);
                return;
            }
        };
        if let Err(e) = ensure_dir_exists(&self.settings.firmware_dir) {
            error!(
                dir = %self.settings.firmware_dir.display(),
                error = %e,
                "cannot create firmware directory"
            );
            self.ack_code(op, return_code::FIRMWARE_PARAM_ERROR);
            return;
        }

        let dest = self.settings.firmware_dir.join(&request.file_name);
        info!(version = %request.version, size_mb = request.size_mb, dest = %dest.display(), "firmware update accepted");
        self.ack_code(op, return_code::FIRMWARE_ACCEPTED);

        let job = DownloadJob {
            envelope: self.session.envelope(),
            url: request.url.clone(),
            dest,
            declared_bytes: request.declared_bytes(),
            progress_interval: self.settings.progress_interval,
            outbox: Arc::clone(&self.outbox),
            downloader: Arc::clone(&self.services.downloader),
            journal: self.services.journal.clone(),
        };
        self.background.push(tokio::spawn(async move {
            run_download(job).await;
        }));
    }

    fn report_log_tree(&self) {
        let tree = dir_tree(&self.settings.log_dir);
        self.reply(opcode::LOG_TREE, json!({ field::TREE: { "log": tree } }));
    }

    fn upload_file(&mut self, msg: ControlMessage) {
        let op = opcode::UPLOAD_FILE;
        let envelope = self.session.envelope();
        let mut data = match msg.msg_data {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };

        let resolved = data
            .get(field::FILENAME)
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingField(field::FILENAME))
            .map_err(anyhow::Error::from)
            .and_then(|name| {
                let path = normalize_under_root(&self.settings.workspace, Path::new(name))?;
                Ok((name.to_string(), path))
            });
        let (name, path) = match resolved {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "upload request rejected");
                data.insert(field::RETURN_CODE.into(), json!(return_code::UPLOAD_FAILED));
                self.outbox.send_message(&envelope.ack(op, Value::Object(data)));
                return;
            }
        };

        let outbox = Arc::clone(&self.outbox);
        let uploader = Arc::clone(&self.services.uploader);
        let url = self.settings.upload_url.clone();
        self.background.push(tokio::spawn(async move {
            let code = if url.is_empty() {
                error!("no upload URL configured");
                return_code::UPLOAD_FAILED
            } else {
                match uploader.upload(&path, &url, &name).await {
                    Ok(()) => {
                        info!(file = %path.display(), "file uploaded");
                        return_code::UPLOADED
                    }
                    Err(e) => {
                        error!(file = %path.display(), error = %format!("{:#}", e), "upload failed");
                        return_code::UPLOAD_FAILED
                    }
                }
            };
            data.insert(field::RETURN_CODE.into(), json!(code));
            outbox.send_message(&envelope.ack(op, Value::Object(data)));
        }));
    }

    fn change_id(&mut self, msg: &ControlMessage) {
        let op = opcode::CHANGE_ID;
        let new_id = match msg.data_i64(field::NEW_ID) {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "change id rejected");
                self.ack_code(op, return_code::FAIL);
                return;
            }
        };
        if let Err(e) = self.services.store.save_device_id(new_id) {
            error!(id = new_id, error = %format!("{:#}", e), "failed to persist device id");
            self.ack_code(op, return_code::FAIL);
            return;
        }
        info!(old = self.session.identity.id, new = new_id, "device id changed, rebooting");
        self.session.identity.id = new_id;
        self.ack_code(op, return_code::SUCCESS);

        let rebooter = Arc::clone(&self.services.rebooter);
        let delay = self.settings.reboot_delay;
        self.background.push(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = rebooter.reboot() {
                error!(error = %format!("{:#}", e), "reboot failed");
            }
        }));
    }
}

/// Policy, Open Time and Close Time from a 0x0008 request.
pub fn parse_update_config(msg: &ControlMessage) -> Result<UpdateConfig, ProtocolError> {
    let policy = UpdatePolicy::from_value(msg.data_field(field::POLICY)?)?;
    let open_hour = parse_hour(field::OPEN_TIME, msg.data_f64(field::OPEN_TIME)?)?;
    let close_hour = parse_hour(field::CLOSE_TIME, msg.data_f64(field::CLOSE_TIME)?)?;
    Ok(UpdateConfig {
        policy,
        open_hour,
        close_hour,
    })
}
