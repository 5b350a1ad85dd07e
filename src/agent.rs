//! Wires the transport, frame decoder and dispatcher into one running agent

use anyhow::{Context, Result};
use bytes::Bytes;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::dispatch::{Collaborators, DispatchSettings, Dispatcher, Outbox};
use crate::journal::UpdateJournal;
use crate::message::ControlMessage;
use crate::protocol_core::{encode_frame, FrameDecoder};
use crate::session::UpdateSession;
use crate::store::FileStore;
use crate::transfer::{HttpDownloader, HttpUploader, SystemReboot};
use crate::transport::{Transport, TransportCallbacks};

impl Outbox for Transport {
    fn send_message(&self, msg: &ControlMessage) {
        let op = format!("0x{:04X}", msg.opcode());
        match encode_frame(msg) {
            Ok(frame) => {
                if let Err(e) = self.send(frame) {
                    warn!(opcode = %op, error = %e, "outbound message dropped");
                }
            }
            Err(e) => error!(opcode = %op, error = %e, "cannot encode outbound message"),
        }
    }
}

/// What the I/O thread hands to the agent task.
enum Inbound {
    /// A new connection is up; partial frames from the old one are garbage.
    Connected,
    Data(Bytes),
}

pub struct Agent {
    transport: Arc<Transport>,
    dispatcher: Dispatcher,
    inbound: mpsc::UnboundedReceiver<Inbound>,
    heartbeat: Duration,
}

impl Agent {
    /// Build an agent with the production collaborators.
    pub fn new(config: &AgentConfig) -> Result<Self> {
        let paths = &config.paths;
        let services = Collaborators {
            store: Arc::new(FileStore {
                update_config: paths.update_config.clone(),
                install_info: paths.install_info.clone(),
                identity: paths.identity.clone(),
            }),
            downloader: Arc::new(HttpDownloader::new()?),
            uploader: Arc::new(HttpUploader::new()?),
            rebooter: Arc::new(SystemReboot {
                command: config.transport.reboot_command.clone(),
            }),
            journal: paths
                .journal
                .as_ref()
                .map(|p| Arc::new(UpdateJournal::new(p.clone()))),
        };
        Self::with_collaborators(config, services)
    }

    /// Build an agent around caller-supplied collaborators. Fails only when
    /// the server endpoint cannot be resolved or the I/O thread cannot start.
    pub fn with_collaborators(config: &AgentConfig, services: Collaborators) -> Result<Self> {
        let profile = services.store.load_profile();
        let session = UpdateSession::new(profile);

        let (tx, inbound) = mpsc::unbounded_channel();
        let on_connect_tx = tx.clone();
        let callbacks = TransportCallbacks {
            on_connected: Some(Box::new(move || {
                let _ = on_connect_tx.send(Inbound::Connected);
            })),
            on_receive: Some(Box::new(move |data: &[u8]| {
                let _ = tx.send(Inbound::Data(Bytes::copy_from_slice(data)));
            })),
            on_closed: Some(Box::new(|| debug!("control connection closed"))),
        };
        let transport = Arc::new(
            Transport::new(
                &config.server.host,
                config.server.port,
                config.transport_options(),
                callbacks,
            )
            .with_context(|| format!("set up connection to {}:{}", config.server.host, config.server.port))?,
        );

        let settings = DispatchSettings {
            workspace: config.paths.workspace.clone(),
            log_dir: config.paths.log_dir.clone(),
            firmware_dir: config.paths.firmware_dir.clone(),
            upload_url: config.upload.url.clone(),
            progress_interval: config.timing.progress_interval(),
            reboot_delay: config.timing.reboot_delay(),
        };
        let outbox: Arc<dyn Outbox> = transport.clone();
        let dispatcher = Dispatcher::new(session, outbox, services, settings);

        Ok(Self {
            transport,
            dispatcher,
            inbound,
            heartbeat: config.timing.heartbeat(),
        })
    }

    /// Connect and serve requests until `shutdown` resolves, then close the
    /// transport. Downloads still running are abandoned with the runtime.
    pub async fn run<F>(mut self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        info!(endpoint = %self.transport.endpoint(), "agent starting");
        self.transport.connect();

        let mut heartbeat = tokio::time::interval(self.heartbeat);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut decoder = FrameDecoder::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested");
                    break;
                }
                event = self.inbound.recv() => {
                    match event {
                        Some(Inbound::Connected) => {
                            if decoder.buffered() > 0 {
                                debug!(bytes = decoder.buffered(), "discarding partial frame from previous connection");
                            }
                            decoder = FrameDecoder::new();
                        }
                        Some(Inbound::Data(chunk)) => {
                            decoder.push(&chunk);
                            self.drain_frames(&mut decoder).await;
                        }
                        None => break,
                    }
                }
                _ = heartbeat.tick() => {
                    if self.transport.is_connected() {
                        self.dispatcher.heartbeat();
                    }
                }
            }
        }

        self.transport.close();
        info!("agent stopped");
        Ok(())
    }

    async fn drain_frames(&mut self, decoder: &mut FrameDecoder) {
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => self.dispatcher.handle_frame(&frame).await,
                Ok(None) => break,
                Err(e) => {
                    // the stream offset is lost; only a fresh connection
                    // gets back to a frame boundary
                    warn!(error = %e, "framing error; reconnecting");
                    self.transport.reconnect();
                    break;
                }
            }
        }
    }
}
