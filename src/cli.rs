//! Command-line options for the otagent daemon

use clap::Parser;
use std::path::PathBuf;

use crate::config::AgentConfig;

/// Device update agent: keeps a control connection to the management
/// server and serves its requests.
#[derive(Clone, Debug, Parser)]
#[command(name = "otagent", version)]
pub struct AgentOpts {
    /// Agent configuration file (TOML). Defaults apply when omitted.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "otagent=debug". RUST_LOG wins when set.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Override the server host
    #[arg(long)]
    pub host: Option<String>,

    /// Override the server port
    #[arg(long)]
    pub port: Option<u16>,
}

impl AgentOpts {
    /// Command-line overrides win over the file and link info.
    pub fn apply(&self, config: &mut AgentConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
    }
}
