use anyhow::{Context, Result};
use clap::Parser;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::watch;

use otagent::agent::Agent;
use otagent::cli::AgentOpts;
use otagent::config::AgentConfig;
use otagent::logger::init_logging;

fn main() -> Result<()> {
    let opts = AgentOpts::parse();
    init_logging(&opts.log_level, opts.log_file.as_deref())?;

    let mut config = AgentConfig::load(opts.config.as_deref())?;
    opts.apply(&mut config);
    config.validate()?;

    // First Ctrl-C shuts down cleanly, a second one exits at once
    let (stop_tx, mut stop_rx) = watch::channel(false);
    let interrupted = AtomicBool::new(false);
    ctrlc::set_handler(move || {
        if interrupted.swap(true, Ordering::SeqCst) {
            eprintln!("\nInterrupted again. Exiting (Ctrl-C)...");
            std::process::exit(130);
        }
        let _ = stop_tx.send(true);
    })
    .context("Error setting Ctrl-C handler")?;

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    let agent = Agent::new(&config)?;
    rt.block_on(agent.run(async move {
        let _ = stop_rx.wait_for(|stopped| *stopped).await;
    }))
}
