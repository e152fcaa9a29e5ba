use anyhow::{Context, Result};
use clap::Parser;

use camrelay::agent::Agent;
use camrelay::cli::AgentOpts;
use camrelay::journal::Journal;

fn main() -> Result<()> {
    // In-flight uploads and batches are dropped; staged files are recovered on restart
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted. Exiting (Ctrl-C)...");
        std::process::exit(130);
    })
    .context("failed to set Ctrl-C handler")?;

    let opts = AgentOpts::parse();
    camrelay::init_tracing();

    let config = opts.to_config()?;

    if opts.list_abandoned {
        let path = config
            .journal
            .clone()
            .context("--list-abandoned needs a journal (--journal or `journal` in the config)")?;
        for entry in Journal::new(path).abandoned()? {
            println!(
                "{}\t{} attempts\t{}\t{}",
                entry.artifact.display(),
                entry.attempt,
                entry.timestamp,
                entry.error.unwrap_or_default()
            );
        }
        return Ok(());
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(async move {
        let agent = Agent::new(config)?;
        agent.run().await
    })
}
