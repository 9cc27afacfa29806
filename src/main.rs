use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use switchyard::bridge::serve;
use switchyard::cli::{Cli, Command};
use switchyard::domains::tail::{open_tail, TailEvent, TailSettings};
use switchyard::infrastructure::config::Config;
use switchyard::infrastructure::logging::init_logging;
use switchyard::services::Orchestrator;
use tokio::io::{AsyncWriteExt, BufReader};

async fn tail_to_stdout(file: PathBuf, settings: TailSettings) -> anyhow::Result<()> {
    let mut handle = open_tail(file.clone(), settings)
        .await
        .with_context(|| format!("failed to tail {}", file.display()))?;
    let mut stdout = tokio::io::stdout();
    while let Some(event) = handle.recv().await {
        match event {
            TailEvent::Lines { lines, .. } => {
                for line in lines {
                    stdout.write_all(line.as_bytes()).await?;
                    stdout.write_all(b"\n").await?;
                }
                stdout.flush().await?;
            }
            TailEvent::Init { offset } => log::info!("Tailing {} from byte {offset}", file.display()),
            TailEvent::Error { message } => log::warn!("{message}"),
            TailEvent::Heartbeat => {}
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    log::info!("Switchyard {} starting", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Serve => {
            let orchestrator = Arc::new(Orchestrator::new(config));
            let mut stdout = serve(
                orchestrator,
                BufReader::new(tokio::io::stdin()),
                tokio::io::stdout(),
            )
            .await?;
            stdout.flush().await?;
        }
        Command::Tail { file } => tail_to_stdout(file, config.tail_settings()).await?,
    }
    Ok(())
}
