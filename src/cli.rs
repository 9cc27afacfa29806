use clap::{Parser, Subcommand};
use std::path::PathBuf;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Switchyard - session and process orchestration for coding agents
#[derive(Debug, Parser)]
#[command(
    name = "switchyard",
    about = "Switchyard - session and process orchestration for coding agents",
    version = VERSION,
    help_template = "\
{before-help}{name} {version}
{about-with-newline}
{usage-heading} {usage}

{all-args}{after-help}

EXAMPLES:
    switchyard serve                       # JSON lines on stdin/stdout
    switchyard tail ~/.claude/projects/p/s.jsonl
    switchyard --config ./switchyard.toml serve
"
)]
pub struct Cli {
    /// Config file. Defaults to the platform config dir.
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
pub enum Command {
    /// Serve requests over stdin/stdout until stdin closes.
    Serve,
    /// Print lines appended to a log file as they arrive.
    Tail {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
}
