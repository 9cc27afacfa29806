use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("failed to start agent: {message}")]
    SpawnFailure { message: String, not_installed: bool },
    #[error("agent process exited unexpectedly: {message}")]
    ProcessDeath { message: String, stderr: String },
    #[error("agent did not finish within {}s", .after.as_secs_f64())]
    Timeout { after: Duration },
    #[error("agent i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    pub fn not_installed(binary: &str) -> Self {
        AgentError::SpawnFailure {
            message: format!(
                "'{binary}' is not installed or not on PATH. Install the agent CLI or set agent.binary in the config."
            ),
            not_installed: true,
        }
    }

    pub fn spawn(binary: &str, err: impl std::fmt::Display) -> Self {
        AgentError::SpawnFailure {
            message: format!("could not launch '{binary}': {err}"),
            not_installed: false,
        }
    }
}
