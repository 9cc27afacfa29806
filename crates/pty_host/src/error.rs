use crate::host::ConnectionId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PtyHostError {
    #[error("no terminal with id {0}")]
    UnknownTerminal(String),
    #[error("terminal id {0} is already in use")]
    DuplicateTerminal(String),
    #[error("pty {action} failed: {reason}")]
    Pty { action: &'static str, reason: String },
    #[error("connection {0} is closed")]
    ConnectionClosed(ConnectionId),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PtyHostError {
    pub(crate) fn pty(action: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Pty {
            action,
            reason: err.to_string(),
        }
    }

    /// Terminal the failure refers to, when there is one.
    pub fn terminal_id(&self) -> Option<&str> {
        match self {
            Self::UnknownTerminal(id) | Self::DuplicateTerminal(id) => Some(id),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PtyHostError>;
