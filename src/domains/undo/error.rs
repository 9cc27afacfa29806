use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum UndoError {
    #[error("access denied for {}: {reason}", .path.display())]
    AccessDenied { path: PathBuf, reason: String },
    #[error("{} changed on disk: expected {expected}, found {found}", .path.display())]
    Conflict {
        path: PathBuf,
        expected: String,
        found: String,
    },
    #[error("file not found: {}", .path.display())]
    NotFound { path: PathBuf },
    #[error("failed to access {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl UndoError {
    pub fn path(&self) -> &PathBuf {
        match self {
            UndoError::AccessDenied { path, .. }
            | UndoError::Conflict { path, .. }
            | UndoError::NotFound { path }
            | UndoError::Io { path, .. } => path,
        }
    }

    pub(crate) fn denied(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        UndoError::AccessDenied {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Maps `NotFound` io errors to [`UndoError::NotFound`].
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        let path = path.into();
        if source.kind() == std::io::ErrorKind::NotFound {
            UndoError::NotFound { path }
        } else {
            UndoError::Io { path, source }
        }
    }
}
