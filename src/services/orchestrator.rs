use crate::domains::agents::{
    AgentError, DelegateCallIndex, OneShotOutcome, OneShotRequest, OneShotRunner,
    PersistentProcessManager, ProcessRegistry, ProcessSummary, SendRequest, TurnAck,
};
use crate::domains::tail::{open_tail, watch_subagents, SubagentWatchHandle, TailError, TailHandle};
use crate::domains::undo::{
    ApplyFailure, ApplySuccess, UndoError, UndoOperation, UndoSnapshotStore, UndoTransactionEngine,
};
use crate::infrastructure::config::Config;
use pty_host::{PtyConnection, PtyHost, PtyHostError};
use serde::Serialize;
use serde_json::Value;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Every failure a consumer can see. Module errors are converted into one of
/// these before they leave the orchestrator.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("{message}")]
    SpawnFailure { message: String, not_installed: bool },
    #[error("{message}")]
    ProcessDeath { message: String, stderr: String },
    #[error("{message}")]
    Conflict { message: String },
    #[error("{message}")]
    AccessDenied { message: String },
    #[error("{message}")]
    Timeout { message: String },
    #[error("{message}")]
    NotFound { message: String },
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub not_installed: Option<bool>,
}

impl OrchestratorError {
    pub fn kind(&self) -> &'static str {
        match self {
            OrchestratorError::SpawnFailure { .. } => "spawnFailure",
            OrchestratorError::ProcessDeath { .. } => "processDeath",
            OrchestratorError::Conflict { .. } => "conflict",
            OrchestratorError::AccessDenied { .. } => "accessDenied",
            OrchestratorError::Timeout { .. } => "timeout",
            OrchestratorError::NotFound { .. } => "notFound",
        }
    }

    pub fn payload(&self) -> ErrorPayload {
        let (stderr, not_installed) = match self {
            OrchestratorError::ProcessDeath { stderr, .. } if !stderr.is_empty() => {
                (Some(stderr.clone()), None)
            }
            OrchestratorError::SpawnFailure { not_installed, .. } => (None, Some(*not_installed)),
            _ => (None, None),
        };
        ErrorPayload {
            kind: self.kind(),
            message: self.to_string(),
            stderr,
            not_installed,
        }
    }

    fn from_io(message: String, kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::PermissionDenied => OrchestratorError::AccessDenied { message },
            ErrorKind::NotFound => OrchestratorError::NotFound { message },
            _ => OrchestratorError::Conflict { message },
        }
    }
}

impl From<AgentError> for OrchestratorError {
    fn from(err: AgentError) -> Self {
        let message = err.to_string();
        match err {
            AgentError::SpawnFailure { not_installed, .. } => OrchestratorError::SpawnFailure {
                message,
                not_installed,
            },
            AgentError::ProcessDeath { stderr, .. } => {
                OrchestratorError::ProcessDeath { message, stderr }
            }
            AgentError::Timeout { .. } => OrchestratorError::Timeout { message },
            AgentError::Io(_) => OrchestratorError::ProcessDeath {
                message,
                stderr: String::new(),
            },
        }
    }
}

impl From<UndoError> for OrchestratorError {
    fn from(err: UndoError) -> Self {
        let message = err.to_string();
        match err {
            UndoError::AccessDenied { .. } => OrchestratorError::AccessDenied { message },
            UndoError::Conflict { .. } => OrchestratorError::Conflict { message },
            UndoError::NotFound { .. } => OrchestratorError::NotFound { message },
            UndoError::Io { source, .. } => OrchestratorError::from_io(message, source.kind()),
        }
    }
}

impl From<PtyHostError> for OrchestratorError {
    fn from(err: PtyHostError) -> Self {
        let message = err.to_string();
        match err {
            PtyHostError::UnknownTerminal(_) => OrchestratorError::NotFound { message },
            PtyHostError::DuplicateTerminal(_) => OrchestratorError::Conflict { message },
            PtyHostError::ConnectionClosed(_) => OrchestratorError::ProcessDeath {
                message,
                stderr: String::new(),
            },
            PtyHostError::Pty { .. } | PtyHostError::Io(_) => OrchestratorError::SpawnFailure {
                message,
                not_installed: false,
            },
        }
    }
}

impl From<TailError> for OrchestratorError {
    fn from(err: TailError) -> Self {
        let message = err.to_string();
        match err {
            TailError::Io(source) if source.kind() == ErrorKind::PermissionDenied => {
                OrchestratorError::AccessDenied { message }
            }
            TailError::Io(_) | TailError::Watch(_) => OrchestratorError::NotFound { message },
        }
    }
}

/// A failed undo batch after its applied operations were reverted.
#[derive(Debug)]
pub struct UndoFailure {
    pub error: OrchestratorError,
    pub rolled_back: usize,
}

impl From<ApplyFailure> for UndoFailure {
    fn from(failure: ApplyFailure) -> Self {
        Self {
            error: failure.error.into(),
            rolled_back: failure.rolled_back,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ShutdownReport {
    pub agents: usize,
    pub processes: usize,
    pub terminals: usize,
}

/// Owns every registry and hands out handles to request handlers.
pub struct Orchestrator {
    config: Config,
    registry: ProcessRegistry,
    delegates: DelegateCallIndex,
    agents: PersistentProcessManager,
    one_shot: OneShotRunner,
    pty: PtyHost,
    undo: UndoTransactionEngine,
    snapshots: UndoSnapshotStore,
}

impl Orchestrator {
    pub fn new(config: Config) -> Self {
        let settings = config.agent_settings();
        let registry = ProcessRegistry::new(settings.stop_grace);
        let delegates = DelegateCallIndex::new();
        let agents =
            PersistentProcessManager::new(settings.clone(), registry.clone(), delegates.clone());
        let one_shot = OneShotRunner::new(settings, registry.clone());
        let pty = PtyHost::new(config.pty_host_config());
        let undo = UndoTransactionEngine::new(&config.undo.allowed_roots);
        let snapshots = UndoSnapshotStore::new(config.undo.snapshot_dir.clone());
        log::info!(
            "Orchestrator ready (agent binary '{}', {} undo roots)",
            config.agent.binary,
            undo.policy().roots().len()
        );
        Self {
            config,
            registry,
            delegates,
            agents,
            one_shot,
            pty,
            undo,
            snapshots,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn delegates(&self) -> &DelegateCallIndex {
        &self.delegates
    }

    pub async fn send_message(&self, request: SendRequest) -> Result<TurnAck, OrchestratorError> {
        Ok(self.agents.send(request).await?)
    }

    pub fn stop_session(&self, session_id: &str) -> bool {
        self.agents.stop(session_id)
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.agents.is_running(session_id)
    }

    pub async fn create_session(
        &self,
        request: OneShotRequest,
    ) -> Result<OneShotOutcome, OrchestratorError> {
        Ok(self.one_shot.run(request).await?)
    }

    pub fn processes(&self) -> Vec<ProcessSummary> {
        self.registry.list()
    }

    pub fn conversation_log(&self, cwd: &Path, session_id: &str) -> PathBuf {
        self.agents.log_path(cwd, session_id)
    }

    pub fn pty(&self) -> &PtyHost {
        &self.pty
    }

    pub fn connect_terminal(&self) -> PtyConnection {
        self.pty.connect()
    }

    /// `Ok(false)` when the terminal is already gone.
    pub async fn kill_terminal(&self, id: &str) -> Result<bool, OrchestratorError> {
        Ok(self.pty.kill(id).await?)
    }

    pub async fn open_tail(&self, path: PathBuf) -> Result<TailHandle, OrchestratorError> {
        Ok(open_tail(path, self.config.tail_settings()).await?)
    }

    pub fn watch_subagents(&self, parent_log: PathBuf, session_id: String) -> SubagentWatchHandle {
        watch_subagents(
            parent_log,
            session_id,
            self.delegates.clone(),
            self.config.tail_settings(),
        )
    }

    pub async fn apply_undo(&self, operations: &[UndoOperation]) -> Result<ApplySuccess, UndoFailure> {
        Ok(self.undo.apply(operations).await?)
    }

    pub async fn capture_inverse(
        &self,
        operations: &[UndoOperation],
    ) -> Result<Vec<UndoOperation>, OrchestratorError> {
        Ok(self.undo.capture_inverse(operations).await?)
    }

    pub async fn save_undo_state(&self, session_id: &str, state: &Value) -> Result<(), OrchestratorError> {
        let bytes = serde_json::to_vec(state).map_err(|e| OrchestratorError::Conflict {
            message: format!("undo state is not serializable: {e}"),
        })?;
        Ok(self.snapshots.save(session_id, &bytes).await?)
    }

    pub async fn load_undo_state(&self, session_id: &str) -> Result<Option<Value>, OrchestratorError> {
        let Some(bytes) = self.snapshots.load(session_id).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| OrchestratorError::Conflict {
                message: format!("stored undo state for {session_id} is not valid JSON: {e}"),
            })
    }

    /// Stops every agent process, one-shot run and terminal.
    pub async fn shutdown(&self) -> ShutdownReport {
        let report = ShutdownReport {
            agents: self.agents.kill_all(),
            processes: self.registry.kill_all(),
            terminals: self.pty.kill_all().await,
        };
        log::info!(
            "Shutdown stopped {} agents, {} other processes, {} terminals",
            report.agents,
            report.processes,
            report.terminals
        );
        report
    }
}
