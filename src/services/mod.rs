pub mod orchestrator;

pub use orchestrator::{ErrorPayload, Orchestrator, OrchestratorError, ShutdownReport, UndoFailure};
