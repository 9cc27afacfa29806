pub mod engine;
pub mod error;
pub mod paths;
pub mod snapshots;

pub use engine::{AppliedRecord, ApplyFailure, ApplySuccess, UndoOperation, UndoTransactionEngine};
pub use error::UndoError;
pub use paths::PathPolicy;
pub use snapshots::UndoSnapshotStore;
