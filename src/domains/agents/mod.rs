//! Agent CLI processes: the persistent per-conversation manager, one-shot
//! runs, the process registry they share, and the stream-json protocol.

pub mod args;
pub mod delegate_index;
pub mod error;
pub mod one_shot;
pub mod persistent;
pub mod protocol;
pub mod registry;

pub use args::{AgentSettings, LaunchOptions, PermissionPolicy};
pub use delegate_index::{DelegateCall, DelegateCallIndex};
pub use error::AgentError;
pub use one_shot::{OneShotOutcome, OneShotRequest, OneShotRunner};
pub use persistent::{PersistentProcessManager, SendRequest, TurnAck};
pub use protocol::{AgentMessage, ImageAttachment, TurnResult};
pub use registry::{ProcessKind, ProcessRegistry, ProcessSummary};
