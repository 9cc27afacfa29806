pub mod line_buffer;
pub mod stream;
pub mod subagents;
pub mod throttle;

pub use stream::{open_tail, TailCursor, TailEvent, TailHandle, TailSettings};
pub use subagents::{watch_subagents, SubagentCorrelator, SubagentWatchHandle};

#[derive(Debug, thiserror::Error)]
pub enum TailError {
    #[error("failed to read log: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to watch log: {0}")]
    Watch(#[from] notify::Error),
}
