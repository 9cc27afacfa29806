pub mod error;
pub mod host;
pub mod protocol;
pub mod scrollback;
pub mod utf8_stream;

pub use crate::error::PtyHostError;
pub use crate::host::{ConnectionId, PtyConnection, PtyHost, PtyHostConfig};
pub use crate::protocol::{
    ClientMessage, PtySessionInfo, PtyStatus, ServerMessage, SpawnOptions, DEFAULT_COLS,
    DEFAULT_ROWS,
};
