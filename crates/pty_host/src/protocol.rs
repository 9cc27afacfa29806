use serde::{Deserialize, Serialize};

pub const DEFAULT_COLS: u16 = 80;
pub const DEFAULT_ROWS: u16 = 24;

fn default_cols() -> u16 {
    DEFAULT_COLS
}

fn default_rows() -> u16 {
    DEFAULT_ROWS
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SpawnOptions {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Requests a terminal panel sends over its connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Spawn(SpawnOptions),
    Input { id: String, data: String },
    Resize { id: String, cols: u16, rows: u16 },
    Kill { id: String },
    Attach { id: String },
    List,
    Rename { id: String, name: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PtyStatus {
    Running,
    Exited,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PtySessionInfo {
    pub id: String,
    pub name: String,
    pub status: PtyStatus,
    pub exit_code: Option<i32>,
    pub cols: u16,
    pub rows: u16,
    pub cwd: String,
    /// Milliseconds since the unix epoch.
    pub created_at: u64,
}

/// Events pushed to connections. Order per session matches production order.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    Spawned {
        id: String,
        name: String,
    },
    Output {
        id: String,
        data: String,
    },
    Exit {
        id: String,
        #[serde(rename = "exitCode")]
        exit_code: Option<i32>,
    },
    Sessions {
        sessions: Vec<PtySessionInfo>,
    },
    Error {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        message: String,
    },
}

impl ServerMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            ServerMessage::Spawned { .. } => "spawned",
            ServerMessage::Output { .. } => "output",
            ServerMessage::Exit { .. } => "exit",
            ServerMessage::Sessions { .. } => "sessions",
            ServerMessage::Error { .. } => "error",
        }
    }
}
