use pty_host::ServerMessage;
use serde::Serialize;
use serde_json::{json, Value};

/// Named events pushed to whichever transport hosts the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchyardEvent {
    Output,
    Exit,
    Sessions,
    Spawned,
    Lines,
    Init,
    Error,
    Heartbeat,
    Result,
}

impl SwitchyardEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            SwitchyardEvent::Output => "output",
            SwitchyardEvent::Exit => "exit",
            SwitchyardEvent::Sessions => "sessions",
            SwitchyardEvent::Spawned => "spawned",
            SwitchyardEvent::Lines => "lines",
            SwitchyardEvent::Init => "init",
            SwitchyardEvent::Error => "error",
            SwitchyardEvent::Heartbeat => "heartbeat",
            SwitchyardEvent::Result => "result",
        }
    }

    pub fn for_terminal(message: &ServerMessage) -> Self {
        match message {
            ServerMessage::Spawned { .. } => SwitchyardEvent::Spawned,
            ServerMessage::Output { .. } => SwitchyardEvent::Output,
            ServerMessage::Exit { .. } => SwitchyardEvent::Exit,
            ServerMessage::Sessions { .. } => SwitchyardEvent::Sessions,
            ServerMessage::Error { .. } => SwitchyardEvent::Error,
        }
    }
}

/// Receives already-serialized events. Implementations decide framing.
pub trait EventSink: Send + Sync {
    fn emit(&self, envelope: Value);
}

/// Wraps `payload` as `{"event": <name>, "data": <payload>}` and hands it to the sink.
pub fn emit_event<T: Serialize>(
    sink: &dyn EventSink,
    event: SwitchyardEvent,
    payload: &T,
) -> Result<(), serde_json::Error> {
    let data = serde_json::to_value(payload)?;
    sink.emit(json!({ "event": event.as_str(), "data": data }));
    Ok(())
}
