//! Line-oriented decoder for the agent CLI's `stream-json` output, plus the
//! encoders for what this process writes back (user turns, progress records).

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;
use tokio::io::AsyncWriteExt;

/// Tool names whose invocation starts a sub-agent.
pub const DELEGATE_TOOL_NAMES: &[&str] = &["Task", "Agent"];

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnResult {
    #[serde(default)]
    pub subtype: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentMessage {
    System {
        subtype: Option<String>,
        session_id: Option<String>,
        raw: Value,
    },
    Assistant(Value),
    User(Value),
    StreamEvent(Value),
    Result { result: TurnResult, raw: Value },
    Unknown(Value),
    Invalid(String),
}

/// A `tool_use` block that spawns a sub-agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegateRequest {
    pub call_id: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageAttachment {
    pub media_type: String,
    /// Base64 payload, passed through untouched.
    pub data: String,
}

/// Decodes one stdout line. Blank lines yield `None`; anything unparsable is
/// kept as `Invalid` so the caller can log it.
pub fn decode_line(line: &str) -> Option<AgentMessage> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    let raw: Value = match serde_json::from_str(trimmed) {
        Ok(value) => value,
        Err(_) => return Some(AgentMessage::Invalid(trimmed.to_string())),
    };
    let kind = raw.get("type").and_then(Value::as_str).unwrap_or_default();
    let message = match kind {
        "system" => AgentMessage::System {
            subtype: string_field(&raw, "subtype"),
            session_id: string_field(&raw, "session_id"),
            raw,
        },
        "assistant" => AgentMessage::Assistant(raw),
        "user" => AgentMessage::User(raw),
        "stream_event" => AgentMessage::StreamEvent(raw),
        "result" => match serde_json::from_value::<TurnResult>(raw.clone()) {
            Ok(result) => AgentMessage::Result { result, raw },
            Err(_) => AgentMessage::Unknown(raw),
        },
        _ => AgentMessage::Unknown(raw),
    };
    Some(message)
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_string)
}

fn content_blocks(raw: &Value) -> &[Value] {
    raw.pointer("/message/content")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

impl AgentMessage {
    pub fn raw(&self) -> Option<&Value> {
        match self {
            AgentMessage::System { raw, .. } | AgentMessage::Result { raw, .. } => Some(raw),
            AgentMessage::Assistant(raw)
            | AgentMessage::User(raw)
            | AgentMessage::StreamEvent(raw)
            | AgentMessage::Unknown(raw) => Some(raw),
            AgentMessage::Invalid(_) => None,
        }
    }

    /// Set on records emitted by a sub-agent while its parent call runs.
    pub fn parent_tool_use_id(&self) -> Option<&str> {
        self.raw()?
            .get("parent_tool_use_id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
    }

    pub fn delegate_calls(&self) -> Vec<DelegateRequest> {
        let AgentMessage::Assistant(raw) = self else {
            return Vec::new();
        };
        content_blocks(raw)
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_use"))
            .filter(|block| {
                block
                    .get("name")
                    .and_then(Value::as_str)
                    .is_some_and(|name| DELEGATE_TOOL_NAMES.contains(&name))
            })
            .filter_map(|block| {
                let call_id = block.get("id").and_then(Value::as_str)?;
                let prompt = block.pointer("/input/prompt").and_then(Value::as_str)?;
                Some(DelegateRequest {
                    call_id: call_id.to_string(),
                    prompt: prompt.to_string(),
                })
            })
            .collect()
    }

    /// Ids of tool calls answered by this record.
    pub fn tool_results(&self) -> Vec<String> {
        let AgentMessage::User(raw) = self else {
            return Vec::new();
        };
        content_blocks(raw)
            .iter()
            .filter(|block| block.get("type").and_then(Value::as_str) == Some("tool_result"))
            .filter_map(|block| string_field(block, "tool_use_id"))
            .collect()
    }
}

/// First human-readable text of a log record: `message.content` as a string,
/// or the first `text` block of a content array.
pub fn first_message_text(record: &Value) -> Option<String> {
    let content = record.pointer("/message/content")?;
    if let Some(text) = content.as_str() {
        return Some(text.to_string());
    }
    content
        .as_array()?
        .iter()
        .find(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .and_then(|block| string_field(block, "text"))
}

/// One `stream-json` input line carrying a user turn.
pub fn encode_user_turn(text: &str, images: &[ImageAttachment]) -> String {
    let mut content = Vec::with_capacity(images.len() + 1);
    for image in images {
        content.push(json!({
            "type": "image",
            "source": {
                "type": "base64",
                "media_type": image.media_type,
                "data": image.data,
            }
        }));
    }
    content.push(json!({ "type": "text", "text": text }));
    json!({
        "type": "user",
        "message": { "role": "user", "content": content }
    })
    .to_string()
}

/// Record appended to a conversation log so a single tail of that log shows
/// delegated activity next to top-level messages.
pub fn progress_record(
    session_id: &str,
    parent_call_id: &str,
    agent_id: Option<&str>,
    message: &Value,
) -> Value {
    let mut data = json!({ "type": "agent_progress", "message": message });
    if let Some(agent_id) = agent_id {
        data["agentId"] = Value::String(agent_id.to_string());
    }
    json!({
        "type": "progress",
        "data": data,
        "parentToolUseID": parent_call_id,
        "sessionId": session_id,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })
}

/// Appends one JSON line to `path`, creating parent directories as needed.
pub async fn append_record(path: &Path, record: &Value) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut line = record.to_string();
    line.push('\n');
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}
