use super::protocol::{append_record, progress_record};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateCall {
    pub call_id: String,
    pub prompt: String,
    pub recorded_at: DateTime<Utc>,
}

/// Delegate calls a session has issued that have not returned yet, plus the
/// delegated messages already copied into each session's log.
#[derive(Clone, Default)]
pub struct DelegateCallIndex {
    pending: Arc<Mutex<HashMap<String, Vec<DelegateCall>>>>,
    forwarded: Arc<Mutex<HashMap<String, HashSet<u64>>>>,
}

impl DelegateCallIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, session_id: &str, call_id: &str, prompt: &str) {
        let mut pending = self.pending.lock();
        let calls = pending.entry(session_id.to_string()).or_default();
        if calls.iter().any(|call| call.call_id == call_id) {
            return;
        }
        log::debug!("Session {session_id} delegated call {call_id}");
        calls.push(DelegateCall {
            call_id: call_id.to_string(),
            prompt: prompt.to_string(),
            recorded_at: Utc::now(),
        });
    }

    pub fn resolve(&self, session_id: &str, call_id: &str) -> bool {
        let mut pending = self.pending.lock();
        let Some(calls) = pending.get_mut(session_id) else {
            return false;
        };
        let before = calls.len();
        calls.retain(|call| call.call_id != call_id);
        let resolved = calls.len() != before;
        if calls.is_empty() {
            pending.remove(session_id);
        }
        resolved
    }

    /// Pending calls in the order they were recorded.
    pub fn pending(&self, session_id: &str) -> Vec<DelegateCall> {
        self.pending
            .lock()
            .get(session_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear(&self, session_id: &str) {
        self.pending.lock().remove(session_id);
        self.forwarded.lock().remove(session_id);
    }

    /// Appends a delegated message to the session log as a progress record.
    ///
    /// The agent's stdout and the child's own log both carry delegated
    /// messages; whichever copy arrives second is dropped. Returns whether a
    /// record was written.
    pub async fn forward_progress(
        &self,
        log_path: &Path,
        session_id: &str,
        call_id: &str,
        agent_id: Option<&str>,
        message: &Value,
    ) -> std::io::Result<bool> {
        let key = forward_key(call_id, message);
        let fresh = self
            .forwarded
            .lock()
            .entry(session_id.to_string())
            .or_default()
            .insert(key);
        if !fresh {
            return Ok(false);
        }
        let record = progress_record(session_id, call_id, agent_id, message);
        if let Err(err) = append_record(log_path, &record).await {
            if let Some(keys) = self.forwarded.lock().get_mut(session_id) {
                keys.remove(&key);
            }
            return Err(err);
        }
        Ok(true)
    }
}

/// Identity of a delegated message independent of which stream it came from:
/// the call it belongs to, the model message id, and its content.
fn forward_key(call_id: &str, message: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    call_id.hash(&mut hasher);
    message
        .pointer("/message/id")
        .and_then(Value::as_str)
        .hash(&mut hasher);
    match message.pointer("/message/content") {
        Some(content) => content.to_string().hash(&mut hasher),
        None => message.to_string().hash(&mut hasher),
    }
    hasher.finish()
}
