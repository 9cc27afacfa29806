use super::stream::{TailCursor, TailEvent, TailSettings};
use crate::domains::agents::protocol::first_message_text;
use crate::domains::agents::DelegateCallIndex;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Leading characters compared when a child prompt is not an exact match.
pub const PROMPT_MATCH_CAP: usize = 200;

const CHILD_PREFIX: &str = "agent-";
const CHILD_SUFFIX: &str = ".jsonl";

/// Whether a child agent's opening text belongs to a delegate call's prompt.
///
/// Exact matches always win. Otherwise only the first [`PROMPT_MATCH_CAP`]
/// characters are compared and one must be a prefix of the other, since the
/// CLI may truncate or extend the instructions it hands to the child.
pub fn prompts_match(child_text: &str, call_prompt: &str) -> bool {
    let child = child_text.trim();
    let call = call_prompt.trim();
    if child.is_empty() || call.is_empty() {
        return false;
    }
    if child == call {
        return true;
    }
    let child_head: String = child.chars().take(PROMPT_MATCH_CAP).collect();
    let call_head: String = call.chars().take(PROMPT_MATCH_CAP).collect();
    call_head.starts_with(&child_head) || child_head.starts_with(&call_head)
}

/// `agent-<id>.jsonl` -> `<id>`.
pub fn child_agent_id(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let id = name.strip_prefix(CHILD_PREFIX)?.strip_suffix(CHILD_SUFFIX)?;
    (!id.is_empty()).then(|| id.to_string())
}

/// `<dir>/<session>.jsonl` keeps its children in `<dir>/<session>/subagents`.
pub fn subagents_dir_for(parent_log: &Path) -> PathBuf {
    parent_log.with_extension("").join("subagents")
}

#[derive(Debug)]
struct ChildLog {
    cursor: TailCursor,
    call_id: Option<String>,
}

/// Maps child agent logs onto the parent's delegate calls and copies their
/// records into the parent log as progress entries.
pub struct SubagentCorrelator {
    parent_log: PathBuf,
    subagents_dir: PathBuf,
    session_id: String,
    delegates: DelegateCallIndex,
    children: HashMap<String, ChildLog>,
    claimed: HashSet<String>,
}

impl SubagentCorrelator {
    pub fn new(parent_log: PathBuf, session_id: String, delegates: DelegateCallIndex) -> Self {
        let subagents_dir = subagents_dir_for(&parent_log);
        Self {
            parent_log,
            subagents_dir,
            session_id,
            delegates,
            children: HashMap::new(),
            claimed: HashSet::new(),
        }
    }

    pub fn subagents_dir(&self) -> &Path {
        &self.subagents_dir
    }

    pub fn resolved_call(&self, agent_id: &str) -> Option<&str> {
        self.children
            .get(agent_id)?
            .call_id
            .as_deref()
    }

    async fn child_paths(&self) -> std::io::Result<Vec<(String, PathBuf)>> {
        let mut entries = match tokio::fs::read_dir(&self.subagents_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let mut found = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if let Some(id) = child_agent_id(&path) {
                found.push((id, path));
            }
        }
        found.sort();
        Ok(found)
    }

    /// One pass over the child directory. Returns how many records were
    /// forwarded to the parent log. A child that cannot be read is skipped for
    /// this pass; only failing to list the directory is an error.
    pub async fn scan(&mut self) -> std::io::Result<usize> {
        let mut forwarded = 0;
        for (agent_id, path) in self.child_paths().await? {
            match self.scan_child(&agent_id, path).await {
                Ok(count) => forwarded += count,
                Err(err) => log::warn!("Skipping subagent {agent_id} this pass: {err}"),
            }
        }
        Ok(forwarded)
    }

    async fn scan_child(&mut self, agent_id: &str, path: PathBuf) -> std::io::Result<usize> {
        let child = self
            .children
            .entry(agent_id.to_string())
            .or_insert_with(|| ChildLog {
                cursor: TailCursor::at(path, 0),
                call_id: None,
            });

        let call_id = match child.call_id.clone() {
            Some(call_id) => call_id,
            None => {
                let Some(opening) = read_opening_text(child.cursor.path()).await? else {
                    return Ok(0);
                };
                let candidate = self
                    .delegates
                    .pending(&self.session_id)
                    .into_iter()
                    .find(|call| {
                        !self.claimed.contains(&call.call_id) && prompts_match(&opening, &call.prompt)
                    });
                let Some(call) = candidate else {
                    log::debug!("Subagent {agent_id} has no matching delegate call yet");
                    return Ok(0);
                };
                log::info!(
                    "Subagent {agent_id} of session {} resolved to call {}",
                    self.session_id,
                    call.call_id
                );
                self.claimed.insert(call.call_id.clone());
                child.call_id = Some(call.call_id.clone());
                call.call_id
            }
        };

        let mut forwarded = 0;
        for event in child.cursor.flush().await? {
            let TailEvent::Lines { lines, .. } = event else {
                continue;
            };
            for line in lines {
                let message: Value = match serde_json::from_str(&line) {
                    Ok(value) => value,
                    Err(err) => {
                        log::debug!("Skipping malformed record from subagent {agent_id}: {err}");
                        continue;
                    }
                };
                let written = self
                    .delegates
                    .forward_progress(
                        &self.parent_log,
                        &self.session_id,
                        &call_id,
                        Some(agent_id),
                        &message,
                    )
                    .await?;
                if written {
                    forwarded += 1;
                }
            }
        }
        Ok(forwarded)
    }
}

/// Text of the first complete record in a child log.
async fn read_opening_text(path: &Path) -> std::io::Result<Option<String>> {
    let file = match tokio::fs::File::open(path).await {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err),
    };
    let mut reader = tokio::io::BufReader::new(file);
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 || !line.ends_with('\n') {
            return Ok(None);
        }
        if line.trim().is_empty() {
            continue;
        }
        let Ok(record) = serde_json::from_str::<Value>(&line) else {
            return Ok(None);
        };
        return Ok(first_message_text(&record));
    }
}

pub struct SubagentWatchHandle {
    _debouncer: Option<Debouncer<RecommendedWatcher>>,
    task: JoinHandle<()>,
}

impl SubagentWatchHandle {
    pub fn close(self) {}
}

impl Drop for SubagentWatchHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn start_debouncer(
    watch_root: &Path,
    settings: &TailSettings,
    tx: mpsc::Sender<DebounceEventResult>,
) -> Result<Debouncer<RecommendedWatcher>, notify::Error> {
    let mut debouncer = new_debouncer(settings.throttle, move |result: DebounceEventResult| {
        if let Err(e) = tx.blocking_send(result) {
            log::debug!("Subagent watch event dropped: {e}");
        }
    })?;
    debouncer
        .watcher()
        .watch(watch_root, RecursiveMode::Recursive)?;
    Ok(debouncer)
}

/// Starts correlating child logs of `parent_log` until the handle is dropped.
///
/// The child directory may not exist yet, so the watch is placed on the parent
/// log's directory and narrowed to this session; the poll interval catches
/// anything the notifier misses.
pub fn watch_subagents(
    parent_log: PathBuf,
    session_id: String,
    delegates: DelegateCallIndex,
    settings: TailSettings,
) -> SubagentWatchHandle {
    let mut correlator = SubagentCorrelator::new(parent_log.clone(), session_id, delegates);
    let session_dir = parent_log.with_extension("");
    let watch_root = parent_log
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    let (tx, mut rx) = mpsc::channel(16);
    let debouncer = match start_debouncer(&watch_root, &settings, tx) {
        Ok(debouncer) => Some(debouncer),
        Err(e) => {
            log::warn!(
                "Watching {} for subagents failed, polling only: {e}",
                watch_root.display()
            );
            None
        }
    };
    let mut watching = debouncer.is_some();

    let task = tokio::spawn(async move {
        let mut poll = interval_at(Instant::now() + settings.poll, settings.poll);
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
        if let Err(e) = correlator.scan().await {
            log::warn!("Subagent scan failed: {e}");
        }
        loop {
            let scan = tokio::select! {
                result = rx.recv(), if watching => match result {
                    Some(Ok(events)) => events
                        .iter()
                        .any(|event| event.path.starts_with(&session_dir)),
                    Some(Err(e)) => {
                        log::warn!("Subagent watcher error: {e:?}");
                        false
                    }
                    None => {
                        watching = false;
                        false
                    }
                },
                _ = poll.tick() => true,
            };
            if scan {
                if let Err(e) = correlator.scan().await {
                    log::warn!(
                        "Subagent scan of {} failed: {e}",
                        correlator.subagents_dir().display()
                    );
                }
            }
        }
    });

    SubagentWatchHandle {
        _debouncer: debouncer,
        task,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    fn append_json(path: &Path, value: Value) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        writeln!(file, "{value}").unwrap();
    }

    fn user_record(text: &str) -> Value {
        json!({"type": "user", "message": {"role": "user", "content": text}})
    }

    fn parent_records(path: &Path) -> Vec<Value> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect()
    }

    #[test]
    fn prompt_matching_rules() {
        assert!(prompts_match("Fix the build", "Fix the build"));
        assert!(prompts_match("  Fix the build\n", "Fix the build"));
        assert!(prompts_match("Fix the", "Fix the build"));
        assert!(prompts_match("Fix the build and run tests", "Fix the build"));
        assert!(!prompts_match("Review docs", "Fix the build"));
        assert!(!prompts_match("", "Fix the build"));

        let shared = "x".repeat(PROMPT_MATCH_CAP);
        assert!(prompts_match(
            &format!("{shared}child tail"),
            &format!("{shared}different parent tail")
        ));
        assert!(!prompts_match(
            &format!("a{shared}"),
            &format!("b{shared}")
        ));
    }

    #[test]
    fn child_ids_come_from_file_names() {
        assert_eq!(
            child_agent_id(Path::new("/p/s/subagents/agent-7f3a.jsonl")).as_deref(),
            Some("7f3a")
        );
        assert_eq!(child_agent_id(Path::new("agent-.jsonl")), None);
        assert_eq!(child_agent_id(Path::new("notes.jsonl")), None);
        assert_eq!(
            subagents_dir_for(Path::new("/p/proj/s1.jsonl")),
            PathBuf::from("/p/proj/s1/subagents")
        );
    }

    #[tokio::test]
    async fn unresolved_children_wait_for_their_call() {
        let tmp = TempDir::new().unwrap();
        let parent = tmp.path().join("s1.jsonl");
        let child = tmp.path().join("s1/subagents/agent-a1.jsonl");
        append_json(&child, user_record("Investigate the flaky test"));
        append_json(&child, json!({"type": "assistant", "message": {"content": "looking"}}));
        std::fs::write(tmp.path().join("s1/subagents/notes.txt"), "ignored").unwrap();

        let delegates = DelegateCallIndex::new();
        let mut correlator = SubagentCorrelator::new(parent.clone(), "s1".into(), delegates.clone());
        assert_eq!(correlator.scan().await.unwrap(), 0);
        assert!(!parent.exists());

        delegates.record("s1", "call-1", "Investigate the flaky test in the tail module");
        assert_eq!(correlator.scan().await.unwrap(), 2);
        assert_eq!(correlator.resolved_call("a1"), Some("call-1"));

        let records = parent_records(&parent);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["type"], "progress");
        assert_eq!(records[0]["parentToolUseID"], "call-1");
        assert_eq!(records[0]["sessionId"], "s1");
        assert_eq!(records[0]["data"]["agentId"], "a1");
        assert_eq!(records[1]["data"]["message"]["type"], "assistant");

        append_json(&child, json!({"type": "assistant", "message": {"content": "done"}}));
        assert_eq!(correlator.scan().await.unwrap(), 1);
        assert_eq!(correlator.scan().await.unwrap(), 0);
        assert_eq!(parent_records(&parent).len(), 3);
    }

    #[tokio::test]
    async fn a_claimed_call_is_not_reused() {
        let tmp = TempDir::new().unwrap();
        let parent = tmp.path().join("s1.jsonl");
        let subagents = tmp.path().join("s1/subagents");
        append_json(&subagents.join("agent-a1.jsonl"), user_record("Run the linter"));
        append_json(&subagents.join("agent-a2.jsonl"), user_record("Run the linter"));

        let delegates = DelegateCallIndex::new();
        delegates.record("s1", "call-1", "Run the linter");
        let mut correlator = SubagentCorrelator::new(parent.clone(), "s1".into(), delegates.clone());
        assert_eq!(correlator.scan().await.unwrap(), 1);
        assert_eq!(correlator.resolved_call("a1"), Some("call-1"));
        assert_eq!(correlator.resolved_call("a2"), None);

        delegates.record("s1", "call-2", "Run the linter");
        assert_eq!(correlator.scan().await.unwrap(), 1);
        assert_eq!(correlator.resolved_call("a2"), Some("call-2"));
    }

    #[tokio::test]
    async fn messages_already_forwarded_from_stdout_are_not_repeated() {
        let tmp = TempDir::new().unwrap();
        let parent = tmp.path().join("s1.jsonl");
        let child = tmp.path().join("s1/subagents/agent-c3.jsonl");
        let delegates = DelegateCallIndex::new();
        delegates.record("s1", "call-4", "Audit the dependencies");

        let content = json!([{"type": "text", "text": "checking Cargo.lock"}]);
        let streamed = json!({
            "type": "assistant",
            "parent_tool_use_id": "call-4",
            "message": {"id": "msg_7", "content": content}
        });
        assert!(delegates
            .forward_progress(&parent, "s1", "call-4", None, &streamed)
            .await
            .unwrap());

        append_json(&child, user_record("Audit the dependencies"));
        append_json(
            &child,
            json!({"type": "assistant", "uuid": "u1", "message": {"id": "msg_7", "content": content}}),
        );
        let mut correlator = SubagentCorrelator::new(parent.clone(), "s1".into(), delegates);
        assert_eq!(correlator.scan().await.unwrap(), 1);

        let records = parent_records(&parent);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["data"]["message"]["message"]["id"], "msg_7");
        assert_eq!(records[1]["data"]["message"]["type"], "user");
        assert_eq!(records[1]["data"]["agentId"], "c3");
    }

    #[tokio::test]
    async fn an_unreadable_child_does_not_block_the_others() {
        let tmp = TempDir::new().unwrap();
        let parent = tmp.path().join("s1.jsonl");
        let subagents = tmp.path().join("s1/subagents");
        std::fs::create_dir_all(subagents.join("agent-a0.jsonl")).unwrap();
        append_json(&subagents.join("agent-b1.jsonl"), user_record("Write the changelog"));

        let delegates = DelegateCallIndex::new();
        delegates.record("s1", "call-5", "Write the changelog");
        let mut correlator = SubagentCorrelator::new(parent.clone(), "s1".into(), delegates);
        assert_eq!(correlator.scan().await.unwrap(), 1);
        assert_eq!(correlator.resolved_call("b1"), Some("call-5"));
        assert_eq!(correlator.resolved_call("a0"), None);
        assert_eq!(correlator.scan().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn live_watch_forwards_children_created_after_start() {
        let tmp = TempDir::new().unwrap();
        let parent = tmp.path().join("s1.jsonl");
        std::fs::write(&parent, "").unwrap();
        let delegates = DelegateCallIndex::new();
        let settings = TailSettings {
            throttle: Duration::from_millis(50),
            poll: Duration::from_millis(100),
            heartbeat: Duration::from_secs(30),
        };
        let handle = watch_subagents(parent.clone(), "s1".into(), delegates.clone(), settings);

        delegates.record("s1", "call-9", "Summarize the changes");
        append_json(
            &tmp.path().join("s1/subagents/agent-b2.jsonl"),
            user_record("Summarize the changes"),
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let records = parent_records(&parent);
            if let Some(record) = records.first() {
                assert_eq!(record["parentToolUseID"], "call-9");
                assert_eq!(record["data"]["agentId"], "b2");
                break;
            }
            assert!(Instant::now() < deadline, "no progress record forwarded");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        handle.close();
    }
}
