use crate::domains::sessions::process_cleanup::terminate_with_grace;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessKind {
    OneShot,
    Persistent,
}

#[derive(Debug, Clone)]
pub struct TrackedProcess {
    pub pid: u32,
    pub kind: ProcessKind,
    /// Set by whoever reaps the child.
    pub exited: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSummary {
    pub session_id: String,
    pub pid: u32,
    pub kind: ProcessKind,
}

/// Every agent child process, keyed by session id.
#[derive(Clone)]
pub struct ProcessRegistry {
    processes: Arc<DashMap<String, TrackedProcess>>,
    grace: Duration,
}

impl ProcessRegistry {
    pub fn new(grace: Duration) -> Self {
        Self {
            processes: Arc::new(DashMap::new()),
            grace,
        }
    }

    pub fn register(&self, session_id: &str, process: TrackedProcess) {
        log::debug!(
            "Tracking {:?} process {} for session {session_id}",
            process.kind,
            process.pid
        );
        if let Some(previous) = self.processes.insert(session_id.to_string(), process) {
            if !previous.exited.load(Ordering::SeqCst) {
                log::warn!(
                    "Session {session_id} replaced still-running process {}",
                    previous.pid
                );
            }
        }
    }

    /// Drops the entry only if it still refers to `pid`, so a late exit of a
    /// recycled process never evicts its replacement.
    pub fn unregister(&self, session_id: &str, pid: u32) -> bool {
        self.processes
            .remove_if(session_id, |_, tracked| tracked.pid == pid)
            .is_some()
    }

    pub fn get(&self, session_id: &str) -> Option<TrackedProcess> {
        self.processes.get(session_id).map(|entry| entry.clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.processes.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn list(&self) -> Vec<ProcessSummary> {
        let mut summaries: Vec<ProcessSummary> = self
            .processes
            .iter()
            .map(|entry| ProcessSummary {
                session_id: entry.key().clone(),
                pid: entry.value().pid,
                kind: entry.value().kind,
            })
            .collect();
        summaries.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        summaries
    }

    /// Terminates and forgets the session's process. Returns `false` when none is tracked.
    pub fn kill(&self, session_id: &str) -> bool {
        let Some((_, tracked)) = self.processes.remove(session_id) else {
            return false;
        };
        log::info!("Killing {:?} process {} for {session_id}", tracked.kind, tracked.pid);
        terminate_with_grace(tracked.pid, self.grace, tracked.exited);
        true
    }

    pub fn kill_all(&self) -> usize {
        let sessions: Vec<String> = self
            .processes
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        sessions
            .iter()
            .filter(|session_id| self.kill(session_id))
            .count()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::process::Command;
    use tokio::time::timeout;

    fn tracked(pid: u32) -> TrackedProcess {
        TrackedProcess {
            pid,
            kind: ProcessKind::Persistent,
            exited: Arc::new(AtomicBool::new(false)),
        }
    }

    #[test]
    fn unregister_ignores_stale_pid() {
        let registry = ProcessRegistry::new(Duration::from_secs(3));
        registry.register("s", tracked(10));
        registry.register("s", tracked(11));
        assert!(!registry.unregister("s", 10));
        assert_eq!(registry.get("s").map(|p| p.pid), Some(11));
        assert!(registry.unregister("s", 11));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn kill_all_terminates_every_process() {
        let registry = ProcessRegistry::new(Duration::from_secs(3));
        let mut children = Vec::new();
        for session in ["a", "b"] {
            let child = Command::new("sleep").arg("30").spawn().unwrap();
            registry.register(
                session,
                TrackedProcess {
                    pid: child.id().unwrap(),
                    kind: ProcessKind::OneShot,
                    exited: Arc::new(AtomicBool::new(false)),
                },
            );
            children.push(child);
        }
        assert_eq!(
            registry.list().iter().map(|p| p.session_id.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );

        assert_eq!(registry.kill_all(), 2);
        assert!(registry.is_empty());
        for mut child in children {
            let status = timeout(Duration::from_secs(10), child.wait())
                .await
                .unwrap()
                .unwrap();
            assert!(!status.success());
        }
        assert!(!registry.kill("a"));
    }
}
