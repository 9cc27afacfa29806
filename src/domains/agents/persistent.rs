use super::args::{conversation_log_path, persistent_args, resolve_binary, AgentSettings, LaunchOptions};
use super::delegate_index::DelegateCallIndex;
use super::error::AgentError;
use super::protocol::{decode_line, encode_user_turn, AgentMessage, ImageAttachment, TurnResult};
use super::registry::{ProcessKind, ProcessRegistry, TrackedProcess};
use crate::domains::sessions::process_cleanup::terminate_with_grace;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const STDERR_TAIL_BYTES: usize = 8 * 1024;
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub session_id: String,
    pub text: String,
    pub images: Vec<ImageAttachment>,
    pub cwd: PathBuf,
    pub launch: LaunchOptions,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnAck {
    pub session_id: String,
    /// The process was stopped while the turn was running.
    pub interrupted: bool,
    /// A new process was started for this turn.
    pub respawned: bool,
    pub result: Option<TurnResult>,
}

/// `Ok(None)` means the turn ended because the process was stopped.
type TurnOutcome = Result<Option<TurnResult>, AgentError>;

struct ManagedProcess {
    session_id: String,
    pid: u32,
    launch: LaunchOptions,
    stdin: tokio::sync::Mutex<ChildStdin>,
    alive: AtomicBool,
    stopping: AtomicBool,
    exited: Arc<AtomicBool>,
    in_flight: AtomicBool,
    idle: Notify,
    pending: Mutex<Option<oneshot::Sender<TurnOutcome>>>,
    stderr: Mutex<String>,
}

impl ManagedProcess {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn stderr_tail(&self) -> String {
        self.stderr.lock().clone()
    }

    fn push_stderr(&self, line: &str) {
        let mut buffer = self.stderr.lock();
        buffer.push_str(line);
        buffer.push('\n');
        if buffer.len() > STDERR_TAIL_BYTES {
            let mut cut = buffer.len() - STDERR_TAIL_BYTES;
            while !buffer.is_char_boundary(cut) {
                cut += 1;
            }
            buffer.drain(..cut);
        }
    }

    async fn write_line(&self, line: &str) -> std::io::Result<()> {
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(line.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }

    fn finish_turn(&self, outcome: TurnOutcome) {
        self.in_flight.store(false, Ordering::SeqCst);
        if let Some(waiter) = self.pending.lock().take() {
            let _ = waiter.send(outcome);
        }
        self.idle.notify_waiters();
    }

    /// Waits out a turn whose caller went away before its result arrived.
    async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if !self.in_flight.load(Ordering::SeqCst) || !self.is_alive() {
                return;
            }
            idle.await;
        }
    }
}

#[derive(Default)]
struct SessionSlot {
    /// Held for the whole turn; this is what serializes sends per session.
    turn: tokio::sync::Mutex<()>,
    process: Mutex<Option<Arc<ManagedProcess>>>,
    spawned_before: AtomicBool,
}

impl SessionSlot {
    fn is_idle(self: &Arc<Self>) -> bool {
        Arc::strong_count(self) == 1
            && self
                .process
                .lock()
                .as_ref()
                .map_or(true, |process| !process.is_alive())
    }
}

struct ManagerInner {
    settings: AgentSettings,
    registry: ProcessRegistry,
    delegates: DelegateCallIndex,
    sessions: Mutex<HashMap<String, Arc<SessionSlot>>>,
}

/// Keeps one long-lived agent process per conversation and pushes turns through it.
#[derive(Clone)]
pub struct PersistentProcessManager {
    inner: Arc<ManagerInner>,
}

impl PersistentProcessManager {
    pub fn new(
        settings: AgentSettings,
        registry: ProcessRegistry,
        delegates: DelegateCallIndex,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                settings,
                registry,
                delegates,
                sessions: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Slot for `session_id`. Slots of other sessions whose process is gone and
    /// that no caller holds are dropped on the way, so the map only tracks live
    /// or busy sessions. Slots are only cloned under this lock, which makes the
    /// reference count check exact.
    fn slot(&self, session_id: &str) -> Arc<SessionSlot> {
        let mut sessions = self.inner.sessions.lock();
        sessions.retain(|id, slot| id == session_id || !slot.is_idle());
        sessions
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    #[cfg(test)]
    fn tracked_sessions(&self) -> usize {
        self.inner.sessions.lock().len()
    }

    pub fn log_path(&self, cwd: &Path, session_id: &str) -> PathBuf {
        conversation_log_path(&self.inner.settings.projects_dir, cwd, session_id)
    }

    /// Writes one turn and resolves when the process reports its result. Calls
    /// for the same session queue behind each other.
    pub async fn send(&self, request: SendRequest) -> Result<TurnAck, AgentError> {
        let slot = self.slot(&request.session_id);
        let _turn = slot.turn.lock().await;

        let current = slot.process.lock().clone();
        let (process, respawned) = match current {
            Some(process) if process.is_alive() && process.launch == request.launch => {
                (process, false)
            }
            stale => {
                if let Some(stale) = stale.filter(|p| p.is_alive()) {
                    log::info!(
                        "Recycling agent process {} for {}: launch options changed",
                        stale.pid,
                        request.session_id
                    );
                    self.inner.retire(&stale);
                }
                let log_path = self.log_path(&request.cwd, &request.session_id);
                let resume = slot.spawned_before.load(Ordering::SeqCst) || log_path.exists();
                let process = self.inner.spawn(&request, resume, log_path)?;
                slot.spawned_before.store(true, Ordering::SeqCst);
                *slot.process.lock() = Some(Arc::clone(&process));
                (process, true)
            }
        };

        process.wait_idle().await;

        let (tx, rx) = oneshot::channel();
        process.in_flight.store(true, Ordering::SeqCst);
        *process.pending.lock() = Some(tx);
        // The exit watcher clears `alive` before it takes the waiter, so a
        // process that died in between is caught here.
        if !process.is_alive() && process.pending.lock().take().is_some() {
            process.in_flight.store(false, Ordering::SeqCst);
            return Err(AgentError::ProcessDeath {
                message: "agent process exited before the turn started".to_string(),
                stderr: process.stderr_tail(),
            });
        }

        let line = encode_user_turn(&request.text, &request.images);
        if let Err(err) = process.write_line(&line).await {
            if process.pending.lock().take().is_some() {
                process.in_flight.store(false, Ordering::SeqCst);
                return Err(AgentError::ProcessDeath {
                    message: format!("failed to write turn: {err}"),
                    stderr: process.stderr_tail(),
                });
            }
        }
        log::debug!(
            "Turn written to agent process {} for {}",
            process.pid,
            request.session_id
        );

        match rx.await {
            Ok(Ok(result)) => Ok(TurnAck {
                session_id: request.session_id,
                interrupted: result.is_none(),
                respawned,
                result,
            }),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(AgentError::ProcessDeath {
                message: "agent process went away without reporting a result".to_string(),
                stderr: process.stderr_tail(),
            }),
        }
    }

    /// Stops the session's process. A turn in flight resolves as interrupted.
    pub fn stop(&self, session_id: &str) -> bool {
        self.inner.delegates.clear(session_id);
        let Some(slot) = self.inner.sessions.lock().get(session_id).cloned() else {
            return false;
        };
        let process = slot.process.lock().take();
        match process {
            Some(process) if process.is_alive() => {
                log::info!("Stopping agent process {} for {session_id}", process.pid);
                self.inner.retire(&process);
                true
            }
            _ => false,
        }
    }

    pub fn kill_all(&self) -> usize {
        let sessions: Vec<String> = self.inner.sessions.lock().keys().cloned().collect();
        sessions
            .iter()
            .filter(|session_id| self.stop(session_id))
            .count()
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.inner
            .sessions
            .lock()
            .get(session_id)
            .and_then(|slot| slot.process.lock().clone())
            .is_some_and(|process| process.is_alive())
    }
}

impl ManagerInner {
    fn retire(&self, process: &Arc<ManagedProcess>) {
        process.stopping.store(true, Ordering::SeqCst);
        process.alive.store(false, Ordering::SeqCst);
        self.registry.unregister(&process.session_id, process.pid);
        terminate_with_grace(
            process.pid,
            self.settings.stop_grace,
            Arc::clone(&process.exited),
        );
    }

    fn spawn(
        self: &Arc<Self>,
        request: &SendRequest,
        resume: bool,
        log_path: PathBuf,
    ) -> Result<Arc<ManagedProcess>, AgentError> {
        let binary_name = self.settings.binary.as_str();
        if !request.cwd.is_dir() {
            return Err(AgentError::spawn(
                binary_name,
                format!("working directory {} does not exist", request.cwd.display()),
            ));
        }
        let binary = resolve_binary(binary_name)?;
        let args = persistent_args(&self.settings, &request.session_id, resume, &request.launch);
        log::info!(
            "Spawning agent for {} in {} ({})",
            request.session_id,
            request.cwd.display(),
            if resume { "resume" } else { "new session" }
        );

        let mut child = Command::new(&binary)
            .args(&args)
            .current_dir(&request.cwd)
            .env_remove("CLAUDECODE")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => AgentError::not_installed(binary_name),
                _ => AgentError::spawn(binary_name, e),
            })?;

        let pid = child
            .id()
            .ok_or_else(|| AgentError::spawn(binary_name, "process exited during spawn"))?;
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(AgentError::spawn(binary_name, "stdio pipes unavailable"));
        };

        let process = Arc::new(ManagedProcess {
            session_id: request.session_id.clone(),
            pid,
            launch: request.launch.clone(),
            stdin: tokio::sync::Mutex::new(stdin),
            alive: AtomicBool::new(true),
            stopping: AtomicBool::new(false),
            exited: Arc::new(AtomicBool::new(false)),
            in_flight: AtomicBool::new(false),
            idle: Notify::new(),
            pending: Mutex::new(None),
            stderr: Mutex::new(String::new()),
        });
        self.registry.register(
            &request.session_id,
            TrackedProcess {
                pid,
                kind: ProcessKind::Persistent,
                exited: Arc::clone(&process.exited),
            },
        );

        let router = tokio::spawn(Arc::clone(self).route_output(
            Arc::clone(&process),
            stdout,
            log_path,
        ));
        let stderr_task = tokio::spawn(collect_stderr(Arc::clone(&process), stderr));
        tokio::spawn(Arc::clone(self).watch_exit(
            Arc::clone(&process),
            child,
            [router, stderr_task],
        ));
        Ok(process)
    }

    async fn route_output(
        self: Arc<Self>,
        process: Arc<ManagedProcess>,
        stdout: ChildStdout,
        log_path: PathBuf,
    ) {
        let mut reader = BufReader::new(stdout);
        let mut buf = Vec::new();
        loop {
            match read_lossy_line(&mut reader, &mut buf).await {
                Ok(Some(line)) => self.route_line(&process, &line, &log_path).await,
                Ok(None) => break,
                Err(err) => {
                    log::warn!("Agent stdout for {} failed: {err}", process.session_id);
                    break;
                }
            }
        }
    }

    async fn route_line(&self, process: &ManagedProcess, line: &str, log_path: &Path) {
        let Some(message) = decode_line(line) else {
            return;
        };
        let session_id = process.session_id.as_str();
        match &message {
            AgentMessage::Result { result, .. } => {
                log::debug!(
                    "Turn finished for {session_id}: {} (error: {})",
                    result.subtype,
                    result.is_error
                );
                process.finish_turn(Ok(Some(result.clone())));
                return;
            }
            AgentMessage::Invalid(text) => {
                log::warn!("Unparsable agent output for {session_id}: {text}");
                return;
            }
            AgentMessage::System { subtype, .. } => {
                log::debug!("Agent system record for {session_id}: {subtype:?}");
            }
            _ => {}
        }

        for call in message.delegate_calls() {
            self.delegates.record(session_id, &call.call_id, &call.prompt);
        }
        for call_id in message.tool_results() {
            self.delegates.resolve(session_id, &call_id);
        }

        let forwards = matches!(message, AgentMessage::Assistant(_) | AgentMessage::User(_));
        if let (true, Some(parent), Some(raw)) =
            (forwards, message.parent_tool_use_id(), message.raw())
        {
            let forwarded = self
                .delegates
                .forward_progress(log_path, session_id, parent, None, raw)
                .await;
            if let Err(err) = forwarded {
                log::warn!(
                    "Failed to forward progress for {session_id} to {}: {err}",
                    log_path.display()
                );
            }
        }
    }

    async fn watch_exit(
        self: Arc<Self>,
        process: Arc<ManagedProcess>,
        mut child: Child,
        readers: [JoinHandle<()>; 2],
    ) {
        let status = child.wait().await;
        process.exited.store(true, Ordering::SeqCst);
        process.alive.store(false, Ordering::SeqCst);
        // Results and stderr written just before exit must land first.
        for reader in readers {
            let _ = timeout(OUTPUT_DRAIN_TIMEOUT, reader).await;
        }
        self.registry.unregister(&process.session_id, process.pid);

        let outcome = match status {
            Ok(status) if process.stopping.load(Ordering::SeqCst) || stopped_by_signal(&status) => {
                log::info!("Agent process {} stopped ({status})", process.pid);
                Ok(None)
            }
            Ok(status) => {
                log::warn!(
                    "Agent process {} for {} exited with {status}",
                    process.pid,
                    process.session_id
                );
                Err(AgentError::ProcessDeath {
                    message: format!("exited with {status}"),
                    stderr: process.stderr_tail(),
                })
            }
            Err(err) => Err(AgentError::ProcessDeath {
                message: format!("failed to wait for agent process: {err}"),
                stderr: process.stderr_tail(),
            }),
        };
        process.finish_turn(outcome);
    }
}

/// Next newline-terminated line, with invalid UTF-8 replaced. A final line
/// without a newline is still returned.
async fn read_lossy_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> std::io::Result<Option<String>> {
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    Ok(Some(String::from_utf8_lossy(buf).into_owned()))
}

async fn collect_stderr(process: Arc<ManagedProcess>, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        match read_lossy_line(&mut reader, &mut buf).await {
            Ok(Some(line)) => {
                log::debug!("agent[{}] stderr: {line}", process.session_id);
                process.push_stderr(&line);
            }
            Ok(None) => break,
            Err(err) => {
                log::debug!("Agent stderr for {} failed: {err}", process.session_id);
                break;
            }
        }
    }
}

#[cfg(unix)]
fn stopped_by_signal(status: &ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    matches!(status.signal(), Some(libc::SIGTERM) | Some(libc::SIGKILL))
        || matches!(status.code(), Some(143) | Some(137))
}

#[cfg(not(unix))]
fn stopped_by_signal(status: &ExitStatus) -> bool {
    matches!(status.code(), Some(143) | Some(137))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::domains::agents::PermissionPolicy;
    use serde_json::Value;
    use tempfile::TempDir;

    const ECHO_AGENT: &str = r#"args="$*"
while IFS= read -r line; do
  text=$(printf '%s' "$line" | sed 's/.*"text":"\([^"]*\)".*/\1/')
  sleep 0.1
  printf '{"type":"result","subtype":"success","is_error":false,"result":"%s|%s|%s"}\n' "$text" "$$" "$args"
done
"#;

    struct Fixture {
        _tmp: TempDir,
        cwd: PathBuf,
        manager: PersistentProcessManager,
        registry: ProcessRegistry,
        delegates: DelegateCallIndex,
    }

    fn fixture(script: &str) -> Fixture {
        fixture_with_binary(script, "/bin/sh")
    }

    fn fixture_with_binary(script: &str, binary: &str) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let script_path = tmp.path().join("agent.sh");
        std::fs::write(&script_path, script).unwrap();
        let cwd = tmp.path().join("work");
        std::fs::create_dir_all(&cwd).unwrap();

        let settings = AgentSettings {
            binary: binary.to_string(),
            projects_dir: tmp.path().join("projects"),
            stop_grace: Duration::from_secs(3),
            one_shot_timeout: Duration::from_secs(5),
            extra_args: vec![script_path.to_string_lossy().to_string()],
        };
        let registry = ProcessRegistry::new(settings.stop_grace);
        let delegates = DelegateCallIndex::new();
        let manager = PersistentProcessManager::new(settings, registry.clone(), delegates.clone());
        Fixture {
            _tmp: tmp,
            cwd,
            manager,
            registry,
            delegates,
        }
    }

    fn request(fx: &Fixture, session: &str, text: &str) -> SendRequest {
        SendRequest {
            session_id: session.to_string(),
            text: text.to_string(),
            images: Vec::new(),
            cwd: fx.cwd.clone(),
            launch: LaunchOptions::default(),
        }
    }

    async fn send(fx: &Fixture, req: SendRequest) -> Result<TurnAck, AgentError> {
        timeout(Duration::from_secs(15), fx.manager.send(req))
            .await
            .expect("send timed out")
    }

    /// Splits the echo agent's `text|pid|args` result.
    fn echo_parts(ack: &TurnAck) -> (String, String, String) {
        let result = ack.result.as_ref().and_then(|r| r.result.clone()).unwrap();
        let mut parts = result.splitn(3, '|').map(str::to_string);
        (
            parts.next().unwrap(),
            parts.next().unwrap(),
            parts.next().unwrap(),
        )
    }

    #[tokio::test]
    async fn second_send_reuses_live_process() {
        let fx = fixture(ECHO_AGENT);
        let first = send(&fx, request(&fx, "s1", "hello")).await.unwrap();
        let second = send(&fx, request(&fx, "s1", "again")).await.unwrap();

        let (text1, pid1, args1) = echo_parts(&first);
        let (text2, pid2, _) = echo_parts(&second);
        assert_eq!(text1, "hello");
        assert_eq!(text2, "again");
        assert_eq!(pid1, pid2);
        assert!(first.respawned);
        assert!(!second.respawned);
        assert!(args1.contains("--session-id s1"));
        assert_eq!(fx.registry.len(), 1);
        assert_eq!(
            fx.registry.get("s1").map(|p| p.pid.to_string()),
            Some(pid1)
        );
        assert!(fx.manager.stop("s1"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_sends_are_serialized_per_session() {
        let fx = Arc::new(fixture(ECHO_AGENT));
        let mut handles = Vec::new();
        for i in 0..5 {
            let fx = Arc::clone(&fx);
            handles.push(tokio::spawn(async move {
                let text = format!("msg-{i}");
                let ack = send(&fx, request(&fx, "s1", &text)).await.unwrap();
                (text, ack)
            }));
        }

        let mut pids = Vec::new();
        for handle in handles {
            let (text, ack) = handle.await.unwrap();
            let (echoed, pid, _) = echo_parts(&ack);
            assert_eq!(echoed, text, "turn received another turn's result");
            pids.push(pid);
        }
        pids.dedup();
        assert_eq!(pids.len(), 1, "all turns share one process");
        fx.manager.kill_all();
    }

    #[tokio::test]
    async fn changed_launch_options_recycle_with_resume() {
        let fx = fixture(ECHO_AGENT);
        let first = send(&fx, request(&fx, "s1", "one")).await.unwrap();
        let mut req = request(&fx, "s1", "two");
        req.launch = LaunchOptions {
            permission: PermissionPolicy::Plan,
            model: Some("sonnet".into()),
        };
        let second = send(&fx, req).await.unwrap();

        let (_, pid1, _) = echo_parts(&first);
        let (_, pid2, args2) = echo_parts(&second);
        assert_ne!(pid1, pid2);
        assert!(second.respawned);
        assert!(args2.contains("--resume s1 --permission-mode plan --model sonnet"));
        fx.manager.kill_all();
    }

    #[tokio::test]
    async fn existing_log_resumes_on_first_spawn() {
        let fx = fixture(ECHO_AGENT);
        let log = fx.manager.log_path(&fx.cwd, "s2");
        std::fs::create_dir_all(log.parent().unwrap()).unwrap();
        std::fs::write(&log, "{}\n").unwrap();

        let ack = send(&fx, request(&fx, "s2", "hi")).await.unwrap();
        let (_, _, args) = echo_parts(&ack);
        assert!(args.contains("--resume s2"));
        fx.manager.kill_all();
    }

    #[tokio::test]
    async fn unexpected_exit_fails_turn_with_stderr() {
        let fx = fixture("read -r line\necho boom >&2\nexit 2\n");
        let err = send(&fx, request(&fx, "s1", "hi")).await.unwrap_err();
        match err {
            AgentError::ProcessDeath { message, stderr } => {
                assert!(message.contains('2'), "message was {message}");
                assert!(stderr.contains("boom"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!fx.manager.is_running("s1"));
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn invalid_utf8_output_does_not_kill_the_turn() {
        let script = r#"while IFS= read -r line; do
  printf 'warn \377\n' >&2
  printf '\377 not json\n'
  sleep 0.3
  echo more >&2
  printf '%s\n' '{"type":"result","subtype":"success","is_error":false,"result":"ok"}'
done
"#;
        let fx = fixture(script);
        let ack = send(&fx, request(&fx, "s1", "go")).await.unwrap();
        assert_eq!(ack.result.and_then(|r| r.result).as_deref(), Some("ok"));
        assert!(fx.manager.is_running("s1"));

        let again = send(&fx, request(&fx, "s1", "again")).await.unwrap();
        assert!(!again.respawned);
        fx.manager.kill_all();
    }

    #[tokio::test]
    async fn stopped_sessions_are_not_tracked_forever() {
        let fx = fixture(ECHO_AGENT);
        send(&fx, request(&fx, "s1", "one")).await.unwrap();
        send(&fx, request(&fx, "s2", "two")).await.unwrap();
        assert_eq!(fx.manager.tracked_sessions(), 2);

        assert!(fx.manager.stop("s1"));
        send(&fx, request(&fx, "s3", "three")).await.unwrap();
        assert_eq!(fx.manager.tracked_sessions(), 2);
        assert!(!fx.manager.stop("s1"));
        assert!(!fx.manager.stop("never-started"));
        assert!(fx.manager.is_running("s2"));
        fx.manager.kill_all();
    }

    #[tokio::test]
    async fn stop_during_turn_resolves_as_interrupted() {
        let fx = Arc::new(fixture("read -r line\nexec sleep 30\n"));
        let turn = {
            let fx = Arc::clone(&fx);
            tokio::spawn(async move { send(&fx, request(&fx, "s1", "long")).await })
        };
        for _ in 0..50 {
            if fx.manager.is_running("s1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(fx.manager.stop("s1"));
        let ack = turn.await.unwrap().unwrap();
        assert!(ack.interrupted);
        assert!(ack.result.is_none());
        assert!(!fx.manager.stop("s1"));
    }

    #[tokio::test]
    async fn records_delegates_and_forwards_progress() {
        let script = r#"while IFS= read -r line; do
  printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"tool_use","id":"toolu_9","name":"Task","input":{"prompt":"Survey the repo"}}]},"parent_tool_use_id":null}'
  printf '%s\n' '{"type":"assistant","message":{"content":[{"type":"text","text":"child says hi"}]},"parent_tool_use_id":"toolu_9"}'
  printf '%s\n' 'not json at all'
  printf '%s\n' '{"type":"result","subtype":"success","is_error":false,"result":"ok"}'
done
"#;
        let fx = fixture(script);
        let ack = send(&fx, request(&fx, "s3", "go")).await.unwrap();
        assert_eq!(ack.result.and_then(|r| r.result).as_deref(), Some("ok"));

        let pending = fx.delegates.pending("s3");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].call_id, "toolu_9");
        assert_eq!(pending[0].prompt, "Survey the repo");

        let log = std::fs::read_to_string(fx.manager.log_path(&fx.cwd, "s3")).unwrap();
        let records: Vec<Value> = log
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["type"], "progress");
        assert_eq!(records[0]["parentToolUseID"], "toolu_9");
        assert_eq!(
            records[0]["data"]["message"]["message"]["content"][0]["text"],
            "child says hi"
        );

        assert!(fx.manager.stop("s3"));
        assert!(fx.delegates.pending("s3").is_empty());
    }

    #[tokio::test]
    async fn missing_binary_reports_not_installed() {
        let fx = fixture_with_binary(ECHO_AGENT, "no-such-agent-binary-xyz");
        let err = send(&fx, request(&fx, "s1", "hi")).await.unwrap_err();
        assert!(matches!(
            err,
            AgentError::SpawnFailure {
                not_installed: true,
                ..
            }
        ));
        assert!(fx.registry.is_empty());
    }
}
