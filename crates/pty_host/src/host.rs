use crate::error::{PtyHostError, Result};
use crate::protocol::{ClientMessage, PtySessionInfo, PtyStatus, ServerMessage, SpawnOptions};
use crate::scrollback::{Scrollback, DEFAULT_MAX_CHARS, DEFAULT_TRIM_CHARS};
use crate::utf8_stream::Utf8Stream;
use parking_lot::Mutex;
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, NativePtySystem, PtySize, PtySystem};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::runtime::Handle;
use tokio::sync::mpsc;

const CHUNK_SIZE: usize = 16 * 1024;
const READER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

pub type ConnectionId = u64;
type Subscriber = mpsc::UnboundedSender<ServerMessage>;

#[derive(Debug, Clone)]
pub struct PtyHostConfig {
    pub scrollback_max_chars: usize,
    pub scrollback_trim_chars: usize,
    /// How long an exited session stays attachable before it is dropped.
    pub exited_retention: Duration,
    /// Delay between the graceful terminate signal and the forced kill.
    pub kill_grace: Duration,
    pub shell: Option<String>,
}

impl Default for PtyHostConfig {
    fn default() -> Self {
        Self {
            scrollback_max_chars: DEFAULT_MAX_CHARS,
            scrollback_trim_chars: DEFAULT_TRIM_CHARS,
            exited_retention: Duration::from_secs(5),
            kill_grace: Duration::from_secs(3),
            shell: None,
        }
    }
}

struct EntryState {
    name: String,
    status: PtyStatus,
    exit_code: Option<i32>,
    cols: u16,
    rows: u16,
    scrollback: Scrollback,
    subscribers: HashMap<ConnectionId, Subscriber>,
}

impl EntryState {
    fn broadcast(&mut self, message: &ServerMessage) {
        self.subscribers
            .retain(|_, subscriber| subscriber.send(message.clone()).is_ok());
    }
}

struct TerminalEntry {
    id: String,
    cwd: String,
    created_at: u64,
    pid: Option<u32>,
    exited: AtomicBool,
    state: Mutex<EntryState>,
    /// Queue drained by the terminal's writer task. `None` once input is closed.
    input: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
}

impl TerminalEntry {
    fn info(&self) -> PtySessionInfo {
        let state = self.state.lock();
        PtySessionInfo {
            id: self.id.clone(),
            name: state.name.clone(),
            status: state.status,
            exit_code: state.exit_code,
            cols: state.cols,
            rows: state.rows,
            cwd: self.cwd.clone(),
            created_at: self.created_at,
        }
    }

    fn is_running(&self) -> bool {
        self.state.lock().status == PtyStatus::Running
    }

    fn enqueue_input(&self, data: &[u8]) -> bool {
        self.input
            .lock()
            .as_ref()
            .is_some_and(|queue| queue.send(data.to_vec()).is_ok())
    }

    /// Drops queued input; the writer task stops at its next chunk.
    fn close_input(&self) {
        self.input.lock().take();
    }

    fn input_open(&self) -> bool {
        self.input.lock().is_some()
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.master
            .lock()
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyHostError::pty("resize", e))?;
        let mut state = self.state.lock();
        state.cols = cols;
        state.rows = rows;
        Ok(())
    }

    fn publish_output(&self, data: String) {
        if data.is_empty() {
            return;
        }
        let mut state = self.state.lock();
        state.scrollback.push(&data);
        let message = ServerMessage::Output {
            id: self.id.clone(),
            data,
        };
        state.broadcast(&message);
    }

    fn publish_exit(&self, exit_code: Option<i32>) {
        self.exited.store(true, Ordering::SeqCst);
        self.close_input();
        let mut state = self.state.lock();
        state.status = PtyStatus::Exited;
        state.exit_code = exit_code;
        let message = ServerMessage::Exit {
            id: self.id.clone(),
            exit_code,
        };
        state.broadcast(&message);
    }

    /// Replays history and registers the subscriber under one lock so the new
    /// subscriber sees exactly what earlier subscribers saw, in order.
    fn attach(&self, connection: ConnectionId, subscriber: Subscriber) {
        let mut state = self.state.lock();
        if !state.scrollback.is_empty() {
            let _ = subscriber.send(ServerMessage::Output {
                id: self.id.clone(),
                data: state.scrollback.as_str().to_string(),
            });
        }
        if state.status == PtyStatus::Exited {
            let _ = subscriber.send(ServerMessage::Exit {
                id: self.id.clone(),
                exit_code: state.exit_code,
            });
        }
        state.subscribers.insert(connection, subscriber);
    }
}

struct HostInner {
    config: PtyHostConfig,
    terminals: Mutex<HashMap<String, Arc<TerminalEntry>>>,
    connections: Mutex<HashMap<ConnectionId, Subscriber>>,
    next_connection: AtomicU64,
}

impl HostInner {
    fn get_terminal(&self, id: &str) -> Option<Arc<TerminalEntry>> {
        self.terminals.lock().get(id).cloned()
    }

    fn list(&self) -> Vec<PtySessionInfo> {
        let entries: Vec<Arc<TerminalEntry>> = self.terminals.lock().values().cloned().collect();
        let mut sessions: Vec<PtySessionInfo> = entries.iter().map(|entry| entry.info()).collect();
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    fn broadcast_sessions(&self) {
        let message = ServerMessage::Sessions {
            sessions: self.list(),
        };
        self.connections
            .lock()
            .retain(|_, subscriber| subscriber.send(message.clone()).is_ok());
    }

    fn send_to(&self, connection: ConnectionId, message: ServerMessage) {
        if let Some(subscriber) = self.connections.lock().get(&connection) {
            let _ = subscriber.send(message);
        }
    }

    fn subscriber(&self, connection: ConnectionId) -> Option<Subscriber> {
        self.connections.lock().get(&connection).cloned()
    }

    fn is_current(&self, entry: &Arc<TerminalEntry>) -> bool {
        self.terminals
            .lock()
            .get(&entry.id)
            .map(|current| Arc::ptr_eq(current, entry))
            .unwrap_or(false)
    }

    fn remove_if_current(&self, entry: &Arc<TerminalEntry>) -> bool {
        let mut terminals = self.terminals.lock();
        let current = terminals
            .get(&entry.id)
            .map(|current| Arc::ptr_eq(current, entry))
            .unwrap_or(false);
        if current {
            terminals.remove(&entry.id);
        }
        current
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn default_shell(config: &PtyHostConfig) -> String {
    config
        .shell
        .clone()
        .filter(|shell| !shell.trim().is_empty())
        .or_else(|| std::env::var("SHELL").ok().filter(|s| !s.trim().is_empty()))
        .unwrap_or_else(|| "/bin/sh".to_string())
}

fn default_cwd() -> String {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/"))
        .to_string_lossy()
        .to_string()
}

/// Registry of interactive terminals shared by every connected panel.
#[derive(Clone)]
pub struct PtyHost {
    inner: Arc<HostInner>,
}

impl Default for PtyHost {
    fn default() -> Self {
        Self::new(PtyHostConfig::default())
    }
}

impl PtyHost {
    pub fn new(config: PtyHostConfig) -> Self {
        Self {
            inner: Arc::new(HostInner {
                config,
                terminals: Mutex::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    /// Opens a duplex connection. Dropping the returned handle detaches it from
    /// every terminal it subscribed to.
    pub fn connect(&self) -> PtyConnection {
        let id = self.inner.next_connection.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.connections.lock().insert(id, tx);
        tracing::debug!("pty connection {id} opened");
        PtyConnection {
            id,
            host: self.clone(),
            events: rx,
        }
    }

    pub fn disconnect(&self, connection: ConnectionId) {
        self.inner.connections.lock().remove(&connection);
        let entries: Vec<Arc<TerminalEntry>> =
            self.inner.terminals.lock().values().cloned().collect();
        for entry in entries {
            entry.state.lock().subscribers.remove(&connection);
        }
        tracing::debug!("pty connection {connection} closed");
    }

    /// Dispatches one client message. Failures are reported to the issuing
    /// connection as `error` events.
    pub async fn handle(&self, connection: ConnectionId, message: ClientMessage) {
        let outcome = match message {
            ClientMessage::Spawn(options) => self.spawn(connection, options).await.map(|_| ()),
            ClientMessage::Input { id, data } => {
                self.input(&id, &data).await;
                Ok(())
            }
            ClientMessage::Resize { id, cols, rows } => {
                self.resize(&id, cols, rows).await;
                Ok(())
            }
            ClientMessage::Kill { id } => self.kill(&id).await.map(|_| ()),
            ClientMessage::Attach { id } => self.attach(connection, &id).await,
            ClientMessage::List => {
                let sessions = self.list();
                self.inner
                    .send_to(connection, ServerMessage::Sessions { sessions });
                Ok(())
            }
            ClientMessage::Rename { id, name } => self.rename(&id, &name).await,
        };

        if let Err(err) = outcome {
            let id = err.terminal_id().map(str::to_string);
            self.inner.send_to(
                connection,
                ServerMessage::Error {
                    id,
                    message: err.to_string(),
                },
            );
        }
    }

    fn configure_command(&self, opts: &SpawnOptions, cwd: &str) -> CommandBuilder {
        let mut cmd = match opts.command.as_deref().filter(|c| !c.trim().is_empty()) {
            Some(command) => {
                let mut cmd = CommandBuilder::new(command);
                cmd.args(&opts.args);
                cmd
            }
            None => {
                let shell = default_shell(&self.inner.config);
                let mut cmd = CommandBuilder::new(&shell);
                cmd.env("SHELL", &shell);
                if opts.args.is_empty() {
                    cmd.arg("-l");
                } else {
                    cmd.args(&opts.args);
                }
                cmd
            }
        };
        cmd.env("TERM", "xterm-256color");
        cmd.env("COLORTERM", "truecolor");
        if std::env::var_os("LANG").is_none() {
            cmd.env("LANG", "en_US.UTF-8");
        }
        cmd.cwd(cwd);
        cmd
    }

    /// Opens a pseudo-terminal and registers `connection` as its first subscriber.
    pub async fn spawn(&self, connection: ConnectionId, opts: SpawnOptions) -> Result<String> {
        let id = opts
            .id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let cwd = opts.cwd.clone().unwrap_or_else(default_cwd);

        let pty_system = NativePtySystem::default();
        let pair = pty_system
            .openpty(PtySize {
                rows: opts.rows,
                cols: opts.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyHostError::pty("open", e))?;

        let cmd = self.configure_command(&opts, &cwd);

        // Name and existence are decided under the registry lock so concurrent
        // spawns never share an id or a default name.
        let (entry, name, child, writer, input_rx) = {
            let mut terminals = self.inner.terminals.lock();
            if terminals.contains_key(&id) {
                return Err(PtyHostError::DuplicateTerminal(id));
            }
            let name = opts
                .name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| format!("Terminal {}", terminals.len() + 1));

            let child = pair
                .slave
                .spawn_command(cmd)
                .map_err(|e| PtyHostError::pty("spawn", e))?;
            let writer = pair
                .master
                .take_writer()
                .map_err(|e| PtyHostError::pty("writer", e))?;
            let (input_tx, input_rx) = mpsc::unbounded_channel();

            let mut subscribers = HashMap::new();
            if let Some(subscriber) = self.inner.subscriber(connection) {
                subscribers.insert(connection, subscriber);
            }

            let entry = Arc::new(TerminalEntry {
                id: id.clone(),
                cwd: cwd.clone(),
                created_at: now_millis(),
                pid: child.process_id(),
                exited: AtomicBool::new(false),
                state: Mutex::new(EntryState {
                    name: name.clone(),
                    status: PtyStatus::Running,
                    exit_code: None,
                    cols: opts.cols,
                    rows: opts.rows,
                    scrollback: Scrollback::new(
                        self.inner.config.scrollback_max_chars,
                        self.inner.config.scrollback_trim_chars,
                    ),
                    subscribers,
                }),
                input: Mutex::new(Some(input_tx)),
                master: Mutex::new(pair.master),
                killer: Mutex::new(child.clone_killer()),
            });
            terminals.insert(id.clone(), Arc::clone(&entry));
            (entry, name, child, writer, input_rx)
        };
        drop(pair.slave);

        self.inner.send_to(
            connection,
            ServerMessage::Spawned {
                id: id.clone(),
                name,
            },
        );

        let reader = entry
            .master
            .lock()
            .try_clone_reader()
            .map_err(|e| PtyHostError::pty("reader", e))?;
        spawn_writer(&entry, writer, input_rx);
        self.start_io(Arc::clone(&entry), reader, child);

        tracing::info!("spawned terminal {id} in {cwd}");
        self.inner.broadcast_sessions();
        Ok(id)
    }

    fn start_io(
        &self,
        entry: Arc<TerminalEntry>,
        mut reader: Box<dyn Read + Send>,
        mut child: Box<dyn portable_pty::Child + Send>,
    ) {
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();

        let reader_entry = Arc::clone(&entry);
        tokio::task::spawn_blocking(move || {
            let mut decoder = Utf8Stream::new();
            let mut buffer = vec![0u8; CHUNK_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => reader_entry.publish_output(decoder.decode(&buffer[..n])),
                    Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(err) => {
                        tracing::debug!("terminal {} read ended: {err}", reader_entry.id);
                        break;
                    }
                }
            }
            if let Some(rest) = decoder.finish() {
                reader_entry.publish_output(rest);
            }
            let _ = done_tx.send(());
        });

        let weak_host = Arc::downgrade(&self.inner);
        let runtime = Handle::current();
        tokio::task::spawn_blocking(move || {
            let exit_code = match child.wait() {
                Ok(status) => Some(status.exit_code() as i32),
                Err(err) => {
                    tracing::warn!("failed to wait on terminal {}: {err}", entry.id);
                    None
                }
            };
            // Let the reader drain so the exit event trails the last output.
            let _ = done_rx.recv_timeout(READER_DRAIN_TIMEOUT);
            entry.publish_exit(exit_code);
            tracing::info!("terminal {} exited with {exit_code:?}", entry.id);

            let Some(host) = weak_host.upgrade() else {
                return;
            };
            if !host.is_current(&entry) {
                return;
            }
            host.broadcast_sessions();

            let retention = host.config.exited_retention;
            drop(host);
            runtime.spawn(async move {
                tokio::time::sleep(retention).await;
                if let Some(host) = weak_host.upgrade() {
                    if host.remove_if_current(&entry) {
                        tracing::debug!("dropped exited terminal {}", entry.id);
                        host.broadcast_sessions();
                    }
                }
            });
        });
    }

    /// Queues input for a running terminal and returns without waiting for the
    /// write. Unknown or exited terminals are ignored.
    pub async fn input(&self, id: &str, data: &str) {
        let Some(entry) = self.inner.get_terminal(id) else {
            tracing::debug!("input for unknown terminal {id} ignored");
            return;
        };
        if !entry.is_running() {
            return;
        }
        if !entry.enqueue_input(data.as_bytes()) {
            tracing::debug!("input for terminal {id} dropped; writer closed");
        }
    }

    /// Resizes a running terminal. Unknown or exited terminals are ignored.
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) {
        let Some(entry) = self.inner.get_terminal(id) else {
            return;
        };
        if !entry.is_running() {
            return;
        }
        if let Err(err) = entry.resize(cols, rows) {
            tracing::warn!("failed to resize terminal {id}: {err}");
        }
    }

    /// Terminates and forgets a terminal. Returns `false` when the id is unknown,
    /// which makes a repeated kill a no-op.
    pub async fn kill(&self, id: &str) -> Result<bool> {
        let Some(entry) = self.inner.terminals.lock().remove(id) else {
            tracing::debug!("kill for unknown terminal {id}");
            return Ok(false);
        };
        entry.close_input();
        spawn_forced_kill(&entry, self.inner.config.kill_grace);
        tracing::info!("killed terminal {id}");
        self.inner.broadcast_sessions();
        Ok(true)
    }

    pub async fn attach(&self, connection: ConnectionId, id: &str) -> Result<()> {
        let entry = self
            .inner
            .get_terminal(id)
            .ok_or_else(|| PtyHostError::UnknownTerminal(id.to_string()))?;
        let subscriber = self
            .inner
            .subscriber(connection)
            .ok_or_else(|| PtyHostError::ConnectionClosed(connection))?;
        entry.attach(connection, subscriber);
        Ok(())
    }

    pub async fn rename(&self, id: &str, name: &str) -> Result<()> {
        let entry = self
            .inner
            .get_terminal(id)
            .ok_or_else(|| PtyHostError::UnknownTerminal(id.to_string()))?;
        entry.state.lock().name = name.to_string();
        self.inner.broadcast_sessions();
        Ok(())
    }

    pub fn list(&self) -> Vec<PtySessionInfo> {
        self.inner.list()
    }

    pub fn session_count(&self) -> usize {
        self.inner.terminals.lock().len()
    }

    /// Kills every terminal; used on shutdown. Returns how many were running.
    pub async fn kill_all(&self) -> usize {
        let entries: Vec<Arc<TerminalEntry>> =
            self.inner.terminals.lock().drain().map(|(_, e)| e).collect();
        let count = entries.iter().filter(|entry| entry.is_running()).count();
        for entry in &entries {
            entry.close_input();
            spawn_forced_kill(entry, self.inner.config.kill_grace);
        }
        if !entries.is_empty() {
            self.inner.broadcast_sessions();
        }
        count
    }
}

/// Drains queued input into the pty master off the async runtime. A write
/// blocks while the program is not reading, so it never runs on a worker.
fn spawn_writer(
    entry: &Arc<TerminalEntry>,
    mut writer: Box<dyn Write + Send>,
    mut queue: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    let weak = Arc::downgrade(entry);
    tokio::task::spawn_blocking(move || {
        while let Some(chunk) = queue.blocking_recv() {
            let Some(entry) = weak.upgrade() else {
                break;
            };
            if !entry.input_open() {
                break;
            }
            drop(entry);
            if let Err(err) = writer.write_all(&chunk).and_then(|()| writer.flush()) {
                tracing::debug!("pty writer stopped: {err}");
                break;
            }
        }
    });
}

/// Sends SIGTERM and escalates to a hard kill once `grace` elapses without an exit.
fn spawn_forced_kill(entry: &Arc<TerminalEntry>, grace: Duration) {
    if entry.exited.load(Ordering::SeqCst) {
        return;
    }

    #[cfg(unix)]
    let signalled = entry
        .pid
        .map(|pid| unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) } == 0)
        .unwrap_or(false);
    #[cfg(not(unix))]
    let signalled = false;

    if !signalled {
        if let Err(err) = entry.killer.lock().kill() {
            tracing::debug!("failed to kill terminal process {}: {err}", entry.id);
        }
        return;
    }

    let weak = Arc::downgrade(entry);
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        let Some(entry) = weak.upgrade() else {
            return;
        };
        if entry.exited.load(Ordering::SeqCst) {
            return;
        }
        tracing::debug!("terminal {} ignored SIGTERM; forcing kill", entry.id);
        force_kill(&entry);
    });
}

fn force_kill(entry: &TerminalEntry) {
    #[cfg(unix)]
    if let Some(pid) = entry.pid {
        if unsafe { libc::kill(pid as libc::pid_t, libc::SIGKILL) } == 0 {
            return;
        }
    }
    if let Err(err) = entry.killer.lock().kill() {
        tracing::debug!("forced kill of terminal {} failed: {err}", entry.id);
    }
}

/// One panel's side of the shared duplex channel.
pub struct PtyConnection {
    id: ConnectionId,
    host: PtyHost,
    events: mpsc::UnboundedReceiver<ServerMessage>,
}

impl PtyConnection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub async fn send(&self, message: ClientMessage) {
        self.host.handle(self.id, message).await;
    }

    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ServerMessage> {
        self.events.try_recv().ok()
    }
}

impl Drop for PtyConnection {
    fn drop(&mut self) {
        self.host.disconnect(self.id);
    }
}
