use super::line_buffer::LineBuffer;
use super::throttle::{FlushThrottle, ThrottleDecision};
use super::TailError;
use crate::infrastructure::events::SwitchyardEvent;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};

const EVENT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TailSettings {
    pub throttle: Duration,
    pub poll: Duration,
    pub heartbeat: Duration,
}

impl Default for TailSettings {
    fn default() -> Self {
        Self {
            throttle: Duration::from_millis(150),
            poll: Duration::from_millis(500),
            heartbeat: Duration::from_secs(15),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum TailEvent {
    /// Sent on open and again whenever the file shrinks.
    Init { offset: u64 },
    /// `offset` is the end of the last delivered line.
    Lines { lines: Vec<String>, offset: u64 },
    Heartbeat,
    Error { message: String },
}

impl TailEvent {
    pub fn event(&self) -> SwitchyardEvent {
        match self {
            TailEvent::Init { .. } => SwitchyardEvent::Init,
            TailEvent::Lines { .. } => SwitchyardEvent::Lines,
            TailEvent::Heartbeat => SwitchyardEvent::Heartbeat,
            TailEvent::Error { .. } => SwitchyardEvent::Error,
        }
    }
}

/// Read position in an append-only file.
#[derive(Debug)]
pub struct TailCursor {
    path: PathBuf,
    offset: u64,
    buffer: LineBuffer,
}

async fn current_size(path: &Path) -> std::io::Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(err) => Err(err),
    }
}

impl TailCursor {
    /// Starts at the current end of the file (0 if it does not exist yet).
    pub async fn open(path: PathBuf) -> std::io::Result<Self> {
        let offset = current_size(&path).await?;
        Ok(Self::at(path, offset))
    }

    pub fn at(path: PathBuf, offset: u64) -> Self {
        Self {
            path,
            offset,
            buffer: LineBuffer::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes consumed so far, including any held-back fragment.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Reads whatever was appended since the last call.
    pub async fn flush(&mut self) -> std::io::Result<Vec<TailEvent>> {
        let size = current_size(&self.path).await?;

        if size < self.offset {
            log::debug!(
                "{} shrank from {} to {size} bytes; resetting tail",
                self.path.display(),
                self.offset
            );
            self.offset = size;
            self.buffer.clear();
            return Ok(vec![TailEvent::Init { offset: size }]);
        }

        if size == self.offset {
            return Ok(self
                .buffer
                .take_complete()
                .map(|line| TailEvent::Lines {
                    lines: vec![line],
                    offset: self.offset,
                })
                .into_iter()
                .collect());
        }

        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut bytes = Vec::with_capacity((size - self.offset) as usize);
        (&mut file)
            .take(size - self.offset)
            .read_to_end(&mut bytes)
            .await?;
        self.offset += bytes.len() as u64;

        let lines = self.buffer.push(&bytes);
        if lines.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![TailEvent::Lines {
            lines,
            offset: self.offset - self.buffer.pending_len() as u64,
        }])
    }
}

/// Live feed for one subscriber. Dropping it stops the watcher and every timer.
pub struct TailHandle {
    events: mpsc::Receiver<TailEvent>,
    task: JoinHandle<()>,
}

impl TailHandle {
    pub async fn recv(&mut self) -> Option<TailEvent> {
        self.events.recv().await
    }

    pub fn close(self) {}
}

impl Drop for TailHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

pub async fn open_tail(path: PathBuf, settings: TailSettings) -> Result<TailHandle, TailError> {
    let cursor = TailCursor::open(path).await?;
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let task = tokio::spawn(run_tail(cursor, settings, tx));
    Ok(TailHandle { events: rx, task })
}

/// Watches the parent directory so a file created after the tail opens is seen.
fn watch_file(path: &Path, changes: mpsc::Sender<()>) -> Result<RecommendedWatcher, TailError> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let file_name = path.file_name().map(|name| name.to_os_string());

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        match res {
            Ok(event) => {
                if event
                    .paths
                    .iter()
                    .any(|changed| changed.file_name() == file_name.as_deref())
                {
                    // A full channel already guarantees a pending flush.
                    let _ = changes.try_send(());
                }
            }
            Err(err) => log::debug!("Tail watcher error: {err}"),
        }
    })?;
    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    Ok(watcher)
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn deliver(cursor: &mut TailCursor, tx: &mpsc::Sender<TailEvent>) -> bool {
    match cursor.flush().await {
        Ok(events) => {
            for event in events {
                if tx.send(event).await.is_err() {
                    return false;
                }
            }
            true
        }
        Err(err) => {
            log::warn!("Failed to read {}: {err}", cursor.path().display());
            tx.send(TailEvent::Error {
                message: format!("failed to read {}: {err}", cursor.path().display()),
            })
            .await
            .is_ok()
        }
    }
}

async fn run_tail(mut cursor: TailCursor, settings: TailSettings, tx: mpsc::Sender<TailEvent>) {
    if tx
        .send(TailEvent::Init {
            offset: cursor.offset(),
        })
        .await
        .is_err()
    {
        return;
    }

    let (change_tx, mut change_rx) = mpsc::channel::<()>(1);
    let _watcher = match watch_file(cursor.path(), change_tx) {
        Ok(watcher) => Some(watcher),
        Err(err) => {
            log::warn!(
                "Watching {} failed, falling back to polling: {err}",
                cursor.path().display()
            );
            None
        }
    };
    let mut watching = _watcher.is_some();

    let mut throttle = FlushThrottle::new(settings.throttle);
    let start = Instant::now();
    let mut poll = interval_at(start + settings.poll, settings.poll);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut heartbeat = interval_at(start + settings.heartbeat, settings.heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let deadline = throttle.next_deadline();
        let flush = tokio::select! {
            _ = tx.closed() => break,
            change = change_rx.recv(), if watching => match change {
                Some(()) => throttle.on_change(Instant::now()) == ThrottleDecision::FlushNow,
                None => {
                    watching = false;
                    false
                }
            },
            _ = wait_for(deadline) => {
                throttle.on_deadline(Instant::now());
                true
            }
            _ = poll.tick() => true,
            _ = heartbeat.tick() => {
                if tx.send(TailEvent::Heartbeat).await.is_err() {
                    break;
                }
                false
            }
        };
        if flush && !deliver(&mut cursor, &tx).await {
            break;
        }
    }
    log::debug!("Tail of {} closed", cursor.path().display());
}
