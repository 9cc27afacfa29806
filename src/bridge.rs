//! JSON-lines transport: one request per input line, one `{"event","data"}`
//! envelope per output line. Closing the input releases every process,
//! terminal and stream the session opened.

use crate::domains::agents::{ImageAttachment, LaunchOptions, OneShotRequest, SendRequest};
use crate::domains::tail::{SubagentWatchHandle, TailHandle};
use crate::domains::undo::UndoOperation;
use crate::infrastructure::events::{emit_event, EventSink, SwitchyardEvent};
use crate::services::{Orchestrator, OrchestratorError};
use anyhow::Context;
use pty_host::{ClientMessage, ConnectionId, PtyConnection};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BridgeRequest {
    #[serde(rename_all = "camelCase")]
    Send {
        session_id: String,
        text: String,
        #[serde(default)]
        images: Vec<ImageAttachment>,
        cwd: PathBuf,
        #[serde(default)]
        launch: LaunchOptions,
    },
    #[serde(rename_all = "camelCase")]
    Stop { session_id: String },
    #[serde(rename_all = "camelCase")]
    CreateSession {
        prompt: String,
        cwd: PathBuf,
        #[serde(default)]
        launch: LaunchOptions,
        #[serde(default)]
        session_id: Option<String>,
    },
    ListProcesses,
    Terminal { message: ClientMessage },
    Tail { path: PathBuf },
    Untail { path: PathBuf },
    #[serde(rename_all = "camelCase")]
    WatchSubagents {
        parent_log: PathBuf,
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Unwatch { session_id: String },
    ApplyUndo { operations: Vec<UndoOperation> },
    CaptureInverse { operations: Vec<UndoOperation> },
    #[serde(rename_all = "camelCase")]
    SaveUndoState { session_id: String, state: Value },
    #[serde(rename_all = "camelCase")]
    LoadUndoState { session_id: String },
    Shutdown,
}

#[derive(Debug, Deserialize)]
struct RequestFrame {
    #[serde(default)]
    id: Option<Value>,
    #[serde(flatten)]
    request: BridgeRequest,
}

struct LineSink {
    tx: mpsc::UnboundedSender<Value>,
}

impl EventSink for LineSink {
    fn emit(&self, envelope: Value) {
        // The writer is gone once the output side closed.
        let _ = self.tx.send(envelope);
    }
}

fn emit(sink: &dyn EventSink, event: SwitchyardEvent, payload: &impl Serialize) {
    if let Err(e) = emit_event(sink, event, payload) {
        log::error!("Failed to serialize {} event: {e}", event.as_str());
    }
}

fn reply<T: Serialize>(sink: &dyn EventSink, id: &Option<Value>, outcome: Result<T, OrchestratorError>) {
    let data = match outcome {
        Ok(value) => json!({ "id": id, "ok": true, "value": value }),
        Err(error) => {
            log::debug!("Request {id:?} failed: {error}");
            json!({ "id": id, "ok": false, "error": error.payload() })
        }
    };
    emit(sink, SwitchyardEvent::Result, &data);
}

async fn write_events<W>(mut rx: mpsc::UnboundedReceiver<Value>, mut writer: W) -> std::io::Result<W>
where
    W: AsyncWrite + Unpin,
{
    while let Some(envelope) = rx.recv().await {
        let mut line = envelope.to_string();
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;
    }
    Ok(writer)
}

fn forward_terminal(mut connection: PtyConnection, sink: Arc<dyn EventSink>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = connection.recv().await {
            emit(&*sink, SwitchyardEvent::for_terminal(&message), &message);
        }
    })
}

fn forward_tail(mut handle: TailHandle, path: PathBuf, sink: Arc<dyn EventSink>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let path = path.to_string_lossy().into_owned();
        while let Some(event) = handle.recv().await {
            let mut data = match serde_json::to_value(&event) {
                Ok(data) => data,
                Err(e) => {
                    log::error!("Failed to serialize tail event: {e}");
                    continue;
                }
            };
            data["path"] = Value::String(path.clone());
            emit(&*sink, event.event(), &data);
        }
    })
}

/// State owned by one connected consumer.
struct BridgeSession {
    orchestrator: Arc<Orchestrator>,
    sink: Arc<dyn EventSink>,
    terminal: ConnectionId,
    terminal_forward: JoinHandle<()>,
    tails: HashMap<PathBuf, JoinHandle<()>>,
    watches: HashMap<String, SubagentWatchHandle>,
    requests: JoinSet<()>,
}

impl BridgeSession {
    fn new(orchestrator: Arc<Orchestrator>, sink: Arc<dyn EventSink>) -> Self {
        let connection = orchestrator.connect_terminal();
        let terminal = connection.id();
        let terminal_forward = forward_terminal(connection, Arc::clone(&sink));
        Self {
            orchestrator,
            sink,
            terminal,
            terminal_forward,
            tails: HashMap::new(),
            watches: HashMap::new(),
            requests: JoinSet::new(),
        }
    }

    /// Returns `false` once the consumer asked to shut down.
    async fn handle(&mut self, frame: RequestFrame) -> bool {
        let id = frame.id;
        let sink = &*self.sink;
        match frame.request {
            BridgeRequest::Send {
                session_id,
                text,
                images,
                cwd,
                launch,
            } => {
                let orchestrator = Arc::clone(&self.orchestrator);
                let sink = Arc::clone(&self.sink);
                self.requests.spawn(async move {
                    let outcome = orchestrator
                        .send_message(SendRequest {
                            session_id,
                            text,
                            images,
                            cwd,
                            launch,
                        })
                        .await;
                    reply(&*sink, &id, outcome);
                });
            }
            BridgeRequest::Stop { session_id } => {
                let stopped = self.orchestrator.stop_session(&session_id);
                reply(sink, &id, Ok(json!({ "stopped": stopped })));
            }
            BridgeRequest::CreateSession {
                prompt,
                cwd,
                launch,
                session_id,
            } => {
                let orchestrator = Arc::clone(&self.orchestrator);
                let sink = Arc::clone(&self.sink);
                self.requests.spawn(async move {
                    let outcome = orchestrator
                        .create_session(OneShotRequest {
                            prompt,
                            cwd,
                            launch,
                            session_id,
                        })
                        .await;
                    reply(&*sink, &id, outcome);
                });
            }
            BridgeRequest::ListProcesses => {
                reply(sink, &id, Ok(self.orchestrator.processes()));
            }
            BridgeRequest::Terminal { message } => {
                self.orchestrator.pty().handle(self.terminal, message).await;
            }
            BridgeRequest::Tail { path } => match self.orchestrator.open_tail(path.clone()).await {
                Ok(handle) => {
                    let forward = forward_tail(handle, path.clone(), Arc::clone(&self.sink));
                    if let Some(previous) = self.tails.insert(path.clone(), forward) {
                        previous.abort();
                    }
                    reply(sink, &id, Ok(json!({ "path": path })));
                }
                Err(error) => reply::<Value>(sink, &id, Err(error)),
            },
            BridgeRequest::Untail { path } => {
                let closed = self.tails.remove(&path).map(|task| task.abort()).is_some();
                reply(sink, &id, Ok(json!({ "closed": closed })));
            }
            BridgeRequest::WatchSubagents {
                parent_log,
                session_id,
            } => {
                let handle = self
                    .orchestrator
                    .watch_subagents(parent_log, session_id.clone());
                self.watches.insert(session_id.clone(), handle);
                reply(sink, &id, Ok(json!({ "sessionId": session_id })));
            }
            BridgeRequest::Unwatch { session_id } => {
                let closed = self.watches.remove(&session_id).is_some();
                reply(sink, &id, Ok(json!({ "closed": closed })));
            }
            BridgeRequest::ApplyUndo { operations } => {
                let data = match self.orchestrator.apply_undo(&operations).await {
                    Ok(success) => json!({ "id": id, "ok": true, "value": success }),
                    Err(failure) => json!({
                        "id": id,
                        "ok": false,
                        "error": failure.error.payload(),
                        "rolledBack": failure.rolled_back,
                    }),
                };
                emit(sink, SwitchyardEvent::Result, &data);
            }
            BridgeRequest::CaptureInverse { operations } => {
                let outcome = self.orchestrator.capture_inverse(&operations).await;
                reply(sink, &id, outcome);
            }
            BridgeRequest::SaveUndoState { session_id, state } => {
                let outcome = self.orchestrator.save_undo_state(&session_id, &state).await;
                reply(sink, &id, outcome.map(|()| json!({ "saved": true })));
            }
            BridgeRequest::LoadUndoState { session_id } => {
                let outcome = self.orchestrator.load_undo_state(&session_id).await;
                reply(sink, &id, outcome);
            }
            BridgeRequest::Shutdown => {
                let report = self.orchestrator.shutdown().await;
                reply(sink, &id, Ok(report));
                return false;
            }
        }
        true
    }

    async fn close(mut self) {
        for (_, task) in self.tails.drain() {
            task.abort();
        }
        self.watches.clear();
        self.orchestrator.shutdown().await;
        while let Some(joined) = self.requests.join_next().await {
            if let Err(e) = joined {
                log::warn!("Bridge request task failed: {e}");
            }
        }
        self.terminal_forward.abort();
    }
}

/// Serves requests from `reader` until it reaches EOF or a `shutdown`
/// request, then tears everything down and returns the writer.
pub async fn serve<R, W>(orchestrator: Arc<Orchestrator>, reader: R, writer: W) -> anyhow::Result<W>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_events(rx, writer));
    let sink: Arc<dyn EventSink> = Arc::new(LineSink { tx });
    let mut session = BridgeSession::new(orchestrator, Arc::clone(&sink));

    let mut lines = reader.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::warn!("Bridge input failed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let frame: RequestFrame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Rejected bridge request: {e}");
                emit(
                    &*sink,
                    SwitchyardEvent::Error,
                    &json!({ "message": format!("invalid request: {e}") }),
                );
                continue;
            }
        };
        if !session.handle(frame).await {
            break;
        }
    }

    log::info!("Bridge input closed; releasing resources");
    session.close().await;
    drop(sink);
    writer_task
        .await
        .context("event writer task panicked")?
        .context("failed to write events")
}
