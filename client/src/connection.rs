//! One spawned language-server process and its transport tasks.
//!
//! A [`Connection`] owns the child process, a writer task feeding its
//! stdin, and a reader task draining its stdout. The reader applies the
//! session's [`ErrorHandler`] policy frame by frame; connection closure
//! is reported as a [`SessionEvent::Closed`] and left for the session to
//! act on.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, oneshot};

use crate::codec::{MessageReader, MessageWriter};
use crate::errors::{ErrorAction, ErrorHandler, ProtocolError, StartError};
use crate::output::OutputChannel;
use crate::protocol::{self, Notification, PublishDiagnosticsParams, Request};
use crate::types::{CloseReason, FileEvent, SessionConfig, SessionEvent};

/// How long a request (`initialize`, diagnostic pulls) may stay pending.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How long `shutdown` waits for the server to acknowledge the request.
const SHUTDOWN_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for the process to exit before killing it.
const PROCESS_EXIT_TIMEOUT: Duration = Duration::from_secs(2);

const WRITER_QUEUE_CAPACITY: usize = 64;

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>>;

enum WriterCommand {
    Send(serde_json::Value),
    Close,
}

/// Cloneable handle for sending frames and correlating responses.
/// Shared between the connection, the handshake task, and pull tasks.
#[derive(Clone)]
struct Outbound {
    writer_tx: mpsc::Sender<WriterCommand>,
    next_id: Arc<AtomicU64>,
    pending: PendingMap,
}

impl Outbound {
    async fn request(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
        timeout: Duration,
    ) -> Result<serde_json::Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let frame = serde_json::to_value(Request::new(id, method, params))
            .context("encoding request")?;
        if self.writer_tx.send(WriterCommand::Send(frame)).await.is_err() {
            self.pending.lock().await.remove(&id);
            bail!("writer task gone");
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(body)) => Ok(body),
            Ok(Err(_)) => {
                self.pending.lock().await.remove(&id);
                bail!("reader task gone before '{method}' completed");
            }
            Err(_) => {
                self.pending.lock().await.remove(&id);
                bail!("'{method}' timed out");
            }
        }
    }

    async fn notify(
        &self,
        method: &'static str,
        params: Option<serde_json::Value>,
    ) -> Result<()> {
        let frame = serde_json::to_value(Notification::new(method, params))
            .context("encoding notification")?;
        self.writer_tx
            .send(WriterCommand::Send(frame))
            .await
            .map_err(|_| anyhow::anyhow!("writer task gone"))
    }
}

/// Incoming frames fall into three JSON-RPC shapes.
enum Incoming {
    Response {
        id: u64,
        body: serde_json::Value,
    },
    ServerRequest {
        id: serde_json::Value,
        method: String,
    },
    Notification {
        method: String,
        params: Option<serde_json::Value>,
    },
}

fn classify(frame: &serde_json::Value) -> Option<Incoming> {
    let id = frame.get("id");
    let method = frame.get("method").and_then(|m| m.as_str());
    let is_reply = frame.get("result").is_some() || frame.get("error").is_some();

    match (id, method, is_reply) {
        (Some(id), None, true) => Some(Incoming::Response {
            id: id.as_u64()?,
            body: frame.clone(),
        }),
        (Some(id), Some(method), _) => Some(Incoming::ServerRequest {
            id: id.clone(),
            method: method.to_string(),
        }),
        (None, Some(method), _) => Some(Incoming::Notification {
            method: method.to_string(),
            params: frame.get("params").cloned(),
        }),
        _ => None,
    }
}

/// Frame-by-frame state of the reader task. Separated from the I/O loop
/// so policy behavior is testable against fake channels.
struct Dispatcher {
    pending: PendingMap,
    event_tx: mpsc::Sender<SessionEvent>,
    writer_tx: mpsc::Sender<WriterCommand>,
    output: OutputChannel,
    handler: Arc<dyn ErrorHandler>,
    /// Running protocol-error count, reported to the handler. No cap.
    errors: u32,
}

impl Dispatcher {
    /// Apply the error policy to one failed exchange.
    async fn protocol_error(
        &mut self,
        error: &ProtocolError,
        message: Option<&serde_json::Value>,
    ) -> ErrorAction {
        self.errors = self.errors.saturating_add(1);
        let action = self.handler.error(error, message, self.errors);
        let _ = self
            .event_tx
            .send(SessionEvent::ProtocolError { count: self.errors })
            .await;
        action
    }

    async fn handle_frame(&mut self, frame: &serde_json::Value) -> ErrorAction {
        let Some(incoming) = classify(frame) else {
            return self
                .protocol_error(&ProtocolError::UnrecognizedMessage, Some(frame))
                .await;
        };

        match incoming {
            Incoming::Response { id, body } => {
                if let Some(tx) = self.pending.lock().await.remove(&id) {
                    let _ = tx.send(body);
                } else {
                    tracing::debug!("response for unknown request id {id}");
                }
            }
            Incoming::ServerRequest { id, method } => {
                // Answer everything we don't implement, or the server
                // may block waiting on us.
                self.output.trace(&format!("<-- request {method} (unsupported)"));
                let reply = serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": -32601,
                        "message": format!("method not found: {method}")
                    }
                });
                let _ = self.writer_tx.send(WriterCommand::Send(reply)).await;
            }
            Incoming::Notification { method, params } => {
                self.handle_notification(&method, params).await;
            }
        }
        ErrorAction::Continue
    }

    async fn handle_notification(&mut self, method: &str, params: Option<serde_json::Value>) {
        match method {
            "textDocument/publishDiagnostics" => {
                let Some(params) = params else { return };
                match serde_json::from_value::<PublishDiagnosticsParams>(params) {
                    Ok(published) => {
                        let Some(path) = protocol::file_uri_to_path(&published.uri) else {
                            tracing::debug!(uri = %published.uri, "diagnostics for non-file URI");
                            return;
                        };
                        self.output.trace(&format!(
                            "<-- publishDiagnostics {} ({} items)",
                            published.uri,
                            published.diagnostics.len()
                        ));
                        let items = published
                            .diagnostics
                            .into_iter()
                            .map(protocol::WireDiagnostic::into_diagnostic)
                            .collect();
                        let _ = self
                            .event_tx
                            .send(SessionEvent::Diagnostics { path, items })
                            .await;
                    }
                    Err(e) => {
                        let _ = self
                            .protocol_error(
                                &ProtocolError::Transport(format!(
                                    "bad publishDiagnostics payload: {e}"
                                )),
                                None,
                            )
                            .await;
                    }
                }
            }
            "window/logMessage" => {
                let text = params
                    .as_ref()
                    .and_then(|p| p.get("message"))
                    .and_then(|m| m.as_str())
                    .unwrap_or_default();
                self.output.append(text);
            }
            _ => {
                self.output.trace(&format!("<-- {method} (ignored)"));
            }
        }
    }

    async fn closed(&self, reason: CloseReason) {
        let _ = self.event_tx.send(SessionEvent::Closed { reason }).await;
    }
}

/// A live (or recently live) server process.
pub(crate) struct Connection {
    child: Child,
    outbound: Outbound,
    event_tx: mpsc::Sender<SessionEvent>,
    output: OutputChannel,
    /// URIs we have sent `didOpen` for.
    opened: HashSet<String>,
    versions: HashMap<String, i32>,
    #[allow(dead_code)]
    reader_task: tokio::task::JoinHandle<()>,
    #[allow(dead_code)]
    writer_task: tokio::task::JoinHandle<()>,
}

impl Connection {
    /// Resolve, spawn, and wire up the server process. Returns as soon as
    /// the transport tasks are running; the `initialize` handshake
    /// proceeds on a background task and readiness is never awaited here.
    pub(crate) fn start(
        config: &SessionConfig,
        workspace_root: &Path,
        event_tx: mpsc::Sender<SessionEvent>,
        output: OutputChannel,
        handler: Arc<dyn ErrorHandler>,
    ) -> Result<Self, StartError> {
        let command = &config.server.command;
        let resolved = which::which(command).map_err(|source| StartError::NotFound {
            command: command.clone(),
            source,
        })?;

        // stderr stays inherited: it is the server's own logging surface.
        let mut child = Command::new(&resolved)
            .args(&config.server.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| StartError::Spawn {
                command: command.clone(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(StartError::MissingPipe {
            command: command.clone(),
            pipe: "stdin",
        })?;
        let stdout = child.stdout.take().ok_or(StartError::MissingPipe {
            command: command.clone(),
            pipe: "stdout",
        })?;

        let (writer_tx, mut writer_rx) = mpsc::channel::<WriterCommand>(WRITER_QUEUE_CAPACITY);
        let writer_output = output.clone();
        let writer_task = tokio::spawn(async move {
            let mut writer = MessageWriter::new(stdin);
            while let Some(command) = writer_rx.recv().await {
                match command {
                    WriterCommand::Send(frame) => {
                        if let Some(method) = frame.get("method").and_then(|m| m.as_str()) {
                            writer_output.trace(&format!("--> {method}"));
                        }
                        if let Err(e) = writer.write_message(&frame).await {
                            writer_output.warn(&format!("write to server failed: {e:#}"));
                            break;
                        }
                    }
                    WriterCommand::Close => break,
                }
            }
        });

        let outbound = Outbound {
            writer_tx: writer_tx.clone(),
            next_id: Arc::new(AtomicU64::new(1)),
            pending: Arc::new(Mutex::new(HashMap::new())),
        };

        let mut dispatcher = Dispatcher {
            pending: outbound.pending.clone(),
            event_tx: event_tx.clone(),
            writer_tx,
            output: output.clone(),
            handler,
            errors: 0,
        };
        let reader_task = tokio::spawn(async move {
            let mut reader = MessageReader::new(stdout);
            loop {
                match reader.read_message().await {
                    Ok(Some(frame)) => {
                        if dispatcher.handle_frame(&frame).await == ErrorAction::Shutdown {
                            dispatcher
                                .closed(CloseReason::Failed("error policy gave up".to_string()))
                                .await;
                            break;
                        }
                    }
                    Ok(None) => {
                        dispatcher.closed(CloseReason::Exited).await;
                        break;
                    }
                    Err(e) => {
                        // An I/O failure means the channel itself is gone;
                        // only parse-level failures are per-message errors
                        // the Continue policy can ride out.
                        if e.chain().any(|c| c.downcast_ref::<std::io::Error>().is_some()) {
                            dispatcher
                                .closed(CloseReason::Failed(format!("{e:#}")))
                                .await;
                            break;
                        }
                        let error = ProtocolError::Transport(format!("{e:#}"));
                        if dispatcher.protocol_error(&error, None).await == ErrorAction::Shutdown {
                            dispatcher.closed(CloseReason::Failed(error.to_string())).await;
                            break;
                        }
                    }
                }
            }
        });

        let connection = Self {
            child,
            outbound,
            event_tx,
            output: output.clone(),
            opened: HashSet::new(),
            versions: HashMap::new(),
            reader_task,
            writer_task,
        };
        connection.spawn_handshake(config, workspace_root);
        Ok(connection)
    }

    fn spawn_handshake(&self, config: &SessionConfig, workspace_root: &Path) {
        let root_uri = match protocol::path_to_file_uri(workspace_root) {
            Ok(uri) => uri.to_string(),
            Err(e) => {
                self.output.error(&format!("cannot initialize: {e}"));
                return;
            }
        };
        let params = protocol::initialize_params(
            &root_uri,
            &config.display_name,
            config.initialization_options.as_ref(),
        );
        let outbound = self.outbound.clone();
        let output = self.output.clone();
        tokio::spawn(async move {
            match outbound.request("initialize", Some(params), REQUEST_TIMEOUT).await {
                Ok(body) => {
                    if let Some(error) = body.get("error") {
                        output.error(&format!(
                            "initialize rejected: {}",
                            error["message"].as_str().unwrap_or("unknown error")
                        ));
                        return;
                    }
                    if outbound
                        .notify("initialized", Some(serde_json::json!({})))
                        .await
                        .is_ok()
                    {
                        output.append("language server initialized");
                    }
                }
                Err(e) => output.error(&format!("initialize failed: {e:#}")),
            }
        });
    }

    /// `didOpen` on first contact with a URI, `didChange` with a bumped
    /// version after that.
    pub(crate) async fn document_changed(
        &mut self,
        uri: &str,
        language_id: &str,
        text: &str,
    ) -> Result<()> {
        if self.opened.contains(uri) {
            let version = self.versions.entry(uri.to_string()).or_insert(1);
            *version += 1;
            self.outbound
                .notify(
                    "textDocument/didChange",
                    Some(protocol::did_change_params(uri, *version, text)),
                )
                .await
        } else {
            self.opened.insert(uri.to_string());
            self.versions.insert(uri.to_string(), 1);
            self.outbound
                .notify(
                    "textDocument/didOpen",
                    Some(protocol::did_open_params(uri, language_id, 1, text)),
                )
                .await
        }
    }

    pub(crate) async fn document_saved(&self, uri: &str) -> Result<()> {
        self.outbound
            .notify("textDocument/didSave", Some(protocol::did_save_params(uri)))
            .await
    }

    pub(crate) async fn watched_file_changed(&self, uri: &str, event: &FileEvent) -> Result<()> {
        self.outbound
            .notify(
                "workspace/didChangeWatchedFiles",
                Some(protocol::watched_files_params(uri, event)),
            )
            .await
    }

    /// Fire a `textDocument/diagnostic` pull; the full report (if any)
    /// comes back as a `SessionEvent::Diagnostics`.
    pub(crate) fn pull_diagnostics(&self, uri: String, path: std::path::PathBuf) {
        let outbound = self.outbound.clone();
        let event_tx = self.event_tx.clone();
        let output = self.output.clone();
        tokio::spawn(async move {
            let params = protocol::document_diagnostic_params(&uri);
            match outbound
                .request("textDocument/diagnostic", Some(params), REQUEST_TIMEOUT)
                .await
            {
                Ok(body) => {
                    if body.get("error").is_some() {
                        output.warn(&format!("diagnostic pull for {uri} rejected"));
                        return;
                    }
                    let report = body
                        .get("result")
                        .cloned()
                        .and_then(|r| {
                            serde_json::from_value::<protocol::DocumentDiagnosticReport>(r).ok()
                        });
                    if let Some(items) = report.and_then(protocol::DocumentDiagnosticReport::into_items) {
                        let _ = event_tx.send(SessionEvent::Diagnostics { path, items }).await;
                    }
                }
                Err(e) => output.warn(&format!("diagnostic pull for {uri} failed: {e:#}")),
            }
        });
    }

    /// The standard shutdown sequence: `shutdown` request, `exit`
    /// notification on acknowledgment, then reap the process — killed if
    /// it outstays [`PROCESS_EXIT_TIMEOUT`]. When the transport is
    /// already gone there is nobody to notify; go straight to reaping.
    pub(crate) async fn shutdown(mut self, transport_alive: bool) {
        if transport_alive {
            match self
                .outbound
                .request("shutdown", None, SHUTDOWN_REQUEST_TIMEOUT)
                .await
            {
                Ok(body) if body.get("error").is_none() => {
                    let _ = self.outbound.notify("exit", None).await;
                }
                Ok(_) | Err(_) => {
                    self.output.warn("server did not acknowledge shutdown");
                }
            }
        }

        let _ = self.outbound.writer_tx.send(WriterCommand::Close).await;

        if tokio::time::timeout(PROCESS_EXIT_TIMEOUT, self.child.wait())
            .await
            .is_err()
        {
            self.output.warn("server did not exit in time, killing it");
            let _ = self.child.kill().await;
        }
    }
}
