//! The client session — lifecycle, policy, and forwarding.
//!
//! One [`Session`] owns one connection to one language-server process.
//! Sessions are plain owned values: no module-level handle, no global
//! registry. [`ExtensionContext`] is the explicit per-host registry that
//! `activate`/`deactivate` operate on, so independent contexts (and
//! tests) never share state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use globset::GlobSet;
use tokio::sync::mpsc;

use crate::connection::Connection;
use crate::diagnostics::DiagnosticsStore;
use crate::errors::{CloseAction, DefaultErrorHandler, ErrorHandler, StartError};
use crate::output::OutputChannel;
use crate::protocol;
use crate::types::{
    CloseReason, ConnectionHealth, DiagnosticsSnapshot, Document, FileEvent, SessionConfig,
    SessionEvent, SessionState,
};
use crate::watch;

const EVENT_QUEUE_CAPACITY: usize = 256;

/// One logical client session.
///
/// `start` is optimistic: the session reports `Running` as soon as the
/// process is spawned, before the server has confirmed the handshake.
/// Connection loss shows up through [`Session::poll_events`] as
/// `Terminated` health; the session itself stays `Running` until
/// [`Session::stop`].
pub struct Session {
    config: SessionConfig,
    workspace_root: PathBuf,
    output: OutputChannel,
    handler: Arc<dyn ErrorHandler>,
    globs: GlobSet,
    connection: Option<Connection>,
    diagnostics: DiagnosticsStore,
    state: SessionState,
    health: ConnectionHealth,
    event_rx: mpsc::Receiver<SessionEvent>,
    event_tx: mpsc::Sender<SessionEvent>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .field("workspace_root", &self.workspace_root)
            .field("state", &self.state)
            .field("health", &self.health)
            .field("connection", &self.connection.is_some())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Start a session with the default error policy: tolerate protocol
    /// errors indefinitely, never relaunch on connection loss.
    ///
    /// Returns once the process is spawned and the transport tasks are
    /// running. The `initialize` handshake continues in the background —
    /// the server is not necessarily ready when this returns. Must be
    /// called from within a Tokio runtime.
    pub fn start(config: SessionConfig, workspace_root: &Path) -> Result<Self, StartError> {
        let output = OutputChannel::new(&config.display_name, config.reveal_output_channel_on);
        let handler: Arc<dyn ErrorHandler> = Arc::new(DefaultErrorHandler::new(output.clone()));
        Self::launch(config, workspace_root, output, handler)
    }

    /// Start with a host-supplied error policy.
    pub fn start_with_handler(
        config: SessionConfig,
        workspace_root: &Path,
        handler: Arc<dyn ErrorHandler>,
    ) -> Result<Self, StartError> {
        let output = OutputChannel::new(&config.display_name, config.reveal_output_channel_on);
        Self::launch(config, workspace_root, output, handler)
    }

    fn launch(
        config: SessionConfig,
        workspace_root: &Path,
        output: OutputChannel,
        handler: Arc<dyn ErrorHandler>,
    ) -> Result<Self, StartError> {
        let globs = watch::compile_globs(&config.watch_globs)?;
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        tracing::info!(client = %config.id, command = %config.server.command, "starting session");
        output.append(&format!(
            "starting {} {}",
            config.server.command,
            config.server.args.join(" ")
        ));
        let connection = Connection::start(
            &config,
            workspace_root,
            event_tx.clone(),
            output.clone(),
            handler.clone(),
        )?;

        Ok(Self {
            config,
            workspace_root: workspace_root.to_path_buf(),
            output,
            handler,
            globs,
            connection: Some(connection),
            diagnostics: DiagnosticsStore::default(),
            state: SessionState::Running,
            health: ConnectionHealth::Connected,
            event_rx,
            event_tx,
        })
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    #[must_use]
    pub fn health(&self) -> ConnectionHealth {
        self.health
    }

    /// The shared output/trace channel.
    #[must_use]
    pub fn output(&self) -> &OutputChannel {
        &self.output
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Current diagnostics as last reported by the server.
    #[must_use]
    pub fn diagnostics(&self) -> DiagnosticsSnapshot {
        self.diagnostics.snapshot()
    }

    /// Forward a buffer change. Buffers outside the document selector
    /// are ignored; matching ones get `didOpen` on first contact and
    /// `didChange` after, plus a diagnostic pull when configured.
    pub async fn document_changed(&mut self, document: &Document, text: &str) {
        if !self.config.selector.matches(document) {
            return;
        }
        let Some(connection) = self.connection.as_mut() else {
            return;
        };
        let uri = document.uri().as_str().to_string();
        if let Err(e) = connection
            .document_changed(&uri, document.language_id(), text)
            .await
        {
            self.output.warn(&format!("didChange for {uri} failed: {e:#}"));
            return;
        }
        if self.config.diagnostic_pull.on_change {
            self.pull_for(document);
        }
    }

    /// Forward a buffer save, with a diagnostic pull when configured.
    pub async fn document_saved(&mut self, document: &Document) {
        if !self.config.selector.matches(document) {
            return;
        }
        let Some(connection) = self.connection.as_ref() else {
            return;
        };
        let uri = document.uri().as_str();
        if let Err(e) = connection.document_saved(uri).await {
            self.output.warn(&format!("didSave for {uri} failed: {e:#}"));
            return;
        }
        if self.config.diagnostic_pull.on_save {
            self.pull_for(document);
        }
    }

    fn pull_for(&self, document: &Document) {
        let Some(connection) = self.connection.as_ref() else {
            return;
        };
        if let Ok(path) = document.uri().to_file_path() {
            connection.pull_diagnostics(document.uri().as_str().to_string(), path);
        }
    }

    /// Forward one filesystem event. Paths outside the watch globs are
    /// dropped; matching events produce exactly one notification each,
    /// in call order.
    pub async fn file_event(&mut self, event: FileEvent) {
        if !self.globs.is_match(&event.path) {
            return;
        }
        let Some(connection) = self.connection.as_ref() else {
            return;
        };
        let uri = match protocol::path_to_file_uri(&event.path) {
            Ok(uri) => uri,
            Err(e) => {
                self.output.warn(&format!("skipping watched-file event: {e}"));
                return;
            }
        };
        if let Err(e) = connection.watched_file_changed(uri.as_str(), &event).await {
            self.output
                .warn(&format!("didChangeWatchedFiles for {uri} failed: {e:#}"));
        }
    }

    /// Drain up to `budget` pending events, applying close policy and
    /// accumulating diagnostics. Non-blocking.
    pub fn poll_events(&mut self, budget: usize) -> usize {
        let mut drained = 0;
        while drained < budget {
            match self.event_rx.try_recv() {
                Ok(event) => {
                    self.handle_event(event);
                    drained += 1;
                }
                Err(mpsc::error::TryRecvError::Empty | mpsc::error::TryRecvError::Disconnected) => {
                    break;
                }
            }
        }
        drained
    }

    fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Diagnostics { path, items } => {
                tracing::debug!(path = %path.display(), count = items.len(), "diagnostics updated");
                self.diagnostics.update(path, items);
            }
            SessionEvent::ProtocolError { count } => {
                tracing::debug!(count, "protocol error tolerated");
                if self.health == ConnectionHealth::Connected {
                    self.health = ConnectionHealth::Degraded;
                }
            }
            SessionEvent::Closed { reason } => self.connection_closed(&reason),
        }
    }

    fn connection_closed(&mut self, reason: &CloseReason) {
        if self.health == ConnectionHealth::Terminated {
            return;
        }
        match reason {
            CloseReason::Exited => tracing::info!("language server closed the transport"),
            CloseReason::Failed(message) => {
                tracing::warn!(error = %message, "language server connection failed");
            }
        }
        // Dropping the old connection reaps the child (kill_on_drop).
        self.connection = None;

        match self.handler.closed() {
            CloseAction::DoNotRestart => {
                self.health = ConnectionHealth::Terminated;
            }
            CloseAction::Restart => {
                self.output.append("relaunching language server");
                match Connection::start(
                    &self.config,
                    &self.workspace_root,
                    self.event_tx.clone(),
                    self.output.clone(),
                    self.handler.clone(),
                ) {
                    Ok(connection) => {
                        self.connection = Some(connection);
                        self.health = ConnectionHealth::Connected;
                    }
                    Err(e) => {
                        self.output.error(&format!("relaunch failed: {e}"));
                        self.health = ConnectionHealth::Terminated;
                    }
                }
            }
        }
    }

    /// Gracefully shut the session down. Safe to call more than once.
    ///
    /// Resolves only when the underlying shutdown sequence — shutdown
    /// request, exit notification, process reaped — has finished.
    pub async fn stop(&mut self) {
        self.output.append("stopping session");
        self.state = SessionState::Stopped;
        let transport_alive = self.health != ConnectionHealth::Terminated;
        self.health = ConnectionHealth::Terminated;
        let Some(connection) = self.connection.take() else {
            return;
        };
        connection.shutdown(transport_alive).await;
    }

    /// Event sender for tests that simulate server-side traffic.
    #[cfg(test)]
    pub(crate) fn event_tx(&self) -> &mpsc::Sender<SessionEvent> {
        &self.event_tx
    }
}

/// Per-host session registry. One hosting context owns at most one
/// session at a time.
#[derive(Default)]
pub struct ExtensionContext {
    session: Option<Session>,
}

impl ExtensionContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    #[must_use]
    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }
}

/// Start a session and register it with the context.
///
/// A context whose session is still `Running` is left alone (logged
/// no-op — a second server process is never started). A context whose
/// previous session was stopped or terminated gets a fresh session.
pub fn activate(
    context: &mut ExtensionContext,
    config: SessionConfig,
    workspace_root: &Path,
) -> Result<(), StartError> {
    if let Some(session) = &context.session
        && session.state() == SessionState::Running
        && session.health() != ConnectionHealth::Terminated
    {
        tracing::debug!("activate called while a session is running");
        return Ok(());
    }
    context.session = Some(Session::start(config, workspace_root)?);
    Ok(())
}

/// Tear down the context's session, if any.
///
/// Logs unconditionally, then resolves immediately when no session is
/// registered; otherwise resolves once the shutdown sequence completes.
/// Never errors.
pub async fn deactivate(context: &mut ExtensionContext) {
    tracing::debug!("deactivating");
    let Some(mut session) = context.session.take() else {
        return;
    };
    session.stop().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Diagnostic, DiagnosticSeverity};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Session with no live connection, for event-driven tests.
    fn test_session(handler: Arc<dyn ErrorHandler>) -> Session {
        let config = SessionConfig::regal();
        let output = OutputChannel::new(&config.display_name, config.reveal_output_channel_on);
        let globs = watch::compile_globs(&config.watch_globs).unwrap();
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        Session {
            config,
            workspace_root: PathBuf::from("/w"),
            output,
            handler,
            globs,
            connection: None,
            diagnostics: DiagnosticsStore::default(),
            state: SessionState::Running,
            health: ConnectionHealth::Connected,
            event_rx,
            event_tx,
        }
    }

    fn default_test_session() -> Session {
        let output = OutputChannel::new("regal-ls", crate::output::RevealOutputChannelOn::Never);
        test_session(Arc::new(DefaultErrorHandler::new(output)))
    }

    struct CountingCloseHandler {
        action: CloseAction,
        closed_calls: AtomicU32,
    }

    impl ErrorHandler for CountingCloseHandler {
        fn error(
            &self,
            _error: &crate::errors::ProtocolError,
            _message: Option<&serde_json::Value>,
            _count: u32,
        ) -> crate::errors::ErrorAction {
            crate::errors::ErrorAction::Continue
        }

        fn closed(&self) -> CloseAction {
            self.closed_calls.fetch_add(1, Ordering::Relaxed);
            self.action
        }
    }

    #[tokio::test]
    async fn test_deactivate_before_activate_is_a_noop() {
        let mut context = ExtensionContext::new();
        deactivate(&mut context).await;
        assert!(context.session().is_none());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_without_connection() {
        let mut session = default_test_session();
        session.stop().await;
        assert_eq!(session.state(), SessionState::Stopped);
        session.stop().await;
        assert_eq!(session.state(), SessionState::Stopped);
    }

    #[tokio::test]
    async fn test_protocol_errors_degrade_but_do_not_terminate() {
        let mut session = default_test_session();
        let tx = session.event_tx().clone();

        for count in 1..=5 {
            tx.send(SessionEvent::ProtocolError { count }).await.unwrap();
        }
        assert_eq!(session.poll_events(16), 5);
        assert_eq!(session.health(), ConnectionHealth::Degraded);
        assert_eq!(session.state(), SessionState::Running);
    }

    #[tokio::test]
    async fn test_close_with_default_policy_terminates_without_relaunch() {
        let handler = Arc::new(CountingCloseHandler {
            action: CloseAction::DoNotRestart,
            closed_calls: AtomicU32::new(0),
        });
        let mut session = test_session(handler.clone());
        let tx = session.event_tx().clone();

        tx.send(SessionEvent::Closed {
            reason: CloseReason::Exited,
        })
        .await
        .unwrap();
        session.poll_events(16);

        assert_eq!(session.health(), ConnectionHealth::Terminated);
        assert_eq!(handler.closed_calls.load(Ordering::Relaxed), 1);
        assert!(session.connection.is_none(), "no relaunch may be attempted");
    }

    #[tokio::test]
    async fn test_terminated_is_absorbing() {
        let handler = Arc::new(CountingCloseHandler {
            action: CloseAction::DoNotRestart,
            closed_calls: AtomicU32::new(0),
        });
        let mut session = test_session(handler.clone());
        let tx = session.event_tx().clone();

        for _ in 0..2 {
            tx.send(SessionEvent::Closed {
                reason: CloseReason::Exited,
            })
            .await
            .unwrap();
        }
        tx.send(SessionEvent::ProtocolError { count: 1 }).await.unwrap();
        session.poll_events(16);

        assert_eq!(session.health(), ConnectionHealth::Terminated);
        // Close policy consulted exactly once.
        assert_eq!(handler.closed_calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_restart_policy_with_missing_binary_ends_terminated() {
        let handler = Arc::new(CountingCloseHandler {
            action: CloseAction::Restart,
            closed_calls: AtomicU32::new(0),
        });
        let mut session = test_session(handler.clone());
        // Point the relaunch at a binary that cannot exist.
        session.config.server.command = "regal-client-test-no-such-binary".to_string();
        let tx = session.event_tx().clone();

        tx.send(SessionEvent::Closed {
            reason: CloseReason::Failed("boom".to_string()),
        })
        .await
        .unwrap();
        session.poll_events(16);

        assert_eq!(handler.closed_calls.load(Ordering::Relaxed), 1);
        assert_eq!(session.health(), ConnectionHealth::Terminated);
        assert!(
            session
                .output()
                .lines()
                .iter()
                .any(|l| l.contains("relaunch failed"))
        );
    }

    #[tokio::test]
    async fn test_diagnostics_accumulate_through_events() {
        let mut session = default_test_session();
        let tx = session.event_tx().clone();

        tx.send(SessionEvent::Diagnostics {
            path: PathBuf::from("/w/authz.rego"),
            items: vec![Diagnostic::new(
                DiagnosticSeverity::Error,
                "unresolved import".to_string(),
                1,
                0,
                "unresolved-import".to_string(),
            )],
        })
        .await
        .unwrap();
        session.poll_events(16);
        assert_eq!(session.diagnostics().error_count(), 1);

        // Empty publish clears the file.
        tx.send(SessionEvent::Diagnostics {
            path: PathBuf::from("/w/authz.rego"),
            items: vec![],
        })
        .await
        .unwrap();
        session.poll_events(16);
        assert!(session.diagnostics().is_empty());
    }

    #[tokio::test]
    async fn test_poll_events_respects_budget() {
        let mut session = default_test_session();
        let tx = session.event_tx().clone();
        for count in 1..=4 {
            tx.send(SessionEvent::ProtocolError { count }).await.unwrap();
        }
        assert_eq!(session.poll_events(3), 3);
        assert_eq!(session.poll_events(16), 1);
        assert_eq!(session.poll_events(16), 0);
    }

    #[tokio::test]
    async fn test_non_matching_buffers_and_paths_are_ignored() {
        let mut session = default_test_session();

        let yaml = Document::new(
            url::Url::parse("file:///w/config.yaml").unwrap(),
            "yaml",
        );
        session.document_changed(&yaml, "a: 1\n").await;
        session.document_saved(&yaml).await;
        session
            .file_event(FileEvent {
                path: PathBuf::from("/w/main.go"),
                kind: crate::types::FileChangeKind::Changed,
            })
            .await;

        // Nothing to assert on the wire without a server; the contract
        // here is simply "no panic, no state change".
        assert_eq!(session.health(), ConnectionHealth::Connected);
    }

    #[tokio::test]
    async fn test_start_with_missing_executable_is_not_found() {
        let config = SessionConfig {
            server: crate::types::ServerSpec {
                command: "regal-client-test-no-such-binary".to_string(),
                args: vec!["language-server".to_string()],
            },
            ..SessionConfig::regal()
        };
        let error = Session::start(config, Path::new("/w")).unwrap_err();
        assert!(matches!(error, StartError::NotFound { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_activate_stop_cycle_with_short_lived_process() {
        // A stand-in server that exits immediately: the reader sees EOF,
        // the close policy runs, and stop() completes fast because the
        // transport is already gone.
        let config = SessionConfig {
            server: crate::types::ServerSpec {
                command: "sh".to_string(),
                args: vec!["-c".to_string(), "exit 0".to_string()],
            },
            ..SessionConfig::regal()
        };
        let root = tempfile::tempdir().unwrap();

        let mut context = ExtensionContext::new();
        activate(&mut context, config, root.path()).unwrap();
        let session = context.session_mut().unwrap();
        assert_eq!(session.state(), SessionState::Running);

        // Wait for the EOF to surface as a Closed event.
        let mut terminated = false;
        for _ in 0..50 {
            session.poll_events(16);
            if session.health() == ConnectionHealth::Terminated {
                terminated = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        assert!(terminated, "EOF never surfaced as Terminated health");
        assert!(
            session
                .output()
                .lines()
                .iter()
                .any(|l| l.contains("closed")),
            "close must be logged"
        );

        deactivate(&mut context).await;
        assert!(context.session().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_activate_twice_does_not_spawn_a_second_process() {
        let config = SessionConfig {
            server: crate::types::ServerSpec {
                command: "sh".to_string(),
                args: vec!["-c".to_string(), "cat > /dev/null".to_string()],
            },
            ..SessionConfig::regal()
        };
        let root = tempfile::tempdir().unwrap();

        // The launch line is appended synchronously, so counting it is
        // race-free even while the transport tasks keep tracing.
        fn launch_lines(session: &Session) -> usize {
            session
                .output()
                .lines()
                .iter()
                .filter(|l| l.contains("starting sh"))
                .count()
        }

        let mut context = ExtensionContext::new();
        activate(&mut context, config.clone(), root.path()).unwrap();
        assert_eq!(launch_lines(context.session().unwrap()), 1);

        // Second activation while running: a logged no-op.
        activate(&mut context, config, root.path()).unwrap();
        assert_eq!(
            launch_lines(context.session().unwrap()),
            1,
            "no second launch may happen"
        );

        deactivate(&mut context).await;
    }
}
