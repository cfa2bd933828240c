//! Host-side LSP client session for the Regal language server.
//!
//! Launches `regal language-server`, speaks LSP over its stdio, and
//! applies fixed policies: tolerate protocol errors indefinitely, never
//! relaunch a server whose transport closed, forward Rego source and
//! Regal config file events, and re-pull diagnostics on change and save.

pub mod codec;
pub mod errors;
pub mod output;
pub mod types;
pub mod watch;

pub(crate) mod connection;
pub(crate) mod diagnostics;
pub(crate) mod protocol;

mod session;

pub use errors::{CloseAction, DefaultErrorHandler, ErrorAction, ErrorHandler, ProtocolError, StartError};
pub use output::{OutputChannel, RevealOutputChannelOn};
pub use session::{ExtensionContext, Session, activate, deactivate};
pub use types::{
    CloseReason, ConnectionHealth, Diagnostic, DiagnosticPullOptions, DiagnosticSeverity,
    DiagnosticsSnapshot, Document, DocumentSelector, FileChangeKind, FileEvent, ServerSpec,
    SessionConfig, SessionEvent, SessionState,
};
pub use watch::WorkspaceWatcher;
