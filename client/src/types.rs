//! Public types consumed by the hosting editor.
//!
//! The host constructs a [`SessionConfig`] (or deserializes one — every
//! field has a default that reproduces the stock Regal setup), receives
//! [`SessionEvent`]s, and reads [`DiagnosticsSnapshot`]s.

use std::path::PathBuf;

use serde::Deserialize;

use crate::output::RevealOutputChannelOn;

/// Source-file glob registered with the filesystem watcher.
pub const REGO_SOURCE_GLOB: &str = "**/*.rego";

/// Project-local configuration file glob.
pub const REGAL_CONFIG_GLOB: &str = "**/.regal/config.yaml";

fn default_client_id() -> String {
    "regal".to_string()
}

fn default_display_name() -> String {
    "Regal LSP client".to_string()
}

fn default_watch_globs() -> Vec<String> {
    vec![REGO_SOURCE_GLOB.to_string(), REGAL_CONFIG_GLOB.to_string()]
}

/// How to start the external language-server process.
///
/// Fixed at construction time; changing it requires a new session.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for ServerSpec {
    fn default() -> Self {
        Self {
            command: "regal".to_string(),
            args: vec!["language-server".to_string()],
        }
    }
}

/// Predicate over (scheme, language id) deciding which buffers this
/// client is authoritative for.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct DocumentSelector {
    pub scheme: String,
    pub language: String,
}

impl Default for DocumentSelector {
    fn default() -> Self {
        Self {
            scheme: "file".to_string(),
            language: "rego".to_string(),
        }
    }
}

impl DocumentSelector {
    #[must_use]
    pub fn matches(&self, document: &Document) -> bool {
        document.uri().scheme() == self.scheme && document.language_id() == self.language
    }
}

/// An editor buffer, identified by URI and language.
#[derive(Debug, Clone)]
pub struct Document {
    uri: url::Url,
    language_id: String,
}

impl Document {
    #[must_use]
    pub fn new(uri: url::Url, language_id: impl Into<String>) -> Self {
        Self {
            uri,
            language_id: language_id.into(),
        }
    }

    #[must_use]
    pub fn uri(&self) -> &url::Url {
        &self.uri
    }

    #[must_use]
    pub fn language_id(&self) -> &str {
        &self.language_id
    }
}

/// Which document events re-request diagnostics from the server.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DiagnosticPullOptions {
    pub on_change: bool,
    pub on_save: bool,
}

impl Default for DiagnosticPullOptions {
    fn default() -> Self {
        Self {
            on_change: true,
            on_save: true,
        }
    }
}

/// Immutable protocol-level configuration for one session.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Stable client identifier, used in log/trace context.
    #[serde(default = "default_client_id")]
    pub id: String,
    /// Human-readable name: the output channel name and `clientInfo.name`.
    #[serde(default = "default_display_name")]
    pub display_name: String,
    #[serde(default)]
    pub server: ServerSpec,
    #[serde(default)]
    pub selector: DocumentSelector,
    #[serde(default)]
    pub reveal_output_channel_on: RevealOutputChannelOn,
    /// Glob patterns whose filesystem events are forwarded to the server.
    #[serde(default = "default_watch_globs")]
    pub watch_globs: Vec<String>,
    #[serde(default)]
    pub diagnostic_pull: DiagnosticPullOptions,
    /// Opaque `initializationOptions` payload for the server.
    #[serde(default)]
    pub initialization_options: Option<serde_json::Value>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::regal()
    }
}

impl SessionConfig {
    /// The stock Regal configuration.
    #[must_use]
    pub fn regal() -> Self {
        Self {
            id: default_client_id(),
            display_name: default_display_name(),
            server: ServerSpec::default(),
            selector: DocumentSelector::default(),
            reveal_output_channel_on: RevealOutputChannelOn::Never,
            watch_globs: default_watch_globs(),
            diagnostic_pull: DiagnosticPullOptions::default(),
            initialization_options: None,
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Running,
    Stopped,
}

/// Health of the underlying connection.
///
/// `Degraded` is entered after the first protocol error and only ever
/// leads to `Terminated`. `Terminated` is absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionHealth {
    Connected,
    Degraded,
    Terminated,
}

/// Why a connection went away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The server closed its end of the transport.
    Exited,
    /// The transport failed mid-exchange and the error policy gave up.
    Failed(String),
}

/// Filesystem change kind, mapped onto the LSP `FileChangeType` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileChangeKind {
    Created,
    Changed,
    Deleted,
}

impl FileChangeKind {
    /// LSP `FileChangeType` numeric value.
    #[must_use]
    pub fn lsp_value(self) -> u8 {
        match self {
            Self::Created => 1,
            Self::Changed => 2,
            Self::Deleted => 3,
        }
    }
}

/// One filesystem event as delivered by the watch facility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEvent {
    pub path: PathBuf,
    pub kind: FileChangeKind,
}

/// An event surfaced to the host by [`crate::Session::poll_events`].
#[derive(Debug)]
pub enum SessionEvent {
    /// Diagnostics replaced for a file (push or pull).
    Diagnostics {
        path: PathBuf,
        items: Vec<Diagnostic>,
    },
    /// A protocol error was tolerated. `count` is the running total.
    ProtocolError { count: u32 },
    /// The connection is gone.
    Closed { reason: CloseReason },
}

/// Severity of a diagnostic, numeric values per the LSP specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DiagnosticSeverity {
    Error = 1,
    Warning = 2,
    Information = 3,
    Hint = 4,
}

impl DiagnosticSeverity {
    /// Convert from the wire value; `None` outside the defined range.
    #[must_use]
    pub fn from_lsp(value: u64) -> Option<Self> {
        match value {
            1 => Some(Self::Error),
            2 => Some(Self::Warning),
            3 => Some(Self::Information),
            4 => Some(Self::Hint),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_error(self) -> bool {
        self == Self::Error
    }
}

/// A single diagnostic reported by the server.
///
/// Construction happens at the protocol boundary; fields are read-only
/// afterwards.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    severity: DiagnosticSeverity,
    message: String,
    /// 0-indexed.
    line: u32,
    /// 0-indexed.
    col: u32,
    /// Rule identifier, e.g. "opa-fmt". Empty when the server omits it.
    code: String,
}

impl Diagnostic {
    #[must_use]
    pub fn new(
        severity: DiagnosticSeverity,
        message: String,
        line: u32,
        col: u32,
        code: String,
    ) -> Self {
        Self {
            severity,
            message,
            line,
            col,
            code,
        }
    }

    #[must_use]
    pub fn severity(&self) -> DiagnosticSeverity {
        self.severity
    }

    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    #[must_use]
    pub fn line(&self) -> u32 {
        self.line
    }

    #[must_use]
    pub fn col(&self) -> u32 {
        self.col
    }

    #[must_use]
    pub fn code(&self) -> &str {
        &self.code
    }
}

/// Immutable per-file view of current diagnostics, sorted by path.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsSnapshot {
    files: Vec<(PathBuf, Vec<Diagnostic>)>,
}

impl DiagnosticsSnapshot {
    pub(crate) fn new(files: Vec<(PathBuf, Vec<Diagnostic>)>) -> Self {
        Self { files }
    }

    #[must_use]
    pub fn files(&self) -> &[(PathBuf, Vec<Diagnostic>)] {
        &self.files
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    #[must_use]
    pub fn error_count(&self) -> usize {
        self.files
            .iter()
            .flat_map(|(_, items)| items)
            .filter(|d| d.severity().is_error())
            .count()
    }

    #[must_use]
    pub fn total_count(&self) -> usize {
        self.files.iter().map(|(_, items)| items.len()).sum()
    }
}
