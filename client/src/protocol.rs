//! JSON-RPC message types and param builders for the methods this
//! client speaks.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{Diagnostic, DiagnosticSeverity, FileEvent};

#[derive(Debug, thiserror::Error)]
#[error("cannot express path as file URI: {}", path.display())]
pub(crate) struct PathToUriError {
    path: PathBuf,
}

#[derive(Debug, Serialize)]
pub(crate) struct Request {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Request {
    pub fn new(id: u64, method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct Notification {
    pub jsonrpc: &'static str,
    pub method: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl Notification {
    pub fn new(method: &'static str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            method,
            params,
        }
    }
}

/// `initialize` params. Capabilities cover exactly what the session
/// uses: text document sync, push diagnostics, pull diagnostics, and
/// watched-file notifications. `clientInfo` identifies this client to
/// the server, which keys client-specific behavior off the name.
pub(crate) fn initialize_params(
    root_uri: &str,
    client_name: &str,
    initialization_options: Option<&serde_json::Value>,
) -> serde_json::Value {
    let mut params = serde_json::json!({
        "processId": std::process::id(),
        "clientInfo": {
            "name": client_name,
            "version": env!("CARGO_PKG_VERSION"),
        },
        "rootUri": root_uri,
        "capabilities": {
            "workspace": {
                "didChangeWatchedFiles": { "dynamicRegistration": false },
                "diagnostics": { "refreshSupport": false }
            },
            "textDocument": {
                "synchronization": {
                    "dynamicRegistration": false,
                    "didSave": true
                },
                "publishDiagnostics": { "relatedInformation": false },
                "diagnostic": { "dynamicRegistration": false }
            }
        },
        "workspaceFolders": [{
            "uri": root_uri,
            "name": "workspace"
        }]
    });
    if let Some(options) = initialization_options {
        params["initializationOptions"] = options.clone();
    }
    params
}

pub(crate) fn did_open_params(
    uri: &str,
    language_id: &str,
    version: i32,
    text: &str,
) -> serde_json::Value {
    serde_json::json!({
        "textDocument": {
            "uri": uri,
            "languageId": language_id,
            "version": version,
            "text": text
        }
    })
}

pub(crate) fn did_change_params(uri: &str, version: i32, text: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri, "version": version },
        "contentChanges": [{ "text": text }]
    })
}

pub(crate) fn did_save_params(uri: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri }
    })
}

/// One `workspace/didChangeWatchedFiles` notification per filesystem
/// event — the `changes` array always has exactly one entry, so the
/// server observes events in host order without batching.
pub(crate) fn watched_files_params(uri: &str, event: &FileEvent) -> serde_json::Value {
    serde_json::json!({
        "changes": [{ "uri": uri, "type": event.kind.lsp_value() }]
    })
}

pub(crate) fn document_diagnostic_params(uri: &str) -> serde_json::Value {
    serde_json::json!({
        "textDocument": { "uri": uri }
    })
}

#[derive(Debug, Deserialize)]
pub(crate) struct PublishDiagnosticsParams {
    pub uri: String,
    pub diagnostics: Vec<WireDiagnostic>,
}

/// A diagnostic as the server sends it. `code` may be a string or a
/// number on the wire; Regal sends rule names as strings.
#[derive(Debug, Deserialize)]
pub(crate) struct WireDiagnostic {
    pub range: WireRange,
    pub severity: Option<u64>,
    pub code: Option<serde_json::Value>,
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WireRange {
    pub start: WirePosition,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WirePosition {
    pub line: u32,
    pub character: u32,
}

impl WireDiagnostic {
    pub fn into_diagnostic(self) -> Diagnostic {
        let code = match self.code {
            Some(serde_json::Value::String(s)) => s,
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };
        Diagnostic::new(
            self.severity
                .and_then(DiagnosticSeverity::from_lsp)
                .unwrap_or(DiagnosticSeverity::Warning),
            self.message,
            self.range.start.line,
            self.range.start.character,
            code,
        )
    }
}

/// Result of a `textDocument/diagnostic` pull. `unchanged` reports carry
/// no items and mean "keep what you have".
#[derive(Debug, Deserialize)]
pub(crate) struct DocumentDiagnosticReport {
    pub kind: String,
    #[serde(default)]
    pub items: Vec<WireDiagnostic>,
}

impl DocumentDiagnosticReport {
    pub fn into_items(self) -> Option<Vec<Diagnostic>> {
        if self.kind == "unchanged" {
            return None;
        }
        Some(
            self.items
                .into_iter()
                .map(WireDiagnostic::into_diagnostic)
                .collect(),
        )
    }
}

pub(crate) fn path_to_file_uri(path: &Path) -> Result<url::Url, PathToUriError> {
    url::Url::from_file_path(path).map_err(|()| PathToUriError {
        path: path.to_path_buf(),
    })
}

pub(crate) fn file_uri_to_path(uri: &str) -> Option<PathBuf> {
    url::Url::parse(uri).ok().and_then(|u| u.to_file_path().ok())
}
