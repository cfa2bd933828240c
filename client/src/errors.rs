//! Error taxonomy and the recovery-policy seam.
//!
//! Three failure classes, handled differently on purpose:
//!
//! - launch failures are the one typed, returned error ([`StartError`]) —
//!   the host decides display policy;
//! - protocol errors are recovered locally through [`ErrorHandler::error`]
//!   and never surface to callers;
//! - connection closure goes through [`ErrorHandler::closed`] and is
//!   terminal for the session unless the handler asks for a restart.

use crate::output::OutputChannel;

/// Failure to establish a session. Returned from `Session::start`; the
/// component itself neither retries nor notifies the user.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("language server executable '{command}' not found in PATH")]
    NotFound {
        command: String,
        #[source]
        source: which::Error,
    },
    #[error("failed to spawn '{command}'")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("'{command}' spawned without a {pipe} pipe")]
    MissingPipe {
        command: String,
        pipe: &'static str,
    },
    #[error("invalid watch glob '{pattern}'")]
    BadWatchGlob {
        pattern: String,
        #[source]
        source: globset::Error,
    },
}

/// An individual failed or malformed exchange. Recoverable by policy.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The framing layer could not produce a message.
    #[error("transport error: {0}")]
    Transport(String),
    /// A frame decoded to JSON that is not a request, response, or
    /// notification.
    #[error("message with unrecognized JSON-RPC shape")]
    UnrecognizedMessage,
}

/// What to do after a protocol error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Keep the connection open and keep reading.
    Continue,
    /// Tear the connection down.
    Shutdown,
}

/// What to do after the connection closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseAction {
    /// Leave the session terminated; a new session is required to recover.
    DoNotRestart,
    /// Relaunch the server process once.
    Restart,
}

/// Policy seam for protocol errors and connection closure.
///
/// `count` is the running number of protocol errors on this connection.
/// Implementations may use it to impose a threshold; the default policy
/// deliberately does not.
pub trait ErrorHandler: Send + Sync {
    fn error(
        &self,
        error: &ProtocolError,
        message: Option<&serde_json::Value>,
        count: u32,
    ) -> ErrorAction;

    fn closed(&self) -> CloseAction;
}

/// Default policy: tolerate protocol errors indefinitely, never relaunch
/// a server whose transport closed.
///
/// A language server normally never closes its own transport except on
/// fatal internal failure or an explicit shutdown request, so an
/// automatic relaunch would mask a crash loop.
pub struct DefaultErrorHandler {
    output: OutputChannel,
}

impl DefaultErrorHandler {
    #[must_use]
    pub fn new(output: OutputChannel) -> Self {
        Self { output }
    }
}

impl ErrorHandler for DefaultErrorHandler {
    fn error(
        &self,
        error: &ProtocolError,
        message: Option<&serde_json::Value>,
        count: u32,
    ) -> ErrorAction {
        self.output.error(&format!("protocol error #{count}: {error}"));
        if let Some(message) = message {
            self.output.error(&format!("offending message: {message}"));
        }
        ErrorAction::Continue
    }

    fn closed(&self) -> CloseAction {
        self.output.error("connection to the language server closed");
        CloseAction::DoNotRestart
    }
}
