//! Client error types and the server error classifier.

use std::sync::Arc;

use thiserror::Error;

use tds_wire::{ProtocolError, ServerError};

/// Errors that can occur while driving a connection.
#[derive(Debug, Error, Clone)]
pub enum Error {
    /// Transport-level I/O error. Closes the connection and fails all
    /// in-flight and queued exchanges.
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),

    /// Protocol violation (unexpected token, descriptor length mismatch,
    /// decode failure). Closes the connection.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The connection is closed; no further exchanges are accepted.
    #[error("connection closed")]
    ConnectionClosed,

    /// The exchange request queue is full.
    #[error("request queue is full")]
    RequestQueueFull,

    /// The bounded outbound request ring of the active exchange overflowed.
    /// This indicates a protocol bug and closes the connection.
    #[error("outbound request queue overflow")]
    OutboundOverflow,

    /// An error surfaced by the server.
    #[error("server error {number}: {message}")]
    Server {
        /// Server error number.
        number: i64,
        /// Severity class (0-25).
        class: u8,
        /// Error state.
        state: u8,
        /// Error message text.
        message: String,
        /// Procedure name, if raised inside one.
        procedure: String,
        /// Line number within the batch or procedure.
        line: i64,
    },

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),

    /// An argument failed validation before any network I/O.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An identifier failed sanitization or validation.
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// The operation is not valid in the current connection state.
    #[error("illegal state: {0}")]
    IllegalState(String),
}

impl Error {
    /// Build an error from a server `ERROR` token.
    #[must_use]
    pub fn server(token: &ServerError) -> Self {
        Self::Server {
            number: token.number,
            class: token.class,
            state: token.state,
            message: token.message.clone(),
            procedure: token.procedure.clone(),
            line: token.line,
        }
    }

    /// Whether this error closes the connection.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Protocol(_) | Self::ConnectionClosed | Self::OutboundOverflow
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a server error number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorDisposition {
    /// Prepared-statement invalidation; retried silently once per
    /// subscription by re-preparing.
    TransientReprepare,
    /// Informational message (severity 0-10); surfaced as an info token.
    Info,
    /// Surfaced downstream; moves the exchange to the error phase on the
    /// next procedure completion.
    Fatal,
}

/// Whether a server error number indicates an invalidated prepared statement.
///
/// - 586: the prepared handle is not valid in this context (SET options or
///   default schema changed since preparation)
/// - 8144/8178: procedure has too many arguments / expected a parameter
/// - 8179: could not find prepared statement with the given handle
#[must_use]
pub fn requires_reprepare(number: i64) -> bool {
    matches!(number, 586 | 8144 | 8178 | 8179)
}

/// Classify a server error number and severity class.
#[must_use]
pub fn classify(number: i64, class: u8) -> ErrorDisposition {
    if requires_reprepare(number) {
        ErrorDisposition::TransientReprepare
    } else if class <= 10 {
        ErrorDisposition::Info
    } else {
        ErrorDisposition::Fatal
    }
}
