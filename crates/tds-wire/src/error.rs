//! Protocol-level error type.

use thiserror::Error;

/// Errors raised while interpreting protocol-level values.
///
/// All of these are *protocol-fatal* from the client's point of view: they
/// indicate either a server that violated the TDS contract or a bug in the
/// decoding layer, and the connection is unusable afterwards.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A token or value could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A transaction descriptor did not have the mandatory 8-byte length.
    #[error("transaction descriptor length mismatch: expected 8 bytes, got {0}")]
    DescriptorLength(usize),

    /// A token arrived that is not valid in the current state.
    #[error("unexpected token: {0}")]
    UnexpectedToken(&'static str),

    /// A return value payload did not match the expected scalar shape.
    #[error("invalid return value payload: {0}")]
    InvalidReturnValue(String),
}

impl ProtocolError {
    /// Create a decode error from a displayable cause.
    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }
}
