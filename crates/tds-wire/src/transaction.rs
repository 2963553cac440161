//! Transaction descriptor handling.
//!
//! SQL Server identifies the transaction scope of a request through an opaque
//! 8-byte descriptor returned in the `BeginTransaction` / `EnlistDtc`
//! environment-change tokens. Every RPC and SQL batch header carries the
//! descriptor of the currently active transaction, or all zeroes in
//! auto-commit mode.

use crate::error::ProtocolError;

/// An opaque 8-byte transaction descriptor.
///
/// The all-zero descriptor denotes auto-commit mode (no explicit
/// transaction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TransactionDescriptor([u8; 8]);

impl TransactionDescriptor {
    /// Mandatory descriptor length on the wire.
    pub const LENGTH: usize = 8;

    /// The auto-commit (all-zero) descriptor.
    #[must_use]
    pub const fn empty() -> Self {
        Self([0; 8])
    }

    /// Create a descriptor from the raw bytes of an environment-change token.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::DescriptorLength`] if the server supplied a
    /// value that is not exactly 8 bytes. A mismatch is protocol-fatal.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() != Self::LENGTH {
            return Err(ProtocolError::DescriptorLength(bytes.len()));
        }

        let mut descriptor = [0; Self::LENGTH];
        descriptor.copy_from_slice(bytes);
        Ok(Self(descriptor))
    }

    /// The raw descriptor bytes as sent in the request header.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; Self::LENGTH] {
        &self.0
    }

    /// Whether this is the auto-commit (all-zero) descriptor.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0 == [0; Self::LENGTH]
    }
}
