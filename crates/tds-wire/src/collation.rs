//! SQL Server collation.
//!
//! Collations define the character encoding and sorting rules for string
//! data. The server announces the database collation through an
//! `SQLCollation` environment change; the client attaches it to every
//! character-typed RPC parameter it sends back.

use crate::error::ProtocolError;

/// A SQL Server collation as carried on the wire (5 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Collation {
    /// Locale ID (LCID) plus collation flags.
    pub lcid: u32,
    /// Sort ID for SQL collations.
    pub sort_id: u8,
}

impl Collation {
    /// Decode a collation from its 5-byte wire representation.
    ///
    /// # Errors
    ///
    /// Returns a decode error if fewer than 5 bytes are supplied.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        if bytes.len() < 5 {
            return Err(ProtocolError::decode(format!(
                "collation requires 5 bytes, got {}",
                bytes.len()
            )));
        }

        let lcid = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Ok(Self {
            lcid,
            sort_id: bytes[4],
        })
    }

    /// Encode the collation into its 5-byte wire representation.
    #[must_use]
    pub fn encode(&self) -> [u8; 5] {
        let lcid = self.lcid.to_le_bytes();
        [lcid[0], lcid[1], lcid[2], lcid[3], self.sort_id]
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_encode_roundtrip() {
        // Latin1_General_CI_AS
        let raw = [0x09, 0x04, 0xD0, 0x00, 0x34];
        let collation = Collation::decode(&raw).unwrap();
        assert_eq!(collation.sort_id, 0x34);
        assert_eq!(collation.encode(), raw);
    }

    #[test]
    fn test_decode_short_input() {
        assert!(Collation::decode(&[1, 2, 3]).is_err());
    }
}
