//! Scalar return-value decoding.
//!
//! The cursor procedures answer with `RETURNVALUE` tokens whose payloads the
//! engine must interpret itself: the cursor id and the prepared-statement
//! handle are both integers. This facade decodes those payloads; everything
//! else stays opaque and flows downstream untouched.

use crate::error::ProtocolError;
use crate::token::ReturnValue;

/// Decode an integer return-value payload.
///
/// Integer OUT parameters arrive as `INTN` values: a one-byte length prefix
/// followed by 1, 2, 4 or 8 little-endian data bytes. Fixed-length `INT4`
/// payloads (exactly four bytes, no prefix) are accepted as well.
///
/// # Errors
///
/// Returns [`ProtocolError::InvalidReturnValue`] for NULL payloads and
/// payloads of any other shape.
pub fn decode_int(return_value: &ReturnValue) -> Result<i32, ProtocolError> {
    let payload = &return_value.value;

    // Fixed-length INT4 without a length prefix.
    if payload.len() == 4 {
        return Ok(i32::from_le_bytes([
            payload[0], payload[1], payload[2], payload[3],
        ]));
    }

    let Some((&len, data)) = payload.split_first() else {
        return Err(ProtocolError::InvalidReturnValue(format!(
            "empty payload for parameter {}",
            return_value.ordinal
        )));
    };

    if usize::from(len) != data.len() {
        return Err(ProtocolError::InvalidReturnValue(format!(
            "length prefix {} does not match {} data bytes",
            len,
            data.len()
        )));
    }

    match data {
        [a] => Ok(i32::from(*a)),
        [a, b] => Ok(i32::from(i16::from_le_bytes([*a, *b]))),
        [a, b, c, d] => Ok(i32::from_le_bytes([*a, *b, *c, *d])),
        [a, b, c, d, e, f, g, h] => {
            let wide = i64::from_le_bytes([*a, *b, *c, *d, *e, *f, *g, *h]);
            i32::try_from(wide).map_err(|_| {
                ProtocolError::InvalidReturnValue(format!("value {wide} exceeds INT4 range"))
            })
        }
        [] => Err(ProtocolError::InvalidReturnValue(format!(
            "NULL payload for parameter {}",
            return_value.ordinal
        ))),
        other => Err(ProtocolError::InvalidReturnValue(format!(
            "unsupported integer width {}",
            other.len()
        ))),
    }
}
