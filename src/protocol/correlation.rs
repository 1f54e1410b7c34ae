//! Correlation ID encoding.
//!
//! IDs travel as the shortest big-endian two's-complement byte string that
//! still carries the sign, with no fixed width:
//!
//! ```text
//!        0 -> 00
//!      127 -> 7F
//!      128 -> 00 80
//!       -1 -> FF
//!     -129 -> FF 7F
//! ```

use crate::error::{DispatchError, Result};

/// Correlation identifier linking a request to its reply.
pub type CorrelationId = i64;

/// Maximum encoded width in bytes.
pub const MAX_ID_BYTES: usize = std::mem::size_of::<CorrelationId>();

/// Encode an ID as a minimal signed big-endian byte string.
///
/// # Example
///
/// ```
/// use request_dispatcher::protocol::encode_correlation_id;
///
/// assert_eq!(encode_correlation_id(0), vec![0x00]);
/// assert_eq!(encode_correlation_id(128), vec![0x00, 0x80]);
/// assert_eq!(encode_correlation_id(-1), vec![0xFF]);
/// ```
pub fn encode_correlation_id(id: CorrelationId) -> Vec<u8> {
    let bytes = id.to_be_bytes();
    let mut start = 0;
    // A leading byte is redundant if it only repeats the sign of the next one.
    while start < MAX_ID_BYTES - 1 {
        let sign_of_next = bytes[start + 1] & 0x80;
        let redundant = (bytes[start] == 0x00 && sign_of_next == 0)
            || (bytes[start] == 0xFF && sign_of_next != 0);
        if !redundant {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

/// Decode a signed big-endian byte string of 1 to 8 bytes.
///
/// Non-minimal encodings are accepted and sign-extended.
///
/// # Errors
///
/// Returns [`DispatchError::Protocol`] for an empty or oversized frame.
pub fn decode_correlation_id(bytes: &[u8]) -> Result<CorrelationId> {
    if bytes.is_empty() {
        return Err(DispatchError::Protocol(
            "Correlation ID frame is empty".to_string(),
        ));
    }
    if bytes.len() > MAX_ID_BYTES {
        return Err(DispatchError::Protocol(format!(
            "Correlation ID frame is {} bytes, maximum is {}",
            bytes.len(),
            MAX_ID_BYTES
        )));
    }

    let fill = if bytes[0] & 0x80 != 0 { 0xFF } else { 0x00 };
    let mut buf = [fill; MAX_ID_BYTES];
    buf[MAX_ID_BYTES - bytes.len()..].copy_from_slice(bytes);
    Ok(CorrelationId::from_be_bytes(buf))
}
