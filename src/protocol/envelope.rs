//! Three-frame message envelope.
//!
//! Every request and reply is a multipart message of exactly three frames:
//! ```text
//! ┌──────────────────┬──────────────────┬────────────┐
//! │ Payload          │ Correlation ID   │ Delimiter  │
//! │ codec bytes      │ minimal BE int   │ 0 bytes    │
//! └──────────────────┴──────────────────┴────────────┘
//! ```
//!
//! Between the proxy frontend and a worker the router prepends the caller's
//! identity. Those frames form the routing prefix and are echoed back on the
//! reply untouched.

use bytes::Bytes;

use super::correlation::{decode_correlation_id, encode_correlation_id, CorrelationId};
use crate::error::{DispatchError, Result};

/// Number of frames in an envelope, excluding any routing prefix.
pub const ENVELOPE_FRAMES: usize = 3;

/// A decoded request or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Correlation ID assigned by the dispatcher.
    pub correlation_id: CorrelationId,
    /// Codec-encoded body.
    pub payload: Bytes,
    /// Router-assigned identity frames (broker side only).
    pub routing: Vec<Vec<u8>>,
}

impl Envelope {
    /// Create an envelope without routing prefix.
    pub fn new(correlation_id: CorrelationId, payload: impl Into<Bytes>) -> Self {
        Self {
            correlation_id,
            payload: payload.into(),
            routing: Vec::new(),
        }
    }

    /// Decode a client-side message of exactly three frames.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Protocol`] if the frame count is not 3, the
    /// delimiter is non-empty or the correlation ID is malformed.
    pub fn decode(frames: Vec<Vec<u8>>) -> Result<Self> {
        if frames.len() != ENVELOPE_FRAMES {
            return Err(DispatchError::Protocol(format!(
                "Wrong number of frames: expected {}, got {}",
                ENVELOPE_FRAMES,
                frames.len()
            )));
        }
        let (routing, envelope) = split_envelope(frames)?;
        debug_assert!(routing.is_empty());
        Ok(envelope)
    }

    /// Decode a broker-side message: a routing prefix followed by three frames.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Protocol`] if the routing prefix is missing or
    /// the trailing three frames are malformed.
    pub fn from_routed(frames: Vec<Vec<u8>>) -> Result<Self> {
        if frames.len() <= ENVELOPE_FRAMES {
            return Err(DispatchError::Protocol(format!(
                "Routed message needs an identity prefix, got {} frames",
                frames.len()
            )));
        }
        let (routing, mut envelope) = split_envelope(frames)?;
        envelope.routing = routing;
        Ok(envelope)
    }

    /// Build a reply that travels back along this envelope's route.
    pub fn reply(&self, payload: impl Into<Bytes>) -> Self {
        Self {
            correlation_id: self.correlation_id,
            payload: payload.into(),
            routing: self.routing.clone(),
        }
    }

    /// Encode as `routing ++ [payload, id, delimiter]`.
    pub fn into_frames(self) -> Vec<Vec<u8>> {
        let mut frames = self.routing;
        frames.reserve(ENVELOPE_FRAMES);
        frames.extend(encode(self.correlation_id, &self.payload));
        frames
    }
}

/// Encode a payload and correlation ID as the three envelope frames.
///
/// # Example
///
/// ```
/// use request_dispatcher::protocol::{decode, encode};
///
/// let frames = encode(7, b"ping");
/// assert_eq!(frames, [b"ping".to_vec(), vec![7], vec![]]);
///
/// let envelope = decode(frames.to_vec()).unwrap();
/// assert_eq!(envelope.correlation_id, 7);
/// assert_eq!(&envelope.payload[..], b"ping");
/// ```
pub fn encode(correlation_id: CorrelationId, payload: &[u8]) -> [Vec<u8>; ENVELOPE_FRAMES] {
    [
        payload.to_vec(),
        encode_correlation_id(correlation_id),
        Vec::new(),
    ]
}

/// Decode a client-side message (standalone function).
#[inline]
pub fn decode(frames: Vec<Vec<u8>>) -> Result<Envelope> {
    Envelope::decode(frames)
}

/// Split off the trailing three frames and decode them.
fn split_envelope(mut frames: Vec<Vec<u8>>) -> Result<(Vec<Vec<u8>>, Envelope)> {
    let tail = frames.split_off(frames.len() - ENVELOPE_FRAMES);
    let [payload, id, delimiter]: [Vec<u8>; ENVELOPE_FRAMES] = tail
        .try_into()
        .map_err(|_| DispatchError::Protocol("Truncated envelope".to_string()))?;

    if !delimiter.is_empty() {
        return Err(DispatchError::Protocol(format!(
            "Delimiter frame is not empty ({} bytes)",
            delimiter.len()
        )));
    }

    let envelope = Envelope {
        correlation_id: decode_correlation_id(&id)?,
        payload: Bytes::from(payload),
        routing: Vec::new(),
    };
    Ok((frames, envelope))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let frames = encode(300, b"hello");
        assert_eq!(frames[0], b"hello");
        assert_eq!(frames[1], vec![0x01, 0x2C]);
        assert!(frames[2].is_empty());
    }

    #[test]
    fn test_round_trip_with_edge_ids() {
        for id in [0, 1, -1, 255, -256, i64::MAX, i64::MIN] {
            let envelope = decode(encode(id, b"payload").to_vec()).unwrap();
            assert_eq!(envelope.correlation_id, id);
            assert_eq!(&envelope.payload[..], b"payload");
            assert!(envelope.routing.is_empty());
        }
    }

    #[test]
    fn test_empty_payload_round_trip() {
        let envelope = decode(encode(5, b"").to_vec()).unwrap();
        assert!(envelope.payload.is_empty());
    }

    #[test]
    fn test_wrong_frame_count_rejected() {
        for count in [0usize, 1, 2, 4] {
            let frames = vec![vec![0u8]; count];
            let err = decode(frames).unwrap_err();
            assert!(matches!(err, DispatchError::Protocol(_)), "count {count}");
        }
    }

    #[test]
    fn test_non_empty_delimiter_rejected() {
        let frames = vec![b"payload".to_vec(), vec![1], vec![0]];
        let err = decode(frames).unwrap_err();
        assert!(err.to_string().contains("Delimiter frame is not empty"));
    }

    #[test]
    fn test_routed_prefix_is_preserved() {
        let mut frames = vec![b"peer-a".to_vec(), b"peer-b".to_vec()];
        frames.extend(encode(-3, b"req"));

        let envelope = Envelope::from_routed(frames.clone()).unwrap();
        assert_eq!(envelope.routing, vec![b"peer-a".to_vec(), b"peer-b".to_vec()]);
        assert_eq!(envelope.correlation_id, -3);

        let reply = envelope.reply(b"rep".to_vec()).into_frames();
        assert_eq!(&reply[..2], &frames[..2]);
        assert_eq!(reply[2], b"rep");
        assert_eq!(reply[3], frames[3]);
        assert!(reply[4].is_empty());
    }

    #[test]
    fn test_routed_without_prefix_rejected() {
        let err = Envelope::from_routed(encode(1, b"x").to_vec()).unwrap_err();
        assert!(err.to_string().contains("identity prefix"));
    }

    #[test]
    fn test_unrouted_into_frames_matches_encode() {
        let frames = Envelope::new(42, b"abc".to_vec()).into_frames();
        assert_eq!(frames, encode(42, b"abc").to_vec());
    }
}
