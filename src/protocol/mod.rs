//! Protocol module - envelope framing and reply bodies.
//!
//! This module implements the wire protocol shared by dispatchers and workers:
//! - 3-frame envelope encoding/decoding
//! - Variable-width correlation ID encoding
//! - Reply body carrying either a result or a worker-side failure

mod correlation;
mod envelope;
mod reply;

pub use correlation::{decode_correlation_id, encode_correlation_id, CorrelationId, MAX_ID_BYTES};
pub use envelope::{decode, encode, Envelope, ENVELOPE_FRAMES};
pub use reply::{FailureKind, RemoteFailure, ReplyBody};
