//! Codec module - serialization/deserialization for payloads.
//!
//! This module provides the pluggable payload codec used by workers and
//! dispatchers:
//!
//! - [`Serializer`] - the codec boundary
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (default)
//! - [`JsonCodec`] - JSON using `serde_json`, readable on the wire
//!
//! # Design
//!
//! Codecs are small `Copy` values handed to each [`Worker`](crate::Worker) and
//! [`Dispatcher`](crate::Dispatcher) at construction. There is no process-wide
//! serializer, so tests can swap codecs per instance.
//!
//! Both ends of a service must agree on the codec.
//!
//! # Example
//!
//! ```
//! use request_dispatcher::codec::{JsonCodec, MsgPackCodec, Serializer};
//!
//! let encoded = MsgPackCodec.serialize("hello").unwrap();
//! let decoded: String = MsgPackCodec.deserialize(&encoded).unwrap();
//! assert_eq!(decoded, "hello");
//!
//! let json = JsonCodec.serialize(&[1, 2, 3]).unwrap();
//! assert_eq!(json, b"[1,2,3]");
//! ```

mod json;
mod msgpack;

pub use json::JsonCodec;
pub use msgpack::MsgPackCodec;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Result;

/// Payload codec used on both sides of a service.
pub trait Serializer: Clone + Send + Sync + 'static {
    /// Encode a value to bytes.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Serialization`](crate::DispatchError::Serialization)
    /// if the value cannot be encoded.
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>>;

    /// Decode bytes to a value.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Deserialization`](crate::DispatchError::Deserialization)
    /// if the bytes are not a valid encoding of `T`.
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}
