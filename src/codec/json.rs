//! JSON codec using `serde_json`.
//!
//! Slower and larger than MsgPack, but the payload frames can be read in a
//! packet capture or a `zmq` monitor without tooling.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Serializer;
use crate::error::{DispatchError, Result};

/// JSON codec for human-readable payloads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JsonCodec;

impl Serializer for JsonCodec {
    #[inline]
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| DispatchError::Serialization(e.to_string()))
    }

    #[inline]
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| DispatchError::Deserialization(e.to_string()))
    }
}
