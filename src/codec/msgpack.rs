//! MsgPack codec using `rmp-serde`.
//!
//! Structs are written with `to_vec_named`, i.e. as maps keyed by field name,
//! so adding an optional field on one side does not shift positions on the
//! other.
//!
//! # Example
//!
//! ```
//! use request_dispatcher::codec::{MsgPackCodec, Serializer};
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Message {
//!     id: u32,
//!     content: String,
//! }
//!
//! let msg = Message { id: 42, content: "hello".to_string() };
//! let encoded = MsgPackCodec.serialize(&msg).unwrap();
//! let decoded: Message = MsgPackCodec.deserialize(&encoded).unwrap();
//! assert_eq!(decoded, msg);
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::Serializer;
use crate::error::{DispatchError, Result};

/// MessagePack codec for structured data.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgPackCodec;

impl Serializer for MsgPackCodec {
    #[inline]
    fn serialize<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        rmp_serde::to_vec_named(value).map_err(|e| DispatchError::Serialization(e.to_string()))
    }

    #[inline]
    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        rmp_serde::from_slice(bytes).map_err(|e| DispatchError::Deserialization(e.to_string()))
    }
}
