//! Reply body carried in the payload frame of every reply.
//!
//! A worker never drops a request silently: it either answers with
//! `Success(reply)` or with `Failure` describing what went wrong on its side.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// What went wrong on the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The handler returned an error.
    Handler,
    /// The handler panicked.
    Panicked,
    /// The request payload could not be decoded.
    Deserialization,
    /// The handler's reply could not be encoded.
    Serialization,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FailureKind::Handler => "handler error",
            FailureKind::Panicked => "handler panicked",
            FailureKind::Deserialization => "undecodable request",
            FailureKind::Serialization => "unencodable reply",
        };
        f.write_str(name)
    }
}

/// Failure reported by a worker in place of a reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFailure {
    /// Failure category.
    pub kind: FailureKind,
    /// Human-readable detail.
    pub message: String,
}

impl RemoteFailure {
    /// Create a new failure.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Reply payload as written by workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplyBody<T> {
    /// Handler result.
    Success(T),
    /// Worker-side failure.
    Failure(RemoteFailure),
}

impl<T> ReplyBody<T> {
    /// Convert into the result handed to a dispatcher callback.
    pub fn into_result(self) -> Result<T> {
        match self {
            ReplyBody::Success(value) => Ok(value),
            ReplyBody::Failure(failure) => Err(DispatchError::Remote(failure)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JsonCodec, MsgPackCodec, Serializer};

    #[test]
    fn test_success_into_result() {
        let body: ReplyBody<String> = ReplyBody::Success("ok".to_string());
        assert_eq!(body.into_result().unwrap(), "ok");
    }

    #[test]
    fn test_failure_into_result() {
        let body: ReplyBody<String> =
            ReplyBody::Failure(RemoteFailure::new(FailureKind::Handler, "no such user"));
        match body.into_result() {
            Err(DispatchError::Remote(failure)) => {
                assert_eq!(failure.kind, FailureKind::Handler);
                assert_eq!(failure.message, "no such user");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_failure_through_msgpack() {
        let body: ReplyBody<u32> =
            ReplyBody::Failure(RemoteFailure::new(FailureKind::Panicked, "index out of bounds"));
        let bytes = MsgPackCodec.serialize(&body).unwrap();
        let decoded: ReplyBody<u32> = MsgPackCodec.deserialize(&bytes).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn test_json_shape() {
        let body: ReplyBody<u32> = ReplyBody::Success(7);
        assert_eq!(JsonCodec.serialize(&body).unwrap(), br#"{"Success":7}"#);

        let failure: ReplyBody<u32> =
            ReplyBody::Failure(RemoteFailure::new(FailureKind::Deserialization, "eof"));
        assert_eq!(
            JsonCodec.serialize(&failure).unwrap(),
            br#"{"Failure":{"kind":"deserialization","message":"eof"}}"#
        );
    }

    #[test]
    fn test_display() {
        let failure = RemoteFailure::new(FailureKind::Serialization, "map key");
        assert_eq!(failure.to_string(), "unencodable reply: map key");
    }
}
