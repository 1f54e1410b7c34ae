//! Error types for request-dispatcher.

use thiserror::Error;

use crate::protocol::RemoteFailure;
use crate::proxy::ProxyState;

/// Main error type for all dispatch operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// I/O error outside the transport (thread spawn, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport failure other than context termination.
    #[error("Transport error: {0}")]
    Transport(#[from] zmq::Error),

    /// The transport context is shutting down.
    ///
    /// The socket that observed it has already been closed.
    #[error("Transport terminated")]
    Terminated,

    /// Malformed message (wrong frame count, non-empty delimiter, bad ID).
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// Payload could not be encoded.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Payload could not be decoded.
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// A proxy lifecycle method was called in the wrong state.
    #[error("Cannot {operation} while proxy is {state}")]
    IllegalLifecycleTransition {
        /// The rejected operation.
        operation: &'static str,
        /// The state the proxy was in.
        state: ProxyState,
    },

    /// No endpoint is registered for the request type.
    #[error("No service registered for request type {0}")]
    UnregisteredService(&'static str),

    /// `gather_results` deadline elapsed with calls outstanding.
    #[error("Timed out gathering results, {outstanding} call(s) outstanding")]
    GatherTimeout {
        /// Calls still waiting for a reply.
        outstanding: usize,
    },

    /// The worker reported a failure instead of a reply.
    #[error("Remote failure: {0}")]
    Remote(RemoteFailure),

    /// A blocking dispatcher call was made from inside a reply callback.
    #[error("Cannot {0} from inside a dispatcher callback")]
    CalledFromCallback(&'static str),

    /// The dispatcher has been closed.
    #[error("Dispatcher closed")]
    Closed,

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DispatchError {
    /// Whether this is an I/O-class failure (transport or termination).
    pub fn is_io(&self) -> bool {
        matches!(
            self,
            DispatchError::Io(_) | DispatchError::Transport(_) | DispatchError::Terminated
        )
    }

    /// Whether the caller may reasonably carry on after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            DispatchError::Deserialization(_)
                | DispatchError::GatherTimeout { .. }
                | DispatchError::Remote(_)
        )
    }
}

/// Result type alias using DispatchError.
pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FailureKind;

    #[test]
    fn test_termination_is_io() {
        assert!(DispatchError::Terminated.is_io());
        assert!(DispatchError::Transport(zmq::Error::EAGAIN).is_io());
        assert!(!DispatchError::Protocol("x".to_string()).is_io());
    }

    #[test]
    fn test_recoverable_kinds() {
        assert!(DispatchError::Deserialization("bad".to_string()).is_recoverable());
        assert!(DispatchError::GatherTimeout { outstanding: 2 }.is_recoverable());
        assert!(
            DispatchError::Remote(RemoteFailure::new(FailureKind::Handler, "boom"))
                .is_recoverable()
        );
        assert!(!DispatchError::Serialization("bad".to_string()).is_recoverable());
        assert!(!DispatchError::UnregisteredService("String").is_recoverable());
    }

    #[test]
    fn test_callback_reentry_message() {
        let err = DispatchError::CalledFromCallback("gather results");
        assert_eq!(
            err.to_string(),
            "Cannot gather results from inside a dispatcher callback"
        );
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_lifecycle_message() {
        let err = DispatchError::IllegalLifecycleTransition {
            operation: "shut down",
            state: ProxyState::Created,
        };
        assert_eq!(err.to_string(), "Cannot shut down while proxy is created");
    }
}
