//! Blocking socket operations with explicit termination handling.
//!
//! Every helper separates three outcomes:
//!
//! - `Ok(Delivery::Data(_))` - the operation completed
//! - `Ok(Delivery::Terminated)` - the context is shutting down (`ETERM`)
//! - `Err(_)` - any other transport failure
//!
//! On `Terminated` the caller closes the socket (drops it) and stops using it.
//! [`Delivery::into_data`] re-signals termination as
//! [`DispatchError::Terminated`] for callers that just propagate.

use crate::error::{DispatchError, Result};

/// Outcome of a blocking socket operation that did not fail outright.
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Delivery<T> {
    /// The operation completed.
    Data(T),
    /// The owning context is terminating.
    Terminated,
}

impl<T> Delivery<T> {
    /// Whether the context is terminating.
    #[inline]
    pub fn is_terminated(&self) -> bool {
        matches!(self, Delivery::Terminated)
    }

    /// Unwrap the data or turn termination into [`DispatchError::Terminated`].
    #[inline]
    pub fn into_data(self) -> Result<T> {
        match self {
            Delivery::Data(value) => Ok(value),
            Delivery::Terminated => Err(DispatchError::Terminated),
        }
    }

    /// Map the carried data.
    #[inline]
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Delivery<U> {
        match self {
            Delivery::Data(value) => Delivery::Data(f(value)),
            Delivery::Terminated => Delivery::Terminated,
        }
    }
}

/// Classify a raw transport result.
#[inline]
pub fn classify<T>(result: std::result::Result<T, zmq::Error>) -> Result<Delivery<T>> {
    match result {
        Ok(value) => Ok(Delivery::Data(value)),
        Err(zmq::Error::ETERM) => Ok(Delivery::Terminated),
        Err(e) => Err(DispatchError::Transport(e)),
    }
}

/// Receive one multipart message, blocking.
pub fn recv_frames(socket: &zmq::Socket) -> Result<Delivery<Vec<Vec<u8>>>> {
    classify(socket.recv_multipart(0))
}

/// Send one multipart message, blocking while the queue is full.
pub fn send_frames<I, T>(socket: &zmq::Socket, frames: I) -> Result<Delivery<()>>
where
    I: IntoIterator<Item = T>,
    T: Into<zmq::Message>,
{
    classify(socket.send_multipart(frames, 0))
}

/// Send one multipart message without blocking.
///
/// A full queue fails with [`DispatchError::Transport`] carrying `EAGAIN`.
pub fn try_send_frames<I, T>(socket: &zmq::Socket, frames: I) -> Result<Delivery<()>>
where
    I: IntoIterator<Item = T>,
    T: Into<zmq::Message>,
{
    classify(socket.send_multipart(frames, zmq::DONTWAIT))
}

/// Wait until any item is ready or `timeout_ms` elapses (`-1` blocks).
///
/// Returns the number of ready items.
pub fn poll(items: &mut [zmq::PollItem<'_>], timeout_ms: i64) -> Result<Delivery<i32>> {
    classify(zmq::poll(items, timeout_ms))
}
