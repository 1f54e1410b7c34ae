//! Transport module - ZeroMQ socket plumbing.
//!
//! Provides:
//! - Internal endpoint addresses shared by the proxy and its workers
//! - [`SocketOptions`] applied to every socket
//! - Blocking helpers returning [`Delivery`] so context termination is an
//!   explicit value rather than an error to unwind through

mod options;
mod socket;

pub use options::{
    SocketOptions, CONTROL_QUEUE_DEPTH, DEFAULT_LINGER_MS, DEFAULT_QUEUE_DEPTH,
    WORKER_QUEUE_DEPTH,
};
pub use socket::{classify, poll, recv_frames, send_frames, try_send_frames, Delivery};

/// Endpoint where the proxy's backend DEALER accepts worker data sockets.
pub const WORKER_PAYLOAD_ENDPOINT: &str = "inproc://worker-payload";

/// Endpoint where the proxy publishes control messages to workers.
pub const WORKER_CONTROL_ENDPOINT: &str = "inproc://worker-control";

/// Create a socket with `options` applied.
pub fn socket(
    context: &zmq::Context,
    kind: zmq::SocketType,
    options: &SocketOptions,
) -> crate::Result<zmq::Socket> {
    let socket = context.socket(kind)?;
    options.apply(&socket)?;
    Ok(socket)
}
