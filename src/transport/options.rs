//! Per-socket buffering and linger settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Default queue depth (send and receive high-water mark).
pub const DEFAULT_QUEUE_DEPTH: i32 = 1000;

/// Default linger in milliseconds.
pub const DEFAULT_LINGER_MS: i32 = 100;

/// Queue depth of a worker's data socket.
///
/// Kept at one so a busy worker does not hoard requests that an idle one
/// could serve.
pub const WORKER_QUEUE_DEPTH: i32 = 1;

/// Queue depth of a worker's control subscription.
pub const CONTROL_QUEUE_DEPTH: i32 = 10;

/// Transport options applied to every socket the crate creates.
///
/// Deserializes from camelCase keys with defaults for missing fields:
///
/// ```
/// use request_dispatcher::transport::SocketOptions;
///
/// let options: SocketOptions = serde_json::from_str(r#"{"queueDepth": 50}"#).unwrap();
/// assert_eq!(options.queue_depth, 50);
/// assert_eq!(options.linger_ms, 100);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SocketOptions {
    /// Bounds in-flight unsent/unreceived messages per socket.
    pub queue_depth: i32,
    /// How long a closing socket waits to flush, in milliseconds.
    pub linger_ms: i32,
}

impl SocketOptions {
    /// Options with the given queue depth.
    pub fn with_queue_depth(mut self, queue_depth: i32) -> Self {
        self.queue_depth = queue_depth;
        self
    }

    /// Options with the given linger.
    pub fn with_linger(mut self, linger: Duration) -> Self {
        self.linger_ms = i32::try_from(linger.as_millis()).unwrap_or(i32::MAX);
        self
    }

    /// Linger as a `Duration`. Negative values (wait forever) map to `None`.
    pub fn linger(&self) -> Option<Duration> {
        u64::try_from(self.linger_ms).ok().map(Duration::from_millis)
    }

    /// Apply to a socket before it is bound or connected.
    pub fn apply(&self, socket: &zmq::Socket) -> Result<()> {
        socket.set_linger(self.linger_ms)?;
        socket.set_sndhwm(self.queue_depth)?;
        socket.set_rcvhwm(self.queue_depth)?;
        Ok(())
    }
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            queue_depth: DEFAULT_QUEUE_DEPTH,
            linger_ms: DEFAULT_LINGER_MS,
        }
    }
}
