//! Proxy configuration.
//!
//! Plain serde structs with defaults for every field, loadable from JSON:
//!
//! ```
//! use request_dispatcher::ProxyConfig;
//!
//! let config = ProxyConfig::from_json(r#"{
//!     "frontend": "tcp://127.0.0.1:5555",
//!     "workersPerHandler": 4,
//!     "socket": { "queueDepth": 500 }
//! }"#).unwrap();
//!
//! assert_eq!(config.workers_per_handler, 4);
//! assert_eq!(config.socket.queue_depth, 500);
//! assert_eq!(config.socket.linger_ms, 100);
//! ```

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};
use crate::transport::SocketOptions;

/// Default frontend endpoint.
pub const DEFAULT_FRONTEND: &str = "tcp://127.0.0.1:5555";

/// Configuration for a [`WorkerProxy`](crate::WorkerProxy).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProxyConfig {
    /// Endpoint the frontend ROUTER binds to.
    pub frontend: String,
    /// Workers started per registered handler.
    pub workers_per_handler: usize,
    /// Options for the proxy's own sockets and the base for worker sockets.
    pub socket: SocketOptions,
}

impl ProxyConfig {
    /// Configuration for `frontend` with defaults elsewhere.
    pub fn new(frontend: impl Into<String>) -> Self {
        Self {
            frontend: frontend.into(),
            ..Self::default()
        }
    }

    /// Set the number of workers per handler.
    pub fn workers_per_handler(mut self, count: usize) -> Self {
        self.workers_per_handler = count;
        self
    }

    /// Set the socket options.
    pub fn socket_options(mut self, options: SocketOptions) -> Self {
        self.socket = options;
        self
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| DispatchError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the values are usable.
    pub fn validate(&self) -> Result<()> {
        if self.frontend.is_empty() {
            return Err(DispatchError::Config("frontend must not be empty".to_string()));
        }
        if !self.frontend.contains("://") {
            return Err(DispatchError::Config(format!(
                "frontend '{}' is not a transport endpoint (expected scheme://address)",
                self.frontend
            )));
        }
        if self.workers_per_handler == 0 {
            return Err(DispatchError::Config(
                "workersPerHandler must be at least 1".to_string(),
            ));
        }
        if self.socket.queue_depth < 0 {
            return Err(DispatchError::Config(format!(
                "queueDepth must not be negative, got {}",
                self.socket.queue_depth
            )));
        }
        Ok(())
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            frontend: DEFAULT_FRONTEND.to_string(),
            workers_per_handler: 1,
            socket: SocketOptions::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.frontend, DEFAULT_FRONTEND);
        assert_eq!(config.workers_per_handler, 1);
        assert_eq!(config.socket, SocketOptions::default());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = ProxyConfig::from_json("{}").unwrap();
        assert_eq!(config, ProxyConfig::default());
    }

    #[test]
    fn test_builder() {
        let config = ProxyConfig::new("ipc:///tmp/dispatch.sock")
            .workers_per_handler(8)
            .socket_options(SocketOptions::default().with_queue_depth(1));
        assert_eq!(config.frontend, "ipc:///tmp/dispatch.sock");
        assert_eq!(config.workers_per_handler, 8);
        assert_eq!(config.socket.queue_depth, 1);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(ProxyConfig::new("").validate().is_err());
        assert!(ProxyConfig::new("localhost:5555").validate().is_err());
        assert!(ProxyConfig::default().workers_per_handler(0).validate().is_err());

        let err = ProxyConfig::from_json(r#"{"socket": {"queueDepth": -5}}"#).unwrap_err();
        assert!(err.to_string().contains("queueDepth"));
    }

    #[test]
    fn test_malformed_json_is_config_error() {
        let err = ProxyConfig::from_json("{frontend").unwrap_err();
        assert!(matches!(err, DispatchError::Config(_)));
    }

    #[test]
    fn test_serializes_camel_case() {
        let json = serde_json::to_value(ProxyConfig::default()).unwrap();
        assert_eq!(json["workersPerHandler"], 1);
        assert_eq!(json["socket"]["lingerMs"], 100);
    }
}
