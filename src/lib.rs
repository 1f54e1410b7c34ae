//! # request-dispatcher
//!
//! Request/reply dispatch over ZeroMQ with a pool of worker threads.
//!
//! Callers issue typed requests through a [`Dispatcher`]; a [`WorkerProxy`]
//! accepts them on one external endpoint and spreads them over [`Worker`]
//! threads, each running a user handler. Replies travel back the same way and
//! are matched to their callback by correlation ID.
//!
//! ## Architecture
//!
//! - **Frontend** (ROUTER): the one endpoint dispatchers connect to
//! - **Backend** (DEALER, `inproc://`): round-robins requests over workers
//! - **Control** (PUB, `inproc://`): broadcasts STOP at shutdown
//!
//! Every message is three frames: payload, correlation ID, empty delimiter.
//!
//! ## Example
//!
//! ```
//! use std::time::Duration;
//! use request_dispatcher::{Dispatcher, WorkerProxy};
//!
//! # fn main() -> request_dispatcher::Result<()> {
//! let mut proxy = WorkerProxy::bind("inproc://greeter")?;
//! proxy.add_workers(4, |name: String| Ok(format!("hello {name}")))?;
//! proxy.start_workers()?;
//!
//! let dispatcher = Dispatcher::new(proxy.context())?;
//! dispatcher.register_service::<String>("inproc://greeter");
//! dispatcher.execute(&"world".to_string(), |reply: request_dispatcher::Result<String>| {
//!     assert_eq!(reply.unwrap(), "hello world");
//! })?;
//! dispatcher.gather_results(Some(Duration::from_secs(5)))?;
//!
//! dispatcher.close()?;
//! proxy.shutdown()?;
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod protocol;
pub mod proxy;
pub mod transport;
pub mod worker;

pub use codec::{JsonCodec, MsgPackCodec, Serializer};
pub use config::ProxyConfig;
pub use dispatcher::Dispatcher;
pub use error::{DispatchError, Result};
pub use protocol::{CorrelationId, FailureKind, RemoteFailure};
pub use proxy::{ProxyState, WorkerProxy};
pub use transport::SocketOptions;
pub use worker::{Worker, WorkerId, WorkerSockets};
