//! Worker - runs one request handler on its own thread.
//!
//! A [`Worker`] wraps a typed handler `Fn(Req) -> anyhow::Result<Rep>` and a
//! codec. Its sockets are not created by the worker: the
//! [`WorkerProxy`](crate::WorkerProxy) wires them to its internal endpoints
//! when the worker is added and hands them over when the thread starts.
//!
//! # Loop
//!
//! ```text
//!            ┌──────── poll(data, control) ◄──────────┐
//!            │                                          │
//!   control: STOP ──► return Ok(())                     │
//!   data:    [routing.., payload, id, ""]               │
//!              decode ─► handler ─► encode ReplyBody    │
//!              send [routing.., reply, id, ""] ─────────┘
//! ```
//!
//! Malformed messages are dropped with a warning, undecodable payloads and
//! handler errors or panics are answered with a
//! [`ReplyBody::Failure`](crate::protocol::ReplyBody). Only transport
//! failures end the loop.
//!
//! # Example
//!
//! ```
//! use request_dispatcher::{Worker, WorkerProxy};
//!
//! # fn main() -> request_dispatcher::Result<()> {
//! let mut proxy = WorkerProxy::bind("inproc://hello")?;
//! let worker = Worker::new(|name: String| Ok(format!("hello {name}")));
//! assert!(proxy.add(worker.clone())?);
//! assert!(proxy.add(worker.replicate())?);
//!
//! proxy.start_workers()?;
//! proxy.shutdown()?;
//! # Ok(())
//! # }
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::codec::{MsgPackCodec, Serializer};
use crate::error::{DispatchError, Result};
use crate::protocol::{Envelope, FailureKind, RemoteFailure, ReplyBody};
use crate::transport::{self, recv_frames, send_frames};

/// Control message that ends every worker loop.
pub const CMD_STOP: &[u8] = b"STOP";

/// Upper bound on one poll, so the loop re-checks its sockets regularly.
const POLL_INTERVAL_MS: i64 = 100;

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique worker identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(u64);

impl WorkerId {
    fn next() -> Self {
        Self(NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Numeric value.
    #[inline]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// The two late-bound sockets a worker runs on.
pub struct WorkerSockets {
    /// Receives requests and sends replies (connected to the proxy backend).
    pub data: zmq::Socket,
    /// Subscribed to the proxy's control channel.
    pub control: zmq::Socket,
}

impl WorkerSockets {
    /// Bundle a data and a control socket.
    pub fn new(data: zmq::Socket, control: zmq::Socket) -> Self {
        Self { data, control }
    }
}

/// Type-erased request handling: request payload in, reply payload out.
trait Service: Send + Sync {
    fn call(&self, payload: &[u8]) -> Result<Vec<u8>>;

    fn request_type(&self) -> &'static str;
}

/// Wrapper that decodes the request and encodes the reply with a codec.
struct TypedService<Req, Rep, F, C> {
    handler: F,
    codec: C,
    _phantom: PhantomData<fn(Req) -> Rep>,
}

impl<Req, Rep, F, C> TypedService<Req, Rep, F, C>
where
    Req: DeserializeOwned + 'static,
    Rep: Serialize + 'static,
    F: Fn(Req) -> anyhow::Result<Rep> + Send + Sync + 'static,
    C: Serializer,
{
    fn invoke(&self, request: Req) -> ReplyBody<Rep> {
        match panic::catch_unwind(AssertUnwindSafe(|| (self.handler)(request))) {
            Ok(Ok(reply)) => ReplyBody::Success(reply),
            Ok(Err(e)) => ReplyBody::Failure(RemoteFailure::new(
                FailureKind::Handler,
                format!("{e:#}"),
            )),
            Err(payload) => ReplyBody::Failure(RemoteFailure::new(
                FailureKind::Panicked,
                panic_message(payload.as_ref()),
            )),
        }
    }
}

impl<Req, Rep, F, C> Service for TypedService<Req, Rep, F, C>
where
    Req: DeserializeOwned + 'static,
    Rep: Serialize + 'static,
    F: Fn(Req) -> anyhow::Result<Rep> + Send + Sync + 'static,
    C: Serializer,
{
    fn call(&self, payload: &[u8]) -> Result<Vec<u8>> {
        let body = match self.codec.deserialize::<Req>(payload) {
            Ok(request) => self.invoke(request),
            Err(e) => {
                warn!("Undecodable {} request: {}", self.request_type(), e);
                ReplyBody::Failure(RemoteFailure::new(FailureKind::Deserialization, e.to_string()))
            }
        };

        match self.codec.serialize(&body) {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                warn!("Reply to {} request could not be encoded: {}", self.request_type(), e);
                let fallback: ReplyBody<()> = ReplyBody::Failure(RemoteFailure::new(
                    FailureKind::Serialization,
                    e.to_string(),
                ));
                self.codec.serialize(&fallback)
            }
        }
    }

    fn request_type(&self) -> &'static str {
        std::any::type_name::<Req>()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// A handler bound to a codec, identified by a [`WorkerId`].
///
/// Cloning yields a handle to the same worker (same id). Use
/// [`Worker::replicate`] for another worker sharing the handler.
#[derive(Clone)]
pub struct Worker {
    id: WorkerId,
    service: Arc<dyn Service>,
}

impl Worker {
    /// Create a worker using MessagePack payloads.
    pub fn new<Req, Rep, F>(handler: F) -> Self
    where
        Req: DeserializeOwned + 'static,
        Rep: Serialize + 'static,
        F: Fn(Req) -> anyhow::Result<Rep> + Send + Sync + 'static,
    {
        Self::with_codec(handler, MsgPackCodec)
    }

    /// Create a worker using the given codec.
    pub fn with_codec<Req, Rep, F, C>(handler: F, codec: C) -> Self
    where
        Req: DeserializeOwned + 'static,
        Rep: Serialize + 'static,
        F: Fn(Req) -> anyhow::Result<Rep> + Send + Sync + 'static,
        C: Serializer,
    {
        Self {
            id: WorkerId::next(),
            service: Arc::new(TypedService {
                handler,
                codec,
                _phantom: PhantomData,
            }),
        }
    }

    /// A new worker (fresh id) sharing this worker's handler and codec.
    pub fn replicate(&self) -> Self {
        Self {
            id: WorkerId::next(),
            service: Arc::clone(&self.service),
        }
    }

    /// Get the worker id.
    #[inline]
    pub fn id(&self) -> WorkerId {
        self.id
    }

    /// Name of the request type this worker decodes.
    pub fn request_type(&self) -> &'static str {
        self.service.request_type()
    }

    /// Serve requests until STOP arrives on the control socket.
    ///
    /// Consumes the sockets; they are closed when this returns.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Terminated`] if the context shuts down underneath the
    /// worker, [`DispatchError::Transport`] for other socket failures.
    pub fn run(&self, sockets: WorkerSockets) -> Result<()> {
        debug!(worker = %self.id, "Worker loop started");
        let outcome = self.serve_until_stopped(&sockets);
        drop(sockets);

        match &outcome {
            Ok(()) => debug!(worker = %self.id, "Worker stopped"),
            Err(DispatchError::Terminated) => {
                debug!(worker = %self.id, "Context terminated, worker sockets closed")
            }
            Err(e) => error!(worker = %self.id, "Worker loop failed: {}", e),
        }
        outcome
    }

    fn serve_until_stopped(&self, sockets: &WorkerSockets) -> Result<()> {
        loop {
            let (data_ready, control_ready) = {
                let mut items = [
                    sockets.data.as_poll_item(zmq::POLLIN),
                    sockets.control.as_poll_item(zmq::POLLIN),
                ];
                transport::poll(&mut items, POLL_INTERVAL_MS)?.into_data()?;
                (items[0].is_readable(), items[1].is_readable())
            };

            // Control first, so STOP wins over a backlog of requests.
            if control_ready {
                let frames = recv_frames(&sockets.control)?.into_data()?;
                if frames.first().map(Vec::as_slice) == Some(CMD_STOP) {
                    return Ok(());
                }
                debug!(worker = %self.id, "Ignoring unknown control message");
            }

            if data_ready {
                self.handle_one(&sockets.data)?;
            }
        }
    }

    fn handle_one(&self, data: &zmq::Socket) -> Result<()> {
        let frames = recv_frames(data)?.into_data()?;
        let request = match Envelope::from_routed(frames) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(worker = %self.id, "Dropping malformed request: {}", e);
                return Ok(());
            }
        };

        let reply = match self.service.call(&request.payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(
                    worker = %self.id,
                    correlation_id = request.correlation_id,
                    "No reply could be encoded: {}", e
                );
                return Ok(());
            }
        };

        send_frames(data, request.reply(reply).into_frames())?.into_data()
    }
}

impl PartialEq for Worker {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Worker {}

impl Hash for Worker {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("request_type", &self.request_type())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonCodec;
    use crate::protocol::encode;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    const BACKEND: &str = "inproc://test-backend";
    const CONTROL: &str = "inproc://test-control";

    struct Harness {
        ctx: zmq::Context,
        backend: zmq::Socket,
        publisher: zmq::Socket,
    }

    impl Harness {
        fn new() -> Self {
            let ctx = zmq::Context::new();
            let backend = ctx.socket(zmq::DEALER).unwrap();
            backend.bind(BACKEND).unwrap();
            let publisher = ctx.socket(zmq::PUB).unwrap();
            publisher.bind(CONTROL).unwrap();
            Self {
                ctx,
                backend,
                publisher,
            }
        }

        fn sockets(&self) -> WorkerSockets {
            let data = self.ctx.socket(zmq::DEALER).unwrap();
            data.connect(BACKEND).unwrap();
            let control = self.ctx.socket(zmq::SUB).unwrap();
            control.set_subscribe(b"").unwrap();
            control.connect(CONTROL).unwrap();
            WorkerSockets::new(data, control)
        }

        fn spawn(&self, worker: &Worker) -> JoinHandle<Result<()>> {
            let sockets = self.sockets();
            let worker = worker.clone();
            thread::spawn(move || worker.run(sockets))
        }

        fn request(&self, identity: &[u8], id: i64, payload: &[u8]) {
            let mut frames = vec![identity.to_vec()];
            frames.extend(encode(id, payload));
            self.backend.send_multipart(frames, 0).unwrap();
        }

        fn reply(&self) -> Envelope {
            Envelope::from_routed(self.backend.recv_multipart(0).unwrap()).unwrap()
        }

        fn stop(&self, handle: JoinHandle<Result<()>>) -> Result<()> {
            // Late subscribers can miss a single publish.
            while !handle.is_finished() {
                self.publisher.send(CMD_STOP, 0).unwrap();
                thread::sleep(Duration::from_millis(10));
            }
            handle.join().unwrap()
        }
    }

    #[test]
    fn test_worker_ids_are_unique() {
        let a = Worker::new(|n: u32| Ok(n));
        let b = a.replicate();
        assert_ne!(a.id(), b.id());
        assert_eq!(a, a.clone());
        assert_ne!(a, b);
        assert!(a.request_type().contains("u32"));
    }

    #[test]
    fn test_replies_preserve_routing_and_id() {
        let harness = Harness::new();
        let worker = Worker::with_codec(|s: String| Ok(s.to_uppercase()), JsonCodec);
        let handle = harness.spawn(&worker);

        harness.request(b"client-7", 1234, br#""shout""#);
        let reply = harness.reply();

        assert_eq!(reply.routing, vec![b"client-7".to_vec()]);
        assert_eq!(reply.correlation_id, 1234);
        let body: ReplyBody<String> = JsonCodec.deserialize(&reply.payload).unwrap();
        assert_eq!(body, ReplyBody::Success("SHOUT".to_string()));

        assert!(harness.stop(handle).is_ok());
    }

    #[test]
    fn test_handler_error_becomes_failure_reply() {
        let harness = Harness::new();
        let worker = Worker::with_codec(
            |n: i32| -> anyhow::Result<i32> {
                anyhow::ensure!(n >= 0, "negative input {n}");
                Ok(n * 2)
            },
            JsonCodec,
        );
        let handle = harness.spawn(&worker);

        harness.request(b"c", 1, b"-4");
        let body: ReplyBody<i32> = JsonCodec.deserialize(&harness.reply().payload).unwrap();
        match body {
            ReplyBody::Failure(failure) => {
                assert_eq!(failure.kind, FailureKind::Handler);
                assert_eq!(failure.message, "negative input -4");
            }
            other => panic!("unexpected body: {other:?}"),
        }

        // The loop keeps serving after a failure.
        harness.request(b"c", 2, b"21");
        let body: ReplyBody<i32> = JsonCodec.deserialize(&harness.reply().payload).unwrap();
        assert_eq!(body, ReplyBody::Success(42));

        assert!(harness.stop(handle).is_ok());
    }

    #[test]
    fn test_panic_and_bad_payload_become_failures() {
        let harness = Harness::new();
        let worker = Worker::with_codec(
            |n: u8| -> anyhow::Result<u8> {
                if n == 0 {
                    panic!("zero is not allowed");
                }
                Ok(n)
            },
            JsonCodec,
        );
        let handle = harness.spawn(&worker);

        harness.request(b"c", 1, b"0");
        let body: ReplyBody<u8> = JsonCodec.deserialize(&harness.reply().payload).unwrap();
        assert_eq!(
            body,
            ReplyBody::Failure(RemoteFailure::new(FailureKind::Panicked, "zero is not allowed"))
        );

        harness.request(b"c", 2, b"{not json");
        let body: ReplyBody<u8> = JsonCodec.deserialize(&harness.reply().payload).unwrap();
        assert!(matches!(
            body,
            ReplyBody::Failure(RemoteFailure {
                kind: FailureKind::Deserialization,
                ..
            })
        ));

        assert!(harness.stop(handle).is_ok());
    }

    #[test]
    fn test_malformed_request_is_dropped() {
        let harness = Harness::new();
        let worker = Worker::with_codec(|n: u8| Ok(n + 1), JsonCodec);
        let handle = harness.spawn(&worker);

        // Non-empty delimiter: no reply, loop continues.
        harness
            .backend
            .send_multipart([b"c".to_vec(), b"1".to_vec(), vec![9], b"x".to_vec()], 0)
            .unwrap();
        harness.request(b"c", 9, b"1");

        let reply = harness.reply();
        assert_eq!(reply.correlation_id, 9);

        assert!(harness.stop(handle).is_ok());
    }

    #[test]
    fn test_context_termination_ends_loop() {
        let harness = Harness::new();
        let worker = Worker::new(|n: u8| Ok(n));
        let handle = harness.spawn(&worker);

        let Harness {
            mut ctx,
            backend,
            publisher,
        } = harness;
        drop(backend);
        drop(publisher);
        ctx.destroy().unwrap();

        let outcome = handle.join().unwrap();
        assert!(matches!(outcome, Err(DispatchError::Terminated)));
    }
}
