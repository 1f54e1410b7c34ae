//! Dispatcher - client side of the request/reply framework.
//!
//! A [`Dispatcher`] sends typed requests to the endpoint registered for their
//! type and runs a callback when the matching reply arrives.
//!
//! # Architecture
//!
//! ```text
//! execute() ─┐                     ┌─► DEALER ─► endpoint A
//! execute() ─┼─► PUSH ═inproc═ PULL ─┤
//! close()   ─┘        receive loop └─► DEALER ─► endpoint B
//!                          │
//!                          └─► pending table ─► callback
//! ```
//!
//! ZeroMQ sockets must not be shared between threads, so every DEALER
//! belongs to the receive loop. Callers hand requests to it over a private
//! `inproc://` pipe and return immediately.
//!
//! # Example
//!
//! ```
//! use std::sync::mpsc;
//! use std::time::Duration;
//! use request_dispatcher::{Dispatcher, WorkerProxy};
//!
//! # fn main() -> request_dispatcher::Result<()> {
//! let mut proxy = WorkerProxy::bind("inproc://lengths")?;
//! proxy.add_workers(2, |text: String| Ok(text.len()))?;
//! proxy.start_workers()?;
//!
//! let dispatcher = Dispatcher::new(proxy.context())?;
//! dispatcher.register_service::<String>("inproc://lengths");
//!
//! let (tx, rx) = mpsc::channel();
//! for word in ["a", "bb", "ccc"] {
//!     let tx = tx.clone();
//!     dispatcher.execute(&word.to_string(), move |reply: request_dispatcher::Result<usize>| {
//!         tx.send(reply.unwrap()).unwrap();
//!     })?;
//! }
//!
//! dispatcher.gather_results(Some(Duration::from_secs(5)))?;
//! let mut lengths: Vec<usize> = rx.try_iter().collect();
//! lengths.sort();
//! assert_eq!(lengths, vec![1, 2, 3]);
//!
//! dispatcher.close()?;
//! proxy.shutdown()?;
//! # Ok(())
//! # }
//! ```

mod pending;

use std::any::{type_name, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, warn};

use crate::codec::{MsgPackCodec, Serializer};
use crate::error::{DispatchError, Result};
use crate::protocol::{
    decode_correlation_id, encode, CorrelationId, Envelope, ReplyBody, ENVELOPE_FRAMES,
};
use crate::transport::{self, classify, recv_frames, try_send_frames, Delivery, SocketOptions};

use pending::{Completion, PendingCalls};

/// Command: forward `[endpoint, payload, id, ""]`.
const CMD_SEND: &[u8] = b"SEND";

/// Command: leave the receive loop.
const CMD_STOP: &[u8] = b"STOP";

/// Back-off while the command pipe is full.
const SEND_RETRY_INTERVAL: Duration = Duration::from_millis(1);

static NEXT_DISPATCHER: AtomicU64 = AtomicU64::new(1);

/// Client that issues requests and correlates replies.
pub struct Dispatcher<C: Serializer = MsgPackCodec> {
    codec: C,
    services: RwLock<HashMap<TypeId, String>>,
    outbound: Mutex<Option<zmq::Socket>>,
    pending: Arc<PendingCalls>,
    receiver: Mutex<Option<JoinHandle<()>>>,
    receiver_thread: ThreadId,
    inbox: String,
}

impl Dispatcher<MsgPackCodec> {
    /// Create a dispatcher with MessagePack payloads.
    pub fn new(context: &zmq::Context) -> Result<Self> {
        Self::with_codec(context, MsgPackCodec)
    }
}

impl<C: Serializer> Dispatcher<C> {
    /// Create a dispatcher with the given codec.
    pub fn with_codec(context: &zmq::Context, codec: C) -> Result<Self> {
        Self::with_options(context, codec, SocketOptions::default())
    }

    /// Create a dispatcher with the given codec and socket options.
    ///
    /// Spawns the receive loop thread.
    pub fn with_options(context: &zmq::Context, codec: C, options: SocketOptions) -> Result<Self> {
        let inbox = format!(
            "inproc://dispatcher-{}",
            NEXT_DISPATCHER.fetch_add(1, Ordering::Relaxed)
        );

        let commands = transport::socket(context, zmq::PULL, &options)?;
        commands.bind(&inbox)?;
        let outbound = transport::socket(context, zmq::PUSH, &options)?;
        outbound.connect(&inbox)?;

        let pending = Arc::new(PendingCalls::new());
        let receive_loop = ReceiveLoop {
            context: context.clone(),
            options,
            commands,
            endpoints: Vec::new(),
            pending: Arc::clone(&pending),
        };
        let receiver = thread::Builder::new()
            .name("dispatcher-recv".to_string())
            .spawn(move || receive_loop.run())?;

        let receiver_thread = receiver.thread().id();
        debug!(inbox = %inbox, "Dispatcher started");

        Ok(Self {
            codec,
            services: RwLock::new(HashMap::new()),
            outbound: Mutex::new(Some(outbound)),
            pending,
            receiver: Mutex::new(Some(receiver)),
            receiver_thread,
            inbox,
        })
    }

    /// Route requests of type `Req` to `endpoint`. Last registration wins.
    pub fn register_service<Req: 'static>(&self, endpoint: impl Into<String>) {
        let endpoint = endpoint.into();
        debug!(request_type = type_name::<Req>(), endpoint = %endpoint, "Service registered");
        self.services.write().insert(TypeId::of::<Req>(), endpoint);
    }

    /// Endpoint registered for `Req`, if any.
    pub fn endpoint_for<Req: 'static>(&self) -> Option<String> {
        self.services.read().get(&TypeId::of::<Req>()).cloned()
    }

    /// Send `request` and return its correlation ID without waiting.
    ///
    /// `callback` runs on the receive loop thread with the decoded reply, or
    /// with the worker's failure as [`DispatchError::Remote`]. It runs at most
    /// once and never after [`close`](Self::close). No other reply is
    /// processed while it runs, so a callback may `execute` or `close` but
    /// not [`gather_results`](Self::gather_results).
    ///
    /// A request that cannot be queued towards its endpoint (the endpoint is
    /// unreachable and its queue is full) completes with
    /// [`DispatchError::Transport`] instead of stalling other calls.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::UnregisteredService`] if no endpoint serves `Req`
    /// - [`DispatchError::Serialization`] if the request cannot be encoded
    /// - [`DispatchError::Closed`] after `close`
    /// - [`DispatchError::Terminated`] if the context is shutting down
    pub fn execute<Req, Rep, F>(&self, request: &Req, callback: F) -> Result<CorrelationId>
    where
        Req: Serialize + 'static,
        Rep: DeserializeOwned + 'static,
        F: FnOnce(Result<Rep>) + Send + 'static,
    {
        let endpoint = self
            .endpoint_for::<Req>()
            .ok_or(DispatchError::UnregisteredService(type_name::<Req>()))?;
        let payload = self.codec.serialize(request)?;

        let codec = self.codec.clone();
        let completion: Completion = Box::new(move |reply: Result<Bytes>| {
            let result = reply
                .and_then(|bytes| codec.deserialize::<ReplyBody<Rep>>(&bytes))
                .and_then(ReplyBody::into_result);
            callback(result);
        });

        let mut outbound = self.outbound.lock();
        let Some(socket) = outbound.as_ref() else {
            return Err(DispatchError::Closed);
        };
        let id = self.pending.register(completion)?;

        let mut frames = Vec::with_capacity(2 + ENVELOPE_FRAMES);
        frames.push(CMD_SEND.to_vec());
        frames.push(endpoint.into_bytes());
        frames.extend(encode(id, &payload));

        match self.push(socket, &frames) {
            Ok(Delivery::Data(())) => Ok(id),
            Ok(Delivery::Terminated) => {
                debug!("Context terminated, closing dispatcher outbound socket");
                self.pending.discard(id);
                *outbound = None;
                Err(DispatchError::Terminated)
            }
            Err(e) => {
                self.pending.discard(id);
                Err(e)
            }
        }
    }

    /// Block until every outstanding call has been answered.
    ///
    /// With a timeout, fails with [`DispatchError::GatherTimeout`] and leaves
    /// the outstanding calls in place for another attempt. Returns at once on
    /// a closed dispatcher.
    ///
    /// Fails with [`DispatchError::CalledFromCallback`] inside a callback,
    /// which would otherwise wait for itself.
    pub fn gather_results(&self, timeout: Option<Duration>) -> Result<()> {
        if self.on_receive_thread() {
            return Err(DispatchError::CalledFromCallback("gather results"));
        }
        self.pending.wait_idle(timeout)
    }

    /// Number of calls still waiting for a reply.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Whether the dispatcher has been closed (or its receive loop has ended).
    pub fn is_closed(&self) -> bool {
        self.pending.is_closed()
    }

    /// Abandon outstanding calls, stop the receive loop and release sockets.
    ///
    /// Idempotent. Abandoned callbacks are dropped without being run.
    /// Called from a callback, the loop stops once that callback returns.
    pub fn close(&self) -> Result<()> {
        let Some(outbound) = self.outbound.lock().take() else {
            return Ok(());
        };

        let abandoned = self.pending.abandon_all();
        if self.on_receive_thread() {
            debug!(inbox = %self.inbox, abandoned, "Dispatcher closed from callback");
            return Ok(());
        }
        let stopped = self.push(&outbound, &[CMD_STOP.to_vec()]);
        drop(outbound);

        if let Some(handle) = self.receiver.lock().take() {
            if handle.join().is_err() {
                error!("Dispatcher receive loop panicked");
            }
        }

        debug!(inbox = %self.inbox, abandoned, "Dispatcher closed");
        match stopped {
            Ok(_) | Err(DispatchError::Closed) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Send on the command pipe without blocking forever on a dead loop.
    fn push(&self, outbound: &zmq::Socket, frames: &[Vec<u8>]) -> Result<Delivery<()>> {
        loop {
            match outbound.send_multipart(frames.iter().map(Vec::as_slice), zmq::DONTWAIT) {
                Err(zmq::Error::EAGAIN) => {
                    // Only the loop itself can drain the pipe.
                    if self.on_receive_thread() {
                        return Err(DispatchError::Transport(zmq::Error::EAGAIN));
                    }
                    if self.receive_loop_finished() {
                        return Err(DispatchError::Closed);
                    }
                    thread::sleep(SEND_RETRY_INTERVAL);
                }
                result => return classify(result),
            }
        }
    }

    fn on_receive_thread(&self) -> bool {
        thread::current().id() == self.receiver_thread
    }

    fn receive_loop_finished(&self) -> bool {
        self.receiver
            .lock()
            .as_ref()
            .map_or(true, JoinHandle::is_finished)
    }
}

impl<C: Serializer> Drop for Dispatcher<C> {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Dispatcher close on drop failed: {}", e);
        }
    }
}

impl<C: Serializer> fmt::Debug for Dispatcher<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("inbox", &self.inbox)
            .field("services", &self.services.read().len())
            .field("pending", &self.pending.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// A DEALER connected to one service endpoint.
struct EndpointSocket {
    address: String,
    socket: zmq::Socket,
}

/// State owned by the receive loop thread.
struct ReceiveLoop {
    context: zmq::Context,
    options: SocketOptions,
    commands: zmq::Socket,
    endpoints: Vec<EndpointSocket>,
    pending: Arc<PendingCalls>,
}

enum Flow {
    Continue,
    Stop,
}

impl ReceiveLoop {
    fn run(mut self) {
        match self.serve() {
            Ok(()) => debug!("Receive loop stopped"),
            Err(DispatchError::Terminated) => {
                debug!("Context terminated, closing dispatcher sockets")
            }
            Err(e) => error!("Receive loop failed: {}", e),
        }

        let ReceiveLoop {
            commands,
            endpoints,
            pending,
            ..
        } = self;
        drop(commands);
        drop(endpoints);
        pending.abandon_all();
    }

    fn serve(&mut self) -> Result<()> {
        loop {
            let ready: Vec<bool> = {
                let mut items = Vec::with_capacity(1 + self.endpoints.len());
                items.push(self.commands.as_poll_item(zmq::POLLIN));
                items.extend(
                    self.endpoints
                        .iter()
                        .map(|e| e.socket.as_poll_item(zmq::POLLIN)),
                );
                transport::poll(&mut items, -1)?.into_data()?;
                items.iter().map(zmq::PollItem::is_readable).collect()
            };

            for (index, _) in ready.iter().enumerate().skip(1).filter(|(_, r)| **r) {
                self.receive_reply(index - 1)?;
            }

            if ready[0] {
                if let Flow::Stop = self.handle_command()? {
                    return Ok(());
                }
            }

            // Closed from a callback, with no STOP on its way.
            if self.pending.is_closed() {
                return Ok(());
            }
        }
    }

    fn receive_reply(&self, index: usize) -> Result<()> {
        let endpoint = &self.endpoints[index];
        let frames = recv_frames(&endpoint.socket)?.into_data()?;

        let envelope = match Envelope::decode(frames) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(endpoint = %endpoint.address, "Discarding malformed reply: {}", e);
                return Ok(());
            }
        };

        let id = envelope.correlation_id;
        if !self.pending.complete(id, Ok(envelope.payload)) {
            warn!(
                correlation_id = id,
                endpoint = %endpoint.address,
                "Discarding reply with no pending call"
            );
        }
        Ok(())
    }

    fn handle_command(&mut self) -> Result<Flow> {
        let mut frames = recv_frames(&self.commands)?.into_data()?;
        let command = frames.first().map(Vec::as_slice);

        if command == Some(CMD_STOP) {
            return Ok(Flow::Stop);
        }
        if command != Some(CMD_SEND) || frames.len() != 2 + ENVELOPE_FRAMES {
            warn!(frames = frames.len(), "Ignoring malformed dispatcher command");
            return Ok(Flow::Continue);
        }

        let request = frames.split_off(2);
        let endpoint = String::from_utf8_lossy(&frames[1]).into_owned();
        self.forward(&endpoint, request)?;
        Ok(Flow::Continue)
    }

    /// Send a request, failing only its own call on a non-fatal error.
    ///
    /// Never blocks: a full endpoint queue fails the call with `EAGAIN`.
    fn forward(&mut self, endpoint: &str, request: Vec<Vec<u8>>) -> Result<()> {
        let id = decode_correlation_id(&request[1])?;

        let outcome = self
            .endpoint_socket(endpoint)
            .and_then(|index| try_send_frames(&self.endpoints[index].socket, request));

        match outcome {
            Ok(Delivery::Data(())) => Ok(()),
            Ok(Delivery::Terminated) | Err(DispatchError::Terminated) => {
                Err(DispatchError::Terminated)
            }
            Err(e) => {
                warn!(correlation_id = id, endpoint, "Request could not be sent: {}", e);
                self.pending.complete(id, Err(e));
                Ok(())
            }
        }
    }

    /// Index of the DEALER for `address`, connecting it on first use.
    fn endpoint_socket(&mut self, address: &str) -> Result<usize> {
        if let Some(index) = self.endpoints.iter().position(|e| e.address == address) {
            return Ok(index);
        }

        let socket = transport::socket(&self.context, zmq::DEALER, &self.options)?;
        socket.connect(address)?;
        debug!(endpoint = address, "Connected to service endpoint");

        self.endpoints.push(EndpointSocket {
            address: address.to_string(),
            socket,
        });
        Ok(self.endpoints.len() - 1)
    }
}
