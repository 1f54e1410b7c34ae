//! Worker proxy - the broker between callers and a pool of worker threads.
//!
//! ```text
//!  Dispatchers ──► ROUTER (frontend) ══ relay ══ DEALER (backend) ──► Workers
//!                                                PUB (control)   ──► Workers
//! ```
//!
//! The relay thread copies frames in both directions without looking at
//! them. The backend DEALER round-robins requests over connected workers; the
//! frontend ROUTER routes replies back by the identity frame it prepended.
//!
//! # Lifecycle
//!
//! `Created → Started → Stopped`, one step at a time:
//!
//! - `add`/`remove`/`clear` only while `Created`
//! - `start_workers` moves `Created → Started`
//! - `shutdown` moves `Started → Stopped`
//!
//! Anything else fails with
//! [`DispatchError::IllegalLifecycleTransition`].
//!
//! # Example
//!
//! ```
//! use request_dispatcher::{Dispatcher, ProxyState, WorkerProxy};
//!
//! # fn main() -> request_dispatcher::Result<()> {
//! let mut proxy = WorkerProxy::bind("inproc://service")?;
//! proxy.add_workers(4, |name: String| Ok(format!("hello {name}")))?;
//! proxy.start_workers()?;
//!
//! let dispatcher = Dispatcher::new(proxy.context())?;
//! dispatcher.register_service::<String>("inproc://service");
//!
//! // Dispatchers on the proxy's context close before it shuts down.
//! dispatcher.close()?;
//! proxy.shutdown()?;
//! assert_eq!(proxy.state(), ProxyState::Stopped);
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::codec::{MsgPackCodec, Serializer};
use crate::config::ProxyConfig;
use crate::error::{DispatchError, Result};
use crate::transport::{
    self, classify, Delivery, SocketOptions, CONTROL_QUEUE_DEPTH, WORKER_CONTROL_ENDPOINT,
    WORKER_PAYLOAD_ENDPOINT, WORKER_QUEUE_DEPTH,
};
use crate::worker::{Worker, WorkerId, WorkerSockets, CMD_STOP};

/// How often STOP is republished while waiting for workers to exit.
const STOP_REPUBLISH_INTERVAL: Duration = Duration::from_millis(20);

/// Proxy lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    /// Accepting worker configuration.
    Created,
    /// Worker threads running.
    Started,
    /// Workers joined, control channel closed.
    Stopped,
}

impl fmt::Display for ProxyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProxyState::Created => "created",
            ProxyState::Started => "started",
            ProxyState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// A worker under management, with its sockets until it starts and its
/// thread afterwards.
struct ManagedWorker {
    worker: Worker,
    sockets: Option<WorkerSockets>,
    thread: Option<JoinHandle<Result<()>>>,
}

/// Broker owning the external endpoint and a set of worker threads.
pub struct WorkerProxy {
    context: zmq::Context,
    owns_context: bool,
    frontend: String,
    options: SocketOptions,
    workers_per_handler: usize,
    control: Option<zmq::Socket>,
    relay: Option<JoinHandle<()>>,
    workers: HashMap<WorkerId, ManagedWorker>,
    state: ProxyState,
}

impl WorkerProxy {
    /// Bind a proxy on `frontend` with a context of its own.
    ///
    /// `shutdown` terminates that context, which also ends the relay.
    pub fn bind(frontend: &str) -> Result<Self> {
        Self::start_relay(zmq::Context::new(), true, frontend, SocketOptions::default())
    }

    /// Bind a proxy on `frontend` inside an existing context.
    ///
    /// `shutdown` leaves the context alone, so the relay keeps running until
    /// the context's owner terminates it.
    pub fn with_context(context: &zmq::Context, frontend: &str) -> Result<Self> {
        Self::start_relay(context.clone(), false, frontend, SocketOptions::default())
    }

    /// Like [`bind`](Self::bind) with socket options and workers per handler
    /// taken from `config`, registering no workers.
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        config.validate()?;
        let mut proxy =
            Self::start_relay(zmq::Context::new(), true, &config.frontend, config.socket)?;
        proxy.workers_per_handler = config.workers_per_handler;
        Ok(proxy)
    }

    fn start_relay(
        context: zmq::Context,
        owns_context: bool,
        frontend: &str,
        options: SocketOptions,
    ) -> Result<Self> {
        let outside = transport::socket(&context, zmq::ROUTER, &options)?;
        outside.bind(frontend)?;

        let payload = transport::socket(&context, zmq::DEALER, &options)?;
        payload.bind(WORKER_PAYLOAD_ENDPOINT)?;

        let control = transport::socket(&context, zmq::PUB, &options)?;
        control.bind(WORKER_CONTROL_ENDPOINT)?;

        let relay = thread::Builder::new()
            .name("proxy-relay".to_string())
            .spawn(move || relay_loop(outside, payload))?;

        info!(frontend, "Worker proxy listening");

        Ok(Self {
            context,
            owns_context,
            frontend: frontend.to_string(),
            options,
            workers_per_handler: 1,
            control: Some(control),
            relay: Some(relay),
            workers: HashMap::new(),
            state: ProxyState::Created,
        })
    }

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> ProxyState {
        self.state
    }

    /// The transport context, for dispatchers reaching the proxy over `inproc://`.
    #[inline]
    pub fn context(&self) -> &zmq::Context {
        &self.context
    }

    /// Frontend endpoint the proxy was bound to.
    #[inline]
    pub fn frontend(&self) -> &str {
        &self.frontend
    }

    /// Number of managed workers.
    #[inline]
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Whether no workers are managed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Whether `worker` is managed by this proxy.
    pub fn contains(&self, worker: &Worker) -> bool {
        self.workers.contains_key(&worker.id())
    }

    fn require(&self, expected: ProxyState, operation: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(DispatchError::IllegalLifecycleTransition {
                operation,
                state: self.state,
            })
        }
    }

    /// Add a worker and wire its sockets to the internal endpoints.
    ///
    /// Returns `Ok(false)` if the worker is already managed; nothing changes
    /// in that case.
    pub fn add(&mut self, worker: Worker) -> Result<bool> {
        self.require(ProxyState::Created, "add a worker")?;
        if self.contains(&worker) {
            return Ok(false);
        }

        let sockets = self.worker_sockets()?;
        debug!(worker = %worker.id(), request_type = worker.request_type(), "Worker added");
        self.workers.insert(
            worker.id(),
            ManagedWorker {
                worker,
                sockets: Some(sockets),
                thread: None,
            },
        );
        Ok(true)
    }

    /// Add the configured number of workers for `handler`.
    ///
    /// One worker unless the proxy was built with
    /// [`from_config`](Self::from_config).
    pub fn add_handler<Req, Rep, F>(&mut self, handler: F) -> Result<Vec<Worker>>
    where
        Req: DeserializeOwned + 'static,
        Rep: Serialize + 'static,
        F: Fn(Req) -> anyhow::Result<Rep> + Send + Sync + 'static,
    {
        self.add_workers(self.workers_per_handler, handler)
    }

    /// Add the configured number of workers for `handler` with `codec`.
    pub fn add_handler_with_codec<Req, Rep, F, C>(
        &mut self,
        handler: F,
        codec: C,
    ) -> Result<Vec<Worker>>
    where
        Req: DeserializeOwned + 'static,
        Rep: Serialize + 'static,
        F: Fn(Req) -> anyhow::Result<Rep> + Send + Sync + 'static,
        C: Serializer,
    {
        self.add_workers_with_codec(self.workers_per_handler, handler, codec)
    }

    /// Add `count` workers sharing one handler, with MessagePack payloads.
    pub fn add_workers<Req, Rep, F>(&mut self, count: usize, handler: F) -> Result<Vec<Worker>>
    where
        Req: DeserializeOwned + 'static,
        Rep: Serialize + 'static,
        F: Fn(Req) -> anyhow::Result<Rep> + Send + Sync + 'static,
    {
        self.add_workers_with_codec(count, handler, MsgPackCodec)
    }

    /// Add `count` workers sharing one handler and codec.
    pub fn add_workers_with_codec<Req, Rep, F, C>(
        &mut self,
        count: usize,
        handler: F,
        codec: C,
    ) -> Result<Vec<Worker>>
    where
        Req: DeserializeOwned + 'static,
        Rep: Serialize + 'static,
        F: Fn(Req) -> anyhow::Result<Rep> + Send + Sync + 'static,
        C: Serializer,
    {
        self.require(ProxyState::Created, "add workers")?;
        let template = Worker::with_codec(handler, codec);
        let mut added = Vec::with_capacity(count);
        for i in 0..count {
            let worker = if i == 0 {
                template.clone()
            } else {
                template.replicate()
            };
            self.add(worker.clone())?;
            added.push(worker);
        }
        Ok(added)
    }

    /// Stop managing `worker`. Its sockets are closed.
    ///
    /// Returns `Ok(false)` if it was not managed.
    pub fn remove(&mut self, worker: &Worker) -> Result<bool> {
        self.require(ProxyState::Created, "remove a worker")?;
        Ok(self.workers.remove(&worker.id()).is_some())
    }

    /// Stop managing every worker.
    pub fn clear(&mut self) -> Result<()> {
        self.require(ProxyState::Created, "clear workers")?;
        self.workers.clear();
        Ok(())
    }

    /// Start one thread per managed worker.
    ///
    /// If a thread cannot be spawned the proxy still moves to `Started`, so
    /// that `shutdown` can stop the workers already running.
    pub fn start_workers(&mut self) -> Result<()> {
        self.start_workers_with(spawn_worker)
    }

    fn start_workers_with<S>(&mut self, mut spawn: S) -> Result<()>
    where
        S: FnMut(Worker, WorkerSockets) -> std::io::Result<JoinHandle<Result<()>>>,
    {
        self.require(ProxyState::Created, "start workers")?;
        self.state = ProxyState::Started;

        let mut outcome = Ok(());
        for managed in self.workers.values_mut() {
            let Some(sockets) = managed.sockets.take() else {
                continue;
            };
            if outcome.is_err() {
                // Never started: close its sockets so the context can terminate.
                drop(sockets);
                continue;
            }
            match spawn(managed.worker.clone(), sockets) {
                Ok(handle) => managed.thread = Some(handle),
                Err(e) => {
                    error!(worker = %managed.worker.id(), "Failed to spawn worker thread: {}", e);
                    outcome = Err(DispatchError::Io(e));
                }
            }
        }

        if outcome.is_ok() {
            info!(workers = self.workers.len(), "Workers started");
        }
        outcome
    }

    /// Stop and join every worker, then release the control channel.
    ///
    /// Terminates the context when the proxy owns it, which ends the relay
    /// and closes the frontend and backend sockets. Blocks until every socket
    /// in the context is closed, so dispatchers sharing the context must be
    /// closed first.
    ///
    /// # Errors
    ///
    /// [`DispatchError::Terminated`] if the context was terminated underneath
    /// the proxy. Workers and relay have still been joined and the proxy is
    /// `Stopped`. Any other failure to publish STOP is returned before
    /// joining, leaving the proxy `Started`.
    pub fn shutdown(&mut self) -> Result<()> {
        self.require(ProxyState::Started, "shut down")?;

        match self.stop_workers() {
            Ok(()) => {}
            Err(DispatchError::Terminated) => return self.finish_terminated(),
            Err(e) => return Err(e),
        }
        self.join_workers();
        self.control = None;

        if self.owns_context {
            self.context.destroy()?;
            if let Some(relay) = self.relay.take() {
                if relay.join().is_err() {
                    error!("Relay thread panicked");
                }
            }
        }

        self.state = ProxyState::Stopped;
        info!(frontend = %self.frontend, "Worker proxy stopped");
        Ok(())
    }

    /// Wind down after termination: every thread exits on its own `ETERM`.
    fn finish_terminated(&mut self) -> Result<()> {
        self.control = None;
        self.join_workers();
        if let Some(relay) = self.relay.take() {
            if relay.join().is_err() {
                error!("Relay thread panicked");
            }
        }

        self.state = ProxyState::Stopped;
        warn!(frontend = %self.frontend, "Context terminated during shutdown");
        Err(DispatchError::Terminated)
    }

    /// Publish STOP until every worker thread has exited.
    ///
    /// A subscription may still be in flight when the first STOP goes out,
    /// so one publish is not enough.
    fn stop_workers(&self) -> Result<()> {
        let Some(control) = self.control.as_ref() else {
            return Ok(());
        };

        loop {
            match classify(control.send(CMD_STOP, 0)) {
                Ok(Delivery::Data(())) => {}
                Ok(Delivery::Terminated) => {
                    debug!("Context terminated while publishing STOP");
                    return Err(DispatchError::Terminated);
                }
                Err(e) => {
                    error!("Failed to publish STOP: {}", e);
                    return Err(e);
                }
            }

            let running = self
                .workers
                .values()
                .filter(|m| m.thread.as_ref().is_some_and(|t| !t.is_finished()))
                .count();
            if running == 0 {
                return Ok(());
            }
            thread::sleep(STOP_REPUBLISH_INTERVAL);
        }
    }

    fn join_workers(&mut self) {
        for (id, managed) in self.workers.iter_mut() {
            let Some(handle) = managed.thread.take() else {
                continue;
            };
            match handle.join() {
                Ok(Ok(())) | Ok(Err(DispatchError::Terminated)) => {}
                Ok(Err(e)) => warn!(worker = %id, "Worker exited with error: {}", e),
                Err(_) => error!(worker = %id, "Worker thread panicked"),
            }
        }
    }

    fn worker_sockets(&self) -> Result<WorkerSockets> {
        let data_options = self.options.with_queue_depth(WORKER_QUEUE_DEPTH);
        let data = transport::socket(&self.context, zmq::DEALER, &data_options)?;
        data.connect(WORKER_PAYLOAD_ENDPOINT)?;

        let control_options = self.options.with_queue_depth(CONTROL_QUEUE_DEPTH);
        let control = transport::socket(&self.context, zmq::SUB, &control_options)?;
        control.set_subscribe(b"")?;
        control.connect(WORKER_CONTROL_ENDPOINT)?;

        Ok(WorkerSockets::new(data, control))
    }
}

impl Drop for WorkerProxy {
    fn drop(&mut self) {
        match self.state {
            ProxyState::Started => match self.shutdown() {
                Ok(()) | Err(DispatchError::Terminated) => {}
                Err(e) => error!("Shutdown on drop failed: {}", e),
            },
            ProxyState::Created => {
                // Never-started workers still hold sockets in the context.
                self.workers.clear();
                self.control = None;
                if self.owns_context {
                    if let Err(e) = self.context.destroy() {
                        error!("Context termination on drop failed: {}", e);
                    }
                    if let Some(relay) = self.relay.take() {
                        if relay.join().is_err() {
                            error!("Relay thread panicked");
                        }
                    }
                }
            }
            ProxyState::Stopped => {}
        }
    }
}

impl fmt::Debug for WorkerProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerProxy")
            .field("frontend", &self.frontend)
            .field("state", &self.state)
            .field("workers", &self.workers.len())
            .field("workers_per_handler", &self.workers_per_handler)
            .field("owns_context", &self.owns_context)
            .finish()
    }
}

fn spawn_worker(worker: Worker, sockets: WorkerSockets) -> std::io::Result<JoinHandle<Result<()>>> {
    thread::Builder::new()
        .name(worker.id().to_string())
        .spawn(move || worker.run(sockets))
}

/// Relay frames between frontend and backend until the context terminates.
fn relay_loop(outside: zmq::Socket, payload: zmq::Socket) {
    match classify(zmq::proxy(&outside, &payload)) {
        Ok(Delivery::Terminated) => debug!("Context terminated, closing relay sockets"),
        Ok(Delivery::Data(())) => {}
        Err(e) => error!("Relay failed: {}", e),
    }
    drop(outside);
    drop(payload);
    info!("Relay terminated");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(name: &str) -> WorkerProxy {
        WorkerProxy::bind(&format!("inproc://{name}")).unwrap()
    }

    fn echo_worker() -> Worker {
        Worker::new(|s: String| Ok(s))
    }

    #[test]
    fn test_starts_in_created_state() {
        let proxy = proxy("created");
        assert_eq!(proxy.state(), ProxyState::Created);
        assert!(proxy.is_empty());
        assert_eq!(proxy.frontend(), "inproc://created");
    }

    #[test]
    fn test_add_is_idempotent() {
        let mut proxy = proxy("idempotent");
        let worker = echo_worker();

        assert!(proxy.add(worker.clone()).unwrap());
        assert!(!proxy.add(worker.clone()).unwrap());
        assert_eq!(proxy.len(), 1);

        assert!(proxy.add(worker.replicate()).unwrap());
        assert_eq!(proxy.len(), 2);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut proxy = proxy("remove");
        let a = echo_worker();
        let b = echo_worker();
        proxy.add(a.clone()).unwrap();
        proxy.add(b.clone()).unwrap();

        assert!(proxy.remove(&a).unwrap());
        assert!(!proxy.remove(&a).unwrap());
        assert!(proxy.contains(&b));

        proxy.clear().unwrap();
        assert!(proxy.is_empty());
    }

    #[test]
    fn test_add_workers_creates_distinct_workers() {
        let mut proxy = proxy("bulk");
        let added = proxy.add_workers(3, |n: u32| Ok(n + 1)).unwrap();
        assert_eq!(added.len(), 3);
        assert_eq!(proxy.len(), 3);
        assert!(added.iter().all(|w| proxy.contains(w)));
    }

    #[test]
    fn test_add_handler_uses_configured_count() {
        let config = ProxyConfig::new("inproc://configured").workers_per_handler(4);
        let mut configured = WorkerProxy::from_config(&config).unwrap();
        let added = configured.add_handler(|n: u32| Ok(n * 2)).unwrap();
        assert_eq!(added.len(), 4);

        let mut plain = proxy("single");
        assert_eq!(plain.add_handler(|s: String| Ok(s)).unwrap().len(), 1);
    }

    #[test]
    fn test_from_config_rejects_invalid() {
        let config = ProxyConfig::new("inproc://invalid").workers_per_handler(0);
        assert!(matches!(
            WorkerProxy::from_config(&config),
            Err(DispatchError::Config(_))
        ));
    }

    #[test]
    fn test_start_and_shutdown() {
        let mut proxy = proxy("start-stop");
        proxy.add_workers(2, |s: String| Ok(s)).unwrap();

        proxy.start_workers().unwrap();
        assert_eq!(proxy.state(), ProxyState::Started);

        proxy.shutdown().unwrap();
        assert_eq!(proxy.state(), ProxyState::Stopped);
        assert!(proxy
            .workers
            .values()
            .all(|m| m.thread.is_none() && m.sockets.is_none()));
    }

    #[test]
    fn test_shutdown_before_start_is_illegal() {
        let mut proxy = proxy("early-shutdown");
        let err = proxy.shutdown().unwrap_err();
        assert!(matches!(
            err,
            DispatchError::IllegalLifecycleTransition {
                state: ProxyState::Created,
                ..
            }
        ));
    }

    #[test]
    fn test_start_twice_is_illegal() {
        let mut proxy = proxy("double-start");
        proxy.start_workers().unwrap();
        assert!(matches!(
            proxy.start_workers(),
            Err(DispatchError::IllegalLifecycleTransition { .. })
        ));
        proxy.shutdown().unwrap();
        assert!(matches!(
            proxy.start_workers(),
            Err(DispatchError::IllegalLifecycleTransition {
                state: ProxyState::Stopped,
                ..
            })
        ));
        assert!(proxy.shutdown().is_err());
    }

    #[test]
    fn test_configuration_locked_after_start() {
        let mut proxy = proxy("locked");
        let worker = echo_worker();
        proxy.add(worker.clone()).unwrap();
        proxy.start_workers().unwrap();

        assert!(proxy.add(echo_worker()).is_err());
        assert!(proxy.remove(&worker).is_err());
        assert!(proxy.clear().is_err());
        assert_eq!(proxy.len(), 1);

        proxy.shutdown().unwrap();
    }

    #[test]
    fn test_drop_without_start_releases_context() {
        let mut proxy = proxy("dropped");
        proxy.add(echo_worker()).unwrap();
        drop(proxy);
    }

    #[test]
    fn test_failed_spawn_releases_unstarted_sockets() {
        let mut proxy = proxy("spawn-failure");
        proxy.add_workers(3, |s: String| Ok(s)).unwrap();

        let mut spawned = 0;
        let err = proxy
            .start_workers_with(|worker, sockets| {
                spawned += 1;
                if spawned > 1 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "thread limit reached",
                    ));
                }
                spawn_worker(worker, sockets)
            })
            .unwrap_err();
        assert!(matches!(err, DispatchError::Io(_)));
        assert_eq!(proxy.state(), ProxyState::Started);
        assert!(proxy.workers.values().all(|m| m.sockets.is_none()));
        assert_eq!(
            proxy.workers.values().filter(|m| m.thread.is_some()).count(),
            1
        );

        // No socket is left open, so terminating the context completes.
        proxy.shutdown().unwrap();
        assert_eq!(proxy.state(), ProxyState::Stopped);
    }

    #[test]
    fn test_shutdown_reports_external_termination() {
        let mut ctx = zmq::Context::new();
        let mut proxy = WorkerProxy::with_context(&ctx, "inproc://terminated").unwrap();
        proxy.add_workers(2, |s: String| Ok(s)).unwrap();
        proxy.start_workers().unwrap();

        let destroyer = thread::spawn(move || ctx.destroy());

        // Workers see ETERM and exit without any STOP.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !proxy
            .workers
            .values()
            .all(|m| m.thread.as_ref().map_or(true, |t| t.is_finished()))
        {
            assert!(std::time::Instant::now() < deadline, "workers still running");
            thread::sleep(Duration::from_millis(5));
        }

        let err = proxy.shutdown().unwrap_err();
        assert!(matches!(err, DispatchError::Terminated));
        assert!(err.is_io());
        assert_eq!(proxy.state(), ProxyState::Stopped);

        // Releasing the control socket lets termination finish.
        destroyer.join().unwrap().unwrap();
    }

    #[test]
    fn test_external_context_survives_shutdown() {
        let mut ctx = zmq::Context::new();
        let mut proxy = WorkerProxy::with_context(&ctx, "inproc://shared").unwrap();
        proxy.add(echo_worker()).unwrap();
        proxy.start_workers().unwrap();
        proxy.shutdown().unwrap();

        // The context still works; the relay is still bound.
        let probe = ctx.socket(zmq::DEALER).unwrap();
        probe.connect("inproc://shared").unwrap();
        drop(probe);

        // Terminating it ends the relay.
        drop(proxy);
        ctx.destroy().unwrap();
    }
}
