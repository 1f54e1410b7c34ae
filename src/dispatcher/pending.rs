//! Table of calls waiting for a reply.
//!
//! Shared by the sending threads (register) and the receive loop (complete).
//! A completion is removed under the lock and run outside it, so a slow
//! callback never blocks `execute`.

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::error::{DispatchError, Result};
use crate::protocol::CorrelationId;

/// Callback half of a pending call, fed the raw reply payload.
pub(crate) type Completion = Box<dyn FnOnce(Result<Bytes>) + Send>;

struct PendingCall {
    completion: Completion,
    created_at: Instant,
}

struct Table {
    calls: HashMap<CorrelationId, PendingCall>,
    next_id: CorrelationId,
    /// Completions removed from `calls` but still running.
    running: usize,
    closed: bool,
}

impl Table {
    fn is_idle(&self) -> bool {
        self.calls.is_empty() && self.running == 0
    }

    /// Next ID not currently outstanding. Wraps from `i64::MAX` to `i64::MIN`.
    fn allocate_id(&mut self) -> CorrelationId {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.calls.contains_key(&id) {
                return id;
            }
        }
    }
}

pub(crate) struct PendingCalls {
    table: Mutex<Table>,
    settled: Condvar,
}

impl PendingCalls {
    pub(crate) fn new() -> Self {
        Self::starting_at(0)
    }

    pub(crate) fn starting_at(first_id: CorrelationId) -> Self {
        Self {
            table: Mutex::new(Table {
                calls: HashMap::new(),
                next_id: first_id,
                running: 0,
                closed: false,
            }),
            settled: Condvar::new(),
        }
    }

    /// Record a call and return its correlation ID.
    pub(crate) fn register(&self, completion: Completion) -> Result<CorrelationId> {
        let mut table = self.table.lock();
        if table.closed {
            return Err(DispatchError::Closed);
        }
        let id = table.allocate_id();
        table.calls.insert(
            id,
            PendingCall {
                completion,
                created_at: Instant::now(),
            },
        );
        Ok(id)
    }

    /// Run the completion for `id`, at most once.
    ///
    /// Returns `false` if no such call is outstanding (already completed,
    /// abandoned, or never issued).
    pub(crate) fn complete(&self, id: CorrelationId, reply: Result<Bytes>) -> bool {
        let call = {
            let mut table = self.table.lock();
            if table.closed {
                return false;
            }
            let Some(call) = table.calls.remove(&id) else {
                return false;
            };
            table.running += 1;
            call
        };

        debug!(correlation_id = id, elapsed = ?call.created_at.elapsed(), "Reply received");
        let completion = call.completion;
        if panic::catch_unwind(AssertUnwindSafe(move || completion(reply))).is_err() {
            error!(correlation_id = id, "Callback panicked");
        }

        let mut table = self.table.lock();
        table.running -= 1;
        if table.is_idle() {
            self.settled.notify_all();
        }
        true
    }

    /// Drop a call without running it (its request never left).
    pub(crate) fn discard(&self, id: CorrelationId) {
        let mut table = self.table.lock();
        if table.calls.remove(&id).is_some() && table.is_idle() {
            self.settled.notify_all();
        }
    }

    /// Close the table and drop every outstanding call without running it.
    ///
    /// Returns the number of calls abandoned.
    pub(crate) fn abandon_all(&self) -> usize {
        let abandoned = {
            let mut table = self.table.lock();
            table.closed = true;
            std::mem::take(&mut table.calls)
        };
        self.settled.notify_all();

        if let Some(oldest) = abandoned.values().map(|c| c.created_at.elapsed()).max() {
            warn!(
                count = abandoned.len(),
                oldest = ?oldest,
                "Abandoning calls without reply"
            );
        }
        // Completions are dropped here, outside the lock.
        abandoned.len()
    }

    /// Block until no call is outstanding and no callback is running.
    pub(crate) fn wait_idle(&self, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut table = self.table.lock();

        while !table.is_idle() {
            match deadline {
                None => self.settled.wait(&mut table),
                Some(deadline) => {
                    if self.settled.wait_until(&mut table, deadline).timed_out()
                        && !table.is_idle()
                    {
                        return Err(DispatchError::GatherTimeout {
                            outstanding: table.calls.len() + table.running,
                        });
                    }
                }
            }
        }
        Ok(())
    }

    pub(crate) fn len(&self) -> usize {
        self.table.lock().calls.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.table.lock().closed
    }
}
