//! Request correlation — the pending-call table.
//!
//! Each in-flight call owns one slot, keyed by a correlation id drawn from a
//! strictly monotonic counter that is never recycled. A slot holds the
//! caller's completion channel and the abort handle of its deadline timer.
//!
//! Three events can settle a slot: a matching response, its timer firing, or
//! the connection closing. Whichever removes the slot from the table first is
//! the only one allowed to complete the caller; the others find nothing and
//! do nothing. Id allocation, insertion and the open/closed check all happen
//! under the same lock, so a call can never slip in after `close` drained the
//! table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::AbortHandle;

use super::errors::BridgeError;
use super::types::ResponseOutcome;

/// Outcome delivered to a waiting caller.
pub type CallResult = Result<Value, BridgeError>;

// ─── Slots ───────────────────────────────────────────────────────────────────

struct PendingSlot {
    /// Tool or method name, for error messages.
    label: String,
    created_at: Instant,
    timeout: Duration,
    tx: oneshot::Sender<CallResult>,
    /// Deadline timer; `None` only once the timer itself has claimed the slot.
    timer: Option<AbortHandle>,
}

impl PendingSlot {
    fn settle(mut self, result: CallResult) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        // The receiver may have been dropped by a caller that gave up; fine.
        let _ = self.tx.send(result);
    }
}

struct PendingTable {
    next_id: u64,
    open: bool,
    slots: HashMap<u64, PendingSlot>,
}

// ─── PendingCall ─────────────────────────────────────────────────────────────

/// Caller-side handle for one registered call.
#[derive(Debug)]
pub struct PendingCall {
    pub id: u64,
    rx: oneshot::Receiver<CallResult>,
}

impl PendingCall {
    /// Wait until the call is settled by response, timeout, or close.
    pub async fn wait(self) -> CallResult {
        self.rx
            .await
            .unwrap_or_else(|_| Err(BridgeError::terminated("bridge dropped the pending call")))
    }
}

// ─── RequestCorrelator ───────────────────────────────────────────────────────

/// Pending-call table for one connection.
pub struct RequestCorrelator {
    table: Mutex<PendingTable>,
}

impl RequestCorrelator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(PendingTable {
                next_id: 0,
                open: true,
                slots: HashMap::new(),
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, PendingTable> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate an id, insert a slot, and arm its deadline timer.
    ///
    /// Fails with `Transport` if the connection has been closed.
    pub fn register(self: &Arc<Self>, label: &str, timeout: Duration) -> Result<PendingCall, BridgeError> {
        let (tx, rx) = oneshot::channel();
        let mut table = self.lock();

        if !table.open {
            return Err(BridgeError::transport("connection is closed"));
        }

        table.next_id += 1;
        let id = table.next_id;

        let weak: Weak<Self> = Arc::downgrade(self);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(correlator) = weak.upgrade() {
                correlator.expire(id);
            }
        });

        table.slots.insert(
            id,
            PendingSlot {
                label: label.to_string(),
                created_at: Instant::now(),
                timeout,
                tx,
                timer: Some(timer.abort_handle()),
            },
        );

        tracing::trace!(id, label, pending = table.slots.len(), "registered pending call");
        Ok(PendingCall { id, rx })
    }

    /// Settle a call from a response line. Returns `false` if the id was not
    /// pending (late response after timeout, or an id we never issued).
    pub fn resolve(&self, id: u64, outcome: ResponseOutcome) -> bool {
        let Some(slot) = self.lock().slots.remove(&id) else {
            tracing::debug!(id, "dropping response for unknown or expired id");
            return false;
        };

        let elapsed_ms = slot.created_at.elapsed().as_millis() as u64;
        let result = match outcome {
            ResponseOutcome::Result(value) => {
                tracing::debug!(id, label = %slot.label, elapsed_ms, "call resolved");
                Ok(value)
            }
            ResponseOutcome::Error(err) => {
                tracing::debug!(id, label = %slot.label, elapsed_ms, code = err.code, "call rejected by child");
                Err(BridgeError::Remote {
                    code: err.code,
                    message: err.message,
                    data: err.data,
                })
            }
        };
        slot.settle(result);
        true
    }

    /// Settle a call with a locally produced error (e.g. the write failed).
    pub fn fail(&self, id: u64, error: BridgeError) -> bool {
        let slot = self.lock().slots.remove(&id);
        match slot {
            Some(slot) => {
                slot.settle(Err(error));
                true
            }
            None => false,
        }
    }

    /// Timer path: evict the slot if it is still there.
    fn expire(&self, id: u64) {
        let Some(mut slot) = self.lock().slots.remove(&id) else {
            return;
        };
        // This task is the timer; it must not abort itself.
        slot.timer = None;

        let timeout_ms = slot.timeout.as_millis() as u64;
        tracing::warn!(id, label = %slot.label, timeout_ms, "call timed out");
        let error = BridgeError::Timeout {
            tool: slot.label.clone(),
            timeout_ms,
        };
        slot.settle(Err(error));
    }

    /// Refuse new calls and reject every pending one with `ProcessTerminated`.
    ///
    /// Idempotent; returns the number of calls that were rejected.
    pub fn close(&self, reason: &str) -> usize {
        let drained: Vec<(u64, PendingSlot)> = {
            let mut table = self.lock();
            table.open = false;
            table.slots.drain().collect()
        };

        let count = drained.len();
        if count > 0 {
            tracing::warn!(rejected = count, reason, "rejecting pending calls");
        }
        for (_, slot) in drained {
            slot.settle(Err(BridgeError::terminated(reason)));
        }
        count
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }

    pub fn pending_count(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.lock().slots.contains_key(&id)
    }
}

impl Drop for RequestCorrelator {
    fn drop(&mut self) {
        let table = self.table.get_mut().unwrap_or_else(|e| e.into_inner());
        for slot in table.slots.values_mut() {
            if let Some(timer) = slot.timer.take() {
                timer.abort();
            }
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
