//! Correlation of outgoing calls with their responses
//!
//! Every outgoing call registers a pending entry keyed by its correlation
//! id. The entry is removed exactly once, by whichever comes first:
//!
//! - a matching CALLRESULT or CALLERROR
//! - the deadline firing
//! - the caller cancelling (explicitly or by dropping the waiter)
//! - the owning connection closing
//!
//! Removal happens under the table lock and the waiter is woken after the
//! lock is released, so the first writer wins and every later attempt
//! finds nothing to resolve.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::routing::ConnectionId;
use crate::rpc::messages::{CallError, CallResult};
use crate::rpc::types::{RequestId, SourceRouting};

/// How a pending call ended
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    Result(CallResult),
    Error(CallError),
    Timeout,
    NetworkError(String),
    /// Cancelled by the caller; reported to callers as a timeout
    Cancelled,
}

impl Resolution {
    pub fn kind(&self) -> &'static str {
        match self {
            Resolution::Result(_) => "CallResult",
            Resolution::Error(_) => "CallError",
            Resolution::Timeout => "Timeout",
            Resolution::NetworkError(_) => "NetworkError",
            Resolution::Cancelled => "Cancelled",
        }
    }
}

/// Pending entry, owned by the engine until resolved
struct PendingCall {
    action: String,
    destination: SourceRouting,
    connection: ConnectionId,
    sent_at: Instant,
    waiter: oneshot::Sender<Resolution>,
}

/// What the engine knew about a call it just resolved
#[derive(Debug, Clone)]
pub struct ResolvedCall {
    pub request_id: RequestId,
    pub action: String,
    pub destination: SourceRouting,
    pub connection: ConnectionId,
    pub elapsed: Duration,
}

/// Table of outstanding calls
#[derive(Default)]
pub struct CorrelationEngine {
    pending: Mutex<HashMap<RequestId, PendingCall>>,
}

impl CorrelationEngine {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a call under a fresh correlation id
    ///
    /// The id is generated under the table lock, so it is never one that
    /// is still live.
    pub fn register(
        self: &Arc<Self>,
        action: impl Into<String>,
        destination: SourceRouting,
        connection: ConnectionId,
        timeout: Duration,
    ) -> PendingHandle {
        let (tx, rx) = oneshot::channel();
        let now = Instant::now();
        let entry = PendingCall {
            action: action.into(),
            destination,
            connection,
            sent_at: now,
            waiter: tx,
        };

        let request_id = {
            let mut pending = self.pending.lock();
            let mut id = RequestId::generate();
            while pending.contains_key(&id) {
                id = RequestId::generate();
            }
            pending.insert(id.clone(), entry);
            id
        };

        debug!("Registered pending call {} on {}", request_id, connection);

        PendingHandle {
            engine: Arc::clone(self),
            request_id,
            deadline: now + timeout,
            timeout,
            rx,
            settled: false,
        }
    }

    /// Remove the entry for `id` and wake its waiter
    ///
    /// Returns `None` if nothing is pending under `id`; that covers late
    /// arrivals after a timeout as well as ids that were never sent.
    pub fn resolve(&self, id: &RequestId, resolution: Resolution) -> Option<ResolvedCall> {
        let entry = self.pending.lock().remove(id)?;
        let resolved = ResolvedCall {
            request_id: id.clone(),
            action: entry.action,
            destination: entry.destination,
            connection: entry.connection,
            elapsed: entry.sent_at.elapsed(),
        };

        debug!("Resolved {} ({}) with {}", id, resolved.action, resolution.kind());
        // The waiter may already be gone; nothing else to do then
        let _ = entry.waiter.send(resolution);
        Some(resolved)
    }

    /// Resolve with Timeout; no-op if already resolved
    pub fn expire(&self, id: &RequestId) -> bool {
        self.resolve(id, Resolution::Timeout).is_some()
    }

    /// Resolve on behalf of the caller; no-op if already resolved
    pub fn cancel(&self, id: &RequestId) -> bool {
        self.resolve(id, Resolution::Cancelled).is_some()
    }

    /// Fail every call pending on a connection that went away
    ///
    /// Entries are removed in one critical section and their waiters woken
    /// in correlation-id order. Returns the cancelled ids in that order.
    pub fn cancel_connection(&self, connection: ConnectionId, reason: &str) -> Vec<RequestId> {
        let mut drained: Vec<(RequestId, PendingCall)> = {
            let mut pending = self.pending.lock();
            let ids: Vec<RequestId> = pending
                .iter()
                .filter(|(_, entry)| entry.connection == connection)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| pending.remove(&id).map(|entry| (id, entry)))
                .collect()
        };
        drained.sort_by(|a, b| a.0.cmp(&b.0));

        if !drained.is_empty() {
            warn!(
                "Cancelling {} pending call(s) on {}: {}",
                drained.len(),
                connection,
                reason
            );
        }

        drained
            .into_iter()
            .map(|(id, entry)| {
                let _ = entry
                    .waiter
                    .send(Resolution::NetworkError(reason.to_string()));
                id
            })
            .collect()
    }

    pub fn is_pending(&self, id: &RequestId) -> bool {
        self.pending.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

/// Caller side of a pending call
///
/// Dropping the handle before it settles cancels the entry, so an
/// abandoned `send` never leaves anything behind in the table.
pub struct PendingHandle {
    engine: Arc<CorrelationEngine>,
    request_id: RequestId,
    deadline: Instant,
    timeout: Duration,
    rx: oneshot::Receiver<Resolution>,
    settled: bool,
}

impl PendingHandle {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for the resolution, expiring the entry at the deadline
    pub async fn wait(mut self) -> Resolution {
        let resolution = match tokio::time::timeout_at(self.deadline, &mut self.rx).await {
            Ok(Ok(resolution)) => resolution,
            Ok(Err(_)) => Resolution::NetworkError("Pending call dropped".to_string()),
            Err(_) => {
                // A frame may win the race between the timer and the lock;
                // either way exactly one resolution reaches the channel.
                self.engine.expire(&self.request_id);
                (&mut self.rx).await.unwrap_or(Resolution::Timeout)
            }
        };
        self.settled = true;
        resolution
    }
}

impl Drop for PendingHandle {
    fn drop(&mut self) {
        if !self.settled && self.engine.cancel(&self.request_id) {
            debug!("Pending call {} abandoned by caller", self.request_id);
        }
    }
}
