//! Request/response lifecycle notifications
//!
//! Observers subscribe to a broadcast channel. Publishing never blocks and
//! never fails the engine; a lagging subscriber only loses events.

use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::routing::ConnectionId;
use crate::rpc::outcome::ErrorCode;
use crate::rpc::types::{NetworkPath, NodeId, RequestId, SourceRouting};

/// Lifecycle event kinds
#[derive(Debug, Clone, PartialEq)]
pub enum RpcEventKind {
    /// Outgoing CALL handed to a connection
    RequestSent {
        request_id: RequestId,
        action: String,
        destination: SourceRouting,
        via: NodeId,
    },
    /// Pending call resolved; `outcome` is the `Outcome::kind` name
    ResponseReceived {
        request_id: RequestId,
        action: String,
        outcome: &'static str,
        runtime: Duration,
    },
    /// CALLRESULT/CALLERROR with no pending call behind it
    Unmatched { request_id: RequestId, from: NodeId },
    /// Frame passed on towards its destination
    Forwarded {
        request_id: RequestId,
        destination: NodeId,
        via: NodeId,
        network_path: NetworkPath,
    },
    /// Frame that could not be delivered or forwarded
    RoutingFailed {
        request_id: RequestId,
        destination: NodeId,
        reason: String,
    },
    /// Incoming CALL answered; `error_code` is `None` for a CALLRESULT
    RequestDispatched {
        request_id: RequestId,
        action: String,
        from: NodeId,
        error_code: Option<ErrorCode>,
    },
    ConnectionOpened { peer: NodeId, connection: ConnectionId },
    ConnectionClosed {
        peer: NodeId,
        connection: ConnectionId,
        cancelled: usize,
    },
}

/// Timestamped lifecycle event from one node
#[derive(Debug, Clone)]
pub struct RpcEvent {
    pub node: NodeId,
    pub at: DateTime<Utc>,
    pub kind: RpcEventKind,
}

/// Broadcast channel of lifecycle events
#[derive(Debug, Clone)]
pub struct EventBus {
    node: NodeId,
    tx: broadcast::Sender<RpcEvent>,
}

impl EventBus {
    pub fn new(node: NodeId, capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { node, tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RpcEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, kind: RpcEventKind) {
        // No subscribers is not an error
        let _ = self.tx.send(RpcEvent {
            node: self.node.clone(),
            at: Utc::now(),
            kind,
        });
    }
}
