//! Node configuration

use std::time::Duration;

use crate::rpc::types::NodeId;

/// OCPP 2.1 WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp2.1";

/// Default deadline for outgoing calls
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings for one networking node
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Identity of this node on the overlay
    pub node_id: NodeId,

    /// Deadline applied by `send` when the caller gives none
    pub request_timeout: Duration,

    /// Uplink used when a destination has no direct connection
    pub default_route: Option<NodeId>,

    /// Outgoing frame queue per connection
    pub queue_capacity: usize,

    /// Lifecycle event buffer; slow subscribers lag past this
    pub event_capacity: usize,

    /// WebSocket subprotocol offered and accepted
    pub subprotocol: String,

    /// Largest accepted WebSocket message
    pub max_message_size: usize,

    /// Initial reconnect delay
    pub reconnect_delay: Duration,

    /// Maximum reconnect delay (exponential backoff cap)
    pub max_reconnect_delay: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new("EK3-001"),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            default_route: None,
            queue_capacity: 64,
            event_capacity: 256,
            subprotocol: OCPP_SUBPROTOCOL.to_string(),
            max_message_size: 64 * 1024,
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    /// Set the default call deadline
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Route unknown destinations via this neighbour
    pub fn with_default_route(mut self, uplink: impl Into<NodeId>) -> Self {
        self.default_route = Some(uplink.into());
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    /// Set reconnect backoff bounds
    pub fn with_reconnect_delay(mut self, initial: Duration, max: Duration) -> Self {
        self.reconnect_delay = initial;
        self.max_reconnect_delay = max.max(initial);
        self
    }
}
