//! In-process links
//!
//! Two nodes in the same process exchange text frames through their
//! connection queues, one pump task per direction. Used to run whole
//! overlays inside a test or the demo binary.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::node::Node;
use crate::routing::Connection;
use crate::rpc::types::NodeId;

/// Bidirectional in-memory link between two nodes
pub struct MemoryLink {
    a: Node,
    b: Node,
    a_to_b: Connection,
    b_to_a: Connection,
    pumps: [JoinHandle<()>; 2],
}

/// Connect `a` and `b` directly
pub fn link(a: &Node, b: &Node) -> MemoryLink {
    let (a_to_b, a_out) = a.attach(b.id().clone());
    let (b_to_a, b_out) = b.attach(a.id().clone());

    let pumps = [
        tokio::spawn(pump(a_out, a.id().clone(), b.clone())),
        tokio::spawn(pump(b_out, b.id().clone(), a.clone())),
    ];

    MemoryLink {
        a: a.clone(),
        b: b.clone(),
        a_to_b,
        b_to_a,
        pumps,
    }
}

async fn pump(mut outgoing: mpsc::Receiver<String>, from: NodeId, to: Node) {
    while let Some(text) = outgoing.recv().await {
        to.receive(&from, &text).await;
    }
    debug!("Memory link {} -> {} drained", from, to.id());
}

impl MemoryLink {
    pub fn ends(&self) -> (&NodeId, &NodeId) {
        (self.a.id(), self.b.id())
    }

    pub fn is_open(&self) -> bool {
        !self.a_to_b.is_closed() && !self.b_to_a.is_closed()
    }

    /// Tear the link down on both sides
    ///
    /// Frames still queued are lost. Returns the number of pending calls
    /// cancelled across both nodes.
    pub fn close(self) -> usize {
        for pump in &self.pumps {
            pump.abort();
        }
        self.a.detach(&self.a_to_b) + self.b.detach(&self.b_to_a)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::rpc::types::SourceRouting;
    use serde_json::json;

    #[tokio::test]
    async fn test_link_carries_calls_both_ways() {
        let a = Node::new(NodeConfig::new("A"));
        let b = Node::new(NodeConfig::new("B"));
        b.dispatcher()
            .register_fn("Ping", |ctx, _payload| async move { Ok(json!({"from": ctx.from.as_str()})) });
        a.dispatcher()
            .register_fn("Ping", |_ctx, _payload| async move { Ok(json!({"pong": true})) });

        let link = link(&a, &b);
        assert!(link.is_open());
        assert_eq!(link.ends(), (a.id(), b.id()));

        let response = a.send_raw(SourceRouting::direct("B"), "Ping", json!({})).await;
        assert_eq!(response.message, Some(json!({"from": "A"})));

        let response = b.send_raw(SourceRouting::direct("A"), "Ping", json!({})).await;
        assert!(response.is_success());

        assert_eq!(link.close(), 0);
        assert!(a.routes().peers().is_empty());
        assert!(b.routes().peers().is_empty());
    }
}
