//! Links between neighbouring nodes
//!
//! A link moves text frames in both directions. Outgoing frames are queued
//! on the [`Connection`](crate::routing::Connection) returned by
//! [`Node::attach`](crate::node::Node::attach); incoming frames are handed
//! to [`Node::receive`](crate::node::Node::receive).
//!
//! - `memory`: in-process links for tests and demos
//! - `ws`: WebSocket links (client and server side)

pub mod memory;
pub mod ws;

use thiserror::Error;

use crate::rpc::types::NodeId;

pub use memory::{link, MemoryLink};

/// Transport failures
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Connection to {0} closed")]
    Closed(NodeId),

    #[error("Outgoing queue to {0} is full")]
    QueueFull(NodeId),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Peer did not identify itself in the request path")]
    MissingNodeId,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
