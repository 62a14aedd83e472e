//! # OCPP RPC
//!
//! OCPP 2.1 message envelope, source routing and request/response
//! correlation for charging stations, networking nodes and CSMS.
//!
//! Every OCPP action rides on the same substrate: a typed request is
//! turned into a CALL, optionally signed, routed hop by hop across the
//! overlay of networking nodes and tracked until a CALLRESULT, a CALLERROR,
//! a timeout or a connection loss resolves it.
//!
//! ## Architecture
//!
//! ```text
//!  typed request (actions::OcppRequest)
//!       │
//!       ▼
//! ┌───────────────────────────────────────────────┐
//! │ node::Node                                    │
//! │   send ──► security ──► rpc (codec) ──► routing ──► Connection ──► transport
//! │   receive ◄── rpc ◄── routing ◄──────────────────────────────────── transport
//! │      │                                        │
//! │      ├─ CALL ───────────► dispatch::Dispatcher│
//! │      └─ CALLRESULT/ERROR ► correlation        │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! ## Wire forms
//!
//! | Kind | Form |
//! |------|------|
//! | CALL | `[2, id, action, payload]` |
//! | CALLRESULT | `[3, id, payload]` |
//! | CALLERROR | `[4, id, errorCode, errorDescription, errorDetails]` |
//! | routed | `{"sourceRouting": .., "networkPath": [..], "message": [..]}` |
//!
//! ## Usage
//!
//! ```no_run
//! use ocpp_rpc::actions::HeartbeatRequest;
//! use ocpp_rpc::transport::ws;
//! use ocpp_rpc::{Node, NodeConfig, NodeId, SourceRouting};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let node = Node::new(NodeConfig::new("CS001"));
//!     ws::connect(&node, "ws://localhost:9000/ocpp", NodeId::new("CSMS")).await?;
//!
//!     let response = node
//!         .send(SourceRouting::direct("CSMS"), &HeartbeatRequest {})
//!         .await;
//!     println!("{}: {:?}", response.outcome, response.message);
//!
//!     Ok(())
//! }
//! ```

pub mod rpc;
pub mod security;
pub mod routing;
pub mod correlation;
pub mod dispatch;
pub mod actions;
pub mod events;
pub mod config;
pub mod node;
pub mod transport;

pub use config::{NodeConfig, OCPP_SUBPROTOCOL};
pub use node::{Node, NodeBuilder};

// Re-export key types
pub use rpc::{
    Call, CallError, CallResult, ErrorCode, Frame, NetworkPath, NodeId, OcppMessage, Outcome,
    RequestId, Response, SourceRouting,
};
pub use actions::OcppRequest;
pub use dispatch::{Dispatcher, Handler, HandlerError, RequestContext};
pub use events::{RpcEvent, RpcEventKind};
pub use routing::{Connection, ConnectionId, RoutingError};
pub use security::{SignatureError, SignaturePolicy, SigningKeyPair};
pub use transport::LinkError;
