//! Networking node: the public face of the RPC substrate
//!
//! Outgoing: `send` resolves the route, registers a pending call, signs
//! and encodes the CALL, queues it on the next-hop connection and waits
//! for the resolution.
//!
//! Incoming: `receive` decodes a frame from a neighbour, then either
//! delivers it locally (CALL → dispatcher, CALLRESULT/CALLERROR →
//! correlation engine), forwards it one hop further with this node
//! appended to the network path, or answers a CALL it cannot route with a
//! CALLERROR along the reverse path. Nothing on this path waits for room
//! in an outgoing queue; a full next-hop queue fails the frame like an
//! unreachable hop.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::actions::OcppRequest;
use crate::config::NodeConfig;
use crate::correlation::{CorrelationEngine, Resolution};
use crate::dispatch::{Dispatcher, Handler, RequestContext};
use crate::events::{EventBus, RpcEvent, RpcEventKind};
use crate::routing::{Connection, Route, RoutingError, RoutingTable};
use crate::rpc::frame::Frame;
use crate::rpc::messages::{Call, CallError, OcppMessage};
use crate::rpc::outcome::{ErrorCode, Outcome, Response};
use crate::rpc::types::{NetworkPath, NodeId, RequestId, SourceRouting};
use crate::security::{SignatureEngine, SignaturePolicy};

struct NodeInner {
    config: NodeConfig,
    routes: RoutingTable,
    correlation: Arc<CorrelationEngine>,
    dispatcher: Dispatcher,
    signatures: SignatureEngine,
    events: EventBus,
}

/// One participant of the overlay; cheap to clone
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    pub fn new(config: NodeConfig) -> Self {
        NodeBuilder::new(config).build()
    }

    pub fn builder(config: NodeConfig) -> NodeBuilder {
        NodeBuilder::new(config)
    }

    pub fn id(&self) -> &NodeId {
        &self.inner.config.node_id
    }

    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.inner.routes
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn signatures(&self) -> &SignatureEngine {
        &self.inner.signatures
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RpcEvent> {
        self.inner.events.subscribe()
    }

    /// Number of outgoing calls still waiting for a response
    pub fn pending_calls(&self) -> usize {
        self.inner.correlation.len()
    }

    pub fn is_pending(&self, request_id: &RequestId) -> bool {
        self.inner.correlation.is_pending(request_id)
    }

    // ========================================================================
    // Outgoing
    // ========================================================================

    /// Send a typed request with the configured deadline
    pub async fn send<R: OcppRequest>(
        &self,
        destination: SourceRouting,
        request: &R,
    ) -> Response<R::Response> {
        self.send_with_timeout(destination, request, self.inner.config.request_timeout)
            .await
    }

    pub async fn send_with_timeout<R: OcppRequest>(
        &self,
        destination: SourceRouting,
        request: &R,
        timeout: Duration,
    ) -> Response<R::Response> {
        let payload = match request.to_payload() {
            Ok(payload) => payload,
            Err(e) => {
                return Response::failed(
                    RequestId::generate(),
                    Outcome::FormationViolation {
                        description: format!("Cannot encode {} request: {}", R::ACTION, e),
                    },
                    Duration::ZERO,
                )
            }
        };

        self.send_raw_with_timeout(destination, R::ACTION, payload, timeout)
            .await
            .try_map(R::parse_response)
    }

    /// Send an untyped CALL with the configured deadline
    pub async fn send_raw(
        &self,
        destination: SourceRouting,
        action: &str,
        payload: Value,
    ) -> Response<Value> {
        self.send_raw_with_timeout(destination, action, payload, self.inner.config.request_timeout)
            .await
    }

    pub async fn send_raw_with_timeout(
        &self,
        destination: SourceRouting,
        action: &str,
        payload: Value,
        timeout: Duration,
    ) -> Response<Value> {
        let started = Instant::now();

        let connection = match self.inner.routes.resolve(&destination, &NetworkPath::new()) {
            Ok(Route::Forward(connection)) => connection,
            Ok(Route::Local) => {
                let e = RoutingError::LocalDestination(destination.final_destination().clone());
                return Response::failed(RequestId::generate(), e.into(), started.elapsed());
            }
            Err(e) => {
                warn!("Cannot send {} to {}: {}", action, destination, e);
                return Response::failed(RequestId::generate(), e.into(), started.elapsed());
            }
        };

        // Registered before the frame leaves, so even an instant answer finds it
        let handle = self.inner.correlation.register(
            action,
            destination.clone(),
            connection.id(),
            timeout,
        );
        let request_id = handle.request_id().clone();

        let frame = match self.build_call(&request_id, action, payload, &destination, &connection) {
            Ok(frame) => frame,
            Err(outcome) => return Response::failed(request_id, outcome, started.elapsed()),
        };

        // Waiting for queue room counts against the call's deadline
        match tokio::time::timeout_at(handle.deadline(), connection.send(frame.to_text())).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Failed to send {} ({}): {}", action, request_id, e);
                return Response::failed(
                    request_id,
                    Outcome::NetworkError {
                        description: e.to_string(),
                    },
                    started.elapsed(),
                );
            }
            Err(_) => {
                warn!(
                    "Queue to {} still full at the deadline of {} ({})",
                    connection.peer(),
                    action,
                    request_id
                );
                let resolution = handle.wait().await;
                return self.complete(request_id, action, resolution, timeout, started);
            }
        }

        debug!("{} -> {}: {} ({})", self.id(), connection.peer(), action, request_id);
        self.inner.events.publish(RpcEventKind::RequestSent {
            request_id: request_id.clone(),
            action: action.to_string(),
            destination,
            via: connection.peer().clone(),
        });

        let resolution = handle.wait().await;
        let response = self.complete(request_id, action, resolution, timeout, started);

        self.inner.events.publish(RpcEventKind::ResponseReceived {
            request_id: response.request_id.clone(),
            action: action.to_string(),
            outcome: response.outcome.kind(),
            runtime: response.runtime,
        });
        response
    }

    /// Cancel a pending call; its caller observes a timeout
    pub fn cancel(&self, request_id: &RequestId) -> bool {
        self.inner.correlation.cancel(request_id)
    }

    fn build_call(
        &self,
        request_id: &RequestId,
        action: &str,
        payload: Value,
        destination: &SourceRouting,
        connection: &Connection,
    ) -> Result<Frame, Outcome> {
        let mut call = Call::new(request_id.clone(), action, payload)?;
        call.payload = self.inner.signatures.sign(action, call.payload)?;

        // Plain OCPP when talking straight to the destination
        Ok(match destination {
            SourceRouting::Direct(node) if node == connection.peer() => Frame::bare(call),
            _ => Frame::routed(
                call,
                destination.clone(),
                NetworkPath::from_origin(self.id().clone()),
            ),
        })
    }

    fn complete(
        &self,
        request_id: RequestId,
        action: &str,
        resolution: Resolution,
        timeout: Duration,
        started: Instant,
    ) -> Response<Value> {
        let runtime = started.elapsed();
        let outcome = match resolution {
            Resolution::Result(result) => {
                match self.inner.signatures.verify(action, &result.payload) {
                    Ok(_) => return Response::success(request_id, result.payload, runtime),
                    Err(e) => {
                        warn!("Response to {} ({}) rejected: {}", action, request_id, e);
                        Outcome::from(e)
                    }
                }
            }
            Resolution::Error(error) => Outcome::from(&error),
            Resolution::Timeout => Outcome::Timeout { after: timeout },
            Resolution::Cancelled => Outcome::Timeout { after: runtime },
            Resolution::NetworkError(description) => Outcome::NetworkError { description },
        };

        Response::failed(request_id, outcome, runtime)
    }

    // ========================================================================
    // Connections
    // ========================================================================

    /// Register a connection to `peer`
    ///
    /// The returned receiver yields the frames to write to the wire. A
    /// previous connection to the same peer is replaced and its pending
    /// calls fail with NetworkError.
    pub fn attach(&self, peer: NodeId) -> (Connection, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(self.inner.config.queue_capacity.max(1));
        let connection = Connection::new(peer.clone(), tx);

        if let Some(old) = self.inner.routes.insert(connection.clone()) {
            let reason = format!("Connection to {} replaced", peer);
            let cancelled = self.inner.correlation.cancel_connection(old.id(), &reason);
            self.inner.events.publish(RpcEventKind::ConnectionClosed {
                peer: peer.clone(),
                connection: old.id(),
                cancelled: cancelled.len(),
            });
        }

        info!("{} connected to {} ({})", self.id(), peer, connection.id());
        self.inner.events.publish(RpcEventKind::ConnectionOpened {
            peer,
            connection: connection.id(),
        });
        (connection, rx)
    }

    /// Drop a connection and fail every call pending on it
    ///
    /// Returns the number of cancelled calls.
    pub fn detach(&self, connection: &Connection) -> usize {
        self.inner.routes.remove(connection);
        let reason = format!("Connection to {} closed", connection.peer());
        let cancelled = self
            .inner
            .correlation
            .cancel_connection(connection.id(), &reason)
            .len();

        info!(
            "{} disconnected from {} ({}), {} pending call(s) cancelled",
            self.id(),
            connection.peer(),
            connection.id(),
            cancelled
        );
        self.inner.events.publish(RpcEventKind::ConnectionClosed {
            peer: connection.peer().clone(),
            connection: connection.id(),
            cancelled,
        });
        cancelled
    }

    // ========================================================================
    // Incoming
    // ========================================================================

    /// Handle one text frame received from neighbour `from`
    ///
    /// Never fails: malformed, unroutable and unmatched frames are answered
    /// or logged here. CALLs are dispatched on their own task and forwards
    /// never wait on a congested queue, so the caller's read loop keeps
    /// going.
    pub async fn receive(&self, from: &NodeId, text: &str) {
        debug!("{} <- {}: {}", self.id(), from, text);

        let frame = match Frame::parse(text.as_bytes()) {
            Ok(frame) => frame,
            Err(e) => {
                self.reject_malformed(from, text, e.into());
                return;
            }
        };

        let routed = frame.is_routed();
        // A bare frame comes straight from the neighbour and is for us
        let (routing, path) = match frame.header {
            Some(header) => (header.source_routing, header.network_path),
            None => (
                SourceRouting::Direct(self.id().clone()),
                NetworkPath::from_origin(from.clone()),
            ),
        };

        match self.inner.routes.resolve(&routing, &path) {
            Ok(Route::Local) => self.deliver(from, routed, path, frame.message),
            Ok(Route::Forward(next)) => self.forward(from, next, routing, path, frame.message),
            Err(e) => self.routing_failed(from, routed, &routing, &path, &frame.message, e.into()),
        }
    }

    fn reject_malformed(&self, from: &NodeId, text: &str, outcome: Outcome) {
        warn!("Malformed frame from {}: {}", from, outcome.description());

        if let Some((request_id, header)) = Frame::recover_call(text.as_bytes()) {
            let path = header.map(|h| h.network_path);
            let reply = error_reply(request_id, outcome);
            self.transmit_reply(from, path.as_ref(), reply);
        }
    }

    fn deliver(&self, from: &NodeId, routed: bool, path: NetworkPath, message: OcppMessage) {
        match message {
            OcppMessage::Call(call) => self.spawn_dispatch(from.clone(), routed, path, call),
            OcppMessage::CallResult(result) => {
                let request_id = result.message_id.clone();
                self.resolve_pending(from, request_id, Resolution::Result(result));
            }
            OcppMessage::CallError(error) => {
                let request_id = error.message_id.clone();
                self.resolve_pending(from, request_id, Resolution::Error(error));
            }
        }
    }

    fn resolve_pending(&self, from: &NodeId, request_id: RequestId, resolution: Resolution) {
        if self.inner.correlation.resolve(&request_id, resolution).is_none() {
            warn!(
                "Unmatched response {} from {}: no pending call, discarding",
                request_id, from
            );
            self.inner.events.publish(RpcEventKind::Unmatched {
                request_id,
                from: from.clone(),
            });
        }
    }

    fn spawn_dispatch(&self, from: NodeId, routed: bool, path: NetworkPath, call: Call) {
        let node = self.clone();
        tokio::spawn(async move {
            let ctx = RequestContext {
                request_id: call.message_id.clone(),
                action: call.action.clone(),
                from: path.origin().cloned().unwrap_or_else(|| from.clone()),
                network_path: path.clone(),
            };

            let reply = node.answer(&ctx, call).await;

            node.inner.events.publish(RpcEventKind::RequestDispatched {
                request_id: ctx.request_id.clone(),
                action: ctx.action.clone(),
                from: ctx.from.clone(),
                error_code: match &reply {
                    OcppMessage::CallError(e) => Some(e.error_code.clone()),
                    _ => None,
                },
            });

            // Off the read loop, so waiting for queue room is fine here
            let request_path = routed.then_some(&path);
            if let Some((connection, frame)) = node.reply_frame(&from, request_path, reply) {
                if let Err(e) = connection.send(frame.to_text()).await {
                    warn!("Failed to send reply {}: {}", frame.message.message_id(), e);
                }
            }
        });
    }

    /// Verify, dispatch and sign the answer to an incoming CALL
    async fn answer(&self, ctx: &RequestContext, call: Call) -> OcppMessage {
        if let Err(e) = self.inner.signatures.verify(&call.action, &call.payload) {
            warn!(
                "Rejected {} ({}) from {}: {}",
                call.action, call.message_id, ctx.from, e
            );
            return error_reply(call.message_id, e.into());
        }

        let request_id = call.message_id.clone();
        match self.inner.dispatcher.dispatch_call(ctx, call).await {
            OcppMessage::CallResult(mut result) if self.inner.signatures.signs(&ctx.action) => {
                match self.inner.signatures.sign(&ctx.action, result.payload) {
                    Ok(payload) => {
                        result.payload = payload;
                        result.into()
                    }
                    Err(e) => {
                        warn!("Cannot sign {} response: {}", ctx.action, e);
                        error_reply(
                            request_id,
                            Outcome::InternalError {
                                description: format!("Cannot sign {} response", ctx.action),
                            },
                        )
                    }
                }
            }
            reply => reply,
        }
    }

    fn forward(
        &self,
        from: &NodeId,
        next: Connection,
        routing: SourceRouting,
        visited: NetworkPath,
        message: OcppMessage,
    ) {
        let request_id = message.message_id().clone();
        let mut path = visited.clone();
        path.push(self.id().clone());

        let frame = Frame::routed(message, routing.clone(), path.clone());
        match next.try_send(frame.to_text()) {
            Ok(()) => {
                debug!(
                    "{} forwarded {} towards {} via {}, path {}",
                    self.id(),
                    request_id,
                    routing.final_destination(),
                    next.peer(),
                    path
                );
                self.inner.events.publish(RpcEventKind::Forwarded {
                    request_id,
                    destination: routing.final_destination().clone(),
                    via: next.peer().clone(),
                    network_path: path,
                });
            }
            Err(e) => {
                let outcome = Outcome::NetworkError {
                    description: e.to_string(),
                };
                self.routing_failed(from, true, &routing, &visited, &frame.message, outcome);
            }
        }
    }

    /// Report a frame that could not be delivered or forwarded
    ///
    /// A CALL gets a CALLERROR back along the reverse path; anything else
    /// is only logged.
    fn routing_failed(
        &self,
        from: &NodeId,
        routed: bool,
        routing: &SourceRouting,
        path: &NetworkPath,
        message: &OcppMessage,
        outcome: Outcome,
    ) {
        let destination = routing.final_destination().clone();
        warn!(
            "{} cannot route {} {} to {} (path {}): {}",
            self.id(),
            message.message_type(),
            message.message_id(),
            destination,
            path,
            outcome.description()
        );
        self.inner.events.publish(RpcEventKind::RoutingFailed {
            request_id: message.message_id().clone(),
            destination,
            reason: outcome.description(),
        });

        if let OcppMessage::Call(call) = message {
            let reply = error_reply(call.message_id.clone(), outcome);
            self.transmit_reply(from, routed.then_some(path), reply);
        }
    }

    /// Reply frame for a request from `to`, with the connection it came in on
    ///
    /// A reply to a routed request is itself routed along
    /// `[self] + reverse(path)`.
    fn reply_frame(
        &self,
        to: &NodeId,
        request_path: Option<&NetworkPath>,
        reply: OcppMessage,
    ) -> Option<(Connection, Frame)> {
        let Some(connection) = self.inner.routes.get(to) else {
            warn!(
                "No connection back to {}, dropping reply {}",
                to,
                reply.message_id()
            );
            return None;
        };

        let frame = match request_path.map(|path| SourceRouting::reply_to(self.id(), path)) {
            Some(Ok(route)) => {
                Frame::routed(reply, route, NetworkPath::from_origin(self.id().clone()))
            }
            _ => Frame::bare(reply),
        };
        Some((connection, frame))
    }

    /// Queue a reply from the inbound path without waiting
    fn transmit_reply(&self, to: &NodeId, request_path: Option<&NetworkPath>, reply: OcppMessage) {
        if let Some((connection, frame)) = self.reply_frame(to, request_path, reply) {
            if let Err(e) = connection.try_send(frame.to_text()) {
                warn!("Failed to send reply {}: {}", frame.message.message_id(), e);
            }
        }
    }
}

/// CALLERROR for a failed outcome
fn error_reply(request_id: RequestId, outcome: Outcome) -> OcppMessage {
    match outcome.to_call_error(request_id.clone()) {
        Some(error) => error.into(),
        None => CallError::new(request_id, ErrorCode::InternalError, "No response produced").into(),
    }
}

/// Builder for [`Node`]
pub struct NodeBuilder {
    config: NodeConfig,
    policy: SignaturePolicy,
    dispatcher: Dispatcher,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            policy: SignaturePolicy::default(),
            dispatcher: Dispatcher::new(),
        }
    }

    /// Set node ID
    pub fn node_id(mut self, id: impl Into<NodeId>) -> Self {
        self.config.node_id = id.into();
        self
    }

    /// Set the default call deadline
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    /// Route unknown destinations via this neighbour
    pub fn default_route(mut self, uplink: impl Into<NodeId>) -> Self {
        self.config.default_route = Some(uplink.into());
        self
    }

    pub fn signature_policy(mut self, policy: SignaturePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn handler(self, action: impl Into<String>, handler: Arc<dyn Handler>) -> Self {
        self.dispatcher.register(action, handler);
        self
    }

    /// Build the node
    pub fn build(self) -> Node {
        let routes = RoutingTable::new(self.config.node_id.clone());
        routes.set_default_route(self.config.default_route.clone());
        let events = EventBus::new(self.config.node_id.clone(), self.config.event_capacity);

        Node {
            inner: Arc::new(NodeInner {
                routes,
                correlation: CorrelationEngine::new(),
                dispatcher: self.dispatcher,
                signatures: SignatureEngine::new(self.policy),
                events,
                config: self.config,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::{HeartbeatRequest, HeartbeatResponse};
    use crate::rpc::messages::CallResult;
    use serde_json::json;

    fn node(id: &str) -> Node {
        Node::new(NodeConfig::new(id))
    }

    async fn next_frame(rx: &mut mpsc::Receiver<String>) -> Frame {
        let text = rx.recv().await.unwrap();
        Frame::parse(text.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn test_direct_send_is_bare_and_resolves() {
        let cs = node("CS001");
        let (_conn, mut wire) = cs.attach("CSMS".into());

        let sender = cs.clone();
        let call = tokio::spawn(async move {
            sender
                .send(SourceRouting::direct("CSMS"), &HeartbeatRequest {})
                .await
        });

        let frame = next_frame(&mut wire).await;
        assert!(!frame.is_routed());
        let id = frame.message.message_id().clone();
        assert!(cs.is_pending(&id));

        let answer = CallResult::new(id.clone(), json!({"currentTime": "2024-01-01T00:00:00Z"})).unwrap();
        cs.receive(&"CSMS".into(), &OcppMessage::from(answer).to_text()).await;

        let response = call.await.unwrap();
        assert!(response.is_success());
        assert_eq!(response.request_id, id);
        let message: HeartbeatResponse = response.into_result().unwrap();
        assert_eq!(message.current_time.to_rfc3339(), "2024-01-01T00:00:00+00:00");
        assert_eq!(cs.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_and_local_fail_fast() {
        let cs = node("CS001");

        let response = cs.send_raw(SourceRouting::direct("CSMS"), "Heartbeat", json!({})).await;
        assert_eq!(response.outcome.kind(), "NetworkError");

        let response = cs.send_raw(SourceRouting::direct("CS001"), "Heartbeat", json!({})).await;
        assert_eq!(response.outcome.kind(), "NetworkError");
        assert_eq!(cs.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_payload_is_formation_violation() {
        let cs = node("CS001");
        let (_conn, _wire) = cs.attach("CSMS".into());

        let response = cs.send_raw(SourceRouting::direct("CSMS"), "Heartbeat", json!([1, 2])).await;
        assert_eq!(response.outcome.kind(), "FormationViolation");
        assert_eq!(cs.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_unroutable_call_is_answered_with_call_error() {
        let nn = node("NN1");
        let (_conn, mut back) = nn.attach("CS001".into());

        let call = Call::new(RequestId::new("r1"), "Heartbeat", json!({})).unwrap();
        let frame = Frame::routed(
            call,
            SourceRouting::direct("CSMS"),
            NetworkPath::from_origin("CS001".into()),
        );
        nn.receive(&"CS001".into(), &frame.to_text()).await;

        let reply = next_frame(&mut back).await;
        let header = reply.header.unwrap();
        assert_eq!(
            header.source_routing,
            SourceRouting::path(["NN1", "CS001"]).unwrap()
        );
        match reply.message {
            OcppMessage::CallError(e) => {
                assert_eq!(e.message_id.as_str(), "r1");
                assert_eq!(e.error_code, ErrorCode::GenericError);
            }
            other => panic!("expected CallError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_call_gets_format_violation() {
        let csms = node("CSMS");
        let (_conn, mut back) = csms.attach("CS001".into());

        csms.receive(&"CS001".into(), r#"[2, "r9", "", {}]"#).await;

        let reply = next_frame(&mut back).await;
        match reply.message {
            OcppMessage::CallError(e) => {
                assert_eq!(e.message_id.as_str(), "r9");
                assert_eq!(e.error_code, ErrorCode::FormatViolation);
            }
            other => panic!("expected CallError, got {:?}", other),
        }

        // Garbage without a recoverable id is dropped
        csms.receive(&"CS001".into(), "not json").await;
        assert!(back.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_detach_fails_pending_calls() {
        let cs = node("CS001");
        let (conn, mut wire) = cs.attach("CSMS".into());

        let sender = cs.clone();
        let call = tokio::spawn(async move {
            sender
                .send_raw(SourceRouting::direct("CSMS"), "Heartbeat", json!({}))
                .await
        });
        next_frame(&mut wire).await;

        assert_eq!(cs.detach(&conn), 1);
        let response = call.await.unwrap();
        assert_eq!(response.outcome.kind(), "NetworkError");
        assert!(cs.routes().get(&"CSMS".into()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_on_full_queue_times_out_at_deadline() {
        let cs = Node::new(NodeConfig::new("CS001").with_queue_capacity(1));
        // Nothing drains the queue
        let (_conn, _wire) = cs.attach("CSMS".into());
        let timeout = Duration::from_secs(1);

        let first = cs
            .send_raw_with_timeout(SourceRouting::direct("CSMS"), "Heartbeat", json!({}), timeout)
            .await;
        assert_eq!(first.outcome, Outcome::Timeout { after: timeout });

        let started = Instant::now();
        let second = tokio::time::timeout(
            Duration::from_secs(600),
            cs.send_raw_with_timeout(SourceRouting::direct("CSMS"), "Heartbeat", json!({}), timeout),
        )
        .await
        .expect("send must finish at its own deadline");

        assert_eq!(second.outcome, Outcome::Timeout { after: timeout });
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(!cs.is_pending(&second.request_id));
        assert_eq!(cs.pending_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_congested_next_hop_does_not_stall_receive() {
        let nn = Node::new(NodeConfig::new("NN1").with_queue_capacity(1));
        let (_to_cs, mut back) = nn.attach("CS001".into());
        // CSMS never reads
        let (_to_csms, _stalled) = nn.attach("CSMS".into());

        let routed = |id: &str| {
            let call = Call::new(RequestId::new(id), "Heartbeat", json!({})).unwrap();
            Frame::routed(
                call,
                SourceRouting::direct("CSMS"),
                NetworkPath::from_origin("CS001".into()),
            )
            .to_text()
        };

        nn.receive(&"CS001".into(), &routed("r1")).await;
        let second = tokio::time::timeout(
            Duration::from_secs(2),
            nn.receive(&"CS001".into(), &routed("r2")),
        )
        .await;
        assert!(second.is_ok(), "receive waited on the full CSMS queue");

        let reply = next_frame(&mut back).await;
        assert_eq!(
            reply.header.unwrap().source_routing,
            SourceRouting::path(["NN1", "CS001"]).unwrap()
        );
        match reply.message {
            OcppMessage::CallError(e) => {
                assert_eq!(e.message_id.as_str(), "r2");
                assert_eq!(e.error_code, ErrorCode::GenericError);
                assert_eq!(e.error_details, json!({"result": "NetworkError"}));
            }
            other => panic!("expected CallError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unmatched_response_is_discarded() {
        let cs = node("CS001");
        let (_conn, _wire) = cs.attach("CSMS".into());
        let mut events = cs.subscribe();

        let stray = CallResult::new(RequestId::new("ghost"), json!({})).unwrap();
        cs.receive(&"CSMS".into(), &OcppMessage::from(stray).to_text()).await;

        let event = events.recv().await.unwrap();
        assert!(matches!(event.kind, RpcEventKind::Unmatched { ref request_id, .. } if request_id.as_str() == "ghost"));
    }
}
