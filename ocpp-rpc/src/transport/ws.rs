//! WebSocket links
//!
//! Handles:
//! - client connections with the OCPP subprotocol (`connect`)
//! - automatic reconnection with exponential backoff (`connect_with_retry`)
//! - server-side handshakes that learn the peer id from the URL path
//!   (`accept`, `listen`)
//!
//! Once the handshake is done both sides run the same link loop: a sender
//! task drains the connection queue into the socket while the reader hands
//! every text frame to the node.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    accept_hdr_async_with_config, connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        handshake::server::{ErrorResponse, Request, Response},
        http::{header, HeaderValue, StatusCode},
        protocol::WebSocketConfig,
        Message,
    },
    WebSocketStream,
};
use tracing::{debug, error, info, warn};

use super::LinkError;
use crate::node::Node;
use crate::rpc::types::NodeId;

/// Build the WebSocket URL a node connects to: `<base>/<node id>`
pub fn build_url(base_url: &str, node_id: &NodeId) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), node_id)
}

fn ws_config(node: &Node) -> WebSocketConfig {
    let max = node.config().max_message_size;
    WebSocketConfig {
        max_message_size: Some(max),
        max_frame_size: Some(max),
        ..Default::default()
    }
}

/// Connect to `peer` at `base_url` and run the link in the background
///
/// The returned task finishes when the socket closes; by then the
/// connection has been detached and its pending calls failed.
pub async fn connect(node: &Node, base_url: &str, peer: NodeId) -> Result<JoinHandle<()>, LinkError> {
    let url = build_url(base_url, node.id());
    let subprotocol = &node.config().subprotocol;

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| LinkError::InvalidUrl(format!("{}: {}", url, e)))?;
    let protocol = HeaderValue::from_str(subprotocol)
        .map_err(|_| LinkError::InvalidUrl(format!("Invalid subprotocol {}", subprotocol)))?;
    request
        .headers_mut()
        .insert(header::SEC_WEBSOCKET_PROTOCOL, protocol);

    let (ws_stream, response) =
        connect_async_with_config(request, Some(ws_config(node)), false).await?;

    // Verify subprotocol
    let accepted = response
        .headers()
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok());
    if accepted != Some(subprotocol.as_str()) {
        warn!("{} did not accept subprotocol {}, got {:?}", peer, subprotocol, accepted);
    }

    info!("WebSocket connected to {} at {}", peer, url);
    Ok(tokio::spawn(run_link(node.clone(), peer, ws_stream)))
}

/// Keep a link to `peer` up, reconnecting with exponential backoff
///
/// Only returns if the URL itself is unusable.
pub async fn connect_with_retry(node: Node, base_url: String, peer: NodeId) -> Result<(), LinkError> {
    let initial = node.config().reconnect_delay;
    let max = node.config().max_reconnect_delay;
    let mut delay = initial;

    loop {
        info!("Connecting to {}: {}", peer, base_url);

        match connect(&node, &base_url, peer.clone()).await {
            Ok(link) => {
                if let Err(e) = link.await {
                    error!("Link task to {} failed: {}", peer, e);
                }
                delay = initial;
            }
            Err(e @ LinkError::InvalidUrl(_)) => return Err(e),
            Err(e) => error!("Connection to {} failed: {}", peer, e),
        }

        info!("Reconnecting to {} in {:?}", peer, delay);
        tokio::time::sleep(delay).await;
        delay = std::cmp::min(delay * 2, max);
    }
}

/// Server side handshake; the peer id is the last segment of the path
pub async fn accept<S>(node: &Node, stream: S) -> Result<JoinHandle<()>, LinkError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let subprotocol = node.config().subprotocol.clone();
    let mut peer: Option<NodeId> = None;

    let callback = |request: &Request, mut response: Response| -> Result<Response, ErrorResponse> {
        let id = request
            .uri()
            .path()
            .rsplit('/')
            .next()
            .filter(|segment| !segment.is_empty());
        let Some(id) = id else {
            let mut rejection = ErrorResponse::new(Some("Missing node id in path".to_string()));
            *rejection.status_mut() = StatusCode::BAD_REQUEST;
            return Err(rejection);
        };
        peer = Some(NodeId::new(id));

        let offered = request
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(',').any(|p| p.trim() == subprotocol))
            .unwrap_or(false);
        if offered {
            if let Ok(value) = HeaderValue::from_str(&subprotocol) {
                response
                    .headers_mut()
                    .insert(header::SEC_WEBSOCKET_PROTOCOL, value);
            }
        } else {
            warn!("{} did not offer subprotocol {}", id, subprotocol);
        }
        Ok(response)
    };

    let ws_stream = accept_hdr_async_with_config(stream, callback, Some(ws_config(node))).await?;
    let peer = peer.ok_or(LinkError::MissingNodeId)?;

    info!("WebSocket accepted from {}", peer);
    Ok(tokio::spawn(run_link(node.clone(), peer, ws_stream)))
}

/// Accept WebSocket links on `addr` until the listener fails
pub async fn listen(node: Node, addr: SocketAddr) -> Result<(), LinkError> {
    let listener = TcpListener::bind(addr).await?;
    info!("{} listening on ws://{}", node.id(), listener.local_addr()?);

    loop {
        let (stream, remote) = listener.accept().await?;
        let node = node.clone();
        tokio::spawn(async move {
            if let Err(e) = accept::<TcpStream>(&node, stream).await {
                warn!("Handshake with {} failed: {}", remote, e);
            }
        });
    }
}

async fn run_link<S>(node: Node, peer: NodeId, ws_stream: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (connection, mut outgoing) = node.attach(peer.clone());
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    // Spawn sender task
    let sender = tokio::spawn(async move {
        while let Some(text) = outgoing.recv().await {
            if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                error!("Failed to send WebSocket message: {}", e);
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => node.receive(&peer, text.as_str()).await,
            Ok(Message::Binary(_)) => warn!("Ignoring binary frame from {}", peer),
            Ok(Message::Close(_)) => {
                info!("WebSocket closed by {}", peer);
                break;
            }
            // Ping/pong handled by tungstenite
            Ok(_) => debug!("Control frame from {}", peer),
            Err(e) => {
                error!("WebSocket error from {}: {}", peer, e);
                break;
            }
        }
    }

    sender.abort();
    node.detach(&connection);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::rpc::types::SourceRouting;
    use serde_json::json;

    #[test]
    fn test_build_url() {
        let id = NodeId::new("CS001");
        assert_eq!(build_url("ws://localhost:9000/ocpp", &id), "ws://localhost:9000/ocpp/CS001");
        assert_eq!(build_url("ws://localhost:9000/ocpp/", &id), "ws://localhost:9000/ocpp/CS001");
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let node = Node::new(NodeConfig::new("CS001"));
        let result = connect(&node, "not a url", NodeId::new("CSMS")).await;
        assert!(matches!(result, Err(LinkError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_call_over_loopback_websocket() {
        let csms = Node::new(NodeConfig::new("CSMS"));
        csms.dispatcher()
            .register_fn("Heartbeat", |_ctx, _payload| async move {
                Ok(json!({"currentTime": "2024-01-01T00:00:00Z"}))
            });

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = csms.clone();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            accept(&server, stream).await.unwrap();
        });

        let cs = Node::new(NodeConfig::new("CS001"));
        let link = connect(&cs, &format!("ws://{}/ocpp", addr), NodeId::new("CSMS"))
            .await
            .unwrap();

        // The server registers its side once the handshake completes
        while csms.routes().get(&NodeId::new("CS001")).is_none() {
            tokio::task::yield_now().await;
        }
        while cs.routes().get(&NodeId::new("CSMS")).is_none() {
            tokio::task::yield_now().await;
        }

        let response = cs
            .send_raw(SourceRouting::direct("CSMS"), "Heartbeat", json!({}))
            .await;
        assert!(response.is_success(), "{}", response.outcome);
        link.abort();
    }
}
