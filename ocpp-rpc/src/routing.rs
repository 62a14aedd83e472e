//! Source routing across networking nodes
//!
//! The routing table maps neighbour node ids to live connections. It is
//! read on every send and forward, and written only when a connection opens
//! or closes.
//!
//! Resolution for a message at node `current` that has already traversed
//! `visited`:
//! 1. `current` already in `visited` → routing loop, fail closed
//! 2. final destination is `current` → deliver locally
//! 3. otherwise pick the next hop (direct destination, or first unvisited
//!    hop of the path) and use its connection, falling back to the
//!    default route (uplink) when there is no direct connection

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info};

use crate::rpc::types::{NetworkPath, NodeId, SourceRouting};
use crate::transport::LinkError;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Routing failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("Source routing path must not be empty")]
    EmptyPath,

    #[error("Source routing path repeats hop {0}")]
    RepeatedHop(NodeId),

    #[error("Unreachable: no connection towards {0}")]
    Unreachable(NodeId),

    #[error("Routing loop: {node} already in network path {path}")]
    Loop { node: NodeId, path: NetworkPath },

    #[error("Destination {0} is the local node")]
    LocalDestination(NodeId),
}

/// Identity of one connection instance; a reconnect gets a new id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    #[cfg(test)]
    pub(crate) fn for_tests(n: u64) -> Self {
        ConnectionId(n)
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Outgoing side of a connection to a neighbour
///
/// Frames are queued as text; the transport owning the receiving end
/// writes them to the wire.
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    peer: NodeId,
    tx: mpsc::Sender<String>,
}

impl Connection {
    pub fn new(peer: NodeId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id: ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)),
            peer,
            tx,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &NodeId {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Queue a frame for the wire, waiting for room in the queue
    pub async fn send(&self, text: String) -> Result<(), LinkError> {
        self.tx
            .send(text)
            .await
            .map_err(|_| LinkError::Closed(self.peer.clone()))
    }

    /// Queue a frame without waiting; a full queue is an error
    pub fn try_send(&self, text: String) -> Result<(), LinkError> {
        self.tx.try_send(text).map_err(|e| match e {
            TrySendError::Full(_) => LinkError::QueueFull(self.peer.clone()),
            TrySendError::Closed(_) => LinkError::Closed(self.peer.clone()),
        })
    }
}

/// Where a message goes next
#[derive(Debug, Clone)]
pub enum Route {
    /// This node is the final destination
    Local,
    /// Send over this connection
    Forward(Connection),
}

/// Neighbour connections plus the optional default route
pub struct RoutingTable {
    local: NodeId,
    connections: RwLock<HashMap<NodeId, Connection>>,
    default_route: RwLock<Option<NodeId>>,
}

impl RoutingTable {
    pub fn new(local: NodeId) -> Self {
        Self {
            local,
            connections: RwLock::new(HashMap::new()),
            default_route: RwLock::new(None),
        }
    }

    pub fn local(&self) -> &NodeId {
        &self.local
    }

    /// Register a connection, returning the one it replaces
    pub fn insert(&self, connection: Connection) -> Option<Connection> {
        info!("Route to {} via {}", connection.peer(), connection.id());
        self.connections
            .write()
            .insert(connection.peer().clone(), connection)
    }

    /// Remove a connection if it is still the registered one for its peer
    pub fn remove(&self, connection: &Connection) -> bool {
        let mut connections = self.connections.write();
        match connections.get(connection.peer()) {
            Some(current) if current.id() == connection.id() => {
                connections.remove(connection.peer());
                info!("Route to {} removed", connection.peer());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, peer: &NodeId) -> Option<Connection> {
        self.connections.read().get(peer).cloned()
    }

    pub fn peers(&self) -> Vec<NodeId> {
        let mut peers: Vec<NodeId> = self.connections.read().keys().cloned().collect();
        peers.sort();
        peers
    }

    pub fn set_default_route(&self, peer: Option<NodeId>) {
        *self.default_route.write() = peer;
    }

    pub fn default_route(&self) -> Option<NodeId> {
        self.default_route.read().clone()
    }

    /// Resolve the next hop for a message that has traversed `visited`
    ///
    /// `visited` must not yet contain the local node; it is appended only
    /// when the message is actually forwarded.
    pub fn resolve(
        &self,
        routing: &SourceRouting,
        visited: &NetworkPath,
    ) -> Result<Route, RoutingError> {
        if visited.contains(&self.local) {
            return Err(RoutingError::Loop {
                node: self.local.clone(),
                path: visited.clone(),
            });
        }

        let destination = routing.final_destination();
        if *destination == self.local {
            return Ok(Route::Local);
        }

        let next = routing
            .next_hop(&self.local, visited)
            .ok_or_else(|| RoutingError::Unreachable(destination.clone()))?;

        if let Some(connection) = self.get(next) {
            debug!("Next hop for {} is {}", routing, next);
            return Ok(Route::Forward(connection));
        }

        // Uplink, unless it would send the message back where it came from
        let uplink = self
            .default_route()
            .filter(|peer| !visited.contains(peer))
            .and_then(|peer| self.get(&peer));

        match uplink {
            Some(connection) => {
                debug!("No route to {}, using default route {}", next, connection.peer());
                Ok(Route::Forward(connection))
            }
            None => Err(RoutingError::Unreachable(next.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn table(local: &str, peers: &[&str]) -> (RoutingTable, Vec<mpsc::Receiver<String>>) {
        let table = RoutingTable::new(local.into());
        let mut receivers = Vec::new();
        for peer in peers {
            let (tx, rx) = mpsc::channel(8);
            table.insert(Connection::new((*peer).into(), tx));
            receivers.push(rx);
        }
        (table, receivers)
    }

    fn next_hop(route: Route) -> String {
        match route {
            Route::Forward(connection) => connection.peer().to_string(),
            Route::Local => "local".to_string(),
        }
    }

    #[test]
    fn test_direct_destination() {
        let (table, _rx) = table("A", &["B"]);

        let route = table.resolve(&SourceRouting::direct("B"), &NetworkPath::new()).unwrap();
        assert_eq!(next_hop(route), "B");

        assert_eq!(
            table.resolve(&SourceRouting::direct("Z"), &NetworkPath::new()).unwrap_err(),
            RoutingError::Unreachable("Z".into())
        );
    }

    #[test]
    fn test_local_delivery() {
        let (table, _rx) = table("C", &["B"]);
        let visited: NetworkPath = ["A", "B"].into_iter().collect();
        let routing = SourceRouting::path(["A", "B", "C"]).unwrap();

        assert!(matches!(table.resolve(&routing, &visited), Ok(Route::Local)));
    }

    #[test]
    fn test_multi_hop_takes_first_unvisited_hop() {
        let (table, _rx) = table("B", &["A", "C"]);
        let routing = SourceRouting::path(["A", "B", "C"]).unwrap();
        let visited: NetworkPath = ["A"].into_iter().collect();

        assert_eq!(next_hop(table.resolve(&routing, &visited).unwrap()), "C");
    }

    #[test]
    fn test_loop_fails_closed() {
        let (table, _rx) = table("B", &["A", "C"]);
        let routing = SourceRouting::direct("C");
        let visited: NetworkPath = ["A", "B"].into_iter().collect();

        assert!(matches!(
            table.resolve(&routing, &visited),
            Err(RoutingError::Loop { ref node, .. }) if node.as_str() == "B"
        ));
    }

    #[test]
    fn test_default_route() {
        let (table, _rx) = table("CS1", &["NN1"]);
        table.set_default_route(Some("NN1".into()));

        let route = table.resolve(&SourceRouting::direct("CSMS"), &NetworkPath::new()).unwrap();
        assert_eq!(next_hop(route), "NN1");

        // Never bounce a message back to the uplink it arrived from
        let visited: NetworkPath = ["NN1"].into_iter().collect();
        assert!(table.resolve(&SourceRouting::direct("CSMS"), &visited).is_err());
    }

    #[tokio::test]
    async fn test_try_send_reports_full_and_closed_queues() {
        let (tx, mut rx) = mpsc::channel(1);
        let connection = Connection::new("B".into(), tx);

        connection.try_send("first".to_string()).unwrap();
        assert!(matches!(
            connection.try_send("second".to_string()),
            Err(LinkError::QueueFull(ref peer)) if peer.as_str() == "B"
        ));

        assert_eq!(rx.recv().await.as_deref(), Some("first"));
        connection.try_send("third".to_string()).unwrap();

        drop(rx);
        assert!(matches!(
            connection.try_send("fourth".to_string()),
            Err(LinkError::Closed(_))
        ));
    }

    #[test]
    fn test_remove_ignores_stale_connection() {
        let (table, _rx) = table("A", &["B"]);
        let old = table.get(&"B".into()).unwrap();

        let (tx, _rx2) = mpsc::channel(8);
        let fresh = Connection::new("B".into(), tx);
        table.insert(fresh.clone());

        assert!(!table.remove(&old));
        assert_eq!(table.get(&"B".into()).unwrap().id(), fresh.id());
        assert!(table.remove(&fresh));
        assert!(table.peers().is_empty());
    }

    proptest! {
        #[test]
        fn prop_visited_node_never_forwards(
            hops in proptest::collection::hash_set("[A-Z][0-9]", 2..6),
            pick in any::<prop::sample::Index>(),
        ) {
            let hops: Vec<String> = hops.into_iter().collect();
            let local = pick.get(&hops).clone();
            let peers: Vec<&str> = hops.iter().map(String::as_str).collect();
            let (table, _rx) = table(&local, &peers);

            let visited: NetworkPath = hops.iter().cloned().collect();
            let routing = SourceRouting::path(hops.clone()).unwrap();

            let is_loop = matches!(table.resolve(&routing, &visited), Err(RoutingError::Loop { .. }));
            prop_assert!(is_loop);
        }

        #[test]
        fn prop_next_hop_is_never_visited(
            hops in proptest::collection::vec("[A-Z][0-9]", 3..8),
            traversed in 1usize..3,
        ) {
            let routing = match SourceRouting::path(hops.clone()) {
                Ok(routing) => routing,
                Err(_) => return Ok(()),
            };
            let local = hops[traversed].clone();
            let peers: Vec<&str> = hops.iter().map(String::as_str).collect();
            let (table, _rx) = table(&local, &peers);
            let visited: NetworkPath = hops[..traversed].iter().cloned().collect();

            match table.resolve(&routing, &visited) {
                Ok(Route::Forward(connection)) => {
                    prop_assert!(!visited.contains(connection.peer()));
                    prop_assert_ne!(connection.peer().as_str(), local.as_str());
                }
                Ok(Route::Local) => prop_assert_eq!(routing.final_destination().as_str(), local.as_str()),
                Err(e) => prop_assert!(false, "unexpected routing error: {}", e),
            }
        }
    }
}
