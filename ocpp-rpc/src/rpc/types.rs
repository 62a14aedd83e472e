//! Identifiers and routing headers carried by every envelope

use std::borrow::Borrow;
use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::routing::RoutingError;

/// Maximum length of an OCPP message id on the wire
pub const MAX_MESSAGE_ID_LEN: usize = 36;

/// Identity of a charging station, networking node or CSMS
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for NodeId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Correlation id of a Call and of the CallResult/CallError answering it
///
/// Ordering is lexicographic and defines the order in which pending calls
/// are cancelled when their connection goes away.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random UUID v4 id
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the id fits the wire constraints (non-empty, at most 36 chars)
    pub fn is_well_formed(&self) -> bool {
        !self.0.is_empty() && self.0.len() <= MAX_MESSAGE_ID_LEN
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Where a message has to go
///
/// Either a single destination node, or an explicit ordered hop list from
/// sender to final destination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WireSourceRouting", into = "WireSourceRouting")]
pub enum SourceRouting {
    Direct(NodeId),
    Path(HopList),
}

/// Ordered hop list, never empty and never repeating a node
///
/// Only [`SourceRouting::path`] builds one:
///
/// ```compile_fail
/// use ocpp_rpc::rpc::types::{HopList, NodeId, SourceRouting};
///
/// let _ = SourceRouting::Path(HopList(vec![NodeId::new("A"), NodeId::new("A")]));
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HopList(Vec<NodeId>);

impl HopList {
    pub fn as_slice(&self) -> &[NodeId] {
        &self.0
    }

    /// Last hop, the final destination
    pub fn destination(&self) -> &NodeId {
        // Non-empty by construction
        &self.0[self.0.len() - 1]
    }
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum WireSourceRouting {
    Direct(NodeId),
    Path(Vec<NodeId>),
}

impl TryFrom<WireSourceRouting> for SourceRouting {
    type Error = RoutingError;

    fn try_from(wire: WireSourceRouting) -> Result<Self, Self::Error> {
        match wire {
            WireSourceRouting::Direct(node) => Ok(SourceRouting::Direct(node)),
            WireSourceRouting::Path(hops) => SourceRouting::path(hops),
        }
    }
}

impl From<SourceRouting> for WireSourceRouting {
    fn from(routing: SourceRouting) -> Self {
        match routing {
            SourceRouting::Direct(node) => WireSourceRouting::Direct(node),
            SourceRouting::Path(hops) => WireSourceRouting::Path(hops.0),
        }
    }
}

impl SourceRouting {
    pub fn direct(node: impl Into<NodeId>) -> Self {
        SourceRouting::Direct(node.into())
    }

    /// Explicit hop list, rejecting empty lists and repeated hops
    pub fn path<I, N>(hops: I) -> Result<Self, RoutingError>
    where
        I: IntoIterator<Item = N>,
        N: Into<NodeId>,
    {
        let hops: Vec<NodeId> = hops.into_iter().map(Into::into).collect();
        if hops.is_empty() {
            return Err(RoutingError::EmptyPath);
        }

        let mut seen = HashSet::with_capacity(hops.len());
        for hop in &hops {
            if !seen.insert(hop) {
                return Err(RoutingError::RepeatedHop(hop.clone()));
            }
        }

        Ok(SourceRouting::Path(HopList(hops)))
    }

    /// Node the message must finally be delivered to
    pub fn final_destination(&self) -> &NodeId {
        match self {
            SourceRouting::Direct(node) => node,
            SourceRouting::Path(hops) => hops.destination(),
        }
    }

    /// Next hop seen from `current`, given the hops already traversed
    ///
    /// For a hop list this is the first hop that is neither `current` nor
    /// already in `visited`. Returns `None` when nothing is left.
    pub fn next_hop<'a>(&'a self, current: &NodeId, visited: &NetworkPath) -> Option<&'a NodeId> {
        match self {
            SourceRouting::Direct(node) => (node != current).then_some(node),
            SourceRouting::Path(hops) => hops
                .as_slice()
                .iter()
                .find(|hop| *hop != current && !visited.contains(hop)),
        }
    }

    /// Route back to the origin of a message that reached `local` via `path`
    ///
    /// The result is `[local] + reverse(path)`, skipping `local` and any
    /// repeated entries so a looped path still yields a valid hop list.
    pub fn reply_to(local: &NodeId, path: &NetworkPath) -> Result<Self, RoutingError> {
        let mut hops = vec![local.clone()];
        for hop in path.iter().rev() {
            if !hops.contains(hop) {
                hops.push(hop.clone());
            }
        }
        if hops.len() == 1 {
            return Err(RoutingError::EmptyPath);
        }
        SourceRouting::path(hops)
    }
}

impl fmt::Display for SourceRouting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceRouting::Direct(node) => write!(f, "{}", node),
            SourceRouting::Path(hops) => write!(f, "[{}]", join(hops.as_slice())),
        }
    }
}

/// Hops a message has actually traversed, oldest first
///
/// Append-only: the sender stamps itself once and every forwarder appends
/// itself exactly once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkPath(Vec<NodeId>);

impl NetworkPath {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn from_origin(origin: NodeId) -> Self {
        Self(vec![origin])
    }

    pub fn push(&mut self, node: NodeId) {
        self.0.push(node);
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.0.contains(node)
    }

    pub fn origin(&self) -> Option<&NodeId> {
        self.0.first()
    }

    pub fn last(&self) -> Option<&NodeId> {
        self.0.last()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, NodeId> {
        self.0.iter()
    }
}

impl fmt::Display for NetworkPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}]", join(&self.0))
    }
}

impl<N: Into<NodeId>> FromIterator<N> for NetworkPath {
    fn from_iter<I: IntoIterator<Item = N>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

fn join(nodes: &[NodeId]) -> String {
    nodes
        .iter()
        .map(NodeId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
