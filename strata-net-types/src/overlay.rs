//! Overlay abstraction for Strata networking
//!
//! Decouples the replication core from any particular DHT.
//! Simulation harnesses provide in-memory implementations.

use bytes::{Bytes, BytesMut};
use std::fmt;
use strata_model::{CodecError, Decode, Encode, Id, IdRange};
use tokio::sync::broadcast;

/// Error type for overlay operations.
#[derive(Debug, thiserror::Error)]
pub enum OverlayError {
    #[error("No route to {0}")]
    Unreachable(String),
    #[error("Invalid id: expected 32 bytes, got {0}")]
    InvalidId(usize),
    #[error("Overlay closed")]
    Closed,
}

/// Address of one overlay node: its ring position and a display name.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NodeHandle {
    pub id: Id,
    pub name: String,
}

impl NodeHandle {
    pub fn new(id: Id, name: impl Into<String>) -> Self {
        Self { id, name: name.into() }
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeHandle({} {:?})", self.name, self.id)
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl Encode for NodeHandle {
    fn encode(&self, buf: &mut BytesMut) {
        self.id.encode(buf);
        self.name.encode(buf);
    }
}

impl Decode for NodeHandle {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self { id: Id::decode(buf)?, name: String::decode(buf)? })
    }
}

/// Where to route a message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Destination {
    /// The node currently responsible for this id.
    Id(Id),
    /// A specific node.
    Node(NodeHandle),
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Id(id) => write!(f, "{:?}", id),
            Destination::Node(h) => write!(f, "{}", h),
        }
    }
}

/// Membership change observed by the local node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MembershipEvent {
    NodeJoined(NodeHandle),
    NodeLeft(NodeHandle),
}

/// One message delivered to the local node.
#[derive(Clone, Debug)]
pub struct Inbound {
    pub from: NodeHandle,
    pub bytes: Bytes,
}

/// DHT overlay as seen by one node.
///
/// Sends are queue hand-offs and never block on the remote side; delivery
/// is best effort. Replica sets and ranges reflect the membership view at
/// the time of the call.
pub trait Overlay: Send + Sync + fmt::Debug + 'static {
    /// This node's handle.
    fn local_handle(&self) -> NodeHandle;

    /// Send `bytes` to `dest`. The same `Bytes` may be routed to many
    /// destinations.
    fn route(&self, dest: Destination, bytes: Bytes) -> Result<(), OverlayError>;

    /// The `factor` nodes responsible for `id`, primary first.
    fn replica_set(&self, id: &Id, factor: usize) -> Vec<NodeHandle>;

    /// Ids this node holds a replica of.
    fn local_range(&self, factor: usize) -> IdRange;

    /// Ids `handle` holds a replica of, if the overlay can tell.
    fn remote_range(&self, handle: &NodeHandle, factor: usize) -> Option<IdRange>;

    /// Id of a piece of content.
    fn id_from_content(&self, content: &[u8]) -> Id;

    /// Reinterpret raw bytes as an id.
    fn id_from_bytes(&self, bytes: &[u8]) -> Result<Id, OverlayError>;

    /// Get a stream of membership events (nodes joining / leaving).
    fn subscribe_events(&self) -> broadcast::Receiver<MembershipEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_handle_codec() {
        let h = NodeHandle::new(Id::digest(b"n1"), "n1");
        assert_eq!(NodeHandle::from_bytes(h.to_bytes()).unwrap(), h);
        assert_eq!(h.to_string(), "n1");
    }
}
