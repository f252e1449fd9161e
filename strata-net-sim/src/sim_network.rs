//! SimNetwork: in-memory ring overlay
//!
//! A shared `SimNetwork` broker holds every node in ring order and routes
//! messages between `SimOverlay` instances over unbounded channels.
//! Node ids are the BLAKE3 digest of the node name.

use bytes::Bytes;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use strata_model::{Id, IdRange};
use strata_net_types::{Destination, Inbound, MembershipEvent, NodeHandle, Overlay, OverlayError};
use tokio::sync::{broadcast, mpsc};

struct SimPeer {
    handle: NodeHandle,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    events_tx: broadcast::Sender<MembershipEvent>,
    down: Arc<AtomicBool>,
}

type Ring = BTreeMap<Id, SimPeer>;

/// Shared network broker that routes messages between SimOverlay instances.
#[derive(Clone, Default)]
pub struct SimNetwork {
    ring: Arc<RwLock<Ring>>,
}

impl std::fmt::Debug for SimNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self.read().values().map(|p| p.handle.name.clone()).collect();
        f.debug_struct("SimNetwork").field("nodes", &names).finish()
    }
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Ring> {
        self.ring.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Ring> {
        self.ring.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Ring position of a node name.
    pub fn id_for(name: &str) -> Id {
        Id::digest(name.as_bytes())
    }

    /// Add a node and announce it to every existing node.
    ///
    /// Returns the node's overlay and the receiving end of its inbound queue.
    pub fn join(&self, name: &str) -> (SimOverlay, mpsc::UnboundedReceiver<Inbound>) {
        let handle = NodeHandle::new(Self::id_for(name), name);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(128);
        let down = Arc::new(AtomicBool::new(false));

        let mut ring = self.write();
        for peer in ring.values() {
            let _ = peer.events_tx.send(MembershipEvent::NodeJoined(handle.clone()));
        }
        ring.insert(
            handle.id,
            SimPeer { handle: handle.clone(), inbound_tx, events_tx: events_tx.clone(), down: down.clone() },
        );
        tracing::debug!(node = %handle, size = ring.len(), "[Sim] joined");

        let overlay = SimOverlay { local: handle, network: self.clone(), events_tx, down };
        (overlay, inbound_rx)
    }

    /// Remove a node and announce its departure. Its inbound queue closes.
    pub fn leave(&self, name: &str) -> bool {
        let mut ring = self.write();
        let Some(gone) = ring.remove(&Self::id_for(name)) else {
            return false;
        };
        for peer in ring.values() {
            let _ = peer.events_tx.send(MembershipEvent::NodeLeft(gone.handle.clone()));
        }
        tracing::debug!(node = %gone.handle, size = ring.len(), "[Sim] left");
        true
    }

    /// Simulate an outage: a down node silently drops everything routed to it.
    pub fn set_down(&self, name: &str, down: bool) {
        if let Some(peer) = self.read().get(&Self::id_for(name)) {
            peer.down.store(down, Ordering::SeqCst);
        }
    }

    pub fn handles(&self) -> Vec<NodeHandle> {
        self.read().values().map(|p| p.handle.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn deliver(&self, from: &NodeHandle, to: &Id, bytes: Bytes) -> Result<(), OverlayError> {
        let ring = self.read();
        let peer = ring.get(to).ok_or_else(|| OverlayError::Unreachable(format!("{:?}", to)))?;
        if peer.down.load(Ordering::SeqCst) {
            tracing::trace!(from = %from, to = %peer.handle, "[Sim] dropped: node down");
            return Ok(());
        }
        peer.inbound_tx
            .send(Inbound { from: from.clone(), bytes })
            .map_err(|_| OverlayError::Unreachable(peer.handle.name.clone()))
    }
}

// ==================== Ring geometry ====================

/// Nodes in ring order starting at the successor of `id`.
fn successors<'a>(ring: &'a Ring, id: &Id) -> impl Iterator<Item = &'a SimPeer> + 'a {
    ring.range(*id..).chain(ring.range(..*id)).map(|(_, p)| p)
}

/// Replica range of the node at `node`: `(k-th predecessor, node]`, or the
/// whole ring when there are no more than `factor` nodes.
fn replica_range(ring: &Ring, node: &Id, factor: usize) -> IdRange {
    let factor = factor.max(1);
    let mut predecessors = ring
        .range(..*node)
        .rev()
        .chain(ring.range((Bound::Excluded(*node), Bound::Unbounded)).rev())
        .map(|(id, _)| *id);
    match predecessors.nth(factor - 1) {
        Some(from) => IdRange::new(from, *node),
        None => IdRange::new(*node, *node),
    }
}

/// One node's view of a `SimNetwork`.
#[derive(Clone)]
pub struct SimOverlay {
    local: NodeHandle,
    network: SimNetwork,
    events_tx: broadcast::Sender<MembershipEvent>,
    down: Arc<AtomicBool>,
}

impl std::fmt::Debug for SimOverlay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimOverlay").field("local", &self.local).finish()
    }
}

impl SimOverlay {
    pub fn network(&self) -> &SimNetwork {
        &self.network
    }
}

impl Overlay for SimOverlay {
    fn local_handle(&self) -> NodeHandle {
        self.local.clone()
    }

    fn route(&self, dest: Destination, bytes: Bytes) -> Result<(), OverlayError> {
        // A down node neither answers nor sends
        if self.down.load(Ordering::SeqCst) {
            return Ok(());
        }
        let target = match dest {
            Destination::Node(handle) => handle.id,
            Destination::Id(id) => {
                let ring = self.network.read();
                let primary = successors(&ring, &id).next().map(|p| p.handle.id);
                primary.ok_or(OverlayError::Closed)?
            }
        };
        self.network.deliver(&self.local, &target, bytes)
    }

    fn replica_set(&self, id: &Id, factor: usize) -> Vec<NodeHandle> {
        let ring = self.network.read();
        successors(&ring, id).take(factor.max(1)).map(|p| p.handle.clone()).collect()
    }

    fn local_range(&self, factor: usize) -> IdRange {
        replica_range(&self.network.read(), &self.local.id, factor)
    }

    fn remote_range(&self, handle: &NodeHandle, factor: usize) -> Option<IdRange> {
        let ring = self.network.read();
        ring.contains_key(&handle.id).then(|| replica_range(&ring, &handle.id, factor))
    }

    fn id_from_content(&self, content: &[u8]) -> Id {
        Id::digest(content)
    }

    fn id_from_bytes(&self, bytes: &[u8]) -> Result<Id, OverlayError> {
        Id::try_from(bytes).map_err(|_| OverlayError::InvalidId(bytes.len()))
    }

    fn subscribe_events(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events_tx.subscribe()
    }
}
