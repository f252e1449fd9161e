//! PeerController - per-peer trust conditions
//!
//! Conditions are stored at the owner's peer item id and replaced only by a
//! strictly higher version. Lookups for filtering go through a bounded
//! per-node LRU cache before the local table and, last, the network.

use crate::config::NodeConfig;
use crate::error::KernelError;
use crate::outbox::Outbox;
use crate::protocol::{Body, PeerMessage, ReplyKind};
use crate::replication::ReplicationController;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard};
use strata_model::{DataItem, Decode, Encode, Item, PeerId, TrustConditions};
use strata_net_types::Destination;
use strata_storage::keys::trust_key;
use strata_storage::{run_in_txn, RedbStore, StoreTxn, Table, TableRead};

/// Bounded cache of trust conditions, shared by the controllers of one node.
#[derive(Clone)]
pub struct TrustCache {
    inner: Arc<Mutex<LruCache<PeerId, TrustConditions>>>,
}

impl TrustCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self { inner: Arc::new(Mutex::new(LruCache::new(capacity))) }
    }

    fn lock(&self) -> MutexGuard<'_, LruCache<PeerId, TrustConditions>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self, peer: &PeerId) -> Option<TrustConditions> {
        self.lock().get(peer).cloned()
    }

    /// Cache `conditions` unless a newer version is already cached.
    pub fn offer(&self, conditions: TrustConditions) {
        let mut cache = self.lock();
        if let Some(cached) = cache.peek(&conditions.owner) {
            if cached.version >= conditions.version {
                return;
            }
        }
        cache.put(conditions.owner.clone(), conditions);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Clone)]
pub struct PeerController {
    store: RedbStore,
    replication: ReplicationController,
    outbox: Outbox,
    config: Arc<NodeConfig>,
    cache: TrustCache,
}

impl PeerController {
    pub fn new(
        store: RedbStore,
        replication: ReplicationController,
        outbox: Outbox,
        config: Arc<NodeConfig>,
        cache: TrustCache,
    ) -> Self {
        Self { store, replication, outbox, config, cache }
    }

    pub fn conditions(&self, peer: &PeerId) -> Result<Option<TrustConditions>, KernelError> {
        Self::stored(&self.store, peer)
    }

    /// Store `conditions` if they are newer than what is held. Returns the
    /// held version when it wins.
    pub fn publish_conditions(&self, conditions: &TrustConditions) -> Result<Option<u32>, KernelError> {
        let outcome = run_in_txn(&self.store, self.config.max_txn_attempts, "publish_trust", |txn| {
            if !Self::store_conditions(txn, conditions)? {
                let current = Self::stored(txn, &conditions.owner)?.map(|c| c.version).unwrap_or_default();
                return Ok::<_, KernelError>(Some(current));
            }
            self.replication.add(txn, Item::Peer(conditions.owner.clone()))?;
            Ok(None)
        })?;

        if outcome.is_none() {
            tracing::debug!(peer = %conditions.owner, version = conditions.version, "[Peer] trust conditions published");
            self.cache.offer(conditions.clone());
            self.replication.share_trust_conditions(conditions.owner.clone());
        }
        Ok(outcome)
    }

    /// Trust conditions of `peer` for filtering: cache, then the local
    /// table, then the replica set of the peer's item id.
    pub async fn resolve(&self, peer: &PeerId) -> Result<Option<TrustConditions>, KernelError> {
        if let Some(conditions) = self.cache.get(peer) {
            return Ok(Some(conditions));
        }
        if let Some(conditions) = self.conditions(peer)? {
            self.cache.offer(conditions.clone());
            return Ok(Some(conditions));
        }

        let id = self.replication.item_id(&Item::Peer(peer.clone()));
        let collector = self.outbox.request(
            [Destination::Id(id)],
            Body::Peer(PeerMessage::Fetch { peer: peer.clone() }),
            &[ReplyKind::Peer],
        );
        let fetched = collector
            .until(self.config.rpc_timeout, |env| match env.body {
                Body::Peer(PeerMessage::Conditions { conditions }) => ControlFlow::Break(conditions),
                _ => ControlFlow::Continue(()),
            })
            .await;

        match fetched {
            Some(conditions) => {
                self.cache.offer(conditions.clone());
                Ok(Some(conditions))
            }
            None => {
                tracing::debug!(%peer, "[Peer] trust conditions unavailable");
                Ok(None)
            }
        }
    }

    pub async fn handle(&self, msg: PeerMessage) -> Result<Option<Body>, KernelError> {
        let reply = match msg {
            PeerMessage::Publish { conditions } => match self.publish_conditions(&conditions)? {
                None => PeerMessage::Published { peer: conditions.owner, version: conditions.version },
                Some(current) => PeerMessage::Stale { peer: conditions.owner, current },
            },
            PeerMessage::Fetch { peer } => {
                let mut found = self.conditions(&peer)?;
                if found.is_none() {
                    let id = self.replication.item_id(&Item::Peer(peer.clone()));
                    if self.replication.fetch_now(id).await? {
                        found = self.conditions(&peer)?;
                    }
                }
                match found {
                    Some(conditions) => PeerMessage::Conditions { conditions },
                    None => PeerMessage::NotFound { peer },
                }
            }
            reply @ (PeerMessage::Published { .. }
            | PeerMessage::Stale { .. }
            | PeerMessage::Conditions { .. }
            | PeerMessage::NotFound { .. }) => {
                return Err(KernelError::Protocol(format!("unsolicited peer reply {:?}", reply)));
            }
        };
        Ok(Some(Body::Peer(reply)))
    }

    // ==================== Storage ====================

    pub fn stored(reader: &impl TableRead, peer: &PeerId) -> Result<Option<TrustConditions>, KernelError> {
        match reader.get(Table::TrustConditions, &trust_key(peer))? {
            Some(bytes) => Ok(Some(TrustConditions::from_bytes(bytes)?)),
            None => Ok(None),
        }
    }

    /// Write `conditions` when none are held or they carry a higher version.
    pub fn store_conditions(txn: &StoreTxn, conditions: &TrustConditions) -> Result<bool, KernelError> {
        if let Some(current) = Self::stored(txn, &conditions.owner)? {
            if current.version >= conditions.version {
                return Ok(false);
            }
        }
        txn.put(Table::TrustConditions, &trust_key(&conditions.owner), &conditions.to_bytes())?;
        Ok(true)
    }

    pub fn remove_trust_conditions(txn: &StoreTxn, peer: &PeerId) -> Result<(), KernelError> {
        txn.delete(Table::TrustConditions, &trust_key(peer))?;
        Ok(())
    }

    pub fn export(reader: &impl TableRead, peer: &PeerId) -> Result<Option<DataItem>, KernelError> {
        Ok(Self::stored(reader, peer)?.map(|conditions| DataItem::Peer { conditions }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_model::{StorageConfig, TrustCondition};
    use uuid::Uuid;

    fn conditions(version: u32) -> TrustConditions {
        TrustConditions::new("bob", version, vec![TrustCondition::new(Some("alice".into()), "R", version as i32)])
    }

    #[test]
    fn only_higher_versions_replace() {
        let store = RedbStore::open(Uuid::new_v4(), &StorageConfig::InMemory).unwrap();
        let txn = store.begin().unwrap();
        assert!(PeerController::store_conditions(&txn, &conditions(2)).unwrap());
        assert!(!PeerController::store_conditions(&txn, &conditions(1)).unwrap());
        assert!(!PeerController::store_conditions(&txn, &conditions(2)).unwrap());
        assert!(PeerController::store_conditions(&txn, &conditions(3)).unwrap());
        txn.commit().unwrap();

        let held = PeerController::stored(&store, &"bob".into()).unwrap().unwrap();
        assert_eq!(held.version, 3);
    }

    #[test]
    fn cache_keeps_newest_and_evicts_oldest() {
        let cache = TrustCache::new(NonZeroUsize::new(2).unwrap());
        cache.offer(conditions(2));
        cache.offer(conditions(1));
        assert_eq!(cache.get(&"bob".into()).unwrap().version, 2);

        cache.offer(TrustConditions::new("carol", 1, vec![]));
        cache.offer(TrustConditions::new("dave", 1, vec![]));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&"bob".into()).is_none());
    }
}
