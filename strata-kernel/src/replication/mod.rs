//! ReplicationController - tracks which ids hold local data and moves that
//! data between replicas
//!
//! - `index`: the id -> `Entries` table
//! - `actor`: the single worker that runs every mutating workflow
//!
//! The controller itself is a cheap clonable handle. Queries and
//! [`ReplicationController::fetch_now`] run on the caller's task; fetch,
//! reinsert, remove, replicate-to-new-peer, share and apply are queued for
//! the worker so they never nest inside a caller's open transaction.

mod actor;
pub mod index;

pub use actor::{ReplicationCmd, ReplicationWorker};

use crate::config::NodeConfig;
use crate::epoch::EpochController;
use crate::error::KernelError;
use crate::outbox::Outbox;
use crate::peer::{PeerController, TrustCache};
use crate::protocol::{Body, ReplicationMessage, ReplyKind};
use crate::reconciliation::ReconciliationController;
use crate::transaction::TransactionController;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use strata_model::{DataItem, DataToAdd, Entries, Epoch, Id, IdRange, Item, PeerId, PidAndRecno, TxnPeerId};
use strata_net_types::{Destination, MembershipEvent, NodeHandle};
use strata_storage::{run_in_txn, RedbStore, StoreError, StoreTxn, TableRead};
use tokio::sync::{mpsc, oneshot};

#[derive(Clone)]
pub struct ReplicationController {
    store: RedbStore,
    outbox: Outbox,
    config: Arc<NodeConfig>,
    trust: TrustCache,
    queue: mpsc::UnboundedSender<ReplicationCmd>,
    depth: Arc<AtomicUsize>,
}

impl std::fmt::Debug for ReplicationController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationController")
            .field("node", &self.outbox.local())
            .field("queue_depth", &self.queue_depth())
            .finish_non_exhaustive()
    }
}

impl ReplicationController {
    /// Create the controller and the worker that drains its queue. The
    /// caller spawns [`ReplicationWorker::run`].
    pub fn new(
        store: RedbStore,
        outbox: Outbox,
        config: Arc<NodeConfig>,
        trust: TrustCache,
    ) -> (Self, ReplicationWorker) {
        let (queue, rx) = mpsc::unbounded_channel();
        let ctl = Self { store, outbox, config, trust, queue, depth: Arc::new(AtomicUsize::new(0)) };
        let worker = ReplicationWorker::new(ctl.clone(), rx);
        (ctl, worker)
    }

    pub fn item_id(&self, item: &Item) -> Id {
        self.outbox.item_id(item)
    }

    /// Register `item` under its id inside the caller's transaction.
    pub fn add(&self, txn: &StoreTxn, item: Item) -> Result<bool, StoreError> {
        let id = self.item_id(&item);
        index::add(txn, &id, item)
    }

    // ==================== Queries ====================

    pub fn has_entries_for_id(&self, id: &Id) -> Result<bool, KernelError> {
        Ok(index::has_entries(&self.store, id)?)
    }

    pub fn get_entries_for_id(&self, id: &Id) -> Result<Option<Entries>, KernelError> {
        Ok(index::get_entries(&self.store, id)?)
    }

    pub fn get_entries_for_ids(&self, range: &IdRange) -> Result<Vec<(Id, Entries)>, KernelError> {
        Ok(index::entries_in_range(&self.store, range)?)
    }

    pub fn get_ids(&self, range: &IdRange) -> Result<Vec<Id>, KernelError> {
        Ok(index::ids_in_range(&self.store, range)?)
    }

    /// Range enumeration for overlay rebalancing, retried like any other
    /// local transaction.
    pub fn scan(&self, range: &IdRange) -> Result<Vec<(Id, Entries)>, KernelError> {
        run_in_txn(&self.store, self.config.max_txn_attempts, "scan", |txn| {
            Ok::<_, KernelError>(index::entries_in_range(txn, range)?)
        })
    }

    // ==================== Worker queue ====================

    fn enqueue(&self, cmd: ReplicationCmd) {
        let label = cmd.label();
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        let threshold = self.config.queue_warn_threshold.max(1);
        if depth > threshold && (depth - 1) % threshold == 0 {
            tracing::warn!(depth, op = label, "[Replication] worker queue backing up");
        }
        if self.queue.send(cmd).is_err() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            tracing::debug!(op = label, "[Replication] worker stopped, dropping command");
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Pull the data for `id` from its replica set, asking `hint` first.
    pub fn fetch(&self, id: Id, hint: Option<NodeHandle>) {
        self.enqueue(ReplicationCmd::Fetch { id, hint });
    }

    /// Push local data for `id` to its replica set.
    pub fn reinsert(&self, id: Id) {
        self.enqueue(ReplicationCmd::Reinsert { id });
    }

    /// Drop every item held under `id`, all or nothing.
    pub fn remove(&self, id: Id) {
        self.enqueue(ReplicationCmd::Remove { id });
    }

    pub fn replicate_to_new_peer(&self, handle: NodeHandle) {
        self.enqueue(ReplicationCmd::ReplicateToNewPeer { handle });
    }

    pub fn share_epoch_data(&self, epoch: Epoch) {
        self.enqueue(ReplicationCmd::Share { item: Item::Epoch(epoch) });
    }

    pub fn share_transaction_data(&self, tpi: TxnPeerId) {
        self.enqueue(ReplicationCmd::Share { item: Item::Transaction(tpi) });
    }

    pub fn share_trust_conditions(&self, peer: PeerId) {
        self.enqueue(ReplicationCmd::Share { item: Item::Peer(peer) });
    }

    pub fn share_reconciliation_data(&self, id: PidAndRecno) {
        self.enqueue(ReplicationCmd::Share { item: Item::Reconciliation(id) });
    }

    /// Store data pushed by another replica.
    pub fn apply(&self, data: DataToAdd) {
        self.enqueue(ReplicationCmd::Apply { data });
    }

    pub fn on_membership(&self, event: MembershipEvent) {
        self.enqueue(ReplicationCmd::Membership { event });
    }

    /// Resolves once everything queued before this call has run.
    pub async fn flush(&self) -> Result<(), KernelError> {
        let (resp, rx) = oneshot::channel();
        self.enqueue(ReplicationCmd::Flush { resp });
        rx.await.map_err(|_| KernelError::ChannelClosed)
    }

    // ==================== Inline data movement ====================

    /// Pull `id` from every other replica, wait for all of them up to the
    /// RPC timeout, and store the merged result. Returns whether anything
    /// was received.
    pub async fn fetch_now(&self, id: Id) -> Result<bool, KernelError> {
        let peers = self.outbox.peers_for(&id, self.config.replication_factor);
        if peers.is_empty() {
            return Ok(false);
        }
        let replies = self
            .outbox
            .request(
                peers.into_iter().map(Destination::Node),
                Body::Replication(ReplicationMessage::RequestData { id }),
                &[ReplyKind::Data],
            )
            .collect(self.config.rpc_timeout)
            .await;

        let mut received = Vec::with_capacity(replies.len());
        for env in replies {
            match env.body {
                Body::Replication(ReplicationMessage::DataReply { data, .. }) => received.push(data),
                Body::Failure { reason } => {
                    tracing::debug!(id = ?id, from = %env.origin, %reason, "[Replication] fetch refused");
                }
                other => tracing::debug!(id = ?id, body = other.label(), "[Replication] ignoring reply"),
            }
        }
        let mut merged = DataToAdd::new();
        merged.merge_all(received);
        if merged.is_empty() {
            return Ok(false);
        }
        let stored = self.merge_data(&merged)?;
        tracing::debug!(id = ?id, items = merged.len(), stored, "[Replication] fetched now");
        Ok(true)
    }

    /// Store every item of `data` and register it in the index, in one
    /// retried transaction. Returns how many items changed local state.
    pub fn merge_data(&self, data: &DataToAdd) -> Result<usize, KernelError> {
        let (changed, fresh_trust) = run_in_txn(&self.store, self.config.max_txn_attempts, "apply", |txn| {
            let mut changed = 0;
            let mut fresh_trust = Vec::new();
            for item in data.items() {
                let fresh = match item {
                    DataItem::Epoch { epoch, contents } => EpochController::store_epoch(txn, *epoch, contents)?,
                    DataItem::Peer { conditions } => {
                        let fresh = PeerController::store_conditions(txn, conditions)?;
                        if fresh {
                            fresh_trust.push(conditions.clone());
                        }
                        fresh
                    }
                    DataItem::Transaction { tpi, contents, decisions } => {
                        TransactionController::store_transaction(txn, tpi, contents.as_ref(), decisions)?
                    }
                    DataItem::Reconciliation { record } => ReconciliationController::store_record(txn, record)?,
                };
                let indexed = self.add(txn, item.item())?;
                if fresh || indexed {
                    changed += 1;
                }
            }
            Ok::<_, KernelError>((changed, fresh_trust))
        })?;

        for conditions in fresh_trust {
            self.trust.offer(conditions);
        }
        Ok(changed)
    }

    // ==================== Requests ====================

    pub async fn handle(&self, msg: ReplicationMessage) -> Result<Option<Body>, KernelError> {
        let reply = match msg {
            ReplicationMessage::HasData { id } => {
                // Bulk data queued ahead of this request counts
                self.flush().await?;
                let has = index::has_entries(&self.store, &id)?;
                ReplicationMessage::HasDataReply { id, has }
            }
            ReplicationMessage::RequestData { id } => {
                let data = match index::get_entries(&self.store, &id)? {
                    Some(entries) => export(&self.store, &entries)?,
                    None => DataToAdd::new(),
                };
                ReplicationMessage::DataReply { id, data }
            }
            ReplicationMessage::RemoteRange { factor } => {
                let range = self.outbox.overlay().local_range(factor as usize);
                ReplicationMessage::RemoteRangeReply { range }
            }
            ReplicationMessage::BulkData { data } => {
                self.apply(data);
                return Ok(None);
            }
            reply @ (ReplicationMessage::HasDataReply { .. }
            | ReplicationMessage::DataReply { .. }
            | ReplicationMessage::RemoteRangeReply { .. }) => {
                return Err(KernelError::Protocol(format!("unsolicited replication reply {:?}", reply)));
            }
        };
        Ok(Some(Body::Replication(reply)))
    }
}

/// Everything stored locally for the items in `entries`, read through each
/// item's owning controller.
pub(crate) fn export(reader: &impl TableRead, entries: &Entries) -> Result<DataToAdd, KernelError> {
    let mut data = DataToAdd::new();
    for item in entries.items() {
        let exported = match &item {
            Item::Epoch(epoch) => EpochController::export(reader, *epoch)?,
            Item::Peer(peer) => PeerController::export(reader, peer)?,
            Item::Transaction(tpi) => TransactionController::export(reader, tpi)?,
            Item::Reconciliation(id) => ReconciliationController::export(reader, id)?,
        };
        match exported {
            Some(d) => data.push(d),
            None => tracing::debug!(item = ?item, "[Replication] indexed item has no data"),
        }
    }
    Ok(data)
}
