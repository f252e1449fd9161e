//! ReplicationWorker - single task draining the replication queue
//!
//! Every mutating workflow runs here, one at a time, each inside its own
//! retried local transaction.

use super::{export, index, ReplicationController};
use crate::epoch::EpochController;
use crate::error::KernelError;
use crate::peer::PeerController;
use crate::protocol::{Body, ReplicationMessage, ReplyKind};
use crate::reconciliation::ReconciliationController;
use crate::transaction::TransactionController;
use std::ops::ControlFlow;
use std::sync::atomic::Ordering;
use strata_model::{DataToAdd, Entries, Id, IdRange, Item};
use strata_net_types::{Destination, MembershipEvent, NodeHandle, OverlayError};
use strata_storage::run_in_txn;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Commands queued for the replication worker.
#[derive(Debug)]
pub enum ReplicationCmd {
    Fetch { id: Id, hint: Option<NodeHandle> },
    Reinsert { id: Id },
    Remove { id: Id },
    ReplicateToNewPeer { handle: NodeHandle },
    /// Push one freshly accepted item to its replica set.
    Share { item: Item },
    Apply { data: DataToAdd },
    Membership { event: MembershipEvent },
    /// Answered once every earlier command has run.
    Flush { resp: oneshot::Sender<()> },
}

impl ReplicationCmd {
    pub fn label(&self) -> &'static str {
        match self {
            ReplicationCmd::Fetch { .. } => "fetch",
            ReplicationCmd::Reinsert { .. } => "reinsert",
            ReplicationCmd::Remove { .. } => "remove",
            ReplicationCmd::ReplicateToNewPeer { .. } => "replicate_to_new_peer",
            ReplicationCmd::Share { .. } => "share",
            ReplicationCmd::Apply { .. } => "apply",
            ReplicationCmd::Membership { .. } => "membership",
            ReplicationCmd::Flush { .. } => "flush",
        }
    }
}

pub struct ReplicationWorker {
    ctl: ReplicationController,
    rx: mpsc::UnboundedReceiver<ReplicationCmd>,
}

impl ReplicationWorker {
    pub(super) fn new(ctl: ReplicationController, rx: mpsc::UnboundedReceiver<ReplicationCmd>) -> Self {
        Self { ctl, rx }
    }

    /// Run until the token is cancelled or every controller handle is gone.
    pub async fn run(mut self, shutdown_token: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    break;
                }

                cmd = self.rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            self.ctl.depth.fetch_sub(1, Ordering::Relaxed);
                            self.handle_command(cmd).await;
                        }
                        None => break,
                    }
                }
            }
        }
        tracing::debug!(node = %self.ctl.outbox.local(), "[Replication] worker stopped");
    }

    /// Handle a single command (keeps select! block clean)
    async fn handle_command(&mut self, cmd: ReplicationCmd) {
        let op = cmd.label();
        let result = match cmd {
            ReplicationCmd::Fetch { id, hint } => self.fetch(id, hint).await,
            ReplicationCmd::Reinsert { id } => self.reinsert(&id),
            ReplicationCmd::Remove { id } => self.remove(&id).map(|_| ()),
            ReplicationCmd::ReplicateToNewPeer { handle } => self.replicate_to_new_peer(&handle).await,
            ReplicationCmd::Share { item } => self.share(item),
            ReplicationCmd::Apply { data } => self.ctl.merge_data(&data).map(|changed| {
                tracing::debug!(items = data.len(), changed, "[Replication] applied bulk data");
            }),
            ReplicationCmd::Membership { event } => self.membership(event).await,
            ReplicationCmd::Flush { resp } => {
                let _ = resp.send(());
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::warn!(op, error = %e, "[Replication] workflow failed");
        }
    }

    fn factor(&self) -> usize {
        self.ctl.config.replication_factor
    }

    /// Ask the replica set (hint first) for `id` and apply the first
    /// non-empty answer; later answers are dropped with the collector.
    async fn fetch(&self, id: Id, hint: Option<NodeHandle>) -> Result<(), KernelError> {
        let local = self.ctl.outbox.local();
        let mut dests: Vec<NodeHandle> = hint.into_iter().filter(|h| *h != local).collect();
        for peer in self.ctl.outbox.peers_for(&id, self.factor()) {
            if !dests.contains(&peer) {
                dests.push(peer);
            }
        }
        if dests.is_empty() {
            return Ok(());
        }

        let collector = self.ctl.outbox.request(
            dests.into_iter().map(Destination::Node),
            Body::Replication(ReplicationMessage::RequestData { id }),
            &[ReplyKind::Data],
        );
        let data = collector
            .until(self.ctl.config.rpc_timeout, |env| match env.body {
                Body::Replication(ReplicationMessage::DataReply { data, .. }) if !data.is_empty() => {
                    ControlFlow::Break(data)
                }
                _ => ControlFlow::Continue(()),
            })
            .await;

        match data {
            Some(data) => {
                let changed = self.ctl.merge_data(&data)?;
                tracing::debug!(id = ?id, changed, "[Replication] fetched");
            }
            None => tracing::debug!(id = ?id, "[Replication] no replica had data"),
        }
        Ok(())
    }

    fn push(&self, id: &Id, data: DataToAdd) {
        if data.is_empty() {
            return;
        }
        let peers = self.ctl.outbox.peers_for(id, self.factor());
        let sent = self.ctl.outbox.send(
            peers.into_iter().map(Destination::Node),
            Body::Replication(ReplicationMessage::BulkData { data }),
        );
        tracing::trace!(id = ?id, sent, "[Replication] pushed");
    }

    fn reinsert(&self, id: &Id) -> Result<(), KernelError> {
        let Some(entries) = index::get_entries(&self.ctl.store, id)? else {
            return Ok(());
        };
        self.push(id, export(&self.ctl.store, &entries)?);
        Ok(())
    }

    fn share(&self, item: Item) -> Result<(), KernelError> {
        let id = self.ctl.item_id(&item);
        let mut entries = Entries::new();
        entries.add(item);
        self.push(&id, export(&self.ctl.store, &entries)?);
        Ok(())
    }

    /// Delete every item indexed under `id` and the index row itself.
    /// Any failure aborts the whole transaction. Returns the number of items
    /// removed.
    fn remove(&self, id: &Id) -> Result<usize, KernelError> {
        let removed = run_in_txn(&self.ctl.store, self.ctl.config.max_txn_attempts, "remove", |txn| {
            let Some(entries) = index::get_entries(txn, id)? else {
                return Ok::<_, KernelError>(0);
            };
            for item in entries.items() {
                match item {
                    Item::Epoch(epoch) => EpochController::remove_epoch(txn, epoch)?,
                    Item::Peer(peer) => PeerController::remove_trust_conditions(txn, &peer)?,
                    Item::Transaction(tpi) => TransactionController::remove_transaction(txn, &tpi)?,
                    Item::Reconciliation(rid) => ReconciliationController::remove_record(txn, &rid)?,
                }
            }
            index::delete(txn, id)?;
            Ok(entries.len())
        })?;
        if removed > 0 {
            tracing::debug!(id = ?id, removed, "[Replication] removed");
        }
        Ok(removed)
    }

    /// Export every local entry in `handle`'s range as one bulk push. Fails
    /// when the overlay refuses the route.
    async fn replicate_to_new_peer(&self, handle: &NodeHandle) -> Result<(), KernelError> {
        let range = match self.ctl.outbox.overlay().remote_range(handle, self.factor()) {
            Some(range) => range,
            None => self.ask_range(handle).await?,
        };

        let exports = index::entries_in_range(&self.ctl.store, &range)?
            .into_iter()
            .map(|(_, entries)| export(&self.ctl.store, &entries))
            .collect::<Result<Vec<_>, _>>()?;
        let mut data = DataToAdd::new();
        data.merge_all(exports);
        if data.is_empty() {
            return Ok(());
        }

        let items = data.len();
        let sent = self.ctl.outbox.send(
            [Destination::Node(handle.clone())],
            Body::Replication(ReplicationMessage::BulkData { data }),
        );
        if sent == 0 {
            return Err(OverlayError::Unreachable(handle.name.clone()).into());
        }
        tracing::info!(to = %handle, items, "[Replication] replicated to new peer");
        Ok(())
    }

    /// The subset of `ids` that another member of each id's replica set
    /// reports holding. Ids nobody confirms within the RPC timeout are left
    /// out.
    async fn held_elsewhere(&self, ids: Vec<Id>) -> Vec<Id> {
        let timeout = self.ctl.config.rpc_timeout;
        let checks = ids.into_iter().map(|id| {
            let collector = self.ctl.outbox.request(
                self.ctl.outbox.peers_for(&id, self.factor()).into_iter().map(Destination::Node),
                Body::Replication(ReplicationMessage::HasData { id }),
                &[ReplyKind::HasData],
            );
            async move {
                collector
                    .until(timeout, |env| match env.body {
                        Body::Replication(ReplicationMessage::HasDataReply { has: true, .. }) => {
                            ControlFlow::Break(id)
                        }
                        _ => ControlFlow::Continue(()),
                    })
                    .await
            }
        });
        futures_util::future::join_all(checks).await.into_iter().flatten().collect()
    }

    async fn ask_range(&self, handle: &NodeHandle) -> Result<IdRange, KernelError> {
        let collector = self.ctl.outbox.request(
            [Destination::Node(handle.clone())],
            Body::Replication(ReplicationMessage::RemoteRange { factor: self.factor() as u32 }),
            &[ReplyKind::Range],
        );
        collector
            .until(self.ctl.config.rpc_timeout, |env| match env.body {
                Body::Replication(ReplicationMessage::RemoteRangeReply { range }) => ControlFlow::Break(range),
                _ => ControlFlow::Continue(()),
            })
            .await
            .ok_or(KernelError::Timeout("remote range"))
    }

    /// A joining node gets the data it now owns. Ids that left the local
    /// range are evicted only once their new replica set confirms holding
    /// them. After a departure every held id in range is pushed again so the
    /// replica set fills back up.
    async fn membership(&self, event: MembershipEvent) -> Result<(), KernelError> {
        match event {
            MembershipEvent::NodeJoined(handle) => {
                self.replicate_to_new_peer(&handle).await?;

                let local = self.ctl.outbox.overlay().local_range(self.factor());
                let moved: Vec<Id> = index::ids_in_range(&self.ctl.store, &IdRange::full())?
                    .into_iter()
                    .filter(|id| !local.contains(id))
                    .collect();
                if moved.is_empty() {
                    return Ok(());
                }
                let confirmed = self.held_elsewhere(moved.clone()).await;
                let mut evicted = 0;
                for id in &confirmed {
                    evicted += self.remove(id)?;
                }
                let kept = moved.len() - confirmed.len();
                if kept > 0 {
                    tracing::warn!(joined = %handle, kept, "[Replication] out-of-range ids kept, no replica confirmed them");
                }
                if evicted > 0 {
                    tracing::info!(joined = %handle, evicted, "[Replication] evicted items out of range");
                }
            }
            MembershipEvent::NodeLeft(handle) => {
                let local = self.ctl.outbox.overlay().local_range(self.factor());
                let ids = index::ids_in_range(&self.ctl.store, &local)?;
                tracing::info!(left = %handle, ids = ids.len(), "[Replication] reinserting after departure");
                for id in ids {
                    self.reinsert(&id)?;
                }
            }
        }
        Ok(())
    }
}
