//! TransactionController - publishes transactions and delivers them for
//! reconciliation
//!
//! A reconciliation-scoped fetch answers for one transaction and re-issues
//! itself for every undecided antecedent, keeping the original message id
//! and origin so all answers flow straight back to the requester. Each hop
//! grows the exclude set by the current transaction and its requested
//! siblings, so no chain revisits a transaction, even around a cycle.

use crate::config::NodeConfig;
use crate::error::KernelError;
use crate::outbox::Outbox;
use crate::peer::PeerController;
use crate::protocol::{Body, MsgId, TransactionMessage};
use crate::reconciliation::ReconciliationController;
use crate::replication::ReplicationController;
use bytes::Bytes;
use std::collections::BTreeSet;
use std::sync::Arc;
use strata_model::trust::UNTRUSTED;
use strata_model::{
    AcceptanceStatus, DataItem, Decision, Decode, Item, PeerId, PidAndRecno, Transaction, TxnPeerId,
};
use strata_net_types::{Destination, NodeHandle};
use strata_storage::keys::transaction_key;
use strata_storage::{run_in_txn, RedbStore, StoreError, StoreTxn, Table, TableRead};

/// Parameters of one reconciliation-scoped fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconRequest {
    pub tpi: TxnPeerId,
    /// The reconciling peer.
    pub peer: PeerId,
    pub recno: i32,
    /// Accepted but not yet recorded by the requester; never re-requested.
    pub exclude: BTreeSet<TxnPeerId>,
    /// Weight by the requester's trust conditions.
    pub filter: bool,
}

#[derive(Clone)]
pub struct TransactionController {
    store: RedbStore,
    replication: ReplicationController,
    peers: PeerController,
    outbox: Outbox,
    config: Arc<NodeConfig>,
}

impl TransactionController {
    pub fn new(
        store: RedbStore,
        replication: ReplicationController,
        peers: PeerController,
        outbox: Outbox,
        config: Arc<NodeConfig>,
    ) -> Self {
        Self { store, replication, peers, outbox, config }
    }

    pub fn get_transaction(&self, tpi: &TxnPeerId) -> Result<Option<Bytes>, KernelError> {
        Ok(Self::contents(&self.store, tpi)?)
    }

    /// Insert-once write of an encoded transaction, registered and shared on
    /// success.
    pub fn add_transaction(&self, tpi: &TxnPeerId, contents: &Bytes) -> Result<bool, KernelError> {
        let inserted = run_in_txn(&self.store, self.config.max_txn_attempts, "add_transaction", |txn| {
            if !txn.put_if_absent(Table::Transactions, &transaction_key(tpi), contents)? {
                return Ok::<_, KernelError>(false);
            }
            self.replication.add(txn, Item::Transaction(tpi.clone()))?;
            Ok(true)
        })?;

        if inserted {
            tracing::debug!(%tpi, bytes = contents.len(), "[Txn] published");
            self.replication.share_transaction_data(tpi.clone());
        }
        Ok(inserted)
    }

    /// Local contents, or one pull from the replica set on a miss.
    async fn contents_or_fetch(&self, tpi: &TxnPeerId) -> Result<Option<Bytes>, KernelError> {
        if let Some(contents) = self.get_transaction(tpi)? {
            return Ok(Some(contents));
        }
        let id = self.replication.item_id(&Item::Transaction(tpi.clone()));
        if self.replication.fetch_now(id).await? {
            return self.get_transaction(tpi);
        }
        Ok(None)
    }

    pub async fn handle(
        &self,
        msg_id: MsgId,
        origin: &NodeHandle,
        msg: TransactionMessage,
    ) -> Result<Option<Body>, KernelError> {
        let reply = match msg {
            TransactionMessage::Publish { contents } => {
                let tpi = Transaction::from_bytes(contents.clone())?.id;
                if self.add_transaction(&tpi, &contents)? {
                    TransactionMessage::Published { tpi }
                } else {
                    TransactionMessage::AlreadyPublished { tpi }
                }
            }
            TransactionMessage::Fetch { tpi } => match self.get_transaction(&tpi)? {
                Some(contents) => TransactionMessage::Contents { tpi, contents },
                None => TransactionMessage::NotFound { tpi },
            },
            TransactionMessage::ReconFetch { tpi, peer, recno, exclude, filter } => {
                let request = ReconRequest { tpi, peer, recno, exclude, filter };
                self.reconciliation_fetch(msg_id, origin, request).await?
            }
            reply @ (TransactionMessage::Published { .. }
            | TransactionMessage::AlreadyPublished { .. }
            | TransactionMessage::Contents { .. }
            | TransactionMessage::NotFound { .. }
            | TransactionMessage::ReconTxn { .. }
            | TransactionMessage::AlreadyRejected { .. }
            | TransactionMessage::NotNeeded { .. }
            | TransactionMessage::Unavailable { .. }
            | TransactionMessage::TrustUnavailable { .. }
            | TransactionMessage::AntecedentRejected { .. }) => {
                return Err(KernelError::Protocol(format!("unsolicited transaction reply {:?}", reply)));
            }
        };
        Ok(Some(Body::Transaction(reply)))
    }

    /// Answer one reconciliation-scoped fetch and re-request its undecided
    /// antecedents on behalf of `origin`.
    pub async fn reconciliation_fetch(
        &self,
        msg_id: MsgId,
        origin: &NodeHandle,
        request: ReconRequest,
    ) -> Result<TransactionMessage, KernelError> {
        let ReconRequest { tpi, peer, recno, exclude, filter } = request;

        match ReconciliationController::status_in(&self.store, &tpi, &peer, recno)? {
            AcceptanceStatus::Rejected => return Ok(TransactionMessage::AlreadyRejected { tpi }),
            AcceptanceStatus::Accepted => return Ok(TransactionMessage::NotNeeded { tpi }),
            AcceptanceStatus::Undecided => {}
        }

        let Some(contents) = self.contents_or_fetch(&tpi).await? else {
            tracing::debug!(%tpi, "[Txn] unavailable after replica pull");
            return Ok(TransactionMessage::Unavailable { tpi });
        };
        let transaction = Transaction::from_bytes(contents.clone())?;

        let priority = if filter {
            let Some(conditions) = self.peers.resolve(&peer).await? else {
                return Ok(TransactionMessage::TrustUnavailable { tpi });
            };
            let priority = conditions.priority_for(&transaction);
            if priority == UNTRUSTED {
                tracing::debug!(%tpi, %peer, "[Txn] untrusted, not sent");
                return Ok(TransactionMessage::NotNeeded { tpi });
            }
            Some(priority)
        } else {
            None
        };

        let mut requested = BTreeSet::new();
        for antecedent in transaction.antecedents().difference(&exclude) {
            match ReconciliationController::status_in(&self.store, antecedent, &peer, recno)? {
                AcceptanceStatus::Rejected => {
                    tracing::debug!(%tpi, %antecedent, "[Txn] antecedent rejected");
                    return Ok(TransactionMessage::AntecedentRejected { tpi, antecedent: antecedent.clone() });
                }
                AcceptanceStatus::Accepted => {}
                AcceptanceStatus::Undecided => {
                    requested.insert(antecedent.clone());
                }
            }
        }

        if !requested.is_empty() {
            let mut next_exclude = exclude;
            next_exclude.insert(tpi.clone());
            next_exclude.extend(requested.iter().cloned());

            for antecedent in &requested {
                let dest = Destination::Id(self.replication.item_id(&Item::Transaction(antecedent.clone())));
                let body = Body::Transaction(TransactionMessage::ReconFetch {
                    tpi: antecedent.clone(),
                    peer: peer.clone(),
                    recno,
                    exclude: next_exclude.clone(),
                    filter,
                });
                if let Err(e) = self.outbox.forward(dest, msg_id, origin.clone(), body) {
                    tracing::warn!(%antecedent, error = %e, "[Txn] antecedent request not routed");
                }
            }
            tracing::debug!(%tpi, requested = requested.len(), "[Txn] requested antecedents");
        }

        Ok(TransactionMessage::ReconTxn { tpi, contents, requested, priority })
    }

    // ==================== Storage ====================

    pub fn contents(reader: &impl TableRead, tpi: &TxnPeerId) -> Result<Option<Bytes>, StoreError> {
        reader.get(Table::Transactions, &transaction_key(tpi))
    }

    /// Merge replicated data for `tpi`: contents are insert-once, decisions
    /// are added to the decision index. Returns whether anything was new.
    pub fn store_transaction(
        txn: &StoreTxn,
        tpi: &TxnPeerId,
        contents: Option<&Bytes>,
        decisions: &[(PidAndRecno, Decision)],
    ) -> Result<bool, StoreError> {
        let mut fresh = false;
        if let Some(contents) = contents {
            fresh |= txn.put_if_absent(Table::Transactions, &transaction_key(tpi), contents)?;
        }
        for (id, decision) in decisions {
            fresh |= ReconciliationController::store_decision(txn, tpi, id, *decision)?;
        }
        Ok(fresh)
    }

    /// Drop the contents and every filed decision of `tpi`.
    pub fn remove_transaction(txn: &StoreTxn, tpi: &TxnPeerId) -> Result<(), KernelError> {
        txn.delete(Table::Transactions, &transaction_key(tpi))?;
        ReconciliationController::remove_decisions(txn, tpi)?;
        Ok(())
    }

    pub fn export(reader: &impl TableRead, tpi: &TxnPeerId) -> Result<Option<DataItem>, KernelError> {
        let contents = Self::contents(reader, tpi)?;
        let decisions = ReconciliationController::decisions_for(reader, tpi)?;
        if contents.is_none() && decisions.is_empty() {
            return Ok(None);
        }
        Ok(Some(DataItem::Transaction { tpi: tpi.clone(), contents, decisions }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_model::{Encode, StorageConfig, Tuple, Update, UpdateOp, Value};
    use uuid::Uuid;

    fn encoded(id: i32) -> (TxnPeerId, Bytes) {
        let tpi = TxnPeerId::new(id, "alice");
        let update = Update::new("R", UpdateOp::Insert, Tuple(vec![Value::Int(id as i64)]));
        (tpi.clone(), Transaction::new(tpi, vec![update]).to_bytes())
    }

    #[test]
    fn store_transaction_merges_contents_and_decisions() {
        let store = RedbStore::open(Uuid::new_v4(), &StorageConfig::InMemory).unwrap();
        let (tpi, bytes) = encoded(1);
        let decision = (PidAndRecno::new("bob", 1), Decision::Accepted);

        let txn = store.begin().unwrap();
        assert!(TransactionController::store_transaction(&txn, &tpi, None, &[decision.clone()]).unwrap());
        assert!(TransactionController::store_transaction(&txn, &tpi, Some(&bytes), &[decision.clone()]).unwrap());
        assert!(!TransactionController::store_transaction(&txn, &tpi, Some(&bytes), &[decision.clone()]).unwrap());
        txn.commit().unwrap();

        match TransactionController::export(&store, &tpi).unwrap() {
            Some(DataItem::Transaction { contents, decisions, .. }) => {
                assert_eq!(contents, Some(bytes));
                assert_eq!(decisions, vec![decision]);
            }
            other => panic!("unexpected export {:?}", other),
        }
        assert!(TransactionController::contents(&store, &tpi).unwrap().is_some());
    }

    #[test]
    fn remove_drops_contents_and_decisions() {
        let store = RedbStore::open(Uuid::new_v4(), &StorageConfig::InMemory).unwrap();
        let (tpi, bytes) = encoded(2);
        let txn = store.begin().unwrap();
        TransactionController::store_transaction(&txn, &tpi, Some(&bytes), &[(PidAndRecno::new("bob", 3), Decision::Rejected)])
            .unwrap();
        TransactionController::remove_transaction(&txn, &tpi).unwrap();
        txn.commit().unwrap();

        assert_eq!(TransactionController::export(&store, &tpi).unwrap(), None);
    }
}
