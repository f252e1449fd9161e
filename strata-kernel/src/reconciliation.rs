//! ReconciliationController - reconciliation records and the decision index
//!
//! A record lives at its `PidAndRecno` id. Each decision it carries is also
//! filed at the decided transaction's id, keyed by (transaction, peer,
//! recno), so the node holding a transaction can answer "what had this peer
//! decided about it as of recno N" with one bounded range scan.

use crate::config::NodeConfig;
use crate::error::KernelError;
use crate::outbox::Outbox;
use crate::protocol::{Body, ReconciliationMessage};
use crate::replication::ReplicationController;
use std::ops::Bound;
use std::sync::Arc;
use strata_model::{
    AcceptanceStatus, DataItem, Decision, Decode, Encode, Item, PeerId, PidAndRecno, ReconciliationRecord, TxnPeerId,
};
use strata_net_types::Destination;
use strata_storage::keys::{decision_key, decisions_peer_prefix, decisions_prefix, prefix_end, record_key};
use strata_storage::{run_in_txn, RedbStore, StoreError, StoreTxn, Table, TableRead};

#[derive(Clone)]
pub struct ReconciliationController {
    store: RedbStore,
    replication: ReplicationController,
    outbox: Outbox,
    config: Arc<NodeConfig>,
}

impl ReconciliationController {
    pub fn new(store: RedbStore, replication: ReplicationController, outbox: Outbox, config: Arc<NodeConfig>) -> Self {
        Self { store, replication, outbox, config }
    }

    pub fn record(&self, id: &PidAndRecno) -> Result<Option<ReconciliationRecord>, KernelError> {
        Self::stored(&self.store, id)
    }

    /// Acceptance of `tpi` by `peer` as of `recno`.
    pub fn status(&self, tpi: &TxnPeerId, peer: &PeerId, recno: i32) -> Result<AcceptanceStatus, KernelError> {
        Self::status_in(&self.store, tpi, peer, recno)
    }

    /// Insert-once publish. A new record is shared with its replica set and
    /// each of its decisions is sent to the decided transaction's id.
    pub fn publish_record(&self, record: &ReconciliationRecord) -> Result<bool, KernelError> {
        let inserted = run_in_txn(&self.store, self.config.max_txn_attempts, "publish_record", |txn| {
            if !Self::store_record(txn, record)? {
                return Ok::<_, KernelError>(false);
            }
            self.replication.add(txn, Item::Reconciliation(record.id.clone()))?;
            Ok(true)
        })?;
        if !inserted {
            return Ok(false);
        }

        tracing::debug!(record = %record.id, "[Reconciliation] published");
        self.replication.share_reconciliation_data(record.id.clone());
        for (tpi, decision) in record.decisions() {
            let dest = Destination::Id(self.replication.item_id(&Item::Transaction(tpi.clone())));
            let body = ReconciliationMessage::RecordDecision { tpi, id: record.id.clone(), decision };
            self.outbox.send([dest], Body::Reconciliation(body));
        }
        Ok(true)
    }

    /// File one decision at this node, which holds `tpi`'s id.
    pub fn record_decision(&self, tpi: &TxnPeerId, id: &PidAndRecno, decision: Decision) -> Result<bool, KernelError> {
        let fresh = run_in_txn(&self.store, self.config.max_txn_attempts, "record_decision", |txn| {
            let fresh = Self::store_decision(txn, tpi, id, decision)?;
            self.replication.add(txn, Item::Transaction(tpi.clone()))?;
            Ok::<_, KernelError>(fresh)
        })?;
        if fresh {
            tracing::debug!(%tpi, record = %id, ?decision, "[Reconciliation] decision filed");
            self.replication.share_transaction_data(tpi.clone());
        }
        Ok(fresh)
    }

    pub async fn handle(&self, msg: ReconciliationMessage) -> Result<Option<Body>, KernelError> {
        let reply = match msg {
            ReconciliationMessage::Publish { record } => {
                if self.publish_record(&record)? {
                    ReconciliationMessage::Published { id: record.id }
                } else {
                    ReconciliationMessage::Exists { id: record.id }
                }
            }
            ReconciliationMessage::Fetch { id } => {
                let mut found = self.record(&id)?;
                if found.is_none() {
                    let item_id = self.replication.item_id(&Item::Reconciliation(id.clone()));
                    if self.replication.fetch_now(item_id).await? {
                        found = self.record(&id)?;
                    }
                }
                match found {
                    Some(record) => ReconciliationMessage::Contents { record },
                    None => ReconciliationMessage::NotFound { id },
                }
            }
            ReconciliationMessage::RecordDecision { tpi, id, decision } => {
                self.record_decision(&tpi, &id, decision)?;
                return Ok(None);
            }
            reply @ (ReconciliationMessage::Published { .. }
            | ReconciliationMessage::Exists { .. }
            | ReconciliationMessage::Contents { .. }
            | ReconciliationMessage::NotFound { .. }) => {
                return Err(KernelError::Protocol(format!("unsolicited reconciliation reply {:?}", reply)));
            }
        };
        Ok(Some(Body::Reconciliation(reply)))
    }

    // ==================== Records ====================

    pub fn stored(reader: &impl TableRead, id: &PidAndRecno) -> Result<Option<ReconciliationRecord>, KernelError> {
        match reader.get(Table::Reconciliations, &record_key(id))? {
            Some(bytes) => Ok(Some(ReconciliationRecord::from_bytes(bytes)?)),
            None => Ok(None),
        }
    }

    pub fn store_record(txn: &StoreTxn, record: &ReconciliationRecord) -> Result<bool, StoreError> {
        txn.put_if_absent(Table::Reconciliations, &record_key(&record.id), &record.to_bytes())
    }

    pub fn remove_record(txn: &StoreTxn, id: &PidAndRecno) -> Result<(), KernelError> {
        txn.delete(Table::Reconciliations, &record_key(id))?;
        Ok(())
    }

    pub fn export(reader: &impl TableRead, id: &PidAndRecno) -> Result<Option<DataItem>, KernelError> {
        Ok(Self::stored(reader, id)?.map(|record| DataItem::Reconciliation { record }))
    }

    // ==================== Decision index ====================

    /// First write wins; a record's decisions never change.
    pub fn store_decision(
        txn: &StoreTxn,
        tpi: &TxnPeerId,
        id: &PidAndRecno,
        decision: Decision,
    ) -> Result<bool, StoreError> {
        let value = (id.clone(), decision).to_bytes();
        txn.put_if_absent(Table::Decisions, &decision_key(tpi, id), &value)
    }

    /// Every decision filed for `tpi`, ordered by peer then recno.
    pub fn decisions_for(reader: &impl TableRead, tpi: &TxnPeerId) -> Result<Vec<(PidAndRecno, Decision)>, KernelError> {
        let prefix = decisions_prefix(tpi);
        let end = prefix_end(&prefix);
        let upper = end.as_deref().map_or(Bound::Unbounded, Bound::Excluded);
        reader
            .range(Table::Decisions, Bound::Included(&prefix[..]), upper)?
            .into_iter()
            .map(|(_, value)| <(PidAndRecno, Decision)>::from_bytes(value).map_err(KernelError::from))
            .collect()
    }

    /// The decision `peer` recorded for `tpi` with the highest recno not
    /// above `recno`.
    pub fn status_in(
        reader: &impl TableRead,
        tpi: &TxnPeerId,
        peer: &PeerId,
        recno: i32,
    ) -> Result<AcceptanceStatus, KernelError> {
        let lower = decisions_peer_prefix(tpi, peer);
        let upper = decision_key(tpi, &PidAndRecno::new(peer.clone(), recno));
        let latest = reader
            .range(Table::Decisions, Bound::Included(&lower[..]), Bound::Included(&upper[..]))?
            .pop()
            .map(|(_, value)| <(PidAndRecno, Decision)>::from_bytes(value))
            .transpose()?;
        Ok(AcceptanceStatus::from(latest.map(|(_, decision)| decision)))
    }

    pub fn remove_decisions(txn: &StoreTxn, tpi: &TxnPeerId) -> Result<usize, KernelError> {
        let prefix = decisions_prefix(tpi);
        let end = prefix_end(&prefix);
        let upper = end.as_deref().map_or(Bound::Unbounded, Bound::Excluded);
        let keys = txn.range(Table::Decisions, Bound::Included(&prefix[..]), upper)?;
        for (key, _) in &keys {
            txn.delete(Table::Decisions, key)?;
        }
        Ok(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_model::StorageConfig;
    use uuid::Uuid;

    fn store() -> RedbStore {
        RedbStore::open(Uuid::new_v4(), &StorageConfig::InMemory).unwrap()
    }

    #[test]
    fn status_uses_latest_decision_at_or_before_recno() {
        let store = store();
        let tpi = TxnPeerId::new(7, "alice");
        let bob: PeerId = "bob".into();

        let txn = store.begin().unwrap();
        ReconciliationController::store_decision(&txn, &tpi, &PidAndRecno::new("bob", 2), Decision::Accepted).unwrap();
        ReconciliationController::store_decision(&txn, &tpi, &PidAndRecno::new("bob", 5), Decision::Rejected).unwrap();
        ReconciliationController::store_decision(&txn, &tpi, &PidAndRecno::new("carol", 1), Decision::Rejected).unwrap();
        txn.commit().unwrap();

        let status = |recno| ReconciliationController::status_in(&store, &tpi, &bob, recno).unwrap();
        assert_eq!(status(1), AcceptanceStatus::Undecided);
        assert_eq!(status(2), AcceptanceStatus::Accepted);
        assert_eq!(status(4), AcceptanceStatus::Accepted);
        assert_eq!(status(5), AcceptanceStatus::Rejected);
        assert_eq!(status(100), AcceptanceStatus::Rejected);

        let dave = ReconciliationController::status_in(&store, &tpi, &"dave".into(), 9).unwrap();
        assert_eq!(dave, AcceptanceStatus::Undecided);
    }

    #[test]
    fn decisions_are_scoped_to_their_transaction() {
        let store = store();
        let a = TxnPeerId::new(1, "alice");
        let b = TxnPeerId::new(2, "alice");

        let txn = store.begin().unwrap();
        ReconciliationController::store_decision(&txn, &a, &PidAndRecno::new("bob", 1), Decision::Accepted).unwrap();
        ReconciliationController::store_decision(&txn, &b, &PidAndRecno::new("bob", 1), Decision::Rejected).unwrap();
        assert!(!ReconciliationController::store_decision(&txn, &a, &PidAndRecno::new("bob", 1), Decision::Rejected)
            .unwrap());
        txn.commit().unwrap();

        let for_a = ReconciliationController::decisions_for(&store, &a).unwrap();
        assert_eq!(for_a, vec![(PidAndRecno::new("bob", 1), Decision::Accepted)]);

        let txn = store.begin().unwrap();
        assert_eq!(ReconciliationController::remove_decisions(&txn, &a).unwrap(), 1);
        txn.commit().unwrap();
        assert!(ReconciliationController::decisions_for(&store, &a).unwrap().is_empty());
        assert_eq!(ReconciliationController::decisions_for(&store, &b).unwrap().len(), 1);
    }
}
