//! EpochController - publishes and looks up epoch batches
//!
//! Every epoch lives at the one epoch-directory id, so a single replica set
//! answers both "is this number taken" and "what is the most recent epoch".
//! Collisions are resolved by the publisher retrying with a fresh number.

use crate::config::NodeConfig;
use crate::error::KernelError;
use crate::protocol::{Body, EpochMessage};
use crate::replication::ReplicationController;
use std::collections::BTreeSet;
use std::sync::Arc;
use strata_model::{CodecError, DataItem, Decode, Encode, Epoch, Id, Item, TxnPeerId};
use strata_storage::keys::{decode_epoch_key, epoch_key};
use strata_storage::{run_in_txn, RedbStore, StoreError, StoreTxn, Table, TableRead};

#[derive(Clone)]
pub struct EpochController {
    store: RedbStore,
    replication: ReplicationController,
    config: Arc<NodeConfig>,
}

impl EpochController {
    pub fn new(store: RedbStore, replication: ReplicationController, config: Arc<NodeConfig>) -> Self {
        Self { store, replication, config }
    }

    /// Id every epoch is stored under.
    pub fn directory_id(&self) -> Id {
        self.replication.item_id(&Item::Epoch(Epoch::default()))
    }

    pub fn most_recent_epoch(&self) -> Result<Option<Epoch>, KernelError> {
        Self::latest(&self.store)
    }

    pub fn get_epoch(&self, epoch: Epoch) -> Result<Option<BTreeSet<TxnPeerId>>, KernelError> {
        Self::contents(&self.store, epoch)
    }

    /// Insert `epoch` unless it exists. On success the epoch is registered
    /// with the replication index and shared with its replica set.
    pub fn add_epoch(&self, epoch: Epoch, contents: &BTreeSet<TxnPeerId>) -> Result<bool, KernelError> {
        let inserted = run_in_txn(&self.store, self.config.max_txn_attempts, "add_epoch", |txn| {
            if !Self::store_epoch(txn, epoch, contents)? {
                return Ok::<_, KernelError>(false);
            }
            self.replication.add(txn, Item::Epoch(epoch))?;
            Ok(true)
        })?;

        if inserted {
            tracing::debug!(%epoch, txns = contents.len(), "[Epoch] published");
            self.replication.share_epoch_data(epoch);
        }
        Ok(inserted)
    }

    pub async fn handle(&self, msg: EpochMessage) -> Result<Option<Body>, KernelError> {
        let reply = match msg {
            EpochMessage::Publish { epoch, contents } => {
                if self.add_epoch(epoch, &contents)? {
                    EpochMessage::Published { epoch }
                } else {
                    let last_epoch = self.most_recent_epoch()?;
                    tracing::debug!(%epoch, ?last_epoch, "[Epoch] already taken");
                    EpochMessage::Exists { epoch, last_epoch }
                }
            }
            EpochMessage::MostRecent {} => EpochMessage::MostRecentIs { epoch: self.most_recent_epoch()? },
            EpochMessage::Fetch { epoch } => {
                let mut found = self.get_epoch(epoch)?;
                if found.is_none() && self.replication.fetch_now(self.directory_id()).await? {
                    found = self.get_epoch(epoch)?;
                }
                match found {
                    Some(contents) => EpochMessage::Contents { epoch, contents },
                    None => EpochMessage::NotPublished { epoch },
                }
            }
            reply @ (EpochMessage::Published { .. }
            | EpochMessage::Exists { .. }
            | EpochMessage::MostRecentIs { .. }
            | EpochMessage::Contents { .. }
            | EpochMessage::NotPublished { .. }) => {
                return Err(KernelError::Protocol(format!("unsolicited epoch reply {:?}", reply)));
            }
        };
        Ok(Some(Body::Epoch(reply)))
    }

    // ==================== Storage ====================

    pub fn latest(reader: &impl TableRead) -> Result<Option<Epoch>, KernelError> {
        match reader.last(Table::Epochs)? {
            Some((key, _)) => decode_epoch_key(&key)
                .map(Some)
                .ok_or_else(|| CodecError::Invalid(format!("epoch key of {} bytes", key.len())).into()),
            None => Ok(None),
        }
    }

    pub fn contents(reader: &impl TableRead, epoch: Epoch) -> Result<Option<BTreeSet<TxnPeerId>>, KernelError> {
        match reader.get(Table::Epochs, &epoch_key(epoch))? {
            Some(bytes) => Ok(Some(BTreeSet::from_bytes(bytes)?)),
            None => Ok(None),
        }
    }

    /// Insert-once write of an epoch's contents.
    pub fn store_epoch(txn: &StoreTxn, epoch: Epoch, contents: &BTreeSet<TxnPeerId>) -> Result<bool, StoreError> {
        txn.put_if_absent(Table::Epochs, &epoch_key(epoch), &contents.to_bytes())
    }

    /// Only called while evicting a whole index row, so the epoch must be
    /// present.
    pub fn remove_epoch(txn: &StoreTxn, epoch: Epoch) -> Result<(), KernelError> {
        if !txn.delete(Table::Epochs, &epoch_key(epoch))? {
            return Err(KernelError::Invariant(format!("indexed {} is not stored", epoch)));
        }
        Ok(())
    }

    pub fn export(reader: &impl TableRead, epoch: Epoch) -> Result<Option<DataItem>, KernelError> {
        Ok(Self::contents(reader, epoch)?.map(|contents| DataItem::Epoch { epoch, contents }))
    }
}
