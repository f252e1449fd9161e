//! Bulk transfer payloads
//!
//! [`DataToAdd`] carries complete items between replicas: on fetch replies,
//! when replicating to a new peer, and when sharing freshly published data.

use crate::codec::{get_tag, CodecError, Decode, Encode};
use crate::entries::Item;
use crate::ids::{PidAndRecno, TxnPeerId};
use crate::reconciliation::{Decision, ReconciliationRecord};
use crate::trust::TrustConditions;
use crate::types::Epoch;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DataItem {
    Epoch { epoch: Epoch, contents: BTreeSet<TxnPeerId> },
    Peer { conditions: TrustConditions },
    /// Contents may be absent when only decisions are known for `tpi`.
    Transaction { tpi: TxnPeerId, contents: Option<Bytes>, decisions: Vec<(PidAndRecno, Decision)> },
    Reconciliation { record: ReconciliationRecord },
}

impl DataItem {
    /// The index item this data is stored under.
    pub fn item(&self) -> Item {
        match self {
            DataItem::Epoch { epoch, .. } => Item::Epoch(*epoch),
            DataItem::Peer { conditions } => Item::Peer(conditions.owner.clone()),
            DataItem::Transaction { tpi, .. } => Item::Transaction(tpi.clone()),
            DataItem::Reconciliation { record } => Item::Reconciliation(record.id.clone()),
        }
    }

    /// Fold another copy of the same item into this one.
    fn absorb(&mut self, other: DataItem) {
        match (self, other) {
            (
                DataItem::Transaction { contents, decisions, .. },
                DataItem::Transaction { contents: more, decisions: more_decisions, .. },
            ) => {
                if contents.is_none() {
                    *contents = more;
                }
                for d in more_decisions {
                    if !decisions.contains(&d) {
                        decisions.push(d);
                    }
                }
            }
            (DataItem::Peer { conditions }, DataItem::Peer { conditions: newer }) => {
                if newer.version > conditions.version {
                    *conditions = newer;
                }
            }
            // Epochs and records are immutable; the first copy stands
            _ => {}
        }
    }
}

impl Encode for DataItem {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            DataItem::Epoch { epoch, contents } => {
                buf.put_u8(1);
                epoch.encode(buf);
                contents.encode(buf);
            }
            DataItem::Peer { conditions } => {
                buf.put_u8(2);
                conditions.encode(buf);
            }
            DataItem::Transaction { tpi, contents, decisions } => {
                buf.put_u8(3);
                tpi.encode(buf);
                contents.encode(buf);
                decisions.encode(buf);
            }
            DataItem::Reconciliation { record } => {
                buf.put_u8(4);
                record.encode(buf);
            }
        }
    }
}

impl Decode for DataItem {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        match get_tag(buf)? {
            1 => Ok(DataItem::Epoch { epoch: Epoch::decode(buf)?, contents: BTreeSet::decode(buf)? }),
            2 => Ok(DataItem::Peer { conditions: TrustConditions::decode(buf)? }),
            3 => Ok(DataItem::Transaction {
                tpi: TxnPeerId::decode(buf)?,
                contents: Option::decode(buf)?,
                decisions: Vec::decode(buf)?,
            }),
            4 => Ok(DataItem::Reconciliation { record: ReconciliationRecord::decode(buf)? }),
            tag => Err(CodecError::UnknownTag { kind: "data item", tag }),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DataToAdd(pub Vec<DataItem>);

impl DataToAdd {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, item: DataItem) {
        self.0.push(item);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn items(&self) -> &[DataItem] {
        &self.0
    }

    /// Merge another reply into this one, item by item.
    ///
    /// Transactions union their decisions and keep the first contents seen;
    /// trust conditions keep the highest version.
    pub fn merge(&mut self, other: DataToAdd) {
        self.merge_all([other]);
    }

    /// [`DataToAdd::merge`] over many payloads, indexing the items once.
    pub fn merge_all(&mut self, others: impl IntoIterator<Item = DataToAdd>) {
        let mut index: BTreeMap<Item, usize> =
            self.0.iter().enumerate().map(|(at, existing)| (existing.item(), at)).collect();
        for incoming in others.into_iter().flatten() {
            match index.entry(incoming.item()) {
                Entry::Occupied(at) => self.0[*at.get()].absorb(incoming),
                Entry::Vacant(slot) => {
                    slot.insert(self.0.len());
                    self.0.push(incoming);
                }
            }
        }
    }
}

impl IntoIterator for DataToAdd {
    type Item = DataItem;
    type IntoIter = std::vec::IntoIter<DataItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl Encode for DataToAdd {
    fn encode(&self, buf: &mut BytesMut) {
        self.0.encode(buf);
    }
}

impl Decode for DataToAdd {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self(Vec::decode(buf)?))
    }
}
