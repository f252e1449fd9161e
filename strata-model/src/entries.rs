//! Per-id replication index records
//!
//! Every overlay id a node holds data for has one [`Entries`] row naming the
//! items stored under it. Rows only grow; they disappear as a whole when the
//! node stops being responsible for the id.

use crate::codec::{get_tag, CodecError, Decode, Encode};
use crate::ids::{PidAndRecno, TxnPeerId};
use crate::types::{Epoch, PeerId};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeSet;

const EPOCH_TAG: u8 = 1;

/// A single item that can be registered under an overlay id.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Item {
    Epoch(Epoch),
    Peer(PeerId),
    Transaction(TxnPeerId),
    Reconciliation(PidAndRecno),
}

impl Item {
    fn tag(&self) -> u8 {
        match self {
            Item::Epoch(_) => EPOCH_TAG,
            Item::Peer(_) => 2,
            Item::Transaction(_) => 3,
            Item::Reconciliation(_) => 4,
        }
    }

    /// Bytes the item's overlay id is derived from: the kind tag followed
    /// by the canonical encoding.
    ///
    /// Epochs are the exception: every epoch shares the bare kind tag, so all
    /// epochs live at one directory id and the most recent one can be found
    /// by asking a single replica set.
    pub fn content_key(&self) -> Bytes {
        match self {
            Item::Epoch(_) => Bytes::from_static(&[EPOCH_TAG]),
            _ => self.to_bytes(),
        }
    }
}

impl Encode for Item {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.tag());
        match self {
            Item::Epoch(e) => e.encode(buf),
            Item::Peer(p) => p.encode(buf),
            Item::Transaction(t) => t.encode(buf),
            Item::Reconciliation(r) => r.encode(buf),
        }
    }
}

impl Decode for Item {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        match get_tag(buf)? {
            1 => Ok(Item::Epoch(Epoch::decode(buf)?)),
            2 => Ok(Item::Peer(PeerId::decode(buf)?)),
            3 => Ok(Item::Transaction(TxnPeerId::decode(buf)?)),
            4 => Ok(Item::Reconciliation(PidAndRecno::decode(buf)?)),
            tag => Err(CodecError::UnknownTag { kind: "item", tag }),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Entries {
    pub txns: BTreeSet<TxnPeerId>,
    pub peers: BTreeSet<PeerId>,
    pub epochs: BTreeSet<Epoch>,
    pub recnos: BTreeSet<PidAndRecno>,
}

impl Entries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `item`. Returns false if it was already present.
    pub fn add(&mut self, item: Item) -> bool {
        match item {
            Item::Epoch(e) => self.epochs.insert(e),
            Item::Peer(p) => self.peers.insert(p),
            Item::Transaction(t) => self.txns.insert(t),
            Item::Reconciliation(r) => self.recnos.insert(r),
        }
    }

    pub fn contains(&self, item: &Item) -> bool {
        match item {
            Item::Epoch(e) => self.epochs.contains(e),
            Item::Peer(p) => self.peers.contains(p),
            Item::Transaction(t) => self.txns.contains(t),
            Item::Reconciliation(r) => self.recnos.contains(r),
        }
    }

    pub fn merge(&mut self, other: Entries) {
        self.txns.extend(other.txns);
        self.peers.extend(other.peers);
        self.epochs.extend(other.epochs);
        self.recnos.extend(other.recnos);
    }

    pub fn is_empty(&self) -> bool {
        self.txns.is_empty() && self.peers.is_empty() && self.epochs.is_empty() && self.recnos.is_empty()
    }

    pub fn len(&self) -> usize {
        self.txns.len() + self.peers.len() + self.epochs.len() + self.recnos.len()
    }

    /// All items, grouped by kind.
    pub fn items(&self) -> impl Iterator<Item = Item> + '_ {
        self.epochs
            .iter()
            .map(|e| Item::Epoch(*e))
            .chain(self.peers.iter().cloned().map(Item::Peer))
            .chain(self.txns.iter().cloned().map(Item::Transaction))
            .chain(self.recnos.iter().cloned().map(Item::Reconciliation))
    }
}

impl Encode for Entries {
    fn encode(&self, buf: &mut BytesMut) {
        self.txns.encode(buf);
        self.peers.encode(buf);
        self.epochs.encode(buf);
        self.recnos.encode(buf);
    }
}

impl Decode for Entries {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self {
            txns: BTreeSet::decode(buf)?,
            peers: BTreeSet::decode(buf)?,
            epochs: BTreeSet::decode(buf)?,
            recnos: BTreeSet::decode(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_is_a_set_union() {
        let mut entries = Entries::new();
        assert!(entries.add(Item::Epoch(Epoch(3))));
        assert!(!entries.add(Item::Epoch(Epoch(3))));
        assert!(entries.add(Item::Transaction(TxnPeerId::new(1, "a"))));
        assert_eq!(entries.len(), 2);

        let mut other = Entries::new();
        other.add(Item::Epoch(Epoch(3)));
        other.add(Item::Peer("b".into()));
        entries.merge(other);
        assert_eq!(entries.len(), 3);
        assert!(entries.contains(&Item::Peer("b".into())));
    }

    #[test]
    fn content_keys_differ_by_kind() {
        // Same payload bytes under different kinds must not collide
        let epoch = Item::Epoch(Epoch(0x61));
        let peer = Item::Peer(PeerId::new("a"));
        assert_ne!(epoch.content_key(), peer.content_key());

        // All epochs share the directory key
        assert_eq!(epoch.content_key(), Item::Epoch(Epoch(9)).content_key());
        assert_ne!(
            Item::Transaction(TxnPeerId::new(1, "a")).content_key(),
            Item::Transaction(TxnPeerId::new(2, "a")).content_key()
        );
    }

    #[test]
    fn entries_roundtrip() {
        let mut entries = Entries::new();
        for item in [
            Item::Epoch(Epoch(-1)),
            Item::Peer("p".into()),
            Item::Transaction(TxnPeerId::new(9, "p")),
            Item::Reconciliation(PidAndRecno::new("p", 2)),
        ] {
            entries.add(item);
        }
        let decoded = Entries::from_bytes(entries.to_bytes()).unwrap();
        assert_eq!(decoded, entries);
        assert_eq!(decoded.items().count(), 4);
    }
}
