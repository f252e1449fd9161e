//! Trust conditions
//!
//! A peer's trust conditions weight other peers' transactions per relation.
//! Priority 0 means untrusted; a transaction's priority is the highest
//! priority any condition assigns to any of its updates.

use crate::codec::{get_tag, CodecError, Decode, Encode};
use crate::transaction::{Transaction, Update, Value};
use crate::types::PeerId;
use bytes::{BufMut, Bytes, BytesMut};

/// Priority of content no condition vouches for.
pub const UNTRUSTED: i32 = 0;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Predicate {
    /// Tuple field `index` must equal `value`.
    FieldEquals { index: u32, value: Value },
}

impl Predicate {
    pub fn matches(&self, update: &Update) -> bool {
        match self {
            Predicate::FieldEquals { index, value } => {
                update.tuple.field(*index as usize) == Some(value)
            }
        }
    }
}

impl Encode for Predicate {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Predicate::FieldEquals { index, value } => {
                buf.put_u8(0);
                index.encode(buf);
                value.encode(buf);
            }
        }
    }
}

impl Decode for Predicate {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        match get_tag(buf)? {
            0 => Ok(Predicate::FieldEquals { index: u32::decode(buf)?, value: Value::decode(buf)? }),
            tag => Err(CodecError::UnknownTag { kind: "predicate", tag }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustCondition {
    /// Peer whose transactions this condition applies to; `None` for any peer.
    pub origin: Option<PeerId>,
    pub relation: String,
    pub predicate: Option<Predicate>,
    pub priority: i32,
}

impl TrustCondition {
    pub fn new(origin: Option<PeerId>, relation: impl Into<String>, priority: i32) -> Self {
        Self { origin, relation: relation.into(), predicate: None, priority }
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    fn applies_to(&self, origin: &PeerId, update: &Update) -> bool {
        if self.origin.as_ref().is_some_and(|p| p != origin) {
            return false;
        }
        if self.relation != update.relation {
            return false;
        }
        self.predicate.as_ref().map_or(true, |p| p.matches(update))
    }
}

impl Encode for TrustCondition {
    fn encode(&self, buf: &mut BytesMut) {
        self.origin.encode(buf);
        self.relation.encode(buf);
        self.predicate.encode(buf);
        self.priority.encode(buf);
    }
}

impl Decode for TrustCondition {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self {
            origin: Option::decode(buf)?,
            relation: String::decode(buf)?,
            predicate: Option::decode(buf)?,
            priority: i32::decode(buf)?,
        })
    }
}

/// The full, versioned trust-condition set of one peer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustConditions {
    pub owner: PeerId,
    pub version: u32,
    pub conditions: Vec<TrustCondition>,
}

impl TrustConditions {
    pub fn new(owner: impl Into<PeerId>, version: u32, conditions: Vec<TrustCondition>) -> Self {
        Self { owner: owner.into(), version, conditions }
    }

    /// Highest priority any condition assigns to any update of `txn`.
    pub fn priority_for(&self, txn: &Transaction) -> i32 {
        txn.updates
            .iter()
            .flat_map(|update| {
                self.conditions
                    .iter()
                    .filter(move |c| c.applies_to(&txn.id.peer, update))
                    .map(|c| c.priority)
            })
            .max()
            .unwrap_or(UNTRUSTED)
            .max(UNTRUSTED)
    }
}

impl Encode for TrustConditions {
    fn encode(&self, buf: &mut BytesMut) {
        self.owner.encode(buf);
        self.version.encode(buf);
        self.conditions.encode(buf);
    }
}

impl Decode for TrustConditions {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self {
            owner: PeerId::decode(buf)?,
            version: u32::decode(buf)?,
            conditions: Vec::decode(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::TxnPeerId;
    use crate::transaction::{Tuple, UpdateOp};

    fn txn(peer: &str, relation: &str, first: Value) -> Transaction {
        Transaction::new(
            TxnPeerId::new(1, peer),
            vec![Update::new(relation, UpdateOp::Insert, Tuple(vec![first]))],
        )
    }

    #[test]
    fn no_matching_condition_is_untrusted() {
        let tc = TrustConditions::new("me", 1, vec![TrustCondition::new(None, "S", 5)]);
        assert_eq!(tc.priority_for(&txn("bob", "R", Value::Int(1))), UNTRUSTED);
    }

    #[test]
    fn highest_matching_priority_wins() {
        let tc = TrustConditions::new(
            "me",
            1,
            vec![
                TrustCondition::new(None, "R", 2),
                TrustCondition::new(Some("bob".into()), "R", 7),
                TrustCondition::new(Some("carol".into()), "R", 9),
            ],
        );
        assert_eq!(tc.priority_for(&txn("bob", "R", Value::Int(1))), 7);
        assert_eq!(tc.priority_for(&txn("dave", "R", Value::Int(1))), 2);
    }

    #[test]
    fn predicate_filters_updates() {
        let tc = TrustConditions::new(
            "me",
            1,
            vec![TrustCondition::new(None, "R", 4).with_predicate(Predicate::FieldEquals {
                index: 0,
                value: Value::Text("ok".into()),
            })],
        );
        assert_eq!(tc.priority_for(&txn("bob", "R", Value::Text("ok".into()))), 4);
        assert_eq!(tc.priority_for(&txn("bob", "R", Value::Text("no".into()))), UNTRUSTED);
    }

    #[test]
    fn conditions_roundtrip() {
        let tc = TrustConditions::new(
            "me",
            3,
            vec![TrustCondition::new(Some("bob".into()), "R", 1).with_predicate(
                Predicate::FieldEquals { index: 2, value: Value::Null },
            )],
        );
        assert_eq!(TrustConditions::from_bytes(tc.to_bytes()).unwrap(), tc);
    }
}
