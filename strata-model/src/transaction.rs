//! Published transactions and their updates
//!
//! A transaction is a peer's atomic batch of tuple updates. Each update names
//! the transactions it causally depends on (its antecedents); the union of
//! those, minus the transaction itself, must be delivered no later than the
//! transaction.

use crate::codec::{get_tag, CodecError, Decode, Encode};
use crate::ids::TxnPeerId;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeSet;

/// One field of a tuple.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Value {
    Null,
    Int(i64),
    Text(String),
}

impl Encode for Value {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Value::Null => buf.put_u8(0),
            Value::Int(v) => {
                buf.put_u8(1);
                v.encode(buf);
            }
            Value::Text(s) => {
                buf.put_u8(2);
                s.encode(buf);
            }
        }
    }
}

impl Decode for Value {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        match get_tag(buf)? {
            0 => Ok(Value::Null),
            1 => Ok(Value::Int(i64::decode(buf)?)),
            2 => Ok(Value::Text(String::decode(buf)?)),
            tag => Err(CodecError::UnknownTag { kind: "value", tag }),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Tuple(pub Vec<Value>);

impl Tuple {
    pub fn field(&self, index: usize) -> Option<&Value> {
        self.0.get(index)
    }
}

impl Encode for Tuple {
    fn encode(&self, buf: &mut BytesMut) {
        self.0.encode(buf);
    }
}

impl Decode for Tuple {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Tuple(Vec::decode(buf)?))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum UpdateOp {
    Insert,
    Delete,
    Modify,
}

impl Encode for UpdateOp {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(match self {
            UpdateOp::Insert => 0,
            UpdateOp::Delete => 1,
            UpdateOp::Modify => 2,
        });
    }
}

impl Decode for UpdateOp {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        match get_tag(buf)? {
            0 => Ok(UpdateOp::Insert),
            1 => Ok(UpdateOp::Delete),
            2 => Ok(UpdateOp::Modify),
            tag => Err(CodecError::UnknownTag { kind: "update op", tag }),
        }
    }
}

/// A single tuple-level change to one relation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Update {
    pub relation: String,
    pub op: UpdateOp,
    pub tuple: Tuple,
    pub antecedents: BTreeSet<TxnPeerId>,
}

impl Update {
    pub fn new(relation: impl Into<String>, op: UpdateOp, tuple: Tuple) -> Self {
        Self { relation: relation.into(), op, tuple, antecedents: BTreeSet::new() }
    }

    pub fn with_antecedents(mut self, antecedents: impl IntoIterator<Item = TxnPeerId>) -> Self {
        self.antecedents.extend(antecedents);
        self
    }
}

impl Encode for Update {
    fn encode(&self, buf: &mut BytesMut) {
        self.relation.encode(buf);
        self.op.encode(buf);
        self.tuple.encode(buf);
        self.antecedents.encode(buf);
    }
}

impl Decode for Update {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self {
            relation: String::decode(buf)?,
            op: UpdateOp::decode(buf)?,
            tuple: Tuple::decode(buf)?,
            antecedents: BTreeSet::decode(buf)?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transaction {
    pub id: TxnPeerId,
    pub updates: Vec<Update>,
}

impl Transaction {
    pub fn new(id: TxnPeerId, updates: Vec<Update>) -> Self {
        Self { id, updates }
    }

    /// Every transaction this one causally depends on, excluding itself.
    pub fn antecedents(&self) -> BTreeSet<TxnPeerId> {
        self.updates
            .iter()
            .flat_map(|u| u.antecedents.iter())
            .filter(|tpi| **tpi != self.id)
            .cloned()
            .collect()
    }
}

impl Encode for Transaction {
    fn encode(&self, buf: &mut BytesMut) {
        self.id.encode(buf);
        self.updates.encode(buf);
    }
}

impl Decode for Transaction {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self { id: TxnPeerId::decode(buf)?, updates: Vec::decode(buf)? })
    }
}
