//! Reconciliation outcomes
//!
//! A reconciliation record is the durable accept/reject outcome of one
//! peer's review of transactions at one reconciliation number.

use crate::codec::{get_tag, CodecError, Decode, Encode};
use crate::ids::{PidAndRecno, TxnPeerId};
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Decision {
    Accepted,
    Rejected,
}

impl Encode for Decision {
    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(match self {
            Decision::Accepted => 1,
            Decision::Rejected => 2,
        });
    }
}

impl Decode for Decision {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        match get_tag(buf)? {
            1 => Ok(Decision::Accepted),
            2 => Ok(Decision::Rejected),
            tag => Err(CodecError::UnknownTag { kind: "decision", tag }),
        }
    }
}

/// Where a transaction stands for one peer at one reconciliation point.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptanceStatus {
    Accepted,
    Rejected,
    Undecided,
}

impl From<Option<Decision>> for AcceptanceStatus {
    fn from(decision: Option<Decision>) -> Self {
        match decision {
            Some(Decision::Accepted) => AcceptanceStatus::Accepted,
            Some(Decision::Rejected) => AcceptanceStatus::Rejected,
            None => AcceptanceStatus::Undecided,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconciliationRecord {
    pub id: PidAndRecno,
    pub accepted: BTreeSet<TxnPeerId>,
    pub rejected: BTreeSet<TxnPeerId>,
}

impl ReconciliationRecord {
    pub fn new(id: PidAndRecno) -> Self {
        Self { id, accepted: BTreeSet::new(), rejected: BTreeSet::new() }
    }

    pub fn accept(mut self, tpi: TxnPeerId) -> Self {
        self.accepted.insert(tpi);
        self
    }

    pub fn reject(mut self, tpi: TxnPeerId) -> Self {
        self.rejected.insert(tpi);
        self
    }

    /// Every decision in the record. A transaction listed on both sides is
    /// treated as rejected.
    pub fn decisions(&self) -> Vec<(TxnPeerId, Decision)> {
        self.accepted
            .iter()
            .filter(|tpi| !self.rejected.contains(*tpi))
            .map(|tpi| (tpi.clone(), Decision::Accepted))
            .chain(self.rejected.iter().map(|tpi| (tpi.clone(), Decision::Rejected)))
            .collect()
    }
}

impl Encode for ReconciliationRecord {
    fn encode(&self, buf: &mut BytesMut) {
        self.id.encode(buf);
        self.accepted.encode(buf);
        self.rejected.encode(buf);
    }
}

impl Decode for ReconciliationRecord {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self {
            id: PidAndRecno::decode(buf)?,
            accepted: BTreeSet::decode(buf)?,
            rejected: BTreeSet::decode(buf)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejection_wins_over_acceptance() {
        let t = TxnPeerId::new(1, "a");
        let record = ReconciliationRecord::new(PidAndRecno::new("me", 1))
            .accept(t.clone())
            .reject(t.clone());
        assert_eq!(record.decisions(), vec![(t, Decision::Rejected)]);
    }

    #[test]
    fn status_from_decision() {
        assert_eq!(AcceptanceStatus::from(None), AcceptanceStatus::Undecided);
        assert_eq!(AcceptanceStatus::from(Some(Decision::Rejected)), AcceptanceStatus::Rejected);
    }
}
