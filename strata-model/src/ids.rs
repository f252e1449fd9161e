//! Composite identifiers for transactions and reconciliation outcomes

use crate::codec::{CodecError, Decode, Encode};
use crate::types::PeerId;
use bytes::{Bytes, BytesMut};
use std::fmt;

/// Globally identifies one transaction instance: the publishing peer plus
/// that peer's local transaction number.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TxnPeerId {
    pub txn_id: i32,
    pub peer: PeerId,
}

impl TxnPeerId {
    pub fn new(txn_id: i32, peer: impl Into<PeerId>) -> Self {
        Self { txn_id, peer: peer.into() }
    }
}

impl fmt::Display for TxnPeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.txn_id, self.peer)
    }
}

impl fmt::Debug for TxnPeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TxnPeerId({})", self)
    }
}

impl Encode for TxnPeerId {
    fn encode(&self, buf: &mut BytesMut) {
        self.txn_id.encode(buf);
        self.peer.encode(buf);
    }
}

impl Decode for TxnPeerId {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self { txn_id: i32::decode(buf)?, peer: PeerId::decode(buf)? })
    }
}

/// Identifies one reconciliation outcome record: a peer and the sequence
/// number of that peer's reconciliation.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PidAndRecno {
    pub peer: PeerId,
    pub recno: i32,
}

impl PidAndRecno {
    pub fn new(peer: impl Into<PeerId>, recno: i32) -> Self {
        Self { peer: peer.into(), recno }
    }
}

impl fmt::Display for PidAndRecno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.peer, self.recno)
    }
}

impl fmt::Debug for PidAndRecno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PidAndRecno({})", self)
    }
}

impl Encode for PidAndRecno {
    fn encode(&self, buf: &mut BytesMut) {
        self.peer.encode(buf);
        self.recno.encode(buf);
    }
}

impl Decode for PidAndRecno {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self { peer: PeerId::decode(buf)?, recno: i32::decode(buf)? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn txn_peer_id_layout() {
        let tpi = TxnPeerId::new(258, "p");
        let bytes = tpi.to_bytes();
        assert_eq!(&bytes[..], &[0, 0, 1, 2, 0, 0, 0, 1, b'p']);
        assert_eq!(TxnPeerId::from_bytes(bytes).unwrap(), tpi);
    }

    #[test]
    fn pid_and_recno_roundtrip() {
        let id = PidAndRecno::new("alice", -3);
        assert_eq!(PidAndRecno::from_bytes(id.to_bytes()).unwrap(), id);
        assert_eq!(id.to_string(), "alice#-3");
    }
}
