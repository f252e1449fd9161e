//! Table key layouts
//!
//! Keys are built so that redb's byte order matches the logical order:
//! - signed integers are big-endian with the sign bit flipped
//! - composite keys concatenate self-delimiting encodings, so every
//!   component prefix is a scannable range

use strata_model::{Encode, Epoch, Id, PeerId, PidAndRecno, TxnPeerId};

/// Big-endian with the sign bit flipped: byte order equals numeric order.
pub fn ordered_i32(v: i32) -> [u8; 4] {
    ((v as u32) ^ 0x8000_0000).to_be_bytes()
}

pub fn decode_ordered_i32(bytes: &[u8]) -> Option<i32> {
    let arr: [u8; 4] = bytes.try_into().ok()?;
    Some((u32::from_be_bytes(arr) ^ 0x8000_0000) as i32)
}

pub fn entries_key(id: &Id) -> [u8; 32] {
    id.0
}

pub fn epoch_key(epoch: Epoch) -> [u8; 4] {
    ordered_i32(epoch.0)
}

pub fn decode_epoch_key(bytes: &[u8]) -> Option<Epoch> {
    decode_ordered_i32(bytes).map(Epoch)
}

pub fn transaction_key(tpi: &TxnPeerId) -> Vec<u8> {
    tpi.to_bytes().to_vec()
}

pub fn trust_key(peer: &PeerId) -> Vec<u8> {
    peer.to_bytes().to_vec()
}

pub fn record_key(id: &PidAndRecno) -> Vec<u8> {
    let mut key = id.peer.to_bytes().to_vec();
    key.extend_from_slice(&ordered_i32(id.recno));
    key
}

/// Prefix shared by every decision recorded for `tpi`.
pub fn decisions_prefix(tpi: &TxnPeerId) -> Vec<u8> {
    tpi.to_bytes().to_vec()
}

/// Prefix shared by every decision `peer` recorded for `tpi`.
pub fn decisions_peer_prefix(tpi: &TxnPeerId, peer: &PeerId) -> Vec<u8> {
    let mut key = decisions_prefix(tpi);
    key.extend_from_slice(&peer.to_bytes());
    key
}

pub fn decision_key(tpi: &TxnPeerId, id: &PidAndRecno) -> Vec<u8> {
    let mut key = decisions_peer_prefix(tpi, &id.peer);
    key.extend_from_slice(&ordered_i32(id.recno));
    key
}

/// Smallest key greater than every key starting with `prefix`, or `None`
/// when no such key exists (all `0xff`).
pub fn prefix_end(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}
