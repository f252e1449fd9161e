//! Replication index: overlay id -> `Entries`
//!
//! Free functions over any [`TableRead`] so the same queries serve committed
//! snapshots and open write transactions. Rows grow through [`add`] and
//! disappear only through [`delete`].

use std::ops::Bound;
use strata_model::{CodecError, Decode, Encode, Entries, Id, IdRange, Item};
use strata_storage::keys::entries_key;
use strata_storage::{StoreError, StoreTxn, Table, TableRead};

/// Merge `item` into the row at `id`. Returns false if it was already there.
pub fn add(txn: &StoreTxn, id: &Id, item: Item) -> Result<bool, StoreError> {
    let mut entries = get_entries(txn, id)?.unwrap_or_default();
    if !entries.add(item) {
        return Ok(false);
    }
    txn.put(Table::Entries, &entries_key(id), &entries.to_bytes())?;
    Ok(true)
}

pub fn get_entries(reader: &impl TableRead, id: &Id) -> Result<Option<Entries>, StoreError> {
    match reader.get(Table::Entries, &entries_key(id))? {
        Some(bytes) => Ok(Some(Entries::from_bytes(bytes)?)),
        None => Ok(None),
    }
}

pub fn has_entries(reader: &impl TableRead, id: &Id) -> Result<bool, StoreError> {
    Ok(reader.get(Table::Entries, &entries_key(id))?.is_some())
}

/// Every row whose id lies in `range`, in ring order from `range.from`.
pub fn entries_in_range(reader: &impl TableRead, range: &IdRange) -> Result<Vec<(Id, Entries)>, StoreError> {
    let mut out = Vec::new();
    for (lower, upper) in range.segments() {
        for (key, value) in reader.range(Table::Entries, as_key(&lower), as_key(&upper))? {
            out.push((decode_id(&key)?, Entries::from_bytes(value)?));
        }
    }
    Ok(out)
}

pub fn ids_in_range(reader: &impl TableRead, range: &IdRange) -> Result<Vec<Id>, StoreError> {
    let mut out = Vec::new();
    for (lower, upper) in range.segments() {
        for (key, _) in reader.range(Table::Entries, as_key(&lower), as_key(&upper))? {
            out.push(decode_id(&key)?);
        }
    }
    Ok(out)
}

pub fn delete(txn: &StoreTxn, id: &Id) -> Result<bool, StoreError> {
    txn.delete(Table::Entries, &entries_key(id))
}

fn as_key(bound: &Bound<Id>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(id) => Bound::Included(&id.0[..]),
        Bound::Excluded(id) => Bound::Excluded(&id.0[..]),
        Bound::Unbounded => Bound::Unbounded,
    }
}

fn decode_id(key: &[u8]) -> Result<Id, StoreError> {
    Id::try_from(key).map_err(|_| CodecError::Invalid(format!("entries key of {} bytes", key.len())).into())
}
