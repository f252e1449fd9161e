use bytes::Bytes;
use redb::{Database, ReadableTable, TableDefinition};
use std::ops::Bound;
use std::sync::Arc;
use strata_model::{CodecError, StorageConfig};
use thiserror::Error;
use uuid::Uuid;

// Table Definitions
pub const TABLE_ENTRIES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("entries");
pub const TABLE_EPOCHS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("epochs");
pub const TABLE_TRANSACTIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("transactions");
pub const TABLE_DECISIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("decisions");
pub const TABLE_TRUST: TableDefinition<&[u8], &[u8]> = TableDefinition::new("trust_conditions");
pub const TABLE_RECONCILIATIONS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("reconciliations");
pub const TABLE_META: TableDefinition<&[u8], &[u8]> = TableDefinition::new("meta");

// Meta Keys
pub const KEY_STORE_ID: &[u8] = b"store_id";

type RawTable = TableDefinition<'static, &'static [u8], &'static [u8]>;

/// Named tables of a node's store.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Table {
    /// Replication index: overlay id -> `Entries`
    Entries,
    /// Epoch -> encoded set of transaction ids
    Epochs,
    /// Transaction id -> encoded transaction
    Transactions,
    /// (transaction, peer, recno) -> decision
    Decisions,
    /// Peer -> trust conditions
    TrustConditions,
    /// (peer, recno) -> reconciliation record
    Reconciliations,
    Meta,
}

impl Table {
    pub const ALL: [Table; 7] = [
        Table::Entries,
        Table::Epochs,
        Table::Transactions,
        Table::Decisions,
        Table::TrustConditions,
        Table::Reconciliations,
        Table::Meta,
    ];

    fn def(self) -> RawTable {
        match self {
            Table::Entries => TABLE_ENTRIES,
            Table::Epochs => TABLE_EPOCHS,
            Table::Transactions => TABLE_TRANSACTIONS,
            Table::Decisions => TABLE_DECISIONS,
            Table::TrustConditions => TABLE_TRUST,
            Table::Reconciliations => TABLE_RECONCILIATIONS,
            Table::Meta => TABLE_META,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Store ID mismatch: expected {expected}, got {got}")]
    StoreIdMismatch { expected: Uuid, got: Uuid },
    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("Corrupt value: {0}")]
    Codec(#[from] CodecError),
    #[error("Transaction conflict: {0}")]
    Conflict(String),
}

/// Errors that a fresh attempt of the same transaction may not hit again.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        match self {
            StoreError::Conflict(_) => true,
            StoreError::Storage(e) => transient(e),
            StoreError::Transaction(redb::TransactionError::Storage(e)) => transient(e),
            StoreError::Commit(redb::CommitError::Storage(e)) => transient(e),
            _ => false,
        }
    }
}

fn transient(e: &redb::StorageError) -> bool {
    matches!(e, redb::StorageError::Io(_) | redb::StorageError::PreviousIo)
}

/// A node's transactional key-value store.
///
/// Owns the `redb::Database` and the store id. Cloning shares the database.
#[derive(Clone)]
pub struct RedbStore {
    db: Arc<Database>,
    id: Uuid,
}

impl RedbStore {
    /// Open or create a store and verify its id.
    ///
    /// All tables are created up front so read transactions never see a
    /// missing table.
    pub fn open(id: Uuid, config: &StorageConfig) -> Result<Self, StoreError> {
        let db = match config {
            StorageConfig::File(path) => {
                if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
                    if !dir.exists() {
                        std::fs::create_dir_all(dir)?;
                    }
                }
                Database::create(path)?
            }
            StorageConfig::InMemory => {
                Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?
            }
        };

        let write_txn = db.begin_write()?;
        {
            for table in Table::ALL {
                write_txn.open_table(table.def())?;
            }

            let mut table_meta = write_txn.open_table(TABLE_META)?;
            let existing_id = table_meta
                .get(KEY_STORE_ID)?
                .map(|v| Uuid::from_bytes(v.value().try_into().unwrap_or_default()));

            if let Some(existing_id) = existing_id {
                if existing_id != id {
                    return Err(StoreError::StoreIdMismatch { expected: id, got: existing_id });
                }
            } else {
                table_meta.insert(KEY_STORE_ID, id.as_bytes().as_slice())?;
            }
        }
        write_txn.commit()?;

        tracing::debug!(store = %id, "[Store] opened");
        Ok(Self { db: Arc::new(db), id })
    }

    /// Access the Store ID.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Begin a write transaction. Blocks while another writer holds the
    /// engine lock.
    pub fn begin(&self) -> Result<StoreTxn, StoreError> {
        Ok(StoreTxn { inner: self.db.begin_write()? })
    }
}

/// One local ACID transaction.
///
/// Tables are opened per operation so no table borrow outlives a call.
/// Dropping without `commit` rolls back.
pub struct StoreTxn {
    inner: redb::WriteTransaction,
}

impl StoreTxn {
    pub fn put(&self, table: Table, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut t = self.inner.open_table(table.def())?;
        t.insert(key, value)?;
        Ok(())
    }

    /// Insert unless `key` is present. Returns whether the value was written.
    pub fn put_if_absent(&self, table: Table, key: &[u8], value: &[u8]) -> Result<bool, StoreError> {
        let mut t = self.inner.open_table(table.def())?;
        if t.get(key)?.is_some() {
            return Ok(false);
        }
        t.insert(key, value)?;
        Ok(true)
    }

    /// Returns whether a value was removed.
    pub fn delete(&self, table: Table, key: &[u8]) -> Result<bool, StoreError> {
        let mut t = self.inner.open_table(table.def())?;
        let removed = t.remove(key)?.is_some();
        Ok(removed)
    }

    pub fn commit(self) -> Result<(), StoreError> {
        self.inner.commit()?;
        Ok(())
    }

    pub fn abort(self) -> Result<(), StoreError> {
        self.inner.abort()?;
        Ok(())
    }
}

// ==================== Reads ====================

/// Read access shared by committed snapshots ([`RedbStore`]) and open
/// transactions ([`StoreTxn`], which also sees its own writes).
pub trait TableRead {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Bytes>, StoreError>;

    /// Ordered scan of `table` between two key bounds.
    fn range(&self, table: Table, lower: Bound<&[u8]>, upper: Bound<&[u8]>)
        -> Result<Vec<(Bytes, Bytes)>, StoreError>;

    /// Entry with the highest key.
    fn last(&self, table: Table) -> Result<Option<(Bytes, Bytes)>, StoreError>;
}

impl TableRead for RedbStore {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        let txn = self.db.begin_read()?;
        get_in(&txn.open_table(table.def())?, key)
    }

    fn range(
        &self,
        table: Table,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Result<Vec<(Bytes, Bytes)>, StoreError> {
        let txn = self.db.begin_read()?;
        range_in(&txn.open_table(table.def())?, lower, upper)
    }

    fn last(&self, table: Table) -> Result<Option<(Bytes, Bytes)>, StoreError> {
        let txn = self.db.begin_read()?;
        last_in(&txn.open_table(table.def())?)
    }
}

impl TableRead for StoreTxn {
    fn get(&self, table: Table, key: &[u8]) -> Result<Option<Bytes>, StoreError> {
        get_in(&self.inner.open_table(table.def())?, key)
    }

    fn range(
        &self,
        table: Table,
        lower: Bound<&[u8]>,
        upper: Bound<&[u8]>,
    ) -> Result<Vec<(Bytes, Bytes)>, StoreError> {
        range_in(&self.inner.open_table(table.def())?, lower, upper)
    }

    fn last(&self, table: Table) -> Result<Option<(Bytes, Bytes)>, StoreError> {
        last_in(&self.inner.open_table(table.def())?)
    }
}

fn get_in<T>(table: &T, key: &[u8]) -> Result<Option<Bytes>, StoreError>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    Ok(table.get(key)?.map(|v| Bytes::copy_from_slice(v.value())))
}

fn range_in<T>(
    table: &T,
    lower: Bound<&[u8]>,
    upper: Bound<&[u8]>,
) -> Result<Vec<(Bytes, Bytes)>, StoreError>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    let mut out = Vec::new();
    for entry in table.range::<&[u8]>((lower, upper))? {
        let (k, v) = entry?;
        out.push((Bytes::copy_from_slice(k.value()), Bytes::copy_from_slice(v.value())));
    }
    Ok(out)
}

fn last_in<T>(table: &T) -> Result<Option<(Bytes, Bytes)>, StoreError>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
{
    Ok(table
        .last()?
        .map(|(k, v)| (Bytes::copy_from_slice(k.value()), Bytes::copy_from_slice(v.value()))))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> RedbStore {
        RedbStore::open(Uuid::new_v4(), &StorageConfig::InMemory).unwrap()
    }

    #[test]
    fn put_if_absent_keeps_first_value() {
        let store = store();
        let txn = store.begin().unwrap();
        assert!(txn.put_if_absent(Table::Epochs, b"k", b"v1").unwrap());
        assert!(!txn.put_if_absent(Table::Epochs, b"k", b"v2").unwrap());
        txn.commit().unwrap();

        assert_eq!(store.get(Table::Epochs, b"k").unwrap().as_deref(), Some(&b"v1"[..]));
    }

    #[test]
    fn abort_discards_writes() {
        let store = store();
        let txn = store.begin().unwrap();
        txn.put(Table::Entries, b"a", b"1").unwrap();
        txn.abort().unwrap();
        assert!(store.get(Table::Entries, b"a").unwrap().is_none());

        // Dropping behaves like abort
        {
            let txn = store.begin().unwrap();
            txn.put(Table::Entries, b"a", b"1").unwrap();
        }
        assert!(store.get(Table::Entries, b"a").unwrap().is_none());
    }

    #[test]
    fn range_and_last() {
        let store = store();
        let txn = store.begin().unwrap();
        for k in [b"a", b"b", b"c", b"d"] {
            txn.put(Table::Transactions, k, k).unwrap();
        }
        txn.commit().unwrap();

        let keys: Vec<_> = store
            .range(Table::Transactions, Bound::Excluded(&b"a"[..]), Bound::Included(&b"c"[..]))
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![Bytes::from_static(b"b"), Bytes::from_static(b"c")]);

        let (k, _) = store.last(Table::Transactions).unwrap().unwrap();
        assert_eq!(&k[..], b"d");
        assert!(store.last(Table::Decisions).unwrap().is_none());
    }

    #[test]
    fn tables_are_disjoint() {
        let store = store();
        let txn = store.begin().unwrap();
        txn.put(Table::Epochs, b"k", b"epoch").unwrap();
        txn.put(Table::Reconciliations, b"k", b"record").unwrap();
        assert!(txn.delete(Table::Epochs, b"k").unwrap());
        assert!(!txn.delete(Table::Epochs, b"k").unwrap());
        txn.commit().unwrap();
        assert!(store.get(Table::Reconciliations, b"k").unwrap().is_some());
    }

    #[test]
    fn retryable_classification() {
        assert!(StoreError::Conflict("lost race".into()).is_retryable());
        assert!(StoreError::Storage(redb::StorageError::Io(std::io::Error::other("disk"))).is_retryable());
        assert!(!StoreError::Codec(CodecError::InvalidUtf8).is_retryable());
        assert!(!StoreError::StoreIdMismatch { expected: Uuid::nil(), got: Uuid::nil() }.is_retryable());
    }
}
