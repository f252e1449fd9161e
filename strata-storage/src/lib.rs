//! Redb-backed transactional store for Strata nodes
pub mod keys;
pub mod retry;
pub mod store;

// Re-export common items
pub use retry::{run_in_txn, DEFAULT_MAX_ATTEMPTS};
pub use store::{RedbStore, Retryable, StoreError, StoreTxn, Table, TableRead};
// Re-export for convenience; canonical home is strata_model::StorageConfig
pub use strata_model::StorageConfig;
