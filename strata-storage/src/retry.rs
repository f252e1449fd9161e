use crate::store::{RedbStore, Retryable, StoreError, StoreTxn};

/// Default bound on attempts for one logical transaction.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Run `body` in a fresh write transaction and commit it, redoing the whole
/// transaction while it fails with a retryable error.
///
/// After `max_attempts` the transaction is abandoned: the last error is
/// logged and returned, and nothing it wrote is visible.
pub fn run_in_txn<T, E, F>(store: &RedbStore, max_attempts: u32, op: &str, mut body: F) -> Result<T, E>
where
    E: From<StoreError> + Retryable + std::fmt::Display,
    F: FnMut(&StoreTxn) -> Result<T, E>,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        let result = store.begin().map_err(E::from).and_then(|txn| match body(&txn) {
            Ok(value) => txn.commit().map(|_| value).map_err(E::from),
            Err(e) => {
                if let Err(abort_err) = txn.abort() {
                    tracing::debug!(op, error = %abort_err, "[Store] abort failed");
                }
                Err(e)
            }
        });

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                tracing::debug!(op, attempt, error = %e, "[Store] retrying transaction");
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(op, attempts = attempt, error = %e, "[Store] abandoning transaction");
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Table, TableRead};
    use strata_model::StorageConfig;
    use uuid::Uuid;

    fn store() -> RedbStore {
        RedbStore::open(Uuid::new_v4(), &StorageConfig::InMemory).unwrap()
    }

    #[test]
    fn retries_until_success() {
        let store = store();
        let mut calls = 0;
        let out: Result<u32, StoreError> = run_in_txn(&store, 5, "test", |txn| {
            calls += 1;
            txn.put(Table::Meta, b"attempt", &[calls as u8])?;
            if calls < 3 {
                return Err(StoreError::Conflict("again".into()));
            }
            Ok(calls)
        });
        assert_eq!(out.unwrap(), 3);
        assert_eq!(store.get(Table::Meta, b"attempt").unwrap().as_deref(), Some(&[3u8][..]));
    }

    #[test]
    fn abandons_after_bound_without_partial_state() {
        let store = store();
        let mut calls = 0;
        let out: Result<(), StoreError> = run_in_txn(&store, 4, "test", |txn| {
            calls += 1;
            txn.put(Table::Entries, b"partial", b"x")?;
            Err(StoreError::Conflict("always".into()))
        });
        assert!(matches!(out, Err(StoreError::Conflict(_))));
        assert_eq!(calls, 4);
        assert!(store.get(Table::Entries, b"partial").unwrap().is_none());
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let store = store();
        let mut calls = 0;
        let out: Result<(), StoreError> = run_in_txn(&store, 5, "test", |_| {
            calls += 1;
            Err(StoreError::Codec(strata_model::CodecError::InvalidUtf8))
        });
        assert!(out.is_err());
        assert_eq!(calls, 1);
    }
}
