//! Strata Model
//!
//! Pure data types for the Strata replication core, decoupled from the
//! storage engine and the overlay network.

pub mod codec;
pub mod data;
pub mod entries;
pub mod ids;
pub mod range;
pub mod reconciliation;
pub mod storage_config;
pub mod transaction;
pub mod trust;
pub mod types;

// Re-exports
pub use codec::{CodecError, Decode, Encode};
pub use data::{DataItem, DataToAdd};
pub use entries::{Entries, Item};
pub use ids::{PidAndRecno, TxnPeerId};
pub use range::IdRange;
pub use reconciliation::{AcceptanceStatus, Decision, ReconciliationRecord};
pub use storage_config::StorageConfig;
pub use transaction::{Transaction, Tuple, Update, UpdateOp, Value};
pub use trust::{Predicate, TrustCondition, TrustConditions};
pub use types::{Epoch, Id, PeerId};
