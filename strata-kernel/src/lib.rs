//! Strata Kernel
//!
//! Replication, epoch and transaction control for a reconciliation store
//! spread over a DHT overlay.
//!
//! - **Node**: one overlay member; dispatches inbound messages to controllers
//! - **Controllers**: epochs, transactions, trust conditions, reconciliation records
//! - **ReplicationController**: id -> entries index plus the worker that moves data between replicas
//! - **ReplyRouter**: correlates replies with outstanding requests by message id

pub mod client;
pub mod config;
pub mod correlation;
pub mod epoch;
pub mod error;
pub mod node;
pub mod outbox;
pub mod peer;
pub mod protocol;
pub mod reconciliation;
pub mod replication;
pub mod transaction;

pub use client::{EpochPublish, FetchOutcome, ReconciliationFetch};
pub use config::NodeConfig;
pub use correlation::{ReplyCollector, ReplyRouter, Undeliverable};
pub use epoch::EpochController;
pub use error::KernelError;
pub use node::Node;
pub use outbox::Outbox;
pub use peer::{PeerController, TrustCache};
pub use protocol::{Body, Envelope, MsgId, ReplyKind};
pub use reconciliation::ReconciliationController;
pub use replication::{ReplicationCmd, ReplicationController, ReplicationWorker};
pub use transaction::{ReconRequest, TransactionController};

// Re-exports from dependencies
pub use uuid::Uuid;
