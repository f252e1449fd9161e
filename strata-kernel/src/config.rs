use std::num::NonZeroUsize;
use std::time::Duration;

/// Per-node tuning for the replication core.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Number of nodes holding a replica of each id.
    pub replication_factor: usize,
    /// How long any RPC wait lasts before returning what arrived.
    pub rpc_timeout: Duration,
    /// Attempts per local transaction before it is abandoned.
    pub max_txn_attempts: u32,
    /// Entries in the trust-condition cache.
    pub trust_cache_capacity: usize,
    /// Worker queue depth above which enqueues are logged.
    pub queue_warn_threshold: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            rpc_timeout: Duration::from_secs(2),
            max_txn_attempts: strata_storage::DEFAULT_MAX_ATTEMPTS,
            trust_cache_capacity: 128,
            queue_warn_threshold: 1024,
        }
    }
}

impl NodeConfig {
    pub fn with_replication_factor(mut self, factor: usize) -> Self {
        self.replication_factor = factor;
        self
    }

    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    pub(crate) fn trust_capacity(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.trust_cache_capacity).unwrap_or(NonZeroUsize::MIN)
    }
}
