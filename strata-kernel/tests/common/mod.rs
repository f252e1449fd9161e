#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use strata_kernel::{Node, NodeConfig};
use strata_model::{Id, Item, StorageConfig, Transaction, Tuple, TxnPeerId, Update, UpdateOp, Value};
use strata_net_sim::{SimNetwork, SimOverlay};
use strata_net_types::Overlay;
use strata_storage::RedbStore;
use uuid::Uuid;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn config(factor: usize) -> NodeConfig {
    NodeConfig::default()
        .with_replication_factor(factor)
        .with_rpc_timeout(Duration::from_millis(500))
}

pub struct Cluster {
    pub net: SimNetwork,
    pub nodes: Vec<Arc<Node>>,
    pub overlays: Vec<Arc<SimOverlay>>,
    config: NodeConfig,
}

impl Cluster {
    /// Join a node named `node-{n}` with an in-memory store and start it.
    pub fn add_node(&mut self) -> usize {
        let name = format!("node-{}", self.nodes.len());
        let (overlay, inbound) = self.net.join(&name);
        let overlay = Arc::new(overlay);
        let store = RedbStore::open(Uuid::new_v4(), &StorageConfig::InMemory).unwrap();
        let node = Node::start(self.config.clone(), overlay.clone(), inbound, store);
        self.nodes.push(node);
        self.overlays.push(overlay);
        self.nodes.len() - 1
    }

    pub fn node(&self, i: usize) -> &Arc<Node> {
        &self.nodes[i]
    }

    /// Index of the node routing currently delivers `id` to.
    pub fn primary_of(&self, id: &Id) -> usize {
        let primary = self.overlays[0].replica_set(id, 1).remove(0);
        self.nodes.iter().position(|n| n.handle() == primary).unwrap()
    }

    /// Indices of nodes holding index entries for `id`.
    pub fn holders_of(&self, id: &Id) -> Vec<usize> {
        (0..self.nodes.len())
            .filter(|&i| self.nodes[i].replication().has_entries_for_id(id).unwrap())
            .collect()
    }

    pub fn txn_id(&self, tpi: &TxnPeerId) -> Id {
        self.nodes[0].id_of(&Item::Transaction(tpi.clone()))
    }

    pub async fn flush_all(&self) {
        for node in &self.nodes {
            node.flush().await.unwrap();
        }
    }

    /// Let membership events reach every worker, then wait for the workers.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(100)).await;
        self.flush_all().await;
    }

    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.shutdown().await;
        }
    }
}

pub fn cluster(n: usize, config: NodeConfig) -> Cluster {
    init_tracing();
    let mut cluster = Cluster { net: SimNetwork::new(), nodes: Vec::new(), overlays: Vec::new(), config };
    for _ in 0..n {
        cluster.add_node();
    }
    cluster
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// A one-update transaction on relation `R`.
pub fn txn(id: i32, peer: &str, antecedents: &[TxnPeerId]) -> Transaction {
    let update = Update::new("R", UpdateOp::Insert, Tuple(vec![Value::Int(id as i64), Value::Text(peer.into())]))
        .with_antecedents(antecedents.iter().cloned());
    Transaction::new(TxnPeerId::new(id, peer), vec![update])
}
