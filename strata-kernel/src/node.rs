//! Node - one overlay member with its store and controllers
//!
//! `Node::start` spawns three tasks:
//! - the replication worker
//! - the inbound dispatch loop (one task per request)
//! - the membership hook feeding join/leave events to the worker

use crate::config::NodeConfig;
use crate::correlation::{ReplyRouter, Undeliverable};
use crate::epoch::EpochController;
use crate::error::KernelError;
use crate::outbox::Outbox;
use crate::peer::{PeerController, TrustCache};
use crate::protocol::{Body, Envelope, ReplicationMessage};
use crate::reconciliation::ReconciliationController;
use crate::replication::ReplicationController;
use crate::transaction::TransactionController;
use std::sync::{Arc, Mutex};
use strata_model::{Decode, Id, Item};
use strata_net_types::{Inbound, MembershipEvent, NodeHandle, Overlay};
use strata_storage::RedbStore;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Routes inbound envelopes to the router or the owning controller.
#[derive(Clone)]
struct Dispatcher {
    outbox: Outbox,
    replication: ReplicationController,
    epochs: EpochController,
    transactions: TransactionController,
    peers: PeerController,
    reconciliations: ReconciliationController,
}

impl Dispatcher {
    async fn run(self, mut inbound: mpsc::UnboundedReceiver<Inbound>, shutdown_token: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => {
                    break;
                }

                msg = inbound.recv() => {
                    match msg {
                        Some(msg) => self.dispatch(msg),
                        None => break,
                    }
                }
            }
        }
        tracing::debug!(node = %self.outbox.local(), "[Node] dispatch stopped");
    }

    fn dispatch(&self, inbound: Inbound) {
        let env = match Envelope::from_bytes(inbound.bytes) {
            Ok(env) => env,
            Err(e) => {
                tracing::warn!(from = %inbound.from, error = %e, "[Node] undecodable message dropped");
                return;
            }
        };
        if env.body.is_reply() {
            self.route_reply(env);
            return;
        }
        // Bulk data is queued in arrival order, ahead of any later request
        let env = match env {
            Envelope { body: Body::Replication(ReplicationMessage::BulkData { data }), origin, .. } => {
                tracing::trace!(from = %origin, items = data.len(), "[Node] bulk data");
                self.replication.apply(data);
                return;
            }
            env => env,
        };
        let this = self.clone();
        tokio::spawn(async move { this.serve(env).await });
    }

    fn route_reply(&self, env: Envelope) {
        match self.outbox.router().deliver(env) {
            Ok(()) => {}
            Err(Undeliverable::Unknown(env)) if env.in_reply_to.is_none() => {
                tracing::warn!(from = %env.origin, body = env.body.label(), "[Node] reply without correlation id");
                if !matches!(env.body, Body::Failure { .. }) {
                    let _ = self.outbox.reply(&env.origin, env.msg_id, Body::failure("reply without correlation id"));
                }
            }
            Err(Undeliverable::Unknown(env)) => {
                tracing::debug!(in_reply_to = ?env.in_reply_to, from = %env.origin, "[Node] late reply dropped");
            }
            Err(Undeliverable::WrongKind(env)) => {
                tracing::warn!(
                    in_reply_to = ?env.in_reply_to,
                    from = %env.origin,
                    body = ?env.body,
                    "[Node] reply of unexpected kind dropped"
                );
            }
        }
    }

    async fn serve(&self, env: Envelope) {
        let Envelope { msg_id, origin, body, .. } = env;
        let label = body.label();
        tracing::trace!(msg_id, from = %origin, body = label, "[Node] request");

        let result = match body {
            Body::Epoch(msg) => self.epochs.handle(msg).await,
            Body::Transaction(msg) => self.transactions.handle(msg_id, &origin, msg).await,
            Body::Replication(msg) => self.replication.handle(msg).await,
            Body::Peer(msg) => self.peers.handle(msg).await,
            Body::Reconciliation(msg) => self.reconciliations.handle(msg).await,
            Body::Failure { reason } => Err(KernelError::Protocol(format!("failure sent as a request: {}", reason))),
        };

        let reply = match result {
            Ok(Some(reply)) => reply,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(msg_id, from = %origin, body = label, error = %e, "[Node] request failed");
                Body::failure(e.to_string())
            }
        };
        if let Err(e) = self.outbox.reply(&origin, msg_id, reply) {
            tracing::debug!(msg_id, to = %origin, error = %e, "[Node] reply not routed");
        }
    }
}

async fn watch_membership(
    replication: ReplicationController,
    mut events: broadcast::Receiver<MembershipEvent>,
    shutdown_token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown_token.cancelled() => {
                break;
            }

            event = events.recv() => {
                match event {
                    Ok(event) => {
                        tracing::debug!(?event, "[Node] membership change");
                        replication.on_membership(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "[Node] membership events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }
}

/// A running node.
pub struct Node {
    pub(crate) config: Arc<NodeConfig>,
    store: RedbStore,
    dispatcher: Dispatcher,
    shutdown_token: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("handle", &self.handle())
            .field("store", &self.store.id())
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Wire the controllers over `overlay` and `store` and spawn the node's
    /// tasks. Must be called inside a tokio runtime.
    pub fn start(
        config: NodeConfig,
        overlay: Arc<dyn Overlay>,
        inbound: mpsc::UnboundedReceiver<Inbound>,
        store: RedbStore,
    ) -> Arc<Node> {
        let config = Arc::new(config);
        let outbox = Outbox::new(overlay.clone(), Arc::new(ReplyRouter::new()));
        let trust = TrustCache::new(config.trust_capacity());

        let (replication, worker) =
            ReplicationController::new(store.clone(), outbox.clone(), config.clone(), trust.clone());
        let epochs = EpochController::new(store.clone(), replication.clone(), config.clone());
        let peers = PeerController::new(store.clone(), replication.clone(), outbox.clone(), config.clone(), trust);
        let transactions = TransactionController::new(
            store.clone(),
            replication.clone(),
            peers.clone(),
            outbox.clone(),
            config.clone(),
        );
        let reconciliations =
            ReconciliationController::new(store.clone(), replication.clone(), outbox.clone(), config.clone());

        let dispatcher = Dispatcher { outbox, replication, epochs, transactions, peers, reconciliations };
        let shutdown_token = CancellationToken::new();
        let events = overlay.subscribe_events();

        let tasks = vec![
            tokio::spawn(worker.run(shutdown_token.clone())),
            tokio::spawn(dispatcher.clone().run(inbound, shutdown_token.clone())),
            tokio::spawn(watch_membership(dispatcher.replication.clone(), events, shutdown_token.clone())),
        ];

        tracing::info!(node = %overlay.local_handle(), store = %store.id(), "[Node] started");
        Arc::new(Node { config, store, dispatcher, shutdown_token, tasks: Mutex::new(tasks) })
    }

    /// Stop all tasks and wait for them to finish.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for result in futures_util::future::join_all(tasks).await {
            if let Err(e) = result {
                tracing::warn!(error = %e, "[Node] task ended abnormally");
            }
        }
        tracing::info!(node = %self.handle(), "[Node] stopped");
    }

    pub fn handle(&self) -> NodeHandle {
        self.dispatcher.outbox.local()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn store(&self) -> &RedbStore {
        &self.store
    }

    pub(crate) fn outbox(&self) -> &Outbox {
        &self.dispatcher.outbox
    }

    /// Overlay id an item is stored under.
    pub fn id_of(&self, item: &Item) -> Id {
        self.dispatcher.outbox.item_id(item)
    }

    pub fn replication(&self) -> &ReplicationController {
        &self.dispatcher.replication
    }

    pub fn epochs(&self) -> &EpochController {
        &self.dispatcher.epochs
    }

    pub fn transactions(&self) -> &TransactionController {
        &self.dispatcher.transactions
    }

    pub fn peers(&self) -> &PeerController {
        &self.dispatcher.peers
    }

    pub fn reconciliations(&self) -> &ReconciliationController {
        &self.dispatcher.reconciliations
    }

    /// Wait for everything queued on the replication worker so far.
    pub async fn flush(&self) -> Result<(), KernelError> {
        self.dispatcher.replication.flush().await
    }
}
