//! Client calls issued from a node to the rest of the overlay
//!
//! Every call routes to the id its subject is stored under and waits at
//! most `rpc_timeout` for the answer. A `Failure` reply surfaces as
//! [`KernelError::Remote`] and silence as [`KernelError::Timeout`].

use crate::error::KernelError;
use crate::node::Node;
use crate::protocol::{
    Body, Envelope, EpochMessage, PeerMessage, ReconciliationMessage, ReplyKind, TransactionMessage,
};
use crate::transaction::ReconRequest;
use std::collections::{BTreeMap, BTreeSet};
use strata_model::{
    Decode, Encode, Epoch, Item, PeerId, PidAndRecno, ReconciliationRecord, Transaction, TrustConditions, TxnPeerId,
};
use strata_net_types::Destination;

/// Answer to an epoch publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EpochPublish {
    Published,
    /// The number was taken; `last_epoch` is the most recent one known at
    /// the epoch directory.
    Exists { last_epoch: Option<Epoch> },
}

/// Per-transaction answer within a reconciliation fetch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    Delivered { transaction: Transaction, priority: Option<i32> },
    AlreadyRejected,
    NotNeeded,
    Unavailable,
    TrustUnavailable,
    AntecedentRejected { antecedent: TxnPeerId },
}

/// Everything a reconciliation fetch collected before it finished or timed
/// out.
#[derive(Clone, Debug, Default)]
pub struct ReconciliationFetch {
    pub outcomes: BTreeMap<TxnPeerId, FetchOutcome>,
    /// First `(transaction, antecedent)` pair found rejected. Once set the
    /// fetch stops waiting.
    pub antecedent_rejected: Option<(TxnPeerId, TxnPeerId)>,
    /// Requested transactions that never answered.
    pub timed_out: BTreeSet<TxnPeerId>,
    /// Failure replies, which carry no transaction id.
    pub failures: Vec<String>,
}

impl ReconciliationFetch {
    /// Delivered transactions with their priorities.
    pub fn delivered(&self) -> impl Iterator<Item = (&Transaction, Option<i32>)> + '_ {
        self.outcomes.values().filter_map(|outcome| match outcome {
            FetchOutcome::Delivered { transaction, priority } => Some((transaction, *priority)),
            _ => None,
        })
    }

    pub fn outcome(&self, tpi: &TxnPeerId) -> Option<&FetchOutcome> {
        self.outcomes.get(tpi)
    }

    /// Every requested transaction answered and none was rejected.
    pub fn is_complete(&self) -> bool {
        self.antecedent_rejected.is_none() && self.timed_out.is_empty()
    }
}

fn unexpected(what: &str, body: &Body) -> KernelError {
    KernelError::Protocol(format!("unexpected {} reply {:?}", what, body))
}

impl Node {
    /// Single-destination request, single reply.
    async fn call(&self, dest: Destination, body: Body, kind: ReplyKind, what: &'static str) -> Result<Body, KernelError> {
        let mut collector = self.outbox().request([dest], body, &[kind]);
        if collector.remaining() == 0 {
            return Err(KernelError::Protocol(format!("{} request not routed", what)));
        }
        match collector.next(self.config.rpc_timeout).await {
            Some(Envelope { body: Body::Failure { reason }, .. }) => Err(KernelError::Remote(reason)),
            Some(env) => Ok(env.body),
            None => Err(KernelError::Timeout(what)),
        }
    }

    fn directory(&self) -> Destination {
        Destination::Id(self.epochs().directory_id())
    }

    // ==================== Epochs ====================

    pub async fn publish_epoch(&self, epoch: Epoch, contents: BTreeSet<TxnPeerId>) -> Result<EpochPublish, KernelError> {
        let body = Body::Epoch(EpochMessage::Publish { epoch, contents });
        match self.call(self.directory(), body, ReplyKind::Epoch, "epoch publish").await? {
            Body::Epoch(EpochMessage::Published { .. }) => Ok(EpochPublish::Published),
            Body::Epoch(EpochMessage::Exists { last_epoch, .. }) => Ok(EpochPublish::Exists { last_epoch }),
            other => Err(unexpected("epoch publish", &other)),
        }
    }

    /// Publish `contents` under the next free epoch number, retrying past
    /// collisions.
    pub async fn publish_next_epoch(&self, contents: BTreeSet<TxnPeerId>) -> Result<Epoch, KernelError> {
        let mut candidate = self.most_recent_epoch().await?.map_or(Epoch(0), Epoch::next);
        for _ in 0..self.config.max_txn_attempts.max(1) {
            match self.publish_epoch(candidate, contents.clone()).await? {
                EpochPublish::Published => return Ok(candidate),
                EpochPublish::Exists { last_epoch } => {
                    tracing::debug!(%candidate, ?last_epoch, "[Client] epoch taken, retrying");
                    candidate = last_epoch.map_or(candidate.next(), Epoch::next).max(candidate.next());
                }
            }
        }
        Err(KernelError::Protocol(format!("no free epoch after {} attempts", self.config.max_txn_attempts)))
    }

    pub async fn most_recent_epoch(&self) -> Result<Option<Epoch>, KernelError> {
        let body = Body::Epoch(EpochMessage::MostRecent {});
        match self.call(self.directory(), body, ReplyKind::Epoch, "most recent epoch").await? {
            Body::Epoch(EpochMessage::MostRecentIs { epoch }) => Ok(epoch),
            other => Err(unexpected("most recent epoch", &other)),
        }
    }

    pub async fn fetch_epoch(&self, epoch: Epoch) -> Result<Option<BTreeSet<TxnPeerId>>, KernelError> {
        let body = Body::Epoch(EpochMessage::Fetch { epoch });
        match self.call(self.directory(), body, ReplyKind::Epoch, "epoch fetch").await? {
            Body::Epoch(EpochMessage::Contents { contents, .. }) => Ok(Some(contents)),
            Body::Epoch(EpochMessage::NotPublished { .. }) => Ok(None),
            other => Err(unexpected("epoch fetch", &other)),
        }
    }

    // ==================== Transactions ====================

    /// Returns false when the transaction was already published.
    pub async fn publish_transaction(&self, transaction: &Transaction) -> Result<bool, KernelError> {
        let dest = Destination::Id(self.id_of(&Item::Transaction(transaction.id.clone())));
        let body = Body::Transaction(TransactionMessage::Publish { contents: transaction.to_bytes() });
        match self.call(dest, body, ReplyKind::Transaction, "transaction publish").await? {
            Body::Transaction(TransactionMessage::Published { .. }) => Ok(true),
            Body::Transaction(TransactionMessage::AlreadyPublished { .. }) => Ok(false),
            other => Err(unexpected("transaction publish", &other)),
        }
    }

    pub async fn fetch_transaction(&self, tpi: &TxnPeerId) -> Result<Option<Transaction>, KernelError> {
        let dest = Destination::Id(self.id_of(&Item::Transaction(tpi.clone())));
        let body = Body::Transaction(TransactionMessage::Fetch { tpi: tpi.clone() });
        match self.call(dest, body, ReplyKind::Transaction, "transaction fetch").await? {
            Body::Transaction(TransactionMessage::Contents { contents, .. }) => Ok(Some(Transaction::from_bytes(contents)?)),
            Body::Transaction(TransactionMessage::NotFound { .. }) => Ok(None),
            other => Err(unexpected("transaction fetch", &other)),
        }
    }

    /// Fetch `request.tpi` and, transitively, every antecedent the
    /// requesting peer has not decided on as of `request.recno`.
    ///
    /// Answers for antecedents arrive under the same message id from
    /// whichever nodes hold them, possibly before the answer that requested
    /// them. The fetch ends when nothing requested is outstanding, when an
    /// antecedent turns out rejected, or when `rpc_timeout` passes without a
    /// new answer.
    pub async fn fetch_for_reconciliation(&self, request: ReconRequest) -> Result<ReconciliationFetch, KernelError> {
        let ReconRequest { tpi, peer, recno, exclude, filter } = request;
        let dest = Destination::Id(self.id_of(&Item::Transaction(tpi.clone())));
        let body = Body::Transaction(TransactionMessage::ReconFetch { tpi: tpi.clone(), peer, recno, exclude, filter });
        let mut collector = self.outbox().request([dest], body, &[ReplyKind::ReconFetch]);

        let mut fetch = ReconciliationFetch::default();
        let mut outstanding = BTreeSet::from([tpi]);
        if collector.remaining() == 0 {
            fetch.timed_out = outstanding;
            return Ok(fetch);
        }

        while !outstanding.is_empty() && fetch.antecedent_rejected.is_none() {
            let Some(env) = collector.next(self.config.rpc_timeout).await else {
                break;
            };
            let msg = match env.body {
                Body::Transaction(msg) => msg,
                Body::Failure { reason } => {
                    tracing::warn!(from = %env.origin, %reason, "[Client] reconciliation fetch failure");
                    fetch.failures.push(reason);
                    continue;
                }
                other => {
                    tracing::debug!(body = ?other, "[Client] ignoring reply");
                    continue;
                }
            };
            let Some(subject) = msg.subject().cloned() else {
                continue;
            };
            if fetch.outcomes.contains_key(&subject) {
                tracing::debug!(tpi = %subject, "[Client] duplicate answer");
                continue;
            }
            outstanding.remove(&subject);

            let outcome = match msg {
                TransactionMessage::ReconTxn { contents, requested, priority, .. } => {
                    for antecedent in requested {
                        match fetch.outcomes.get(&antecedent) {
                            Some(FetchOutcome::AlreadyRejected) => {
                                fetch.antecedent_rejected.get_or_insert((subject.clone(), antecedent));
                            }
                            Some(_) => {}
                            None => {
                                if outstanding.insert(antecedent) {
                                    collector.expect_more(1);
                                }
                            }
                        }
                    }
                    FetchOutcome::Delivered { transaction: Transaction::from_bytes(contents)?, priority }
                }
                TransactionMessage::AlreadyRejected { .. } => FetchOutcome::AlreadyRejected,
                TransactionMessage::NotNeeded { .. } => FetchOutcome::NotNeeded,
                TransactionMessage::Unavailable { .. } => FetchOutcome::Unavailable,
                TransactionMessage::TrustUnavailable { .. } => FetchOutcome::TrustUnavailable,
                TransactionMessage::AntecedentRejected { antecedent, .. } => {
                    fetch.antecedent_rejected.get_or_insert((subject.clone(), antecedent.clone()));
                    FetchOutcome::AntecedentRejected { antecedent }
                }
                other => {
                    tracing::debug!(reply = ?other, "[Client] ignoring reply");
                    continue;
                }
            };

            // A rejected answer may arrive after the transaction that
            // requested it.
            if outcome == FetchOutcome::AlreadyRejected {
                if let Some(dependent) = fetch.outcomes.iter().find_map(|(tpi, o)| match o {
                    FetchOutcome::Delivered { transaction, .. } if transaction.antecedents().contains(&subject) => {
                        Some(tpi.clone())
                    }
                    _ => None,
                }) {
                    fetch.antecedent_rejected.get_or_insert((dependent, subject.clone()));
                }
            }
            fetch.outcomes.insert(subject, outcome);
        }

        fetch.timed_out = outstanding;
        if let Some((tpi, antecedent)) = &fetch.antecedent_rejected {
            tracing::debug!(%tpi, %antecedent, "[Client] antecedent rejected");
        }
        Ok(fetch)
    }

    // ==================== Trust conditions ====================

    /// Returns false when a newer or equal version is already published.
    pub async fn publish_trust_conditions(&self, conditions: &TrustConditions) -> Result<bool, KernelError> {
        let dest = Destination::Id(self.id_of(&Item::Peer(conditions.owner.clone())));
        let body = Body::Peer(PeerMessage::Publish { conditions: conditions.clone() });
        match self.call(dest, body, ReplyKind::Peer, "trust publish").await? {
            Body::Peer(PeerMessage::Published { .. }) => Ok(true),
            Body::Peer(PeerMessage::Stale { current, .. }) => {
                tracing::debug!(peer = %conditions.owner, version = conditions.version, current, "[Client] stale trust conditions");
                Ok(false)
            }
            other => Err(unexpected("trust publish", &other)),
        }
    }

    pub async fn fetch_trust_conditions(&self, peer: &PeerId) -> Result<Option<TrustConditions>, KernelError> {
        let dest = Destination::Id(self.id_of(&Item::Peer(peer.clone())));
        let body = Body::Peer(PeerMessage::Fetch { peer: peer.clone() });
        match self.call(dest, body, ReplyKind::Peer, "trust fetch").await? {
            Body::Peer(PeerMessage::Conditions { conditions }) => Ok(Some(conditions)),
            Body::Peer(PeerMessage::NotFound { .. }) => Ok(None),
            other => Err(unexpected("trust fetch", &other)),
        }
    }

    // ==================== Reconciliation records ====================

    /// Returns false when the record already exists.
    pub async fn publish_reconciliation(&self, record: &ReconciliationRecord) -> Result<bool, KernelError> {
        let dest = Destination::Id(self.id_of(&Item::Reconciliation(record.id.clone())));
        let body = Body::Reconciliation(ReconciliationMessage::Publish { record: record.clone() });
        match self.call(dest, body, ReplyKind::Record, "reconciliation publish").await? {
            Body::Reconciliation(ReconciliationMessage::Published { .. }) => Ok(true),
            Body::Reconciliation(ReconciliationMessage::Exists { .. }) => Ok(false),
            other => Err(unexpected("reconciliation publish", &other)),
        }
    }

    pub async fn fetch_reconciliation(&self, id: &PidAndRecno) -> Result<Option<ReconciliationRecord>, KernelError> {
        let dest = Destination::Id(self.id_of(&Item::Reconciliation(id.clone())));
        let body = Body::Reconciliation(ReconciliationMessage::Fetch { id: id.clone() });
        match self.call(dest, body, ReplyKind::Record, "reconciliation fetch").await? {
            Body::Reconciliation(ReconciliationMessage::Contents { record }) => Ok(Some(record)),
            Body::Reconciliation(ReconciliationMessage::NotFound { .. }) => Ok(None),
            other => Err(unexpected("reconciliation fetch", &other)),
        }
    }
}
