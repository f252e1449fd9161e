//! Reply correlation
//!
//! - `ReplyRouter`: per-node message-id counter and table of pending requests
//! - `ReplyCollector`: the caller's end of one pending request
//!
//! A caller registers the reply kinds it expects and how many replies it
//! wants. Each matching reply is handed to its collector exactly once.
//! Dropping the collector closes the channel and deregisters the request;
//! replies arriving after that are reported back as undeliverable.

use crate::protocol::{Envelope, MsgId, ReplyKind};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

struct Pending {
    kinds: Vec<ReplyKind>,
    tx: mpsc::UnboundedSender<Envelope>,
}

/// Why a reply could not be handed to a waiting caller.
#[derive(Debug)]
pub enum Undeliverable {
    /// No request with that id is pending (never sent, timed out or done).
    Unknown(Envelope),
    /// The request is pending but did not ask for this kind of reply.
    WrongKind(Envelope),
}

pub struct ReplyRouter {
    next_id: AtomicU64,
    pending: Mutex<HashMap<MsgId, Pending>>,
}

impl std::fmt::Debug for ReplyRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyRouter").field("pending", &self.pending()).finish()
    }
}

impl Default for ReplyRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyRouter {
    pub fn new() -> Self {
        Self { next_id: AtomicU64::new(1), pending: Mutex::new(HashMap::new()) }
    }

    fn table(&self) -> MutexGuard<'_, HashMap<MsgId, Pending>> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn next_msg_id(&self) -> MsgId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Start waiting for up to `expected` replies of the given kinds.
    pub fn register(self: &Arc<Self>, msg_id: MsgId, kinds: &[ReplyKind], expected: usize) -> ReplyCollector {
        let (tx, rx) = mpsc::unbounded_channel();
        self.table().insert(msg_id, Pending { kinds: kinds.to_vec(), tx });
        ReplyCollector { router: Arc::clone(self), msg_id, rx, remaining: expected }
    }

    /// Hand a reply to its waiting collector.
    pub fn deliver(&self, env: Envelope) -> Result<(), Undeliverable> {
        let Some(msg_id) = env.in_reply_to else {
            return Err(Undeliverable::Unknown(env));
        };
        let mut table = self.table();
        let Some(pending) = table.get(&msg_id) else {
            return Err(Undeliverable::Unknown(env));
        };
        if let Some(kind) = env.body.reply_kind() {
            if !pending.kinds.contains(&kind) {
                return Err(Undeliverable::WrongKind(env));
            }
        }
        match pending.tx.send(env) {
            Ok(()) => Ok(()),
            Err(closed) => {
                table.remove(&msg_id);
                Err(Undeliverable::Unknown(closed.0))
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.table().len()
    }

    fn forget(&self, msg_id: MsgId) {
        self.table().remove(&msg_id);
    }
}

/// Receiving end of one pending request.
pub struct ReplyCollector {
    router: Arc<ReplyRouter>,
    msg_id: MsgId,
    rx: mpsc::UnboundedReceiver<Envelope>,
    remaining: usize,
}

impl std::fmt::Debug for ReplyCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplyCollector")
            .field("msg_id", &self.msg_id)
            .field("remaining", &self.remaining)
            .finish()
    }
}

impl ReplyCollector {
    pub fn msg_id(&self) -> MsgId {
        self.msg_id
    }

    /// Replies still expected.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn expect_more(&mut self, n: usize) {
        self.remaining += n;
    }

    /// Wait up to `timeout` for the next reply, whether or not the expected
    /// count has been reached.
    pub async fn next(&mut self, timeout: Duration) -> Option<Envelope> {
        let env = tokio::time::timeout(timeout, self.rx.recv()).await.ok().flatten()?;
        self.remaining = self.remaining.saturating_sub(1);
        Some(env)
    }

    /// Gather replies until the expected count is reached or `timeout`
    /// elapses, returning whatever arrived.
    pub async fn collect(mut self, timeout: Duration) -> Vec<Envelope> {
        let deadline = Instant::now() + timeout;
        let mut replies = Vec::with_capacity(self.remaining);
        while self.remaining > 0 {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(env)) => {
                    self.remaining -= 1;
                    replies.push(env);
                }
                Ok(None) | Err(_) => break,
            }
        }
        if self.remaining > 0 {
            tracing::debug!(msg_id = self.msg_id, missing = self.remaining, "[Rpc] collect timed out");
        }
        replies
    }

    /// Feed replies to `f` until it breaks, the expected count is reached or
    /// `timeout` elapses. Replies after the break are never looked at.
    pub async fn until<T, F>(mut self, timeout: Duration, mut f: F) -> Option<T>
    where
        F: FnMut(Envelope) -> ControlFlow<T>,
    {
        let deadline = Instant::now() + timeout;
        while self.remaining > 0 {
            match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                Ok(Some(env)) => {
                    self.remaining -= 1;
                    if let ControlFlow::Break(value) = f(env) {
                        return Some(value);
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }
        None
    }
}

impl Drop for ReplyCollector {
    fn drop(&mut self) {
        self.router.forget(self.msg_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Body, EpochMessage, ReplicationMessage};
    use strata_model::{DataToAdd, Epoch, Id};
    use strata_net_types::NodeHandle;

    fn reply(to: MsgId, body: Body) -> Envelope {
        Envelope::reply(0, NodeHandle::new(Id::digest(b"r"), "r"), to, body)
    }

    fn epoch_reply(to: MsgId) -> Envelope {
        reply(to, Body::Epoch(EpochMessage::MostRecentIs { epoch: Some(Epoch(1)) }))
    }

    #[tokio::test]
    async fn collect_stops_at_expected_count() {
        let router = Arc::new(ReplyRouter::new());
        let id = router.next_msg_id();
        let collector = router.register(id, &[ReplyKind::Epoch], 2);

        for _ in 0..3 {
            router.deliver(epoch_reply(id)).unwrap();
        }
        let replies = collector.collect(Duration::from_secs(5)).await;
        assert_eq!(replies.len(), 2);
        assert_eq!(router.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn collect_returns_partial_results_on_timeout() {
        let router = Arc::new(ReplyRouter::new());
        let id = router.next_msg_id();
        let collector = router.register(id, &[ReplyKind::Epoch], 3);
        router.deliver(epoch_reply(id)).unwrap();

        let replies = collector.collect(Duration::from_millis(500)).await;
        assert_eq!(replies.len(), 1);
    }

    #[tokio::test]
    async fn wrong_kind_and_unknown_ids_are_refused() {
        let router = Arc::new(ReplyRouter::new());
        let id = router.next_msg_id();
        let _collector = router.register(id, &[ReplyKind::Epoch], 1);

        let data = reply(id, Body::Replication(ReplicationMessage::DataReply { id: Id::MIN, data: DataToAdd::new() }));
        assert!(matches!(router.deliver(data), Err(Undeliverable::WrongKind(_))));
        assert!(matches!(router.deliver(epoch_reply(id + 100)), Err(Undeliverable::Unknown(_))));

        // Failures always reach the caller
        assert!(router.deliver(reply(id, Body::failure("boom"))).is_ok());
    }

    #[tokio::test]
    async fn dropping_the_collector_cancels() {
        let router = Arc::new(ReplyRouter::new());
        let id = router.next_msg_id();
        let collector = router.register(id, &[ReplyKind::Epoch], 1);
        assert_eq!(router.pending(), 1);
        drop(collector);

        assert_eq!(router.pending(), 0);
        assert!(matches!(router.deliver(epoch_reply(id)), Err(Undeliverable::Unknown(_))));
    }

    #[tokio::test]
    async fn until_breaks_on_first_usable_reply() {
        let router = Arc::new(ReplyRouter::new());
        let id = router.next_msg_id();
        let collector = router.register(id, &[ReplyKind::Epoch], 3);
        router.deliver(reply(id, Body::Epoch(EpochMessage::MostRecentIs { epoch: None }))).unwrap();
        router.deliver(reply(id, Body::Epoch(EpochMessage::MostRecentIs { epoch: Some(Epoch(4)) }))).unwrap();
        router.deliver(reply(id, Body::Epoch(EpochMessage::MostRecentIs { epoch: Some(Epoch(9)) }))).unwrap();

        let mut seen = 0;
        let found = collector
            .until(Duration::from_secs(5), |env| {
                seen += 1;
                match env.body {
                    Body::Epoch(EpochMessage::MostRecentIs { epoch: Some(e) }) => ControlFlow::Break(e),
                    _ => ControlFlow::Continue(()),
                }
            })
            .await;
        assert_eq!(found, Some(Epoch(4)));
        assert_eq!(seen, 2);
    }

    #[test]
    fn message_ids_are_unique() {
        let router = ReplyRouter::new();
        let a = router.next_msg_id();
        let b = router.next_msg_id();
        assert_ne!(a, b);
    }
}
