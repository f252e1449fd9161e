//! Outbound messaging
//!
//! Wraps the overlay with envelope construction. An envelope is encoded
//! once and the same `Bytes` is routed to every destination.

use crate::correlation::{ReplyCollector, ReplyRouter};
use crate::error::KernelError;
use crate::protocol::{Body, Envelope, MsgId, ReplyKind};
use std::sync::Arc;
use strata_model::{Encode, Id, Item};
use strata_net_types::{Destination, NodeHandle, Overlay};

#[derive(Clone, Debug)]
pub struct Outbox {
    overlay: Arc<dyn Overlay>,
    router: Arc<ReplyRouter>,
}

impl Outbox {
    pub fn new(overlay: Arc<dyn Overlay>, router: Arc<ReplyRouter>) -> Self {
        Self { overlay, router }
    }

    pub fn overlay(&self) -> &Arc<dyn Overlay> {
        &self.overlay
    }

    pub fn router(&self) -> &Arc<ReplyRouter> {
        &self.router
    }

    pub fn local(&self) -> NodeHandle {
        self.overlay.local_handle()
    }

    /// Overlay id an item is stored under.
    pub fn item_id(&self, item: &Item) -> Id {
        self.overlay.id_from_content(&item.content_key())
    }

    /// Replica set of `id` without the local node.
    pub fn peers_for(&self, id: &Id, factor: usize) -> Vec<NodeHandle> {
        let local = self.local();
        self.overlay.replica_set(id, factor).into_iter().filter(|h| *h != local).collect()
    }

    /// Route a pre-built envelope to every destination. Returns how many
    /// routes the overlay accepted.
    fn fan_out(&self, env: &Envelope, dests: impl IntoIterator<Item = Destination>) -> usize {
        let bytes = env.to_bytes();
        let mut sent = 0;
        for dest in dests {
            match self.overlay.route(dest.clone(), bytes.clone()) {
                Ok(()) => sent += 1,
                Err(e) => {
                    tracing::warn!(msg_id = env.msg_id, dest = %dest, error = %e, "[Rpc] route failed");
                }
            }
        }
        sent
    }

    /// One-way message to each destination.
    pub fn send(&self, dests: impl IntoIterator<Item = Destination>, body: Body) -> usize {
        let env = Envelope::request(self.router.next_msg_id(), self.local(), body);
        self.fan_out(&env, dests)
    }

    /// Pass a request on under its original id and origin.
    pub fn forward(&self, dest: Destination, msg_id: MsgId, origin: NodeHandle, body: Body) -> Result<(), KernelError> {
        let env = Envelope::request(msg_id, origin, body);
        self.overlay.route(dest, env.to_bytes())?;
        Ok(())
    }

    /// Answer the request `msg_id` that came from `origin`.
    pub fn reply(&self, origin: &NodeHandle, msg_id: MsgId, body: Body) -> Result<(), KernelError> {
        let env = Envelope::reply(self.router.next_msg_id(), self.local(), msg_id, body);
        self.overlay.route(Destination::Node(origin.clone()), env.to_bytes())?;
        Ok(())
    }

    /// Send a request to each destination and wait for one reply per
    /// accepted route.
    pub fn request(
        &self,
        dests: impl IntoIterator<Item = Destination>,
        body: Body,
        kinds: &[ReplyKind],
    ) -> ReplyCollector {
        let msg_id = self.router.next_msg_id();
        let mut collector = self.router.register(msg_id, kinds, 0);
        let env = Envelope::request(msg_id, self.local(), body);
        let sent = self.fan_out(&env, dests);
        collector.expect_more(sent);
        collector
    }
}
