//! Wire protocol
//!
//! Every message is an [`Envelope`]:
//! - requests carry a fresh `msg_id` and are routed to an id or a node
//! - replies set `in_reply_to` and are routed to the request's `origin`
//! - forwarded requests keep the original `msg_id` and `origin`, so the
//!   final answer goes straight back to whoever asked first
//!
//! Bodies are one enum per controller. Each variant is either a request or
//! a reply; [`Body::reply_kind`] tells them apart for the reply router.

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeSet;
use strata_model::codec::get_tag;
use strata_model::{
    CodecError, DataToAdd, Decision, Decode, Encode, Epoch, Id, IdRange, PeerId, PidAndRecno,
    ReconciliationRecord, TrustConditions, TxnPeerId,
};
use strata_net_types::NodeHandle;

pub type MsgId = u64;

/// Defines a message enum with struct variants and its canonical codec.
/// Fields are encoded in declaration order after the variant tag.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $(
                $(#[$vmeta:meta])*
                $variant:ident = $tag:literal { $($field:ident : $ty:ty),* $(,)? }
            ),* $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq)]
        pub enum $name {
            $(
                $(#[$vmeta])*
                $variant { $($field: $ty),* },
            )*
        }

        impl Encode for $name {
            fn encode(&self, buf: &mut BytesMut) {
                match self {
                    $(
                        $name::$variant { $($field),* } => {
                            buf.put_u8($tag);
                            $( $field.encode(buf); )*
                        }
                    )*
                }
            }
        }

        impl Decode for $name {
            fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
                match get_tag(buf)? {
                    $(
                        $tag => Ok($name::$variant { $($field: <$ty>::decode(buf)?),* }),
                    )*
                    tag => Err(CodecError::UnknownTag { kind: stringify!($name), tag }),
                }
            }
        }
    };
}

wire_enum! {
    /// Epoch publication and lookup.
    pub enum EpochMessage {
        Publish = 1 { epoch: Epoch, contents: BTreeSet<TxnPeerId> },
        MostRecent = 2 {},
        Fetch = 3 { epoch: Epoch },
        Published = 4 { epoch: Epoch },
        /// The epoch was taken; `last_epoch` is the holder's most recent one.
        Exists = 5 { epoch: Epoch, last_epoch: Option<Epoch> },
        MostRecentIs = 6 { epoch: Option<Epoch> },
        Contents = 7 { epoch: Epoch, contents: BTreeSet<TxnPeerId> },
        NotPublished = 8 { epoch: Epoch },
    }
}

wire_enum! {
    /// Transaction publication, lookup and reconciliation-scoped delivery.
    pub enum TransactionMessage {
        /// An encoded `Transaction`; its id is recovered from the payload.
        Publish = 1 { contents: Bytes },
        Fetch = 2 { tpi: TxnPeerId },
        /// Deliver `tpi` to `peer` reconciling at `recno`, along with the
        /// undecided antecedents not in `exclude`.
        ReconFetch = 3 {
            tpi: TxnPeerId,
            peer: PeerId,
            recno: i32,
            exclude: BTreeSet<TxnPeerId>,
            filter: bool,
        },
        Published = 4 { tpi: TxnPeerId },
        AlreadyPublished = 5 { tpi: TxnPeerId },
        Contents = 6 { tpi: TxnPeerId, contents: Bytes },
        NotFound = 7 { tpi: TxnPeerId },
        ReconTxn = 8 {
            tpi: TxnPeerId,
            contents: Bytes,
            requested: BTreeSet<TxnPeerId>,
            priority: Option<i32>,
        },
        AlreadyRejected = 9 { tpi: TxnPeerId },
        NotNeeded = 10 { tpi: TxnPeerId },
        Unavailable = 11 { tpi: TxnPeerId },
        TrustUnavailable = 12 { tpi: TxnPeerId },
        AntecedentRejected = 13 { tpi: TxnPeerId, antecedent: TxnPeerId },
    }
}

wire_enum! {
    /// Replica maintenance between nodes.
    pub enum ReplicationMessage {
        HasData = 1 { id: Id },
        HasDataReply = 2 { id: Id, has: bool },
        RequestData = 3 { id: Id },
        DataReply = 4 { id: Id, data: DataToAdd },
        RemoteRange = 5 { factor: u32 },
        RemoteRangeReply = 6 { range: IdRange },
        /// One-way bulk push; never answered.
        BulkData = 7 { data: DataToAdd },
    }
}

wire_enum! {
    /// Trust-condition publication and lookup.
    pub enum PeerMessage {
        Publish = 1 { conditions: TrustConditions },
        Fetch = 2 { peer: PeerId },
        Published = 3 { peer: PeerId, version: u32 },
        Stale = 4 { peer: PeerId, current: u32 },
        Conditions = 5 { conditions: TrustConditions },
        NotFound = 6 { peer: PeerId },
    }
}

wire_enum! {
    /// Reconciliation records and the decisions they carry.
    pub enum ReconciliationMessage {
        Publish = 1 { record: ReconciliationRecord },
        Fetch = 2 { id: PidAndRecno },
        /// One-way: file `decision` for `tpi` under record `id`.
        RecordDecision = 3 { tpi: TxnPeerId, id: PidAndRecno, decision: Decision },
        Published = 4 { id: PidAndRecno },
        Exists = 5 { id: PidAndRecno },
        Contents = 6 { record: ReconciliationRecord },
        NotFound = 7 { id: PidAndRecno },
    }
}

/// Families of replies a caller can wait for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReplyKind {
    Epoch,
    Transaction,
    /// Outcomes of a reconciliation-scoped fetch.
    ReconFetch,
    HasData,
    Data,
    Range,
    Peer,
    Record,
}

impl EpochMessage {
    fn reply_kind(&self) -> Option<ReplyKind> {
        match self {
            EpochMessage::Publish { .. } | EpochMessage::MostRecent {} | EpochMessage::Fetch { .. } => None,
            EpochMessage::Published { .. }
            | EpochMessage::Exists { .. }
            | EpochMessage::MostRecentIs { .. }
            | EpochMessage::Contents { .. }
            | EpochMessage::NotPublished { .. } => Some(ReplyKind::Epoch),
        }
    }
}

impl TransactionMessage {
    fn reply_kind(&self) -> Option<ReplyKind> {
        use TransactionMessage::*;
        match self {
            Publish { .. } | Fetch { .. } | ReconFetch { .. } => None,
            Published { .. } | AlreadyPublished { .. } | Contents { .. } | NotFound { .. } => {
                Some(ReplyKind::Transaction)
            }
            ReconTxn { .. }
            | AlreadyRejected { .. }
            | NotNeeded { .. }
            | Unavailable { .. }
            | TrustUnavailable { .. }
            | AntecedentRejected { .. } => Some(ReplyKind::ReconFetch),
        }
    }

    /// The transaction a reconciliation-scoped outcome is about.
    pub fn subject(&self) -> Option<&TxnPeerId> {
        use TransactionMessage::*;
        match self {
            Publish { .. } => None,
            Fetch { tpi }
            | ReconFetch { tpi, .. }
            | Published { tpi }
            | AlreadyPublished { tpi }
            | Contents { tpi, .. }
            | NotFound { tpi }
            | ReconTxn { tpi, .. }
            | AlreadyRejected { tpi }
            | NotNeeded { tpi }
            | Unavailable { tpi }
            | TrustUnavailable { tpi }
            | AntecedentRejected { tpi, .. } => Some(tpi),
        }
    }
}

impl ReplicationMessage {
    fn reply_kind(&self) -> Option<ReplyKind> {
        match self {
            ReplicationMessage::HasData { .. }
            | ReplicationMessage::RequestData { .. }
            | ReplicationMessage::RemoteRange { .. }
            | ReplicationMessage::BulkData { .. } => None,
            ReplicationMessage::HasDataReply { .. } => Some(ReplyKind::HasData),
            ReplicationMessage::DataReply { .. } => Some(ReplyKind::Data),
            ReplicationMessage::RemoteRangeReply { .. } => Some(ReplyKind::Range),
        }
    }
}

impl PeerMessage {
    fn reply_kind(&self) -> Option<ReplyKind> {
        match self {
            PeerMessage::Publish { .. } | PeerMessage::Fetch { .. } => None,
            PeerMessage::Published { .. }
            | PeerMessage::Stale { .. }
            | PeerMessage::Conditions { .. }
            | PeerMessage::NotFound { .. } => Some(ReplyKind::Peer),
        }
    }
}

impl ReconciliationMessage {
    fn reply_kind(&self) -> Option<ReplyKind> {
        match self {
            ReconciliationMessage::Publish { .. }
            | ReconciliationMessage::Fetch { .. }
            | ReconciliationMessage::RecordDecision { .. } => None,
            ReconciliationMessage::Published { .. }
            | ReconciliationMessage::Exists { .. }
            | ReconciliationMessage::Contents { .. }
            | ReconciliationMessage::NotFound { .. } => Some(ReplyKind::Record),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Body {
    Epoch(EpochMessage),
    Transaction(TransactionMessage),
    Replication(ReplicationMessage),
    Peer(PeerMessage),
    Reconciliation(ReconciliationMessage),
    /// Diagnostic reply to a request that could not be handled.
    Failure { reason: String },
}

impl Body {
    /// `None` for requests. `Failure` answers any kind of request.
    pub fn reply_kind(&self) -> Option<ReplyKind> {
        match self {
            Body::Epoch(m) => m.reply_kind(),
            Body::Transaction(m) => m.reply_kind(),
            Body::Replication(m) => m.reply_kind(),
            Body::Peer(m) => m.reply_kind(),
            Body::Reconciliation(m) => m.reply_kind(),
            Body::Failure { .. } => None,
        }
    }

    pub fn is_reply(&self) -> bool {
        matches!(self, Body::Failure { .. }) || self.reply_kind().is_some()
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Body::Failure { reason: reason.into() }
    }

    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Body::Epoch(_) => "epoch",
            Body::Transaction(_) => "transaction",
            Body::Replication(_) => "replication",
            Body::Peer(_) => "peer",
            Body::Reconciliation(_) => "reconciliation",
            Body::Failure { .. } => "failure",
        }
    }
}

impl Encode for Body {
    fn encode(&self, buf: &mut BytesMut) {
        match self {
            Body::Epoch(m) => {
                buf.put_u8(1);
                m.encode(buf);
            }
            Body::Transaction(m) => {
                buf.put_u8(2);
                m.encode(buf);
            }
            Body::Replication(m) => {
                buf.put_u8(3);
                m.encode(buf);
            }
            Body::Peer(m) => {
                buf.put_u8(4);
                m.encode(buf);
            }
            Body::Reconciliation(m) => {
                buf.put_u8(5);
                m.encode(buf);
            }
            Body::Failure { reason } => {
                buf.put_u8(6);
                reason.encode(buf);
            }
        }
    }
}

impl Decode for Body {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        match get_tag(buf)? {
            1 => Ok(Body::Epoch(EpochMessage::decode(buf)?)),
            2 => Ok(Body::Transaction(TransactionMessage::decode(buf)?)),
            3 => Ok(Body::Replication(ReplicationMessage::decode(buf)?)),
            4 => Ok(Body::Peer(PeerMessage::decode(buf)?)),
            5 => Ok(Body::Reconciliation(ReconciliationMessage::decode(buf)?)),
            6 => Ok(Body::Failure { reason: String::decode(buf)? }),
            tag => Err(CodecError::UnknownTag { kind: "body", tag }),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub msg_id: MsgId,
    /// Node the eventual reply must reach.
    pub origin: NodeHandle,
    pub in_reply_to: Option<MsgId>,
    pub body: Body,
}

impl Envelope {
    pub fn request(msg_id: MsgId, origin: NodeHandle, body: Body) -> Self {
        Self { msg_id, origin, in_reply_to: None, body }
    }

    pub fn reply(msg_id: MsgId, origin: NodeHandle, in_reply_to: MsgId, body: Body) -> Self {
        Self { msg_id, origin, in_reply_to: Some(in_reply_to), body }
    }
}

impl Encode for Envelope {
    fn encode(&self, buf: &mut BytesMut) {
        self.msg_id.encode(buf);
        self.origin.encode(buf);
        self.in_reply_to.encode(buf);
        self.body.encode(buf);
    }
}

impl Decode for Envelope {
    fn decode(buf: &mut Bytes) -> Result<Self, CodecError> {
        Ok(Self {
            msg_id: u64::decode(buf)?,
            origin: NodeHandle::decode(buf)?,
            in_reply_to: Option::decode(buf)?,
            body: Body::decode(buf)?,
        })
    }
}
