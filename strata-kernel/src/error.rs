use strata_model::CodecError;
use strata_net_types::OverlayError;
use strata_storage::{Retryable, StoreError};
use thiserror::Error;

/// Errors raised by the kernel's controllers and node.
#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Overlay error: {0}")]
    Overlay(#[from] OverlayError),

    #[error("Channel closed")]
    ChannelClosed,

    /// A message arrived where it has no meaning.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Local state contradicts the replication index.
    #[error("Invariant violated: {0}")]
    Invariant(String),

    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// A remote handler answered with a failure diagnostic.
    #[error("Remote failure: {0}")]
    Remote(String),
}

impl Retryable for KernelError {
    fn is_retryable(&self) -> bool {
        matches!(self, KernelError::Store(e) if e.is_retryable())
    }
}
