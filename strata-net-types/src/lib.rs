//! Strata Net Types
//!
//! Shared types for the overlay layer, decoupled from both
//! strata-kernel (replication core) and any concrete DHT.
//!
//! This crate provides:
//! - `Overlay`: routing, replica sets, ranges and membership events
//! - `NodeHandle` / `Destination`: overlay addressing
//! - `Inbound`: a message delivered to the local node

pub mod overlay;

pub use overlay::{Destination, Inbound, MembershipEvent, NodeHandle, Overlay, OverlayError};
