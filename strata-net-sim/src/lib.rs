//! In-memory overlay simulation for Strata
//!
//! Provides:
//! - `SimNetwork`: shared ring broker with join / leave / outage controls
//! - `SimOverlay`: `Overlay` impl routing over tokio channels
//!
//! Enables multi-node replication testing without a real DHT.

mod sim_network;

pub use sim_network::{SimNetwork, SimOverlay};
