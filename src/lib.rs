//! In-memory cluster state cache for a node provisioner
//!
//! Tracks every machine through its claim and its registered node, the pods
//! bound to it, and per-pool totals, so scheduling and disruption decisions
//! can be made without a round trip to the store.

pub mod cli;
pub mod clock;
pub mod cluster;
pub mod config;
pub mod metrics;
pub mod state;
pub mod store;
