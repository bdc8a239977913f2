//! # Cluster state
//!
//! The in-memory model the provisioner and the disruption engine consult
//! instead of hitting the store on every decision.
//!
//! - [`Cluster`]: the cache itself, fed by object events
//! - [`StateNode`]: one machine, merged from its claim and its node
//! - [`require_no_schedule_taint`] / [`clear_node_claims_condition`]: bulk
//!   write-back ahead of disruption

pub mod cluster;
pub mod consolidation;
pub mod errors;
pub mod hostports;
pub mod lease;
pub mod nodepool;
pub mod scheduling;
pub mod statenode;
pub mod sync;
pub mod taints;
pub mod volumes;

pub use cluster::{Cluster, NominationObserver};
pub use errors::{ignore_pod_block_eviction, DisruptionBlocked, StateError};
pub use hostports::{HostPortConflict, HostPortUsage};
pub use lease::Lease;
pub use nodepool::{ClaimState, NodePoolResources, NodePoolState};
pub use statenode::{precedence, Halves, Precedence, Source, StateNode, StateNodes};
pub use taints::{clear_node_claims_condition, require_no_schedule_taint};
pub use volumes::{VolumeLimitExceeded, VolumeUsage};
