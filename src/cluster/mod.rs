//! # Cluster object model
//!
//! The subset of orchestrator objects the state cache reads: machines in
//! both of their representations, pods, and the supporting resources
//! consulted while accounting for them.
//!
//! ## Two views of one machine
//!
//! ```text
//!   provisioner                     machine agent
//!       │                                 │
//!       ▼                                 ▼
//! ┌─────────────┐   provider id    ┌─────────────┐
//! │  NodeClaim  │ ───────────────▶ │    Node     │
//! │ (estimate)  │                  │ (reported)  │
//! └─────────────┘                  └─────────────┘
//! ```
//!
//! A `NodeClaim` exists from the moment capacity is requested; the `Node`
//! only appears after the instance boots and registers. The cache merges
//! both into a single `StateNode`.

pub mod meta;
pub mod node;
pub mod pod;
pub mod resources;
pub mod workloads;

pub use meta::{Condition, Conditions, ObjectMeta, OwnerReference, Taint, TaintEffect};
pub use node::{Node, NodeClaim, NodeClaimSpec, NodeClaimStatus, NodeClassReference, NodeSpec, NodeStatus};
pub use pod::{HostPort, Pod, PodPhase, PodVolume, Protocol};
pub use resources::*;
pub use workloads::{CsiNode, CsiNodeDriver, DaemonSet, NodePool, PdbLimits, PodDisruptionBudget};

/// API group for provisioner-owned keys
pub const GROUP: &str = "provisioning.dev";

/// Label naming the pool a machine was provisioned for; its presence marks a node as managed
pub const NODE_POOL_LABEL_KEY: &str = "provisioning.dev/nodepool";

/// Set to "true" once the node has joined and matched its claim
pub const NODE_REGISTERED_LABEL_KEY: &str = "provisioning.dev/registered";

/// Set to "true" once startup taints are gone and resources are reported
pub const NODE_INITIALIZED_LABEL_KEY: &str = "provisioning.dev/initialized";

/// Annotation on nodes or pods that opts them out of voluntary disruption
pub const DO_NOT_DISRUPT_ANNOTATION_KEY: &str = "provisioning.dev/do-not-disrupt";

/// Taint placed on nodes about to be disrupted
pub const DISRUPTED_TAINT_KEY: &str = "provisioning.dev/disrupted";

pub const LABEL_INSTANCE_TYPE: &str = "node.kubernetes.io/instance-type";

pub const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";

/// NodeClaim condition set when the cloud instance is shutting down
pub const CONDITION_INSTANCE_TERMINATING: &str = "InstanceTerminating";

/// NodePool condition reporting whether launched nodes register successfully
pub const CONDITION_NODE_REGISTRATION_HEALTHY: &str = "NodeRegistrationHealthy";

/// The "no new work" taint applied ahead of disruption
pub fn disrupted_no_schedule_taint() -> Taint {
    Taint::new(DISRUPTED_TAINT_KEY, "", TaintEffect::NoSchedule)
}

/// Taints that appear transiently while any node boots
pub fn known_ephemeral_taints() -> Vec<Taint> {
    vec![
        Taint::new("node.kubernetes.io/not-ready", "", TaintEffect::NoSchedule),
        Taint::new("node.kubernetes.io/unreachable", "", TaintEffect::NoSchedule),
        Taint::new(
            "node.cloudprovider.kubernetes.io/uninitialized",
            "true",
            TaintEffect::NoSchedule,
        ),
    ]
}
