//! Supporting resources consulted by the state cache: daemon sets, CSI
//! driver capabilities, node pools and disruption budgets

use serde::{Deserialize, Serialize};

use super::meta::{Conditions, ObjectMeta};
use super::pod::{is_active, Pod};
use super::resources::{LabelSelector, NamespacedName};
use super::CONDITION_NODE_REGISTRATION_HEALTHY;

/// A daemon workload; one pod per node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DaemonSet {
    pub metadata: ObjectMeta,
}

impl DaemonSet {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, name),
        }
    }
}

/// Per-node storage driver capabilities, named after the node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CsiNode {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub drivers: Vec<CsiNodeDriver>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CsiNodeDriver {
    pub name: String,

    /// Maximum attachable volumes, unset when the driver reports no limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocatable_count: Option<u32>,
}

impl CsiNode {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::named(node_name),
            drivers: vec![],
        }
    }

    pub fn with_driver(mut self, name: impl Into<String>, limit: Option<u32>) -> Self {
        self.drivers.push(CsiNodeDriver {
            name: name.into(),
            allocatable_count: limit,
        });
        self
    }
}

/// A logical pool of machines sharing provisioning constraints
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePool {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub status: NodePoolStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodePoolStatus {
    #[serde(default)]
    pub conditions: Conditions,
}

impl NodePool {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            status: NodePoolStatus::default(),
        }
    }

    pub fn with_registration_healthy(mut self, healthy: bool) -> Self {
        self.status
            .conditions
            .set(CONDITION_NODE_REGISTRATION_HEALTHY, healthy, "Test");
        self
    }

    /// Nodes launched for this pool have recently registered successfully
    pub fn is_registration_healthy(&self) -> bool {
        self.status
            .conditions
            .is_true(CONDITION_NODE_REGISTRATION_HEALTHY)
    }
}

/// Disruption budget for a set of pods
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodDisruptionBudget {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub selector: LabelSelector,

    /// Evictions currently permitted
    #[serde(default)]
    pub disruptions_allowed: u32,
}

impl PodDisruptionBudget {
    pub fn new(namespace: &str, name: &str, selector: LabelSelector, allowed: u32) -> Self {
        Self {
            metadata: ObjectMeta::namespaced(namespace, name),
            selector,
            disruptions_allowed: allowed,
        }
    }
}

/// Snapshot of disruption budgets used to decide whether a set of pods can be evicted
#[derive(Debug, Clone, Default)]
pub struct PdbLimits {
    budgets: Vec<PodDisruptionBudget>,
}

impl PdbLimits {
    pub fn new(budgets: Vec<PodDisruptionBudget>) -> Self {
        Self { budgets }
    }

    /// Returns the key of the first budget blocking eviction of `pods`
    ///
    /// A pod matched by more than one budget cannot be evicted either, so the
    /// second matching budget is reported in that case.
    pub fn can_evict_pods(&self, pods: &[Pod]) -> Result<(), NamespacedName> {
        for pod in pods.iter().filter(|p| is_active(p)) {
            let mut matched: Option<&PodDisruptionBudget> = None;
            for budget in self.budgets.iter().filter(|b| {
                b.metadata.namespace == pod.metadata.namespace
                    && b.selector.matches(&pod.metadata.labels)
            }) {
                if budget.disruptions_allowed == 0 || matched.is_some() {
                    return Err(budget.metadata.key());
                }
                matched = Some(budget);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::pod::PodPhase;

    #[test]
    fn test_nodepool_health() {
        assert!(!NodePool::new("default").is_registration_healthy());
        assert!(NodePool::new("default")
            .with_registration_healthy(true)
            .is_registration_healthy());
        assert!(!NodePool::new("default")
            .with_registration_healthy(false)
            .is_registration_healthy());
    }

    #[test]
    fn test_pdb_blocks_when_no_disruptions_allowed() {
        let limits = PdbLimits::new(vec![PodDisruptionBudget::new(
            "default",
            "web-pdb",
            LabelSelector::matching("app", "web"),
            0,
        )]);
        let web = Pod::new("default", "web-1").with_label("app", "web");
        let other = Pod::new("default", "db-1").with_label("app", "db");

        assert_eq!(
            limits.can_evict_pods(&[other.clone(), web.clone()]),
            Err(NamespacedName::new("default", "web-pdb"))
        );
        assert!(limits.can_evict_pods(&[other]).is_ok());
        assert!(limits
            .can_evict_pods(&[web.with_phase(PodPhase::Succeeded)])
            .is_ok());
    }

    #[test]
    fn test_pdb_ignores_other_namespaces() {
        let limits = PdbLimits::new(vec![PodDisruptionBudget::new(
            "prod",
            "web-pdb",
            LabelSelector::matching("app", "web"),
            0,
        )]);
        let web = Pod::new("default", "web-1").with_label("app", "web");
        assert!(limits.can_evict_pods(&[web]).is_ok());
    }

    #[test]
    fn test_pdb_multiple_matches_block() {
        let limits = PdbLimits::new(vec![
            PodDisruptionBudget::new("default", "a", LabelSelector::matching("app", "web"), 1),
            PodDisruptionBudget::new("default", "b", LabelSelector::default(), 1),
        ]);
        let web = Pod::new("default", "web-1").with_label("app", "web");
        assert_eq!(
            limits.can_evict_pods(&[web]),
            Err(NamespacedName::new("default", "b"))
        );
    }

    #[test]
    fn test_csinode_builder() {
        let csi = CsiNode::new("node-1").with_driver("ebs.csi.aws.com", Some(25));
        assert_eq!(csi.drivers[0].allocatable_count, Some(25));
    }
}
