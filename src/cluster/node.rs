//! Machine resources - registered Nodes and the NodeClaims that launch them
//!
//! A machine is represented twice:
//! - a `NodeClaim`, created by the provisioner when it asks the cloud for capacity
//! - a `Node`, created by the machine's agent once it boots and joins
//!
//! The two are correlated through the cloud-assigned provider id.

use serde::{Deserialize, Serialize};

use super::meta::{Conditions, ObjectMeta, Taint};
use super::resources::ResourceList;
use super::NODE_POOL_LABEL_KEY;

/// A registered machine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: NodeSpec,

    #[serde(default)]
    pub status: NodeStatus,
}

/// Node specification
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeSpec {
    /// Cloud-assigned instance identity; empty until the cloud controller sets it
    #[serde(default)]
    pub provider_id: String,

    #[serde(default)]
    pub taints: Vec<Taint>,

    #[serde(default)]
    pub unschedulable: bool,
}

/// Resources reported by the node agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub capacity: ResourceList,

    #[serde(default)]
    pub allocatable: ResourceList,
}

impl Node {
    /// Create a new Node with minimal configuration
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn with_provider_id(mut self, provider_id: impl Into<String>) -> Self {
        self.spec.provider_id = provider_id.into();
        self
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.annotations.insert(key.into(), value.into());
        self
    }

    pub fn with_taint(mut self, taint: Taint) -> Self {
        self.spec.taints.push(taint);
        self
    }

    /// Set both capacity and allocatable
    pub fn with_resources(mut self, resources: ResourceList) -> Self {
        self.status.capacity = resources.clone();
        self.status.allocatable = resources;
        self
    }

    pub fn with_allocatable(mut self, allocatable: ResourceList) -> Self {
        self.status.allocatable = allocatable;
        self
    }

    /// The pool this node was provisioned for, if any
    pub fn node_pool(&self) -> Option<&str> {
        self.metadata
            .label(NODE_POOL_LABEL_KEY)
            .filter(|p| !p.is_empty())
    }
}

/// Reference to the cloud-specific class a claim was launched from
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeClassReference {
    pub group: String,
    pub kind: String,
    pub name: String,
}

/// A provisioner-issued request for a machine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeClaim {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: NodeClaimSpec,

    #[serde(default)]
    pub status: NodeClaimStatus,
}

/// What the claim asked for
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimSpec {
    #[serde(default)]
    pub taints: Vec<Taint>,

    /// Taints expected to be removed by node agents once the node is ready
    #[serde(default)]
    pub startup_taints: Vec<Taint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_class_ref: Option<NodeClassReference>,
}

/// What the cloud launched for the claim
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeClaimStatus {
    /// Empty until the instance has been created
    #[serde(default)]
    pub provider_id: String,

    #[serde(default)]
    pub node_name: String,

    /// Capacity estimated from the instance type
    #[serde(default)]
    pub capacity: ResourceList,

    #[serde(default)]
    pub allocatable: ResourceList,

    #[serde(default)]
    pub conditions: Conditions,
}

impl NodeClaim {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::named(name),
            ..Default::default()
        }
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn with_provider_id(mut self, provider_id: impl Into<String>) -> Self {
        self.status.provider_id = provider_id.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.annotations.insert(key.into(), value.into());
        self
    }

    pub fn with_node_pool(self, pool: impl Into<String>) -> Self {
        self.with_label(NODE_POOL_LABEL_KEY, pool)
    }

    pub fn with_taint(mut self, taint: Taint) -> Self {
        self.spec.taints.push(taint);
        self
    }

    pub fn with_startup_taint(mut self, taint: Taint) -> Self {
        self.spec.startup_taints.push(taint);
        self
    }

    /// Set both capacity and allocatable estimates
    pub fn with_resources(mut self, resources: ResourceList) -> Self {
        self.status.capacity = resources.clone();
        self.status.allocatable = resources;
        self
    }

    pub fn with_node_class(mut self, group: &str, kind: &str, name: &str) -> Self {
        self.spec.node_class_ref = Some(NodeClassReference {
            group: group.to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
        });
        self
    }

    pub fn node_pool(&self) -> Option<&str> {
        self.metadata
            .label(NODE_POOL_LABEL_KEY)
            .filter(|p| !p.is_empty())
    }
}
