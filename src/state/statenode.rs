//! The merged view of one machine
//!
//! A machine can be known through its `NodeClaim`, its `Node`, or both.
//! Which half answers a question depends on how far the machine has come
//! through its lifecycle:
//!
//! | halves | registered | initialized | metadata | capacity                    |
//! |--------|------------|-------------|----------|-----------------------------|
//! | claim  | no         | no          | claim    | claim                       |
//! | node   | yes        | yes         | node     | node                        |
//! | both   | no         | *           | claim    | node backfilled from claim  |
//! | both   | yes        | no          | node     | node backfilled from claim  |
//! | both   | *          | yes         | node     | node                        |
//!
//! A node without a claim is unmanaged and always counts as registered and
//! initialized.

use std::collections::HashMap;
use std::fmt;
use std::ops::Deref;

use crate::cluster::pod::{host_ports, is_disruptable, is_owned_by_daemonset, limits_for_pod, requests_for_pod, volumes};
use crate::cluster::{
    is_zero, known_ephemeral_taints, merge, subtract, NamespacedName, Node, NodeClaim, PdbLimits, Pod,
    ResourceList, Taint, CONDITION_INSTANCE_TERMINATING, DO_NOT_DISRUPT_ANNOTATION_KEY, LABEL_HOSTNAME,
    NODE_INITIALIZED_LABEL_KEY, NODE_POOL_LABEL_KEY, NODE_REGISTERED_LABEL_KEY, Quantity, RESOURCE_NODES,
};
use crate::clock::SharedClock;
use crate::store::{KubeClient, OpContext};

use super::errors::{DisruptionBlocked, StateError};
use super::hostports::HostPortUsage;
use super::lease::Lease;
use super::volumes::VolumeUsage;

/// The halves a view currently holds; never empty
#[derive(Debug, Clone, PartialEq)]
pub enum Halves {
    Claim(NodeClaim),
    Node(Node),
    Both { claim: NodeClaim, node: Node },
}

impl Halves {
    /// Pair up optional halves, `None` if both are missing
    pub fn join(claim: Option<NodeClaim>, node: Option<Node>) -> Option<Halves> {
        match (claim, node) {
            (Some(claim), Some(node)) => Some(Halves::Both { claim, node }),
            (Some(claim), None) => Some(Halves::Claim(claim)),
            (None, Some(node)) => Some(Halves::Node(node)),
            (None, None) => None,
        }
    }

    pub fn into_parts(self) -> (Option<NodeClaim>, Option<Node>) {
        match self {
            Halves::Claim(claim) => (Some(claim), None),
            Halves::Node(node) => (None, Some(node)),
            Halves::Both { claim, node } => (Some(claim), Some(node)),
        }
    }

    pub fn claim(&self) -> Option<&NodeClaim> {
        match self {
            Halves::Claim(claim) | Halves::Both { claim, .. } => Some(claim),
            Halves::Node(_) => None,
        }
    }

    pub fn node(&self) -> Option<&Node> {
        match self {
            Halves::Node(node) | Halves::Both { node, .. } => Some(node),
            Halves::Claim(_) => None,
        }
    }
}

/// Which half answers a question
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Claim,
    Node,
    /// The node's figures with zero quantities replaced by the claim's estimate
    NodeBackfilledFromClaim,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Precedence {
    pub metadata: Source,
    pub capacity: Source,
}

/// Resolve the precedence table for a view
pub fn precedence(halves: &Halves, registered: bool, initialized: bool) -> Precedence {
    match halves {
        Halves::Claim(_) => Precedence {
            metadata: Source::Claim,
            capacity: Source::Claim,
        },
        Halves::Node(_) => Precedence {
            metadata: Source::Node,
            capacity: Source::Node,
        },
        Halves::Both { .. } => Precedence {
            metadata: if registered { Source::Node } else { Source::Claim },
            capacity: if initialized {
                Source::Node
            } else {
                Source::NodeBackfilledFromClaim
            },
        },
    }
}

pub(crate) fn label_is_true(node: Option<&Node>, key: &str) -> bool {
    node.and_then(|n| n.metadata.label(key))
        .map(|v| v == "true")
        .unwrap_or(false)
}

fn backfill(node: &ResourceList, claim: &ResourceList) -> ResourceList {
    let mut out = node.clone();
    for (name, quantity) in claim {
        if is_zero(out.get(name)) {
            out.insert(name.clone(), *quantity);
        }
    }
    out
}

/// Cached state of one machine
#[derive(Clone)]
pub struct StateNode {
    halves: Halves,

    pod_requests: HashMap<NamespacedName, ResourceList>,
    pod_limits: HashMap<NamespacedName, ResourceList>,
    daemonset_requests: HashMap<NamespacedName, ResourceList>,
    daemonset_limits: HashMap<NamespacedName, ResourceList>,

    host_port_usage: HostPortUsage,
    volume_usage: VolumeUsage,

    marked_for_deletion: bool,
    lease: Option<Lease>,

    clock: SharedClock,
}

impl fmt::Debug for StateNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateNode")
            .field("name", &self.name())
            .field("provider_id", &self.provider_id())
            .field("managed", &self.managed())
            .field("registered", &self.registered())
            .field("initialized", &self.initialized())
            .field("marked_for_deletion", &self.marked_for_deletion())
            .field("pods", &self.pod_requests.len())
            .finish()
    }
}

/// What a view contributes to aggregate bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ViewSummary {
    pub pool: Option<String>,
    pub resources: ResourceList,
    pub initialized: bool,
    pub marked_for_deletion: bool,
    pub has_claim: bool,
    pub has_node: bool,
}

impl StateNode {
    pub fn new(halves: Halves, clock: SharedClock) -> Self {
        Self {
            halves,
            pod_requests: HashMap::new(),
            pod_limits: HashMap::new(),
            daemonset_requests: HashMap::new(),
            daemonset_limits: HashMap::new(),
            host_port_usage: HostPortUsage::new(),
            volume_usage: VolumeUsage::new(),
            marked_for_deletion: false,
            lease: None,
            clock,
        }
    }

    pub fn halves(&self) -> &Halves {
        &self.halves
    }

    pub fn node(&self) -> Option<&Node> {
        self.halves.node()
    }

    pub fn node_claim(&self) -> Option<&NodeClaim> {
        self.halves.claim()
    }

    /// Swap in a new claim, keeping the node half and all pod bookkeeping
    pub(crate) fn with_claim(mut self, claim: NodeClaim) -> Self {
        let (_, node) = self.halves.into_parts();
        self.halves = match node {
            Some(node) => Halves::Both { claim, node },
            None => Halves::Claim(claim),
        };
        self
    }

    /// Swap in a new node; pod bookkeeping is rebuilt by the caller
    pub(crate) fn with_node(mut self, node: Node) -> Self {
        let (claim, _) = self.halves.into_parts();
        self.halves = match claim {
            Some(claim) => Halves::Both { claim, node },
            None => Halves::Node(node),
        };
        self
    }

    /// Drop the claim half; `None` if nothing would remain
    pub(crate) fn without_claim(mut self) -> Option<Self> {
        let (_, node) = self.halves.into_parts();
        self.halves = Halves::Node(node?);
        Some(self)
    }

    /// Drop the node half; `None` if nothing would remain
    pub(crate) fn without_node(mut self) -> Option<Self> {
        let (claim, _) = self.halves.into_parts();
        self.halves = Halves::Claim(claim?);
        Some(self)
    }

    /// Clear per-pod bookkeeping ahead of a rebuild from a fresh pod listing
    pub(crate) fn reset_pod_usage(&mut self) {
        self.pod_requests.clear();
        self.pod_limits.clear();
        self.daemonset_requests.clear();
        self.daemonset_limits.clear();
        self.host_port_usage = HostPortUsage::new();
        self.volume_usage = VolumeUsage::new();
    }

    pub(crate) fn volume_usage_mut(&mut self) -> &mut VolumeUsage {
        &mut self.volume_usage
    }

    pub fn managed(&self) -> bool {
        self.node_claim().is_some()
    }

    pub fn registered(&self) -> bool {
        !self.managed() || label_is_true(self.node(), NODE_REGISTERED_LABEL_KEY)
    }

    pub fn initialized(&self) -> bool {
        !self.managed() || label_is_true(self.node(), NODE_INITIALIZED_LABEL_KEY)
    }

    pub fn precedence(&self) -> Precedence {
        precedence(&self.halves, self.registered(), self.initialized())
    }

    fn pick<'a, T: ?Sized>(
        &'a self,
        source: Source,
        from_claim: impl Fn(&'a NodeClaim) -> &'a T,
        from_node: impl Fn(&'a Node) -> &'a T,
    ) -> &'a T {
        match &self.halves {
            Halves::Claim(claim) => from_claim(claim),
            Halves::Node(node) => from_node(node),
            Halves::Both { claim, node } => match source {
                Source::Claim => from_claim(claim),
                Source::Node | Source::NodeBackfilledFromClaim => from_node(node),
            },
        }
    }

    pub fn name(&self) -> &str {
        self.pick(self.precedence().metadata, |c| c.name(), |n| n.name())
    }

    /// The key of this view: the node's provider id when a node is present
    pub fn provider_id(&self) -> &str {
        match self.node() {
            Some(node) => &node.spec.provider_id,
            None => self
                .node_claim()
                .map(|c| c.status.provider_id.as_str())
                .unwrap_or_default(),
        }
    }

    pub fn host_name(&self) -> &str {
        match self.labels().get(LABEL_HOSTNAME) {
            Some(host) if !host.is_empty() => host,
            _ => self.name(),
        }
    }

    pub fn labels(&self) -> &HashMap<String, String> {
        self.pick(
            self.precedence().metadata,
            |c| &c.metadata.labels,
            |n| &n.metadata.labels,
        )
    }

    pub fn annotations(&self) -> &HashMap<String, String> {
        self.pick(
            self.precedence().metadata,
            |c| &c.metadata.annotations,
            |n| &n.metadata.annotations,
        )
    }

    pub fn node_pool(&self) -> Option<&str> {
        self.labels()
            .get(NODE_POOL_LABEL_KEY)
            .map(String::as_str)
            .filter(|p| !p.is_empty())
    }

    /// Taints, ignoring startup and well-known boot taints until initialized
    pub fn taints(&self) -> Vec<Taint> {
        let taints = self.pick(
            self.precedence().metadata,
            |c| &c.spec.taints,
            |n| &n.spec.taints,
        );
        let Some(claim) = self.node_claim().filter(|_| !self.initialized()) else {
            return taints.clone();
        };
        let ephemeral = known_ephemeral_taints();
        taints
            .iter()
            .filter(|t| {
                !ephemeral.iter().any(|e| e.matches(t))
                    && !claim.spec.startup_taints.iter().any(|s| s.matches(t))
            })
            .cloned()
            .collect()
    }

    fn resources(
        &self,
        from_claim: fn(&NodeClaim) -> &ResourceList,
        from_node: fn(&Node) -> &ResourceList,
    ) -> ResourceList {
        match (&self.halves, self.precedence().capacity) {
            (Halves::Both { claim, node }, Source::NodeBackfilledFromClaim) => {
                backfill(from_node(node), from_claim(claim))
            }
            _ => self
                .pick(self.precedence().capacity, from_claim, from_node)
                .clone(),
        }
    }

    pub fn capacity(&self) -> ResourceList {
        self.resources(|c| &c.status.capacity, |n| &n.status.capacity)
    }

    pub fn allocatable(&self) -> ResourceList {
        self.resources(|c| &c.status.allocatable, |n| &n.status.allocatable)
    }

    /// Allocatable minus everything requested by bound pods
    pub fn available(&self) -> ResourceList {
        subtract(&self.allocatable(), &self.pod_requests())
    }

    pub fn pod_requests(&self) -> ResourceList {
        merge(self.pod_requests.values())
    }

    pub fn pod_limits(&self) -> ResourceList {
        merge(self.pod_limits.values())
    }

    pub fn daemonset_requests(&self) -> ResourceList {
        merge(self.daemonset_requests.values())
    }

    pub fn daemonset_limits(&self) -> ResourceList {
        merge(self.daemonset_limits.values())
    }

    /// Pods whose footprint is currently counted on this view
    pub fn tracked_pods(&self) -> Vec<NamespacedName> {
        let mut pods: Vec<_> = self.pod_requests.keys().cloned().collect();
        pods.sort();
        pods
    }

    pub fn host_port_usage(&self) -> &HostPortUsage {
        &self.host_port_usage
    }

    pub fn volume_usage(&self) -> &VolumeUsage {
        &self.volume_usage
    }

    pub fn marked_for_deletion(&self) -> bool {
        self.marked_for_deletion || self.deleted()
    }

    pub(crate) fn set_marked_for_deletion(&mut self, marked: bool) {
        self.marked_for_deletion = marked;
    }

    /// The claim is going away, or an unmanaged node is
    pub fn deleted(&self) -> bool {
        match (self.node_claim(), self.node()) {
            (Some(claim), _) => {
                claim.metadata.is_deleting()
                    || claim
                        .status
                        .conditions
                        .is_true(CONDITION_INSTANCE_TERMINATING)
            }
            (None, Some(node)) => node.metadata.is_deleting(),
            (None, None) => false,
        }
    }

    /// Reserve this node for `window`; extends an existing reservation
    pub fn nominate(&mut self, window: std::time::Duration) {
        let window = chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::seconds(10));
        self.lease = Some(Lease::new(self.provider_id(), self.clock.now() + window));
    }

    pub fn nominated(&self) -> bool {
        self.lease
            .as_ref()
            .map(|l| l.is_open(self.clock.as_ref()))
            .unwrap_or(false)
    }

    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    /// Drop a reservation whose window has passed, returning it
    pub(crate) fn take_expired_lease(&mut self) -> Option<Lease> {
        let expired = self
            .lease
            .as_ref()
            .map(|l| !l.is_open(self.clock.as_ref()))
            .unwrap_or(false);
        if expired {
            self.lease.take()
        } else {
            None
        }
    }

    /// Check the node-level preconditions for voluntary disruption
    pub fn validate_node_disruptable(&self) -> Result<(), DisruptionBlocked> {
        if !self.managed() {
            return Err(DisruptionBlocked::Unmanaged);
        }
        if self.node().is_none() {
            return Err(DisruptionBlocked::NoNode);
        }
        if !self.initialized() {
            return Err(DisruptionBlocked::Uninitialized);
        }
        if self.marked_for_deletion() {
            return Err(DisruptionBlocked::MarkedForDeletion);
        }
        if self.nominated() {
            return Err(DisruptionBlocked::Nominated);
        }
        if self
            .annotations()
            .get(DO_NOT_DISRUPT_ANNOTATION_KEY)
            .map(|v| v == "true")
            .unwrap_or(false)
        {
            return Err(DisruptionBlocked::DoNotDisrupt);
        }
        if !self.labels().contains_key(NODE_POOL_LABEL_KEY) {
            return Err(DisruptionBlocked::MissingNodePoolLabel);
        }
        Ok(())
    }

    /// Pods bound to this node according to the store
    pub async fn pods(&self, ctx: &OpContext, client: &dyn KubeClient) -> Result<Vec<Pod>, StateError> {
        let Some(node) = self.node() else {
            return Ok(vec![]);
        };
        Ok(ctx.run(client.list_pods_on_node(node.name())).await?)
    }

    /// Check that every pod bound to this node may be evicted
    ///
    /// Returns the bound pods either way so callers can reuse the listing.
    pub async fn validate_pods_disruptable(
        &self,
        ctx: &OpContext,
        client: &dyn KubeClient,
        pdbs: &PdbLimits,
    ) -> Result<Vec<Pod>, StateError> {
        let pods = self.pods(ctx, client).await?;
        if let Some(pod) = pods.iter().find(|p| !is_disruptable(p)) {
            return Err(StateError::PodBlockEviction(format!(
                "pod {} has {:?} annotation",
                pod.key(),
                DO_NOT_DISRUPT_ANNOTATION_KEY
            )));
        }
        if let Err(pdb) = pdbs.can_evict_pods(&pods) {
            return Err(StateError::PodBlockEviction(format!(
                "pdb {} prevents pod evictions",
                pdb
            )));
        }
        Ok(pods)
    }

    /// Count `pod` against this node; replaces any previous footprint of the same pod
    pub(crate) fn update_for_pod(&mut self, pod: &Pod) {
        let key = pod.key();
        let requests = requests_for_pod(pod);
        let limits = limits_for_pod(pod);
        if is_owned_by_daemonset(pod) {
            self.daemonset_requests.insert(key.clone(), requests.clone());
            self.daemonset_limits.insert(key.clone(), limits.clone());
        }
        self.pod_requests.insert(key.clone(), requests);
        self.pod_limits.insert(key.clone(), limits);
        self.host_port_usage.add(&key, host_ports(pod));
        self.volume_usage.add(&key, volumes(pod));
    }

    pub(crate) fn cleanup_for_pod(&mut self, key: &NamespacedName) {
        self.host_port_usage.delete_pod(key);
        self.volume_usage.delete_pod(key);
        self.pod_requests.remove(key);
        self.pod_limits.remove(key);
        self.daemonset_requests.remove(key);
        self.daemonset_limits.remove(key);
    }

    /// Pool contribution: capacity plus one node, nothing while deleting
    pub(crate) fn summary(&self) -> ViewSummary {
        let marked_for_deletion = self.marked_for_deletion();
        let mut resources = ResourceList::new();
        if !marked_for_deletion {
            resources = self.capacity();
            resources.insert(RESOURCE_NODES.to_string(), Quantity::from_units(1));
        }
        ViewSummary {
            pool: self.node_pool().map(str::to_string),
            resources,
            initialized: self.initialized(),
            marked_for_deletion,
            has_claim: self.node_claim().is_some(),
            has_node: self.node().is_some(),
        }
    }
}

/// A snapshot of state nodes
#[derive(Debug, Clone, Default)]
pub struct StateNodes(pub Vec<StateNode>);

impl StateNodes {
    /// Nodes not marked for deletion
    pub fn active(&self) -> StateNodes {
        StateNodes(
            self.0
                .iter()
                .filter(|n| !n.marked_for_deletion())
                .cloned()
                .collect(),
        )
    }

    pub fn deleting(&self) -> StateNodes {
        StateNodes(
            self.0
                .iter()
                .filter(|n| n.marked_for_deletion())
                .cloned()
                .collect(),
        )
    }

    /// All pods bound to these nodes
    pub async fn pods(&self, ctx: &OpContext, client: &dyn KubeClient) -> Result<Vec<Pod>, StateError> {
        let mut pods = vec![];
        for node in &self.0 {
            pods.extend(node.pods(ctx, client).await?);
        }
        Ok(pods)
    }

    pub fn by_provider_id(&self, provider_id: &str) -> Option<&StateNode> {
        self.0.iter().find(|n| n.provider_id() == provider_id)
    }
}

impl Deref for StateNodes {
    type Target = [StateNode];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl IntoIterator for StateNodes {
    type Item = StateNode;
    type IntoIter = std::vec::IntoIter<StateNode>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::cluster::{resource_list, LabelSelector, PodDisruptionBudget, Protocol, TaintEffect};
    use crate::clock::FakeClock;
    use crate::store::MemoryStore;

    fn clock() -> (FakeClock, SharedClock) {
        let clock = FakeClock::default();
        let shared: SharedClock = Arc::new(clock.clone());
        (clock, shared)
    }

    fn claim() -> NodeClaim {
        NodeClaim::new("claim-1")
            .with_provider_id("fake://i-1")
            .with_node_pool("default")
            .with_label("from", "claim")
            .with_resources(resource_list([("cpu", "4"), ("memory", "16Gi"), ("pods", "110")]))
    }

    fn node() -> Node {
        Node::new("node-1")
            .with_provider_id("fake://i-1")
            .with_label(NODE_POOL_LABEL_KEY, "default")
            .with_label("from", "node")
    }

    fn ready(node: Node) -> Node {
        node.with_label(NODE_REGISTERED_LABEL_KEY, "true")
            .with_label(NODE_INITIALIZED_LABEL_KEY, "true")
    }

    #[test]
    fn test_precedence_table() {
        let both = Halves::Both {
            claim: claim(),
            node: node(),
        };
        assert_eq!(
            precedence(&both, false, false),
            Precedence {
                metadata: Source::Claim,
                capacity: Source::NodeBackfilledFromClaim
            }
        );
        assert_eq!(precedence(&both, true, false).metadata, Source::Node);
        assert_eq!(precedence(&both, true, true).capacity, Source::Node);
        assert_eq!(
            precedence(&Halves::Claim(claim()), false, false).capacity,
            Source::Claim
        );
        assert_eq!(
            precedence(&Halves::Node(node()), true, true).metadata,
            Source::Node
        );
    }

    #[test]
    fn test_unregistered_reads_claim_metadata() {
        let (_, clock) = clock();
        let view = StateNode::new(
            Halves::Both {
                claim: claim(),
                node: node(),
            },
            clock,
        );

        assert!(view.managed());
        assert!(!view.registered());
        assert_eq!(view.name(), "claim-1");
        assert_eq!(view.labels().get("from").map(String::as_str), Some("claim"));

        let view = view.with_node(node().with_label(NODE_REGISTERED_LABEL_KEY, "true"));
        assert!(view.registered());
        assert_eq!(view.name(), "node-1");
        assert_eq!(view.host_name(), "node-1");
    }

    #[test]
    fn test_unmanaged_node_is_ready() {
        let (_, clock) = clock();
        let view = StateNode::new(
            Halves::Node(
                Node::new("plain")
                    .with_provider_id("plain")
                    .with_resources(resource_list([("cpu", "2")])),
            ),
            clock,
        );
        assert!(view.registered());
        assert!(view.initialized());
        assert_eq!(view.capacity(), resource_list([("cpu", "2")]));
        assert_eq!(view.validate_node_disruptable(), Err(DisruptionBlocked::Unmanaged));
    }

    #[test]
    fn test_capacity_backfilled_until_initialized() {
        let (_, clock) = clock();
        let partial = node().with_resources(resource_list([("cpu", "4"), ("memory", "0")]));
        let view = StateNode::new(
            Halves::Both {
                claim: claim(),
                node: partial.clone(),
            },
            clock,
        );

        let capacity = view.capacity();
        assert_eq!(capacity["memory"], Quantity::parse("16Gi").unwrap());
        assert_eq!(capacity["pods"], Quantity::from_units(110));

        let view = view.with_node(ready(partial));
        let capacity = view.capacity();
        assert!(capacity["memory"].is_zero());
        assert!(capacity.get("pods").is_none());
    }

    #[test]
    fn test_claim_only_uses_estimate() {
        let (_, clock) = clock();
        let view = StateNode::new(Halves::Claim(claim()), clock);
        assert_eq!(view.allocatable(), claim().status.allocatable);
        assert_eq!(view.provider_id(), "fake://i-1");
        assert_eq!(view.validate_node_disruptable(), Err(DisruptionBlocked::NoNode));
    }

    #[test]
    fn test_startup_taints_hidden_until_initialized() {
        let (_, clock) = clock();
        let startup = Taint::new("example.com/agent-not-ready", "", TaintEffect::NoExecute);
        let custom = Taint::new("example.com/gpu", "true", TaintEffect::NoSchedule);
        let claim = claim().with_startup_taint(startup.clone());
        let booting = node()
            .with_label(NODE_REGISTERED_LABEL_KEY, "true")
            .with_taint(startup.clone())
            .with_taint(Taint::new("node.kubernetes.io/not-ready", "", TaintEffect::NoSchedule))
            .with_taint(custom.clone());

        let view = StateNode::new(
            Halves::Both {
                claim,
                node: booting.clone(),
            },
            clock,
        );
        assert_eq!(view.taints(), vec![custom.clone()]);

        let view = view.with_node(booting.with_label(NODE_INITIALIZED_LABEL_KEY, "true"));
        assert_eq!(view.taints().len(), 3);
    }

    #[test]
    fn test_deleted_sources() {
        let (_, clock) = clock();
        let mut terminating = claim();
        terminating
            .status
            .conditions
            .set(CONDITION_INSTANCE_TERMINATING, true, "Interrupted");
        assert!(StateNode::new(Halves::Claim(terminating), clock.clone()).deleted());

        let mut deleting = node();
        deleting.metadata.deletion_timestamp = Some(chrono::Utc::now());
        assert!(StateNode::new(Halves::Node(deleting.clone()), clock.clone()).deleted());
        // with a claim present only the claim decides
        assert!(!StateNode::new(
            Halves::Both {
                claim: claim(),
                node: deleting
            },
            clock.clone()
        )
        .deleted());

        let mut view = StateNode::new(Halves::Claim(claim()), clock);
        view.set_marked_for_deletion(true);
        assert!(view.marked_for_deletion());
        assert!(view.summary().resources.is_empty());
    }

    #[test]
    fn test_nomination_window() {
        let (fake, clock) = clock();
        let mut view = StateNode::new(Halves::Node(ready(node())), clock);
        assert!(!view.nominated());

        view.nominate(Duration::from_secs(20));
        assert!(view.nominated());
        assert_eq!(view.lease().map(|l| l.provider_id.as_str()), Some("fake://i-1"));

        fake.step(chrono::Duration::seconds(21));
        assert!(!view.nominated());
    }

    #[test]
    fn test_validate_node_disruptable() {
        let (fake, clock) = clock();
        let view = StateNode::new(
            Halves::Both {
                claim: claim(),
                node: ready(node()),
            },
            clock.clone(),
        );
        assert_eq!(view.validate_node_disruptable(), Ok(()));

        let uninitialized = view.clone().with_node(node());
        assert_eq!(
            uninitialized.validate_node_disruptable(),
            Err(DisruptionBlocked::Uninitialized)
        );

        let mut nominated = view.clone();
        nominated.nominate(Duration::from_secs(10));
        assert_eq!(
            nominated.validate_node_disruptable(),
            Err(DisruptionBlocked::Nominated)
        );
        fake.step(chrono::Duration::seconds(11));
        assert_eq!(nominated.validate_node_disruptable(), Ok(()));

        let pinned = view
            .clone()
            .with_node(ready(node()).with_annotation(DO_NOT_DISRUPT_ANNOTATION_KEY, "true"));
        assert_eq!(
            pinned.validate_node_disruptable(),
            Err(DisruptionBlocked::DoNotDisrupt)
        );

        let mut unlabeled = ready(node());
        unlabeled.metadata.labels.remove(NODE_POOL_LABEL_KEY);
        assert_eq!(
            view.with_node(unlabeled).validate_node_disruptable(),
            Err(DisruptionBlocked::MissingNodePoolLabel)
        );
    }

    #[test]
    fn test_pod_footprint() {
        let (_, clock) = clock();
        let mut view = StateNode::new(
            Halves::Node(
                ready(node()).with_resources(resource_list([("cpu", "4"), ("memory", "8Gi")])),
            ),
            clock,
        );
        let web = Pod::new("default", "web")
            .with_container("app", resource_list([("cpu", "1")]))
            .with_host_port(8080, Protocol::Tcp);
        let agent = Pod::new("kube-system", "agent")
            .with_container("agent", resource_list([("cpu", "500m")]))
            .owned_by("DaemonSet", "agent", "uid-1");

        view.update_for_pod(&web);
        view.update_for_pod(&web);
        view.update_for_pod(&agent);

        assert_eq!(view.pod_requests()["cpu"].milli_value(), 1500);
        assert_eq!(view.daemonset_requests()["cpu"].milli_value(), 500);
        assert_eq!(view.available()["cpu"].milli_value(), 2500);
        assert_eq!(view.host_port_usage().len(), 1);

        view.cleanup_for_pod(&web.key());
        assert_eq!(view.pod_requests()["cpu"].milli_value(), 500);
        assert!(view.host_port_usage().is_empty());
        assert_eq!(view.tracked_pods(), vec![agent.key()]);
    }

    #[tokio::test]
    async fn test_validate_pods_disruptable() {
        let (_, clock) = clock();
        let store = MemoryStore::new();
        let ctx = OpContext::background();
        let view = StateNode::new(
            Halves::Both {
                claim: claim(),
                node: ready(node()),
            },
            clock,
        );

        store.apply_pod(Pod::new("default", "web").with_label("app", "web").bound_to("node-1"));
        let pods = view
            .validate_pods_disruptable(&ctx, &store, &PdbLimits::default())
            .await
            .unwrap();
        assert_eq!(pods.len(), 1);

        let pdbs = PdbLimits::new(vec![PodDisruptionBudget::new(
            "default",
            "web",
            LabelSelector::matching("app", "web"),
            0,
        )]);
        let err = view
            .validate_pods_disruptable(&ctx, &store, &pdbs)
            .await
            .unwrap_err();
        assert!(err.is_pod_block_eviction());

        store.apply_pod(
            Pod::new("default", "pinned")
                .with_annotation(DO_NOT_DISRUPT_ANNOTATION_KEY, "true")
                .bound_to("node-1"),
        );
        let err = view
            .validate_pods_disruptable(&ctx, &store, &PdbLimits::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("default/pinned"));
    }

    #[test]
    fn test_state_nodes_filters() {
        let (_, clock) = clock();
        let live = StateNode::new(Halves::Node(ready(node())), clock.clone());
        let mut doomed = StateNode::new(Halves::Claim(claim().with_provider_id("fake://i-2")), clock);
        doomed.set_marked_for_deletion(true);

        let nodes = StateNodes(vec![live, doomed]);
        assert_eq!(nodes.active().len(), 1);
        assert_eq!(nodes.deleting().len(), 1);
        assert!(nodes.by_provider_id("fake://i-2").is_some());
    }
}
