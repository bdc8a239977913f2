//! Cluster state cache
//!
//! Holds one [`StateNode`] per machine, keyed by provider id, together with
//! the pod bindings and per-pool aggregates derived from them. Everything
//! that feeds the pool totals sits behind a single `RwLock`; independent
//! per-pod caches live in `DashMap`s next to it and are never touched while
//! that lock is held.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::cluster::pod::{has_required_anti_affinity, is_terminal};
use crate::cluster::{
    CsiNode, DaemonSet, NamespacedName, Node, NodeClaim, Pod, ResourceList, CONDITION_INSTANCE_TERMINATING,
    LABEL_INSTANCE_TYPE, NODE_INITIALIZED_LABEL_KEY,
};
use crate::clock::SharedClock;
use crate::config::StateConfig;
use crate::metrics::StateMetrics;
use crate::store::{ignore_not_found, list_managed, CloudProvider, KubeClient, OpContext};

use super::consolidation::ConsolidationClock;
use super::errors::StateError;
use super::nodepool::{NodePoolResources, NodePoolState};
use super::scheduling::SchedulingTracker;
use super::statenode::{label_is_true, Halves, StateNode, StateNodes, ViewSummary};
use super::sync::{covers, SyncTracker};

/// Data guarded by the main lock
#[derive(Default)]
struct ClusterInner {
    /// provider id -> view
    nodes: HashMap<String, StateNode>,
    /// pod -> node name
    bindings: HashMap<NamespacedName, String>,
    node_name_to_provider_id: HashMap<String, String>,
    /// claim name -> provider id; empty until the instance is launched
    node_claim_name_to_provider_id: HashMap<String, String>,
    node_pool_resources: NodePoolResources,
    node_pool_state: NodePoolState,
}

/// A view or one of its halves appearing or vanishing may open a
/// consolidation opportunity, as may a flip in initialization or deletion
fn consolidation_relevant(before: Option<&ViewSummary>, after: Option<&ViewSummary>) -> bool {
    match (before, after) {
        (Some(b), Some(a)) => {
            b.has_claim != a.has_claim
                || b.has_node != a.has_node
                || b.initialized != a.initialized
                || b.marked_for_deletion != a.marked_for_deletion
        }
        _ => true,
    }
}

fn claim_deleting(claim: &NodeClaim) -> bool {
    claim.metadata.is_deleting()
        || claim
            .status
            .conditions
            .is_true(CONDITION_INSTANCE_TERMINATING)
}

impl ClusterInner {
    fn account(&mut self, before: Option<&ViewSummary>, after: Option<&ViewSummary>, consolidation: &ConsolidationClock) {
        self.node_pool_resources.update(before, after);
        if consolidation_relevant(before, after) {
            consolidation.mark_unconsolidated();
        }
    }

    fn upsert_node_claim(&mut self, claim: NodeClaim, consolidation: &ConsolidationClock, clock: &SharedClock) {
        let id = claim.status.provider_id.clone();
        // a reused claim name with a new instance leaves the old view behind
        if let Some(old_id) = self.node_claim_name_to_provider_id.get(claim.name()) {
            if *old_id != id {
                let name = claim.name().to_string();
                self.cleanup_node_claim(&name, consolidation);
            }
        }

        let old = self.nodes.remove(&id);
        let before = old.as_ref().map(StateNode::summary);
        let view = match old {
            Some(view) => view.with_claim(claim),
            None => StateNode::new(Halves::Claim(claim), clock.clone()),
        };
        let after = view.summary();
        self.account(before.as_ref(), Some(&after), consolidation);
        self.nodes.insert(id, view);
    }

    fn cleanup_node_claim(&mut self, name: &str, consolidation: &ConsolidationClock) {
        if let Some(id) = self.node_claim_name_to_provider_id.remove(name) {
            if !id.is_empty() {
                if let Some(view) = self.nodes.remove(&id) {
                    let before = view.summary();
                    let survivor = view.without_claim();
                    let after = survivor.as_ref().map(StateNode::summary);
                    self.node_pool_resources.update(Some(&before), after.as_ref());
                    if let Some(view) = survivor {
                        self.nodes.insert(id, view);
                    }
                }
                consolidation.mark_unconsolidated();
            }
        }
        self.node_pool_state.cleanup(name);
    }

    fn upsert_node(
        &mut self,
        node: Node,
        pods: Vec<Pod>,
        csi_node: Option<CsiNode>,
        consolidation: &ConsolidationClock,
        clock: &SharedClock,
    ) {
        let id = node.spec.provider_id.clone();
        let name = node.name().to_string();
        if let Some(old_id) = self.node_name_to_provider_id.get(&name) {
            if *old_id != id {
                self.cleanup_node(&name, consolidation);
            }
        }

        let old = self.nodes.remove(&id);
        let before = old.as_ref().map(StateNode::summary);
        let mut view = match old {
            Some(view) => view.with_node(node),
            None => StateNode::new(Halves::Node(node), clock.clone()),
        };

        view.reset_pod_usage();
        let mut listed = HashSet::new();
        for pod in pods.iter().filter(|p| !is_terminal(p)) {
            view.update_for_pod(pod);
            self.record_binding(pod, consolidation);
            listed.insert(pod.key());
        }
        // pods that left this node without an event of their own
        let before_prune = self.bindings.len();
        self.bindings
            .retain(|key, bound_to| *bound_to != name || listed.contains(key));
        if self.bindings.len() != before_prune {
            consolidation.mark_unconsolidated();
        }
        if let Some(csi_node) = csi_node {
            for driver in csi_node.drivers {
                if let Some(count) = driver.allocatable_count {
                    view.volume_usage_mut().add_limit(driver.name, count as usize);
                }
            }
        }

        let after = view.summary();
        self.account(before.as_ref(), Some(&after), consolidation);
        self.nodes.insert(id.clone(), view);
        self.node_name_to_provider_id.insert(name, id);
    }

    fn cleanup_node(&mut self, name: &str, consolidation: &ConsolidationClock) {
        let Some(id) = self.node_name_to_provider_id.remove(name) else {
            return;
        };
        if let Some(view) = self.nodes.remove(&id) {
            let before = view.summary();
            let survivor = view.without_node();
            let after = survivor.as_ref().map(StateNode::summary);
            self.node_pool_resources.update(Some(&before), after.as_ref());
            if let Some(view) = survivor {
                self.nodes.insert(id, view);
            }
        }
        consolidation.mark_unconsolidated();
    }

    fn view_for_node_name(&mut self, node_name: &str) -> Option<&mut StateNode> {
        let id = self.node_name_to_provider_id.get(node_name)?;
        self.nodes.get_mut(id)
    }

    /// Move a pod's binding to its current node, releasing any previous node
    fn record_binding(&mut self, pod: &Pod, consolidation: &ConsolidationClock) {
        let key = pod.key();
        if let Some(old_node) = self.bindings.get(&key).cloned() {
            if old_node == pod.spec.node_name {
                return;
            }
            if let Some(view) = self.view_for_node_name(&old_node) {
                view.cleanup_for_pod(&key);
            }
        }
        consolidation.mark_unconsolidated();
        self.bindings.insert(key, pod.spec.node_name.clone());
    }

    fn attach_pod(&mut self, pod: &Pod, consolidation: &ConsolidationClock) -> Result<(), StateError> {
        if pod.spec.node_name.is_empty() {
            return Ok(());
        }
        let view = self
            .view_for_node_name(&pod.spec.node_name)
            .ok_or_else(|| StateError::NodeNotTracked(pod.spec.node_name.clone()))?;
        view.update_for_pod(pod);
        self.record_binding(pod, consolidation);
        Ok(())
    }

    fn release_pod(&mut self, key: &NamespacedName) {
        let Some(node_name) = self.bindings.remove(key) else {
            return;
        };
        if let Some(view) = self.view_for_node_name(&node_name) {
            view.cleanup_for_pod(key);
        }
    }

    fn set_marked_for_deletion(&mut self, provider_ids: &[&str], marked: bool, consolidation: &ConsolidationClock) {
        for id in provider_ids {
            let Some(view) = self.nodes.get_mut(*id) else {
                continue;
            };
            let before = view.summary();
            view.set_marked_for_deletion(marked);
            let after = view.summary();

            if let Some(claim) = view.node_claim() {
                if !marked {
                    self.node_pool_state.unmark(claim.name());
                }
                self.node_pool_state.update_node_claim(
                    claim.node_pool(),
                    claim.name(),
                    after.marked_for_deletion,
                );
            }
            self.account(Some(&before), Some(&after), consolidation);
        }
    }
}

/// Cached, concurrently updated model of every machine in the cluster
pub struct Cluster {
    client: Arc<dyn KubeClient>,
    cloud_provider: Arc<dyn CloudProvider>,
    clock: SharedClock,
    config: StateConfig,
    metrics: StateMetrics,

    inner: RwLock<ClusterInner>,

    sync: SyncTracker,
    consolidation: ConsolidationClock,
    scheduling: SchedulingTracker,
    /// daemon set -> newest pod it controls
    daemonset_pods: DashMap<NamespacedName, Pod>,
    /// pods carrying required anti-affinity terms
    anti_affinity_pods: DashMap<NamespacedName, Pod>,

    nomination_observers: RwLock<Vec<NominationObserver>>,
    last_node_creation: RwLock<Option<DateTime<Utc>>>,
    last_node_deletion: RwLock<Option<DateTime<Utc>>>,
}

/// Called with the provider id of a node whose nomination expired
pub type NominationObserver = Arc<dyn Fn(&str) + Send + Sync>;

/// Raise `slot` to `t`, never lowering it
fn advance(slot: &RwLock<Option<DateTime<Utc>>>, t: DateTime<Utc>) {
    let mut last = slot.write().expect("node timestamp lock poisoned");
    if (*last).map_or(true, |prev| t > prev) {
        *last = Some(t);
    }
}

impl Cluster {
    pub fn new(
        client: Arc<dyn KubeClient>,
        cloud_provider: Arc<dyn CloudProvider>,
        clock: SharedClock,
        config: StateConfig,
    ) -> Self {
        Self {
            sync: SyncTracker::new(
                clock.clone(),
                config.unsynced_log_after(),
                config.unsynced_log_interval(),
            ),
            consolidation: ConsolidationClock::new(clock.clone(), config.consolidation_timeout()),
            scheduling: SchedulingTracker::new(),
            daemonset_pods: DashMap::new(),
            anti_affinity_pods: DashMap::new(),
            nomination_observers: RwLock::new(Vec::new()),
            last_node_creation: RwLock::new(None),
            last_node_deletion: RwLock::new(None),
            inner: RwLock::new(ClusterInner::default()),
            metrics: StateMetrics::new(),
            client,
            cloud_provider,
            clock,
            config,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ClusterInner> {
        self.inner.read().expect("cluster state lock poisoned")
    }

    fn write(&self) -> RwLockWriteGuard<'_, ClusterInner> {
        self.inner.write().expect("cluster state lock poisoned")
    }

    pub fn client(&self) -> &dyn KubeClient {
        self.client.as_ref()
    }

    pub fn config(&self) -> &StateConfig {
        &self.config
    }

    pub fn metrics(&self) -> &StateMetrics {
        &self.metrics
    }

    /// A context bounded by the configured store timeout
    pub fn op_context(&self) -> OpContext {
        OpContext::background().with_timeout(self.config.store_timeout())
    }

    /// Fails if the main lock can no longer be taken
    pub fn check_liveness(&self) -> Result<(), StateError> {
        self.inner
            .write()
            .map(|_| ())
            .map_err(|_| StateError::LockPoisoned)
    }

    // ------------------------------------------------------------------
    // Sync
    // ------------------------------------------------------------------

    /// Whether the cache has caught up with the store
    ///
    /// Before the first success this compares tracked names with a fresh
    /// listing; afterwards it only requires every tracked claim to have a
    /// provider id.
    pub async fn synced(&self, ctx: &OpContext) -> bool {
        let synced = self.check_synced(ctx).await;
        self.sync.record(synced, &self.metrics);
        synced
    }

    async fn check_synced(&self, ctx: &OpContext) -> bool {
        if self.sync.has_synced() {
            return self
                .read()
                .node_claim_name_to_provider_id
                .values()
                .all(|id| !id.is_empty());
        }

        let claims = match ctx
            .run(list_managed(self.client.as_ref(), self.cloud_provider.as_ref()))
            .await
        {
            Ok(claims) => claims,
            Err(e) => {
                error!(error = %e, "failed checking cluster state sync");
                return false;
            }
        };
        let nodes = match ctx.run(self.client.list_nodes()).await {
            Ok(nodes) => nodes,
            Err(e) => {
                error!(error = %e, "failed checking cluster state sync");
                return false;
            }
        };

        let (claim_names, node_names) = {
            let inner = self.read();
            if inner
                .node_claim_name_to_provider_id
                .values()
                .any(|id| id.is_empty())
            {
                return false;
            }
            (
                inner
                    .node_claim_name_to_provider_id
                    .keys()
                    .cloned()
                    .collect::<HashSet<_>>(),
                inner
                    .node_name_to_provider_id
                    .keys()
                    .cloned()
                    .collect::<HashSet<_>>(),
            )
        };

        let synced = covers(&claim_names, claims.iter().map(|c| c.name()))
            && covers(&node_names, nodes.iter().map(|n| n.name()));
        if synced {
            info!(
                node_claims = claim_names.len(),
                nodes = node_names.len(),
                "cluster state synced"
            );
            self.sync.latch();
        }
        synced
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Call `f` for every tracked pod with required anti-affinity that is
    /// bound to a known node; stops when `f` returns false
    pub fn for_pods_with_anti_affinity(&self, mut f: impl FnMut(&Pod, &Node) -> bool) {
        let pods: Vec<Pod> = self
            .anti_affinity_pods
            .iter()
            .map(|entry| entry.value().clone())
            .collect();

        let inner = self.read();
        for pod in &pods {
            let Some(node_name) = inner.bindings.get(&pod.key()) else {
                continue;
            };
            // the node may already be gone if its deletion raced the pod's
            let Some(node) = inner
                .node_name_to_provider_id
                .get(node_name)
                .and_then(|id| inner.nodes.get(id))
                .and_then(StateNode::node)
            else {
                continue;
            };
            if !f(pod, node) {
                return;
            }
        }
    }

    /// Call `f` for every view under the read lock; stops when `f` returns false
    ///
    /// The views must not escape the callback.
    pub fn for_each_node(&self, mut f: impl FnMut(&StateNode) -> bool) {
        let inner = self.read();
        for node in inner.nodes.values() {
            if !f(node) {
                return;
            }
        }
    }

    /// Deep copy of every view
    pub fn nodes(&self) -> StateNodes {
        let inner = self.read();
        let mut nodes: Vec<StateNode> = inner.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.provider_id().cmp(b.provider_id()));
        StateNodes(nodes)
    }

    pub fn is_node_nominated(&self, provider_id: &str) -> bool {
        self.read()
            .nodes
            .get(provider_id)
            .map(StateNode::nominated)
            .unwrap_or(false)
    }

    /// Reserve a node for a pod the scheduler just placed on it
    pub fn nominate_node_for_pod(&self, provider_id: &str) {
        let window = self.config.nomination_window();
        if let Some(view) = self.write().nodes.get_mut(provider_id) {
            view.nominate(window);
        }
    }

    pub fn add_nominated_node_eviction_observer(&self, observer: NominationObserver) {
        self.nomination_observers
            .write()
            .expect("nomination observer lock poisoned")
            .push(observer);
    }

    /// Drop lapsed nominations and notify every observer of each one
    ///
    /// Observers run after the main lock is released. Returns the provider
    /// ids whose nomination expired, sorted.
    pub fn expire_nominations(&self) -> Vec<String> {
        let mut expired: Vec<String> = {
            let mut inner = self.write();
            inner
                .nodes
                .values_mut()
                .filter_map(StateNode::take_expired_lease)
                .map(|lease| lease.provider_id)
                .collect()
        };
        if expired.is_empty() {
            return expired;
        }
        expired.sort();

        let observers = self
            .nomination_observers
            .read()
            .expect("nomination observer lock poisoned")
            .clone();
        for provider_id in &expired {
            debug!(provider_id = %provider_id, "nomination expired");
            for observer in &observers {
                observer(provider_id);
            }
        }
        expired
    }

    /// Sweep expired nominations every `interval` until `shutdown` fires
    ///
    /// Meant to be spawned as a background task.
    pub async fn run_nomination_janitor(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        info!("Starting nomination janitor: interval={}s", interval.as_secs());
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    self.expire_nominations();
                }
                _ = shutdown.cancelled() => {
                    info!("Nomination janitor shutting down");
                    break;
                }
            }
        }
    }

    pub fn node_claim_exists(&self, name: &str) -> bool {
        self.read().node_claim_name_to_provider_id.contains_key(name)
    }

    /// Capacity (plus node count) of live views in `pool`
    pub fn node_pool_resources_for(&self, pool: &str) -> ResourceList {
        self.read()
            .node_pool_resources
            .get(pool)
            .cloned()
            .unwrap_or_default()
    }

    /// Pools with a non-zero total, sorted
    pub fn node_pools(&self) -> Vec<String> {
        self.read().node_pool_resources.pools()
    }

    /// `(running, deleting, pending_disruption)` node claims in `pool`
    pub fn node_pool_node_count(&self, pool: &str) -> (usize, usize, usize) {
        self.read().node_pool_state.node_count(pool)
    }

    pub fn mark_node_claim_pending_disruption(&self, pool: &str, name: &str) {
        self.write()
            .node_pool_state
            .mark_pending_disruption(pool, name);
    }

    // ------------------------------------------------------------------
    // Deletion marking
    // ------------------------------------------------------------------

    pub fn mark_for_deletion(&self, provider_ids: &[&str]) {
        self.write()
            .set_marked_for_deletion(provider_ids, true, &self.consolidation);
    }

    pub fn unmark_for_deletion(&self, provider_ids: &[&str]) {
        self.write()
            .set_marked_for_deletion(provider_ids, false, &self.consolidation);
    }

    // ------------------------------------------------------------------
    // Node claims and nodes
    // ------------------------------------------------------------------

    pub fn update_node_claim(&self, claim: &NodeClaim) {
        let mut inner = self.write();
        let provider_id = claim.status.provider_id.clone();

        // only launched claims get a view; the name is tracked regardless so
        // sync knows we are waiting on it
        let marked = if provider_id.is_empty() {
            if let Some(old_id) = inner.node_claim_name_to_provider_id.get(claim.name()) {
                if !old_id.is_empty() {
                    inner.cleanup_node_claim(claim.name(), &self.consolidation);
                }
            }
            claim_deleting(claim)
        } else {
            inner.upsert_node_claim(claim.clone(), &self.consolidation, &self.clock);
            inner
                .nodes
                .get(&provider_id)
                .map(StateNode::marked_for_deletion)
                .unwrap_or_else(|| claim_deleting(claim))
        };
        inner
            .node_claim_name_to_provider_id
            .insert(claim.name().to_string(), provider_id);
        inner
            .node_pool_state
            .update_node_claim(claim.node_pool(), claim.name(), marked);
        self.metrics.set_node_count(inner.nodes.len());
    }

    pub fn delete_node_claim(&self, name: &str) {
        let mut inner = self.write();
        inner.cleanup_node_claim(name, &self.consolidation);
        self.metrics.set_node_count(inner.nodes.len());
    }

    /// Track a node, rebuilding its pod footprint from the store
    ///
    /// Store queries run before the lock is taken.
    pub async fn update_node(&self, ctx: &OpContext, node: &Node) -> Result<(), StateError> {
        let mut node = node.clone();
        let managed = node.node_pool().is_some();
        let initialized = label_is_true(Some(&node), NODE_INITIALIZED_LABEL_KEY);

        if node.spec.provider_id.is_empty() {
            if managed {
                debug!(node = %node.name(), "ignoring managed node without provider id");
                return Ok(());
            }
            node.spec.provider_id = node.name().to_string();
        }
        let has_instance_type = node
            .metadata
            .label(LABEL_INSTANCE_TYPE)
            .map(|v| !v.is_empty())
            .unwrap_or(false);
        if managed && !initialized && !has_instance_type {
            debug!(node = %node.name(), "waiting for instance type label");
            return Ok(());
        }

        let pods = ctx.run(self.client.list_pods_on_node(node.name())).await?;
        let csi_node = ignore_not_found(ctx.run(self.client.get_csi_node(node.name())).await)?;
        if csi_node.is_none() {
            debug!(node = %node.name(), "no CSINode found, volume limits unknown");
        }

        let created = node.metadata.creation_timestamp;
        let deleted = node.metadata.deletion_timestamp;
        {
            let mut inner = self.write();
            inner.upsert_node(node, pods, csi_node, &self.consolidation, &self.clock);
            self.metrics.set_node_count(inner.nodes.len());
        }
        if let Some(t) = created {
            advance(&self.last_node_creation, t);
        }
        if let Some(t) = deleted {
            advance(&self.last_node_deletion, t);
        }
        Ok(())
    }

    /// Newest creation timestamp among nodes seen so far
    pub fn last_node_creation_time(&self) -> Option<DateTime<Utc>> {
        *self
            .last_node_creation
            .read()
            .expect("node timestamp lock poisoned")
    }

    /// Newest deletion timestamp among nodes seen so far
    pub fn last_node_deletion_time(&self) -> Option<DateTime<Utc>> {
        *self
            .last_node_deletion
            .read()
            .expect("node timestamp lock poisoned")
    }

    pub fn delete_node(&self, name: &str) {
        let mut inner = self.write();
        inner.cleanup_node(name, &self.consolidation);
        self.metrics.set_node_count(inner.nodes.len());
    }

    // ------------------------------------------------------------------
    // Pods
    // ------------------------------------------------------------------

    /// Attach or release a pod's footprint depending on its phase
    pub fn update_pod(&self, pod: &Pod) -> Result<(), StateError> {
        let result = {
            let mut inner = self.write();
            if is_terminal(pod) {
                inner.release_pod(&pod.key());
                Ok(())
            } else {
                inner.attach_pod(pod, &self.consolidation)
            }
        };
        self.update_pod_anti_affinity(pod);
        result
    }

    // preferred terms are never enforced, so only required ones are indexed
    fn update_pod_anti_affinity(&self, pod: &Pod) {
        if has_required_anti_affinity(pod) {
            self.anti_affinity_pods.insert(pod.key(), pod.clone());
        } else {
            self.anti_affinity_pods.remove(&pod.key());
        }
    }

    pub fn delete_pod(&self, key: &NamespacedName) {
        self.anti_affinity_pods.remove(key);
        self.write().release_pod(key);
        self.scheduling.clear(key);
        self.consolidation.mark_unconsolidated();
    }

    // ------------------------------------------------------------------
    // Scheduling timestamps
    // ------------------------------------------------------------------

    /// Record the first time each pod was seen pending
    pub fn ack_pods(&self, pods: &[Pod]) {
        let now = self.clock.now();
        for pod in pods {
            self.scheduling.ack(&pod.key(), now);
        }
    }

    pub fn pod_ack_time(&self, key: &NamespacedName) -> Option<DateTime<Utc>> {
        self.scheduling.ack_time(key)
    }

    pub fn pod_scheduling_decision_time(&self, key: &NamespacedName) -> Option<DateTime<Utc>> {
        self.scheduling.attempted_time(key)
    }

    pub fn pod_scheduling_success_time(&self, key: &NamespacedName) -> Option<DateTime<Utc>> {
        self.scheduling.schedulable_time(key)
    }

    pub fn pod_scheduling_success_time_registration_healthy(
        &self,
        key: &NamespacedName,
    ) -> Option<DateTime<Utc>> {
        self.scheduling.healthy_pool_scheduled_time(key)
    }

    pub fn pod_node_claim_mapping(&self, key: &NamespacedName) -> Option<String> {
        self.scheduling.node_claim(key)
    }

    pub fn clear_pod_scheduling_mappings(&self, key: &NamespacedName) {
        self.scheduling.clear(key);
    }

    fn observe_first_attempt(&self, key: &NamespacedName, now: DateTime<Utc>) {
        if !self.scheduling.mark_attempted(key, now) {
            return;
        }
        if let Some(ack) = self.scheduling.ack_time(key) {
            self.metrics
                .observe_scheduling_decision((now - ack).to_std().unwrap_or_default());
        }
    }

    /// Record the outcome of a scheduling simulation
    ///
    /// `pod_errors` holds pods that failed to schedule, `node_pool_pods`
    /// pods that fit, grouped by target pool, and `node_claim_pods` pods
    /// grouped by the claim they were simulated onto.
    pub async fn mark_pod_scheduling_decisions(
        &self,
        ctx: &OpContext,
        pod_errors: &HashMap<NamespacedName, String>,
        node_pool_pods: &HashMap<String, Vec<NamespacedName>>,
        node_claim_pods: &HashMap<String, Vec<NamespacedName>>,
    ) {
        let now = self.clock.now();
        for key in pod_errors.keys() {
            self.scheduling.clear_schedulable(key);
            self.observe_first_attempt(key, now);
            self.scheduling.clear_healthy_pool_scheduled(key);
            self.scheduling.clear_node_claim(key);
        }

        for (pool, pods) in node_pool_pods {
            let healthy = if pool.is_empty() {
                false
            } else {
                match ctx.run(self.client.get_node_pool(pool)).await {
                    Ok(node_pool) => node_pool.is_registration_healthy(),
                    Err(e) => {
                        debug!(node_pool = %pool, error = %e, "unable to read node pool health");
                        false
                    }
                }
            };
            for key in pods {
                self.scheduling.mark_schedulable(key, now);
                self.observe_first_attempt(key, now);
                if healthy {
                    self.scheduling.mark_healthy_pool_scheduled(key, now);
                } else {
                    self.scheduling.clear_healthy_pool_scheduled(key);
                }
            }
        }

        self.update_pod_to_node_claim_mapping(node_claim_pods);
    }

    pub fn update_pod_to_node_claim_mapping(&self, node_claim_pods: &HashMap<String, Vec<NamespacedName>>) {
        for (claim, pods) in node_claim_pods {
            for key in pods {
                self.scheduling.set_node_claim(key, claim);
            }
        }
    }

    // ------------------------------------------------------------------
    // Consolidation
    // ------------------------------------------------------------------

    pub fn mark_unconsolidated(&self) -> DateTime<Utc> {
        self.consolidation.mark_unconsolidated()
    }

    /// Timestamp of the last consolidation-relevant change, never older than the timeout
    pub fn consolidation_state(&self) -> DateTime<Utc> {
        self.consolidation.state()
    }

    // ------------------------------------------------------------------
    // Daemon sets
    // ------------------------------------------------------------------

    /// Cache the newest pod controlled by `daemonset`
    pub async fn update_daemonset(&self, ctx: &OpContext, daemonset: &DaemonSet) -> Result<(), StateError> {
        let pods = ctx
            .run(self.client.list_pods_in_namespace(&daemonset.metadata.namespace))
            .await?;
        let newest = pods
            .into_iter()
            .filter(|p| p.metadata.is_controlled_by(&daemonset.metadata))
            .max_by_key(|p| p.metadata.creation_timestamp);
        if let Some(pod) = newest {
            self.daemonset_pods.insert(daemonset.metadata.key(), pod);
        }
        Ok(())
    }

    pub fn get_daemonset_pod(&self, daemonset: &DaemonSet) -> Option<Pod> {
        self.daemonset_pods
            .get(&daemonset.metadata.key())
            .map(|p| p.value().clone())
    }

    pub fn delete_daemonset(&self, key: &NamespacedName) {
        self.daemonset_pods.remove(key);
    }

    /// Forget everything
    pub fn reset(&self) {
        *self.write() = ClusterInner::default();
        self.sync.reset();
        self.consolidation.reset();
        self.scheduling.reset();
        self.daemonset_pods.clear();
        self.anti_affinity_pods.clear();
        *self
            .last_node_creation
            .write()
            .expect("node timestamp lock poisoned") = None;
        *self
            .last_node_deletion
            .write()
            .expect("node timestamp lock poisoned") = None;
        self.metrics.set_node_count(0);
    }
}
