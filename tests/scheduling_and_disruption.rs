//! Integration tests for scheduling bookkeeping, daemon set caching and the
//! pre-disruption helpers

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Duration;

use nodestate::clock::{Clock, FakeClock};
use nodestate::cluster::{
    disrupted_no_schedule_taint, resource_list, DaemonSet, LabelSelector, NamespacedName, Node, NodeClaim,
    NodePool, PdbLimits, Pod, PodDisruptionBudget, CONDITION_INSTANCE_TERMINATING, DO_NOT_DISRUPT_ANNOTATION_KEY,
    LABEL_HOSTNAME, LABEL_INSTANCE_TYPE, NODE_INITIALIZED_LABEL_KEY, NODE_POOL_LABEL_KEY, NODE_REGISTERED_LABEL_KEY,
};
use nodestate::config::StateConfig;
use nodestate::state::{
    clear_node_claims_condition, ignore_pod_block_eviction, require_no_schedule_taint, Cluster, DisruptionBlocked,
};
use nodestate::store::{KubeClient, MemoryStore, NodeClassKind, OpContext, StaticCloudProvider};

const GROUP: &str = "provisioning.dev";
const KIND: &str = "FakeNodeClass";

fn setup() -> (Cluster, MemoryStore, FakeClock) {
    let store = MemoryStore::new();
    let clock = FakeClock::default();
    let cluster = Cluster::new(
        Arc::new(store.clone()),
        Arc::new(StaticCloudProvider::new("fake", vec![NodeClassKind::new(GROUP, KIND)])),
        Arc::new(clock.clone()),
        StateConfig::default(),
    );
    (cluster, store, clock)
}

fn key(name: &str) -> NamespacedName {
    NamespacedName::new("default", name)
}

fn managed_claim(name: &str, provider_id: &str) -> NodeClaim {
    NodeClaim::new(name)
        .with_provider_id(provider_id)
        .with_node_pool("default")
        .with_node_class(GROUP, KIND, "default")
        .with_resources(resource_list([("cpu", "4")]))
}

fn ready_node(name: &str, provider_id: &str) -> Node {
    Node::new(name)
        .with_provider_id(provider_id)
        .with_label(NODE_POOL_LABEL_KEY, "default")
        .with_label(LABEL_INSTANCE_TYPE, "fake.large")
        .with_label(NODE_REGISTERED_LABEL_KEY, "true")
        .with_label(NODE_INITIALIZED_LABEL_KEY, "true")
        .with_resources(resource_list([("cpu", "4")]))
}

// ----------------------------------------------------------------------------
// Scheduling decisions
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_scheduling_decision_recorded_once() {
    let (cluster, store, clock) = setup();
    store.apply_node_pool(NodePool::new("default").with_registration_healthy(true));
    let ctx = OpContext::background();
    let acked = clock.now();
    cluster.ack_pods(&[Pod::new("default", "web")]);

    clock.step(Duration::seconds(3));
    let decided = clock.now();
    let pool_pods = HashMap::from([("default".to_string(), vec![key("web")])]);
    let claim_pods = HashMap::from([("claim-1".to_string(), vec![key("web")])]);
    cluster
        .mark_pod_scheduling_decisions(&ctx, &HashMap::new(), &pool_pods, &claim_pods)
        .await;

    assert_eq!(cluster.pod_ack_time(&key("web")), Some(acked));
    assert_eq!(cluster.pod_scheduling_decision_time(&key("web")), Some(decided));
    assert_eq!(cluster.pod_scheduling_success_time(&key("web")), Some(decided));
    assert_eq!(
        cluster.pod_scheduling_success_time_registration_healthy(&key("web")),
        Some(decided)
    );
    assert_eq!(cluster.pod_node_claim_mapping(&key("web")), Some("claim-1".to_string()));
    assert_eq!(cluster.metrics().scheduling_decision_samples(), 1);

    // later simulations keep the first timestamps and emit nothing new
    clock.step(Duration::seconds(5));
    cluster
        .mark_pod_scheduling_decisions(&ctx, &HashMap::new(), &pool_pods, &HashMap::new())
        .await;
    assert_eq!(cluster.pod_scheduling_decision_time(&key("web")), Some(decided));
    assert_eq!(cluster.pod_scheduling_success_time(&key("web")), Some(decided));
    assert_eq!(cluster.metrics().scheduling_decision_samples(), 1);
}

#[tokio::test]
async fn test_failed_scheduling_clears_success() {
    let (cluster, store, clock) = setup();
    store.apply_node_pool(NodePool::new("default").with_registration_healthy(true));
    let ctx = OpContext::background();
    cluster.ack_pods(&[Pod::new("default", "web")]);

    let pool_pods = HashMap::from([("default".to_string(), vec![key("web")])]);
    let claim_pods = HashMap::from([("claim-1".to_string(), vec![key("web")])]);
    cluster
        .mark_pod_scheduling_decisions(&ctx, &HashMap::new(), &pool_pods, &claim_pods)
        .await;

    clock.step(Duration::seconds(1));
    let errors = HashMap::from([(key("web"), "no instance type fits".to_string())]);
    cluster
        .mark_pod_scheduling_decisions(&ctx, &errors, &HashMap::new(), &HashMap::new())
        .await;

    assert!(cluster.pod_scheduling_decision_time(&key("web")).is_some());
    assert!(cluster.pod_scheduling_success_time(&key("web")).is_none());
    assert!(cluster
        .pod_scheduling_success_time_registration_healthy(&key("web"))
        .is_none());
    assert!(cluster.pod_node_claim_mapping(&key("web")).is_none());
}

#[tokio::test]
async fn test_unhealthy_or_missing_pool_not_marked_healthy() {
    let (cluster, store, _) = setup();
    store.apply_node_pool(NodePool::new("sick").with_registration_healthy(false));
    let ctx = OpContext::background();

    let pool_pods = HashMap::from([
        ("sick".to_string(), vec![key("a")]),
        ("missing".to_string(), vec![key("b")]),
    ]);
    cluster
        .mark_pod_scheduling_decisions(&ctx, &HashMap::new(), &pool_pods, &HashMap::new())
        .await;

    for pod in ["a", "b"] {
        assert!(cluster.pod_scheduling_success_time(&key(pod)).is_some());
        assert!(cluster
            .pod_scheduling_success_time_registration_healthy(&key(pod))
            .is_none());
    }
    // never acked, so there is no latency to report
    assert_eq!(cluster.metrics().scheduling_decision_samples(), 0);
}

#[test]
fn test_clear_scheduling_mappings() {
    let (cluster, _, _) = setup();
    cluster.ack_pods(&[Pod::new("default", "web")]);
    cluster.update_pod_to_node_claim_mapping(&HashMap::from([(
        "claim-1".to_string(),
        vec![key("web")],
    )]));

    cluster.clear_pod_scheduling_mappings(&key("web"));
    assert!(cluster.pod_ack_time(&key("web")).is_none());
    assert!(cluster.pod_node_claim_mapping(&key("web")).is_none());
}

// ----------------------------------------------------------------------------
// Daemon sets and anti-affinity
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_daemonset_keeps_newest_pod() {
    let (cluster, store, _) = setup();
    let ctx = OpContext::background();
    let ds = store.apply_daemonset(DaemonSet::new("kube-system", "agent"));
    let uid = ds.metadata.uid.clone();

    let mut old = Pod::new("kube-system", "agent-old").owned_by("DaemonSet", "agent", &uid);
    old.metadata.creation_timestamp = Some(chrono::Utc::now() - Duration::minutes(10));
    let mut new = Pod::new("kube-system", "agent-new").owned_by("DaemonSet", "agent", &uid);
    new.metadata.creation_timestamp = Some(chrono::Utc::now());
    let mut stranger = Pod::new("kube-system", "other").owned_by("DaemonSet", "agent", "someone-else");
    stranger.metadata.creation_timestamp = Some(chrono::Utc::now() + Duration::minutes(1));
    for pod in [old, new, stranger] {
        store.apply_pod(pod);
    }

    cluster.update_daemonset(&ctx, &ds).await.unwrap();
    assert_eq!(
        cluster.get_daemonset_pod(&ds).map(|p| p.metadata.name),
        Some("agent-new".to_string())
    );

    cluster.delete_daemonset(&ds.metadata.key());
    assert!(cluster.get_daemonset_pod(&ds).is_none());
}

#[tokio::test]
async fn test_anti_affinity_iteration_stops_early() {
    let (cluster, _, _) = setup();
    let ctx = OpContext::background();
    cluster.update_node(&ctx, &ready_node("n1", "i1")).await.unwrap();

    let selector = LabelSelector::matching("app", "web");
    for name in ["a", "b", "c"] {
        let pod = Pod::new("default", name)
            .with_required_anti_affinity(selector.clone(), LABEL_HOSTNAME)
            .bound_to("n1");
        cluster.update_pod(&pod).unwrap();
    }
    // preferred terms are not indexed
    let soft = Pod::new("default", "soft")
        .with_preferred_anti_affinity(selector.clone(), LABEL_HOSTNAME)
        .bound_to("n1");
    cluster.update_pod(&soft).unwrap();

    let mut all = vec![];
    cluster.for_pods_with_anti_affinity(|pod, node| {
        assert_eq!(node.name(), "n1");
        all.push(pod.metadata.name.clone());
        true
    });
    all.sort();
    assert_eq!(all, vec!["a", "b", "c"]);

    let mut visited = 0;
    cluster.for_pods_with_anti_affinity(|_, _| {
        visited += 1;
        false
    });
    assert_eq!(visited, 1);

    cluster.delete_pod(&key("a"));
    let mut remaining = 0;
    cluster.for_pods_with_anti_affinity(|_, _| {
        remaining += 1;
        true
    });
    assert_eq!(remaining, 2);
}

// ----------------------------------------------------------------------------
// Disruption
// ----------------------------------------------------------------------------

#[tokio::test]
async fn test_node_disruption_preconditions() {
    let (cluster, _, _) = setup();
    let ctx = OpContext::background();
    cluster.update_node_claim(&managed_claim("c1", "i1"));
    let view = cluster.nodes().by_provider_id("i1").cloned().unwrap();
    assert_eq!(view.validate_node_disruptable(), Err(DisruptionBlocked::NoNode));

    cluster.update_node(&ctx, &ready_node("n1", "i1")).await.unwrap();
    assert_eq!(cluster.nodes()[0].validate_node_disruptable(), Ok(()));

    cluster.nominate_node_for_pod("i1");
    assert_eq!(
        cluster.nodes()[0].validate_node_disruptable(),
        Err(DisruptionBlocked::Nominated)
    );

    cluster.mark_for_deletion(&["i1"]);
    assert_eq!(
        cluster.nodes()[0].validate_node_disruptable(),
        Err(DisruptionBlocked::MarkedForDeletion)
    );

    cluster
        .update_node(&ctx, &Node::new("plain").with_provider_id("i9"))
        .await
        .unwrap();
    let plain = cluster.nodes().by_provider_id("i9").cloned().unwrap();
    assert_eq!(plain.validate_node_disruptable(), Err(DisruptionBlocked::Unmanaged));
}

#[tokio::test]
async fn test_pod_eviction_blocked() {
    let (cluster, store, _) = setup();
    let ctx = OpContext::background();
    cluster.update_node_claim(&managed_claim("c1", "i1"));
    cluster.update_node(&ctx, &ready_node("n1", "i1")).await.unwrap();
    let view = cluster.nodes()[0].clone();

    store.apply_pod(Pod::new("default", "web").with_label("app", "web").bound_to("n1"));
    let pods = view
        .validate_pods_disruptable(&ctx, &store, &PdbLimits::default())
        .await
        .unwrap();
    assert_eq!(pods.len(), 1);

    let budget = PodDisruptionBudget::new("default", "web-pdb", LabelSelector::matching("app", "web"), 0);
    let err = view
        .validate_pods_disruptable(&ctx, &store, &PdbLimits::new(vec![budget]))
        .await
        .unwrap_err();
    assert!(err.is_pod_block_eviction());

    store.apply_pod(
        Pod::new("default", "pinned")
            .with_annotation(DO_NOT_DISRUPT_ANNOTATION_KEY, "true")
            .bound_to("n1"),
    );
    let result = view
        .validate_pods_disruptable(&ctx, &store, &PdbLimits::default())
        .await;
    assert!(result.as_ref().unwrap_err().is_pod_block_eviction());
    assert_eq!(ignore_pod_block_eviction(result).unwrap(), Vec::<Pod>::new());
}

#[tokio::test]
async fn test_taint_round_trip_through_cache() {
    let (cluster, store, _) = setup();
    let ctx = OpContext::background();
    let claim = store.apply_node_claim(managed_claim("c1", "i1"));
    let node = store.apply_node(ready_node("n1", "i1"));
    cluster.update_node_claim(&claim);
    cluster.update_node(&ctx, &node).await.unwrap();

    require_no_schedule_taint(&ctx, cluster.client(), true, &cluster.nodes())
        .await
        .unwrap();
    let tainted = store.get_node("n1").await.unwrap();
    assert!(tainted
        .spec
        .taints
        .iter()
        .any(|t| t.matches(&disrupted_no_schedule_taint())));

    // the cache sees the taint once the node event arrives
    cluster.update_node(&ctx, &tainted).await.unwrap();
    assert!(cluster.nodes()[0]
        .taints()
        .iter()
        .any(|t| t.matches(&disrupted_no_schedule_taint())));

    require_no_schedule_taint(&ctx, cluster.client(), false, &cluster.nodes())
        .await
        .unwrap();
    assert!(store.get_node("n1").await.unwrap().spec.taints.is_empty());
}

#[tokio::test]
async fn test_taint_conflict_surfaces_when_store_moves_underneath() {
    let store = MemoryStore::new();
    let node = store.apply_node(ready_node("n1", "i1"));
    let claim = managed_claim("c1", "i1");

    // a second writer bumps the version between our read and our patch
    let racing = RacingStore {
        inner: store.clone(),
    };
    let views = {
        let (cluster, _, _) = setup();
        cluster.update_node_claim(&claim);
        cluster.update_node(&OpContext::background(), &node).await.unwrap();
        cluster.nodes()
    };

    let err = require_no_schedule_taint(&OpContext::background(), &racing, true, &views)
        .await
        .unwrap_err();
    assert!(err.is_conflict());
}

#[tokio::test]
async fn test_clear_condition_on_initialized_claims() {
    let (cluster, store, _) = setup();
    let ctx = OpContext::background();
    let mut terminating = managed_claim("c1", "i1");
    terminating
        .status
        .conditions
        .set(CONDITION_INSTANCE_TERMINATING, true, "Terminating");
    let mut booting = managed_claim("c2", "i2");
    booting
        .status
        .conditions
        .set(CONDITION_INSTANCE_TERMINATING, true, "Terminating");
    store.apply_node_claim(terminating.clone());
    store.apply_node_claim(booting.clone());

    cluster.update_node_claim(&terminating);
    cluster.update_node_claim(&booting);
    cluster.update_node(&ctx, &ready_node("n1", "i1")).await.unwrap();

    clear_node_claims_condition(&ctx, cluster.client(), CONDITION_INSTANCE_TERMINATING, &cluster.nodes())
        .await
        .unwrap();

    let c1 = store.get_node_claim("c1").await.unwrap();
    let c2 = store.get_node_claim("c2").await.unwrap();
    assert!(!c1.status.conditions.is_true(CONDITION_INSTANCE_TERMINATING));
    // c2 never got a node, so it is left alone
    assert!(c2.status.conditions.is_true(CONDITION_INSTANCE_TERMINATING));
}

/// Store wrapper that bumps a node's version right after every read
struct RacingStore {
    inner: MemoryStore,
}

#[async_trait::async_trait]
impl KubeClient for RacingStore {
    async fn list_nodes(&self) -> Result<Vec<Node>, nodestate::store::StoreError> {
        self.inner.list_nodes().await
    }

    async fn get_node(&self, name: &str) -> Result<Node, nodestate::store::StoreError> {
        let node = self.inner.get_node(name).await?;
        self.inner.apply_node(node.clone());
        Ok(node)
    }

    async fn patch_node(&self, node: &Node) -> Result<Node, nodestate::store::StoreError> {
        self.inner.patch_node(node).await
    }

    async fn list_node_claims(&self) -> Result<Vec<NodeClaim>, nodestate::store::StoreError> {
        self.inner.list_node_claims().await
    }

    async fn get_node_claim(&self, name: &str) -> Result<NodeClaim, nodestate::store::StoreError> {
        self.inner.get_node_claim(name).await
    }

    async fn patch_node_claim_status(&self, claim: &NodeClaim) -> Result<NodeClaim, nodestate::store::StoreError> {
        self.inner.patch_node_claim_status(claim).await
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, nodestate::store::StoreError> {
        self.inner.list_pods().await
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, nodestate::store::StoreError> {
        self.inner.list_pods_on_node(node_name).await
    }

    async fn list_pods_in_namespace(&self, namespace: &str) -> Result<Vec<Pod>, nodestate::store::StoreError> {
        self.inner.list_pods_in_namespace(namespace).await
    }

    async fn list_daemonsets(&self) -> Result<Vec<DaemonSet>, nodestate::store::StoreError> {
        self.inner.list_daemonsets().await
    }

    async fn get_csi_node(&self, name: &str) -> Result<nodestate::cluster::CsiNode, nodestate::store::StoreError> {
        self.inner.get_csi_node(name).await
    }

    async fn get_node_pool(&self, name: &str) -> Result<NodePool, nodestate::store::StoreError> {
        self.inner.get_node_pool(name).await
    }
}
