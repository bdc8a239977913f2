//! Command line surface: replay a recorded scenario through the cache
//!
//! A scenario seeds an in-memory store with objects and then feeds the
//! cache a sequence of events, the way watch notifications would arrive
//! from a live cluster. The final state is reported as text or JSON.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context as _};
use chrono::{DateTime, Duration, Utc};
use clap::{ArgAction, Parser};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::clock::FakeClock;
use crate::cluster::{CsiNode, DaemonSet, NamespacedName, Node, NodeClaim, NodePool, Pod, ResourceList};
use crate::state::Cluster;
use crate::store::{KubeClient, MemoryStore, OpContext};

#[derive(Parser, Debug)]
#[command(name = "nodestate")]
#[command(about = "Replay cluster events through the node state cache")]
#[command(version)]
pub struct Args {
    /// Path to the scenario file (YAML)
    #[arg(required = true)]
    pub scenario_file: PathBuf,

    /// Cache configuration; defaults to ~/.nodestate/config.yaml when present
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging output (-v, -vv, -vvv)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Print the final state as JSON
    #[arg(long)]
    pub json: bool,
}

/// Objects present in the store before replay starts
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Objects {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub node_claims: Vec<NodeClaim>,
    #[serde(default)]
    pub pods: Vec<Pod>,
    #[serde(default)]
    pub csi_nodes: Vec<CsiNode>,
    #[serde(default)]
    pub node_pools: Vec<NodePool>,
    #[serde(default)]
    pub daemon_sets: Vec<DaemonSet>,
}

/// One notification fed to the cache
///
/// Update events name an object already in the store; delete events remove
/// it from the store first.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Event {
    NodeClaim(String),
    Node(String),
    Pod(NamespacedName),
    DaemonSet(NamespacedName),
    DeleteNodeClaim(String),
    DeleteNode(String),
    DeletePod(NamespacedName),
    DeleteDaemonSet(NamespacedName),
    MarkForDeletion(Vec<String>),
    UnmarkForDeletion(Vec<String>),
    Nominate(String),
    /// Move the replay clock forward by this many seconds
    Advance(i64),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub objects: Objects,
    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub events: Vec<Event>,
}

impl Scenario {
    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        serde_yaml::from_str(content).context("parsing scenario")
    }

    /// Load the objects into `store`
    pub fn seed(&self, store: &MemoryStore) {
        let objects = &self.objects;
        for node in &objects.nodes {
            store.apply_node(node.clone());
        }
        for claim in &objects.node_claims {
            store.apply_node_claim(claim.clone());
        }
        for pod in &objects.pods {
            store.apply_pod(pod.clone());
        }
        for csi_node in &objects.csi_nodes {
            store.apply_csi_node(csi_node.clone());
        }
        for node_pool in &objects.node_pools {
            store.apply_node_pool(node_pool.clone());
        }
        for daemonset in &objects.daemon_sets {
            store.apply_daemonset(daemonset.clone());
        }
    }
}

pub fn load_scenario_file(path: &Path) -> anyhow::Result<Scenario> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    Scenario::from_yaml(&content)
}

async fn find_pod(store: &MemoryStore, key: &NamespacedName) -> anyhow::Result<Pod> {
    store
        .list_pods_in_namespace(&key.namespace)
        .await?
        .into_iter()
        .find(|p| p.metadata.name == key.name)
        .ok_or_else(|| anyhow!("pod '{}' not in scenario", key))
}

async fn find_daemonset(store: &MemoryStore, key: &NamespacedName) -> anyhow::Result<DaemonSet> {
    store
        .list_daemonsets()
        .await?
        .into_iter()
        .find(|d| d.metadata.key() == *key)
        .ok_or_else(|| anyhow!("daemon set '{}' not in scenario", key))
}

/// Feed one event to the cache
pub async fn apply_event(
    cluster: &Cluster,
    store: &MemoryStore,
    clock: &FakeClock,
    ctx: &OpContext,
    event: &Event,
) -> anyhow::Result<()> {
    debug!(?event, "replaying event");
    match event {
        Event::NodeClaim(name) => {
            let claim = store.get_node_claim(name).await?;
            cluster.update_node_claim(&claim);
        }
        Event::Node(name) => {
            let node = store.get_node(name).await?;
            cluster.update_node(ctx, &node).await?;
        }
        Event::Pod(key) => {
            let pod = find_pod(store, key).await?;
            if let Err(e) = cluster.update_pod(&pod) {
                // a live controller would requeue; replay just moves on
                warn!("Pod {} not applied: {}", key, e);
            }
        }
        Event::DaemonSet(key) => {
            let daemonset = find_daemonset(store, key).await?;
            cluster.update_daemonset(ctx, &daemonset).await?;
        }
        Event::DeleteNodeClaim(name) => {
            store.delete_node_claim(name);
            cluster.delete_node_claim(name);
        }
        Event::DeleteNode(name) => {
            store.delete_node(name);
            cluster.delete_node(name);
        }
        Event::DeletePod(key) => {
            store.delete_pod(&key.namespace, &key.name);
            cluster.delete_pod(key);
        }
        Event::DeleteDaemonSet(key) => {
            store.delete_daemonset(&key.namespace, &key.name);
            cluster.delete_daemonset(key);
        }
        Event::MarkForDeletion(ids) => {
            let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
            cluster.mark_for_deletion(&ids);
        }
        Event::UnmarkForDeletion(ids) => {
            let ids: Vec<&str> = ids.iter().map(String::as_str).collect();
            cluster.unmark_for_deletion(&ids);
        }
        Event::Nominate(id) => cluster.nominate_node_for_pod(id),
        Event::Advance(secs) => {
            clock.step(Duration::seconds(*secs));
            for provider_id in cluster.expire_nominations() {
                info!("Nomination of {} expired", provider_id);
            }
        }
    }
    Ok(())
}

/// Replay every event in order
pub async fn replay(
    cluster: &Cluster,
    store: &MemoryStore,
    clock: &FakeClock,
    scenario: &Scenario,
) -> anyhow::Result<()> {
    let ctx = cluster.op_context();
    for (i, event) in scenario.events.iter().enumerate() {
        apply_event(cluster, store, clock, &ctx, event)
            .await
            .with_context(|| format!("event #{}", i + 1))?;
    }
    Ok(())
}

// ============================================================================
// Report: pure display logic (no I/O - returns formatted strings)
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeReport {
    pub name: String,
    pub provider_id: String,
    pub node_pool: Option<String>,
    pub has_claim: bool,
    pub has_node: bool,
    pub initialized: bool,
    pub marked_for_deletion: bool,
    pub nominated: bool,
    pub pods: usize,
    pub capacity: ResourceList,
    pub available: ResourceList,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolReport {
    pub resources: ResourceList,
    pub running: usize,
    pub deleting: usize,
    pub pending_disruption: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Report {
    pub synced: bool,
    pub consolidation_state: DateTime<Utc>,
    pub last_node_creation: Option<DateTime<Utc>>,
    pub last_node_deletion: Option<DateTime<Utc>>,
    pub nodes: Vec<NodeReport>,
    pub node_pools: BTreeMap<String, PoolReport>,
}

impl Report {
    /// Snapshot the cache
    pub async fn collect(cluster: &Cluster) -> Self {
        let synced = cluster.synced(&cluster.op_context()).await;
        let nodes = cluster
            .nodes()
            .iter()
            .map(|n| NodeReport {
                name: n.name().to_string(),
                provider_id: n.provider_id().to_string(),
                node_pool: n.node_pool().map(str::to_string),
                has_claim: n.node_claim().is_some(),
                has_node: n.node().is_some(),
                initialized: n.initialized(),
                marked_for_deletion: n.marked_for_deletion(),
                nominated: n.nominated(),
                pods: n.tracked_pods().len(),
                capacity: n.capacity(),
                available: n.available(),
            })
            .collect();
        let node_pools = cluster
            .node_pools()
            .into_iter()
            .map(|pool| {
                let (running, deleting, pending_disruption) = cluster.node_pool_node_count(&pool);
                let report = PoolReport {
                    resources: cluster.node_pool_resources_for(&pool),
                    running,
                    deleting,
                    pending_disruption,
                };
                (pool, report)
            })
            .collect();
        Self {
            synced,
            consolidation_state: cluster.consolidation_state(),
            last_node_creation: cluster.last_node_creation_time(),
            last_node_deletion: cluster.last_node_deletion_time(),
            nodes,
            node_pools,
        }
    }
}

fn format_resources(resources: &ResourceList) -> String {
    resources
        .iter()
        .map(|(name, quantity)| format!("{}={}", name, quantity))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Format the report as a human-readable summary
pub fn format_report(report: &Report) -> String {
    let mut output = String::new();

    output.push_str(&format!(
        "Synced: {}\n",
        if report.synced { "yes" } else { "no" }
    ));
    output.push_str(&format!(
        "Consolidation state: {}\n",
        report.consolidation_state.to_rfc3339()
    ));
    if let Some(t) = report.last_node_creation {
        output.push_str(&format!("Last node creation: {}\n", t.to_rfc3339()));
    }
    if let Some(t) = report.last_node_deletion {
        output.push_str(&format!("Last node deletion: {}\n", t.to_rfc3339()));
    }
    output.push('\n');

    output.push_str(&format!("Nodes ({}):\n", report.nodes.len()));
    for node in &report.nodes {
        let halves = match (node.has_claim, node.has_node) {
            (true, true) => "claim+node",
            (true, false) => "claim",
            _ => "node",
        };
        output.push_str(&format!(
            "  - {} [{}] pool={} {}\n",
            node.name,
            node.provider_id,
            node.node_pool.as_deref().unwrap_or("-"),
            halves
        ));
        let mut flags = vec![];
        if node.initialized {
            flags.push("initialized");
        }
        if node.marked_for_deletion {
            flags.push("deleting");
        }
        if node.nominated {
            flags.push("nominated");
        }
        if !flags.is_empty() {
            output.push_str(&format!("      {}\n", flags.join(" ")));
        }
        output.push_str(&format!("      capacity:  {}\n", format_resources(&node.capacity)));
        output.push_str(&format!("      available: {}\n", format_resources(&node.available)));
        output.push_str(&format!("      pods: {}\n", node.pods));
    }

    if !report.node_pools.is_empty() {
        output.push_str("\nNode pools:\n");
        for (name, pool) in &report.node_pools {
            output.push_str(&format!(
                "  - {} running={} deleting={} pending-disruption={}\n",
                name, pool.running, pool.deleting, pool.pending_disruption
            ));
            output.push_str(&format!("      {}\n", format_resources(&pool.resources)));
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCENARIO: &str = r#"
objects:
  nodeClaims:
    - metadata:
        name: c1
        labels:
          provisioning.dev/nodepool: default
      status:
        providerId: fake://i-1
        capacity:
          cpu: "4"
  pods:
    - metadata:
        name: web
        namespace: default
      spec:
        nodeName: n1
events:
  - node-claim: c1
  - advance: 5
  - mark-for-deletion: ["fake://i-1"]
  - delete-pod:
      namespace: default
      name: web
"#;

    #[test]
    fn test_parse_scenario() {
        let scenario = Scenario::from_yaml(SCENARIO).unwrap();
        assert_eq!(scenario.objects.node_claims.len(), 1);
        assert_eq!(scenario.objects.pods[0].spec.node_name, "n1");
        assert_eq!(scenario.events[0], Event::NodeClaim("c1".to_string()));
        assert_eq!(scenario.events[1], Event::Advance(5));
        assert_eq!(
            scenario.events[2],
            Event::MarkForDeletion(vec!["fake://i-1".to_string()])
        );
        assert_eq!(
            scenario.events[3],
            Event::DeletePod(NamespacedName::new("default", "web"))
        );
    }

    #[test]
    fn test_unknown_event_rejected() {
        let bad = "events:\n  - explode: now\n";
        assert!(Scenario::from_yaml(bad).is_err());
    }

    #[test]
    fn test_args_parse() {
        let args = Args::parse_from(["nodestate", "scenario.yaml", "-vv", "--json"]);
        assert_eq!(args.scenario_file, PathBuf::from("scenario.yaml"));
        assert_eq!(args.verbose, 2);
        assert!(args.json);
        assert!(args.config.is_none());
    }

    #[test]
    fn test_format_report() {
        let mut resources = ResourceList::new();
        resources.insert("cpu".to_string(), crate::cluster::Quantity::from_units(4));
        let report = Report {
            synced: true,
            consolidation_state: Utc::now(),
            last_node_creation: Some(Utc::now()),
            last_node_deletion: None,
            nodes: vec![NodeReport {
                name: "n1".to_string(),
                provider_id: "fake://i-1".to_string(),
                node_pool: Some("default".to_string()),
                has_claim: true,
                has_node: true,
                initialized: true,
                marked_for_deletion: false,
                nominated: true,
                pods: 2,
                capacity: resources.clone(),
                available: resources.clone(),
            }],
            node_pools: BTreeMap::from([(
                "default".to_string(),
                PoolReport {
                    resources,
                    running: 1,
                    deleting: 0,
                    pending_disruption: 0,
                },
            )]),
        };

        let output = format_report(&report);
        assert!(output.contains("Synced: yes"));
        assert!(output.contains("Last node creation: "));
        assert!(!output.contains("Last node deletion"));
        assert!(output.contains("n1 [fake://i-1] pool=default claim+node"));
        assert!(output.contains("initialized nominated"));
        assert!(output.contains("cpu=4"));
        assert!(output.contains("default running=1 deleting=0 pending-disruption=0"));
    }
}
