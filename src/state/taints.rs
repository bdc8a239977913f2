//! Bulk write-back helpers used ahead of disruption

use futures::future::join_all;
use tracing::debug;

use crate::cluster::disrupted_no_schedule_taint;
use crate::store::{ignore_not_found, KubeClient, OpContext};

use super::errors::StateError;
use super::statenode::StateNode;

/// Add or remove the disrupted `NoSchedule` taint on every node in `nodes`
///
/// Views missing either half are skipped, as are nodes already being
/// deleted. Each node is re-read before the
/// patch so the write is an optimistic-lock update against its current
/// version; failures are collected rather than short-circuiting.
pub async fn require_no_schedule_taint(
    ctx: &OpContext,
    client: &dyn KubeClient,
    add: bool,
    nodes: &[StateNode],
) -> Result<(), StateError> {
    let patches = nodes
        .iter()
        .filter(|n| n.node().is_some() && n.node_claim().is_some())
        .filter_map(|n| n.node().map(|node| node.name().to_string()))
        .map(|name| taint_one(ctx, client, add, name));
    let errors = join_all(patches).await.into_iter().flatten().collect();
    StateError::combine(errors)
}

async fn taint_one(ctx: &OpContext, client: &dyn KubeClient, add: bool, name: String) -> Option<StateError> {
    let mut node = match ignore_not_found(ctx.run(client.get_node(&name)).await) {
        Ok(Some(node)) => node,
        Ok(None) => return None,
        Err(e) => return Some(e.into()),
    };

    // a node on its way out belongs to the teardown path
    if node.metadata.is_deleting() {
        debug!(node = %name, "skipping deleting node");
        return None;
    }

    let taint = disrupted_no_schedule_taint();

    let before = node.spec.taints.clone();
    node.spec.taints.retain(|t| !t.matches(&taint));
    if add {
        node.spec.taints.push(taint);
    }
    if node.spec.taints == before {
        return None;
    }

    debug!(node = %name, add, "patching disrupted taint");
    match ctx.run(client.patch_node(&node)).await {
        Ok(_) => None,
        Err(source) => Some(StateError::Patch {
            kind: "Node",
            name,
            source,
        }),
    }
}

/// Clear `condition` from the claim of every initialized view in `nodes`
///
/// Claims deleted in the meantime are ignored.
pub async fn clear_node_claims_condition(
    ctx: &OpContext,
    client: &dyn KubeClient,
    condition: &str,
    nodes: &[StateNode],
) -> Result<(), StateError> {
    let mut errors = Vec::new();
    for view in nodes {
        if !view.initialized() {
            continue;
        }
        let Some(claim) = view.node_claim() else {
            continue;
        };

        let mut claim = match ignore_not_found(ctx.run(client.get_node_claim(claim.name())).await) {
            Ok(Some(claim)) => claim,
            Ok(None) => continue,
            Err(e) => {
                errors.push(e.into());
                continue;
            }
        };
        if !claim.status.conditions.clear(condition) {
            continue;
        }
        if let Err(source) = ignore_not_found(ctx.run(client.patch_node_claim_status(&claim)).await) {
            errors.push(StateError::Patch {
                kind: "NodeClaim",
                name: claim.name().to_string(),
                source,
            });
        }
    }
    StateError::combine(errors)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::clock::FakeClock;
    use crate::cluster::{
        Node, NodeClaim, Taint, TaintEffect, CONDITION_INSTANCE_TERMINATING, DISRUPTED_TAINT_KEY,
        NODE_INITIALIZED_LABEL_KEY, NODE_POOL_LABEL_KEY, NODE_REGISTERED_LABEL_KEY,
    };
    use crate::state::Halves;
    use crate::store::MemoryStore;

    fn view(claim: NodeClaim, node: Node) -> StateNode {
        StateNode::new(Halves::Both { claim, node }, Arc::new(FakeClock::default()))
    }

    fn node(name: &str) -> Node {
        Node::new(name)
            .with_provider_id(format!("fake://{}", name))
            .with_label(NODE_POOL_LABEL_KEY, "default")
            .with_label(NODE_REGISTERED_LABEL_KEY, "true")
            .with_label(NODE_INITIALIZED_LABEL_KEY, "true")
    }

    #[tokio::test]
    async fn test_add_and_remove_taint() {
        let store = MemoryStore::new();
        let stored = store.apply_node(node("n1"));
        let views = vec![view(NodeClaim::new("c1"), stored)];
        let ctx = OpContext::background();

        require_no_schedule_taint(&ctx, &store, true, &views).await.unwrap();
        let tainted = store.get_node("n1").await.unwrap();
        assert_eq!(tainted.spec.taints, vec![disrupted_no_schedule_taint()]);

        // idempotent
        require_no_schedule_taint(&ctx, &store, true, &views).await.unwrap();
        assert_eq!(
            store.get_node("n1").await.unwrap().metadata.resource_version,
            tainted.metadata.resource_version
        );

        require_no_schedule_taint(&ctx, &store, false, &views).await.unwrap();
        assert!(store.get_node("n1").await.unwrap().spec.taints.is_empty());
    }

    #[tokio::test]
    async fn test_taint_matches_on_key_and_effect() {
        let store = MemoryStore::new();
        let existing = Taint::new(DISRUPTED_TAINT_KEY, "old", TaintEffect::NoSchedule);
        let stored = store.apply_node(node("n1").with_taint(existing));
        let views = vec![view(NodeClaim::new("c1"), stored)];

        require_no_schedule_taint(&OpContext::background(), &store, true, &views)
            .await
            .unwrap();
        let taints = store.get_node("n1").await.unwrap().spec.taints;
        assert_eq!(taints, vec![disrupted_no_schedule_taint()]);
    }

    #[tokio::test]
    async fn test_skips_views_without_both_halves_and_missing_nodes() {
        let store = MemoryStore::new();
        let claim_only = StateNode::new(
            Halves::Claim(NodeClaim::new("c1").with_provider_id("fake://x")),
            Arc::new(FakeClock::default()),
        );
        // never stored, so the read comes back not found
        let ghost = view(NodeClaim::new("c2"), node("ghost"));

        require_no_schedule_taint(&OpContext::background(), &store, true, &[claim_only, ghost])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_deleting_node_left_alone() {
        let store = MemoryStore::new();
        let mut deleting = node("n1");
        deleting.metadata.deletion_timestamp = Some(chrono::Utc::now());
        let stored = store.apply_node(deleting);
        let views = vec![view(NodeClaim::new("c1"), stored.clone())];
        let ctx = OpContext::background();

        require_no_schedule_taint(&ctx, &store, true, &views).await.unwrap();
        let after = store.get_node("n1").await.unwrap();
        assert!(after.spec.taints.is_empty());
        assert_eq!(after.metadata.resource_version, stored.metadata.resource_version);

        let mut tainted = after.clone();
        tainted.spec.taints.push(disrupted_no_schedule_taint());
        let tainted = store.apply_node(tainted);
        require_no_schedule_taint(&ctx, &store, false, &views).await.unwrap();
        assert_eq!(
            store.get_node("n1").await.unwrap().spec.taints,
            tainted.spec.taints
        );
    }

    #[tokio::test]
    async fn test_clear_condition() {
        let store = MemoryStore::new();
        let mut claim = NodeClaim::new("c1");
        claim
            .status
            .conditions
            .set(CONDITION_INSTANCE_TERMINATING, true, "Terminating");
        let claim = store.apply_node_claim(claim);
        let views = vec![view(claim, node("n1"))];

        clear_node_claims_condition(&OpContext::background(), &store, CONDITION_INSTANCE_TERMINATING, &views)
            .await
            .unwrap();
        let cleared = store.get_node_claim("c1").await.unwrap();
        assert!(cleared.status.conditions.get(CONDITION_INSTANCE_TERMINATING).is_none());
    }
}
