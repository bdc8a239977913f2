//! Per-pool aggregates maintained incrementally by the cluster cache

use std::collections::HashMap;

use crate::cluster::ResourceList;

use super::statenode::ViewSummary;

/// Sum of capacity per pool over live views
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodePoolResources {
    totals: HashMap<String, ResourceList>,
}

impl NodePoolResources {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply the before/after contribution of one view
    pub(crate) fn update(&mut self, old: Option<&ViewSummary>, new: Option<&ViewSummary>) {
        let old_pool = old.and_then(|s| s.pool.as_deref());
        let new_pool = new.and_then(|s| s.pool.as_deref());

        if let (Some(pool), Some(summary)) = (old_pool, old) {
            let total = self.totals.entry(pool.to_string()).or_default();
            for (name, quantity) in &summary.resources {
                *total.entry(name.clone()).or_default() -= *quantity;
            }
        }
        if let (Some(pool), Some(summary)) = (new_pool, new) {
            let total = self.totals.entry(pool.to_string()).or_default();
            for (name, quantity) in &summary.resources {
                *total.entry(name.clone()).or_default() += *quantity;
            }
        }

        for pool in [old_pool, new_pool].into_iter().flatten() {
            if self
                .totals
                .get(pool)
                .map(|t| t.values().all(|q| q.is_zero()))
                .unwrap_or(false)
            {
                self.totals.remove(pool);
            }
        }
    }

    pub fn get(&self, pool: &str) -> Option<&ResourceList> {
        self.totals.get(pool)
    }

    pub fn pools(&self) -> Vec<String> {
        let mut pools: Vec<_> = self.totals.keys().cloned().collect();
        pools.sort();
        pools
    }

    pub fn clear(&mut self) {
        self.totals.clear();
    }
}

/// Lifecycle bucket of a node claim within its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    Running,
    Deleting,
    PendingDisruption,
}

/// Counts of node claims per pool and lifecycle bucket
#[derive(Debug, Clone, Default)]
pub struct NodePoolState {
    claims: HashMap<String, (String, ClaimState)>,
}

impl NodePoolState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a claim; a pending disruption survives updates until the claim is deleting
    pub fn update_node_claim(&mut self, pool: Option<&str>, name: &str, marked_for_deletion: bool) {
        let Some(pool) = pool else {
            self.cleanup(name);
            return;
        };
        let previous = self
            .claims
            .get(name)
            .filter(|(p, _)| p == pool)
            .map(|(_, s)| *s);
        let state = match (marked_for_deletion, previous) {
            (true, _) => ClaimState::Deleting,
            (false, Some(ClaimState::PendingDisruption)) => ClaimState::PendingDisruption,
            (false, _) => ClaimState::Running,
        };
        self.claims.insert(name.to_string(), (pool.to_string(), state));
    }

    /// Flag a running claim as chosen for disruption
    pub fn mark_pending_disruption(&mut self, pool: &str, name: &str) {
        if let Some((p, state)) = self.claims.get_mut(name) {
            if p == pool && *state == ClaimState::Running {
                *state = ClaimState::PendingDisruption;
            }
        }
    }

    /// Return a claim to running, dropping any pending disruption
    pub fn unmark(&mut self, name: &str) {
        if let Some((_, state)) = self.claims.get_mut(name) {
            *state = ClaimState::Running;
        }
    }

    pub fn cleanup(&mut self, name: &str) {
        self.claims.remove(name);
    }

    pub fn state_of(&self, name: &str) -> Option<ClaimState> {
        self.claims.get(name).map(|(_, s)| *s)
    }

    /// `(running, deleting, pending_disruption)` for a pool
    pub fn node_count(&self, pool: &str) -> (usize, usize, usize) {
        self.claims
            .values()
            .filter(|(p, _)| p == pool)
            .fold((0, 0, 0), |(r, d, p), (_, state)| match state {
                ClaimState::Running => (r + 1, d, p),
                ClaimState::Deleting => (r, d + 1, p),
                ClaimState::PendingDisruption => (r, d, p + 1),
            })
    }

    pub fn clear(&mut self) {
        self.claims.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{resource_list, Quantity, RESOURCE_NODES};

    fn summary(pool: &str, cpu: &str, deleting: bool) -> ViewSummary {
        let mut resources = ResourceList::new();
        if !deleting {
            resources = resource_list([("cpu", cpu)]);
            resources.insert(RESOURCE_NODES.to_string(), Quantity::from_units(1));
        }
        ViewSummary {
            pool: Some(pool.to_string()),
            resources,
            initialized: true,
            marked_for_deletion: deleting,
            has_claim: true,
            has_node: true,
        }
    }

    #[test]
    fn test_add_move_and_remove() {
        let mut totals = NodePoolResources::new();
        let a = summary("a", "2", false);
        totals.update(None, Some(&a));
        totals.update(None, Some(&summary("a", "4", false)));
        assert_eq!(totals.get("a").unwrap()["cpu"], Quantity::from_units(6));
        assert_eq!(totals.get("a").unwrap()[RESOURCE_NODES], Quantity::from_units(2));

        // relabel into pool b
        let b = summary("b", "2", false);
        totals.update(Some(&a), Some(&b));
        assert_eq!(totals.get("a").unwrap()["cpu"], Quantity::from_units(4));
        assert_eq!(totals.get("b").unwrap()["cpu"], Quantity::from_units(2));

        // deleting views contribute nothing, and empty pools are dropped
        totals.update(Some(&b), Some(&summary("b", "2", true)));
        assert!(totals.get("b").is_none());
        assert_eq!(totals.pools(), vec!["a".to_string()]);
    }

    #[test]
    fn test_unpooled_views_ignored() {
        let mut totals = NodePoolResources::new();
        let mut s = summary("a", "2", false);
        s.pool = None;
        totals.update(None, Some(&s));
        assert!(totals.pools().is_empty());
    }

    #[test]
    fn test_node_pool_state_counts() {
        let mut state = NodePoolState::new();
        state.update_node_claim(Some("default"), "a", false);
        state.update_node_claim(Some("default"), "b", false);
        state.update_node_claim(Some("default"), "c", true);
        state.update_node_claim(None, "d", false);
        assert_eq!(state.node_count("default"), (2, 1, 0));

        state.mark_pending_disruption("default", "a");
        state.update_node_claim(Some("default"), "a", false);
        assert_eq!(state.node_count("default"), (1, 1, 1));
        assert_eq!(state.state_of("a"), Some(ClaimState::PendingDisruption));

        state.update_node_claim(Some("default"), "a", true);
        assert_eq!(state.node_count("default"), (1, 2, 0));

        state.unmark("a");
        state.cleanup("b");
        assert_eq!(state.node_count("default"), (1, 1, 0));
        assert_eq!(state.node_count("other"), (0, 0, 0));
    }
}
