//! Per-pod scheduling timestamps
//!
//! Each map is keyed independently and written with insert-if-absent, so
//! the first writer wins even under contention. Nothing here participates
//! in the pool totals, so these live outside the main cache lock.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::cluster::NamespacedName;

#[derive(Debug, Default)]
pub struct SchedulingTracker {
    /// First time the provisioner saw the pod pending
    acks: DashMap<NamespacedName, DateTime<Utc>>,
    /// First scheduling simulation that considered the pod
    attempted: DashMap<NamespacedName, DateTime<Utc>>,
    /// First simulation in which the pod fit somewhere
    schedulable: DashMap<NamespacedName, DateTime<Utc>>,
    /// First fit against a pool whose nodes register successfully
    healthy_pool_scheduled: DashMap<NamespacedName, DateTime<Utc>>,
    /// Claim the pod was last simulated onto
    node_claims: DashMap<NamespacedName, String>,
}

/// Insert `value` unless present; true if this call inserted it
fn insert_if_absent<V>(map: &DashMap<NamespacedName, V>, key: &NamespacedName, value: V) -> bool {
    match map.entry(key.clone()) {
        Entry::Occupied(_) => false,
        Entry::Vacant(slot) => {
            slot.insert(value);
            true
        }
    }
}

impl SchedulingTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ack(&self, key: &NamespacedName, now: DateTime<Utc>) {
        insert_if_absent(&self.acks, key, now);
    }

    pub fn ack_time(&self, key: &NamespacedName) -> Option<DateTime<Utc>> {
        self.acks.get(key).map(|t| *t)
    }

    /// Record the first attempt; true only for the call that recorded it
    pub fn mark_attempted(&self, key: &NamespacedName, now: DateTime<Utc>) -> bool {
        insert_if_absent(&self.attempted, key, now)
    }

    pub fn attempted_time(&self, key: &NamespacedName) -> Option<DateTime<Utc>> {
        self.attempted.get(key).map(|t| *t)
    }

    pub fn mark_schedulable(&self, key: &NamespacedName, now: DateTime<Utc>) {
        insert_if_absent(&self.schedulable, key, now);
    }

    pub fn clear_schedulable(&self, key: &NamespacedName) {
        self.schedulable.remove(key);
    }

    pub fn schedulable_time(&self, key: &NamespacedName) -> Option<DateTime<Utc>> {
        self.schedulable.get(key).map(|t| *t)
    }

    pub fn mark_healthy_pool_scheduled(&self, key: &NamespacedName, now: DateTime<Utc>) {
        insert_if_absent(&self.healthy_pool_scheduled, key, now);
    }

    pub fn clear_healthy_pool_scheduled(&self, key: &NamespacedName) {
        self.healthy_pool_scheduled.remove(key);
    }

    pub fn healthy_pool_scheduled_time(&self, key: &NamespacedName) -> Option<DateTime<Utc>> {
        self.healthy_pool_scheduled.get(key).map(|t| *t)
    }

    pub fn set_node_claim(&self, key: &NamespacedName, node_claim: &str) {
        self.node_claims.insert(key.clone(), node_claim.to_string());
    }

    pub fn clear_node_claim(&self, key: &NamespacedName) {
        self.node_claims.remove(key);
    }

    pub fn node_claim(&self, key: &NamespacedName) -> Option<String> {
        self.node_claims.get(key).map(|c| c.clone())
    }

    /// Forget everything recorded for one pod
    pub fn clear(&self, key: &NamespacedName) {
        self.acks.remove(key);
        self.attempted.remove(key);
        self.schedulable.remove(key);
        self.healthy_pool_scheduled.remove(key);
        self.node_claims.remove(key);
    }

    pub fn reset(&self) {
        self.acks.clear();
        self.attempted.clear();
        self.schedulable.clear();
        self.healthy_pool_scheduled.clear();
        self.node_claims.clear();
    }
}
