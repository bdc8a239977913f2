//! In-process object store
//!
//! Objects are kept per kind in concurrent maps. Every write bumps a global
//! resource version; patches carrying a stale version are rejected with
//! `StoreError::Conflict`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use super::{KubeClient, StoreError};
use crate::cluster::{
    CsiNode, DaemonSet, NamespacedName, Node, NodeClaim, NodePool, ObjectMeta, Pod,
};

/// An object kind the store can hold
pub trait Stored: Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn meta(&self) -> &ObjectMeta;

    fn meta_mut(&mut self) -> &mut ObjectMeta;
}

macro_rules! impl_stored {
    ($ty:ty, $kind:literal) => {
        impl Stored for $ty {
            const KIND: &'static str = $kind;

            fn meta(&self) -> &ObjectMeta {
                &self.metadata
            }

            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }
        }
    };
}

impl_stored!(Node, "Node");
impl_stored!(NodeClaim, "NodeClaim");
impl_stored!(Pod, "Pod");
impl_stored!(CsiNode, "CSINode");
impl_stored!(NodePool, "NodePool");
impl_stored!(DaemonSet, "DaemonSet");

struct Table<T: Stored> {
    objects: DashMap<NamespacedName, T>,
}

impl<T: Stored> Table<T> {
    fn new() -> Self {
        Self {
            objects: DashMap::new(),
        }
    }

    fn apply(&self, mut obj: T, version: u64) -> T {
        let key = obj.meta().key();
        let meta = obj.meta_mut();
        if let Some(existing) = self.objects.get(&key) {
            if meta.uid.is_empty() {
                meta.uid = existing.meta().uid.clone();
            }
            if meta.creation_timestamp.is_none() {
                meta.creation_timestamp = existing.meta().creation_timestamp;
            }
        }
        if meta.uid.is_empty() {
            meta.uid = Uuid::new_v4().to_string();
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(Utc::now());
        }
        meta.resource_version = version;
        self.objects.insert(key, obj.clone());
        obj
    }

    fn get(&self, key: &NamespacedName) -> Result<T, StoreError> {
        self.objects
            .get(key)
            .map(|o| o.value().clone())
            .ok_or_else(|| StoreError::NotFound {
                kind: T::KIND,
                name: key.to_string(),
            })
    }

    fn list(&self) -> Vec<T> {
        let mut out: Vec<T> = self.objects.iter().map(|o| o.value().clone()).collect();
        out.sort_by(|a, b| a.meta().key().cmp(&b.meta().key()));
        out
    }

    fn delete(&self, key: &NamespacedName) -> Option<T> {
        self.objects.remove(key).map(|(_, o)| o)
    }

    /// Optimistic-lock write: `obj` must carry the stored resource version
    fn patch(&self, obj: &T, version: u64, merge: impl FnOnce(&mut T, &T)) -> Result<T, StoreError> {
        let key = obj.meta().key();
        let mut stored = self.objects.get_mut(&key).ok_or_else(|| StoreError::NotFound {
            kind: T::KIND,
            name: key.to_string(),
        })?;
        if stored.meta().resource_version != obj.meta().resource_version {
            return Err(StoreError::Conflict {
                kind: T::KIND,
                name: key.to_string(),
            });
        }
        merge(&mut stored, obj);
        stored.meta_mut().resource_version = version;
        Ok(stored.clone())
    }
}

struct Inner {
    nodes: Table<Node>,
    node_claims: Table<NodeClaim>,
    pods: Table<Pod>,
    csi_nodes: Table<CsiNode>,
    node_pools: Table<NodePool>,
    daemonsets: Table<DaemonSet>,
    version: AtomicU64,
    unavailable: AtomicBool,
}

/// DashMap-backed store; clones share the same objects
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                nodes: Table::new(),
                node_claims: Table::new(),
                pods: Table::new(),
                csi_nodes: Table::new(),
                node_pools: Table::new(),
                daemonsets: Table::new(),
                version: AtomicU64::new(0),
                unavailable: AtomicBool::new(false),
            }),
        }
    }

    fn next_version(&self) -> u64 {
        self.inner.version.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Make every list call fail until cleared
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.inner.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("store unavailable".to_string()));
        }
        Ok(())
    }

    /// Create or replace a node, returning the stored copy
    pub fn apply_node(&self, node: Node) -> Node {
        self.inner.nodes.apply(node, self.next_version())
    }

    pub fn apply_node_claim(&self, claim: NodeClaim) -> NodeClaim {
        self.inner.node_claims.apply(claim, self.next_version())
    }

    pub fn apply_pod(&self, pod: Pod) -> Pod {
        self.inner.pods.apply(pod, self.next_version())
    }

    pub fn apply_csi_node(&self, csi_node: CsiNode) -> CsiNode {
        self.inner.csi_nodes.apply(csi_node, self.next_version())
    }

    pub fn apply_node_pool(&self, node_pool: NodePool) -> NodePool {
        self.inner.node_pools.apply(node_pool, self.next_version())
    }

    pub fn apply_daemonset(&self, daemonset: DaemonSet) -> DaemonSet {
        self.inner.daemonsets.apply(daemonset, self.next_version())
    }

    pub fn delete_node(&self, name: &str) -> Option<Node> {
        self.inner.nodes.delete(&NamespacedName::cluster_scoped(name))
    }

    pub fn delete_node_claim(&self, name: &str) -> Option<NodeClaim> {
        self.inner
            .node_claims
            .delete(&NamespacedName::cluster_scoped(name))
    }

    pub fn delete_pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.inner.pods.delete(&NamespacedName::new(namespace, name))
    }

    pub fn delete_csi_node(&self, name: &str) -> Option<CsiNode> {
        self.inner
            .csi_nodes
            .delete(&NamespacedName::cluster_scoped(name))
    }

    pub fn delete_daemonset(&self, namespace: &str, name: &str) -> Option<DaemonSet> {
        self.inner
            .daemonsets
            .delete(&NamespacedName::new(namespace, name))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KubeClient for MemoryStore {
    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        self.check_available()?;
        Ok(self.inner.nodes.list())
    }

    async fn get_node(&self, name: &str) -> Result<Node, StoreError> {
        self.inner.nodes.get(&NamespacedName::cluster_scoped(name))
    }

    async fn patch_node(&self, node: &Node) -> Result<Node, StoreError> {
        let version = self.next_version();
        self.inner.nodes.patch(node, version, |stored, patch| {
            let meta = stored.metadata.clone();
            *stored = patch.clone();
            stored.metadata.uid = meta.uid;
            stored.metadata.creation_timestamp = meta.creation_timestamp;
        })
    }

    async fn list_node_claims(&self) -> Result<Vec<NodeClaim>, StoreError> {
        self.check_available()?;
        Ok(self.inner.node_claims.list())
    }

    async fn get_node_claim(&self, name: &str) -> Result<NodeClaim, StoreError> {
        self.inner
            .node_claims
            .get(&NamespacedName::cluster_scoped(name))
    }

    async fn patch_node_claim_status(&self, claim: &NodeClaim) -> Result<NodeClaim, StoreError> {
        let version = self.next_version();
        self.inner.node_claims.patch(claim, version, |stored, patch| {
            stored.status = patch.status.clone();
        })
    }

    async fn list_pods(&self) -> Result<Vec<Pod>, StoreError> {
        self.check_available()?;
        Ok(self.inner.pods.list())
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, StoreError> {
        self.check_available()?;
        Ok(self
            .inner
            .pods
            .list()
            .into_iter()
            .filter(|p| p.spec.node_name == node_name)
            .collect())
    }

    async fn list_pods_in_namespace(&self, namespace: &str) -> Result<Vec<Pod>, StoreError> {
        self.check_available()?;
        Ok(self
            .inner
            .pods
            .list()
            .into_iter()
            .filter(|p| p.metadata.namespace == namespace)
            .collect())
    }

    async fn list_daemonsets(&self) -> Result<Vec<DaemonSet>, StoreError> {
        self.check_available()?;
        Ok(self.inner.daemonsets.list())
    }

    async fn get_csi_node(&self, name: &str) -> Result<CsiNode, StoreError> {
        self.inner
            .csi_nodes
            .get(&NamespacedName::cluster_scoped(name))
    }

    async fn get_node_pool(&self, name: &str) -> Result<NodePool, StoreError> {
        self.inner
            .node_pools
            .get(&NamespacedName::cluster_scoped(name))
    }
}
