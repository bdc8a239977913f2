//! Authoritative object store boundary
//!
//! The state cache never owns the truth: it reads machines, claims, pods and
//! supporting objects through [`KubeClient`], and writes back only through
//! optimistic-lock patches. [`MemoryStore`] is an in-process implementation
//! used by tests and the replay binary.

pub mod memory;

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span};

use crate::cluster::{CsiNode, DaemonSet, Node, NodeClaim, NodePool, Pod};

pub use memory::MemoryStore;

/// Errors returned by the object store
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("Conflict updating {kind} '{name}': object has been modified")]
    Conflict { kind: &'static str, name: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Map a not-found error to `None`
pub fn ignore_not_found<T>(result: Result<T, StoreError>) -> Result<Option<T>, StoreError> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// Read/patch access to the authoritative store
#[async_trait]
pub trait KubeClient: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError>;

    async fn get_node(&self, name: &str) -> Result<Node, StoreError>;

    /// Replace a node; fails with `Conflict` if its resource version is stale
    async fn patch_node(&self, node: &Node) -> Result<Node, StoreError>;

    async fn list_node_claims(&self) -> Result<Vec<NodeClaim>, StoreError>;

    async fn get_node_claim(&self, name: &str) -> Result<NodeClaim, StoreError>;

    /// Replace a claim's status; fails with `Conflict` if its resource version is stale
    async fn patch_node_claim_status(&self, claim: &NodeClaim) -> Result<NodeClaim, StoreError>;

    async fn list_pods(&self) -> Result<Vec<Pod>, StoreError>;

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>, StoreError>;

    async fn list_pods_in_namespace(&self, namespace: &str) -> Result<Vec<Pod>, StoreError>;

    async fn list_daemonsets(&self) -> Result<Vec<DaemonSet>, StoreError>;

    async fn get_csi_node(&self, name: &str) -> Result<CsiNode, StoreError>;

    async fn get_node_pool(&self, name: &str) -> Result<NodePool, StoreError>;
}

/// Group and kind of a node class a cloud provider can launch
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodeClassKind {
    pub group: String,
    pub kind: String,
}

impl NodeClassKind {
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
        }
    }
}

/// The provisioning collaborator's view of which claims belong to this instance
pub trait CloudProvider: Send + Sync {
    fn name(&self) -> &str;

    fn supported_node_classes(&self) -> Vec<NodeClassKind>;
}

/// A cloud provider with a fixed set of node classes
#[derive(Debug, Clone)]
pub struct StaticCloudProvider {
    name: String,
    classes: Vec<NodeClassKind>,
}

impl StaticCloudProvider {
    pub fn new(name: impl Into<String>, classes: Vec<NodeClassKind>) -> Self {
        Self {
            name: name.into(),
            classes,
        }
    }
}

impl CloudProvider for StaticCloudProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn supported_node_classes(&self) -> Vec<NodeClassKind> {
        self.classes.clone()
    }
}

/// A claim is managed when it references a node class this provider supports
pub fn is_managed(claim: &NodeClaim, cloud_provider: &dyn CloudProvider) -> bool {
    let Some(class_ref) = claim.spec.node_class_ref.as_ref() else {
        return false;
    };
    cloud_provider
        .supported_node_classes()
        .iter()
        .any(|c| c.group == class_ref.group && c.kind == class_ref.kind)
}

/// List only the claims this provisioner is responsible for
pub async fn list_managed(
    client: &dyn KubeClient,
    cloud_provider: &dyn CloudProvider,
) -> Result<Vec<NodeClaim>, StoreError> {
    let claims = client.list_node_claims().await?;
    Ok(claims
        .into_iter()
        .filter(|c| is_managed(c, cloud_provider))
        .collect())
}

/// Bounds store sub-queries made on behalf of one cache operation
#[derive(Debug, Clone)]
pub struct OpContext {
    cancel: CancellationToken,
    timeout: Duration,
    span: Span,
}

impl OpContext {
    pub fn new(cancel: CancellationToken, timeout: Duration) -> Self {
        Self {
            cancel,
            timeout,
            span: Span::current(),
        }
    }

    /// Uncancellable context with the default timeout
    pub fn background() -> Self {
        Self::new(CancellationToken::new(), Duration::from_secs(30))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attach store calls to `span`
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Run a store call, failing early on cancellation or timeout
    pub async fn run<T, F>(&self, fut: F) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(StoreError::Cancelled),
            res = tokio::time::timeout(self.timeout, fut.instrument(self.span.clone())) => {
                res.unwrap_or(Err(StoreError::Timeout(self.timeout)))
            }
        }
    }
}

impl Default for OpContext {
    fn default() -> Self {
        Self::background()
    }
}
