use thiserror::Error;

use crate::cluster::{DO_NOT_DISRUPT_ANNOTATION_KEY, NODE_POOL_LABEL_KEY};
use crate::store::StoreError;

/// Errors surfaced by the cluster state cache
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    /// A pod is bound to a node the cache does not know yet
    #[error("Node '{0}' not tracked in cluster state")]
    NodeNotTracked(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// A bound pod or a disruption budget blocks eviction; callers skip the candidate
    #[error("Pod eviction blocked: {0}")]
    PodBlockEviction(String),

    #[error("Patching {kind} '{name}': {source}")]
    Patch {
        kind: &'static str,
        name: String,
        source: StoreError,
    },

    /// A writer panicked while holding the main lock
    #[error("Cluster state lock poisoned")]
    LockPoisoned,

    #[error("{}", join_errors(.0))]
    Multiple(Vec<StateError>),
}

fn join_errors(errors: &[StateError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl StateError {
    /// Fold a batch of errors into at most one
    pub fn combine(errors: Vec<StateError>) -> Result<(), StateError> {
        let mut flat = Vec::with_capacity(errors.len());
        for err in errors {
            match err {
                StateError::Multiple(inner) => flat.extend(inner),
                other => flat.push(other),
            }
        }
        match flat.len() {
            0 => Ok(()),
            1 => Err(flat.remove(0)),
            _ => Err(StateError::Multiple(flat)),
        }
    }

    /// True only when every error in the batch is an eviction block
    pub fn is_pod_block_eviction(&self) -> bool {
        match self {
            StateError::PodBlockEviction(_) => true,
            StateError::Multiple(errors) => {
                !errors.is_empty() && errors.iter().all(StateError::is_pod_block_eviction)
            }
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            StateError::Store(e) | StateError::Patch { source: e, .. } => e.is_conflict(),
            StateError::Multiple(errors) => errors.iter().any(StateError::is_conflict),
            _ => false,
        }
    }
}

/// Drop pod-block-eviction errors, keeping everything else
///
/// A batch mixing both kinds keeps only its other members.
pub fn ignore_pod_block_eviction<T: Default>(result: Result<T, StateError>) -> Result<T, StateError> {
    match result {
        Err(StateError::Multiple(errors)) => {
            let rest = errors
                .into_iter()
                .filter(|e| !e.is_pod_block_eviction())
                .collect();
            StateError::combine(rest).map(|()| T::default())
        }
        Err(e) if e.is_pod_block_eviction() => Ok(T::default()),
        other => other,
    }
}

/// Why a node cannot be voluntarily disrupted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DisruptionBlocked {
    #[error("node isn't managed by the provisioner")]
    Unmanaged,

    #[error("node claim does not have an associated node")]
    NoNode,

    #[error("node isn't initialized")]
    Uninitialized,

    #[error("node is deleting or marked for deletion")]
    MarkedForDeletion,

    #[error("node is nominated for a pending pod")]
    Nominated,

    #[error("disruption is blocked through the {:?} annotation", DO_NOT_DISRUPT_ANNOTATION_KEY)]
    DoNotDisrupt,

    #[error("node doesn't have required label {:?}", NODE_POOL_LABEL_KEY)]
    MissingNodePoolLabel,
}
