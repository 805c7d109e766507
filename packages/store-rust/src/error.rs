//! Error types of the store.

use geostore_core::{MappingError, PlanningError};

/// Lock contention or missing authorization, always naming the feature.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FeatureLockError {
    #[error("feature {fid} of {type_name} is locked by another authorization")]
    Locked { type_name: String, fid: String },

    #[error("features of {type_name} cannot be unlocked outside an explicit transaction")]
    AutoCommitUnlock { type_name: String },

    #[error("transaction does not hold the authorization for lock on {fid} of {type_name}")]
    NotAuthorized { type_name: String, fid: String },

    #[error("unknown lock authorization {token}")]
    UnknownAuthorization { token: String },
}

impl FeatureLockError {
    /// The offending feature id, if the error concerns one feature.
    #[must_use]
    pub fn fid(&self) -> Option<&str> {
        match self {
            FeatureLockError::Locked { fid, .. } | FeatureLockError::NotAuthorized { fid, .. } => Some(fid),
            FeatureLockError::AutoCommitUnlock { .. } | FeatureLockError::UnknownAuthorization { .. } => None,
        }
    }
}

/// Everything a [`FeatureStore`](crate::FeatureStore) operation can fail with.
///
/// Nothing here is retried by the store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown feature type: {0}")]
    UnknownType(String),

    #[error(transparent)]
    Planning(#[from] PlanningError),

    #[error(transparent)]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Lock(#[from] FeatureLockError),

    /// The statement was stopped before taking effect.
    #[error("statement timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// A write timed out and the executor could not confirm it stopped. It
    /// may or may not have been applied.
    #[error("write timed out after {timeout_ms} ms with unknown outcome")]
    OutcomeUnknown { timeout_ms: u64 },

    #[error("transaction {id} is closed")]
    TransactionClosed { id: u64 },

    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),
}
