//! Error types for contact reconciliation.

use crate::model::ContactId;
use std::fmt;
use thiserror::Error;

/// Stages of a single reconciliation, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReconcileStage {
    Validating,
    Matching,
    Resolving,
    Writing,
    ReadingBack,
}

impl fmt::Display for ReconcileStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReconcileStage::Validating => "validating",
            ReconcileStage::Matching => "matching",
            ReconcileStage::Resolving => "resolving",
            ReconcileStage::Writing => "writing",
            ReconcileStage::ReadingBack => "reading back",
        };
        f.write_str(name)
    }
}

/// Caller input rejected before any store access.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("email and phone number cannot both be empty")]
    MissingIdentity,

    #[error("phone number length {len} exceeds {max}")]
    PhoneTooLong { len: usize, max: usize },

    #[error("email length {len} exceeds {max}")]
    EmailTooLong { len: usize, max: usize },
}

/// Failures reported by a [`ContactRepository`](crate::repository::ContactRepository).
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("contact not found: {0}")]
    NotFound(ContactId),

    #[error("storage backend error: {0:#}")]
    Backend(#[from] anyhow::Error),
}

/// Everything `reconcile` can fail with.
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// A matched secondary has no reachable primary; the store is inconsistent.
    #[error("broken cluster: contact {contact_id} links to {linked_id:?} but no primary is reachable")]
    BrokenCluster {
        contact_id: ContactId,
        linked_id: Option<ContactId>,
    },

    #[error("repository failure while {stage}: {source}")]
    Repository {
        stage: ReconcileStage,
        #[source]
        source: RepositoryError,
    },
}

impl ReconcileError {
    pub(crate) fn repository(stage: ReconcileStage) -> impl FnOnce(RepositoryError) -> Self {
        move |source| ReconcileError::Repository { stage, source }
    }

    /// Whether the failure is attributable to the request or the stored data
    /// rather than to the storage engine. Transports map these to a 400.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ReconcileError::Validation(_) | ReconcileError::BrokenCluster { .. }
        )
    }

    /// The core never retries; callers should not either for these kinds.
    pub fn is_retryable(&self) -> bool {
        false
    }

    pub fn stage(&self) -> ReconcileStage {
        match self {
            ReconcileError::Validation(_) => ReconcileStage::Validating,
            ReconcileError::BrokenCluster { .. } => ReconcileStage::Resolving,
            ReconcileError::Repository { stage, .. } => *stage,
        }
    }
}
