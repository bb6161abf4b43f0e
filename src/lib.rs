//! # Unicontact
//!
//! Identity reconciliation for contact records.
//!
//! Each observed (email, phone) pair is matched against stored contacts, the
//! clusters it touches are merged under their earliest-created primary, new
//! information is recorded as a secondary contact, and every member is relinked
//! so that a cluster always has exactly one primary.

pub mod config;
pub mod engine;
pub mod error;
pub mod locks;
pub mod matcher;
pub mod model;
pub mod persistence;
pub mod planner;
pub mod repository;
pub mod resolver;
pub mod response;
pub mod store;
pub mod test_support;

// Re-export main types for convenience
pub use config::{ReconcileConfig, ServiceConfig, StorageBackend, StorageConfig};
pub use engine::{Reconciler, Resolution};
pub use error::{ReconcileError, ReconcileStage, RepositoryError, ValidationError};
pub use model::{Contact, ContactId, LinkPrecedence, Observation};
pub use persistence::{PersistentContactRepository, PersistentOpenOptions};
pub use repository::ContactRepository;
pub use response::{ContactSummary, IdentifyResponse};
pub use store::MemoryContactRepository;

use anyhow::anyhow;
use std::sync::Arc;

/// Open the repository selected by `config`.
pub fn open_repository(config: &StorageConfig) -> anyhow::Result<Arc<dyn ContactRepository>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryContactRepository::new())),
        StorageBackend::Rocksdb => {
            let path = config
                .data_dir
                .as_ref()
                .ok_or_else(|| anyhow!("rocksdb backend requires storage.data_dir"))?;
            let store = PersistentContactRepository::open_with_options(
                path,
                PersistentOpenOptions {
                    repair: config.repair,
                    cache_capacity: config.cache_capacity,
                },
            )?;
            Ok(Arc::new(store))
        }
    }
}

/// Build a reconciler over the repository selected by `config`.
pub fn reconciler_from_config(
    config: &ServiceConfig,
) -> anyhow::Result<Reconciler<Arc<dyn ContactRepository>>> {
    let repo = open_repository(&config.storage)?;
    Ok(Reconciler::with_config(repo, &config.reconcile))
}
