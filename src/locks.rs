//! # Key Locks
//!
//! Per-value leases that serialize reconciliations touching the same email or
//! phone number. Without them, two concurrent first sightings of one value
//! both observe an empty match set and both insert a primary.
//!
//! Value keys alone do not cover requests that reach one cluster through
//! different values, so writers also lease `cluster:<id>` for the root of every
//! cluster they rewrite. Value keys are always taken before cluster keys.
//!
//! Leases are process-local.

use crate::model::{ContactId, Observation};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

type LockTable = DashMap<String, Arc<Mutex<()>>>;

#[derive(Debug, Clone, Default)]
pub struct KeyLocks {
    table: Arc<LockTable>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock keys for every value in `observation`.
    pub async fn acquire(&self, observation: &Observation) -> KeyLease {
        self.acquire_keys(lock_keys(observation)).await
    }

    /// Lock the clusters rooted at `roots`.
    pub async fn acquire_clusters(&self, roots: impl IntoIterator<Item = ContactId>) -> KeyLease {
        self.acquire_keys(roots.into_iter().map(cluster_key).collect())
            .await
    }

    /// Keys are taken in sorted order so overlapping requests cannot deadlock.
    async fn acquire_keys(&self, mut keys: Vec<String>) -> KeyLease {
        keys.sort();
        keys.dedup();

        let mut held = Vec::with_capacity(keys.len());
        for key in keys {
            let mutex = self.table.entry(key.clone()).or_default().clone();
            let guard = mutex.lock_owned().await;
            held.push((key, guard));
        }

        KeyLease {
            held,
            table: Arc::clone(&self.table),
        }
    }

    /// Number of keys with a live lease or waiter.
    pub fn active_keys(&self) -> usize {
        self.table.len()
    }
}

fn cluster_key(root: ContactId) -> String {
    format!("cluster:{}", root.0)
}

fn lock_keys(observation: &Observation) -> Vec<String> {
    let mut keys = Vec::with_capacity(2);
    if let Some(email) = observation.email() {
        keys.push(format!("email:{email}"));
    }
    if let Some(phone) = observation.phone_number() {
        keys.push(format!("phone:{phone}"));
    }
    keys
}

/// Held keys; released on drop.
#[derive(Debug)]
pub struct KeyLease {
    held: Vec<(String, OwnedMutexGuard<()>)>,
    table: Arc<LockTable>,
}

impl KeyLease {
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.held.iter().map(|(key, _)| key.as_str())
    }

    /// Whether every cluster in `roots` is held by this lease.
    pub fn covers_clusters(&self, roots: &[ContactId]) -> bool {
        roots.iter().all(|root| {
            let key = cluster_key(*root);
            self.held.iter().any(|(held, _)| *held == key)
        })
    }
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        for (key, guard) in self.held.drain(..) {
            drop(guard);
            // Only the table still references the mutex: nobody holds or awaits it.
            self.table
                .remove_if(&key, |_, mutex| Arc::strong_count(mutex) == 1);
        }
    }
}
