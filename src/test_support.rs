//! Fixtures shared by unit tests, integration tests and benchmarks.

use crate::error::RepositoryError;
use crate::model::{Contact, ContactId, ContactPatch, LinkPrecedence, NewContact};
use crate::repository::{ContactRepository, RepositoryResult};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

/// Insert a primary directly, bypassing reconciliation.
pub async fn seed_primary<R>(repo: &R, email: Option<&str>, phone: Option<&str>) -> Result<Contact>
where
    R: ContactRepository + ?Sized,
{
    Ok(repo
        .insert(NewContact {
            email: email.map(str::to_string),
            phone_number: phone.map(str::to_string),
            link_precedence: LinkPrecedence::Primary,
            linked_id: None,
        })
        .await?)
}

/// Insert a secondary directly. `linked_id` is not checked, so this can build
/// inconsistent stores on purpose.
pub async fn seed_secondary<R>(
    repo: &R,
    email: Option<&str>,
    phone: Option<&str>,
    linked_id: ContactId,
) -> Result<Contact>
where
    R: ContactRepository + ?Sized,
{
    Ok(repo
        .insert(NewContact {
            email: email.map(str::to_string),
            phone_number: phone.map(str::to_string),
            link_precedence: LinkPrecedence::Secondary,
            linked_id: Some(linked_id),
        })
        .await?)
}

/// Check the cluster invariants over a full store snapshot:
/// primaries have no link, secondaries link directly to an existing primary,
/// each primary is the earliest-created member of its cluster, and contacts
/// sharing an email or phone sit in the same cluster.
pub fn check_cluster_invariants(contacts: &[Contact]) -> Result<()> {
    let by_id: HashMap<ContactId, &Contact> = contacts.iter().map(|c| (c.id, c)).collect();

    for contact in contacts {
        match contact.link_precedence {
            LinkPrecedence::Primary => {
                if contact.linked_id.is_some() {
                    bail!("primary {} has linked_id {:?}", contact.id, contact.linked_id);
                }
            }
            LinkPrecedence::Secondary => {
                let Some(linked_id) = contact.linked_id else {
                    bail!("secondary {} has no linked_id", contact.id);
                };
                match by_id.get(&linked_id) {
                    Some(primary) if primary.is_primary() => {
                        if primary.primacy_key() > contact.primacy_key() {
                            bail!(
                                "secondary {} predates its primary {}",
                                contact.id,
                                primary.id
                            );
                        }
                    }
                    Some(_) => bail!("secondary {} links to non-primary {}", contact.id, linked_id),
                    None => bail!("secondary {} links to missing {}", contact.id, linked_id),
                }
            }
        }
    }

    let cluster_of = |contact: &Contact| contact.linked_id.unwrap_or(contact.id);
    let mut email_clusters: HashMap<&str, ContactId> = HashMap::new();
    let mut phone_clusters: HashMap<&str, ContactId> = HashMap::new();
    for contact in contacts {
        let cluster = cluster_of(contact);
        if let Some(email) = contact.email.as_deref() {
            let owner = *email_clusters.entry(email).or_insert(cluster);
            if owner != cluster {
                bail!("email {email} spans clusters {owner} and {cluster}");
            }
        }
        if let Some(phone) = contact.phone_number.as_deref() {
            let owner = *phone_clusters.entry(phone).or_insert(cluster);
            if owner != cluster {
                bail!("phone {phone} spans clusters {owner} and {cluster}");
            }
        }
    }

    Ok(())
}

/// Fail if two contacts in one cluster carry the same (email, phone) pair.
pub fn check_no_duplicate_pairs(contacts: &[Contact]) -> Result<()> {
    let mut seen = HashSet::new();
    for contact in contacts {
        let cluster = contact.linked_id.unwrap_or(contact.id);
        let key = (cluster, contact.email.clone(), contact.phone_number.clone());
        if !seen.insert(key) {
            bail!(
                "duplicate pair ({:?}, {:?}) in cluster {}",
                contact.email,
                contact.phone_number,
                cluster
            );
        }
    }
    Ok(())
}

/// Repository operations, for [`FailingRepository`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RepoOp {
    Insert,
    FindById,
    FindByLinkedId,
    FindByEmailOrPhone,
    Update,
}

/// Wraps a repository and fails or holds chosen operations.
/// Every call is counted, failed or not.
pub struct FailingRepository<R> {
    inner: R,
    failing: Mutex<HashSet<RepoOp>>,
    holds: Mutex<HashMap<RepoOp, Arc<Semaphore>>>,
    parked: Notify,
    calls: Mutex<HashMap<RepoOp, usize>>,
}

impl<R> FailingRepository<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            failing: Mutex::new(HashSet::new()),
            holds: Mutex::new(HashMap::new()),
            parked: Notify::new(),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Park calls of `op` until [`release`](Self::release).
    pub fn hold(&self, op: RepoOp) {
        self.holds.lock().insert(op, Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, op: RepoOp) {
        if let Some(gate) = self.holds.lock().remove(&op) {
            gate.close();
        }
    }

    /// Wait until some call is parked by [`hold`](Self::hold).
    pub async fn wait_for_parked(&self) {
        self.parked.notified().await;
    }

    pub fn fail_on(&self, op: RepoOp) {
        self.failing.lock().insert(op);
    }

    pub fn heal(&self) {
        self.failing.lock().clear();
    }

    pub fn calls(&self, op: RepoOp) -> usize {
        self.calls.lock().get(&op).copied().unwrap_or(0)
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }

    async fn enter(&self, op: RepoOp) -> RepositoryResult<()> {
        *self.calls.lock().entry(op).or_insert(0) += 1;
        let gate = self.holds.lock().get(&op).cloned();
        if let Some(gate) = gate {
            self.parked.notify_one();
            // Closed on release; no permit is ever granted.
            let _ = gate.acquire().await;
        }
        if self.failing.lock().contains(&op) {
            return Err(RepositoryError::Backend(anyhow!("injected failure in {op:?}")));
        }
        Ok(())
    }
}

#[async_trait]
impl<R> ContactRepository for FailingRepository<R>
where
    R: ContactRepository,
{
    async fn insert(&self, contact: NewContact) -> RepositoryResult<Contact> {
        self.enter(RepoOp::Insert).await?;
        self.inner.insert(contact).await
    }

    async fn find_by_id(&self, id: ContactId) -> RepositoryResult<Option<Contact>> {
        self.enter(RepoOp::FindById).await?;
        self.inner.find_by_id(id).await
    }

    async fn find_by_linked_id(&self, id: ContactId) -> RepositoryResult<Vec<Contact>> {
        self.enter(RepoOp::FindByLinkedId).await?;
        self.inner.find_by_linked_id(id).await
    }

    async fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> RepositoryResult<Vec<Contact>> {
        self.enter(RepoOp::FindByEmailOrPhone).await?;
        self.inner.find_by_email_or_phone(email, phone_number).await
    }

    async fn update(&self, id: ContactId, patch: ContactPatch) -> RepositoryResult<Contact> {
        self.enter(RepoOp::Update).await?;
        self.inner.update(id, patch).await
    }
}
