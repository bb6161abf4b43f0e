//! # Reconciliation Engine
//!
//! Runs one observation through validation, matching, cluster resolution,
//! planned writes and a final read-back of the cluster.

use crate::config::ReconcileConfig;
use crate::error::{ReconcileError, ReconcileStage};
use crate::locks::{KeyLease, KeyLocks};
use crate::matcher::{match_contacts, MatchSet};
use crate::model::{Contact, ContactId, NewContact, Observation, ObservationLimits};
use crate::planner::{apply_plan, MutationPlan};
use crate::repository::{sort_by_creation, ContactRepository};
use crate::resolver::{resolve_cluster, ClusterResolution};
use crate::response::IdentifyResponse;
use futures::future::try_join_all;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, instrument, warn};

/// Cluster state after a successful reconciliation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub primary: Contact,
    /// Members other than the primary, ordered by creation, without duplicates
    pub secondaries: Vec<Contact>,
    /// Contact inserted by this reconciliation, if any
    pub created: Option<ContactId>,
    /// Former primaries demoted by this reconciliation
    pub demoted: Vec<ContactId>,
}

impl Resolution {
    pub fn secondary_ids(&self) -> Vec<ContactId> {
        self.secondaries.iter().map(|contact| contact.id).collect()
    }
}

/// Reconciles observations against a contact repository.
///
/// With key locking enabled (the default) reconciliations sharing an email or
/// phone value run one at a time, and reconciliations rewriting a common
/// cluster write one at a time from a fresh read. With it disabled the engine matches the
/// behaviour of a plain read-then-write service: two concurrent first
/// sightings of the same value can each create a primary, leaving two clusters
/// until a later observation bridges them.
pub struct Reconciler<R> {
    repo: R,
    limits: ObservationLimits,
    locks: Option<KeyLocks>,
}

impl<R> Reconciler<R>
where
    R: ContactRepository,
{
    pub fn new(repo: R) -> Self {
        Self::with_config(repo, &ReconcileConfig::default())
    }

    pub fn with_config(repo: R, config: &ReconcileConfig) -> Self {
        Self {
            repo,
            limits: config.limits(),
            locks: config.key_locking.then(KeyLocks::new),
        }
    }

    pub fn repository(&self) -> &R {
        &self.repo
    }

    /// Reconcile one (email, phone) observation and return the resulting cluster.
    #[instrument(skip(self), level = "debug")]
    pub async fn reconcile(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<Resolution, ReconcileError> {
        debug!(stage = %ReconcileStage::Validating, "reconcile stage");
        let observation = Observation::parse(email, phone_number, &self.limits)?;

        let _lease = self.lease(&observation).await;

        let (matches, resolution, _cluster_lease) = match self.resolve_leased(&observation).await? {
            Some(resolved) => resolved,
            None => return self.create_primary(&observation).await,
        };

        debug!(stage = %ReconcileStage::Writing, "reconcile stage");
        let plan = MutationPlan::build(&observation, &matches, &resolution);
        let applied = apply_plan(&self.repo, &plan)
            .await
            .inspect_err(log_failure)?;
        if resolution.is_merge() {
            info!(
                primary = %resolution.canonical.id,
                demoted = ?plan.demotions,
                "merged clusters"
            );
        }
        if let Some(inserted) = &applied.inserted {
            info!(primary = %resolution.canonical.id, contact = %inserted.id, "recorded new secondary");
        }

        debug!(stage = %ReconcileStage::ReadingBack, "reconcile stage");
        let created = applied.inserted.as_ref().map(|contact| contact.id);
        let secondaries = self
            .read_back(&resolution, created)
            .await
            .inspect_err(log_failure)?;

        Ok(Resolution {
            primary: resolution.canonical,
            secondaries,
            created,
            demoted: plan.demotions,
        })
    }

    /// Reconcile and shape the result for a transport.
    pub async fn identify(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> Result<IdentifyResponse, ReconcileError> {
        let resolution = self.reconcile(email, phone_number).await?;
        Ok(IdentifyResponse::from(&resolution))
    }

    async fn lease(&self, observation: &Observation) -> Option<KeyLease> {
        match &self.locks {
            Some(locks) => Some(locks.acquire(observation).await),
            None => None,
        }
    }

    /// Match and resolve until the resolution was read while holding the
    /// lease of every cluster it rewrites. A root demoted by a concurrent
    /// merge shows up as a different root set on the next pass.
    async fn resolve_leased(
        &self,
        observation: &Observation,
    ) -> Result<Option<(MatchSet, ClusterResolution, Option<KeyLease>)>, ReconcileError> {
        let mut held: Option<KeyLease> = None;
        loop {
            debug!(stage = %ReconcileStage::Matching, %observation, "reconcile stage");
            let matches = match_contacts(&self.repo, observation)
                .await
                .map_err(ReconcileError::repository(ReconcileStage::Matching))
                .inspect_err(log_failure)?;

            debug!(stage = %ReconcileStage::Resolving, matched = matches.contacts.len(), "reconcile stage");
            let Some(resolution) = resolve_cluster(&self.repo, &matches)
                .await
                .inspect_err(log_failure)?
            else {
                return Ok(None);
            };

            let Some(locks) = &self.locks else {
                return Ok(Some((matches, resolution, None)));
            };
            let roots = resolution.root_ids();
            if held.as_ref().is_some_and(|lease| lease.covers_clusters(&roots)) {
                return Ok(Some((matches, resolution, held)));
            }

            // Release before widening so cluster keys are always taken in order.
            drop(held.take());
            debug!(clusters = ?roots, "leasing clusters");
            held = Some(locks.acquire_clusters(roots).await);
        }
    }

    async fn create_primary(&self, observation: &Observation) -> Result<Resolution, ReconcileError> {
        let primary = self
            .repo
            .insert(NewContact::primary(observation))
            .await
            .map_err(ReconcileError::repository(ReconcileStage::Writing))
            .inspect_err(log_failure)?;
        info!(contact = %primary.id, "created primary for new identity");

        Ok(Resolution {
            created: Some(primary.id),
            primary,
            secondaries: Vec::new(),
            demoted: Vec::new(),
        })
    }

    /// Fresh read of the cluster: everything now linked to the primary, plus
    /// every contact this reconciliation already knew about.
    async fn read_back(
        &self,
        resolution: &ClusterResolution,
        created: Option<ContactId>,
    ) -> Result<Vec<Contact>, ReconcileError> {
        let canonical = resolution.canonical.id;
        let to_error = ReconcileError::repository(ReconcileStage::ReadingBack);

        let mut secondaries: BTreeMap<ContactId, Contact> = self
            .repo
            .find_by_linked_id(canonical)
            .await
            .map_err(to_error)?
            .into_iter()
            .map(|contact| (contact.id, contact))
            .collect();

        let known: BTreeSet<ContactId> = resolution
            .members
            .keys()
            .copied()
            .chain(created)
            .filter(|id| *id != canonical && !secondaries.contains_key(id))
            .collect();
        let fetched = try_join_all(known.iter().map(|id| self.repo.find_by_id(*id)))
            .await
            .map_err(ReconcileError::repository(ReconcileStage::ReadingBack))?;
        for contact in fetched.into_iter().flatten() {
            secondaries.entry(contact.id).or_insert(contact);
        }
        secondaries.remove(&canonical);

        let mut secondaries: Vec<Contact> = secondaries.into_values().collect();
        sort_by_creation(&mut secondaries);
        Ok(secondaries)
    }
}

fn log_failure(err: &ReconcileError) {
    match err {
        ReconcileError::Validation(_) => {}
        other => warn!(stage = %other.stage(), error = %other, "reconciliation failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;
    use crate::model::LinkPrecedence;
    use crate::store::MemoryContactRepository;

    fn reconciler() -> Reconciler<MemoryContactRepository> {
        Reconciler::new(MemoryContactRepository::new())
    }

    #[tokio::test]
    async fn new_identity_creates_primary() -> anyhow::Result<()> {
        let engine = reconciler();
        let resolution = engine.reconcile(Some("a@x.com"), Some("111")).await?;

        assert_eq!(resolution.primary.link_precedence, LinkPrecedence::Primary);
        assert_eq!(resolution.primary.linked_id, None);
        assert_eq!(resolution.primary.email.as_deref(), Some("a@x.com"));
        assert!(resolution.secondaries.is_empty());
        assert_eq!(resolution.created, Some(resolution.primary.id));
        assert_eq!(engine.repository().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn exact_repeat_is_idempotent() -> anyhow::Result<()> {
        let engine = reconciler();
        let first = engine.reconcile(Some("a@x.com"), Some("111")).await?;
        let second = engine.reconcile(Some("a@x.com"), Some("111")).await?;

        assert_eq!(first.primary.id, second.primary.id);
        assert_eq!(second.created, None);
        assert!(second.secondaries.is_empty());
        assert_eq!(engine.repository().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn subset_observation_adds_nothing() -> anyhow::Result<()> {
        let engine = reconciler();
        engine.reconcile(Some("a@x.com"), Some("111")).await?;
        let resolution = engine.reconcile(None, Some("111")).await?;
        assert_eq!(resolution.created, None);
        let resolution = engine.reconcile(Some("a@x.com"), Some("")).await?;
        assert_eq!(resolution.created, None);
        assert_eq!(engine.repository().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn validation_rejects_before_store_access() {
        let engine = reconciler();
        let err = engine.reconcile(None, None).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Validation(ValidationError::MissingIdentity)
        ));

        let err = engine
            .reconcile(None, Some("a string over 15 characters"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::Validation(ValidationError::PhoneTooLong { .. })
        ));
        assert!(engine.repository().is_empty());
    }

    #[tokio::test]
    async fn key_locking_can_be_disabled() -> anyhow::Result<()> {
        let config = ReconcileConfig {
            key_locking: false,
            ..ReconcileConfig::default()
        };
        let engine = Reconciler::with_config(MemoryContactRepository::new(), &config);
        assert!(engine.locks.is_none());
        let resolution = engine.reconcile(Some("a@x.com"), None).await?;
        assert!(resolution.primary.is_primary());
        Ok(())
    }
}
