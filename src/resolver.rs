//! # Cluster Resolver
//!
//! Turns a match set, which may touch several existing clusters, into one
//! merged cluster: the canonical primary, the primaries that lose their role,
//! and every contact known to belong to the result.
//!
//! Every matched contact contributes the root primary of its cluster, found by
//! following `linked_id` until a primary is reached. The earliest-created root
//! becomes canonical.

use crate::error::{ReconcileError, ReconcileStage};
use crate::matcher::MatchSet;
use crate::model::{Contact, ContactId};
use crate::repository::ContactRepository;
use futures::future::try_join_all;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

/// Outcome of resolving a non-empty match set.
#[derive(Debug, Clone)]
pub struct ClusterResolution {
    pub canonical: Contact,
    /// Former primaries absorbed into `canonical`, in primacy order
    pub demoted: Vec<Contact>,
    /// Every known member of the merged cluster except `canonical`, demoted
    /// primaries included
    pub members: BTreeMap<ContactId, Contact>,
}

impl ClusterResolution {
    pub fn is_merge(&self) -> bool {
        !self.demoted.is_empty()
    }

    pub fn demoted_ids(&self) -> HashSet<ContactId> {
        self.demoted.iter().map(|contact| contact.id).collect()
    }

    /// Roots of every cluster this resolution rewrites: the canonical primary
    /// and each demoted one.
    pub fn root_ids(&self) -> Vec<ContactId> {
        std::iter::once(self.canonical.id)
            .chain(self.demoted.iter().map(|contact| contact.id))
            .collect()
    }
}

/// Resolve the merged cluster for `matches`.
///
/// Returns `Ok(None)` for an empty match set. Fails with
/// [`ReconcileError::BrokenCluster`] when contacts were matched but none of
/// them leads to a primary.
pub async fn resolve_cluster<R>(
    repo: &R,
    matches: &MatchSet,
) -> Result<Option<ClusterResolution>, ReconcileError>
where
    R: ContactRepository + ?Sized,
{
    if matches.is_empty() {
        return Ok(None);
    }

    let mut members: BTreeMap<ContactId, Contact> = matches
        .contacts
        .iter()
        .map(|contact| (contact.id, contact.clone()))
        .collect();
    let mut candidates: BTreeMap<ContactId, Contact> = matches
        .primaries()
        .map(|contact| (contact.id, contact.clone()))
        .collect();

    let first_match = &matches.contacts[0];
    let mut orphan: Option<&Contact> = None;
    for secondary in matches.secondaries() {
        match find_root(repo, secondary, &mut members).await? {
            Some(root) => {
                candidates.entry(root.id).or_insert(root);
            }
            None => {
                warn!(contact = %secondary.id, linked_id = ?secondary.linked_id, "secondary has no reachable primary");
                orphan.get_or_insert(secondary);
            }
        }
    }

    let Some(canonical_id) = candidates
        .values()
        .min_by_key(|contact| contact.primacy_key())
        .map(|contact| contact.id)
    else {
        // Matches exist, but none of them is or leads to a primary.
        let broken = orphan.unwrap_or(first_match);
        return Err(ReconcileError::BrokenCluster {
            contact_id: broken.id,
            linked_id: broken.linked_id,
        });
    };
    let canonical = candidates
        .remove(&canonical_id)
        .ok_or(ReconcileError::BrokenCluster {
            contact_id: canonical_id,
            linked_id: None,
        })?;

    let mut demoted: Vec<Contact> = candidates.into_values().collect();
    demoted.sort_by_key(Contact::primacy_key);
    for contact in &demoted {
        members.insert(contact.id, contact.clone());
    }

    expand_members(repo, &canonical, &mut members).await?;
    members.remove(&canonical.id);

    debug!(
        canonical = %canonical.id,
        demoted = demoted.len(),
        members = members.len(),
        "cluster resolved"
    );

    Ok(Some(ClusterResolution {
        canonical,
        demoted,
        members,
    }))
}

/// Follow `linked_id` from `start` to its cluster's primary. Contacts fetched on
/// the way are recorded in `members`. Returns `None` when the chain dangles or
/// loops.
async fn find_root<R>(
    repo: &R,
    start: &Contact,
    members: &mut BTreeMap<ContactId, Contact>,
) -> Result<Option<Contact>, ReconcileError>
where
    R: ContactRepository + ?Sized,
{
    let mut visited = HashSet::from([start.id]);
    let mut current = start.clone();

    while !current.is_primary() {
        let Some(next_id) = current.linked_id else {
            return Ok(None);
        };
        if !visited.insert(next_id) {
            return Ok(None);
        }
        let next = match members.get(&next_id) {
            Some(known) => known.clone(),
            None => {
                let fetched = repo
                    .find_by_id(next_id)
                    .await
                    .map_err(ReconcileError::repository(ReconcileStage::Resolving))?;
                let Some(fetched) = fetched else {
                    return Ok(None);
                };
                members.insert(fetched.id, fetched.clone());
                fetched
            }
        };
        current = next;
    }

    Ok(Some(current))
}

/// Add everything linked, directly or transitively, to the canonical primary or
/// to any known member. Each level of the walk is fetched concurrently.
async fn expand_members<R>(
    repo: &R,
    canonical: &Contact,
    members: &mut BTreeMap<ContactId, Contact>,
) -> Result<(), ReconcileError>
where
    R: ContactRepository + ?Sized,
{
    let mut expanded: HashSet<ContactId> = HashSet::new();
    let mut frontier: Vec<ContactId> = std::iter::once(canonical.id)
        .chain(members.keys().copied())
        .collect();

    while !frontier.is_empty() {
        frontier.retain(|id| expanded.insert(*id));
        let children = try_join_all(frontier.iter().map(|id| repo.find_by_linked_id(*id)))
            .await
            .map_err(ReconcileError::repository(ReconcileStage::Resolving))?;

        frontier = Vec::new();
        for child in children.into_iter().flatten() {
            if child.id == canonical.id || expanded.contains(&child.id) {
                continue;
            }
            frontier.push(child.id);
            members.entry(child.id).or_insert(child);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::match_contacts;
    use crate::model::{LinkPrecedence, NewContact, Observation, ObservationLimits};
    use crate::store::MemoryContactRepository;

    fn observe(email: Option<&str>, phone: Option<&str>) -> Observation {
        Observation::parse(email, phone, &ObservationLimits::default()).unwrap()
    }

    async fn primary(repo: &MemoryContactRepository, email: &str, phone: &str) -> Contact {
        repo.insert(NewContact::primary(&observe(Some(email), Some(phone))))
            .await
            .unwrap()
    }

    async fn secondary(
        repo: &MemoryContactRepository,
        email: &str,
        phone: &str,
        linked_id: ContactId,
    ) -> Contact {
        repo.insert(NewContact {
            email: Some(email.to_string()),
            phone_number: Some(phone.to_string()),
            link_precedence: LinkPrecedence::Secondary,
            linked_id: Some(linked_id),
        })
        .await
        .unwrap()
    }

    async fn resolve(
        repo: &MemoryContactRepository,
        email: Option<&str>,
        phone: Option<&str>,
    ) -> Result<Option<ClusterResolution>, ReconcileError> {
        let matches = match_contacts(repo, &observe(email, phone)).await.unwrap();
        resolve_cluster(repo, &matches).await
    }

    #[tokio::test]
    async fn empty_match_set_has_no_cluster() {
        let repo = MemoryContactRepository::new();
        assert!(resolve(&repo, Some("a@x.com"), None).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn earliest_primary_wins_merge() {
        let repo = MemoryContactRepository::new();
        let p1 = primary(&repo, "a@x.com", "111").await;
        let p2 = primary(&repo, "b@y.com", "222").await;
        let s2 = secondary(&repo, "c@y.com", "222", p2.id).await;

        let resolution = resolve(&repo, Some("a@x.com"), Some("222"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolution.canonical.id, p1.id);
        assert!(resolution.is_merge());
        assert_eq!(resolution.demoted.len(), 1);
        assert_eq!(resolution.demoted[0].id, p2.id);
        assert_eq!(resolution.root_ids(), vec![p1.id, p2.id]);
        assert!(resolution.members.contains_key(&p2.id));
        assert!(resolution.members.contains_key(&s2.id));
        assert!(!resolution.members.contains_key(&p1.id));
    }

    #[tokio::test]
    async fn secondary_only_match_reaches_primary() {
        let repo = MemoryContactRepository::new();
        let p1 = primary(&repo, "a@x.com", "111").await;
        let s1 = secondary(&repo, "b@x.com", "222", p1.id).await;

        let resolution = resolve(&repo, Some("b@x.com"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolution.canonical.id, p1.id);
        assert!(resolution.demoted.is_empty());
        assert!(resolution.members.contains_key(&s1.id));
    }

    #[tokio::test]
    async fn secondary_of_other_cluster_pulls_its_primary_in() {
        let repo = MemoryContactRepository::new();
        let p1 = primary(&repo, "a@x.com", "111").await;
        let p2 = primary(&repo, "b@y.com", "222").await;
        let s2 = secondary(&repo, "c@y.com", "333", p2.id).await;

        // Matches p1 by email and s2 by phone; p2 itself is not matched.
        let resolution = resolve(&repo, Some("a@x.com"), Some("333"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolution.canonical.id, p1.id);
        assert_eq!(resolution.demoted.len(), 1);
        assert_eq!(resolution.demoted[0].id, p2.id);
        assert!(resolution.members.contains_key(&s2.id));
    }

    #[tokio::test]
    async fn stale_two_level_link_is_followed() {
        let repo = MemoryContactRepository::new();
        let p1 = primary(&repo, "a@x.com", "111").await;
        let s1 = secondary(&repo, "b@x.com", "222", p1.id).await;
        let deep = secondary(&repo, "c@x.com", "333", s1.id).await;

        let resolution = resolve(&repo, None, Some("333"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resolution.canonical.id, p1.id);
        assert!(resolution.members.contains_key(&s1.id));
        assert!(resolution.members.contains_key(&deep.id));
    }

    #[tokio::test]
    async fn dangling_secondary_is_broken_cluster() {
        let repo = MemoryContactRepository::new();
        let orphan = secondary(&repo, "a@x.com", "111", ContactId(999)).await;

        let err = resolve(&repo, Some("a@x.com"), None).await.unwrap_err();
        match err {
            ReconcileError::BrokenCluster {
                contact_id,
                linked_id,
            } => {
                assert_eq!(contact_id, orphan.id);
                assert_eq!(linked_id, Some(ContactId(999)));
            }
            other => panic!("expected broken cluster, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn link_cycle_is_broken_cluster() {
        let repo = MemoryContactRepository::new();
        let a = secondary(&repo, "a@x.com", "111", ContactId(2)).await;
        let b = secondary(&repo, "b@x.com", "222", a.id).await;
        assert_eq!(b.id, ContactId(2));

        let err = resolve(&repo, Some("a@x.com"), None).await.unwrap_err();
        assert!(matches!(err, ReconcileError::BrokenCluster { .. }));
    }
}
