//! # Mutation Planner
//!
//! Decides which rows a reconciliation writes and issues those writes.
//!
//! Every planned write targets a different row, so the whole plan is executed
//! as one fan-out: all writes are started together and awaited together, and
//! the first failure fails the plan.

use crate::error::{ReconcileError, ReconcileStage};
use crate::matcher::MatchSet;
use crate::model::{Contact, ContactId, ContactPatch, NewContact, Observation};
use crate::repository::ContactRepository;
use crate::resolver::ClusterResolution;
use futures::future::try_join_all;
use tracing::debug;

/// Writes needed to bring a resolved cluster into shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutationPlan {
    pub canonical: ContactId,
    /// Inserted when the observation carries a value the cluster lacks
    pub new_secondary: Option<NewContact>,
    /// Former primaries: become secondaries of `canonical`
    pub demotions: Vec<ContactId>,
    /// Secondaries of demoted primaries: relinked to `canonical`
    pub reparents: Vec<ContactId>,
    /// Every other known member: relinked unless already pointing at `canonical`
    pub sweeps: Vec<ContactId>,
}

impl MutationPlan {
    pub fn build(
        observation: &Observation,
        matches: &MatchSet,
        resolution: &ClusterResolution,
    ) -> Self {
        let canonical = resolution.canonical.id;
        let new_secondary = matches
            .has_new_information()
            .then(|| NewContact::secondary(observation, canonical));

        let demoted = resolution.demoted_ids();
        let demotions: Vec<ContactId> = resolution.demoted.iter().map(|c| c.id).collect();

        let mut reparents = Vec::new();
        let mut sweeps = Vec::new();
        for (id, member) in &resolution.members {
            if demoted.contains(id) {
                continue;
            }
            match member.linked_id {
                Some(linked_id) if demoted.contains(&linked_id) => reparents.push(*id),
                _ => sweeps.push(*id),
            }
        }

        Self {
            canonical,
            new_secondary,
            demotions,
            reparents,
            sweeps,
        }
    }

    /// Update writes in the plan, one per target row.
    pub fn updates(&self) -> Vec<(ContactId, ContactPatch)> {
        let canonical = self.canonical;
        self.demotions
            .iter()
            .map(|id| (*id, ContactPatch::demote_to(canonical)))
            .chain(
                self.reparents
                    .iter()
                    .map(|id| (*id, ContactPatch::relink_to(canonical))),
            )
            .chain(
                self.sweeps
                    .iter()
                    .map(|id| (*id, ContactPatch::sweep_to(canonical))),
            )
            .collect()
    }

    pub fn write_count(&self) -> usize {
        usize::from(self.new_secondary.is_some())
            + self.demotions.len()
            + self.reparents.len()
            + self.sweeps.len()
    }
}

/// Rows as returned by the repository after the plan ran.
#[derive(Debug, Clone, Default)]
pub struct AppliedPlan {
    pub inserted: Option<Contact>,
    pub updated: Vec<Contact>,
}

/// Issue every write in `plan` concurrently and wait for all of them.
pub async fn apply_plan<R>(repo: &R, plan: &MutationPlan) -> Result<AppliedPlan, ReconcileError>
where
    R: ContactRepository + ?Sized,
{
    debug!(
        canonical = %plan.canonical,
        insert = plan.new_secondary.is_some(),
        demotions = plan.demotions.len(),
        reparents = plan.reparents.len(),
        sweeps = plan.sweeps.len(),
        "applying mutation plan"
    );

    let insert = async {
        match &plan.new_secondary {
            Some(contact) => repo.insert(contact.clone()).await.map(Some),
            None => Ok(None),
        }
    };
    let updates = try_join_all(
        plan.updates()
            .into_iter()
            .map(|(id, patch)| repo.update(id, patch)),
    );

    let (inserted, updated) = futures::try_join!(insert, updates)
        .map_err(ReconcileError::repository(ReconcileStage::Writing))?;

    Ok(AppliedPlan { inserted, updated })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LinkPrecedence, ObservationLimits};
    use std::collections::BTreeMap;
    use time::OffsetDateTime;

    fn contact(id: u64, email: &str, phone: &str, linked_id: Option<u64>) -> Contact {
        let created_at = OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(id as i64);
        Contact {
            id: ContactId(id),
            email: Some(email.to_string()),
            phone_number: Some(phone.to_string()),
            linked_id: linked_id.map(ContactId),
            link_precedence: if linked_id.is_some() {
                LinkPrecedence::Secondary
            } else {
                LinkPrecedence::Primary
            },
            created_at,
            updated_at: created_at,
            deleted_at: None,
        }
    }

    fn observe(email: Option<&str>, phone: Option<&str>) -> Observation {
        Observation::parse(email, phone, &ObservationLimits::default()).unwrap()
    }

    fn resolution(canonical: Contact, demoted: Vec<Contact>, members: Vec<Contact>) -> ClusterResolution {
        let mut all: BTreeMap<ContactId, Contact> =
            members.into_iter().map(|c| (c.id, c)).collect();
        for contact in &demoted {
            all.insert(contact.id, contact.clone());
        }
        ClusterResolution {
            canonical,
            demoted,
            members: all,
        }
    }

    #[test]
    fn exact_repeat_plans_no_insert() {
        let p1 = contact(1, "a@x.com", "111", None);
        let observation = observe(Some("a@x.com"), Some("111"));
        let matches = MatchSet::from_contacts(&observation, vec![p1.clone()]);
        let plan = MutationPlan::build(&observation, &matches, &resolution(p1, vec![], vec![]));

        assert_eq!(plan.new_secondary, None);
        assert_eq!(plan.write_count(), 0);
    }

    #[test]
    fn novel_phone_plans_one_secondary() {
        let p1 = contact(1, "a@x.com", "111", None);
        let observation = observe(Some("a@x.com"), Some("222"));
        let matches = MatchSet::from_contacts(&observation, vec![p1.clone()]);
        let plan = MutationPlan::build(&observation, &matches, &resolution(p1, vec![], vec![]));

        let new = plan.new_secondary.expect("secondary planned");
        assert_eq!(new.link_precedence, LinkPrecedence::Secondary);
        assert_eq!(new.linked_id, Some(ContactId(1)));
        assert_eq!(new.email.as_deref(), Some("a@x.com"));
        assert_eq!(new.phone_number.as_deref(), Some("222"));
    }

    #[test]
    fn merge_plans_demotion_reparent_and_sweep() {
        let p1 = contact(1, "a@x.com", "111", None);
        let s1 = contact(2, "a2@x.com", "111", Some(1));
        let p2 = contact(3, "b@y.com", "222", None);
        let s2 = contact(4, "b2@y.com", "222", Some(3));
        let observation = observe(Some("a@x.com"), Some("222"));
        let matches = MatchSet::from_contacts(
            &observation,
            vec![p1.clone(), s1.clone(), p2.clone(), s2.clone()],
        );
        let plan = MutationPlan::build(
            &observation,
            &matches,
            &resolution(p1, vec![p2], vec![s1, s2]),
        );

        assert_eq!(plan.new_secondary, None);
        assert_eq!(plan.demotions, vec![ContactId(3)]);
        assert_eq!(plan.reparents, vec![ContactId(4)]);
        assert_eq!(plan.sweeps, vec![ContactId(2)]);

        let updates = plan.updates();
        assert_eq!(updates.len(), 3);
        assert!(updates.contains(&(ContactId(3), ContactPatch::demote_to(ContactId(1)))));
        assert!(updates.contains(&(ContactId(2), ContactPatch::sweep_to(ContactId(1)))));
    }
}
