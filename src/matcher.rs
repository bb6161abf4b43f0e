//! # Matcher Module
//!
//! Finds every stored contact sharing the observation's email or phone.

use crate::error::RepositoryError;
use crate::model::{Contact, Observation};
use crate::repository::ContactRepository;

/// Contacts touching an observation, ordered by creation.
#[derive(Debug, Clone, Default)]
pub struct MatchSet {
    pub contacts: Vec<Contact>,
    /// Some matched contact already carries the observed email.
    /// Vacuously true when the observation has no email.
    pub email_seen: bool,
    /// Same as `email_seen`, for the phone number.
    pub phone_seen: bool,
}

impl MatchSet {
    pub fn from_contacts(observation: &Observation, contacts: Vec<Contact>) -> Self {
        let email_seen = match observation.email() {
            Some(email) => contacts.iter().any(|c| c.email.as_deref() == Some(email)),
            None => true,
        };
        let phone_seen = match observation.phone_number() {
            Some(phone) => contacts
                .iter()
                .any(|c| c.phone_number.as_deref() == Some(phone)),
            None => true,
        };
        Self {
            contacts,
            email_seen,
            phone_seen,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.contacts.is_empty()
    }

    /// The observation adds a value the cluster has not recorded yet.
    pub fn has_new_information(&self) -> bool {
        !self.email_seen || !self.phone_seen
    }

    pub fn primaries(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter().filter(|c| c.is_primary())
    }

    pub fn secondaries(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.iter().filter(|c| !c.is_primary())
    }
}

/// Look up every contact whose email or phone equals the observation's.
pub async fn match_contacts<R>(repo: &R, observation: &Observation) -> Result<MatchSet, RepositoryError>
where
    R: ContactRepository + ?Sized,
{
    let contacts = repo
        .find_by_email_or_phone(observation.email(), observation.phone_number())
        .await?;
    Ok(MatchSet::from_contacts(observation, contacts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LinkPrecedence, NewContact, ObservationLimits};
    use crate::store::MemoryContactRepository;

    fn observe(email: Option<&str>, phone: Option<&str>) -> Observation {
        Observation::parse(email, phone, &ObservationLimits::default()).unwrap()
    }

    #[tokio::test]
    async fn flags_track_each_value() -> anyhow::Result<()> {
        let repo = MemoryContactRepository::new();
        let primary = repo
            .insert(NewContact::primary(&observe(Some("a@x.com"), Some("111"))))
            .await?;
        repo.insert(NewContact {
            email: Some("b@x.com".to_string()),
            phone_number: Some("222".to_string()),
            link_precedence: LinkPrecedence::Secondary,
            linked_id: Some(primary.id),
        })
        .await?;

        let matched = match_contacts(&repo, &observe(Some("a@x.com"), Some("222"))).await?;
        assert_eq!(matched.contacts.len(), 2);
        assert!(matched.email_seen);
        assert!(matched.phone_seen);
        assert!(!matched.has_new_information());
        assert_eq!(matched.primaries().count(), 1);
        assert_eq!(matched.secondaries().count(), 1);

        let matched = match_contacts(&repo, &observe(Some("b@x.com"), Some("999"))).await?;
        assert_eq!(matched.contacts.len(), 1);
        assert!(matched.email_seen);
        assert!(!matched.phone_seen);
        assert!(matched.has_new_information());
        Ok(())
    }

    #[tokio::test]
    async fn missing_value_is_vacuously_seen() -> anyhow::Result<()> {
        let repo = MemoryContactRepository::new();
        repo.insert(NewContact::primary(&observe(Some("a@x.com"), Some("111"))))
            .await?;

        let matched = match_contacts(&repo, &observe(Some("a@x.com"), None)).await?;
        assert!(matched.phone_seen);
        assert!(!matched.has_new_information());

        let empty = match_contacts(&repo, &observe(Some("nobody@x.com"), None)).await?;
        assert!(empty.is_empty());
        assert!(!empty.email_seen);
        Ok(())
    }
}
