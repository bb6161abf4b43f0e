//! # Repository Module
//!
//! Record-oriented interface over the contact store. Implementations give
//! single-row atomicity only: no operation spans more than one contact.

use crate::error::RepositoryError;
use crate::model::{Contact, ContactId, ContactPatch, NewContact};
use async_trait::async_trait;
use std::sync::Arc;

pub type RepositoryResult<T> = Result<T, RepositoryError>;

#[async_trait]
pub trait ContactRepository: Send + Sync {
    /// Insert a contact; the store assigns the id and both timestamps.
    async fn insert(&self, contact: NewContact) -> RepositoryResult<Contact>;

    async fn find_by_id(&self, id: ContactId) -> RepositoryResult<Option<Contact>>;

    /// Every contact whose `linked_id` equals `id`.
    async fn find_by_linked_id(&self, id: ContactId) -> RepositoryResult<Vec<Contact>>;

    /// Every contact whose email equals `email` or whose phone equals `phone_number`,
    /// ordered by `(created_at, id)` ascending. An absent argument matches nothing.
    async fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> RepositoryResult<Vec<Contact>>;

    /// Apply `patch` to one row and return the row as stored afterwards.
    /// Fails with [`RepositoryError::NotFound`] for unknown ids.
    async fn update(&self, id: ContactId, patch: ContactPatch) -> RepositoryResult<Contact>;
}

#[async_trait]
impl<R> ContactRepository for Arc<R>
where
    R: ContactRepository + ?Sized,
{
    async fn insert(&self, contact: NewContact) -> RepositoryResult<Contact> {
        (**self).insert(contact).await
    }

    async fn find_by_id(&self, id: ContactId) -> RepositoryResult<Option<Contact>> {
        (**self).find_by_id(id).await
    }

    async fn find_by_linked_id(&self, id: ContactId) -> RepositoryResult<Vec<Contact>> {
        (**self).find_by_linked_id(id).await
    }

    async fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> RepositoryResult<Vec<Contact>> {
        (**self).find_by_email_or_phone(email, phone_number).await
    }

    async fn update(&self, id: ContactId, patch: ContactPatch) -> RepositoryResult<Contact> {
        (**self).update(id, patch).await
    }
}

/// Sort contacts into the order `find_by_email_or_phone` promises.
pub fn sort_by_creation(contacts: &mut [Contact]) {
    contacts.sort_by_key(Contact::primacy_key);
}
