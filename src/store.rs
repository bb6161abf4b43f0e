//! # Store Module
//!
//! In-process contact repository with email, phone and linked-id indexes.

use crate::error::RepositoryError;
use crate::model::{Contact, ContactId, ContactPatch, NewContact};
use crate::repository::{sort_by_creation, ContactRepository, RepositoryResult};
use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};
use time::OffsetDateTime;

#[derive(Debug)]
struct Inner {
    /// All contacts indexed by ID
    contacts: BTreeMap<ContactId, Contact>,
    by_email: HashMap<String, BTreeSet<ContactId>>,
    by_phone: HashMap<String, BTreeSet<ContactId>>,
    by_linked: HashMap<ContactId, BTreeSet<ContactId>>,
    /// Next available contact ID
    next_contact_id: u64,
    last_stamp: OffsetDateTime,
}

impl Inner {
    fn new() -> Self {
        Self {
            contacts: BTreeMap::new(),
            by_email: HashMap::new(),
            by_phone: HashMap::new(),
            by_linked: HashMap::new(),
            next_contact_id: 1,
            last_stamp: OffsetDateTime::UNIX_EPOCH,
        }
    }

    /// Wall-clock time, never earlier than any timestamp handed out before.
    fn stamp(&mut self) -> OffsetDateTime {
        let now = OffsetDateTime::now_utc().max(self.last_stamp);
        self.last_stamp = now;
        now
    }

    fn index(&mut self, contact: &Contact) {
        if let Some(email) = &contact.email {
            self.by_email.entry(email.clone()).or_default().insert(contact.id);
        }
        if let Some(phone) = &contact.phone_number {
            self.by_phone.entry(phone.clone()).or_default().insert(contact.id);
        }
        if let Some(linked_id) = contact.linked_id {
            self.by_linked.entry(linked_id).or_default().insert(contact.id);
        }
    }

    fn unlink(&mut self, contact: &Contact) {
        if let Some(linked_id) = contact.linked_id {
            if let Some(children) = self.by_linked.get_mut(&linked_id) {
                children.remove(&contact.id);
                if children.is_empty() {
                    self.by_linked.remove(&linked_id);
                }
            }
        }
    }

    fn collect(&self, ids: impl IntoIterator<Item = ContactId>) -> Vec<Contact> {
        ids.into_iter()
            .filter_map(|id| self.contacts.get(&id).cloned())
            .collect()
    }
}

/// Contact repository held entirely in memory.
///
/// Every operation takes the lock once, so each single-row write is atomic.
#[derive(Debug)]
pub struct MemoryContactRepository {
    inner: RwLock<Inner>,
}

impl MemoryContactRepository {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::new()),
        }
    }

    /// Snapshot of every stored contact, ordered by id.
    pub fn all_contacts(&self) -> Vec<Contact> {
        self.inner.read().contacts.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().contacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().contacts.is_empty()
    }
}

impl Default for MemoryContactRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContactRepository for MemoryContactRepository {
    async fn insert(&self, contact: NewContact) -> RepositoryResult<Contact> {
        let mut inner = self.inner.write();
        let id = ContactId(inner.next_contact_id);
        inner.next_contact_id += 1;
        let now = inner.stamp();
        let stored = Contact::from_new(id, contact, now);
        inner.index(&stored);
        inner.contacts.insert(id, stored.clone());
        Ok(stored)
    }

    async fn find_by_id(&self, id: ContactId) -> RepositoryResult<Option<Contact>> {
        Ok(self.inner.read().contacts.get(&id).cloned())
    }

    async fn find_by_linked_id(&self, id: ContactId) -> RepositoryResult<Vec<Contact>> {
        let inner = self.inner.read();
        let children = inner
            .by_linked
            .get(&id)
            .map(|ids| inner.collect(ids.iter().copied()))
            .unwrap_or_default();
        Ok(children)
    }

    async fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> RepositoryResult<Vec<Contact>> {
        let inner = self.inner.read();
        let mut ids = BTreeSet::new();
        if let Some(matched) = email.and_then(|email| inner.by_email.get(email)) {
            ids.extend(matched.iter().copied());
        }
        if let Some(matched) = phone_number.and_then(|phone| inner.by_phone.get(phone)) {
            ids.extend(matched.iter().copied());
        }
        let mut contacts = inner.collect(ids);
        sort_by_creation(&mut contacts);
        Ok(contacts)
    }

    async fn update(&self, id: ContactId, patch: ContactPatch) -> RepositoryResult<Contact> {
        let mut inner = self.inner.write();
        let mut contact = inner
            .contacts
            .get(&id)
            .cloned()
            .ok_or(RepositoryError::NotFound(id))?;
        let now = inner.stamp();
        let previous = contact.clone();
        if patch.apply(&mut contact, now) {
            inner.unlink(&previous);
            inner.index(&contact);
            inner.contacts.insert(id, contact.clone());
        }
        Ok(contact)
    }
}
