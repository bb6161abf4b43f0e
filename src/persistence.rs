//! # Persistence Module
//!
//! RocksDB-backed contact repository. Contacts live in one column family keyed
//! by big-endian id; email, phone and linked-id lookups go through key-only
//! index column families that are rewritten in the same batch as the row.

use crate::error::RepositoryError;
use crate::model::{Contact, ContactId, ContactPatch, NewContact};
use crate::repository::{sort_by_creation, ContactRepository, RepositoryResult};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;
use rocksdb::{
    checkpoint::Checkpoint, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch,
    DB,
};
use std::collections::BTreeSet;
use std::num::NonZeroUsize;
use std::path::Path;
use time::OffsetDateTime;

const CF_CONTACTS: &str = "contacts";
const CF_METADATA: &str = "metadata";
const CF_INDEX_EMAIL: &str = "index_email";
const CF_INDEX_PHONE: &str = "index_phone";
const CF_INDEX_LINKED: &str = "index_linked";

const KEY_NEXT_CONTACT_ID: &[u8] = b"next_contact_id";
const KEY_LAST_STAMP: &[u8] = b"last_stamp";
const KEY_MANIFEST: &[u8] = b"manifest";

const STORAGE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

#[derive(Debug, Clone, Copy)]
pub struct PersistentOpenOptions {
    pub repair: bool,
    pub cache_capacity: usize,
}

impl Default for PersistentOpenOptions {
    fn default() -> Self {
        Self {
            repair: false,
            cache_capacity: crate::config::DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// Allocation state guarded by the write mutex.
struct WriteState {
    next_contact_id: u64,
    last_stamp: OffsetDateTime,
}

pub struct PersistentContactRepository {
    db: DB,
    cache: Mutex<LruCache<ContactId, Contact>>,
    /// Serializes row writes so id allocation and read-modify-write updates
    /// are atomic per row.
    writer: Mutex<WriteState>,
}

impl PersistentContactRepository {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_options(path, PersistentOpenOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: PersistentOpenOptions,
    ) -> Result<Self> {
        if options.repair {
            repair_db(path.as_ref())?;
        }
        let db = open_db(path)?;
        validate_or_init_manifest(&db)?;

        let next_contact_id = load_metadata::<u64>(&db, KEY_NEXT_CONTACT_ID)?.unwrap_or(1);
        let last_stamp =
            load_metadata::<OffsetDateTime>(&db, KEY_LAST_STAMP)?.unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let capacity = NonZeroUsize::new(options.cache_capacity)
            .ok_or_else(|| anyhow!("cache capacity must be non-zero"))?;

        Ok(Self {
            db,
            cache: Mutex::new(LruCache::new(capacity)),
            writer: Mutex::new(WriteState {
                next_contact_id,
                last_stamp,
            }),
        })
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    pub fn checkpoint(&self, path: impl AsRef<Path>) -> Result<()> {
        let checkpoint = Checkpoint::new(&self.db)?;
        checkpoint.create_checkpoint(path)?;
        Ok(())
    }

    /// Number of stored contacts, derived from the id sequence.
    pub fn len(&self) -> usize {
        (self.writer.lock().next_contact_id - 1) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every stored contact, ordered by id.
    pub fn all_contacts(&self) -> Result<Vec<Contact>> {
        let contacts_cf = cf(&self.db, CF_CONTACTS)?;
        let mut contacts = Vec::new();
        for entry in self.db.iterator_cf(contacts_cf, IteratorMode::Start) {
            let (_key, value) = entry?;
            contacts.push(bincode::deserialize(&value)?);
        }
        Ok(contacts)
    }

    fn load_contact(&self, id: ContactId) -> Result<Option<Contact>> {
        if let Some(contact) = self.cache.lock().get(&id) {
            return Ok(Some(contact.clone()));
        }

        // Fill under the write mutex so a concurrent write cannot be
        // overwritten in the cache by the bytes read before it.
        let _writer = self.writer.lock();
        let contact = self.read_row(id)?;
        if let Some(contact) = &contact {
            self.cache.lock().put(id, contact.clone());
        }
        Ok(contact)
    }

    /// The row as stored on disk, bypassing the cache.
    fn read_row(&self, id: ContactId) -> Result<Option<Contact>> {
        let contacts_cf = cf(&self.db, CF_CONTACTS)?;
        let Some(bytes) = self.db.get_cf(contacts_cf, id.0.to_be_bytes())? else {
            return Ok(None);
        };
        Ok(Some(bincode::deserialize(&bytes)?))
    }

    fn load_contacts(&self, ids: impl IntoIterator<Item = ContactId>) -> Result<Vec<Contact>> {
        let mut contacts = Vec::new();
        for id in ids {
            if let Some(contact) = self.load_contact(id)? {
                contacts.push(contact);
            }
        }
        Ok(contacts)
    }

    fn scan_index(&self, cf_name: &str, prefix: &[u8]) -> Result<Vec<ContactId>> {
        let index_cf = cf(&self.db, cf_name)?;
        let iter = self
            .db
            .iterator_cf(index_cf, IteratorMode::From(prefix, Direction::Forward));
        let mut ids = Vec::new();
        for entry in iter {
            let (key, _) = entry?;
            if !key.starts_with(prefix) {
                break;
            }
            if let Some(id) = decode_trailing_id(&key, prefix.len()) {
                ids.push(ContactId(id));
            }
        }
        Ok(ids)
    }

    /// Write a row together with its index entries. `previous` is the row as it
    /// was before, used to drop index entries that no longer apply.
    fn write_contact(
        &self,
        contact: &Contact,
        previous: Option<&Contact>,
        state: &WriteState,
    ) -> Result<()> {
        let contacts_cf = cf(&self.db, CF_CONTACTS)?;
        let email_cf = cf(&self.db, CF_INDEX_EMAIL)?;
        let phone_cf = cf(&self.db, CF_INDEX_PHONE)?;
        let linked_cf = cf(&self.db, CF_INDEX_LINKED)?;
        let metadata_cf = cf(&self.db, CF_METADATA)?;

        let mut batch = WriteBatch::default();
        let id = contact.id.0;
        batch.put_cf(contacts_cf, id.to_be_bytes(), bincode::serialize(contact)?);

        if let Some(previous) = previous {
            if let Some(linked_id) = previous.linked_id {
                if previous.linked_id != contact.linked_id {
                    batch.delete_cf(linked_cf, encode_linked_index(linked_id.0, id));
                }
            }
        } else {
            if let Some(email) = &contact.email {
                batch.put_cf(email_cf, encode_string_index(email, id), []);
            }
            if let Some(phone) = &contact.phone_number {
                batch.put_cf(phone_cf, encode_string_index(phone, id), []);
            }
        }
        if let Some(linked_id) = contact.linked_id {
            batch.put_cf(linked_cf, encode_linked_index(linked_id.0, id), []);
        }

        batch.put_cf(
            metadata_cf,
            KEY_NEXT_CONTACT_ID,
            bincode::serialize(&state.next_contact_id)?,
        );
        batch.put_cf(
            metadata_cf,
            KEY_LAST_STAMP,
            bincode::serialize(&state.last_stamp)?,
        );

        self.db.write(batch)?;
        self.cache.lock().put(contact.id, contact.clone());
        Ok(())
    }

    fn insert_blocking(&self, new: NewContact) -> Result<Contact> {
        let mut state = self.writer.lock();
        let id = ContactId(state.next_contact_id);
        let now = OffsetDateTime::now_utc().max(state.last_stamp);
        let contact = Contact::from_new(id, new, now);

        let next = WriteState {
            next_contact_id: state.next_contact_id + 1,
            last_stamp: now,
        };
        self.write_contact(&contact, None, &next)?;
        *state = next;
        Ok(contact)
    }

    fn update_blocking(&self, id: ContactId, patch: ContactPatch) -> Result<Option<Contact>> {
        let mut state = self.writer.lock();
        let Some(previous) = self.read_row(id)? else {
            return Ok(None);
        };
        let now = OffsetDateTime::now_utc().max(state.last_stamp);
        let mut contact = previous.clone();
        if !patch.apply(&mut contact, now) {
            return Ok(Some(previous));
        }

        let next = WriteState {
            next_contact_id: state.next_contact_id,
            last_stamp: now,
        };
        self.write_contact(&contact, Some(&previous), &next)?;
        *state = next;
        Ok(Some(contact))
    }
}

#[async_trait]
impl ContactRepository for PersistentContactRepository {
    async fn insert(&self, contact: NewContact) -> RepositoryResult<Contact> {
        Ok(self.insert_blocking(contact)?)
    }

    async fn find_by_id(&self, id: ContactId) -> RepositoryResult<Option<Contact>> {
        Ok(self.load_contact(id)?)
    }

    async fn find_by_linked_id(&self, id: ContactId) -> RepositoryResult<Vec<Contact>> {
        let ids = self.scan_index(CF_INDEX_LINKED, &id.0.to_be_bytes())?;
        let contacts = self.load_contacts(ids)?;
        // The index may briefly trail a concurrent relink; trust the row.
        Ok(contacts
            .into_iter()
            .filter(|contact| contact.linked_id == Some(id))
            .collect())
    }

    async fn find_by_email_or_phone(
        &self,
        email: Option<&str>,
        phone_number: Option<&str>,
    ) -> RepositoryResult<Vec<Contact>> {
        let mut ids = BTreeSet::new();
        if let Some(email) = email {
            ids.extend(self.scan_index(CF_INDEX_EMAIL, &encode_string_prefix(email))?);
        }
        if let Some(phone) = phone_number {
            ids.extend(self.scan_index(CF_INDEX_PHONE, &encode_string_prefix(phone))?);
        }
        let mut contacts = self.load_contacts(ids)?;
        sort_by_creation(&mut contacts);
        Ok(contacts)
    }

    async fn update(&self, id: ContactId, patch: ContactPatch) -> RepositoryResult<Contact> {
        self.update_blocking(id, patch)?
            .ok_or(RepositoryError::NotFound(id))
    }
}

impl Drop for PersistentContactRepository {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn cf<'a>(db: &'a DB, name: &str) -> Result<&'a rocksdb::ColumnFamily> {
    db.cf_handle(name)
        .ok_or_else(|| anyhow!("missing column family {name}"))
}

fn open_db(path: impl AsRef<Path>) -> Result<DB> {
    let mut options = Options::default();
    options.create_if_missing(true);
    options.create_missing_column_families(true);
    options.set_paranoid_checks(true);
    let cfs = vec![
        ColumnFamilyDescriptor::new(CF_CONTACTS, Options::default()),
        ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
        ColumnFamilyDescriptor::new(CF_INDEX_EMAIL, Options::default()),
        ColumnFamilyDescriptor::new(CF_INDEX_PHONE, Options::default()),
        ColumnFamilyDescriptor::new(CF_INDEX_LINKED, Options::default()),
    ];
    Ok(DB::open_cf_descriptors(&options, path, cfs)?)
}

fn repair_db(path: &Path) -> Result<()> {
    let mut options = Options::default();
    options.create_if_missing(true);
    DB::repair(&options, path)?;
    Ok(())
}

// Strings are NUL-terminated so that "a@x.com" never prefix-matches "a@x.com.au".
fn encode_string_prefix(value: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(value.len() + 1);
    key.extend_from_slice(value.as_bytes());
    key.push(0);
    key
}

fn encode_string_index(value: &str, contact_id: u64) -> Vec<u8> {
    let mut key = encode_string_prefix(value);
    key.extend_from_slice(&contact_id.to_be_bytes());
    key
}

fn encode_linked_index(linked_id: u64, contact_id: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(16);
    key.extend_from_slice(&linked_id.to_be_bytes());
    key.extend_from_slice(&contact_id.to_be_bytes());
    key
}

fn decode_trailing_id(key: &[u8], prefix_len: usize) -> Option<u64> {
    if key.len() != prefix_len + 8 {
        return None;
    }
    Some(u64::from_be_bytes(key[prefix_len..].try_into().ok()?))
}

fn validate_or_init_manifest(db: &DB) -> Result<()> {
    let metadata_cf = cf(db, CF_METADATA)?;
    if let Some(bytes) = db.get_cf(metadata_cf, KEY_MANIFEST)? {
        let manifest: StorageManifest = bincode::deserialize(&bytes)?;
        if manifest.format_version != STORAGE_FORMAT_VERSION {
            return Err(anyhow!(
                "storage format version mismatch: expected {}, found {}",
                STORAGE_FORMAT_VERSION,
                manifest.format_version
            ));
        }
        return Ok(());
    }

    let manifest = StorageManifest {
        format_version: STORAGE_FORMAT_VERSION,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    let bytes = bincode::serialize(&manifest)?;
    db.put_cf(metadata_cf, KEY_MANIFEST, bytes)?;
    Ok(())
}

fn load_metadata<T: serde::de::DeserializeOwned>(db: &DB, key: &[u8]) -> Result<Option<T>> {
    let metadata_cf = cf(db, CF_METADATA)?;
    if let Some(bytes) = db.get_cf(metadata_cf, key)? {
        Ok(Some(bincode::deserialize(&bytes)?))
    } else {
        Ok(None)
    }
}
