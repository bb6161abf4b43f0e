//! # Data Model
//!
//! Core data structures for contact reconciliation.
//! A contact is one stored (email, phone) observation; contacts sharing a
//! primary form a cluster that describes one real-world person.

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Store-assigned identifier for contacts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContactId(pub u64);

impl fmt::Display for ContactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}", self.0)
    }
}

/// Role of a contact inside its cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkPrecedence {
    /// The canonical record of a cluster
    Primary,
    /// A record whose `linked_id` names its cluster's primary
    Secondary,
}

impl fmt::Display for LinkPrecedence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkPrecedence::Primary => write!(f, "primary"),
            LinkPrecedence::Secondary => write!(f, "secondary"),
        }
    }
}

/// A stored contact record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: ContactId,
    pub email: Option<String>,
    pub phone_number: Option<String>,
    /// Id of this record's current primary; `None` for primaries
    pub linked_id: Option<ContactId>,
    pub link_precedence: LinkPrecedence,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    /// Soft-delete marker. Persisted, never consulted by reconciliation.
    pub deleted_at: Option<OffsetDateTime>,
}

impl Contact {
    /// Build a contact from an insert request, stamping both timestamps with `now`.
    pub fn from_new(id: ContactId, new: NewContact, now: OffsetDateTime) -> Self {
        Self {
            id,
            email: new.email,
            phone_number: new.phone_number,
            linked_id: new.linked_id,
            link_precedence: new.link_precedence,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.link_precedence == LinkPrecedence::Primary
    }

    /// Key used everywhere primacy is decided: earliest creation wins, lowest id breaks ties.
    pub fn primacy_key(&self) -> (OffsetDateTime, ContactId) {
        (self.created_at, self.id)
    }
}

/// Arguments for a repository insert
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewContact {
    pub email: Option<String>,
    pub phone_number: Option<String>,
    pub link_precedence: LinkPrecedence,
    pub linked_id: Option<ContactId>,
}

impl NewContact {
    /// A fresh primary for an identity never seen before.
    pub fn primary(observation: &Observation) -> Self {
        Self {
            email: observation.email().map(str::to_string),
            phone_number: observation.phone_number().map(str::to_string),
            link_precedence: LinkPrecedence::Primary,
            linked_id: None,
        }
    }

    /// A secondary carrying the observation, attached to `primary`.
    pub fn secondary(observation: &Observation, primary: ContactId) -> Self {
        Self {
            email: observation.email().map(str::to_string),
            phone_number: observation.phone_number().map(str::to_string),
            link_precedence: LinkPrecedence::Secondary,
            linked_id: Some(primary),
        }
    }
}

/// Field changes for a repository update.
///
/// `unless_linked_to` turns the update into a conditional one: the row is left
/// untouched when its `linked_id` already equals the given id. Repositories
/// evaluate the condition inside the row write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContactPatch {
    pub link_precedence: Option<LinkPrecedence>,
    pub linked_id: Option<ContactId>,
    pub unless_linked_to: Option<ContactId>,
}

impl ContactPatch {
    /// Turn a primary into a secondary of `primary`.
    pub fn demote_to(primary: ContactId) -> Self {
        Self {
            link_precedence: Some(LinkPrecedence::Secondary),
            linked_id: Some(primary),
            unless_linked_to: None,
        }
    }

    /// Point a secondary at `primary` unconditionally.
    pub fn relink_to(primary: ContactId) -> Self {
        Self {
            link_precedence: None,
            linked_id: Some(primary),
            unless_linked_to: None,
        }
    }

    /// Point a cluster member at `primary`, no-op when it already is.
    pub fn sweep_to(primary: ContactId) -> Self {
        Self {
            link_precedence: Some(LinkPrecedence::Secondary),
            linked_id: Some(primary),
            unless_linked_to: Some(primary),
        }
    }

    /// Apply the patch in place. Returns `false` when the guard suppressed the write
    /// or nothing would change.
    pub fn apply(&self, contact: &mut Contact, now: OffsetDateTime) -> bool {
        if let Some(guard) = self.unless_linked_to {
            if contact.linked_id == Some(guard) {
                return false;
            }
        }

        let mut changed = false;
        if let Some(precedence) = self.link_precedence {
            if contact.link_precedence != precedence {
                contact.link_precedence = precedence;
                changed = true;
            }
        }
        if let Some(linked_id) = self.linked_id {
            if contact.linked_id != Some(linked_id) {
                contact.linked_id = Some(linked_id);
                changed = true;
            }
        }
        if changed {
            contact.updated_at = now;
        }
        changed
    }
}

/// Length limits applied while validating an observation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservationLimits {
    pub max_phone_len: usize,
    pub max_email_len: usize,
}

impl Default for ObservationLimits {
    fn default() -> Self {
        Self {
            max_phone_len: crate::config::DEFAULT_MAX_PHONE_LEN,
            max_email_len: crate::config::DEFAULT_MAX_EMAIL_LEN,
        }
    }
}

/// A validated (email, phone) pair submitted for reconciliation.
///
/// Empty strings are normalized to `None`; at least one side is present.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Observation {
    email: Option<String>,
    phone_number: Option<String>,
}

impl Observation {
    /// Normalize and validate raw caller input.
    pub fn parse(
        email: Option<&str>,
        phone_number: Option<&str>,
        limits: &ObservationLimits,
    ) -> Result<Self, ValidationError> {
        let email = non_empty(email);
        let phone_number = non_empty(phone_number);

        if email.is_none() && phone_number.is_none() {
            return Err(ValidationError::MissingIdentity);
        }
        if let Some(phone) = phone_number {
            let len = phone.chars().count();
            if len > limits.max_phone_len {
                return Err(ValidationError::PhoneTooLong {
                    len,
                    max: limits.max_phone_len,
                });
            }
        }
        if let Some(email) = email {
            let len = email.chars().count();
            if len > limits.max_email_len {
                return Err(ValidationError::EmailTooLong {
                    len,
                    max: limits.max_email_len,
                });
            }
        }

        Ok(Self {
            email: email.map(str::to_string),
            phone_number: phone_number.map(str::to_string),
        })
    }

    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    pub fn phone_number(&self) -> Option<&str> {
        self.phone_number.as_deref()
    }
}

impl fmt::Display for Observation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {})",
            self.email().unwrap_or("-"),
            self.phone_number().unwrap_or("-")
        )
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}
