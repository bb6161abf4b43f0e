//! Outbound shape of a reconciliation, as served by a transport.

use crate::engine::Resolution;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifyResponse {
    pub contact: ContactSummary,
}

/// Flattened view of one cluster. The primary's values come first in
/// `emails` and `phone_numbers`; no value appears twice in either list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactSummary {
    pub primary_contact_id: u64,
    pub emails: Vec<String>,
    pub phone_numbers: Vec<String>,
    pub secondary_contact_ids: Vec<u64>,
}

impl ContactSummary {
    pub fn from_resolution(resolution: &Resolution) -> Self {
        let members = std::iter::once(&resolution.primary).chain(&resolution.secondaries);

        let mut emails: Vec<String> = Vec::new();
        let mut phone_numbers: Vec<String> = Vec::new();
        for contact in members {
            push_distinct(&mut emails, contact.email.as_deref());
            push_distinct(&mut phone_numbers, contact.phone_number.as_deref());
        }

        let mut secondary_contact_ids: Vec<u64> = Vec::with_capacity(resolution.secondaries.len());
        for contact in &resolution.secondaries {
            if !secondary_contact_ids.contains(&contact.id.0) {
                secondary_contact_ids.push(contact.id.0);
            }
        }

        Self {
            primary_contact_id: resolution.primary.id.0,
            emails,
            phone_numbers,
            secondary_contact_ids,
        }
    }
}

fn push_distinct(values: &mut Vec<String>, value: Option<&str>) {
    if let Some(value) = value.filter(|v| !v.is_empty()) {
        if !values.iter().any(|existing| existing == value) {
            values.push(value.to_string());
        }
    }
}

impl From<&Resolution> for IdentifyResponse {
    fn from(resolution: &Resolution) -> Self {
        Self {
            contact: ContactSummary::from_resolution(resolution),
        }
    }
}
