//! Stored records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::identity::SchemaIdentity;

/// Synthetic, store-assigned id; strictly increasing and never reused
pub type EntryId = u64;

/// A record stored under a schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: EntryId,
    pub identity: SchemaIdentity,
    /// Producer-supplied business key, unique per identity
    pub upstream_id: String,
    pub record: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A record waiting to be stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewEntry {
    pub upstream_id: String,
    pub record: Value,
}

impl NewEntry {
    pub fn new(upstream_id: impl Into<String>, record: Value) -> Self {
        Self {
            upstream_id: upstream_id.into(),
            record,
        }
    }
}

/// One page of entries in ascending id order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryPage {
    pub entries: Vec<Entry>,
    /// Id of the last entry on this page; pass it back to continue
    pub cursor: Option<EntryId>,
    pub has_more: bool,
}

impl EntryPage {
    /// Build a page from up to `limit + 1` scanned rows
    pub fn from_scan(mut entries: Vec<Entry>, limit: usize) -> Self {
        let has_more = entries.len() > limit;
        entries.truncate(limit);
        let cursor = entries.last().map(|e| e.id);
        Self {
            entries,
            cursor,
            has_more,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
