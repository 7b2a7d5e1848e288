//! Persistence ports for schemas, entries and jobs
//!
//! The core only talks to these traits. [`DocumentStore`] implements all
//! three, either purely in memory or backed by a JSON snapshot file.

mod document;

pub use document::DocumentStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entry::{Entry, EntryId, NewEntry};
use crate::error::Result;
use crate::identity::SchemaIdentity;
use crate::job::Job;
use crate::query::Filter;
use crate::schema::StoredSchema;

/// Outcome of a conditional schema write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Written; carries the new revision
    Written(u64),
    /// The stored revision did not match the expected one
    Conflict,
}

/// Schema persistence with per-key conditional update
#[async_trait]
pub trait SchemaStore: Send + Sync {
    async fn get(&self, identity: &SchemaIdentity) -> Result<Option<StoredSchema>>;

    /// Write `schema` only if the stored revision equals `expected_revision`
    /// (`None` means "must not exist yet")
    async fn put(&self, schema: StoredSchema, expected_revision: Option<u64>) -> Result<PutOutcome>;

    /// All stored schemas ordered by identity
    async fn list(&self) -> Result<Vec<StoredSchema>>;

    /// Returns whether a schema was removed
    async fn delete(&self, identity: &SchemaIdentity) -> Result<bool>;
}

/// Row statistics for one identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EntryStats {
    pub row_count: usize,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Record persistence keyed by `(identity, upstream_id)`
#[async_trait]
pub trait EntryStore: Send + Sync {
    /// Upsert all records as one atomic unit, returning them in input order
    ///
    /// An existing `(identity, upstream_id)` keeps its id and creation time.
    async fn upsert_many(&self, identity: &SchemaIdentity, records: Vec<NewEntry>) -> Result<Vec<Entry>>;

    async fn get(&self, id: EntryId) -> Result<Option<Entry>>;

    /// Entries of `identity` with id strictly greater than `after` that match
    /// every filter, ascending by id, at most `limit` rows
    async fn scan(
        &self,
        identity: &SchemaIdentity,
        after: Option<EntryId>,
        filters: &[Filter],
        limit: usize,
    ) -> Result<Vec<Entry>>;

    /// Returns the number of entries removed
    async fn delete_by_schema(&self, identity: &SchemaIdentity) -> Result<usize>;

    async fn stats(&self, identity: &SchemaIdentity) -> Result<EntryStats>;
}

/// Read-modify-write step for [`JobStore::modify`]
///
/// Receives the stored job, if any, and returns its replacement, or `None`
/// to leave storage untouched.
pub type JobModifier = Box<dyn FnOnce(Option<&Job>) -> Option<Job> + Send>;

/// Job persistence with an atomic claim and atomic read-modify-write
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, identity: &SchemaIdentity) -> Result<Option<Job>>;

    /// Apply `modifier` to the job at `identity` with no other write in
    /// between; returns the job that was written, if any
    async fn modify(&self, identity: &SchemaIdentity, modifier: JobModifier) -> Result<Option<Job>>;

    /// All jobs ordered by identity
    async fn list(&self) -> Result<Vec<Job>>;

    async fn delete(&self, identity: &SchemaIdentity) -> Result<bool>;

    async fn delete_all(&self) -> Result<usize>;

    /// Jobs due at `now` (see [`Job::is_due`]), earliest first
    async fn list_due(&self, now: DateTime<Utc>, max_failures: Option<u32>) -> Result<Vec<Job>>;

    /// Atomically move a due job to RUNNING under a new generation; `None`
    /// if it is not claimable
    async fn claim(
        &self,
        identity: &SchemaIdentity,
        now: DateTime<Utc>,
        max_failures: Option<u32>,
    ) -> Result<Option<Job>>;
}
