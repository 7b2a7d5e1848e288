//! Loader contract
//!
//! A loader feeds one schema identity from an upstream source in three
//! phases:
//!
//! 1. `initialize` registers the schema and makes sure a job exists
//! 2. `load` fetches one batch after a cursor
//! 3. `save` stores the batch and returns the next [`JobDescriptor`]
//!
//! Only `load` has to be written per source. [`PagedSourceLoader`] covers
//! the common case of a JSON API paged by cursor and limit.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::config::CadenceConfig;
use crate::entry::NewEntry;
use crate::error::{IngestError, Result};
use crate::identity::SchemaIdentity;
use crate::job::{Job, JobDescriptor, ScheduleMode, DEFAULT_CURSOR, DEFAULT_LIMIT};
use crate::registry::SchemaRegistry;
use crate::repository::DataRepository;
use crate::scheduler::{due_after, JobScheduler};
use crate::schema::Schema;

/// Handles a loader needs to persist what it fetched
#[derive(Clone)]
pub struct IngestClient {
    registry: Arc<SchemaRegistry>,
    data: Arc<DataRepository>,
    cadence: CadenceConfig,
}

impl IngestClient {
    pub fn new(data: Arc<DataRepository>, cadence: CadenceConfig) -> Self {
        Self {
            registry: Arc::clone(data.registry()),
            data,
            cadence,
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn data(&self) -> &DataRepository {
        &self.data
    }

    pub fn cadence(&self) -> &CadenceConfig {
        &self.cadence
    }
}

/// One fetched record
#[derive(Debug, Clone, PartialEq)]
pub struct LoadedItem {
    /// Stable id in the source; repeated loads upsert on it
    pub upstream_id: String,
    /// Position of this item in the source's ordering
    pub cursor: String,
    pub record: Value,
}

/// A batch returned by `load`
#[derive(Debug, Clone, PartialEq)]
pub struct LoadingResult {
    /// The cursor the batch was loaded from
    pub cursor: String,
    pub limit: u32,
    pub items: Vec<LoadedItem>,
}

impl LoadingResult {
    pub fn new(cursor: impl Into<String>, limit: u32, items: Vec<LoadedItem>) -> Self {
        Self {
            cursor: cursor.into(),
            limit,
            items,
        }
    }

    /// Cursor of the last item, or the input cursor for an empty batch
    pub fn next_cursor(&self) -> String {
        self.items
            .last()
            .map(|item| item.cursor.clone())
            .unwrap_or_else(|| self.cursor.clone())
    }

    pub fn schedule_mode(&self) -> ScheduleMode {
        ScheduleMode::for_batch(self.items.len(), self.limit)
    }
}

#[async_trait]
pub trait Loader: Send + Sync {
    /// The schema every loaded record must satisfy
    fn schema(&self) -> &Schema;

    fn identity(&self) -> &SchemaIdentity {
        &self.schema().identity
    }

    /// Batch size for the first run
    fn limit(&self) -> u32 {
        DEFAULT_LIMIT
    }

    /// Where a fresh or reset job starts
    fn initial_cursor(&self) -> String {
        DEFAULT_CURSOR.to_string()
    }

    /// Register the schema and make sure a job exists
    ///
    /// An existing job is left as is so restarts resume where they stopped.
    async fn initialize(&self, client: &IngestClient, scheduler: &JobScheduler) -> Result<Job> {
        client.registry().register(self.schema().clone()).await?;
        if let Some(job) = scheduler.find_job(self.identity()).await? {
            debug!("Job {} already exists; resuming at cursor {}", job.identity, job.cursor);
            return Ok(job);
        }
        let descriptor =
            JobDescriptor::backfill_now(self.identity().clone(), self.initial_cursor(), self.limit());
        let job = scheduler
            .schedule(descriptor)
            .await
            .map_err(|e| IngestError::JobCreationFailed {
                identity: self.identity().clone(),
                reason: e.to_string(),
            })?;
        info!("Created job {} at cursor {}", job.identity, job.cursor);
        Ok(job)
    }

    /// Fetch up to `limit` items after `cursor`
    async fn load(&self, cursor: &str, limit: u32) -> Result<LoadingResult>;

    /// Store the batch and decide the next run
    async fn save(&self, client: &IngestClient, result: LoadingResult) -> Result<JobDescriptor> {
        save_batch(self.identity(), client, result).await
    }
}

/// Default `save`: bulk-store, then BACKFILL again soon on a full batch or
/// settle into INCREMENTAL
pub async fn save_batch(
    identity: &SchemaIdentity,
    client: &IngestClient,
    result: LoadingResult,
) -> Result<JobDescriptor> {
    let schedule_mode = result.schedule_mode();
    let cursor = result.next_cursor();
    let limit = result.limit;
    let records: Vec<NewEntry> = result
        .items
        .into_iter()
        .map(|item| NewEntry::new(item.upstream_id, item.record))
        .collect();
    client.data().store_bulk(identity, records).await?;

    Ok(JobDescriptor {
        info: identity.clone(),
        scheduled_at: due_after(Utc::now(), client.cadence().cadence_for(schedule_mode)),
        schedule_mode,
        cursor,
        limit,
    })
}

/// Transport to an upstream JSON API
#[async_trait]
pub trait SourceClient: Send + Sync {
    /// Send `request` and return the decoded response body
    async fn fetch(&self, request: Value) -> Result<Value>;
}

/// Loader for sources that answer `{"cursor", "limit"}` with a JSON array
pub struct PagedSourceLoader<C> {
    schema: Schema,
    client: C,
    items_pointer: String,
    id_field: String,
    cursor_field: String,
    limit: u32,
    initial_cursor: String,
}

impl<C: SourceClient> PagedSourceLoader<C> {
    pub fn new(schema: Schema, client: C) -> Self {
        Self {
            schema,
            client,
            items_pointer: String::new(),
            id_field: "id".to_string(),
            cursor_field: "id".to_string(),
            limit: DEFAULT_LIMIT,
            initial_cursor: DEFAULT_CURSOR.to_string(),
        }
    }

    /// JSON pointer to the item array in the response (default: the body itself)
    pub fn items_at(mut self, pointer: impl Into<String>) -> Self {
        self.items_pointer = pointer.into();
        self
    }

    pub fn id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    pub fn cursor_field(mut self, field: impl Into<String>) -> Self {
        self.cursor_field = field.into();
        self
    }

    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    pub fn starting_at(mut self, cursor: impl Into<String>) -> Self {
        self.initial_cursor = cursor.into();
        self
    }

    fn to_item(&self, record: &Value) -> Result<LoadedItem> {
        let upstream_id = scalar_field(record, &self.id_field).ok_or_else(|| {
            IngestError::Loader(format!("item has no scalar '{}' field", self.id_field))
        })?;
        let cursor = scalar_field(record, &self.cursor_field).ok_or_else(|| {
            IngestError::Loader(format!("item has no scalar '{}' field", self.cursor_field))
        })?;
        Ok(LoadedItem {
            upstream_id,
            cursor,
            record: record.clone(),
        })
    }
}

fn scalar_field(record: &Value, field: &str) -> Option<String> {
    match record.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl<C: SourceClient> Loader for PagedSourceLoader<C> {
    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn limit(&self) -> u32 {
        self.limit
    }

    fn initial_cursor(&self) -> String {
        self.initial_cursor.clone()
    }

    async fn load(&self, cursor: &str, limit: u32) -> Result<LoadingResult> {
        let response = self
            .client
            .fetch(json!({ "cursor": cursor, "limit": limit }))
            .await?;
        let items = response
            .pointer(&self.items_pointer)
            .and_then(Value::as_array)
            .ok_or_else(|| {
                IngestError::Loader(format!(
                    "response for {} has no item array at '{}'",
                    self.schema.identity, self.items_pointer
                ))
            })?
            .iter()
            .map(|record| self.to_item(record))
            .collect::<Result<Vec<_>>>()?;
        debug!("Loaded {} items for {} after {}", items.len(), self.schema.identity, cursor);
        Ok(LoadingResult::new(cursor, limit, items))
    }
}
