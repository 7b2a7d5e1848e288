//! Single-process document store
//!
//! Holds every collection behind one `tokio::sync::RwLock`, so each trait
//! method is atomic with respect to the others. When opened with a path, the
//! whole state is written to a JSON snapshot after every mutation
//! (temp file + rename) and reloaded on open. A mutation only becomes
//! visible in memory once its snapshot is written.
//!
//! A durable store holds an exclusive lock on `<snapshot>.lock` until it is
//! dropped; a second process opening the same snapshot fails instead of
//! silently overwriting the first one's writes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info};

use crate::entry::{Entry, EntryId, NewEntry};
use crate::error::{IngestError, Result};
use crate::identity::SchemaIdentity;
use crate::job::{Job, JobState};
use crate::query::{matches_all, Filter};
use crate::schema::StoredSchema;

use super::{EntryStats, EntryStore, JobModifier, JobStore, PutOutcome, SchemaStore};

/// On-disk layout
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    next_entry_id: EntryId,
    schemas: Vec<StoredSchema>,
    entries: Vec<Entry>,
    jobs: Vec<Job>,
}

#[derive(Debug, Clone)]
struct State {
    schemas: BTreeMap<SchemaIdentity, StoredSchema>,
    entries: BTreeMap<EntryId, Entry>,
    by_schema: HashMap<SchemaIdentity, BTreeSet<EntryId>>,
    by_upstream: HashMap<(SchemaIdentity, String), EntryId>,
    jobs: BTreeMap<SchemaIdentity, Job>,
    next_entry_id: EntryId,
}

impl Default for State {
    fn default() -> Self {
        Self {
            schemas: BTreeMap::new(),
            entries: BTreeMap::new(),
            by_schema: HashMap::new(),
            by_upstream: HashMap::new(),
            jobs: BTreeMap::new(),
            next_entry_id: 1,
        }
    }
}

impl State {
    fn from_snapshot(snapshot: Snapshot) -> Self {
        let mut state = State {
            next_entry_id: snapshot.next_entry_id.max(1),
            ..State::default()
        };
        for schema in snapshot.schemas {
            state.schemas.insert(schema.schema.identity.clone(), schema);
        }
        for job in snapshot.jobs {
            state.jobs.insert(job.identity.clone(), job);
        }
        for entry in snapshot.entries {
            state.index_entry(&entry);
            state.next_entry_id = state.next_entry_id.max(entry.id + 1);
            state.entries.insert(entry.id, entry);
        }
        state
    }

    fn to_snapshot(&self) -> Snapshot {
        Snapshot {
            next_entry_id: self.next_entry_id,
            schemas: self.schemas.values().cloned().collect(),
            entries: self.entries.values().cloned().collect(),
            jobs: self.jobs.values().cloned().collect(),
        }
    }

    fn index_entry(&mut self, entry: &Entry) {
        self.by_schema
            .entry(entry.identity.clone())
            .or_default()
            .insert(entry.id);
        self.by_upstream
            .insert((entry.identity.clone(), entry.upstream_id.clone()), entry.id);
    }

    fn upsert(&mut self, identity: &SchemaIdentity, new: NewEntry, now: DateTime<Utc>) -> Entry {
        let key = (identity.clone(), new.upstream_id.clone());
        if let Some(id) = self.by_upstream.get(&key).copied() {
            if let Some(existing) = self.entries.get_mut(&id) {
                existing.record = new.record;
                existing.updated_at = now;
                return existing.clone();
            }
        }
        let entry = Entry {
            id: self.next_entry_id,
            identity: identity.clone(),
            upstream_id: new.upstream_id,
            record: new.record,
            created_at: now,
            updated_at: now,
        };
        self.next_entry_id += 1;
        self.index_entry(&entry);
        self.entries.insert(entry.id, entry.clone());
        entry
    }
}

/// In-memory store with optional JSON snapshot persistence
pub struct DocumentStore {
    state: RwLock<State>,
    path: Option<PathBuf>,
    /// Exclusive snapshot lock, released on drop
    _lock: Option<File>,
}

/// Take the exclusive lock guarding the snapshot at `path`
fn lock_snapshot(path: &Path) -> Result<File> {
    let lock_path = path.with_extension("lock");
    let file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .map_err(|e| IngestError::database(format!("opening {}", lock_path.display()), e))?;
    file.try_lock_exclusive().map_err(|e| {
        error!("Snapshot {} is locked by another process", path.display());
        IngestError::database(
            format!("snapshot {} is in use by another process", path.display()),
            e,
        )
    })?;
    Ok(file)
}

impl DocumentStore {
    /// A store that lives only as long as the process
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(State::default()),
            path: None,
            _lock: None,
        }
    }

    /// Open (or create) a durable store backed by the snapshot at `path`
    ///
    /// Fails with a `Database` error while another store holds the snapshot.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| IngestError::database(format!("creating {}", parent.display()), e))?;
        }
        let lock = lock_snapshot(&path)?;
        let state = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let snapshot: Snapshot = serde_json::from_slice(&bytes)?;
                info!(
                    "Loaded snapshot {} ({} schemas, {} entries, {} jobs)",
                    path.display(),
                    snapshot.schemas.len(),
                    snapshot.entries.len(),
                    snapshot.jobs.len()
                );
                State::from_snapshot(snapshot)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => State::default(),
            Err(e) => {
                return Err(IngestError::database(format!("reading {}", path.display()), e));
            }
        };
        Ok(Self {
            state: RwLock::new(state),
            path: Some(path),
            _lock: Some(lock),
        })
    }

    /// Snapshot path, if durable
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn persist(&self, state: &State) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(&state.to_snapshot())?;
        let tmp = path.with_extension("tmp");
        let write = async {
            tokio::fs::write(&tmp, &bytes).await?;
            tokio::fs::rename(&tmp, path).await
        };
        write.await.map_err(|e| {
            error!("Failed to write snapshot {}: {}", path.display(), e);
            IngestError::database(format!("writing snapshot {}", path.display()), e)
        })?;
        debug!("Persisted snapshot {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    /// Apply `change` to a staged copy, persist it, then make it current
    ///
    /// On a failed write the in-memory state is left as it was.
    async fn commit<T>(&self, state: &mut State, change: impl FnOnce(&mut State) -> T) -> Result<T> {
        if self.path.is_none() {
            return Ok(change(state));
        }
        let mut staged = state.clone();
        let out = change(&mut staged);
        self.persist(&staged).await?;
        *state = staged;
        Ok(out)
    }
}

impl Default for DocumentStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

#[async_trait]
impl SchemaStore for DocumentStore {
    async fn get(&self, identity: &SchemaIdentity) -> Result<Option<StoredSchema>> {
        Ok(self.state.read().await.schemas.get(identity).cloned())
    }

    async fn put(&self, mut schema: StoredSchema, expected_revision: Option<u64>) -> Result<PutOutcome> {
        let mut state = self.state.write().await;
        let identity = schema.schema.identity.clone();
        let current = state.schemas.get(&identity).map(|s| s.revision);
        if current != expected_revision {
            return Ok(PutOutcome::Conflict);
        }
        let revision = expected_revision.map_or(1, |r| r + 1);
        schema.revision = revision;
        self.commit(&mut state, |s| s.schemas.insert(identity, schema))
            .await?;
        Ok(PutOutcome::Written(revision))
    }

    async fn list(&self) -> Result<Vec<StoredSchema>> {
        Ok(self.state.read().await.schemas.values().cloned().collect())
    }

    async fn delete(&self, identity: &SchemaIdentity) -> Result<bool> {
        let mut state = self.state.write().await;
        if !state.schemas.contains_key(identity) {
            return Ok(false);
        }
        self.commit(&mut state, |s| s.schemas.remove(identity)).await?;
        Ok(true)
    }
}

#[async_trait]
impl EntryStore for DocumentStore {
    async fn upsert_many(&self, identity: &SchemaIdentity, records: Vec<NewEntry>) -> Result<Vec<Entry>> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        self.commit(&mut state, |s| {
            records
                .into_iter()
                .map(|record| s.upsert(identity, record, now))
                .collect()
        })
        .await
    }

    async fn get(&self, id: EntryId) -> Result<Option<Entry>> {
        Ok(self.state.read().await.entries.get(&id).cloned())
    }

    async fn scan(
        &self,
        identity: &SchemaIdentity,
        after: Option<EntryId>,
        filters: &[Filter],
        limit: usize,
    ) -> Result<Vec<Entry>> {
        let state = self.state.read().await;
        let Some(ids) = state.by_schema.get(identity) else {
            return Ok(Vec::new());
        };
        let start = after.map_or(0, |a| a.saturating_add(1));
        Ok(ids
            .range(start..)
            .filter_map(|id| state.entries.get(id))
            .filter(|entry| matches_all(filters, &entry.record))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_by_schema(&self, identity: &SchemaIdentity) -> Result<usize> {
        let mut state = self.state.write().await;
        if !state.by_schema.contains_key(identity) {
            return Ok(0);
        }
        self.commit(&mut state, |s| {
            let ids = s.by_schema.remove(identity).unwrap_or_default();
            for id in &ids {
                if let Some(entry) = s.entries.remove(id) {
                    s.by_upstream.remove(&(entry.identity, entry.upstream_id));
                }
            }
            ids.len()
        })
        .await
    }

    async fn stats(&self, identity: &SchemaIdentity) -> Result<EntryStats> {
        let state = self.state.read().await;
        let Some(ids) = state.by_schema.get(identity) else {
            return Ok(EntryStats::default());
        };
        let last_updated = ids
            .iter()
            .filter_map(|id| state.entries.get(id))
            .map(|e| e.updated_at)
            .max();
        Ok(EntryStats {
            row_count: ids.len(),
            last_updated,
        })
    }
}

#[async_trait]
impl JobStore for DocumentStore {
    async fn get(&self, identity: &SchemaIdentity) -> Result<Option<Job>> {
        Ok(self.state.read().await.jobs.get(identity).cloned())
    }

    async fn modify(&self, identity: &SchemaIdentity, modifier: JobModifier) -> Result<Option<Job>> {
        let mut state = self.state.write().await;
        let Some(job) = modifier(state.jobs.get(identity)) else {
            return Ok(None);
        };
        if &job.identity != identity {
            return Err(IngestError::InvalidDescriptor(format!(
                "job update for {} produced a job for {}",
                identity, job.identity
            )));
        }
        let written = job.clone();
        self.commit(&mut state, |s| {
            s.jobs.insert(job.identity.clone(), job);
        })
        .await?;
        Ok(Some(written))
    }

    async fn list(&self) -> Result<Vec<Job>> {
        Ok(self.state.read().await.jobs.values().cloned().collect())
    }

    async fn delete(&self, identity: &SchemaIdentity) -> Result<bool> {
        let mut state = self.state.write().await;
        if !state.jobs.contains_key(identity) {
            return Ok(false);
        }
        self.commit(&mut state, |s| s.jobs.remove(identity)).await?;
        Ok(true)
    }

    async fn delete_all(&self) -> Result<usize> {
        let mut state = self.state.write().await;
        self.commit(&mut state, |s| std::mem::take(&mut s.jobs).len())
            .await
    }

    async fn list_due(&self, now: DateTime<Utc>, max_failures: Option<u32>) -> Result<Vec<Job>> {
        let state = self.state.read().await;
        let mut due: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| job.is_due(now, max_failures))
            .cloned()
            .collect();
        due.sort_by_key(|job| job.scheduled_at);
        Ok(due)
    }

    async fn claim(
        &self,
        identity: &SchemaIdentity,
        now: DateTime<Utc>,
        max_failures: Option<u32>,
    ) -> Result<Option<Job>> {
        let mut state = self.state.write().await;
        let mut claimed = match state.jobs.get(identity) {
            Some(job) if job.is_due(now, max_failures) => job.clone(),
            _ => return Ok(None),
        };
        claimed.state = JobState::Running;
        claimed.generation += 1;
        claimed.updated_at = now;
        let written = claimed.clone();
        self.commit(&mut state, |s| {
            s.jobs.insert(claimed.identity.clone(), claimed);
        })
        .await?;
        Ok(Some(written))
    }
}
