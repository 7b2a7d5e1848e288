//! Job scheduler and state machine
//!
//! One [`Job`] per schema identity moves through
//!
//! ```text
//!   SCHEDULED --claim--> RUNNING --complete--> SCHEDULED
//!       ^                   |
//!       |                   +------fail-----> FAILED --(due again)--> RUNNING
//!       +------reset---------------------------+
//! ```
//!
//! Every transition is a single read-modify-write in the job store. A claim
//! bumps the job's generation, and `complete`/`fail` only apply while the
//! stored job is still RUNNING under the generation they were handed, so a
//! run that was reset or superseded cannot write its result back. The
//! [`Driver`] polls for due jobs and runs their loaders.

mod driver;

pub use driver::{Driver, JobOutcome};

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{IngestError, Result};
use crate::identity::SchemaIdentity;
use crate::job::{Job, JobDescriptor, JobState, ScheduleMode, DEFAULT_CURSOR};
use crate::loader::{IngestClient, Loader};
use crate::storage::JobStore;

const IDLE: u8 = 0;
const STARTED: u8 = 1;
const STOPPED: u8 = 2;

/// `now + delay`, saturating far in the future for absurd delays
pub(crate) fn due_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    let delta = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(3650));
    now.checked_add_signed(delta).unwrap_or(now)
}

/// Owns job records, loader registrations and the scheduler lifecycle
pub struct JobScheduler {
    jobs: Arc<dyn JobStore>,
    config: SchedulerConfig,
    loaders: RwLock<HashMap<String, Arc<dyn Loader>>>,
    lifecycle: AtomicU8,
}

impl JobScheduler {
    pub fn new(jobs: Arc<dyn JobStore>, config: SchedulerConfig) -> Self {
        Self {
            jobs,
            config,
            loaders: RwLock::new(HashMap::new()),
            lifecycle: AtomicU8::new(IDLE),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    // ── Loaders ─────────────────────────────────────────────────

    /// Make a loader dispatchable for its schema identity
    pub fn register_loader(&self, loader: Arc<dyn Loader>) -> Result<()> {
        let key = loader.identity().key();
        let mut loaders = self
            .loaders
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if loaders.contains_key(&key) {
            return Err(IngestError::LoaderAlreadyRegistered(key));
        }
        info!("Registered loader: {}", key);
        loaders.insert(key, loader);
        Ok(())
    }

    pub fn loader_for(&self, identity: &SchemaIdentity) -> Result<Arc<dyn Loader>> {
        self.loaders
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&identity.key())
            .cloned()
            .ok_or_else(|| IngestError::NoLoaderForJob(identity.clone()))
    }

    /// Register a loader and run its initialize phase
    pub async fn install(&self, loader: Arc<dyn Loader>, client: &IngestClient) -> Result<Job> {
        self.register_loader(Arc::clone(&loader))?;
        loader.initialize(client, self).await
    }

    // ── Lifecycle ───────────────────────────────────────────────

    /// Allow dispatching; requeues jobs a previous process left RUNNING
    pub async fn start(&self) -> Result<usize> {
        match self
            .lifecycle
            .compare_exchange(IDLE, STARTED, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(_) => {}
            Err(STARTED) => return Ok(0),
            Err(_) => return Err(IngestError::SchedulerStopped),
        }

        let mut requeued = 0;
        for job in self.jobs.list().await? {
            if job.state != JobState::Running {
                continue;
            }
            let generation = job.generation;
            let requeue = Box::new(move |current: Option<&Job>| {
                let mut job = current
                    .filter(|job| job.state == JobState::Running && job.generation == generation)
                    .cloned()?;
                job.state = JobState::Scheduled;
                job.updated_at = Utc::now();
                job.note("requeued: previous run did not finish");
                Some(job)
            });
            if self.jobs.modify(&job.identity, requeue).await?.is_some() {
                requeued += 1;
            }
        }
        info!("Scheduler started ({} stale runs requeued)", requeued);
        Ok(requeued)
    }

    pub fn stop(&self) {
        if self.lifecycle.swap(STOPPED, Ordering::SeqCst) != STOPPED {
            info!("Scheduler stop requested");
        }
    }

    pub fn ensure_running(&self) -> Result<()> {
        match self.lifecycle.load(Ordering::SeqCst) {
            STARTED => Ok(()),
            STOPPED => Err(IngestError::SchedulerStopped),
            _ => Err(IngestError::SchedulerNotStarted),
        }
    }

    // ── Job records ─────────────────────────────────────────────

    /// Upsert the job for `descriptor.info`
    ///
    /// An existing job keeps its failure count and notes; a RUNNING job stays
    /// RUNNING so the in-flight run still owns it.
    pub async fn schedule(&self, descriptor: JobDescriptor) -> Result<Job> {
        descriptor.info.validate()?;
        let identity = descriptor.info.clone();
        let upsert = Box::new(move |current: Option<&Job>| {
            let job = match current.cloned() {
                Some(mut job) => {
                    if job.state != JobState::Running {
                        job.state = JobState::Scheduled;
                    }
                    job.schedule_mode = descriptor.schedule_mode;
                    job.cursor = descriptor.cursor;
                    job.limit = descriptor.limit;
                    job.scheduled_at = descriptor.scheduled_at;
                    job.updated_at = Utc::now();
                    job.note(format!("descriptor submitted ({} from cursor {})", job.schedule_mode, job.cursor));
                    job
                }
                None => {
                    let mut job = Job::from_descriptor(descriptor);
                    job.note(format!("created ({} from cursor {})", job.schedule_mode, job.cursor));
                    job
                }
            };
            Some(job)
        });
        let job = self
            .jobs
            .modify(&identity, upsert)
            .await?
            .ok_or_else(|| IngestError::JobCreationFailed {
                identity: identity.clone(),
                reason: "job store did not write the job".to_string(),
            })?;
        debug!("Scheduled {} at {}", job.identity, job.scheduled_at);
        Ok(job)
    }

    pub async fn find_job(&self, identity: &SchemaIdentity) -> Result<Option<Job>> {
        self.jobs.get(identity).await
    }

    pub async fn find_all(&self) -> Result<Vec<Job>> {
        self.jobs.list().await
    }

    /// Jobs the driver may claim right now
    pub async fn load_next_jobs(&self) -> Result<Vec<Job>> {
        self.jobs.list_due(Utc::now(), self.config.max_failures).await
    }

    pub async fn remove(&self, identity: &SchemaIdentity) -> Result<bool> {
        let removed = self.jobs.delete(identity).await?;
        if removed {
            info!("Removed job {}", identity);
        }
        Ok(removed)
    }

    pub async fn remove_all(&self) -> Result<usize> {
        let removed = self.jobs.delete_all().await?;
        info!("Removed {} jobs", removed);
        Ok(removed)
    }

    /// Force a job back to BACKFILL from its starting cursor, due now
    ///
    /// Bumps the generation, so a run still in flight is disowned and its
    /// result discarded.
    pub async fn reset(&self, identity: &SchemaIdentity) -> Result<Option<Job>> {
        let cursor = self
            .loader_for(identity)
            .map(|loader| loader.initial_cursor())
            .unwrap_or_else(|_| DEFAULT_CURSOR.to_string());
        let rewind = Box::new(move |current: Option<&Job>| {
            let mut job = current.cloned()?;
            if job.state == JobState::Running {
                job.note("in-flight run disowned by reset");
            }
            job.state = JobState::Scheduled;
            job.generation += 1;
            job.schedule_mode = ScheduleMode::Backfill;
            job.cursor = cursor;
            job.current_fail_count = 0;
            job.previous_scheduled_at = Some(job.scheduled_at);
            job.scheduled_at = Utc::now();
            job.updated_at = job.scheduled_at;
            job.note(format!("reset to BACKFILL from cursor {}", job.cursor));
            Some(job)
        });
        let job = self.jobs.modify(identity, rewind).await?;
        if job.is_some() {
            info!("Reset job {}", identity);
        }
        Ok(job)
    }

    pub async fn reset_all(&self) -> Result<usize> {
        let mut count = 0;
        for job in self.jobs.list().await? {
            if self.reset(&job.identity).await?.is_some() {
                count += 1;
            }
        }
        Ok(count)
    }

    // ── Transitions ─────────────────────────────────────────────

    /// SCHEDULED/FAILED -> RUNNING; `None` when not due or already running
    pub async fn claim(&self, identity: &SchemaIdentity) -> Result<Option<Job>> {
        self.ensure_running()?;
        let claimed = self
            .jobs
            .claim(identity, Utc::now(), self.config.max_failures)
            .await?;
        if claimed.is_none() {
            debug!("Job {} not claimable", identity);
        }
        Ok(claimed)
    }

    /// RUNNING -> SCHEDULED with the schedule `save` asked for
    ///
    /// `claimed` is the job as [`claim`](Self::claim) returned it. Returns
    /// `None` if the job was reset, reclaimed or removed while it ran; the
    /// run's result is then discarded.
    pub async fn complete(
        &self,
        claimed: &Job,
        next: JobDescriptor,
        batch_len: usize,
    ) -> Result<Option<Job>> {
        let run = claimed.clone();
        let advance = Box::new(move |current: Option<&Job>| {
            let mut job = current.filter(|job| job.is_running_as(&run)).cloned()?;
            job.state = JobState::Scheduled;
            job.current_fail_count = 0;
            job.previous_scheduled_at = Some(job.scheduled_at);
            job.schedule_mode = next.schedule_mode;
            job.cursor = next.cursor;
            job.limit = next.limit;
            job.scheduled_at = next.scheduled_at;
            job.updated_at = Utc::now();
            job.note(format!(
                "loaded {} items; next {} run at {} from cursor {}",
                batch_len, job.schedule_mode, job.scheduled_at, job.cursor
            ));
            Some(job)
        });
        let Some(job) = self.jobs.modify(&claimed.identity, advance).await? else {
            discard(claimed);
            return Ok(None);
        };
        debug!("Job {} completed ({} items)", job.identity, batch_len);
        Ok(Some(job))
    }

    /// RUNNING -> FAILED, rescheduled after the failure backoff
    ///
    /// Same ownership rule as [`complete`](Self::complete).
    pub async fn fail(&self, claimed: &Job, reason: &str) -> Result<Option<Job>> {
        let run = claimed.clone();
        let config = self.config.clone();
        let reason_note = reason.to_string();
        let record = Box::new(move |current: Option<&Job>| {
            let mut job = current.filter(|job| job.is_running_as(&run)).cloned()?;
            let now = Utc::now();
            job.state = JobState::Failed;
            job.current_fail_count += 1;
            job.previous_scheduled_at = Some(job.scheduled_at);
            job.scheduled_at = due_after(now, config.backoff_for(job.current_fail_count));
            job.updated_at = now;
            job.note(format!("failed (attempt {}): {}", job.current_fail_count, reason_note));
            Some(job)
        });
        let Some(job) = self.jobs.modify(&claimed.identity, record).await? else {
            discard(claimed);
            return Ok(None);
        };
        if self
            .config
            .max_failures
            .is_some_and(|max| job.current_fail_count >= max)
        {
            warn!(
                "Job {} failed {} times; parked until reset",
                job.identity, job.current_fail_count
            );
        } else {
            warn!(
                "Job {} failed ({}); retrying at {}",
                job.identity, reason, job.scheduled_at
            );
        }
        Ok(Some(job))
    }
}

fn discard(claimed: &Job) {
    warn!(
        "Job {} was reset or removed during run {}; discarding run result",
        claimed.identity, claimed.generation
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::DocumentStore;

    fn identity() -> SchemaIdentity {
        SchemaIdentity::new("ns", "Swap", "v1").unwrap()
    }

    fn scheduler(config: SchedulerConfig) -> JobScheduler {
        JobScheduler::new(Arc::new(DocumentStore::in_memory()), config)
    }

    #[tokio::test]
    async fn test_lifecycle_errors() {
        let scheduler = scheduler(SchedulerConfig::default());
        assert!(matches!(
            scheduler.claim(&identity()).await,
            Err(IngestError::SchedulerNotStarted)
        ));
        scheduler.start().await.unwrap();
        assert_eq!(scheduler.start().await.unwrap(), 0);
        scheduler.stop();
        assert!(matches!(
            scheduler.claim(&identity()).await,
            Err(IngestError::SchedulerStopped)
        ));
        assert!(matches!(scheduler.start().await, Err(IngestError::SchedulerStopped)));
    }

    #[tokio::test]
    async fn test_schedule_upserts_by_identity() {
        let scheduler = scheduler(SchedulerConfig::default());
        scheduler
            .schedule(JobDescriptor::backfill_now(identity(), "0", 100))
            .await
            .unwrap();
        let mut next = JobDescriptor::backfill_now(identity(), "500", 50);
        next.schedule_mode = ScheduleMode::Incremental;
        let job = scheduler.schedule(next).await.unwrap();

        assert_eq!(scheduler.find_all().await.unwrap().len(), 1);
        assert_eq!(job.cursor, "500");
        assert_eq!(job.limit, 50);
        assert_eq!(job.notes.len(), 2);
    }

    #[tokio::test]
    async fn test_claim_complete_cycle() {
        let scheduler = scheduler(SchedulerConfig::default());
        scheduler.start().await.unwrap();
        let job = scheduler
            .schedule(JobDescriptor::backfill_now(identity(), "0", 100))
            .await
            .unwrap();

        let running = scheduler.claim(&identity()).await.unwrap().unwrap();
        assert_eq!(running.state, JobState::Running);
        assert!(scheduler.claim(&identity()).await.unwrap().is_none());
        assert!(scheduler.load_next_jobs().await.unwrap().is_empty());

        let mut next = JobDescriptor::backfill_now(identity(), "100", 100);
        next.scheduled_at = due_after(Utc::now(), Duration::from_secs(60));
        let done = scheduler.complete(&running, next, 100).await.unwrap().unwrap();
        assert_eq!(done.state, JobState::Scheduled);
        assert_eq!(done.cursor, "100");
        assert_eq!(done.previous_scheduled_at, Some(job.scheduled_at));
        assert!(scheduler.load_next_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_backoff_and_parking() {
        let config = SchedulerConfig {
            failure_backoff_secs: 0,
            max_failures: Some(2),
            ..SchedulerConfig::default()
        };
        let scheduler = scheduler(config);
        scheduler.start().await.unwrap();
        scheduler
            .schedule(JobDescriptor::backfill_now(identity(), "0", 100))
            .await
            .unwrap();

        let run = scheduler.claim(&identity()).await.unwrap().unwrap();
        let failed = scheduler.fail(&run, "source down").await.unwrap().unwrap();
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.current_fail_count, 1);
        assert_eq!(failed.cursor, "0");
        assert!(failed.notes.back().unwrap().message.contains("source down"));

        // Zero backoff: due again immediately.
        let run = scheduler.claim(&identity()).await.unwrap().unwrap();
        scheduler.fail(&run, "still down").await.unwrap();
        assert!(scheduler.claim(&identity()).await.unwrap().is_none());

        let reset = scheduler.reset(&identity()).await.unwrap().unwrap();
        assert_eq!(reset.current_fail_count, 0);
        assert_eq!(reset.schedule_mode, ScheduleMode::Backfill);
        assert_eq!(reset.cursor, DEFAULT_CURSOR);
        assert!(scheduler.claim(&identity()).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_reset_discards_in_flight_result() {
        let scheduler = scheduler(SchedulerConfig::default());
        scheduler.start().await.unwrap();
        scheduler
            .schedule(JobDescriptor::backfill_now(identity(), "0", 10))
            .await
            .unwrap();
        let run = scheduler.claim(&identity()).await.unwrap().unwrap();
        scheduler.reset(&identity()).await.unwrap();

        let next = JobDescriptor::backfill_now(identity(), "999", 10);
        assert!(scheduler.complete(&run, next, 10).await.unwrap().is_none());
        assert!(scheduler.fail(&run, "late").await.unwrap().is_none());
        let job = scheduler.find_job(&identity()).await.unwrap().unwrap();
        assert_eq!(job.cursor, "0");
        assert_eq!(job.state, JobState::Scheduled);
        assert_eq!(job.current_fail_count, 0);
    }

    #[tokio::test]
    async fn test_stale_run_cannot_overwrite_a_newer_claim() {
        let scheduler = scheduler(SchedulerConfig::default());
        scheduler.start().await.unwrap();
        scheduler
            .schedule(JobDescriptor::backfill_now(identity(), "0", 10))
            .await
            .unwrap();
        let stale = scheduler.claim(&identity()).await.unwrap().unwrap();
        scheduler.reset(&identity()).await.unwrap();
        let current = scheduler.claim(&identity()).await.unwrap().unwrap();
        assert!(current.generation > stale.generation);

        // The old run finishes while the new one still holds the job.
        let late = JobDescriptor::backfill_now(identity(), "999", 10);
        assert!(scheduler.complete(&stale, late, 10).await.unwrap().is_none());
        let job = scheduler.find_job(&identity()).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Running);
        assert_eq!(job.cursor, "0");

        let next = JobDescriptor::backfill_now(identity(), "10", 10);
        let done = scheduler.complete(&current, next, 10).await.unwrap().unwrap();
        assert_eq!(done.cursor, "10");
    }

    #[tokio::test]
    async fn test_concurrent_schedules_keep_every_note() {
        let scheduler = Arc::new(scheduler(SchedulerConfig::default()));
        let mut handles = Vec::new();
        for n in 0..16 {
            let scheduler = Arc::clone(&scheduler);
            handles.push(tokio::spawn(async move {
                scheduler
                    .schedule(JobDescriptor::backfill_now(identity(), n.to_string(), 10))
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        let job = scheduler.find_job(&identity()).await.unwrap().unwrap();
        assert_eq!(job.notes.len(), 16);
    }

    #[tokio::test]
    async fn test_start_requeues_stale_running_jobs() {
        let store = Arc::new(DocumentStore::in_memory());
        let first = JobScheduler::new(store.clone(), SchedulerConfig::default());
        first.start().await.unwrap();
        first
            .schedule(JobDescriptor::backfill_now(identity(), "0", 10))
            .await
            .unwrap();
        first.claim(&identity()).await.unwrap().unwrap();

        let second = JobScheduler::new(store, SchedulerConfig::default());
        assert_eq!(second.start().await.unwrap(), 1);
        let job = second.find_job(&identity()).await.unwrap().unwrap();
        assert_eq!(job.state, JobState::Scheduled);
    }

    #[tokio::test]
    async fn test_remove_all() {
        let scheduler = scheduler(SchedulerConfig::default());
        for name in ["A", "B"] {
            let id = SchemaIdentity::new("ns", name, "v1").unwrap();
            scheduler
                .schedule(JobDescriptor::backfill_now(id, "0", 10))
                .await
                .unwrap();
        }
        assert!(scheduler.remove(&SchemaIdentity::new("ns", "A", "v1").unwrap()).await.unwrap());
        assert_eq!(scheduler.remove_all().await.unwrap(), 1);
        assert!(scheduler.find_all().await.unwrap().is_empty());
    }
}
