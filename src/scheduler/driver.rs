//! Polling driver that runs due jobs
//!
//! Each claimed job runs on its own task; its loader phases run on a nested
//! task so that a panicking loader fails its job instead of leaving it
//! RUNNING. An identity whose previous run is still executing is never
//! dispatched again, even after a reset made its job due.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::JobScheduler;
use crate::error::{IngestError, Result};
use crate::identity::SchemaIdentity;
use crate::job::Job;
use crate::loader::IngestClient;

/// How a dispatched run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    Completed(Job),
    Failed(Job),
    /// The job was reset or removed mid-run, or its result could not be recorded
    Discarded(SchemaIdentity),
}

impl JobOutcome {
    pub fn identity(&self) -> &SchemaIdentity {
        match self {
            JobOutcome::Completed(job) | JobOutcome::Failed(job) => &job.identity,
            JobOutcome::Discarded(identity) => identity,
        }
    }
}

pub struct Driver {
    scheduler: Arc<JobScheduler>,
    client: IngestClient,
    in_flight: Mutex<Vec<(SchemaIdentity, JoinHandle<JobOutcome>)>>,
}

impl Driver {
    pub fn new(scheduler: Arc<JobScheduler>, client: IngestClient) -> Self {
        Self {
            scheduler,
            client,
            in_flight: Mutex::new(Vec::new()),
        }
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    /// Claim and spawn every due job, up to `max_concurrent_jobs` in flight
    ///
    /// Returns the number of runs started.
    pub async fn dispatch_due(&self) -> Result<usize> {
        self.scheduler.ensure_running()?;
        let due = self.scheduler.load_next_jobs().await?;
        let max = self.scheduler.config().max_concurrent_jobs;

        let mut in_flight = self.in_flight.lock().await;
        in_flight.retain(|(_, handle)| !handle.is_finished());

        let mut started = 0;
        for job in due {
            if max > 0 && in_flight.len() >= max {
                debug!("{} runs in flight; deferring remaining due jobs", in_flight.len());
                break;
            }
            if in_flight.iter().any(|(identity, _)| identity == &job.identity) {
                debug!("Previous run of {} still executing; skipping", job.identity);
                continue;
            }
            let Some(claimed) = self.scheduler.claim(&job.identity).await? else {
                continue;
            };
            debug!("Dispatching {} from cursor {}", claimed.identity, claimed.cursor);
            let identity = claimed.identity.clone();
            let handle = tokio::spawn(run_job(
                Arc::clone(&self.scheduler),
                self.client.clone(),
                claimed,
            ));
            in_flight.push((identity, handle));
            started += 1;
        }
        Ok(started)
    }

    /// Wait for every in-flight run
    pub async fn drain(&self) -> Vec<JobOutcome> {
        let handles = std::mem::take(&mut *self.in_flight.lock().await);
        let mut outcomes = Vec::with_capacity(handles.len());
        for (_, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!("Job task ended abnormally: {}", e),
            }
        }
        outcomes
    }

    /// One dispatch pass followed by a drain
    pub async fn run_once(&self) -> Result<Vec<JobOutcome>> {
        self.dispatch_due().await?;
        Ok(self.drain().await)
    }

    /// Poll until `shutdown` flips to true or the scheduler is stopped,
    /// then wait for in-flight runs
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.scheduler.ensure_running()?;
        let mut ticker = tokio::time::interval(self.scheduler.config().poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Driver polling every {:?}",
            self.scheduler.config().poll_interval()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.dispatch_due().await {
                        Ok(0) => {}
                        Ok(n) => debug!("Dispatched {} jobs", n),
                        Err(IngestError::SchedulerStopped) => break,
                        Err(e) => error!("Dispatch failed: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let outcomes = self.drain().await;
        info!("Driver stopped ({} runs drained)", outcomes.len());
        Ok(())
    }
}

async fn run_job(scheduler: Arc<JobScheduler>, client: IngestClient, job: Job) -> JobOutcome {
    let claimed = job.clone();
    let identity = job.identity.clone();
    let loader = match scheduler.loader_for(&identity) {
        Ok(loader) => loader,
        Err(e) => return record_failure(&scheduler, &claimed, &e.to_string()).await,
    };

    let phases = tokio::spawn(async move {
        let loaded = loader.load(&job.cursor, job.limit).await?;
        let batch_len = loaded.items.len();
        let next = loader.save(&client, loaded).await?;
        if next.info != job.identity {
            return Err(IngestError::InvalidDescriptor(format!(
                "save for {} returned a descriptor for {}",
                job.identity, next.info
            )));
        }
        Ok::<_, IngestError>((next, batch_len))
    });

    let result = match phases.await {
        Ok(result) => result,
        Err(e) if e.is_panic() => Err(IngestError::Loader("loader panicked".to_string())),
        Err(e) => Err(IngestError::Loader(format!("loader task cancelled: {}", e))),
    };

    match result {
        Ok((next, batch_len)) => match scheduler.complete(&claimed, next, batch_len).await {
            Ok(Some(job)) => JobOutcome::Completed(job),
            Ok(None) => JobOutcome::Discarded(identity),
            Err(e) => {
                error!("Failed to record completion of {}: {}", identity, e);
                JobOutcome::Discarded(identity)
            }
        },
        Err(e) => {
            // Bad records or descriptors fail the same way on every retry
            if e.is_caller_fixable() {
                error!("Job {} failed and needs fixing upstream: {}", identity, e);
            } else {
                warn!("Job {} failed: {}", identity, e);
            }
            record_failure(&scheduler, &claimed, &e.to_string()).await
        }
    }
}

async fn record_failure(scheduler: &JobScheduler, claimed: &Job, reason: &str) -> JobOutcome {
    match scheduler.fail(claimed, reason).await {
        Ok(Some(job)) => JobOutcome::Failed(job),
        Ok(None) => JobOutcome::Discarded(claimed.identity.clone()),
        Err(e) => {
            error!("Failed to record failure of {}: {}", claimed.identity, e);
            JobOutcome::Discarded(claimed.identity.clone())
        }
    }
}
