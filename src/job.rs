//! Job records and the descriptor wire format

use std::collections::VecDeque;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::identity::SchemaIdentity;

/// Cursor handed to a loader that has never run
pub const DEFAULT_CURSOR: &str = "0";

/// Batch size used when neither the loader nor the descriptor picks one
pub const DEFAULT_LIMIT: u32 = 100;

/// Number of run notes kept per job
pub const JOB_NOTES_LIMIT: usize = 100;

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    /// Waiting for `scheduled_at`
    Scheduled,
    /// Claimed by the driver, awaiting the loader
    Running,
    /// Last run failed; retried with backoff until reset or exhausted
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Scheduled => "SCHEDULED",
            JobState::Running => "RUNNING",
            JobState::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// How eagerly a job should be re-run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleMode {
    /// More history is pending; run again soon
    Backfill,
    /// Caught up; poll on the steady cadence
    Incremental,
}

impl ScheduleMode {
    /// A full batch means the source likely has more to give
    pub fn for_batch(batch_len: usize, limit: u32) -> Self {
        if limit > 0 && batch_len >= limit as usize {
            ScheduleMode::Backfill
        } else {
            ScheduleMode::Incremental
        }
    }
}

impl fmt::Display for ScheduleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleMode::Backfill => f.write_str("BACKFILL"),
            ScheduleMode::Incremental => f.write_str("INCREMENTAL"),
        }
    }
}

/// What a loader's `save` phase (or an operator) asks the scheduler to do next
///
/// Wire shape:
/// `{"info": {"namespace", "name", "version"}, "scheduledAt": <epoch-ms>,
///   "scheduleMode": "BACKFILL"|"INCREMENTAL", "cursor": "...", "limit": 100}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDescriptor {
    pub info: SchemaIdentity,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub scheduled_at: DateTime<Utc>,
    pub schedule_mode: ScheduleMode,
    pub cursor: String,
    pub limit: u32,
}

impl JobDescriptor {
    /// A descriptor that starts backfilling from `cursor` right away
    pub fn backfill_now(info: SchemaIdentity, cursor: impl Into<String>, limit: u32) -> Self {
        Self {
            info,
            scheduled_at: Utc::now(),
            schedule_mode: ScheduleMode::Backfill,
            cursor: cursor.into(),
            limit,
        }
    }
}

/// A timestamped line in a job's run history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobNote {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// Scheduling record for one schema identity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub identity: SchemaIdentity,
    pub state: JobState,
    pub schedule_mode: ScheduleMode,
    pub cursor: String,
    pub limit: u32,
    pub current_fail_count: u32,
    pub scheduled_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub previous_scheduled_at: Option<DateTime<Utc>>,
    /// Bumped by every claim and reset; a run only reports back while it
    /// still matches
    #[serde(default)]
    pub generation: u64,
    #[serde(default)]
    pub notes: VecDeque<JobNote>,
}

impl Job {
    /// A fresh SCHEDULED job built from a descriptor
    pub fn from_descriptor(descriptor: JobDescriptor) -> Self {
        Self {
            identity: descriptor.info,
            state: JobState::Scheduled,
            schedule_mode: descriptor.schedule_mode,
            cursor: descriptor.cursor,
            limit: descriptor.limit,
            current_fail_count: 0,
            scheduled_at: descriptor.scheduled_at,
            updated_at: Utc::now(),
            previous_scheduled_at: None,
            generation: 0,
            notes: VecDeque::new(),
        }
    }

    /// The descriptor that would reproduce this job's schedule
    pub fn descriptor(&self) -> JobDescriptor {
        JobDescriptor {
            info: self.identity.clone(),
            scheduled_at: self.scheduled_at,
            schedule_mode: self.schedule_mode,
            cursor: self.cursor.clone(),
            limit: self.limit,
        }
    }

    /// Whether the driver may claim this job at `now`
    pub fn is_due(&self, now: DateTime<Utc>, max_failures: Option<u32>) -> bool {
        let exhausted = self.state == JobState::Failed
            && max_failures.is_some_and(|max| self.current_fail_count >= max);
        self.state != JobState::Running && !exhausted && self.scheduled_at <= now
    }

    /// Whether `run` is the claim this job is currently running under
    pub fn is_running_as(&self, run: &Job) -> bool {
        self.state == JobState::Running && self.generation == run.generation
    }

    /// Append a note, dropping the oldest beyond [`JOB_NOTES_LIMIT`]
    pub fn note(&mut self, message: impl Into<String>) {
        self.notes.push_back(JobNote {
            at: Utc::now(),
            message: message.into(),
        });
        while self.notes.len() > JOB_NOTES_LIMIT {
            self.notes.pop_front();
        }
    }
}
