//! Schema Ingest
//!
//! A schema registry with backward-compatible evolution, a schema-validated
//! record repository, and a cursor-driven ingestion scheduler.
//!
//! ## Features
//!
//! - **Compatibility Checking**: Structural detection of breaking descriptor changes
//! - **Compare-and-Swap Registration**: Concurrent evolutions of one identity cannot both win
//! - **Validated Storage**: Every record is checked against its schema before it is written
//! - **Cursor Pagination**: Stable, filterable pages ordered by synthetic id
//! - **Adaptive Scheduling**: Full batches keep backfilling, short batches settle into incremental polling
//!
//! ## Architecture
//!
//! ```text
//!  upstream API ──> Loader ──load──> LoadingResult ──save──> DataRepository ──> EntryStore
//!                     ^                                  │           │
//!                     │                                  v           v
//!                   Driver <── JobScheduler <── JobDescriptor   SchemaRegistry ──> SchemaStore
//!                                  │
//!                                  v
//!                               JobStore
//! ```
//!
//! [`storage::DocumentStore`] implements all three stores, in memory or
//! backed by a JSON snapshot.

pub mod checksum;
pub mod compatibility;
pub mod config;
pub mod descriptor;
pub mod entry;
pub mod error;
pub mod events;
pub mod identity;
pub mod job;
pub mod loader;
pub mod query;
pub mod registry;
pub mod repository;
pub mod scheduler;
pub mod schema;
pub mod storage;

pub use checksum::Checksum;
pub use compatibility::{is_compatible, CompatibilityChecker, CompatibilityResult};
pub use config::IngestConfig;
pub use descriptor::{PropertyKind, SchemaDescriptor};
pub use entry::{Entry, EntryId, EntryPage, NewEntry};
pub use error::{FieldError, IngestError, Result};
pub use events::RegistryEvent;
pub use identity::SchemaIdentity;
pub use job::{Job, JobDescriptor, JobState, ScheduleMode};
pub use loader::{IngestClient, LoadedItem, Loader, LoadingResult, PagedSourceLoader, SourceClient};
pub use query::{Filter, FilterOperator};
pub use registry::{RegisterOutcome, SchemaRegistry};
pub use repository::DataRepository;
pub use scheduler::{Driver, JobOutcome, JobScheduler};
pub use schema::{Schema, SchemaStats};
pub use storage::DocumentStore;
