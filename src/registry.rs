//! Schema Registry
//!
//! Holds the single active schema per identity. Updates are schema
//! *evolution*: a compatible descriptor replaces the stored one in place,
//! an incompatible one is rejected and storage is left untouched.
//!
//! Registration is read, check, conditional write. The write carries the
//! revision that was read, so two writers racing on one identity cannot both
//! win; the loser re-reads and re-checks against the winner's schema.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::compatibility::CompatibilityChecker;
use crate::config::RegistryConfig;
use crate::error::{IngestError, Result};
use crate::events::{EventBus, RegistryEvent};
use crate::identity::SchemaIdentity;
use crate::schema::{Schema, SchemaStats, StoredSchema};
use crate::storage::{EntryStore, PutOutcome, SchemaStore};

/// What a successful `register` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    /// First schema for this identity
    Registered,
    /// Replaced a compatible predecessor
    Evolved,
    /// Same descriptor already stored; nothing written
    Unchanged,
}

/// The schema registry
pub struct SchemaRegistry {
    schemas: Arc<dyn SchemaStore>,
    entries: Arc<dyn EntryStore>,
    config: RegistryConfig,
    events: EventBus,
}

impl SchemaRegistry {
    pub fn new(schemas: Arc<dyn SchemaStore>, entries: Arc<dyn EntryStore>) -> Self {
        Self::with_config(schemas, entries, RegistryConfig::default())
    }

    pub fn with_config(
        schemas: Arc<dyn SchemaStore>,
        entries: Arc<dyn EntryStore>,
        config: RegistryConfig,
    ) -> Self {
        Self {
            schemas,
            entries,
            config,
            events: EventBus::new(),
        }
    }

    /// Receive an event after every successful mutating register/remove
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    /// Register or evolve the schema at `schema.identity`
    pub async fn register(&self, schema: Schema) -> Result<RegisterOutcome> {
        let identity = schema.identity.clone();
        let checker = if self.config.strict {
            CompatibilityChecker::new().strict()
        } else {
            CompatibilityChecker::new()
        };

        for attempt in 0..=self.config.max_cas_retries {
            let current = self.schemas.get(&identity).await.map_err(|e| {
                error!("Failed to read schema {}: {}", identity, e);
                e
            })?;

            let (candidate, expected, outcome) = match current {
                None => (StoredSchema::new(schema.clone())?, None, RegisterOutcome::Registered),
                Some(stored) => {
                    if stored.fingerprint == schema.fingerprint()? {
                        debug!("Schema {} unchanged", identity);
                        return Ok(RegisterOutcome::Unchanged);
                    }
                    let result = checker.check(&stored.schema.descriptor, &schema.descriptor);
                    if !result.is_compatible {
                        let mut reasons = result.breaking_reasons();
                        if reasons.is_empty() {
                            reasons.push(result.summary.clone());
                        }
                        warn!("Rejected schema {}: {}", identity, result.summary);
                        return Err(IngestError::RegisteredSchemaIncompatible { identity, reasons });
                    }
                    (
                        stored.evolve(schema.clone())?,
                        Some(stored.revision),
                        RegisterOutcome::Evolved,
                    )
                }
            };

            match self.schemas.put(candidate, expected).await? {
                PutOutcome::Written(revision) => {
                    info!("{:?} schema {} (revision {})", outcome, identity, revision);
                    let event = match outcome {
                        RegisterOutcome::Evolved => RegistryEvent::Evolved { identity },
                        _ => RegistryEvent::Registered { identity },
                    };
                    self.events.publish(event);
                    return Ok(outcome);
                }
                PutOutcome::Conflict => {
                    warn!(
                        "Schema {} changed concurrently (attempt {}), retrying",
                        identity,
                        attempt + 1
                    );
                }
            }
        }

        Err(IngestError::Conflict(identity))
    }

    pub async fn find(&self, identity: &SchemaIdentity) -> Result<Option<Schema>> {
        Ok(self.schemas.get(identity).await?.map(|s| s.schema))
    }

    /// Like `find`, but absence is an error
    pub async fn require(&self, identity: &SchemaIdentity) -> Result<Schema> {
        self.find(identity)
            .await?
            .ok_or_else(|| IngestError::MissingSchema(identity.clone()))
    }

    pub async fn find_all(&self) -> Result<Vec<Schema>> {
        Ok(self
            .schemas
            .list()
            .await?
            .into_iter()
            .map(|s| s.schema)
            .collect())
    }

    /// Drop a schema and every entry stored under it. Irreversible.
    pub async fn remove(&self, identity: &SchemaIdentity) -> Result<()> {
        if !self.schemas.delete(identity).await? {
            return Err(IngestError::MissingSchema(identity.clone()));
        }
        let dropped = self.entries.delete_by_schema(identity).await.map_err(|e| {
            error!("Schema {} removed but dropping its entries failed: {}", identity, e);
            e
        })?;
        info!("Removed schema {} and {} entries", identity, dropped);
        self.events.publish(RegistryEvent::Removed {
            identity: identity.clone(),
        });
        Ok(())
    }

    /// Row counts per registered schema
    pub async fn load_stats(&self) -> Result<Vec<SchemaStats>> {
        let mut stats = Vec::new();
        for stored in self.schemas.list().await? {
            let identity = stored.schema.identity;
            let entry_stats = self.entries.stats(&identity).await?;
            stats.push(SchemaStats {
                identity,
                row_count: entry_stats.row_count,
                last_updated: entry_stats.last_updated,
            });
        }
        Ok(stats)
    }
}
