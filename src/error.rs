//! Error types for the ingestion core

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identity::SchemaIdentity;

/// Result type for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// A single structural validation failure for a record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// JSON pointer of the offending location ("" for the record root)
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Ingestion errors
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Record failed validation against {identity}: {}", summarize(.errors))]
    SchemaValidation {
        identity: SchemaIdentity,
        errors: Vec<FieldError>,
    },

    #[error("Schema {identity} is not backward compatible with the registered schema: {}", .reasons.join("; "))]
    RegisteredSchemaIncompatible {
        identity: SchemaIdentity,
        reasons: Vec<String>,
    },

    #[error("No schema registered for {0}")]
    MissingSchema(SchemaIdentity),

    #[error("Database error: {context}: {source}")]
    Database {
        context: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Concurrent modification of {0} kept winning the compare-and-swap")]
    Conflict(SchemaIdentity),

    #[error("No loader registered for job {0}")]
    NoLoaderForJob(SchemaIdentity),

    #[error("A loader is already registered under {0}")]
    LoaderAlreadyRegistered(String),

    #[error("Scheduler has not been started")]
    SchedulerNotStarted,

    #[error("Scheduler has been stopped")]
    SchedulerStopped,

    #[error("Could not create job for {identity}: {reason}")]
    JobCreationFailed {
        identity: SchemaIdentity,
        reason: String,
    },

    #[error("Invalid schema identity: {0}")]
    InvalidIdentity(String),

    #[error("Invalid schema descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Loader error: {0}")]
    Loader(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl IngestError {
    /// Wrap a storage failure with the operation it interrupted
    pub fn database<E>(context: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Database {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// Errors the caller must fix; retrying the same input cannot succeed
    pub fn is_caller_fixable(&self) -> bool {
        matches!(
            self,
            IngestError::SchemaValidation { .. }
                | IngestError::RegisteredSchemaIncompatible { .. }
                | IngestError::MissingSchema(_)
                | IngestError::InvalidIdentity(_)
                | IngestError::InvalidDescriptor(_)
        )
    }
}

fn summarize(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| {
            if e.field.is_empty() {
                e.message.clone()
            } else {
                format!("{} {}", e.field, e.message)
            }
        })
        .collect::<Vec<_>>()
        .join(", ")
}
