//! Schema-aware record repository
//!
//! Every write is validated against the identity's current schema before it
//! reaches the entry store. Reads page by synthetic id.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error};

use crate::config::RepositoryConfig;
use crate::entry::{Entry, EntryId, EntryPage, NewEntry};
use crate::error::{IngestError, Result};
use crate::identity::SchemaIdentity;
use crate::query::Filter;
use crate::registry::SchemaRegistry;
use crate::storage::EntryStore;

pub struct DataRepository {
    registry: Arc<SchemaRegistry>,
    entries: Arc<dyn EntryStore>,
    config: RepositoryConfig,
}

impl DataRepository {
    pub fn new(registry: Arc<SchemaRegistry>, entries: Arc<dyn EntryStore>) -> Self {
        Self::with_config(registry, entries, RepositoryConfig::default())
    }

    pub fn with_config(
        registry: Arc<SchemaRegistry>,
        entries: Arc<dyn EntryStore>,
        config: RepositoryConfig,
    ) -> Self {
        Self {
            registry,
            entries,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// Validate and upsert one record
    pub async fn store(
        &self,
        identity: &SchemaIdentity,
        upstream_id: impl Into<String>,
        record: Value,
    ) -> Result<Entry> {
        let mut stored = self
            .store_bulk(identity, vec![NewEntry::new(upstream_id, record)])
            .await?;
        stored.pop().ok_or_else(|| IngestError::Database {
            context: format!("storing record for {}", identity),
            source: "entry store returned no rows".into(),
        })
    }

    /// Validate every record, then upsert all of them as one unit
    ///
    /// A single invalid record rejects the whole batch.
    pub async fn store_bulk(&self, identity: &SchemaIdentity, records: Vec<NewEntry>) -> Result<Vec<Entry>> {
        let schema = self.registry.require(identity).await?;
        let validator = schema.validator()?;
        for record in &records {
            validator.validate(&record.record)?;
        }
        if records.is_empty() {
            return Ok(Vec::new());
        }
        let count = records.len();
        let stored = self.entries.upsert_many(identity, records).await.map_err(|e| {
            error!("Failed to store {} records for {}: {}", count, identity, e);
            e
        })?;
        debug!("Stored {} records for {}", count, identity);
        Ok(stored)
    }

    pub async fn find_by_id(&self, id: EntryId) -> Result<Option<Entry>> {
        self.entries.get(id).await
    }

    /// Entries after `cursor` in ascending id order
    pub async fn find_by_schema(
        &self,
        identity: &SchemaIdentity,
        cursor: Option<EntryId>,
        limit: usize,
    ) -> Result<EntryPage> {
        self.find_by_query(identity, &[], cursor, limit).await
    }

    /// Entries after `cursor` matching every filter
    pub async fn find_by_query(
        &self,
        identity: &SchemaIdentity,
        filters: &[Filter],
        cursor: Option<EntryId>,
        limit: usize,
    ) -> Result<EntryPage> {
        self.registry.require(identity).await?;
        let limit = limit.min(self.config.max_page_size);
        if limit == 0 {
            return Ok(EntryPage::default());
        }
        let rows = self
            .entries
            .scan(identity, cursor, filters, limit + 1)
            .await?;
        Ok(EntryPage::from_scan(rows, limit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{PropertyKind, SchemaDescriptor};
    use crate::error::FieldError;
    use crate::query::FilterOperator;
    use crate::schema::Schema;
    use crate::storage::DocumentStore;
    use serde_json::json;

    fn identity() -> SchemaIdentity {
        SchemaIdentity::new("ns", "User", "v1").unwrap()
    }

    async fn repository() -> DataRepository {
        let store = Arc::new(DocumentStore::in_memory());
        let registry = Arc::new(SchemaRegistry::new(store.clone(), store.clone()));
        let descriptor = SchemaDescriptor::builder("User")
            .required("id", PropertyKind::string())
            .required("name", PropertyKind::string())
            .optional("age", PropertyKind::number())
            .build()
            .unwrap();
        registry
            .register(Schema::new(identity(), descriptor).unwrap())
            .await
            .unwrap();
        DataRepository::with_config(registry, store, RepositoryConfig { max_page_size: 5 })
    }

    #[tokio::test]
    async fn test_store_then_find_by_id() {
        let repo = repository().await;
        let record = json!({"id": "1", "name": "Ada", "age": 36});
        let entry = repo.store(&identity(), "1", record.clone()).await.unwrap();
        let found = repo.find_by_id(entry.id).await.unwrap().unwrap();
        assert_eq!(found.record, record);
        assert_eq!(found.upstream_id, "1");
    }

    #[tokio::test]
    async fn test_store_rejects_invalid_record() {
        let repo = repository().await;
        let err = repo.store(&identity(), "1", json!({"id": "1"})).await.unwrap_err();
        match err {
            IngestError::SchemaValidation { errors, .. } => assert_eq!(
                errors,
                vec![FieldError::new("", "must have required property 'name'")]
            ),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unregistered_identity_is_missing_schema() {
        let repo = repository().await;
        let other = SchemaIdentity::new("ns", "Ghost", "v1").unwrap();
        assert!(matches!(
            repo.store(&other, "1", json!({})).await,
            Err(IngestError::MissingSchema(_))
        ));
        assert!(matches!(
            repo.find_by_schema(&other, None, 10).await,
            Err(IngestError::MissingSchema(_))
        ));
    }

    #[tokio::test]
    async fn test_bulk_is_all_or_nothing() {
        let repo = repository().await;
        let batch = vec![
            NewEntry::new("1", json!({"id": "1", "name": "a"})),
            NewEntry::new("2", json!({"id": "2"})),
        ];
        assert!(repo.store_bulk(&identity(), batch).await.is_err());
        let page = repo.find_by_schema(&identity(), None, 10).await.unwrap();
        assert!(page.is_empty());
    }

    #[tokio::test]
    async fn test_query_filters_and_clamps_limit() {
        let repo = repository().await;
        let batch = (0..10)
            .map(|i| NewEntry::new(i.to_string(), json!({"id": i.to_string(), "name": "n", "age": i})))
            .collect();
        repo.store_bulk(&identity(), batch).await.unwrap();

        let filters = vec![Filter::new("age", FilterOperator::Gte, 3)];
        let page = repo.find_by_query(&identity(), &filters, None, 100).await.unwrap();
        assert_eq!(page.len(), 5);
        assert!(page.has_more);
        assert_eq!(page.entries[0].record["age"], 3);

        let rest = repo
            .find_by_query(&identity(), &filters, page.cursor, 100)
            .await
            .unwrap();
        assert_eq!(rest.len(), 2);
        assert!(!rest.has_more);

        assert!(repo.find_by_schema(&identity(), None, 0).await.unwrap().is_empty());
    }
}
