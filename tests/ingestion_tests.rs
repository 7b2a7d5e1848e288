//! End-to-end tests for registration, storage, pagination and scheduling.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use schema_ingest::config::{CadenceConfig, SchedulerConfig};
use schema_ingest::{
    DataRepository, DocumentStore, Driver, FieldError, IngestClient, IngestError, JobDescriptor,
    JobOutcome, JobScheduler, JobState, Loader, NewEntry, PagedSourceLoader, PropertyKind,
    RegisterOutcome, ScheduleMode, Schema, SchemaDescriptor, SchemaIdentity, SchemaRegistry,
    SourceClient,
};

fn user_identity() -> SchemaIdentity {
    SchemaIdentity::new("ns", "User", "v1").unwrap()
}

fn schema_a() -> Schema {
    let descriptor = SchemaDescriptor::builder("User")
        .required("id", PropertyKind::string())
        .required("name", PropertyKind::string())
        .build()
        .unwrap();
    Schema::new(user_identity(), descriptor).unwrap()
}

fn schema_b() -> Schema {
    let descriptor = SchemaDescriptor::builder("User")
        .required("id", PropertyKind::string())
        .build()
        .unwrap();
    Schema::new(user_identity(), descriptor).unwrap()
}

fn schema_c() -> Schema {
    let descriptor = SchemaDescriptor::builder("User")
        .required("id", PropertyKind::string())
        .required("name", PropertyKind::string())
        .optional("favoriteHobby", PropertyKind::string())
        .build()
        .unwrap();
    Schema::new(user_identity(), descriptor).unwrap()
}

struct Stack {
    store: Arc<DocumentStore>,
    registry: Arc<SchemaRegistry>,
    data: Arc<DataRepository>,
}

fn stack_on(store: Arc<DocumentStore>) -> Stack {
    let registry = Arc::new(SchemaRegistry::new(store.clone(), store.clone()));
    let data = Arc::new(DataRepository::new(Arc::clone(&registry), store.clone()));
    Stack {
        store,
        registry,
        data,
    }
}

fn stack() -> Stack {
    stack_on(Arc::new(DocumentStore::in_memory()))
}

// =============================================================================
// Registry + Repository
// =============================================================================

#[tokio::test]
async fn test_store_then_find_returns_same_record() {
    let stack = stack();
    let descriptor = SchemaDescriptor::builder("Order")
        .required("id", PropertyKind::string())
        .required("customer", PropertyKind::object("Customer"))
        .optional("lines", PropertyKind::array_of_objects("Line"))
        .define("Customer", |c| c.required("email", PropertyKind::string()))
        .define("Line", |l| {
            l.required("sku", PropertyKind::string())
                .required("qty", PropertyKind::number())
        })
        .build()
        .unwrap();
    let identity = SchemaIdentity::new("shop", "Order", "v1").unwrap();
    stack
        .registry
        .register(Schema::new(identity.clone(), descriptor).unwrap())
        .await
        .unwrap();

    let record = json!({
        "id": "o-1",
        "customer": {"email": "a@example.com"},
        "lines": [{"sku": "X", "qty": 2}, {"sku": "Y", "qty": 1.5}]
    });
    let entry = stack.data.store(&identity, "o-1", record.clone()).await.unwrap();
    let found = stack.data.find_by_id(entry.id).await.unwrap().unwrap();
    assert_eq!(found.record, record);
    assert_eq!(found.identity, identity);
}

#[tokio::test]
async fn test_identical_registration_is_a_no_op() {
    let stack = stack();
    assert_eq!(
        stack.registry.register(schema_a()).await.unwrap(),
        RegisterOutcome::Registered
    );
    assert_eq!(
        stack.registry.register(schema_a()).await.unwrap(),
        RegisterOutcome::Unchanged
    );
    assert_eq!(stack.registry.find_all().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_removing_required_property_is_rejected() {
    let stack = stack();
    stack.registry.register(schema_a()).await.unwrap();

    match stack.registry.register(schema_b()).await {
        Err(IngestError::RegisteredSchemaIncompatible { identity, reasons }) => {
            assert_eq!(identity, user_identity());
            assert!(reasons.iter().any(|r| r.contains("name")));
        }
        other => panic!("expected incompatibility, got {:?}", other),
    }
    assert_eq!(
        stack.registry.find(&user_identity()).await.unwrap(),
        Some(schema_a())
    );
}

#[tokio::test]
async fn test_additive_optional_evolution_keeps_old_data_valid() {
    let stack = stack();
    stack.registry.register(schema_a()).await.unwrap();
    let old = json!({"id": "1", "name": "Ada"});
    stack.data.store(&user_identity(), "1", old.clone()).await.unwrap();

    assert_eq!(
        stack.registry.register(schema_c()).await.unwrap(),
        RegisterOutcome::Evolved
    );
    assert!(schema_c().is_backward_compatible_with(&schema_a()));

    let page = stack
        .data
        .find_by_schema(&user_identity(), None, 10)
        .await
        .unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page.entries[0].record, old);
    schema_c().validate(&page.entries[0].record).unwrap();

    stack
        .data
        .store(
            &user_identity(),
            "2",
            json!({"id": "2", "name": "Grace", "favoriteHobby": "sailing"}),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn test_missing_required_property_message() {
    let stack = stack();
    stack.registry.register(schema_a()).await.unwrap();
    let err = stack
        .data
        .store(&user_identity(), "1", json!({"id": "1"}))
        .await
        .unwrap_err();
    match err {
        IngestError::SchemaValidation { errors, .. } => {
            assert_eq!(errors, vec![FieldError::new("", "must have required property 'name'")]);
        }
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cursor_pagination_chains_pages() {
    let stack = stack();
    stack.registry.register(schema_a()).await.unwrap();
    let batch = (0..10)
        .map(|i| NewEntry::new(format!("u{}", i), json!({"id": i.to_string(), "name": "n"})))
        .collect();
    stack.data.store_bulk(&user_identity(), batch).await.unwrap();

    let mut cursor = None;
    let mut sizes = Vec::new();
    let mut seen = Vec::new();
    loop {
        let page = stack
            .data
            .find_by_schema(&user_identity(), cursor, 3)
            .await
            .unwrap();
        if page.is_empty() {
            break;
        }
        sizes.push(page.len());
        seen.extend(page.entries.iter().map(|e| e.id));
        cursor = page.cursor;
        if !page.has_more {
            break;
        }
    }

    assert_eq!(sizes, vec![3, 3, 3, 1]);
    assert_eq!(seen.len(), 10);
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
}

// =============================================================================
// Scheduling pipeline
// =============================================================================

/// Upstream with `total` trades, ids 1..=total, wrapped in `{"result": [...]}`
struct TradeFeed {
    total: u64,
}

#[async_trait]
impl SourceClient for TradeFeed {
    async fn fetch(&self, request: Value) -> schema_ingest::Result<Value> {
        let after: u64 = request["cursor"]
            .as_str()
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| IngestError::Loader("bad cursor".into()))?;
        let limit = request["limit"].as_u64().unwrap_or(0) as usize;
        let trades: Vec<Value> = (after + 1..=self.total)
            .take(limit)
            .map(|i| json!({"tradeId": i.to_string(), "seq": i, "price": i as f64 * 0.5}))
            .collect();
        Ok(json!({ "result": trades }))
    }
}

fn trade_schema() -> Schema {
    let descriptor = SchemaDescriptor::builder("Trade")
        .required("tradeId", PropertyKind::string())
        .required("seq", PropertyKind::number())
        .required("price", PropertyKind::number())
        .build()
        .unwrap();
    Schema::new(SchemaIdentity::new("dex", "Trade", "v1").unwrap(), descriptor).unwrap()
}

#[tokio::test]
async fn test_backfill_then_incremental_pipeline() {
    let stack = stack();
    let cadence = CadenceConfig {
        backfill_secs: 0,
        incremental_secs: 900,
    };
    let client = IngestClient::new(Arc::clone(&stack.data), cadence.clone());
    let scheduler = Arc::new(JobScheduler::new(
        stack.store.clone(),
        SchedulerConfig {
            cadence,
            ..SchedulerConfig::default()
        },
    ));
    scheduler.start().await.unwrap();

    let loader = Arc::new(
        PagedSourceLoader::new(trade_schema(), TradeFeed { total: 250 })
            .items_at("/result")
            .id_field("tradeId")
            .cursor_field("seq"),
    );
    scheduler.install(loader.clone(), &client).await.unwrap();
    let driver = Driver::new(Arc::clone(&scheduler), client);

    let mut modes = Vec::new();
    for _ in 0..3 {
        let outcomes = driver.run_once().await.unwrap();
        let [JobOutcome::Completed(job)] = &outcomes[..] else {
            panic!("expected one completed run, got {:?}", outcomes);
        };
        modes.push((job.schedule_mode, job.cursor.clone()));
    }
    assert_eq!(
        modes,
        vec![
            (ScheduleMode::Backfill, "100".to_string()),
            (ScheduleMode::Backfill, "200".to_string()),
            (ScheduleMode::Incremental, "250".to_string()),
        ]
    );

    // Caught up: nothing due until the incremental cadence elapses.
    assert!(driver.run_once().await.unwrap().is_empty());

    let stats = stack.registry.load_stats().await.unwrap();
    assert_eq!(stats[0].row_count, 250);
}

#[tokio::test]
async fn test_failed_job_is_retried_and_others_keep_running() {
    struct Flaky;

    #[async_trait]
    impl SourceClient for Flaky {
        async fn fetch(&self, _request: Value) -> schema_ingest::Result<Value> {
            Err(IngestError::Loader("connection reset".into()))
        }
    }

    let stack = stack();
    let client = IngestClient::new(Arc::clone(&stack.data), CadenceConfig::default());
    let scheduler = Arc::new(JobScheduler::new(
        stack.store.clone(),
        SchedulerConfig {
            failure_backoff_secs: 0,
            ..SchedulerConfig::default()
        },
    ));
    scheduler.start().await.unwrap();

    let healthy = Arc::new(
        PagedSourceLoader::new(trade_schema(), TradeFeed { total: 5 })
            .items_at("/result")
            .id_field("tradeId")
            .cursor_field("seq"),
    );
    let user_feed = Arc::new(PagedSourceLoader::new(schema_a(), Flaky));
    scheduler.install(healthy.clone(), &client).await.unwrap();
    scheduler.install(user_feed.clone(), &client).await.unwrap();
    let driver = Driver::new(Arc::clone(&scheduler), client);

    driver.run_once().await.unwrap();
    let failed = scheduler.find_job(user_feed.identity()).await.unwrap().unwrap();
    assert_eq!(failed.state, JobState::Failed);
    assert_eq!(failed.current_fail_count, 1);
    let ok = scheduler.find_job(healthy.identity()).await.unwrap().unwrap();
    assert_eq!(ok.state, JobState::Scheduled);
    assert_eq!(ok.cursor, "5");

    // Zero backoff: the failed job is due again on the next pass.
    let outcomes = driver.run_once().await.unwrap();
    assert!(matches!(&outcomes[..], [JobOutcome::Failed(job)] if job.current_fail_count == 2));
}

// =============================================================================
// Durability
// =============================================================================

#[tokio::test]
async fn test_state_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ingest.json");

    let entry_id = {
        let stack = stack_on(Arc::new(DocumentStore::open(&path).await.unwrap()));
        stack.registry.register(schema_a()).await.unwrap();
        let entry = stack
            .data
            .store(&user_identity(), "1", json!({"id": "1", "name": "Ada"}))
            .await
            .unwrap();
        let scheduler = JobScheduler::new(stack.store.clone(), SchedulerConfig::default());
        scheduler
            .schedule(JobDescriptor::backfill_now(user_identity(), "0", 50))
            .await
            .unwrap();
        entry.id
    };

    let stack = stack_on(Arc::new(DocumentStore::open(&path).await.unwrap()));
    assert_eq!(
        stack.registry.find(&user_identity()).await.unwrap(),
        Some(schema_a())
    );
    let entry = stack.data.find_by_id(entry_id).await.unwrap().unwrap();
    assert_eq!(entry.record["name"], "Ada");

    let scheduler = JobScheduler::new(stack.store.clone(), SchedulerConfig::default());
    let job = scheduler.find_job(&user_identity()).await.unwrap().unwrap();
    assert_eq!(job.limit, 50);

    // A new record after reopen never reuses an old id.
    let next = stack
        .data
        .store(&user_identity(), "2", json!({"id": "2", "name": "Grace"}))
        .await
        .unwrap();
    assert!(next.id > entry_id);
}
