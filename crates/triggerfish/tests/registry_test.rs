//! Tests for the trigger registry

mod common;

use common::{config, payload, wait_until, RegistryHarness};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use triggerfish::envelope::Notification;
use triggerfish::error::{Error, ErrorCategory};
use triggerfish::lifecycle::TriggerState;
use triggerfish::multiplexer::Subscription;
use triggerfish_sql::catalog::{FieldType, ModelInfo, StaticCatalog};
use triggerfish_sql::trigger::TriggerBuilder;
use triggerfish_sql::ValidationError;

fn order_status() -> TriggerBuilder {
    TriggerBuilder::new()
        .model("orders")
        .name("order_status")
        .after()
        .on_update()
        .notify()
}

fn order_created() -> TriggerBuilder {
    TriggerBuilder::new()
        .model("orders")
        .name("order_created")
        .after()
        .on_insert()
        .notify()
}

fn counting(counter: &Arc<AtomicUsize>) -> Subscription {
    let counter = counter.clone();
    Subscription::from_fn(move |_n: &Notification| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

// ============================================================================
// Definitions
// ============================================================================

#[tokio::test]
async fn test_define_rejects_duplicate_names_per_table() {
    let harness = RegistryHarness::new();
    harness.registry.define(order_status()).unwrap();

    let err = harness.registry.define(order_status()).unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::DuplicateTrigger { .. })
    ));
    assert_eq!(harness.registry.triggers().len(), 1);

    // same name on another table is fine
    harness
        .registry
        .define(order_status().model("invoices"))
        .unwrap();
    assert_eq!(harness.registry.triggers().len(), 2);
}

#[tokio::test]
async fn test_define_applies_default_schema() {
    let mut config = config();
    config.registry.default_schema = "shop".to_string();
    let harness = RegistryHarness::with_config(&config);

    let trigger = harness.registry.define(order_status()).unwrap();
    assert_eq!(trigger.key(), "shop.orders.order_status");
    assert!(harness.registry.get("shop.orders.order_status").is_some());
    assert!(harness.registry.get("public.orders.order_status").is_none());

    let explicit = harness
        .registry
        .define(order_created().schema("public"))
        .unwrap();
    assert_eq!(explicit.key(), "public.orders.order_created");
}

#[tokio::test]
async fn test_define_resolves_models_through_catalog() {
    let catalog = StaticCatalog::new().with_model(
        "Order",
        ModelInfo::new("sales", "orders").with_field("status", FieldType::Text),
    );
    let harness = RegistryHarness::new();
    let registry = harness.registry.with_catalog(Arc::new(catalog));

    let trigger = registry
        .define(order_status().model("Order").watch_columns(["status"]))
        .unwrap();
    assert_eq!(trigger.key(), "sales.orders.order_status");
    assert_eq!(registry.triggers_for_model("Order").len(), 1);

    let err = registry.define(order_status().model("Invoice")).unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::UnknownModel(ref m)) if m == "Invoice"
    ));
}

#[tokio::test]
async fn test_invalid_definition_never_reaches_database() {
    let harness = RegistryHarness::new();
    let err = harness
        .registry
        .define(TriggerBuilder::new().model("orders").name("t").after().notify())
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Validation);
    assert!(harness.registry.triggers().is_empty());
    assert!(harness.factory.statements().is_empty());
}

// ============================================================================
// Bulk operations
// ============================================================================

#[tokio::test]
async fn test_setup_and_listen_all() {
    let harness = RegistryHarness::new();
    let status = harness.registry.define(order_status()).unwrap();
    let created = harness.registry.define(order_created()).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));

    let ids = harness
        .registry
        .subscribe_model("orders", counting(&counter))
        .await
        .unwrap();
    assert_eq!(ids.len(), 2);
    assert_eq!(ids[0].0, "public.orders.order_status");

    harness.registry.setup_all().await.unwrap();
    harness.registry.listen_all().await.unwrap();
    assert_eq!(status.state(), TriggerState::Listening);
    assert_eq!(created.state(), TriggerState::Listening);
    assert_eq!(
        harness.broker.listening_channels(),
        vec!["orders_order_created", "orders_order_status"]
    );

    harness.broker.publish(
        "orders_order_status",
        &payload("UPDATE", "orders", json!({"id": 1})),
    );
    harness.broker.publish(
        "orders_order_created",
        &payload("INSERT", "orders", json!({"id": 2})),
    );
    wait_until(|| counter.load(Ordering::SeqCst) == 2).await;

    let (key, id) = ids[1].clone();
    assert!(harness.registry.unsubscribe_trigger(&key, id).await.unwrap());
    assert_eq!(created.handler_count().await, 0);
}

#[tokio::test]
async fn test_setup_all_stops_at_first_failure() {
    let harness = RegistryHarness::new();
    let status = harness.registry.define(order_status()).unwrap();
    let created = harness.registry.define(order_created()).unwrap();
    harness.factory.fail_statements_containing("\"order_status\"");

    assert!(harness.registry.setup_all().await.is_err());
    assert_eq!(status.state(), TriggerState::DefinitionComplete);
    assert_eq!(created.state(), TriggerState::DefinitionComplete);
}

#[tokio::test]
async fn test_drop_all_collects_failures() {
    let harness = RegistryHarness::new();
    let status = harness.registry.define(order_status()).unwrap();
    let created = harness.registry.define(order_created()).unwrap();
    harness.registry.setup_all().await.unwrap();
    harness
        .factory
        .fail_statements_containing("DROP TRIGGER IF EXISTS \"order_status\"");

    let report = harness.registry.drop_all().await;
    assert_eq!(report.attempted, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].target, "public.orders.order_status");
    assert_eq!(status.state(), TriggerState::Created);
    assert_eq!(created.state(), TriggerState::Dropped);
}

#[tokio::test]
async fn test_unknown_targets() {
    let harness = RegistryHarness::new();
    harness.registry.define(order_status()).unwrap();

    let err = harness
        .registry
        .subscribe_model("invoices", Subscription::from_fn(|_n: &Notification| Ok(())))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Validation(ValidationError::UnknownModel(_))
    ));

    let err = harness
        .registry
        .subscribe_trigger(
            "public.orders.missing",
            Subscription::from_fn(|_n: &Notification| Ok(())),
        )
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "unknown trigger 'public.orders.missing'");
}

// ============================================================================
// Metadata mirror
// ============================================================================

#[tokio::test]
async fn test_metadata_mirror_records_and_forgets() {
    let harness = RegistryHarness::with_config(&config().with_metadata_mirror(true));
    let trigger = harness.registry.define(order_status()).unwrap();
    assert!(harness.registry.mirror().is_some());

    trigger.setup().await.unwrap();
    let statements = harness.factory.statements();
    assert!(statements
        .iter()
        .any(|s| s.starts_with("CREATE TABLE IF NOT EXISTS") && s.contains("triggerfish_triggers")));
    assert!(statements.iter().any(|s| s.starts_with("INSERT INTO")));

    harness.factory.clear_statements();
    harness.registry.define(order_created()).unwrap().setup().await.unwrap();
    assert!(!harness
        .factory
        .statements()
        .iter()
        .any(|s| s.starts_with("CREATE TABLE IF NOT EXISTS")));

    trigger.drop_trigger().await.unwrap();
    assert!(harness
        .factory
        .statements()
        .iter()
        .any(|s| s.starts_with("DELETE FROM")));
}

#[tokio::test]
async fn test_metadata_mirror_failure_does_not_fail_setup() {
    let harness = RegistryHarness::with_config(&config().with_metadata_mirror(true));
    harness.factory.fail_statements_containing("INSERT INTO");
    let trigger = harness.registry.define(order_status()).unwrap();

    trigger.setup().await.unwrap();
    assert_eq!(trigger.state(), TriggerState::Created);
    assert_eq!(
        harness.factory.statements().last().map(String::as_str),
        Some("ROLLBACK")
    );
}

// ============================================================================
// Disposal
// ============================================================================

#[tokio::test]
async fn test_dispose_stops_everything_and_keeps_triggers_installed() {
    let harness = RegistryHarness::new();
    let trigger = harness.registry.define(order_status()).unwrap();
    let counter = Arc::new(AtomicUsize::new(0));
    trigger.subscribe(counting(&counter)).await.unwrap();
    harness.registry.setup_all().await.unwrap();
    harness.registry.listen_all().await.unwrap();
    assert_eq!(harness.broker.listening_channels(), vec!["orders_order_status"]);
    harness.factory.clear_statements();

    let report = harness.registry.dispose().await;
    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(trigger.state(), TriggerState::Stopped);
    assert!(harness.factory.statements().is_empty());
    assert!(harness.broker.listening_channels().is_empty());
    assert_eq!(harness.broker.open_connections(), 0);
    assert!(harness.registry.manager().is_disposed());
    assert!(harness.registry.multiplexer().is_disposed());
    assert!(harness.registry.triggers().is_empty());

    assert!(harness
        .registry
        .define(order_created())
        .unwrap_err()
        .is_disposed());
    assert_eq!(harness.registry.dispose().await.attempted, 0);
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let mut config = config();
    config.pool.max_size = 0;
    let result = triggerfish::registry::Registry::with_backends(
        &config,
        Arc::new(triggerfish::testing::MemoryBroker::new().connector()),
        Arc::new(triggerfish::testing::MemoryConnectionFactory::new()),
    );
    assert_eq!(
        result.unwrap_err().category(),
        ErrorCategory::Configuration
    );
}
