mod common;

use common::*;
use rx_store::prelude::*;
use serde_json::json;
use std::sync::Arc;

fn report(title: &str) -> (String, Value) {
    (format!("report_{title}"), json(json!({ "title": title })))
}

#[tokio::test]
async fn quota_failure_evicts_least_recently_used() -> TestResult {
    let provider = MemoryProvider::new().with_data([report("1")]).with_quota(1);
    let store = store(provider).await?;
    let provider = store.provider();

    let reports = Recorder::new();
    store.connect("report_", ConnectOptions::new(), reports.callback()).await?;
    assert_eq!(reports.deliveries(), vec![key_delivery("report_1", Some(json(json!({"title": "1"}))))]);

    let account = Recorder::new();
    store.connect("account", ConnectOptions::new(), account.callback()).await?;

    store.set("account", json(json!({"balance": 10}))).await?;

    assert_eq!(reports.absent_count("report_1"), 1);
    assert_eq!(reports.count(), 2);
    assert_eq!(account.last(), Some(key_delivery("account", Some(json(json!({"balance": 10}))))));
    assert_eq!(store.get("account").await?, Some(json(json!({"balance": 10}))));
    assert_eq!(store.get("report_1").await?, None);
    assert!(provider.contains_key("account"));
    assert!(!provider.contains_key("report_1"));
    Ok(())
}

#[tokio::test]
async fn eviction_follows_recency() -> TestResult {
    let provider = MemoryProvider::new().with_quota(2);
    let store = store(provider).await?;
    let provider = store.provider();

    store.set("report_1", json(json!({"title": "1"}))).await?;
    store.set("report_2", json(json!({"title": "2"}))).await?;
    store.get("report_1").await?;

    store.set("account", 1).await?;

    assert!(provider.contains_key("report_1"));
    assert!(!provider.contains_key("report_2"));
    assert!(provider.contains_key("account"));
    Ok(())
}

#[tokio::test]
async fn exact_subscription_pins_key() -> TestResult {
    let provider = MemoryProvider::new().with_data([report("1")]).with_quota(1);
    let store = store(provider).await?;
    let provider = store.provider();

    let pinned = Recorder::new();
    store.connect("report_1", ConnectOptions::new(), pinned.callback()).await?;

    let err = store.set("account", 1).await.unwrap_err();
    assert!(matches!(err.storage(), Some(StorageError::QuotaExceeded { key }) if key == "account"));

    // Memory keeps the committed value.
    assert_eq!(store.get("account").await?, Some(Value::from(1)));
    assert!(provider.contains_key("report_1"));
    assert!(!provider.contains_key("account"));
    assert_eq!(pinned.absent_count("report_1"), 0);
    Ok(())
}

#[tokio::test]
async fn keys_not_marked_safe_are_never_evicted() -> TestResult {
    let provider = MemoryProvider::new()
        .with_data([("settings".to_string(), Value::from("dark"))])
        .with_quota(1);
    let store = store(provider).await?;

    let err = store.set("account", 1).await.unwrap_err();
    assert!(err.storage().is_some_and(StorageError::is_recoverable));
    assert!(store.provider().contains_key("settings"));
    Ok(())
}

#[tokio::test]
async fn transient_failure_is_retried_after_eviction() -> TestResult {
    let store = store(MemoryProvider::new().with_data([report("1"), report("2")])).await?;
    let provider = store.provider();
    store.get("report_2").await?;

    provider.fail_next_writes(1);
    store.set("account", 1).await?;

    assert!(provider.contains_key("account"));
    assert_eq!(provider.snapshot().len(), 2);
    Ok(())
}

#[tokio::test]
async fn unrecoverable_failure_is_surfaced() -> TestResult {
    let store = store(MemoryProvider::new().with_data([report("1")])).await?;
    let provider = store.provider();

    provider.corrupt_next_writes(1);
    let err = store.set("account", 1).await.unwrap_err();

    assert!(matches!(err.storage(), Some(StorageError::Corrupted(_))));
    assert!(provider.contains_key("report_1"));
    assert_eq!(store.get("account").await?, Some(Value::from(1)));
    Ok(())
}

#[tokio::test]
async fn evicted_key_stays_absent_while_removal_runs() -> TestResult {
    let setup = Setup::new(MemoryProvider::new().with_data([report("1")]).with_quota(1));
    let provider = setup.provider.clone();
    let backend = Arc::new(GatedRemovals::new(provider.clone()));
    let store = setup.build_over(backend.clone()).await?;

    let reports = Recorder::new();
    store.connect("report_", ConnectOptions::new(), reports.callback()).await?;

    let writer = tokio::spawn({
        let store = store.clone();
        async move { store.set("account", 1).await }
    });
    backend.removal_blocked().await;

    assert_eq!(reports.absent_count("report_1"), 1);
    assert_eq!(store.get("report_1").await?, None);

    backend.open();
    writer.await??;

    assert_eq!(store.get("report_1").await?, None);
    assert_eq!(reports.absent_count("report_1"), 1);
    assert!(!provider.contains_key("report_1"));
    assert!(provider.contains_key("account"));
    Ok(())
}
