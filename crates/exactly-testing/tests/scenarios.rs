//! End-to-end scenarios: replay, concurrent duplicates, injected commit
//! failures, and business failures.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use exactly_core::{
    classify, json, DocumentStore, ErrorClass, ExactlyError, Executor, ExecutorConfig,
    ManualClock, MemoryStore, OperationKey, ReceiptMetadata, ReceiptStatus, RetryConfig,
    StoreError, Transaction,
};
use exactly_testing::fixtures::{
    counter_path, debit, increment_counter, read_coins, read_count, wallet_path, DebitResult,
    InsufficientFunds,
};
use exactly_testing::{init_test_tracing, FaultyStore};
use serde_json::Value;

type Store = FaultyStore<MemoryStore>;

fn executor() -> Executor<Store> {
    init_test_tracing();
    Executor::new(Arc::new(FaultyStore::new(MemoryStore::new())))
}

fn key(op: &str) -> OperationKey {
    OperationKey::new("p1", op).unwrap()
}

async fn increment(executor: &Executor<Store>, op: &str) -> anyhow::Result<Value> {
    let path = counter_path("p1")?;
    executor
        .run_with_receipt(&key(op), "increment", &ReceiptMetadata::none(), move |tx| {
            let path = path.clone();
            Box::pin(async move { increment_counter(tx, &path).await })
        })
        .await
}

async fn spend(executor: &Executor<Store>, op: &str, amount: i64) -> anyhow::Result<DebitResult> {
    let wallet = wallet_path("p1")?;
    let metadata = ReceiptMetadata::for_inputs("spend", &json!({ "amount": amount }))?;
    executor
        .run_with_receipt(&key(op), "spendCoins", &metadata, move |tx| {
            let wallet = wallet.clone();
            Box::pin(async move { debit(tx, &wallet, amount).await })
        })
        .await
}

#[tokio::test]
async fn first_call_applies_the_effect_once() {
    let executor = executor();

    let result = increment(&executor, "op-a").await.unwrap();

    assert_eq!(result, json!({ "count": 1 }));
    let store = executor.store();
    assert_eq!(read_count(store.as_ref(), &counter_path("p1").unwrap()).await, Some(1));
    let receipt = executor.receipts().get(&key("op-a")).await.unwrap().unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Completed);
    assert_eq!(receipt.result, Some(json!({ "count": 1 })));
}

#[tokio::test]
async fn retried_call_replays_the_stored_result() {
    let executor = executor();
    increment(&executor, "op-b").await.unwrap();
    let commits = executor.store().commits();

    let replay = increment(&executor, "op-b").await.unwrap();

    assert_eq!(replay, json!({ "count": 1 }));
    assert_eq!(executor.store().commits(), commits, "a replay writes nothing");
    let store = executor.store();
    assert_eq!(read_count(store.as_ref(), &counter_path("p1").unwrap()).await, Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_increment_exactly_once() {
    let executor = executor();
    executor
        .store()
        .set_commit_delay(Some(Duration::from_millis(5)));

    let mut handles = Vec::new();
    for _ in 0..12 {
        let executor = executor.clone();
        handles.push(tokio::spawn(async move { increment(&executor, "op-c").await }));
    }

    for handle in handles {
        match handle.await.unwrap() {
            Ok(result) => assert_eq!(result, json!({ "count": 1 })),
            Err(err) => assert_eq!(classify(&err), ErrorClass::InFlight, "{err:#}"),
        }
    }

    let store = executor.store();
    assert_eq!(read_count(store.as_ref(), &counter_path("p1").unwrap()).await, Some(1));
    let receipt = executor.receipts().get(&key("op-c")).await.unwrap().unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Completed);
}

#[tokio::test]
async fn failed_commit_leaves_no_effect_and_a_failed_receipt() {
    let executor = executor();
    // The claim commits; the business commit fails.
    executor
        .store()
        .script_commits([None, Some(StoreError::Backend("disk full".into()))]);

    let err = increment(&executor, "op-d").await.unwrap_err();

    assert_eq!(
        err.downcast_ref::<StoreError>(),
        Some(&StoreError::Backend("disk full".into()))
    );
    let store = executor.store();
    assert_eq!(read_count(store.as_ref(), &counter_path("p1").unwrap()).await, None);
    let receipt = executor.receipts().get(&key("op-d")).await.unwrap().unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Failed);
    assert_eq!(receipt.result, None);
    assert!(receipt.error.unwrap().contains("disk full"));

    // The failure does not poison the key.
    assert_eq!(increment(&executor, "op-d").await.unwrap(), json!({ "count": 1 }));
}

#[tokio::test]
async fn conflicting_commits_rerun_the_work() {
    init_test_tracing();
    let store = Arc::new(FaultyStore::new(MemoryStore::new()));
    let config = ExecutorConfig::new().with_retry(
        RetryConfig::new()
            .with_base_delay(Duration::from_millis(1))
            .with_max_delay(Duration::from_millis(2)),
    );
    let executor = Executor::with_config(Arc::clone(&store), config);
    let conflict = || {
        Some(StoreError::Conflict {
            path: "counters/p1".into(),
        })
    };
    store.script_commits([None, conflict(), conflict()]);

    let runs = Arc::new(AtomicUsize::new(0));
    let counted = Arc::clone(&runs);
    let path = counter_path("p1").unwrap();
    let result: Value = executor
        .run_with_receipt(&key("op-e"), "increment", &ReceiptMetadata::none(), move |tx| {
            let path = path.clone();
            counted.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move { increment_counter(tx, &path).await })
        })
        .await
        .unwrap();

    assert_eq!(result, json!({ "count": 1 }));
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert_eq!(store.injected(), 2);
    assert_eq!(read_count(store.as_ref(), &counter_path("p1").unwrap()).await, Some(1));
}

#[tokio::test]
async fn unrecordable_failure_still_returns_the_original_error() {
    init_test_tracing();
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(FaultyStore::new(MemoryStore::with_clock(clock.clone())));
    let executor = Executor::new(Arc::clone(&store));
    store.script_commits([
        None,
        Some(StoreError::Backend("business write lost".into())),
        Some(StoreError::Backend("receipt write lost".into())),
    ]);

    let err = increment(&executor, "op-f").await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<StoreError>(),
        Some(&StoreError::Backend("business write lost".into()))
    );

    // The receipt is stuck in progress until it expires.
    let receipt = executor.receipts().get(&key("op-f")).await.unwrap().unwrap();
    assert_eq!(receipt.status, ReceiptStatus::InProgress);
    let err = increment(&executor, "op-f").await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ExactlyError>(),
        Some(ExactlyError::OperationInProgress { .. })
    ));

    clock.advance(chrono::Duration::seconds(121));
    assert_eq!(increment(&executor, "op-f").await.unwrap(), json!({ "count": 1 }));
}

#[tokio::test]
async fn business_failure_is_surfaced_and_retryable() {
    let executor = executor();
    let wallet = wallet_path("p1").unwrap();
    let store = executor.store();
    store.set(&wallet, json!({ "coins": 30 }), false).await.unwrap();

    let err = spend(&executor, "op-g", 50).await.unwrap_err();
    assert_eq!(
        err.downcast_ref::<InsufficientFunds>(),
        Some(&InsufficientFunds {
            balance: 30,
            requested: 50
        })
    );
    assert_eq!(read_coins(store.as_ref(), &wallet).await, Some(30));
    let receipt = executor.receipts().get(&key("op-g")).await.unwrap().unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Failed);

    store.set(&wallet, json!({ "coins": 80 }), true).await.unwrap();
    let spent = spend(&executor, "op-g", 50).await.unwrap();
    assert_eq!(spent, DebitResult { balance: 30 });
    assert_eq!(spend(&executor, "op-g", 50).await.unwrap(), spent);
    assert_eq!(read_coins(store.as_ref(), &wallet).await, Some(30));

    let err = spend(&executor, "op-g", 75).await.unwrap_err();
    assert_eq!(classify(&err), ErrorClass::InvalidRequest);
}

#[tokio::test]
async fn insufficient_funds_fails_one_key_and_not_the_next() {
    let executor = executor();
    let wallet = wallet_path("p1").unwrap();
    let store = executor.store();
    store.set(&wallet, json!({ "coins": 100 }), false).await.unwrap();

    let err = spend(&executor, "op-2", 500).await.unwrap_err();
    assert!(err.downcast_ref::<InsufficientFunds>().is_some());
    assert_eq!(read_coins(store.as_ref(), &wallet).await, Some(100));
    let receipt = executor.receipts().get(&key("op-2")).await.unwrap().unwrap();
    assert_eq!(receipt.status, ReceiptStatus::Failed);

    let spent = spend(&executor, "op-3", 60).await.unwrap();
    assert_eq!(spent, DebitResult { balance: 40 });
    assert_eq!(read_coins(store.as_ref(), &wallet).await, Some(40));
}

#[tokio::test]
async fn in_flight_attempt_rejects_duplicates() {
    let executor = executor();
    executor
        .create_in_progress_receipt(&key("op-h"), "increment", &ReceiptMetadata::none())
        .await
        .unwrap();

    let err = executor.check_idempotency(&key("op-h")).await.unwrap_err();
    assert!(matches!(err, ExactlyError::OperationInProgress { .. }));

    let err = increment(&executor, "op-h").await.unwrap_err();
    assert!(classify(&err).is_retryable());
    let store = executor.store();
    assert_eq!(read_count(store.as_ref(), &counter_path("p1").unwrap()).await, None);
}

#[tokio::test]
async fn composer_prices_from_the_catalog_then_debits() {
    let executor = executor();
    let store = executor.store();
    let catalog = exactly_core::DocumentPath::new("catalog", "silver-crate").unwrap();
    let wallet = wallet_path("p1").unwrap();
    store.set(&catalog, json!({ "price": 40 }), false).await.unwrap();
    store.set(&wallet, json!({ "coins": 100 }), false).await.unwrap();

    for _ in 0..2 {
        let catalog = catalog.clone();
        let wallet = wallet.clone();
        let bought: DebitResult = executor
            .run_read_then_write_with_receipt(
                &key("op-i"),
                "buyCrate",
                &ReceiptMetadata::with_kind("shop"),
                move |tx| {
                    let catalog = catalog.clone();
                    Box::pin(async move {
                        let entry = tx.get(&catalog).await?.unwrap_or(Value::Null);
                        entry["price"]
                            .as_i64()
                            .ok_or_else(|| anyhow::anyhow!("crate has no price"))
                    })
                },
                move |tx, price| {
                    let wallet = wallet.clone();
                    Box::pin(async move { debit(tx, &wallet, price).await })
                },
            )
            .await
            .unwrap();
        assert_eq!(bought, DebitResult { balance: 60 });
    }

    assert_eq!(read_coins(store.as_ref(), &wallet).await, Some(60));
}
