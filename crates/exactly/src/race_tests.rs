//! Concurrent duplicate submissions against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use crate::*;

const CALLERS: usize = 16;

fn counter() -> DocumentPath {
    DocumentPath::new("counters", "p1").unwrap()
}

async fn increment(executor: Executor<MemoryStore>, op: String) -> anyhow::Result<Value> {
    let key = OperationKey::new("p1", op)?;
    let path = counter();
    executor
        .run_with_receipt(&key, "increment", &ReceiptMetadata::none(), move |tx| {
            let path = path.clone();
            Box::pin(async move {
                let count = tx
                    .get(&path)
                    .await?
                    .and_then(|doc| doc["count"].as_i64())
                    .unwrap_or(0);
                tokio::task::yield_now().await;
                tx.set(&path, json!({ "count": count + 1 }), true)?;
                Ok(json!({ "count": count + 1 }))
            })
        })
        .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_take_effect_once() {
    let store = Arc::new(MemoryStore::new());
    let executor = Executor::new(Arc::clone(&store));

    let mut handles = Vec::with_capacity(CALLERS);
    for _ in 0..CALLERS {
        handles.push(tokio::spawn(increment(executor.clone(), "op-same".into())));
    }

    let mut completed = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(result) => {
                assert_eq!(result, json!({ "count": 1 }));
                completed += 1;
            }
            Err(err) => assert_eq!(classify(&err), ErrorClass::InFlight, "{err:#}"),
        }
    }
    assert!(completed >= 1);

    let doc = store.get(&counter()).await.unwrap().unwrap();
    assert_eq!(doc["count"], 1);

    // Once settled, every duplicate replays.
    let replay = increment(executor.clone(), "op-same".into()).await.unwrap();
    assert_eq!(replay, json!({ "count": 1 }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_distinct_keys_all_take_effect() {
    let store = Arc::new(MemoryStore::new());
    let retry = RetryConfig::new()
        .with_max_retries(200)
        .with_base_delay(Duration::from_millis(1))
        .with_max_delay(Duration::from_millis(5));
    let executor = Executor::with_config(Arc::clone(&store), ExecutorConfig::new().with_retry(retry));

    let mut handles = Vec::with_capacity(CALLERS);
    for n in 0..CALLERS {
        handles.push(tokio::spawn(increment(executor.clone(), format!("op-{n}"))));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let doc = store.get(&counter()).await.unwrap().unwrap();
    assert_eq!(doc["count"], CALLERS as i64);
}
