//! Small business operations to drive the executor with.

use exactly_core::{json, DocumentPath, DocumentStore, StoreError, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The wallet held less than the debit asked for.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("insufficient funds: balance {balance}, requested {requested}")]
pub struct InsufficientFunds {
    pub balance: i64,
    pub requested: i64,
}

/// Result of a successful [`debit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebitResult {
    pub balance: i64,
}

pub fn counter_path(actor: &str) -> Result<DocumentPath, StoreError> {
    DocumentPath::new("counters", actor)
}

pub fn wallet_path(actor: &str) -> Result<DocumentPath, StoreError> {
    DocumentPath::new("wallets", actor)
}

/// Read-modify-write `count += 1`; returns `{"count": n}`.
pub async fn increment_counter<T: Transaction>(
    tx: &mut T,
    path: &DocumentPath,
) -> anyhow::Result<Value> {
    let count = tx
        .get(path)
        .await?
        .and_then(|doc| doc["count"].as_i64())
        .unwrap_or(0);
    tx.set(path, json!({ "count": count + 1 }), true)?;
    Ok(json!({ "count": count + 1 }))
}

/// Subtract `amount` coins, failing with [`InsufficientFunds`] without
/// writing anything.
pub async fn debit<T: Transaction>(
    tx: &mut T,
    wallet: &DocumentPath,
    amount: i64,
) -> anyhow::Result<DebitResult> {
    let balance = tx
        .get(wallet)
        .await?
        .and_then(|doc| doc["coins"].as_i64())
        .unwrap_or(0);
    if balance < amount {
        return Err(InsufficientFunds {
            balance,
            requested: amount,
        }
        .into());
    }
    tx.set(wallet, json!({ "coins": balance - amount }), true)?;
    Ok(DebitResult {
        balance: balance - amount,
    })
}

/// Current value of a counter document, outside any transaction.
pub async fn read_count<S: DocumentStore>(store: &S, path: &DocumentPath) -> Option<i64> {
    store
        .get(path)
        .await
        .ok()
        .flatten()
        .and_then(|doc| doc["count"].as_i64())
}

/// Current coin balance of a wallet document, outside any transaction.
pub async fn read_coins<S: DocumentStore>(store: &S, path: &DocumentPath) -> Option<i64> {
    store
        .get(path)
        .await
        .ok()
        .flatten()
        .and_then(|doc| doc["coins"].as_i64())
}
