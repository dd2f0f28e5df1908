//! # Shop Demo
//!
//! A game shop whose clients retry every request. Coin grants and crate
//! purchases go through the executor, so a retried request replays its first
//! answer instead of paying out twice.
//!
//! Run with `RUST_LOG=exactly_core=debug` to watch claims and replays.

use std::sync::Arc;

use anyhow::Result;
use exactly_core::{
    classify, json, DocumentPath, DocumentStore, ErrorClass, Executor, MemoryStore,
    OperationKey, ReceiptMetadata, Transaction,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ============================================================================
// Requests and Responses
// ============================================================================

#[derive(Debug, Clone, Serialize)]
struct GrantCoins {
    op_id: String,
    amount: i64,
}

#[derive(Debug, Clone, Serialize)]
struct OpenCrate {
    op_id: String,
    crate_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Balance {
    coins: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct CrateOpened {
    reward: String,
    coins: i64,
}

/// A crate as listed in the catalog.
#[derive(Debug, Clone, Deserialize)]
struct CatalogEntry {
    price: i64,
    reward: String,
}

// ============================================================================
// Shop (request handlers)
// ============================================================================

struct Shop {
    executor: Executor<MemoryStore>,
}

impl Shop {
    fn wallet(player: &str) -> Result<DocumentPath> {
        Ok(DocumentPath::new("wallets", player)?)
    }

    async fn grant_coins(&self, player: &str, req: GrantCoins) -> Result<Balance> {
        let key = OperationKey::new(player, &req.op_id)?;
        let metadata = ReceiptMetadata::for_inputs("economy", &req)?;
        let wallet = Self::wallet(player)?;
        let amount = req.amount;

        self.executor
            .run_with_receipt(&key, "grantCoins", &metadata, move |tx| {
                let wallet = wallet.clone();
                Box::pin(async move {
                    let coins = coins_in(tx, &wallet).await?;
                    tx.set(&wallet, json!({ "coins": coins + amount }), true)?;
                    Ok(Balance {
                        coins: coins + amount,
                    })
                })
            })
            .await
    }

    async fn open_crate(&self, player: &str, req: OpenCrate) -> Result<CrateOpened> {
        let key = OperationKey::new(player, &req.op_id)?;
        let metadata = ReceiptMetadata::for_inputs("shop", &req)?;
        let entry_path = DocumentPath::new("catalog", &req.crate_id)?;
        let wallet = Self::wallet(player)?;
        let inventory = DocumentPath::new("inventories", player)?;

        self.executor
            .run_read_then_write_with_receipt(
                &key,
                "openCrate",
                &metadata,
                move |tx| {
                    let entry_path = entry_path.clone();
                    Box::pin(async move {
                        let entry = tx
                            .get(&entry_path)
                            .await?
                            .ok_or_else(|| anyhow::anyhow!("unknown crate {entry_path}"))?;
                        Ok(serde_json::from_value::<CatalogEntry>(entry)?)
                    })
                },
                move |tx, entry: CatalogEntry| {
                    let wallet = wallet.clone();
                    let inventory = inventory.clone();
                    Box::pin(async move {
                        let coins = coins_in(tx, &wallet).await?;
                        if coins < entry.price {
                            anyhow::bail!("crate costs {} coins, wallet has {coins}", entry.price);
                        }
                        let mut items = tx
                            .get(&inventory)
                            .await?
                            .and_then(|doc| doc["items"].as_array().cloned())
                            .unwrap_or_default();
                        items.push(Value::String(entry.reward.clone()));

                        tx.set(&wallet, json!({ "coins": coins - entry.price }), true)?;
                        tx.set(&inventory, json!({ "items": items }), true)?;
                        Ok(CrateOpened {
                            reward: entry.reward,
                            coins: coins - entry.price,
                        })
                    })
                },
            )
            .await
    }
}

async fn coins_in<T: Transaction>(tx: &mut T, wallet: &DocumentPath) -> Result<i64> {
    Ok(tx
        .get(wallet)
        .await?
        .and_then(|doc| doc["coins"].as_i64())
        .unwrap_or(0))
}

/// What an HTTP layer would answer for an error.
fn status_for(err: &anyhow::Error) -> u16 {
    match classify(err) {
        ErrorClass::InvalidRequest => 400,
        ErrorClass::InFlight => 409,
        ErrorClass::Failed => 500,
    }
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let store = Arc::new(MemoryStore::new());
    store
        .set(
            &DocumentPath::new("catalog", "gold-crate")?,
            json!({ "price": 150, "reward": "dragon-egg" }),
            false,
        )
        .await?;
    let shop = Shop {
        executor: Executor::new(Arc::clone(&store)),
    };

    // A grant, retried three times by a flaky client.
    let grant = GrantCoins {
        op_id: Uuid::new_v4().to_string(),
        amount: 100,
    };
    for attempt in 1..=3 {
        let balance = shop.grant_coins("p1", grant.clone()).await?;
        tracing::info!(attempt, ?balance, "grant");
    }

    // The same grant fired concurrently from two devices.
    let twin = GrantCoins {
        op_id: Uuid::new_v4().to_string(),
        amount: 100,
    };
    let (a, b) = tokio::join!(
        shop.grant_coins("p1", twin.clone()),
        shop.grant_coins("p1", twin.clone())
    );
    for outcome in [a, b] {
        match outcome {
            Ok(balance) => tracing::info!(?balance, "twin grant"),
            Err(err) => tracing::info!(status = status_for(&err), error = %err, "twin grant"),
        }
    }

    // Reusing an op id with a different amount is a client bug.
    let tampered = GrantCoins {
        amount: 1_000_000,
        ..grant.clone()
    };
    if let Err(err) = shop.grant_coins("p1", tampered).await {
        tracing::info!(status = status_for(&err), error = %err, "tampered grant");
    }

    // Open a crate twice with the same op id: one debit, one reward.
    let open = OpenCrate {
        op_id: Uuid::new_v4().to_string(),
        crate_id: "gold-crate".into(),
    };
    for attempt in 1..=2 {
        match shop.open_crate("p1", open.clone()).await {
            Ok(opened) => tracing::info!(attempt, ?opened, "open crate"),
            Err(err) => {
                tracing::info!(attempt, status = status_for(&err), error = %format!("{err:#}"), "open crate")
            }
        }
    }

    // Not enough coins left for a second crate; the key stays usable.
    let broke = OpenCrate {
        op_id: Uuid::new_v4().to_string(),
        crate_id: "gold-crate".into(),
    };
    if let Err(err) = shop.open_crate("p1", broke).await {
        tracing::info!(status = status_for(&err), error = %format!("{err:#}"), "second crate");
    }

    let wallet = store.get(&Shop::wallet("p1")?).await?;
    let inventory = store.get(&DocumentPath::new("inventories", "p1")?).await?;
    tracing::info!(
        wallet = %wallet.unwrap_or(serde_json::Value::Null),
        inventory = %inventory.unwrap_or(serde_json::Value::Null),
        "final state"
    );

    Ok(())
}
