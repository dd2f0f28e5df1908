//! Testing utilities for Exactly.
//!
//! - [`FaultyStore`] wraps any [`DocumentStore`] and injects commit failures
//!   and delays, so tests can force the paths real contention only hits
//!   occasionally.
//! - [`fixtures`] holds small business operations (a counter, a wallet
//!   debit) to run through the executor.
//! - [`init_test_tracing`] routes `tracing` output to the test harness.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use exactly_core::{DocumentPath, DocumentStore, StoreError};
use parking_lot::Mutex;
use serde_json::Value;

pub mod fixtures;

#[derive(Default)]
struct Faults {
    /// One entry per upcoming commit; `Some` fails that commit.
    script: Mutex<VecDeque<Option<StoreError>>>,
    commit_delay: Mutex<Option<Duration>>,
    commits: AtomicUsize,
    injected: AtomicUsize,
}

/// A [`DocumentStore`] wrapper that fails or delays commits on demand.
///
/// Clones share the same fault script and counters.
pub struct FaultyStore<S> {
    inner: S,
    faults: Arc<Faults>,
}

impl<S: Clone> Clone for FaultyStore<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            faults: Arc::clone(&self.faults),
        }
    }
}

impl<S: DocumentStore> FaultyStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            faults: Arc::new(Faults::default()),
        }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    /// Fail each of the next `n` commits with `error`.
    pub fn fail_next_commits(&self, n: usize, error: StoreError) {
        self.script_commits(std::iter::repeat(Some(error)).take(n));
    }

    /// Decide the fate of upcoming commits in order: `None` lets the commit
    /// through, `Some(err)` fails it. Commits past the script pass.
    pub fn script_commits(&self, plan: impl IntoIterator<Item = Option<StoreError>>) {
        self.faults.script.lock().extend(plan);
    }

    /// Sleep before every commit reaches the inner store.
    pub fn set_commit_delay(&self, delay: Option<Duration>) {
        *self.faults.commit_delay.lock() = delay;
    }

    /// Commits that reached the inner store and succeeded.
    pub fn commits(&self) -> usize {
        self.faults.commits.load(Ordering::SeqCst)
    }

    /// Commits failed by the script.
    pub fn injected(&self) -> usize {
        self.faults.injected.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<S: DocumentStore> DocumentStore for FaultyStore<S> {
    type Transaction = S::Transaction;

    async fn begin(&self) -> Result<S::Transaction, StoreError> {
        self.inner.begin().await
    }

    async fn commit(&self, tx: S::Transaction) -> Result<(), StoreError> {
        let scripted = self.faults.script.lock().pop_front().flatten();
        if let Some(error) = scripted {
            self.faults.injected.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(%error, "injecting commit failure");
            self.inner.rollback(tx).await?;
            return Err(error);
        }

        let delay = *self.faults.commit_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.inner.commit(tx).await?;
        self.faults.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self, tx: S::Transaction) -> Result<(), StoreError> {
        self.inner.rollback(tx).await
    }

    async fn get(&self, path: &DocumentPath) -> Result<Option<Value>, StoreError> {
        self.inner.get(path).await
    }

    async fn set(&self, path: &DocumentPath, value: Value, merge: bool) -> Result<(), StoreError> {
        self.inner.set(path, value, merge).await
    }

    async fn server_time(&self) -> Result<DateTime<Utc>, StoreError> {
        self.inner.server_time().await
    }
}

static TRACING: Once = Once::new();

/// Install a `tracing` subscriber that writes through the test harness.
///
/// Honors `RUST_LOG`; defaults to `exactly_core=debug`. Safe to call from
/// every test.
pub fn init_test_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("exactly_core=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
