//! Retry-with-deadline envelope around every store interaction.
//!
//! Each attempt runs an idempotent operation inside a freshly opened
//! transaction and commits on success. Temporary storage failures are
//! retried with exponential backoff until the cumulative elapsed time
//! exceeds the deadline, at which point the caller gets
//! [`Error::BackendUnavailable`] wrapping the last cause. Permanent
//! failures are returned immediately.
//!
//! Everything above this module is written as if the store never fails
//! transiently.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use tidelog_common::{StorageResult, StoreTransaction};
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{Error, Result};

const INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Source of fresh transactions for one attempt each.
#[async_trait]
pub(crate) trait TransactionalProvider: Send + Sync {
    async fn open_tx(&self) -> StorageResult<Box<dyn StoreTransaction>>;
}

/// Runs `op` against fresh transactions until it succeeds, fails
/// permanently, or the deadline is spent.
///
/// `op` must be idempotent: it may run several times. It receives a shared
/// handle to the attempt's transaction and must do all its work inside it.
pub(crate) async fn execute<T, F>(
    op_name: &'static str,
    provider: &dyn TransactionalProvider,
    deadline: Duration,
    op: F,
) -> Result<T>
where
    T: Send,
    F: Fn(Arc<dyn StoreTransaction>) -> BoxFuture<'static, StorageResult<T>> + Send + Sync,
{
    let started = Instant::now();
    let mut backoff = INITIAL_BACKOFF;
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match run_attempt(provider, &op).await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(op = op_name, attempt, "backend operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !err.is_temporary() => {
                warn!(op = op_name, error = %err, "backend operation failed permanently");
                return Err(Error::Storage(err));
            }
            Err(err) => {
                if started.elapsed() >= deadline {
                    warn!(
                        op = op_name,
                        attempt,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        error = %err,
                        "backend operation exhausted its deadline"
                    );
                    return Err(Error::BackendUnavailable {
                        op: op_name,
                        source: err,
                    });
                }
                let wait = backoff.min(deadline.saturating_sub(started.elapsed()));
                debug!(
                    op = op_name,
                    attempt,
                    backoff_ms = wait.as_millis() as u64,
                    error = %err,
                    "retrying backend operation"
                );
                sleep(wait).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

async fn run_attempt<T, F>(provider: &dyn TransactionalProvider, op: &F) -> StorageResult<T>
where
    F: Fn(Arc<dyn StoreTransaction>) -> BoxFuture<'static, StorageResult<T>> + Send + Sync,
{
    let tx: Arc<dyn StoreTransaction> = Arc::from(provider.open_tx().await?);
    match op(Arc::clone(&tx)).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rollback_err) = tx.rollback().await {
                debug!(error = %rollback_err, "transaction rollback failed");
            }
            Err(err)
        }
    }
}
