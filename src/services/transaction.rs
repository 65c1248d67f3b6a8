//! Transaction executor: the only path through which the core mutates metadata.
//!
//! A unit of work is a closure that receives a transaction handle and returns
//! a boxed future. The executor begins, runs, commits and, when the store
//! reports an optimistic conflict (SQLite `BUSY`/`LOCKED`, or a lost
//! compare-and-swap on a key sequence), rolls back and runs the closure again
//! from scratch with randomized, bounded backoff.

use crate::errors::{StorageError, StorageResult};
use crate::models::object::ObjectKey;
use futures::future::BoxFuture;
use rand::Rng;
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Transaction handle passed to units of work.
pub type Tx = Transaction<'static, Sqlite>;

/// Conflict-retry policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th failure: exponential, capped, and drawn
    /// uniformly from the upper half of the window.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let window = self
            .base_backoff
            .saturating_mul(1u32 << shift)
            .min(self.max_backoff);
        let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        if window_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(window_ms / 2..=window_ms))
    }
}

#[derive(Clone)]
pub struct TxExecutor {
    pool: Arc<SqlitePool>,
    policy: RetryPolicy,
}

impl TxExecutor {
    pub fn new(pool: Arc<SqlitePool>, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Run `work` in a transaction, retrying conflicts up to
    /// `policy.max_attempts` times. Exhaustion yields [`StorageError::Conflict`];
    /// any other error is returned as-is after rolling back.
    pub async fn run<T, F>(&self, operation: &'static str, mut work: F) -> StorageResult<T>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut Tx) -> BoxFuture<'t, StorageResult<T>> + Send,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.attempt_once(&mut work).await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(operation, attempt, "transaction committed after retry");
                    }
                    return Ok(value);
                }
                Err(err) if err.is_retryable() => {
                    if attempt >= self.policy.max_attempts {
                        warn!(
                            operation,
                            attempts = attempt,
                            error = %err,
                            "transaction retries exhausted"
                        );
                        return Err(StorageError::Conflict {
                            operation,
                            attempts: attempt,
                        });
                    }
                    let delay = self.policy.backoff(attempt);
                    debug!(
                        operation,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "transaction conflict, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn attempt_once<T, F>(&self, work: &mut F) -> StorageResult<T>
    where
        T: Send,
        F: for<'t> FnMut(&'t mut Tx) -> BoxFuture<'t, StorageResult<T>> + Send,
    {
        let mut tx = self.pool.begin().await?;
        match work(&mut tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    debug!(error = %rollback_err, "rollback after failed unit of work");
                }
                Err(err)
            }
        }
    }
}

/// Drop the sequence row of a key whose ledger is now empty. The next write
/// starts again at 1, which cannot collide with a live entry.
pub async fn release_key_sequence(tx: &mut Tx, key: &ObjectKey) -> StorageResult<()> {
    sqlx::query(
        "DELETE FROM key_sequences
         WHERE tenant_id = ?1 AND bucket = ?2 AND key = ?3
           AND NOT EXISTS (SELECT 1 FROM object_versions
                           WHERE tenant_id = ?1 AND bucket = ?2 AND key = ?3)",
    )
    .bind(&key.tenant_id)
    .bind(&key.bucket)
    .bind(&key.key)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Allocate the next commit sequence for `key` inside `tx`.
///
/// The counter lives next to the versions and is advanced by compare-and-swap,
/// so two writers that read the same value cannot both commit: the loser gets
/// [`StorageError::WriteConflict`] and the executor retries it.
pub async fn next_key_sequence(tx: &mut Tx, key: &ObjectKey) -> StorageResult<i64> {
    let current: Option<i64> = sqlx::query_scalar(
        "SELECT seq FROM key_sequences WHERE tenant_id = ? AND bucket = ? AND key = ?",
    )
    .bind(&key.tenant_id)
    .bind(&key.bucket)
    .bind(&key.key)
    .fetch_optional(&mut **tx)
    .await?;

    match current {
        None => {
            let inserted = sqlx::query(
                "INSERT INTO key_sequences (tenant_id, bucket, key, seq) VALUES (?, ?, ?, 1)",
            )
            .bind(&key.tenant_id)
            .bind(&key.bucket)
            .bind(&key.key)
            .execute(&mut **tx)
            .await;
            match inserted {
                Ok(_) => Ok(1),
                Err(err) if is_unique_violation(&err) => {
                    Err(StorageError::WriteConflict(key.to_string()))
                }
                Err(err) => Err(err.into()),
            }
        }
        Some(seq) => {
            let next = seq + 1;
            let updated = sqlx::query(
                "UPDATE key_sequences SET seq = ?
                 WHERE tenant_id = ? AND bucket = ? AND key = ? AND seq = ?",
            )
            .bind(next)
            .bind(&key.tenant_id)
            .bind(&key.bucket)
            .bind(&key.key)
            .bind(seq)
            .execute(&mut **tx)
            .await?;
            if updated.rows_affected() == 0 {
                return Err(StorageError::WriteConflict(key.to_string()));
            }
            Ok(next)
        }
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn executor(pool: SqlitePool, max_attempts: u32) -> TxExecutor {
        TxExecutor::new(
            Arc::new(pool),
            RetryPolicy {
                max_attempts,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(2),
            },
        )
    }

    #[test]
    fn backoff_stays_within_bounds() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(100),
        };
        for attempt in 1..20 {
            let delay = policy.backoff(attempt);
            assert!(delay <= Duration::from_millis(100), "{:?}", delay);
        }
        assert!(policy.backoff(1) >= Duration::from_millis(5));
    }

    #[tokio::test]
    async fn conflicts_are_retried_until_success() {
        let exec = executor(test_pool().await, 5);
        let calls = AtomicU32::new(0);

        let value = exec
            .run("test", |tx| {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move {
                    sqlx::query("INSERT INTO reclaim_queue (storage_ref, enqueued_at) VALUES ('x', 0)")
                        .execute(&mut **tx)
                        .await?;
                    if call < 2 {
                        return Err(StorageError::WriteConflict("k".into()));
                    }
                    Ok(call)
                })
            })
            .await
            .unwrap();

        assert_eq!(value, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM reclaim_queue")
            .fetch_one(exec.pool())
            .await
            .unwrap();
        assert_eq!(rows, 1, "failed attempts must roll back");
    }

    #[tokio::test]
    async fn exhaustion_reports_conflict() {
        let exec = executor(test_pool().await, 3);
        let calls = AtomicU32::new(0);

        let err = exec
            .run::<(), _>("always_conflicts", |_tx| {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move { Err(StorageError::WriteConflict("k".into())) })
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            StorageError::Conflict {
                operation: "always_conflicts",
                attempts: 3
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_are_not_retried() {
        let exec = executor(test_pool().await, 5);
        let calls = AtomicU32::new(0);

        let err = exec
            .run::<(), _>("validation", |_tx| {
                calls.fetch_add(1, Ordering::SeqCst);
                Box::pin(async move { Err(StorageError::Validation("nope".into())) })
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::Validation(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn key_sequence_is_monotonic_per_key() {
        let exec = executor(test_pool().await, 3);
        let a = ObjectKey::new("t", "bkt", "a");
        let b = ObjectKey::new("t", "bkt", "b");

        let mut seen = Vec::new();
        for key in [&a, &a, &b, &a] {
            let key = key.clone();
            let seq = exec
                .run("seq", |tx| {
                    let key = key.clone();
                    Box::pin(async move { next_key_sequence(tx, &key).await })
                })
                .await
                .unwrap();
            seen.push(seq);
        }
        assert_eq!(seen, vec![1, 2, 1, 3]);
    }
}
