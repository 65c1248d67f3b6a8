//! Deferred byte reclamation.
//!
//! Metadata always goes first: the transaction that drops the last reference
//! to a blob also queues that blob here. Deleting the bytes happens after the
//! commit. A failed deletion leaves the row in the queue, so the worst case is
//! unreferenced garbage, never metadata pointing at missing bytes.

use crate::errors::StorageResult;
use crate::models::to_millis;
use crate::services::{
    backend::ByteBackend,
    transaction::{Tx, TxExecutor},
};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

/// Queue `references` for deletion inside the caller's transaction.
pub async fn schedule(tx: &mut Tx, references: &[String], now: DateTime<Utc>) -> StorageResult<()> {
    for reference in references {
        sqlx::query("INSERT INTO reclaim_queue (storage_ref, enqueued_at) VALUES (?, ?)")
            .bind(reference)
            .bind(to_millis(now))
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimReport {
    pub reclaimed: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Reclaimer {
    executor: TxExecutor,
    backend: Arc<dyn ByteBackend>,
}

impl Reclaimer {
    pub fn new(executor: TxExecutor, backend: Arc<dyn ByteBackend>) -> Self {
        Self { executor, backend }
    }

    /// Delete queued blobs right away. Called after the commit that queued them.
    pub async fn reclaim(&self, references: &[String]) -> ReclaimReport {
        let mut report = ReclaimReport::default();
        for reference in references {
            match self.backend.delete(reference).await {
                Ok(existed) => {
                    debug!(reference = %reference, existed, "reclaimed blob");
                    match self.dequeue(reference).await {
                        Ok(()) => report.reclaimed += 1,
                        Err(err) => {
                            warn!(reference = %reference, error = %err, "blob deleted but queue row kept");
                            report.failed += 1;
                        }
                    }
                }
                Err(err) => {
                    warn!(reference = %reference, error = %err, "blob reclamation failed; left queued");
                    if let Err(err) = self.mark_attempt(reference).await {
                        debug!(reference = %reference, error = %err, "could not record reclaim attempt");
                    }
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Work through up to `limit` queued blobs, least-retried first.
    pub async fn drain(&self, limit: i64) -> StorageResult<ReclaimReport> {
        let references: Vec<String> = self
            .executor
            .run("reclaim_pending", move |tx| {
                Box::pin(async move {
                    let refs = sqlx::query_scalar(
                        "SELECT storage_ref FROM reclaim_queue
                         GROUP BY storage_ref ORDER BY MAX(attempts), MIN(id) LIMIT ?",
                    )
                    .bind(limit)
                    .fetch_all(&mut **tx)
                    .await?;
                    Ok(refs)
                })
            })
            .await?;
        Ok(self.reclaim(&references).await)
    }

    pub async fn pending(&self) -> StorageResult<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM reclaim_queue")
            .fetch_one(self.executor.pool())
            .await?;
        Ok(count)
    }

    async fn dequeue(&self, reference: &str) -> StorageResult<()> {
        let reference = reference.to_string();
        self.executor
            .run("reclaim_dequeue", |tx| {
                let reference = reference.clone();
                Box::pin(async move {
                    sqlx::query("DELETE FROM reclaim_queue WHERE storage_ref = ?")
                        .bind(reference)
                        .execute(&mut **tx)
                        .await?;
                    Ok(())
                })
            })
            .await
    }

    async fn mark_attempt(&self, reference: &str) -> StorageResult<()> {
        let reference = reference.to_string();
        self.executor
            .run("reclaim_mark_attempt", |tx| {
                let reference = reference.clone();
                Box::pin(async move {
                    sqlx::query(
                        "UPDATE reclaim_queue SET attempts = attempts + 1 WHERE storage_ref = ?",
                    )
                    .bind(reference)
                    .execute(&mut **tx)
                    .await?;
                    Ok(())
                })
            })
            .await
    }
}
