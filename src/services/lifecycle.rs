//! Lifecycle sweeper.
//!
//! One pass walks every bucket with lifecycle rules, one bucket at a time and
//! each under a timeout. Expiry goes through the ledger's normal delete path,
//! so retention and legal hold still apply; a blocked candidate is logged and
//! skipped. Each pass also aborts idle multipart uploads and drains the
//! reclamation queue.

use crate::errors::{StorageError, StorageResult};
use crate::models::{
    bucket::{BucketRef, LifecycleRule},
    multipart::MultipartUpload,
    object::{LedgerEntry, ObjectKey},
};
use crate::services::{
    bucket_store::BucketConfigStore,
    clock::SharedClock,
    ledger::{DeleteTarget, ListVersionsParams, VersionLedger},
    multipart::{MultipartCoordinator, StaleCursor},
    reclaim::Reclaimer,
};
use chrono::{DateTime, Utc};
use std::{ops::AddAssign, sync::Arc, time::Duration};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct SweeperConfig {
    pub interval: Duration,
    pub bucket_timeout: Duration,
    pub batch_size: usize,
    /// Global idle limit for multipart uploads.
    pub multipart_ttl: chrono::Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3600),
            bucket_timeout: Duration::from_secs(300),
            batch_size: 100,
            multipart_ttl: chrono::Duration::hours(168),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub buckets: usize,
    pub versions_expired: usize,
    pub markers_removed: usize,
    pub uploads_aborted: usize,
    pub skipped: usize,
    pub blobs_reclaimed: usize,
}

impl AddAssign for SweepReport {
    fn add_assign(&mut self, other: Self) {
        self.buckets += other.buckets;
        self.versions_expired += other.versions_expired;
        self.markers_removed += other.markers_removed;
        self.uploads_aborted += other.uploads_aborted;
        self.skipped += other.skipped;
        self.blobs_reclaimed += other.blobs_reclaimed;
    }
}

#[derive(Clone)]
pub struct LifecycleSweeper {
    buckets: Arc<dyn BucketConfigStore>,
    ledger: VersionLedger,
    multipart: MultipartCoordinator,
    reclaimer: Reclaimer,
    clock: SharedClock,
    config: SweeperConfig,
}

impl LifecycleSweeper {
    pub fn new(
        buckets: Arc<dyn BucketConfigStore>,
        ledger: VersionLedger,
        multipart: MultipartCoordinator,
        reclaimer: Reclaimer,
        clock: SharedClock,
        config: SweeperConfig,
    ) -> Self {
        Self {
            buckets,
            ledger,
            multipart,
            reclaimer,
            clock,
            config,
        }
    }

    /// Sweep every `interval` until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_secs = self.config.interval.as_secs(), "lifecycle sweeper started");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("lifecycle sweeper stopping");
                    break;
                }
                _ = interval.tick() => {
                    let report = self.sweep_once(&shutdown).await;
                    info!(
                        buckets = report.buckets,
                        versions_expired = report.versions_expired,
                        markers_removed = report.markers_removed,
                        uploads_aborted = report.uploads_aborted,
                        skipped = report.skipped,
                        blobs_reclaimed = report.blobs_reclaimed,
                        "lifecycle sweep finished"
                    );
                }
            }
        }
    }

    /// One full pass. Stops between buckets once `shutdown` is cancelled.
    pub async fn sweep_once(&self, shutdown: &CancellationToken) -> SweepReport {
        let mut report = SweepReport::default();

        match self.buckets.lifecycle_buckets().await {
            Ok(buckets) => {
                for bucket in buckets {
                    if shutdown.is_cancelled() {
                        info!("sweep interrupted by shutdown");
                        return report;
                    }
                    match tokio::time::timeout(self.config.bucket_timeout, self.sweep_bucket(&bucket))
                        .await
                    {
                        Ok(Ok(bucket_report)) => {
                            info!(
                                tenant = %bucket.tenant_id,
                                bucket = %bucket.name,
                                versions_expired = bucket_report.versions_expired,
                                markers_removed = bucket_report.markers_removed,
                                uploads_aborted = bucket_report.uploads_aborted,
                                skipped = bucket_report.skipped,
                                "bucket swept"
                            );
                            report += bucket_report;
                            report.buckets += 1;
                        }
                        Ok(Err(err)) => {
                            warn!(tenant = %bucket.tenant_id, bucket = %bucket.name, error = %err, "bucket sweep failed");
                        }
                        Err(_) => {
                            error!(
                                tenant = %bucket.tenant_id,
                                bucket = %bucket.name,
                                timeout_secs = self.config.bucket_timeout.as_secs(),
                                "bucket sweep timed out"
                            );
                        }
                    }
                }
            }
            Err(err) => error!(error = %err, "could not list buckets with lifecycle rules"),
        }

        if shutdown.is_cancelled() {
            return report;
        }
        let cutoff = self.clock.now() - self.config.multipart_ttl;
        match self.abort_stale_uploads(None, cutoff, |_| true).await {
            Ok(aborted) => report.uploads_aborted += aborted,
            Err(err) => warn!(error = %err, "multipart TTL pass failed"),
        }
        report.blobs_reclaimed += self.drain_reclaim_queue().await;
        report
    }

    async fn sweep_bucket(&self, bucket: &BucketRef) -> StorageResult<SweepReport> {
        let rules: Vec<LifecycleRule> = self
            .buckets
            .lifecycle_rules(&bucket.tenant_id, &bucket.name)
            .await?
            .into_iter()
            .filter(|rule| rule.enabled)
            .collect();
        let mut report = SweepReport::default();
        if rules.is_empty() {
            return Ok(report);
        }

        let expires_versions = rules
            .iter()
            .any(|r| r.noncurrent_days.is_some() || r.expired_delete_marker_days.is_some());
        if expires_versions {
            report += self.expire_versions(bucket, &rules).await?;
        }

        let upload_days = rules
            .iter()
            .filter_map(|r| r.abort_incomplete_multipart_days)
            .min();
        if let Some(days) = upload_days {
            let now = self.clock.now();
            let global_ttl = self.config.multipart_ttl;
            let cutoff = now - chrono::Duration::days(i64::from(days)).min(global_ttl);
            let aborted = self
                .abort_stale_uploads(Some(bucket), cutoff, |upload| {
                    let ttl = rules
                        .iter()
                        .filter(|r| r.applies_to(&upload.key.key))
                        .filter_map(|r| r.abort_incomplete_multipart_days)
                        .min()
                        .map(|d| chrono::Duration::days(i64::from(d)).min(global_ttl))
                        .unwrap_or(global_ttl);
                    upload.last_activity_at <= now - ttl
                })
                .await?;
            report.uploads_aborted += aborted;
        }

        Ok(report)
    }

    /// Walk the bucket's ledger page by page. A key's history is handled once
    /// the listing has moved past it, so a history split across pages is
    /// carried over and removals never touch the entries the next page
    /// resumes from.
    async fn expire_versions(
        &self,
        bucket: &BucketRef,
        rules: &[LifecycleRule],
    ) -> StorageResult<SweepReport> {
        let mut report = SweepReport::default();
        let mut params = ListVersionsParams {
            max_keys: self.config.batch_size,
            ..Default::default()
        };
        let mut history: Vec<LedgerEntry> = Vec::new();
        loop {
            let page = self
                .ledger
                .list_versions(&bucket.tenant_id, &bucket.name, params.clone())
                .await?;
            for entry in page.entries {
                if history
                    .last()
                    .is_some_and(|prev| prev.key().key != entry.key().key)
                {
                    report += self.expire_key(&history, rules).await;
                    history.clear();
                }
                history.push(entry);
            }
            if !page.is_truncated {
                report += self.expire_key(&history, rules).await;
                return Ok(report);
            }
            params.key_marker = page.next_key_marker;
            params.version_id_marker = page.next_version_id_marker;
        }
    }

    /// Apply expiry rules to one key's history (newest first).
    async fn expire_key(&self, history: &[LedgerEntry], rules: &[LifecycleRule]) -> SweepReport {
        let mut report = SweepReport::default();
        let Some(head) = history.first() else {
            return report;
        };
        let key = head.key().clone();
        let applicable: Vec<&LifecycleRule> = rules.iter().filter(|r| r.applies_to(&key.key)).collect();
        let noncurrent_days = applicable.iter().filter_map(|r| r.noncurrent_days).min();
        let marker_days = applicable
            .iter()
            .filter_map(|r| r.expired_delete_marker_days)
            .min();
        let now = self.clock.now();
        let mut remaining = history.len();

        if let Some(days) = noncurrent_days {
            for pair in history.windows(2) {
                let (successor, entry) = (&pair[0], &pair[1]);
                if !older_than(successor.created_at(), days, now) {
                    continue;
                }
                match self.expire(&key, entry).await {
                    Some(true) => {
                        remaining -= 1;
                        if entry.is_delete_marker() {
                            report.markers_removed += 1;
                        } else {
                            report.versions_expired += 1;
                        }
                    }
                    Some(false) => {}
                    None => report.skipped += 1,
                }
            }
        }

        if let Some(days) = marker_days {
            if head.is_delete_marker() && remaining == 1 && older_than(head.created_at(), days, now) {
                match self.expire(&key, head).await {
                    Some(true) => report.markers_removed += 1,
                    Some(false) => {}
                    None => report.skipped += 1,
                }
            }
        }
        report
    }

    /// `Some(true)` when removed, `Some(false)` when no longer eligible,
    /// `None` when blocked or failed.
    async fn expire(&self, key: &ObjectKey, entry: &LedgerEntry) -> Option<bool> {
        let target = DeleteTarget::Expired(entry.version_id().to_string());
        match self.ledger.delete_version(key, target, false).await {
            Ok(outcome) => {
                if outcome.version_id.is_some() {
                    debug!(key = %key, version_id = %entry.version_id(), "expired ledger entry");
                }
                Some(outcome.version_id.is_some())
            }
            Err(StorageError::RetentionLocked(lock)) => {
                warn!(key = %key, version_id = %lock.version_id, reason = %lock.reason, "expiry blocked by retention, skipping");
                None
            }
            Err(err) => {
                warn!(key = %key, version_id = %entry.version_id(), error = %err, "expiry failed, skipping");
                None
            }
        }
    }

    /// Abort every upload idle since `idle_before` that `eligible` accepts.
    /// Ineligible uploads are paged past, not retried.
    async fn abort_stale_uploads<F>(
        &self,
        scope: Option<&BucketRef>,
        idle_before: DateTime<Utc>,
        eligible: F,
    ) -> StorageResult<usize>
    where
        F: Fn(&MultipartUpload) -> bool,
    {
        let scope = scope.map(|b| (b.tenant_id.as_str(), b.name.as_str()));
        let limit = i64::try_from(self.config.batch_size).unwrap_or(i64::MAX);
        let mut cursor: Option<StaleCursor> = None;
        let mut aborted = 0;
        loop {
            let stale = self
                .multipart
                .stale_uploads(scope, idle_before, cursor.as_ref(), limit)
                .await?;
            for upload in stale.iter().filter(|u| eligible(u)) {
                match self.multipart.abort(&upload.key, &upload.upload_id).await {
                    Ok(()) => aborted += 1,
                    Err(err) if err.is_not_found() => {}
                    Err(err) => {
                        warn!(upload_id = %upload.upload_id, error = %err, "could not abort idle upload")
                    }
                }
            }
            match stale.last() {
                Some(last) if (stale.len() as i64) >= limit => cursor = Some(last.into()),
                _ => return Ok(aborted),
            }
        }
    }

    async fn drain_reclaim_queue(&self) -> usize {
        let limit = i64::try_from(self.config.batch_size).unwrap_or(i64::MAX);
        let mut reclaimed = 0;
        loop {
            match self.reclaimer.drain(limit).await {
                Ok(report) => {
                    reclaimed += report.reclaimed;
                    if report.reclaimed == 0 || ((report.reclaimed + report.failed) as i64) < limit {
                        return reclaimed;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "reclaim queue drain failed");
                    return reclaimed;
                }
            }
        }
    }
}

fn older_than(at: DateTime<Utc>, days: u32, now: DateTime<Utc>) -> bool {
    now - at >= chrono::Duration::days(i64::from(days))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{bucket::VersioningState, multipart::DeclaredMetadata};
    use crate::services::{
        backend::stream_of,
        conditions::Preconditions,
        ledger::tests::{Fixture, draft, fixture},
    };

    fn sweeper(fx: &Fixture) -> (LifecycleSweeper, MultipartCoordinator) {
        let clock: SharedClock = Arc::new(fx.clock.clone());
        let multipart = MultipartCoordinator::new(
            fx.executor.clone(),
            fx.ledger.clone(),
            fx.backend.clone(),
            fx.reclaimer.clone(),
            clock.clone(),
            1,
        );
        let sweeper = LifecycleSweeper::new(
            Arc::new(fx.buckets.clone()),
            fx.ledger.clone(),
            multipart.clone(),
            fx.reclaimer.clone(),
            clock,
            SweeperConfig {
                batch_size: 2,
                ..Default::default()
            },
        );
        (sweeper, multipart)
    }

    async fn rules(fx: &Fixture, rules: Vec<LifecycleRule>) {
        fx.buckets.set_lifecycle_rules("t", "bkt", rules).await.unwrap();
    }

    async fn put(fx: &Fixture, name: &str, reference: &str) {
        fx.ledger
            .put_version(
                &ObjectKey::new("t", "bkt", name),
                draft(reference, 1),
                false,
                &Preconditions::default(),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn noncurrent_versions_expire_and_locked_ones_are_skipped() {
        let fx = fixture(VersioningState::Enabled).await;
        rules(
            &fx,
            vec![LifecycleRule {
                id: "noncurrent".into(),
                enabled: true,
                noncurrent_days: Some(1),
                ..Default::default()
            }],
        )
        .await;
        let (sweeper, _) = sweeper(&fx);

        put(&fx, "a", "aa/00/a1").await;
        put(&fx, "a", "aa/00/a2").await;
        put(&fx, "held", "aa/00/h1").await;
        fx.ledger
            .set_legal_hold(&ObjectKey::new("t", "bkt", "held"), None, true)
            .await
            .unwrap();
        put(&fx, "held", "aa/00/h2").await;

        // noncurrent for less than a day: nothing happens
        fx.clock.advance(chrono::Duration::hours(12));
        let report = sweeper.sweep_once(&CancellationToken::new()).await;
        assert_eq!(report.versions_expired, 0);

        fx.clock.advance(chrono::Duration::days(1));
        let report = sweeper.sweep_once(&CancellationToken::new()).await;
        assert_eq!(report.buckets, 1);
        assert_eq!(report.versions_expired, 1);
        assert_eq!(report.skipped, 1);

        let a = fx.ledger.list_key_versions(&ObjectKey::new("t", "bkt", "a")).await.unwrap();
        assert_eq!(a.len(), 1);
        assert!(a[0].is_latest());
        let held = fx
            .ledger
            .list_key_versions(&ObjectKey::new("t", "bkt", "held"))
            .await
            .unwrap();
        assert_eq!(held.len(), 2);
    }

    #[tokio::test]
    async fn sole_delete_markers_are_cleaned_up() {
        let fx = fixture(VersioningState::Enabled).await;
        rules(
            &fx,
            vec![LifecycleRule {
                id: "cleanup".into(),
                enabled: true,
                noncurrent_days: Some(1),
                expired_delete_marker_days: Some(1),
                ..Default::default()
            }],
        )
        .await;
        let (sweeper, _) = sweeper(&fx);
        let key = ObjectKey::new("t", "bkt", "k");
        put(&fx, "k", "aa/01/k").await;
        fx.ledger
            .delete_version(&key, DeleteTarget::Latest, false)
            .await
            .unwrap();

        fx.clock.advance(chrono::Duration::days(2));
        let report = sweeper.sweep_once(&CancellationToken::new()).await;
        assert_eq!(report.versions_expired, 1);
        assert_eq!(report.markers_removed, 1);
        assert!(fx.ledger.list_key_versions(&key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rules_respect_prefix_and_enabled_flag() {
        let fx = fixture(VersioningState::Enabled).await;
        rules(
            &fx,
            vec![
                LifecycleRule {
                    id: "logs-only".into(),
                    prefix: Some("logs/".into()),
                    enabled: true,
                    noncurrent_days: Some(1),
                    ..Default::default()
                },
                LifecycleRule {
                    id: "off".into(),
                    enabled: false,
                    noncurrent_days: Some(1),
                    ..Default::default()
                },
            ],
        )
        .await;
        let (sweeper, _) = sweeper(&fx);
        for name in ["logs/x", "logs/x", "data/y", "data/y"] {
            put(&fx, name, &format!("aa/02/{}", name.replace('/', "-"))).await;
        }
        fx.clock.advance(chrono::Duration::days(3));
        let report = sweeper.sweep_once(&CancellationToken::new()).await;
        assert_eq!(report.versions_expired, 1);
        let data = fx
            .ledger
            .list_key_versions(&ObjectKey::new("t", "bkt", "data/y"))
            .await
            .unwrap();
        assert_eq!(data.len(), 2);
    }

    #[tokio::test]
    async fn idle_uploads_are_aborted() {
        let fx = fixture(VersioningState::Enabled).await;
        rules(
            &fx,
            vec![LifecycleRule {
                id: "uploads".into(),
                enabled: true,
                abort_incomplete_multipart_days: Some(2),
                ..Default::default()
            }],
        )
        .await;
        let (sweeper, multipart) = sweeper(&fx);
        let key = ObjectKey::new("t", "bkt", "upload");
        let idle = multipart.initiate(&key, DeclaredMetadata::default()).await.unwrap();
        multipart
            .upload_part(&key, &idle.upload_id, 1, stream_of(b"part", 2))
            .await
            .unwrap();

        fx.clock.advance(chrono::Duration::days(3));
        let fresh = multipart.initiate(&key, DeclaredMetadata::default()).await.unwrap();

        let report = sweeper.sweep_once(&CancellationToken::new()).await;
        assert_eq!(report.uploads_aborted, 1);
        let left = multipart.list_uploads("t", "bkt", None).await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].upload_id, fresh.upload_id);
    }

    #[tokio::test]
    async fn histories_spanning_pages_are_expired_whole() {
        let fx = fixture(VersioningState::Enabled).await;
        rules(
            &fx,
            vec![LifecycleRule {
                id: "noncurrent".into(),
                enabled: true,
                noncurrent_days: Some(1),
                ..Default::default()
            }],
        )
        .await;
        let (sweeper, _) = sweeper(&fx);
        for n in 0..5 {
            put(&fx, "deep", &format!("aa/04/deep-{}", n)).await;
        }
        put(&fx, "next", "aa/04/next-0").await;
        put(&fx, "next", "aa/04/next-1").await;

        fx.clock.advance(chrono::Duration::days(2));
        let report = sweeper.sweep_once(&CancellationToken::new()).await;
        assert_eq!(report.versions_expired, 5);
        for name in ["deep", "next"] {
            let left = fx
                .ledger
                .list_key_versions(&ObjectKey::new("t", "bkt", name))
                .await
                .unwrap();
            assert_eq!(left.len(), 1);
            assert!(left[0].is_latest());
        }
    }

    #[tokio::test]
    async fn shorter_upload_ttl_is_not_starved_by_longer_one() {
        let fx = fixture(VersioningState::Enabled).await;
        rules(
            &fx,
            vec![
                LifecycleRule {
                    id: "fast".into(),
                    prefix: Some("a/".into()),
                    enabled: true,
                    abort_incomplete_multipart_days: Some(1),
                    ..Default::default()
                },
                LifecycleRule {
                    id: "slow".into(),
                    prefix: Some("b/".into()),
                    enabled: true,
                    abort_incomplete_multipart_days: Some(10),
                    ..Default::default()
                },
            ],
        )
        .await;
        let (sweeper, multipart) = sweeper(&fx);
        for name in ["b/x", "b/y", "a/x"] {
            multipart
                .initiate(&ObjectKey::new("t", "bkt", name), DeclaredMetadata::default())
                .await
                .unwrap();
            fx.clock.advance(chrono::Duration::minutes(1));
        }

        fx.clock.advance(chrono::Duration::days(2));
        let report = sweeper.sweep_once(&CancellationToken::new()).await;
        assert_eq!(report.uploads_aborted, 1);
        let mut left: Vec<String> = multipart
            .list_uploads("t", "bkt", None)
            .await
            .unwrap()
            .into_iter()
            .map(|u| u.key.key)
            .collect();
        left.sort();
        assert_eq!(left, vec!["b/x".to_string(), "b/y".to_string()]);
    }

    #[tokio::test]
    async fn cancelled_sweep_touches_nothing() {
        let fx = fixture(VersioningState::Enabled).await;
        rules(
            &fx,
            vec![LifecycleRule {
                id: "noncurrent".into(),
                enabled: true,
                noncurrent_days: Some(1),
                ..Default::default()
            }],
        )
        .await;
        let (sweeper, _) = sweeper(&fx);
        put(&fx, "a", "aa/03/1").await;
        put(&fx, "a", "aa/03/2").await;
        fx.clock.advance(chrono::Duration::days(2));

        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(sweeper.sweep_once(&token).await, SweepReport::default());
        // run returns promptly once cancelled
        tokio::time::timeout(Duration::from_secs(5), sweeper.run(token))
            .await
            .unwrap();
    }
}
