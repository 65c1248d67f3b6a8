//! Version ledger: the ordered per-key history of versions and delete markers.
//!
//! Order is the per-key commit sequence allocated by
//! [`next_key_sequence`] in the same transaction that writes the entry.
//! "Current" is never stored; it is whichever entry holds the highest
//! sequence for its key. Removing an entry only ever touches metadata here;
//! the blobs it referenced are queued for reclamation in the same
//! transaction and deleted after commit.

use crate::errors::{StorageError, StorageResult};
use crate::models::{
    bucket::VersioningState,
    from_millis,
    object::{
        DeleteMarker, LedgerEntry, NULL_VERSION_ID, ObjectKey, ObjectVersion, VersionDraft,
        VersionRow,
    },
    retention::{DefaultRetention, Retention},
    to_millis,
};
use crate::services::{
    bucket_store::{BucketConfigStore, bucket_in_tx},
    clock::SharedClock,
    conditions::Preconditions,
    reclaim::{self, Reclaimer},
    retention::{RetentionLockError, check_retention_change, check_version_deletable},
    transaction::{
        Tx, TxExecutor, is_unique_violation, next_key_sequence, release_key_sequence,
    },
};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite};
use std::sync::Arc;
use tracing::{debug, info};

const MAX_LIST_KEYS: usize = 1000;

/// Every ledger read selects the same columns and derives `is_latest` from
/// the highest sequence of the entry's key.
const ENTRY_SELECT: &str = "SELECT v.tenant_id, v.bucket, v.key, v.version_id, v.seq, \
     v.is_delete_marker, v.size, v.etag, v.content_type, v.user_metadata, v.storage_ref, \
     v.created_at, v.retention_mode, v.retain_until, v.legal_hold, \
     (v.seq = (SELECT MAX(l.seq) FROM object_versions l \
               WHERE l.tenant_id = v.tenant_id AND l.bucket = v.bucket AND l.key = v.key)) AS is_latest \
     FROM object_versions v";

/// Bucket configuration a write decides against, and the time it is stamped with.
#[derive(Debug, Clone, Copy)]
pub struct PutContext {
    pub versioning: VersioningState,
    pub default_retention: Option<DefaultRetention>,
    pub now: DateTime<Utc>,
}

/// A version staged inside a transaction, plus the blobs it displaced.
#[derive(Debug)]
pub struct StagedWrite {
    pub version: ObjectVersion,
    pub released: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeleteTarget {
    /// No version id: soft delete or null-slot delete depending on versioning.
    Latest,
    /// Hard delete of one entry.
    Version(String),
    /// Lifecycle expiry of one entry. Skipped when the entry has become
    /// current again, unless it is a delete marker with nothing left below it.
    Expired(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    /// Id of the marker written or the entry removed; `None` when nothing changed.
    pub version_id: Option<String>,
    pub delete_marker: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ListVersionsParams {
    pub prefix: Option<String>,
    pub key_marker: Option<String>,
    pub version_id_marker: Option<String>,
    pub max_keys: usize,
}

#[derive(Debug, Clone)]
pub struct ListVersionsPage {
    pub entries: Vec<LedgerEntry>,
    pub is_truncated: bool,
    pub next_key_marker: Option<String>,
    pub next_version_id_marker: Option<String>,
}

#[derive(Clone)]
pub struct VersionLedger {
    executor: TxExecutor,
    buckets: Arc<dyn BucketConfigStore>,
    clock: SharedClock,
    reclaimer: Reclaimer,
}

impl VersionLedger {
    pub fn new(
        executor: TxExecutor,
        buckets: Arc<dyn BucketConfigStore>,
        clock: SharedClock,
        reclaimer: Reclaimer,
    ) -> Self {
        Self {
            executor,
            buckets,
            clock,
            reclaimer,
        }
    }

    /// Current time at the precision the ledger stores.
    pub fn now(&self) -> DateTime<Utc> {
        from_millis(to_millis(self.clock.now()))
    }

    /// Pre-flight read of the bucket configuration. Fails fast on a missing
    /// bucket before any bytes move; writes re-read it in their transaction.
    pub async fn prepare(&self, key: &ObjectKey) -> StorageResult<PutContext> {
        let versioning = self
            .buckets
            .versioning_state(&key.tenant_id, &key.bucket)
            .await?;
        let default_retention = self
            .buckets
            .default_retention(&key.tenant_id, &key.bucket)
            .await?;
        Ok(PutContext {
            versioning,
            default_retention,
            now: self.now(),
        })
    }

    /// Append a version (versioning enabled) or replace the `null` slot.
    pub async fn put_version(
        &self,
        key: &ObjectKey,
        draft: VersionDraft,
        bypass_governance: bool,
        preconditions: &Preconditions,
    ) -> StorageResult<ObjectVersion> {
        draft.validate()?;
        let now = self.prepare(key).await?.now;
        let staged = self
            .executor
            .run("put_version", |tx| {
                let (key, draft, preconditions) = (key.clone(), draft.clone(), preconditions.clone());
                Box::pin(async move {
                    write_version(tx, &key, &draft, now, bypass_governance, &preconditions).await
                })
            })
            .await?;

        debug!(
            key = %key,
            version_id = %staged.version.version_id,
            seq = staged.version.seq,
            size = staged.version.size,
            "committed version"
        );
        self.reclaimer.reclaim(&staged.released).await;
        Ok(staged.version)
    }

    pub async fn delete_version(
        &self,
        key: &ObjectKey,
        target: DeleteTarget,
        bypass_governance: bool,
    ) -> StorageResult<DeleteOutcome> {
        let now = self.now();
        let (outcome, released) = self
            .executor
            .run("delete_version", |tx| {
                let (key, target) = (key.clone(), target.clone());
                Box::pin(async move {
                    let versioning = bucket_in_tx(tx, &key.tenant_id, &key.bucket)
                        .await?
                        .versioning_state();
                    match target {
                        DeleteTarget::Latest => {
                            delete_latest(tx, &key, versioning, bypass_governance, now).await
                        }
                        DeleteTarget::Version(version_id) => {
                            let entry = entry_by_id(tx, &key, &version_id)
                                .await?
                                .ok_or_else(|| version_not_found(&key, &version_id))?;
                            let released = remove_guarded(tx, &entry, bypass_governance, now).await?;
                            release_key_sequence(tx, &key).await?;
                            reclaim::schedule(tx, &released, now).await?;
                            let outcome = DeleteOutcome {
                                version_id: Some(version_id),
                                delete_marker: entry.is_delete_marker(),
                            };
                            Ok((outcome, released))
                        }
                        DeleteTarget::Expired(version_id) => {
                            expire_entry(tx, &key, &version_id, now).await
                        }
                    }
                })
            })
            .await?;

        match &outcome.version_id {
            Some(version_id) if outcome.delete_marker => {
                debug!(key = %key, version_id = %version_id, "delete marker written or removed")
            }
            Some(version_id) => debug!(key = %key, version_id = %version_id, "version removed"),
            None => debug!(key = %key, "delete changed nothing"),
        }
        self.reclaimer.reclaim(&released).await;
        Ok(outcome)
    }

    /// Newest entry for `key`, which may be a delete marker.
    pub async fn get_current(&self, key: &ObjectKey) -> StorageResult<LedgerEntry> {
        let key = key.clone();
        self.executor
            .run("get_current", |tx| {
                let key = key.clone();
                Box::pin(async move {
                    latest_entry(tx, &key)
                        .await?
                        .ok_or_else(|| object_not_found(&key))
                })
            })
            .await
    }

    pub async fn get_entry(&self, key: &ObjectKey, version_id: &str) -> StorageResult<LedgerEntry> {
        let (key, version_id) = (key.clone(), version_id.to_string());
        self.executor
            .run("get_entry", |tx| {
                let (key, version_id) = (key.clone(), version_id.clone());
                Box::pin(async move {
                    entry_by_id(tx, &key, &version_id)
                        .await?
                        .ok_or_else(|| version_not_found(&key, &version_id))
                })
            })
            .await
    }

    /// The version a read resolves to. A current delete marker is
    /// `ObjectNotFound`; an explicitly addressed marker is `MethodNotAllowed`.
    pub async fn resolve_version(
        &self,
        key: &ObjectKey,
        version_id: Option<&str>,
    ) -> StorageResult<ObjectVersion> {
        let (key, version_id) = (key.clone(), version_id.map(str::to_string));
        self.executor
            .run("resolve_version", |tx| {
                let (key, version_id) = (key.clone(), version_id.clone());
                Box::pin(async move { target_version(tx, &key, version_id.as_deref()).await })
            })
            .await
    }

    /// Versions and delete markers of a bucket, key ascending and newest
    /// first within a key, read from one snapshot.
    pub async fn list_versions(
        &self,
        tenant_id: &str,
        bucket: &str,
        params: ListVersionsParams,
    ) -> StorageResult<ListVersionsPage> {
        let max_keys = params.max_keys.clamp(1, MAX_LIST_KEYS);
        let fetch_limit = max_keys + 1;
        let (tenant_id, bucket) = (tenant_id.to_string(), bucket.to_string());

        let mut entries = self
            .executor
            .run("list_versions", |tx| {
                let (tenant_id, bucket, params) = (tenant_id.clone(), bucket.clone(), params.clone());
                Box::pin(async move {
                    let marker_seq = match (&params.key_marker, &params.version_id_marker) {
                        (Some(key_marker), Some(version_marker)) => Some(
                            resume_seq(tx, &tenant_id, &bucket, key_marker, version_marker).await?,
                        ),
                        (None, Some(_)) => {
                            return Err(StorageError::Validation(
                                "version-id-marker requires key-marker".into(),
                            ));
                        }
                        _ => None,
                    };

                    let mut builder = QueryBuilder::<Sqlite>::new(ENTRY_SELECT);
                    builder.push(" WHERE v.tenant_id = ");
                    builder.push_bind(tenant_id);
                    builder.push(" AND v.bucket = ");
                    builder.push_bind(bucket);

                    if let Some(prefix) = params.prefix.filter(|p| !p.is_empty()) {
                        builder.push(" AND substr(v.key, 1, length(");
                        builder.push_bind(prefix.clone());
                        builder.push(")) = ");
                        builder.push_bind(prefix);
                    }

                    match (params.key_marker, marker_seq) {
                        (Some(key_marker), Some(seq)) => {
                            builder.push(" AND (v.key > ");
                            builder.push_bind(key_marker.clone());
                            builder.push(" OR (v.key = ");
                            builder.push_bind(key_marker);
                            builder.push(" AND v.seq < ");
                            builder.push_bind(seq);
                            builder.push("))");
                        }
                        (Some(key_marker), None) => {
                            builder.push(" AND v.key > ");
                            builder.push_bind(key_marker);
                        }
                        _ => {}
                    }

                    builder.push(" ORDER BY v.key ASC, v.seq DESC LIMIT ");
                    builder.push_bind(fetch_limit as i64);

                    let rows: Vec<VersionRow> =
                        builder.build_query_as().fetch_all(&mut **tx).await?;
                    rows.into_iter()
                        .map(LedgerEntry::try_from)
                        .collect::<StorageResult<Vec<_>>>()
                })
            })
            .await?;

        let mut is_truncated = false;
        let mut next_key_marker = None;
        let mut next_version_id_marker = None;
        if entries.len() == fetch_limit {
            entries.truncate(max_keys);
            is_truncated = true;
            if let Some(last) = entries.last() {
                next_key_marker = Some(last.key().key.clone());
                next_version_id_marker = Some(last.version_id().to_string());
            }
        }

        Ok(ListVersionsPage {
            entries,
            is_truncated,
            next_key_marker,
            next_version_id_marker,
        })
    }

    /// Whole history of one key, newest first.
    pub async fn list_key_versions(&self, key: &ObjectKey) -> StorageResult<Vec<LedgerEntry>> {
        let key = key.clone();
        self.executor
            .run("list_key_versions", |tx| {
                let key = key.clone();
                Box::pin(async move {
                    let sql = format!(
                        "{} WHERE v.tenant_id = ? AND v.bucket = ? AND v.key = ? ORDER BY v.seq DESC",
                        ENTRY_SELECT
                    );
                    let rows: Vec<VersionRow> = sqlx::query_as(&sql)
                        .bind(&key.tenant_id)
                        .bind(&key.bucket)
                        .bind(&key.key)
                        .fetch_all(&mut **tx)
                        .await?;
                    rows.into_iter().map(LedgerEntry::try_from).collect()
                })
            })
            .await
    }

    /// Replace or remove the retention of a version.
    pub async fn set_retention(
        &self,
        key: &ObjectKey,
        version_id: Option<&str>,
        retention: Option<Retention>,
        bypass_governance: bool,
    ) -> StorageResult<ObjectVersion> {
        let now = self.now();
        let retention = retention.map(normalize_retention);
        if let Some(r) = &retention {
            if !r.is_active(now) {
                return Err(StorageError::Validation(
                    "retain-until date must be in the future".into(),
                ));
            }
        }
        let (key, version_id) = (key.clone(), version_id.map(str::to_string));
        let version = self
            .executor
            .run("set_retention", |tx| {
                let (key, version_id) = (key.clone(), version_id.clone());
                Box::pin(async move {
                    let mut version = target_version(tx, &key, version_id.as_deref()).await?;
                    if let Err(reason) = check_retention_change(
                        version.retention.as_ref(),
                        retention.as_ref(),
                        bypass_governance,
                        now,
                    ) {
                        info!(
                            key = %key,
                            version_id = %version.version_id,
                            reason = %reason,
                            "retention change denied"
                        );
                        return Err(RetentionLockError::for_version(&version, reason).into());
                    }
                    sqlx::query(
                        "UPDATE object_versions SET retention_mode = ?, retain_until = ?
                         WHERE tenant_id = ? AND bucket = ? AND key = ? AND version_id = ?",
                    )
                    .bind(retention.map(|r| r.mode.as_str()))
                    .bind(retention.map(|r| to_millis(r.retain_until)))
                    .bind(&key.tenant_id)
                    .bind(&key.bucket)
                    .bind(&key.key)
                    .bind(&version.version_id)
                    .execute(&mut **tx)
                    .await?;
                    version.retention = retention;
                    Ok(version)
                })
            })
            .await?;
        debug!(key = %key, version_id = %version.version_id, "retention updated");
        Ok(version)
    }

    pub async fn get_retention(
        &self,
        key: &ObjectKey,
        version_id: Option<&str>,
    ) -> StorageResult<Option<Retention>> {
        Ok(self.resolve_version(key, version_id).await?.retention)
    }

    /// Legal hold can be toggled freely; it only ever blocks removal.
    pub async fn set_legal_hold(
        &self,
        key: &ObjectKey,
        version_id: Option<&str>,
        on: bool,
    ) -> StorageResult<ObjectVersion> {
        let (key, version_id) = (key.clone(), version_id.map(str::to_string));
        let version = self
            .executor
            .run("set_legal_hold", |tx| {
                let (key, version_id) = (key.clone(), version_id.clone());
                Box::pin(async move {
                    let mut version = target_version(tx, &key, version_id.as_deref()).await?;
                    sqlx::query(
                        "UPDATE object_versions SET legal_hold = ?
                         WHERE tenant_id = ? AND bucket = ? AND key = ? AND version_id = ?",
                    )
                    .bind(on)
                    .bind(&key.tenant_id)
                    .bind(&key.bucket)
                    .bind(&key.key)
                    .bind(&version.version_id)
                    .execute(&mut **tx)
                    .await?;
                    version.legal_hold = on;
                    Ok(version)
                })
            })
            .await?;
        debug!(key = %key, version_id = %version.version_id, on, "legal hold updated");
        Ok(version)
    }

    pub async fn get_legal_hold(
        &self,
        key: &ObjectKey,
        version_id: Option<&str>,
    ) -> StorageResult<bool> {
        Ok(self.resolve_version(key, version_id).await?.legal_hold)
    }
}

/// Stage a new version inside `tx`.
///
/// Outside of `Enabled` versioning the write replaces the `null` entry, which
/// counts as deleting it and therefore goes through the retention guard.
/// Bucket configuration and preconditions are evaluated in the same
/// transaction. Used directly by multipart completion.
pub async fn write_version(
    tx: &mut Tx,
    key: &ObjectKey,
    draft: &VersionDraft,
    now: DateTime<Utc>,
    bypass_governance: bool,
    preconditions: &Preconditions,
) -> StorageResult<StagedWrite> {
    draft.validate()?;
    let ctx = context_in_tx(tx, key, now).await?;
    let retention = match draft.retention.map(normalize_retention) {
        Some(r) if !r.is_active(ctx.now) => {
            return Err(StorageError::Validation(
                "retain-until date must be in the future".into(),
            ));
        }
        Some(r) => Some(r),
        None => ctx.default_retention.map(|d| d.stamp(ctx.now)),
    };

    if !preconditions.is_empty() {
        let current = latest_entry(tx, key).await?;
        preconditions.evaluate_write(current.as_ref().and_then(LedgerEntry::as_version))?;
    }

    let seq = next_key_sequence(tx, key).await?;
    let mut released = Vec::new();
    let version_id = if ctx.versioning == VersioningState::Enabled {
        new_version_id(seq)
    } else {
        if let Some(existing) = entry_by_id(tx, key, NULL_VERSION_ID).await? {
            released = remove_guarded(tx, &existing, bypass_governance, ctx.now).await?;
        }
        NULL_VERSION_ID.to_string()
    };

    let version = ObjectVersion {
        key: key.clone(),
        version_id,
        seq,
        size: draft.size,
        etag: draft.etag.clone(),
        content_type: draft.content_type.clone(),
        user_metadata: draft.user_metadata.clone(),
        storage_ref: draft.storage_ref.clone(),
        created_at: ctx.now,
        retention,
        legal_hold: draft.legal_hold,
        is_latest: true,
    };
    insert_version(tx, &version).await?;
    reclaim::schedule(tx, &released, ctx.now).await?;
    Ok(StagedWrite { version, released })
}

async fn context_in_tx(tx: &mut Tx, key: &ObjectKey, now: DateTime<Utc>) -> StorageResult<PutContext> {
    let bucket = bucket_in_tx(tx, &key.tenant_id, &key.bucket).await?;
    Ok(PutContext {
        versioning: bucket.versioning_state(),
        default_retention: bucket.default_retention(),
        now,
    })
}

async fn delete_latest(
    tx: &mut Tx,
    key: &ObjectKey,
    versioning: VersioningState,
    bypass_governance: bool,
    now: DateTime<Utc>,
) -> StorageResult<(DeleteOutcome, Vec<String>)> {
    match versioning {
        VersioningState::Enabled => {
            let seq = next_key_sequence(tx, key).await?;
            let marker = DeleteMarker {
                key: key.clone(),
                version_id: new_version_id(seq),
                seq,
                created_at: now,
                is_latest: true,
            };
            insert_marker(tx, &marker).await?;
            Ok((
                DeleteOutcome {
                    version_id: Some(marker.version_id),
                    delete_marker: true,
                },
                Vec::new(),
            ))
        }
        VersioningState::Suspended => {
            let mut released = Vec::new();
            if let Some(existing) = entry_by_id(tx, key, NULL_VERSION_ID).await? {
                released = remove_guarded(tx, &existing, bypass_governance, now).await?;
            }
            let seq = next_key_sequence(tx, key).await?;
            let marker = DeleteMarker {
                key: key.clone(),
                version_id: NULL_VERSION_ID.to_string(),
                seq,
                created_at: now,
                is_latest: true,
            };
            insert_marker(tx, &marker).await?;
            reclaim::schedule(tx, &released, now).await?;
            Ok((
                DeleteOutcome {
                    version_id: Some(marker.version_id),
                    delete_marker: true,
                },
                released,
            ))
        }
        VersioningState::Unset => {
            let Some(existing) = entry_by_id(tx, key, NULL_VERSION_ID).await? else {
                return Ok((DeleteOutcome::default(), Vec::new()));
            };
            let released = remove_guarded(tx, &existing, bypass_governance, now).await?;
            release_key_sequence(tx, key).await?;
            reclaim::schedule(tx, &released, now).await?;
            Ok((DeleteOutcome::default(), released))
        }
    }
}

/// Lifecycle removal. Never bypasses governance.
async fn expire_entry(
    tx: &mut Tx,
    key: &ObjectKey,
    version_id: &str,
    now: DateTime<Utc>,
) -> StorageResult<(DeleteOutcome, Vec<String>)> {
    let Some(entry) = entry_by_id(tx, key, version_id).await? else {
        return Ok((DeleteOutcome::default(), Vec::new()));
    };
    if entry.is_latest() {
        let sole_marker = entry.is_delete_marker() && count_entries(tx, key).await? == 1;
        if !sole_marker {
            return Ok((DeleteOutcome::default(), Vec::new()));
        }
    }
    let released = remove_guarded(tx, &entry, false, now).await?;
    release_key_sequence(tx, key).await?;
    reclaim::schedule(tx, &released, now).await?;
    Ok((
        DeleteOutcome {
            version_id: Some(version_id.to_string()),
            delete_marker: entry.is_delete_marker(),
        },
        released,
    ))
}

/// Hard-delete `entry`, consulting the retention guard for versions.
/// Returns the blob references the entry held.
async fn remove_guarded(
    tx: &mut Tx,
    entry: &LedgerEntry,
    bypass_governance: bool,
    now: DateTime<Utc>,
) -> StorageResult<Vec<String>> {
    let released = match entry {
        LedgerEntry::Version(version) => {
            if let Err(err) = check_version_deletable(version, bypass_governance, now) {
                info!(
                    key = %version.key,
                    version_id = %version.version_id,
                    reason = %err.reason,
                    "retention guard denied removal"
                );
                return Err(err.into());
            }
            version.storage_ref.references().map(str::to_string).collect()
        }
        LedgerEntry::DeleteMarker(_) => Vec::new(),
    };
    let key = entry.key();
    sqlx::query(
        "DELETE FROM object_versions
         WHERE tenant_id = ? AND bucket = ? AND key = ? AND version_id = ?",
    )
    .bind(&key.tenant_id)
    .bind(&key.bucket)
    .bind(&key.key)
    .bind(entry.version_id())
    .execute(&mut **tx)
    .await?;
    Ok(released)
}

/// Sequence to resume a listing below. Generated ids carry their sequence,
/// so a marker whose entry has since been removed still resumes in place.
/// A vanished `null` marker resumes at the top of its key.
async fn resume_seq(
    tx: &mut Tx,
    tenant_id: &str,
    bucket: &str,
    key_marker: &str,
    version_marker: &str,
) -> StorageResult<i64> {
    if let Some(seq) = version_id_seq(version_marker) {
        return Ok(seq);
    }
    if version_marker != NULL_VERSION_ID {
        return Err(StorageError::Validation(format!(
            "malformed version-id-marker `{}`",
            version_marker
        )));
    }
    let seq: Option<i64> = sqlx::query_scalar(
        "SELECT seq FROM object_versions
         WHERE tenant_id = ? AND bucket = ? AND key = ? AND version_id = ?",
    )
    .bind(tenant_id)
    .bind(bucket)
    .bind(key_marker)
    .bind(version_marker)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(seq.unwrap_or(i64::MAX))
}

/// Sequence prefix of an id minted by [`new_version_id`].
fn version_id_seq(version_id: &str) -> Option<i64> {
    if version_id.len() != 24 || !version_id.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let seq = u64::from_str_radix(&version_id[..16], 16).ok()?;
    i64::try_from(seq).ok()
}

async fn target_version(
    tx: &mut Tx,
    key: &ObjectKey,
    version_id: Option<&str>,
) -> StorageResult<ObjectVersion> {
    let entry = match version_id {
        Some(id) => entry_by_id(tx, key, id)
            .await?
            .ok_or_else(|| version_not_found(key, id))?,
        None => latest_entry(tx, key)
            .await?
            .ok_or_else(|| object_not_found(key))?,
    };
    match entry {
        LedgerEntry::Version(version) => Ok(version),
        LedgerEntry::DeleteMarker(_) if version_id.is_none() => Err(object_not_found(key)),
        LedgerEntry::DeleteMarker(marker) => Err(StorageError::MethodNotAllowed(format!(
            "version `{}` of `{}` is a delete marker",
            marker.version_id, key.key
        ))),
    }
}

async fn latest_entry(tx: &mut Tx, key: &ObjectKey) -> StorageResult<Option<LedgerEntry>> {
    let sql = format!(
        "{} WHERE v.tenant_id = ? AND v.bucket = ? AND v.key = ? ORDER BY v.seq DESC LIMIT 1",
        ENTRY_SELECT
    );
    let row: Option<VersionRow> = sqlx::query_as(&sql)
        .bind(&key.tenant_id)
        .bind(&key.bucket)
        .bind(&key.key)
        .fetch_optional(&mut **tx)
        .await?;
    row.map(LedgerEntry::try_from).transpose()
}

async fn entry_by_id(
    tx: &mut Tx,
    key: &ObjectKey,
    version_id: &str,
) -> StorageResult<Option<LedgerEntry>> {
    let sql = format!(
        "{} WHERE v.tenant_id = ? AND v.bucket = ? AND v.key = ? AND v.version_id = ?",
        ENTRY_SELECT
    );
    let row: Option<VersionRow> = sqlx::query_as(&sql)
        .bind(&key.tenant_id)
        .bind(&key.bucket)
        .bind(&key.key)
        .bind(version_id)
        .fetch_optional(&mut **tx)
        .await?;
    row.map(LedgerEntry::try_from).transpose()
}

async fn count_entries(tx: &mut Tx, key: &ObjectKey) -> StorageResult<i64> {
    let count = sqlx::query_scalar(
        "SELECT COUNT(*) FROM object_versions WHERE tenant_id = ? AND bucket = ? AND key = ?",
    )
    .bind(&key.tenant_id)
    .bind(&key.bucket)
    .bind(&key.key)
    .fetch_one(&mut **tx)
    .await?;
    Ok(count)
}

async fn insert_version(tx: &mut Tx, version: &ObjectVersion) -> StorageResult<()> {
    let user_metadata = serde_json::to_string(&version.user_metadata)
        .map_err(|err| StorageError::Internal(format!("encoding user metadata: {}", err)))?;
    let inserted = sqlx::query(
        "INSERT INTO object_versions
            (tenant_id, bucket, key, version_id, seq, is_delete_marker, size, etag, content_type,
             user_metadata, storage_ref, created_at, retention_mode, retain_until, legal_hold)
         VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&version.key.tenant_id)
    .bind(&version.key.bucket)
    .bind(&version.key.key)
    .bind(&version.version_id)
    .bind(version.seq)
    .bind(version.size)
    .bind(&version.etag)
    .bind(&version.content_type)
    .bind(user_metadata)
    .bind(version.storage_ref.to_json()?)
    .bind(to_millis(version.created_at))
    .bind(version.retention.map(|r| r.mode.as_str()))
    .bind(version.retention.map(|r| to_millis(r.retain_until)))
    .bind(version.legal_hold)
    .execute(&mut **tx)
    .await;
    map_insert(inserted, &version.key)
}

async fn insert_marker(tx: &mut Tx, marker: &DeleteMarker) -> StorageResult<()> {
    let inserted = sqlx::query(
        "INSERT INTO object_versions
            (tenant_id, bucket, key, version_id, seq, is_delete_marker, created_at)
         VALUES (?, ?, ?, ?, ?, 1, ?)",
    )
    .bind(&marker.key.tenant_id)
    .bind(&marker.key.bucket)
    .bind(&marker.key.key)
    .bind(&marker.version_id)
    .bind(marker.seq)
    .bind(to_millis(marker.created_at))
    .execute(&mut **tx)
    .await;
    map_insert(inserted, &marker.key)
}

fn map_insert(
    result: Result<sqlx::sqlite::SqliteQueryResult, sqlx::Error>,
    key: &ObjectKey,
) -> StorageResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(err) if is_unique_violation(&err) => Err(StorageError::WriteConflict(key.to_string())),
        Err(err) => Err(err.into()),
    }
}

/// `{seq:016x}{nonce:08x}`: sorts like the sequence, unique per key.
fn new_version_id(seq: i64) -> String {
    format!("{:016x}{:08x}", seq, rand::random::<u32>())
}

fn normalize_retention(retention: Retention) -> Retention {
    Retention::new(retention.mode, from_millis(to_millis(retention.retain_until)))
}

fn object_not_found(key: &ObjectKey) -> StorageError {
    StorageError::ObjectNotFound {
        bucket: key.bucket.clone(),
        key: key.key.clone(),
    }
}

fn version_not_found(key: &ObjectKey, version_id: &str) -> StorageError {
    StorageError::VersionNotFound {
        bucket: key.bucket.clone(),
        key: key.key.clone(),
        version_id: version_id.to_string(),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::models::{object::StorageRef, retention::RetentionMode};
    use crate::services::{
        backend::{ByteBackend, FsBackend},
        bucket_store::SqliteBucketStore,
        clock::ManualClock,
        retention::LockReason,
        transaction::RetryPolicy,
    };
    use chrono::{Duration, TimeZone};
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;

    pub(crate) struct Fixture {
        pub ledger: VersionLedger,
        pub buckets: SqliteBucketStore,
        pub executor: TxExecutor,
        pub backend: Arc<dyn ByteBackend>,
        pub reclaimer: Reclaimer,
        pub clock: ManualClock,
        pub _dir: TempDir,
    }

    pub(crate) async fn fixture(versioning: VersioningState) -> Fixture {
        let dir = TempDir::new().unwrap();
        let backend: Arc<dyn ByteBackend> = Arc::new(FsBackend::new(dir.path()));
        let executor = TxExecutor::new(
            Arc::new(test_pool().await),
            RetryPolicy {
                max_attempts: 20,
                base_backoff: StdDuration::from_millis(1),
                max_backoff: StdDuration::from_millis(5),
            },
        );
        let buckets = SqliteBucketStore::new(executor.clone());
        buckets.create_bucket("t", "bkt", "local").await.unwrap();
        if versioning != VersioningState::Unset {
            buckets.set_versioning("t", "bkt", versioning).await.unwrap();
        }
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap());
        let reclaimer = Reclaimer::new(executor.clone(), backend.clone());
        let ledger = VersionLedger::new(
            executor.clone(),
            Arc::new(buckets.clone()),
            Arc::new(clock.clone()),
            reclaimer.clone(),
        );
        Fixture {
            ledger,
            buckets,
            executor,
            backend,
            reclaimer,
            clock,
            _dir: dir,
        }
    }

    pub(crate) fn draft(reference: &str, size: i64) -> VersionDraft {
        VersionDraft {
            size,
            etag: format!("etag-{}", reference),
            storage_ref: StorageRef::single(reference, size),
            ..Default::default()
        }
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("t", "bkt", name)
    }

    async fn put(fx: &Fixture, name: &str, reference: &str) -> ObjectVersion {
        fx.ledger
            .put_version(&key(name), draft(reference, 1), false, &Preconditions::default())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn delete_marker_round_trip() {
        let fx = fixture(VersioningState::Enabled).await;
        let k = key("k");
        let v1 = put(&fx, "k", "aa/aa/one").await;
        let v2 = put(&fx, "k", "aa/aa/two").await;
        let deleted = fx
            .ledger
            .delete_version(&k, DeleteTarget::Latest, false)
            .await
            .unwrap();
        assert!(deleted.delete_marker);

        let history = fx.ledger.list_key_versions(&k).await.unwrap();
        assert_eq!(history.len(), 3);
        assert!(history[0].is_delete_marker() && history[0].is_latest());
        assert_eq!(history[1].version_id(), v2.version_id);
        assert_eq!(history[2].version_id(), v1.version_id);
        assert!(!history[1].is_latest());

        assert!(matches!(
            fx.ledger.resolve_version(&k, None).await,
            Err(StorageError::ObjectNotFound { .. })
        ));
        let marker_id = deleted.version_id.unwrap();
        assert!(matches!(
            fx.ledger.resolve_version(&k, Some(&marker_id)).await,
            Err(StorageError::MethodNotAllowed(_))
        ));

        fx.ledger
            .delete_version(&k, DeleteTarget::Version(marker_id), false)
            .await
            .unwrap();
        let current = fx.ledger.resolve_version(&k, None).await.unwrap();
        assert_eq!(current.version_id, v2.version_id);
        assert!(current.is_latest);
    }

    #[tokio::test]
    async fn concurrent_writers_are_totally_ordered() {
        let fx = fixture(VersioningState::Enabled).await;
        let mut handles = Vec::new();
        for i in 0..8 {
            let ledger = fx.ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .put_version(
                        &key("hot"),
                        draft(&format!("aa/bb/{}", i), 1),
                        false,
                        &Preconditions::default(),
                    )
                    .await
                    .unwrap()
            }));
        }
        let mut written = Vec::new();
        for handle in handles {
            written.push(handle.await.unwrap());
        }

        let mut seqs: Vec<i64> = written.iter().map(|v| v.seq).collect();
        seqs.sort_unstable();
        assert_eq!(seqs, (1..=8).collect::<Vec<_>>());

        let latest = written.iter().max_by_key(|v| v.seq).unwrap();
        let current = fx.ledger.get_current(&key("hot")).await.unwrap();
        assert_eq!(current.version_id(), latest.version_id);
    }

    #[tokio::test]
    async fn compliance_blocks_delete_until_expiry() {
        let fx = fixture(VersioningState::Enabled).await;
        let k = key("records");
        let start = fx.ledger.now();
        let mut locked = draft("aa/cc/rec", 1);
        locked.retention = Some(Retention::new(
            RetentionMode::Compliance,
            start + Duration::days(14),
        ));
        let version = fx
            .ledger
            .put_version(&k, locked, false, &Preconditions::default())
            .await
            .unwrap();

        fx.clock.advance(Duration::days(5));
        let err = fx
            .ledger
            .delete_version(&k, DeleteTarget::Version(version.version_id.clone()), true)
            .await
            .unwrap_err();
        match err {
            StorageError::RetentionLocked(lock) => {
                assert!(matches!(lock.reason, LockReason::Compliance { .. }))
            }
            other => panic!("unexpected {:?}", other),
        }

        fx.clock.advance(Duration::days(10));
        fx.ledger
            .delete_version(&k, DeleteTarget::Version(version.version_id), false)
            .await
            .unwrap();
        assert!(fx.ledger.list_key_versions(&k).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn legal_hold_blocks_until_released() {
        let fx = fixture(VersioningState::Enabled).await;
        let k = key("held");
        let version = put(&fx, "held", "aa/dd/held").await;
        fx.ledger
            .set_legal_hold(&k, Some(&version.version_id), true)
            .await
            .unwrap();

        let err = fx
            .ledger
            .delete_version(&k, DeleteTarget::Version(version.version_id.clone()), true)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::RetentionLocked(_)));

        fx.ledger.set_legal_hold(&k, None, false).await.unwrap();
        fx.ledger
            .delete_version(&k, DeleteTarget::Version(version.version_id), false)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn suspended_overwrite_consults_guard_and_queues_old_bytes() {
        let fx = fixture(VersioningState::Suspended).await;
        let k = key("doc");
        let mut governed = draft("aa/ee/first", 1);
        governed.retention = Some(Retention::new(
            RetentionMode::Governance,
            fx.ledger.now() + Duration::days(1),
        ));
        let first = fx
            .ledger
            .put_version(&k, governed, false, &Preconditions::default())
            .await
            .unwrap();
        assert_eq!(first.version_id, NULL_VERSION_ID);

        let err = fx
            .ledger
            .put_version(&k, draft("aa/ee/second", 1), false, &Preconditions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::RetentionLocked(_)));

        let second = fx
            .ledger
            .put_version(&k, draft("aa/ee/second", 1), true, &Preconditions::default())
            .await
            .unwrap();
        assert_eq!(second.version_id, NULL_VERSION_ID);
        let history = fx.ledger.list_key_versions(&k).await.unwrap();
        assert_eq!(history.len(), 1);
        // the replaced blob never existed on disk, so reclamation drained it
        assert_eq!(fx.reclaimer.pending().await.unwrap(), 0);

        let outcome = fx
            .ledger
            .delete_version(&k, DeleteTarget::Latest, false)
            .await
            .unwrap();
        assert_eq!(outcome.version_id.as_deref(), Some(NULL_VERSION_ID));
        let history = fx.ledger.list_key_versions(&k).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_delete_marker());
    }

    #[tokio::test]
    async fn unset_bucket_delete_is_idempotent() {
        let fx = fixture(VersioningState::Unset).await;
        let k = key("plain");
        let outcome = fx
            .ledger
            .delete_version(&k, DeleteTarget::Latest, false)
            .await
            .unwrap();
        assert_eq!(outcome, DeleteOutcome::default());

        put(&fx, "plain", "aa/ff/plain").await;
        fx.ledger
            .delete_version(&k, DeleteTarget::Latest, false)
            .await
            .unwrap();
        assert!(fx.ledger.list_key_versions(&k).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bucket_default_retention_is_stamped() {
        let fx = fixture(VersioningState::Enabled).await;
        fx.buckets
            .set_default_retention(
                "t",
                "bkt",
                Some(DefaultRetention {
                    mode: RetentionMode::Governance,
                    days: 3,
                }),
            )
            .await
            .unwrap();
        let version = put(&fx, "stamped", "aa/gg/s").await;
        let retention = version.retention.unwrap();
        assert_eq!(retention.mode, RetentionMode::Governance);
        assert_eq!(retention.retain_until, version.created_at + Duration::days(3));
        assert_eq!(
            fx.ledger
                .get_retention(&key("stamped"), None)
                .await
                .unwrap(),
            Some(retention)
        );
    }

    #[tokio::test]
    async fn retention_can_tighten_but_not_loosen() {
        let fx = fixture(VersioningState::Enabled).await;
        let k = key("r");
        put(&fx, "r", "aa/hh/r").await;
        let now = fx.ledger.now();
        let strict = Retention::new(RetentionMode::Compliance, now + Duration::days(10));
        fx.ledger.set_retention(&k, None, Some(strict), false).await.unwrap();

        let shorter = Retention::new(RetentionMode::Compliance, now + Duration::days(2));
        assert!(matches!(
            fx.ledger.set_retention(&k, None, Some(shorter), true).await,
            Err(StorageError::RetentionLocked(_))
        ));
        assert!(matches!(
            fx.ledger.set_retention(&k, None, None, true).await,
            Err(StorageError::RetentionLocked(_))
        ));
        let longer = Retention::new(RetentionMode::Compliance, now + Duration::days(20));
        fx.ledger.set_retention(&k, None, Some(longer), false).await.unwrap();

        let past = Retention::new(RetentionMode::Governance, now - Duration::days(1));
        assert!(matches!(
            fx.ledger.set_retention(&k, None, Some(past), true).await,
            Err(StorageError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn write_preconditions_are_checked_in_transaction() {
        let fx = fixture(VersioningState::Enabled).await;
        let k = key("cond");
        let create_only = Preconditions {
            if_none_match: Some("*".into()),
            ..Default::default()
        };
        fx.ledger
            .put_version(&k, draft("aa/ii/1", 1), false, &create_only)
            .await
            .unwrap();
        assert!(matches!(
            fx.ledger
                .put_version(&k, draft("aa/ii/2", 1), false, &create_only)
                .await,
            Err(StorageError::PreconditionFailed)
        ));
    }

    #[tokio::test]
    async fn list_versions_pages_with_markers() {
        let fx = fixture(VersioningState::Enabled).await;
        for name in ["a", "a", "b", "c"] {
            put(&fx, name, &format!("aa/jj/{}", name)).await;
        }
        fx.ledger
            .delete_version(&key("b"), DeleteTarget::Latest, false)
            .await
            .unwrap();

        let mut params = ListVersionsParams {
            max_keys: 2,
            ..Default::default()
        };
        let mut seen = Vec::new();
        loop {
            let page = fx.ledger.list_versions("t", "bkt", params.clone()).await.unwrap();
            seen.extend(
                page.entries
                    .iter()
                    .map(|e| (e.key().key.clone(), e.seq(), e.is_delete_marker())),
            );
            if !page.is_truncated {
                break;
            }
            params.key_marker = page.next_key_marker;
            params.version_id_marker = page.next_version_id_marker;
        }
        assert_eq!(
            seen,
            vec![
                ("a".to_string(), 2, false),
                ("a".to_string(), 1, false),
                ("b".to_string(), 2, true),
                ("b".to_string(), 1, false),
                ("c".to_string(), 1, false),
            ]
        );

        let filtered = fx
            .ledger
            .list_versions(
                "t",
                "bkt",
                ListVersionsParams {
                    prefix: Some("b".into()),
                    max_keys: 100,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(filtered.entries.len(), 2);
    }

    #[tokio::test]
    async fn listing_resumes_after_marker_version_is_removed() {
        let fx = fixture(VersioningState::Enabled).await;
        for name in ["a", "a", "b"] {
            put(&fx, name, &format!("aa/mm/{}", name)).await;
        }

        let first = fx
            .ledger
            .list_versions(
                "t",
                "bkt",
                ListVersionsParams {
                    max_keys: 1,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(first.is_truncated);
        let marker = first.next_version_id_marker.clone().unwrap();
        fx.ledger
            .delete_version(&key("a"), DeleteTarget::Version(marker), false)
            .await
            .unwrap();

        let next = fx
            .ledger
            .list_versions(
                "t",
                "bkt",
                ListVersionsParams {
                    key_marker: first.next_key_marker.clone(),
                    version_id_marker: first.next_version_id_marker.clone(),
                    max_keys: 10,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let seen: Vec<(String, i64)> = next
            .entries
            .iter()
            .map(|e| (e.key().key.clone(), e.seq()))
            .collect();
        assert_eq!(seen, vec![("a".to_string(), 1), ("b".to_string(), 1)]);

        let err = fx
            .ledger
            .list_versions(
                "t",
                "bkt",
                ListVersionsParams {
                    key_marker: Some("a".into()),
                    version_id_marker: Some("not-a-version".into()),
                    max_keys: 10,
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }

    async fn write_in_tx(fx: &Fixture, k: &ObjectKey, now: DateTime<Utc>) -> StorageResult<StagedWrite> {
        let d = draft("aa/rr/late", 1);
        fx.executor
            .run("write", |tx| {
                let (k, d) = (k.clone(), d.clone());
                Box::pin(async move {
                    write_version(tx, &k, &d, now, false, &Preconditions::default()).await
                })
            })
            .await
    }

    #[tokio::test]
    async fn writes_decide_against_bucket_state_at_commit() {
        let fx = fixture(VersioningState::Enabled).await;
        let k = key("late");

        let ctx = fx.ledger.prepare(&k).await.unwrap();
        assert_eq!(ctx.versioning, VersioningState::Enabled);
        fx.buckets
            .set_versioning("t", "bkt", VersioningState::Suspended)
            .await
            .unwrap();
        let staged = write_in_tx(&fx, &k, ctx.now).await.unwrap();
        assert_eq!(staged.version.version_id, NULL_VERSION_ID);
        fx.ledger
            .delete_version(&k, DeleteTarget::Version(NULL_VERSION_ID.into()), false)
            .await
            .unwrap();

        let ctx = fx.ledger.prepare(&k).await.unwrap();
        fx.buckets.delete_bucket("t", "bkt").await.unwrap();
        let err = write_in_tx(&fx, &k, ctx.now).await.unwrap_err();
        assert!(matches!(err, StorageError::BucketNotFound(_)));
    }

    async fn sequence_rows(fx: &Fixture) -> i64 {
        sqlx::query_scalar("SELECT COUNT(*) FROM key_sequences")
            .fetch_one(fx.executor.pool())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn emptied_keys_release_their_sequence() {
        let fx = fixture(VersioningState::Enabled).await;
        let k = key("churn");
        let v1 = put(&fx, "churn", "aa/ss/1").await;
        let v2 = put(&fx, "churn", "aa/ss/2").await;
        put(&fx, "stays", "aa/ss/3").await;
        assert_eq!(sequence_rows(&fx).await, 2);

        fx.ledger
            .delete_version(&k, DeleteTarget::Version(v2.version_id), false)
            .await
            .unwrap();
        assert_eq!(sequence_rows(&fx).await, 2);
        fx.ledger
            .delete_version(&k, DeleteTarget::Version(v1.version_id), false)
            .await
            .unwrap();
        assert_eq!(sequence_rows(&fx).await, 1);

        let again = put(&fx, "churn", "aa/ss/4").await;
        assert_eq!(again.seq, 1);
        assert!(fx.ledger.get_current(&k).await.unwrap().is_latest());
    }

    #[tokio::test]
    async fn expiry_skips_entries_that_are_current() {
        let fx = fixture(VersioningState::Enabled).await;
        let k = key("exp");
        let v1 = put(&fx, "exp", "aa/kk/1").await;
        let outcome = fx
            .ledger
            .delete_version(&k, DeleteTarget::Expired(v1.version_id.clone()), false)
            .await
            .unwrap();
        assert_eq!(outcome.version_id, None);

        let marker = fx
            .ledger
            .delete_version(&k, DeleteTarget::Latest, false)
            .await
            .unwrap()
            .version_id
            .unwrap();
        // marker still shadows v1, so it is not the sole entry
        let outcome = fx
            .ledger
            .delete_version(&k, DeleteTarget::Expired(marker.clone()), false)
            .await
            .unwrap();
        assert_eq!(outcome.version_id, None);

        fx.ledger
            .delete_version(&k, DeleteTarget::Expired(v1.version_id), false)
            .await
            .unwrap();
        let outcome = fx
            .ledger
            .delete_version(&k, DeleteTarget::Expired(marker.clone()), false)
            .await
            .unwrap();
        assert_eq!(outcome.version_id, Some(marker));
        assert!(fx.ledger.list_key_versions(&k).await.unwrap().is_empty());
    }
}
