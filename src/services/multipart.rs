//! Multipart coordinator.
//!
//! Parts are streamed to the byte backend outside any transaction and only
//! then recorded. Completion reads the part set, stages the assembled version
//! through the ledger and removes the upload, all in one transaction. Parts
//! become segments of the new version, so no bytes are copied.

use crate::errors::{StorageError, StorageResult};
use crate::models::{
    from_millis,
    multipart::{
        CompletedPart, DeclaredMetadata, ListPartsPage, MultipartUpload, PartRecord, PartRow,
        UploadRow, UploadState, validate_part_number,
    },
    object::{ObjectKey, ObjectVersion, Segment, StorageRef, VersionDraft},
    to_millis,
};
use crate::services::{
    backend::{ByteBackend, ByteRange, ByteStream},
    bucket_store::bucket_in_tx,
    clock::SharedClock,
    conditions::{Preconditions, strip_quotes},
    content::open_content_checked,
    ledger::{self, VersionLedger},
    reclaim::{self, Reclaimer},
    transaction::{Tx, TxExecutor},
};
use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite};
use std::{collections::HashMap, sync::Arc};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Position of the last upload seen by a stale-upload scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaleCursor {
    pub last_activity_at: DateTime<Utc>,
    pub upload_id: String,
}

impl From<&MultipartUpload> for StaleCursor {
    fn from(upload: &MultipartUpload) -> Self {
        Self {
            last_activity_at: upload.last_activity_at,
            upload_id: upload.upload_id.clone(),
        }
    }
}

/// 5 MiB: every part but the last must be at least this large.
pub const DEFAULT_MIN_PART_SIZE: i64 = 5 * 1024 * 1024;

const MAX_LIST_PARTS: usize = 1000;

const UPLOAD_SELECT: &str = "SELECT u.upload_id, u.tenant_id, u.bucket, u.key, u.initiated_at, \
     u.last_activity_at, u.content_type, u.user_metadata, u.retention_mode, u.retain_until, \
     u.legal_hold, \
     (SELECT COUNT(*) FROM multipart_parts p WHERE p.upload_id = u.upload_id) AS part_count \
     FROM multipart_uploads u";

#[derive(Clone)]
pub struct MultipartCoordinator {
    executor: TxExecutor,
    ledger: VersionLedger,
    backend: Arc<dyn ByteBackend>,
    reclaimer: Reclaimer,
    clock: SharedClock,
    min_part_size: i64,
}

impl MultipartCoordinator {
    pub fn new(
        executor: TxExecutor,
        ledger: VersionLedger,
        backend: Arc<dyn ByteBackend>,
        reclaimer: Reclaimer,
        clock: SharedClock,
        min_part_size: i64,
    ) -> Self {
        Self {
            executor,
            ledger,
            backend,
            reclaimer,
            clock,
            min_part_size,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        from_millis(to_millis(self.clock.now()))
    }

    pub async fn initiate(
        &self,
        key: &ObjectKey,
        declared: DeclaredMetadata,
    ) -> StorageResult<MultipartUpload> {
        // fails fast on a missing bucket
        let ctx = self.ledger.prepare(key).await?;
        if let Some(retention) = &declared.retention {
            if !retention.is_active(ctx.now) {
                return Err(StorageError::Validation(
                    "retain-until date must be in the future".into(),
                ));
            }
        }

        let upload = MultipartUpload {
            upload_id: Uuid::new_v4().simple().to_string(),
            key: key.clone(),
            initiated_at: ctx.now,
            last_activity_at: ctx.now,
            declared,
            state: UploadState::Initiated,
        };
        let user_metadata = serde_json::to_string(&upload.declared.user_metadata)
            .map_err(|err| StorageError::Internal(format!("encoding user metadata: {}", err)))?;

        let row = upload.clone();
        self.executor
            .run("initiate_upload", |tx| {
                let (row, user_metadata) = (row.clone(), user_metadata.clone());
                Box::pin(async move {
                    bucket_in_tx(tx, &row.key.tenant_id, &row.key.bucket).await?;
                    sqlx::query(
                        "INSERT INTO multipart_uploads
                            (upload_id, tenant_id, bucket, key, initiated_at, last_activity_at,
                             content_type, user_metadata, retention_mode, retain_until, legal_hold)
                         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(&row.upload_id)
                    .bind(&row.key.tenant_id)
                    .bind(&row.key.bucket)
                    .bind(&row.key.key)
                    .bind(to_millis(row.initiated_at))
                    .bind(to_millis(row.last_activity_at))
                    .bind(&row.declared.content_type)
                    .bind(user_metadata)
                    .bind(row.declared.retention.map(|r| r.mode.as_str()))
                    .bind(row.declared.retention.map(|r| to_millis(r.retain_until)))
                    .bind(row.declared.legal_hold)
                    .execute(&mut **tx)
                    .await?;
                    Ok(())
                })
            })
            .await?;

        info!(key = %key, upload_id = %upload.upload_id, "multipart upload initiated");
        Ok(upload)
    }

    /// Store one part. Uploading the same part number again replaces it.
    pub async fn upload_part(
        &self,
        key: &ObjectKey,
        upload_id: &str,
        part_number: i64,
        body: ByteStream,
    ) -> StorageResult<PartRecord> {
        validate_part_number(part_number)?;
        self.get_upload(key, upload_id).await?;

        let blob = self.backend.put(body).await?;
        let now = self.now();
        let record = PartRecord {
            upload_id: upload_id.to_string(),
            part_number,
            size: blob.size,
            etag: blob.md5.clone(),
            storage_reference: blob.reference.clone(),
            uploaded_at: now,
        };

        let staged = record.clone();
        let committed = self
            .executor
            .run("upload_part", |tx| {
                let (key, part) = (key.clone(), staged.clone());
                Box::pin(async move {
                    load_upload(tx, &key, &part.upload_id).await?;
                    let replaced: Option<String> = sqlx::query_scalar(
                        "SELECT storage_ref FROM multipart_parts WHERE upload_id = ? AND part_number = ?",
                    )
                    .bind(&part.upload_id)
                    .bind(part.part_number)
                    .fetch_optional(&mut **tx)
                    .await?;

                    sqlx::query(
                        "INSERT INTO multipart_parts (upload_id, part_number, size, etag, storage_ref, uploaded_at)
                         VALUES (?, ?, ?, ?, ?, ?)
                         ON CONFLICT (upload_id, part_number) DO UPDATE SET
                            size = excluded.size,
                            etag = excluded.etag,
                            storage_ref = excluded.storage_ref,
                            uploaded_at = excluded.uploaded_at",
                    )
                    .bind(&part.upload_id)
                    .bind(part.part_number)
                    .bind(part.size)
                    .bind(&part.etag)
                    .bind(&part.storage_reference)
                    .bind(to_millis(part.uploaded_at))
                    .execute(&mut **tx)
                    .await?;

                    sqlx::query("UPDATE multipart_uploads SET last_activity_at = ? WHERE upload_id = ?")
                        .bind(to_millis(part.uploaded_at))
                        .bind(&part.upload_id)
                        .execute(&mut **tx)
                        .await?;

                    let released: Vec<String> = replaced.into_iter().collect();
                    reclaim::schedule(tx, &released, part.uploaded_at).await?;
                    Ok(released)
                })
            })
            .await;

        match committed {
            Ok(released) => {
                debug!(
                    upload_id = %upload_id,
                    part_number,
                    size = record.size,
                    "stored part"
                );
                self.reclaimer.reclaim(&released).await;
                Ok(record)
            }
            Err(err) => {
                self.discard_blob(&record.storage_reference).await;
                Err(err)
            }
        }
    }

    /// Store a range of an existing version as a part.
    pub async fn copy_part(
        &self,
        key: &ObjectKey,
        upload_id: &str,
        part_number: i64,
        source: &ObjectKey,
        source_version_id: Option<&str>,
        range: Option<&str>,
    ) -> StorageResult<PartRecord> {
        validate_part_number(part_number)?;
        self.get_upload(key, upload_id).await?;
        let version = self.ledger.resolve_version(source, source_version_id).await?;
        let range = match range {
            Some(spec) => Some(ByteRange::parse(spec, u64::try_from(version.size).unwrap_or(0))?),
            None => None,
        };
        let body = open_content_checked(self.backend.clone(), &version.storage_ref, range).await?;
        self.upload_part(key, upload_id, part_number, body).await
    }

    /// Assemble the listed parts into one version and retire the upload.
    pub async fn complete(
        &self,
        key: &ObjectKey,
        upload_id: &str,
        parts: Vec<CompletedPart>,
        bypass_governance: bool,
        preconditions: &Preconditions,
    ) -> StorageResult<ObjectVersion> {
        if parts.is_empty() {
            return Err(StorageError::Validation(
                "CompleteMultipartUpload requires at least one part".into(),
            ));
        }
        for pair in parts.windows(2) {
            if pair[1].part_number <= pair[0].part_number {
                return Err(StorageError::Validation(
                    "parts must be listed in strictly ascending order".into(),
                ));
            }
        }
        for part in &parts {
            validate_part_number(part.part_number)?;
        }

        let now = self.ledger.prepare(key).await?.now;
        let min_part_size = self.min_part_size;
        let (upload_id, parts) = (upload_id.to_string(), parts);
        let (version, released) = self
            .executor
            .run("complete_upload", |tx| {
                let (key, upload_id, parts, preconditions) =
                    (key.clone(), upload_id.clone(), parts.clone(), preconditions.clone());
                Box::pin(async move {
                    let upload = load_upload(tx, &key, &upload_id).await?;
                    let stored = load_parts(tx, &upload_id).await?;
                    let assembled = assemble(&parts, stored, min_part_size)?;

                    let draft = VersionDraft {
                        size: assembled.storage_ref.total_size(),
                        etag: assembled.etag,
                        content_type: upload.declared.content_type.clone(),
                        user_metadata: upload.declared.user_metadata.clone(),
                        storage_ref: assembled.storage_ref,
                        retention: upload.declared.retention,
                        legal_hold: upload.declared.legal_hold,
                    };
                    let staged =
                        ledger::write_version(tx, &key, &draft, now, bypass_governance, &preconditions)
                            .await?;

                    delete_upload(tx, &upload_id).await?;
                    let mut released = assembled.unused;
                    reclaim::schedule(tx, &released, now).await?;
                    released.extend(staged.released);
                    Ok((staged.version, released))
                })
            })
            .await?;

        info!(
            key = %key,
            upload_id = %upload_id,
            version_id = %version.version_id,
            size = version.size,
            parts = version.storage_ref.segments.len(),
            "multipart upload completed"
        );
        self.reclaimer.reclaim(&released).await;
        Ok(version)
    }

    pub async fn abort(&self, key: &ObjectKey, upload_id: &str) -> StorageResult<()> {
        let now = self.now();
        let upload_id_owned = upload_id.to_string();
        let released = self
            .executor
            .run("abort_upload", |tx| {
                let (key, upload_id) = (key.clone(), upload_id_owned.clone());
                Box::pin(async move {
                    load_upload(tx, &key, &upload_id).await?;
                    let released: Vec<String> = load_parts(tx, &upload_id)
                        .await?
                        .into_iter()
                        .map(|p| p.storage_reference)
                        .collect();
                    delete_upload(tx, &upload_id).await?;
                    reclaim::schedule(tx, &released, now).await?;
                    Ok(released)
                })
            })
            .await?;

        info!(key = %key, upload_id = %upload_id, parts = released.len(), "multipart upload aborted");
        self.reclaimer.reclaim(&released).await;
        Ok(())
    }

    pub async fn get_upload(&self, key: &ObjectKey, upload_id: &str) -> StorageResult<MultipartUpload> {
        let (key, upload_id) = (key.clone(), upload_id.to_string());
        self.executor
            .run("get_upload", |tx| {
                let (key, upload_id) = (key.clone(), upload_id.clone());
                Box::pin(async move { load_upload(tx, &key, &upload_id).await })
            })
            .await
    }

    pub async fn list_parts(
        &self,
        key: &ObjectKey,
        upload_id: &str,
        part_number_marker: Option<i64>,
        max_parts: usize,
    ) -> StorageResult<ListPartsPage> {
        let max_parts = max_parts.clamp(1, MAX_LIST_PARTS);
        let (key, upload_id) = (key.clone(), upload_id.to_string());
        let mut parts = self
            .executor
            .run("list_parts", |tx| {
                let (key, upload_id) = (key.clone(), upload_id.clone());
                Box::pin(async move {
                    load_upload(tx, &key, &upload_id).await?;
                    let rows: Vec<PartRow> = sqlx::query_as(
                        "SELECT upload_id, part_number, size, etag, storage_ref, uploaded_at
                         FROM multipart_parts
                         WHERE upload_id = ? AND part_number > ?
                         ORDER BY part_number ASC LIMIT ?",
                    )
                    .bind(&upload_id)
                    .bind(part_number_marker.unwrap_or(0))
                    .bind((max_parts + 1) as i64)
                    .fetch_all(&mut **tx)
                    .await?;
                    Ok(rows.into_iter().map(PartRecord::from).collect::<Vec<_>>())
                })
            })
            .await?;

        let is_truncated = parts.len() > max_parts;
        parts.truncate(max_parts);
        let next_part_number_marker = if is_truncated {
            parts.last().map(|p| p.part_number)
        } else {
            None
        };
        Ok(ListPartsPage {
            parts,
            is_truncated,
            next_part_number_marker,
        })
    }

    /// In-flight uploads of a bucket, oldest first.
    pub async fn list_uploads(
        &self,
        tenant_id: &str,
        bucket: &str,
        prefix: Option<&str>,
    ) -> StorageResult<Vec<MultipartUpload>> {
        let (tenant_id, bucket) = (tenant_id.to_string(), bucket.to_string());
        let prefix = prefix.unwrap_or_default().to_string();
        self.executor
            .run("list_uploads", |tx| {
                let (tenant_id, bucket, prefix) = (tenant_id.clone(), bucket.clone(), prefix.clone());
                Box::pin(async move {
                    let sql = format!(
                        "{} WHERE u.tenant_id = ? AND u.bucket = ?
                           AND substr(u.key, 1, length(?)) = ?
                         ORDER BY u.key ASC, u.initiated_at ASC",
                        UPLOAD_SELECT
                    );
                    let rows: Vec<UploadRow> = sqlx::query_as(&sql)
                        .bind(&tenant_id)
                        .bind(&bucket)
                        .bind(&prefix)
                        .bind(&prefix)
                        .fetch_all(&mut **tx)
                        .await?;
                    rows.into_iter().map(MultipartUpload::try_from).collect()
                })
            })
            .await
    }

    /// Uploads with no activity since `idle_before`, optionally limited to one
    /// bucket, ordered by `(last_activity_at, upload_id)` and starting strictly
    /// after the `after` cursor.
    pub async fn stale_uploads(
        &self,
        scope: Option<(&str, &str)>,
        idle_before: DateTime<Utc>,
        after: Option<&StaleCursor>,
        limit: i64,
    ) -> StorageResult<Vec<MultipartUpload>> {
        let scope = scope.map(|(tenant, bucket)| (tenant.to_string(), bucket.to_string()));
        let after = after.cloned();
        self.executor
            .run("stale_uploads", |tx| {
                let (scope, after) = (scope.clone(), after.clone());
                Box::pin(async move {
                    let mut builder = QueryBuilder::<Sqlite>::new(UPLOAD_SELECT);
                    builder.push(" WHERE u.last_activity_at < ");
                    builder.push_bind(to_millis(idle_before));
                    if let Some((tenant_id, bucket)) = scope {
                        builder.push(" AND u.tenant_id = ");
                        builder.push_bind(tenant_id);
                        builder.push(" AND u.bucket = ");
                        builder.push_bind(bucket);
                    }
                    if let Some(cursor) = after {
                        let at = to_millis(cursor.last_activity_at);
                        builder.push(" AND (u.last_activity_at > ");
                        builder.push_bind(at);
                        builder.push(" OR (u.last_activity_at = ");
                        builder.push_bind(at);
                        builder.push(" AND u.upload_id > ");
                        builder.push_bind(cursor.upload_id);
                        builder.push("))");
                    }
                    builder.push(" ORDER BY u.last_activity_at ASC, u.upload_id ASC LIMIT ");
                    builder.push_bind(limit);

                    let rows: Vec<UploadRow> = builder.build_query_as().fetch_all(&mut **tx).await?;
                    rows.into_iter().map(MultipartUpload::try_from).collect()
                })
            })
            .await
    }

    async fn discard_blob(&self, reference: &str) {
        if let Err(err) = self.backend.delete(reference).await {
            warn!(reference = %reference, error = %err, "failed to discard uncommitted part blob");
        }
    }
}

struct Assembled {
    storage_ref: StorageRef,
    etag: String,
    /// Stored parts left out of the completion list.
    unused: Vec<String>,
}

/// Check the requested part list against the stored parts and build the
/// segments and composite ETag of the resulting version.
fn assemble(
    requested: &[CompletedPart],
    stored: Vec<PartRecord>,
    min_part_size: i64,
) -> StorageResult<Assembled> {
    let mut by_number: HashMap<i64, PartRecord> =
        stored.into_iter().map(|p| (p.part_number, p)).collect();

    let mut segments = Vec::with_capacity(requested.len());
    let mut digests = Vec::with_capacity(requested.len() * 16);
    let last_index = requested.len() - 1;
    for (index, wanted) in requested.iter().enumerate() {
        let part = by_number.remove(&wanted.part_number).ok_or_else(|| {
            StorageError::Validation(format!(
                "part {} has not been uploaded",
                wanted.part_number
            ))
        })?;
        if let Some(etag) = &wanted.etag {
            if strip_quotes(etag) != part.etag {
                return Err(StorageError::Validation(format!(
                    "ETag mismatch for part {}",
                    wanted.part_number
                )));
            }
        }
        if index != last_index && part.size < min_part_size {
            return Err(StorageError::Validation(format!(
                "part {} is {} bytes, smaller than the {} byte minimum",
                wanted.part_number, part.size, min_part_size
            )));
        }
        let digest = hex::decode(&part.etag).map_err(|err| {
            StorageError::Internal(format!("part {} has a malformed checksum: {}", part.part_number, err))
        })?;
        digests.extend_from_slice(&digest);
        segments.push(Segment {
            reference: part.storage_reference,
            size: part.size,
        });
    }

    Ok(Assembled {
        storage_ref: StorageRef { segments },
        etag: format!("{:x}-{}", md5::compute(&digests), requested.len()),
        unused: by_number.into_values().map(|p| p.storage_reference).collect(),
    })
}

async fn load_upload(tx: &mut Tx, key: &ObjectKey, upload_id: &str) -> StorageResult<MultipartUpload> {
    let sql = format!("{} WHERE u.upload_id = ?", UPLOAD_SELECT);
    let row: Option<UploadRow> = sqlx::query_as(&sql)
        .bind(upload_id)
        .fetch_optional(&mut **tx)
        .await?;
    let upload = row
        .map(MultipartUpload::try_from)
        .transpose()?
        .filter(|u| &u.key == key)
        .ok_or_else(|| StorageError::UploadNotFound(upload_id.to_string()))?;
    Ok(upload)
}

async fn load_parts(tx: &mut Tx, upload_id: &str) -> StorageResult<Vec<PartRecord>> {
    let rows: Vec<PartRow> = sqlx::query_as(
        "SELECT upload_id, part_number, size, etag, storage_ref, uploaded_at
         FROM multipart_parts WHERE upload_id = ? ORDER BY part_number ASC",
    )
    .bind(upload_id)
    .fetch_all(&mut **tx)
    .await?;
    Ok(rows.into_iter().map(PartRecord::from).collect())
}

async fn delete_upload(tx: &mut Tx, upload_id: &str) -> StorageResult<()> {
    sqlx::query("DELETE FROM multipart_parts WHERE upload_id = ?")
        .bind(upload_id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("DELETE FROM multipart_uploads WHERE upload_id = ?")
        .bind(upload_id)
        .execute(&mut **tx)
        .await?;
    Ok(())
}
