//! src/services/storage_service.rs
//!
//! StorageService: the S3-like surface the HTTP handlers call. It validates
//! keys and bucket names, streams bodies into the byte backend, and hands the
//! metadata work to the ledger, the multipart coordinator and the bucket
//! store. Bytes are always written before the metadata commit that
//! references them; if that commit fails the new blob is discarded.

use crate::errors::{StorageError, StorageResult};
use crate::models::{
    bucket::{Bucket, LifecycleRule, VersioningState},
    multipart::{CompletedPart, DeclaredMetadata, ListPartsPage, MultipartUpload, PartRecord},
    object::{ObjectKey, ObjectVersion, StorageRef, VersionDraft},
    retention::{DefaultRetention, Retention},
};
use crate::services::{
    backend::{ByteBackend, ByteRange, ByteStream, StoredBlob},
    bucket_store::{BucketConfigStore, SqliteBucketStore, validate_bucket_name},
    chunked::{as_decode_error, decode_aws_chunked},
    clock::SharedClock,
    conditions::Preconditions,
    content::open_content_checked,
    ledger::{DeleteOutcome, DeleteTarget, ListVersionsPage, ListVersionsParams, VersionLedger},
    lifecycle::{LifecycleSweeper, SweeperConfig},
    multipart::{DEFAULT_MIN_PART_SIZE, MultipartCoordinator},
    reclaim::Reclaimer,
    transaction::{RetryPolicy, TxExecutor},
};
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{debug, warn};

const MAX_OBJECT_KEY_LEN: usize = 1024;

/// Knobs the service is built with.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Tenant used when a request names none.
    pub default_tenant: String,
    pub retry: RetryPolicy,
    pub min_part_size: i64,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            default_tenant: "default".into(),
            retry: RetryPolicy::default(),
            min_part_size: DEFAULT_MIN_PART_SIZE,
        }
    }
}

/// How a request body arrives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BodyEncoding {
    #[default]
    Plain,
    /// `aws-chunked` framing around `decoded_length` payload bytes.
    AwsChunked { decoded_length: u64 },
}

/// Where a copy takes the destination's content type and user metadata from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MetadataDirective {
    #[default]
    Copy,
    Replace,
}

/// A resolved read: the version, the range served and the content stream.
pub struct ObjectRead {
    pub version: ObjectVersion,
    pub range: Option<ByteRange>,
    pub body: ByteStream,
}

/// StorageService ties the metadata core to the byte backend.
///
/// Cloning is cheap; every component shares the same pool, executor and
/// backend.
#[derive(Clone)]
pub struct StorageService {
    /// Shared SQLite connection pool used for metadata operations.
    pub db: Arc<SqlitePool>,
    default_tenant: String,
    buckets: SqliteBucketStore,
    ledger: VersionLedger,
    multipart: MultipartCoordinator,
    reclaimer: Reclaimer,
    backend: Arc<dyn ByteBackend>,
    clock: SharedClock,
}

impl StorageService {
    pub fn new(
        db: Arc<SqlitePool>,
        backend: Arc<dyn ByteBackend>,
        clock: SharedClock,
        options: ServiceOptions,
    ) -> Self {
        let executor = TxExecutor::new(db.clone(), options.retry);
        let buckets = SqliteBucketStore::new(executor.clone());
        let reclaimer = Reclaimer::new(executor.clone(), backend.clone());
        let ledger = VersionLedger::new(
            executor.clone(),
            Arc::new(buckets.clone()),
            clock.clone(),
            reclaimer.clone(),
        );
        let multipart = MultipartCoordinator::new(
            executor,
            ledger.clone(),
            backend.clone(),
            reclaimer.clone(),
            clock.clone(),
            options.min_part_size,
        );
        Self {
            db,
            default_tenant: options.default_tenant,
            buckets,
            ledger,
            multipart,
            reclaimer,
            backend,
            clock,
        }
    }

    pub fn default_tenant(&self) -> &str {
        &self.default_tenant
    }

    /// Background sweeper sharing this service's components.
    pub fn sweeper(&self, config: SweeperConfig) -> LifecycleSweeper {
        let buckets: Arc<dyn BucketConfigStore> = Arc::new(self.buckets.clone());
        LifecycleSweeper::new(
            buckets,
            self.ledger.clone(),
            self.multipart.clone(),
            self.reclaimer.clone(),
            self.clock.clone(),
            config,
        )
    }

    /// Build a validated key address.
    pub fn object_key(&self, tenant_id: &str, bucket: &str, key: &str) -> StorageResult<ObjectKey> {
        validate_bucket_name(bucket)?;
        ensure_key_safe(key)?;
        Ok(ObjectKey::new(tenant_id, bucket, key))
    }

    // ---- buckets -------------------------------------------------------

    pub async fn create_bucket(&self, tenant_id: &str, name: &str, region: &str) -> StorageResult<Bucket> {
        self.buckets.create_bucket(tenant_id, name, region).await
    }

    pub async fn delete_bucket(&self, tenant_id: &str, name: &str) -> StorageResult<()> {
        self.buckets.delete_bucket(tenant_id, name).await
    }

    pub async fn get_bucket(&self, tenant_id: &str, name: &str) -> StorageResult<Bucket> {
        self.buckets.fetch_bucket(tenant_id, name).await
    }

    pub async fn set_versioning(
        &self,
        tenant_id: &str,
        name: &str,
        state: VersioningState,
    ) -> StorageResult<()> {
        self.buckets.set_versioning(tenant_id, name, state).await
    }

    pub async fn set_default_retention(
        &self,
        tenant_id: &str,
        name: &str,
        retention: Option<DefaultRetention>,
    ) -> StorageResult<()> {
        self.buckets.set_default_retention(tenant_id, name, retention).await
    }

    pub async fn set_lifecycle_rules(
        &self,
        tenant_id: &str,
        name: &str,
        rules: Vec<LifecycleRule>,
    ) -> StorageResult<()> {
        self.buckets.set_lifecycle_rules(tenant_id, name, rules).await
    }

    pub async fn get_lifecycle_rules(&self, tenant_id: &str, name: &str) -> StorageResult<Vec<LifecycleRule>> {
        self.buckets.lifecycle_rules(tenant_id, name).await
    }

    pub async fn list_versions(
        &self,
        tenant_id: &str,
        bucket: &str,
        params: ListVersionsParams,
    ) -> StorageResult<ListVersionsPage> {
        self.buckets.fetch_bucket(tenant_id, bucket).await?;
        self.ledger.list_versions(tenant_id, bucket, params).await
    }

    pub async fn list_uploads(
        &self,
        tenant_id: &str,
        bucket: &str,
        prefix: Option<&str>,
    ) -> StorageResult<Vec<MultipartUpload>> {
        self.buckets.fetch_bucket(tenant_id, bucket).await?;
        self.multipart.list_uploads(tenant_id, bucket, prefix).await
    }

    // ---- objects -------------------------------------------------------

    /// Stream a body into the backend and record it as a new version.
    ///
    /// Write preconditions are checked once before the body is read, so a
    /// doomed upload is refused early, and again inside the commit.
    pub async fn put_object(
        &self,
        key: &ObjectKey,
        body: ByteStream,
        encoding: BodyEncoding,
        attributes: DeclaredMetadata,
        bypass_governance: bool,
        preconditions: &Preconditions,
    ) -> StorageResult<ObjectVersion> {
        self.precheck_write(key, preconditions).await?;
        let blob = self.store_body(body, encoding).await?;
        self.commit_blob(key, blob, attributes, bypass_governance, preconditions)
            .await
    }

    pub async fn get_object(
        &self,
        key: &ObjectKey,
        version_id: Option<&str>,
        range: Option<&str>,
        preconditions: &Preconditions,
    ) -> StorageResult<ObjectRead> {
        let version = self.head_object(key, version_id, preconditions).await?;
        let range = match range {
            Some(spec) => Some(ByteRange::parse(spec, u64::try_from(version.size).unwrap_or(0))?),
            None => None,
        };
        let body = open_content_checked(self.backend.clone(), &version.storage_ref, range)
            .await
            .map_err(|err| missing_content(key, &version, err))?;
        Ok(ObjectRead {
            version,
            range,
            body,
        })
    }

    pub async fn head_object(
        &self,
        key: &ObjectKey,
        version_id: Option<&str>,
        preconditions: &Preconditions,
    ) -> StorageResult<ObjectVersion> {
        let version = self.ledger.resolve_version(key, version_id).await?;
        preconditions.evaluate_read(&version)?;
        Ok(version)
    }

    pub async fn delete_object(
        &self,
        key: &ObjectKey,
        version_id: Option<&str>,
        bypass_governance: bool,
    ) -> StorageResult<DeleteOutcome> {
        let target = match version_id {
            Some(id) => DeleteTarget::Version(id.to_string()),
            None => DeleteTarget::Latest,
        };
        self.ledger
            .delete_version(key, target, bypass_governance)
            .await
    }

    /// Copy the content of a source version into a new version at `dest`.
    ///
    /// Destination preconditions are checked before any byte is copied and
    /// again inside the commit.
    #[allow(clippy::too_many_arguments)]
    pub async fn copy_object(
        &self,
        source: &ObjectKey,
        source_version_id: Option<&str>,
        dest: &ObjectKey,
        directive: MetadataDirective,
        attributes: DeclaredMetadata,
        bypass_governance: bool,
        preconditions: &Preconditions,
    ) -> StorageResult<ObjectVersion> {
        self.precheck_write(dest, preconditions).await?;
        let version = self.ledger.resolve_version(source, source_version_id).await?;
        let attributes = match directive {
            MetadataDirective::Copy => DeclaredMetadata {
                content_type: version.content_type.clone(),
                user_metadata: version.user_metadata.clone(),
                ..attributes
            },
            MetadataDirective::Replace => attributes,
        };

        let body = open_content_checked(self.backend.clone(), &version.storage_ref, None)
            .await
            .map_err(|err| missing_content(source, &version, err))?;
        let blob = self.backend.put(body).await?;
        debug!(
            source = %source,
            source_version_id = %version.version_id,
            dest = %dest,
            "copied content"
        );
        self.commit_blob(dest, blob, attributes, bypass_governance, preconditions)
            .await
    }

    // ---- object lock ---------------------------------------------------

    pub async fn put_retention(
        &self,
        key: &ObjectKey,
        version_id: Option<&str>,
        retention: Option<Retention>,
        bypass_governance: bool,
    ) -> StorageResult<ObjectVersion> {
        self.ledger
            .set_retention(key, version_id, retention, bypass_governance)
            .await
    }

    pub async fn get_retention(
        &self,
        key: &ObjectKey,
        version_id: Option<&str>,
    ) -> StorageResult<Option<Retention>> {
        self.ledger.get_retention(key, version_id).await
    }

    pub async fn put_legal_hold(
        &self,
        key: &ObjectKey,
        version_id: Option<&str>,
        on: bool,
    ) -> StorageResult<ObjectVersion> {
        self.ledger.set_legal_hold(key, version_id, on).await
    }

    pub async fn get_legal_hold(&self, key: &ObjectKey, version_id: Option<&str>) -> StorageResult<bool> {
        self.ledger.get_legal_hold(key, version_id).await
    }

    // ---- multipart -----------------------------------------------------

    pub async fn initiate_upload(
        &self,
        key: &ObjectKey,
        declared: DeclaredMetadata,
    ) -> StorageResult<MultipartUpload> {
        self.multipart.initiate(key, declared).await
    }

    pub async fn upload_part(
        &self,
        key: &ObjectKey,
        upload_id: &str,
        part_number: i64,
        body: ByteStream,
        encoding: BodyEncoding,
    ) -> StorageResult<PartRecord> {
        self.multipart
            .upload_part(key, upload_id, part_number, decode_body(body, encoding))
            .await
            .map_err(classify_body_error)
    }

    pub async fn copy_part(
        &self,
        key: &ObjectKey,
        upload_id: &str,
        part_number: i64,
        source: &ObjectKey,
        source_version_id: Option<&str>,
        range: Option<&str>,
    ) -> StorageResult<PartRecord> {
        self.multipart
            .copy_part(key, upload_id, part_number, source, source_version_id, range)
            .await
    }

    pub async fn complete_upload(
        &self,
        key: &ObjectKey,
        upload_id: &str,
        parts: Vec<CompletedPart>,
        bypass_governance: bool,
        preconditions: &Preconditions,
    ) -> StorageResult<ObjectVersion> {
        self.multipart
            .complete(key, upload_id, parts, bypass_governance, preconditions)
            .await
    }

    pub async fn abort_upload(&self, key: &ObjectKey, upload_id: &str) -> StorageResult<()> {
        self.multipart.abort(key, upload_id).await
    }

    pub async fn list_parts(
        &self,
        key: &ObjectKey,
        upload_id: &str,
        part_number_marker: Option<i64>,
        max_parts: usize,
    ) -> StorageResult<ListPartsPage> {
        self.multipart
            .list_parts(key, upload_id, part_number_marker, max_parts)
            .await
    }

    // ---- health --------------------------------------------------------

    pub async fn check_database(&self) -> StorageResult<()> {
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&*self.db).await?;
        if one != 1 {
            return Err(StorageError::Internal(format!("unexpected result: {}", one)));
        }
        Ok(())
    }

    pub async fn check_backend(&self) -> StorageResult<()> {
        self.backend.health_check().await?;
        Ok(())
    }

    pub async fn pending_reclaims(&self) -> StorageResult<i64> {
        self.reclaimer.pending().await
    }

    // ---- internals -----------------------------------------------------

    /// Refuse a doomed write before its bytes move. A missing bucket fails
    /// here too.
    async fn precheck_write(&self, key: &ObjectKey, preconditions: &Preconditions) -> StorageResult<()> {
        if preconditions.is_empty() {
            self.ledger.prepare(key).await?;
            return Ok(());
        }
        let current = self.current_version(key).await?;
        preconditions.evaluate_write(current.as_ref())
    }

    /// Current version of `key`, `None` when absent or behind a delete marker.
    async fn current_version(&self, key: &ObjectKey) -> StorageResult<Option<ObjectVersion>> {
        match self.ledger.get_current(key).await {
            Ok(entry) => Ok(entry.as_version().cloned()),
            Err(StorageError::ObjectNotFound { .. }) => {
                // distinguishes an empty key from a missing bucket
                self.ledger.prepare(key).await?;
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn store_body(&self, body: ByteStream, encoding: BodyEncoding) -> StorageResult<StoredBlob> {
        self.backend
            .put(decode_body(body, encoding))
            .await
            .map_err(|err| classify_body_error(StorageError::Io(err)))
    }

    /// Record a stored blob as a version, discarding the blob if the commit fails.
    async fn commit_blob(
        &self,
        key: &ObjectKey,
        blob: StoredBlob,
        attributes: DeclaredMetadata,
        bypass_governance: bool,
        preconditions: &Preconditions,
    ) -> StorageResult<ObjectVersion> {
        let draft = VersionDraft {
            size: blob.size,
            etag: blob.md5.clone(),
            content_type: attributes.content_type,
            user_metadata: attributes.user_metadata,
            storage_ref: StorageRef::single(blob.reference.clone(), blob.size),
            retention: attributes.retention,
            legal_hold: attributes.legal_hold,
        };
        match self
            .ledger
            .put_version(key, draft, bypass_governance, preconditions)
            .await
        {
            Ok(version) => Ok(version),
            Err(err) => {
                if let Err(del_err) = self.backend.delete(&blob.reference).await {
                    warn!(
                        reference = %blob.reference,
                        error = %del_err,
                        "failed to discard blob of an uncommitted write"
                    );
                }
                Err(err)
            }
        }
    }
}

fn decode_body(body: ByteStream, encoding: BodyEncoding) -> ByteStream {
    match encoding {
        BodyEncoding::Plain => body,
        BodyEncoding::AwsChunked { decoded_length } => decode_aws_chunked(body, decoded_length),
    }
}

/// Malformed chunk framing is the client's fault, not an I/O failure.
fn classify_body_error(err: StorageError) -> StorageError {
    match err {
        StorageError::Io(io_err) => match as_decode_error(&io_err) {
            Some(decode_err) => StorageError::Validation(format!("invalid aws-chunked body: {}", decode_err)),
            None => StorageError::Io(io_err),
        },
        other => other,
    }
}

/// A committed version whose blob is gone reads as an internal error with
/// enough context to find it.
fn missing_content(key: &ObjectKey, version: &ObjectVersion, err: std::io::Error) -> StorageError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StorageError::Internal(format!(
            "content of `{}` version `{}` is missing from the byte backend",
            key, version.version_id
        ))
    } else {
        StorageError::Io(err)
    }
}

/// Basic key validation to avoid trivial path traversal vectors.
///
/// Rejects keys that begin with `/`, contain `..` or carry control bytes.
pub fn ensure_key_safe(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return Err(StorageError::InvalidObjectKey);
    }
    if key.starts_with('/') || key.contains("..") {
        return Err(StorageError::InvalidObjectKey);
    }
    if key
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(StorageError::InvalidObjectKey);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::models::retention::RetentionMode;
    use crate::services::{
        backend::{FsBackend, collect_stream, stream_of},
        clock::{Clock, ManualClock},
    };
    use chrono::{Duration, TimeZone, Utc};
    use std::time::Duration as StdDuration;
    use tempfile::TempDir;

    struct Harness {
        service: StorageService,
        clock: ManualClock,
        _dir: TempDir,
    }

    async fn harness() -> Harness {
        let dir = TempDir::new().unwrap();
        let backend: Arc<dyn ByteBackend> = Arc::new(FsBackend::new(dir.path()));
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap());
        let service = StorageService::new(
            Arc::new(test_pool().await),
            backend,
            Arc::new(clock.clone()),
            ServiceOptions {
                default_tenant: "t".into(),
                retry: RetryPolicy {
                    max_attempts: 20,
                    base_backoff: StdDuration::from_millis(1),
                    max_backoff: StdDuration::from_millis(5),
                },
                min_part_size: 4,
            },
        );
        service.create_bucket("t", "docs", "local").await.unwrap();
        service
            .set_versioning("t", "docs", VersioningState::Enabled)
            .await
            .unwrap();
        Harness {
            service,
            clock,
            _dir: dir,
        }
    }

    fn key(name: &str) -> ObjectKey {
        ObjectKey::new("t", "docs", name)
    }

    async fn put(svc: &StorageService, name: &str, body: &[u8]) -> ObjectVersion {
        svc.put_object(
            &key(name),
            stream_of(body, 3),
            BodyEncoding::Plain,
            DeclaredMetadata::default(),
            false,
            &Preconditions::default(),
        )
        .await
        .unwrap()
    }

    async fn read(svc: &StorageService, name: &str, version_id: Option<&str>, range: Option<&str>) -> Vec<u8> {
        let read = svc
            .get_object(&key(name), version_id, range, &Preconditions::default())
            .await
            .unwrap();
        collect_stream(read.body).await.unwrap()
    }

    #[tokio::test]
    async fn put_get_and_read_old_versions() {
        let h = harness().await;
        let v1 = put(&h.service, "a.txt", b"first").await;
        let v2 = put(&h.service, "a.txt", b"second").await;
        assert_eq!(v1.etag, format!("{:x}", md5::compute(b"first")));

        assert_eq!(read(&h.service, "a.txt", None, None).await, b"second");
        assert_eq!(read(&h.service, "a.txt", Some(&v1.version_id), None).await, b"first");
        assert_eq!(read(&h.service, "a.txt", None, Some("bytes=1-3")).await, b"eco");
        assert_eq!(read(&h.service, "a.txt", None, Some("bytes=-2")).await, b"nd");

        let out_of_range = h
            .service
            .get_object(&key("a.txt"), None, Some("bytes=100-"), &Preconditions::default())
            .await;
        assert!(matches!(out_of_range, Err(StorageError::InvalidRange(_))));

        h.service.delete_object(&key("a.txt"), None, false).await.unwrap();
        let gone = h
            .service
            .head_object(&key("a.txt"), None, &Preconditions::default())
            .await;
        assert!(matches!(gone, Err(StorageError::ObjectNotFound { .. })));
        assert_eq!(read(&h.service, "a.txt", Some(&v2.version_id), None).await, b"second");
    }

    #[tokio::test]
    async fn chunked_bodies_are_decoded_and_bad_framing_is_rejected() {
        let h = harness().await;
        let encoded = b"5;chunk-signature=ab\r\nhello\r\n0;chunk-signature=cd\r\n\r\n";
        let version = h
            .service
            .put_object(
                &key("c.txt"),
                stream_of(encoded, 4),
                BodyEncoding::AwsChunked { decoded_length: 5 },
                DeclaredMetadata::default(),
                false,
                &Preconditions::default(),
            )
            .await
            .unwrap();
        assert_eq!(version.size, 5);
        assert_eq!(read(&h.service, "c.txt", None, None).await, b"hello");

        let err = h
            .service
            .put_object(
                &key("c.txt"),
                stream_of(b"zz\r\nhello\r\n0\r\n\r\n", 4),
                BodyEncoding::AwsChunked { decoded_length: 5 },
                DeclaredMetadata::default(),
                false,
                &Preconditions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Validation(_)));
    }

    #[tokio::test]
    async fn write_preconditions_are_checked_before_the_body() {
        let h = harness().await;
        let v1 = put(&h.service, "p.txt", b"one").await;

        let create_only = Preconditions {
            if_none_match: Some("*".into()),
            ..Default::default()
        };
        let err = h
            .service
            .put_object(
                &key("p.txt"),
                stream_of(b"two", 3),
                BodyEncoding::Plain,
                DeclaredMetadata::default(),
                false,
                &create_only,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::PreconditionFailed));

        let matching = Preconditions {
            if_match: Some(format!("\"{}\"", v1.etag)),
            ..Default::default()
        };
        h.service
            .put_object(
                &key("p.txt"),
                stream_of(b"two", 3),
                BodyEncoding::Plain,
                DeclaredMetadata::default(),
                false,
                &matching,
            )
            .await
            .unwrap();

        let not_modified = h
            .service
            .head_object(
                &key("p.txt"),
                Some(&v1.version_id),
                &Preconditions {
                    if_none_match: Some(v1.etag.clone()),
                    ..Default::default()
                },
            )
            .await;
        assert!(matches!(not_modified, Err(StorageError::NotModified)));
    }

    #[tokio::test]
    async fn copy_keeps_or_replaces_metadata() {
        let h = harness().await;
        let source = h
            .service
            .put_object(
                &key("src.bin"),
                stream_of(b"payload", 2),
                BodyEncoding::Plain,
                DeclaredMetadata {
                    content_type: Some("application/x-test".into()),
                    ..Default::default()
                },
                false,
                &Preconditions::default(),
            )
            .await
            .unwrap();

        let copied = h
            .service
            .copy_object(
                &key("src.bin"),
                Some(&source.version_id),
                &key("dst.bin"),
                MetadataDirective::Copy,
                DeclaredMetadata::default(),
                false,
                &Preconditions::default(),
            )
            .await
            .unwrap();
        assert_eq!(copied.content_type.as_deref(), Some("application/x-test"));
        assert_eq!(copied.etag, source.etag);
        assert_ne!(copied.storage_ref, source.storage_ref);
        assert_eq!(read(&h.service, "dst.bin", None, None).await, b"payload");

        let replaced = h
            .service
            .copy_object(
                &key("src.bin"),
                None,
                &key("dst.bin"),
                MetadataDirective::Replace,
                DeclaredMetadata {
                    content_type: Some("text/plain".into()),
                    ..Default::default()
                },
                false,
                &Preconditions::default(),
            )
            .await
            .unwrap();
        assert_eq!(replaced.content_type.as_deref(), Some("text/plain"));
    }

    #[tokio::test]
    async fn copy_checks_destination_preconditions_before_reading_source() {
        let h = harness().await;
        let source = put(&h.service, "src.bin", b"payload").await;
        put(&h.service, "dst.bin", b"existing").await;
        // a copy that got as far as reading the source would fail on the missing blob
        for segment in &source.storage_ref.segments {
            h.service.backend.delete(&segment.reference).await.unwrap();
        }

        let err = h
            .service
            .copy_object(
                &key("src.bin"),
                None,
                &key("dst.bin"),
                MetadataDirective::Copy,
                DeclaredMetadata::default(),
                false,
                &Preconditions {
                    if_match: Some("\"0123\"".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::PreconditionFailed));
        assert_eq!(read(&h.service, "dst.bin", None, None).await, b"existing");
    }

    #[tokio::test]
    async fn failed_commit_discards_the_new_blob() {
        let h = harness().await;
        let k = key("locked.txt");
        let until = h.clock.now() + Duration::days(10);
        h.service
            .set_versioning("t", "docs", VersioningState::Suspended)
            .await
            .unwrap();
        h.service
            .put_object(
                &k,
                stream_of(b"keep", 2),
                BodyEncoding::Plain,
                DeclaredMetadata {
                    retention: Some(Retention::new(RetentionMode::Compliance, until)),
                    ..Default::default()
                },
                false,
                &Preconditions::default(),
            )
            .await
            .unwrap();

        let err = h
            .service
            .put_object(
                &k,
                stream_of(b"overwrite", 2),
                BodyEncoding::Plain,
                DeclaredMetadata::default(),
                true,
                &Preconditions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::RetentionLocked(_)));
        assert_eq!(read(&h.service, "locked.txt", None, None).await, b"keep");
        assert_eq!(h.service.pending_reclaims().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn missing_bucket_fails_before_bytes_move() {
        let h = harness().await;
        let err = h
            .service
            .put_object(
                &ObjectKey::new("t", "nope", "a"),
                stream_of(b"x", 1),
                BodyEncoding::Plain,
                DeclaredMetadata::default(),
                false,
                &Preconditions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::BucketNotFound(_)));

        let err = h
            .service
            .list_versions("t", "nope", ListVersionsParams::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::BucketNotFound(_)));
    }

    #[tokio::test]
    async fn multipart_through_the_service() {
        let h = harness().await;
        let k = key("big.bin");
        let upload = h
            .service
            .initiate_upload(&k, DeclaredMetadata::default())
            .await
            .unwrap();
        let p1 = h
            .service
            .upload_part(&k, &upload.upload_id, 1, stream_of(b"abcd", 2), BodyEncoding::Plain)
            .await
            .unwrap();
        h.service
            .upload_part(
                &k,
                &upload.upload_id,
                2,
                stream_of(b"2\r\nef\r\n0\r\n\r\n", 3),
                BodyEncoding::AwsChunked { decoded_length: 2 },
            )
            .await
            .unwrap();

        let uploads = h.service.list_uploads("t", "docs", Some("big")).await.unwrap();
        assert_eq!(uploads.len(), 1);

        let version = h
            .service
            .complete_upload(
                &k,
                &upload.upload_id,
                vec![
                    CompletedPart {
                        part_number: 1,
                        etag: Some(format!("\"{}\"", p1.etag)),
                    },
                    CompletedPart {
                        part_number: 2,
                        etag: None,
                    },
                ],
                false,
                &Preconditions::default(),
            )
            .await
            .unwrap();
        assert_eq!(version.size, 6);
        assert!(version.etag.ends_with("-2"));
        assert_eq!(read(&h.service, "big.bin", None, Some("bytes=3-4")).await, b"de");
    }

    #[test]
    fn key_validation_rejects_traversal_and_control_bytes() {
        assert!(ensure_key_safe("photos/2025/img.jpg").is_ok());
        assert!(ensure_key_safe("").is_err());
        assert!(ensure_key_safe("/abs").is_err());
        assert!(ensure_key_safe("a/../b").is_err());
        assert!(ensure_key_safe("tab\there").is_err());
        assert!(ensure_key_safe(&"k".repeat(MAX_OBJECT_KEY_LEN + 1)).is_err());
    }
}
