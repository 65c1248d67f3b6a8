//! Bucket configuration store.
//!
//! The core reads versioning state, default retention and lifecycle rules
//! through [`BucketConfigStore`]. [`SqliteBucketStore`] implements it over
//! the shared metadata database and also carries the admin operations
//! (create, delete, configure) the HTTP layer exposes.

use crate::errors::{StorageError, StorageResult};
use crate::models::{
    bucket::{Bucket, BucketRef, LifecycleRule, VersioningState},
    retention::DefaultRetention,
};
use crate::services::transaction::{Tx, TxExecutor, is_unique_violation};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use uuid::Uuid;

const BUCKET_NAME_MIN_LEN: usize = 3;
const BUCKET_NAME_MAX_LEN: usize = 63;
const SUPPORTED_REGIONS: [&str; 16] = [
    "local",
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "eu-west-1",
    "ap-southeast-1",
    "ap-northeast-1",
    "ap-south-1",
    "ap-south-2",
    "ap-southeast-2",
    "ap-southeast-3",
    "ap-southeast-4",
    "ap-northeast-2",
    "ap-northeast-3",
    "me-south-1",
];

const BUCKET_SELECT: &str = "SELECT id, tenant_id, name, owner_id, region, created_at, versioning,
            default_retention_mode, default_retention_days, lifecycle_rules
     FROM buckets WHERE tenant_id = ? AND name = ?";

/// Read a bucket row inside `tx`. Writes that depend on bucket configuration
/// decide against this read, so a concurrent delete or versioning change
/// either commits first and is seen, or conflicts and is retried.
pub async fn bucket_in_tx(tx: &mut Tx, tenant_id: &str, bucket: &str) -> StorageResult<Bucket> {
    sqlx::query_as::<_, Bucket>(BUCKET_SELECT)
        .bind(tenant_id)
        .bind(bucket)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| StorageError::BucketNotFound(bucket.to_string()))
}

/// Configuration the metadata core consumes from the bucket layer.
#[async_trait]
pub trait BucketConfigStore: Send + Sync + 'static {
    /// Fails with `BucketNotFound` when the bucket does not exist.
    async fn versioning_state(&self, tenant_id: &str, bucket: &str)
    -> StorageResult<VersioningState>;

    async fn default_retention(
        &self,
        tenant_id: &str,
        bucket: &str,
    ) -> StorageResult<Option<DefaultRetention>>;

    async fn lifecycle_rules(&self, tenant_id: &str, bucket: &str)
    -> StorageResult<Vec<LifecycleRule>>;

    /// Buckets that have at least one lifecycle rule attached.
    async fn lifecycle_buckets(&self) -> StorageResult<Vec<BucketRef>>;
}

#[derive(Clone)]
pub struct SqliteBucketStore {
    executor: TxExecutor,
}

impl SqliteBucketStore {
    pub fn new(executor: TxExecutor) -> Self {
        Self { executor }
    }

    /// Fetch bucket metadata from SQLite.
    ///
    /// Returns BucketNotFound if missing.
    /// Validates bucket name before querying.
    pub async fn fetch_bucket(&self, tenant_id: &str, bucket: &str) -> StorageResult<Bucket> {
        validate_bucket_name(bucket)?;
        sqlx::query_as::<_, Bucket>(BUCKET_SELECT)
        .bind(tenant_id)
        .bind(bucket)
        .fetch_one(self.executor.pool())
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => StorageError::BucketNotFound(bucket.to_string()),
            other => StorageError::Sqlx(other),
        })
    }

    /// Create a bucket.
    ///
    /// Validates name and region. Inserts metadata row.
    /// Returns BucketAlreadyExists if name conflict occurs.
    pub async fn create_bucket(
        &self,
        tenant_id: &str,
        name: &str,
        region: &str,
    ) -> StorageResult<Bucket> {
        validate_bucket_name(name)?;
        let normalized_region = region.to_lowercase();
        validate_region(&normalized_region)?;

        let bucket = Bucket {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            name: name.to_string(),
            owner_id: Uuid::new_v4(),
            region: normalized_region,
            created_at: Utc::now(),
            versioning: VersioningState::Unset.as_str().to_string(),
            default_retention_mode: None,
            default_retention_days: None,
            lifecycle_rules: None,
        };

        let row = bucket.clone();
        self.executor
            .run("create_bucket", |tx| {
                let row = row.clone();
                Box::pin(async move {
                    let inserted = sqlx::query(
                        "INSERT INTO buckets (id, tenant_id, name, owner_id, region, created_at, versioning)
                         VALUES (?, ?, ?, ?, ?, ?, ?)",
                    )
                    .bind(row.id)
                    .bind(&row.tenant_id)
                    .bind(&row.name)
                    .bind(row.owner_id)
                    .bind(&row.region)
                    .bind(row.created_at)
                    .bind(&row.versioning)
                    .execute(&mut **tx)
                    .await;
                    match inserted {
                        Ok(_) => Ok(()),
                        Err(err) if is_unique_violation(&err) => {
                            Err(StorageError::BucketAlreadyExists(row.name.clone()))
                        }
                        Err(err) => Err(StorageError::Sqlx(err)),
                    }
                })
            })
            .await?;

        tracing::info!(tenant = %tenant_id, bucket = %name, "bucket created");
        Ok(bucket)
    }

    /// Delete a bucket that holds no versions, markers or uploads.
    pub async fn delete_bucket(&self, tenant_id: &str, name: &str) -> StorageResult<()> {
        validate_bucket_name(name)?;
        let (tenant_id, name) = (tenant_id.to_string(), name.to_string());
        self.executor
            .run("delete_bucket", |tx| {
                let (tenant_id, name) = (tenant_id.clone(), name.clone());
                Box::pin(async move {
                    let in_use: i64 = sqlx::query_scalar(
                        "SELECT (SELECT COUNT(*) FROM object_versions WHERE tenant_id = ?1 AND bucket = ?2)
                              + (SELECT COUNT(*) FROM multipart_uploads WHERE tenant_id = ?1 AND bucket = ?2)",
                    )
                    .bind(&tenant_id)
                    .bind(&name)
                    .fetch_one(&mut **tx)
                    .await?;
                    if in_use > 0 {
                        return Err(StorageError::BucketNotEmpty(name.clone()));
                    }

                    let result = sqlx::query("DELETE FROM buckets WHERE tenant_id = ? AND name = ?")
                        .bind(&tenant_id)
                        .bind(&name)
                        .execute(&mut **tx)
                        .await?;
                    if result.rows_affected() == 0 {
                        return Err(StorageError::BucketNotFound(name.clone()));
                    }

                    sqlx::query("DELETE FROM key_sequences WHERE tenant_id = ? AND bucket = ?")
                        .bind(&tenant_id)
                        .bind(&name)
                        .execute(&mut **tx)
                        .await?;
                    Ok(())
                })
            })
            .await?;

        tracing::info!(tenant = %tenant_id, bucket = %name, "bucket deleted");
        Ok(())
    }

    /// Turn versioning on or pause it. A bucket can never go back to `Unset`.
    pub async fn set_versioning(
        &self,
        tenant_id: &str,
        name: &str,
        state: VersioningState,
    ) -> StorageResult<()> {
        if state == VersioningState::Unset {
            return Err(StorageError::Validation(
                "versioning can only be set to Enabled or Suspended".into(),
            ));
        }
        self.update_column(tenant_id, name, "set_versioning", "versioning", Some(state.as_str().to_string()))
            .await
    }

    pub async fn set_default_retention(
        &self,
        tenant_id: &str,
        name: &str,
        retention: Option<DefaultRetention>,
    ) -> StorageResult<()> {
        if let Some(r) = &retention {
            if r.days == 0 {
                return Err(StorageError::Validation(
                    "default retention must be at least one day".into(),
                ));
            }
        }
        validate_bucket_name(name)?;
        let (tenant_id, name) = (tenant_id.to_string(), name.to_string());
        self.executor
            .run("set_default_retention", |tx| {
                let (tenant_id, name) = (tenant_id.clone(), name.clone());
                Box::pin(async move {
                    let result = sqlx::query(
                        "UPDATE buckets SET default_retention_mode = ?, default_retention_days = ?
                         WHERE tenant_id = ? AND name = ?",
                    )
                    .bind(retention.map(|r| r.mode.as_str()))
                    .bind(retention.map(|r| i64::from(r.days)))
                    .bind(&tenant_id)
                    .bind(&name)
                    .execute(&mut **tx)
                    .await?;
                    if result.rows_affected() == 0 {
                        return Err(StorageError::BucketNotFound(name.clone()));
                    }
                    Ok(())
                })
            })
            .await
    }

    /// Replace the lifecycle rules of a bucket. An empty list detaches them.
    pub async fn set_lifecycle_rules(
        &self,
        tenant_id: &str,
        name: &str,
        rules: Vec<LifecycleRule>,
    ) -> StorageResult<()> {
        let mut ids = HashSet::new();
        for rule in &rules {
            if rule.id.trim().is_empty() {
                return Err(StorageError::Validation("lifecycle rule id is required".into()));
            }
            if !ids.insert(rule.id.as_str()) {
                return Err(StorageError::Validation(format!(
                    "duplicate lifecycle rule id `{}`",
                    rule.id
                )));
            }
            let has_action = rule.noncurrent_days.is_some()
                || rule.expired_delete_marker_days.is_some()
                || rule.abort_incomplete_multipart_days.is_some();
            if !has_action {
                return Err(StorageError::Validation(format!(
                    "lifecycle rule `{}` has no action",
                    rule.id
                )));
            }
        }
        let encoded = if rules.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&rules).map_err(|err| {
                StorageError::Internal(format!("encoding lifecycle rules: {}", err))
            })?)
        };
        self.update_column(tenant_id, name, "set_lifecycle_rules", "lifecycle_rules", encoded)
            .await
    }

    async fn update_column(
        &self,
        tenant_id: &str,
        name: &str,
        operation: &'static str,
        column: &'static str,
        value: Option<String>,
    ) -> StorageResult<()> {
        validate_bucket_name(name)?;
        let (tenant_id, name) = (tenant_id.to_string(), name.to_string());
        let sql = format!(
            "UPDATE buckets SET {} = ? WHERE tenant_id = ? AND name = ?",
            column
        );
        self.executor
            .run(operation, |tx| {
                let (tenant_id, name, value, sql) =
                    (tenant_id.clone(), name.clone(), value.clone(), sql.clone());
                Box::pin(async move {
                    let result = sqlx::query(&sql)
                        .bind(value)
                        .bind(&tenant_id)
                        .bind(&name)
                        .execute(&mut **tx)
                        .await?;
                    if result.rows_affected() == 0 {
                        return Err(StorageError::BucketNotFound(name.clone()));
                    }
                    Ok(())
                })
            })
            .await
    }
}

#[async_trait]
impl BucketConfigStore for SqliteBucketStore {
    async fn versioning_state(
        &self,
        tenant_id: &str,
        bucket: &str,
    ) -> StorageResult<VersioningState> {
        Ok(self.fetch_bucket(tenant_id, bucket).await?.versioning_state())
    }

    async fn default_retention(
        &self,
        tenant_id: &str,
        bucket: &str,
    ) -> StorageResult<Option<DefaultRetention>> {
        Ok(self.fetch_bucket(tenant_id, bucket).await?.default_retention())
    }

    async fn lifecycle_rules(
        &self,
        tenant_id: &str,
        bucket: &str,
    ) -> StorageResult<Vec<LifecycleRule>> {
        let bucket = self.fetch_bucket(tenant_id, bucket).await?;
        match bucket.lifecycle_rules.as_deref() {
            None => Ok(Vec::new()),
            Some(raw) => serde_json::from_str(raw).map_err(|err| {
                StorageError::Internal(format!("decoding lifecycle rules: {}", err))
            }),
        }
    }

    async fn lifecycle_buckets(&self) -> StorageResult<Vec<BucketRef>> {
        let rows = sqlx::query_as::<_, BucketRef>(
            "SELECT tenant_id, name FROM buckets
             WHERE lifecycle_rules IS NOT NULL ORDER BY tenant_id, name",
        )
        .fetch_all(self.executor.pool())
        .await?;
        Ok(rows)
    }
}

/// Validate bucket name format.
///
/// Enforces S3-like naming rules:
/// - 3–63 characters
/// - lowercase letters, digits, dots, hyphens only
/// - cannot start/end with dot or hyphen
/// - cannot contain consecutive dots or dot-hyphen patterns
/// - cannot look like an IPv4 address
pub fn validate_bucket_name(name: &str) -> StorageResult<()> {
    let invalid = |reason: &str| StorageError::InvalidBucketName {
        name: name.to_string(),
        reason: reason.to_string(),
    };

    if name.trim() != name {
        return Err(invalid("cannot begin or end with whitespace"));
    }
    let len = name.len();
    if !(BUCKET_NAME_MIN_LEN..=BUCKET_NAME_MAX_LEN).contains(&len) {
        return Err(invalid("must be between 3 and 63 characters"));
    }
    if !name
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '.' | '-'))
    {
        return Err(invalid(
            "allowed characters are lowercase letters, digits, dots, and hyphens",
        ));
    }
    if name.starts_with('.') || name.ends_with('.') || name.starts_with('-') || name.ends_with('-')
    {
        return Err(invalid("must start and end with a lowercase letter or digit"));
    }
    if name.contains("..") || name.contains("-.") || name.contains(".-") {
        return Err(invalid(
            "cannot contain consecutive dots or dot-hyphen combinations",
        ));
    }
    if is_ipv4_like(name) {
        return Err(invalid("must not be formatted like an IP address"));
    }
    Ok(())
}

/// Validate region string against SUPPORTED_REGIONS (case-insensitive).
pub fn validate_region(region: &str) -> StorageResult<()> {
    if SUPPORTED_REGIONS
        .iter()
        .any(|candidate| candidate.eq_ignore_ascii_case(region))
    {
        Ok(())
    } else {
        Err(StorageError::UnsupportedRegion(region.to_string()))
    }
}

/// Check if a string matches IPv4-like dotted decimal form.
fn is_ipv4_like(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    parts.len() == 4
        && parts.iter().all(|segment| {
            !segment.is_empty()
                && segment.len() <= 3
                && segment.chars().all(|c| c.is_ascii_digit())
                && segment.parse::<u8>().is_ok()
        })
}
