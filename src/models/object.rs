//! Ledger entries: immutable object versions and delete markers.

use crate::errors::{StorageError, StorageResult};
use crate::models::{
    from_millis,
    retention::{Retention, RetentionMode},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::{collections::HashMap, fmt};

/// Version id used for every write while versioning is not enabled.
pub const NULL_VERSION_ID: &str = "null";

/// Addressing tuple for every ledger entry.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub tenant_id: String,
    pub bucket: String,
    pub key: String,
}

impl ObjectKey {
    pub fn new(
        tenant_id: impl Into<String>,
        bucket: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.tenant_id, self.bucket, self.key)
    }
}

/// One contiguous blob in the byte backend.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    pub reference: String,
    pub size: i64,
}

/// Opaque pointer to the content of a version.
///
/// A plain upload has a single segment. A completed multipart upload keeps
/// one segment per part, in part order, so completion never copies bytes.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct StorageRef {
    pub segments: Vec<Segment>,
}

impl StorageRef {
    pub fn single(reference: impl Into<String>, size: i64) -> Self {
        Self {
            segments: vec![Segment {
                reference: reference.into(),
                size,
            }],
        }
    }

    pub fn total_size(&self) -> i64 {
        self.segments.iter().map(|s| s.size).sum()
    }

    pub fn references(&self) -> impl Iterator<Item = &str> {
        self.segments.iter().map(|s| s.reference.as_str())
    }

    pub fn to_json(&self) -> StorageResult<String> {
        serde_json::to_string(self)
            .map_err(|err| StorageError::Internal(format!("encoding storage ref: {}", err)))
    }

    pub fn from_json(raw: &str) -> StorageResult<Self> {
        serde_json::from_str(raw)
            .map_err(|err| StorageError::Internal(format!("decoding storage ref: {}", err)))
    }
}

/// One immutable write of an object.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct ObjectVersion {
    pub key: ObjectKey,
    pub version_id: String,
    /// Per-key commit sequence; the authoritative ordering of the ledger.
    pub seq: i64,
    pub size: i64,
    /// ETag-equivalent checksum, unquoted.
    pub etag: String,
    pub content_type: Option<String>,
    pub user_metadata: HashMap<String, String>,
    pub storage_ref: StorageRef,
    pub created_at: DateTime<Utc>,
    pub retention: Option<Retention>,
    pub legal_hold: bool,
    /// Derived from ledger order at read time, never stored.
    pub is_latest: bool,
}

/// Tombstone entry. Signals "object absent" when it is the newest entry.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct DeleteMarker {
    pub key: ObjectKey,
    pub version_id: String,
    pub seq: i64,
    pub created_at: DateTime<Utc>,
    pub is_latest: bool,
}

/// A single position in the per-key history.
#[derive(Serialize, Clone, Debug, PartialEq)]
#[serde(tag = "type")]
pub enum LedgerEntry {
    Version(ObjectVersion),
    DeleteMarker(DeleteMarker),
}

impl LedgerEntry {
    pub fn key(&self) -> &ObjectKey {
        match self {
            LedgerEntry::Version(v) => &v.key,
            LedgerEntry::DeleteMarker(m) => &m.key,
        }
    }

    pub fn version_id(&self) -> &str {
        match self {
            LedgerEntry::Version(v) => &v.version_id,
            LedgerEntry::DeleteMarker(m) => &m.version_id,
        }
    }

    pub fn seq(&self) -> i64 {
        match self {
            LedgerEntry::Version(v) => v.seq,
            LedgerEntry::DeleteMarker(m) => m.seq,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            LedgerEntry::Version(v) => v.created_at,
            LedgerEntry::DeleteMarker(m) => m.created_at,
        }
    }

    pub fn is_latest(&self) -> bool {
        match self {
            LedgerEntry::Version(v) => v.is_latest,
            LedgerEntry::DeleteMarker(m) => m.is_latest,
        }
    }

    pub fn is_delete_marker(&self) -> bool {
        matches!(self, LedgerEntry::DeleteMarker(_))
    }

    pub fn as_version(&self) -> Option<&ObjectVersion> {
        match self {
            LedgerEntry::Version(v) => Some(v),
            LedgerEntry::DeleteMarker(_) => None,
        }
    }
}

/// Caller-supplied description of a version about to be written.
#[derive(Clone, Debug, Default)]
pub struct VersionDraft {
    pub size: i64,
    pub etag: String,
    pub content_type: Option<String>,
    pub user_metadata: HashMap<String, String>,
    pub storage_ref: StorageRef,
    /// Explicit retention; when absent the bucket default is stamped.
    pub retention: Option<Retention>,
    pub legal_hold: bool,
}

impl VersionDraft {
    pub fn validate(&self) -> StorageResult<()> {
        if self.size < 0 {
            return Err(StorageError::Validation(format!(
                "object size must not be negative (got {})",
                self.size
            )));
        }
        if self.etag.trim().is_empty() {
            return Err(StorageError::Validation(
                "content checksum is required".into(),
            ));
        }
        if self.storage_ref.total_size() != self.size {
            return Err(StorageError::Validation(format!(
                "declared size {} does not match stored content size {}",
                self.size,
                self.storage_ref.total_size()
            )));
        }
        Ok(())
    }
}

/// Raw `object_versions` row. Converted into a [`LedgerEntry`] at the edge.
#[derive(FromRow, Debug)]
pub struct VersionRow {
    pub tenant_id: String,
    pub bucket: String,
    pub key: String,
    pub version_id: String,
    pub seq: i64,
    pub is_delete_marker: bool,
    pub size: i64,
    pub etag: Option<String>,
    pub content_type: Option<String>,
    pub user_metadata: String,
    pub storage_ref: String,
    pub created_at: i64,
    pub retention_mode: Option<String>,
    pub retain_until: Option<i64>,
    pub legal_hold: bool,
    pub is_latest: bool,
}

impl TryFrom<VersionRow> for LedgerEntry {
    type Error = StorageError;

    fn try_from(row: VersionRow) -> Result<Self, Self::Error> {
        let key = ObjectKey::new(row.tenant_id, row.bucket, row.key);
        let created_at = from_millis(row.created_at);

        if row.is_delete_marker {
            return Ok(LedgerEntry::DeleteMarker(DeleteMarker {
                key,
                version_id: row.version_id,
                seq: row.seq,
                created_at,
                is_latest: row.is_latest,
            }));
        }

        let retention = match (row.retention_mode, row.retain_until) {
            (Some(mode), Some(until)) => Some(Retention {
                mode: mode
                    .parse::<RetentionMode>()
                    .map_err(StorageError::Internal)?,
                retain_until: from_millis(until),
            }),
            _ => None,
        };
        let user_metadata = serde_json::from_str(&row.user_metadata)
            .map_err(|err| StorageError::Internal(format!("decoding user metadata: {}", err)))?;

        Ok(LedgerEntry::Version(ObjectVersion {
            key,
            version_id: row.version_id,
            seq: row.seq,
            size: row.size,
            etag: row.etag.unwrap_or_default(),
            content_type: row.content_type,
            user_metadata,
            storage_ref: StorageRef::from_json(&row.storage_ref)?,
            created_at,
            retention,
            legal_hold: row.legal_hold,
            is_latest: row.is_latest,
        }))
    }
}
