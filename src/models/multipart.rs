//! Multipart upload sessions and their parts.

use crate::errors::{StorageError, StorageResult};
use crate::models::{
    from_millis,
    object::{ObjectKey, StorageRef},
    retention::{Retention, RetentionMode},
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use std::collections::HashMap;

pub const MIN_PART_NUMBER: i64 = 1;
pub const MAX_PART_NUMBER: i64 = 10_000;

/// Reject part numbers outside `1..=10000`.
pub fn validate_part_number(part_number: i64) -> StorageResult<()> {
    if (MIN_PART_NUMBER..=MAX_PART_NUMBER).contains(&part_number) {
        Ok(())
    } else {
        Err(StorageError::Validation(format!(
            "part number must be between {} and {} (got {})",
            MIN_PART_NUMBER, MAX_PART_NUMBER, part_number
        )))
    }
}

/// Metadata declared at initiation and carried onto the completed version.
#[derive(Serialize, Clone, Debug, Default, PartialEq)]
pub struct DeclaredMetadata {
    pub content_type: Option<String>,
    pub user_metadata: HashMap<String, String>,
    pub retention: Option<Retention>,
    pub legal_hold: bool,
}

/// Where an upload sits in its lifecycle. Completed and aborted uploads are
/// removed from the store, so only the live states are observable.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadState {
    Initiated,
    Uploading,
}

/// A multipart upload session.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct MultipartUpload {
    pub upload_id: String,
    pub key: ObjectKey,
    pub initiated_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
    pub declared: DeclaredMetadata,
    pub state: UploadState,
}

/// A stored part of an upload.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct PartRecord {
    pub upload_id: String,
    pub part_number: i64,
    pub size: i64,
    /// MD5 of the part content, hex, unquoted.
    pub etag: String,
    pub storage_reference: String,
    pub uploaded_at: DateTime<Utc>,
}

/// One entry of the client's CompleteMultipartUpload part list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompletedPart {
    pub part_number: i64,
    /// Optional ETag the client saw when uploading; verified when present.
    pub etag: Option<String>,
}

#[derive(Debug)]
pub struct ListPartsPage {
    pub parts: Vec<PartRecord>,
    pub is_truncated: bool,
    pub next_part_number_marker: Option<i64>,
}

/// Raw `multipart_uploads` row joined with its part count.
#[derive(FromRow, Debug)]
pub struct UploadRow {
    pub upload_id: String,
    pub tenant_id: String,
    pub bucket: String,
    pub key: String,
    pub initiated_at: i64,
    pub last_activity_at: i64,
    pub content_type: Option<String>,
    pub user_metadata: String,
    pub retention_mode: Option<String>,
    pub retain_until: Option<i64>,
    pub legal_hold: bool,
    pub part_count: i64,
}

impl TryFrom<UploadRow> for MultipartUpload {
    type Error = StorageError;

    fn try_from(row: UploadRow) -> Result<Self, Self::Error> {
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

        Ok(MultipartUpload {
            upload_id: row.upload_id,
            key: ObjectKey::new(row.tenant_id, row.bucket, row.key),
            initiated_at: from_millis(row.initiated_at),
            last_activity_at: from_millis(row.last_activity_at),
            declared: DeclaredMetadata {
                content_type: row.content_type,
                user_metadata,
                retention,
                legal_hold: row.legal_hold,
            },
            state: if row.part_count > 0 {
                UploadState::Uploading
            } else {
                UploadState::Initiated
            },
        })
    }
}

/// Raw `multipart_parts` row.
#[derive(FromRow, Debug, Clone)]
pub struct PartRow {
    pub upload_id: String,
    pub part_number: i64,
    pub size: i64,
    pub etag: String,
    pub storage_ref: String,
    pub uploaded_at: i64,
}

impl From<PartRow> for PartRecord {
    fn from(row: PartRow) -> Self {
        PartRecord {
            upload_id: row.upload_id,
            part_number: row.part_number,
            size: row.size,
            etag: row.etag,
            storage_reference: row.storage_ref,
            uploaded_at: from_millis(row.uploaded_at),
        }
    }
}

impl PartRecord {
    pub fn storage_ref(&self) -> StorageRef {
        StorageRef::single(self.storage_reference.clone(), self.size)
    }
}
