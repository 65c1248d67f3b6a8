//! S3 XML request and response bodies.

use crate::errors::AppError;
use crate::models::{
    multipart::{MultipartUpload, PartRecord},
    object::{LedgerEntry, ObjectVersion},
    retention::{LegalHold, Retention, RetentionMode},
};
use axum::{
    body::Body,
    http::{HeaderValue, StatusCode, header},
    response::Response,
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

pub const S3_NAMESPACE: &str = "http://s3.amazonaws.com/doc/2006-03-01/";
const XML_DECLARATION: &str = r#"<?xml version="1.0" encoding="UTF-8"?>"#;

pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn quoted(etag: &str) -> String {
    format!("\"{}\"", etag)
}

/// Serialize `value` into a 200 `application/xml` response.
pub fn xml_response<T: Serialize>(value: &T) -> Result<Response, AppError> {
    let body = quick_xml::se::to_string(value)
        .map_err(|err| AppError::internal(format!("encoding XML response: {}", err)))?;
    let mut response = Response::new(Body::from(format!("{}{}", XML_DECLARATION, body)));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/xml"),
    );
    *response.status_mut() = StatusCode::OK;
    Ok(response)
}

pub fn parse_xml<T: DeserializeOwned>(body: &[u8]) -> Result<T, AppError> {
    let text = std::str::from_utf8(body)
        .map_err(|_| AppError::bad_request("request body is not valid UTF-8").with_code("MalformedXML"))?;
    quick_xml::de::from_str(text)
        .map_err(|err| AppError::bad_request(format!("invalid XML: {}", err)).with_code("MalformedXML"))
}

// ---- requests ----------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename = "CompleteMultipartUpload")]
pub struct CompleteMultipartUploadXml {
    #[serde(rename = "Part", default)]
    pub parts: Vec<CompletePartXml>,
}

#[derive(Debug, Deserialize)]
pub struct CompletePartXml {
    #[serde(rename = "PartNumber")]
    pub part_number: i64,
    #[serde(rename = "ETag", default)]
    pub etag: Option<String>,
}

/// `Retention` document, used in both directions. An empty document clears
/// the retention.
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename = "Retention")]
pub struct RetentionXml {
    #[serde(rename = "@xmlns", skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub xmlns: Option<&'static str>,
    #[serde(rename = "Mode", default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(rename = "RetainUntilDate", default, skip_serializing_if = "Option::is_none")]
    pub retain_until_date: Option<String>,
}

impl RetentionXml {
    pub fn from_retention(retention: Option<Retention>) -> Self {
        Self {
            xmlns: Some(S3_NAMESPACE),
            mode: retention.map(|r| r.mode.as_str().to_string()),
            retain_until_date: retention.map(|r| timestamp(r.retain_until)),
        }
    }

    pub fn into_retention(self) -> Result<Option<Retention>, AppError> {
        match (self.mode, self.retain_until_date) {
            (None, None) => Ok(None),
            (Some(mode), Some(until)) => {
                let mode = mode.parse::<RetentionMode>().map_err(AppError::bad_request)?;
                let retain_until = parse_timestamp(&until)?;
                Ok(Some(Retention::new(mode, retain_until)))
            }
            _ => Err(AppError::bad_request(
                "Retention requires both Mode and RetainUntilDate",
            )),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename = "LegalHold")]
pub struct LegalHoldXml {
    #[serde(rename = "@xmlns", skip_deserializing, skip_serializing_if = "Option::is_none")]
    pub xmlns: Option<&'static str>,
    #[serde(rename = "Status")]
    pub status: String,
}

impl LegalHoldXml {
    pub fn from_flag(on: bool) -> Self {
        Self {
            xmlns: Some(S3_NAMESPACE),
            status: LegalHold::from(on).as_str().to_string(),
        }
    }

    pub fn is_on(&self) -> Result<bool, AppError> {
        self.status
            .parse::<LegalHold>()
            .map(|hold| hold.is_on())
            .map_err(AppError::bad_request)
    }
}

pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, AppError> {
    DateTime::parse_from_rfc3339(value.trim())
        .map(|at| at.with_timezone(&Utc))
        .map_err(|err| AppError::bad_request(format!("invalid timestamp `{}`: {}", value, err)))
}

// ---- responses ---------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename = "CreateBucketResult")]
pub struct CreateBucketResult {
    #[serde(rename = "@xmlns")]
    pub xmlns: &'static str,
    #[serde(rename = "Location")]
    pub location: String,
}

impl CreateBucketResult {
    pub fn new(bucket: &str) -> Self {
        Self {
            xmlns: S3_NAMESPACE,
            location: format!("/{}", bucket),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename = "ListVersionsResult")]
pub struct ListVersionsResult {
    #[serde(rename = "@xmlns")]
    pub xmlns: &'static str,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Prefix")]
    pub prefix: String,
    #[serde(rename = "KeyMarker")]
    pub key_marker: String,
    #[serde(rename = "VersionIdMarker")]
    pub version_id_marker: String,
    #[serde(rename = "NextKeyMarker", skip_serializing_if = "Option::is_none")]
    pub next_key_marker: Option<String>,
    #[serde(rename = "NextVersionIdMarker", skip_serializing_if = "Option::is_none")]
    pub next_version_id_marker: Option<String>,
    #[serde(rename = "MaxKeys")]
    pub max_keys: usize,
    #[serde(rename = "IsTruncated")]
    pub is_truncated: bool,
    /// Versions and markers interleaved in ledger order.
    #[serde(rename = "$value")]
    pub entries: Vec<VersionEntryXml>,
}

#[derive(Debug, Serialize)]
pub enum VersionEntryXml {
    Version(VersionXml),
    DeleteMarker(DeleteMarkerXml),
}

#[derive(Debug, Serialize)]
pub struct VersionXml {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "VersionId")]
    pub version_id: String,
    #[serde(rename = "IsLatest")]
    pub is_latest: bool,
    #[serde(rename = "LastModified")]
    pub last_modified: String,
    #[serde(rename = "ETag")]
    pub etag: String,
    #[serde(rename = "Size")]
    pub size: i64,
    #[serde(rename = "StorageClass")]
    pub storage_class: &'static str,
}

#[derive(Debug, Serialize)]
pub struct DeleteMarkerXml {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "VersionId")]
    pub version_id: String,
    #[serde(rename = "IsLatest")]
    pub is_latest: bool,
    #[serde(rename = "LastModified")]
    pub last_modified: String,
}

impl From<&LedgerEntry> for VersionEntryXml {
    fn from(entry: &LedgerEntry) -> Self {
        match entry {
            LedgerEntry::Version(v) => VersionEntryXml::Version(VersionXml {
                key: v.key.key.clone(),
                version_id: v.version_id.clone(),
                is_latest: v.is_latest,
                last_modified: timestamp(v.created_at),
                etag: quoted(&v.etag),
                size: v.size,
                storage_class: "STANDARD",
            }),
            LedgerEntry::DeleteMarker(m) => VersionEntryXml::DeleteMarker(DeleteMarkerXml {
                key: m.key.key.clone(),
                version_id: m.version_id.clone(),
                is_latest: m.is_latest,
                last_modified: timestamp(m.created_at),
            }),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename = "InitiateMultipartUploadResult")]
pub struct InitiateMultipartUploadResult {
    #[serde(rename = "@xmlns")]
    pub xmlns: &'static str,
    #[serde(rename = "Bucket")]
    pub bucket: String,
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "UploadId")]
    pub upload_id: String,
}

impl From<&MultipartUpload> for InitiateMultipartUploadResult {
    fn from(upload: &MultipartUpload) -> Self {
        Self {
            xmlns: S3_NAMESPACE,
            bucket: upload.key.bucket.clone(),
            key: upload.key.key.clone(),
            upload_id: upload.upload_id.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename = "CompleteMultipartUploadResult")]
pub struct CompleteMultipartUploadResult {
    #[serde(rename = "@xmlns")]
    pub xmlns: &'static str,
    #[serde(rename = "Location")]
    pub location: String,
    #[serde(rename = "Bucket")]
    pub bucket: String,
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "ETag")]
    pub etag: String,
}

impl From<&ObjectVersion> for CompleteMultipartUploadResult {
    fn from(version: &ObjectVersion) -> Self {
        Self {
            xmlns: S3_NAMESPACE,
            location: format!("/{}/{}", version.key.bucket, version.key.key),
            bucket: version.key.bucket.clone(),
            key: version.key.key.clone(),
            etag: quoted(&version.etag),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename = "CopyObjectResult")]
pub struct CopyObjectResult {
    #[serde(rename = "@xmlns")]
    pub xmlns: &'static str,
    #[serde(rename = "LastModified")]
    pub last_modified: String,
    #[serde(rename = "ETag")]
    pub etag: String,
}

impl CopyObjectResult {
    pub fn new(etag: &str, at: DateTime<Utc>) -> Self {
        Self {
            xmlns: S3_NAMESPACE,
            last_modified: timestamp(at),
            etag: quoted(etag),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename = "CopyPartResult")]
pub struct CopyPartResult {
    #[serde(rename = "@xmlns")]
    pub xmlns: &'static str,
    #[serde(rename = "LastModified")]
    pub last_modified: String,
    #[serde(rename = "ETag")]
    pub etag: String,
}

impl From<&PartRecord> for CopyPartResult {
    fn from(part: &PartRecord) -> Self {
        Self {
            xmlns: S3_NAMESPACE,
            last_modified: timestamp(part.uploaded_at),
            etag: quoted(&part.etag),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename = "ListPartsResult")]
pub struct ListPartsResult {
    #[serde(rename = "@xmlns")]
    pub xmlns: &'static str,
    #[serde(rename = "Bucket")]
    pub bucket: String,
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "UploadId")]
    pub upload_id: String,
    #[serde(rename = "PartNumberMarker")]
    pub part_number_marker: i64,
    #[serde(rename = "NextPartNumberMarker", skip_serializing_if = "Option::is_none")]
    pub next_part_number_marker: Option<i64>,
    #[serde(rename = "MaxParts")]
    pub max_parts: usize,
    #[serde(rename = "IsTruncated")]
    pub is_truncated: bool,
    #[serde(rename = "Part")]
    pub parts: Vec<PartXml>,
}

#[derive(Debug, Serialize)]
pub struct PartXml {
    #[serde(rename = "PartNumber")]
    pub part_number: i64,
    #[serde(rename = "LastModified")]
    pub last_modified: String,
    #[serde(rename = "ETag")]
    pub etag: String,
    #[serde(rename = "Size")]
    pub size: i64,
}

impl From<&PartRecord> for PartXml {
    fn from(part: &PartRecord) -> Self {
        Self {
            part_number: part.part_number,
            last_modified: timestamp(part.uploaded_at),
            etag: quoted(&part.etag),
            size: part.size,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename = "ListMultipartUploadsResult")]
pub struct ListMultipartUploadsResult {
    #[serde(rename = "@xmlns")]
    pub xmlns: &'static str,
    #[serde(rename = "Bucket")]
    pub bucket: String,
    #[serde(rename = "Prefix")]
    pub prefix: String,
    #[serde(rename = "Upload")]
    pub uploads: Vec<UploadXml>,
}

#[derive(Debug, Serialize)]
pub struct UploadXml {
    #[serde(rename = "Key")]
    pub key: String,
    #[serde(rename = "UploadId")]
    pub upload_id: String,
    #[serde(rename = "Initiated")]
    pub initiated: String,
}

impl From<&MultipartUpload> for UploadXml {
    fn from(upload: &MultipartUpload) -> Self {
        Self {
            key: upload.key.key.clone(),
            upload_id: upload.upload_id.clone(),
            initiated: timestamp(upload.initiated_at),
        }
    }
}
