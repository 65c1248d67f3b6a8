//! HTTP handlers for object operations.
//! Streams object bodies to avoid buffering in memory and delegates storage
//! concerns to `StorageService`. One handler per method; the S3 subresource
//! in the query string (`uploads`, `uploadId`, `retention`, `legal-hold`)
//! picks the operation.

use crate::{
    errors::AppError,
    handlers::xml::{
        CompleteMultipartUploadResult, CompleteMultipartUploadXml, CopyObjectResult,
        CopyPartResult, InitiateMultipartUploadResult, LegalHoldXml, ListPartsResult, PartXml,
        RetentionXml, S3_NAMESPACE, parse_timestamp, parse_xml, quoted, xml_response,
    },
    models::{
        multipart::{CompletedPart, DeclaredMetadata},
        object::{NULL_VERSION_ID, ObjectKey, ObjectVersion},
        retention::{LegalHold, Retention, RetentionMode},
    },
    services::{
        backend::{ByteRange, ByteStream},
        conditions::Preconditions,
        storage_service::{BodyEncoding, MetadataDirective, StorageService},
    },
};
use axum::{
    body::{Body, Bytes},
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use std::{collections::HashMap, io};

pub(crate) const TENANT_HEADER: &str = "x-amz-tenant-id";
const BYPASS_HEADER: &str = "x-amz-bypass-governance-retention";
const COPY_SOURCE_HEADER: &str = "x-amz-copy-source";
const COPY_SOURCE_RANGE_HEADER: &str = "x-amz-copy-source-range";
const VERSION_ID_HEADER: &str = "x-amz-version-id";
const DELETE_MARKER_HEADER: &str = "x-amz-delete-marker";
const USER_METADATA_PREFIX: &str = "x-amz-meta-";
const LOCK_MODE_HEADER: &str = "x-amz-object-lock-mode";
const LOCK_UNTIL_HEADER: &str = "x-amz-object-lock-retain-until-date";
const LEGAL_HOLD_HEADER: &str = "x-amz-object-lock-legal-hold";

/// Upper bound for XML and JSON request documents.
pub(crate) const MAX_DOCUMENT_BYTES: usize = 1024 * 1024;

/// Subresources and parameters accepted on `/{bucket}/{*key}`.
#[derive(Debug, Default, Deserialize)]
pub struct ObjectQuery {
    #[serde(rename = "versionId")]
    pub version_id: Option<String>,
    #[serde(rename = "uploadId")]
    pub upload_id: Option<String>,
    #[serde(rename = "partNumber")]
    pub part_number: Option<i64>,
    pub uploads: Option<String>,
    pub retention: Option<String>,
    #[serde(rename = "legal-hold")]
    pub legal_hold: Option<String>,
    #[serde(rename = "part-number-marker")]
    pub part_number_marker: Option<i64>,
    #[serde(rename = "max-parts")]
    pub max_parts: Option<usize>,
}

/// `PUT /{bucket}/{*key}`: PutObject, CopyObject, UploadPart, UploadPartCopy,
/// PutObjectRetention or PutObjectLegalHold.
pub async fn put_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<ObjectQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let tenant = tenant_id(&headers, &service);
    let object = service.object_key(&tenant, &bucket, &key)?;
    let bypass = bypass_governance(&headers);

    if q.retention.is_some() {
        let doc: RetentionXml = parse_xml(&read_document(body).await?)?;
        let version = service
            .put_retention(&object, q.version_id.as_deref(), doc.into_retention()?, bypass)
            .await?;
        return Ok(with_version_id(StatusCode::OK.into_response(), &version.version_id));
    }
    if q.legal_hold.is_some() {
        let doc: LegalHoldXml = parse_xml(&read_document(body).await?)?;
        let version = service
            .put_legal_hold(&object, q.version_id.as_deref(), doc.is_on()?)
            .await?;
        return Ok(with_version_id(StatusCode::OK.into_response(), &version.version_id));
    }

    match (q.part_number, q.upload_id.as_deref()) {
        (Some(part_number), Some(upload_id)) => {
            if let Some((source, source_version)) = copy_source(&service, &tenant, &headers)? {
                let part = service
                    .copy_part(
                        &object,
                        upload_id,
                        part_number,
                        &source,
                        source_version.as_deref(),
                        header_str(&headers, COPY_SOURCE_RANGE_HEADER),
                    )
                    .await?;
                return xml_response(&CopyPartResult::from(&part));
            }
            let part = service
                .upload_part(
                    &object,
                    upload_id,
                    part_number,
                    body_stream(body),
                    body_encoding(&headers)?,
                )
                .await?;
            let mut response = StatusCode::OK.into_response();
            insert_header(response.headers_mut(), header::ETAG, &quoted(&part.etag));
            return Ok(response);
        }
        (None, None) => {}
        _ => {
            return Err(AppError::bad_request(
                "partNumber and uploadId must be given together",
            ));
        }
    }

    let attributes = declared_metadata(&headers)?;
    let preconditions = preconditions(&headers);

    if let Some((source, source_version)) = copy_source(&service, &tenant, &headers)? {
        let version = service
            .copy_object(
                &source,
                source_version.as_deref(),
                &object,
                metadata_directive(&headers)?,
                attributes,
                bypass,
                &preconditions,
            )
            .await?;
        let response = xml_response(&CopyObjectResult::new(&version.etag, version.created_at))?;
        return Ok(with_version_id(response, &version.version_id));
    }

    let version = service
        .put_object(
            &object,
            body_stream(body),
            body_encoding(&headers)?,
            attributes,
            bypass,
            &preconditions,
        )
        .await?;

    let mut response = StatusCode::OK.into_response();
    insert_header(response.headers_mut(), header::ETAG, &quoted(&version.etag));
    Ok(with_version_id(response, &version.version_id))
}

/// `POST /{bucket}/{*key}?uploads` initiates, `?uploadId=` completes.
pub async fn post_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<ObjectQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let tenant = tenant_id(&headers, &service);
    let object = service.object_key(&tenant, &bucket, &key)?;

    if q.uploads.is_some() {
        let upload = service
            .initiate_upload(&object, declared_metadata(&headers)?)
            .await?;
        return xml_response(&InitiateMultipartUploadResult::from(&upload));
    }

    if let Some(upload_id) = q.upload_id.as_deref() {
        let doc: CompleteMultipartUploadXml = parse_xml(&read_document(body).await?)?;
        let parts = doc
            .parts
            .into_iter()
            .map(|p| CompletedPart {
                part_number: p.part_number,
                etag: p.etag,
            })
            .collect();
        let version = service
            .complete_upload(
                &object,
                upload_id,
                parts,
                bypass_governance(&headers),
                &preconditions(&headers),
            )
            .await?;
        let response = xml_response(&CompleteMultipartUploadResult::from(&version))?;
        return Ok(with_version_id(response, &version.version_id));
    }

    Err(AppError::bad_request(
        "POST on an object requires ?uploads or ?uploadId",
    ))
}

/// `GET /{bucket}/{*key}`: GetObject (optionally ranged or of an older
/// version), ListParts, GetObjectRetention or GetObjectLegalHold.
pub async fn get_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<ObjectQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let tenant = tenant_id(&headers, &service);
    let object = service.object_key(&tenant, &bucket, &key)?;

    if let Some(upload_id) = q.upload_id.as_deref() {
        let max_parts = q.max_parts.unwrap_or(1000);
        let page = service
            .list_parts(&object, upload_id, q.part_number_marker, max_parts)
            .await?;
        return xml_response(&ListPartsResult {
            xmlns: S3_NAMESPACE,
            bucket,
            key,
            upload_id: upload_id.to_string(),
            part_number_marker: q.part_number_marker.unwrap_or(0),
            next_part_number_marker: page.next_part_number_marker,
            max_parts: max_parts.clamp(1, 1000),
            is_truncated: page.is_truncated,
            parts: page.parts.iter().map(PartXml::from).collect(),
        });
    }
    if q.retention.is_some() {
        return match service.get_retention(&object, q.version_id.as_deref()).await? {
            Some(retention) => xml_response(&RetentionXml::from_retention(Some(retention))),
            None => Err(AppError::not_found("object has no retention configured")
                .with_code("NoSuchObjectLockConfiguration")),
        };
    }
    if q.legal_hold.is_some() {
        let on = service.get_legal_hold(&object, q.version_id.as_deref()).await?;
        return xml_response(&LegalHoldXml::from_flag(on));
    }

    let read = service
        .get_object(
            &object,
            q.version_id.as_deref(),
            header_str(&headers, header::RANGE.as_str()),
            &preconditions(&headers),
        )
        .await?;

    let mut response = Response::new(Body::from_stream(read.body));
    set_object_headers(response.headers_mut(), &read.version, read.range);
    *response.status_mut() = if read.range.is_some() {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::OK
    };
    Ok(response)
}

/// `HEAD /{bucket}/{*key}`: same headers as GET but no body.
pub async fn head_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<ObjectQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let tenant = tenant_id(&headers, &service);
    let object = service.object_key(&tenant, &bucket, &key)?;
    let version = service
        .head_object(&object, q.version_id.as_deref(), &preconditions(&headers))
        .await?;

    let mut response = Response::new(Body::empty());
    set_object_headers(response.headers_mut(), &version, None);
    *response.status_mut() = StatusCode::OK;
    Ok(response)
}

/// `DELETE /{bucket}/{*key}`: delete (marker, null slot or one version), or
/// abort a multipart upload with `?uploadId=`.
pub async fn delete_object(
    State(service): State<StorageService>,
    Path((bucket, key)): Path<(String, String)>,
    Query(q): Query<ObjectQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let tenant = tenant_id(&headers, &service);
    let object = service.object_key(&tenant, &bucket, &key)?;

    if let Some(upload_id) = q.upload_id.as_deref() {
        service.abort_upload(&object, upload_id).await?;
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let outcome = service
        .delete_object(&object, q.version_id.as_deref(), bypass_governance(&headers))
        .await?;

    let mut response = StatusCode::NO_CONTENT.into_response();
    if outcome.delete_marker {
        response.headers_mut().insert(
            HeaderName::from_static(DELETE_MARKER_HEADER),
            HeaderValue::from_static("true"),
        );
    }
    Ok(match outcome.version_id {
        Some(version_id) => with_version_id(response, &version_id),
        None => response,
    })
}

// ---- request helpers ---------------------------------------------------

/// Tenant named by the request, or the configured default.
pub(crate) fn tenant_id(headers: &HeaderMap, service: &StorageService) -> String {
    header_str(headers, TENANT_HEADER)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(service.default_tenant())
        .to_string()
}

/// The governance bypass flag. Authorisation happens upstream; the header
/// is trusted as given.
fn bypass_governance(headers: &HeaderMap) -> bool {
    header_str(headers, BYPASS_HEADER).is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

pub(crate) async fn read_document(body: Body) -> Result<Bytes, AppError> {
    axum::body::to_bytes(body, MAX_DOCUMENT_BYTES)
        .await
        .map_err(|err| AppError::bad_request(format!("could not read request body: {}", err)))
}

fn body_stream(body: Body) -> ByteStream {
    body.into_data_stream().map_err(io::Error::other).boxed()
}

/// Detect `aws-chunked` framing. The decoded length header is then mandatory.
fn body_encoding(headers: &HeaderMap) -> Result<BodyEncoding, AppError> {
    let content_encoding = header_str(headers, header::CONTENT_ENCODING.as_str()).unwrap_or("");
    let chunked_encoding = content_encoding
        .split(',')
        .any(|e| e.trim().eq_ignore_ascii_case("aws-chunked"));
    let streaming_payload =
        header_str(headers, "x-amz-content-sha256").is_some_and(|v| v.starts_with("STREAMING-"));
    if !chunked_encoding && !streaming_payload {
        return Ok(BodyEncoding::Plain);
    }

    let decoded_length = header_str(headers, "x-amz-decoded-content-length")
        .ok_or_else(|| {
            AppError::new(
                StatusCode::LENGTH_REQUIRED,
                "aws-chunked bodies require x-amz-decoded-content-length",
            )
            .with_code("MissingContentLength")
        })?
        .trim()
        .parse::<u64>()
        .map_err(|_| AppError::bad_request("invalid x-amz-decoded-content-length"))?;
    Ok(BodyEncoding::AwsChunked { decoded_length })
}

fn preconditions(headers: &HeaderMap) -> Preconditions {
    Preconditions {
        if_match: header_str(headers, header::IF_MATCH.as_str()).map(str::to_string),
        if_none_match: header_str(headers, header::IF_NONE_MATCH.as_str()).map(str::to_string),
    }
}

/// Content type, `x-amz-meta-*` and object lock headers of a write.
fn declared_metadata(headers: &HeaderMap) -> Result<DeclaredMetadata, AppError> {
    let content_type = header_str(headers, header::CONTENT_TYPE.as_str()).map(str::to_string);

    let mut user_metadata = HashMap::new();
    for (name, value) in headers {
        if let Some(meta_key) = name.as_str().strip_prefix(USER_METADATA_PREFIX) {
            let value = value.to_str().map_err(|_| {
                AppError::bad_request(format!("metadata header `{}` is not valid text", name))
            })?;
            user_metadata.insert(meta_key.to_string(), value.to_string());
        }
    }

    let retention = match (
        header_str(headers, LOCK_MODE_HEADER),
        header_str(headers, LOCK_UNTIL_HEADER),
    ) {
        (None, None) => None,
        (Some(mode), Some(until)) => Some(Retention::new(
            mode.parse::<RetentionMode>().map_err(AppError::bad_request)?,
            parse_timestamp(until)?,
        )),
        _ => {
            return Err(AppError::bad_request(format!(
                "{} and {} must be given together",
                LOCK_MODE_HEADER, LOCK_UNTIL_HEADER
            )));
        }
    };

    let legal_hold = match header_str(headers, LEGAL_HOLD_HEADER) {
        Some(status) => status
            .parse::<LegalHold>()
            .map_err(AppError::bad_request)?
            .is_on(),
        None => false,
    };

    Ok(DeclaredMetadata {
        content_type,
        user_metadata,
        retention,
        legal_hold,
    })
}

fn metadata_directive(headers: &HeaderMap) -> Result<MetadataDirective, AppError> {
    match header_str(headers, "x-amz-metadata-directive").map(str::trim) {
        None => Ok(MetadataDirective::Copy),
        Some(d) if d.eq_ignore_ascii_case("COPY") => Ok(MetadataDirective::Copy),
        Some(d) if d.eq_ignore_ascii_case("REPLACE") => Ok(MetadataDirective::Replace),
        Some(other) => Err(AppError::bad_request(format!(
            "unknown metadata directive `{}`",
            other
        ))),
    }
}

/// Parse `x-amz-copy-source: /bucket/key[?versionId=id]`, URL-encoded.
fn copy_source(
    service: &StorageService,
    tenant: &str,
    headers: &HeaderMap,
) -> Result<Option<(ObjectKey, Option<String>)>, AppError> {
    let Some(raw) = header_str(headers, COPY_SOURCE_HEADER) else {
        return Ok(None);
    };
    let (path, query) = match raw.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (raw, None),
    };
    let decoded = percent_decode_str(path).decode_utf8_lossy();
    let (bucket, key) = decoded
        .trim_start_matches('/')
        .split_once('/')
        .ok_or_else(|| AppError::bad_request(format!("invalid {}: {}", COPY_SOURCE_HEADER, raw)))?;
    let version_id = query
        .and_then(|q| q.split('&').find_map(|pair| pair.strip_prefix("versionId=")))
        .map(|v| percent_decode_str(v).decode_utf8_lossy().into_owned());

    Ok(Some((service.object_key(tenant, bucket, key)?, version_id)))
}

// ---- response helpers --------------------------------------------------

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

fn with_version_id(mut response: Response, version_id: &str) -> Response {
    if version_id != NULL_VERSION_ID {
        insert_header(
            response.headers_mut(),
            HeaderName::from_static(VERSION_ID_HEADER),
            version_id,
        );
    }
    response
}

fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn set_object_headers(headers: &mut HeaderMap, version: &ObjectVersion, range: Option<ByteRange>) {
    let content_type = version
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    let length = match range {
        Some(r) => {
            insert_header(
                headers,
                header::CONTENT_RANGE,
                &format!("bytes {}-{}/{}", r.start, r.end, version.size),
            );
            r.len()
        }
        None => u64::try_from(version.size).unwrap_or(0),
    };
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
    headers.insert(header::ACCEPT_RANGES, HeaderValue::from_static("bytes"));
    insert_header(headers, header::ETAG, &quoted(&version.etag));
    insert_header(headers, header::LAST_MODIFIED, &http_date(version.created_at));

    if version.version_id != NULL_VERSION_ID {
        insert_header(
            headers,
            HeaderName::from_static(VERSION_ID_HEADER),
            &version.version_id,
        );
    }
    for (name, value) in &version.user_metadata {
        if let Ok(name) = HeaderName::try_from(format!("{}{}", USER_METADATA_PREFIX, name)) {
            insert_header(headers, name, value);
        }
    }
    if let Some(retention) = &version.retention {
        insert_header(
            headers,
            HeaderName::from_static(LOCK_MODE_HEADER),
            retention.mode.as_str(),
        );
        insert_header(
            headers,
            HeaderName::from_static(LOCK_UNTIL_HEADER),
            &crate::handlers::xml::timestamp(retention.retain_until),
        );
    }
    if version.legal_hold {
        headers.insert(
            HeaderName::from_static(LEGAL_HOLD_HEADER),
            HeaderValue::from_static("ON"),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn chunked_detection_requires_decoded_length() {
        assert_eq!(body_encoding(&headers(&[])).unwrap(), BodyEncoding::Plain);

        let chunked = headers(&[
            ("content-encoding", "aws-chunked"),
            ("x-amz-decoded-content-length", "42"),
        ]);
        assert_eq!(
            body_encoding(&chunked).unwrap(),
            BodyEncoding::AwsChunked { decoded_length: 42 }
        );

        let missing = headers(&[("x-amz-content-sha256", "STREAMING-AWS4-HMAC-SHA256-PAYLOAD")]);
        let err = body_encoding(&missing).unwrap_err();
        assert_eq!(err.status, StatusCode::LENGTH_REQUIRED);
    }

    #[test]
    fn write_headers_become_declared_metadata() {
        let declared = declared_metadata(&headers(&[
            ("content-type", "text/plain"),
            ("x-amz-meta-author", "kim"),
            ("x-amz-object-lock-mode", "GOVERNANCE"),
            ("x-amz-object-lock-retain-until-date", "2031-01-01T00:00:00Z"),
            ("x-amz-object-lock-legal-hold", "ON"),
        ]))
        .unwrap();
        assert_eq!(declared.content_type.as_deref(), Some("text/plain"));
        assert_eq!(declared.user_metadata["author"], "kim");
        assert_eq!(
            declared.retention.map(|r| r.mode),
            Some(RetentionMode::Governance)
        );
        assert!(declared.legal_hold);

        let half = declared_metadata(&headers(&[("x-amz-object-lock-mode", "COMPLIANCE")]));
        assert!(half.is_err());
    }

    #[test]
    fn bypass_header_must_say_true() {
        assert!(bypass_governance(&headers(&[(BYPASS_HEADER, "true")])));
        assert!(bypass_governance(&headers(&[(BYPASS_HEADER, "TRUE")])));
        assert!(!bypass_governance(&headers(&[(BYPASS_HEADER, "yes")])));
        assert!(!bypass_governance(&headers(&[])));
    }

    #[test]
    fn http_dates_use_gmt() {
        use chrono::TimeZone;
        let at = Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(http_date(at), "Wed, 02 Jan 2030 03:04:05 GMT");
    }
}
