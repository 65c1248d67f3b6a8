//! Bucket-level handlers: create/delete, listings and the JSON admin
//! subresources (`versioning`, `object-lock`, `lifecycle`).

use crate::{
    errors::AppError,
    handlers::{
        object_handlers::{read_document, tenant_id},
        xml::{
            CreateBucketResult, ListMultipartUploadsResult, ListVersionsResult, S3_NAMESPACE,
            UploadXml, VersionEntryXml, xml_response,
        },
    },
    models::{
        bucket::{LifecycleRule, VersioningState},
        retention::DefaultRetention,
    },
    services::{ledger::ListVersionsParams, storage_service::StorageService},
};
use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

const DEFAULT_REGION: &str = "local";
const DEFAULT_MAX_KEYS: usize = 1000;

/// Subresources and listing parameters accepted on `/{bucket}`.
#[derive(Debug, Default, Deserialize)]
pub struct BucketQuery {
    pub versions: Option<String>,
    pub uploads: Option<String>,
    pub versioning: Option<String>,
    #[serde(rename = "object-lock")]
    pub object_lock: Option<String>,
    pub lifecycle: Option<String>,
    pub prefix: Option<String>,
    #[serde(rename = "key-marker")]
    pub key_marker: Option<String>,
    #[serde(rename = "version-id-marker")]
    pub version_id_marker: Option<String>,
    #[serde(rename = "max-keys")]
    pub max_keys: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CreateBucketRequest {
    #[serde(rename = "LocationConstraint", alias = "location_constraint")]
    pub location_constraint: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VersioningConfig {
    pub status: VersioningState,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ObjectLockConfig {
    #[serde(default)]
    pub default_retention: Option<DefaultRetention>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LifecycleConfig {
    pub rules: Vec<LifecycleRule>,
}

/// `PUT /{bucket}`: create, or update one admin subresource.
pub async fn put_bucket(
    State(service): State<StorageService>,
    Path(bucket): Path<String>,
    Query(q): Query<BucketQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response, AppError> {
    let tenant = tenant_id(&headers, &service);
    let body = read_document(body).await?;

    if q.versioning.is_some() {
        let config: VersioningConfig = parse_json(&body)?;
        service.set_versioning(&tenant, &bucket, config.status).await?;
        return Ok(StatusCode::OK.into_response());
    }
    if q.object_lock.is_some() {
        let config: ObjectLockConfig = parse_json(&body)?;
        service
            .set_default_retention(&tenant, &bucket, config.default_retention)
            .await?;
        return Ok(StatusCode::OK.into_response());
    }
    if q.lifecycle.is_some() {
        let config: LifecycleConfig = parse_json(&body)?;
        service
            .set_lifecycle_rules(&tenant, &bucket, config.rules)
            .await?;
        return Ok(StatusCode::OK.into_response());
    }

    let request: CreateBucketRequest = if body.is_empty() {
        CreateBucketRequest::default()
    } else {
        parse_json(&body)?
    };
    let region = request
        .location_constraint
        .unwrap_or_else(|| DEFAULT_REGION.to_string());
    let created = service.create_bucket(&tenant, &bucket, &region).await?;
    tracing::info!(tenant = %tenant, bucket = %created.name, region = %created.region, "bucket created");
    xml_response(&CreateBucketResult::new(&created.name))
}

/// `GET /{bucket}`: `?versions`, `?uploads` or one admin subresource.
pub async fn get_bucket(
    State(service): State<StorageService>,
    Path(bucket): Path<String>,
    Query(q): Query<BucketQuery>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let tenant = tenant_id(&headers, &service);

    if q.versions.is_some() {
        let max_keys = q.max_keys.unwrap_or(DEFAULT_MAX_KEYS);
        let page = service
            .list_versions(
                &tenant,
                &bucket,
                ListVersionsParams {
                    prefix: q.prefix.clone(),
                    key_marker: q.key_marker.clone(),
                    version_id_marker: q.version_id_marker.clone(),
                    max_keys,
                },
            )
            .await?;
        return xml_response(&ListVersionsResult {
            xmlns: S3_NAMESPACE,
            name: bucket,
            prefix: q.prefix.unwrap_or_default(),
            key_marker: q.key_marker.unwrap_or_default(),
            version_id_marker: q.version_id_marker.unwrap_or_default(),
            next_key_marker: page.next_key_marker,
            next_version_id_marker: page.next_version_id_marker,
            max_keys,
            is_truncated: page.is_truncated,
            entries: page.entries.iter().map(VersionEntryXml::from).collect(),
        });
    }
    if q.uploads.is_some() {
        let uploads = service
            .list_uploads(&tenant, &bucket, q.prefix.as_deref())
            .await?;
        return xml_response(&ListMultipartUploadsResult {
            xmlns: S3_NAMESPACE,
            bucket,
            prefix: q.prefix.unwrap_or_default(),
            uploads: uploads.iter().map(UploadXml::from).collect(),
        });
    }
    if q.versioning.is_some() {
        let found = service.get_bucket(&tenant, &bucket).await?;
        return Ok(Json(VersioningConfig {
            status: found.versioning_state(),
        })
        .into_response());
    }
    if q.object_lock.is_some() {
        let found = service.get_bucket(&tenant, &bucket).await?;
        return Ok(Json(ObjectLockConfig {
            default_retention: found.default_retention(),
        })
        .into_response());
    }
    if q.lifecycle.is_some() {
        let rules = service.get_lifecycle_rules(&tenant, &bucket).await?;
        return Ok(Json(LifecycleConfig { rules }).into_response());
    }

    Err(AppError::bad_request(
        "bucket GET requires ?versions, ?uploads, ?versioning, ?object-lock or ?lifecycle",
    ))
}

/// `DELETE /{bucket}`: only empty buckets can go.
pub async fn delete_bucket(
    State(service): State<StorageService>,
    Path(bucket): Path<String>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let tenant = tenant_id(&headers, &service);
    service.delete_bucket(&tenant, &bucket).await?;
    tracing::info!(tenant = %tenant, bucket = %bucket, "bucket deleted");
    Ok(StatusCode::NO_CONTENT.into_response())
}

fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Result<T, AppError> {
    serde_json::from_slice(body)
        .map_err(|err| AppError::bad_request(format!("invalid JSON body: {}", err)))
}
