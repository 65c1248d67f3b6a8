//! Defines routes for all S3-like bucket and object operations.
//!
//! ## Structure
//! - **Bucket-level endpoints**
//!   - `PUT    /{bucket}`: create bucket, or `?versioning|object-lock|lifecycle`
//!   - `GET    /{bucket}`: `?versions`, `?uploads` or an admin subresource
//!   - `DELETE /{bucket}`: delete an empty bucket
//!
//! - **Object-level endpoints**
//!   - `PUT    /{bucket}/{*key}`: put, copy, upload part, retention, legal hold
//!   - `POST   /{bucket}/{*key}`: initiate or complete a multipart upload
//!   - `GET    /{bucket}/{*key}`: read a version, list parts, retention, legal hold
//!   - `HEAD   /{bucket}/{*key}`: metadata only
//!   - `DELETE /{bucket}/{*key}`: delete marker, version delete or upload abort
//!
//! The wildcard `*key` allows nested keys like `photos/2025/img.jpg`.

use crate::{
    handlers::{
        bucket_handlers::{delete_bucket, get_bucket, put_bucket},
        health_handlers::{healthz, readyz},
        object_handlers::{delete_object, get_object, head_object, post_object, put_object},
    },
    services::storage_service::StorageService,
};
use axum::{
    Router,
    routing::{get, put},
};

/// Build the router for every endpoint. Handlers share the `StorageService`
/// state.
pub fn routes() -> Router<StorageService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Object-level routes
        .route(
            "/{bucket}/{*key}",
            put(put_object)
                .get(get_object)
                .head(head_object)
                .delete(delete_object)
                .post(post_object),
        )
        // Bucket-level routes
        .route(
            "/{bucket}",
            get(get_bucket).put(put_bucket).delete(delete_bucket),
        )
}
