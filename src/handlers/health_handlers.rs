//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness that checks the metadata store and the byte backend

use crate::services::storage_service::StorageService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Liveness probe. Never performs I/O.
pub async fn healthz() -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok".into(),
        }),
    )
}

/// `GET /readyz`
///
/// Readiness probe that:
/// 1. Runs `SELECT 1` against SQLite.
/// 2. Asks the byte backend for a write/read/delete round trip.
///
/// HTTP 200 when both pass, 503 otherwise. The reclamation backlog is
/// reported but never fails readiness.
pub async fn readyz(State(service): State<StorageService>) -> impl IntoResponse {
    let sqlite = check(service.check_database().await);
    let backend = check(service.check_backend().await);
    let overall_ok = sqlite.ok && backend.ok;

    let pending_reclaims = match service.pending_reclaims().await {
        Ok(n) => Some(n),
        Err(err) => {
            tracing::warn!(error = %err, "could not count pending reclaims");
            None
        }
    };

    let mut checks = HashMap::new();
    checks.insert("sqlite", sqlite);
    checks.insert("backend", backend);

    let body = ReadyResponse {
        status: if overall_ok { "ok".into() } else { "error".into() },
        checks,
        pending_reclaims,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

fn check<E: std::fmt::Display>(result: Result<(), E>) -> CheckStatus {
    match result {
        Ok(()) => CheckStatus {
            ok: true,
            error: None,
        },
        Err(e) => CheckStatus {
            ok: false,
            error: Some(e.to_string()),
        },
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    checks: HashMap<&'static str, CheckStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pending_reclaims: Option<i64>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
}
