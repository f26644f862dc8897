//! Health & readiness handlers.
//!
//! - GET /healthz  -> simple liveness ("ok")
//! - GET /readyz   -> readiness: the served collection's index can be loaded

use crate::services::edge::EdgeService;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::Serialize;
use std::collections::HashMap;

/// `GET /healthz`
///
/// Never touches the backend.
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
/// HTTP 200 once the collection index and settings are loaded, 503 otherwise.
pub async fn readyz(State(edge): State<EdgeService>) -> impl IntoResponse {
    let index_check = match edge.snapshot().await {
        Ok(snapshot) => CheckStatus {
            ok: true,
            error: None,
            assets: Some(snapshot.index.len()),
        },
        Err(e) => CheckStatus {
            ok: false,
            error: Some(e.to_string()),
            assets: None,
        },
    };
    let overall_ok = index_check.ok;

    let mut checks = HashMap::new();
    checks.insert("index", index_check);

    let body = ReadyResponse {
        status: if overall_ok {
            "ok".into()
        } else {
            "error".into()
        },
        backend: edge.provider.kind(),
        collection: edge.collection.clone(),
        checks,
    };

    let status = if overall_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body))
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
}

#[derive(Serialize)]
struct ReadyResponse {
    status: String,
    backend: &'static str,
    collection: String,
    checks: HashMap<&'static str, CheckStatus>,
}

#[derive(Serialize)]
struct CheckStatus {
    ok: bool,
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    assets: Option<usize>,
}
