//! Routes of the edge server.
//!
//! - `GET /healthz`, `GET /readyz`: probes
//! - `GET|HEAD /` and `GET|HEAD /{*path}`: assets of the served collection
//!
//! Probe routes shadow assets published at the same paths.

use crate::{
    handlers::{
        asset_handlers::serve_asset,
        health_handlers::{healthz, readyz},
    },
    services::edge::EdgeService,
};
use axum::{Router, routing::get};

pub fn routes() -> Router<EdgeService> {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/", get(serve_asset).head(serve_asset))
        .route("/{*path}", get(serve_asset).head(serve_asset))
}
