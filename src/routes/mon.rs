//! Monitoring endpoints.
//!
//! GET /mon/status  - store reachability, queue length, operation count
//! GET /mon/version - crate name and version

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use super::AppState;
use crate::error::Result;

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/mon/status", get(get_status))
        .route("/mon/version", get(get_version))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct MonitoringStatus {
    /// "OK" or "AL" (alert)
    status: &'static str,
    store: String,
    queue_len: u64,
    operations: u64,
    cache_root: String,
}

#[derive(Debug, Serialize)]
struct Version {
    name: &'static str,
    version: &'static str,
}

async fn get_status(State(state): State<AppState>) -> Result<Json<MonitoringStatus>> {
    let cache_root = state.cache.root().display().to_string();

    if let Err(e) = state.store.ping() {
        tracing::warn!("Store unreachable: {}", e);
        return Ok(Json(MonitoringStatus {
            status: "AL",
            store: e.to_string(),
            queue_len: 0,
            operations: 0,
            cache_root,
        }));
    }

    Ok(Json(MonitoringStatus {
        status: "OK",
        store: "OK".to_string(),
        queue_len: state.store.queue_len()?,
        operations: state.store.count_operations()?,
        cache_root,
    }))
}

async fn get_version() -> Json<Version> {
    Json(Version {
        name: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}
