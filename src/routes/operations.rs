//! Operation intake and polling.
//!
//! POST /operations        - validate, persist as pending, enqueue; 202
//! GET  /operations/{uuid} - current state of an operation; 404 if unknown
//!
//! Credentials are blanked in every response.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;

use super::AppState;
use crate::error::{AppError, Result};
use crate::models::{NewOperation, Operation, OperationStatus, Setup, SetupError};

pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/operations", post(post_operation))
        .route("/operations/{uuid}", get(get_operation))
        .with_state(state)
}

async fn post_operation(
    State(state): State<AppState>,
    Json(request): Json<NewOperation>,
) -> Result<(StatusCode, Json<Operation>)> {
    if request.url.trim().is_empty() {
        return Err(AppError::InvalidRequest("url is required".to_string()));
    }
    // An empty setup is accepted here and fails in the processor.
    if let Err(SetupError::Ambiguous) = Setup::from_wire(&request.setup) {
        return Err(AppError::InvalidRequest(SetupError::Ambiguous.to_string()));
    }

    let op = Operation {
        uuid: Uuid::new_v4().to_string(),
        url: request.url,
        repository_strategy: request.repository_strategy,
        setup: request.setup,
        load_files: request.load_files,
        status: OperationStatus::Pending,
        ..Default::default()
    };

    state.store.save(&op)?;
    state.store.enqueue(&op.uuid)?;
    tracing::info!("Operation {} queued for {}", op.uuid, op.url);

    Ok((StatusCode::ACCEPTED, Json(op.redacted())))
}

async fn get_operation(
    State(state): State<AppState>,
    Path(uuid): Path<String>,
) -> Result<Json<Operation>> {
    let op = state
        .store
        .load(&uuid)?
        .ok_or(AppError::OperationNotFound(uuid))?;
    Ok(Json(op.redacted()))
}
