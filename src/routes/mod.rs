//! API route handlers - maps HTTP endpoints onto the operation store.
//!
//! Each submodule defines routes for a feature area:
//! - `operations`: Submit and poll operations (POST/GET /operations)
//! - `mon`: Service status and version (GET /mon/*)
//!
//! Handlers never touch git or the filesystem; all repository work happens
//! in the processor.

pub mod mon;
pub mod operations;

use std::sync::Arc;

use axum::Router;

use crate::git::RepoCache;
use crate::store::Store;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub cache: RepoCache,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .merge(operations::routes(state.clone()))
        .merge(mon::routes(state))
}
