use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::manager::ModelRegistry;

pub mod error;
pub mod handlers;
pub mod types;

#[derive(Clone)]
pub struct AppState {
    pub models: Arc<ModelRegistry>,
    pub temperature: f64,
    pub seed: Option<u64>,
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/embed", post(handlers::embed))
        .route("/query", post(handlers::query))
        .route("/health", get(handlers::health))
}
