use axum::{extract::State, Json};
use tokio::task;
use tracing::{debug, info};

use super::error::ApiError;
use super::types::{
    EmbedRequest, EmbedResponse, HealthResponse, QueryRequest, QueryResponse,
};
use super::AppState;
use crate::inference::{ChatMessage, GenerationParams};

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
    })
}

pub async fn embed(
    State(state): State<AppState>,
    Json(req): Json<EmbedRequest>,
) -> Result<Json<EmbedResponse>, ApiError> {
    debug!(bytes = req.text.len(), "embed request");
    let models = state.models.clone();

    let embedding = task::spawn_blocking(move || {
        let model = models.embedder.get()?;
        model.embed(&req.text)
    })
    .await??;

    Ok(Json(EmbedResponse { embedding }))
}

pub async fn query(
    State(state): State<AppState>,
    Json(req): Json<QueryRequest>,
) -> Result<Json<QueryResponse>, ApiError> {
    info!(max_tokens = req.max_tokens, "query request");
    let models = state.models.clone();
    let params = GenerationParams::new(req.max_tokens)
        .with_temperature(state.temperature)
        .with_seed(state.seed);
    let messages = vec![ChatMessage::system(req.system), ChatMessage::user(req.user)];

    let answer = task::spawn_blocking(move || {
        let model = models.chat.get()?;
        model.generate(&messages, &params)
    })
    .await??;

    Ok(Json(QueryResponse {
        answer: answer.trim().to_string(),
    }))
}
