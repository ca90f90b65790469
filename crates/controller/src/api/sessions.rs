//! Session request, lookup, and cancellation.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use fleet_core::model::{Session, SessionRequirements};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::state::AppState;

use super::{store_error, ApiResult};

#[derive(Serialize)]
pub struct RequestedResponse {
    pub id: Uuid,
}

pub async fn request_session(
    State(state): State<Arc<AppState>>,
    Json(requirements): Json<SessionRequirements>,
) -> ApiResult<Json<RequestedResponse>> {
    let id = state
        .store
        .request_session(&requirements)
        .await
        .map_err(store_error)?;
    info!(
        session_id = %id,
        gpus = requirements.gpus.len(),
        vram_required = requirements.vram_required(),
        "session queued"
    );
    Ok(Json(RequestedResponse { id }))
}

pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Session>> {
    let session = state.store.get_session(id).await.map_err(store_error)?;
    Ok(Json(session))
}

pub async fn cancel_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<String>> {
    state.store.cancel_session(id).await.map_err(store_error)?;
    info!(session_id = %id, "session cancellation requested");
    Ok(Json(format!("session {} canceled", id)))
}
