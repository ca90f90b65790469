//! Agent registration and the reconciler's pull/push endpoints.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use fleet_core::model::{Agent, AgentRegistration, AgentUpdate};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::state::AppState;

use super::{store_error, ApiResult};

#[derive(Serialize)]
pub struct RegisteredResponse {
    pub id: Uuid,
}

pub async fn register_agent(
    State(state): State<Arc<AppState>>,
    Json(registration): Json<AgentRegistration>,
) -> ApiResult<Json<RegisteredResponse>> {
    let id = state
        .store
        .register_agent(&registration)
        .await
        .map_err(store_error)?;
    info!(
        agent_id = %id,
        hostname = %registration.hostname,
        gpus = registration.gpus.len(),
        "agent registered"
    );
    Ok(Json(RegisteredResponse { id }))
}

pub async fn get_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Agent>> {
    let agent = state.store.get_agent(id).await.map_err(store_error)?;
    Ok(Json(agent))
}

pub async fn update_agent(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(mut update): Json<AgentUpdate>,
) -> ApiResult<()> {
    // The path is authoritative for which agent is being updated.
    update.id = id;
    state.store.update_agent(&update).await.map_err(store_error)
}
