//! Liveness and the fleet-wide aggregate snapshot.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use serde::Serialize;

use crate::state::AppState;
use crate::store::AggregatedData;

use super::{store_error, ApiResult};

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok", version: env!("CARGO_PKG_VERSION") })
}

pub async fn fleet_status(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<AggregatedData>> {
    let data = state.store.aggregate_data().await.map_err(store_error)?;
    Ok(Json(data))
}
