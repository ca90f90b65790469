//! Pool and permission CRUD.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use fleet_core::model::{PermissionRequest, Pool, PoolPermissions, UserPermissions};
use serde::Deserialize;
use uuid::Uuid;

use crate::state::AppState;

use super::{store_error, ApiResult};

#[derive(Deserialize)]
pub struct CreatePool {
    pub name: String,
}

pub async fn create_pool(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreatePool>,
) -> ApiResult<Json<Pool>> {
    let pool = state.store.create_pool(&request.name).await.map_err(store_error)?;
    Ok(Json(pool))
}

pub async fn get_pool(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Pool>> {
    let pool = state.store.get_pool(id).await.map_err(store_error)?;
    Ok(Json(pool))
}

pub async fn delete_pool(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<()> {
    state.store.delete_pool(id).await.map_err(store_error)
}

pub async fn add_permission(
    State(state): State<Arc<AppState>>,
    Path(pool_id): Path<Uuid>,
    Json(request): Json<PermissionRequest>,
) -> ApiResult<()> {
    state
        .store
        .add_permission(pool_id, &request.user_id, request.permission)
        .await
        .map_err(store_error)
}

pub async fn remove_permission(
    State(state): State<Arc<AppState>>,
    Path(pool_id): Path<Uuid>,
    Json(request): Json<PermissionRequest>,
) -> ApiResult<()> {
    state
        .store
        .remove_permission(pool_id, &request.user_id, request.permission)
        .await
        .map_err(store_error)
}

pub async fn pool_permissions(
    State(state): State<Arc<AppState>>,
    Path(pool_id): Path<Uuid>,
) -> ApiResult<Json<PoolPermissions>> {
    let permissions = state.store.get_pool_permissions(pool_id).await.map_err(store_error)?;
    Ok(Json(permissions))
}

pub async fn user_permissions(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> ApiResult<Json<UserPermissions>> {
    let permissions = state.store.get_user_permissions(&user_id).await.map_err(store_error)?;
    Ok(Json(permissions))
}
