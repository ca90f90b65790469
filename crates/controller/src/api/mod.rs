//! HTTP endpoint modules, one per responsibility area.
//!
//! Handlers return 200 with a JSON payload on success; failures map through
//! `StoreError::status_code()` with the error string as the diagnostic.

mod agents;
mod pools;
mod sessions;
mod status;

use axum::http::StatusCode;

use crate::store::StoreError;

pub(crate) type ApiResult<T> = Result<T, (StatusCode, String)>;

pub(crate) fn store_error(e: StoreError) -> (StatusCode, String) {
    let status =
        StatusCode::from_u16(e.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, e.to_string())
}

// ── Re-exports ───────────────────────────────────────────────────
// Preserves flat `api::foo` import paths used by router.rs.

pub use agents::{get_agent, register_agent, update_agent};
pub use pools::{
    add_permission, create_pool, delete_pool, get_pool, pool_permissions, remove_permission,
    user_permissions,
};
pub use sessions::{cancel_session, get_session, request_session};
pub use status::{fleet_status, health};
