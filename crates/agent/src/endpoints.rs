//! The agent's local HTTP API.
//!
//! `/v1/request/session` is only mounted when the agent runs standalone:
//! once registered with a controller, sessions must arrive via assignment.
//! `/v1/connect/session/{id}` upgrades the HTTP connection and hands the
//! raw stream to the session.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use fleet_core::model::{
    ConnectionData, Session, SessionRequirements, SessionState, Status,
};
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::TcpStream;
use tower_http::cors::CorsLayer;
use tracing::error;
use uuid::Uuid;

use crate::metrics;
use crate::state::AgentRuntime;

type ApiResult<T> = Result<T, (StatusCode, String)>;

/// Body size cap for the connect call's JSON preamble.
const CONNECT_BODY_LIMIT: usize = 64 * 1024;

pub fn build_router(runtime: Arc<AgentRuntime>) -> Router {
    let mut router = Router::new()
        .route("/v1/status", get(get_status))
        .route(
            "/v1/session/{id}",
            get(get_session).delete(cancel_session),
        )
        .route("/v1/connect/session/{id}", post(connect_session))
        .route("/metrics", get(get_metrics));

    if !runtime.controller_connected {
        router = router.route("/v1/request/session", post(request_session));
    }

    router.layer(CorsLayer::permissive()).with_state(runtime)
}

async fn get_status(State(runtime): State<Arc<AgentRuntime>>) -> Json<Status> {
    Json(Status {
        state: "Active".to_string(),
        version: runtime.version.clone(),
        hostname: runtime.hostname.clone(),
    })
}

#[derive(Serialize)]
struct RequestedResponse {
    id: Uuid,
}

/// Standalone session request: run the capacity search against the local
/// device set and start the session immediately.
async fn request_session(
    State(runtime): State<Arc<AgentRuntime>>,
    Json(requirements): Json<SessionRequirements>,
) -> ApiResult<Json<RequestedResponse>> {
    let gpu_set = runtime.free_gpu_set();
    let Some(selection) = gpu_set.find(&requirements.gpus) else {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            "insufficient GPU capacity for requested session".to_string(),
        ));
    };

    let session = Session {
        id: Uuid::new_v4(),
        state: SessionState::Active,
        address: Some(runtime.address.clone()),
        version: requirements.version.clone(),
        pool_id: requirements.pool_id,
        agent_id: None,
        gpus: selection.into_gpus(),
        connections: vec![],
        updated_at: None,
    };
    let local = runtime.registry.register(session);
    Ok(Json(RequestedResponse { id: local.id }))
}

async fn get_session(
    State(runtime): State<Arc<AgentRuntime>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Session>> {
    let session = runtime
        .registry
        .get(id)
        .ok_or((StatusCode::NOT_FOUND, format!("session not found: {}", id)))?;
    Ok(Json(session.to_session(Some(runtime.address.clone()))))
}

/// Cancellation is idempotent; canceling an unknown session is a no-op.
async fn cancel_session(
    State(runtime): State<Arc<AgentRuntime>>,
    Path(id): Path<Uuid>,
) -> Json<String> {
    runtime.registry.cancel(id);
    Json(format!("session {} canceled", id))
}

/// Upgrade the HTTP connection and hand the raw stream to the session.
/// Bytes buffered past the request body would have been read by the peer's
/// protocol already, so their presence is an error.
async fn connect_session(
    State(runtime): State<Arc<AgentRuntime>>,
    Path(id): Path<Uuid>,
    mut request: Request,
) -> Response {
    let on_upgrade = request.extensions_mut().remove::<OnUpgrade>();

    let body = match axum::body::to_bytes(request.into_body(), CONNECT_BODY_LIMIT).await {
        Ok(bytes) => bytes,
        Err(e) => {
            return (StatusCode::INTERNAL_SERVER_ERROR, format!("invalid body: {}", e))
                .into_response()
        }
    };
    let data: ConnectionData = match serde_json::from_slice(&body) {
        Ok(data) => data,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("invalid connection data: {}", e),
            )
                .into_response()
        }
    };

    let Some(on_upgrade) = on_upgrade else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "connection cannot be hijacked".to_string(),
        )
            .into_response();
    };

    if runtime.registry.get(id).is_none() {
        return (StatusCode::NOT_FOUND, format!("session not found: {}", id)).into_response();
    }

    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => upgraded,
            Err(e) => {
                error!(session_id = %id, error = %e, "connection upgrade failed");
                return;
            }
        };

        let result = match upgraded.downcast::<TokioIo<TcpStream>>() {
            Ok(parts) => {
                if !parts.read_buf.is_empty() {
                    error!(session_id = %id, "hijacked connection has buffered data");
                    return;
                }
                runtime
                    .registry
                    .attach_connection(id, data, Box::new(parts.io.into_inner()))
            }
            Err(upgraded) => runtime
                .registry
                .attach_connection(id, data, Box::new(TokioIo::new(upgraded))),
        };

        if let Err(e) = result {
            error!(session_id = %id, error = %e, "failed to attach connection");
        }
    });

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "upgrade")
        .header(header::UPGRADE, "fleet-connection")
        .body(Body::empty())
        .expect("static upgrade response")
}

async fn get_metrics() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        metrics::render(),
    )
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{SessionRegistry, UPDATE_CHANNEL_DEPTH};
    use fleet_core::model::GpuRequirement;
    use std::collections::BTreeMap;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    const GB: u64 = 1 << 30;

    fn runtime(controller_connected: bool) -> Arc<AgentRuntime> {
        let (session_tx, _session_rx) = mpsc::channel(UPDATE_CHANNEL_DEPTH);
        let (connection_tx, _connection_rx) = mpsc::channel(UPDATE_CHANNEL_DEPTH);
        Arc::new(AgentRuntime::new(
            "testhost".to_string(),
            "127.0.0.1:43220".to_string(),
            None,
            BTreeMap::new(),
            BTreeMap::new(),
            crate::gpu::synthetic_gpus(1),
            SessionRegistry::new(session_tx, connection_tx),
            controller_connected,
        ))
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let app = build_router(runtime(false));
        let response = app
            .oneshot(axum::http::Request::builder().uri("/v1/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let status: Status = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(status.state, "Active");
        assert_eq!(status.hostname, "testhost");
    }

    #[tokio::test]
    async fn test_request_session_standalone() {
        let app = build_router(runtime(false));
        let requirements = SessionRequirements {
            version: "1".to_string(),
            gpus: vec![GpuRequirement { vram_at_least: 8 * GB, ..Default::default() }],
            ..Default::default()
        };
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/request/session")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(serde_json::to_vec(&requirements).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_request_session_not_mounted_when_controller_connected() {
        let app = build_router(runtime(true));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/request/session")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_request_session_over_capacity_is_an_error() {
        let app = build_router(runtime(false));
        let requirements = SessionRequirements {
            version: "1".to_string(),
            gpus: vec![GpuRequirement { vram_at_least: 200 * GB, ..Default::default() }],
            ..Default::default()
        };
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/request/session")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(serde_json::to_vec(&requirements).unwrap()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_get_unknown_session_is_404() {
        let app = build_router(runtime(false));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri(format!("/v1/session/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
