//! Static bearer-token check applied to every API route.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::state::AppState;

/// True when the request may proceed: either auth is disabled or the
/// Authorization header carries exactly the expected bearer token.
pub(crate) fn authorized(header_value: Option<&str>, expected: Option<&str>) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    match header_value.and_then(|v| v.strip_prefix("Bearer ")) {
        Some(token) => token == expected,
        None => false,
    }
}

pub async fn require_bearer(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let header_value = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());

    if !authorized(header_value, state.access_token.as_deref()) {
        return (StatusCode::UNAUTHORIZED, "invalid or missing bearer token").into_response();
    }

    next.run(request).await
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_disabled_allows_everything() {
        assert!(authorized(None, None));
        assert!(authorized(Some("Bearer whatever"), None));
    }

    #[test]
    fn test_matching_token_allowed() {
        assert!(authorized(Some("Bearer s3cret"), Some("s3cret")));
    }

    #[test]
    fn test_wrong_or_missing_token_rejected() {
        assert!(!authorized(Some("Bearer nope"), Some("s3cret")));
        assert!(!authorized(Some("s3cret"), Some("s3cret")));
        assert!(!authorized(None, Some("s3cret")));
    }
}
