//! REST surface for session inspection and host key administration.
//!
//! The gateway trusts an upstream proxy to authenticate users and stamp
//! the `X-User-Id` header; user scoping here is data partitioning, not an
//! authentication layer.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use uuid::Uuid;

use super::AppState;

pub(crate) fn user_id_from_headers(headers: &HeaderMap) -> Result<Uuid, StatusCode> {
    headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or(StatusCode::UNAUTHORIZED)
}

pub async fn list_sessions(State(state): State<AppState>, headers: HeaderMap) -> Response {
    match user_id_from_headers(&headers) {
        Ok(user_id) => Json(state.registry.list_by_user(user_id)).into_response(),
        Err(status) => status.into_response(),
    }
}

pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    let Ok(user_id) = user_id_from_headers(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    match state.registry.get(id) {
        Some(info) if info.user_id == user_id => Json(info).into_response(),
        // Hide other users' sessions entirely.
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

pub async fn close_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Response {
    let Ok(user_id) = user_id_from_headers(&headers) else {
        return StatusCode::UNAUTHORIZED.into_response();
    };
    match state.registry.get(id) {
        Some(info) if info.user_id == user_id => {
            state.registry.remove(id);
            StatusCode::NO_CONTENT.into_response()
        }
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

pub async fn pool_stats(State(state): State<AppState>) -> Response {
    Json(state.pool.stats()).into_response()
}

#[derive(Debug, Deserialize)]
pub struct HostKeyTarget {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize)]
pub struct TrustRequest {
    pub host: String,
    pub port: u16,
    /// The fingerprint the operator verified out of band.
    pub fingerprint: String,
}

pub async fn list_host_keys(State(state): State<AppState>) -> Response {
    let verifier = Arc::clone(&state.verifier);
    match run_store_op(move || verifier.list()).await {
        Ok(keys) => Json(keys).into_response(),
        Err(response) => response,
    }
}

pub async fn trust_host_key(
    State(state): State<AppState>,
    Json(request): Json<TrustRequest>,
) -> Response {
    let verifier = Arc::clone(&state.verifier);
    match run_store_op(move || {
        verifier.trust(&request.host, request.port, &request.fingerprint)
    })
    .await
    {
        Ok(record) => Json(record).into_response(),
        Err(response) => response,
    }
}

pub async fn revoke_host_key(
    State(state): State<AppState>,
    Json(target): Json<HostKeyTarget>,
) -> Response {
    let verifier = Arc::clone(&state.verifier);
    match run_store_op(move || verifier.revoke(&target.host, target.port)).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(response) => response,
    }
}

pub async fn delete_host_key(
    State(state): State<AppState>,
    Query(target): Query<HostKeyTarget>,
) -> Response {
    let verifier = Arc::clone(&state.verifier);
    match run_store_op(move || verifier.delete(&target.host, target.port)).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => StatusCode::NOT_FOUND.into_response(),
        Err(response) => response,
    }
}

/// The trust store does file IO; keep it off the reactor and map its
/// errors to a conflict response carrying the reason.
async fn run_store_op<T, F>(op: F) -> Result<T, Response>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, crate::error::SshError> + Send + 'static,
{
    match tokio::task::spawn_blocking(op).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err((StatusCode::CONFLICT, e.to_string()).into_response()),
        Err(e) => {
            tracing::error!("Host key store task failed: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn user_id_header_parses_uuid() {
        let id = Uuid::new_v4();
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_str(&id.to_string()).unwrap());
        assert_eq!(user_id_from_headers(&headers), Ok(id));
    }

    #[test]
    fn missing_or_garbage_user_id_is_unauthorized() {
        let headers = HeaderMap::new();
        assert_eq!(user_id_from_headers(&headers), Err(StatusCode::UNAUTHORIZED));

        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("not-a-uuid"));
        assert_eq!(user_id_from_headers(&headers), Err(StatusCode::UNAUTHORIZED));
    }
}
