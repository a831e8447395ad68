//! Anthropic-compatible inference ingress.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use relaypool_core::dispatch::ParsedRequest;
use relaypool_types::Platform;

use crate::state::AppState;

use super::{into_error_response, into_http_response, parse_platform};

/// `POST /v1/messages`
pub async fn handle_messages(State(state): State<AppState>, body: Bytes) -> Response {
    dispatch_messages(state, body, None).await
}

/// `POST /{platform}/v1/messages` with platform forcing.
pub async fn handle_messages_forced(
    State(state): State<AppState>,
    Path(platform): Path<String>,
    body: Bytes,
) -> Response {
    let Some(platform) = parse_platform(&platform) else {
        return (
            StatusCode::NOT_FOUND,
            axum::Json(serde_json::json!({
                "error": {"type": "invalid_request_error", "message": "unknown platform"}
            })),
        )
            .into_response();
    };
    dispatch_messages(state, body, Some(platform)).await
}

async fn dispatch_messages(
    state: AppState,
    body: Bytes,
    forced_platform: Option<Platform>,
) -> Response {
    let parsed = match ParsedRequest::from_claude(body) {
        Ok(parsed) => parsed,
        Err(err) => return into_error_response(err),
    };

    // Dropped when the client goes away; every suspension point in the
    // engine observes it.
    let cancel = CancellationToken::new();
    let _drop_guard = cancel.clone().drop_guard();

    let group_id = state.inner.default_group_id;
    match state.inner.dispatcher.dispatch(&cancel, group_id, &parsed, forced_platform).await {
        Ok(response) => into_http_response(response),
        Err(err) => into_error_response(err),
    }
}
