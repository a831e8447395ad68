//! Gemini-native inference ingress:
//! `POST /v1/models/{model}:(generateContent|streamGenerateContent)`.
//!
//! The model and action share one path segment, so the route captures
//! the pair and splits on `:` here.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use relaypool_core::dispatch::ParsedRequest;

use crate::state::AppState;

use super::{into_error_response, into_http_response};

pub async fn handle_generate(
    State(state): State<AppState>,
    Path(model_action): Path<String>,
    body: Bytes,
) -> Response {
    let Some((model, action)) = model_action.split_once(':') else {
        return gemini_error(StatusCode::NOT_FOUND, "missing action");
    };
    let stream = match action {
        "generateContent" => false,
        "streamGenerateContent" => true,
        _ => return gemini_error(StatusCode::NOT_FOUND, "unknown action"),
    };

    let parsed = match ParsedRequest::from_gemini(model, stream, body) {
        Ok(parsed) => parsed,
        Err(err) => return into_error_response(err),
    };

    let cancel = CancellationToken::new();
    let _drop_guard = cancel.clone().drop_guard();

    let group_id = state.inner.default_group_id;
    match state.inner.dispatcher.dispatch(&cancel, group_id, &parsed, None).await {
        Ok(response) => into_http_response(response),
        Err(err) => {
            // Gemini clients expect the google-style error object.
            let (status, _) = err.surface();
            gemini_error(
                StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
                &err.to_string(),
            )
        },
    }
}

fn gemini_error(status: StatusCode, message: &str) -> Response {
    (
        status,
        axum::Json(serde_json::json!({
            "error": {"code": status.as_u16(), "message": message}
        })),
    )
        .into_response()
}
