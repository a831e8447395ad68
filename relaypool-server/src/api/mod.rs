pub mod admin;
pub mod gemini;
pub mod messages;


use axum::body::Body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;

use relaypool_core::dispatch::{DispatchBody, DispatchResponse};
use relaypool_types::{GatewayError, Platform};

pub(crate) fn parse_platform(raw: &str) -> Option<Platform> {
    match raw.to_ascii_lowercase().as_str() {
        "anthropic" => Some(Platform::Anthropic),
        "gemini" => Some(Platform::Gemini),
        "antigravity" => Some(Platform::Antigravity),
        _ => None,
    }
}

/// Convert a dispatch result into an HTTP response.
///
/// Streams forward as SSE; mid-stream failures surface as an in-band
/// `data:` frame carrying the standard error envelope, since the status
/// line is already on the wire.
pub fn into_http_response(response: DispatchResponse) -> Response {
    match response.body {
        DispatchBody::Json(value) => (
            StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK),
            axum::Json(value),
        )
            .into_response(),
        DispatchBody::Stream(stream) => {
            let guarded = stream.map(|chunk| match chunk {
                Ok(bytes) => Ok::<Bytes, std::convert::Infallible>(bytes),
                Err(err) => {
                    tracing::warn!(error = %err, "upstream stream aborted, emitting in-band error");
                    let envelope = serde_json::json!({
                        "error": {"type": "upstream_error", "message": err.to_string()}
                    });
                    Ok(Bytes::from(format!("data: {envelope}\n\n")))
                },
            });
            Response::builder()
                .status(StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK))
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache")
                .body(Body::from_stream(guarded))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        },
    }
}

/// Map a gateway error onto the client-facing envelope. Client
/// disconnects get an empty body; upstream client faults pass through
/// with their original status and body.
pub fn into_error_response(err: GatewayError) -> Response {
    if matches!(err, GatewayError::Canceled) {
        return StatusCode::from_u16(499)
            .map(|s| s.into_response())
            .unwrap_or_else(|_| StatusCode::BAD_GATEWAY.into_response());
    }
    if let GatewayError::UpstreamClient { status, body } = err {
        let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_REQUEST);
        return match serde_json::from_str::<serde_json::Value>(&body) {
            Ok(value) => (status, axum::Json(value)).into_response(),
            Err(_) => (status, body).into_response(),
        };
    }
    let (status, _) = err.surface();
    (
        StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY),
        axum::Json(err.envelope()),
    )
        .into_response()
}
