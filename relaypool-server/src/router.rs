use axum::{
    extract::DefaultBodyLimit,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::api;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(api::messages::handle_messages))
        .route("/{platform}/v1/messages", post(api::messages::handle_messages_forced))
        .route("/v1/models/{model_action}", post(api::gemini::handle_generate))
        .route(
            "/api/v1/admin/accounts/check-mixed-channel",
            post(api::admin::check_mixed_channel),
        )
        .route("/api/v1/admin/accounts", post(api::admin::create_account))
        .route("/api/v1/admin/accounts/{id}", put(api::admin::update_account))
        .route("/health", get(health_check))
        .with_state(state)
        .layer(DefaultBodyLimit::max(32 * 1024 * 1024))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}

async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, axum::Json(serde_json::json!({"status": "ok"})))
}
