//! Admin account endpoints: the mixed-channel pre-check and the
//! create/update surface that enforces it.
//!
//! The explicit check endpoint returns full conflict details for the
//! admin UI; create/update return a bare 409 and let the UI issue the
//! check call for specifics.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use relaypool_core::repo::AccountRepository;
use relaypool_types::{Account, AccountStatus, CredentialKind, MixedChannelError};

use crate::state::AppState;

use super::parse_platform;

#[derive(Deserialize)]
pub struct MixedChannelCheckRequest {
    pub platform: String,
    #[serde(default)]
    pub group_ids: Vec<i64>,
    #[serde(default)]
    pub account_id: Option<i64>,
}

/// `POST /api/v1/admin/accounts/check-mixed-channel`
pub async fn check_mixed_channel(
    State(state): State<AppState>,
    Json(request): Json<MixedChannelCheckRequest>,
) -> Response {
    let Some(platform) = parse_platform(&request.platform) else {
        return bad_request("unknown platform");
    };

    match state.inner.checker.check(platform, &request.group_ids, request.account_id).await {
        Ok(Ok(())) => Json(json!({"code": 0, "data": {"has_risk": false}})).into_response(),
        Ok(Err(conflict)) => Json(json!({
            "code": 0,
            "data": {
                "has_risk": true,
                "error": "mixed_channel_warning",
                "details": {
                    "group_id": conflict.group_id,
                    "group_name": conflict.group_name,
                    "current_platform": conflict.current_platform,
                    "other_platform": conflict.other_platform,
                },
            },
        }))
        .into_response(),
        Err(err) => internal_error(&err.to_string()),
    }
}

#[derive(Deserialize)]
pub struct CreateAccountRequest {
    pub name: String,
    pub platform: String,
    #[serde(rename = "type", default)]
    pub credential_kind: Option<String>,
    #[serde(default)]
    pub credentials: Map<String, Value>,
    #[serde(default)]
    pub group_ids: Vec<i64>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub max_concurrency: Option<i32>,
}

/// `POST /api/v1/admin/accounts`
pub async fn create_account(
    State(state): State<AppState>,
    Json(request): Json<CreateAccountRequest>,
) -> Response {
    let Some(platform) = parse_platform(&request.platform) else {
        return bad_request("unknown platform");
    };
    let credential_kind = match parse_credential_kind(request.credential_kind.as_deref()) {
        Some(kind) => kind,
        None => return bad_request("unknown credential type"),
    };

    match state.inner.checker.check(platform, &request.group_ids, None).await {
        Ok(Ok(())) => {},
        Ok(Err(conflict)) => return mixed_channel_conflict(&conflict),
        Err(err) => return internal_error(&err.to_string()),
    }

    let account = Account {
        id: 0,
        name: request.name,
        platform,
        credential_kind,
        credentials: request.credentials,
        priority: request.priority,
        max_concurrency: request.max_concurrency.unwrap_or(5),
        status: AccountStatus::Active,
        schedulable: true,
        last_used_at: None,
        extra: Map::new(),
    };
    let created = state.inner.accounts.insert(account, request.group_ids);
    Json(json!({"code": 0, "data": created})).into_response()
}

#[derive(Deserialize)]
pub struct UpdateAccountRequest {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub credentials: Option<Map<String, Value>>,
    #[serde(default)]
    pub group_ids: Option<Vec<i64>>,
    #[serde(default)]
    pub priority: Option<i32>,
    #[serde(default)]
    pub max_concurrency: Option<i32>,
    #[serde(default)]
    pub schedulable: Option<bool>,
}

/// `PUT /api/v1/admin/accounts/{id}`
pub async fn update_account(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<UpdateAccountRequest>,
) -> Response {
    let Ok(Some(mut account)) = state.inner.accounts.get_by_id(id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "not_found", "message": format!("account {id} not found")})),
        )
            .into_response();
    };

    if let Some(group_ids) = &request.group_ids {
        match state.inner.checker.check(account.platform, group_ids, Some(id)).await {
            Ok(Ok(())) => {},
            Ok(Err(conflict)) => return mixed_channel_conflict(&conflict),
            Err(err) => return internal_error(&err.to_string()),
        }
        state.inner.accounts.set_groups(id, group_ids.clone());
    }

    if let Some(name) = request.name {
        account.name = name;
    }
    if let Some(credentials) = request.credentials {
        account.credentials = credentials;
    }
    if let Some(priority) = request.priority {
        account.priority = priority;
    }
    if let Some(max_concurrency) = request.max_concurrency {
        account.max_concurrency = max_concurrency;
    }
    if let Some(schedulable) = request.schedulable {
        account.schedulable = schedulable;
    }

    if let Err(err) = state.inner.accounts.update(&account).await {
        return internal_error(&err.to_string());
    }
    Json(json!({"code": 0, "data": account})).into_response()
}

fn parse_credential_kind(raw: Option<&str>) -> Option<CredentialKind> {
    match raw.unwrap_or("oauth") {
        "oauth" => Some(CredentialKind::Oauth),
        "api_key" => Some(CredentialKind::ApiKey),
        "setup_token" => Some(CredentialKind::SetupToken),
        "upstream" => Some(CredentialKind::Upstream),
        _ => None,
    }
}

fn mixed_channel_conflict(conflict: &MixedChannelError) -> Response {
    (
        StatusCode::CONFLICT,
        Json(json!({
            "error": "mixed_channel_warning",
            "message": format!("mixed_channel_warning: {conflict}"),
        })),
    )
        .into_response()
}

fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({"error": "invalid_request", "message": message})),
    )
        .into_response()
}

fn internal_error(message: &str) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": "internal_error", "message": message})),
    )
        .into_response()
}
