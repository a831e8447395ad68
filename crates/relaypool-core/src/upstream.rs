//! Outbound upstream surface: the transport trait the orchestrator
//! calls, response classification into the failover taxonomy, and the
//! HTTP OAuth client behind the token provider.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures::stream::BoxStream;
use futures::TryStreamExt;
use thiserror::Error;

use relaypool_types::error::{is_prompt_too_long_body, PromptTooLongError, UpstreamFailoverError};

use crate::token::{OAuthClient, OAuthError, TokenInfo};

#[derive(Debug)]
pub struct UpstreamRequest {
    pub url: String,
    pub bearer_token: String,
    pub body: Bytes,
    pub stream: bool,
}

pub enum UpstreamBody {
    Buffered(Bytes),
    Stream(BoxStream<'static, Result<Bytes, std::io::Error>>),
}

impl std::fmt::Debug for UpstreamBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffered(bytes) => f.debug_tuple("Buffered").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: u16,
    pub request_id: Option<String>,
    pub retry_after: Option<String>,
    pub body: UpstreamBody,
}

/// Transport-level failure: nothing usable came back.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("upstream connect error: {0}")]
    Connect(String),
    #[error("upstream timeout: {0}")]
    Timeout(String),
    /// The response body aborted partway; flagged retryable on the same
    /// account.
    #[error("partial body abort: {0}")]
    PartialBody(String),
}

impl TransportError {
    /// Transport failures enter the failover loop as synthetic errors.
    pub fn into_failover_error(self) -> UpstreamFailoverError {
        let retryable_on_same_account = matches!(self, Self::PartialBody(_));
        UpstreamFailoverError {
            status_code: 502,
            retryable_on_same_account,
            force_cache_billing: false,
            request_id: None,
            body_excerpt: Some(self.to_string()),
        }
    }
}

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn execute(&self, request: UpstreamRequest) -> Result<UpstreamResponse, TransportError>;
}

/// A classified non-2xx upstream response.
#[derive(Debug)]
pub enum UpstreamError {
    PromptTooLong(PromptTooLongError),
    /// Client fault (validation, malformed request): surfaced as-is,
    /// never retried.
    Client { status: u16, body: String },
    Failover {
        err: UpstreamFailoverError,
        /// Reset window to record on the account, when the upstream
        /// provided one.
        rate_limit_reset: Option<DateTime<Utc>>,
        /// 401/403: the account should be marked Error.
        auth_failure: bool,
    },
}

/// Classify a non-2xx upstream response body into the failover
/// taxonomy.
pub fn classify_error_response(
    status: u16,
    request_id: Option<String>,
    retry_after: Option<&str>,
    body: &[u8],
) -> UpstreamError {
    if is_prompt_too_long_body(body) {
        return UpstreamError::PromptTooLong(PromptTooLongError {
            status_code: 400,
            request_id,
            body: String::from_utf8_lossy(body).into_owned(),
        });
    }

    if relaypool_types::error::classify_status(status)
        == relaypool_types::FailoverErrorKind::Client
    {
        return UpstreamError::Client {
            status,
            body: String::from_utf8_lossy(body).into_owned(),
        };
    }

    let mut err = UpstreamFailoverError::from_status(status)
        .with_body_excerpt(&String::from_utf8_lossy(body));
    err.request_id = request_id;

    let rate_limit_reset = if status == 429 {
        Some(parse_rate_limit_reset(retry_after, body))
    } else {
        None
    };

    UpstreamError::Failover {
        err,
        rate_limit_reset,
        auth_failure: matches!(status, 401 | 403),
    }
}

/// Reset time from a Retry-After header (delta seconds) or an upstream
/// `quotaResetDelay` body field; defaults to a 60-second window.
fn parse_rate_limit_reset(retry_after: Option<&str>, body: &[u8]) -> DateTime<Utc> {
    if let Some(secs) = retry_after.and_then(|v| v.trim().parse::<i64>().ok()) {
        return Utc::now() + Duration::seconds(secs.max(0));
    }
    if let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) {
        if let Some(delay) = find_quota_reset_delay(&value) {
            return Utc::now() + delay;
        }
    }
    Utc::now() + Duration::seconds(60)
}

fn find_quota_reset_delay(value: &serde_json::Value) -> Option<Duration> {
    match value {
        serde_json::Value::Object(map) => {
            if let Some(raw) = map.get("quotaResetDelay").and_then(serde_json::Value::as_str) {
                // Formats like "37s" or "2m30s".
                return parse_go_duration(raw);
            }
            map.values().find_map(find_quota_reset_delay)
        },
        serde_json::Value::Array(items) => items.iter().find_map(find_quota_reset_delay),
        _ => None,
    }
}

fn parse_go_duration(raw: &str) -> Option<Duration> {
    let mut total = Duration::zero();
    let mut number = String::new();
    for ch in raw.trim().chars() {
        if ch.is_ascii_digit() || ch == '.' {
            number.push(ch);
        } else {
            let value: f64 = number.parse().ok()?;
            number.clear();
            let unit = match ch {
                'h' => 3600.0,
                'm' => 60.0,
                's' => 1.0,
                _ => return None,
            };
            total = total + Duration::milliseconds((value * unit * 1000.0) as i64);
        }
    }
    if total > Duration::zero() {
        Some(total)
    } else {
        None
    }
}

pub struct ReqwestUpstreamClient {
    http: reqwest::Client,
}

impl ReqwestUpstreamClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl Default for ReqwestUpstreamClient {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[async_trait]
impl UpstreamClient for ReqwestUpstreamClient {
    async fn execute(&self, request: UpstreamRequest) -> Result<UpstreamResponse, TransportError> {
        let response = self
            .http
            .post(&request.url)
            .bearer_auth(&request.bearer_token)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(request.body.clone())
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    TransportError::Timeout(err.to_string())
                } else {
                    TransportError::Connect(err.to_string())
                }
            })?;

        let status = response.status().as_u16();
        let request_id = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        // Error bodies are always buffered for classification; success
        // bodies stream through when the client asked for a stream.
        let body = if request.stream && (200..300).contains(&status) {
            UpstreamBody::Stream(Box::pin(
                response.bytes_stream().map_err(std::io::Error::other),
            ))
        } else {
            let bytes = response
                .bytes()
                .await
                .map_err(|err| TransportError::PartialBody(err.to_string()))?;
            UpstreamBody::Buffered(bytes)
        };

        Ok(UpstreamResponse { status, request_id, retry_after, body })
    }
}

/// OAuth client speaking to the composite upstream's token and
/// onboarding endpoints.
pub struct HttpOAuthClient {
    http: reqwest::Client,
    token_url: String,
    api_base: String,
    client_id: String,
    client_secret: String,
}

impl HttpOAuthClient {
    pub fn new(
        http: reqwest::Client,
        token_url: impl Into<String>,
        api_base: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self {
            http,
            token_url: token_url.into(),
            api_base: api_base.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

#[async_trait]
impl OAuthClient for HttpOAuthClient {
    async fn refresh_token(&self, refresh_token: &str) -> Result<TokenInfo, OAuthError> {
        let response = self
            .http
            .post(&self.token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|err| OAuthError { message: err.to_string() })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| OAuthError { message: err.to_string() })?;
        if !status.is_success() {
            return Err(OAuthError { message: format!("status {status}: {body}") });
        }

        #[derive(serde::Deserialize)]
        struct RefreshResponse {
            access_token: String,
            expires_in: i64,
            #[serde(default)]
            refresh_token: Option<String>,
        }
        let parsed: RefreshResponse =
            serde_json::from_str(&body).map_err(|err| OAuthError { message: err.to_string() })?;
        Ok(TokenInfo {
            access_token: parsed.access_token,
            refresh_token: parsed.refresh_token,
            expires_at: Utc::now() + Duration::seconds(parsed.expires_in),
        })
    }

    async fn load_code_assist(&self, access_token: &str) -> Result<Option<String>, OAuthError> {
        let url = format!("{}/v1internal:loadCodeAssist", self.api_base);
        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(&serde_json::json!({"metadata": {"pluginType": "GEMINI"}}))
            .send()
            .await
            .map_err(|err| OAuthError { message: err.to_string() })?;
        if !response.status().is_success() {
            return Err(OAuthError { message: format!("loadCodeAssist {}", response.status()) });
        }
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|err| OAuthError { message: err.to_string() })?;
        Ok(value
            .get("cloudaicompanionProject")
            .and_then(serde_json::Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string))
    }

    async fn onboard_user(&self, access_token: &str) -> Result<Option<String>, OAuthError> {
        let url = format!("{}/v1internal:onboardUser", self.api_base);
        let response = self
            .http
            .post(&url)
            .bearer_auth(access_token)
            .json(&serde_json::json!({"tierId": "free-tier"}))
            .send()
            .await
            .map_err(|err| OAuthError { message: err.to_string() })?;
        if !response.status().is_success() {
            return Err(OAuthError { message: format!("onboardUser {}", response.status()) });
        }
        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|err| OAuthError { message: err.to_string() })?;
        let project = value
            .pointer("/response/cloudaicompanionProject/id")
            .or_else(|| value.get("cloudaicompanionProject"))
            .and_then(serde_json::Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        Ok(project)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_too_long_is_fatal() {
        let classified = classify_error_response(
            400,
            Some("req-1".into()),
            None,
            br#"{"error":{"message":"Prompt is too long"}}"#,
        );
        match classified {
            UpstreamError::PromptTooLong(err) => {
                assert_eq!(err.status_code, 400);
                assert_eq!(err.request_id.as_deref(), Some("req-1"));
                assert!(!err.body.is_empty());
            },
            other => panic!("expected PromptTooLong, got {other:?}"),
        }
    }

    #[test]
    fn rate_limit_parses_retry_after() {
        let before = Utc::now();
        let classified = classify_error_response(429, None, Some("30"), b"{}");
        match classified {
            UpstreamError::Failover { err, rate_limit_reset, auth_failure } => {
                assert_eq!(err.status_code, 429);
                assert!(!auth_failure);
                let reset = rate_limit_reset.unwrap();
                assert!(reset >= before + Duration::seconds(29));
                assert!(reset <= Utc::now() + Duration::seconds(31));
            },
            other => panic!("expected Failover, got {other:?}"),
        }
    }

    #[test]
    fn rate_limit_parses_quota_reset_delay() {
        let classified = classify_error_response(
            429,
            None,
            None,
            br#"{"error":{"details":[{"quotaResetDelay":"2m30s"}]}}"#,
        );
        let UpstreamError::Failover { rate_limit_reset, .. } = classified else {
            panic!("expected Failover");
        };
        let reset = rate_limit_reset.unwrap();
        assert!(reset >= Utc::now() + Duration::seconds(145));
        assert!(reset <= Utc::now() + Duration::seconds(155));
    }

    #[test]
    fn auth_errors_are_flagged() {
        for status in [401, 403] {
            let classified = classify_error_response(status, None, None, b"{}");
            let UpstreamError::Failover { err, auth_failure, .. } = classified else {
                panic!("expected Failover");
            };
            assert!(auth_failure);
            assert!(!err.retryable_on_same_account);
        }
    }

    #[test]
    fn transient_statuses_retry_same_account() {
        for status in [408, 425] {
            let classified = classify_error_response(status, None, None, b"{}");
            let UpstreamError::Failover { err, .. } = classified else {
                panic!("expected Failover");
            };
            assert!(err.retryable_on_same_account);
        }
    }

    #[test]
    fn client_faults_surface_as_is() {
        let classified =
            classify_error_response(422, None, None, br#"{"error":"bad schema"}"#);
        let UpstreamError::Client { status, body } = classified else {
            panic!("expected Client");
        };
        assert_eq!(status, 422);
        assert!(body.contains("bad schema"));
    }

    #[test]
    fn partial_body_abort_is_same_account_retryable() {
        let err = TransportError::PartialBody("reset".into()).into_failover_error();
        assert!(err.retryable_on_same_account);
        let err = TransportError::Connect("refused".into()).into_failover_error();
        assert!(!err.retryable_on_same_account);
    }

    #[test]
    fn go_duration_parsing() {
        assert_eq!(parse_go_duration("37s"), Some(Duration::seconds(37)));
        assert_eq!(parse_go_duration("2m30s"), Some(Duration::seconds(150)));
        assert_eq!(parse_go_duration("1h"), Some(Duration::hours(1)));
        assert_eq!(parse_go_duration(""), None);
        assert_eq!(parse_go_duration("abc"), None);
    }

    mod oauth_http {
        use super::super::*;
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        #[tokio::test]
        async fn refresh_token_round_trip() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/token"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "access_token": "fresh",
                    "expires_in": 3600,
                    "refresh_token": "next-rt",
                })))
                .mount(&server)
                .await;

            let client = HttpOAuthClient::new(
                reqwest::Client::new(),
                format!("{}/token", server.uri()),
                server.uri(),
                "cid",
                "secret",
            );
            let info = client.refresh_token("rt").await.expect("refresh");
            assert_eq!(info.access_token, "fresh");
            assert_eq!(info.refresh_token.as_deref(), Some("next-rt"));
            assert!(info.expires_at > Utc::now() + Duration::minutes(55));
        }

        #[tokio::test]
        async fn refresh_token_propagates_upstream_error_body() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/token"))
                .respond_with(
                    ResponseTemplate::new(400)
                        .set_body_string(r#"{"error":"invalid_grant"}"#),
                )
                .mount(&server)
                .await;

            let client = HttpOAuthClient::new(
                reqwest::Client::new(),
                format!("{}/token", server.uri()),
                server.uri(),
                "cid",
                "secret",
            );
            let err = client.refresh_token("rt").await.unwrap_err();
            assert!(err.message.contains("invalid_grant"));
        }

        #[tokio::test]
        async fn load_code_assist_extracts_project() {
            let server = MockServer::start().await;
            Mock::given(method("POST"))
                .and(path("/v1internal:loadCodeAssist"))
                .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "cloudaicompanionProject": "proj-77",
                })))
                .mount(&server)
                .await;

            let client = HttpOAuthClient::new(
                reqwest::Client::new(),
                format!("{}/token", server.uri()),
                server.uri(),
                "cid",
                "secret",
            );
            let project = client.load_code_assist("tok").await.expect("call");
            assert_eq!(project.as_deref(), Some("proj-77"));
        }
    }
}
