//! Application state: the dispatch engine and its collaborators, wired
//! once at startup and shared across handlers.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;

use relaypool_core::admin::MixedChannelChecker;
use relaypool_core::dispatch::{Dispatcher, DispatcherConfig};
use relaypool_core::load::RedisLoadStore;
use relaypool_core::slots::RedisSlotCache;
use relaypool_core::sticky::RedisSessionStore;
use relaypool_core::token::{RedisTokenCache, TokenProvider};
use relaypool_core::upstream::{HttpOAuthClient, ReqwestUpstreamClient};
use relaypool_core::RedisStore;
use relaypool_types::{GatewayConfig, Platform};

use crate::repo::{InMemoryAccountRepo, InMemoryGroupRepo, ScheduleBanService};

#[derive(Clone)]
pub struct AppState {
    pub inner: Arc<AppStateInner>,
}

pub struct AppStateInner {
    pub dispatcher: Dispatcher,
    pub checker: MixedChannelChecker,
    pub accounts: Arc<InMemoryAccountRepo>,
    pub groups: Arc<InMemoryGroupRepo>,
    pub default_group_id: i64,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Periodic sweep of expired slot holds leaked by crashed tasks.
fn spawn_slot_watchdog(slots: Arc<RedisSlotCache>, accounts: Arc<InMemoryAccountRepo>) {
    tokio::spawn(async move {
        use relaypool_core::slots::ConcurrencyCache;
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
        loop {
            interval.tick().await;
            for account_id in accounts.all_ids() {
                if let Err(err) = slots.cleanup_expired(account_id).await {
                    tracing::debug!(account_id, error = %err, "slot sweep failed");
                }
            }
        }
    });
}

impl AppState {
    pub fn new(redis_url: &str) -> Result<Self> {
        let store = RedisStore::new(redis_url)?;
        let gateway: GatewayConfig = match std::env::var("RELAYPOOL_GATEWAY_CONFIG") {
            Ok(raw) => serde_json::from_str(&raw)?,
            Err(_) => GatewayConfig::default(),
        };

        let accounts = Arc::new(InMemoryAccountRepo::new());
        let groups = Arc::new(InMemoryGroupRepo::new());

        let http = reqwest::Client::new();
        let oauth = Arc::new(HttpOAuthClient::new(
            http.clone(),
            env_or("RELAYPOOL_OAUTH_TOKEN_URL", "https://oauth2.googleapis.com/token"),
            env_or("RELAYPOOL_ANTIGRAVITY_API_BASE", "https://cloudcode-pa.googleapis.com"),
            env_or("RELAYPOOL_OAUTH_CLIENT_ID", ""),
            env_or("RELAYPOOL_OAUTH_CLIENT_SECRET", ""),
        ));
        let tokens = Arc::new(TokenProvider::new(
            Arc::new(RedisTokenCache::new(store.clone())),
            accounts.clone(),
            oauth,
        ));

        let mut upstream_urls = HashMap::new();
        upstream_urls.insert(
            Platform::Anthropic,
            env_or("RELAYPOOL_ANTHROPIC_URL", "https://api.anthropic.com/v1/messages"),
        );
        upstream_urls.insert(
            Platform::Gemini,
            env_or(
                "RELAYPOOL_GEMINI_URL",
                "https://generativelanguage.googleapis.com/v1beta/models",
            ),
        );
        upstream_urls.insert(
            Platform::Antigravity,
            env_or(
                "RELAYPOOL_ANTIGRAVITY_URL",
                "https://cloudcode-pa.googleapis.com/v1internal:generateContent",
            ),
        );

        let slots = Arc::new(RedisSlotCache::new(store.clone(), gateway.slot_hold_secs));
        spawn_slot_watchdog(slots.clone(), accounts.clone());

        let dispatcher = Dispatcher::new(
            accounts.clone(),
            groups.clone(),
            Arc::new(RedisSessionStore::new(store.clone(), gateway.sticky_ttl_secs)),
            Arc::new(RedisLoadStore::new(store.clone())),
            slots,
            tokens,
            Arc::new(ReqwestUpstreamClient::new(http)),
            Arc::new(ScheduleBanService::new(accounts.clone())),
            DispatcherConfig { gateway, upstream_urls },
        );

        let checker = MixedChannelChecker::new(accounts.clone(), groups.clone());
        let default_group_id = std::env::var("RELAYPOOL_DEFAULT_GROUP")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);

        Ok(Self {
            inner: Arc::new(AppStateInner {
                dispatcher,
                checker,
                accounts,
                groups,
                default_group_id,
            }),
        })
    }
}
