//! Gateway configuration.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Skips billing checks.
    Simple,
    #[default]
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Failover budget: how many account switches a request may consume.
    #[serde(default = "default_max_account_switches")]
    pub max_account_switches: u32,
    /// Antigravity-only continuation past the switch budget; 0 disables.
    #[serde(default = "default_antigravity_extra_retries")]
    pub antigravity_extra_retries: u32,
    #[serde(default)]
    pub run_mode: RunMode,
    /// Sticky-session container TTL in seconds.
    #[serde(default = "default_sticky_ttl_secs")]
    pub sticky_ttl_secs: u64,
    /// Upper bound on waiting for a concurrency slot, in milliseconds.
    #[serde(default = "default_slot_wait_ms")]
    pub slot_wait_ms: u64,
    /// Expiry for an individual slot hold, reaped by the watchdog.
    #[serde(default = "default_slot_hold_secs")]
    pub slot_hold_secs: u64,
}

const fn default_max_account_switches() -> u32 {
    3
}

const fn default_antigravity_extra_retries() -> u32 {
    10
}

const fn default_sticky_ttl_secs() -> u64 {
    3600
}

const fn default_slot_wait_ms() -> u64 {
    3000
}

const fn default_slot_hold_secs() -> u64 {
    1800
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_account_switches: default_max_account_switches(),
            antigravity_extra_retries: default_antigravity_extra_retries(),
            run_mode: RunMode::default(),
            sticky_ttl_secs: default_sticky_ttl_secs(),
            slot_wait_ms: default_slot_wait_ms(),
            slot_hold_secs: default_slot_hold_secs(),
        }
    }
}
