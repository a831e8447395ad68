//! relaypool-core: the request-time dispatch engine.
//!
//! Subsystems, in dependency order: rate-limit gating (in
//! `relaypool-types`), model-load accounting, sticky-session store,
//! credential provider, account scheduler, failover engine, and the
//! orchestrator that ties them together per incoming request.
//!
//! Shared state (sticky bindings, load counters, token cache, slot
//! counts) lives in Redis; every mutation is a single server-side
//! atomic operation or Lua script, so there is no client-side locking
//! beyond the token refresh lease.

pub mod admin;
pub mod dispatch;
pub mod failover;
pub mod load;
pub mod repo;
pub mod scheduler;
pub mod slots;
pub mod sticky;
pub mod token;
pub mod upstream;

mod redis_store;

pub use redis_store::{RedisStore, StoreError};

use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Sleep unless the request is canceled first. Returns `false` on
/// cancellation. Zero durations return immediately.
pub(crate) async fn sleep_with_cancel(cancel: &CancellationToken, duration: Duration) -> bool {
    if duration.is_zero() {
        return true;
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}
