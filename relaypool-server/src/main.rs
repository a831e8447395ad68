//! relaypool-server: headless gateway daemon.
//!
//! Fronts several upstream LLM providers behind a unified inference
//! endpoint: picks an upstream account per request, fails over on
//! transient upstream errors, and keeps conversations sticky to the
//! account that served their earlier turns.

use anyhow::Result;
use std::net::SocketAddr;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod api;
mod repo;
mod router;
mod state;

use state::AppState;

const DEFAULT_PORT: u16 = 8041;

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let port: u16 = std::env::var("RELAYPOOL_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    let redis_url =
        std::env::var("RELAYPOOL_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".to_string());

    info!("relaypool server starting on port {port}");

    let state = AppState::new(&redis_url)?;
    let app = router::build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on http://{addr}");
    info!("inference endpoints at /v1/messages, /v1/models/{{model}}:generateContent");
    info!("admin API at /api/v1/admin/");

    axum::serve(listener, app).await?;
    Ok(())
}
