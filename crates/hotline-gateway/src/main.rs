//! Hotline gateway: provider webhooks, the duplex call audio socket and static
//! serving of synthesized speech, wired to the per-call turn engine.

mod config;
mod ncco;
mod routes;
mod state;

use crate::config::{GatewayConfig, Secrets};
use crate::state::AppState;
use anyhow::Context;
use hotline_voice::CannedPhrase;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = GatewayConfig::load().context("loading configuration")?;
    let secrets = Secrets::from_env(&config).context("reading credentials")?;
    let addr = format!("{}:{}", config.host, config.port);
    let state = AppState::from_config(config, &secrets)?;

    let cached = state.tts().precache().await;
    if cached < CannedPhrase::ALL.len() {
        warn!(
            target: "hotline::gateway",
            "Only {}/{} canned phrases cached; missing ones fall back to provider speech",
            cached,
            CannedPhrase::ALL.len()
        );
    }

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(
        target: "hotline::gateway",
        "🎙️ Hotline listening on {} (public {})",
        addr,
        state.config.public_base_url
    );

    axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(target: "hotline::gateway", "Ctrl-C handler failed: {}", e);
    }
    info!(target: "hotline::gateway", "Shutting down");
}
