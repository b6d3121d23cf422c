use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use roomchat_server::config::{Backend, ServerConfig};
use roomchat_server::engine::bans::{BanStore, InMemoryBanStore};
use roomchat_server::engine::hub::ChatHub;
use roomchat_server::engine::redis_backend::{RedisBanStore, RedisBroker};
use roomchat_server::engine::relay::{Broker, InMemoryBroker};
use roomchat_server::web::app_state::AppState;
use roomchat_server::web::rate_limit::{BUCKET_SWEEP_INTERVAL, STALE_BUCKET_AGE};
use roomchat_server::web::router::build_router;

#[derive(Parser)]
#[command(version, about = "Room-scoped realtime chat and presence server")]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "roomchat.toml")]
    config: String,

    /// Overrides `server.web_address`.
    #[arg(long)]
    web_address: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ServerConfig::load(&cli.config)?;
    if let Some(addr) = cli.web_address {
        config.server.web_address = addr;
    }

    let broker: Arc<dyn Broker> = match config.relay.backend {
        Backend::Memory => Arc::new(InMemoryBroker::new()),
        Backend::Redis => Arc::new(
            RedisBroker::open(&config.relay.redis_url).context("invalid relay redis url")?,
        ),
    };
    let bans: Arc<dyn BanStore> = match config.bans.backend {
        Backend::Memory => Arc::new(InMemoryBanStore::new()),
        Backend::Redis => Arc::new(
            RedisBanStore::open(&config.bans.redis_url).context("invalid ban redis url")?,
        ),
    };

    let hub = Arc::new(ChatHub::new(config.hub_settings(), broker, bans));
    let cancel = CancellationToken::new();
    let mut background = hub.start(&cancel);

    let web_addr = config.server.web_address.clone();
    info!(
        relay = ?config.relay.backend,
        bans = ?config.bans.backend,
        "Roomchat server starting on {}",
        web_addr
    );

    let state = Arc::new(AppState::new(hub.clone(), config).context("invalid profanity word list")?);
    let limiters = state.rate_limiters.clone();
    let limiter_cancel = cancel.child_token();
    background.push(tokio::spawn(async move {
        limiters
            .run_cleanup(BUCKET_SWEEP_INTERVAL, STALE_BUCKET_AGE, limiter_cancel)
            .await
    }));

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&web_addr)
        .await
        .with_context(|| format!("failed to bind web listener on {web_addr}"))?;

    let shutdown = cancel.clone();
    let closing_hub = hub.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        shutdown_signal().await;
        // Close sockets first so open connections don't hold the server up.
        closing_hub.shutdown();
        shutdown.cancel();
    })
    .await
    .context("server error")?;

    cancel.cancel();
    for task in background {
        let _ = task.await;
    }
    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
