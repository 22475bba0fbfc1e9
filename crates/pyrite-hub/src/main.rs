use anyhow::{bail, Context, Result};
use clap::Parser;
use pyrite_hub::{logging::init_logging, router, AppState, Args, Config, Hub, HubConfig, Registry, StateCache};
use std::{net::SocketAddr, sync::Arc};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::resolve(Args::parse())?;
    if let Some(path) = init_logging(config.debug, &config.log_dir) {
        info!(event = "log_file", path = %path.display());
    }

    let addr: SocketAddr = config
        .addr
        .parse()
        .with_context(|| format!("invalid listen address {}", config.addr))?;
    if !addr.ip().is_loopback() && !config.allow_remote {
        error!(event = "invalid_addr", addr = %config.addr);
        bail!("refusing to listen on non-loopback {addr} without --allow-remote");
    }

    let cache = Arc::new(StateCache::new());
    let hub = Arc::new(Hub::new(HubConfig::from(&config), cache));
    hub.clone().start_stale_reaper();
    let registry = Registry::new(hub.clone(), config.watch);

    for spec in config.repositories.clone() {
        let name = spec.name.clone();
        match registry.watch(spec).await {
            Ok(outcome) => info!(event = "initial_cycle", repository = %name, outcome = ?outcome),
            Err(err) => warn!(event = "watch_failed", repository = %name, error = %err),
        }
    }

    let app = router(AppState {
        registry,
        hub,
        allow_remote: config.allow_remote,
    });
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(event = "hub_start", addr = %addr, repositories = config.repositories.len());

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!(event = "hub_shutdown");
    };
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("hub server failed")?;
    Ok(())
}
