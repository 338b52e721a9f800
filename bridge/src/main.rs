use std::sync::Arc;

use bridge_core::config::Config;
use bridge_core::store::Store;
use bridge_core::{ServeConfig, serve};
use clap::Parser;
use tokio_util::sync::CancellationToken;

use args::Args;

mod args;
mod logger;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    apply_overrides(&mut config, &args);
    let log_filter = args.log_level.clone().unwrap_or_else(|| config.log_level.clone());

    logger::init(&log_filter);
    config.validate()?;

    log::info!("starting in {:?} mode", config.mode);

    let shutdown = CancellationToken::new();
    let shutdown_on_signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        shutdown_on_signal.cancel();
    });

    let store = Arc::new(Store::new(config.store_capacity));
    let bind_address = config.bind_address.clone();

    serve(ServeConfig { bind_address, config, store, shutdown }).await
}

/// Resolves on `SIGINT` or `SIGTERM`, whichever comes first.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => log::info!("received SIGINT, shutting down"),
        _ = terminate => log::info!("received SIGTERM, shutting down"),
    }
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if args.host.is_some() || args.port.is_some() {
        let (current_host, current_port) = config
            .bind_address
            .rsplit_once(':')
            .map(|(host, port)| (host.to_string(), port.to_string()))
            .unwrap_or_else(|| ("127.0.0.1".to_string(), "8085".to_string()));

        let host = args.host.clone().unwrap_or(current_host);
        let port = args.port.map(|p| p.to_string()).unwrap_or(current_port);
        config.bind_address = format!("{host}:{port}");
    }

    if let Some(url) = &args.anthropic_base_url {
        config.anthropic_base_url = url.clone();
    }
    if let Some(url) = &args.openrouter_base_url {
        config.openrouter_base_url = url.clone();
    }
    if let Some(secs) = args.request_timeout {
        config.request_timeout_secs = secs;
    }
}
