//! claude-bridge - runs the bridge between the desktop app and claude.ai
//!
//! Launches Chromium with a persistent profile, watches its pages for
//! Claude tabs and keeps a reconnecting WebSocket to the desktop app.

use std::sync::Arc;

use anyhow::{Context, Result};
use claude_bridge_core::{default_home, BackgroundService, BridgeConfig, CdpTabHost};
use tokio::sync::mpsc;
use tracing::{error, info};

fn log_filter() -> tracing_subscriber::EnvFilter {
    let level = if let Ok(v) = std::env::var("RUST_LOG") {
        v
    } else if let Ok(v) = std::env::var("CLAUDE_BRIDGE_LOG_LEVEL") {
        match v.as_str() {
            "silent" => "off".to_string(),
            "fatal" => "error".to_string(),
            other => other.to_string(),
        }
    } else {
        "info".to_string()
    };

    tracing_subscriber::EnvFilter::try_new(level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let home = default_home();
    std::fs::create_dir_all(&home).ok();

    // stderr + daily rotated file
    let log_dir = home.join("logs");
    std::fs::create_dir_all(&log_dir).ok();
    let file_appender = tracing_appender::rolling::daily(&log_dir, "bridge.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    tracing_subscriber::registry()
        .with(log_filter())
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false),
        )
        .init();

    std::panic::set_hook(Box::new(|info| {
        let payload = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_default();
        eprintln!("PANIC at {}: {}", location, payload);
        tracing::error!(location = %location, "BRIDGE PANIC: {}", payload);
    }));

    let config = Arc::new(BridgeConfig::load(&BridgeConfig::default_path()));

    let (runtime_tx, runtime_rx) = mpsc::channel(64);
    let (tab_tx, tab_rx) = mpsc::channel(16);

    let host = CdpTabHost::launch(config.clone(), runtime_tx)
        .await
        .context("Failed to launch browser")?;
    let scan = host.watch(tab_tx).await;

    let service = BackgroundService::spawn(config.clone(), host.clone(), runtime_rx, tab_rx);
    info!(ports = ?config.connection.ports, "Claude bridge running, press Ctrl+C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl+C");
    }

    info!("Shutting down");
    service.shutdown().await;
    scan.abort();
    host.close().await;
    Ok(())
}
