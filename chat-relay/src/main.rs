// SPDX-FileCopyrightText: 2026 Mattia Egloff <mattia.egloff@pm.me>
//
// SPDX-License-Identifier: GPL-3.0-or-later

//! Chat Relay Server
//!
//! Accepts chat clients over WebSocket and relays their messages to the
//! backend service. Provides:
//! - WebSocket endpoint for clients, one backend connection per session
//! - HTTP endpoints for health checks and Prometheus metrics

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::{error, info};

use chat_relay::http::{create_router, HttpState};
use chat_relay::{RelayConfig, RelayMetrics, RelayServer, WsDialer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("chat_relay=info".parse()?),
        )
        .init();

    let config = RelayConfig::from_env()?;
    info!("Starting Chat Relay Server v{}", env!("CARGO_PKG_VERSION"));
    info!("WebSocket: {}", config.listen_addr);
    info!("HTTP (health/metrics): {}", config.http_addr);
    info!("Backend: {}", config.backend_url);

    let metrics = RelayMetrics::new().context("failed to register metrics")?;
    let dialer = Arc::new(WsDialer::new(config.backend_url.clone()));
    let server = RelayServer::bind(&config, dialer, metrics.clone()).await?;

    // Start HTTP server for health/metrics
    let http_router = create_router(HttpState {
        metrics,
        registry: server.registry(),
        start_time: server.start_time(),
        metrics_token: config.metrics_token.clone(),
    });
    let http_listener = TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {}", config.http_addr))?;
    let http_addr = config.http_addr;
    tokio::spawn(async move {
        info!("HTTP server listening on {}", http_addr);
        if let Err(e) = axum::serve(http_listener, http_router).await {
            error!("HTTP server failed: {}", e);
        }
    });

    let shutdown = server.shutdown_handle();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl-C, shutting down"),
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
        shutdown.shutdown();
    });

    server.run().await?;
    Ok(())
}
