//! Reverse-proxy load balancer for a fleet of local LLM inference backends.
//!
//! Wires together the server registry, the two background pollers, the
//! selection policy, the transparent proxy, and the read-only admin
//! surface. See SPEC_FULL.md for the full contract.

mod admin;
mod config;
mod health_checker;
mod metrics_poller;
mod proxy;
mod registry;
mod selection;
mod sidecar;
mod state;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::sync::watch;

use config::Config;
use registry::ServerRegistry;
use state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    println!(
        "[ollama-lb] {} backend(s) configured: {}",
        config.backends.len(),
        config
            .backends
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let registry = Arc::new(ServerRegistry::new(&config.backends, config.unhealthy_threshold));
    let http = reqwest::Client::new();

    let state = Arc::new(AppState {
        registry: registry.clone(),
        http: http.clone(),
        config: config.clone(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let metrics_task = tokio::spawn(metrics_poller::run(
        registry.clone(),
        config.backends.clone(),
        config.clone(),
        http.clone(),
        shutdown_rx.clone(),
    ));
    let health_task = tokio::spawn(health_checker::run(
        registry.clone(),
        config.backends.clone(),
        config.clone(),
        http.clone(),
        shutdown_rx,
    ));

    let app = Router::new()
        .route("/health", get(admin::health))
        .route("/servers", get(admin::servers))
        .fallback(proxy::catch_all)
        .with_state(state);

    let bind_addr = format!("{}:{}", config.load_balancer_host, config.load_balancer_port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;

    println!("[ollama-lb] listening on http://{bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx))
        .await
        .context("server error")?;

    let _ = tokio::join!(metrics_task, health_task);

    Ok(())
}

/// Waits for Ctrl-C, then tells the background pollers to stop after their
/// current in-flight cycle. Axum's own graceful shutdown stops accepting new
/// connections and drains in-flight ones concurrently with this.
async fn shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let _ = tokio::signal::ctrl_c().await;
    println!("[ollama-lb] shutdown signal received");
    let _ = shutdown_tx.send(true);
}
