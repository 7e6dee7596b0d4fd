//! Background task that periodically pulls each sidecar's metrics document
//! and folds it into the registry, marking unreachable sidecars as failing.

use std::time::Duration;

use tokio::sync::watch;

use crate::config::{BackendAddr, Config};
use crate::registry::ServerRegistry;
use crate::sidecar::MetricsDocument;

const SIDECAR_TIMEOUT: Duration = Duration::from_secs(5);

/// Run the metrics poller until `shutdown` fires. Cycles do not overlap:
/// the sleep between passes only starts once a full pass over every
/// configured backend has completed.
pub async fn run(
    registry: std::sync::Arc<ServerRegistry>,
    backends: Vec<BackendAddr>,
    config: Config,
    http: reqwest::Client,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        poll_once(&registry, &backends, &http).await;

        tokio::select! {
            _ = shutdown.changed() => {
                println!("[metrics] shutdown requested, stopping poller");
                break;
            }
            _ = tokio::time::sleep(config.metrics_interval()) => {}
        }
    }
}

async fn poll_once(registry: &ServerRegistry, backends: &[BackendAddr], http: &reqwest::Client) {
    for backend in backends {
        let (sidecar_host, sidecar_port) = Config::sidecar_addr(&backend.host, backend.port);
        let url = format!("http://{sidecar_host}:{sidecar_port}/metrics");

        let outcome = fetch_metrics(http, &url).await;
        match outcome {
            Ok(doc) => {
                if let Err(e) = registry.update_metrics(&backend.host, backend.port, &doc) {
                    eprintln!("[metrics] {e} (programming error, ignoring)");
                }
            }
            Err(reason) => {
                eprintln!(
                    "[metrics] {}:{} sidecar poll failed: {reason}",
                    backend.host, backend.port
                );
                if let Err(e) = registry.mark_unhealthy(&backend.host, backend.port) {
                    eprintln!("[metrics] {e} (programming error, ignoring)");
                }
            }
        }
    }
}

async fn fetch_metrics(http: &reqwest::Client, url: &str) -> Result<MetricsDocument, String> {
    let resp = http
        .get(url)
        .timeout(SIDECAR_TIMEOUT)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if !resp.status().is_success() {
        return Err(format!("non-2xx status {}", resp.status()));
    }

    resp.json::<MetricsDocument>()
        .await
        .map_err(|e| format!("unparseable body: {e}"))
}
