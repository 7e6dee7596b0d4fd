//! Background task that probes unhealthy backends directly and restores
//! them once they respond, subject to the recovery-delay cooldown.

use std::time::Duration;

use tokio::sync::watch;

use crate::config::{BackendAddr, Config};
use crate::registry::ServerRegistry;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Run the health checker until `shutdown` fires.
pub async fn run(
    registry: std::sync::Arc<ServerRegistry>,
    backends: Vec<BackendAddr>,
    config: Config,
    http: reqwest::Client,
    mut shutdown: watch::Receiver<bool>,
) {
    let recovery_delay = config.recovery_delay();

    loop {
        check_once(&registry, &backends, &http, recovery_delay).await;

        tokio::select! {
            _ = shutdown.changed() => {
                println!("[health] shutdown requested, stopping checker");
                break;
            }
            _ = tokio::time::sleep(config.health_check_interval()) => {}
        }
    }
}

async fn check_once(
    registry: &ServerRegistry,
    backends: &[BackendAddr],
    http: &reqwest::Client,
    recovery_delay: Duration,
) {
    let unhealthy: Vec<&BackendAddr> = {
        let snap = registry.snapshot_all();
        backends
            .iter()
            .filter(|b| snap.iter().any(|s| s.host == b.host && s.port == b.port && !s.is_healthy))
            .collect()
    };

    for backend in unhealthy {
        if !registry.due_for_probe(&backend.host, backend.port, recovery_delay) {
            continue;
        }

        let url = format!("http://{}:{}/api/tags", backend.host, backend.port);
        match probe(http, &url).await {
            Ok(true) => {
                if let Err(e) = registry.restore_via_probe(&backend.host, backend.port) {
                    eprintln!("[health] {e} (programming error, ignoring)");
                } else {
                    println!("[health] {}:{} recovered via direct probe", backend.host, backend.port);
                }
            }
            Ok(false) | Err(_) => {
                // No state change; the next pass retries after recovery_delay.
            }
        }
    }
}

async fn probe(http: &reqwest::Client, url: &str) -> Result<bool, reqwest::Error> {
    let resp = http.get(url).timeout(PROBE_TIMEOUT).send().await?;
    Ok(resp.status().is_success())
}
