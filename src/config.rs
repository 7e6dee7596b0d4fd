//! Startup configuration: host/port to bind, the configured backend fleet,
//! and the interval/threshold knobs from the spec's configuration table.
//!
//! This is deliberately not a file-format config loader (TOML/YAML,
//! hierarchical merge, hot reload) — the process takes its configuration
//! from CLI flags with environment-variable fallbacks and compiled-in
//! defaults, and that's it.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;

/// A backend's `(host, port)` identity, as given on the command line in
/// `host:port` form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendAddr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for BackendAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for BackendAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("expected host:port, got {s:?}"))?;
        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid port in {s:?}"))?;
        if host.is_empty() {
            return Err(format!("empty host in {s:?}"));
        }
        Ok(BackendAddr {
            host: host.to_string(),
            port,
        })
    }
}

/// Load balancer configuration, §6.4 of the spec.
#[derive(Debug, Clone, Parser)]
#[command(name = "ollama-lb", about = "Least-loaded reverse proxy for a fleet of local inference backends")]
pub struct Config {
    /// Address the load balancer itself listens on.
    #[arg(long, env = "LB_HOST", default_value = "0.0.0.0")]
    pub load_balancer_host: String,

    /// Port the load balancer itself listens on.
    #[arg(long, env = "LB_PORT", default_value_t = 11434)]
    pub load_balancer_port: u16,

    /// Backend fleet, repeatable or comma-separated as `host:port`.
    #[arg(
        long = "backend",
        env = "LB_BACKENDS",
        value_delimiter = ',',
        default_value = "ollama-1:11434,ollama-2:11434,ollama-3:11434"
    )]
    pub backends: Vec<BackendAddr>,

    /// Seconds between metrics-poller passes over the fleet.
    #[arg(long, env = "LB_METRICS_INTERVAL", default_value_t = 2)]
    pub metrics_interval: u64,

    /// Seconds between health-checker passes over unhealthy backends.
    #[arg(long, env = "LB_HEALTH_CHECK_INTERVAL", default_value_t = 5)]
    pub health_check_interval: u64,

    /// Total per-request timeout, in seconds, for proxied dispatches.
    #[arg(long, env = "LB_REQUEST_TIMEOUT", default_value_t = 300)]
    pub request_timeout: u64,

    /// Consecutive failures before a backend is excluded from selection.
    #[arg(long, env = "LB_UNHEALTHY_THRESHOLD", default_value_t = 3)]
    pub unhealthy_threshold: u32,

    /// Minimum seconds after `last_check` before direct health probing
    /// resumes on an unhealthy backend.
    #[arg(long, env = "LB_RECOVERY_DELAY", default_value_t = 30)]
    pub recovery_delay: u64,
}

impl Config {
    pub fn metrics_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_interval)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn recovery_delay(&self) -> Duration {
        Duration::from_secs(self.recovery_delay)
    }

    /// `<host>-monitor:<port+1000>`, per the sidecar deployment convention.
    pub fn sidecar_addr(host: &str, port: u16) -> (String, u16) {
        (format!("{host}-monitor"), port + 1000)
    }
}
