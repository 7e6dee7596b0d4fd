//! Canonical, concurrent-safe map of backend identity -> live metrics + health state.
//!
//! Shared by the proxy hot path and the two background pollers. The key set is
//! fixed at construction from the configured backend list and never grows or
//! shrinks for the lifetime of the process.

use std::time::Instant;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;

use crate::config::BackendAddr;
use crate::sidecar::MetricsDocument;

/// A single GPU's telemetry, as reported by the sidecar.
#[derive(Debug, Clone, Serialize)]
pub struct GpuSample {
    pub index: u32,
    pub name: String,
    pub utilization: u32,
    pub memory_used_gb: f64,
    pub memory_total_gb: f64,
    pub temperature: i32,
}

/// Live state for a single backend: identity, aggregate telemetry, and health.
#[derive(Debug, Clone, Serialize)]
pub struct ServerState {
    pub host: String,
    pub port: u16,

    pub active_requests: u64,
    pub gpu_utilization: u32,
    pub gpu_memory_used_gb: f64,
    pub gpu_memory_total_gb: f64,
    pub gpu_temperature: i32,
    pub gpus: Vec<GpuSample>,
    pub gpu_count: u32,

    pub is_healthy: bool,
    pub consecutive_failures: u32,
    #[serde(skip)]
    pub last_check: Option<Instant>,
    pub last_check_at: Option<DateTime<Utc>>,
}

impl ServerState {
    fn new(host: String, port: u16) -> Self {
        Self {
            host,
            port,
            active_requests: 0,
            gpu_utilization: 0,
            gpu_memory_used_gb: 0.0,
            gpu_memory_total_gb: 0.0,
            gpu_temperature: 0,
            gpus: Vec::new(),
            gpu_count: 0,
            is_healthy: true,
            consecutive_failures: 0,
            last_check: None,
            last_check_at: None,
        }
    }

    /// `active_requests * 10 + gpu_utilization` — lower is better.
    pub fn score(&self) -> u64 {
        self.active_requests * 10 + self.gpu_utilization as u64
    }

    /// The GPU with the lowest utilization, if any samples are present.
    /// Ties broken by lowest index. Carried over from the original
    /// implementation's test suite; surfaced on the admin snapshot, not
    /// used by selection scoring.
    pub fn least_loaded_gpu(&self) -> Option<&GpuSample> {
        self.gpus
            .iter()
            .min_by_key(|g| (g.utilization, g.index))
    }

    /// Aggregate free GPU memory in GiB, from the aggregate fields (not a
    /// re-sum of per-GPU entries, since the aggregate is authoritative).
    pub fn available_gpu_capacity_gb(&self) -> f64 {
        self.gpu_memory_total_gb - self.gpu_memory_used_gb
    }
}

/// A registry operation named a backend that was never configured. In
/// practice every writer is fed from the configured server list, so this is
/// a programming error rather than something that should ever be hit at
/// runtime.
#[derive(Debug, Error)]
#[error("unknown backend {host}:{port}")]
pub struct RegistryError {
    pub host: String,
    pub port: u16,
}

/// The process-wide server registry. Owned by a top-level coordinator and
/// handed to handlers/background tasks by reference (behind an `Arc`), not
/// an ambient singleton.
#[derive(Debug)]
pub struct ServerRegistry {
    entries: DashMap<String, ServerState>,
    /// Configured-backend insertion order. `DashMap::iter()` has no ordering
    /// guarantee (shard/hash based), but §4.4's tie-break ("first encountered
    /// wins") needs a stable, configured order — this mirrors the original's
    /// insertion-ordered `dict`. Snapshots walk this list and look each key
    /// up, rather than iterating the map directly.
    order: Vec<String>,
    unhealthy_threshold: u32,
}

fn key_for(host: &str, port: u16) -> String {
    format!("{host}:{port}")
}

impl ServerRegistry {
    /// Build the registry from the configured backend list. Entries start
    /// healthy with zeroed telemetry. This key set never grows or shrinks.
    pub fn new(backends: &[BackendAddr], unhealthy_threshold: u32) -> Self {
        let entries = DashMap::new();
        let mut order = Vec::with_capacity(backends.len());
        for b in backends {
            let key = key_for(&b.host, b.port);
            entries.insert(key.clone(), ServerState::new(b.host.clone(), b.port));
            order.push(key);
        }
        Self {
            entries,
            order,
            unhealthy_threshold,
        }
    }

    /// Merge a sidecar metrics document into the named entry. Restores
    /// health and zeroes `consecutive_failures` on success. Silently
    /// returns `RegistryError` (not panicking) if the key is unconfigured.
    pub fn update_metrics(
        &self,
        host: &str,
        port: u16,
        doc: &MetricsDocument,
    ) -> Result<(), RegistryError> {
        let key = key_for(host, port);
        let mut entry = self
            .entries
            .get_mut(&key)
            .ok_or_else(|| RegistryError {
                host: host.to_string(),
                port,
            })?;

        entry.active_requests = doc.active_requests;
        entry.gpu_utilization = doc.gpu_utilization;
        entry.gpu_memory_used_gb = doc.gpu_memory_used_gb;
        entry.gpu_memory_total_gb = doc.gpu_memory_total_gb;
        entry.gpu_temperature = doc.gpu_temperature;
        entry.gpus = doc
            .gpus
            .iter()
            .map(|g| GpuSample {
                index: g.index,
                name: g.name.clone(),
                utilization: g.utilization,
                memory_used_gb: g.memory_used_gb,
                memory_total_gb: g.memory_total_gb,
                temperature: g.temperature,
            })
            .collect();
        entry.gpu_count = doc.gpu_count.unwrap_or(entry.gpus.len() as u32);

        let now = Instant::now();
        entry.last_check = Some(now);
        entry.last_check_at = Some(Utc::now());
        entry.is_healthy = true;
        entry.consecutive_failures = 0;

        Ok(())
    }

    /// Record a failed sidecar poll or dispatch. Trips `is_healthy` to
    /// false once `consecutive_failures` reaches the configured threshold.
    /// Telemetry is left untouched.
    pub fn mark_unhealthy(&self, host: &str, port: u16) -> Result<(), RegistryError> {
        let key = key_for(host, port);
        let mut entry = self
            .entries
            .get_mut(&key)
            .ok_or_else(|| RegistryError {
                host: host.to_string(),
                port,
            })?;

        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.unhealthy_threshold {
            entry.is_healthy = false;
        }

        Ok(())
    }

    /// Restore health via a successful direct `/api/tags` probe, without
    /// touching telemetry or `last_check` (only the metrics poller advances
    /// that timestamp — see the health checker's recovery-delay anchor).
    pub fn restore_via_probe(&self, host: &str, port: u16) -> Result<(), RegistryError> {
        let key = key_for(host, port);
        let mut entry = self
            .entries
            .get_mut(&key)
            .ok_or_else(|| RegistryError {
                host: host.to_string(),
                port,
            })?;

        entry.is_healthy = true;
        entry.consecutive_failures = 0;

        Ok(())
    }

    pub fn increment_requests(&self, host: &str, port: u16) -> Result<(), RegistryError> {
        let key = key_for(host, port);
        let mut entry = self
            .entries
            .get_mut(&key)
            .ok_or_else(|| RegistryError {
                host: host.to_string(),
                port,
            })?;
        entry.active_requests += 1;
        Ok(())
    }

    /// Saturates at 0 — never goes negative.
    pub fn decrement_requests(&self, host: &str, port: u16) -> Result<(), RegistryError> {
        let key = key_for(host, port);
        let mut entry = self
            .entries
            .get_mut(&key)
            .ok_or_else(|| RegistryError {
                host: host.to_string(),
                port,
            })?;
        entry.active_requests = entry.active_requests.saturating_sub(1);
        Ok(())
    }

    /// Point-in-time copy of every healthy entry, safe to iterate without
    /// holding any registry-internal lock. Walked in configured-backend
    /// order so a downstream tie-break over scores is deterministic rather
    /// than dependent on `DashMap`'s shard layout.
    pub fn healthy_snapshot(&self) -> Vec<ServerState> {
        self.order
            .iter()
            .filter_map(|key| self.entries.get(key))
            .filter(|e| e.is_healthy)
            .map(|e| e.value().clone())
            .collect()
    }

    /// Point-in-time copy of every entry, for the admin surface. Same
    /// configured-backend order as `healthy_snapshot`.
    pub fn snapshot_all(&self) -> Vec<ServerState> {
        self.order
            .iter()
            .filter_map(|key| self.entries.get(key))
            .map(|e| e.value().clone())
            .collect()
    }

    /// Whether `last_check` is present and at least `delay` has elapsed
    /// since it. Used by the health checker to gate direct probing.
    pub fn due_for_probe(&self, host: &str, port: u16, delay: std::time::Duration) -> bool {
        let key = key_for(host, port);
        match self.entries.get(&key) {
            Some(entry) => match entry.last_check {
                Some(last) => last.elapsed() >= delay,
                None => false,
            },
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backends() -> Vec<BackendAddr> {
        vec![
            BackendAddr {
                host: "a".into(),
                port: 11434,
            },
            BackendAddr {
                host: "b".into(),
                port: 11434,
            },
            BackendAddr {
                host: "c".into(),
                port: 11434,
            },
        ]
    }

    fn doc(active_requests: u64, gpu_utilization: u32) -> MetricsDocument {
        MetricsDocument {
            active_requests,
            gpu_utilization,
            gpu_memory_used_gb: 0.0,
            gpu_memory_total_gb: 0.0,
            gpu_temperature: 0,
            gpus: Vec::new(),
            gpu_count: None,
        }
    }

    #[test]
    fn key_set_fixed_at_construction() {
        let registry = ServerRegistry::new(&backends(), 3);
        assert_eq!(registry.snapshot_all().len(), 3);
    }

    #[test]
    fn snapshots_preserve_configured_order() {
        let registry = ServerRegistry::new(&backends(), 3);
        let hosts: Vec<String> = registry.snapshot_all().into_iter().map(|s| s.host).collect();
        assert_eq!(hosts, vec!["a", "b", "c"]);

        let hosts: Vec<String> = registry.healthy_snapshot().into_iter().map(|s| s.host).collect();
        assert_eq!(hosts, vec!["a", "b", "c"]);
    }

    #[test]
    fn update_metrics_restores_health() {
        let registry = ServerRegistry::new(&backends(), 3);
        registry.mark_unhealthy("a", 11434).unwrap();
        registry.mark_unhealthy("a", 11434).unwrap();
        registry.mark_unhealthy("a", 11434).unwrap();

        let snap = registry.healthy_snapshot();
        assert!(!snap.iter().any(|s| s.host == "a"));

        registry.update_metrics("a", 11434, &doc(0, 0)).unwrap();
        let snap = registry.healthy_snapshot();
        assert!(snap.iter().any(|s| s.host == "a"));
    }

    #[test]
    fn unknown_backend_is_an_error() {
        let registry = ServerRegistry::new(&backends(), 3);
        let err = registry.increment_requests("ghost", 1).unwrap_err();
        assert_eq!(err.host, "ghost");
    }

    #[test]
    fn decrement_saturates_at_zero() {
        let registry = ServerRegistry::new(&backends(), 3);
        registry.decrement_requests("a", 11434).unwrap();
        let snap = registry.snapshot_all();
        let a = snap.iter().find(|s| s.host == "a").unwrap();
        assert_eq!(a.active_requests, 0);
    }

    #[test]
    fn increment_decrement_net_zero_under_interleaving() {
        let registry = ServerRegistry::new(&backends(), 3);
        let ops = [1, 1, -1, 1, -1, -1, 1, -1];
        for op in ops {
            if op == 1 {
                registry.increment_requests("a", 11434).unwrap();
            } else {
                registry.decrement_requests("a", 11434).unwrap();
            }
            let snap = registry.snapshot_all();
            let a = snap.iter().find(|s| s.host == "a").unwrap();
            assert!(a.active_requests <= 1_000_000);
        }
        let snap = registry.snapshot_all();
        let a = snap.iter().find(|s| s.host == "a").unwrap();
        assert_eq!(a.active_requests, 0);
    }

    #[test]
    fn least_loaded_gpu_picks_lowest_utilization() {
        let registry = ServerRegistry::new(&backends(), 3);
        let mut d = doc(3, 60);
        d.gpus = vec![
            crate::sidecar::GpuSampleDoc {
                index: 0,
                name: "RTX 4090".into(),
                utilization: 80,
                memory_used_gb: 20.0,
                memory_total_gb: 24.0,
                temperature: 70,
            },
            crate::sidecar::GpuSampleDoc {
                index: 1,
                name: "RTX 4090".into(),
                utilization: 40,
                memory_used_gb: 10.0,
                memory_total_gb: 24.0,
                temperature: 65,
            },
        ];
        registry.update_metrics("a", 11434, &d).unwrap();

        let snap = registry.snapshot_all();
        let a = snap.iter().find(|s| s.host == "a").unwrap();
        let least = a.least_loaded_gpu().unwrap();
        assert_eq!(least.index, 1);
        assert_eq!(least.utilization, 40);
    }

    #[test]
    fn available_gpu_capacity_uses_aggregate_fields() {
        let registry = ServerRegistry::new(&backends(), 3);
        let mut d = doc(0, 60);
        d.gpu_memory_used_gb = 30.0;
        d.gpu_memory_total_gb = 48.0;
        registry.update_metrics("a", 11434, &d).unwrap();

        let snap = registry.snapshot_all();
        let a = snap.iter().find(|s| s.host == "a").unwrap();
        assert_eq!(a.available_gpu_capacity_gb(), 18.0);
    }
}
