//! Least-loaded backend selection.

use crate::registry::{ServerRegistry, ServerState};

/// Returns the healthy backend minimizing `score`, or `None` if no backend
/// is currently healthy. Takes a snapshot before comparing so the search
/// never holds the registry's internal locks and never sees a torn read.
///
/// `healthy_snapshot()` is walked in configured-backend order, and ties are
/// broken by first-encountered-wins (§4.4) — `Iterator::min_by_key` instead
/// returns the *last* minimum on a tie, so the fold below only replaces the
/// running best on a strictly lower score.
pub fn select_backend(registry: &ServerRegistry) -> Option<ServerState> {
    let healthy = registry.healthy_snapshot();
    let mut iter = healthy.into_iter();
    let first = iter.next()?;
    Some(iter.fold(first, |best, candidate| {
        if candidate.score() < best.score() {
            candidate
        } else {
            best
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendAddr;
    use crate::sidecar::MetricsDocument;

    fn backends() -> Vec<BackendAddr> {
        vec![
            BackendAddr { host: "a".into(), port: 11434 },
            BackendAddr { host: "b".into(), port: 11434 },
            BackendAddr { host: "c".into(), port: 11434 },
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
    fn s1_picks_least_loaded() {
        let registry = ServerRegistry::new(&backends(), 3);
        registry.update_metrics("a", 11434, &doc(5, 80)).unwrap();
        registry.update_metrics("b", 11434, &doc(1, 30)).unwrap();
        registry.update_metrics("c", 11434, &doc(3, 50)).unwrap();

        let selected = select_backend(&registry).unwrap();
        assert_eq!(selected.host, "b");
    }

    #[test]
    fn s6_weight_prefers_more_requests_over_util() {
        let registry = ServerRegistry::new(&backends(), 3);
        registry.update_metrics("a", 11434, &doc(0, 80)).unwrap();
        registry.update_metrics("b", 11434, &doc(1, 0)).unwrap();
        registry.update_metrics("c", 11434, &doc(2, 0)).unwrap();

        let selected = select_backend(&registry).unwrap();
        assert_eq!(selected.host, "b");
        assert_eq!(selected.score(), 10);
    }

    #[test]
    fn s2_s7_empty_healthy_set_returns_none() {
        let registry = ServerRegistry::new(&backends(), 3);
        for host in ["a", "b", "c"] {
            for _ in 0..3 {
                registry.mark_unhealthy(host, 11434).unwrap();
            }
        }
        assert!(select_backend(&registry).is_none());
    }

    #[test]
    fn s2_excludes_unhealthy_backend() {
        let registry = ServerRegistry::new(&backends(), 3);
        for _ in 0..3 {
            registry.mark_unhealthy("a", 11434).unwrap();
        }
        registry.update_metrics("b", 11434, &doc(10, 0)).unwrap();
        registry.update_metrics("c", 11434, &doc(1, 0)).unwrap();

        let selected = select_backend(&registry).unwrap();
        assert_ne!(selected.host, "a");
    }

    #[test]
    fn ties_broken_by_configured_order_first_wins() {
        let registry = ServerRegistry::new(&backends(), 3);
        registry.update_metrics("a", 11434, &doc(2, 0)).unwrap();
        registry.update_metrics("b", 11434, &doc(2, 0)).unwrap();
        registry.update_metrics("c", 11434, &doc(2, 0)).unwrap();

        // All three tie at score 20; "a" is first in configured order and
        // must win regardless of DashMap's internal iteration order.
        let selected = select_backend(&registry).unwrap();
        assert_eq!(selected.host, "a");
    }
}
