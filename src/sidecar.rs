//! Wire types consumed from the GPU-monitor sidecar and the backend's own
//! `/api/tags` health surface. Both are opaque external collaborators; this
//! module only knows how to parse what they send back.

use serde::Deserialize;

/// Per-device telemetry, as reported inside a sidecar metrics document.
#[derive(Debug, Clone, Deserialize)]
pub struct GpuSampleDoc {
    pub index: u32,
    pub name: String,
    pub utilization: u32,
    pub memory_used_gb: f64,
    pub memory_total_gb: f64,
    pub temperature: i32,
}

/// `GET http://<host>-monitor:<port+1000>/metrics` response body.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsDocument {
    #[serde(default)]
    pub active_requests: u64,
    #[serde(default)]
    pub gpu_utilization: u32,
    #[serde(default)]
    pub gpu_memory_used_gb: f64,
    #[serde(default)]
    pub gpu_memory_total_gb: f64,
    #[serde(default)]
    pub gpu_temperature: i32,
    #[serde(default)]
    pub gpus: Vec<GpuSampleDoc>,
    #[serde(default)]
    pub gpu_count: Option<u32>,
}
