//! Resource Monitor: periodic sampler of host CPU/mem/disk/load/GPU.
//!
//! Mirrors the shape of a `MetricsCollector`: a `sysinfo`-backed struct that
//! is refreshed on a timer and handed out to observers as an independent
//! snapshot. GPU inventory is probed from three vendor tools in order
//! (NVIDIA, AMD, Intel-heuristic); a failing backend just leaves its GPU
//! list empty rather than failing the sample.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};
use tokio::sync::{watch, RwLock};
use tokio::time::interval;
use tracing::debug;

/// One GPU device as reported by whichever vendor backend found it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuInfo {
    pub name: String,
    #[serde(rename = "memoryBytes")]
    pub memory_bytes: u64,
    #[serde(rename = "utilizationPercent")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub utilization_percent: Option<f64>,
    #[serde(rename = "temperatureCelsius")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature_celsius: Option<f64>,
}

/// Independent copy of the monitor's last sample.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ResourceSnapshot {
    #[serde(rename = "cpuUsagePercent")]
    pub cpu_usage_percent: f64,
    #[serde(rename = "cpuCount")]
    pub cpu_count: u32,
    #[serde(rename = "memoryUsedBytes")]
    pub memory_used_bytes: u64,
    #[serde(rename = "memoryTotalBytes")]
    pub memory_total_bytes: u64,
    #[serde(rename = "diskUsedBytes")]
    pub disk_used_bytes: u64,
    #[serde(rename = "diskTotalBytes")]
    pub disk_total_bytes: u64,
    #[serde(rename = "loadAverage1")]
    pub load_average_1: f64,
    pub gpus: Vec<GpuInfo>,
    #[serde(rename = "requestCount")]
    pub request_count: u64,
    #[serde(rename = "activeRequests")]
    pub active_requests: u32,
    #[serde(rename = "avgLatencyMs")]
    pub avg_latency_ms: f64,
    #[serde(rename = "collectedAt")]
    pub collected_at: DateTime<Utc>,
}

type Observer = Box<dyn Fn(ResourceSnapshot) + Send + Sync>;

/// Per-node background sampler.
pub struct ResourceMonitor {
    inner: RwLock<Inner>,
    request_count: AtomicU64,
    active_requests: AtomicU32,
    total_latency_ms: AtomicU64,
    observer: RwLock<Option<Observer>>,
    interval: Duration,
}

struct Inner {
    system: System,
    disks: Disks,
    last: ResourceSnapshot,
}

impl ResourceMonitor {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_secs(5))
    }

    pub fn with_interval(interval: Duration) -> Self {
        Self {
            inner: RwLock::new(Inner {
                system: System::new_all(),
                disks: Disks::new_with_refreshed_list(),
                last: ResourceSnapshot::default(),
            }),
            request_count: AtomicU64::new(0),
            active_requests: AtomicU32::new(0),
            total_latency_ms: AtomicU64::new(0),
            observer: RwLock::new(None),
            interval,
        }
    }

    /// Register the single observer callback. It is always invoked with the
    /// monitor's lock released, on a defensive copy of the snapshot, so that
    /// an observer which calls back into the monitor (e.g. to sync the
    /// snapshot into node state) cannot deadlock against the sampler.
    pub async fn watch<F>(&self, callback: F)
    where
        F: Fn(ResourceSnapshot) + Send + Sync + 'static,
    {
        *self.observer.write().await = Some(Box::new(callback));
    }

    /// Take one sample now and return an independent copy.
    pub async fn sample(&self) -> ResourceSnapshot {
        let snapshot = {
            let mut inner = self.inner.write().await;
            inner.system.refresh_cpu_all();
            inner.system.refresh_memory();
            inner.disks.refresh(true);

            let cpu_usage_percent = inner.system.global_cpu_usage() as f64;
            let cpu_count = inner.system.cpus().len() as u32;
            let memory_total_bytes = inner.system.total_memory();
            let memory_used_bytes = inner.system.used_memory();

            let (disk_total_bytes, disk_used_bytes) = inner
                .disks
                .iter()
                .map(|d| (d.total_space(), d.total_space() - d.available_space()))
                .fold((0u64, 0u64), |(t, u), (dt, du)| (t + dt, u + du));

            let load_average_1 = System::load_average().one;

            let request_count = self.request_count.swap(0, Ordering::SeqCst);
            let active_requests = self.active_requests.load(Ordering::SeqCst);
            let total_latency = self.total_latency_ms.swap(0, Ordering::SeqCst);
            let avg_latency_ms = if request_count > 0 {
                total_latency as f64 / request_count as f64
            } else {
                0.0
            };

            let snapshot = ResourceSnapshot {
                cpu_usage_percent,
                cpu_count,
                memory_used_bytes,
                memory_total_bytes,
                disk_used_bytes,
                disk_total_bytes,
                load_average_1,
                gpus: probe_gpus().await,
                request_count,
                active_requests,
                avg_latency_ms,
                collected_at: Utc::now(),
            };

            inner.last = snapshot.clone();
            snapshot
        };

        if let Some(observer) = self.observer.read().await.as_ref() {
            observer(snapshot.clone());
        }

        snapshot
    }

    /// Return the most recent sample without forcing a new one.
    pub async fn snapshot(&self) -> ResourceSnapshot {
        self.inner.read().await.last.clone()
    }

    pub fn record_request_start(&self) {
        self.active_requests.fetch_add(1, Ordering::SeqCst);
    }

    pub fn record_request_end(&self, latency_ms: u64) {
        self.active_requests.fetch_sub(1, Ordering::SeqCst);
        self.request_count.fetch_add(1, Ordering::SeqCst);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::SeqCst);
    }

    /// Run the sampling loop until `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick = interval(self.interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.sample().await;
                    debug!("resource monitor sampled");
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }
}

impl Default for ResourceMonitor {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedResourceMonitor = Arc<ResourceMonitor>;

pub fn new_shared_monitor() -> SharedResourceMonitor {
    Arc::new(ResourceMonitor::new())
}

async fn probe_gpus() -> Vec<GpuInfo> {
    if let Some(gpus) = probe_nvidia().await {
        return gpus;
    }
    if let Some(gpus) = probe_amd().await {
        return gpus;
    }
    probe_intel_heuristic().await.unwrap_or_default()
}

async fn probe_nvidia() -> Option<Vec<GpuInfo>> {
    #[cfg(feature = "gpu")]
    {
        use nvml_wrapper::Nvml;
        if let Ok(nvml) = Nvml::init() {
            if let Ok(count) = nvml.device_count() {
                let mut gpus = Vec::new();
                for i in 0..count {
                    if let Ok(device) = nvml.device_by_index(i) {
                        let name = device.name().unwrap_or_else(|_| "nvidia-gpu".to_string());
                        let memory = device.memory_info().ok();
                        let utilization = device.utilization_rates().ok();
                        let temperature = device
                            .temperature(nvml_wrapper::enum_wrappers::device::TemperatureSensor::Gpu)
                            .ok();
                        gpus.push(GpuInfo {
                            name,
                            memory_bytes: memory.map(|m| m.total).unwrap_or(0),
                            utilization_percent: utilization.map(|u| u.gpu as f64),
                            temperature_celsius: temperature.map(|t| t as f64),
                        });
                    }
                }
                if !gpus.is_empty() {
                    return Some(gpus);
                }
            }
        }
    }

    // Fall back to shelling out to `nvidia-smi`, which works even when the
    // `gpu` feature (linking against libnvidia-ml) is disabled.
    let output = tokio::process::Command::new("nvidia-smi")
        .args([
            "--query-gpu=name,memory.total,utilization.gpu,temperature.gpu",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let gpus: Vec<GpuInfo> = text
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split(',').map(str::trim).collect();
            if fields.len() < 4 {
                return None;
            }
            Some(GpuInfo {
                name: fields[0].to_string(),
                memory_bytes: fields[1].parse::<u64>().ok()? * 1024 * 1024,
                utilization_percent: fields[2].parse::<f64>().ok(),
                temperature_celsius: fields[3].parse::<f64>().ok(),
            })
        })
        .collect();

    if gpus.is_empty() {
        None
    } else {
        Some(gpus)
    }
}

async fn probe_amd() -> Option<Vec<GpuInfo>> {
    let output = tokio::process::Command::new("rocm-smi")
        .args(["--showuse", "--showmeminfo", "vram", "--json"])
        .output()
        .await
        .ok()?;

    if !output.status.success() {
        return None;
    }

    let value: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
    let map = value.as_object()?;
    let mut gpus = Vec::new();
    for (key, entry) in map {
        if !key.starts_with("card") {
            continue;
        }
        let utilization = entry
            .get("GPU use (%)")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok());
        let memory_bytes = entry
            .get("VRAM Total Memory (B)")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        gpus.push(GpuInfo {
            name: key.clone(),
            memory_bytes,
            utilization_percent: utilization,
            temperature_celsius: None,
        });
    }

    if gpus.is_empty() {
        None
    } else {
        Some(gpus)
    }
}

/// Intel has no first-party CLI metrics tool comparable to `nvidia-smi` /
/// `rocm-smi`; this is a presence-only heuristic, not a utilization sampler.
async fn probe_intel_heuristic() -> Option<Vec<GpuInfo>> {
    let output = tokio::process::Command::new("lspci").output().await.ok()?;
    if !output.status.success() {
        return None;
    }

    let text = String::from_utf8_lossy(&output.stdout);
    let found = text
        .lines()
        .find(|line| line.contains("VGA") && line.to_lowercase().contains("intel"))?;

    Some(vec![GpuInfo {
        name: found.to_string(),
        memory_bytes: 0,
        utilization_percent: None,
        temperature_celsius: None,
    }])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sample_reports_nonnegative_usage() {
        let monitor = ResourceMonitor::new();
        let snapshot = monitor.sample().await;
        assert!(snapshot.cpu_usage_percent >= 0.0);
        assert!(snapshot.memory_total_bytes >= snapshot.memory_used_bytes || snapshot.memory_total_bytes == 0);
    }

    #[tokio::test]
    async fn request_tracking_resets_on_sample() {
        let monitor = ResourceMonitor::new();
        monitor.record_request_start();
        monitor.record_request_end(100);
        monitor.record_request_start();
        monitor.record_request_end(200);

        let snapshot = monitor.sample().await;
        assert_eq!(snapshot.request_count, 2);
        assert_eq!(snapshot.avg_latency_ms, 150.0);

        let second = monitor.sample().await;
        assert_eq!(second.request_count, 0);
    }

    #[tokio::test]
    async fn watch_is_invoked_without_holding_the_lock() {
        let monitor = Arc::new(ResourceMonitor::new());
        let seen = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen_clone = seen.clone();
        let monitor_clone = monitor.clone();

        monitor
            .watch(move |_snapshot| {
                seen_clone.store(true, Ordering::SeqCst);
                // Re-entrant call: would deadlock if invoked under the lock.
                let monitor_for_blocking = monitor_clone.clone();
                let _ = futures::executor::block_on(monitor_for_blocking.snapshot());
            })
            .await;

        monitor.sample().await;
        assert!(seen.load(Ordering::SeqCst));
    }
}
