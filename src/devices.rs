//! Device adapters and the snapshot registry.
//!
//! Adapters are registered at compile time: the config's device table names
//! each instance and its kind, and [`DeviceRegistry::from_specs`] builds the
//! table from an explicit constructor match. The registry caches the last
//! snapshot per device with a short TTL so admission checks stay cheap under
//! load. A failing adapter reports offline and never disturbs the others.

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::config::DeviceSpec;

/// Point-in-time view of one device.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    /// Device class, e.g. "gpu" or "cpu"
    pub kind: String,
    /// Memory class, e.g. "vram" or "ram"
    pub memory_kind: String,
    pub total_mb: u64,
    pub free_mb: u64,
    pub used_mb: u64,
    pub util_percent: f64,
    pub temperature: Option<f64>,
}

/// One device instance.
///
/// `probe` returns `None` when the device is offline or the probe failed;
/// the registry treats both identically.
#[async_trait]
pub trait DeviceAdapter: Send + Sync {
    fn id(&self) -> &str;
    async fn probe(&self) -> Option<DeviceSnapshot>;
}

struct CacheEntry {
    at: Instant,
    snapshot: Option<DeviceSnapshot>,
}

/// Registry over all configured device adapters with TTL snapshot caching.
pub struct DeviceRegistry {
    adapters: Vec<Arc<dyn DeviceAdapter>>,
    ttl: Duration,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl DeviceRegistry {
    /// Build the registry from the config's device table.
    pub fn from_specs(specs: &[DeviceSpec], ttl: Duration) -> Result<Self> {
        let mut adapters: Vec<Arc<dyn DeviceAdapter>> = Vec::with_capacity(specs.len());
        let mut seen = BTreeSet::new();

        for spec in specs {
            if !seen.insert(spec.id.clone()) {
                bail!("duplicate device id '{}'", spec.id);
            }
            let adapter: Arc<dyn DeviceAdapter> = match spec.kind.as_str() {
                "nvidia-smi" => Arc::new(NvidiaSmiDevice::new(
                    spec.id.clone(),
                    spec.match_name.clone().unwrap_or_else(|| spec.id.clone()),
                )),
                "cpu" => Arc::new(CpuDevice::new(spec.id.clone())),
                "static" => Arc::new(StaticDevice::new(
                    spec.id.clone(),
                    spec.total_mb.unwrap_or(0),
                )),
                other => bail!("device '{}': unknown adapter kind '{}'", spec.id, other),
            };
            adapters.push(adapter);
        }

        Ok(Self::with_adapters(adapters, ttl))
    }

    /// Build a registry directly from adapter instances.
    pub fn with_adapters(adapters: Vec<Arc<dyn DeviceAdapter>>, ttl: Duration) -> Self {
        Self {
            adapters,
            ttl,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// All registered device ids.
    pub fn ids(&self) -> BTreeSet<String> {
        self.adapters.iter().map(|a| a.id().to_string()).collect()
    }

    fn adapter(&self, id: &str) -> Option<&Arc<dyn DeviceAdapter>> {
        self.adapters.iter().find(|a| a.id() == id)
    }

    /// Cached snapshot for one device, re-probing when the TTL has expired.
    pub async fn snapshot(&self, id: &str) -> Option<DeviceSnapshot> {
        let adapter = self.adapter(id)?;

        {
            let cache = self.cache.lock().await;
            if let Some(entry) = cache.get(id) {
                if entry.at.elapsed() < self.ttl {
                    return entry.snapshot.clone();
                }
            }
        }

        // Probe outside the lock so a slow adapter never stalls the others.
        let snapshot = adapter.probe().await;
        if snapshot.is_none() {
            debug!(device = %id, "device probe reported offline");
        }

        let mut cache = self.cache.lock().await;
        cache.insert(
            id.to_string(),
            CacheEntry {
                at: Instant::now(),
                snapshot: snapshot.clone(),
            },
        );
        snapshot
    }

    pub async fn online(&self, id: &str) -> bool {
        self.snapshot(id).await.is_some()
    }

    /// Ids of all currently online devices.
    pub async fn online_set(&self) -> BTreeSet<String> {
        let mut online = BTreeSet::new();
        for adapter in &self.adapters {
            if self.online(adapter.id()).await {
                online.insert(adapter.id().to_string());
            }
        }
        online
    }

    /// Drop all cached snapshots so the next read re-probes.
    pub async fn refresh(&self) {
        self.cache.lock().await.clear();
    }

    /// Online flag plus snapshot for every device, for the devices API.
    pub async fn info_all(&self) -> Vec<(String, bool, Option<DeviceSnapshot>)> {
        let mut out = Vec::with_capacity(self.adapters.len());
        for adapter in &self.adapters {
            let snapshot = self.snapshot(adapter.id()).await;
            out.push((adapter.id().to_string(), snapshot.is_some(), snapshot));
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Built-in adapters
// ---------------------------------------------------------------------------

/// NVIDIA GPU probed via `nvidia-smi`. The device is matched by a lowercase
/// name fragment, so "4060" picks the RTX 4060 regardless of vendor prefix.
pub struct NvidiaSmiDevice {
    id: String,
    match_name: String,
}

impl NvidiaSmiDevice {
    pub fn new(id: String, match_name: String) -> Self {
        Self {
            id,
            match_name: match_name.to_lowercase(),
        }
    }

    fn parse_line(&self, line: &str) -> Option<DeviceSnapshot> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 6 {
            return None;
        }
        if !fields[0].to_lowercase().contains(&self.match_name) {
            return None;
        }
        let total_mb: u64 = fields[1].parse().ok()?;
        let free_mb: u64 = fields[2].parse().ok()?;
        let used_mb: u64 = fields[3].parse().ok()?;
        let util_percent: f64 = fields[4].parse().unwrap_or(0.0);
        let temperature: Option<f64> = fields[5].parse().ok();

        Some(DeviceSnapshot {
            kind: "gpu".to_string(),
            memory_kind: "vram".to_string(),
            total_mb,
            free_mb,
            used_mb,
            util_percent,
            temperature,
        })
    }
}

#[async_trait]
impl DeviceAdapter for NvidiaSmiDevice {
    fn id(&self) -> &str {
        &self.id
    }

    async fn probe(&self) -> Option<DeviceSnapshot> {
        let output = tokio::process::Command::new("nvidia-smi")
            .args([
                "--query-gpu=name,memory.total,memory.free,memory.used,utilization.gpu,temperature.gpu",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .await;

        let output = match output {
            Ok(o) if o.status.success() => o,
            Ok(o) => {
                warn!(device = %self.id, status = %o.status, "nvidia-smi exited non-zero");
                return None;
            }
            Err(e) => {
                debug!(device = %self.id, error = %e, "nvidia-smi not available");
                return None;
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout.lines().find_map(|line| self.parse_line(line))
    }
}

/// System RAM via `/proc/meminfo`; always online on Linux.
pub struct CpuDevice {
    id: String,
}

impl CpuDevice {
    pub fn new(id: String) -> Self {
        Self { id }
    }

    fn parse_meminfo(contents: &str) -> Option<(u64, u64)> {
        let mut total_kb = None;
        let mut available_kb = None;
        for line in contents.lines() {
            let mut parts = line.split_whitespace();
            match parts.next() {
                Some("MemTotal:") => total_kb = parts.next().and_then(|v| v.parse::<u64>().ok()),
                Some("MemAvailable:") => {
                    available_kb = parts.next().and_then(|v| v.parse::<u64>().ok())
                }
                _ => {}
            }
            if total_kb.is_some() && available_kb.is_some() {
                break;
            }
        }
        Some((total_kb?, available_kb?))
    }
}

#[async_trait]
impl DeviceAdapter for CpuDevice {
    fn id(&self) -> &str {
        &self.id
    }

    async fn probe(&self) -> Option<DeviceSnapshot> {
        let contents = tokio::fs::read_to_string("/proc/meminfo").await.ok()?;
        let (total_kb, available_kb) = Self::parse_meminfo(&contents)?;
        let total_mb = total_kb / 1024;
        let free_mb = available_kb / 1024;
        Some(DeviceSnapshot {
            kind: "cpu".to_string(),
            memory_kind: "ram".to_string(),
            total_mb,
            free_mb,
            used_mb: total_mb.saturating_sub(free_mb),
            util_percent: 0.0,
            temperature: None,
        })
    }
}

/// Fixed-capacity device with externally togglable free memory and online
/// state. Used by tests and simulations.
pub struct StaticDevice {
    id: String,
    total_mb: AtomicU64,
    free_mb: AtomicU64,
    online: AtomicBool,
}

impl StaticDevice {
    pub fn new(id: String, total_mb: u64) -> Self {
        Self {
            id,
            total_mb: AtomicU64::new(total_mb),
            free_mb: AtomicU64::new(total_mb),
            online: AtomicBool::new(true),
        }
    }

    pub fn set_free_mb(&self, free_mb: u64) {
        self.free_mb.store(free_mb, Ordering::SeqCst);
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }
}

#[async_trait]
impl DeviceAdapter for StaticDevice {
    fn id(&self) -> &str {
        &self.id
    }

    async fn probe(&self) -> Option<DeviceSnapshot> {
        if !self.online.load(Ordering::SeqCst) {
            return None;
        }
        let total_mb = self.total_mb.load(Ordering::SeqCst);
        let free_mb = self.free_mb.load(Ordering::SeqCst).min(total_mb);
        Some(DeviceSnapshot {
            kind: "gpu".to_string(),
            memory_kind: "vram".to_string(),
            total_mb,
            free_mb,
            used_mb: total_mb - free_mb,
            util_percent: 0.0,
            temperature: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_registry(ttl: Duration) -> (DeviceRegistry, Arc<StaticDevice>) {
        let device = Arc::new(StaticDevice::new("gpu0".to_string(), 16384));
        let registry = DeviceRegistry::with_adapters(vec![device.clone()], ttl);
        (registry, device)
    }

    #[tokio::test]
    async fn snapshot_reports_capacity() {
        let (registry, device) = static_registry(Duration::ZERO);
        device.set_free_mb(8192);

        let snap = registry.snapshot("gpu0").await.unwrap();
        assert_eq!(snap.total_mb, 16384);
        assert_eq!(snap.free_mb, 8192);
        assert_eq!(snap.used_mb, 8192);
    }

    #[tokio::test]
    async fn offline_device_has_no_snapshot() {
        let (registry, device) = static_registry(Duration::ZERO);
        device.set_online(false);

        assert!(!registry.online("gpu0").await);
        assert!(registry.snapshot("gpu0").await.is_none());
        assert!(registry.online_set().await.is_empty());
    }

    #[tokio::test]
    async fn ttl_serves_stale_snapshot_until_refresh() {
        let (registry, device) = static_registry(Duration::from_secs(60));

        let first = registry.snapshot("gpu0").await.unwrap();
        assert_eq!(first.free_mb, 16384);

        device.set_free_mb(1024);
        let cached = registry.snapshot("gpu0").await.unwrap();
        assert_eq!(cached.free_mb, 16384);

        registry.refresh().await;
        let fresh = registry.snapshot("gpu0").await.unwrap();
        assert_eq!(fresh.free_mb, 1024);
    }

    #[tokio::test]
    async fn unknown_device_is_none() {
        let (registry, _device) = static_registry(Duration::ZERO);
        assert!(registry.snapshot("nope").await.is_none());
    }

    #[test]
    fn nvidia_smi_line_parsing() {
        let adapter = NvidiaSmiDevice::new("rtx4060".to_string(), "4060".to_string());
        let snap = adapter
            .parse_line("NVIDIA GeForce RTX 4060, 8188, 7000, 1188, 13, 45")
            .unwrap();
        assert_eq!(snap.total_mb, 8188);
        assert_eq!(snap.free_mb, 7000);
        assert_eq!(snap.temperature, Some(45.0));

        assert!(adapter.parse_line("Tesla V100-SXM2-16GB, 16160, 16000, 160, 0, 30").is_none());
        assert!(adapter.parse_line("garbage").is_none());
    }

    #[test]
    fn meminfo_parsing() {
        let contents = "MemTotal:       32694292 kB\nMemFree:        1000 kB\nMemAvailable:   16347146 kB\n";
        let (total, available) = CpuDevice::parse_meminfo(contents).unwrap();
        assert_eq!(total, 32694292);
        assert_eq!(available, 16347146);
    }

    #[test]
    fn from_specs_rejects_unknown_kind() {
        let specs = vec![DeviceSpec {
            id: "x".into(),
            kind: "quantum".into(),
            match_name: None,
            total_mb: None,
        }];
        assert!(DeviceRegistry::from_specs(&specs, Duration::ZERO).is_err());
    }
}
