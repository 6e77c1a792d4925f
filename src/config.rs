//! Configuration for llmfleet.
//!
//! The catalogue is one JSON or YAML document: a `program` section with
//! gateway-level settings (including the device table) and a `models` list.
//! Launch variants are an ordered list: source order is priority, first
//! entry wins when several fit the online device set.

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Top-level configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Gateway-level settings.
    #[serde(default)]
    pub program: ProgramConfig,

    /// Models to manage.
    pub models: Vec<ModelConfig>,
}

/// Gateway-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgramConfig {
    /// Listen host for the public API
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port for the public API
    #[serde(default = "default_port")]
    pub port: u16,

    /// Prometheus metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Path of the accounting database file
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Idle timeout in minutes before a routing model is stopped (0 disables)
    #[serde(default = "default_idle_timeout_minutes")]
    pub idle_timeout_minutes: u64,

    /// Health-probe window for routed starts, in seconds
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,

    /// Grace period between SIGTERM and SIGKILL when stopping a backend
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,

    /// Device snapshot cache TTL in milliseconds
    #[serde(default = "default_snapshot_ttl_ms")]
    pub snapshot_ttl_ms: u64,

    /// Device table: one entry per device adapter instance
    #[serde(default)]
    pub devices: Vec<DeviceSpec>,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            metrics_port: default_metrics_port(),
            db_path: default_db_path(),
            idle_timeout_minutes: default_idle_timeout_minutes(),
            health_timeout_secs: default_health_timeout_secs(),
            stop_grace_secs: default_stop_grace_secs(),
            snapshot_ttl_ms: default_snapshot_ttl_ms(),
            devices: Vec::new(),
        }
    }
}

impl ProgramConfig {
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_minutes > 0).then(|| Duration::from_secs(self.idle_timeout_minutes * 60))
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn snapshot_ttl(&self) -> Duration {
        Duration::from_millis(self.snapshot_ttl_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}

/// One device adapter instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSpec {
    /// Unique device identifier referenced by launch variants
    pub id: String,

    /// Adapter kind: "nvidia-smi", "cpu", or "static"
    pub kind: String,

    /// Name fragment used by the nvidia-smi adapter to pick its GPU
    #[serde(default, rename = "match")]
    pub match_name: Option<String>,

    /// Fixed total memory for the static adapter, in megabytes
    #[serde(default)]
    pub total_mb: Option<u64>,
}

/// Configuration for a single model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// User-facing names; the first alias is the canonical model name
    pub aliases: Vec<String>,

    /// Interface mode ("Chat", "Base", "Embedding", "Reranker", ...)
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Fixed port the backend listens on
    pub port: u16,

    /// Start this model at boot
    #[serde(default)]
    pub auto_start: bool,

    /// Launch variants in priority order (first is highest)
    pub variants: Vec<LaunchVariant>,
}

impl ModelConfig {
    /// The canonical model name (first alias).
    pub fn name(&self) -> &str {
        &self.aliases[0]
    }
}

/// One launch configuration for a model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchVariant {
    /// Variant label, used in status output and logs
    pub name: String,

    /// Devices that must all be online for this variant to be a candidate
    pub required_devices: BTreeSet<String>,

    /// Memory reserved per device when this variant runs, in megabytes
    #[serde(default)]
    pub memory_mb: BTreeMap<String, u64>,

    /// Opaque launch script; format is OS-specific and not interpreted
    pub script: PathBuf,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_db_path() -> PathBuf {
    PathBuf::from("webui/monitoring.db")
}

fn default_idle_timeout_minutes() -> u64 {
    15
}

fn default_health_timeout_secs() -> u64 {
    300
}

fn default_stop_grace_secs() -> u64 {
    10
}

fn default_snapshot_ttl_ms() -> u64 {
    1000
}

fn default_mode() -> String {
    "Chat".to_string()
}

impl Config {
    /// Load configuration from a JSON or YAML file, by extension.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );

        if is_yaml {
            serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        } else {
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))
        }
    }

    /// Validate referential integrity against the registered device ids and
    /// interface modes. Config changes take effect on next process start;
    /// there is no hot reload.
    pub fn validate(&self, device_ids: &BTreeSet<String>, modes: &BTreeSet<String>) -> Result<()> {
        let mut seen_aliases: BTreeSet<&str> = BTreeSet::new();
        let mut seen_ports: BTreeMap<u16, &str> = BTreeMap::new();

        for model in &self.models {
            if model.aliases.is_empty() {
                bail!("a model entry has no aliases");
            }
            let name = model.name();

            for alias in &model.aliases {
                if !seen_aliases.insert(alias.as_str()) {
                    bail!("duplicate alias '{alias}'");
                }
            }

            if !modes.contains(&model.mode) {
                bail!(
                    "model '{name}': mode '{}' has no registered interface adapter",
                    model.mode
                );
            }

            if let Some(other) = seen_ports.insert(model.port, name) {
                bail!(
                    "model '{name}': port {} already used by '{other}'",
                    model.port
                );
            }

            if model.variants.is_empty() {
                bail!("model '{name}' has no launch variants");
            }

            for variant in &model.variants {
                for device in variant
                    .required_devices
                    .iter()
                    .chain(variant.memory_mb.keys())
                {
                    if !device_ids.contains(device) {
                        bail!(
                            "model '{name}', variant '{}': unknown device '{device}'",
                            variant.name
                        );
                    }
                }
            }
        }

        Ok(())
    }
}

/// Read-only catalogue built from a validated [`Config`]: lookup by
/// canonical name, by alias, and by mode.
#[derive(Debug, Clone)]
pub struct Catalogue {
    models: HashMap<String, Arc<ModelConfig>>,
    alias_to_canonical: HashMap<String, String>,
    /// Canonical names in catalogue order
    order: Vec<String>,
}

impl Catalogue {
    pub fn new(config: &Config) -> Self {
        let mut models = HashMap::new();
        let mut alias_to_canonical = HashMap::new();
        let mut order = Vec::new();

        for model in &config.models {
            let canonical = model.name().to_string();
            for alias in &model.aliases {
                alias_to_canonical.insert(alias.clone(), canonical.clone());
            }
            order.push(canonical.clone());
            models.insert(canonical, Arc::new(model.clone()));
        }

        Self {
            models,
            alias_to_canonical,
            order,
        }
    }

    /// Resolve a user-facing alias to the canonical model name.
    pub fn resolve(&self, alias: &str) -> Option<&str> {
        self.alias_to_canonical.get(alias).map(String::as_str)
    }

    /// Look up a model by canonical name.
    pub fn get(&self, canonical: &str) -> Option<&Arc<ModelConfig>> {
        self.models.get(canonical)
    }

    /// Resolve an alias and return the model config in one step.
    pub fn lookup(&self, alias: &str) -> Option<&Arc<ModelConfig>> {
        self.resolve(alias).and_then(|name| self.models.get(name))
    }

    /// Canonical model names in catalogue order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Declared mode for a canonical model name.
    pub fn mode_of(&self, canonical: &str) -> Option<&str> {
        self.models.get(canonical).map(|m| m.mode.as_str())
    }

    /// All canonical names with the given mode.
    pub fn by_mode<'a>(&'a self, mode: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.order
            .iter()
            .filter(move |name| self.models[*name].mode == mode)
            .map(String::as_str)
    }
}
