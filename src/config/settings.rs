use crate::error::{MonitorError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/netscope.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub capture: CaptureConfig,
    pub rate: RateConfig,
    pub udp: UdpConfig,
    pub cleanup: CleanupConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub enabled: bool,
    /// Queue events and drain them on a fixed tick instead of dispatching inline.
    pub batching: bool,
    pub tcp_queue_capacity: usize,
    pub udp_queue_capacity: usize,
    pub other_queue_capacity: usize,
    pub drain_interval_ms: u64,
    pub stats_log_interval_secs: u64,
    pub session_name: String,
    /// Regex patterns matched against lowercase process names.
    pub excluded_processes: Vec<String>,
    pub providers: ProviderToggles,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderToggles {
    pub tcpip: bool,
    pub winsock: bool,
    pub dns: bool,
    pub http: bool,
    pub network_profile: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateConfig {
    pub interval_ms: u64,
    pub detailed_stats: bool,
    pub max_elapsed_secs: u64,
    /// Consecutive enumerations a connection may be missing before its sample is evicted.
    pub eviction_cycles: u32,
    pub top_n: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UdpConfig {
    pub idle_timeout_secs: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub interval_secs: u64,
    pub tcp_idle_timeout_secs: u64,
    pub process_idle_timeout_secs: u64,
    pub dns_ttl_secs: u64,
    /// Rates older than this are reported as zero in snapshots.
    pub rate_stale_secs: u64,
    /// Minimum spacing between two rate samples of the same connection.
    pub rate_window_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub enabled: bool,
    pub path: String,
    pub flush_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            batching: true,
            tcp_queue_capacity: 10_000,
            udp_queue_capacity: 5_000,
            other_queue_capacity: 2_000,
            drain_interval_ms: 100,
            stats_log_interval_secs: 30,
            session_name: "NetScopeTrace".to_string(),
            excluded_processes: Vec::new(),
            providers: ProviderToggles::default(),
        }
    }
}

impl Default for ProviderToggles {
    fn default() -> Self {
        Self {
            tcpip: true,
            // AFD payloads are not decoded; enabling it only feeds the undecoded counter.
            winsock: false,
            dns: true,
            http: true,
            network_profile: true,
        }
    }
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            detailed_stats: true,
            max_elapsed_secs: 60,
            eviction_cycles: 1,
            top_n: 10,
        }
    }
}

impl Default for UdpConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: 60,
            sweep_interval_secs: 10,
        }
    }
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            tcp_idle_timeout_secs: 300,
            process_idle_timeout_secs: 600,
            dns_ttl_secs: 3600,
            rate_stale_secs: 3,
            rate_window_ms: 1000,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: "data/traffic.jsonl".to_string(),
            flush_interval_secs: 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl CaptureConfig {
    pub fn drain_interval(&self) -> Duration {
        Duration::from_millis(self.drain_interval_ms)
    }
}

impl RateConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl UdpConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<()> {
        let capture = &self.capture;
        if capture.tcp_queue_capacity == 0
            || capture.udp_queue_capacity == 0
            || capture.other_queue_capacity == 0
        {
            return Err(MonitorError::config("capture queue capacities must be non-zero"));
        }
        if capture.drain_interval_ms == 0 {
            return Err(MonitorError::config("capture.drain_interval_ms must be non-zero"));
        }
        for pattern in &capture.excluded_processes {
            if let Err(e) = regex::Regex::new(pattern) {
                return Err(MonitorError::config(format!(
                    "excluded process pattern '{}' does not compile: {}",
                    pattern, e
                )));
            }
        }
        if self.rate.interval_ms == 0 {
            return Err(MonitorError::config("rate.interval_ms must be non-zero"));
        }
        if self.rate.eviction_cycles == 0 {
            return Err(MonitorError::config("rate.eviction_cycles must be at least 1"));
        }
        if self.udp.idle_timeout_secs == 0 || self.udp.sweep_interval_secs == 0 {
            return Err(MonitorError::config("udp timeouts must be non-zero"));
        }
        if self.cleanup.interval_secs == 0 {
            return Err(MonitorError::config("cleanup.interval_secs must be non-zero"));
        }
        if self.persistence.enabled && self.persistence.flush_interval_secs == 0 {
            return Err(MonitorError::config(
                "persistence.flush_interval_secs must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Loads the configuration, falling back to defaults when the file is missing,
/// unreadable, malformed or invalid.
pub fn load_config(path: impl AsRef<Path>) -> MonitorConfig {
    let path = path.as_ref();
    if !path.exists() {
        log::info!("No configuration at {}, using defaults", path.display());
        return MonitorConfig::default();
    }

    match load_config_strict(path) {
        Ok(config) => {
            log::info!("Loaded configuration from {}", path.display());
            config
        }
        Err(e) => {
            log::warn!("{}. Using defaults.", e);
            MonitorConfig::default()
        }
    }
}

pub fn load_config_strict(path: impl AsRef<Path>) -> Result<MonitorConfig> {
    let path = path.as_ref();
    let content = fs::read_to_string(path).map_err(|e| MonitorError::io(path, e))?;
    let config: MonitorConfig = serde_json::from_str(&content)?;
    config.validate()?;
    Ok(config)
}

pub fn save_config(config: &MonitorConfig, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(|e| MonitorError::io(parent, e))?;
        }
    }
    let content = serde_json::to_string_pretty(config)?;
    fs::write(path, content).map_err(|e| MonitorError::io(path, e))?;
    Ok(())
}
