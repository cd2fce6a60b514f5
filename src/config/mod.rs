//! Configuration module for cachefleet
//!
//! Handles loading and validation of configuration files. All knobs are
//! consumed once at startup; there is no hot reload.

use crate::error::{Error, Result};
use crate::ring::HashAlgorithm;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod validation;

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub balancer: BalancerConfig,
    #[serde(default)]
    pub ring: RingConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Client-facing listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_client_port")]
    pub client_port: u16,
}

/// Autoscaling and redistribution knobs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BalancerConfig {
    /// Mean capacity factor the modulation loop drives toward.
    #[serde(default = "default_target_cf")]
    pub target_cf: f64,
    /// Gain applied to the (mean - target) difference per modulation tick.
    #[serde(default = "default_growth_rate")]
    pub growth_rate: f64,
    /// Ordered cutoffs [c0, c1, c2, c3] defining the five load bands used
    /// by the redistribution loop. Must be strictly increasing.
    #[serde(default = "default_server_load_cutoffs")]
    pub server_load_cutoffs: [f64; 4],
    #[serde(default = "default_modulation_interval_ms")]
    pub modulation_interval_ms: u64,
    #[serde(default = "default_redistribution_interval_ms")]
    pub redistribution_interval_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_initial_backend_count")]
    pub initial_backend_count: usize,
}

/// Hash ring geometry and placement.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RingConfig {
    /// Ring size M. A power of two, at least 2^14.
    #[serde(default = "default_ring_size")]
    pub ring_size: u32,
    #[serde(default = "default_initial_angles_per_server")]
    pub initial_angles_per_server: usize,
    #[serde(default)]
    pub hash_algorithm: HashAlgorithm,
    /// Seed for angle placement, fixed so placements reproduce run-to-run.
    #[serde(default = "default_angle_seed")]
    pub angle_seed: u64,
}

/// Backend worker pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackendConfig {
    /// Inclusive start of the selectable port range.
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    /// Exclusive end of the selectable port range.
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    /// Trailing window over which each backend computes its capacity factor.
    #[serde(default = "default_record_ttl_ms")]
    pub request_monitor_record_ttl_ms: u64,
    /// Deadline for one telemetry poll.
    #[serde(default = "default_telemetry_timeout_ms")]
    pub telemetry_timeout_ms: u64,
    /// Bound on the wait for a starting backend's readiness signal.
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// Grace period before a stopping backend is force-killed.
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_client_port() -> u16 {
    8080
}
fn default_target_cf() -> f64 {
    0.5
}
fn default_growth_rate() -> f64 {
    5.0
}
fn default_server_load_cutoffs() -> [f64; 4] {
    [0.25, 0.5, 0.75, 1.5]
}
fn default_modulation_interval_ms() -> u64 {
    2000
}
fn default_redistribution_interval_ms() -> u64 {
    1000
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_initial_backend_count() -> usize {
    39
}
fn default_ring_size() -> u32 {
    1 << 16
}
fn default_initial_angles_per_server() -> usize {
    10
}
fn default_angle_seed() -> u64 {
    42
}
fn default_port_range_start() -> u16 {
    37100
}
fn default_port_range_end() -> u16 {
    37200
}
fn default_record_ttl_ms() -> u64 {
    10000
}
fn default_telemetry_timeout_ms() -> u64 {
    2000
}
fn default_startup_timeout_ms() -> u64 {
    5000
}
fn default_shutdown_grace_ms() -> u64 {
    5000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            client_port: default_client_port(),
        }
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            target_cf: default_target_cf(),
            growth_rate: default_growth_rate(),
            server_load_cutoffs: default_server_load_cutoffs(),
            modulation_interval_ms: default_modulation_interval_ms(),
            redistribution_interval_ms: default_redistribution_interval_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            initial_backend_count: default_initial_backend_count(),
        }
    }
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            ring_size: default_ring_size(),
            initial_angles_per_server: default_initial_angles_per_server(),
            hash_algorithm: HashAlgorithm::default(),
            angle_seed: default_angle_seed(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            request_monitor_record_ttl_ms: default_record_ttl_ms(),
            telemetry_timeout_ms: default_telemetry_timeout_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl BalancerConfig {
    pub fn modulation_interval(&self) -> Duration {
        Duration::from_millis(self.modulation_interval_ms)
    }

    pub fn redistribution_interval(&self) -> Duration {
        Duration::from_millis(self.redistribution_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl BackendConfig {
    pub fn port_range(&self) -> Range<u16> {
        self.port_range_start..self.port_range_end
    }

    pub fn record_window(&self) -> Duration {
        Duration::from_millis(self.request_monitor_record_ttl_ms)
    }

    pub fn telemetry_timeout(&self) -> Duration {
        Duration::from_millis(self.telemetry_timeout_ms)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Config {
    /// Load configuration from a file, then validate it.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("yaml");

        let config: Self = match extension {
            "yaml" | "yml" => serde_yaml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse YAML: {}", e)))?,
            "toml" => toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse TOML: {}", e)))?,
            _ => {
                return Err(Error::Config(format!(
                    "Unsupported config format: {}",
                    extension
                )))
            },
        };

        validation::validate(&config)?;
        Ok(config)
    }

    /// Discover and load configuration from standard locations, falling
    /// back to the built-in defaults.
    pub fn discover_and_load() -> Result<Self> {
        let mut search_paths = vec![
            PathBuf::from("cachefleet.yaml"),
            PathBuf::from("cachefleet.toml"),
        ];

        if let Some(home) = dirs::home_dir() {
            search_paths.push(home.join(".cachefleet/config.yaml"));
        }

        search_paths.push(PathBuf::from("/etc/cachefleet/config.yaml"));

        for path in search_paths {
            if path.exists() {
                return Self::from_file(&path);
            }
        }

        Ok(Self::default())
    }

    /// Validate a configuration file without keeping it.
    pub fn validate_file(path: &Path) -> Result<()> {
        let _config = Self::from_file(path)?;
        Ok(())
    }
}
