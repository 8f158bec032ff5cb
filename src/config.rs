//! Configuration types for fqdn-identity.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::FqdnError;
use crate::identity::LOCAL_IDENTITY_FLAG;
use crate::lockpool::DEFAULT_SHARD_COUNT;
use crate::selector::FqdnSelector;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// FQDN identity bookkeeping.
    #[serde(default)]
    pub fqdn: FqdnConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// FQDN identity bookkeeping configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FqdnConfig {
    /// Lower bound applied to every DNS TTL, in seconds.
    #[serde(default)]
    pub min_ttl: u32,

    /// DNS history entries kept per endpoint (0 for no bound).
    #[serde(default = "default_max_entries_per_endpoint")]
    pub max_entries_per_endpoint: usize,

    /// Entries kept in the process-wide DNS cache (0 for no bound).
    #[serde(default = "default_max_cache_entries")]
    pub max_cache_entries: usize,

    /// Distinct IPs kept per name in an endpoint's history (0 for no bound).
    #[serde(default = "default_max_ips_per_name")]
    pub max_ips_per_name: usize,

    /// Number of shard locks.
    #[serde(default = "default_shard_count")]
    pub shard_count: usize,

    /// Seconds between GC sweeps.
    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: u64,

    /// Seconds a zombie may stay idle before it dies.
    #[serde(default = "default_zombie_idle_grace_secs")]
    pub zombie_idle_grace_secs: u64,

    /// Zombies kept per endpoint (0 for no bound).
    #[serde(default = "default_max_zombies")]
    pub max_zombies: usize,

    /// First identity of the local allocation range.
    #[serde(default = "default_identity_range_start")]
    pub identity_range_start: u32,

    /// Size of the local allocation range.
    #[serde(default = "default_identity_range_size")]
    pub identity_range_size: u32,

    /// Selectors registered at startup.
    #[serde(default)]
    pub selectors: Vec<FqdnSelector>,
}

impl FqdnConfig {
    /// Reject settings the daemon cannot run with.
    pub fn validate(&self) -> Result<(), FqdnError> {
        if self.shard_count == 0 {
            return Err(FqdnError::Config("shard_count must be at least 1".to_string()));
        }
        if self.gc_interval_secs == 0 {
            return Err(FqdnError::Config(
                "gc_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.identity_range_size == 0 {
            return Err(FqdnError::Config(
                "identity_range_size must be at least 1".to_string(),
            ));
        }
        if self
            .identity_range_start
            .checked_add(self.identity_range_size)
            .is_none()
        {
            return Err(FqdnError::Config(format!(
                "identity range {}+{} overflows",
                self.identity_range_start, self.identity_range_size
            )));
        }
        for selector in &self.selectors {
            selector.compile()?;
        }
        Ok(())
    }

    /// GC sweep interval.
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }

    /// Zombie idle grace period.
    pub fn zombie_idle_grace(&self) -> Duration {
        Duration::from_secs(self.zombie_idle_grace_secs)
    }
}

impl Default for FqdnConfig {
    fn default() -> Self {
        Self {
            min_ttl: 0,
            max_entries_per_endpoint: default_max_entries_per_endpoint(),
            max_cache_entries: default_max_cache_entries(),
            max_ips_per_name: default_max_ips_per_name(),
            shard_count: default_shard_count(),
            gc_interval_secs: default_gc_interval_secs(),
            zombie_idle_grace_secs: default_zombie_idle_grace_secs(),
            max_zombies: default_max_zombies(),
            identity_range_start: default_identity_range_start(),
            identity_range_size: default_identity_range_size(),
            selectors: Vec::new(),
        }
    }
}

fn default_max_entries_per_endpoint() -> usize {
    10_000
}

fn default_max_cache_entries() -> usize {
    100_000
}

fn default_max_ips_per_name() -> usize {
    50
}

fn default_shard_count() -> usize {
    DEFAULT_SHARD_COUNT
}

fn default_gc_interval_secs() -> u64 {
    60
}

fn default_zombie_idle_grace_secs() -> u64 {
    60
}

fn default_max_zombies() -> usize {
    10_000
}

fn default_identity_range_start() -> u32 {
    LOCAL_IDENTITY_FLAG
}

fn default_identity_range_size() -> u32 {
    65_535
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "debug", "fqdn_identity=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
