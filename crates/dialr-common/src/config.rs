//! Configuration types for Dialr
//!
//! Every section has defaults, so a partial (or absent) TOML file is valid.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Shortest period a background job may run at
pub const MIN_INTERVAL_MS: u64 = 1;

const fn interval_from_ms(ms: u64) -> Duration {
    if ms < MIN_INTERVAL_MS {
        Duration::from_millis(MIN_INTERVAL_MS)
    } else {
        Duration::from_millis(ms)
    }
}

/// Root configuration for Dialr
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Durable store configuration
    pub store: StoreConfig,
    /// State synchronization configuration
    pub sync: SyncConfig,
    /// Maintenance job configuration
    pub maintenance: MaintenanceConfig,
    /// Branch resolution configuration
    pub resolver: ResolverConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// HTTP server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address for the branch API
    pub listen: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 8080),
        }
    }
}

/// Durable store configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path of the redb database file
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./dialr-data/dialr.redb"),
        }
    }
}

/// State synchronization configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Interval between incremental refreshes (milliseconds)
    pub interval_ms: u64,
}

impl SyncConfig {
    /// Refresh period, never shorter than `MIN_INTERVAL_MS`
    #[must_use]
    pub const fn interval(&self) -> Duration {
        interval_from_ms(self.interval_ms)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
        }
    }
}

/// Maintenance job configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Interval between maintenance runs (milliseconds)
    pub interval_ms: u64,
    /// How long past expiry (or deactivation) rows are kept (seconds)
    pub grace_secs: u64,
}

impl MaintenanceConfig {
    #[must_use]
    pub const fn interval(&self) -> Duration {
        interval_from_ms(self.interval_ms)
    }

    #[must_use]
    pub const fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_secs)
    }
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            grace_secs: 10 * 60,
        }
    }
}

/// Branch resolution configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Upper bound for the ledger upsert on a cache miss (milliseconds)
    pub ledger_timeout_ms: u64,
}

impl ResolverConfig {
    #[must_use]
    pub const fn ledger_timeout(&self) -> Duration {
        Duration::from_millis(self.ledger_timeout_ms)
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            ledger_timeout_ms: 500,
        }
    }
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is not set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.listen.port(), 8080);
        assert_eq!(config.sync.interval(), Duration::from_secs(10));
        assert_eq!(config.maintenance.grace(), Duration::from_secs(600));
        assert_eq!(config.resolver.ledger_timeout(), Duration::from_millis(500));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_zero_intervals_are_clamped() {
        let config: Config = toml::from_str(
            r#"
            [sync]
            interval_ms = 0

            [maintenance]
            interval_ms = 0
            "#,
        )
        .unwrap();
        assert_eq!(config.sync.interval(), Duration::from_millis(1));
        assert_eq!(config.maintenance.interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [sync]
            interval_ms = 2500

            [store]
            path = "/tmp/dialr.redb"
            "#,
        )
        .unwrap();
        assert_eq!(config.sync.interval_ms, 2500);
        assert_eq!(config.store.path, PathBuf::from("/tmp/dialr.redb"));
        // Untouched sections keep their defaults
        assert_eq!(config.maintenance.interval_ms, 30_000);
        assert_eq!(config.server.listen.port(), 8080);
    }
}
