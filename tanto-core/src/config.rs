//! # Configuration Management
//!
//! Handles all configuration for TantoKV components.
//!
//! Every option can be set through a `TANTO_*` environment variable; unset
//! variables fall back to the defaults below. A variable that is set but
//! does not parse is a startup error, not a silent fallback.

use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub http: HttpConfig,
    pub rpc: RpcConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub metrics: MetricsConfig,
}

/// JSON/HTTP surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    pub bind_address: String,
    pub port: u16,
    /// Global in-flight request bound for the HTTP surface.
    pub request_limit: usize,
    /// Maximum accepted request body size in bytes.
    pub entry_size: usize,
    pub max_header_bytes: usize,
    pub write_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 9191,
            request_limit: 500,
            entry_size: 2048,
            max_header_bytes: 1024,
            write_timeout_secs: 20,
            read_timeout_secs: 20,
            idle_timeout_secs: 20,
        }
    }
}

/// Binary RPC surface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcConfig {
    pub enabled: bool,
    pub bind_address: String,
    pub port: u16,
    pub request_limit: usize,
    /// Cap on the client-supplied deadline, in seconds.
    pub max_duration_secs: u64,
    pub max_concurrent_streams: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: "0.0.0.0".to_string(),
            port: 9292,
            request_limit: 1000,
            max_duration_secs: 10,
            max_concurrent_streams: crate::utils::cpu_count() * 4,
        }
    }
}

/// Storage engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding the append-only logs and credential sidecars.
    pub db_folder: PathBuf,
    /// Per-database entry cap, checked before each insert.
    pub max_entries: u64,
    /// Seed for the keyed 64-bit hash.
    pub hash_seed: i64,
    /// Multiplier applied to the CPU count when sizing shard-lock and
    /// expiration-shard arrays.
    pub cpu_multiplier: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_folder: PathBuf::from("./data"),
            max_entries: 100_000,
            hash_seed: 0,
            cpu_multiplier: 16,
        }
    }
}

/// Authentication configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    pub enabled: bool,
}

/// Metrics configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MetricsConfig {
    pub enabled: bool,
}

impl Config {
    /// Load configuration from `TANTO_*` environment variables on top of the
    /// defaults.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Config::default();

        read_env("TANTO_BIND_ADDRESS", &mut cfg.http.bind_address)?;
        read_env("TANTO_PORT", &mut cfg.http.port)?;
        read_env("TANTO_REQUEST_LIMIT", &mut cfg.http.request_limit)?;
        read_env("TANTO_ENTRY_SIZE", &mut cfg.http.entry_size)?;
        read_env("TANTO_MAX_HEADER_BYTES", &mut cfg.http.max_header_bytes)?;
        read_env("TANTO_WRITE_TIMEOUT", &mut cfg.http.write_timeout_secs)?;
        read_env("TANTO_READ_TIMEOUT", &mut cfg.http.read_timeout_secs)?;
        read_env("TANTO_IDLE_TIMEOUT", &mut cfg.http.idle_timeout_secs)?;

        read_env("TANTO_RPC_ENABLED", &mut cfg.rpc.enabled)?;
        read_env("TANTO_RPC_BIND_ADDRESS", &mut cfg.rpc.bind_address)?;
        read_env("TANTO_RPC_PORT", &mut cfg.rpc.port)?;
        read_env("TANTO_RPC_REQUEST_LIMIT", &mut cfg.rpc.request_limit)?;
        read_env("TANTO_RPC_MAX_DURATION", &mut cfg.rpc.max_duration_secs)?;
        read_env(
            "TANTO_RPC_MAX_CONCURRENT_STREAMS",
            &mut cfg.rpc.max_concurrent_streams,
        )?;

        if let Ok(folder) = std::env::var("TANTO_DB_FOLDER") {
            cfg.storage.db_folder = PathBuf::from(folder);
        }
        read_env("TANTO_MAX_ENTRIES", &mut cfg.storage.max_entries)?;
        read_env("TANTO_HASH_SEED", &mut cfg.storage.hash_seed)?;
        read_env("TANTO_CPU_MULTIPLIER", &mut cfg.storage.cpu_multiplier)?;

        read_env("TANTO_APIKEY_ENABLED", &mut cfg.auth.enabled)?;
        read_env("TANTO_METRICS_ENABLED", &mut cfg.metrics.enabled)?;

        if !cfg.auth.enabled {
            warn!("API key authentication is disabled, all requests will be accepted");
        }

        Ok(cfg)
    }

    /// Listen endpoint of the JSON surface.
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.http.bind_address, self.http.port)
    }

    /// Listen endpoint of the RPC surface.
    pub fn rpc_addr(&self) -> String {
        format!("{}:{}", self.rpc.bind_address, self.rpc.port)
    }
}

fn read_env<T: FromStr>(key: &str, target: &mut T) -> Result<()> {
    match std::env::var(key) {
        Ok(raw) => {
            *target = raw.parse().map_err(|_| Error::InvalidArgument {
                message: format!("cannot parse environment variable {key}={raw:?}"),
            })?;
            Ok(())
        }
        Err(_) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.http.port, 9191);
        assert_eq!(cfg.rpc.port, 9292);
        assert_eq!(cfg.storage.max_entries, 100_000);
        assert_eq!(cfg.storage.cpu_multiplier, 16);
        assert!(!cfg.auth.enabled);
        assert_eq!(cfg.http_addr(), "0.0.0.0:9191");
    }

    // Env vars are process-global and tests run in parallel, so every
    // from_env exercise lives in this one test.
    #[test]
    fn test_env_override_and_parse_failure() {
        std::env::set_var("TANTO_PORT", "1234");
        std::env::set_var("TANTO_APIKEY_ENABLED", "true");
        let cfg = Config::from_env().unwrap();
        assert_eq!(cfg.http.port, 1234);
        assert!(cfg.auth.enabled);

        std::env::set_var("TANTO_RPC_PORT", "not-a-port");
        assert!(Config::from_env().is_err());

        std::env::remove_var("TANTO_PORT");
        std::env::remove_var("TANTO_APIKEY_ENABLED");
        std::env::remove_var("TANTO_RPC_PORT");
    }
}
