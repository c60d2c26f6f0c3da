//! Configuration types for HVFS
//!
//! Every section has a `Default` so a partial TOML file (or none at all)
//! yields a usable configuration.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Root configuration for an HVFS client site
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Site identity and root service endpoint
    pub client: ClientConfig,
    /// Ring construction
    pub ring: RingConfig,
    /// Directory cache
    pub dir_cache: DirCacheConfig,
    /// KV column limits
    pub kv: KvConfig,
    /// RPC retry behaviour
    pub rpc: RpcConfig,
    /// Branch processor
    pub branch: BranchConfig,
}

impl Config {
    /// Parse a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::Configuration(e.to_string()))
    }

    /// Load a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Configuration(format!("{}: {e}", path.as_ref().display()))
        })?;
        Self::from_toml_str(&text)
    }
}

/// Site identity
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Index of this client within the client site range
    pub site_index: u64,
    /// File system to attach to
    pub fsid: u64,
    /// Ring group
    pub group: u32,
    /// Root service address
    pub root_address: SocketAddr,
    /// Local address for inbound ring updates
    pub listen: SocketAddr,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            site_index: 0,
            fsid: 0,
            group: 0,
            root_address: SocketAddr::from(([127, 0, 0, 1], 8710)),
            listen: SocketAddr::from(([0, 0, 0, 0], 8712)),
        }
    }
}

/// Consistent-hash ring settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RingConfig {
    /// Virtual points per site
    pub vid_max: u32,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self { vid_max: 256 }
    }
}

/// Directory cache settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DirCacheConfig {
    /// Depth of a freshly cached container; `2^depth` shards start allocated
    pub initial_depth: u8,
}

impl Default for DirCacheConfig {
    fn default() -> Self {
        Self { initial_depth: 3 }
    }
}

/// KV column limits
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct KvConfig {
    /// Largest value stored inline in column 0
    pub max_inline_value: usize,
    /// Highest column number stored as a direct pointer
    pub indirect_threshold: u32,
    /// Highest valid column number
    pub max_column: u32,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            max_inline_value: 65_535,
            indirect_threshold: 6,
            max_column: 4096,
        }
    }
}

/// RPC settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Delay before resending after a server-busy reply, in milliseconds
    pub busy_backoff_ms: u64,
}

impl RpcConfig {
    #[must_use]
    pub const fn busy_backoff(&self) -> Duration {
        Duration::from_millis(self.busy_backoff_ms)
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            busy_backoff_ms: 1000,
        }
    }
}

/// Branch processor settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BranchConfig {
    /// Buckets in the ack cache
    pub ack_buckets: usize,
    /// Growth step of filter output buffers
    pub filter_chunk: usize,
    /// Buffered bytes across all operators that force a flush
    pub memory_limit: usize,
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            ack_buckets: 64,
            filter_chunk: 32 * 1024,
            memory_limit: 64 * 1024 * 1024, // 64 MB
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.ring.vid_max, 256);
        assert_eq!(config.dir_cache.initial_depth, 3);
        assert_eq!(config.kv.indirect_threshold, 6);
        assert_eq!(config.rpc.busy_backoff(), Duration::from_secs(1));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [client]
            site_index = 4
            root_address = "10.0.0.1:8710"

            [kv]
            max_column = 128
            "#,
        )
        .unwrap();
        assert_eq!(config.client.site_index, 4);
        assert_eq!(config.client.root_address.port(), 8710);
        assert_eq!(config.kv.max_column, 128);
        assert_eq!(config.kv.max_inline_value, 65_535);
        assert_eq!(config.branch.ack_buckets, 64);
    }

    #[test]
    fn test_bad_toml_is_configuration_error() {
        let err = Config::from_toml_str("[kv]\nmax_column = \"many\"").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hvfs.toml");
        std::fs::write(&path, "[ring]\nvid_max = 16\n").unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.ring.vid_max, 16);
        assert!(Config::load(dir.path().join("missing.toml")).is_err());
    }
}
