//! Engine configuration
//!
//! Every tunable the engine recognizes lives here; anything else in a
//! config file is an error. Defaults match a mid-size single-host
//! deployment. To change settings, edit the file and restart.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Errno, RslResult};

fn default_threads() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

fn default_object_cache_capacity() -> u32 {
    100_000
}

fn default_txn_cache_capacity() -> u32 {
    10_000
}

fn default_sset_block_size() -> u32 {
    8 << 10
}

fn default_sset_block_merge_fraction() -> f32 {
    0.75
}

fn default_sset_sync_threshold() -> u32 {
    1 << 10
}

fn default_avl_page_size() -> u32 {
    64 << 10
}

fn default_txn_idle_eviction_seconds() -> u32 {
    60
}

/// Engine configuration
///
/// Loadable from a TOML file; unrecognized keys are rejected.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Worker threads for the task scheduler (default: CPU count)
    #[serde(default = "default_threads")]
    pub threads: u32,

    /// Object cache capacity in entries
    #[serde(default = "default_object_cache_capacity")]
    pub object_cache_capacity: u32,

    /// Transaction cache capacity in entries
    #[serde(default = "default_txn_cache_capacity")]
    pub txn_cache_capacity: u32,

    /// Sorted-set block size in bytes
    #[serde(default = "default_sset_block_size")]
    pub sset_block_size: u32,

    /// Fill fraction below which a neighbour block joins a sync merge
    #[serde(default = "default_sset_block_merge_fraction")]
    pub sset_block_merge_fraction: f32,

    /// Per-node write-buffer size that schedules a sync pass
    #[serde(default = "default_sset_sync_threshold")]
    pub sset_sync_threshold: u32,

    /// COW-AVL page size in bytes
    #[serde(default = "default_avl_page_size")]
    pub avl_page_size: u32,

    /// Idle age after which the txn-cache evict hook flags a transaction
    #[serde(default = "default_txn_idle_eviction_seconds")]
    pub txn_idle_eviction_seconds: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            threads: default_threads(),
            object_cache_capacity: default_object_cache_capacity(),
            txn_cache_capacity: default_txn_cache_capacity(),
            sset_block_size: default_sset_block_size(),
            sset_block_merge_fraction: default_sset_block_merge_fraction(),
            sset_sync_threshold: default_sset_sync_threshold(),
            avl_page_size: default_avl_page_size(),
            txn_idle_eviction_seconds: default_txn_idle_eviction_seconds(),
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file
    ///
    /// Missing keys take their defaults; unknown keys fail the load.
    pub fn load(path: &Path) -> RslResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|_| Errno::ObjectNotFound)?;
        let config: EngineConfig = toml::from_str(&text).map_err(|_| Errno::NotImplemented)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> RslResult<()> {
        if self.threads == 0
            || self.object_cache_capacity == 0
            || self.txn_cache_capacity == 0
            || self.sset_block_size < 64
            || self.avl_page_size < 512
        {
            return Err(Errno::NotImplemented);
        }
        if !(0.0..=1.0).contains(&self.sset_block_merge_fraction) {
            return Err(Errno::NotImplemented);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.object_cache_capacity, 100_000);
        assert_eq!(config.txn_cache_capacity, 10_000);
        assert_eq!(config.sset_block_size, 8192);
        assert_eq!(config.sset_sync_threshold, 1024);
        assert_eq!(config.avl_page_size, 65536);
        assert_eq!(config.txn_idle_eviction_seconds, 60);
        assert!(config.threads >= 1);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "threads = 2\nsset_block_size = 4096").unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.threads, 2);
        assert_eq!(config.sset_block_size, 4096);
        assert_eq!(config.txn_cache_capacity, 10_000);
    }

    #[test]
    fn test_unknown_key_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "no_such_option = 1").unwrap();
        assert!(EngineConfig::load(file.path()).is_err());
    }

    #[test]
    fn test_zero_threads_rejected() {
        let config = EngineConfig {
            threads: 0,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_merge_fraction_bounds() {
        let config = EngineConfig {
            sset_block_merge_fraction: 1.5,
            ..EngineConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
