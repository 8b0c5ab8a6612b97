//! # cdcfs-config
//!
//! Configuration management for cdcfs.
//!
//! Loads configuration from:
//! 1. `~/.cdcfs/config.toml` (global)
//! 2. `.cdcfs/config.toml` (project-local, overrides global key by key)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use tracing::debug;

/// Default gear mask (15 bits set): about one cut candidate per 32 KiB scanned.
pub const DEFAULT_GEAR_MASK: u64 = 0x0003_5907_0353_0000;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(PoisonError::into_inner)
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    *CONFIG.write().unwrap_or_else(PoisonError::into_inner) = new_config;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub volume: VolumeConfig,
    pub chunking: ChunkingConfig,
    pub store: StoreConfig,
    pub ingest: IngestConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut layers = Vec::new();
        if let Some(global_path) = Self::global_config_path() {
            layers.push(global_path);
        }
        layers.push(PathBuf::from(".cdcfs/config.toml"));

        let mut config = Self::load_layered(&layers)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load and merge the given files in order; later files win per key.
    /// Missing files are skipped.
    pub fn load_layered<P: AsRef<Path>>(paths: &[P]) -> Result<Self, ConfigError> {
        let mut merged = toml::Table::new();
        for path in paths {
            let path = path.as_ref();
            if !path.exists() {
                continue;
            }
            debug!("Loading config layer from {:?}", path);
            let contents = std::fs::read_to_string(path)?;
            let layer: toml::Table = toml::from_str(&contents)?;
            merge_tables(&mut merged, layer);
        }
        Ok(toml::Value::Table(merged).try_into()?)
    }

    /// Global config path: ~/.cdcfs/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".cdcfs/config.toml"))
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(threads) = std::env::var("CDCFS_THREADS") {
            if let Ok(n) = threads.parse() {
                self.ingest.threads = Some(n);
            }
        }
        if let Ok(verify) = std::env::var("CDCFS_VERIFY") {
            match verify.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.store.verify_payload = true,
                "0" | "false" | "no" | "off" => self.store.verify_payload = false,
                _ => {}
            }
        }
        if let Ok(blocks) = std::env::var("CDCFS_CACHE_BLOCKS") {
            if let Ok(n) = blocks.parse() {
                self.volume.cache_blocks = n;
            }
        }
    }

    /// Reject values the on-disk format cannot represent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let v = &self.volume;
        if !v.block_size.is_power_of_two() || !(512..=65536).contains(&v.block_size) {
            return Err(ConfigError::Invalid(format!(
                "volume.block_size must be a power of two in 512..=65536, got {}",
                v.block_size
            )));
        }
        if v.hashtable_size == 0 || v.hashtable_size % 8 != 0 {
            return Err(ConfigError::Invalid(format!(
                "volume.hashtable_size must be a non-zero multiple of 8, got {}",
                v.hashtable_size
            )));
        }
        if !(1..=99).contains(&v.heap_percent) {
            return Err(ConfigError::Invalid(format!(
                "volume.heap_percent must be within 1..=99, got {}",
                v.heap_percent
            )));
        }
        if v.inode_count == 0 {
            return Err(ConfigError::Invalid("volume.inode_count must be > 0".into()));
        }

        let c = &self.chunking;
        if c.min_size == 0 || c.min_size >= c.normal_size || c.normal_size > c.max_size {
            return Err(ConfigError::Invalid(format!(
                "chunking sizes must satisfy 0 < min < normal <= max, got {}/{}/{}",
                c.min_size, c.normal_size, c.max_size
            )));
        }
        Ok(())
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        Config::default().to_toml()
    }

    /// Render this config as pretty TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }
}

fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        if let toml::Value::Table(incoming) = value {
            if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                merge_tables(existing, incoming);
                continue;
            }
            base.insert(key, toml::Value::Table(incoming));
        } else {
            base.insert(key, value);
        }
    }
}

/// Volume layout used by `mkfs`, plus runtime cache sizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Device block size in bytes
    pub block_size: u32,
    /// Number of inodes in the inode table
    pub inode_count: u32,
    /// Chunk-store hash table size in bytes (8 bytes per bucket)
    pub hashtable_size: u32,
    /// Share of the device given to the hash table and chunk heap
    pub heap_percent: u8,
    /// Buffer cache capacity in blocks
    pub cache_blocks: usize,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            block_size: 1024,
            inode_count: 128,
            hashtable_size: 32 * 1024,
            heap_percent: 50,
            cache_blocks: 8192,
        }
    }
}

/// Content-defined chunking bounds.
///
/// These must not change for a populated volume, or identical content
/// stops producing identical chunk boundaries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub min_size: u32,
    pub normal_size: u32,
    pub max_size: u32,
    /// Mask tested below `normal_size`
    pub mask_small: u64,
    /// Mask tested from `normal_size` up to `max_size`
    pub mask_large: u64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_size: 2 * 1024,
            normal_size: 8 * 1024,
            max_size: 64 * 1024,
            mask_small: DEFAULT_GEAR_MASK,
            mask_large: DEFAULT_GEAR_MASK,
        }
    }
}

/// Chunk store behaviour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Compare payload bytes before accepting a hash match as a duplicate
    pub verify_payload: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            verify_payload: true,
        }
    }
}

/// Ingest configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Number of parallel chunking threads (None = auto)
    pub threads: Option<usize>,
}
