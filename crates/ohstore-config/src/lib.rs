//! # ohstore-config
//!
//! Configuration management for ohstore.
//!
//! Loads configuration from:
//! 1. `~/.ohstore/config.toml` (global)
//! 2. `.ohstore/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get global config (read-only)
pub fn config() -> std::sync::RwLockReadGuard<'static, Config> {
    CONFIG.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    new_config.validate()?;
    *CONFIG.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = new_config;
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
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub driver: DriverConfig,
    pub header: HeaderConfig,
    pub share: ShareConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Load global config (~/.ohstore/config.toml)
        if let Some(global_path) = Self::global_config_path() {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                config = Self::from_file(&global_path)?;
            }
        }

        // 2. Load project config (.ohstore/config.toml) - overrides global
        let project_path = Path::new(".ohstore/config.toml");
        if project_path.exists() {
            debug!("Loading project config from {:?}", project_path);
            let project_config = Self::from_file(project_path)?;
            config.merge(project_config);
        }

        // 3. Apply environment variable overrides
        config.apply_env_overrides();

        Ok(config)
    }

    /// Parse a single config file without consulting other sources
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Global config path: ~/.ohstore/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".ohstore/config.toml"))
    }

    /// Merge another config (project overrides).
    ///
    /// Fields still holding their default value in `other` are treated as unset.
    pub fn merge(&mut self, other: Config) {
        let driver = DriverConfig::default();
        if other.driver.memory_boundary != driver.memory_boundary {
            self.driver.memory_boundary = other.driver.memory_boundary;
        }
        if other.driver.file_block_size != driver.file_block_size {
            self.driver.file_block_size = other.driver.file_block_size;
        }
        if other.driver.max_copy_buffer_size != driver.max_copy_buffer_size {
            self.driver.max_copy_buffer_size = other.driver.max_copy_buffer_size;
        }
        if other.driver.direct_io != driver.direct_io {
            self.driver.direct_io = other.driver.direct_io;
        }
        if other.driver.force_alignment != driver.force_alignment {
            self.driver.force_alignment = other.driver.force_alignment;
        }

        let header = HeaderConfig::default();
        if other.header.version != header.version {
            self.header.version = other.header.version;
        }
        if other.header.track_creation_order != header.track_creation_order {
            self.header.track_creation_order = other.header.track_creation_order;
        }
        if other.header.store_times != header.store_times {
            self.header.store_times = other.header.store_times;
        }
        if other.header.initial_chunk_size != header.initial_chunk_size {
            self.header.initial_chunk_size = other.header.initial_chunk_size;
        }
        if other.header.max_chunk_size != header.max_chunk_size {
            self.header.max_chunk_size = other.header.max_chunk_size;
        }

        let share = ShareConfig::default();
        if other.share.enabled != share.enabled {
            self.share.enabled = other.share.enabled;
        }
        if other.share.min_message_size != share.min_message_size {
            self.share.min_message_size = other.share.min_message_size;
        }
        if other.share.types != share.types {
            self.share.types = other.share.types;
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        if let Some(n) = env_number("OHSTORE_MEM_BOUNDARY") {
            self.driver.memory_boundary = n;
        }
        if let Some(n) = env_number("OHSTORE_BLOCK_SIZE") {
            self.driver.file_block_size = n;
        }
        if let Some(n) = env_number("OHSTORE_COPY_BUFFER") {
            self.driver.max_copy_buffer_size = n;
        }
        if let Ok(flag) = std::env::var("OHSTORE_DIRECT_IO") {
            self.driver.direct_io = !matches!(flag.as_str(), "0" | "false" | "off" | "no");
        }
        if let Some(n) = env_number("OHSTORE_HEADER_VERSION") {
            if let Ok(version) = u8::try_from(n) {
                self.header.version = version;
            }
        }
    }

    /// Check cross-field constraints that serde defaults cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.driver.validate()?;
        self.header.validate()
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

fn env_number(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Aligned I/O driver configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Required alignment of memory buffers handed to the kernel
    pub memory_boundary: usize,
    /// File system block size; offsets and lengths are multiples of it
    pub file_block_size: usize,
    /// Upper bound for the staging buffer used by unaligned transfers
    pub max_copy_buffer_size: usize,
    /// Request uncached I/O (O_DIRECT / F_NOCACHE) when opening
    pub direct_io: bool,
    /// Treat every handle as alignment-constrained regardless of the open probe
    pub force_alignment: bool,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            memory_boundary: 4096,
            file_block_size: 4096,
            max_copy_buffer_size: 16 * 1024 * 1024,
            direct_io: true,
            force_alignment: false,
        }
    }
}

impl DriverConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.file_block_size == 0 {
            return Err(ConfigError::Invalid("file_block_size must be non-zero".into()));
        }
        if !self.memory_boundary.is_power_of_two() {
            return Err(ConfigError::Invalid(format!(
                "memory_boundary {} is not a power of two",
                self.memory_boundary
            )));
        }
        if self.max_copy_buffer_size == 0 || self.max_copy_buffer_size % self.file_block_size != 0 {
            return Err(ConfigError::Invalid(format!(
                "max_copy_buffer_size {} must be a multiple of file_block_size {}",
                self.max_copy_buffer_size, self.file_block_size
            )));
        }
        Ok(())
    }
}

/// Object header layout configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderConfig {
    /// On-disk header format version (1 or 2)
    pub version: u8,
    /// Record creation indices in version 2 message prefixes
    pub track_creation_order: bool,
    /// Keep access/modification times in the version 2 header
    pub store_times: bool,
    /// Size of the first chunk of a new header
    pub initial_chunk_size: usize,
    /// Chunks are never grown past this size; a new chunk is started instead
    pub max_chunk_size: usize,
}

impl Default for HeaderConfig {
    fn default() -> Self {
        Self {
            version: 2,
            track_creation_order: false,
            store_times: false,
            initial_chunk_size: 256,
            max_chunk_size: 64 * 1024,
        }
    }
}

impl HeaderConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.version, 1 | 2) {
            return Err(ConfigError::Invalid(format!(
                "unsupported header version {}",
                self.version
            )));
        }
        if self.initial_chunk_size == 0 || self.initial_chunk_size > self.max_chunk_size {
            return Err(ConfigError::Invalid(format!(
                "initial_chunk_size {} must be in 1..={}",
                self.initial_chunk_size, self.max_chunk_size
            )));
        }
        Ok(())
    }
}

/// Shared-message heap policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShareConfig {
    /// Enable shared-message deduplication
    pub enabled: bool,
    /// Messages whose encoded payload is smaller than this stay in the header
    pub min_message_size: usize,
    /// Message type names eligible for the shared heap
    pub types: Vec<String>,
}

impl Default for ShareConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_message_size: 0,
            types: vec![
                "dataspace".to_string(),
                "fill_value".to_string(),
                "attribute".to_string(),
            ],
        }
    }
}
