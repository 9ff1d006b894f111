//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - A private scratch directory per test
//! - Unique container file paths
//! - Driver configurations for buffered and alignment-forced handles
//!
//! # Usage
//!
//! ```ignore
//! use ohstore_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let path = env.data_file("scratch.h5");
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::DriverConfig;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Directory holding container files
    pub data_dir: PathBuf,
    /// Project root, used for `.ohstore/config.toml`
    pub project_root: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let data_dir = root.join("data");
        let project_root = root.join("project");
        std::fs::create_dir_all(&data_dir)?;
        std::fs::create_dir_all(project_root.join(".ohstore"))?;

        Ok(Self {
            _temp_dir: temp_dir,
            data_dir,
            project_root,
            test_id,
        })
    }

    /// Path of a container file unique to this environment (not created)
    pub fn data_file(&self, name: &str) -> PathBuf {
        self.data_dir.join(format!("{}-{}", self.test_id, name))
    }

    /// Create a test file with content
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.data_dir.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Write the project-local config file
    pub fn write_project_config(&self, toml: &str) -> anyhow::Result<PathBuf> {
        let path = self.project_root.join(".ohstore/config.toml");
        std::fs::write(&path, toml)?;
        Ok(path)
    }

    /// Driver settings for a plain buffered handle (no staging path)
    pub fn buffered_config(&self) -> DriverConfig {
        DriverConfig {
            direct_io: false,
            ..DriverConfig::default()
        }
    }

    /// Driver settings that route every unaligned transfer through staging,
    /// without requiring a file system that accepts O_DIRECT.
    pub fn aligned_config(&self, block_size: usize, copy_buffer: usize) -> DriverConfig {
        DriverConfig {
            memory_boundary: block_size,
            file_block_size: block_size,
            max_copy_buffer_size: copy_buffer,
            direct_io: false,
            force_alignment: true,
        }
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.data_dir.exists());
        assert!(env.project_root.join(".ohstore").exists());
    }

    #[test]
    fn test_environment_has_unique_files() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.data_file("a.h5"), env2.data_file("a.h5"));
    }

    #[test]
    fn test_create_file() {
        let env = TestEnvironment::new().unwrap();
        let path = env.create_file("nested/blob.bin", b"\x01\x02").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"\x01\x02");
    }

    #[test]
    fn test_aligned_config_is_valid() {
        let env = TestEnvironment::new().unwrap();
        let cfg = env.aligned_config(512, 512 * 4);
        assert!(cfg.force_alignment);
        assert!(cfg.validate().is_ok());
    }
}
