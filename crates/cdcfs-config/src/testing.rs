//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - A temporary volume image path
//! - A scratch directory for host-side source files
//! - A project-local `.cdcfs/config.toml` location
//!
//! # Usage
//!
//! ```ignore
//! use cdcfs_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     let src = env.create_host_file("a.bin", b"hello").unwrap();
//!     // env.image_path is unique to this test
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Volume image path for this test (not created)
    pub image_path: PathBuf,
    /// Directory for host files to import
    pub host_dir: PathBuf,
    /// Directory holding `config.toml`
    pub config_dir: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path();

        let host_dir = root.join("host");
        let config_dir = root.join(".cdcfs");
        std::fs::create_dir_all(&host_dir)?;
        std::fs::create_dir_all(&config_dir)?;

        let image_path = root.join(format!("cdcfs-test-{}.img", test_id));

        Ok(Self {
            _temp_dir: temp_dir,
            image_path,
            host_dir,
            config_dir,
            test_id,
        })
    }

    /// Root of the environment; also the working directory for CLI runs
    pub fn root(&self) -> &std::path::Path {
        self._temp_dir.path()
    }

    /// Create a host file with content
    pub fn create_host_file(&self, name: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.host_dir.join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    /// Write the project config file
    pub fn write_config(&self, contents: &str) -> anyhow::Result<PathBuf> {
        let path = self.config_path();
        std::fs::write(&path, contents)?;
        Ok(path)
    }

    /// Path of the project config file
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_directories() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.host_dir.exists());
        assert!(env.config_dir.exists());
        assert!(!env.image_path.exists());
    }

    #[test]
    fn test_environment_has_unique_image() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.image_path, env2.image_path);
    }

    #[test]
    fn test_create_host_file() {
        let env = TestEnvironment::new().unwrap();
        let path = env.create_host_file("nested/data.bin", b"payload").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");
    }

    #[test]
    fn test_write_config_loads() {
        let env = TestEnvironment::new().unwrap();
        let path = env
            .write_config("[store]\nverify_payload = false\n")
            .unwrap();
        let config = crate::Config::load_layered(&[path]).unwrap();
        assert!(!config.store.verify_payload);
    }
}
