//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage:
//! - A temporary cache root
//! - A config pointing at it, with short lock backoff so waits stay fast
//!
//! # Usage
//!
//! ```ignore
//! use dcache_config::testing::TestEnvironment;
//!
//! #[test]
//! fn test_something() {
//!     let env = TestEnvironment::new().unwrap();
//!     // env.cache_root and env.config are isolated per test
//! }
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

use crate::Config;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated cache directory plus matching config
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Isolated cache root
    pub cache_root: PathBuf,
    /// Config rooted at `cache_root`
    pub config: Config,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let cache_root = temp_dir.path().join("cache");
        std::fs::create_dir_all(&cache_root)?;

        let mut config = Config::default();
        config.storage.root = cache_root.clone();
        config.locking.timeout_secs = 5;
        config.locking.initial_backoff_ms = 10;
        config.locking.max_backoff_ms = 100;

        Ok(Self {
            _temp_dir: temp_dir,
            cache_root,
            config,
            test_id,
        })
    }

    /// Same environment with a different shard layout.
    pub fn with_shards(mut self, shards: Vec<(usize, usize)>) -> Self {
        self.config.storage.shards = shards;
        self
    }

    /// Count directories under the cache root, excluding the root itself.
    pub fn count_dirs(&self) -> anyhow::Result<usize> {
        fn walk(dir: &std::path::Path) -> std::io::Result<usize> {
            let mut count = 0;
            for entry in std::fs::read_dir(dir)? {
                let entry = entry?;
                if entry.file_type()?.is_dir() {
                    count += 1 + walk(&entry.path())?;
                }
            }
            Ok(count)
        }
        Ok(walk(&self.cache_root)?)
    }
}
