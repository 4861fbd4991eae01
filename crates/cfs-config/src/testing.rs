//! Test environment abstraction for isolated testing.
//!
//! Provides `TestTree` to manage:
//! - A temporary build-tree root
//! - A sibling directory outside the tree
//! - A unique collector socket path
//!
//! # Usage
//!
//! ```ignore
//! use cfs_config::testing::TestTree;
//!
//! let tree = TestTree::new()?;
//! let config = tree.config();
//! // tree.root is in-tree, tree.outside is not
//! ```

use crate::{Config, InterposerConfig, LoggingConfig};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use tempfile::TempDir;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated build tree with unique paths
pub struct TestTree {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Canonical build-tree root
    pub root: PathBuf,
    /// Canonical directory next to the root, outside the tree
    pub outside: PathBuf,
    /// Unique collector socket path for this test
    pub socket_path: PathBuf,
    /// Unique test ID
    pub test_id: u32,
}

impl TestTree {
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;
        let base = temp_dir.path().canonicalize()?;

        let root = base.join("build");
        let outside = base.join("outside");
        std::fs::create_dir_all(&root)?;
        std::fs::create_dir_all(&outside)?;

        let socket_path = base.join(format!("cfs-test-{}.sock", test_id));

        Ok(Self {
            _temp_dir: temp_dir,
            root,
            outside,
            socket_path,
            test_id,
        })
    }

    /// Config with this tree as the only root and its socket as the collector.
    pub fn config(&self) -> Config {
        Config {
            interposer: InterposerConfig {
                roots: vec![self.root.clone()],
                collector: Some(self.socket_path.clone()),
                ..InterposerConfig::default()
            },
            logging: LoggingConfig::default(),
        }
    }

    /// Config whose collector socket does not exist.
    pub fn config_without_collector(&self) -> Config {
        let mut config = self.config();
        config.interposer.collector = Some(self.root.join("no-such-collector.sock"));
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tree_layout() {
        let tree = TestTree::new().unwrap();
        assert!(tree.root.is_dir());
        assert!(tree.outside.is_dir());
        assert!(!tree.outside.starts_with(&tree.root));
        assert_eq!(tree.config().interposer.roots, vec![tree.root.clone()]);
    }

    #[test]
    fn test_unique_sockets() {
        let a = TestTree::new().unwrap();
        let b = TestTree::new().unwrap();
        assert_ne!(a.socket_path, b.socket_path);
    }
}
