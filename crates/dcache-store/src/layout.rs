//! Sharded directory layout.
//!
//! Large flat directories get slow on distributed filesystems, so entries are
//! spread over nested directories named after slices of the key digest. With
//! the default `[(0, 2), (2, 4)]` layout there are 256 × 256 leaf directories.

use std::fs;
use std::io;
use std::ops::Range;
use std::path::{Path, PathBuf};

use dcache_config::{log_layout_error, log_layout_info};
use tracing::instrument;

use crate::codec::{self, DIGEST_HEX_LEN};
use crate::{CacheError, Result};

/// Maps keys to relative paths and materializes the shard tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardLayout {
    ranges: Vec<Range<usize>>,
}

impl Default for ShardLayout {
    fn default() -> Self {
        Self {
            ranges: vec![0..2, 2..4],
        }
    }
}

impl ShardLayout {
    /// Build a layout from half-open `(start, end)` hex digit ranges.
    ///
    /// Ranges may overlap or repeat; each still adds one directory level.
    pub fn new(ranges: &[(usize, usize)]) -> Result<Self> {
        let ranges = ranges
            .iter()
            .map(|&(start, end)| {
                if start >= end {
                    Err(CacheError::InvalidShard {
                        start,
                        end,
                        reason: "range is empty",
                    })
                } else if end > DIGEST_HEX_LEN {
                    Err(CacheError::InvalidShard {
                        start,
                        end,
                        reason: "range exceeds digest length",
                    })
                } else {
                    Ok(start..end)
                }
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { ranges })
    }

    /// Layout with no shard directories: every entry sits in the root.
    pub fn flat() -> Self {
        Self { ranges: Vec::new() }
    }

    pub fn ranges(&self) -> &[Range<usize>] {
        &self.ranges
    }

    /// Number of leaf directories the layout implies.
    pub fn leaf_count(&self) -> u128 {
        self.ranges
            .iter()
            .fold(1u128, |acc, r| {
                acc.saturating_mul(16u128.checked_pow(r.len() as u32).unwrap_or(u128::MAX))
            })
    }

    /// Shard directories for a key, relative to the cache root.
    pub fn shard_dir(&self, key: &str) -> PathBuf {
        let digest = codec::digest(key);
        self.ranges.iter().map(|r| &digest[r.clone()]).collect()
    }

    /// Full relative path of the entry for a key.
    pub fn relative_path(&self, key: &str) -> PathBuf {
        self.shard_dir(key).join(codec::safe_name(key))
    }

    /// Deepest all-`f` directory, the last one `ensure_tree` creates.
    fn sentinel(&self, root: &Path) -> PathBuf {
        self.ranges
            .iter()
            .fold(root.to_path_buf(), |p, r| p.join("f".repeat(r.len())))
    }

    /// Leaf directories `ensure_tree` would create. Layouts too large to
    /// enumerate are rejected.
    fn tree_leaves(&self) -> Result<u64> {
        self.ranges.iter().try_fold(1u64, |acc, r| {
            16u64
                .checked_pow(r.len() as u32)
                .and_then(|n| acc.checked_mul(n))
                .ok_or(CacheError::InvalidShard {
                    start: r.start,
                    end: r.end,
                    reason: "too many directories to pre-create",
                })
        })
    }

    /// Pre-create every shard directory under `root`.
    ///
    /// Returns `false` without touching the tree when the sentinel directory
    /// already exists, `true` when this call did the creation.
    #[instrument(skip(self), level = "debug")]
    pub fn ensure_tree(&self, root: &Path) -> Result<bool> {
        let leaves = self.tree_leaves()?;
        if self.sentinel(root).exists() {
            return Ok(false);
        }
        log_layout_info!(
            "Creating shard tree",
            root = root.display().to_string(),
            leaves = leaves,
        );
        if let Err(e) = fs::create_dir_all(root) {
            log_layout_error!(
                "Could not create cache root",
                path = root.display().to_string(),
                error = e.to_string(),
            );
            return Err(CacheError::fs("create directory", root, e));
        }
        create_level(root, &self.ranges)?;
        Ok(true)
    }
}

fn create_level(dir: &Path, ranges: &[Range<usize>]) -> Result<()> {
    match fs::create_dir(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
        Err(e) => {
            log_layout_error!(
                "Could not create cache subdirectory",
                path = dir.display().to_string(),
                error = e.to_string(),
            );
            return Err(CacheError::fs("create directory", dir, e));
        }
    }

    let Some((first, rest)) = ranges.split_first() else {
        return Ok(());
    };
    // Widths were bounded by `tree_leaves`.
    let width = first.len();
    for i in 0..16u64.pow(width as u32) {
        create_level(&dir.join(format!("{i:0width$x}")), rest)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn count_dirs(dir: &Path) -> usize {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap())
            .filter(|e| e.file_type().unwrap().is_dir())
            .map(|e| 1 + count_dirs(&e.path()))
            .sum()
    }

    #[test]
    fn test_default_layout_path_format() {
        let layout = ShardLayout::default();
        let key = "http://example.com/a.png";
        let digest = codec::digest(key);

        let path = layout.relative_path(key);
        let parts: Vec<_> = path.iter().map(|p| p.to_string_lossy().into_owned()).collect();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], digest[0..2]);
        assert_eq!(parts[1], digest[2..4]);
        assert_eq!(parts[2], codec::safe_name(key));
    }

    #[test]
    fn test_flat_layout_has_no_directories() {
        let layout = ShardLayout::flat();
        assert_eq!(
            layout.relative_path("testfile"),
            PathBuf::from(codec::safe_name("testfile"))
        );
        assert_eq!(layout.leaf_count(), 1);
    }

    #[test]
    fn test_invalid_ranges_rejected() {
        assert!(matches!(
            ShardLayout::new(&[(2, 2)]),
            Err(CacheError::InvalidShard { .. })
        ));
        assert!(matches!(
            ShardLayout::new(&[(30, 33)]),
            Err(CacheError::InvalidShard { .. })
        ));
        assert!(ShardLayout::new(&[(0, 1), (0, 1)]).is_ok());
    }

    #[test]
    fn test_ensure_tree_creates_every_directory_once() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("cache");
        let layout = ShardLayout::new(&[(0, 1), (0, 1)]).unwrap();

        assert!(layout.ensure_tree(&root).unwrap());
        assert_eq!(count_dirs(&root), 16 * 16 + 16);
        assert!(root.join("0").join("a").is_dir());
        assert!(root.join("f").join("f").is_dir());

        // Second call sees the sentinel and skips the walk.
        assert!(!layout.ensure_tree(&root).unwrap());
    }

    #[test]
    fn test_ensure_tree_zero_pads_segments() {
        let temp = TempDir::new().unwrap();
        let layout = ShardLayout::new(&[(0, 2)]).unwrap();

        assert!(layout.ensure_tree(temp.path()).unwrap());
        assert_eq!(count_dirs(temp.path()), 256);
        assert!(temp.path().join("00").is_dir());
        assert!(temp.path().join("0f").is_dir());
    }

    #[test]
    fn test_ensure_tree_rejects_unenumerable_layouts() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("cache");

        for ranges in [&[(0, 16)][..], &[(0, 8), (8, 16)][..]] {
            let layout = ShardLayout::new(ranges).unwrap();
            assert!(matches!(
                layout.ensure_tree(&root),
                Err(CacheError::InvalidShard { .. })
            ));
        }
        assert!(!root.exists());

        // Wide layouts still map keys to paths.
        let layout = ShardLayout::new(&[(0, 32)]).unwrap();
        assert_eq!(layout.leaf_count(), u128::MAX);
        assert_eq!(
            layout.shard_dir("k"),
            PathBuf::from(codec::digest("k"))
        );
    }

    #[test]
    fn test_ensure_tree_creates_missing_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("mnt").join("shared").join("cache");
        let layout = ShardLayout::new(&[(0, 1)]).unwrap();

        assert!(layout.ensure_tree(&root).unwrap());
        assert_eq!(count_dirs(&root), 16);
    }

    #[test]
    fn test_ensure_tree_resumes_partial_tree() {
        let temp = TempDir::new().unwrap();
        let layout = ShardLayout::new(&[(0, 1), (1, 2)]).unwrap();
        fs::create_dir_all(temp.path().join("3").join("7")).unwrap();

        assert!(layout.ensure_tree(temp.path()).unwrap());
        assert_eq!(count_dirs(temp.path()), 16 * 16 + 16);
    }

    #[test]
    fn test_ensure_tree_reports_blocking_file() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("cache");
        fs::create_dir(&root).unwrap();
        // A plain file where a shard directory belongs makes the nested mkdir fail.
        fs::write(root.join("0"), b"").unwrap();

        let layout = ShardLayout::new(&[(0, 1), (1, 2)]).unwrap();
        let err = layout.ensure_tree(&root).unwrap_err();
        assert!(matches!(err, CacheError::Fs { .. }));
    }
}
