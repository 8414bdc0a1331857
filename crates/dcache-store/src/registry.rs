//! Per-store bookkeeping of exclusive claims.
//!
//! The OS lock is what keeps other processes out; this registry only remembers
//! which paths *this* store created and locked, which thread claimed each one,
//! and keeps their descriptors open so the locks stay held.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use fs2::FileExt;

/// Outcome of an exclusive claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The path did not exist; it is now created and exclusively locked by us.
    Acquired,
    /// The path already exists: another holder is populating it, or it is populated.
    Exists,
}

#[derive(Debug)]
struct Held {
    file: File,
    owner: ThreadId,
}

/// Mutex-guarded map of path → descriptor holding the exclusive lock.
///
/// A claim belongs to the thread that acquired it. Other threads sharing the
/// registry see the path as claimed but not as theirs.
#[derive(Debug, Default)]
pub struct LockRegistry {
    claims: Mutex<HashMap<PathBuf, Held>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn claims(&self) -> MutexGuard<'_, HashMap<PathBuf, Held>> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create `path` exclusively and take a blocking exclusive lock on it.
    ///
    /// The descriptor is recorded before the lock is requested, so a failed
    /// lock call still leaves the entry for `cleanup` to release. Creation and
    /// locking happen under the registry mutex, so sibling threads never see
    /// the new file unlocked.
    pub fn acquire_exclusive(&self, path: &Path) -> io::Result<Claim> {
        let mut claims = self.claims();

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o644)
            .open(path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(Claim::Exists),
            Err(e) => return Err(e),
        };

        // A claim whose file was unlinked from under it is superseded.
        claims.remove(path);
        let held = claims.entry(path.to_path_buf()).or_insert(Held {
            file,
            owner: thread::current().id(),
        });
        FileExt::lock_exclusive(&held.file)?;
        Ok(Claim::Acquired)
    }

    /// Whether the calling thread holds the claim for `path`.
    pub fn holds(&self, path: &Path) -> bool {
        let me = thread::current().id();
        self.claims().get(path).is_some_and(|held| held.owner == me)
    }

    /// Whether any thread sharing this registry holds the claim for `path`.
    pub fn is_claimed(&self, path: &Path) -> bool {
        self.claims().contains_key(path)
    }

    /// Remove the calling thread's claim on `path`, handing back its
    /// still-locked descriptor. Claims of other threads are left alone.
    pub fn take(&self, path: &Path) -> Option<File> {
        let me = thread::current().id();
        let mut claims = self.claims();
        match claims.get(path) {
            Some(held) if held.owner == me => claims.remove(path).map(|held| held.file),
            _ => None,
        }
    }

    /// Remove the claim on `path` whichever thread made it.
    pub fn take_any(&self, path: &Path) -> Option<File> {
        self.claims().remove(path).map(|held| held.file)
    }

    /// Drop the calling thread's claim on `path`. Closing the descriptor
    /// releases its lock.
    pub fn release(&self, path: &Path) -> bool {
        self.take(path).is_some()
    }

    /// Snapshot of every held path.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.claims().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.claims().len()
    }

    pub fn is_empty(&self) -> bool {
        self.claims().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;
    use nix::fcntl::{Flock, FlockArg};
    use tempfile::TempDir;

    #[test]
    fn test_acquire_then_exists() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("entry");
        let registry = LockRegistry::new();

        assert_eq!(registry.acquire_exclusive(&path).unwrap(), Claim::Acquired);
        assert!(path.exists());
        assert!(registry.holds(&path));

        // Second attempt, from this registry or another, sees the file.
        assert_eq!(registry.acquire_exclusive(&path).unwrap(), Claim::Exists);
        let other = LockRegistry::new();
        assert_eq!(other.acquire_exclusive(&path).unwrap(), Claim::Exists);
        assert!(!other.holds(&path));
    }

    #[test]
    fn test_claim_blocks_shared_lock_until_release() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("entry");
        let registry = LockRegistry::new();
        registry.acquire_exclusive(&path).unwrap();

        let reader = match Flock::lock(File::open(&path).unwrap(), FlockArg::LockSharedNonblock) {
            Ok(_) => panic!("shared lock granted while claim is held"),
            Err((reader, errno)) => {
                assert_eq!(errno, Errno::EWOULDBLOCK);
                reader
            }
        };

        assert!(registry.release(&path));
        assert!(!registry.holds(&path));
        assert!(Flock::lock(reader, FlockArg::LockSharedNonblock).is_ok());
    }

    #[test]
    fn test_missing_parent_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("no").join("such").join("entry");
        let registry = LockRegistry::new();

        let err = registry.acquire_exclusive(&path).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_paths_snapshot() {
        let temp = TempDir::new().unwrap();
        let registry = LockRegistry::new();
        let a = temp.path().join("a");
        let b = temp.path().join("b");
        registry.acquire_exclusive(&a).unwrap();
        registry.acquire_exclusive(&b).unwrap();

        let mut paths = registry.paths();
        paths.sort();
        assert_eq!(paths, vec![a.clone(), b]);
        assert_eq!(registry.len(), 2);

        assert!(registry.take(&a).is_some());
        assert!(registry.take(&a).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_claims_belong_to_the_claiming_thread() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("entry");
        let registry = LockRegistry::new();
        registry.acquire_exclusive(&path).unwrap();

        std::thread::scope(|s| {
            s.spawn(|| {
                assert!(!registry.holds(&path));
                assert!(registry.is_claimed(&path));
                assert!(registry.take(&path).is_none());
                assert_eq!(registry.acquire_exclusive(&path).unwrap(), Claim::Exists);
            });
        });

        assert!(registry.holds(&path));
        assert_eq!(registry.len(), 1);

        std::thread::scope(|s| {
            s.spawn(|| assert!(registry.take_any(&path).is_some()));
        });
        assert!(!registry.is_claimed(&path));
    }
}
