use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use dcache_config::{log_store_debug, log_store_error, log_store_warn, Config};
use fs2::FileExt;
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg};
use tracing::instrument;

use crate::layout::ShardLayout;
use crate::reader::{CacheReader, Content};
use crate::registry::{Claim, LockRegistry};
use crate::{CacheError, Result};

/// How long `get` waits for a busy entry when the caller has no preference.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(600);

/// Read size when copying a streamed body into the cache.
const CHUNK_SIZE: usize = 8192;

const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Floor for the first poll sleep; a zero delay would never grow.
const MIN_BACKOFF: Duration = Duration::from_millis(1);

/// Construction-time settings for a [`CacheStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub layout: ShardLayout,
    /// Pre-create every shard directory when the store is opened.
    pub create_dirs: bool,
    /// First sleep between shared lock attempts in `get`.
    pub initial_backoff: Duration,
    /// Ceiling for the doubling sleep.
    pub max_backoff: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            layout: ShardLayout::default(),
            create_dirs: false,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl StoreOptions {
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            layout: ShardLayout::new(&config.storage.shards)?,
            create_dirs: config.storage.create_dirs,
            ..Self::default()
        }
        .with_backoff(
            config.locking.initial_backoff(),
            config.locking.max_backoff(),
        ))
    }

    pub fn with_layout(mut self, layout: ShardLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_create_dirs(mut self, create_dirs: bool) -> Self {
        self.create_dirs = create_dirs;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial.max(MIN_BACKOFF);
        self.max_backoff = max.max(self.initial_backoff);
        self
    }
}

/// Cache handle over one root directory.
///
/// Each store owns its own claim registry. Two stores in one process behave
/// like two processes: their descriptors are independent, so `flock`
/// arbitrates between them. A store may also be shared between threads: a
/// claim belongs to the thread whose `get` acquired it, and sibling threads
/// wait for it like any other process would. Claims still held when the
/// store is dropped are released as by [`CacheStore::cleanup`].
#[derive(Debug)]
pub struct CacheStore {
    root: PathBuf,
    options: StoreOptions,
    registry: LockRegistry,
    tree_created: bool,
}

impl CacheStore {
    /// Open a store rooted at `root`, creating the shard tree if requested.
    pub fn new<P: AsRef<Path>>(root: P, options: StoreOptions) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let tree_created = if options.create_dirs {
            options.layout.ensure_tree(&root)?
        } else {
            false
        };
        Ok(Self {
            root,
            options,
            registry: LockRegistry::new(),
            tree_created,
        })
    }

    /// Open the store described by `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(
            config.storage.resolved_root(),
            StoreOptions::from_config(config)?,
        )
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layout(&self) -> &ShardLayout {
        &self.options.layout
    }

    /// Whether opening this store created the shard tree.
    pub fn tree_created(&self) -> bool {
        self.tree_created
    }

    /// Full path of the entry for `key`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(self.options.layout.relative_path(key))
    }

    /// Whether the calling thread holds this store's exclusive claim for `key`.
    pub fn holds_claim(&self, key: &str) -> bool {
        self.registry.holds(&self.path_for(key))
    }

    /// Number of claims this store currently holds, across all threads.
    pub fn claim_count(&self) -> usize {
        self.registry.len()
    }

    /// Look up `key`.
    ///
    /// - `Some(reader)`: the entry is committed; the reader starts at the
    ///   header and keeps a shared lock until dropped.
    /// - `None` with [`holds_claim`](Self::holds_claim) true: the entry was
    ///   absent and the calling thread now owns it. Fetch it, then call `set`
    ///   (or `release`/`cleanup` to give up). Asking again from the same
    ///   thread returns this miss immediately; other threads wait.
    /// - `None` otherwise: the entry was an empty placeholder, or stayed
    ///   locked for longer than `timeout`.
    #[instrument(skip(self), level = "debug")]
    pub fn get(&self, key: &str, timeout: Duration) -> Result<Option<CacheReader>> {
        let path = self.path_for(key);

        if self.registry.holds(&path) {
            return Ok(None);
        }

        if self.claim(&path)? == Claim::Acquired {
            log_store_debug!("Claimed cache entry", path = path.display().to_string());
            return Ok(None);
        }

        let file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) => {
                log_store_error!(
                    "Unknown error opening cache file",
                    path = path.display().to_string(),
                    error = e.to_string(),
                );
                return Err(CacheError::fs("open", path, e));
            }
        };

        self.wait_for_shared(file, &path, timeout)
    }

    /// Poll for a shared lock with exponential backoff until `timeout`.
    /// At least one attempt is made, so a zero timeout still reads
    /// committed entries.
    fn wait_for_shared(
        &self,
        mut file: File,
        path: &Path,
        timeout: Duration,
    ) -> Result<Option<CacheReader>> {
        let start = Instant::now();
        let mut delay = self.options.initial_backoff;

        loop {
            match Flock::lock(file, FlockArg::LockSharedNonblock) {
                Ok(guard) => {
                    let size = match guard.metadata() {
                        Ok(meta) => meta.len(),
                        Err(e) => {
                            log_store_error!(
                                "Could not stat cache file",
                                path = path.display().to_string(),
                                error = e.to_string(),
                            );
                            return Err(CacheError::fs("stat", path, e));
                        }
                    };
                    if size == 0 {
                        log_store_debug!(
                            "Empty placeholder treated as miss",
                            path = path.display().to_string(),
                        );
                        return Ok(None);
                    }
                    return Ok(Some(CacheReader::shared(guard)));
                }
                Err((returned, errno)) if errno == Errno::EWOULDBLOCK => {
                    let elapsed = start.elapsed();
                    if elapsed >= timeout {
                        log_store_warn!(
                            "Timed out waiting for cache entry",
                            path = path.display().to_string(),
                            waited_ms = elapsed.as_millis() as u64,
                        );
                        return Ok(None);
                    }
                    thread::sleep(delay.min(timeout - elapsed));
                    delay = (delay * 2).min(self.options.max_backoff);
                    file = returned;
                }
                Err((_, errno)) => {
                    log_store_error!(
                        "Unknown error trying to share lock file",
                        path = path.display().to_string(),
                        error = errno.to_string(),
                    );
                    return Err(CacheError::Lock {
                        path: path.to_path_buf(),
                        source: errno,
                    });
                }
            }
        }
    }

    /// Exclusive create of `path`, creating missing shard directories once.
    fn claim(&self, path: &Path) -> Result<Claim> {
        let attempt = match self.registry.acquire_exclusive(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    if let Err(e) = fs::create_dir_all(parent) {
                        log_store_error!(
                            "Could not create shard directory",
                            path = parent.display().to_string(),
                            error = e.to_string(),
                        );
                        return Err(CacheError::fs("create directory", parent, e));
                    }
                }
                self.registry.acquire_exclusive(path)
            }
            other => other,
        };

        attempt.map_err(|e| {
            log_store_error!(
                "Unknown error creating cache file",
                path = path.display().to_string(),
                error = e.to_string(),
            );
            CacheError::fs("create", path, e)
        })
    }

    /// Commit `header` followed by `content` as the entry for `key`.
    ///
    /// Normally called after `get` returned a claim. Without a claim, the
    /// existing file is unlinked and re-claimed first. Returns a reader
    /// positioned just past the header.
    #[instrument(skip(self, header, content), level = "debug")]
    pub fn set<'c>(
        &self,
        key: &str,
        header: &[u8],
        content: impl Into<Content<'c>>,
    ) -> Result<CacheReader> {
        let path = self.path_for(key);
        let Some(mut file) = self.finish_claim(&path, Some((header, content.into())))? else {
            return Err(CacheError::NotOwner { path });
        };

        if let Err(e) = file.seek(SeekFrom::Start(header.len() as u64)) {
            log_store_error!(
                "Error while rereading cache file after writing it",
                path = path.display().to_string(),
                error = e.to_string(),
            );
            return Err(CacheError::fs("seek", path, e));
        }
        Ok(CacheReader::written(file))
    }

    /// Remove the entry for `key` and drop any claim this store held on it.
    #[instrument(skip(self), level = "debug")]
    pub fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        if let Err(e) = fs::remove_file(&path) {
            log_store_error!(
                "Unknown error removing file",
                path = path.display().to_string(),
                error = e.to_string(),
            );
            return Err(CacheError::fs("remove", path, e));
        }
        self.finish_claim(&path, None)?;
        Ok(())
    }

    /// Give up the claim on `key` without writing, leaving an empty
    /// placeholder. Returns whether a claim was held.
    pub fn release(&self, key: &str) -> Result<bool> {
        let path = self.path_for(key);
        if !self.registry.holds(&path) {
            return Ok(false);
        }
        self.finish_claim(&path, None)?;
        Ok(true)
    }

    /// Release every claim this store still holds without writing to it.
    ///
    /// Released entries stay on disk as empty placeholders. Every claim is
    /// released even if some fail; the first failure is returned.
    pub fn cleanup(&self) -> Result<()> {
        let mut first_err = None;
        for path in self.registry.paths() {
            let Some(file) = self.registry.take_any(&path) else {
                continue;
            };
            if let Err(e) = unlock(&path, &file) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// End the claim on `path`: write the payload if there is one, then
    /// release the exclusive lock and forget the entry.
    ///
    /// Returns the written descriptor, or `None` when there was nothing to
    /// write.
    fn finish_claim(
        &self,
        path: &Path,
        payload: Option<(&[u8], Content<'_>)>,
    ) -> Result<Option<File>> {
        if payload.is_some() && !self.registry.holds(path) {
            if self.registry.is_claimed(path) {
                log_store_error!(
                    "Entry is being written by another thread of this store",
                    path = path.display().to_string(),
                );
                return Err(CacheError::NotOwner {
                    path: path.to_path_buf(),
                });
            }
            // Stale placeholder or someone else's entry: replace it.
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    log_store_error!(
                        "Unknown error unlinking file",
                        path = path.display().to_string(),
                        error = e.to_string(),
                    );
                    return Err(CacheError::fs("remove", path, e));
                }
            }
            self.claim(path)?;
        }

        let Some(mut file) = self.registry.take(path) else {
            if payload.is_some() {
                log_store_error!(
                    "Invalid setting the cache without locking it first",
                    path = path.display().to_string(),
                );
                return Err(CacheError::NotOwner {
                    path: path.to_path_buf(),
                });
            }
            return Ok(None);
        };

        let Some((header, content)) = payload else {
            return unlock(path, &file).map(|()| None);
        };

        let written = write_entry(&mut file, header, content)
            .and_then(|()| file.sync_data())
            .and_then(|()| FileExt::unlock(&file));
        match written {
            Ok(()) => Ok(Some(file)),
            Err(e) => {
                log_store_error!(
                    "Error while writing cache file",
                    path = path.display().to_string(),
                    error = e.to_string(),
                );
                discard(path, file);
                Err(CacheError::fs("write", path, e))
            }
        }
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        if self.registry.is_empty() {
            return;
        }
        if let Err(e) = self.cleanup() {
            log_store_warn!(
                "Failed to release claims on drop",
                root = self.root.display().to_string(),
                error = e.to_string(),
            );
        }
    }
}

fn unlock(path: &Path, file: &File) -> Result<()> {
    FileExt::unlock(file).map_err(|e| {
        log_store_error!(
            "Could not release cache lock",
            path = path.display().to_string(),
            error = e.to_string(),
        );
        CacheError::fs("unlock", path, e)
    })
}

fn write_entry(file: &mut File, header: &[u8], content: Content<'_>) -> io::Result<()> {
    file.write_all(header)?;
    match content {
        Content::Bytes(bytes) => file.write_all(bytes)?,
        Content::Stream(reader) => {
            let mut buf = [0u8; CHUNK_SIZE];
            loop {
                let n = match reader.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                };
                file.write_all(&buf[..n])?;
            }
        }
    }
    Ok(())
}

/// Best-effort removal of a half-written entry. Closing the descriptor at
/// the end releases the exclusive lock.
fn discard(path: &Path, file: File) {
    let _ = file.set_len(0);
    let _ = fs::remove_file(path);
    drop(file);
}
