//! Read-through helpers for callers that fetch content from elsewhere.
//!
//! The cache never fetches on its own. A [`Fetcher`] supplies the header and
//! body for a key on a miss; these helpers run the get → fetch → set cycle
//! around it.

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use crate::reader::{CacheReader, Content};
use crate::store::{CacheStore, StoreOptions};
use crate::{CacheError, Result};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Response produced by a fetcher.
pub struct Fetched {
    /// Opaque metadata stored in front of the body (e.g. serialized response headers).
    pub header: Vec<u8>,
    pub body: Box<dyn Read + Send>,
}

impl Fetched {
    pub fn new(header: impl Into<Vec<u8>>, body: impl Read + Send + 'static) -> Self {
        Self {
            header: header.into(),
            body: Box::new(body),
        }
    }
}

impl std::fmt::Debug for Fetched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetched")
            .field("header_len", &self.header.len())
            .finish_non_exhaustive()
    }
}

/// Source of entries on a cache miss.
pub trait Fetcher {
    fn fetch(&mut self, key: &str) -> std::result::Result<Fetched, BoxError>;
}

impl<F> Fetcher for F
where
    F: FnMut(&str) -> std::result::Result<Fetched, BoxError>,
{
    fn fetch(&mut self, key: &str) -> std::result::Result<Fetched, BoxError> {
        self(key)
    }
}

/// Result of a read-through request.
#[derive(Debug)]
pub enum FetchOutcome {
    /// Served from the cache. The reader starts at the stored header; only the
    /// fetcher knows where its header ends.
    Cached(CacheReader),
    /// Fetched just now and committed. `content` starts after the header.
    Stored {
        header: Vec<u8>,
        content: CacheReader,
    },
}

impl FetchOutcome {
    pub fn was_cached(&self) -> bool {
        matches!(self, FetchOutcome::Cached(_))
    }

    pub fn into_reader(self) -> CacheReader {
        match self {
            FetchOutcome::Cached(reader) => reader,
            FetchOutcome::Stored { content, .. } => content,
        }
    }
}

/// Serve `key` from `store`, fetching and committing it on a miss.
///
/// A miss after a timed-out wait also fetches and overwrites the entry; see
/// the notes on [`CacheStore::set`]. If the fetcher fails, the claim is
/// released and the error returned.
pub fn fetch_through<F: Fetcher + ?Sized>(
    store: &CacheStore,
    key: &str,
    timeout: Duration,
    fetcher: &mut F,
) -> Result<FetchOutcome> {
    if let Some(reader) = store.get(key, timeout)? {
        return Ok(FetchOutcome::Cached(reader));
    }

    let fetched = match fetcher.fetch(key) {
        Ok(fetched) => fetched,
        Err(e) => {
            store.release(key)?;
            return Err(CacheError::Fetch(e));
        }
    };

    let Fetched { header, mut body } = fetched;
    let content = store.set(key, &header, Content::stream(&mut *body))?;
    Ok(FetchOutcome::Stored { header, content })
}

/// Open a store, serve one key through it, and tear it down.
///
/// The returned reader stays valid after the store is gone.
pub fn open_once<P: AsRef<Path>, F: Fetcher + ?Sized>(
    root: P,
    options: StoreOptions,
    key: &str,
    timeout: Duration,
    fetcher: &mut F,
) -> Result<FetchOutcome> {
    let store = CacheStore::new(root, options)?;
    let outcome = fetch_through(&store, key, timeout, fetcher);
    store.cleanup()?;
    outcome
}
