//! # dcache-store
//!
//! Filesystem cache keyed by arbitrary strings (usually URLs), safe to share
//! between threads, processes, and hosts mounting the same directory.
//!
//! Coordination relies on two filesystem primitives only: atomic exclusive
//! create (`O_CREAT|O_EXCL`) decides which caller populates an entry, and
//! `flock` advisory locks keep readers away from entries still being written.
//!
//! ## Directory Layout
//!
//! ```text
//! <root>/
//! └── 3f/                                   # digest[0..2]
//!     └── a9/                               # digest[2..4]
//!         └── example.com,img,a.png,3fa9...  # display name + "," + digest
//! ```
//!
//! ## Protocol
//!
//! 1. `get` tries to create the entry exclusively. Success means nobody has it:
//!    the caller now owns the claim and must fetch and `set` it.
//! 2. Otherwise `get` polls for a shared lock with exponential backoff. The
//!    claimant holds an exclusive lock until every byte is written, so a
//!    granted shared lock means the entry is complete.
//! 3. `cleanup` releases claims that were never populated, leaving empty
//!    placeholders that the next caller treats as a miss.

pub mod codec;
pub mod fetch;
pub mod layout;
mod reader;
pub mod registry;
mod store;

pub use fetch::{fetch_through, open_once, BoxError, FetchOutcome, Fetched, Fetcher};
pub use layout::ShardLayout;
pub use reader::{CacheReader, Content};
pub use registry::{Claim, LockRegistry};
pub use store::{CacheStore, StoreOptions, DEFAULT_TIMEOUT};

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to {op} {}: {source}", path.display())]
    Fs {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("lock failed on {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("write attempted without ownership of {}", path.display())]
    NotOwner { path: PathBuf },

    #[error("invalid shard range {start}..{end}: {reason}")]
    InvalidShard {
        start: usize,
        end: usize,
        reason: &'static str,
    },

    #[error("fetch failed: {0}")]
    Fetch(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl CacheError {
    pub(crate) fn fs(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        CacheError::Fs {
            op,
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
