use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

use nix::fcntl::Flock;

/// Payload for [`CacheStore::set`](crate::CacheStore::set).
pub enum Content<'a> {
    /// Fully materialized body.
    Bytes(&'a [u8]),
    /// Body read incrementally until EOF.
    Stream(&'a mut dyn Read),
}

impl<'a> Content<'a> {
    pub fn stream(reader: &'a mut dyn Read) -> Self {
        Content::Stream(reader)
    }
}

impl<'a> From<&'a [u8]> for Content<'a> {
    fn from(bytes: &'a [u8]) -> Self {
        Content::Bytes(bytes)
    }
}

impl<'a, const N: usize> From<&'a [u8; N]> for Content<'a> {
    fn from(bytes: &'a [u8; N]) -> Self {
        Content::Bytes(bytes)
    }
}

impl<'a> From<&'a Vec<u8>> for Content<'a> {
    fn from(bytes: &'a Vec<u8>) -> Self {
        Content::Bytes(bytes)
    }
}

impl<'a> From<&'a str> for Content<'a> {
    fn from(s: &'a str) -> Self {
        Content::Bytes(s.as_bytes())
    }
}

enum Handle {
    /// Committed entry opened by `get`; the shared lock lives as long as the guard.
    Shared(Flock<File>),
    /// Descriptor handed back by `set` after the exclusive lock was released.
    Written(File),
}

/// Readable view of a cache entry.
///
/// Dropping the reader closes the descriptor and releases any lock it holds.
pub struct CacheReader {
    handle: Handle,
}

impl CacheReader {
    pub(crate) fn shared(guard: Flock<File>) -> Self {
        Self {
            handle: Handle::Shared(guard),
        }
    }

    pub(crate) fn written(file: File) -> Self {
        Self {
            handle: Handle::Written(file),
        }
    }

    fn file(&self) -> &File {
        match &self.handle {
            Handle::Shared(guard) => &**guard,
            Handle::Written(file) => file,
        }
    }

    /// Whether this reader keeps a shared lock on the entry.
    pub fn holds_shared_lock(&self) -> bool {
        matches!(self.handle, Handle::Shared(_))
    }

    /// Total size of the entry on disk, header included.
    pub fn entry_len(&self) -> io::Result<u64> {
        Ok(self.file().metadata()?.len())
    }

    /// Read the remainder of the entry into memory.
    pub fn into_bytes(mut self) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        self.read_to_end(&mut buf)?;
        Ok(buf)
    }
}

impl Read for CacheReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut file = self.file();
        file.read(buf)
    }
}

impl Seek for CacheReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let mut file = self.file();
        file.seek(pos)
    }
}

impl std::fmt::Debug for CacheReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheReader")
            .field("shared_lock", &self.holds_shared_lock())
            .finish_non_exhaustive()
    }
}
