//! Storage back-end contract and the bundled implementations.
//!
//! The engine is stateless across restarts: on open it re-validates via
//! [`TorrentStorage::completion`] and the digester. Reads past the end of
//! the final piece return `UnexpectedEof` with the bytes that were
//! available, section-reader style.

use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bitvec::prelude::*;
use parking_lot::Mutex;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::Result;
use crate::metainfo::{Info, InfoHash};

/// Per-piece completion as recorded by the back-end.
#[derive(Debug, Clone)]
pub struct Completion {
    /// Bit `i` set means the back-end believes piece `i` is complete.
    pub complete: BitVec<u8, Msb0>,
}

/// Opens per-torrent storage.
pub trait Storage: Send + Sync {
    /// Open (or create) storage for one torrent.
    fn open_torrent(&self, info: &Info, info_hash: InfoHash) -> Result<Arc<dyn TorrentStorage>>;
}

/// Storage for a single torrent's payload.
#[async_trait]
pub trait TorrentStorage: Send + Sync {
    /// Read at `offset` in the concatenated payload stream. A short read
    /// at the tail fills what exists and returns `UnexpectedEof`.
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Write at `offset`. Writes are chunk-sized.
    async fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    /// Which pieces the back-end already holds verified.
    fn completion(&self) -> Result<Completion>;

    /// Record that piece `i` passed verification. Once any peer observes
    /// the HAVE this durability must hold.
    fn mark_complete(&self, piece: u32) -> Result<()>;

    /// Drop the completion mark for piece `i`.
    fn mark_not_complete(&self, piece: u32) -> Result<()>;

    /// Release resources.
    fn close(&self) -> Result<()>;
}

/// In-memory storage, used by tests and loopback seeding.
pub struct MemoryStorage;

impl Storage for MemoryStorage {
    fn open_torrent(&self, info: &Info, _info_hash: InfoHash) -> Result<Arc<dyn TorrentStorage>> {
        Ok(Arc::new(MemoryTorrent::empty(info)))
    }
}

/// A single torrent held in memory.
pub struct MemoryTorrent {
    total_length: u64,
    bytes: Mutex<Vec<u8>>,
    complete: Mutex<BitVec<u8, Msb0>>,
}

impl MemoryTorrent {
    /// Empty payload of the torrent's total length.
    pub fn empty(info: &Info) -> Self {
        Self {
            total_length: info.total_length,
            bytes: Mutex::new(vec![0; info.total_length as usize]),
            complete: Mutex::new(bitvec![u8, Msb0; 0; info.num_pieces()]),
        }
    }

    /// Pre-filled payload with every piece marked complete (a seeder).
    pub fn seeded(info: &Info, payload: Vec<u8>) -> Self {
        assert_eq!(payload.len() as u64, info.total_length);
        Self {
            total_length: info.total_length,
            bytes: Mutex::new(payload),
            complete: Mutex::new(bitvec![u8, Msb0; 1; info.num_pieces()]),
        }
    }

    /// Current payload snapshot.
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }
}

#[async_trait]
impl TorrentStorage for MemoryTorrent {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let bytes = self.bytes.lock();
        if offset >= self.total_length {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let start = offset as usize;
        let available = bytes.len() - start;
        let n = buf.len().min(available);
        buf[..n].copy_from_slice(&bytes[start..start + n]);
        if n < buf.len() {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(n)
    }

    async fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let mut bytes = self.bytes.lock();
        let start = offset as usize;
        let end = start + buf.len();
        if end > bytes.len() {
            return Err(io::ErrorKind::InvalidInput.into());
        }
        bytes[start..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn completion(&self) -> Result<Completion> {
        Ok(Completion {
            complete: self.complete.lock().clone(),
        })
    }

    fn mark_complete(&self, piece: u32) -> Result<()> {
        self.complete.lock().set(piece as usize, true);
        Ok(())
    }

    fn mark_not_complete(&self, piece: u32) -> Result<()> {
        self.complete.lock().set(piece as usize, false);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Factory handing out one already-open torrent storage. Used for
/// loopback seeding and in tests.
pub struct PreparedStorage(pub Arc<dyn TorrentStorage>);

impl Storage for PreparedStorage {
    fn open_torrent(&self, _info: &Info, _info_hash: InfoHash) -> Result<Arc<dyn TorrentStorage>> {
        Ok(Arc::clone(&self.0))
    }
}

/// File-backed storage rooted at a directory.
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Storage for FileStorage {
    fn open_torrent(&self, info: &Info, _info_hash: InfoHash) -> Result<Arc<dyn TorrentStorage>> {
        let base = if info.single_file {
            self.root.clone()
        } else {
            self.root.join(&info.name)
        };
        Ok(Arc::new(FileTorrent {
            base,
            info: info.clone(),
            complete: Mutex::new(bitvec![u8, Msb0; 0; info.num_pieces()]),
        }))
    }
}

struct FileTorrent {
    base: PathBuf,
    info: Info,
    // Completion is tracked in memory; callers re-verify on open.
    complete: Mutex<BitVec<u8, Msb0>>,
}

impl FileTorrent {
    /// Files overlapping `[offset, offset+len)` as
    /// `(path, offset in file, len)` in stream order.
    fn segments(&self, offset: u64, len: u64) -> Vec<(PathBuf, u64, u64)> {
        let end = offset + len;
        let mut out = Vec::new();
        for file in &self.info.files {
            let file_end = file.offset + file.length;
            if file.offset >= end || file_end <= offset {
                continue;
            }
            let start = offset.max(file.offset);
            let stop = end.min(file_end);
            out.push((self.base.join(&file.path), start - file.offset, stop - start));
        }
        out
    }
}

#[async_trait]
impl TorrentStorage for FileTorrent {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.info.total_length {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let available = (self.info.total_length - offset).min(buf.len() as u64) as usize;

        let mut filled = 0usize;
        for (path, file_offset, len) in self.segments(offset, available as u64) {
            let mut file = tokio::fs::File::open(&path).await?;
            file.seek(SeekFrom::Start(file_offset)).await?;
            file.read_exact(&mut buf[filled..filled + len as usize])
                .await?;
            filled += len as usize;
        }
        if filled < buf.len() {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        Ok(filled)
    }

    async fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let mut written = 0usize;
        for (path, file_offset, len) in self.segments(offset, buf.len() as u64) {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .await?;
            file.seek(SeekFrom::Start(file_offset)).await?;
            file.write_all(&buf[written..written + len as usize]).await?;
            written += len as usize;
        }
        Ok(written)
    }

    fn completion(&self) -> Result<Completion> {
        Ok(Completion {
            complete: self.complete.lock().clone(),
        })
    }

    fn mark_complete(&self, piece: u32) -> Result<()> {
        self.complete.lock().set(piece as usize, true);
        Ok(())
    }

    fn mark_not_complete(&self, piece: u32) -> Result<()> {
        self.complete.lock().set(piece as usize, false);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}
