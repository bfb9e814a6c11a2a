//! Piece hash verification pipeline.
//!
//! A bounded, deduplicating queue of piece indices feeds one worker per
//! torrent. The worker reads the piece through the storage contract,
//! computes SHA-1, and reports a [`Verdict`] the torrent applies to its
//! ledger (complete or fail) under its own mutex.

use std::collections::{HashSet, VecDeque};

use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use tokio::sync::Notify;

use crate::error::Result;
use crate::metainfo::Info;
use crate::storage::TorrentStorage;

/// Outcome of verifying one piece.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Verdict {
    pub piece: u32,
    pub passed: bool,
}

/// Deduplicating verification queue.
pub struct Digests {
    state: Mutex<Queue>,
    notify: Notify,
}

struct Queue {
    order: VecDeque<u32>,
    queued: HashSet<u32>,
    closed: bool,
}

impl Digests {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(Queue {
                order: VecDeque::new(),
                queued: HashSet::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Queue a piece for verification. Duplicate enqueues collapse.
    pub fn enqueue(&self, piece: u32) {
        {
            let mut state = self.state.lock();
            if state.closed || !state.queued.insert(piece) {
                return;
            }
            state.order.push_back(piece);
        }
        self.notify.notify_one();
    }

    /// Take the next piece without waiting.
    pub fn try_pop(&self) -> Option<u32> {
        let mut state = self.state.lock();
        let piece = state.order.pop_front()?;
        state.queued.remove(&piece);
        Some(piece)
    }

    /// Wait for the next piece; `None` once closed and drained.
    pub async fn pop(&self) -> Option<u32> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(piece) = state.order.pop_front() {
                    state.queued.remove(&piece);
                    return Some(piece);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Stop the worker once the queue drains.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.state.lock().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Digests {
    fn default() -> Self {
        Self::new()
    }
}

/// Read piece `piece` from storage and compare its SHA-1 with the
/// expected hash. Storage read errors propagate; they are fatal to the
/// torrent, not just the piece.
pub async fn verify_piece(
    storage: &dyn TorrentStorage,
    info: &Info,
    piece: u32,
) -> Result<Verdict> {
    let len = info
        .piece_len(piece as usize)
        .ok_or_else(|| crate::error::Error::HashMismatch { piece })?;
    let mut buf = vec![0u8; len as usize];
    storage
        .read_at(&mut buf, info.piece_offset(piece as usize))
        .await?;

    let mut hasher = Sha1::new();
    hasher.update(&buf);
    let digest: [u8; 20] = hasher.finalize().into();

    let passed = info.piece_hash(piece as usize) == Some(digest.as_ref());
    Ok(Verdict { piece, passed })
}
