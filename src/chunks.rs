//! Chunk ledger: per-torrent accounting of chunk and piece state.
//!
//! Every chunk is in exactly one of {missing, outstanding, unverified,
//! completed}; `failed` is an auxiliary flag meaning the containing piece
//! needs a full re-download. A piece becomes hash-eligible when all of its
//! chunks are unverified; verification reclassifies them as completed or
//! missing+failed.

use bitvec::prelude::*;

/// Default transfer unit: 16 KiB.
pub const DEFAULT_CHUNK_LEN: u32 = 16 * 1024;

/// Maximum concurrent holders of one chunk during endgame.
pub const ENDGAME_DUP_LIMIT: u8 = 3;

/// A (piece, offset, length) request triple, the unit of transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkSpec {
    pub piece: u32,
    pub begin: u32,
    pub length: u32,
}

/// Map a byte offset into the torrent to the chunk request covering it.
///
/// Returns `None` for offsets outside `[0, total_len)`.
pub fn torrent_offset_request(
    total_len: u64,
    piece_len: u64,
    chunk_len: u32,
    offset: i64,
) -> Option<ChunkSpec> {
    if offset < 0 || offset as u64 >= total_len {
        return None;
    }
    let offset = offset as u64;
    let piece = offset / piece_len;
    let piece_start = piece * piece_len;
    let this_piece_len = (total_len - piece_start).min(piece_len);
    let begin = (offset - piece_start) / chunk_len as u64 * chunk_len as u64;
    let length = (this_piece_len - begin).min(chunk_len as u64);
    Some(ChunkSpec {
        piece: piece as u32,
        begin: begin as u32,
        length: length as u32,
    })
}

/// Outcome of recording a received chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// Chunk moved outstanding → unverified. If this completed the
    /// piece's chunk set, carries the piece index ready for hashing.
    Accepted { hash_ready: Option<u32> },
    /// Chunk was not outstanding (duplicate or unsolicited); state is
    /// unchanged.
    Unwanted,
}

/// Aggregate chunk-state counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Progress {
    pub missing: usize,
    pub outstanding: usize,
    pub unverified: usize,
    pub completed: usize,
    /// Pieces currently flagged failed.
    pub failed_pieces: usize,
    /// Bytes of hash-verified payload.
    pub bytes_completed: u64,
    pub total_chunks: usize,
    pub total_pieces: usize,
}

/// Bitset-backed tracker of chunk states with per-piece rollups.
pub struct ChunkLedger {
    total_len: u64,
    piece_len: u64,
    chunk_len: u32,
    num_pieces: usize,
    num_chunks: usize,
    /// Chunks per non-final piece.
    chunks_per_piece: usize,

    missing: BitVec,
    outstanding: BitVec,
    unverified: BitVec,
    completed: BitVec,
    /// Auxiliary: chunk belongs to a piece that failed verification.
    failed: BitVec,

    /// Per-piece rollup of `completed`.
    piece_completed: BitVec,
    bytes_completed: u64,

    /// Connected peers holding each piece.
    availability: Vec<u16>,

    /// Concurrent endgame claims per outstanding chunk index.
    endgame_claims: std::collections::HashMap<usize, u8>,
}

impl ChunkLedger {
    /// All chunks start missing.
    pub fn new(total_len: u64, piece_len: u64, chunk_len: u32) -> Self {
        assert!(piece_len > 0 && chunk_len > 0);
        let num_pieces = total_len.div_ceil(piece_len) as usize;
        let chunks_per_piece = piece_len.div_ceil(chunk_len as u64) as usize;
        let num_chunks = if num_pieces == 0 {
            0
        } else {
            let last_piece_len = total_len - (num_pieces as u64 - 1) * piece_len;
            (num_pieces - 1) * chunks_per_piece
                + last_piece_len.div_ceil(chunk_len as u64) as usize
        };

        Self {
            total_len,
            piece_len,
            chunk_len,
            num_pieces,
            num_chunks,
            chunks_per_piece,
            missing: bitvec![1; num_chunks],
            outstanding: bitvec![0; num_chunks],
            unverified: bitvec![0; num_chunks],
            completed: bitvec![0; num_chunks],
            failed: bitvec![0; num_chunks],
            piece_completed: bitvec![0; num_pieces],
            bytes_completed: 0,
            availability: vec![0; num_pieces],
            endgame_claims: std::collections::HashMap::new(),
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    pub fn num_chunks(&self) -> usize {
        self.num_chunks
    }

    pub fn chunk_len(&self) -> u32 {
        self.chunk_len
    }

    /// Byte length of piece `piece`.
    pub fn piece_len(&self, piece: u32) -> u64 {
        let start = piece as u64 * self.piece_len;
        (self.total_len - start).min(self.piece_len)
    }

    fn chunk_range(&self, piece: u32) -> std::ops::Range<usize> {
        let start = piece as usize * self.chunks_per_piece;
        let count = self.piece_len(piece).div_ceil(self.chunk_len as u64) as usize;
        start..start + count
    }

    /// Chunk index for a spec, validating alignment and length.
    fn chunk_index(&self, spec: ChunkSpec) -> Option<usize> {
        if spec.piece as usize >= self.num_pieces {
            return None;
        }
        if spec.begin % self.chunk_len != 0 {
            return None;
        }
        let piece_len = self.piece_len(spec.piece);
        if spec.begin as u64 >= piece_len {
            return None;
        }
        let expected = (piece_len - spec.begin as u64).min(self.chunk_len as u64) as u32;
        if spec.length != expected {
            return None;
        }
        Some(spec.piece as usize * self.chunks_per_piece + (spec.begin / self.chunk_len) as usize)
    }

    /// Spec for chunk index `idx`.
    pub fn spec_of(&self, idx: usize) -> ChunkSpec {
        let piece = (idx / self.chunks_per_piece) as u32;
        let begin = (idx % self.chunks_per_piece) as u32 * self.chunk_len;
        let piece_len = self.piece_len(piece);
        let length = (piece_len - begin as u64).min(self.chunk_len as u64) as u32;
        ChunkSpec {
            piece,
            begin,
            length,
        }
    }

    fn clear_everywhere(&mut self, idx: usize) {
        self.missing.set(idx, false);
        self.outstanding.set(idx, false);
        self.unverified.set(idx, false);
        self.completed.set(idx, false);
        self.endgame_claims.remove(&idx);
    }

    fn uncomplete_piece(&mut self, piece: u32) {
        if self.piece_completed[piece as usize] {
            self.piece_completed.set(piece as usize, false);
            self.bytes_completed -= self.piece_len(piece);
        }
    }

    /// Mark every chunk of `piece` missing and clear its failed flag.
    /// Pending an already-pending piece is a no-op.
    pub fn pend(&mut self, piece: u32) {
        self.uncomplete_piece(piece);
        for idx in self.chunk_range(piece) {
            self.clear_everywhere(idx);
            self.missing.set(idx, true);
            self.failed.set(idx, false);
        }
    }

    /// Seed completion from a storage back-end's completion bitset.
    pub fn complete_from(&mut self, complete: &BitVec<u8, Msb0>) {
        for piece in 0..self.num_pieces {
            if complete.get(piece).map(|b| *b).unwrap_or(false) {
                self.complete(piece as u32);
            }
        }
    }

    /// Atomically move `spec` missing → outstanding. During endgame an
    /// already-outstanding chunk may be claimed again, up to
    /// [`ENDGAME_DUP_LIMIT`] concurrent holders.
    pub fn request(&mut self, spec: ChunkSpec) -> bool {
        let Some(idx) = self.chunk_index(spec) else {
            return false;
        };
        if self.missing[idx] {
            self.missing.set(idx, false);
            self.outstanding.set(idx, true);
            self.endgame_claims.insert(idx, 1);
            return true;
        }
        if self.endgame() && self.outstanding[idx] {
            let claims = self.endgame_claims.entry(idx).or_insert(1);
            if *claims < ENDGAME_DUP_LIMIT {
                *claims += 1;
                return true;
            }
        }
        false
    }

    /// Move `spec` outstanding → missing (peer disconnect or explicit
    /// cancel). With multiple endgame holders only a claim is released.
    pub fn cancel(&mut self, spec: ChunkSpec) {
        let Some(idx) = self.chunk_index(spec) else {
            return;
        };
        if !self.outstanding[idx] {
            return;
        }
        let remaining = match self.endgame_claims.get_mut(&idx) {
            Some(claims) if *claims > 1 => {
                *claims -= 1;
                true
            }
            _ => false,
        };
        if !remaining {
            self.endgame_claims.remove(&idx);
            self.outstanding.set(idx, false);
            self.missing.set(idx, true);
        }
    }

    /// Record a received chunk.
    pub fn received(&mut self, spec: ChunkSpec) -> Received {
        let Some(idx) = self.chunk_index(spec) else {
            return Received::Unwanted;
        };
        if !self.outstanding[idx] {
            return Received::Unwanted;
        }
        self.outstanding.set(idx, false);
        self.unverified.set(idx, true);
        self.endgame_claims.remove(&idx);

        let hash_ready = self
            .hash_eligible(spec.piece)
            .then_some(spec.piece);
        Received::Accepted { hash_ready }
    }

    /// Whether all chunks of `piece` are unverified.
    pub fn hash_eligible(&self, piece: u32) -> bool {
        self.chunk_range(piece).all(|idx| self.unverified[idx])
    }

    /// Verification passed: all chunks of `piece` become completed.
    pub fn complete(&mut self, piece: u32) {
        for idx in self.chunk_range(piece) {
            self.clear_everywhere(idx);
            self.completed.set(idx, true);
            self.failed.set(idx, false);
        }
        if !self.piece_completed[piece as usize] {
            self.piece_completed.set(piece as usize, true);
            self.bytes_completed += self.piece_len(piece);
        }
    }

    /// Verification failed: chunks return to missing with the failed
    /// flag set.
    pub fn fail(&mut self, piece: u32) {
        self.uncomplete_piece(piece);
        for idx in self.chunk_range(piece) {
            self.clear_everywhere(idx);
            self.missing.set(idx, true);
            self.failed.set(idx, true);
        }
    }

    /// Whether chunk index `idx` carries the failed flag.
    pub fn failed_contains(&self, idx: usize) -> bool {
        self.failed.get(idx).map(|b| *b).unwrap_or(false)
    }

    /// Whether `piece` is completed.
    pub fn piece_complete(&self, piece: u32) -> bool {
        self.piece_completed
            .get(piece as usize)
            .map(|b| *b)
            .unwrap_or(false)
    }

    /// Snapshot of completed pieces, wire bit order.
    pub fn completed_pieces(&self) -> BitVec<u8, Msb0> {
        let mut out = bitvec![u8, Msb0; 0; self.num_pieces];
        for piece in self.piece_completed.iter_ones() {
            out.set(piece, true);
        }
        out
    }

    /// All pieces verified.
    pub fn all_complete(&self) -> bool {
        self.piece_completed.count_ones() == self.num_pieces
    }

    // Availability maintenance.

    pub fn availability(&self, piece: u32) -> u32 {
        self.availability
            .get(piece as usize)
            .copied()
            .unwrap_or(0) as u32
    }

    pub fn peer_has_piece(&mut self, piece: u32) {
        if let Some(slot) = self.availability.get_mut(piece as usize) {
            *slot = slot.saturating_add(1);
        }
    }

    pub fn peer_has_bitfield(&mut self, bitfield: &BitVec<u8, Msb0>) {
        for piece in bitfield.iter_ones().take(self.num_pieces) {
            self.availability[piece] = self.availability[piece].saturating_add(1);
        }
    }

    pub fn peer_lost_bitfield(&mut self, bitfield: &BitVec<u8, Msb0>) {
        for piece in bitfield.iter_ones().take(self.num_pieces) {
            self.availability[piece] = self.availability[piece].saturating_sub(1);
        }
    }

    /// Endgame: nothing left missing but requests are still in flight.
    pub fn endgame(&self) -> bool {
        self.missing.count_ones() == 0 && self.outstanding.count_ones() > 0
    }

    /// Select up to `n` chunks to request from a peer advertising
    /// `peer_bitfield`, rarest piece first, index ascending, chunks
    /// left-to-right. Does not mutate state. In endgame this yields
    /// outstanding chunks eligible for duplicate claims.
    pub fn peek(&self, peer_bitfield: &BitVec<u8, Msb0>, n: usize) -> Vec<ChunkSpec> {
        if n == 0 {
            return Vec::new();
        }
        let peer_has =
            |piece: usize| peer_bitfield.get(piece).map(|b| *b).unwrap_or(false);

        if self.endgame() {
            let mut out = Vec::new();
            for idx in self.outstanding.iter_ones() {
                let spec = self.spec_of(idx);
                if !peer_has(spec.piece as usize) {
                    continue;
                }
                if self.endgame_claims.get(&idx).copied().unwrap_or(0) >= ENDGAME_DUP_LIMIT {
                    continue;
                }
                out.push(spec);
                if out.len() == n {
                    break;
                }
            }
            return out;
        }

        let mut candidates: Vec<(u16, u32)> = (0..self.num_pieces as u32)
            .filter(|&piece| peer_has(piece as usize))
            .filter(|&piece| self.chunk_range(piece).any(|idx| self.missing[idx]))
            .map(|piece| (self.availability[piece as usize], piece))
            .collect();
        candidates.sort();

        let mut out = Vec::new();
        for (_, piece) in candidates {
            for idx in self.chunk_range(piece) {
                if self.missing[idx] {
                    out.push(self.spec_of(idx));
                    if out.len() == n {
                        return out;
                    }
                }
            }
        }
        out
    }

    /// Per-state counts and verified bytes.
    pub fn progress(&self) -> Progress {
        Progress {
            missing: self.missing.count_ones(),
            outstanding: self.outstanding.count_ones(),
            unverified: self.unverified.count_ones(),
            completed: self.completed.count_ones(),
            failed_pieces: (0..self.num_pieces as u32)
                .filter(|&p| self.chunk_range(p).any(|idx| self.failed[idx]))
                .count(),
            bytes_completed: self.bytes_completed,
            total_chunks: self.num_chunks,
            total_pieces: self.num_pieces,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> ChunkLedger {
        // 3 pieces of 32 KiB, last truncated to 8 KiB: 2+2+1 = 5 chunks.
        ChunkLedger::new(2 * 32 * 1024 + 8 * 1024, 32 * 1024, DEFAULT_CHUNK_LEN)
    }

    fn all_pieces(n: usize) -> BitVec<u8, Msb0> {
        bitvec![u8, Msb0; 1; n]
    }

    #[test]
    fn geometry() {
        let ledger = ledger();
        assert_eq!(ledger.num_pieces(), 3);
        assert_eq!(ledger.num_chunks(), 5);
        assert_eq!(ledger.piece_len(2), 8 * 1024);
        assert_eq!(
            ledger.spec_of(4),
            ChunkSpec {
                piece: 2,
                begin: 0,
                length: 8 * 1024
            }
        );
    }

    #[test]
    fn offset_request_table() {
        // The boundary table for a 472_183_431-byte torrent with 256 KiB
        // pieces and 16 KiB chunks.
        const S: u64 = 472_183_431;
        const P: u64 = 1 << 18;
        const C: u32 = 16_384;

        assert_eq!(torrent_offset_request(S, P, C, -1), None);
        assert_eq!(
            torrent_offset_request(S, P, C, 0),
            Some(ChunkSpec {
                piece: 0,
                begin: 0,
                length: 16_384
            })
        );
        assert_eq!(
            torrent_offset_request(S, P, C, 1),
            Some(ChunkSpec {
                piece: 0,
                begin: 0,
                length: 16_384
            })
        );
        assert_eq!(
            torrent_offset_request(S, P, C, 16_383),
            Some(ChunkSpec {
                piece: 0,
                begin: 0,
                length: 16_384
            })
        );
        assert_eq!(
            torrent_offset_request(S, P, C, 16_384),
            Some(ChunkSpec {
                piece: 0,
                begin: 16_384,
                length: 16_384
            })
        );
        assert_eq!(
            torrent_offset_request(S, P, C, (1 << 18) - 1),
            Some(ChunkSpec {
                piece: 0,
                begin: (1 << 18) - 16_384,
                length: 16_384
            })
        );
        assert_eq!(
            torrent_offset_request(S, P, C, S as i64 - 1),
            Some(ChunkSpec {
                piece: ((S - 1) / P) as u32,
                begin: ((S - 1) % P / C as u64 * C as u64) as u32,
                length: 12_935
            })
        );
        assert_eq!(torrent_offset_request(S, P, C, 472 * (1 << 20)), None);
    }

    #[test]
    fn request_then_received_once() {
        let mut ledger = ledger();
        let spec = ledger.spec_of(0);

        assert!(ledger.request(spec));
        // Not in endgame: a second request for the same chunk is refused.
        assert!(!ledger.request(spec));

        assert_eq!(
            ledger.received(spec),
            Received::Accepted { hash_ready: None }
        );
        // Receiving again is unwanted.
        assert_eq!(ledger.received(spec), Received::Unwanted);
    }

    #[test]
    fn received_reports_hash_ready() {
        let mut ledger = ledger();
        let a = ledger.spec_of(0);
        let b = ledger.spec_of(1);
        assert!(ledger.request(a));
        assert!(ledger.request(b));
        assert_eq!(ledger.received(a), Received::Accepted { hash_ready: None });
        assert_eq!(
            ledger.received(b),
            Received::Accepted {
                hash_ready: Some(0)
            }
        );
        assert!(ledger.hash_eligible(0));
    }

    #[test]
    fn rejects_malformed_specs() {
        let mut ledger = ledger();
        // Bad piece.
        assert!(!ledger.request(ChunkSpec {
            piece: 9,
            begin: 0,
            length: DEFAULT_CHUNK_LEN
        }));
        // Misaligned begin.
        assert!(!ledger.request(ChunkSpec {
            piece: 0,
            begin: 1,
            length: DEFAULT_CHUNK_LEN
        }));
        // Wrong length for the final chunk.
        assert!(!ledger.request(ChunkSpec {
            piece: 2,
            begin: 0,
            length: DEFAULT_CHUNK_LEN
        }));
    }

    #[test]
    fn complete_and_fail_cycle() {
        let mut ledger = ledger();
        for idx in [0usize, 1] {
            let spec = ledger.spec_of(idx);
            assert!(ledger.request(spec));
            ledger.received(spec);
        }
        ledger.fail(0);
        let progress = ledger.progress();
        assert_eq!(progress.missing, 5);
        assert!(ledger.failed_contains(0));
        assert!(ledger.failed_contains(1));
        assert_eq!(progress.failed_pieces, 1);

        // Re-download and pass this time.
        for idx in [0usize, 1] {
            let spec = ledger.spec_of(idx);
            assert!(ledger.request(spec));
            ledger.received(spec);
        }
        ledger.complete(0);
        assert!(ledger.piece_complete(0));
        assert!(!ledger.failed_contains(0));
        assert_eq!(ledger.progress().bytes_completed, 32 * 1024);
    }

    #[test]
    fn pend_is_idempotent() {
        let mut ledger = ledger();
        let spec = ledger.spec_of(0);
        assert!(ledger.request(spec));
        ledger.pend(0);
        let first = ledger.progress();
        ledger.pend(0);
        assert_eq!(ledger.progress(), first);
        assert_eq!(first.missing, 5);
        assert_eq!(first.outstanding, 0);
    }

    #[test]
    fn cancel_returns_chunk_to_missing() {
        let mut ledger = ledger();
        let spec = ledger.spec_of(3);
        assert!(ledger.request(spec));
        ledger.cancel(spec);
        assert_eq!(ledger.progress().missing, 5);
        assert!(ledger.request(spec));
    }

    #[test]
    fn selection_covers_each_missing_chunk_once() {
        let ledger = ledger();
        let picks = ledger.peek(&all_pieces(3), ledger.num_chunks() + 10);
        assert_eq!(picks.len(), ledger.num_chunks());
        let mut seen = std::collections::HashSet::new();
        for spec in picks {
            assert!(seen.insert(spec), "chunk repeated before cover: {spec:?}");
        }
    }

    #[test]
    fn rarest_first_order() {
        let mut ledger = ledger();
        // Piece 1 is rare (1 holder), pieces 0 and 2 are common.
        ledger.peer_has_piece(0);
        ledger.peer_has_piece(0);
        ledger.peer_has_piece(1);
        ledger.peer_has_piece(2);
        ledger.peer_has_piece(2);

        let picks = ledger.peek(&all_pieces(3), 2);
        assert_eq!(picks[0].piece, 1);
        assert_eq!(picks[0].begin, 0);
        assert_eq!(picks[1].piece, 1);
        assert_eq!(picks[1].begin, DEFAULT_CHUNK_LEN);
    }

    #[test]
    fn ties_break_by_piece_index() {
        let ledger = ledger();
        let picks = ledger.peek(&all_pieces(3), ledger.num_chunks());
        let pieces: Vec<u32> = picks.iter().map(|s| s.piece).collect();
        assert_eq!(pieces, vec![0, 0, 1, 1, 2]);
    }

    #[test]
    fn peek_respects_peer_bitfield() {
        let ledger = ledger();
        let mut only_two = bitvec![u8, Msb0; 0; 3];
        only_two.set(2, true);
        let picks = ledger.peek(&only_two, 16);
        assert_eq!(picks.len(), 1);
        assert_eq!(picks[0].piece, 2);
    }

    #[test]
    fn endgame_allows_duplicates_up_to_limit() {
        let mut ledger = ledger();
        // Drain missing: request everything.
        for idx in 0..ledger.num_chunks() {
            let spec = ledger.spec_of(idx);
            assert!(ledger.request(spec));
        }
        assert!(ledger.endgame());

        let spec = ledger.spec_of(0);
        // One claim exists; two more fit under the limit.
        assert!(ledger.request(spec));
        assert!(ledger.request(spec));
        assert!(!ledger.request(spec));

        // Peek offers outstanding chunks with spare claim slots.
        let picks = ledger.peek(&all_pieces(3), 16);
        assert!(!picks.contains(&spec));
        assert!(!picks.is_empty());

        // First arrival settles the chunk.
        assert_eq!(
            ledger.received(spec),
            Received::Accepted { hash_ready: None }
        );
        assert_eq!(ledger.received(spec), Received::Unwanted);
    }

    #[test]
    fn availability_tracks_connect_and_disconnect() {
        let mut ledger = ledger();
        let field = all_pieces(3);
        ledger.peer_has_bitfield(&field);
        ledger.peer_has_bitfield(&field);
        assert_eq!(ledger.availability(1), 2);
        ledger.peer_lost_bitfield(&field);
        assert_eq!(ledger.availability(1), 1);
    }

    #[test]
    fn completion_seed_from_storage() {
        let mut ledger = ledger();
        let mut complete = bitvec![u8, Msb0; 0; 3];
        complete.set(1, true);
        ledger.complete_from(&complete);
        assert!(ledger.piece_complete(1));
        assert_eq!(ledger.progress().bytes_completed, 32 * 1024);
        assert!(!ledger.all_complete());
    }
}
