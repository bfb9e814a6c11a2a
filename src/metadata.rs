//! Metadata exchange (BEP 9).
//!
//! A torrent started from a bare infohash learns `metadata_size` from a
//! peer's extension handshake, allocates a zeroed buffer of that size,
//! and fills it 16 KiB at a time. The assembled bytes must SHA-1 to the
//! infohash before they are trusted.

use std::collections::BTreeMap;

use bitvec::prelude::*;
use sha1::{Digest, Sha1};

use crate::bencode::Value;
use crate::error::{Error, ProtocolKind, Result};
use crate::metainfo::InfoHash;

/// Metadata transfers in 16 KiB pieces.
pub const METADATA_PIECE_LEN: usize = 16 * 1024;

/// ut_metadata message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetadataKind {
    Request = 0,
    Data = 1,
    Reject = 2,
}

impl MetadataKind {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Request),
            1 => Some(Self::Data),
            2 => Some(Self::Reject),
            _ => None,
        }
    }
}

/// One ut_metadata message: a bencoded head, and for `Data` the raw
/// piece bytes appended after the dictionary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetadataMessage {
    pub kind: MetadataKind,
    pub piece: usize,
    pub total_size: Option<usize>,
    pub data: Option<Vec<u8>>,
}

impl MetadataMessage {
    pub fn request(piece: usize) -> Self {
        Self {
            kind: MetadataKind::Request,
            piece,
            total_size: None,
            data: None,
        }
    }

    pub fn data(piece: usize, total_size: usize, data: Vec<u8>) -> Self {
        Self {
            kind: MetadataKind::Data,
            piece,
            total_size: Some(total_size),
            data: Some(data),
        }
    }

    pub fn reject(piece: usize) -> Self {
        Self {
            kind: MetadataKind::Reject,
            piece,
            total_size: None,
            data: None,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        dict.insert(b"msg_type".to_vec(), Value::Int(self.kind as i64));
        dict.insert(b"piece".to_vec(), Value::Int(self.piece as i64));
        if let Some(total) = self.total_size {
            dict.insert(b"total_size".to_vec(), Value::Int(total as i64));
        }
        let mut out = Value::Dict(dict).encode();
        if let Some(data) = &self.data {
            out.extend_from_slice(data);
        }
        out
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        let (head, tail) = Value::decode_prefix(raw)?;
        if head.as_dict().is_none() {
            return Err(Error::protocol(
                ProtocolKind::Metadata,
                "ut_metadata head is not a dict",
            ));
        }

        let kind = head
            .get("msg_type")
            .and_then(Value::as_uint)
            .and_then(|v| MetadataKind::from_u8(v as u8))
            .ok_or_else(|| {
                Error::protocol(ProtocolKind::Metadata, "missing or invalid msg_type")
            })?;
        let piece = head
            .get("piece")
            .and_then(Value::as_uint)
            .ok_or_else(|| Error::protocol(ProtocolKind::Metadata, "missing piece"))?
            as usize;
        let total_size = head
            .get("total_size")
            .and_then(Value::as_uint)
            .map(|v| v as usize);

        let data = match kind {
            MetadataKind::Data => Some(tail.to_vec()),
            _ => None,
        };

        Ok(Self {
            kind,
            piece,
            total_size,
            data,
        })
    }
}

/// Accumulates metadata pieces for one torrent.
pub struct MetadataStore {
    info_hash: InfoHash,
    /// Zero-filled once the size is learned; piece data overwrites in
    /// place.
    bytes: Vec<u8>,
    have: BitVec,
}

impl MetadataStore {
    pub fn new(info_hash: InfoHash) -> Self {
        Self {
            info_hash,
            bytes: Vec::new(),
            have: BitVec::new(),
        }
    }

    /// Learn the metadata size from an extension handshake. The first
    /// advertisement wins; later conflicting sizes are ignored.
    pub fn set_size(&mut self, total_size: usize) {
        if !self.bytes.is_empty() || total_size == 0 {
            return;
        }
        self.bytes = vec![0; total_size];
        self.have = bitvec![0; total_size.div_ceil(METADATA_PIECE_LEN)];
    }

    pub fn size(&self) -> Option<usize> {
        (!self.bytes.is_empty()).then_some(self.bytes.len())
    }

    pub fn num_pieces(&self) -> usize {
        self.have.len()
    }

    /// The raw buffer as accumulated so far (zeros where unfilled).
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn have_all_pieces(&self) -> bool {
        !self.have.is_empty() && self.have.count_ones() == self.have.len()
    }

    /// Piece indices still worth requesting.
    pub fn needed_pieces(&self) -> Vec<usize> {
        if self.bytes.is_empty() {
            // Size unknown: ask for piece 0 to coax a data reply.
            return vec![0];
        }
        self.have.iter_zeros().collect()
    }

    /// Expected length of metadata piece `piece`.
    fn piece_len(&self, piece: usize) -> Option<usize> {
        if piece >= self.num_pieces() {
            return None;
        }
        let start = piece * METADATA_PIECE_LEN;
        Some((self.bytes.len() - start).min(METADATA_PIECE_LEN))
    }

    /// Store a received piece. Returns true when all pieces are present
    /// and the buffer verifies against the infohash; a failed
    /// verification clears everything for a retry.
    pub fn put_piece(&mut self, piece: usize, data: &[u8], total_size: usize) -> Result<bool> {
        self.set_size(total_size);
        let expected = self.piece_len(piece).ok_or_else(|| {
            Error::protocol(
                ProtocolKind::Metadata,
                format!("metadata piece {piece} out of range"),
            )
        })?;
        if data.len() != expected {
            return Err(Error::protocol(
                ProtocolKind::Metadata,
                format!(
                    "metadata piece {piece} is {} bytes, want {expected}",
                    data.len()
                ),
            ));
        }

        let start = piece * METADATA_PIECE_LEN;
        self.bytes[start..start + expected].copy_from_slice(data);
        self.have.set(piece, true);

        if !self.have_all_pieces() {
            return Ok(false);
        }

        let mut hasher = Sha1::new();
        hasher.update(&self.bytes);
        let digest: [u8; 20] = hasher.finalize().into();
        if digest != self.info_hash.0 {
            tracing::warn!(
                info_hash = %self.info_hash,
                "assembled metadata failed infohash check, discarding"
            );
            self.have.fill(false);
            return Ok(false);
        }
        Ok(true)
    }

    /// Serve a metadata piece to a peer (seed side).
    pub fn piece_data(&self, piece: usize) -> Option<&[u8]> {
        if !self.have_all_pieces() {
            return None;
        }
        let len = self.piece_len(piece)?;
        let start = piece * METADATA_PIECE_LEN;
        Some(&self.bytes[start..start + len])
    }

    /// Seed the store with already-verified info bytes.
    pub fn fill(&mut self, info_bytes: &[u8]) {
        self.bytes = info_bytes.to_vec();
        self.have = bitvec![1; info_bytes.len().div_ceil(METADATA_PIECE_LEN)];
    }
}
