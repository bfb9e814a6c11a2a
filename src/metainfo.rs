//! Torrent metainfo (BEP 3, announce-list per BEP 12).
//!
//! The raw bytes of the `info` dictionary are preserved verbatim so the
//! infohash survives a parse/re-encode round trip.

use std::fmt;
use std::path::PathBuf;

use sha1::{Digest, Sha1};

use crate::bencode::{self, Value};
use crate::error::{Error, ProtocolKind, Result};

/// Length of a SHA-1 digest.
pub const HASH_SIZE: usize = 20;

/// 20-byte torrent identifier: SHA-1 of the bencoded `info` dictionary.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct InfoHash(pub [u8; HASH_SIZE]);

impl InfoHash {
    /// Hash a raw info-dictionary slice.
    pub fn for_info_bytes(info_bytes: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(info_bytes);
        Self(hasher.finalize().into())
    }

    /// Parse from a 40-character hex string.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; HASH_SIZE] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl fmt::Display for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InfoHash({self})")
    }
}

impl AsRef<[u8]> for InfoHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// A file entry within the torrent payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileItem {
    /// Path relative to the torrent name (single-file: the name itself).
    pub path: PathBuf,
    /// File length in bytes.
    pub length: u64,
    /// Byte offset in the concatenated payload stream.
    pub offset: u64,
}

/// The parsed `info` dictionary.
#[derive(Debug, Clone)]
pub struct Info {
    /// Suggested name for the file or directory.
    pub name: String,
    /// Bytes per piece (last piece may be shorter).
    pub piece_length: u64,
    /// Concatenated 20-byte SHA-1 piece hashes.
    pub pieces: Vec<u8>,
    /// File layout in payload order.
    pub files: Vec<FileItem>,
    /// Sum of all file lengths.
    pub total_length: u64,
    /// Single-file torrents carry `length` instead of `files`.
    pub single_file: bool,
}

impl Info {
    /// Parse an `info` dictionary value.
    pub fn parse(value: &Value) -> Result<Self> {
        let invalid = |msg: &str| Error::protocol(ProtocolKind::Metainfo, msg.to_string());

        value.as_dict().ok_or_else(|| invalid("info is not a dict"))?;

        let name = value
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing 'name'"))?
            .to_owned();

        let piece_length = value
            .get("piece length")
            .and_then(Value::as_uint)
            .ok_or_else(|| invalid("missing 'piece length'"))?;
        if piece_length == 0 {
            return Err(invalid("'piece length' is zero"));
        }

        let pieces = value
            .get("pieces")
            .and_then(Value::as_bytes)
            .ok_or_else(|| invalid("missing 'pieces'"))?
            .to_vec();
        if pieces.len() % HASH_SIZE != 0 {
            return Err(invalid("'pieces' is not a multiple of 20 bytes"));
        }

        let (files, total_length, single_file) = match value.get("files") {
            Some(files_value) => {
                let list = files_value
                    .as_list()
                    .ok_or_else(|| invalid("'files' is not a list"))?;
                let mut files = Vec::with_capacity(list.len());
                let mut offset = 0u64;
                for entry in list {
                    let length = entry
                        .get("length")
                        .and_then(Value::as_uint)
                        .ok_or_else(|| invalid("file missing 'length'"))?;
                    let segments = entry
                        .get("path")
                        .and_then(Value::as_list)
                        .ok_or_else(|| invalid("file missing 'path'"))?;
                    let mut path = PathBuf::new();
                    for segment in segments {
                        let segment = segment
                            .as_str()
                            .ok_or_else(|| invalid("path segment is not a string"))?;
                        if segment == ".." || segment.contains('/') || segment.contains('\\') {
                            return Err(invalid("path segment escapes the torrent root"));
                        }
                        path.push(segment);
                    }
                    files.push(FileItem {
                        path,
                        length,
                        offset,
                    });
                    offset += length;
                }
                (files, offset, false)
            }
            None => {
                let length = value
                    .get("length")
                    .and_then(Value::as_uint)
                    .ok_or_else(|| invalid("missing 'length' for single-file torrent"))?;
                let files = vec![FileItem {
                    path: PathBuf::from(&name),
                    length,
                    offset: 0,
                }];
                (files, length, true)
            }
        };

        let expected_pieces = total_length.div_ceil(piece_length);
        if (pieces.len() / HASH_SIZE) as u64 != expected_pieces {
            return Err(invalid("piece hash count does not match total length"));
        }

        Ok(Self {
            name,
            piece_length,
            pieces,
            files,
            total_length,
            single_file,
        })
    }

    /// Parse from raw info-dictionary bytes (metadata exchange delivers
    /// the info dict alone, not a full metainfo file).
    pub fn from_bytes(info_bytes: &[u8]) -> Result<Self> {
        Self::parse(&Value::decode(info_bytes)?)
    }

    /// Number of pieces.
    pub fn num_pieces(&self) -> usize {
        self.pieces.len() / HASH_SIZE
    }

    /// Expected SHA-1 for piece `i`.
    pub fn piece_hash(&self, i: usize) -> Option<&[u8]> {
        self.pieces.get(i * HASH_SIZE..(i + 1) * HASH_SIZE)
    }

    /// Byte length of piece `i`; the last piece is truncated.
    pub fn piece_len(&self, i: usize) -> Option<u64> {
        if i >= self.num_pieces() {
            return None;
        }
        let start = i as u64 * self.piece_length;
        Some((self.total_length - start).min(self.piece_length))
    }

    /// Payload byte offset of piece `i`.
    pub fn piece_offset(&self, i: usize) -> u64 {
        i as u64 * self.piece_length
    }

    /// Files overlapping piece `i` as `(file index, offset in file, len)`.
    pub fn files_for_piece(&self, i: usize) -> Vec<(usize, u64, u64)> {
        let Some(len) = self.piece_len(i) else {
            return Vec::new();
        };
        let piece_start = self.piece_offset(i);
        let piece_end = piece_start + len;

        let mut overlaps = Vec::new();
        for (idx, file) in self.files.iter().enumerate() {
            let file_end = file.offset + file.length;
            if file.offset >= piece_end || file_end <= piece_start {
                continue;
            }
            let start = piece_start.max(file.offset);
            let end = piece_end.min(file_end);
            overlaps.push((idx, start - file.offset, end - start));
        }
        overlaps
    }

    /// Re-encode as a bencoded info dictionary.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut entries = std::collections::BTreeMap::new();
        if self.single_file {
            entries.insert(
                b"length".to_vec(),
                Value::Int(self.total_length as i64),
            );
        } else {
            let files = self
                .files
                .iter()
                .map(|f| {
                    let segments = f
                        .path
                        .iter()
                        .map(|s| Value::Bytes(s.to_string_lossy().into_owned().into_bytes()))
                        .collect();
                    Value::dict([
                        (b"length".as_slice(), Value::Int(f.length as i64)),
                        (b"path".as_slice(), Value::List(segments)),
                    ])
                })
                .collect();
            entries.insert(b"files".to_vec(), Value::List(files));
        }
        entries.insert(
            b"name".to_vec(),
            Value::Bytes(self.name.clone().into_bytes()),
        );
        entries.insert(
            b"piece length".to_vec(),
            Value::Int(self.piece_length as i64),
        );
        entries.insert(b"pieces".to_vec(), Value::Bytes(self.pieces.clone()));
        Value::Dict(entries).encode()
    }
}

/// A parsed .torrent file.
#[derive(Debug, Clone)]
pub struct MetaInfo {
    /// SHA-1 of `info_bytes`.
    pub info_hash: InfoHash,
    /// Raw bytes of the info dictionary, preserved exactly.
    pub info_bytes: Vec<u8>,
    /// The parsed info dictionary.
    pub info: Info,
    /// Primary announce URL.
    pub announce: Option<String>,
    /// Announce tiers (BEP 12).
    pub announce_list: Vec<Vec<String>>,
}

impl MetaInfo {
    /// Parse a .torrent file.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let root = Value::decode(data)?;
        let info_value = root.get("info").ok_or_else(|| {
            Error::protocol(ProtocolKind::Metainfo, "missing 'info' dictionary")
        })?;
        let info = Info::parse(info_value)?;

        let info_bytes = bencode::raw_info_slice(data)?.to_vec();
        let info_hash = InfoHash::for_info_bytes(&info_bytes);

        let announce = root
            .get("announce")
            .and_then(Value::as_str)
            .map(str::to_owned);

        let announce_list = root
            .get("announce-list")
            .and_then(Value::as_list)
            .map(|tiers| {
                tiers
                    .iter()
                    .filter_map(|tier| {
                        let urls: Vec<String> = tier
                            .as_list()?
                            .iter()
                            .filter_map(|u| u.as_str().map(str::to_owned))
                            .collect();
                        (!urls.is_empty()).then_some(urls)
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            info_hash,
            info_bytes,
            info,
            announce,
            announce_list,
        })
    }

    /// Build a metainfo in memory (fixtures and seeding).
    pub fn from_info(info: Info, announce: Option<String>) -> Self {
        let info_bytes = info.to_bytes();
        let info_hash = InfoHash::for_info_bytes(&info_bytes);
        Self {
            info_hash,
            info_bytes,
            info,
            announce,
            announce_list: Vec::new(),
        }
    }

    /// All tracker URLs: `announce` first, then announce-list tiers,
    /// deduplicated in order.
    pub fn trackers(&self) -> Vec<String> {
        let mut urls = Vec::new();
        if let Some(announce) = &self.announce {
            urls.push(announce.clone());
        }
        for tier in &self.announce_list {
            for url in tier {
                if !urls.contains(url) {
                    urls.push(url.clone());
                }
            }
        }
        urls
    }

    /// Re-encode the whole metainfo file.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut entries = std::collections::BTreeMap::new();
        if let Some(announce) = &self.announce {
            entries.insert(
                b"announce".to_vec(),
                Value::Bytes(announce.clone().into_bytes()),
            );
        }
        if !self.announce_list.is_empty() {
            let tiers = self
                .announce_list
                .iter()
                .map(|tier| {
                    Value::List(
                        tier.iter()
                            .map(|u| Value::Bytes(u.clone().into_bytes()))
                            .collect(),
                    )
                })
                .collect();
            entries.insert(b"announce-list".to_vec(), Value::List(tiers));
        }
        // Splice the preserved raw info bytes rather than re-encoding the
        // parsed struct, so the infohash cannot drift.
        let mut out = Vec::new();
        out.push(b'd');
        for (key, value) in &entries {
            out.extend_from_slice(key.len().to_string().as_bytes());
            out.push(b':');
            out.extend_from_slice(key);
            value.encode_into(&mut out);
        }
        out.extend_from_slice(b"4:info");
        out.extend_from_slice(&self.info_bytes);
        out.push(b'e');
        out
    }
}
