//! Magnet URI parsing.
//!
//! `magnet:?xt=urn:btih:<hex-or-base32>&dn=<name>&tr=<tracker>...`
//! Only `xt` with `urn:btih:` is required; the infohash seeds metadata
//! exchange when no .torrent file is available.

use crate::error::{Error, ProtocolKind, Result};
use crate::metainfo::InfoHash;

/// A parsed magnet link.
#[derive(Debug, Clone)]
pub struct MagnetUri {
    /// The torrent identifier.
    pub info_hash: InfoHash,
    /// Display-name hint.
    pub display_name: Option<String>,
    /// Tracker URLs.
    pub trackers: Vec<String>,
}

impl MagnetUri {
    /// Parse a magnet URI.
    pub fn parse(uri: &str) -> Result<Self> {
        let invalid = |msg: &str| Error::protocol(ProtocolKind::Magnet, msg.to_string());

        let query = uri
            .strip_prefix("magnet:?")
            .ok_or_else(|| invalid("missing 'magnet:?' prefix"))?;

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();

        for pair in query.split('&') {
            let Some((key, value)) = pair.split_once('=') else {
                continue;
            };
            let value = percent_decode(value);
            match key {
                "xt" => {
                    if let Some(digest) = value.strip_prefix("urn:btih:") {
                        info_hash = Some(parse_btih(digest).ok_or_else(|| {
                            invalid("btih digest is neither 40-char hex nor 32-char base32")
                        })?);
                    }
                }
                "dn" => display_name = Some(value),
                "tr" if !value.is_empty() => trackers.push(value),
                _ => {}
            }
        }

        Ok(Self {
            info_hash: info_hash.ok_or_else(|| invalid("missing xt=urn:btih parameter"))?,
            display_name,
            trackers,
        })
    }

    /// Display name, falling back to the hex infohash.
    pub fn name(&self) -> String {
        self.display_name
            .clone()
            .unwrap_or_else(|| self.info_hash.to_string())
    }
}

fn parse_btih(digest: &str) -> Option<InfoHash> {
    match digest.len() {
        40 => InfoHash::from_hex(digest),
        32 => base32_decode(digest).map(InfoHash),
        _ => None,
    }
}

/// RFC 4648 base32 decode of exactly 32 characters into 20 bytes.
fn base32_decode(s: &str) -> Option<[u8; 20]> {
    let mut out = [0u8; 20];
    let mut acc: u64 = 0;
    let mut bits = 0u32;
    let mut written = 0usize;
    for c in s.bytes() {
        let v = match c {
            b'A'..=b'Z' => c - b'A',
            b'a'..=b'z' => c - b'a',
            b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        };
        acc = (acc << 5) | v as u64;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out[written] = (acc >> bits) as u8;
            written += 1;
        }
    }
    (written == 20).then_some(out)
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                if let Ok(v) =
                    u8::from_str_radix(std::str::from_utf8(&bytes[i + 1..i + 3]).unwrap_or(""), 16)
                {
                    out.push(v);
                    i += 3;
                    continue;
                }
                out.push(b'%');
                i += 1;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
