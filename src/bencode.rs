//! Bencode codec.
//!
//! A hand-rolled parser rather than a serde layer because infohash
//! computation needs the raw bytes of the `info` dictionary exactly as
//! they appeared on the wire. Dictionaries enforce sorted keys so that
//! re-encoding a parsed value is byte-stable.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, ProtocolKind, Result};

/// Strings above this length are rejected to bound allocations from
/// untrusted input.
const MAX_STRING_LEN: usize = 100 * 1024 * 1024;

/// A bencoded value.
#[derive(Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "Int({n})"),
            Self::Bytes(b) => match std::str::from_utf8(b) {
                Ok(s) if s.len() <= 48 => write!(f, "Bytes({s:?})"),
                _ => write!(f, "Bytes([{} bytes])", b.len()),
            },
            Self::List(l) => f.debug_tuple("List").field(l).finish(),
            Self::Dict(d) => {
                let keys: Vec<String> = d
                    .keys()
                    .map(|k| String::from_utf8_lossy(k).into_owned())
                    .collect();
                f.debug_tuple("Dict").field(&keys).finish()
            }
        }
    }
}

fn malformed(message: impl Into<String>) -> Error {
    Error::protocol(ProtocolKind::Bencode, message)
}

impl Value {
    /// Decode one value, returning it together with the unconsumed tail.
    pub fn decode_prefix(data: &[u8]) -> Result<(Self, &[u8])> {
        match data.first() {
            None => Err(malformed("empty input")),
            Some(b'i') => decode_int(data),
            Some(b'l') => decode_list(data),
            Some(b'd') => decode_dict(data),
            Some(b'0'..=b'9') => decode_bytes(data),
            Some(&c) => Err(malformed(format!("invalid type marker {:?}", c as char))),
        }
    }

    /// Decode a complete value; trailing bytes are an error.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (value, rest) = Self::decode_prefix(data)?;
        if !rest.is_empty() {
            return Err(malformed(format!("{} trailing bytes", rest.len())));
        }
        Ok(value)
    }

    /// Encode to a fresh buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    /// Encode by appending to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Int(n) => {
                out.push(b'i');
                out.extend_from_slice(n.to_string().as_bytes());
                out.push(b'e');
            }
            Self::Bytes(b) => {
                out.extend_from_slice(b.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(b);
            }
            Self::List(items) => {
                out.push(b'l');
                for item in items {
                    item.encode_into(out);
                }
                out.push(b'e');
            }
            Self::Dict(entries) => {
                out.push(b'd');
                for (key, value) in entries {
                    out.extend_from_slice(key.len().to_string().as_bytes());
                    out.push(b':');
                    out.extend_from_slice(key);
                    value.encode_into(out);
                }
                out.push(b'e');
            }
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_uint(&self) -> Option<u64> {
        match self {
            Self::Int(n) if *n >= 0 => Some(*n as u64),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.as_bytes().and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Self::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Self::Dict(d) => Some(d),
            _ => None,
        }
    }

    /// Dictionary lookup by string key.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_dict().and_then(|d| d.get(key.as_bytes()))
    }

    /// Build a dict value from an iterator of entries.
    pub fn dict<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'static [u8], Value)>,
    {
        Self::Dict(
            entries
                .into_iter()
                .map(|(k, v)| (k.to_vec(), v))
                .collect(),
        )
    }
}

fn decode_int(data: &[u8]) -> Result<(Value, &[u8])> {
    let end = data[1..]
        .iter()
        .position(|&c| c == b'e')
        .ok_or_else(|| malformed("unterminated integer"))?
        + 1;
    let digits =
        std::str::from_utf8(&data[1..end]).map_err(|_| malformed("non-ascii integer"))?;
    if digits.is_empty() {
        return Err(malformed("empty integer"));
    }
    if (digits.len() > 1 && digits.starts_with('0')) || digits.starts_with("-0") {
        return Err(malformed("leading zero in integer"));
    }
    let n: i64 = digits
        .parse()
        .map_err(|_| malformed("integer out of range"))?;
    Ok((Value::Int(n), &data[end + 1..]))
}

fn decode_bytes(data: &[u8]) -> Result<(Value, &[u8])> {
    let colon = data
        .iter()
        .position(|&c| c == b':')
        .ok_or_else(|| malformed("missing ':' in string"))?;
    let len: usize = std::str::from_utf8(&data[..colon])
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| malformed("invalid string length"))?;
    if len > MAX_STRING_LEN {
        return Err(malformed(format!("string length {len} exceeds cap")));
    }
    let start = colon + 1;
    let end = start
        .checked_add(len)
        .filter(|&end| end <= data.len())
        .ok_or_else(|| malformed("string length exceeds input"))?;
    Ok((Value::Bytes(data[start..end].to_vec()), &data[end..]))
}

fn decode_list(data: &[u8]) -> Result<(Value, &[u8])> {
    let mut items = Vec::new();
    let mut rest = &data[1..];
    loop {
        match rest.first() {
            None => return Err(malformed("unterminated list")),
            Some(b'e') => return Ok((Value::List(items), &rest[1..])),
            Some(_) => {
                let (value, tail) = Value::decode_prefix(rest)?;
                items.push(value);
                rest = tail;
            }
        }
    }
}

fn decode_dict(data: &[u8]) -> Result<(Value, &[u8])> {
    let mut entries = BTreeMap::new();
    let mut last_key: Option<Vec<u8>> = None;
    let mut rest = &data[1..];
    loop {
        match rest.first() {
            None => return Err(malformed("unterminated dict")),
            Some(b'e') => return Ok((Value::Dict(entries), &rest[1..])),
            Some(_) => {
                let (key, tail) = decode_bytes(rest)?;
                let Value::Bytes(key) = key else { unreachable!() };
                if let Some(prev) = &last_key {
                    if key <= *prev {
                        return Err(malformed("dict keys not in sorted order"));
                    }
                }
                let (value, tail) = Value::decode_prefix(tail)?;
                last_key = Some(key.clone());
                entries.insert(key, value);
                rest = tail;
            }
        }
    }
}

/// Locate the raw bytes of the top-level `info` dictionary.
///
/// The returned slice re-hashes to the torrent's infohash. Validates the
/// whole input first so the scan can trust the framing.
pub fn raw_info_slice(data: &[u8]) -> Result<&[u8]> {
    let root = Value::decode(data)?;
    if root.get("info").and_then(Value::as_dict).is_none() {
        return Err(Error::protocol(
            ProtocolKind::Metainfo,
            "missing 'info' dictionary",
        ));
    }

    let marker = b"4:info";
    let mut pos = 0;
    while let Some(found) = find_from(data, marker, pos) {
        let start = found + marker.len();
        if data.get(start) == Some(&b'd') {
            if let Ok((_, rest)) = Value::decode_prefix(&data[start..]) {
                let len = data.len() - start - rest.len();
                return Ok(&data[start..start + len]);
            }
        }
        pos = found + 1;
    }
    Err(Error::protocol(
        ProtocolKind::Metainfo,
        "could not locate raw info bytes",
    ))
}

fn find_from(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    haystack
        .get(from..)?
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_integers() {
        assert_eq!(Value::decode(b"i42e").unwrap(), Value::Int(42));
        assert_eq!(Value::decode(b"i-7e").unwrap(), Value::Int(-7));
        assert_eq!(Value::decode(b"i0e").unwrap(), Value::Int(0));
        assert!(Value::decode(b"i03e").is_err());
        assert!(Value::decode(b"i-0e").is_err());
        assert!(Value::decode(b"i12").is_err());
    }

    #[test]
    fn decode_strings() {
        assert_eq!(
            Value::decode(b"4:spam").unwrap(),
            Value::Bytes(b"spam".to_vec())
        );
        assert_eq!(Value::decode(b"0:").unwrap(), Value::Bytes(vec![]));
        assert!(Value::decode(b"5:spam").is_err());
    }

    #[test]
    fn decode_collections() {
        let value = Value::decode(b"l4:spami42ee").unwrap();
        let items = value.as_list().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1], Value::Int(42));

        let value = Value::decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
        assert_eq!(value.get("cow").unwrap().as_str(), Some("moo"));
    }

    #[test]
    fn rejects_unsorted_dict_keys() {
        assert!(Value::decode(b"d4:spam4:eggs3:cow3:mooe").is_err());
    }

    #[test]
    fn rejects_trailing_bytes() {
        assert!(Value::decode(b"i42ei43e").is_err());
    }

    #[test]
    fn roundtrip_is_stable() {
        let raw: &[u8] = b"d5:itemsli1ei2ei3ee4:name4:test5:valuei42ee";
        let value = Value::decode(raw).unwrap();
        assert_eq!(value.encode(), raw);
    }

    #[test]
    fn raw_info_slice_hashes_stably() {
        let raw =
            b"d8:announce9:udp://foo4:infod6:lengthi13e4:name8:greeting12:piece lengthi16384eee";
        let info = raw_info_slice(raw).unwrap();
        assert!(info.starts_with(b"d"));
        assert!(info.ends_with(b"e"));
        // The slice parses standalone and re-encodes identically.
        let value = Value::decode(info).unwrap();
        assert_eq!(value.encode(), info);
    }

    #[test]
    fn raw_info_slice_skips_decoys() {
        // A "4:info" key nested in an earlier string must not confuse the scan.
        let raw = b"d3:foo6:4:info4:infod6:lengthi1e4:name1:x12:piece lengthi2eee";
        let info = raw_info_slice(raw).unwrap();
        let value = Value::decode(info).unwrap();
        assert_eq!(value.get("length").unwrap().as_int(), Some(1));
    }
}
