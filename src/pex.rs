//! Peer exchange (BEP 11) and the BEP 10 extension handshake.
//!
//! PEX messages are bencoded dictionaries with compact-address lists:
//! `added`/`added.f`/`dropped` for IPv4 and `added6`/`added6.f`/
//! `dropped6` for IPv6. Flags describe the peer being gossiped.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::ops::BitOr;

use crate::bencode::Value;
use crate::error::{Error, ProtocolKind, Result};

/// Extension name for PEX in the BEP 10 handshake.
pub const PEX_EXTENSION_NAME: &str = "ut_pex";

/// Extension name for metadata exchange (BEP 9).
pub const METADATA_EXTENSION_NAME: &str = "ut_metadata";

/// Sub-id we advertise for ut_pex.
pub const OUR_PEX_ID: u8 = 1;

/// Sub-id we advertise for ut_metadata.
pub const OUR_METADATA_ID: u8 = 2;

/// Per-peer flags carried in `added.f`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct PexPeerFlags(pub u8);

impl PexPeerFlags {
    /// Peer prefers encrypted connections.
    pub const PREFERS_ENCRYPTION: Self = Self(0x01);
    /// Peer is a seeder.
    pub const IS_SEEDER: Self = Self(0x02);
    /// Peer supports uTP.
    pub const SUPPORTS_UTP: Self = Self(0x04);
    /// Peer supports the holepunch extension.
    pub const SUPPORTS_HOLEPUNCH: Self = Self(0x08);
    /// The gossiping side dialed this peer.
    pub const OUTGOING: Self = Self(0x10);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for PexPeerFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A PEX delta: peers that appeared and peers that went away.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PexMessage {
    pub added: Vec<SocketAddr>,
    pub added_flags: Vec<PexPeerFlags>,
    pub dropped: Vec<SocketAddr>,
    pub added6: Vec<SocketAddr>,
    pub added6_flags: Vec<PexPeerFlags>,
    pub dropped6: Vec<SocketAddr>,
}

impl PexMessage {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.dropped.is_empty()
            && self.added6.is_empty()
            && self.dropped6.is_empty()
    }

    /// All added peers with their flags, both address families.
    pub fn all_added(&self) -> Vec<(SocketAddr, PexPeerFlags)> {
        let flag = |flags: &[PexPeerFlags], i: usize| flags.get(i).copied().unwrap_or_default();
        self.added
            .iter()
            .enumerate()
            .map(|(i, addr)| (*addr, flag(&self.added_flags, i)))
            .chain(
                self.added6
                    .iter()
                    .enumerate()
                    .map(|(i, addr)| (*addr, flag(&self.added6_flags, i))),
            )
            .collect()
    }

    /// All dropped peers, both address families.
    pub fn all_dropped(&self) -> Vec<SocketAddr> {
        self.dropped
            .iter()
            .chain(self.dropped6.iter())
            .copied()
            .collect()
    }

    /// Encode as a bencoded dictionary.
    pub fn encode(&self) -> Vec<u8> {
        let mut dict = BTreeMap::new();
        if !self.added.is_empty() {
            dict.insert(b"added".to_vec(), Value::Bytes(compact_v4(&self.added)));
            dict.insert(
                b"added.f".to_vec(),
                Value::Bytes(self.added_flags.iter().map(|f| f.0).collect()),
            );
        }
        if !self.added6.is_empty() {
            dict.insert(b"added6".to_vec(), Value::Bytes(compact_v6(&self.added6)));
            dict.insert(
                b"added6.f".to_vec(),
                Value::Bytes(self.added6_flags.iter().map(|f| f.0).collect()),
            );
        }
        if !self.dropped.is_empty() {
            dict.insert(b"dropped".to_vec(), Value::Bytes(compact_v4(&self.dropped)));
        }
        if !self.dropped6.is_empty() {
            dict.insert(
                b"dropped6".to_vec(),
                Value::Bytes(compact_v6(&self.dropped6)),
            );
        }
        Value::Dict(dict).encode()
    }

    /// Parse from a bencoded payload.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let value = Value::decode(data)
            .map_err(|_| Error::protocol(ProtocolKind::Pex, "pex payload is not bencode"))?;
        if value.as_dict().is_none() {
            return Err(Error::protocol(ProtocolKind::Pex, "pex payload is not a dict"));
        }

        let bytes = |key: &str| value.get(key).and_then(Value::as_bytes);
        let flags = |key: &str| -> Vec<PexPeerFlags> {
            bytes(key)
                .map(|b| b.iter().map(|&f| PexPeerFlags(f)).collect())
                .unwrap_or_default()
        };

        Ok(Self {
            added: bytes("added").map(parse_compact_v4).unwrap_or_default(),
            added_flags: flags("added.f"),
            dropped: bytes("dropped").map(parse_compact_v4).unwrap_or_default(),
            added6: bytes("added6").map(parse_compact_v6).unwrap_or_default(),
            added6_flags: flags("added6.f"),
            dropped6: bytes("dropped6").map(parse_compact_v6).unwrap_or_default(),
        })
    }
}

fn compact_v4(addrs: &[SocketAddr]) -> Vec<u8> {
    let mut out = Vec::with_capacity(addrs.len() * 6);
    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            out.extend_from_slice(&v4.ip().octets());
            out.extend_from_slice(&v4.port().to_be_bytes());
        }
    }
    out
}

fn compact_v6(addrs: &[SocketAddr]) -> Vec<u8> {
    let mut out = Vec::with_capacity(addrs.len() * 18);
    for addr in addrs {
        if let SocketAddr::V6(v6) = addr {
            out.extend_from_slice(&v6.ip().octets());
            out.extend_from_slice(&v6.port().to_be_bytes());
        }
    }
    out
}

fn parse_compact_v4(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(6)
        .map(|c| {
            SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(c[0], c[1], c[2], c[3]),
                u16::from_be_bytes([c[4], c[5]]),
            ))
        })
        .collect()
}

fn parse_compact_v6(data: &[u8]) -> Vec<SocketAddr> {
    data.chunks_exact(18)
        .map(|c| {
            let octets: [u8; 16] = c[..16].try_into().expect("chunk is 18 bytes");
            SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(octets),
                u16::from_be_bytes([c[16], c[17]]),
                0,
                0,
            ))
        })
        .collect()
}

/// Sort an address into the message's v4 or v6 side.
fn push_addr(msg: &mut PexMessage, addr: SocketAddr, flags: PexPeerFlags, added: bool) {
    match (addr, added) {
        (SocketAddr::V4(_), true) => {
            msg.added.push(addr);
            msg.added_flags.push(flags);
        }
        (SocketAddr::V6(_), true) => {
            msg.added6.push(addr);
            msg.added6_flags.push(flags);
        }
        (SocketAddr::V4(_), false) => msg.dropped.push(addr),
        (SocketAddr::V6(_), false) => msg.dropped6.push(addr),
    }
}

/// Torrent-level history of connections eligible for gossip.
///
/// `snapshot` renders the full current membership as an `added` list for
/// a newly PEX-capable connection; per-connection deltas are computed by
/// [`PexState`].
#[derive(Debug, Default)]
pub struct Pex {
    current: HashMap<SocketAddr, PexPeerFlags>,
}

impl Pex {
    pub fn new() -> Self {
        Self::default()
    }

    /// A connection reached the active state.
    pub fn added(&mut self, addr: SocketAddr, flags: PexPeerFlags) {
        self.current.insert(addr, flags);
    }

    /// A connection closed.
    pub fn dropped(&mut self, addr: SocketAddr) {
        self.current.remove(&addr);
    }

    /// Current membership rendered as one `added` message, or `None`
    /// when there is nothing to share.
    pub fn snapshot(&self) -> Option<PexMessage> {
        if self.current.is_empty() {
            return None;
        }
        let mut msg = PexMessage::default();
        for (&addr, &flags) in &self.current {
            push_addr(&mut msg, addr, flags, true);
        }
        Some(msg)
    }

    /// Addresses currently shared.
    pub fn members(&self) -> Vec<(SocketAddr, PexPeerFlags)> {
        self.current.iter().map(|(a, f)| (*a, *f)).collect()
    }
}

/// Per-connection PEX pacing: remembers what was already shared with a
/// peer and produces interval-gated deltas.
pub struct PexState {
    shared: HashMap<SocketAddr, PexPeerFlags>,
    last_sent: Option<std::time::Instant>,
    interval: std::time::Duration,
}

impl PexState {
    pub fn new(interval: std::time::Duration) -> Self {
        Self {
            shared: HashMap::new(),
            last_sent: None,
            interval,
        }
    }

    pub fn can_send(&self) -> bool {
        self.last_sent
            .map(|t| t.elapsed() >= self.interval)
            .unwrap_or(true)
    }

    /// Diff the torrent's membership against what this peer already saw.
    /// Returns `None` if the interval has not elapsed or nothing changed.
    pub fn delta(&mut self, current: &[(SocketAddr, PexPeerFlags)]) -> Option<PexMessage> {
        if !self.can_send() {
            return None;
        }
        let current_map: HashMap<SocketAddr, PexPeerFlags> = current.iter().copied().collect();

        let mut msg = PexMessage::default();
        for (&addr, &flags) in &current_map {
            if !self.shared.contains_key(&addr) {
                push_addr(&mut msg, addr, flags, true);
            }
        }
        for &addr in self.shared.keys() {
            if !current_map.contains_key(&addr) {
                push_addr(&mut msg, addr, PexPeerFlags::default(), false);
            }
        }

        if msg.is_empty() {
            return None;
        }
        self.shared = current_map;
        self.last_sent = Some(std::time::Instant::now());
        Some(msg)
    }
}

/// Parsed BEP 10 extension handshake.
#[derive(Debug, Clone, Default)]
pub struct ExtensionHandshake {
    /// Extension name → sub-id the peer wants us to use.
    pub extensions: HashMap<String, u8>,
    /// Peer's advertised listen port.
    pub listen_port: Option<u16>,
    /// Client identification string.
    pub client: Option<String>,
    /// Metadata size for BEP 9, if the peer has the info dict.
    pub metadata_size: Option<usize>,
    /// Peer's request queue depth.
    pub request_queue: Option<usize>,
}

impl ExtensionHandshake {
    pub fn pex_id(&self) -> Option<u8> {
        self.extensions.get(PEX_EXTENSION_NAME).copied()
    }

    pub fn metadata_id(&self) -> Option<u8> {
        self.extensions.get(METADATA_EXTENSION_NAME).copied()
    }
}

/// Build the handshake payload we send as Extended sub-id 0.
pub fn build_extension_handshake(
    listen_port: Option<u16>,
    metadata_size: Option<usize>,
) -> Vec<u8> {
    let mut m = BTreeMap::new();
    m.insert(
        METADATA_EXTENSION_NAME.as_bytes().to_vec(),
        Value::Int(OUR_METADATA_ID as i64),
    );
    m.insert(
        PEX_EXTENSION_NAME.as_bytes().to_vec(),
        Value::Int(OUR_PEX_ID as i64),
    );

    let mut dict = BTreeMap::new();
    dict.insert(b"m".to_vec(), Value::Dict(m));
    if let Some(size) = metadata_size {
        dict.insert(b"metadata_size".to_vec(), Value::Int(size as i64));
    }
    if let Some(port) = listen_port {
        dict.insert(b"p".to_vec(), Value::Int(port as i64));
    }
    dict.insert(
        b"v".to_vec(),
        Value::Bytes(format!("riptide/{}", env!("CARGO_PKG_VERSION")).into_bytes()),
    );
    Value::Dict(dict).encode()
}

/// Parse a peer's extension handshake payload.
pub fn parse_extension_handshake(data: &[u8]) -> Result<ExtensionHandshake> {
    let value = Value::decode(data)
        .map_err(|_| Error::protocol(ProtocolKind::Pex, "extension handshake is not bencode"))?;
    if value.as_dict().is_none() {
        return Err(Error::protocol(
            ProtocolKind::Pex,
            "extension handshake is not a dict",
        ));
    }

    let mut extensions = HashMap::new();
    if let Some(m) = value.get("m").and_then(Value::as_dict) {
        for (name, id) in m {
            if let Some(id) = id.as_uint() {
                extensions.insert(String::from_utf8_lossy(name).into_owned(), id as u8);
            }
        }
    }

    Ok(ExtensionHandshake {
        extensions,
        listen_port: value.get("p").and_then(Value::as_uint).map(|p| p as u16),
        client: value.get("v").and_then(Value::as_str).map(str::to_owned),
        metadata_size: value
            .get("metadata_size")
            .and_then(Value::as_uint)
            .map(|s| s as usize),
        request_queue: value
            .get("reqq")
            .and_then(Value::as_uint)
            .map(|s| s as usize),
    })
}
