//! Candidate peers and the prioritized admission pool.

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};

use parking_lot::RwLock;
use sha1::{Digest, Sha1};

use crate::pex::PexPeerFlags;

/// Where a candidate peer was learned from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerSource {
    Tracker,
    Pex,
    Dht,
    Incoming,
    User,
}

/// Candidate peer record, handed about publicly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// 20-byte peer id if known.
    pub id: Option<[u8; 20]>,
    pub ip: IpAddr,
    pub port: u16,
    pub source: PeerSource,
    /// Peer is known to support encryption.
    pub supports_encryption: bool,
    /// Flags carried over from PEX gossip.
    pub pex_flags: PexPeerFlags,
    /// Poor behaviour from trusted peers is tolerated.
    pub trusted: bool,
}

impl Peer {
    pub fn new(addr: SocketAddr, source: PeerSource) -> Self {
        Self {
            id: None,
            ip: addr.ip(),
            port: addr.port(),
            source,
            supports_encryption: false,
            pex_flags: PexPeerFlags::default(),
            trusted: false,
        }
    }

    /// Build a record from a PEX `added` entry. A peer that prefers
    /// encryption necessarily supports it.
    pub fn from_pex(addr: SocketAddr, flags: PexPeerFlags) -> Self {
        let mut peer = Self::new(addr, PeerSource::Pex);
        peer.pex_flags = flags;
        if flags.contains(PexPeerFlags::PREFERS_ENCRYPTION) {
            peer.supports_encryption = true;
        }
        peer
    }

    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

/// Deterministic dial priority derived from our public IP and the peer's
/// endpoint, so independent nodes observing the same swarm prefer
/// overlapping peers.
pub fn peer_priority(local_public_ip: Option<IpAddr>, addr: SocketAddr) -> u32 {
    let mut hasher = Sha1::new();
    match local_public_ip {
        Some(IpAddr::V4(ip)) => hasher.update(ip.octets()),
        Some(IpAddr::V6(ip)) => hasher.update(ip.octets()),
        None => hasher.update([0u8; 4]),
    }
    match addr.ip() {
        IpAddr::V4(ip) => hasher.update(ip.octets()),
        IpAddr::V6(ip) => hasher.update(ip.octets()),
    }
    hasher.update(addr.port().to_be_bytes());
    let digest = hasher.finalize();
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}

/// Ordering key: trusted peers sort above untrusted, then by priority.
/// The address disambiguates equal priorities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct PoolKey {
    trusted: bool,
    priority: u32,
    addr_tiebreak: (IpAddr, u16),
}

/// Bounded, priority-ordered set of candidate peers.
///
/// Peers are stored with their priority at insertion; a change of our
/// apparent IP does not re-rank existing entries.
pub struct PeerPool {
    inner: RwLock<PoolInner>,
    capacity: usize,
    local_public_ip: Option<IpAddr>,
}

struct PoolInner {
    ordered: BTreeMap<PoolKey, Peer>,
    by_addr: HashMap<SocketAddr, PoolKey>,
}

impl PeerPool {
    pub fn new(capacity: usize, local_public_ip: Option<IpAddr>) -> Self {
        Self {
            inner: RwLock::new(PoolInner {
                ordered: BTreeMap::new(),
                by_addr: HashMap::new(),
            }),
            capacity,
            local_public_ip,
        }
    }

    /// Insert a candidate, replacing any entry for the same address.
    /// When full, the lowest-priority entry is evicted. Returns true if
    /// an existing entry for the address was replaced.
    pub fn add(&self, peer: Peer) -> bool {
        let addr = peer.addr();
        let key = PoolKey {
            trusted: peer.trusted,
            priority: peer_priority(self.local_public_ip, addr),
            addr_tiebreak: (addr.ip(), addr.port()),
        };

        let mut inner = self.inner.write();
        let replaced = if let Some(old) = inner.by_addr.remove(&addr) {
            inner.ordered.remove(&old);
            true
        } else {
            false
        };
        inner.ordered.insert(key, peer);
        inner.by_addr.insert(addr, key);

        while inner.ordered.len() > self.capacity {
            if let Some((&min, _)) = inner.ordered.iter().next() {
                if let Some(evicted) = inner.ordered.remove(&min) {
                    inner.by_addr.remove(&evicted.addr());
                }
            }
        }
        replaced
    }

    /// Take the best candidate to dial next.
    pub fn pop_max(&self) -> Option<Peer> {
        let mut inner = self.inner.write();
        let (&key, _) = inner.ordered.iter().next_back()?;
        let peer = inner.ordered.remove(&key)?;
        inner.by_addr.remove(&peer.addr());
        Some(peer)
    }

    /// Evict the worst candidate.
    pub fn pop_min(&self) -> Option<Peer> {
        let mut inner = self.inner.write();
        let (&key, _) = inner.ordered.iter().next()?;
        let peer = inner.ordered.remove(&key)?;
        inner.by_addr.remove(&peer.addr());
        Some(peer)
    }

    pub fn len(&self) -> usize {
        self.inner.read().ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, addr: SocketAddr) -> bool {
        self.inner.read().by_addr.contains_key(&addr)
    }

    /// Visit every candidate in ascending priority order.
    pub fn each(&self, mut f: impl FnMut(&Peer)) {
        let inner = self.inner.read();
        for peer in inner.ordered.values() {
            f(peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8, port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, last)), port)
    }

    #[test]
    fn priority_is_deterministic() {
        let local: IpAddr = "203.0.113.7".parse().unwrap();
        let a = peer_priority(Some(local), addr(1, 6881));
        let b = peer_priority(Some(local), addr(1, 6881));
        assert_eq!(a, b);
        // A different endpoint yields a different priority with
        // overwhelming likelihood.
        let c = peer_priority(Some(local), addr(1, 6882));
        assert_ne!(a, c);
    }

    #[test]
    fn from_pex_prefers_encryption_implies_support() {
        let peer = Peer::from_pex(addr(1, 1), PexPeerFlags::PREFERS_ENCRYPTION);
        assert!(peer.supports_encryption);
        assert_eq!(peer.source, PeerSource::Pex);

        let plain = Peer::from_pex(addr(2, 2), PexPeerFlags::default());
        assert!(!plain.supports_encryption);
    }

    #[test]
    fn add_replaces_same_address() {
        let pool = PeerPool::new(8, None);
        assert!(!pool.add(Peer::new(addr(1, 1), PeerSource::Tracker)));
        assert!(pool.add(Peer::new(addr(1, 1), PeerSource::Pex)));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn trusted_peers_pop_first() {
        let pool = PeerPool::new(8, None);
        for i in 1..=5 {
            pool.add(Peer::new(addr(i, 6881), PeerSource::Tracker));
        }
        let mut trusted = Peer::new(addr(9, 6881), PeerSource::User);
        trusted.trusted = true;
        pool.add(trusted.clone());

        assert_eq!(pool.pop_max().unwrap().addr(), trusted.addr());
    }

    #[test]
    fn bounded_capacity_evicts_minimum() {
        let pool = PeerPool::new(3, None);
        for i in 1..=10 {
            pool.add(Peer::new(addr(i, 6881), PeerSource::Tracker));
        }
        assert_eq!(pool.len(), 3);

        // The survivors are the three highest-priority entries: popping
        // max three times drains the pool in descending order.
        let a = pool.pop_max().unwrap();
        let b = pool.pop_max().unwrap();
        let c = pool.pop_max().unwrap();
        assert!(pool.pop_max().is_none());
        let pa = peer_priority(None, a.addr());
        let pb = peer_priority(None, b.addr());
        let pc = peer_priority(None, c.addr());
        assert!(pa >= pb && pb >= pc);
    }

    #[test]
    fn each_visits_in_order() {
        let pool = PeerPool::new(8, None);
        for i in 1..=4 {
            pool.add(Peer::new(addr(i, 6881), PeerSource::Tracker));
        }
        let mut prios = Vec::new();
        pool.each(|p| prios.push(peer_priority(None, p.addr())));
        let mut sorted = prios.clone();
        sorted.sort();
        assert_eq!(prios, sorted);
    }
}
