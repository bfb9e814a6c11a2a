//! DHT collaborator seam (BEP 5).
//!
//! The node table lives outside this crate. The engine consumes any
//! [`PeerDiscovery`] implementation: drivers periodically pull peers
//! into the pool and announce our listen port.

use std::net::SocketAddr;

use async_trait::async_trait;

use crate::metainfo::InfoHash;

/// Trackerless peer source.
#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    /// Peers currently known for the swarm.
    async fn find_peers(&self, info_hash: InfoHash) -> Vec<SocketAddr>;

    /// Advertise ourselves as a member of the swarm.
    async fn announce(&self, info_hash: InfoHash, port: u16);
}

/// Discovery disabled: finds nobody, announces nowhere.
pub struct NullDiscovery;

#[async_trait]
impl PeerDiscovery for NullDiscovery {
    async fn find_peers(&self, _info_hash: InfoHash) -> Vec<SocketAddr> {
        Vec::new()
    }

    async fn announce(&self, _info_hash: InfoHash, _port: u16) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn null_discovery_is_empty() {
        let discovery = NullDiscovery;
        assert!(discovery.find_peers(InfoHash::default()).await.is_empty());
        discovery.announce(InfoHash::default(), 6881).await;
    }
}
