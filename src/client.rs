//! Process-wide coordinator.
//!
//! The client owns the listening socket, the global rate limiters, the
//! choke rotator, and the registry of torrent drivers keyed by infohash.
//! Incoming connections are dispatched by the infohash in the handshake;
//! unknown infohashes are rejected after reading the preamble.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::time::timeout;

use crate::config::ClientConfig;
use crate::dht::PeerDiscovery;
use crate::error::Result;
use crate::magnet::MagnetUri;
use crate::metainfo::{InfoHash, MetaInfo};
use crate::peers::{Peer, PeerSource};
use crate::rate::RateLimiter;
use crate::storage::Storage;
use crate::torrent::{Torrent, TorrentStatus};
use crate::wire::Handshake;

/// Interval between DHT peer sweeps.
const DISCOVERY_INTERVAL: Duration = Duration::from_secs(300);

/// Generate an Azureus-style peer id: `-RP0001-` plus 12 random bytes.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(b"-RP0001-");
    rand::rng().fill(&mut peer_id[8..]);
    peer_id
}

/// Snapshot of the whole client.
#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub peer_id: String,
    pub listen_addr: SocketAddr,
    pub torrents: Vec<TorrentStatus>,
}

/// The engine entry point.
pub struct Client {
    me: Weak<Client>,
    config: ClientConfig,
    peer_id: [u8; 20],
    listen_addr: SocketAddr,
    storage: Arc<dyn Storage>,
    discovery: Option<Arc<dyn PeerDiscovery>>,
    download_limiter: RateLimiter,
    upload_limiter: RateLimiter,
    torrents: Mutex<HashMap<InfoHash, Arc<Torrent>>>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl Client {
    /// Bind the listener and start the accept loop and choke rotator.
    pub async fn new(config: ClientConfig, storage: Arc<dyn Storage>) -> Result<Arc<Self>> {
        Self::with_discovery(config, storage, None).await
    }

    /// As [`Client::new`], with a DHT collaborator feeding peer pools.
    pub async fn with_discovery(
        config: ClientConfig,
        storage: Arc<dyn Storage>,
        discovery: Option<Arc<dyn PeerDiscovery>>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let listener = TcpListener::bind(config.listen_addr).await?;
        let listen_addr = listener.local_addr()?;

        let download_limiter = RateLimiter::from_limit(config.download_rate_limit);
        let upload_limiter = RateLimiter::from_limit(config.upload_rate_limit);

        let client = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            peer_id: generate_peer_id(),
            listen_addr,
            storage,
            discovery,
            download_limiter,
            upload_limiter,
            torrents: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        });

        {
            let accept = Arc::clone(&client);
            tokio::spawn(async move { accept.accept_loop(listener).await });
        }
        {
            let rotator = Arc::clone(&client);
            tokio::spawn(async move { rotator.choke_rotator().await });
        }
        if client.discovery.is_some() {
            let discovery = Arc::clone(&client);
            tokio::spawn(async move { discovery.discovery_loop().await });
        }

        tracing::info!(%listen_addr, "client listening");
        Ok(client)
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    /// Look up a running torrent.
    pub fn torrent(&self, info_hash: InfoHash) -> Option<Arc<Torrent>> {
        self.torrents.lock().get(&info_hash).cloned()
    }

    /// Add a torrent from a parsed metainfo document. Adding the same
    /// infohash twice returns the existing driver.
    pub fn add_metainfo(&self, metainfo: &MetaInfo) -> Result<Arc<Torrent>> {
        let torrent = self.register(
            metainfo.info_hash,
            Some(metainfo.info.name.clone()),
            metainfo.trackers(),
        )?;
        torrent.provide_info(metainfo.info.clone(), &metainfo.info_bytes)?;
        Ok(torrent)
    }

    /// Add a torrent from a magnet link; metadata arrives via BEP 9.
    pub fn add_magnet(&self, magnet: &MagnetUri) -> Result<Arc<Torrent>> {
        self.register(
            magnet.info_hash,
            magnet.display_name.clone(),
            magnet.trackers.clone(),
        )
    }

    /// Add a torrent from a bare infohash.
    pub fn add_info_hash(
        &self,
        info_hash: InfoHash,
        trackers: Vec<String>,
    ) -> Result<Arc<Torrent>> {
        self.register(info_hash, None, trackers)
    }

    fn register(
        &self,
        info_hash: InfoHash,
        name_hint: Option<String>,
        trackers: Vec<String>,
    ) -> Result<Arc<Torrent>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(crate::error::Error::Closed);
        }
        let mut torrents = self.torrents.lock();
        if let Some(existing) = torrents.get(&info_hash) {
            return Ok(Arc::clone(existing));
        }
        let torrent = Torrent::new(
            info_hash,
            name_hint,
            trackers,
            self.peer_id,
            self.listen_addr.port(),
            self.config.clone(),
            Arc::clone(&self.storage),
            self.download_limiter.clone(),
            self.upload_limiter.clone(),
        );
        torrent.start();
        torrents.insert(info_hash, Arc::clone(&torrent));
        tracing::info!(%info_hash, "torrent added");
        Ok(torrent)
    }

    /// Drop a torrent, closing all of its connections.
    pub fn remove(&self, info_hash: InfoHash) {
        if let Some(torrent) = self.torrents.lock().remove(&info_hash) {
            torrent.close();
        }
    }

    /// Shut the whole client down.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();
        let torrents: Vec<Arc<Torrent>> = self.torrents.lock().values().cloned().collect();
        for torrent in torrents {
            torrent.close();
        }
        tracing::info!("client closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Read-only snapshot of every torrent.
    pub fn status(&self) -> ClientStatus {
        ClientStatus {
            peer_id: hex::encode(self.peer_id),
            listen_addr: self.listen_addr,
            torrents: self
                .torrents
                .lock()
                .values()
                .map(|t| t.status())
                .collect(),
        }
    }

    /// Render the status snapshot as text.
    pub fn write_status(&self, out: &mut impl std::io::Write) -> std::io::Result<()> {
        let status = self.status();
        writeln!(out, "listening on {}", status.listen_addr)?;
        for torrent in &status.torrents {
            writeln!(
                out,
                "{} {:?} pieces {}/{} peers {}/{} down {} up {}",
                torrent.name,
                torrent.state,
                torrent.pieces_complete,
                torrent.pieces_total,
                torrent.peers_active,
                torrent.peers_max,
                torrent.bytes_down,
                torrent.bytes_up,
            )?;
            for tracker in &torrent.trackers {
                match &tracker.last_error {
                    Some(err) => writeln!(out, "  tracker {} error: {err}", tracker.url)?,
                    None => writeln!(out, "  tracker {}", tracker.url)?,
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Background loops.

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = self.shutdown.notified() => return,
            };
            match accepted {
                Ok((stream, addr)) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.handle_incoming(stream, addr).await });
                }
                Err(e) => {
                    // The accept loop dies alone; outgoing dials continue.
                    tracing::warn!(error = %e, "accept loop terminated");
                    return;
                }
            }
        }
    }

    async fn handle_incoming(&self, mut stream: TcpStream, addr: SocketAddr) {
        let handshake = match timeout(
            self.config.handshake_timeout,
            Handshake::read_from(&mut stream),
        )
        .await
        {
            Ok(Ok(handshake)) => handshake,
            Ok(Err(e)) => {
                tracing::debug!(%addr, error = %e, "bad incoming handshake");
                return;
            }
            Err(_) => {
                tracing::debug!(%addr, "incoming handshake timed out");
                return;
            }
        };
        match self.torrent(handshake.info_hash) {
            Some(torrent) => torrent.spawn_incoming(stream, handshake),
            None => {
                tracing::debug!(%addr, info_hash = %handshake.info_hash, "unknown infohash rejected");
            }
        }
    }

    /// Re-rank chokes every interval across all torrents.
    async fn choke_rotator(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.choke_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.notified() => return,
            }
            let torrents: Vec<Arc<Torrent>> = self.torrents.lock().values().cloned().collect();
            for torrent in torrents {
                torrent.choke_tick();
            }
        }
    }

    /// Poll the DHT collaborator for peers and announce our port.
    async fn discovery_loop(self: Arc<Self>) {
        let Some(discovery) = self.discovery.clone() else {
            return;
        };
        let mut ticker = tokio::time::interval(DISCOVERY_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.notified() => return,
            }
            let torrents: Vec<Arc<Torrent>> = self.torrents.lock().values().cloned().collect();
            for torrent in torrents {
                let found = discovery.find_peers(torrent.info_hash).await;
                if !found.is_empty() {
                    tracing::debug!(
                        info_hash = %torrent.info_hash,
                        count = found.len(),
                        "peers learned via dht"
                    );
                    torrent.add_peers(
                        found
                            .into_iter()
                            .map(|addr| Peer::new(addr, PeerSource::Dht)),
                    );
                }
                discovery
                    .announce(torrent.info_hash, self.listen_addr.port())
                    .await;
            }
        }
    }

    /// Self-handle for spawned helpers.
    #[allow(dead_code)]
    fn arc(&self) -> Option<Arc<Client>> {
        self.me.upgrade()
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.shutdown.notify_waiters();
    }
}
