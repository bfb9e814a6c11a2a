//! # riptide
//!
//! The core of a BitTorrent engine: given a set of torrents and a pool
//! of candidate peers, it establishes connections, speaks the peer wire
//! protocol (BEP 3 with the fast, extended, metadata, and PEX
//! extensions), requests and hash-verifies data, and drives each torrent
//! from metadata discovery through completion and optional seeding.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use riptide::{Client, ClientConfig, FileStorage, MetaInfo};
//!
//! #[tokio::main]
//! async fn main() -> riptide::Result<()> {
//!     let config = ClientConfig::new()
//!         .listen_addr("0.0.0.0:6881".parse().unwrap())
//!         .seed(true);
//!     let storage = Arc::new(FileStorage::new("downloads"));
//!     let client = Client::new(config, storage).await?;
//!
//!     let raw = std::fs::read("example.torrent")?;
//!     let torrent = client.add_metainfo(&MetaInfo::parse(&raw)?)?;
//!
//!     let mut complete = torrent.subscribe_complete();
//!     complete.wait_for(|done| *done).await.ok();
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod bencode;
pub mod choke;
pub mod chunks;
pub mod client;
pub mod config;
pub mod connection;
pub mod dht;
pub mod digest;
pub mod error;
pub mod magnet;
pub mod metadata;
pub mod metainfo;
pub mod peers;
pub mod pex;
pub mod rate;
pub mod storage;
pub mod torrent;
pub mod tracker;
pub mod wire;

pub use client::{generate_peer_id, Client, ClientStatus};
pub use config::ClientConfig;
pub use error::{Error, ProtocolKind, Result, TrackerKind};
pub use magnet::MagnetUri;
pub use metainfo::{Info, InfoHash, MetaInfo};
pub use peers::{Peer, PeerSource};
pub use storage::{FileStorage, MemoryStorage, MemoryTorrent, PreparedStorage, Storage, TorrentStorage};
pub use torrent::{Torrent, TorrentState, TorrentStatus};
