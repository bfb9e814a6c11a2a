#![allow(dead_code)]

//! Shared fixtures for the integration tests.
//!
//! The canonical fixture is the "greeting" torrent: a single file named
//! `greeting` containing `"hello, world\n"` with a 1 MiB piece length,
//! so the whole payload is one short piece.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sha1::{Digest, Sha1};

use riptide::metainfo::FileItem;
use riptide::storage::PreparedStorage;
use riptide::{Client, ClientConfig, Info, MemoryTorrent, MetaInfo};

pub const GREETING_NAME: &str = "greeting";
pub const GREETING_CONTENTS: &[u8] = b"hello, world\n";

/// Install a subscriber honoring `RUST_LOG`; repeat calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Hash a payload into the concatenated piece-hash blob.
pub fn piece_hashes(payload: &[u8], piece_length: u64) -> Vec<u8> {
    let mut pieces = Vec::new();
    for chunk in payload.chunks(piece_length.max(1) as usize) {
        let mut hasher = Sha1::new();
        hasher.update(chunk);
        let digest: [u8; 20] = hasher.finalize().into();
        pieces.extend_from_slice(&digest);
    }
    pieces
}

/// Build a single-file info dictionary for an arbitrary payload.
pub fn single_file_info(name: &str, payload: &[u8], piece_length: u64) -> Info {
    Info {
        name: name.to_owned(),
        piece_length,
        pieces: piece_hashes(payload, piece_length),
        files: vec![FileItem {
            path: PathBuf::from(name),
            length: payload.len() as u64,
            offset: 0,
        }],
        total_length: payload.len() as u64,
        single_file: true,
    }
}

/// The greeting metainfo with no tracker.
pub fn greeting_metainfo() -> MetaInfo {
    MetaInfo::from_info(
        single_file_info(GREETING_NAME, GREETING_CONTENTS, 1 << 20),
        None,
    )
}

/// Test-friendly config: loopback listener, fast choke rotation.
pub fn test_config() -> ClientConfig {
    let mut config = ClientConfig::new().listen_addr("127.0.0.1:0".parse().unwrap());
    config.choke_interval = Duration::from_millis(200);
    config.optimistic_interval = Duration::from_millis(400);
    config
}

/// A client seeding `payload` for the given info from memory.
pub async fn seeding_client(info: &Info, payload: &[u8]) -> Arc<Client> {
    let storage = Arc::new(PreparedStorage(Arc::new(MemoryTorrent::seeded(
        info,
        payload.to_vec(),
    ))));
    Client::new(test_config().seed(true), storage)
        .await
        .expect("seeder client")
}

/// A leeching client writing into the returned memory torrent.
pub async fn leeching_client(info: &Info) -> (Arc<Client>, Arc<MemoryTorrent>) {
    let torrent_storage = Arc::new(MemoryTorrent::empty(info));
    let storage = Arc::new(PreparedStorage(torrent_storage.clone()));
    let client = Client::new(test_config(), storage)
        .await
        .expect("leecher client");
    (client, torrent_storage)
}
