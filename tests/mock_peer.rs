//! A scripted remote peer for exercising the engine against a fixed
//! message sequence, plus listener-side handshake dispatch checks.

mod support;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bitvec::prelude::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use riptide::{InfoHash, Peer, PeerSource};
use support::{greeting_metainfo, leeching_client, GREETING_CONTENTS};

const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";

/// Fixed-behavior remote peer: handshakes, advertises all pieces,
/// unchokes on interest, serves blocks out of `payload`.
struct ScriptedPeer {
    listener: TcpListener,
    info_hash: [u8; 20],
    payload: Vec<u8>,
    num_pieces: usize,
}

impl ScriptedPeer {
    async fn bind(info_hash: [u8; 20], payload: Vec<u8>, num_pieces: usize) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        Self {
            listener,
            info_hash,
            payload,
            num_pieces,
        }
    }

    fn addr(&self) -> SocketAddr {
        self.listener.local_addr().expect("local addr")
    }

    fn serve(self: Arc<Self>) {
        tokio::spawn(async move {
            while let Ok((stream, _)) = self.listener.accept().await {
                let peer = Arc::clone(&self);
                tokio::spawn(async move {
                    let _ = peer.run(stream).await;
                });
            }
        });
    }

    async fn run(&self, mut stream: TcpStream) -> std::io::Result<()> {
        // Read the dialer's handshake, answer with ours.
        let mut theirs = [0u8; 68];
        stream.read_exact(&mut theirs).await?;
        assert_eq!(theirs[0] as usize, PROTOCOL_STRING.len());
        assert_eq!(&theirs[1..20], PROTOCOL_STRING);
        assert_eq!(&theirs[28..48], &self.info_hash);

        let mut ours = Vec::with_capacity(68);
        ours.push(19);
        ours.extend_from_slice(PROTOCOL_STRING);
        ours.extend_from_slice(&[0u8; 8]);
        ours.extend_from_slice(&self.info_hash);
        ours.extend_from_slice(b"-MK0001-abcdefghijkl");
        stream.write_all(&ours).await?;

        // Bitfield first: we have everything.
        let mut pieces = bitvec![u8, Msb0; 1; self.num_pieces];
        pieces.resize(pieces.len().div_ceil(8) * 8, false);
        let raw = pieces.into_vec();
        let mut frame = Vec::new();
        frame.extend_from_slice(&(1 + raw.len() as u32).to_be_bytes());
        frame.push(5);
        frame.extend_from_slice(&raw);
        stream.write_all(&frame).await?;

        loop {
            let mut len_buf = [0u8; 4];
            stream.read_exact(&mut len_buf).await?;
            let len = u32::from_be_bytes(len_buf) as usize;
            if len == 0 {
                continue; // keep-alive
            }
            let mut body = vec![0u8; len];
            stream.read_exact(&mut body).await?;
            match body[0] {
                // Interested: unchoke immediately.
                2 => stream.write_all(&[0, 0, 0, 1, 1]).await?,
                // Request: serve the block from the payload.
                6 => {
                    let piece = u32::from_be_bytes(body[1..5].try_into().unwrap());
                    let begin = u32::from_be_bytes(body[5..9].try_into().unwrap());
                    let length = u32::from_be_bytes(body[9..13].try_into().unwrap()) as usize;
                    let start = piece as usize * 32 * 1024 + begin as usize;
                    let block = &self.payload[start..start + length];

                    let mut reply = Vec::with_capacity(13 + block.len());
                    reply.extend_from_slice(&(9 + block.len() as u32).to_be_bytes());
                    reply.push(7);
                    reply.extend_from_slice(&piece.to_be_bytes());
                    reply.extend_from_slice(&begin.to_be_bytes());
                    reply.extend_from_slice(block);
                    stream.write_all(&reply).await?;
                }
                _ => {}
            }
        }
    }
}

#[tokio::test]
async fn leech_from_scripted_peer() {
    let metainfo = greeting_metainfo();
    let peer = Arc::new(
        ScriptedPeer::bind(
            metainfo.info_hash.0,
            GREETING_CONTENTS.to_vec(),
            metainfo.info.num_pieces(),
        )
        .await,
    );
    let peer_addr = peer.addr();
    peer.serve();

    let (client, payload_store) = leeching_client(&metainfo.info).await;
    let torrent = client.add_metainfo(&metainfo).unwrap();
    torrent.add_peers([Peer::new(peer_addr, PeerSource::User)]);

    let mut done = torrent.subscribe_complete();
    timeout(Duration::from_secs(30), done.wait_for(|c| *c))
        .await
        .expect("download from scripted peer finishes")
        .expect("completion channel stays open");

    assert_eq!(payload_store.contents(), GREETING_CONTENTS);
    client.close();
}

#[tokio::test]
async fn listener_rejects_unknown_infohash() {
    let metainfo = greeting_metainfo();
    let (client, _store) = leeching_client(&metainfo.info).await;
    client.add_metainfo(&metainfo).unwrap();

    // Handshake for a swarm this client does not carry.
    let mut stream = TcpStream::connect(client.local_addr()).await.unwrap();
    let mut handshake = Vec::with_capacity(68);
    handshake.push(19);
    handshake.extend_from_slice(PROTOCOL_STRING);
    handshake.extend_from_slice(&[0u8; 8]);
    handshake.extend_from_slice(&[0xEE; 20]);
    handshake.extend_from_slice(b"-XX0001-000000000000");
    stream.write_all(&handshake).await.unwrap();

    // The listener hangs up without answering.
    let mut buf = [0u8; 1];
    let read = timeout(Duration::from_secs(10), stream.read(&mut buf))
        .await
        .expect("connection should be dropped promptly")
        .expect("read after drop");
    assert_eq!(read, 0, "no bytes should come back for an unknown swarm");

    client.close();
}

#[tokio::test]
async fn listener_accepts_known_infohash() {
    let metainfo = greeting_metainfo();
    let (client, _store) = leeching_client(&metainfo.info).await;
    client.add_metainfo(&metainfo).unwrap();

    let mut stream = TcpStream::connect(client.local_addr()).await.unwrap();
    let mut handshake = Vec::with_capacity(68);
    handshake.push(19);
    handshake.extend_from_slice(PROTOCOL_STRING);
    handshake.extend_from_slice(&[0u8; 8]);
    handshake.extend_from_slice(&metainfo.info_hash.0);
    handshake.extend_from_slice(b"-MK0001-000000000000");
    stream.write_all(&handshake).await.unwrap();

    // The engine answers with its own handshake for our swarm.
    let mut reply = [0u8; 68];
    timeout(Duration::from_secs(10), stream.read_exact(&mut reply))
        .await
        .expect("handshake reply in time")
        .expect("read handshake");
    assert_eq!(reply[0] as usize, PROTOCOL_STRING.len());
    assert_eq!(&reply[1..20], PROTOCOL_STRING);
    assert_eq!(InfoHash(reply[28..48].try_into().unwrap()), metainfo.info_hash);
    assert_eq!(&reply[48..56], b"-RP0001-");

    client.close();
}
