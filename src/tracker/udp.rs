//! UDP tracker protocol (BEP 15) with BEP 41 URL-data options.
//!
//! A session caches the 64-bit connection id for 60 seconds; afterwards
//! the next announce re-issues Connect. Each socket wait runs under the
//! caller's task, so dropping the announce future cancels the exchange.

use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};
use url::Url;

use super::{AnnounceRequest, AnnounceResponse};
use crate::backoff::{exponential, Maximum, Strategy};
use crate::error::{Error, Result, TrackerKind};
use crate::peers::{Peer, PeerSource};

/// Magic connection id for Connect requests.
pub const CONNECT_MAGIC: i64 = 0x41727101980;

/// Connection ids are valid for one minute after receipt.
const CONNECTION_ID_TTL: Duration = Duration::from_secs(60);

/// Retransmits per exchange before giving up.
const MAX_ATTEMPTS: u32 = 3;

const ACTION_CONNECT: u32 = 0;
const ACTION_ANNOUNCE: u32 = 1;
const ACTION_ERROR: u32 = 3;

// BEP 41 option types.
const OPTION_URL_DATA: u8 = 2;

/// Per-read deadline: 15s * 2^n for n contiguous timeouts, capped at n=8.
fn read_deadline(contiguous_timeouts: u32) -> Duration {
    Maximum(exponential(Duration::from_secs(15)), Duration::from_secs(15 * 256))
        .backoff(contiguous_timeouts)
}

/// Whether a cached connection id is still usable.
fn connection_id_fresh(received_at: Option<Instant>, now: Instant) -> bool {
    received_at
        .map(|at| now.duration_since(at) < CONNECTION_ID_TTL)
        .unwrap_or(false)
}

/// One UDP tracker endpoint with its cached connection id.
pub struct UdpSession {
    socket: UdpSocket,
    ipv6: bool,
    /// Request URI forwarded via the BEP 41 URL-data option.
    request_uri: String,
    connection_id: i64,
    connection_id_received: Option<Instant>,
    contiguous_timeouts: u32,
}

impl UdpSession {
    /// Resolve the tracker host and bind a matching-family socket.
    pub async fn connect(url: &Url) -> Result<Self> {
        let host = url
            .host_str()
            .ok_or_else(|| Error::tracker(TrackerKind::Network, "tracker URL has no host"))?;
        let port = url.port().unwrap_or(80);

        let addr = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| Error::tracker(TrackerKind::Network, format!("resolve failed: {e}")))?
            .next()
            .ok_or_else(|| Error::tracker(TrackerKind::Network, "no addresses for tracker"))?;

        let bind_addr: SocketAddr = if addr.is_ipv6() {
            "[::]:0".parse().expect("static addr")
        } else {
            "0.0.0.0:0".parse().expect("static addr")
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| Error::tracker(TrackerKind::Network, format!("bind failed: {e}")))?;
        socket
            .connect(addr)
            .await
            .map_err(|e| Error::tracker(TrackerKind::Network, format!("connect failed: {e}")))?;

        let mut request_uri = url.path().to_owned();
        if let Some(query) = url.query() {
            request_uri.push('?');
            request_uri.push_str(query);
        }

        Ok(Self {
            socket,
            ipv6: addr.is_ipv6(),
            request_uri,
            connection_id: CONNECT_MAGIC,
            connection_id_received: None,
            contiguous_timeouts: 0,
        })
    }

    /// Bind a session directly at an address (tests).
    #[cfg(test)]
    pub(crate) async fn connect_addr(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind("127.0.0.1:0")
            .await
            .map_err(|e| Error::tracker(TrackerKind::Network, e.to_string()))?;
        socket
            .connect(addr)
            .await
            .map_err(|e| Error::tracker(TrackerKind::Network, e.to_string()))?;
        Ok(Self {
            socket,
            ipv6: false,
            request_uri: "/announce".to_owned(),
            connection_id: CONNECT_MAGIC,
            connection_id_received: None,
            contiguous_timeouts: 0,
        })
    }

    /// Whether the cached connection id is still valid.
    pub fn connected(&self) -> bool {
        connection_id_fresh(self.connection_id_received, Instant::now())
    }

    /// Announce, issuing Connect first if the connection id is stale.
    pub async fn announce(
        &mut self,
        req: &AnnounceRequest,
        client_ip4: Option<std::net::Ipv4Addr>,
    ) -> Result<AnnounceResponse> {
        self.ensure_connected().await?;

        let mut body = Vec::with_capacity(82);
        body.extend_from_slice(req.info_hash.as_bytes());
        body.extend_from_slice(&req.peer_id);
        body.extend_from_slice(&req.downloaded.to_be_bytes());
        body.extend_from_slice(&req.left.to_be_bytes());
        body.extend_from_slice(&req.uploaded.to_be_bytes());
        body.extend_from_slice(&req.event.udp_id().to_be_bytes());
        // BEP 15: the IP field is zero over IPv6.
        let ip_field = if self.ipv6 {
            0
        } else if req.ip_address != 0 {
            req.ip_address
        } else {
            client_ip4.map(u32::from).unwrap_or(0)
        };
        body.extend_from_slice(&ip_field.to_be_bytes());
        body.extend_from_slice(&req.key.to_be_bytes());
        body.extend_from_slice(&req.num_want.to_be_bytes());
        body.extend_from_slice(&req.port.to_be_bytes());

        // BEP 41 URL-data option carries the announce path. Limited to
        // 255 bytes by the one-byte length.
        let mut options = Vec::new();
        let uri = self.request_uri.as_bytes();
        if !uri.is_empty() && uri.len() <= 255 {
            options.push(OPTION_URL_DATA);
            options.push(uri.len() as u8);
            options.extend_from_slice(uri);
        }

        let payload = self.exchange(ACTION_ANNOUNCE, &body, &options).await?;
        self.parse_announce(&payload)
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.connected() {
            return Ok(());
        }
        self.connection_id = CONNECT_MAGIC;
        let payload = self.exchange(ACTION_CONNECT, &[], &[]).await?;
        if payload.len() < 8 {
            return Err(Error::tracker(
                TrackerKind::Parse,
                "connect response too short",
            ));
        }
        self.connection_id = i64::from_be_bytes(payload[..8].try_into().expect("checked len"));
        self.connection_id_received = Some(Instant::now());
        Ok(())
    }

    /// Send a request and wait for the matching response, retransmitting
    /// on timeout with the BEP 15 schedule. Returns the payload after
    /// the 8-byte response header.
    async fn exchange(&mut self, action: u32, body: &[u8], options: &[u8]) -> Result<Vec<u8>> {
        let tid: i32 = rand::rng().random();

        let mut packet = Vec::with_capacity(16 + body.len() + options.len());
        packet.extend_from_slice(&self.connection_id.to_be_bytes());
        packet.extend_from_slice(&action.to_be_bytes());
        packet.extend_from_slice(&tid.to_be_bytes());
        packet.extend_from_slice(body);
        packet.extend_from_slice(options);

        let mut buf = vec![0u8; 0x800];
        for _ in 0..MAX_ATTEMPTS {
            self.socket
                .send(&packet)
                .await
                .map_err(|e| Error::tracker(TrackerKind::Network, format!("send failed: {e}")))?;

            let deadline = Instant::now() + read_deadline(self.contiguous_timeouts);
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let n = match timeout(remaining, self.socket.recv(&mut buf)).await {
                    Err(_) => {
                        self.contiguous_timeouts += 1;
                        break;
                    }
                    Ok(Err(e)) => {
                        return Err(Error::tracker(
                            TrackerKind::Network,
                            format!("recv failed: {e}"),
                        ))
                    }
                    Ok(Ok(n)) => n,
                };
                if n < 8 {
                    continue;
                }
                let got_action = u32::from_be_bytes(buf[0..4].try_into().expect("len"));
                let got_tid = i32::from_be_bytes(buf[4..8].try_into().expect("len"));
                if got_tid != tid {
                    // Stale datagram from an earlier exchange.
                    continue;
                }
                self.contiguous_timeouts = 0;
                if got_action == ACTION_ERROR {
                    let message = String::from_utf8_lossy(&buf[8..n]).into_owned();
                    return Err(Error::tracker(TrackerKind::Failure, message));
                }
                if got_action != action {
                    return Err(Error::tracker(
                        TrackerKind::Parse,
                        format!("unexpected action {got_action}"),
                    ));
                }
                return Ok(buf[8..n].to_vec());
            }
        }
        Err(Error::Tracker {
            kind: TrackerKind::Timeout,
            message: format!(
                "no response after {MAX_ATTEMPTS} attempts ({} contiguous timeouts)",
                self.contiguous_timeouts
            ),
            retry_after: Some(read_deadline(self.contiguous_timeouts)),
        })
    }

    fn parse_announce(&self, payload: &[u8]) -> Result<AnnounceResponse> {
        if payload.len() < 12 {
            return Err(Error::tracker(
                TrackerKind::Parse,
                "announce response too short",
            ));
        }
        let interval = i32::from_be_bytes(payload[0..4].try_into().expect("len"));
        let leechers = i32::from_be_bytes(payload[4..8].try_into().expect("len"));
        let seeders = i32::from_be_bytes(payload[8..12].try_into().expect("len"));

        let compact = &payload[12..];
        let entry = if self.ipv6 { 18 } else { 6 };
        let mut peers = Vec::with_capacity(compact.len() / entry);
        for chunk in compact.chunks_exact(entry) {
            let addr: SocketAddr = if self.ipv6 {
                let octets: [u8; 16] = chunk[..16].try_into().expect("entry is 18");
                SocketAddr::new(
                    std::net::Ipv6Addr::from(octets).into(),
                    u16::from_be_bytes([chunk[16], chunk[17]]),
                )
            } else {
                SocketAddr::new(
                    std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]).into(),
                    u16::from_be_bytes([chunk[4], chunk[5]]),
                )
            };
            peers.push(Peer::new(addr, PeerSource::Tracker));
        }

        Ok(AnnounceResponse {
            interval,
            leechers,
            seeders,
            peers,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::InfoHash;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn retransmit_schedule() {
        assert_eq!(read_deadline(0), Duration::from_secs(15));
        assert_eq!(read_deadline(1), Duration::from_secs(30));
        assert_eq!(read_deadline(8), Duration::from_secs(15 * 256));
        // Capped beyond n=8.
        assert_eq!(read_deadline(20), Duration::from_secs(15 * 256));
    }

    #[test]
    fn connection_id_expiry() {
        let now = Instant::now();
        assert!(!connection_id_fresh(None, now));
        assert!(connection_id_fresh(Some(now), now));
        assert!(connection_id_fresh(
            Some(now),
            now + Duration::from_secs(59)
        ));
        assert!(!connection_id_fresh(
            Some(now),
            now + Duration::from_secs(61)
        ));
    }

    /// Mock tracker answering Connect and Announce, asserting the
    /// Connect magic and counting Connect exchanges.
    async fn mock_tracker(connects: Arc<AtomicUsize>) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        const CONNECTION_ID: i64 = 0x1122_3344_5566_7788;

        tokio::spawn(async move {
            let mut buf = vec![0u8; 0x800];
            loop {
                let Ok((n, from)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                if n < 16 {
                    continue;
                }
                let conn_id = i64::from_be_bytes(buf[0..8].try_into().unwrap());
                let action = u32::from_be_bytes(buf[8..12].try_into().unwrap());
                let tid = &buf[12..16];

                match action {
                    ACTION_CONNECT => {
                        assert_eq!(conn_id, CONNECT_MAGIC, "connect must carry the magic");
                        connects.fetch_add(1, Ordering::SeqCst);
                        let mut reply = Vec::new();
                        reply.extend_from_slice(&ACTION_CONNECT.to_be_bytes());
                        reply.extend_from_slice(tid);
                        reply.extend_from_slice(&CONNECTION_ID.to_be_bytes());
                        socket.send_to(&reply, from).await.unwrap();
                    }
                    ACTION_ANNOUNCE => {
                        assert_eq!(conn_id, CONNECTION_ID, "announce must reuse the id");
                        // Header + BEP 41 URL-data option expected.
                        let body = &buf[16..n];
                        assert!(body.len() >= 82, "announce body is 82 bytes");
                        let options = &body[82..];
                        assert_eq!(options.first(), Some(&OPTION_URL_DATA));
                        let uri_len = options[1] as usize;
                        assert_eq!(&options[2..2 + uri_len], b"/announce");

                        let mut reply = Vec::new();
                        reply.extend_from_slice(&ACTION_ANNOUNCE.to_be_bytes());
                        reply.extend_from_slice(tid);
                        reply.extend_from_slice(&1800i32.to_be_bytes()); // interval
                        reply.extend_from_slice(&2i32.to_be_bytes()); // leechers
                        reply.extend_from_slice(&5i32.to_be_bytes()); // seeders
                        reply.extend_from_slice(&[127, 0, 0, 1, 0x1A, 0xE1]);
                        socket.send_to(&reply, from).await.unwrap();
                    }
                    _ => {}
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn announce_reuses_connection_id() {
        let connects = Arc::new(AtomicUsize::new(0));
        let addr = mock_tracker(connects.clone()).await;

        let mut session = UdpSession::connect_addr(addr).await.unwrap();
        let req = AnnounceRequest::new(InfoHash([9; 20]), *b"-RP0001-000000000000", 6881);

        let response = session.announce(&req, None).await.unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.seeders, 5);
        assert_eq!(response.leechers, 2);
        assert_eq!(response.peers.len(), 1);
        assert_eq!(response.peers[0].addr().to_string(), "127.0.0.1:6881");
        assert_eq!(connects.load(Ordering::SeqCst), 1);

        // A second announce within the TTL skips Connect.
        session.announce(&req, None).await.unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 1);

        // Drop the cached id, as the 60 s TTL lapsing would: the next
        // announce reconnects.
        session.connection_id_received = None;
        session.announce(&req, None).await.unwrap();
        assert_eq!(connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn error_action_surfaces_failure() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 256];
            let (n, from) = socket.recv_from(&mut buf).await.unwrap();
            assert!(n >= 16);
            let mut reply = Vec::new();
            reply.extend_from_slice(&ACTION_ERROR.to_be_bytes());
            reply.extend_from_slice(&buf[12..16]);
            reply.extend_from_slice(b"torrent not registered");
            socket.send_to(&reply, from).await.unwrap();
        });

        let mut session = UdpSession::connect_addr(addr).await.unwrap();
        let req = AnnounceRequest::new(InfoHash([9; 20]), [1; 20], 1);
        match session.announce(&req, None).await {
            Err(Error::Tracker { kind, message, .. }) => {
                assert_eq!(kind, TrackerKind::Failure);
                assert!(message.contains("not registered"));
            }
            other => panic!("expected tracker failure, got {other:?}"),
        }
    }
}
