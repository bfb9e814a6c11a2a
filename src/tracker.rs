//! Tracker announce clients (HTTP per BEP 3, UDP per BEP 15).
//!
//! One entry point: [`Announce::do_announce`] dispatches on the URL
//! scheme. Unknown schemes fail with [`TrackerKind::BadScheme`].

mod http;
mod udp;

pub use udp::UdpSession;

use std::net::Ipv4Addr;

use url::Url;

use crate::error::{Error, Result, TrackerKind};
use crate::metainfo::InfoHash;
use crate::peers::Peer;

/// Announce event field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnnounceEvent {
    #[default]
    None,
    /// The local peer just completed the torrent.
    Completed,
    /// The local peer has just resumed this torrent.
    Started,
    /// The local peer is leaving the swarm.
    Stopped,
}

impl AnnounceEvent {
    pub(crate) fn udp_id(self) -> u32 {
        match self {
            Self::None => 0,
            Self::Completed => 1,
            Self::Started => 2,
            Self::Stopped => 3,
        }
    }

    pub(crate) fn http_str(self) -> &'static str {
        match self {
            Self::None => "",
            Self::Completed => "completed",
            Self::Started => "started",
            Self::Stopped => "stopped",
        }
    }
}

/// Announce request parameters. Marshalled as binary by the UDP client,
/// so field types match the wire.
#[derive(Debug, Clone, Copy)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
    pub downloaded: i64,
    /// Bytes still wanted. Unknown by default.
    pub left: i64,
    pub uploaded: i64,
    pub event: AnnounceEvent,
    pub ip_address: u32,
    pub key: i32,
    /// Peer count wanted; -1 for the tracker's default.
    pub num_want: i32,
    pub port: u16,
}

impl AnnounceRequest {
    /// Defaults: `left = i64::MAX`, `num_want = -1`, no event.
    pub fn new(info_hash: InfoHash, peer_id: [u8; 20], port: u16) -> Self {
        Self {
            info_hash,
            peer_id,
            downloaded: 0,
            left: i64::MAX,
            uploaded: 0,
            event: AnnounceEvent::None,
            ip_address: 0,
            key: 0,
            num_want: -1,
            port,
        }
    }

    pub fn uploaded(mut self, n: i64) -> Self {
        self.uploaded = n;
        self
    }

    pub fn downloaded(mut self, n: i64) -> Self {
        self.downloaded = n;
        self
    }

    pub fn remaining(mut self, n: i64) -> Self {
        self.left = n;
        self
    }

    pub fn event(mut self, event: AnnounceEvent) -> Self {
        self.event = event;
        self
    }

    /// Seeding announces report nothing left to download.
    pub fn seeding(mut self) -> Self {
        self.left = 0;
        self
    }

    /// Derive the tracker key from the tail of the peer id.
    pub fn keyed(mut self) -> Self {
        self.key = i32::from_be_bytes([
            self.peer_id[16],
            self.peer_id[17],
            self.peer_id[18],
            self.peer_id[19],
        ]);
        self
    }
}

/// Parsed announce response.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    /// Minimum seconds before the next announce.
    pub interval: i32,
    pub leechers: i32,
    pub seeders: i32,
    pub peers: Vec<Peer>,
}

/// One announce operation bound to a tracker URL.
#[derive(Debug, Clone, Default)]
pub struct Announce {
    pub tracker_url: String,
    pub user_agent: Option<String>,
    /// Our public IPv4, forwarded in UDP announces.
    pub client_ip4: Option<Ipv4Addr>,
}

impl Announce {
    pub fn for_tracker(uri: impl Into<String>) -> Self {
        Self {
            tracker_url: uri.into(),
            ..Self::default()
        }
    }

    /// Run the announce. Cancellation is the caller's: dropping the
    /// future abandons any in-flight exchange.
    pub async fn do_announce(&self, req: &AnnounceRequest) -> Result<AnnounceResponse> {
        let url = Url::parse(&self.tracker_url)?;
        match url.scheme() {
            "http" | "https" => http::announce(&url, req, self.user_agent.as_deref()).await,
            "udp" | "udp4" | "udp6" => {
                let mut session = UdpSession::connect(&url).await?;
                session.announce(req, self.client_ip4).await
            }
            scheme => Err(Error::tracker(
                TrackerKind::BadScheme,
                format!("unknown scheme {scheme:?}"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_per_contract() {
        let req = AnnounceRequest::new(InfoHash([1; 20]), [2; 20], 6881);
        assert_eq!(req.left, i64::MAX);
        assert_eq!(req.num_want, -1);
        assert_eq!(req.event, AnnounceEvent::None);
        assert_eq!(req.key, 0);
    }

    #[test]
    fn seeding_forces_left_zero() {
        let req = AnnounceRequest::new(InfoHash([1; 20]), [2; 20], 6881).seeding();
        assert_eq!(req.left, 0);
    }

    #[test]
    fn key_from_peer_id_tail() {
        let mut peer_id = [0u8; 20];
        peer_id[16..].copy_from_slice(&[0x01, 0x02, 0x03, 0x04]);
        let req = AnnounceRequest::new(InfoHash([1; 20]), peer_id, 6881).keyed();
        assert_eq!(req.key, 0x0102_0304);
    }

    #[test]
    fn event_ids_match_bep15() {
        assert_eq!(AnnounceEvent::None.udp_id(), 0);
        assert_eq!(AnnounceEvent::Completed.udp_id(), 1);
        assert_eq!(AnnounceEvent::Started.udp_id(), 2);
        assert_eq!(AnnounceEvent::Stopped.udp_id(), 3);
    }

    #[tokio::test]
    async fn unknown_scheme_is_bad_scheme() {
        let announce = Announce::for_tracker("wss://tracker.example/announce");
        let req = AnnounceRequest::new(InfoHash([0; 20]), [0; 20], 1);
        match announce.do_announce(&req).await {
            Err(Error::Tracker { kind, .. }) => assert_eq!(kind, TrackerKind::BadScheme),
            other => panic!("expected BadScheme, got {other:?}"),
        }
    }
}
