//! HTTP(S) tracker announces: query-string request, bencoded response,
//! compact peer lists (BEP 23 IPv4, BEP 7 IPv6).

use std::fmt::Write as _;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use url::Url;

use super::{AnnounceRequest, AnnounceResponse};
use crate::bencode::Value;
use crate::error::{Error, Result, TrackerKind};
use crate::peers::{Peer, PeerSource};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

pub(super) async fn announce(
    url: &Url,
    req: &AnnounceRequest,
    user_agent: Option<&str>,
) -> Result<AnnounceResponse> {
    let mut target = url.to_string();
    target.push(if url.query().is_some() { '&' } else { '?' });

    push_escaped(&mut target, "info_hash", req.info_hash.as_bytes());
    target.push('&');
    push_escaped(&mut target, "peer_id", &req.peer_id);
    let _ = write!(
        target,
        "&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        req.port,
        req.uploaded.max(0),
        req.downloaded.max(0),
        req.left.max(0),
    );
    if req.num_want >= 0 {
        let _ = write!(target, "&numwant={}", req.num_want);
    }
    if req.key != 0 {
        let _ = write!(target, "&key={}", req.key as u32);
    }
    let event = req.event.http_str();
    if !event.is_empty() {
        let _ = write!(target, "&event={event}");
    }

    let mut builder = reqwest::Client::builder().timeout(REQUEST_TIMEOUT);
    if let Some(agent) = user_agent {
        builder = builder.user_agent(agent.to_owned());
    }
    let client = builder.build()?;

    let response = client.get(&target).send().await?;
    if !response.status().is_success() {
        return Err(Error::tracker(
            TrackerKind::HttpStatus,
            format!("tracker returned {}", response.status()),
        ));
    }
    let body = response.bytes().await?;
    parse_response(&body)
}

fn push_escaped(out: &mut String, key: &str, bytes: &[u8]) {
    out.push_str(key);
    out.push('=');
    for &b in bytes {
        let _ = write!(out, "%{b:02X}");
    }
}

fn parse_response(body: &[u8]) -> Result<AnnounceResponse> {
    let value = Value::decode(body)
        .map_err(|_| Error::tracker(TrackerKind::Parse, "response is not bencode"))?;
    if value.as_dict().is_none() {
        return Err(Error::tracker(TrackerKind::Parse, "response is not a dict"));
    }

    if let Some(reason) = value.get("failure reason").and_then(Value::as_str) {
        return Err(Error::tracker(
            TrackerKind::Failure,
            format!("tracker failure: {reason}"),
        ));
    }

    let interval = value
        .get("interval")
        .and_then(Value::as_int)
        .ok_or_else(|| Error::tracker(TrackerKind::Parse, "missing interval"))?
        as i32;
    let seeders = value.get("complete").and_then(Value::as_int).unwrap_or(0) as i32;
    let leechers = value.get("incomplete").and_then(Value::as_int).unwrap_or(0) as i32;

    let mut peers = Vec::new();
    match value.get("peers") {
        Some(Value::Bytes(compact)) => {
            if compact.len() % 6 != 0 {
                return Err(Error::tracker(
                    TrackerKind::Parse,
                    "compact peers not a multiple of 6 bytes",
                ));
            }
            for chunk in compact.chunks_exact(6) {
                peers.push(peer_from_parts(
                    IpAddr::V4(Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3])),
                    u16::from_be_bytes([chunk[4], chunk[5]]),
                    None,
                ));
            }
        }
        Some(Value::List(entries)) => {
            for entry in entries {
                let ip: IpAddr = entry
                    .get("ip")
                    .and_then(Value::as_str)
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| Error::tracker(TrackerKind::Parse, "peer missing ip"))?;
                let port = entry
                    .get("port")
                    .and_then(Value::as_uint)
                    .ok_or_else(|| Error::tracker(TrackerKind::Parse, "peer missing port"))?
                    as u16;
                let id = entry.get("peer id").and_then(Value::as_bytes).and_then(|b| {
                    <[u8; 20]>::try_from(b).ok()
                });
                peers.push(peer_from_parts(ip, port, id));
            }
        }
        _ => {}
    }

    if let Some(compact6) = value.get("peers6").and_then(Value::as_bytes) {
        if compact6.len() % 18 != 0 {
            return Err(Error::tracker(
                TrackerKind::Parse,
                "compact peers6 not a multiple of 18 bytes",
            ));
        }
        for chunk in compact6.chunks_exact(18) {
            let octets: [u8; 16] = chunk[..16].try_into().expect("chunk is 18 bytes");
            peers.push(peer_from_parts(
                IpAddr::V6(Ipv6Addr::from(octets)),
                u16::from_be_bytes([chunk[16], chunk[17]]),
                None,
            ));
        }
    }

    Ok(AnnounceResponse {
        interval,
        leechers,
        seeders,
        peers,
    })
}

fn peer_from_parts(ip: IpAddr, port: u16, id: Option<[u8; 20]>) -> Peer {
    let mut peer = Peer::new(std::net::SocketAddr::new(ip, port), PeerSource::Tracker);
    peer.id = id;
    peer
}
