//! Client configuration.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration snapshot shared by the client and every torrent driver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Address the TCP listener binds to.
    pub listen_addr: SocketAddr,

    /// Continue seeding after all pieces complete. When false, a torrent
    /// transitions to `Closed` on completion.
    pub seed: bool,

    /// Global download cap in bytes/sec. `None` = unlimited.
    pub download_rate_limit: Option<u64>,

    /// Global upload cap in bytes/sec. `None` = unlimited.
    pub upload_rate_limit: Option<u64>,

    /// Enable DHT-sourced peer discovery.
    pub enable_dht: bool,

    /// Enable ut_pex peer exchange.
    pub enable_pex: bool,

    /// Our publicly routable IP, used to derive deterministic peer
    /// priorities so that independent nodes prefer overlapping peers.
    pub public_ip: Option<IpAddr>,

    /// Maximum simultaneously connected peers per torrent.
    pub max_peers: usize,

    /// Candidate peer pool capacity per torrent. Overflow evicts the
    /// lowest-priority entry.
    pub peer_pool_capacity: usize,

    /// Maximum outstanding chunk requests per connection.
    pub request_window: usize,

    /// Maximum queued requests a peer may have against us.
    pub inbound_request_cap: usize,

    /// TCP dial timeout.
    #[serde(with = "duration_secs")]
    pub dial_timeout: Duration,

    /// End-to-end handshake timeout.
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,

    /// Send a keep-alive after this much write-side silence.
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,

    /// Disconnect after this much read-side silence.
    #[serde(with = "duration_secs")]
    pub idle_timeout: Duration,

    /// Choke re-ranking interval.
    #[serde(with = "duration_secs")]
    pub choke_interval: Duration,

    /// Optimistic unchoke rotation interval.
    #[serde(with = "duration_secs")]
    pub optimistic_interval: Duration,

    /// Regular unchoke slots per torrent.
    pub unchoke_slots: usize,

    /// Interval between PEX messages on a connection.
    #[serde(with = "duration_secs")]
    pub pex_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:0".parse().expect("static addr"),
            seed: false,
            download_rate_limit: None,
            upload_rate_limit: None,
            enable_dht: true,
            enable_pex: true,
            public_ip: None,
            max_peers: 55,
            peer_pool_capacity: 512,
            request_window: 250,
            inbound_request_cap: 250,
            dial_timeout: Duration::from_secs(15),
            handshake_timeout: Duration::from_secs(20),
            keepalive_interval: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(300),
            choke_interval: Duration::from_secs(10),
            optimistic_interval: Duration::from_secs(30),
            unchoke_slots: 4,
            pex_interval: Duration::from_secs(60),
        }
    }
}

impl ClientConfig {
    /// Create a config with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the listen address.
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = addr;
        self
    }

    /// Keep seeding after completion.
    pub fn seed(mut self, seed: bool) -> Self {
        self.seed = seed;
        self
    }

    /// Cap the global download rate.
    pub fn download_rate_limit(mut self, limit: Option<u64>) -> Self {
        self.download_rate_limit = limit;
        self
    }

    /// Cap the global upload rate.
    pub fn upload_rate_limit(mut self, limit: Option<u64>) -> Self {
        self.upload_rate_limit = limit;
        self
    }

    /// Set the publicly routable IP used for peer priorities.
    pub fn public_ip(mut self, ip: Option<IpAddr>) -> Self {
        self.public_ip = ip;
        self
    }

    /// Validate the configuration. Returns `Error::Config` on the first
    /// invalid field; the engine must not start on error.
    pub fn validate(&self) -> Result<()> {
        if self.max_peers == 0 {
            return Err(Error::config("max_peers", "must be at least 1"));
        }
        if self.peer_pool_capacity == 0 {
            return Err(Error::config("peer_pool_capacity", "must be at least 1"));
        }
        if self.request_window == 0 {
            return Err(Error::config("request_window", "must be at least 1"));
        }
        if self.unchoke_slots == 0 {
            return Err(Error::config("unchoke_slots", "must be at least 1"));
        }
        if self.idle_timeout <= self.keepalive_interval {
            return Err(Error::config(
                "idle_timeout",
                "must exceed keepalive_interval",
            ));
        }
        if matches!(self.download_rate_limit, Some(0)) {
            return Err(Error::config(
                "download_rate_limit",
                "zero disables all transfer; use None for unlimited",
            ));
        }
        if matches!(self.upload_rate_limit, Some(0)) {
            return Err(Error::config(
                "upload_rate_limit",
                "zero disables all transfer; use None for unlimited",
            ));
        }
        Ok(())
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
