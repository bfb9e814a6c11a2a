//! Choke scheduling.
//!
//! Every 10 seconds interested peers are ranked by download rate from
//! them while leeching, or upload rate to them while seeding; the top K
//! are unchoked. Every 30 seconds the optimistic slot rotates: the
//! outgoing pick is graded first, and one that kept pace with the
//! regular set takes over the least-useful regular slot, evicting its
//! holder; then a fresh choked peer gets the slot.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Scheduler knobs.
#[derive(Debug, Clone)]
pub struct ChokeConfig {
    pub unchoke_slots: usize,
    pub interval: Duration,
    pub optimistic_interval: Duration,
}

impl Default for ChokeConfig {
    fn default() -> Self {
        Self {
            unchoke_slots: 4,
            interval: Duration::from_secs(10),
            optimistic_interval: Duration::from_secs(30),
        }
    }
}

/// Rate sample for one connected peer.
#[derive(Debug, Clone, Copy)]
pub struct PeerRates {
    pub download_rate: u64,
    pub upload_rate: u64,
    pub peer_interested: bool,
    pub unchoked: bool,
}

/// A choke or unchoke to apply to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChokeDecision {
    Unchoke(SocketAddr),
    Choke(SocketAddr),
}

/// Per-torrent choke state.
pub struct Choker {
    config: ChokeConfig,
    last_rotation: Option<Instant>,
    optimistic: Option<SocketAddr>,
    /// Counter-based pseudo-random rotation over the choked set.
    rotation_counter: u64,
}

impl Choker {
    pub fn new(config: ChokeConfig) -> Self {
        Self {
            config,
            last_rotation: None,
            optimistic: None,
            rotation_counter: 0,
        }
    }

    /// Current optimistic unchoke, if any.
    pub fn optimistic(&self) -> Option<SocketAddr> {
        self.optimistic
    }

    /// Drop a disconnected peer from the optimistic slot so the next
    /// tick re-selects immediately.
    pub fn peer_disconnected(&mut self, addr: SocketAddr) {
        if self.optimistic == Some(addr) {
            self.optimistic = None;
            self.last_rotation = None;
        }
    }

    /// Rank peers and emit the decisions needed to reach the target
    /// unchoke set.
    pub fn rerank(
        &mut self,
        peers: &HashMap<SocketAddr, PeerRates>,
        seeding: bool,
    ) -> Vec<ChokeDecision> {
        let metric = |rates: &PeerRates| {
            if seeding {
                rates.upload_rate
            } else {
                rates.download_rate
            }
        };

        let mut interested: Vec<(&SocketAddr, &PeerRates)> = peers
            .iter()
            .filter(|(_, rates)| rates.peer_interested)
            .collect();
        interested.sort_by(|a, b| metric(b.1).cmp(&metric(a.1)).then_with(|| a.0.cmp(b.0)));

        // Regular slots exclude the optimistic peer; it holds its own
        // slot until graded at rotation time.
        let mut target: Vec<SocketAddr> = interested
            .iter()
            .filter(|(addr, _)| Some(**addr) != self.optimistic)
            .take(self.config.unchoke_slots)
            .map(|(addr, _)| **addr)
            .collect();

        let rotate_due = self
            .last_rotation
            .map(|t| t.elapsed() >= self.config.optimistic_interval)
            .unwrap_or(true);
        if rotate_due {
            self.last_rotation = Some(Instant::now());

            // Grade the outgoing pick: an optimistic peer that
            // performed at least as well as the worst regular slot is
            // promoted into it, evicting the holder.
            if let Some(previous) = self.optimistic.take() {
                if let Some(rates) = peers.get(&previous) {
                    let perf = metric(rates);
                    if perf > 0 {
                        if target.len() < self.config.unchoke_slots {
                            target.push(previous);
                        } else if let Some(&least_useful) = target.last() {
                            let worst = peers.get(&least_useful).map(metric).unwrap_or(0);
                            if perf >= worst {
                                if let Some(slot) = target.last_mut() {
                                    *slot = previous;
                                }
                            }
                        }
                    }
                }
            }

            let candidates: Vec<SocketAddr> = interested
                .iter()
                .map(|(addr, _)| **addr)
                .filter(|addr| !target.contains(addr))
                .collect();
            self.rotation_counter = self.rotation_counter.wrapping_add(1);
            self.optimistic = if candidates.is_empty() {
                None
            } else {
                Some(candidates[self.rotation_counter as usize % candidates.len()])
            };
        }
        if let Some(optimistic) = self.optimistic {
            if peers.contains_key(&optimistic) && !target.contains(&optimistic) {
                target.push(optimistic);
            }
        }

        let mut decisions = Vec::new();
        for addr in &target {
            if let Some(rates) = peers.get(addr) {
                if !rates.unchoked {
                    decisions.push(ChokeDecision::Unchoke(*addr));
                }
            }
        }
        for (addr, rates) in peers {
            if rates.unchoked && !target.contains(addr) {
                decisions.push(ChokeDecision::Choke(*addr));
            }
        }
        decisions
    }
}
