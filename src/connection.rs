//! Per-peer connection state machine.
//!
//! The torrent driver owns one [`Connection`] per peer and runs its read
//! and write loops. This module holds the protocol state: handshake
//! progress, choke/interest flags, the peer's piece claims, both request
//! queues, the prioritized write queue, and transfer counters. Message
//! validation happens here; the driver decides what to do with the
//! resulting [`ReadAction`].

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use bitvec::prelude::*;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::chunks::ChunkSpec;
use crate::error::{Error, ProtocolKind, Result};
use crate::pex::{ExtensionHandshake, PexPeerFlags};
use crate::wire::{ExtensionBits, Message};

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Dialing,
    Handshaking,
    ExtHandshake,
    Active,
    Closing,
}

/// Per-connection transfer counters, aggregated up to torrent and client.
#[derive(Debug, Default)]
pub struct ConnStats {
    pub chunks_read_useful: AtomicU64,
    pub chunks_read_unwanted: AtomicU64,
    pub chunks_written: AtomicU64,
    pub bytes_down: AtomicU64,
    pub bytes_up: AtomicU64,
}

/// Point-in-time copy of [`ConnStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub chunks_read_useful: u64,
    pub chunks_read_unwanted: u64,
    pub chunks_written: u64,
    pub bytes_down: u64,
    pub bytes_up: u64,
}

impl ConnStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            chunks_read_useful: self.chunks_read_useful.load(Ordering::Relaxed),
            chunks_read_unwanted: self.chunks_read_unwanted.load(Ordering::Relaxed),
            chunks_written: self.chunks_written.load(Ordering::Relaxed),
            bytes_down: self.bytes_down.load(Ordering::Relaxed),
            bytes_up: self.bytes_up.load(Ordering::Relaxed),
        }
    }
}

/// One entry drained from the write queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outgoing {
    /// Fully-formed message: cancels, state changes, bitfield, HAVEs,
    /// extended payloads.
    Control(Message),
    /// An outbound chunk request.
    Request(ChunkSpec),
    /// Serve this chunk from storage as a `Piece` message.
    Serve(ChunkSpec),
}

/// Prioritized write queue. Drain order: pending cancels, state-change
/// messages, delta HAVEs, one request slot, one piece response.
#[derive(Debug, Default)]
pub struct Outbox {
    cancels: VecDeque<ChunkSpec>,
    control: VecDeque<Message>,
    haves: VecDeque<u32>,
    requests: VecDeque<ChunkSpec>,
    serves: VecDeque<ChunkSpec>,
    /// Completed-set snapshot taken when the bitfield was queued.
    bitfield_snapshot: Option<BitVec<u8, Msb0>>,
    sent_any: bool,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the bitfield as the first application message, snapshotting
    /// the completed set. A completion landing after this snapshot must
    /// be announced with [`Outbox::have`].
    ///
    /// Legal only before any other message has been queued or sent.
    pub fn post_bitfield(&mut self, completed: BitVec<u8, Msb0>) {
        debug_assert!(!self.sent_any && self.control.is_empty());
        self.control
            .push_back(Message::Bitfield(Bytes::from(completed.clone().into_vec())));
        self.bitfield_snapshot = Some(completed);
    }

    /// Fast-extension variant of the first message.
    pub fn post_have_all(&mut self) {
        debug_assert!(!self.sent_any && self.control.is_empty());
        self.control.push_back(Message::HaveAll);
    }

    pub fn post_have_none(&mut self) {
        debug_assert!(!self.sent_any && self.control.is_empty());
        self.control.push_back(Message::HaveNone);
    }

    /// Announce a newly completed piece. Skipped when the queued
    /// bitfield snapshot already covers it.
    pub fn have(&mut self, piece: u32) {
        if let Some(snapshot) = &self.bitfield_snapshot {
            if snapshot.get(piece as usize).map(|b| *b).unwrap_or(false) {
                return;
            }
        }
        if !self.haves.contains(&piece) {
            self.haves.push_back(piece);
        }
    }

    pub fn cancel(&mut self, spec: ChunkSpec) {
        // A not-yet-sent request is simply withdrawn.
        if let Some(pos) = self.requests.iter().position(|&s| s == spec) {
            self.requests.remove(pos);
            return;
        }
        self.cancels.push_back(spec);
    }

    pub fn control(&mut self, msg: Message) {
        self.control.push_back(msg);
    }

    pub fn request(&mut self, spec: ChunkSpec) {
        self.requests.push_back(spec);
    }

    pub fn serve(&mut self, spec: ChunkSpec) {
        self.serves.push_back(spec);
    }

    /// Withdraw a queued piece response (peer sent Cancel).
    pub fn unserve(&mut self, spec: ChunkSpec) {
        self.serves.retain(|&s| s != spec);
    }

    /// Next item in priority order.
    pub fn pop(&mut self) -> Option<Outgoing> {
        let item = if let Some(spec) = self.cancels.pop_front() {
            Outgoing::Control(Message::Cancel(spec))
        } else if let Some(msg) = self.control.pop_front() {
            Outgoing::Control(msg)
        } else if let Some(piece) = self.haves.pop_front() {
            Outgoing::Control(Message::Have(piece))
        } else if let Some(spec) = self.requests.pop_front() {
            Outgoing::Request(spec)
        } else if let Some(spec) = self.serves.pop_front() {
            Outgoing::Serve(spec)
        } else {
            return None;
        };
        self.sent_any = true;
        Some(item)
    }

    pub fn is_empty(&self) -> bool {
        self.cancels.is_empty()
            && self.control.is_empty()
            && self.haves.is_empty()
            && self.requests.is_empty()
            && self.serves.is_empty()
    }
}

/// What the read loop should do with a validated message.
#[derive(Debug)]
pub enum ReadAction {
    /// Nothing beyond the state update already applied.
    None,
    /// Peer choked us; these outstanding requests will not be answered
    /// and must be reissued via the ledger. Empty when the peer speaks
    /// the fast extension (individual RejectRequests follow instead).
    PeerChoked { reissue: Vec<ChunkSpec> },
    /// Peer unchoked us; the request pipeline may fill.
    PeerUnchoked,
    /// Peer claims: apply to the availability ledger.
    PeerHas(u32),
    PeerBitfield(BitVec<u8, Msb0>),
    PeerHasAll,
    PeerHasNone,
    /// A solicited chunk arrived.
    Chunk { spec: ChunkSpec, data: Bytes },
    /// Peer asked us to serve a chunk (already queued in the outbox).
    Queued(ChunkSpec),
    /// Peer rejected our request (fast extension); reissue via ledger.
    Rejected(ChunkSpec),
    /// Peer granted us an allowed-fast piece.
    AllowedFast(u32),
    /// Extended protocol payload for the driver to interpret.
    Extended { id: u8, payload: Bytes },
    /// Peer advertised its DHT port.
    DhtPort(u16),
}

struct State {
    state: ConnectionState,
    am_choking: bool,
    am_interested: bool,
    peer_choking: bool,
    peer_interested: bool,

    /// Pieces the peer claims. Sized lazily: bitfields and HAVEs may
    /// arrive before metadata fixes the true piece count.
    peer_pieces: BitVec<u8, Msb0>,
    /// HaveAll seen before the piece count was known.
    claims_all: bool,
    num_pieces: Option<usize>,

    /// Our in-flight requests, in send order.
    outbound: BTreeMap<ChunkSpec, Instant>,
    /// Chunks the peer asked us to serve (mirror of outbox serves).
    inbound: usize,

    /// Pieces we granted the peer while choking it.
    allowed_fast_out: HashSet<u32>,
    /// Pieces the peer granted us.
    allowed_fast_in: HashSet<u32>,

    /// First application message seen (gates Bitfield legality).
    saw_first_message: bool,

    peer_bits: ExtensionBits,
    peer_id: Option<[u8; 20]>,
    peer_prefers_encryption: bool,

    last_received: Instant,
    last_sent: Instant,
}

/// Live state for one peer interaction.
pub struct Connection {
    pub addr: SocketAddr,
    /// We dialed (true) or accepted (false).
    pub outgoing: bool,
    request_window: usize,
    inbound_cap: usize,

    state: Mutex<State>,
    /// The peer's BEP 10 handshake, once received.
    peer_extensions: Mutex<Option<ExtensionHandshake>>,
    pub outbox: Mutex<Outbox>,
    /// Wakes the write loop when the outbox gains work.
    pub write_wake: Notify,
    pub stats: ConnStats,
}

impl Connection {
    pub fn new(addr: SocketAddr, outgoing: bool, request_window: usize, inbound_cap: usize) -> Self {
        let now = Instant::now();
        Self {
            addr,
            outgoing,
            request_window,
            inbound_cap,
            state: Mutex::new(State {
                state: if outgoing {
                    ConnectionState::Dialing
                } else {
                    ConnectionState::Handshaking
                },
                am_choking: true,
                am_interested: false,
                peer_choking: true,
                peer_interested: false,
                peer_pieces: BitVec::new(),
                claims_all: false,
                num_pieces: None,
                outbound: BTreeMap::new(),
                inbound: 0,
                allowed_fast_out: HashSet::new(),
                allowed_fast_in: HashSet::new(),
                saw_first_message: false,
                peer_bits: ExtensionBits::default(),
                peer_id: None,
                peer_prefers_encryption: false,
                last_received: now,
                last_sent: now,
            }),
            peer_extensions: Mutex::new(None),
            outbox: Mutex::new(Outbox::new()),
            write_wake: Notify::new(),
            stats: ConnStats::default(),
        }
    }

    /// Record the peer's BEP 10 extension handshake.
    pub fn set_peer_extensions(&self, handshake: ExtensionHandshake) {
        *self.peer_extensions.lock() = Some(handshake);
    }

    pub fn peer_extensions(&self) -> Option<ExtensionHandshake> {
        self.peer_extensions.lock().clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.state.lock().state
    }

    pub fn set_state(&self, state: ConnectionState) {
        self.state.lock().state = state;
    }

    /// Record the peer side of the base handshake.
    pub fn handshook(&self, peer_id: [u8; 20], bits: ExtensionBits) {
        let mut state = self.state.lock();
        state.peer_id = Some(peer_id);
        state.peer_bits = bits;
        state.state = if bits.supports_extended() {
            ConnectionState::ExtHandshake
        } else {
            ConnectionState::Active
        };
    }

    pub fn peer_id(&self) -> Option<[u8; 20]> {
        self.state.lock().peer_id
    }

    pub fn peer_bits(&self) -> ExtensionBits {
        self.state.lock().peer_bits
    }

    pub fn set_num_pieces(&self, n: usize) {
        let mut state = self.state.lock();
        state.num_pieces = Some(n);
        grow_claims(&mut state.peer_pieces, n);
        if state.claims_all {
            state.peer_pieces.fill(true);
        }
    }

    pub fn set_peer_prefers_encryption(&self, prefers: bool) {
        self.state.lock().peer_prefers_encryption = prefers;
    }

    pub fn am_choking(&self) -> bool {
        self.state.lock().am_choking
    }

    pub fn am_interested(&self) -> bool {
        self.state.lock().am_interested
    }

    pub fn peer_choking(&self) -> bool {
        self.state.lock().peer_choking
    }

    pub fn peer_interested(&self) -> bool {
        self.state.lock().peer_interested
    }

    pub fn peer_pieces(&self) -> BitVec<u8, Msb0> {
        self.state.lock().peer_pieces.clone()
    }

    pub fn peer_has_piece(&self, piece: u32) -> bool {
        self.state
            .lock()
            .peer_pieces
            .get(piece as usize)
            .map(|b| *b)
            .unwrap_or(false)
    }

    /// Whether the peer claims every piece (seeder).
    pub fn peer_is_seeder(&self) -> bool {
        let state = self.state.lock();
        match state.num_pieces {
            Some(n) => n > 0 && state.peer_pieces.count_ones() == n,
            None => false,
        }
    }

    pub fn last_received(&self) -> Instant {
        self.state.lock().last_received
    }

    pub fn last_sent(&self) -> Instant {
        self.state.lock().last_sent
    }

    pub fn note_sent(&self) {
        self.state.lock().last_sent = Instant::now();
    }

    /// PEX flags describing this connection to third parties.
    pub fn pex_peer_flags(&self) -> PexPeerFlags {
        let state = self.state.lock();
        let mut flags = PexPeerFlags::default();
        if self.outgoing {
            flags = flags | PexPeerFlags::OUTGOING;
        }
        if state.peer_prefers_encryption {
            flags = flags | PexPeerFlags::PREFERS_ENCRYPTION;
        }
        flags
    }

    // Write-side intents.

    /// Change our choke state; queues the message and, when choking a
    /// non-fast peer, drops its pending serves.
    pub fn set_am_choking(&self, choke: bool) {
        let mut state = self.state.lock();
        if state.am_choking == choke {
            return;
        }
        state.am_choking = choke;
        drop(state);
        let mut outbox = self.outbox.lock();
        outbox.control(if choke {
            Message::Choke
        } else {
            Message::Unchoke
        });
        drop(outbox);
        self.write_wake.notify_one();
    }

    pub fn set_am_interested(&self, interested: bool) {
        let mut state = self.state.lock();
        if state.am_interested == interested {
            return;
        }
        state.am_interested = interested;
        drop(state);
        self.outbox.lock().control(if interested {
            Message::Interested
        } else {
            Message::NotInterested
        });
        self.write_wake.notify_one();
    }

    /// Free request slots: zero while the peer chokes us (allowed-fast
    /// pieces aside).
    pub fn request_slots(&self) -> usize {
        let state = self.state.lock();
        if state.peer_choking {
            return 0;
        }
        self.request_window.saturating_sub(state.outbound.len())
    }

    /// Track and queue an outbound request. Refused when the window is
    /// full or the spec is already in flight.
    pub fn enqueue_request(&self, spec: ChunkSpec) -> bool {
        let mut state = self.state.lock();
        if state.outbound.len() >= self.request_window || state.outbound.contains_key(&spec) {
            return false;
        }
        state.outbound.insert(spec, Instant::now());
        drop(state);
        self.outbox.lock().request(spec);
        self.write_wake.notify_one();
        true
    }

    /// Cancel an in-flight request (endgame loser or supersession).
    pub fn cancel_request(&self, spec: ChunkSpec) -> bool {
        let mut state = self.state.lock();
        if state.outbound.remove(&spec).is_none() {
            return false;
        }
        drop(state);
        self.outbox.lock().cancel(spec);
        self.write_wake.notify_one();
        true
    }

    /// Outstanding requests, oldest first.
    pub fn outstanding_requests(&self) -> Vec<ChunkSpec> {
        self.state.lock().outbound.keys().copied().collect()
    }

    /// Announce a completed piece, subject to the bitfield-snapshot rule.
    pub fn have(&self, piece: u32) {
        self.outbox.lock().have(piece);
        self.write_wake.notify_one();
    }

    /// A serve was written; drop it from the inbound count.
    pub fn served_one(&self) {
        let mut state = self.state.lock();
        state.inbound = state.inbound.saturating_sub(1);
    }

    /// Validate one received message against the current state and apply
    /// its connection-local effects. Timestamp bookkeeping included.
    pub fn on_message(&self, msg: Message) -> Result<ReadAction> {
        let mut state = self.state.lock();
        state.last_received = Instant::now();

        let first = !state.saw_first_message;
        if !matches!(msg, Message::KeepAlive) {
            state.saw_first_message = true;
        }

        match msg {
            Message::KeepAlive => Ok(ReadAction::None),

            Message::Choke => {
                state.peer_choking = true;
                let reissue = if state.peer_bits.supports_fast() {
                    // Fast peers reject retained requests individually.
                    Vec::new()
                } else {
                    let dropped: Vec<ChunkSpec> = state.outbound.keys().copied().collect();
                    state.outbound.clear();
                    dropped
                };
                Ok(ReadAction::PeerChoked { reissue })
            }

            Message::Unchoke => {
                state.peer_choking = false;
                Ok(ReadAction::PeerUnchoked)
            }

            Message::Interested => {
                state.peer_interested = true;
                Ok(ReadAction::None)
            }

            Message::NotInterested => {
                state.peer_interested = false;
                Ok(ReadAction::None)
            }

            Message::Have(piece) => {
                if let Some(n) = state.num_pieces {
                    if piece as usize >= n {
                        return Err(Error::protocol(
                            ProtocolKind::InvalidArgument,
                            format!("have {piece} out of range ({n} pieces)"),
                        ));
                    }
                }
                grow_claims(&mut state.peer_pieces, piece as usize + 1);
                let already = state.peer_pieces[piece as usize];
                state.peer_pieces.set(piece as usize, true);
                // Availability counts each claim once.
                if already {
                    Ok(ReadAction::None)
                } else {
                    Ok(ReadAction::PeerHas(piece))
                }
            }

            Message::Bitfield(raw) => {
                if !first {
                    return Err(Error::protocol(
                        ProtocolKind::UnexpectedMessage,
                        "bitfield after first message",
                    ));
                }
                let mut claims = BitVec::<u8, Msb0>::from_vec(raw.to_vec());
                if let Some(n) = state.num_pieces {
                    if claims.len() < n {
                        return Err(Error::protocol(
                            ProtocolKind::InvalidArgument,
                            "bitfield shorter than piece count",
                        ));
                    }
                    // Spare bits beyond the piece count must be zero.
                    if claims[n..].any() {
                        return Err(Error::protocol(
                            ProtocolKind::InvalidArgument,
                            "bitfield has spare bits set",
                        ));
                    }
                    claims.truncate(n);
                }
                state.peer_pieces = claims.clone();
                Ok(ReadAction::PeerBitfield(claims))
            }

            Message::HaveAll => {
                if !first {
                    return Err(Error::protocol(
                        ProtocolKind::UnexpectedMessage,
                        "have-all after first message",
                    ));
                }
                state.claims_all = true;
                if let Some(n) = state.num_pieces {
                    state.peer_pieces = bitvec![u8, Msb0; 1; n];
                }
                Ok(ReadAction::PeerHasAll)
            }

            Message::HaveNone => {
                if !first {
                    return Err(Error::protocol(
                        ProtocolKind::UnexpectedMessage,
                        "have-none after first message",
                    ));
                }
                if let Some(n) = state.num_pieces {
                    state.peer_pieces = bitvec![u8, Msb0; 0; n];
                }
                Ok(ReadAction::PeerHasNone)
            }

            Message::Piece { piece, begin, data } => {
                let spec = ChunkSpec {
                    piece,
                    begin,
                    length: data.len() as u32,
                };
                if state.outbound.remove(&spec).is_none() {
                    // Unsolicited or late (endgame loser): drop.
                    self.stats
                        .chunks_read_unwanted
                        .fetch_add(1, Ordering::Relaxed);
                    return Ok(ReadAction::None);
                }
                self.stats
                    .chunks_read_useful
                    .fetch_add(1, Ordering::Relaxed);
                self.stats
                    .bytes_down
                    .fetch_add(data.len() as u64, Ordering::Relaxed);
                Ok(ReadAction::Chunk { spec, data })
            }

            Message::Request(spec) => {
                if state.am_choking && !state.allowed_fast_out.contains(&spec.piece) {
                    // Choked requests are dropped silently.
                    return Ok(ReadAction::None);
                }
                if state.inbound >= self.inbound_cap {
                    // Queue overflow drops the request.
                    return Ok(ReadAction::None);
                }
                state.inbound += 1;
                drop(state);
                self.outbox.lock().serve(spec);
                self.write_wake.notify_one();
                Ok(ReadAction::Queued(spec))
            }

            Message::Cancel(spec) => {
                state.inbound = state.inbound.saturating_sub(1);
                drop(state);
                self.outbox.lock().unserve(spec);
                Ok(ReadAction::None)
            }

            Message::RejectRequest(spec) => {
                if state.outbound.remove(&spec).is_none() {
                    return Err(Error::protocol(
                        ProtocolKind::UnexpectedMessage,
                        "reject for a request we never made",
                    ));
                }
                Ok(ReadAction::Rejected(spec))
            }

            Message::AllowedFast(piece) => {
                state.allowed_fast_in.insert(piece);
                Ok(ReadAction::AllowedFast(piece))
            }

            Message::SuggestPiece(_) => Ok(ReadAction::None),

            Message::Port(port) => Ok(ReadAction::DhtPort(port)),

            Message::Extended { id, payload } => Ok(ReadAction::Extended { id, payload }),
        }
    }

    /// Grant the peer an allowed-fast piece.
    pub fn grant_allowed_fast(&self, piece: u32) {
        let mut state = self.state.lock();
        if state.allowed_fast_out.insert(piece) {
            drop(state);
            self.outbox.lock().control(Message::AllowedFast(piece));
            self.write_wake.notify_one();
        }
    }

    /// Whether the peer granted us `piece` as allowed-fast.
    pub fn allowed_fast(&self, piece: u32) -> bool {
        self.state.lock().allowed_fast_in.contains(&piece)
    }
}

fn grow_claims(claims: &mut BitVec<u8, Msb0>, len: usize) {
    if claims.len() < len {
        claims.resize(len, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conn() -> Connection {
        let c = Connection::new("127.0.0.1:6881".parse().unwrap(), true, 250, 250);
        c.set_num_pieces(3);
        c
    }

    fn spec(piece: u32, begin: u32) -> ChunkSpec {
        ChunkSpec {
            piece,
            begin,
            length: 16384,
        }
    }

    /// Drain the outbox into wire bytes (control messages only).
    fn drain_bytes(outbox: &mut Outbox) -> Vec<u8> {
        let mut out = Vec::new();
        while let Some(item) = outbox.pop() {
            match item {
                Outgoing::Control(msg) => out.extend_from_slice(&msg.encode()),
                Outgoing::Request(spec) => {
                    out.extend_from_slice(&Message::Request(spec).encode())
                }
                Outgoing::Serve(_) => {}
            }
        }
        out
    }

    #[test]
    fn bitfield_then_delta_have_bytes() {
        // Three pieces with piece 1 complete at snapshot time; piece 2
        // completes after. The wire shows the snapshot bitfield followed
        // by Have(2).
        let mut completed = bitvec![u8, Msb0; 0; 3];
        completed.set(1, true);

        let mut outbox = Outbox::new();
        outbox.post_bitfield(completed);
        outbox.have(2);

        let bytes = drain_bytes(&mut outbox);
        assert_eq!(
            bytes,
            b"\x00\x00\x00\x02\x05\x40\x00\x00\x00\x05\x04\x00\x00\x00\x02"
        );
        assert_eq!(bytes.len(), 15);
    }

    #[test]
    fn have_covered_by_snapshot_is_skipped() {
        let mut completed = bitvec![u8, Msb0; 0; 3];
        completed.set(1, true);

        let mut outbox = Outbox::new();
        outbox.post_bitfield(completed);
        outbox.have(1);
        outbox.pop(); // bitfield
        assert!(outbox.pop().is_none());
    }

    #[test]
    fn outbox_priority_order() {
        let mut outbox = Outbox::new();
        outbox.serve(spec(0, 0));
        outbox.request(spec(1, 0));
        outbox.have(2);
        outbox.control(Message::Unchoke);
        outbox.cancel(spec(2, 0));

        assert_eq!(
            outbox.pop(),
            Some(Outgoing::Control(Message::Cancel(spec(2, 0))))
        );
        assert_eq!(outbox.pop(), Some(Outgoing::Control(Message::Unchoke)));
        assert_eq!(outbox.pop(), Some(Outgoing::Control(Message::Have(2))));
        assert_eq!(outbox.pop(), Some(Outgoing::Request(spec(1, 0))));
        assert_eq!(outbox.pop(), Some(Outgoing::Serve(spec(0, 0))));
        assert_eq!(outbox.pop(), None);
    }

    #[test]
    fn cancel_withdraws_unsent_request() {
        let mut outbox = Outbox::new();
        outbox.request(spec(1, 0));
        outbox.cancel(spec(1, 0));
        // Neither the request nor a Cancel goes out.
        assert!(outbox.pop().is_none());
    }

    #[test]
    fn bitfield_only_legal_first() {
        let c = conn();
        c.on_message(Message::Unchoke).unwrap();
        let err = c
            .on_message(Message::Bitfield(Bytes::from_static(&[0x00])))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol {
                kind: ProtocolKind::UnexpectedMessage,
                ..
            }
        ));
    }

    #[test]
    fn keepalive_does_not_consume_first_slot() {
        let c = conn();
        c.on_message(Message::KeepAlive).unwrap();
        assert!(c
            .on_message(Message::Bitfield(Bytes::from_static(&[0x40])))
            .is_ok());
        assert!(c.peer_has_piece(1));
    }

    #[test]
    fn bitfield_spare_bits_must_be_zero() {
        let c = conn();
        // 3 pieces: bits 3..8 are spare; 0x10 sets bit 3.
        assert!(c
            .on_message(Message::Bitfield(Bytes::from_static(&[0xF0])))
            .is_err());
    }

    #[test]
    fn have_out_of_range_is_protocol_error() {
        let c = conn();
        assert!(c.on_message(Message::Have(2)).is_ok());
        assert!(c.on_message(Message::Have(3)).is_err());
    }

    #[test]
    fn have_all_sets_every_claim() {
        let c = conn();
        c.on_message(Message::HaveAll).unwrap();
        assert!(c.peer_is_seeder());
        assert!(c.peer_has_piece(0) && c.peer_has_piece(2));
    }

    #[test]
    fn unsolicited_piece_counts_unwanted() {
        let c = conn();
        let action = c
            .on_message(Message::Piece {
                piece: 0,
                begin: 0,
                data: Bytes::from(vec![0u8; 16384]),
            })
            .unwrap();
        assert!(matches!(action, ReadAction::None));
        assert_eq!(c.stats.snapshot().chunks_read_unwanted, 1);
        assert_eq!(c.stats.snapshot().chunks_read_useful, 0);
    }

    #[test]
    fn solicited_piece_counts_useful() {
        let c = conn();
        // Pretend the peer unchoked us and we requested.
        c.on_message(Message::Unchoke).unwrap();
        assert!(c.enqueue_request(spec(0, 0)));
        let action = c
            .on_message(Message::Piece {
                piece: 0,
                begin: 0,
                data: Bytes::from(vec![0u8; 16384]),
            })
            .unwrap();
        assert!(matches!(action, ReadAction::Chunk { .. }));
        let stats = c.stats.snapshot();
        assert_eq!(stats.chunks_read_useful, 1);
        assert_eq!(stats.bytes_down, 16384);
        assert!(c.outstanding_requests().is_empty());
    }

    #[test]
    fn request_window_enforced() {
        let c = Connection::new("127.0.0.1:1".parse().unwrap(), true, 2, 250);
        c.set_num_pieces(64);
        c.on_message(Message::Unchoke).unwrap();
        assert!(c.enqueue_request(spec(0, 0)));
        assert!(c.enqueue_request(spec(0, 16384)));
        assert!(!c.enqueue_request(spec(1, 0)));
        // Duplicates refused too.
        assert!(!c.enqueue_request(spec(0, 0)));
    }

    #[test]
    fn choke_without_fast_drops_outstanding() {
        let c = conn();
        c.on_message(Message::Unchoke).unwrap();
        c.enqueue_request(spec(0, 0));
        c.enqueue_request(spec(0, 16384));

        match c.on_message(Message::Choke).unwrap() {
            ReadAction::PeerChoked { reissue } => {
                assert_eq!(reissue.len(), 2);
            }
            other => panic!("unexpected action {other:?}"),
        }
        assert_eq!(c.request_slots(), 0);
        assert!(c.outstanding_requests().is_empty());
    }

    #[test]
    fn choke_with_fast_retains_outstanding() {
        let c = conn();
        let mut bits = ExtensionBits::default();
        bits.set(crate::wire::EXTENSION_BIT_FAST);
        c.handshook([1; 20], bits);

        c.on_message(Message::Unchoke).unwrap();
        c.enqueue_request(spec(0, 0));
        match c.on_message(Message::Choke).unwrap() {
            ReadAction::PeerChoked { reissue } => assert!(reissue.is_empty()),
            other => panic!("unexpected action {other:?}"),
        }
        assert_eq!(c.outstanding_requests(), vec![spec(0, 0)]);

        // The retained request is individually rejected.
        match c.on_message(Message::RejectRequest(spec(0, 0))).unwrap() {
            ReadAction::Rejected(s) => assert_eq!(s, spec(0, 0)),
            other => panic!("unexpected action {other:?}"),
        }
        assert!(c.outstanding_requests().is_empty());
    }

    #[test]
    fn reject_for_unknown_request_is_error() {
        let c = conn();
        assert!(c.on_message(Message::RejectRequest(spec(0, 0))).is_err());
    }

    #[test]
    fn choked_request_dropped_unless_allowed_fast() {
        let c = conn();
        // am_choking defaults true.
        let action = c.on_message(Message::Request(spec(0, 0))).unwrap();
        assert!(matches!(action, ReadAction::None));
        assert!(c.outbox.lock().is_empty());

        c.grant_allowed_fast(0);
        let action = c.on_message(Message::Request(spec(0, 0))).unwrap();
        assert!(matches!(action, ReadAction::Queued(_)));
    }

    #[test]
    fn inbound_cap_drops_overflow() {
        let c = Connection::new("127.0.0.1:1".parse().unwrap(), false, 250, 1);
        c.set_num_pieces(64);
        c.set_am_choking(false);
        assert!(matches!(
            c.on_message(Message::Request(spec(0, 0))).unwrap(),
            ReadAction::Queued(_)
        ));
        assert!(matches!(
            c.on_message(Message::Request(spec(0, 16384))).unwrap(),
            ReadAction::None
        ));
    }

    #[test]
    fn peer_cancel_withdraws_serve() {
        let c = conn();
        c.set_am_choking(false);
        c.on_message(Message::Request(spec(1, 0))).unwrap();
        c.on_message(Message::Cancel(spec(1, 0))).unwrap();

        let mut outbox = c.outbox.lock();
        // Drain: the unchoke control message remains, but no serve.
        while let Some(item) = outbox.pop() {
            assert!(!matches!(item, Outgoing::Serve(_)));
        }
    }

    #[test]
    fn pex_flags_from_connection() {
        let cases = [
            (false, false, PexPeerFlags::default()),
            (false, true, PexPeerFlags::PREFERS_ENCRYPTION),
            (true, false, PexPeerFlags::OUTGOING),
            (
                true,
                true,
                PexPeerFlags::OUTGOING | PexPeerFlags::PREFERS_ENCRYPTION,
            ),
        ];
        for (outgoing, prefers, want) in cases {
            let c = Connection::new("127.0.0.1:1".parse().unwrap(), outgoing, 250, 250);
            c.set_peer_prefers_encryption(prefers);
            assert_eq!(c.pex_peer_flags(), want, "outgoing={outgoing} enc={prefers}");
        }
    }

    #[test]
    fn choke_state_transitions_queue_messages() {
        let c = conn();
        c.set_am_choking(false);
        c.set_am_choking(false); // idempotent: one message only
        c.set_am_interested(true);

        let mut outbox = c.outbox.lock();
        assert_eq!(outbox.pop(), Some(Outgoing::Control(Message::Unchoke)));
        assert_eq!(outbox.pop(), Some(Outgoing::Control(Message::Interested)));
        assert_eq!(outbox.pop(), None);
    }
}
