//! Peer wire protocol codec (BEP 3, 6, 10).
//!
//! Frames are length-prefixed. [`FrameReader`] owns a pooled read buffer;
//! `Piece` payloads are zero-copy slices of it, valid until the buffer is
//! recycled by later reads.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::chunks::ChunkSpec;
use crate::error::{Error, ProtocolKind, Result};
use crate::metainfo::InfoHash;

/// Base protocol identifier in the handshake preamble.
pub const PROTOCOL_STRING: &[u8; 19] = b"BitTorrent protocol";

/// Total handshake frame length.
pub const HANDSHAKE_LEN: usize = 68;

/// Default frame cap: one chunk plus generous header margin. Oversized
/// frames are a protocol error, not an allocation.
pub const DEFAULT_MAX_FRAME_LEN: usize = (1 << 20) + 64 * 1024;

/// Reserved-bit numbers, counted from the right of the 8-byte field.
pub const EXTENSION_BIT_EXTENDED: u8 = 20;
pub const EXTENSION_BIT_FAST: u8 = 2;
pub const EXTENSION_BIT_DHT: u8 = 0;

/// The 8 reserved handshake bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtensionBits([u8; 8]);

impl ExtensionBits {
    /// Bits this engine advertises: extended messaging and fast extension.
    pub fn ours(dht: bool) -> Self {
        let mut bits = Self::default();
        bits.set(EXTENSION_BIT_EXTENDED);
        bits.set(EXTENSION_BIT_FAST);
        if dht {
            bits.set(EXTENSION_BIT_DHT);
        }
        bits
    }

    /// Set bit `n` counted from the right.
    pub fn set(&mut self, n: u8) {
        self.0[7 - (n / 8) as usize] |= 1 << (n % 8);
    }

    /// Test bit `n` counted from the right.
    pub fn get(&self, n: u8) -> bool {
        self.0[7 - (n / 8) as usize] & (1 << (n % 8)) != 0
    }

    pub fn supports_extended(&self) -> bool {
        self.get(EXTENSION_BIT_EXTENDED)
    }

    pub fn supports_fast(&self) -> bool {
        self.get(EXTENSION_BIT_FAST)
    }

    pub fn supports_dht(&self) -> bool {
        self.get(EXTENSION_BIT_DHT)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }
}

impl From<[u8; 8]> for ExtensionBits {
    fn from(raw: [u8; 8]) -> Self {
        Self(raw)
    }
}

/// The fixed-size handshake frame exchanged before any messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub bits: ExtensionBits,
    pub info_hash: InfoHash,
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut out = [0u8; HANDSHAKE_LEN];
        out[0] = PROTOCOL_STRING.len() as u8;
        out[1..20].copy_from_slice(PROTOCOL_STRING);
        out[20..28].copy_from_slice(self.bits.as_bytes());
        out[28..48].copy_from_slice(self.info_hash.as_bytes());
        out[48..68].copy_from_slice(&self.peer_id);
        out
    }

    pub fn decode(raw: &[u8; HANDSHAKE_LEN]) -> Result<Self> {
        if raw[0] as usize != PROTOCOL_STRING.len() || &raw[1..20] != PROTOCOL_STRING {
            return Err(Error::protocol(
                ProtocolKind::Handshake,
                "unrecognized protocol string",
            ));
        }
        let mut bits = [0u8; 8];
        bits.copy_from_slice(&raw[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&raw[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&raw[48..68]);
        Ok(Self {
            bits: bits.into(),
            info_hash: InfoHash(info_hash),
            peer_id,
        })
    }

    pub async fn write_to<W: AsyncWrite + Unpin>(&self, w: &mut W) -> Result<()> {
        w.write_all(&self.encode()).await?;
        w.flush().await?;
        Ok(())
    }

    pub async fn read_from<R: AsyncRead + Unpin>(r: &mut R) -> Result<Self> {
        let mut raw = [0u8; HANDSHAKE_LEN];
        r.read_exact(&mut raw).await?;
        Self::decode(&raw)
    }
}

/// One peer wire message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Zero-length frame; resets the peer's idle timer.
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    /// Raw bitfield bytes, most significant bit = piece 0.
    Bitfield(Bytes),
    Request(ChunkSpec),
    Piece {
        piece: u32,
        begin: u32,
        data: Bytes,
    },
    Cancel(ChunkSpec),
    /// DHT listen port (BEP 5).
    Port(u16),
    // Fast extension (BEP 6).
    SuggestPiece(u32),
    HaveAll,
    HaveNone,
    RejectRequest(ChunkSpec),
    AllowedFast(u32),
    /// Extended message (BEP 10): sub-id 0 is the extension handshake.
    Extended { id: u8, payload: Bytes },
}

mod id {
    pub const CHOKE: u8 = 0;
    pub const UNCHOKE: u8 = 1;
    pub const INTERESTED: u8 = 2;
    pub const NOT_INTERESTED: u8 = 3;
    pub const HAVE: u8 = 4;
    pub const BITFIELD: u8 = 5;
    pub const REQUEST: u8 = 6;
    pub const PIECE: u8 = 7;
    pub const CANCEL: u8 = 8;
    pub const PORT: u8 = 9;
    pub const SUGGEST: u8 = 0x0D;
    pub const HAVE_ALL: u8 = 0x0E;
    pub const HAVE_NONE: u8 = 0x0F;
    pub const REJECT: u8 = 0x10;
    pub const ALLOWED_FAST: u8 = 0x11;
    pub const EXTENDED: u8 = 20;
}

impl Message {
    /// Append the length-prefixed frame to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        match self {
            Self::KeepAlive => buf.put_u32(0),
            Self::Choke => put_header(buf, id::CHOKE, 0),
            Self::Unchoke => put_header(buf, id::UNCHOKE, 0),
            Self::Interested => put_header(buf, id::INTERESTED, 0),
            Self::NotInterested => put_header(buf, id::NOT_INTERESTED, 0),
            Self::Have(piece) => {
                put_header(buf, id::HAVE, 4);
                buf.put_u32(*piece);
            }
            Self::Bitfield(bytes) => {
                put_header(buf, id::BITFIELD, bytes.len());
                buf.put_slice(bytes);
            }
            Self::Request(spec) => {
                put_header(buf, id::REQUEST, 12);
                put_spec(buf, spec);
            }
            Self::Piece { piece, begin, data } => {
                put_header(buf, id::PIECE, 8 + data.len());
                buf.put_u32(*piece);
                buf.put_u32(*begin);
                buf.put_slice(data);
            }
            Self::Cancel(spec) => {
                put_header(buf, id::CANCEL, 12);
                put_spec(buf, spec);
            }
            Self::Port(port) => {
                put_header(buf, id::PORT, 2);
                buf.put_u16(*port);
            }
            Self::SuggestPiece(piece) => {
                put_header(buf, id::SUGGEST, 4);
                buf.put_u32(*piece);
            }
            Self::HaveAll => put_header(buf, id::HAVE_ALL, 0),
            Self::HaveNone => put_header(buf, id::HAVE_NONE, 0),
            Self::RejectRequest(spec) => {
                put_header(buf, id::REJECT, 12);
                put_spec(buf, spec);
            }
            Self::AllowedFast(piece) => {
                put_header(buf, id::ALLOWED_FAST, 4);
                buf.put_u32(*piece);
            }
            Self::Extended { id: sub, payload } => {
                put_header(buf, id::EXTENDED, 1 + payload.len());
                buf.put_u8(*sub);
                buf.put_slice(payload);
            }
        }
    }

    /// Encode as a standalone frame.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decode a frame body (the length prefix already stripped).
    pub fn decode(mut frame: Bytes) -> Result<Self> {
        if frame.is_empty() {
            return Ok(Self::KeepAlive);
        }
        let tag = frame.get_u8();
        let exact = |frame: &Bytes, n: usize| -> Result<()> {
            if frame.len() != n {
                return Err(Error::protocol(
                    ProtocolKind::Framing,
                    format!("message {tag} payload is {} bytes, want {n}", frame.len()),
                ));
            }
            Ok(())
        };

        match tag {
            id::CHOKE => {
                exact(&frame, 0)?;
                Ok(Self::Choke)
            }
            id::UNCHOKE => {
                exact(&frame, 0)?;
                Ok(Self::Unchoke)
            }
            id::INTERESTED => {
                exact(&frame, 0)?;
                Ok(Self::Interested)
            }
            id::NOT_INTERESTED => {
                exact(&frame, 0)?;
                Ok(Self::NotInterested)
            }
            id::HAVE => {
                exact(&frame, 4)?;
                Ok(Self::Have(frame.get_u32()))
            }
            id::BITFIELD => Ok(Self::Bitfield(frame)),
            id::REQUEST => {
                exact(&frame, 12)?;
                Ok(Self::Request(get_spec(&mut frame)))
            }
            id::PIECE => {
                if frame.len() < 8 {
                    return Err(Error::protocol(
                        ProtocolKind::Framing,
                        "piece message shorter than its header",
                    ));
                }
                let piece = frame.get_u32();
                let begin = frame.get_u32();
                Ok(Self::Piece {
                    piece,
                    begin,
                    data: frame,
                })
            }
            id::CANCEL => {
                exact(&frame, 12)?;
                Ok(Self::Cancel(get_spec(&mut frame)))
            }
            id::PORT => {
                exact(&frame, 2)?;
                Ok(Self::Port(frame.get_u16()))
            }
            id::SUGGEST => {
                exact(&frame, 4)?;
                Ok(Self::SuggestPiece(frame.get_u32()))
            }
            id::HAVE_ALL => {
                exact(&frame, 0)?;
                Ok(Self::HaveAll)
            }
            id::HAVE_NONE => {
                exact(&frame, 0)?;
                Ok(Self::HaveNone)
            }
            id::REJECT => {
                exact(&frame, 12)?;
                Ok(Self::RejectRequest(get_spec(&mut frame)))
            }
            id::ALLOWED_FAST => {
                exact(&frame, 4)?;
                Ok(Self::AllowedFast(frame.get_u32()))
            }
            id::EXTENDED => {
                if frame.is_empty() {
                    return Err(Error::protocol(
                        ProtocolKind::Framing,
                        "extended message missing sub-id",
                    ));
                }
                let sub = frame.get_u8();
                Ok(Self::Extended {
                    id: sub,
                    payload: frame,
                })
            }
            _ => Err(Error::protocol(
                ProtocolKind::Framing,
                format!("unknown message id {tag}"),
            )),
        }
    }
}

fn put_header(buf: &mut BytesMut, tag: u8, payload_len: usize) {
    buf.put_u32(1 + payload_len as u32);
    buf.put_u8(tag);
}

fn put_spec(buf: &mut BytesMut, spec: &ChunkSpec) {
    buf.put_u32(spec.piece);
    buf.put_u32(spec.begin);
    buf.put_u32(spec.length);
}

fn get_spec(frame: &mut Bytes) -> ChunkSpec {
    ChunkSpec {
        piece: frame.get_u32(),
        begin: frame.get_u32(),
        length: frame.get_u32(),
    }
}

/// Length-prefixed frame reader with a pooled buffer.
pub struct FrameReader {
    max_frame_len: usize,
    buf: BytesMut,
}

impl FrameReader {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            max_frame_len,
            buf: BytesMut::new(),
        }
    }

    /// Read one complete message. EOF mid-frame is an error; EOF at a
    /// frame boundary surfaces as `Io(UnexpectedEof)` from the length
    /// read, which callers treat as the peer hanging up.
    pub async fn read_message<R: AsyncRead + Unpin>(&mut self, r: &mut R) -> Result<Message> {
        let mut len_buf = [0u8; 4];
        r.read_exact(&mut len_buf).await?;
        let len = u32::from_be_bytes(len_buf) as usize;

        if len > self.max_frame_len {
            return Err(Error::protocol(
                ProtocolKind::Framing,
                format!("frame of {len} bytes exceeds cap {}", self.max_frame_len),
            ));
        }
        if len == 0 {
            return Ok(Message::KeepAlive);
        }

        self.buf.resize(len, 0);
        r.read_exact(&mut self.buf[..]).await?;
        Message::decode(self.buf.split_to(len).freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: Message) {
        let frame = msg.encode();
        // Strip the length prefix before decoding.
        let body = frame.slice(4..);
        assert_eq!(Message::decode(body).unwrap(), msg);
    }

    #[test]
    fn roundtrip_all_variants() {
        let spec = ChunkSpec {
            piece: 3,
            begin: 16384,
            length: 16384,
        };
        roundtrip(Message::KeepAlive);
        roundtrip(Message::Choke);
        roundtrip(Message::Unchoke);
        roundtrip(Message::Interested);
        roundtrip(Message::NotInterested);
        roundtrip(Message::Have(42));
        roundtrip(Message::Bitfield(Bytes::from_static(&[0b1010_0000])));
        roundtrip(Message::Bitfield(Bytes::new()));
        roundtrip(Message::Request(spec));
        roundtrip(Message::Piece {
            piece: 7,
            begin: 0,
            data: Bytes::from(vec![0xAB; 16384]),
        });
        roundtrip(Message::Cancel(spec));
        roundtrip(Message::Port(6881));
        roundtrip(Message::SuggestPiece(9));
        roundtrip(Message::HaveAll);
        roundtrip(Message::HaveNone);
        roundtrip(Message::RejectRequest(spec));
        roundtrip(Message::AllowedFast(1));
        roundtrip(Message::Extended {
            id: 0,
            payload: Bytes::from_static(b"d1:md6:ut_pexi1eee"),
        });
    }

    #[test]
    fn keepalive_is_zero_length_frame() {
        assert_eq!(Message::KeepAlive.encode().as_ref(), &[0, 0, 0, 0]);
    }

    #[test]
    fn known_encodings() {
        assert_eq!(Message::Choke.encode().as_ref(), &[0, 0, 0, 1, 0]);
        assert_eq!(
            Message::Have(2).encode().as_ref(),
            &[0, 0, 0, 5, 4, 0, 0, 0, 2]
        );
        assert_eq!(Message::HaveAll.encode().as_ref(), &[0, 0, 0, 1, 0x0E]);
    }

    #[test]
    fn rejects_short_payloads() {
        assert!(Message::decode(Bytes::from_static(&[4, 0, 0])).is_err());
        assert!(Message::decode(Bytes::from_static(&[6, 0, 0, 0, 0])).is_err());
        assert!(Message::decode(Bytes::from_static(&[20])).is_err());
    }

    #[test]
    fn rejects_unknown_id() {
        assert!(Message::decode(Bytes::from_static(&[0x42])).is_err());
    }

    #[tokio::test]
    async fn frame_reader_roundtrip() {
        let mut wire = BytesMut::new();
        Message::Have(5).encode_into(&mut wire);
        Message::KeepAlive.encode_into(&mut wire);
        Message::Piece {
            piece: 0,
            begin: 0,
            data: Bytes::from_static(b"abc"),
        }
        .encode_into(&mut wire);

        let mut reader = FrameReader::new(DEFAULT_MAX_FRAME_LEN);
        let mut cursor = std::io::Cursor::new(wire.freeze().to_vec());
        assert_eq!(
            reader.read_message(&mut cursor).await.unwrap(),
            Message::Have(5)
        );
        assert_eq!(
            reader.read_message(&mut cursor).await.unwrap(),
            Message::KeepAlive
        );
        match reader.read_message(&mut cursor).await.unwrap() {
            Message::Piece { data, .. } => assert_eq!(data.as_ref(), b"abc"),
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn frame_reader_enforces_cap() {
        let mut reader = FrameReader::new(8);
        let raw = 100u32.to_be_bytes();
        let mut cursor = std::io::Cursor::new(raw.to_vec());
        let err = reader.read_message(&mut cursor).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol {
                kind: ProtocolKind::Framing,
                ..
            }
        ));
    }

    #[test]
    fn extension_bits() {
        let bits = ExtensionBits::ours(true);
        assert!(bits.supports_extended());
        assert!(bits.supports_fast());
        assert!(bits.supports_dht());
        // Bit 20 lands in byte 5 as 0x10.
        assert_eq!(bits.as_bytes()[5], 0x10);

        let bits = ExtensionBits::ours(false);
        assert!(!bits.supports_dht());
    }

    #[test]
    fn handshake_roundtrip() {
        let hs = Handshake {
            bits: ExtensionBits::ours(true),
            info_hash: InfoHash([7; 20]),
            peer_id: *b"-RP0001-abcdefghijkl",
        };
        let decoded = Handshake::decode(&hs.encode()).unwrap();
        assert_eq!(decoded, hs);
    }

    #[test]
    fn handshake_rejects_bad_preamble() {
        let hs = Handshake {
            bits: ExtensionBits::default(),
            info_hash: InfoHash([0; 20]),
            peer_id: [0; 20],
        };
        let mut raw = hs.encode();
        raw[1] = b'X';
        assert!(Handshake::decode(&raw).is_err());
    }
}
