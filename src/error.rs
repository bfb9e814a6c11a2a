//! Typed error hierarchy for riptide.
//!
//! Each variant maps to one recovery action: protocol violations close the
//! offending connection, hash mismatches requeue the piece, tracker errors
//! reschedule the announce, config errors abort startup, and `Closed`
//! marks benign shutdown.

use std::time::Duration;

use thiserror::Error;

/// Main error type for the engine.
#[derive(Debug, Error)]
pub enum Error {
    /// Peer sent malformed or disallowed data. The connection is closed
    /// and the peer is not redialed for a backoff interval.
    #[error("protocol violation: {message}")]
    Protocol {
        kind: ProtocolKind,
        message: String,
    },

    /// Transient socket or storage failure. Storage write failures are
    /// fatal to the owning torrent.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A piece failed SHA-1 verification.
    #[error("piece {piece} failed hash verification")]
    HashMismatch { piece: u32 },

    /// Tracker announce failed.
    #[error("tracker error: {message}")]
    Tracker {
        kind: TrackerKind,
        message: String,
        /// Suggested delay before the next announce to this tracker.
        retry_after: Option<Duration>,
    },

    /// Invalid options at startup. Returned to the caller; the engine
    /// does not start.
    #[error("invalid configuration for '{field}': {message}")]
    Config {
        field: &'static str,
        message: String,
    },

    /// Benign shutdown: the client or torrent was closed.
    #[error("closed")]
    Closed,
}

/// Protocol error subtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolKind {
    /// Handshake preamble did not match.
    Handshake,
    /// Frame exceeded the decoder cap or was truncated.
    Framing,
    /// Message legal in general but not in the current connection state.
    UnexpectedMessage,
    /// Field out of range (piece index, chunk bounds).
    InvalidArgument,
    /// Malformed bencode.
    Bencode,
    /// Invalid .torrent metainfo.
    Metainfo,
    /// Invalid magnet URI.
    Magnet,
    /// ut_metadata exchange violation.
    Metadata,
    /// ut_pex message violation.
    Pex,
}

/// Tracker error subtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerKind {
    /// URL scheme is not http/https/udp.
    BadScheme,
    /// Non-success HTTP status.
    HttpStatus,
    /// UDP retransmit budget exhausted.
    Timeout,
    /// Response failed to parse.
    Parse,
    /// Tracker returned an explicit failure reason.
    Failure,
    /// DNS or socket setup failure.
    Network,
}

impl Error {
    /// Build a protocol error.
    pub fn protocol(kind: ProtocolKind, message: impl Into<String>) -> Self {
        Self::Protocol {
            kind,
            message: message.into(),
        }
    }

    /// Build a tracker error with no retry hint.
    pub fn tracker(kind: TrackerKind, message: impl Into<String>) -> Self {
        Self::Tracker {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    /// Build a configuration error.
    pub fn config(field: &'static str, message: impl Into<String>) -> Self {
        Self::Config {
            field,
            message: message.into(),
        }
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Io(e) => !matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
            ),
            Self::Tracker { kind, .. } => !matches!(kind, TrackerKind::BadScheme),
            Self::HashMismatch { .. } => true,
            Self::Protocol { .. } | Self::Config { .. } | Self::Closed => false,
        }
    }

    /// Whether this is the benign shutdown marker.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            TrackerKind::Timeout
        } else if err.status().is_some() {
            TrackerKind::HttpStatus
        } else {
            TrackerKind::Network
        };
        Self::Tracker {
            kind,
            message: err.to_string(),
            retry_after: None,
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Self::Tracker {
            kind: TrackerKind::BadScheme,
            message: err.to_string(),
            retry_after: None,
        }
    }
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_are_terminal() {
        let err = Error::protocol(ProtocolKind::Handshake, "infohash mismatch");
        assert!(!err.is_retryable());
    }

    #[test]
    fn bad_scheme_is_not_retryable() {
        let err = Error::tracker(TrackerKind::BadScheme, "wss://tracker");
        assert!(!err.is_retryable());

        let err = Error::tracker(TrackerKind::Timeout, "udp timeout");
        assert!(err.is_retryable());
    }

    #[test]
    fn closed_is_benign() {
        assert!(Error::Closed.is_closed());
        assert!(!Error::Closed.is_retryable());
    }
}
