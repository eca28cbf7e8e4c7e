//! Error types for the rendezvous server and mesh client
//!
//! Per-datagram errors (`DecodeError`, `ProtocolViolation`) are always
//! recoverable: the offending datagram is dropped. `EncodeError` aborts a
//! single send before anything reaches the wire. Only transport failures
//! on the socket itself terminate a receive loop.

use std::net::SocketAddr;

use thiserror::Error;

use crate::message::MessageKind;

/// Malformed, truncated or unsupported envelope / payload
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Buffer is shorter than the fixed 4-byte header
    #[error("datagram too short: {0} bytes")]
    TooShort(usize),

    /// Datagram exceeds the maximum envelope size
    #[error("datagram too large: {0} bytes")]
    TooLarge(usize),

    /// Kind byte outside the known set
    #[error("unknown message kind: {0}")]
    UnknownKind(u8),

    /// Encrypted flag set; no cipher is supported
    #[error("encrypted flag set: {0}")]
    Encrypted(u8),

    /// Declared payload length disagrees with the bytes that follow the header
    #[error("length mismatch: header says {declared}, {actual} bytes remain")]
    LengthMismatch { declared: usize, actual: usize },

    /// A payload field ran past the end of the payload
    #[error("truncated payload while reading {0}")]
    Truncated(&'static str),

    /// Bytes left over after a complete payload
    #[error("{0} trailing bytes after payload")]
    TrailingBytes(usize),

    /// A string field is not valid UTF-8
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    /// Room name is empty
    #[error("empty room name")]
    EmptyRoom,

    /// Room name too long for its ROSTER to fit one datagram
    #[error("room name too long: {0} bytes")]
    RoomNameTooLong(usize),

    /// Payload was decoded as the wrong kind
    #[error("expected {expected:?} payload, got {actual:?}")]
    WrongKind {
        expected: MessageKind,
        actual: MessageKind,
    },
}

/// Payload cannot be put on the wire
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    /// Envelope would exceed the maximum datagram size
    #[error("envelope of {size} bytes exceeds maximum of {max}")]
    TooLarge { size: usize, max: usize },

    /// A string field does not fit its u16 length prefix
    #[error("{0} longer than 65535 bytes")]
    FieldTooLong(&'static str),

    /// Only IPv4 endpoints fit the roster member encoding
    #[error("unsupported address (IPv4 only): {0}")]
    UnsupportedAddress(SocketAddr),
}

/// Well-formed envelope that is invalid for the receiver's role
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    /// Kind the receiver never accepts (e.g. server receiving CHAT)
    #[error("unexpected {kind:?} from {from}")]
    UnexpectedKind { kind: MessageKind, from: SocketAddr },

    /// Roster pushed by someone other than the rendezvous server
    #[error("roster from {0} which is not the rendezvous server")]
    UntrustedRoster(SocketAddr),

    /// Roster for a room the client never joined
    #[error("roster for unjoined room '{0}'")]
    UnjoinedRoom(String),

    /// Join from an endpoint the roster encoding cannot carry
    #[error("unsupported source address {0}")]
    UnsupportedSource(SocketAddr),

    /// Join that would grow the roster past one datagram
    #[error("room '{room}' is full ({capacity} members)")]
    RoomFull { room: String, capacity: usize },
}

/// Application-level errors
///
/// Only a dead socket (`Transport` or `Disconnected`) is fatal for a
/// receive loop; see [`AppError::is_fatal`].
#[derive(Debug, Error)]
pub enum AppError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),

    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),

    /// Socket send/receive failure
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Invalid or unreadable configuration
    #[error("config error: {0}")]
    Config(String),

    /// Empty room name passed to the client API
    #[error("invalid room name")]
    InvalidRoomName,

    /// Chat sent to a room that was never joined
    #[error("not in room '{0}'")]
    NotInRoom(String),

    /// Client socket is gone; no further sends are possible
    #[error("disconnected")]
    Disconnected,
}

impl AppError {
    /// Whether this error should terminate the loop that hit it
    ///
    /// Transient socket conditions (ICMP unreachable surfacing as a reset,
    /// interrupted calls) are not fatal; anything else on the socket is.
    pub fn is_fatal(&self) -> bool {
        match self {
            AppError::Transport(e) => !is_transient(e),
            AppError::Disconnected => true,
            _ => false,
        }
    }
}

/// Socket errors that only concern a single datagram
pub fn is_transient(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
    )
}
