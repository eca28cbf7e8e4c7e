//! Wire protocol
//!
//! Binary envelope carried in a single UDP datagram:
//!
//! ```text
//! byte 0      kind       1=JOIN_ROOM 2=PING 3=PONG 4=CHAT 5=ROSTER
//! byte 1      encrypted  always 0
//! bytes 2-3   length     u16, payload byte count
//! bytes 4..   payload    `length` bytes, layout per kind
//! ```
//!
//! All integers are little-endian. Strings are `[u16 len][utf-8 bytes]`.
//! Roster members are IPv4 only: `[4-byte address][u16 port]`.
//!
//! Parsing rules:
//! - Never index past a length check; read through `Buf` after `remaining()`.
//! - Never `unwrap()` / `expect()` / `panic!()` outside tests.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{DecodeError, EncodeError};
use crate::types::RoomName;

/// Fixed header: kind, encrypted, u16 length
pub const HEADER_LEN: usize = 4;

/// Upper bound for a whole envelope, kept under the common path MTU
pub const MAX_DATAGRAM: usize = 1400;

/// Largest payload that still fits in one envelope
pub const MAX_PAYLOAD: usize = MAX_DATAGRAM - HEADER_LEN;

/// Encoded size of one roster member (IPv4 address + port)
pub const MEMBER_LEN: usize = 6;

/// Longest room name whose ROSTER still carries at least one member
pub const MAX_ROOM_NAME: usize = MAX_PAYLOAD - (2 + 8 + 2) - MEMBER_LEN;

/// Message kind (first header byte)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageKind {
    /// Client → server: join a room
    JoinRoom = 1,
    /// Server → client: liveness probe
    Ping = 2,
    /// Client → server: liveness reply
    Pong = 3,
    /// Peer → peer: chat text
    Chat = 4,
    /// Server → client: room membership
    Roster = 5,
}

impl TryFrom<u8> for MessageKind {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageKind::JoinRoom),
            2 => Ok(MessageKind::Ping),
            3 => Ok(MessageKind::Pong),
            4 => Ok(MessageKind::Chat),
            5 => Ok(MessageKind::Roster),
            other => Err(DecodeError::UnknownKind(other)),
        }
    }
}

/// The unit of transmission
///
/// `length` is not stored: it is always `payload.len()`, written on encode
/// and checked on decode. `sender` comes from the transport and is never
/// transmitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub kind: MessageKind,
    encrypted: bool,
    pub payload: Bytes,
    pub sender: Option<SocketAddr>,
}

impl Envelope {
    /// Create an outbound (plaintext) envelope
    pub fn new(kind: MessageKind, payload: Bytes) -> Self {
        Self {
            kind,
            encrypted: false,
            payload,
            sender: None,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Payload byte count as carried in the header
    pub fn length(&self) -> usize {
        self.payload.len()
    }

    /// Serialize header and payload
    ///
    /// Fails without producing any bytes when the envelope would not fit in
    /// a single datagram.
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        let size = HEADER_LEN + self.payload.len();
        if size > MAX_DATAGRAM {
            return Err(EncodeError::TooLarge {
                size,
                max: MAX_DATAGRAM,
            });
        }

        let mut buf = BytesMut::with_capacity(size);
        buf.put_u8(self.kind as u8);
        buf.put_u8(u8::from(self.encrypted));
        // size <= MAX_DATAGRAM, so the payload length fits in u16
        buf.put_u16_le(self.payload.len() as u16);
        buf.put_slice(&self.payload);
        Ok(buf.freeze())
    }

    /// Parse a received datagram
    pub fn decode(datagram: &[u8], from: SocketAddr) -> Result<Self, DecodeError> {
        if datagram.len() < HEADER_LEN {
            return Err(DecodeError::TooShort(datagram.len()));
        }
        if datagram.len() > MAX_DATAGRAM {
            return Err(DecodeError::TooLarge(datagram.len()));
        }

        let mut buf = datagram;
        let kind = MessageKind::try_from(buf.get_u8())?;
        let encrypted = buf.get_u8();
        if encrypted != 0 {
            return Err(DecodeError::Encrypted(encrypted));
        }
        let declared = buf.get_u16_le() as usize;
        if declared != buf.remaining() {
            return Err(DecodeError::LengthMismatch {
                declared,
                actual: buf.remaining(),
            });
        }

        Ok(Self {
            kind,
            encrypted: false,
            payload: Bytes::copy_from_slice(buf),
            sender: Some(from),
        })
    }
}

/// A typed payload with a fixed message kind
///
/// `decode_payload(encode_payload(x)) == x` for every value that encodes.
pub trait Payload: Sized {
    const KIND: MessageKind;

    fn encode_payload(&self, buf: &mut BytesMut) -> Result<(), EncodeError>;

    fn decode_payload(buf: &mut &[u8]) -> Result<Self, DecodeError>;

    /// Wrap into an envelope, checking the datagram size limit
    fn to_envelope(&self) -> Result<Envelope, EncodeError> {
        let mut buf = BytesMut::new();
        self.encode_payload(&mut buf)?;
        let size = HEADER_LEN + buf.len();
        if size > MAX_DATAGRAM {
            return Err(EncodeError::TooLarge {
                size,
                max: MAX_DATAGRAM,
            });
        }
        Ok(Envelope::new(Self::KIND, buf.freeze()))
    }

    /// Parse the payload of an envelope of the matching kind
    ///
    /// The whole payload must be consumed.
    fn from_envelope(envelope: &Envelope) -> Result<Self, DecodeError> {
        if envelope.kind != Self::KIND {
            return Err(DecodeError::WrongKind {
                expected: Self::KIND,
                actual: envelope.kind,
            });
        }
        let mut buf: &[u8] = &envelope.payload;
        let value = Self::decode_payload(&mut buf)?;
        if buf.has_remaining() {
            return Err(DecodeError::TrailingBytes(buf.remaining()));
        }
        Ok(value)
    }
}

/// JOIN_ROOM: `[u16 len][room]([u16 len][display name])?`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRoom {
    pub room: RoomName,
    /// Empty when the joiner did not announce a name
    pub display_name: String,
}

impl JoinRoom {
    pub fn new(room: RoomName) -> Self {
        Self {
            room,
            display_name: String::new(),
        }
    }
}

impl Payload for JoinRoom {
    const KIND: MessageKind = MessageKind::JoinRoom;

    fn encode_payload(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        put_str(buf, self.room.as_str(), "room")?;
        if !self.display_name.is_empty() {
            put_str(buf, &self.display_name, "display name")?;
        }
        Ok(())
    }

    fn decode_payload(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let room = get_room(buf)?;
        let display_name = if buf.has_remaining() {
            get_str(buf, "display name")?
        } else {
            String::new()
        };
        Ok(Self { room, display_name })
    }
}

/// CHAT: `[u16 len][room][u16 len][text]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chat {
    pub room: RoomName,
    pub text: String,
}

impl Payload for Chat {
    const KIND: MessageKind = MessageKind::Chat;

    fn encode_payload(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        put_str(buf, self.room.as_str(), "room")?;
        put_str(buf, &self.text, "text")
    }

    fn decode_payload(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let room = get_room(buf)?;
        let text = get_str(buf, "text")?;
        Ok(Self { room, text })
    }
}

/// ROSTER: `[u16 len][room][u64 version][u16 count][count x (ipv4, u16 port)]`
///
/// `version` grows monotonically per registry; receivers ignore a roster
/// older than the one they already applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Roster {
    pub room: RoomName,
    pub version: u64,
    pub members: Vec<SocketAddr>,
}

impl Roster {
    /// Largest member count that fits in one datagram for this room name
    pub fn max_members(room: &RoomName) -> usize {
        let fixed = 2 + room.as_str().len() + 8 + 2;
        MAX_PAYLOAD.saturating_sub(fixed) / MEMBER_LEN
    }
}

impl Payload for Roster {
    const KIND: MessageKind = MessageKind::Roster;

    fn encode_payload(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        put_str(buf, self.room.as_str(), "room")?;
        buf.put_u64_le(self.version);
        let count =
            u16::try_from(self.members.len()).map_err(|_| EncodeError::FieldTooLong("members"))?;
        buf.put_u16_le(count);
        for member in &self.members {
            let SocketAddr::V4(v4) = member else {
                return Err(EncodeError::UnsupportedAddress(*member));
            };
            buf.put_slice(&v4.ip().octets());
            buf.put_u16_le(v4.port());
        }
        Ok(())
    }

    fn decode_payload(buf: &mut &[u8]) -> Result<Self, DecodeError> {
        let room = get_room(buf)?;
        if buf.remaining() < 8 {
            return Err(DecodeError::Truncated("version"));
        }
        let version = buf.get_u64_le();
        let count = get_u16(buf, "member count")? as usize;
        if buf.remaining() < count * MEMBER_LEN {
            return Err(DecodeError::Truncated("members"));
        }
        let mut members = Vec::with_capacity(count);
        for _ in 0..count {
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            let ip = Ipv4Addr::from(octets);
            let port = buf.get_u16_le();
            members.push(SocketAddr::V4(SocketAddrV4::new(ip, port)));
        }
        Ok(Self {
            room,
            version,
            members,
        })
    }
}

/// A decoded message of any kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    JoinRoom(JoinRoom),
    Ping,
    Pong,
    Chat(Chat),
    Roster(Roster),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::JoinRoom(_) => MessageKind::JoinRoom,
            Message::Ping => MessageKind::Ping,
            Message::Pong => MessageKind::Pong,
            Message::Chat(_) => MessageKind::Chat,
            Message::Roster(_) => MessageKind::Roster,
        }
    }

    pub fn to_envelope(&self) -> Result<Envelope, EncodeError> {
        match self {
            Message::JoinRoom(p) => p.to_envelope(),
            Message::Ping => Ok(Envelope::new(MessageKind::Ping, Bytes::new())),
            Message::Pong => Ok(Envelope::new(MessageKind::Pong, Bytes::new())),
            Message::Chat(p) => p.to_envelope(),
            Message::Roster(p) => p.to_envelope(),
        }
    }

    pub fn from_envelope(envelope: &Envelope) -> Result<Self, DecodeError> {
        match envelope.kind {
            MessageKind::JoinRoom => JoinRoom::from_envelope(envelope).map(Message::JoinRoom),
            MessageKind::Ping | MessageKind::Pong => {
                if !envelope.payload.is_empty() {
                    return Err(DecodeError::TrailingBytes(envelope.payload.len()));
                }
                Ok(if envelope.kind == MessageKind::Ping {
                    Message::Ping
                } else {
                    Message::Pong
                })
            }
            MessageKind::Chat => Chat::from_envelope(envelope).map(Message::Chat),
            MessageKind::Roster => Roster::from_envelope(envelope).map(Message::Roster),
        }
    }

    /// Encode straight to datagram bytes
    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        self.to_envelope()?.encode()
    }

    /// Decode a datagram into its sender and typed message
    pub fn decode(datagram: &[u8], from: SocketAddr) -> Result<Self, DecodeError> {
        Self::from_envelope(&Envelope::decode(datagram, from)?)
    }
}

fn put_str(buf: &mut BytesMut, s: &str, field: &'static str) -> Result<(), EncodeError> {
    let len = u16::try_from(s.len()).map_err(|_| EncodeError::FieldTooLong(field))?;
    buf.put_u16_le(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn get_u16(buf: &mut &[u8], field: &'static str) -> Result<u16, DecodeError> {
    if buf.remaining() < 2 {
        return Err(DecodeError::Truncated(field));
    }
    Ok(buf.get_u16_le())
}

fn get_str(buf: &mut &[u8], field: &'static str) -> Result<String, DecodeError> {
    let len = get_u16(buf, field)? as usize;
    if buf.remaining() < len {
        return Err(DecodeError::Truncated(field));
    }
    let (raw, rest) = buf.split_at(len);
    *buf = rest;
    String::from_utf8(raw.to_vec()).map_err(|_| DecodeError::InvalidUtf8(field))
}

fn get_room(buf: &mut &[u8]) -> Result<RoomName, DecodeError> {
    let name = get_str(buf, "room")?;
    match name.len() {
        0 => Err(DecodeError::EmptyRoom),
        len if len > MAX_ROOM_NAME => Err(DecodeError::RoomNameTooLong(len)),
        _ => RoomName::new(name).ok_or(DecodeError::EmptyRoom),
    }
}
