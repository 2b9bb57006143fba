//! Codec errors

use std::fmt;

/// A packet from the broker that cannot be read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// A length field runs on past four bytes
    BadLength,
    /// The fixed header names no MQTT packet type
    UnknownPacketType(u8),
    /// A packet type only clients send, such as CONNECT
    NotForClient(u8),
    /// Reserved flag bits set in the named packet
    BadFlags(&'static str),
    /// A field of the named packet runs past its end
    Truncated(&'static str),
    /// A string is not UTF-8 or contains NUL
    BadString,
    /// v5 property identifier we do not know the shape of
    UnknownProperty(u8),
    BadReasonCode { packet: &'static str, code: u8 },
    BadQoS(u8),
    /// Body larger than the configured maximum
    TooLarge { size: usize, limit: usize },
    Malformed(&'static str),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::BadLength => write!(f, "length field longer than four bytes"),
            DecodeError::UnknownPacketType(t) => write!(f, "unknown packet type {}", t),
            DecodeError::NotForClient(t) => {
                write!(f, "packet type {} is never sent to a client", t)
            }
            DecodeError::BadFlags(packet) => write!(f, "reserved flags set in {}", packet),
            DecodeError::Truncated(packet) => write!(f, "{} is cut short", packet),
            DecodeError::BadString => write!(f, "string is not UTF-8 or contains NUL"),
            DecodeError::UnknownProperty(id) => write!(f, "unknown property 0x{:02X}", id),
            DecodeError::BadReasonCode { packet, code } => {
                write!(f, "{} carries invalid reason code 0x{:02X}", packet, code)
            }
            DecodeError::BadQoS(qos) => write!(f, "PUBLISH with QoS {}", qos),
            DecodeError::TooLarge { size, limit } => {
                write!(f, "packet of {} bytes exceeds the limit of {}", size, limit)
            }
            DecodeError::Malformed(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for DecodeError {}

/// A client packet that cannot be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Body longer than the fixed header can express
    TooLarge(usize),
    /// Named string or binary field over 65535 bytes
    FieldTooLong(&'static str),
    /// Packet only a server sends
    NotSentByClient(&'static str),
    EmptySubscribe,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncodeError::TooLarge(size) => write!(f, "packet body of {} bytes is too large", size),
            EncodeError::FieldTooLong(field) => write!(f, "{} exceeds 65535 bytes", field),
            EncodeError::NotSentByClient(name) => write!(f, "a client never sends {}", name),
            EncodeError::EmptySubscribe => write!(f, "SUBSCRIBE needs at least one topic filter"),
        }
    }
}

impl std::error::Error for EncodeError {}
