//! MQTT v5.0 Properties
//!
//! Only the properties a subscribing client sends or reacts to are kept;
//! everything else the server sends is validated for shape and skipped.

use bytes::{BufMut, BytesMut};

use crate::codec::{length_size, put_length, Cursor};
use crate::protocol::{DecodeError, EncodeError};

const SESSION_EXPIRY_INTERVAL: u8 = 0x11;
const ASSIGNED_CLIENT_IDENTIFIER: u8 = 0x12;
const SERVER_KEEP_ALIVE: u8 = 0x13;
const REASON_STRING: u8 = 0x1F;
const RECEIVE_MAXIMUM: u8 = 0x21;
const MAXIMUM_PACKET_SIZE: u8 = 0x27;

/// Wire shape of a property value (MQTT v5.0, table 2-4)
enum ValueKind {
    Byte,
    TwoByte,
    FourByte,
    VarInt,
    Utf8,
    Binary,
    Utf8Pair,
}

fn value_kind(id: u8) -> Option<ValueKind> {
    let kind = match id {
        0x01 | 0x17 | 0x19 | 0x24 | 0x25 | 0x28 | 0x29 | 0x2A => ValueKind::Byte,
        0x13 | 0x21 | 0x22 | 0x23 => ValueKind::TwoByte,
        0x02 | 0x11 | 0x18 | 0x27 => ValueKind::FourByte,
        0x0B => ValueKind::VarInt,
        0x03 | 0x08 | 0x12 | 0x15 | 0x1A | 0x1C | 0x1F => ValueKind::Utf8,
        0x09 | 0x16 => ValueKind::Binary,
        0x26 => ValueKind::Utf8Pair,
        _ => return None,
    };
    Some(kind)
}

/// Read past a property we do not keep
fn skip(block: &mut Cursor<'_>, id: u8) -> Result<(), DecodeError> {
    match value_kind(id).ok_or(DecodeError::UnknownProperty(id))? {
        ValueKind::Byte => {
            block.u8()?;
        }
        ValueKind::TwoByte => {
            block.u16()?;
        }
        ValueKind::FourByte => {
            block.u32()?;
        }
        ValueKind::VarInt => {
            block.length()?;
        }
        ValueKind::Utf8 => {
            block.string()?;
        }
        ValueKind::Binary => {
            block.binary()?;
        }
        ValueKind::Utf8Pair => {
            block.string()?;
            block.string()?;
        }
    }
    Ok(())
}

/// MQTT v5.0 properties relevant to the client session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    /// Session Expiry Interval in seconds (CONNECT, CONNACK, DISCONNECT)
    pub session_expiry_interval: Option<u32>,
    /// Client identifier assigned by the server (CONNACK)
    pub assigned_client_identifier: Option<String>,
    /// Keep alive imposed by the server (CONNACK)
    pub server_keep_alive: Option<u16>,
    /// Human readable diagnostic (CONNACK, SUBACK, DISCONNECT)
    pub reason_string: Option<String>,
    /// Receive Maximum (CONNECT, CONNACK)
    pub receive_maximum: Option<u16>,
    /// Maximum Packet Size (CONNECT, CONNACK)
    pub maximum_packet_size: Option<u32>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// Size of the block a client sends, without its length prefix
    fn block_size(&self) -> usize {
        let mut size = 0;
        if self.session_expiry_interval.is_some() {
            size += 1 + 4;
        }
        if self.receive_maximum.is_some() {
            size += 1 + 2;
        }
        if self.maximum_packet_size.is_some() {
            size += 1 + 4;
        }
        size
    }

    /// Encode the properties a client sends, with the length prefix
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let size = self.block_size();
        buf.reserve(length_size(size) + size);
        put_length(buf, size)?;
        if let Some(v) = self.session_expiry_interval {
            buf.put_u8(SESSION_EXPIRY_INTERVAL);
            buf.put_u32(v);
        }
        if let Some(v) = self.receive_maximum {
            buf.put_u8(RECEIVE_MAXIMUM);
            buf.put_u16(v);
        }
        if let Some(v) = self.maximum_packet_size {
            buf.put_u8(MAXIMUM_PACKET_SIZE);
            buf.put_u32(v);
        }
        Ok(())
    }

    /// Read a length-prefixed property block off `body`
    pub(crate) fn decode(body: &mut Cursor<'_>) -> Result<Self, DecodeError> {
        let len = body.length()?;
        let mut block = body.sub(len)?;
        let mut props = Properties::new();

        // Every defined identifier fits in one byte of the varint
        while !block.is_empty() {
            match block.u8()? {
                SESSION_EXPIRY_INTERVAL => props.session_expiry_interval = Some(block.u32()?),
                MAXIMUM_PACKET_SIZE => props.maximum_packet_size = Some(block.u32()?),
                SERVER_KEEP_ALIVE => props.server_keep_alive = Some(block.u16()?),
                RECEIVE_MAXIMUM => props.receive_maximum = Some(block.u16()?),
                ASSIGNED_CLIENT_IDENTIFIER => {
                    props.assigned_client_identifier = Some(block.string()?.to_string())
                }
                REASON_STRING => props.reason_string = Some(block.string()?.to_string()),
                other => skip(&mut block, other)?,
            }
        }

        Ok(props)
    }
}
