//! MQTT Packet Encoder
//!
//! Encodes the packets a client sends, for both v3.1.1 and v5.0

use bytes::{BufMut, BytesMut};

use super::MAX_REMAINING_LENGTH;
use crate::protocol::{
    Connect, Disconnect, EncodeError, Packet, ProtocolVersion, PubAck, ReasonCode, Subscribe,
};

/// Protocol name field of CONNECT, length prefix included
const PROTOCOL_NAME: &[u8] = b"\x00\x04MQTT";

/// Append `len` as a variable byte integer
pub(crate) fn put_length(buf: &mut BytesMut, len: usize) -> Result<(), EncodeError> {
    if len > MAX_REMAINING_LENGTH {
        return Err(EncodeError::TooLarge(len));
    }
    let mut rest = len;
    loop {
        let byte = (rest & 0x7F) as u8;
        rest >>= 7;
        if rest == 0 {
            buf.put_u8(byte);
            return Ok(());
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Bytes `put_length` writes for `len`
pub(crate) fn length_size(len: usize) -> usize {
    match len {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

fn put_binary(buf: &mut BytesMut, data: &[u8], field: &'static str) -> Result<(), EncodeError> {
    let len = u16::try_from(data.len()).map_err(|_| EncodeError::FieldTooLong(field))?;
    buf.put_u16(len);
    buf.put_slice(data);
    Ok(())
}

fn put_str(buf: &mut BytesMut, s: &str, field: &'static str) -> Result<(), EncodeError> {
    put_binary(buf, s.as_bytes(), field)
}

/// Fixed header then body
fn frame(buf: &mut BytesMut, header: u8, body: &[u8]) -> Result<(), EncodeError> {
    buf.reserve(1 + length_size(body.len()) + body.len());
    buf.put_u8(header);
    put_length(buf, body.len())?;
    buf.put_slice(body);
    Ok(())
}

/// MQTT Packet Encoder
pub struct Encoder {
    protocol_version: ProtocolVersion,
}

impl Encoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            protocol_version: version,
        }
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.protocol_version
    }

    fn is_v5(&self) -> bool {
        self.protocol_version == ProtocolVersion::V5
    }

    /// Encode a packet to the buffer
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match packet {
            Packet::Connect(p) => self.connect(p, buf),
            Packet::PubAck(p) => self.puback(p, buf),
            Packet::Subscribe(p) => self.subscribe(p, buf),
            Packet::PingReq => frame(buf, 0xC0, &[]),
            Packet::Disconnect(p) => self.disconnect(p, buf),
            other => Err(EncodeError::NotSentByClient(other.name())),
        }
    }

    fn connect(&self, packet: &Connect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut body = BytesMut::with_capacity(32 + packet.client_id.len());
        body.put_slice(PROTOCOL_NAME);
        body.put_u8(packet.protocol_version as u8);

        let mut flags = 0u8;
        if packet.clean_start {
            flags |= 0x02;
        }
        if packet.password.is_some() {
            flags |= 0x40;
        }
        if packet.username.is_some() {
            flags |= 0x80;
        }
        body.put_u8(flags);
        body.put_u16(packet.keep_alive);

        if packet.protocol_version == ProtocolVersion::V5 {
            packet.properties.encode(&mut body)?;
        }

        put_str(&mut body, &packet.client_id, "client id")?;
        if let Some(username) = &packet.username {
            put_str(&mut body, username, "username")?;
        }
        if let Some(password) = &packet.password {
            put_binary(&mut body, password, "password")?;
        }

        frame(buf, 0x10, &body)
    }

    fn puback(&self, packet: &PubAck, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut body = BytesMut::with_capacity(3);
        body.put_u16(packet.packet_id);
        // v5.0 may omit a Success reason code
        if self.is_v5() && packet.reason_code != ReasonCode::Success {
            body.put_u8(packet.reason_code as u8);
        }
        frame(buf, 0x40, &body)
    }

    fn subscribe(&self, packet: &Subscribe, buf: &mut BytesMut) -> Result<(), EncodeError> {
        if packet.subscriptions.is_empty() {
            return Err(EncodeError::EmptySubscribe);
        }

        let mut body = BytesMut::new();
        body.put_u16(packet.packet_id);
        if self.is_v5() {
            body.put_u8(0x00);
        }
        for sub in &packet.subscriptions {
            put_str(&mut body, &sub.filter, "topic filter")?;
            // Only the QoS bits are set, which is also the v3.1.1 layout
            body.put_u8(sub.qos as u8);
        }

        // SUBSCRIBE requires flags 0010
        frame(buf, 0x82, &body)
    }

    fn disconnect(&self, packet: &Disconnect, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let mut body = BytesMut::new();
        if self.is_v5()
            && (packet.reason_code != ReasonCode::Success || !packet.properties.is_empty())
        {
            body.put_u8(packet.reason_code as u8);
            packet.properties.encode(&mut body)?;
        }
        frame(buf, 0xE0, &body)
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new(ProtocolVersion::V311)
    }
}
