//! MQTT Packet Decoder
//!
//! Decodes the packets a server sends to a client, for both v3.1.1 and v5.0

use bytes::Bytes;

use super::MAX_REMAINING_LENGTH;
use crate::protocol::{
    ConnAck, DecodeError, Disconnect, Packet, PacketType, Properties, ProtocolVersion, PubAck,
    Publish, QoS, ReasonCode, SubAck,
};

/// Variable byte integer at the start of `buf` as (value, bytes used).
/// `None` while more bytes are needed.
fn read_length(buf: &[u8]) -> Result<Option<(usize, usize)>, DecodeError> {
    let mut value = 0usize;
    for (i, &byte) in buf.iter().take(4).enumerate() {
        value |= ((byte & 0x7F) as usize) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= 4 {
        Err(DecodeError::BadLength)
    } else {
        Ok(None)
    }
}

/// Total size of the frame at the start of `buf`, fixed header included,
/// or `None` until the header is complete
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>, DecodeError> {
    if buf.is_empty() {
        return Ok(None);
    }
    Ok(read_length(&buf[1..])?.map(|(body, used)| 1 + used + body))
}

/// Reads fields off the body of one packet.
///
/// Running out of bytes is a [`DecodeError::Truncated`] naming the packet.
pub(crate) struct Cursor<'a> {
    buf: &'a [u8],
    packet: &'static str,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(buf: &'a [u8], packet: &'static str) -> Self {
        Self { buf, packet }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Whatever is left, consuming the cursor
    pub(crate) fn rest(self) -> &'a [u8] {
        self.buf
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < n {
            return Err(DecodeError::Truncated(self.packet));
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    /// Split the next `len` bytes off into their own cursor
    pub(crate) fn sub(&mut self, len: usize) -> Result<Cursor<'a>, DecodeError> {
        Ok(Cursor::new(self.take(len)?, self.packet))
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn length(&mut self) -> Result<usize, DecodeError> {
        match read_length(self.buf)? {
            Some((value, used)) => {
                self.buf = &self.buf[used..];
                Ok(value)
            }
            None => Err(DecodeError::Truncated(self.packet)),
        }
    }

    pub(crate) fn binary(&mut self) -> Result<&'a [u8], DecodeError> {
        let len = self.u16()? as usize;
        self.take(len)
    }

    pub(crate) fn string(&mut self) -> Result<&'a str, DecodeError> {
        match std::str::from_utf8(self.binary()?) {
            Ok(s) if !s.contains('\0') => Ok(s),
            _ => Err(DecodeError::BadString),
        }
    }
}

fn no_flags(flags: u8, packet: &'static str) -> Result<(), DecodeError> {
    if flags == 0 {
        Ok(())
    } else {
        Err(DecodeError::BadFlags(packet))
    }
}

/// MQTT Packet Decoder
pub struct Decoder {
    max_packet_size: usize,
    /// Protocol version negotiated in CONNECT
    protocol_version: ProtocolVersion,
}

impl Decoder {
    pub fn new(version: ProtocolVersion) -> Self {
        Self {
            max_packet_size: MAX_REMAINING_LENGTH,
            protocol_version: version,
        }
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.min(MAX_REMAINING_LENGTH);
        self
    }

    fn is_v5(&self) -> bool {
        self.protocol_version == ProtocolVersion::V5
    }

    /// Decode one packet from the front of `buf`.
    /// Returns (packet, bytes consumed), or `None` while it is incomplete.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(Packet, usize)>, DecodeError> {
        let Some(&first) = buf.first() else {
            return Ok(None);
        };
        let Some((size, used)) = read_length(&buf[1..])? else {
            return Ok(None);
        };
        if size > self.max_packet_size {
            return Err(DecodeError::TooLarge {
                size,
                limit: self.max_packet_size,
            });
        }

        let total = 1 + used + size;
        let Some(body) = buf.get(1 + used..total) else {
            return Ok(None);
        };

        let type_bits = first >> 4;
        let flags = first & 0x0F;
        let kind =
            PacketType::from_u8(type_bits).ok_or(DecodeError::UnknownPacketType(type_bits))?;

        let packet = match kind {
            PacketType::ConnAck => self.connack(flags, Cursor::new(body, "CONNACK"))?,
            PacketType::Publish => self.publish(flags, Cursor::new(body, "PUBLISH"))?,
            PacketType::PubAck => self.puback(flags, Cursor::new(body, "PUBACK"))?,
            PacketType::SubAck => self.suback(flags, Cursor::new(body, "SUBACK"))?,
            PacketType::PingResp => {
                no_flags(flags, "PINGRESP")?;
                Packet::PingResp
            }
            PacketType::Disconnect => self.disconnect(flags, Cursor::new(body, "DISCONNECT"))?,
            _ => return Err(DecodeError::NotForClient(type_bits)),
        };

        Ok(Some((packet, total)))
    }

    fn properties(&self, body: &mut Cursor<'_>) -> Result<Properties, DecodeError> {
        if self.is_v5() {
            Properties::decode(body)
        } else {
            Ok(Properties::default())
        }
    }

    fn connack(&self, flags: u8, mut body: Cursor<'_>) -> Result<Packet, DecodeError> {
        no_flags(flags, "CONNACK")?;

        // Only bit 0 (session present) may be set
        let ack_flags = body.u8()?;
        if ack_flags & 0xFE != 0 {
            return Err(DecodeError::BadFlags("CONNACK"));
        }

        let code = body.u8()?;
        let reason_code = if self.is_v5() {
            ReasonCode::from_u8(code).ok_or(DecodeError::BadReasonCode {
                packet: "CONNACK",
                code,
            })?
        } else {
            ReasonCode::from_v3_connack_code(code)
        };

        // A v5 broker may leave out an empty property block
        let properties = if body.is_empty() {
            Properties::default()
        } else {
            self.properties(&mut body)?
        };

        Ok(Packet::ConnAck(ConnAck {
            session_present: ack_flags & 0x01 != 0,
            reason_code,
            properties,
        }))
    }

    fn publish(&self, flags: u8, mut body: Cursor<'_>) -> Result<Packet, DecodeError> {
        let qos_bits = (flags >> 1) & 0x03;
        let qos = QoS::from_u8(qos_bits).ok_or(DecodeError::BadQoS(qos_bits))?;
        let dup = flags & 0x08 != 0;
        if qos == QoS::AtMostOnce && dup {
            return Err(DecodeError::Malformed("DUP set on a QoS 0 PUBLISH"));
        }

        let topic = body.string()?.to_string();
        let packet_id = match qos {
            QoS::AtMostOnce => None,
            _ => match body.u16()? {
                0 => return Err(DecodeError::Malformed("PUBLISH with packet id 0")),
                id => Some(id),
            },
        };
        let properties = self.properties(&mut body)?;

        Ok(Packet::Publish(Publish {
            dup,
            qos,
            retain: flags & 0x01 != 0,
            topic,
            packet_id,
            payload: Bytes::copy_from_slice(body.rest()),
            properties,
        }))
    }

    fn puback(&self, flags: u8, mut body: Cursor<'_>) -> Result<Packet, DecodeError> {
        no_flags(flags, "PUBACK")?;
        let packet_id = body.u16()?;

        let reason_code = if self.is_v5() && !body.is_empty() {
            let code = body.u8()?;
            ReasonCode::from_u8(code).ok_or(DecodeError::BadReasonCode {
                packet: "PUBACK",
                code,
            })?
        } else {
            ReasonCode::Success
        };

        Ok(Packet::PubAck(PubAck {
            packet_id,
            reason_code,
        }))
    }

    fn suback(&self, flags: u8, mut body: Cursor<'_>) -> Result<Packet, DecodeError> {
        no_flags(flags, "SUBACK")?;
        let packet_id = body.u16()?;
        let properties = self.properties(&mut body)?;

        let codes = body.rest();
        if codes.is_empty() {
            return Err(DecodeError::Malformed("SUBACK without reason codes"));
        }

        let reason_codes = codes
            .iter()
            .map(|&code| {
                let reason = if self.is_v5() {
                    ReasonCode::from_u8(code)
                } else {
                    ReasonCode::from_v3_suback_code(code)
                };
                reason.ok_or(DecodeError::BadReasonCode {
                    packet: "SUBACK",
                    code,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Packet::SubAck(SubAck {
            packet_id,
            reason_codes,
            properties,
        }))
    }

    fn disconnect(&self, flags: u8, mut body: Cursor<'_>) -> Result<Packet, DecodeError> {
        no_flags(flags, "DISCONNECT")?;
        if body.is_empty() {
            return Ok(Packet::Disconnect(Disconnect::default()));
        }
        if !self.is_v5() {
            return Err(DecodeError::Malformed("v3.1.1 DISCONNECT with a body"));
        }

        let code = body.u8()?;
        let reason_code = ReasonCode::from_u8(code).ok_or(DecodeError::BadReasonCode {
            packet: "DISCONNECT",
            code,
        })?;
        let properties = if body.is_empty() {
            Properties::default()
        } else {
            Properties::decode(&mut body)?
        };

        Ok(Packet::Disconnect(Disconnect {
            reason_code,
            properties,
        }))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new(ProtocolVersion::V311)
    }
}
