//! MQTT Codec Tests
//!
//! Byte-level checks for the packets a client writes and the packets a
//! server may send back, for v3.1.1 and v5.0.

use bytes::{Bytes, BytesMut};
use pretty_assertions::assert_eq;

use crate::codec::{frame_length, Decoder, Encoder};
use crate::protocol::{
    ConnAck, Connect, DecodeError, Disconnect, EncodeError, Packet, Properties, ProtocolVersion,
    PubAck, Publish, QoS, ReasonCode, SubAck, Subscribe, Subscription,
};

fn encode_packet(packet: &Packet, version: ProtocolVersion) -> BytesMut {
    let encoder = Encoder::new(version);
    let mut buf = BytesMut::new();
    encoder.encode(packet, &mut buf).unwrap();
    buf
}

fn decode_packet(buf: &[u8], version: ProtocolVersion) -> Result<Packet, DecodeError> {
    let decoded = Decoder::new(version).decode(buf)?;
    Ok(decoded.expect("complete packet").0)
}

fn subscribe_packet() -> Packet {
    Packet::Subscribe(Subscribe {
        packet_id: 1,
        subscriptions: vec![
            Subscription {
                filter: "a".to_string(),
                qos: QoS::AtMostOnce,
            },
            Subscription {
                filter: "b/c".to_string(),
                qos: QoS::AtLeastOnce,
            },
        ],
    })
}

// ============================================================================
// Encoding (client -> server)
// ============================================================================

#[test]
fn test_connect_v311_with_credentials() {
    let packet = Packet::Connect(Box::new(Connect {
        protocol_version: ProtocolVersion::V311,
        client_id: "bridge1".to_string(),
        clean_start: false,
        keep_alive: 60,
        username: Some("user".to_string()),
        password: Some(Bytes::from("pw")),
        properties: Properties::default(),
    }));

    let mut expected = vec![0x10, 0x1D, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0xC0, 0x00, 0x3C];
    expected.extend_from_slice(&[0x00, 0x07]);
    expected.extend_from_slice(b"bridge1");
    expected.extend_from_slice(&[0x00, 0x04]);
    expected.extend_from_slice(b"user");
    expected.extend_from_slice(&[0x00, 0x02]);
    expected.extend_from_slice(b"pw");

    assert_eq!(&encode_packet(&packet, ProtocolVersion::V311)[..], &expected[..]);
}

#[test]
fn test_connect_v5_with_session_expiry() {
    let packet = Packet::Connect(Box::new(Connect {
        protocol_version: ProtocolVersion::V5,
        client_id: "c".to_string(),
        clean_start: false,
        keep_alive: 30,
        properties: Properties {
            session_expiry_interval: Some(3600),
            ..Default::default()
        },
        ..Default::default()
    }));

    let expected = [
        0x10, 0x13, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x05, 0x00, 0x00, 0x1E, 0x05, 0x11, 0x00,
        0x00, 0x0E, 0x10, 0x00, 0x01, b'c',
    ];
    assert_eq!(&encode_packet(&packet, ProtocolVersion::V5)[..], &expected[..]);
}

#[test]
fn test_connect_clean_start_flag() {
    let packet = Packet::Connect(Box::new(Connect {
        client_id: "x".to_string(),
        clean_start: true,
        ..Default::default()
    }));
    let encoded = encode_packet(&packet, ProtocolVersion::V311);
    assert_eq!(encoded[9], 0x02);
}

#[test]
fn test_subscribe_v311_multiple_topics() {
    let expected = [
        0x82, 0x0C, 0x00, 0x01, 0x00, 0x01, b'a', 0x00, 0x00, 0x03, b'b', b'/', b'c', 0x01,
    ];
    assert_eq!(
        &encode_packet(&subscribe_packet(), ProtocolVersion::V311)[..],
        &expected[..]
    );
}

#[test]
fn test_subscribe_v5_has_empty_property_block() {
    let expected = [
        0x82, 0x0D, 0x00, 0x01, 0x00, 0x00, 0x01, b'a', 0x00, 0x00, 0x03, b'b', b'/', b'c', 0x01,
    ];
    assert_eq!(
        &encode_packet(&subscribe_packet(), ProtocolVersion::V5)[..],
        &expected[..]
    );
}

#[test]
fn test_subscribe_requires_a_topic() {
    let packet = Packet::Subscribe(Subscribe {
        packet_id: 1,
        subscriptions: Vec::new(),
    });
    let mut buf = BytesMut::new();
    let result = Encoder::new(ProtocolVersion::V311).encode(&packet, &mut buf);
    assert_eq!(result, Err(EncodeError::EmptySubscribe));
}

#[test]
fn test_small_client_packets() {
    assert_eq!(
        &encode_packet(&Packet::PubAck(PubAck::new(7)), ProtocolVersion::V311)[..],
        &[0x40, 0x02, 0x00, 0x07]
    );
    assert_eq!(
        &encode_packet(&Packet::PingReq, ProtocolVersion::V5)[..],
        &[0xC0, 0x00]
    );
    assert_eq!(
        &encode_packet(
            &Packet::Disconnect(Disconnect::default()),
            ProtocolVersion::V5
        )[..],
        &[0xE0, 0x00]
    );
}

#[test]
fn test_server_packets_are_not_encoded() {
    let mut buf = BytesMut::new();
    let result = Encoder::default().encode(&Packet::PingResp, &mut buf);
    assert_eq!(result, Err(EncodeError::NotSentByClient("PINGRESP")));
}

// ============================================================================
// Decoding (server -> client)
// ============================================================================

#[test]
fn test_connack_v311() {
    let packet = decode_packet(&[0x20, 0x02, 0x01, 0x00], ProtocolVersion::V311).unwrap();
    assert_eq!(
        packet,
        Packet::ConnAck(ConnAck {
            session_present: true,
            reason_code: ReasonCode::Success,
            properties: Properties::default(),
        })
    );

    let refused = decode_packet(&[0x20, 0x02, 0x00, 0x05], ProtocolVersion::V311).unwrap();
    match refused {
        Packet::ConnAck(ack) => assert_eq!(ack.reason_code, ReasonCode::NotAuthorized),
        other => panic!("expected CONNACK, got {:?}", other),
    }
}

#[test]
fn test_connack_v5_with_server_keep_alive() {
    let buf = [0x20, 0x06, 0x00, 0x00, 0x03, 0x13, 0x00, 0x1E];
    match decode_packet(&buf, ProtocolVersion::V5).unwrap() {
        Packet::ConnAck(ack) => {
            assert!(!ack.session_present);
            assert_eq!(ack.properties.server_keep_alive, Some(30));
        }
        other => panic!("expected CONNACK, got {:?}", other),
    }
}

#[test]
fn test_connack_reserved_flags_rejected() {
    let result = decode_packet(&[0x20, 0x02, 0x02, 0x00], ProtocolVersion::V311);
    assert_eq!(result, Err(DecodeError::BadFlags("CONNACK")));
}

#[test]
fn test_publish_qos0_v311() {
    let packet = decode_packet(&[0x30, 0x04, 0x00, 0x01, b'a', b'x'], ProtocolVersion::V311)
        .unwrap();
    assert_eq!(
        packet,
        Packet::Publish(Publish {
            topic: "a".to_string(),
            payload: Bytes::from_static(b"x"),
            ..Default::default()
        })
    );
}

#[test]
fn test_publish_qos1_binary_payload() {
    let buf = [0x32, 0x07, 0x00, 0x01, b't', 0x00, 0x05, 0xFF, 0xFE];
    match decode_packet(&buf, ProtocolVersion::V311).unwrap() {
        Packet::Publish(publish) => {
            assert_eq!(publish.qos, QoS::AtLeastOnce);
            assert_eq!(publish.packet_id, Some(5));
            assert_eq!(&publish.payload[..], &[0xFF, 0xFE]);
        }
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}

#[test]
fn test_publish_v5_skips_properties() {
    let buf = [0x30, 0x05, 0x00, 0x01, b'a', 0x00, b'x'];
    match decode_packet(&buf, ProtocolVersion::V5).unwrap() {
        Packet::Publish(publish) => assert_eq!(&publish.payload[..], b"x"),
        other => panic!("expected PUBLISH, got {:?}", other),
    }
}

#[test]
fn test_publish_qos0_with_dup_rejected() {
    let result = decode_packet(&[0x38, 0x03, 0x00, 0x01, b'a'], ProtocolVersion::V311);
    assert_eq!(
        result,
        Err(DecodeError::Malformed("DUP set on a QoS 0 PUBLISH"))
    );
}

#[test]
fn test_suback_v311_with_failure() {
    let packet = decode_packet(&[0x90, 0x04, 0x00, 0x01, 0x00, 0x80], ProtocolVersion::V311)
        .unwrap();
    let suback = match packet {
        Packet::SubAck(suback) => suback,
        other => panic!("expected SUBACK, got {:?}", other),
    };
    assert_eq!(
        suback.reason_codes,
        vec![ReasonCode::Success, ReasonCode::UnspecifiedError]
    );
    assert_eq!(
        suback.first_failure(),
        Some((1, ReasonCode::UnspecifiedError))
    );
}

#[test]
fn test_publish_qos3_rejected() {
    let result = decode_packet(&[0x36, 0x05, 0x00, 0x01, b'a', 0x00, 0x01], ProtocolVersion::V311);
    assert_eq!(result, Err(DecodeError::BadQoS(3)));
}

#[test]
fn test_publish_zero_packet_id_rejected() {
    let result = decode_packet(&[0x32, 0x05, 0x00, 0x01, b'a', 0x00, 0x00], ProtocolVersion::V311);
    assert_eq!(result, Err(DecodeError::Malformed("PUBLISH with packet id 0")));
}

#[test]
fn test_topic_with_nul_rejected() {
    let result = decode_packet(&[0x30, 0x04, 0x00, 0x02, b'a', 0x00], ProtocolVersion::V311);
    assert_eq!(result, Err(DecodeError::BadString));
}

#[test]
fn test_suback_without_codes_rejected() {
    let result = decode_packet(&[0x90, 0x02, 0x00, 0x01], ProtocolVersion::V311);
    assert_eq!(result, Err(DecodeError::Malformed("SUBACK without reason codes")));
}

#[test]
fn test_suback_unknown_v311_code() {
    let result = decode_packet(&[0x90, 0x03, 0x00, 0x01, 0x05], ProtocolVersion::V311);
    assert_eq!(
        result,
        Err(DecodeError::BadReasonCode {
            packet: "SUBACK",
            code: 0x05
        })
    );
}

#[test]
fn test_suback_v5() {
    let packet =
        decode_packet(&[0x90, 0x04, 0x00, 0x02, 0x00, 0x01], ProtocolVersion::V5).unwrap();
    assert_eq!(
        packet,
        Packet::SubAck(SubAck {
            packet_id: 2,
            reason_codes: vec![ReasonCode::GrantedQoS1],
            properties: Properties::default(),
        })
    );
}

#[test]
fn test_v5_disconnect_from_server() {
    let packet = decode_packet(&[0xE0, 0x01, 0x8B], ProtocolVersion::V5).unwrap();
    match packet {
        Packet::Disconnect(d) => assert_eq!(d.reason_code, ReasonCode::ServerShuttingDown),
        other => panic!("expected DISCONNECT, got {:?}", other),
    }
}

// ============================================================================
// Framing
// ============================================================================

#[test]
fn test_incomplete_packet_needs_more_data() {
    let decoder = Decoder::new(ProtocolVersion::V311);
    assert_eq!(decoder.decode(&[0x30]).unwrap(), None);
    assert_eq!(decoder.decode(&[0x30, 0x04, 0x00]).unwrap(), None);
}

#[test]
fn test_consumes_one_packet_at_a_time() {
    let buf = [0xD0, 0x00, 0x20, 0x02, 0x00, 0x00];
    let decoder = Decoder::new(ProtocolVersion::V311);

    let (first, used) = decoder.decode(&buf).unwrap().unwrap();
    assert_eq!(first, Packet::PingResp);
    assert_eq!(used, 2);

    let (second, used) = decoder.decode(&buf[used..]).unwrap().unwrap();
    assert!(matches!(second, Packet::ConnAck(_)));
    assert_eq!(used, 4);
}

#[test]
fn test_client_only_packets_rejected() {
    let result = decode_packet(&[0x10, 0x00], ProtocolVersion::V311);
    assert_eq!(result, Err(DecodeError::NotForClient(1)));
}

#[test]
fn test_packet_size_limit() {
    let decoder = Decoder::new(ProtocolVersion::V311).with_max_packet_size(4);
    let result = decoder.decode(&[0x30, 0x05, 0x00]);
    assert_eq!(result, Err(DecodeError::TooLarge { size: 5, limit: 4 }));
}

#[test]
fn test_invalid_remaining_length() {
    let decoder = Decoder::new(ProtocolVersion::V311);
    let result = decoder.decode(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF]);
    assert_eq!(result, Err(DecodeError::BadLength));
}

#[test]
fn test_short_body_is_truncated() {
    let result = decode_packet(&[0x20, 0x01, 0x00], ProtocolVersion::V311);
    assert_eq!(result, Err(DecodeError::Truncated("CONNACK")));
}

#[test]
fn test_frame_length() {
    assert_eq!(frame_length(&[]), Ok(None));
    assert_eq!(frame_length(&[0x30]), Ok(None));
    assert_eq!(frame_length(&[0xD0, 0x00]), Ok(Some(2)));
    // 200-byte body needs a two-byte length
    assert_eq!(frame_length(&[0x30, 0xC8, 0x01]), Ok(Some(203)));
    assert_eq!(frame_length(&[0x30, 0xFF, 0xFF, 0xFF, 0xFF]), Err(DecodeError::BadLength));
}
