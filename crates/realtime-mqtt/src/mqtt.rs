//! MQTT 3.1.1 packet framing (MQTToT flavour).
//!
//! ## Wire Format
//!
//! ```text
//! [1-byte type|flags][1-4 byte remaining length][variable header][payload]
//! ```
//!
//! MQTToT differs from stock MQTT only in the CONNECT payload: instead of the
//! client-id/username/password strings it carries one opaque compressed
//! identity blob, and the CONNACK may carry trailing bytes.
//!
//! | Type | Direction | Name       | Body |
//! |------|-----------|------------|------|
//! | 1    | C→S       | CONNECT    | `[2B len][name][1B level][1B flags][2B keepalive][payload]` |
//! | 2    | S→C       | CONNACK    | `[1B ack flags][1B return code][payload]` |
//! | 3    | both      | PUBLISH    | `[2B len][topic][2B packet id if qos>0][payload]` |
//! | 4    | both      | PUBACK     | `[2B packet id]` |
//! | 12   | C→S       | PINGREQ    | (empty) |
//! | 13   | S→C       | PINGRESP   | (empty) |
//! | 14   | C→S       | DISCONNECT | (empty) |

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Protocol name sent in CONNECT.
pub const PROTOCOL_NAME: &str = "MQTToT";

/// Protocol level sent in CONNECT.
pub const PROTOCOL_LEVEL: u8 = 3;

/// Largest remaining length the codec accepts (the MQTT maximum).
pub const MAX_PACKET_SIZE: usize = 268_435_455;

// Packet type constants (upper nibble of the first byte).
pub const CONNECT: u8 = 1;
pub const CONNACK: u8 = 2;
pub const PUBLISH: u8 = 3;
pub const PUBACK: u8 = 4;
pub const PINGREQ: u8 = 12;
pub const PINGRESP: u8 = 13;
pub const DISCONNECT: u8 = 14;

pub mod connect_flags {
    pub const CLEAN_SESSION: u8 = 0x02;
    pub const PASSWORD: u8 = 0x40;
    pub const USERNAME: u8 = 0x80;
}

pub mod connack {
    pub const ACCEPTED: u8 = 0;
    pub const UNACCEPTABLE_PROTOCOL: u8 = 1;
    pub const IDENTIFIER_REJECTED: u8 = 2;
    pub const SERVER_UNAVAILABLE: u8 = 3;
    pub const BAD_CREDENTIALS: u8 = 4;
    pub const NOT_AUTHORIZED: u8 = 5;

    /// Human-readable reason for a CONNACK return code.
    pub fn describe(code: u8) -> &'static str {
        match code {
            ACCEPTED => "accepted",
            UNACCEPTABLE_PROTOCOL => "unacceptable protocol version",
            IDENTIFIER_REJECTED => "identifier rejected",
            SERVER_UNAVAILABLE => "server unavailable",
            BAD_CREDENTIALS => "bad user name or password",
            NOT_AUTHORIZED => "not authorized",
            _ => "unknown return code",
        }
    }
}

/// Errors raised while framing packets.
#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed packet: {0}")]
    Malformed(&'static str),

    #[error("unsupported packet type: {0}")]
    UnsupportedPacket(u8),

    #[error("packet too large: {0} bytes")]
    TooLarge(usize),
}

/// Delivery assurance for a PUBLISH. Exactly-once is not used by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QoS {
    #[default]
    AtMostOnce,
    AtLeastOnce,
}

impl QoS {
    pub const fn level(self) -> u8 {
        match self {
            QoS::AtMostOnce => 0,
            QoS::AtLeastOnce => 1,
        }
    }

    fn from_level(level: u8) -> Result<Self, MqttError> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            _ => Err(MqttError::Malformed("unsupported qos level")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    pub protocol_name: String,
    pub protocol_level: u8,
    pub flags: u8,
    pub keep_alive: u16,
    pub payload: Bytes,
}

impl Connect {
    /// A clean-session MQTToT CONNECT carrying an already-compressed identity.
    pub fn mqttot(keep_alive: u16, payload: impl Into<Bytes>) -> Self {
        Self {
            protocol_name: PROTOCOL_NAME.to_string(),
            protocol_level: PROTOCOL_LEVEL,
            flags: connect_flags::USERNAME | connect_flags::PASSWORD | connect_flags::CLEAN_SESSION,
            keep_alive,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub return_code: u8,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publish {
    pub topic: String,
    pub qos: QoS,
    pub packet_id: Option<u16>,
    pub retain: bool,
    pub dup: bool,
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck { packet_id: u16 },
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet {
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck(_) => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck { .. } => "PUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}

// ---------------------------------------------------------------------------
// Field readers
// ---------------------------------------------------------------------------

fn take_u8(buf: &mut Bytes) -> Result<u8, MqttError> {
    if buf.remaining() < 1 {
        return Err(MqttError::Malformed("truncated u8"));
    }
    Ok(buf.get_u8())
}

fn take_u16(buf: &mut Bytes) -> Result<u16, MqttError> {
    if buf.remaining() < 2 {
        return Err(MqttError::Malformed("truncated u16"));
    }
    Ok(buf.get_u16())
}

fn take_str(buf: &mut Bytes) -> Result<String, MqttError> {
    let len = take_u16(buf)? as usize;
    if buf.remaining() < len {
        return Err(MqttError::Malformed("truncated string"));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| MqttError::Malformed("string is not utf-8"))
}

fn put_str(buf: &mut BytesMut, s: &str) -> Result<(), MqttError> {
    let len = u16::try_from(s.len()).map_err(|_| MqttError::TooLarge(s.len()))?;
    buf.put_u16(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_remaining_length(buf: &mut BytesMut, mut len: usize) {
    loop {
        let mut byte = (len % 128) as u8;
        len /= 128;
        if len > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        if len == 0 {
            break;
        }
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

/// Stateless MQTT framer for `tokio_util::codec::Framed`.
#[derive(Debug, Clone)]
pub struct MqttCodec {
    max_packet_size: usize,
}

impl Default for MqttCodec {
    fn default() -> Self {
        Self {
            max_packet_size: MAX_PACKET_SIZE,
        }
    }
}

impl MqttCodec {
    pub fn with_max_packet_size(max_packet_size: usize) -> Self {
        Self {
            max_packet_size: max_packet_size.min(MAX_PACKET_SIZE),
        }
    }
}

fn decode_body(first: u8, mut body: Bytes) -> Result<Packet, MqttError> {
    let packet_type = first >> 4;
    let flags = first & 0x0f;
    match packet_type {
        CONNECT => {
            let protocol_name = take_str(&mut body)?;
            let protocol_level = take_u8(&mut body)?;
            let flags = take_u8(&mut body)?;
            let keep_alive = take_u16(&mut body)?;
            Ok(Packet::Connect(Connect {
                protocol_name,
                protocol_level,
                flags,
                keep_alive,
                payload: body,
            }))
        }
        CONNACK => {
            let ack_flags = take_u8(&mut body)?;
            let return_code = take_u8(&mut body)?;
            Ok(Packet::ConnAck(ConnAck {
                session_present: ack_flags & 0x01 != 0,
                return_code,
                payload: body,
            }))
        }
        PUBLISH => {
            let qos = QoS::from_level((flags >> 1) & 0x03)?;
            let topic = take_str(&mut body)?;
            let packet_id = match qos {
                QoS::AtMostOnce => None,
                QoS::AtLeastOnce => Some(take_u16(&mut body)?),
            };
            Ok(Packet::Publish(Publish {
                topic,
                qos,
                packet_id,
                retain: flags & 0x01 != 0,
                dup: flags & 0x08 != 0,
                payload: body,
            }))
        }
        PUBACK => Ok(Packet::PubAck {
            packet_id: take_u16(&mut body)?,
        }),
        PINGREQ => Ok(Packet::PingReq),
        PINGRESP => Ok(Packet::PingResp),
        DISCONNECT => Ok(Packet::Disconnect),
        other => Err(MqttError::UnsupportedPacket(other)),
    }
}

impl Decoder for MqttCodec {
    type Item = Packet;
    type Error = MqttError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, MqttError> {
        let Some(&first) = src.first() else {
            return Ok(None);
        };

        let mut len: usize = 0;
        let mut multiplier: usize = 1;
        let mut pos = 1;
        loop {
            let Some(&byte) = src.get(pos) else {
                return Ok(None);
            };
            len += usize::from(byte & 0x7f) * multiplier;
            pos += 1;
            if byte & 0x80 == 0 {
                break;
            }
            if pos > 4 {
                return Err(MqttError::Malformed("remaining length exceeds four bytes"));
            }
            multiplier *= 128;
        }

        if len > self.max_packet_size {
            return Err(MqttError::TooLarge(len));
        }
        if src.len() < pos + len {
            src.reserve(pos + len - src.len());
            return Ok(None);
        }

        src.advance(pos);
        let body = src.split_to(len).freeze();
        decode_body(first, body).map(Some)
    }
}

impl Encoder<Packet> for MqttCodec {
    type Error = MqttError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), MqttError> {
        let mut body = BytesMut::new();
        let first = match packet {
            Packet::Connect(c) => {
                put_str(&mut body, &c.protocol_name)?;
                body.put_u8(c.protocol_level);
                body.put_u8(c.flags);
                body.put_u16(c.keep_alive);
                body.put_slice(&c.payload);
                CONNECT << 4
            }
            Packet::ConnAck(a) => {
                body.put_u8(u8::from(a.session_present));
                body.put_u8(a.return_code);
                body.put_slice(&a.payload);
                CONNACK << 4
            }
            Packet::Publish(p) => {
                put_str(&mut body, &p.topic)?;
                match (p.qos, p.packet_id) {
                    (QoS::AtMostOnce, _) => {}
                    (QoS::AtLeastOnce, Some(id)) => body.put_u16(id),
                    (QoS::AtLeastOnce, None) => {
                        return Err(MqttError::Malformed("qos 1 publish without packet id"));
                    }
                }
                body.put_slice(&p.payload);
                let mut flags = p.qos.level() << 1;
                if p.retain {
                    flags |= 0x01;
                }
                if p.dup {
                    flags |= 0x08;
                }
                (PUBLISH << 4) | flags
            }
            Packet::PubAck { packet_id } => {
                body.put_u16(packet_id);
                PUBACK << 4
            }
            Packet::PingReq => PINGREQ << 4,
            Packet::PingResp => PINGRESP << 4,
            Packet::Disconnect => DISCONNECT << 4,
        };

        if body.len() > self.max_packet_size {
            return Err(MqttError::TooLarge(body.len()));
        }
        dst.reserve(body.len() + 5);
        dst.put_u8(first);
        put_remaining_length(dst, body.len());
        dst.put_slice(&body);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(packet: Packet) -> BytesMut {
        let mut buf = BytesMut::new();
        MqttCodec::default().encode(packet, &mut buf).unwrap();
        buf
    }

    #[test]
    fn pingreq_bytes() {
        assert_eq!(&encode(Packet::PingReq)[..], &[0xc0, 0x00]);
        assert_eq!(&encode(Packet::Disconnect)[..], &[0xe0, 0x00]);
    }

    #[test]
    fn publish_qos1_layout() {
        let buf = encode(Packet::Publish(Publish {
            topic: "132".into(),
            qos: QoS::AtLeastOnce,
            packet_id: Some(7),
            retain: false,
            dup: false,
            payload: Bytes::from_static(b"xy"),
        }));
        assert_eq!(
            &buf[..],
            &[0x32, 9, 0x00, 0x03, b'1', b'3', b'2', 0x00, 0x07, b'x', b'y']
        );
    }

    #[test]
    fn connect_layout_and_decode() {
        let mut buf = encode(Packet::Connect(Connect::mqttot(60, vec![1u8, 2, 3])));
        assert_eq!(buf.first(), Some(&0x10));
        let decoded = MqttCodec::default().decode(&mut buf).unwrap().unwrap();
        match decoded {
            Packet::Connect(c) => {
                assert_eq!(c.protocol_name, "MQTToT");
                assert_eq!(c.protocol_level, 3);
                assert_eq!(c.flags, 0xc2);
                assert_eq!(c.keep_alive, 60);
                assert_eq!(&c.payload[..], &[1, 2, 3]);
            }
            other => panic!("expected Connect, got {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frames_wait_for_more() {
        let full = encode(Packet::PubAck { packet_id: 513 });
        let mut codec = MqttCodec::default();
        let mut buf = BytesMut::from(&full[..1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[1..3]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(&full[3..]);
        assert_eq!(
            codec.decode(&mut buf).unwrap(),
            Some(Packet::PubAck { packet_id: 513 })
        );
    }

    #[test]
    fn multi_byte_remaining_length() {
        let payload = Bytes::from(vec![0xab; 300]);
        let buf = encode(Packet::Publish(Publish {
            topic: "88".into(),
            qos: QoS::AtMostOnce,
            packet_id: None,
            retain: false,
            dup: false,
            payload: payload.clone(),
        }));
        // 2 + 2 + 300 = 304 = 0xb0 0x02
        assert_eq!(&buf[1..3], &[0xb0, 0x02]);
        let mut buf = buf;
        match MqttCodec::default().decode(&mut buf).unwrap() {
            Some(Packet::Publish(p)) => {
                assert_eq!(p.topic, "88");
                assert_eq!(p.payload, payload);
                assert_eq!(p.packet_id, None);
            }
            other => panic!("expected Publish, got {other:?}"),
        }
    }

    #[test]
    fn two_packets_in_one_buffer() {
        let mut buf = encode(Packet::PingResp);
        buf.extend_from_slice(&encode(Packet::ConnAck(ConnAck {
            session_present: false,
            return_code: connack::ACCEPTED,
            payload: Bytes::new(),
        })));
        let mut codec = MqttCodec::default();
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Packet::PingResp));
        assert!(matches!(
            codec.decode(&mut buf).unwrap(),
            Some(Packet::ConnAck(ConnAck { return_code: 0, .. }))
        ));
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn overlong_remaining_length_rejected() {
        let mut buf = BytesMut::from(&[0x30u8, 0xff, 0xff, 0xff, 0xff, 0x01][..]);
        assert!(matches!(
            MqttCodec::default().decode(&mut buf),
            Err(MqttError::Malformed(_))
        ));
    }

    #[test]
    fn max_packet_size_enforced() {
        let mut buf = encode(Packet::Publish(Publish {
            topic: "9".into(),
            qos: QoS::AtMostOnce,
            packet_id: None,
            retain: false,
            dup: false,
            payload: Bytes::from(vec![0u8; 64]),
        }));
        let mut codec = MqttCodec::with_max_packet_size(16);
        assert!(matches!(codec.decode(&mut buf), Err(MqttError::TooLarge(67))));
    }

    #[test]
    fn qos2_and_unknown_types_rejected() {
        let mut buf = BytesMut::from(&[0x34u8, 0x03, 0x00, 0x01, b'a'][..]);
        assert!(matches!(
            MqttCodec::default().decode(&mut buf),
            Err(MqttError::Malformed(_))
        ));
        let mut buf = BytesMut::from(&[0x80u8, 0x00][..]);
        assert!(matches!(
            MqttCodec::default().decode(&mut buf),
            Err(MqttError::UnsupportedPacket(8))
        ));
    }

    #[test]
    fn connack_describe() {
        assert_eq!(connack::describe(connack::NOT_AUTHORIZED), "not authorized");
        assert_eq!(connack::describe(42), "unknown return code");
    }
}
