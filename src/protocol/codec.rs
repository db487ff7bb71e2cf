//! MQTT 3.1.1 control packet encoding and decoding
//!
//! Encoders write into caller-owned slices and return the number of bytes
//! written. Decoders borrow from the receive buffer, so a decoded
//! [`Packet`] is only valid until the buffer is compacted.
//!
//! Stream framing and packet decoding are separate steps: [`frame_length`]
//! tells the caller whether a complete frame is buffered, [`decode_packet`]
//! interprets one complete frame. A framing error means the byte stream can
//! no longer be trusted; a decode error only invalidates that one frame.

use thiserror::Error;

/// Largest value representable by the four-byte remaining-length varint.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Return code carried in a SUBACK entry when the broker rejects a filter.
pub const SUBACK_FAILURE: u8 = 0x80;

const PROTOCOL_NAME: &str = "MQTT";
const PROTOCOL_LEVEL_3_1_1: u8 = 4;

const CONNECT: u8 = 1;
const CONNACK: u8 = 2;
const PUBLISH: u8 = 3;
const PUBACK: u8 = 4;
const SUBSCRIBE: u8 = 8;
const SUBACK: u8 = 9;
const UNSUBSCRIBE: u8 = 10;
const UNSUBACK: u8 = 11;
const PINGREQ: u8 = 12;
const PINGRESP: u8 = 13;
const DISCONNECT: u8 = 14;

/// Codec failures
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    #[error("buffer too small: need {needed} bytes, have {available}")]
    BufferTooSmall { needed: usize, available: usize },
    #[error("malformed packet: {0}")]
    MalformedPacket(&'static str),
    #[error("invalid packet type {0}")]
    InvalidPacketType(u8),
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("string or payload exceeds protocol limits")]
    PayloadTooLarge,
    #[error("invalid QoS value {0}")]
    InvalidQos(u8),
}

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum QoS {
    AtMostOnce = 0,
    AtLeastOnce = 1,
    ExactlyOnce = 2,
}

impl QoS {
    pub fn from_u8(value: u8) -> Result<Self, CodecError> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(CodecError::InvalidQos(other)),
        }
    }
}

/// Last will message registered with CONNECT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastWill<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub qos: QoS,
    pub retain: bool,
}

/// Fields of a CONNECT packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectInfo<'a> {
    pub client_id: &'a str,
    pub keep_alive_secs: u16,
    pub clean_session: bool,
    pub username: Option<&'a str>,
    pub password: Option<&'a [u8]>,
    pub will: Option<LastWill<'a>>,
}

/// A PUBLISH, either about to be sent or just received.
///
/// `packet_id` is `None` for QoS 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishInfo<'a> {
    pub topic: &'a str,
    pub payload: &'a [u8],
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub packet_id: Option<u16>,
}

/// One topic filter of a SUBSCRIBE
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscribeInfo<'a> {
    pub filter: &'a str,
    pub qos: QoS,
}

/// A decoded control packet borrowing from the receive buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet<'a> {
    Connect(ConnectInfo<'a>),
    ConnAck {
        session_present: bool,
        return_code: u8,
    },
    Publish(PublishInfo<'a>),
    PubAck {
        packet_id: u16,
    },
    Subscribe {
        packet_id: u16,
        filters: Vec<SubscribeInfo<'a>>,
    },
    SubAck {
        packet_id: u16,
        return_codes: &'a [u8],
    },
    Unsubscribe {
        packet_id: u16,
        filters: Vec<&'a str>,
    },
    UnsubAck {
        packet_id: u16,
    },
    PingReq,
    PingResp,
    Disconnect,
}

impl Packet<'_> {
    /// Short name used in log lines
    pub fn name(&self) -> &'static str {
        match self {
            Packet::Connect(_) => "CONNECT",
            Packet::ConnAck { .. } => "CONNACK",
            Packet::Publish(_) => "PUBLISH",
            Packet::PubAck { .. } => "PUBACK",
            Packet::Subscribe { .. } => "SUBSCRIBE",
            Packet::SubAck { .. } => "SUBACK",
            Packet::Unsubscribe { .. } => "UNSUBSCRIBE",
            Packet::UnsubAck { .. } => "UNSUBACK",
            Packet::PingReq => "PINGREQ",
            Packet::PingResp => "PINGRESP",
            Packet::Disconnect => "DISCONNECT",
        }
    }
}

// --- Cursor helpers ---

struct Writer<'b> {
    buf: &'b mut [u8],
    pos: usize,
}

impl<'b> Writer<'b> {
    /// Start a packet, checking up front that the whole frame fits.
    fn start(buf: &'b mut [u8], header: u8, remaining: usize) -> Result<Self, CodecError> {
        if remaining > MAX_REMAINING_LENGTH {
            return Err(CodecError::PayloadTooLarge);
        }
        let needed = 1 + varint_len(remaining) + remaining;
        if buf.len() < needed {
            return Err(CodecError::BufferTooSmall {
                needed,
                available: buf.len(),
            });
        }
        let mut writer = Writer { buf, pos: 0 };
        writer.put_u8(header);
        writer.put_varint(remaining);
        Ok(writer)
    }

    fn put_u8(&mut self, value: u8) {
        self.buf[self.pos] = value;
        self.pos += 1;
    }

    fn put_u16(&mut self, value: u16) {
        self.put_slice(&value.to_be_bytes());
    }

    fn put_slice(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    /// Length-prefixed string or binary field. Lengths were checked by
    /// `prefixed_len` before the frame was sized.
    fn put_prefixed(&mut self, bytes: &[u8]) {
        self.put_u16(bytes.len() as u16);
        self.put_slice(bytes);
    }

    fn put_varint(&mut self, mut value: usize) {
        loop {
            let mut byte = (value % 128) as u8;
            value /= 128;
            if value > 0 {
                byte |= 0x80;
            }
            self.put_u8(byte);
            if value == 0 {
                break;
            }
        }
    }

    fn finish(self) -> usize {
        self.pos
    }
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        let value = *self
            .buf
            .get(self.pos)
            .ok_or(CodecError::MalformedPacket("unexpected end of packet"))?;
        self.pos += 1;
        Ok(value)
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let bytes = self.bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(CodecError::MalformedPacket("field overruns packet"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn prefixed(&mut self) -> Result<&'a [u8], CodecError> {
        let len = self.u16()? as usize;
        self.bytes(len)
    }

    fn str(&mut self) -> Result<&'a str, CodecError> {
        std::str::from_utf8(self.prefixed()?).map_err(|_| CodecError::InvalidUtf8)
    }

    fn packet_id(&mut self) -> Result<u16, CodecError> {
        match self.u16()? {
            0 => Err(CodecError::MalformedPacket("packet identifier is zero")),
            id => Ok(id),
        }
    }

    fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }
}

fn varint_len(value: usize) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

fn prefixed_len(bytes: &[u8]) -> Result<usize, CodecError> {
    if bytes.len() > u16::MAX as usize {
        return Err(CodecError::PayloadTooLarge);
    }
    Ok(2 + bytes.len())
}

// --- Client-side encoders ---

pub fn encode_connect(buf: &mut [u8], info: &ConnectInfo<'_>) -> Result<usize, CodecError> {
    if info.password.is_some() && info.username.is_none() {
        return Err(CodecError::MalformedPacket("password requires a username"));
    }

    let mut remaining = prefixed_len(PROTOCOL_NAME.as_bytes())? + 1 + 1 + 2;
    remaining += prefixed_len(info.client_id.as_bytes())?;
    let mut flags = 0u8;
    if info.clean_session {
        flags |= 0x02;
    }
    if let Some(will) = &info.will {
        remaining += prefixed_len(will.topic.as_bytes())? + prefixed_len(will.payload)?;
        flags |= 0x04 | ((will.qos as u8) << 3);
        if will.retain {
            flags |= 0x20;
        }
    }
    if let Some(username) = info.username {
        remaining += prefixed_len(username.as_bytes())?;
        flags |= 0x80;
    }
    if let Some(password) = info.password {
        remaining += prefixed_len(password)?;
        flags |= 0x40;
    }

    let mut w = Writer::start(buf, CONNECT << 4, remaining)?;
    w.put_prefixed(PROTOCOL_NAME.as_bytes());
    w.put_u8(PROTOCOL_LEVEL_3_1_1);
    w.put_u8(flags);
    w.put_u16(info.keep_alive_secs);
    w.put_prefixed(info.client_id.as_bytes());
    if let Some(will) = &info.will {
        w.put_prefixed(will.topic.as_bytes());
        w.put_prefixed(will.payload);
    }
    if let Some(username) = info.username {
        w.put_prefixed(username.as_bytes());
    }
    if let Some(password) = info.password {
        w.put_prefixed(password);
    }
    Ok(w.finish())
}

/// Encode a PUBLISH. QoS > 0 requires `packet_id`.
pub fn encode_publish(buf: &mut [u8], publish: &PublishInfo<'_>) -> Result<usize, CodecError> {
    let packet_id = match (publish.qos, publish.packet_id) {
        (QoS::AtMostOnce, _) => None,
        (_, Some(id)) if id != 0 => Some(id),
        _ => {
            return Err(CodecError::MalformedPacket(
                "QoS > 0 publish needs a non-zero packet identifier",
            ))
        }
    };

    let mut header = (PUBLISH << 4) | ((publish.qos as u8) << 1);
    if publish.dup {
        header |= 0x08;
    }
    if publish.retain {
        header |= 0x01;
    }

    let remaining = prefixed_len(publish.topic.as_bytes())?
        + packet_id.map_or(0, |_| 2)
        + publish.payload.len();

    let mut w = Writer::start(buf, header, remaining)?;
    w.put_prefixed(publish.topic.as_bytes());
    if let Some(id) = packet_id {
        w.put_u16(id);
    }
    w.put_slice(publish.payload);
    Ok(w.finish())
}

pub fn encode_puback(buf: &mut [u8], packet_id: u16) -> Result<usize, CodecError> {
    let mut w = Writer::start(buf, PUBACK << 4, 2)?;
    w.put_u16(packet_id);
    Ok(w.finish())
}

pub fn encode_subscribe(
    buf: &mut [u8],
    packet_id: u16,
    filters: &[SubscribeInfo<'_>],
) -> Result<usize, CodecError> {
    if filters.is_empty() {
        return Err(CodecError::MalformedPacket("SUBSCRIBE needs at least one filter"));
    }
    let mut remaining = 2;
    for info in filters {
        remaining += prefixed_len(info.filter.as_bytes())? + 1;
    }

    let mut w = Writer::start(buf, (SUBSCRIBE << 4) | 0x02, remaining)?;
    w.put_u16(packet_id);
    for info in filters {
        w.put_prefixed(info.filter.as_bytes());
        w.put_u8(info.qos as u8);
    }
    Ok(w.finish())
}

pub fn encode_unsubscribe<S: AsRef<str>>(
    buf: &mut [u8],
    packet_id: u16,
    filters: &[S],
) -> Result<usize, CodecError> {
    if filters.is_empty() {
        return Err(CodecError::MalformedPacket("UNSUBSCRIBE needs at least one filter"));
    }
    let mut remaining = 2;
    for filter in filters {
        remaining += prefixed_len(filter.as_ref().as_bytes())?;
    }

    let mut w = Writer::start(buf, (UNSUBSCRIBE << 4) | 0x02, remaining)?;
    w.put_u16(packet_id);
    for filter in filters {
        w.put_prefixed(filter.as_ref().as_bytes());
    }
    Ok(w.finish())
}

pub fn encode_pingreq(buf: &mut [u8]) -> Result<usize, CodecError> {
    Ok(Writer::start(buf, PINGREQ << 4, 0)?.finish())
}

pub fn encode_disconnect(buf: &mut [u8]) -> Result<usize, CodecError> {
    Ok(Writer::start(buf, DISCONNECT << 4, 0)?.finish())
}

// --- Broker-side encoders (used by the in-memory test broker) ---

pub fn encode_connack(
    buf: &mut [u8],
    session_present: bool,
    return_code: u8,
) -> Result<usize, CodecError> {
    let mut w = Writer::start(buf, CONNACK << 4, 2)?;
    w.put_u8(u8::from(session_present));
    w.put_u8(return_code);
    Ok(w.finish())
}

pub fn encode_suback(
    buf: &mut [u8],
    packet_id: u16,
    return_codes: &[u8],
) -> Result<usize, CodecError> {
    let mut w = Writer::start(buf, SUBACK << 4, 2 + return_codes.len())?;
    w.put_u16(packet_id);
    w.put_slice(return_codes);
    Ok(w.finish())
}

pub fn encode_unsuback(buf: &mut [u8], packet_id: u16) -> Result<usize, CodecError> {
    let mut w = Writer::start(buf, UNSUBACK << 4, 2)?;
    w.put_u16(packet_id);
    Ok(w.finish())
}

pub fn encode_pingresp(buf: &mut [u8]) -> Result<usize, CodecError> {
    Ok(Writer::start(buf, PINGRESP << 4, 0)?.finish())
}

// --- Decoding ---

/// Length of the first frame in `buf`, or `None` if more bytes are needed.
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>, CodecError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let mut multiplier = 1usize;
    let mut remaining = 0usize;
    for index in 0..4 {
        let Some(byte) = buf.get(1 + index) else {
            return Ok(None);
        };
        remaining += (byte & 0x7F) as usize * multiplier;
        if byte & 0x80 == 0 {
            let total = 1 + index + 1 + remaining;
            return Ok((buf.len() >= total).then_some(total));
        }
        multiplier *= 128;
    }
    Err(CodecError::MalformedPacket("remaining length exceeds four bytes"))
}

/// Decode one complete frame as returned by [`frame_length`].
pub fn decode_packet(frame: &[u8]) -> Result<Packet<'_>, CodecError> {
    let mut header = Reader::new(frame);
    let first = header.u8()?;
    // Skip the remaining-length varint; `frame` is exactly one frame.
    while header.u8()? & 0x80 != 0 {}
    let mut r = Reader::new(header.rest());

    let packet_type = first >> 4;
    let flags = first & 0x0F;

    let packet = match packet_type {
        CONNECT => Packet::Connect(decode_connect(&mut r)?),
        CONNACK => {
            let ack_flags = r.u8()?;
            let return_code = r.u8()?;
            Packet::ConnAck {
                session_present: ack_flags & 0x01 != 0,
                return_code,
            }
        }
        PUBLISH => {
            let qos = QoS::from_u8((flags >> 1) & 0x03)?;
            let topic = r.str()?;
            let packet_id = match qos {
                QoS::AtMostOnce => None,
                _ => Some(r.packet_id()?),
            };
            Packet::Publish(PublishInfo {
                topic,
                payload: r.rest(),
                qos,
                retain: flags & 0x01 != 0,
                dup: flags & 0x08 != 0,
                packet_id,
            })
        }
        PUBACK => Packet::PubAck {
            packet_id: r.packet_id()?,
        },
        SUBSCRIBE => {
            expect_flags(flags, 0x02)?;
            let packet_id = r.packet_id()?;
            let mut filters = Vec::new();
            while r.remaining() > 0 {
                let filter = r.str()?;
                let qos = QoS::from_u8(r.u8()?)?;
                filters.push(SubscribeInfo { filter, qos });
            }
            if filters.is_empty() {
                return Err(CodecError::MalformedPacket("SUBSCRIBE without filters"));
            }
            Packet::Subscribe { packet_id, filters }
        }
        SUBACK => {
            let packet_id = r.packet_id()?;
            Packet::SubAck {
                packet_id,
                return_codes: r.rest(),
            }
        }
        UNSUBSCRIBE => {
            expect_flags(flags, 0x02)?;
            let packet_id = r.packet_id()?;
            let mut filters = Vec::new();
            while r.remaining() > 0 {
                filters.push(r.str()?);
            }
            if filters.is_empty() {
                return Err(CodecError::MalformedPacket("UNSUBSCRIBE without filters"));
            }
            Packet::Unsubscribe { packet_id, filters }
        }
        UNSUBACK => Packet::UnsubAck {
            packet_id: r.packet_id()?,
        },
        PINGREQ => Packet::PingReq,
        PINGRESP => Packet::PingResp,
        DISCONNECT => Packet::Disconnect,
        other => return Err(CodecError::InvalidPacketType(other)),
    };

    if r.remaining() != 0 {
        return Err(CodecError::MalformedPacket("trailing bytes after packet"));
    }
    Ok(packet)
}

/// Decode the first complete packet in `buf`.
///
/// Returns `None` while the frame is incomplete, otherwise the packet and
/// the number of bytes it occupied.
pub fn decode_incremental(buf: &[u8]) -> Result<Option<(Packet<'_>, usize)>, CodecError> {
    match frame_length(buf)? {
        Some(len) => Ok(Some((decode_packet(&buf[..len])?, len))),
        None => Ok(None),
    }
}

fn expect_flags(flags: u8, expected: u8) -> Result<(), CodecError> {
    if flags != expected {
        return Err(CodecError::MalformedPacket("reserved header flags"));
    }
    Ok(())
}

fn decode_connect<'a>(r: &mut Reader<'a>) -> Result<ConnectInfo<'a>, CodecError> {
    if r.str()? != PROTOCOL_NAME {
        return Err(CodecError::MalformedPacket("unknown protocol name"));
    }
    if r.u8()? != PROTOCOL_LEVEL_3_1_1 {
        return Err(CodecError::MalformedPacket("unsupported protocol level"));
    }
    let flags = r.u8()?;
    let keep_alive_secs = r.u16()?;
    let client_id = r.str()?;
    let will = if flags & 0x04 != 0 {
        Some(LastWill {
            topic: r.str()?,
            payload: r.prefixed()?,
            qos: QoS::from_u8((flags >> 3) & 0x03)?,
            retain: flags & 0x20 != 0,
        })
    } else {
        None
    };
    let username = if flags & 0x80 != 0 { Some(r.str()?) } else { None };
    let password = if flags & 0x40 != 0 {
        Some(r.prefixed()?)
    } else {
        None
    };
    Ok(ConnectInfo {
        client_id,
        keep_alive_secs,
        clean_session: flags & 0x02 != 0,
        username,
        password,
        will,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_layout() {
        let mut buf = [0u8; 64];
        let info = ConnectInfo {
            client_id: "dev1",
            keep_alive_secs: 60,
            clean_session: true,
            username: None,
            password: None,
            will: None,
        };
        let len = encode_connect(&mut buf, &info).unwrap();

        assert_eq!(
            &buf[..len],
            &[
                0x10, 16, 0, 4, b'M', b'Q', b'T', b'T', 4, 0x02, 0, 60, 0, 4, b'd', b'e', b'v',
                b'1'
            ]
        );
    }

    #[test]
    fn test_connect_with_credentials_decodes() {
        let mut buf = [0u8; 128];
        let info = ConnectInfo {
            client_id: "device",
            keep_alive_secs: 30,
            clean_session: false,
            username: Some("user?SDK=rust"),
            password: Some(b"pw"),
            will: Some(LastWill {
                topic: "status/device",
                payload: b"offline",
                qos: QoS::AtLeastOnce,
                retain: true,
            }),
        };
        let len = encode_connect(&mut buf, &info).unwrap();

        let (packet, used) = decode_incremental(&buf[..len]).unwrap().unwrap();
        assert_eq!(used, len);
        assert_eq!(packet, Packet::Connect(info));
    }

    #[test]
    fn test_password_without_username_rejected() {
        let mut buf = [0u8; 64];
        let info = ConnectInfo {
            client_id: "x",
            keep_alive_secs: 0,
            clean_session: true,
            username: None,
            password: Some(b"secret"),
            will: None,
        };
        assert!(matches!(
            encode_connect(&mut buf, &info),
            Err(CodecError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_publish_flags_and_packet_id() {
        let mut buf = [0u8; 64];
        let publish = PublishInfo {
            topic: "a/b",
            payload: b"hi",
            qos: QoS::AtLeastOnce,
            retain: true,
            dup: true,
            packet_id: Some(0x0102),
        };
        let len = encode_publish(&mut buf, &publish).unwrap();

        assert_eq!(
            &buf[..len],
            &[0x3B, 9, 0, 3, b'a', b'/', b'b', 0x01, 0x02, b'h', b'i']
        );
        assert_eq!(decode_packet(&buf[..len]).unwrap(), Packet::Publish(publish));
    }

    #[test]
    fn test_qos1_publish_requires_packet_id() {
        let mut buf = [0u8; 32];
        let publish = PublishInfo {
            topic: "t",
            payload: b"",
            qos: QoS::AtLeastOnce,
            retain: false,
            dup: false,
            packet_id: None,
        };
        assert!(encode_publish(&mut buf, &publish).is_err());
    }

    #[test]
    fn test_qos0_publish_omits_packet_id() {
        let mut buf = [0u8; 32];
        let publish = PublishInfo {
            topic: "t",
            payload: b"x",
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
            packet_id: Some(7),
        };
        let len = encode_publish(&mut buf, &publish).unwrap();
        assert_eq!(&buf[..len], &[0x30, 4, 0, 1, b't', b'x']);
    }

    #[test]
    fn test_buffer_too_small_is_reported_before_writing() {
        let mut buf = [0xAAu8; 8];
        let publish = PublishInfo {
            topic: "sensor/1/temp",
            payload: b"21.5",
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
            packet_id: None,
        };
        let err = encode_publish(&mut buf, &publish).unwrap_err();
        assert_eq!(
            err,
            CodecError::BufferTooSmall {
                needed: 21,
                available: 8
            }
        );
        assert!(buf.iter().all(|b| *b == 0xAA));
    }

    #[test]
    fn test_subscribe_and_suback() {
        let mut buf = [0u8; 64];
        let filters = [
            SubscribeInfo {
                filter: "sensor/+/temp",
                qos: QoS::AtLeastOnce,
            },
            SubscribeInfo {
                filter: "sensor/#",
                qos: QoS::AtMostOnce,
            },
        ];
        let len = encode_subscribe(&mut buf, 10, &filters).unwrap();
        assert_eq!(buf[0], 0x82);
        assert_eq!(
            decode_packet(&buf[..len]).unwrap(),
            Packet::Subscribe {
                packet_id: 10,
                filters: filters.to_vec()
            }
        );

        let len = encode_suback(&mut buf, 10, &[0x01, SUBACK_FAILURE]).unwrap();
        assert_eq!(
            decode_packet(&buf[..len]).unwrap(),
            Packet::SubAck {
                packet_id: 10,
                return_codes: &[0x01, 0x80]
            }
        );
    }

    #[test]
    fn test_unsubscribe_roundtrip() {
        let mut buf = [0u8; 64];
        let len = encode_unsubscribe(&mut buf, 3, &["a/b", "c/#"]).unwrap();
        assert_eq!(
            decode_packet(&buf[..len]).unwrap(),
            Packet::Unsubscribe {
                packet_id: 3,
                filters: vec!["a/b", "c/#"]
            }
        );
    }

    #[test]
    fn test_fixed_size_packets() {
        let mut buf = [0u8; 4];
        let len = encode_pingreq(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[0xC0, 0]);
        let len = encode_disconnect(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[0xE0, 0]);
        let len = encode_puback(&mut buf, 0xBEEF).unwrap();
        assert_eq!(&buf[..len], &[0x40, 2, 0xBE, 0xEF]);
        let len = encode_connack(&mut buf, true, 0).unwrap();
        assert_eq!(
            decode_packet(&buf[..len]).unwrap(),
            Packet::ConnAck {
                session_present: true,
                return_code: 0
            }
        );
    }

    #[test]
    fn test_incremental_decode_waits_for_complete_frame() {
        let mut buf = [0u8; 300];
        let payload = [7u8; 200];
        let publish = PublishInfo {
            topic: "big",
            payload: &payload,
            qos: QoS::AtMostOnce,
            retain: false,
            dup: false,
            packet_id: None,
        };
        let len = encode_publish(&mut buf, &publish).unwrap();
        // Two-byte remaining length
        assert_eq!(len, 1 + 2 + 5 + 200);

        assert_eq!(decode_incremental(&buf[..0]).unwrap(), None);
        assert_eq!(decode_incremental(&buf[..2]).unwrap(), None);
        assert_eq!(decode_incremental(&buf[..len - 1]).unwrap(), None);
        let (packet, used) = decode_incremental(&buf[..len]).unwrap().unwrap();
        assert_eq!(used, len);
        assert_eq!(packet, Packet::Publish(publish));
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut buf = [0u8; 16];
        let first = encode_puback(&mut buf, 1).unwrap();
        let second = encode_pingresp(&mut buf[first..]).unwrap();
        let total = first + second;

        let (packet, used) = decode_incremental(&buf[..total]).unwrap().unwrap();
        assert_eq!(packet, Packet::PubAck { packet_id: 1 });
        let (packet, _) = decode_incremental(&buf[used..total]).unwrap().unwrap();
        assert_eq!(packet, Packet::PingResp);
    }

    #[test]
    fn test_oversized_varint_is_framing_error() {
        let buf = [0x30, 0xFF, 0xFF, 0xFF, 0xFF, 0x01];
        assert!(frame_length(&buf).is_err());
    }

    #[test]
    fn test_zero_packet_id_rejected() {
        assert!(matches!(
            decode_packet(&[0x40, 2, 0, 0]),
            Err(CodecError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_unknown_packet_type() {
        // PUBREC is framed correctly but not supported by this client
        assert_eq!(
            decode_packet(&[0x50, 2, 0, 1]),
            Err(CodecError::InvalidPacketType(5))
        );
    }

    #[test]
    fn test_invalid_utf8_topic() {
        let frame = [0x30, 4, 0, 2, 0xFF, 0xFE];
        assert_eq!(decode_packet(&frame), Err(CodecError::InvalidUtf8));
    }
}
