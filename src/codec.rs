use crate::error::Error;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// Every frame starts with a fixed-width prefix: one byte selecting the meta
// parser, and the length of the serialized meta block as a 32-bit big-endian
// integer. The content announced by the meta follows the meta block directly.
pub const HEADER_LENGTH: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Request = 1,
    Response = 2,
    Notification = 3,
}

// The packet type crosses the wire as its numeric value, not as a variant
// name, so both parser families agree on the encoding.
impl Serialize for PacketType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(*self as u8)
    }
}

impl<'de> Deserialize<'de> for PacketType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match u8::deserialize(deserializer)? {
            1 => Ok(PacketType::Request),
            2 => Ok(PacketType::Response),
            3 => Ok(PacketType::Notification),
            other => Err(serde::de::Error::custom(format!(
                "unknown packet type: {}",
                other
            ))),
        }
    }
}

/// Control metadata travelling in front of every payload. The receive path
/// routes on `packet_type`, correlates responses through `transmission_id`
/// and resolves handlers by `service_method`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub packet_type: PacketType,
    pub transmission_id: u32,
    pub service_method: String,
    pub content_size: u32,
    pub failed: bool,
}

impl Meta {
    pub fn request(service_method: &str, transmission_id: u32) -> Self {
        Meta {
            packet_type: PacketType::Request,
            transmission_id,
            service_method: service_method.to_string(),
            content_size: 0,
            failed: false,
        }
    }

    pub fn notification(service_method: &str) -> Self {
        Meta {
            packet_type: PacketType::Notification,
            transmission_id: 0,
            service_method: service_method.to_string(),
            content_size: 0,
            failed: false,
        }
    }

    pub fn response(transmission_id: u32, failed: bool) -> Self {
        Meta {
            packet_type: PacketType::Response,
            transmission_id,
            service_method: String::new(),
            content_size: 0,
            failed,
        }
    }

    // Heartbeats are notifications with an empty service method, they only
    // exist to refresh the liveness clock on the receiving side.
    pub fn heartbeat() -> Self {
        Meta::notification("")
    }
}

/// Error payload carried as the content of a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error_code: i32,
    pub error_message: String,
}

/// A fully assembled inbound frame: decoded meta plus raw content bytes.
#[derive(Debug, Clone)]
pub struct Packet {
    pub meta: Meta,
    pub content: Bytes,
}

/// Selects the codec used for the meta block and, by convention, for the
/// application payloads exchanged over the same connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserTag {
    /// Compact binary format, the default.
    Postcard = 1,
    /// Human-readable format, handy for debugging and tooling.
    Json = 2,
}

impl ParserTag {
    pub fn from(byte: u8) -> Result<Self, Error> {
        match byte {
            1 => Ok(ParserTag::Postcard),
            2 => Ok(ParserTag::Json),
            _ => Err(Error::DecodeError(byte)),
        }
    }

    pub fn as_u8(&self) -> u8 {
        *self as u8
    }
}

pub fn encode_payload<T: Serialize>(tag: ParserTag, value: &T) -> Result<Vec<u8>, Error> {
    match tag {
        ParserTag::Postcard => {
            postcard::to_allocvec(value).map_err(|_| Error::EncodeError(tag.as_u8()))
        }
        ParserTag::Json => serde_json::to_vec(value).map_err(|_| Error::EncodeError(tag.as_u8())),
    }
}

pub fn decode_payload<T: DeserializeOwned>(tag: ParserTag, bytes: &[u8]) -> Result<T, Error> {
    match tag {
        ParserTag::Postcard => {
            postcard::from_bytes(bytes).map_err(|_| Error::DecodeError(tag.as_u8()))
        }
        ParserTag::Json => {
            serde_json::from_slice(bytes).map_err(|_| Error::DecodeError(tag.as_u8()))
        }
    }
}

/// Produces `header ‖ meta ‖ content`, stamping the real content length into
/// the meta before serializing it. Frames whose meta and content together
/// exceed `max_packet_length` are refused before anything hits the wire.
pub fn encode(
    tag: ParserTag,
    mut meta: Meta,
    content: &[u8],
    max_packet_length: usize,
) -> Result<Vec<u8>, Error> {
    meta.content_size = content.len() as u32;
    let meta_bytes = encode_payload(tag, &meta)?;

    let packet_length = meta_bytes.len() + content.len();
    if packet_length > max_packet_length {
        return Err(Error::PacketTooLarge(packet_length, max_packet_length));
    }

    let mut frame = Vec::with_capacity(HEADER_LENGTH + packet_length);
    frame.push(tag.as_u8());
    frame.extend_from_slice(&(meta_bytes.len() as u32).to_be_bytes());
    frame.extend_from_slice(&meta_bytes);
    frame.extend_from_slice(content);
    Ok(frame)
}

/// Attempts to extract one frame from the front of `buf`.
///
/// Returns `Ok(None)` whenever the buffered bytes stop short of a full
/// frame, at any of the three stages (header, meta block, content). The
/// caller keeps the buffer as is and retries once more bytes arrive.
/// Oversized or unparsable frames are errors, the connection owning the
/// buffer is beyond saving at that point.
pub fn decode(buf: &[u8], max_packet_length: usize) -> Result<Option<(usize, Packet)>, Error> {
    if buf.len() < HEADER_LENGTH {
        return Ok(None);
    }

    let tag_byte = buf[0];
    let tag = ParserTag::from(tag_byte)?;
    let meta_length = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if meta_length > max_packet_length {
        return Err(Error::PacketTooLarge(meta_length, max_packet_length));
    }

    let meta_end = HEADER_LENGTH + meta_length;
    if buf.len() < meta_end {
        return Ok(None);
    }

    let meta: Meta = decode_payload(tag, &buf[HEADER_LENGTH..meta_end])?;

    let content_size = meta.content_size as usize;
    let packet_length = meta_length + content_size;
    if packet_length > max_packet_length {
        return Err(Error::PacketTooLarge(packet_length, max_packet_length));
    }

    let frame_end = meta_end + content_size;
    if buf.len() < frame_end {
        return Ok(None);
    }

    let content = Bytes::copy_from_slice(&buf[meta_end..frame_end]);
    Ok(Some((frame_end, Packet { meta, content })))
}
