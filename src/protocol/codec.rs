//! Packet codec and length-prefixed framing.
//!
//! Frames are laid out as:
//! - 4 bytes: payload length (little-endian u32, excluding itself)
//! - N bytes: payload
//!
//! A packet payload is a little-endian u32 holding `(id << 1) | is_response`
//! followed by one tagged value.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::value::{Map, Value};
use crate::error::{PackwireError, Result};

/// Default max frame length (64 MB); compiled output can be large.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 64 * 1024 * 1024;

/// Largest payload the u32 length prefix can describe.
pub const MAX_OUTBOUND_FRAME_LENGTH: usize = u32::MAX as usize;

/// Largest request id or build key; the id shares its word with the
/// response bit and both travel as int32 values.
pub const ID_MASK: u32 = i32::MAX as u32;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_STRING: u8 = 3;
const TAG_BYTES: u8 = 4;
const TAG_ARRAY: u8 = 5;
const TAG_MAP: u8 = 6;

/// One unit of the request/response protocol.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub id: u32,
    pub is_request: bool,
    pub value: Value,
}

impl Packet {
    pub fn request(id: u32, value: impl Into<Value>) -> Self {
        Self {
            id,
            is_request: true,
            value: value.into(),
        }
    }

    pub fn response(id: u32, value: impl Into<Value>) -> Self {
        Self {
            id,
            is_request: false,
            value: value.into(),
        }
    }
}

/// Encode a packet into a complete frame, length prefix included.
pub fn encode_packet(packet: &Packet) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    debug_assert!(packet.id <= ID_MASK, "packet id {} out of range", packet.id);
    buf.put_u32_le(0);
    buf.put_u32_le((packet.id << 1) | u32::from(!packet.is_request));
    write_value(&mut buf, &packet.value);
    let length = (buf.len() - 4) as u32;
    buf[..4].copy_from_slice(&length.to_le_bytes());
    buf.freeze()
}

/// Decode a complete frame, length prefix included.
pub fn decode_packet(frame: &[u8]) -> Result<Packet> {
    if frame.len() < 4 {
        return Err(PackwireError::Protocol("frame too short".into()));
    }
    let length = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    if frame.len() != 4 + length {
        return Err(PackwireError::Protocol(format!(
            "frame length mismatch: prefix says {}, got {}",
            length,
            frame.len() - 4
        )));
    }
    decode_payload(&frame[4..])
}

/// Decode a packet from a frame payload (length prefix already stripped).
pub fn decode_payload(payload: &[u8]) -> Result<Packet> {
    let mut cursor = payload;
    let word = read_u32(&mut cursor)?;
    let value = read_value(&mut cursor)?;
    if cursor.has_remaining() {
        return Err(PackwireError::Protocol(format!("{} trailing bytes", cursor.remaining())));
    }
    Ok(Packet {
        id: word >> 1,
        is_request: word & 1 == 0,
        value,
    })
}

fn write_len_prefixed(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

fn write_value(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::Null => buf.put_u8(TAG_NULL),
        Value::Bool(b) => {
            buf.put_u8(TAG_BOOL);
            buf.put_u8(u8::from(*b));
        }
        Value::Int(n) => {
            buf.put_u8(TAG_INT);
            buf.put_i32_le(*n);
        }
        Value::String(s) => {
            buf.put_u8(TAG_STRING);
            write_len_prefixed(buf, s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.put_u8(TAG_BYTES);
            write_len_prefixed(buf, b);
        }
        Value::Array(items) => {
            buf.put_u8(TAG_ARRAY);
            buf.put_u32_le(items.len() as u32);
            for item in items {
                write_value(buf, item);
            }
        }
        Value::Map(map) => {
            buf.put_u8(TAG_MAP);
            buf.put_u32_le(map.len() as u32);
            for (key, item) in map.iter() {
                write_len_prefixed(buf, key.as_bytes());
                write_value(buf, item);
            }
        }
    }
}

fn need(cursor: &&[u8], n: usize) -> Result<()> {
    if cursor.remaining() < n {
        return Err(PackwireError::Protocol(format!(
            "unexpected end of packet: need {} bytes, have {}",
            n,
            cursor.remaining()
        )));
    }
    Ok(())
}

fn read_u32(cursor: &mut &[u8]) -> Result<u32> {
    need(cursor, 4)?;
    Ok(cursor.get_u32_le())
}

fn read_len_prefixed<'a>(cursor: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = read_u32(cursor)? as usize;
    need(cursor, len)?;
    let slice: &'a [u8] = *cursor;
    let (data, rest) = slice.split_at(len);
    *cursor = rest;
    Ok(data)
}

fn read_string(cursor: &mut &[u8]) -> Result<String> {
    let data = read_len_prefixed(cursor)?;
    String::from_utf8(data.to_vec()).map_err(|e| PackwireError::Protocol(format!("invalid UTF-8: {}", e)))
}

fn read_value(cursor: &mut &[u8]) -> Result<Value> {
    need(cursor, 1)?;
    let tag = cursor.get_u8();
    Ok(match tag {
        TAG_NULL => Value::Null,
        TAG_BOOL => {
            need(cursor, 1)?;
            match cursor.get_u8() {
                0 => Value::Bool(false),
                1 => Value::Bool(true),
                other => return Err(PackwireError::Protocol(format!("invalid bool byte {}", other))),
            }
        }
        TAG_INT => {
            need(cursor, 4)?;
            Value::Int(cursor.get_i32_le())
        }
        TAG_STRING => Value::String(read_string(cursor)?),
        TAG_BYTES => Value::Bytes(Bytes::copy_from_slice(read_len_prefixed(cursor)?)),
        TAG_ARRAY => {
            let count = read_u32(cursor)? as usize;
            // each element needs at least its tag byte
            need(cursor, count)?;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(read_value(cursor)?);
            }
            Value::Array(items)
        }
        TAG_MAP => {
            let count = read_u32(cursor)? as usize;
            need(cursor, count)?;
            let mut map = Map::with_capacity(count);
            for _ in 0..count {
                let key = read_string(cursor)?;
                let item = read_value(cursor)?;
                if map.contains_key(&key) {
                    return Err(PackwireError::Protocol(format!("duplicate map key \"{}\"", key)));
                }
                map.insert(key, item);
            }
            Value::Map(map)
        }
        other => return Err(PackwireError::Protocol(format!("unknown value tag {}", other))),
    })
}

/// Length-prefixed frame codec.
///
/// Yields frame payloads with the prefix stripped. The accumulator is the
/// `BytesMut` owned by `FramedRead`; each complete frame is split off and
/// the remainder stays buffered for the next read.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_length: usize,
}

impl FrameCodec {
    /// Create a new codec with the default max length.
    pub fn new() -> Self {
        Self {
            max_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    /// Create a new codec with custom max length.
    pub fn with_max_length(max_length: usize) -> Self {
        Self { max_length }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = PackwireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_le_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > self.max_length {
            return Err(PackwireError::Protocol(format!(
                "frame too large: {} > {}",
                length, self.max_length
            )));
        }

        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        Ok(Some(src.split_to(length).freeze()))
    }
}

/// Encodes already-framed bytes (see [`encode_packet`]) verbatim.
impl Encoder<Bytes> for FrameCodec {
    type Error = PackwireError;

    fn encode(&mut self, frame: Bytes, dst: &mut BytesMut) -> Result<()> {
        if frame.len() > self.max_length.saturating_add(4) {
            return Err(PackwireError::Protocol(format!(
                "frame too large: {} > {}",
                frame.len() - 4,
                self.max_length
            )));
        }
        dst.extend_from_slice(&frame);
        Ok(())
    }
}
