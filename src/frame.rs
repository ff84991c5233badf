use crate::error::Error;

const FIN_MASK: u8 = 0b10000000;
const FLAGS_MASK: u8 = 0b01110000;
const OPCODE_MASK: u8 = 0b00001111;
const MASK_MASK: u8 = 0b10000000;
const LENGTH_MASK: u8 = 0b01111111;

// Hard cap on control frame payloads, so they always fit the short length
// form.
const MAX_CONTROL_PAYLOAD: usize = 125;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OpCode {
    Continue,
    Text,
    Binary,
    Close,
    Ping,
    Pong,
}

impl OpCode {
    pub fn from(byte: u8) -> Result<Self, Error> {
        match byte {
            0x0 => Ok(OpCode::Continue),
            0x1 => Ok(OpCode::Text),
            0x2 => Ok(OpCode::Binary),
            0x8 => Ok(OpCode::Close),
            0x9 => Ok(OpCode::Ping),
            0xA => Ok(OpCode::Pong),
            _ => Err(Error::InvalidOpcode),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            OpCode::Continue => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
        }
    }

    pub fn is_control(&self) -> bool {
        matches!(self, OpCode::Close | OpCode::Ping | OpCode::Pong)
    }
}

/// One WebSocket frame. Frames written by a client carry a mask, frames
/// written by a server don't, and the payload held here is always the
/// unmasked one.
#[derive(Debug, Clone)]
pub struct WsFrame {
    pub final_fragment: bool,
    pub opcode: OpCode,
    pub flags: u8,
    pub mask: Option<[u8; 4]>,
    pub payload: Vec<u8>,
}

impl WsFrame {
    pub fn new(final_fragment: bool, opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            final_fragment,
            opcode,
            flags: 0,
            mask: None,
            payload,
        }
    }

    /// Client-side frame with a fresh random mask.
    pub fn masked(final_fragment: bool, opcode: OpCode, payload: Vec<u8>) -> Self {
        Self {
            final_fragment,
            opcode,
            flags: 0,
            mask: Some(generate_mask()),
            payload,
        }
    }
}

pub fn generate_mask() -> [u8; 4] {
    rand::random()
}

// XOR with mask[i % 4]. Masking and unmasking are the same operation, so
// both ends of a connection share this one function.
pub fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

/// Encodes a frame into its wire form, masking the payload when a mask is
/// present.
pub fn encode_frame(frame: &WsFrame) -> Vec<u8> {
    // fin bit, reserved bits and opcode share the leading byte.
    let first_byte = (frame.final_fragment as u8) << 7 | (frame.flags & FLAGS_MASK) | frame.opcode.as_u8();
    let mask_bit = if frame.mask.is_some() { MASK_MASK } else { 0 };
    let payload_len = frame.payload.len();

    let mut encoded = Vec::with_capacity(payload_len + 14);
    encoded.push(first_byte);

    // Short lengths ride in the second byte directly, the sentinel values
    // 126 and 127 announce a 16-bit or 64-bit big-endian length instead.
    if payload_len < 126 {
        encoded.push(mask_bit | payload_len as u8);
    } else if payload_len <= 0xFFFF {
        encoded.push(mask_bit | 126);
        encoded.extend_from_slice(&(payload_len as u16).to_be_bytes());
    } else {
        encoded.push(mask_bit | 127);
        encoded.extend_from_slice(&(payload_len as u64).to_be_bytes());
    }

    match frame.mask {
        Some(mask) => {
            encoded.extend_from_slice(&mask);
            let mut masked_payload = frame.payload.clone();
            apply_mask(&mut masked_payload, mask);
            encoded.extend_from_slice(&masked_payload);
        }
        None => encoded.extend_from_slice(&frame.payload),
    }

    encoded
}

/// Attempts to decode one frame from the front of `buf`.
///
/// Returns `Ok(None)` when the buffered bytes stop short of the header, the
/// extended length, the mask or the payload, without consuming anything.
pub fn decode_frame(buf: &[u8], max_frame_size: usize) -> Result<Option<(usize, WsFrame)>, Error> {
    if buf.len() < 2 {
        return Ok(None);
    }

    let final_fragment = (buf[0] & FIN_MASK) != 0;
    let flags = buf[0] & FLAGS_MASK;
    let opcode = OpCode::from(buf[0] & OPCODE_MASK)?;

    // The reserved bits only mean something once an extension negotiated
    // them. This transport negotiates none, so a peer setting any of them
    // is speaking a dialect we don't understand.
    if flags != 0 {
        return Err(Error::ProtocolError(format!("invalid flags: {:#x}", flags)));
    }

    // Close, ping and pong have to arrive whole.
    if !final_fragment && opcode.is_control() {
        return Err(Error::ProtocolError(
            "Received fragmented control frame".to_string(),
        ));
    }

    let masked = (buf[1] & MASK_MASK) != 0;
    let mut length = (buf[1] & LENGTH_MASK) as usize;

    if opcode.is_control() && length > MAX_CONTROL_PAYLOAD {
        return Err(Error::FrameTooLarge(length, MAX_CONTROL_PAYLOAD));
    }

    let mut used = 2;
    if length == 126 {
        if buf.len() < used + 2 {
            return Ok(None);
        }
        length = u16::from_be_bytes([buf[used], buf[used + 1]]) as usize;
        used += 2;
    } else if length == 127 {
        if buf.len() < used + 8 {
            return Ok(None);
        }
        let mut be_bytes = [0u8; 8];
        be_bytes.copy_from_slice(&buf[used..used + 8]);
        length = u64::from_be_bytes(be_bytes) as usize;
        used += 8;
    }

    if length > max_frame_size {
        return Err(Error::FrameTooLarge(length, max_frame_size));
    }

    let mask = if masked {
        if buf.len() < used + 4 {
            return Ok(None);
        }
        let mut mask = [0u8; 4];
        mask.copy_from_slice(&buf[used..used + 4]);
        used += 4;
        Some(mask)
    } else {
        None
    };

    if buf.len() < used + length {
        return Ok(None);
    }
    let mut payload = buf[used..used + length].to_vec();
    used += length;

    // Client-sent frames arrive masked, undo that before the payload is
    // handed any further.
    if let Some(mask) = mask {
        apply_mask(&mut payload, mask);
    }

    Ok(Some((
        used,
        WsFrame {
            final_fragment,
            opcode,
            flags,
            mask,
            payload,
        },
    )))
}
