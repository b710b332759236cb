//! HTTP/2 frame encoding/decoding (RFC 7540 Section 4).
//!
//! Every frame starts with a fixed 9-byte header:
//! ```text
//! +-----------------------------------------------+
//! |                 Length (24)                    |
//! +---------------+---------------+---------------+
//! |   Type (8)    |   Flags (8)   |
//! +-+-------------+---------------+------...------+
//! |R|                 Stream Identifier (31)       |
//! +-+---------------------------------------------+
//! |                   Frame Payload ...            |
//! +-----------------------------------------------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{
    error::{ErrorCode, H2Error},
    settings::{decode_pairs, encode_pairs},
};

pub const FRAME_HEADER_LEN: usize = 9;

pub const FRAME_DATA: u8 = 0x0;
pub const FRAME_HEADERS: u8 = 0x1;
pub const FRAME_PRIORITY: u8 = 0x2;
pub const FRAME_RST_STREAM: u8 = 0x3;
pub const FRAME_SETTINGS: u8 = 0x4;
pub const FRAME_PUSH_PROMISE: u8 = 0x5;
pub const FRAME_PING: u8 = 0x6;
pub const FRAME_GOAWAY: u8 = 0x7;
pub const FRAME_WINDOW_UPDATE: u8 = 0x8;
pub const FRAME_CONTINUATION: u8 = 0x9;

pub const FLAG_END_STREAM: u8 = 0x1;
pub const FLAG_ACK: u8 = 0x1;
pub const FLAG_END_HEADERS: u8 = 0x4;
pub const FLAG_PADDED: u8 = 0x8;
pub const FLAG_PRIORITY: u8 = 0x20;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data {
        stream_id: u32,
        payload: Bytes,
        end_stream: bool,
        /// Whole payload length including padding; this is what flow control counts.
        flow_controlled_length: u32,
    },
    Headers {
        stream_id: u32,
        block: Bytes,
        end_stream: bool,
        end_headers: bool,
        priority: Option<Priority>,
    },
    Priority {
        stream_id: u32,
        priority: Priority,
    },
    RstStream {
        stream_id: u32,
        error_code: ErrorCode,
    },
    Settings {
        ack: bool,
        params: Vec<(u16, u32)>,
    },
    PushPromise {
        stream_id: u32,
        promised_stream_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    Ping {
        ack: bool,
        opaque_data: [u8; 8],
    },
    GoAway {
        last_stream_id: u32,
        error_code: ErrorCode,
        debug_data: Bytes,
    },
    WindowUpdate {
        stream_id: u32,
        increment: u32,
    },
    Continuation {
        stream_id: u32,
        block: Bytes,
        end_headers: bool,
    },
    /// Unknown frame types are ignored (RFC 7540 Section 4.1).
    Unknown {
        frame_type: u8,
        stream_id: u32,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Priority {
    pub exclusive: bool,
    pub dependency: u32,
    pub weight: u8,
}

pub struct FrameHeader {
    pub length: u32,
    pub frame_type: u8,
    pub flags: u8,
    pub stream_id: u32,
}

pub fn encode_frame_header(
    buf: &mut BytesMut,
    payload_len: usize,
    frame_type: u8,
    flags: u8,
    stream_id: u32,
) {
    buf.reserve(FRAME_HEADER_LEN + payload_len);
    let len = payload_len as u32;
    buf.put_u8((len >> 16) as u8);
    buf.put_u8((len >> 8) as u8);
    buf.put_u8(len as u8);
    buf.put_u8(frame_type);
    buf.put_u8(flags);
    // reserved bit cleared
    buf.put_u32(stream_id & 0x7fff_ffff);
}

pub fn decode_frame_header(buf: &[u8]) -> Option<FrameHeader> {
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }
    Some(FrameHeader {
        length: (u32::from(buf[0]) << 16) | (u32::from(buf[1]) << 8) | u32::from(buf[2]),
        frame_type: buf[3],
        flags: buf[4],
        stream_id: u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) & 0x7fff_ffff,
    })
}

impl Frame {
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Frame::Data {
                stream_id,
                payload,
                end_stream,
                ..
            } => {
                let flags = if *end_stream { FLAG_END_STREAM } else { 0 };
                encode_frame_header(buf, payload.len(), FRAME_DATA, flags, *stream_id);
                buf.extend_from_slice(payload);
            }
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
                priority,
            } => {
                let mut flags = 0u8;
                if *end_stream {
                    flags |= FLAG_END_STREAM;
                }
                if *end_headers {
                    flags |= FLAG_END_HEADERS;
                }
                match priority {
                    Some(pri) => {
                        flags |= FLAG_PRIORITY;
                        encode_frame_header(buf, block.len() + 5, FRAME_HEADERS, flags, *stream_id);
                        encode_priority(buf, pri);
                    }
                    None => {
                        encode_frame_header(buf, block.len(), FRAME_HEADERS, flags, *stream_id)
                    }
                }
                buf.extend_from_slice(block);
            }
            Frame::Priority {
                stream_id,
                priority,
            } => {
                encode_frame_header(buf, 5, FRAME_PRIORITY, 0, *stream_id);
                encode_priority(buf, priority);
            }
            Frame::RstStream {
                stream_id,
                error_code,
            } => {
                encode_frame_header(buf, 4, FRAME_RST_STREAM, 0, *stream_id);
                buf.put_u32(*error_code as u32);
            }
            Frame::Settings { ack, params } => {
                if *ack {
                    encode_frame_header(buf, 0, FRAME_SETTINGS, FLAG_ACK, 0);
                } else {
                    encode_frame_header(buf, params.len() * 6, FRAME_SETTINGS, 0, 0);
                    encode_pairs(params, buf);
                }
            }
            Frame::PushPromise {
                stream_id,
                promised_stream_id,
                block,
                end_headers,
            } => {
                let flags = if *end_headers { FLAG_END_HEADERS } else { 0 };
                encode_frame_header(buf, 4 + block.len(), FRAME_PUSH_PROMISE, flags, *stream_id);
                buf.put_u32(*promised_stream_id & 0x7fff_ffff);
                buf.extend_from_slice(block);
            }
            Frame::Ping { ack, opaque_data } => {
                let flags = if *ack { FLAG_ACK } else { 0 };
                encode_frame_header(buf, 8, FRAME_PING, flags, 0);
                buf.extend_from_slice(opaque_data);
            }
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                encode_frame_header(buf, 8 + debug_data.len(), FRAME_GOAWAY, 0, 0);
                buf.put_u32(*last_stream_id & 0x7fff_ffff);
                buf.put_u32(*error_code as u32);
                buf.extend_from_slice(debug_data);
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                encode_frame_header(buf, 4, FRAME_WINDOW_UPDATE, 0, *stream_id);
                buf.put_u32(*increment & 0x7fff_ffff);
            }
            Frame::Continuation {
                stream_id,
                block,
                end_headers,
            } => {
                let flags = if *end_headers { FLAG_END_HEADERS } else { 0 };
                encode_frame_header(buf, block.len(), FRAME_CONTINUATION, flags, *stream_id);
                buf.extend_from_slice(block);
            }
            Frame::Unknown { .. } => (),
        }
    }
}

fn encode_priority(buf: &mut BytesMut, priority: &Priority) {
    let dep = if priority.exclusive {
        priority.dependency | 0x8000_0000
    } else {
        priority.dependency
    };
    buf.put_u32(dep);
    buf.put_u8(priority.weight);
}

fn decode_priority(data: &[u8]) -> Priority {
    let dep_raw = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    Priority {
        exclusive: dep_raw & 0x8000_0000 != 0,
        dependency: dep_raw & 0x7fff_ffff,
        weight: data[4],
    }
}

/// Decodes one frame from the front of `buf`, consuming it.
///
/// Returns `Ok(None)` when the buffer does not hold a complete frame yet.
pub fn decode_frame(buf: &mut BytesMut, max_frame_size: u32) -> Result<Option<Frame>, H2Error> {
    let header = match decode_frame_header(buf) {
        Some(h) => h,
        None => return Ok(None),
    };
    if header.length > max_frame_size {
        return Err(H2Error::frame_size(format!(
            "frame of {} bytes exceeds {}",
            header.length, max_frame_size
        )));
    }
    let total_len = FRAME_HEADER_LEN + header.length as usize;
    if buf.len() < total_len {
        return Ok(None);
    }

    let mut frame = buf.split_to(total_len);
    frame.advance(FRAME_HEADER_LEN);
    let payload = frame.freeze();
    let flags = header.flags;
    let stream_id = header.stream_id;

    let require_stream = |name: &str| {
        if stream_id == 0 {
            Err(H2Error::protocol(format!("{name} on stream 0")))
        } else {
            Ok(())
        }
    };
    let require_connection = |name: &str| {
        if stream_id != 0 {
            Err(H2Error::protocol(format!("{name} on non-zero stream")))
        } else {
            Ok(())
        }
    };

    let frame = match header.frame_type {
        FRAME_DATA => {
            require_stream("DATA")?;
            let data = strip_padding(&payload, flags)?;
            Frame::Data {
                stream_id,
                payload: data,
                end_stream: flags & FLAG_END_STREAM != 0,
                flow_controlled_length: header.length,
            }
        }
        FRAME_HEADERS => {
            require_stream("HEADERS")?;
            let data = strip_padding(&payload, flags)?;
            let (priority, block) = if flags & FLAG_PRIORITY != 0 {
                if data.len() < 5 {
                    return Err(H2Error::frame_size("HEADERS priority truncated"));
                }
                (Some(decode_priority(&data)), data.slice(5..))
            } else {
                (None, data)
            };
            Frame::Headers {
                stream_id,
                block,
                end_stream: flags & FLAG_END_STREAM != 0,
                end_headers: flags & FLAG_END_HEADERS != 0,
                priority,
            }
        }
        FRAME_PRIORITY => {
            require_stream("PRIORITY")?;
            if payload.len() != 5 {
                return Err(H2Error::frame_size("PRIORITY must be 5 bytes"));
            }
            Frame::Priority {
                stream_id,
                priority: decode_priority(&payload),
            }
        }
        FRAME_RST_STREAM => {
            require_stream("RST_STREAM")?;
            if payload.len() != 4 {
                return Err(H2Error::frame_size("RST_STREAM must be 4 bytes"));
            }
            Frame::RstStream {
                stream_id,
                error_code: ErrorCode::from_u32(u32::from_be_bytes([
                    payload[0], payload[1], payload[2], payload[3],
                ])),
            }
        }
        FRAME_SETTINGS => {
            require_connection("SETTINGS")?;
            let ack = flags & FLAG_ACK != 0;
            if ack && !payload.is_empty() {
                return Err(H2Error::frame_size("SETTINGS ack with payload"));
            }
            Frame::Settings {
                ack,
                params: if ack { Vec::new() } else { decode_pairs(&payload)? },
            }
        }
        FRAME_PUSH_PROMISE => {
            require_stream("PUSH_PROMISE")?;
            let data = strip_padding(&payload, flags)?;
            if data.len() < 4 {
                return Err(H2Error::frame_size("PUSH_PROMISE truncated"));
            }
            Frame::PushPromise {
                stream_id,
                promised_stream_id: u32::from_be_bytes([data[0], data[1], data[2], data[3]])
                    & 0x7fff_ffff,
                block: data.slice(4..),
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        FRAME_PING => {
            require_connection("PING")?;
            if payload.len() != 8 {
                return Err(H2Error::frame_size("PING must be 8 bytes"));
            }
            let mut opaque_data = [0u8; 8];
            opaque_data.copy_from_slice(&payload);
            Frame::Ping {
                ack: flags & FLAG_ACK != 0,
                opaque_data,
            }
        }
        FRAME_GOAWAY => {
            require_connection("GOAWAY")?;
            if payload.len() < 8 {
                return Err(H2Error::frame_size("GOAWAY truncated"));
            }
            Frame::GoAway {
                last_stream_id: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                    & 0x7fff_ffff,
                error_code: ErrorCode::from_u32(u32::from_be_bytes([
                    payload[4], payload[5], payload[6], payload[7],
                ])),
                debug_data: payload.slice(8..),
            }
        }
        FRAME_WINDOW_UPDATE => {
            if payload.len() != 4 {
                return Err(H2Error::frame_size("WINDOW_UPDATE must be 4 bytes"));
            }
            Frame::WindowUpdate {
                stream_id,
                increment: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]])
                    & 0x7fff_ffff,
            }
        }
        FRAME_CONTINUATION => {
            require_stream("CONTINUATION")?;
            Frame::Continuation {
                stream_id,
                block: payload,
                end_headers: flags & FLAG_END_HEADERS != 0,
            }
        }
        frame_type => Frame::Unknown {
            frame_type,
            stream_id,
        },
    };

    Ok(Some(frame))
}

fn strip_padding(payload: &Bytes, flags: u8) -> Result<Bytes, H2Error> {
    if flags & FLAG_PADDED == 0 {
        return Ok(payload.clone());
    }
    if payload.is_empty() {
        return Err(H2Error::frame_size("padded frame without pad length"));
    }
    let pad_len = payload[0] as usize;
    if pad_len >= payload.len() {
        return Err(H2Error::protocol("padding exceeds payload"));
    }
    Ok(payload.slice(1..payload.len() - pad_len))
}
