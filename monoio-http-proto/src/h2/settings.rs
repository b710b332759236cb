//! HTTP/2 SETTINGS parameters (RFC 7540 Section 6.5).

use bytes::BufMut;

use super::error::{ErrorCode, H2Error};

pub const SETTINGS_HEADER_TABLE_SIZE: u16 = 0x1;
pub const SETTINGS_ENABLE_PUSH: u16 = 0x2;
pub const SETTINGS_MAX_CONCURRENT_STREAMS: u16 = 0x3;
pub const SETTINGS_INITIAL_WINDOW_SIZE: u16 = 0x4;
pub const SETTINGS_MAX_FRAME_SIZE: u16 = 0x5;
pub const SETTINGS_MAX_HEADER_LIST_SIZE: u16 = 0x6;
pub const SETTINGS_ENABLE_CONNECT_PROTOCOL: u16 = 0x8;

pub const DEFAULT_MAX_FRAME_SIZE: u32 = 16_384;
pub const MAX_MAX_FRAME_SIZE: u32 = 16_777_215;

/// One side's settings. `None` means the parameter was never sent and the
/// protocol default (often "unlimited") applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub header_table_size: u32,
    pub enable_push: bool,
    pub max_concurrent_streams: Option<u32>,
    pub initial_window_size: u32,
    pub max_frame_size: u32,
    pub max_header_list_size: Option<u32>,
    pub enable_connect_protocol: Option<bool>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            header_table_size: 4096,
            enable_push: true,
            max_concurrent_streams: None,
            initial_window_size: 65535,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            max_header_list_size: None,
            enable_connect_protocol: None,
        }
    }
}

impl Settings {
    /// Client defaults: push disabled.
    pub fn client_default() -> Self {
        Self {
            enable_push: false,
            ..Default::default()
        }
    }

    /// Identifier/value pairs to put on the wire.
    pub fn to_pairs(&self) -> Vec<(u16, u32)> {
        let mut pairs = vec![
            (SETTINGS_HEADER_TABLE_SIZE, self.header_table_size),
            (SETTINGS_ENABLE_PUSH, self.enable_push as u32),
        ];
        if let Some(v) = self.max_concurrent_streams {
            pairs.push((SETTINGS_MAX_CONCURRENT_STREAMS, v));
        }
        pairs.push((SETTINGS_INITIAL_WINDOW_SIZE, self.initial_window_size));
        pairs.push((SETTINGS_MAX_FRAME_SIZE, self.max_frame_size));
        if let Some(v) = self.max_header_list_size {
            pairs.push((SETTINGS_MAX_HEADER_LIST_SIZE, v));
        }
        if let Some(v) = self.enable_connect_protocol {
            pairs.push((SETTINGS_ENABLE_CONNECT_PROTOCOL, v as u32));
        }
        pairs
    }

    /// Applies one received parameter, validating its range.
    pub fn apply(&mut self, id: u16, value: u32) -> Result<(), H2Error> {
        match id {
            SETTINGS_HEADER_TABLE_SIZE => self.header_table_size = value,
            SETTINGS_ENABLE_PUSH => {
                if value > 1 {
                    return Err(H2Error::protocol("ENABLE_PUSH must be 0 or 1"));
                }
                self.enable_push = value == 1;
            }
            SETTINGS_MAX_CONCURRENT_STREAMS => self.max_concurrent_streams = Some(value),
            SETTINGS_INITIAL_WINDOW_SIZE => {
                if value > 0x7fff_ffff {
                    return Err(H2Error::connection(
                        ErrorCode::FlowControlError,
                        "INITIAL_WINDOW_SIZE above 2^31-1",
                    ));
                }
                self.initial_window_size = value;
            }
            SETTINGS_MAX_FRAME_SIZE => {
                if !(DEFAULT_MAX_FRAME_SIZE..=MAX_MAX_FRAME_SIZE).contains(&value) {
                    return Err(H2Error::protocol("MAX_FRAME_SIZE out of range"));
                }
                self.max_frame_size = value;
            }
            SETTINGS_MAX_HEADER_LIST_SIZE => self.max_header_list_size = Some(value),
            SETTINGS_ENABLE_CONNECT_PROTOCOL => {
                if value > 1 {
                    return Err(H2Error::protocol("ENABLE_CONNECT_PROTOCOL must be 0 or 1"));
                }
                self.enable_connect_protocol = Some(value == 1);
            }
            // Unknown settings MUST be ignored (RFC 7540 Section 6.5.2).
            _ => {}
        }
        Ok(())
    }
}

pub fn encode_pairs(pairs: &[(u16, u32)], buf: &mut impl BufMut) {
    for (id, value) in pairs {
        buf.put_u16(*id);
        buf.put_u32(*value);
    }
}

pub fn decode_pairs(payload: &[u8]) -> Result<Vec<(u16, u32)>, H2Error> {
    if payload.len() % 6 != 0 {
        return Err(H2Error::frame_size("SETTINGS payload not a multiple of 6"));
    }
    Ok(payload
        .chunks_exact(6)
        .map(|c| {
            (
                u16::from_be_bytes([c[0], c[1]]),
                u32::from_be_bytes([c[2], c[3], c[4], c[5]]),
            )
        })
        .collect())
}
