use bytes::Bytes;

use super::error::ErrorCode;
use crate::common::Headers;

/// Something the peer did, produced by [`super::H2Connection::receive_data`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ResponseReceived {
        stream_id: u32,
        headers: Headers,
    },
    InformationalResponseReceived {
        stream_id: u32,
        headers: Headers,
    },
    TrailersReceived {
        stream_id: u32,
        headers: Headers,
    },
    DataReceived {
        stream_id: u32,
        data: Bytes,
        /// Bytes to hand back through `acknowledge_received_data`.
        flow_controlled_length: u32,
    },
    StreamEnded {
        stream_id: u32,
    },
    StreamReset {
        stream_id: u32,
        error_code: ErrorCode,
        remote_reset: bool,
    },
    /// `stream_id` 0 is the connection window.
    WindowUpdated {
        stream_id: u32,
        delta: u32,
    },
    RemoteSettingsChanged {
        changed: Vec<(u16, u32)>,
    },
    SettingsAcknowledged,
    PingReceived {
        data: [u8; 8],
    },
    PingAckReceived {
        data: [u8; 8],
    },
    ConnectionTerminated {
        error_code: ErrorCode,
        last_stream_id: u32,
        additional_data: Bytes,
    },
}

impl Event {
    /// The stream this event belongs to; `None` for connection-level events.
    pub fn stream_id(&self) -> Option<u32> {
        match self {
            Event::ResponseReceived { stream_id, .. }
            | Event::InformationalResponseReceived { stream_id, .. }
            | Event::TrailersReceived { stream_id, .. }
            | Event::DataReceived { stream_id, .. }
            | Event::StreamEnded { stream_id }
            | Event::StreamReset { stream_id, .. } => Some(*stream_id),
            Event::WindowUpdated { stream_id, .. } if *stream_id != 0 => Some(*stream_id),
            _ => None,
        }
    }

    /// Error code carried by resets and GOAWAY.
    pub fn error_code(&self) -> Option<ErrorCode> {
        match self {
            Event::StreamReset { error_code, .. } | Event::ConnectionTerminated { error_code, .. } => {
                Some(*error_code)
            }
            _ => None,
        }
    }

    /// New value of setting `id`, if this event changed it.
    pub fn changed_setting(&self, id: u16) -> Option<u32> {
        match self {
            Event::RemoteSettingsChanged { changed } => changed
                .iter()
                .rev()
                .find(|(i, _)| *i == id)
                .map(|(_, v)| *v),
            _ => None,
        }
    }
}
