use thiserror::Error as ThisError;

use crate::common::error::ProtocolError;

/// HTTP/2 error codes (RFC 7540 Section 7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    NoError = 0x0,
    ProtocolError = 0x1,
    InternalError = 0x2,
    FlowControlError = 0x3,
    SettingsTimeout = 0x4,
    StreamClosed = 0x5,
    FrameSizeError = 0x6,
    RefusedStream = 0x7,
    Cancel = 0x8,
    CompressionError = 0x9,
    ConnectError = 0xa,
    EnhanceYourCalm = 0xb,
    InadequateSecurity = 0xc,
    Http11Required = 0xd,
}

impl ErrorCode {
    pub fn from_u32(v: u32) -> Self {
        match v {
            0x0 => Self::NoError,
            0x1 => Self::ProtocolError,
            0x2 => Self::InternalError,
            0x3 => Self::FlowControlError,
            0x4 => Self::SettingsTimeout,
            0x5 => Self::StreamClosed,
            0x6 => Self::FrameSizeError,
            0x7 => Self::RefusedStream,
            0x8 => Self::Cancel,
            0x9 => Self::CompressionError,
            0xa => Self::ConnectError,
            0xb => Self::EnhanceYourCalm,
            0xc => Self::InadequateSecurity,
            0xd => Self::Http11Required,
            // unknown codes must not trigger special behavior
            _ => Self::InternalError,
        }
    }
}

#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum H2Error {
    /// The peer broke the protocol; the connection is gone.
    #[error("connection error {code:?}: {reason}")]
    Connection { code: ErrorCode, reason: String },
    /// All client stream ids have been used.
    #[error("no stream ids available")]
    NoAvailableStreamId,
    #[error("stream {0} is closed")]
    StreamClosed(u32),
    #[error("flow control window exceeded on stream {0}")]
    FlowControl(u32),
    #[error("{0}")]
    Local(String),
}

impl H2Error {
    pub(crate) fn connection(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self::Connection {
            code,
            reason: reason.into(),
        }
    }

    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        Self::connection(ErrorCode::ProtocolError, reason)
    }

    pub(crate) fn frame_size(reason: impl Into<String>) -> Self {
        Self::connection(ErrorCode::FrameSizeError, reason)
    }
}

impl From<H2Error> for ProtocolError {
    fn from(e: H2Error) -> Self {
        match e {
            H2Error::Connection { .. } => ProtocolError::Remote(e.to_string()),
            _ => ProtocolError::Local(e.to_string()),
        }
    }
}
