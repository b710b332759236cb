use thiserror::Error as ThisError;

/// Protocol violations detected by the sans-io state machines.
///
/// `Local` means the caller asked for something the protocol does not allow in
/// the current state; `Remote` means the peer sent something invalid.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("local protocol error: {0}")]
    Local(String),
    #[error("remote protocol error: {0}")]
    Remote(String),
}

impl ProtocolError {
    pub fn local(msg: impl Into<String>) -> Self {
        Self::Local(msg.into())
    }

    pub fn remote(msg: impl Into<String>) -> Self {
        Self::Remote(msg.into())
    }

    #[inline]
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}
