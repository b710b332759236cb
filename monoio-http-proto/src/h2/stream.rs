//! Per-stream state (RFC 7540 Section 5.1).

use super::flow_control::FlowControl;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Open,
    /// We sent END_STREAM.
    HalfClosedLocal,
    /// Peer sent END_STREAM.
    HalfClosedRemote,
    Closed,
}

pub(crate) struct H2Stream {
    pub state: StreamState,
    pub send_window: FlowControl,
    pub recv_window: FlowControl,
    pub response_received: bool,
}

impl H2Stream {
    pub fn new(initial_send_window: i64, initial_recv_window: i64) -> Self {
        Self {
            state: StreamState::Open,
            send_window: FlowControl::new(initial_send_window),
            recv_window: FlowControl::new(initial_recv_window),
            response_received: false,
        }
    }

    #[inline]
    pub fn can_send(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedRemote)
    }

    #[inline]
    pub fn can_receive(&self) -> bool {
        matches!(self.state, StreamState::Open | StreamState::HalfClosedLocal)
    }

    pub fn close_local(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedLocal,
            _ => StreamState::Closed,
        };
    }

    pub fn close_remote(&mut self) {
        self.state = match self.state {
            StreamState::Open => StreamState::HalfClosedRemote,
            _ => StreamState::Closed,
        };
    }
}
