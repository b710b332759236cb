use std::fmt;

/// Per-side protocol state, mirroring the h11 model.
///
/// Both the client (`our`) and the server (`their`) half move through these
/// independently; a connection can start a new request/response cycle only
/// once both halves reach [`State::Done`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Idle,
    SendResponse,
    SendBody,
    Done,
    MustClose,
    Closed,
    Error,
    MightSwitchProtocol,
    SwitchedProtocol,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Idle => "IDLE",
            State::SendResponse => "SEND_RESPONSE",
            State::SendBody => "SEND_BODY",
            State::Done => "DONE",
            State::MustClose => "MUST_CLOSE",
            State::Closed => "CLOSED",
            State::Error => "ERROR",
            State::MightSwitchProtocol => "MIGHT_SWITCH_PROTOCOL",
            State::SwitchedProtocol => "SWITCHED_PROTOCOL",
        };
        f.write_str(name)
    }
}
