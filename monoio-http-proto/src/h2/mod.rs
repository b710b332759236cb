//! HTTP/2 client protocol core.
//!
//! Framing, settings, flow control and stream bookkeeping live here; HPACK is
//! delegated to `fluke-hpack`. Nothing in this module touches a socket.

mod connection;
mod error;
mod event;
mod flow_control;
pub mod frame;
pub mod settings;
mod stream;

pub use connection::{ConnectionState, H2Connection, MAX_STREAM_ID, PREFACE};
pub use error::{ErrorCode, H2Error};
pub use event::Event;
pub use flow_control::{DEFAULT_WINDOW_SIZE, MAX_WINDOW_SIZE};
pub use settings::Settings;
pub use stream::StreamState;
