//! HTTP/1.1 client protocol core.
//!
//! [`ClientConnection`] is a sans-io state machine in the style of h11: the
//! caller hands it outgoing request events and receives the bytes to write,
//! feeds it whatever was read from the socket and pulls [`Event`]s back out.

pub mod codec;
mod connection;
mod state;

pub use codec::{RequestHead, ResponseHead};
pub use connection::{ClientConnection, Event};
pub use state::State;
