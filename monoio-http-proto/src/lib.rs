//! Sans-io HTTP/1.1 and HTTP/2 client protocol state machines.
//!
//! The types here never perform I/O. Callers write the bytes they are handed
//! and feed back the bytes they read; `monoio-http-pool` drives them over
//! real sockets.

pub mod common;
pub mod h1;
pub mod h2;

pub use common::{error::ProtocolError, Headers};
