//! Connection pooling HTTP transport for monoio.
//!
//! [`ConnectionPool`] keeps connections per origin, speaks HTTP/1.1 or HTTP/2
//! depending on ALPN and configuration, and coalesces concurrent HTTP/2
//! requests onto one connection. [`HttpProxy`] is the same pool routed
//! through a forwarding or tunnelling proxy.

mod backend;
mod body;
mod config;
mod connection;
mod error;
mod http11;
mod http2;
#[cfg(test)]
mod mock;
mod origin;
mod pool;
mod proxy;
mod request;
mod response;
mod socket;
mod util;

pub use backend::{Backend, MonoioBackend, NetworkStream};
pub use body::{ByteStream, FixedByteStream};
pub use config::{
    default_tls_config, Builder, HttpVersion, PoolConfig, ProxyConfig, ProxyMode, ReasonPhrase,
    Timeouts,
};
pub use connection::Connection;
pub use error::{Error, Result};
pub use http11::{Http11Connection, Http11State};
pub use http2::{Http2Connection, Http2State};
pub use origin::{Origin, Scheme, Url};
pub use pool::ConnectionPool;
pub use proxy::HttpProxy;
pub use request::Request;
pub use response::{Response, ResponseBody};
pub use socket::{PlainStream, SocketStream};
