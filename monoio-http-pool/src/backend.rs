use std::{
    net::{IpAddr, SocketAddr, ToSocketAddrs},
    path::Path,
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use monoio::net::{TcpStream, UnixStream};
use rustls::{pki_types::ServerName, ClientConfig};
use socket2::{Domain, Protocol, Socket, Type};

use crate::{
    config::HttpVersion,
    socket::{PlainStream, SocketStream},
    util::with_timeout,
    Error, Result,
};

/// Byte stream the HTTP connections run on.
#[allow(async_fn_in_trait)]
pub trait NetworkStream: 'static {
    /// Up to `max_bytes`; an empty buffer means EOF.
    async fn read(&self, max_bytes: usize, timeout: Option<Duration>) -> Result<Bytes>;

    async fn write(&self, data: Bytes, timeout: Option<Duration>) -> Result<()>;

    /// Wraps the stream in TLS in place.
    async fn start_tls(
        &self,
        server_name: ServerName<'static>,
        tls_config: Arc<ClientConfig>,
        timeout: Option<Duration>,
    ) -> Result<()>;

    /// Idempotent.
    fn close(&self);

    /// From ALPN; HTTP/1.1 unless the peer picked `h2`.
    fn negotiated_protocol(&self) -> HttpVersion;

    /// True if a read would not block: data or EOF is pending.
    fn is_peer_readable(&self) -> bool;
}

/// Opens streams and sleeps; everything runtime specific the pool needs.
#[allow(async_fn_in_trait)]
pub trait Backend: Clone + 'static {
    type Stream: NetworkStream;

    async fn open_tcp_stream(
        &self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
        local_address: Option<IpAddr>,
    ) -> Result<Self::Stream>;

    async fn open_uds_stream(&self, path: &Path, timeout: Option<Duration>) -> Result<Self::Stream>;

    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MonoioBackend;

// Bound sockets connect synchronously through socket2 before joining the runtime.
fn connect_bound(
    local: IpAddr,
    host: &str,
    port: u16,
    timeout: Option<Duration>,
) -> std::io::Result<TcpStream> {
    let addr = (host, port)
        .to_socket_addrs()?
        .find(|a| a.is_ipv4() == local.is_ipv4())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                "no address of the local address family",
            )
        })?;
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.bind(&SocketAddr::new(local, 0).into())?;
    match timeout {
        Some(t) => socket.connect_timeout(&addr.into(), t)?,
        None => socket.connect(&addr.into())?,
    }
    socket.set_nonblocking(true)?;
    TcpStream::from_std(socket.into())
}

impl Backend for MonoioBackend {
    type Stream = SocketStream;

    async fn open_tcp_stream(
        &self,
        host: &str,
        port: u16,
        timeout: Option<Duration>,
        local_address: Option<IpAddr>,
    ) -> Result<SocketStream> {
        #[cfg(feature = "logging")]
        tracing::debug!(host, port, ?local_address, "connection.connect_tcp");

        let stream = match local_address {
            Some(local) => connect_bound(local, host, port, timeout).map_err(|e| {
                if e.kind() == std::io::ErrorKind::TimedOut {
                    Error::ConnectTimeout
                } else {
                    Error::Connect(e)
                }
            })?,
            None => with_timeout(timeout, TcpStream::connect((host, port)))
                .await
                .ok_or(Error::ConnectTimeout)?
                .map_err(Error::Connect)?,
        };
        let _ = stream.set_nodelay(true);
        Ok(SocketStream::new(PlainStream::Tcp(stream)))
    }

    async fn open_uds_stream(&self, path: &Path, timeout: Option<Duration>) -> Result<SocketStream> {
        #[cfg(feature = "logging")]
        tracing::debug!(path = %path.display(), "connection.connect_unix_socket");

        let stream = with_timeout(timeout, UnixStream::connect(path))
            .await
            .ok_or(Error::ConnectTimeout)?
            .map_err(Error::Connect)?;
        Ok(SocketStream::new(PlainStream::Unix(stream)))
    }

    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            monoio::time::sleep(duration).await;
        }
    }
}
