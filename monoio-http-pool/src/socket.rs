use std::{
    cell::{Cell, UnsafeCell},
    io,
    os::fd::{AsRawFd, RawFd},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use monoio::{
    buf::{IoBuf, IoBufMut, IoVecBuf, IoVecBufMut},
    io::{AsyncReadRent, AsyncWriteRent, AsyncWriteRentExt, Split},
    net::{TcpStream, UnixStream},
    BufResult,
};
use monoio_rustls::{ClientTlsStream, TlsConnector};
use rustls::{pki_types::ServerName, ClientConfig};

use crate::{
    backend::NetworkStream,
    config::HttpVersion,
    util::{with_timeout, AsyncMutex},
    Error, Result,
};

pub enum PlainStream {
    Tcp(TcpStream),
    Unix(UnixStream),
}

impl std::fmt::Debug for PlainStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tcp(_) => write!(f, "Tcp"),
            Self::Unix(_) => write!(f, "Unix"),
        }
    }
}

impl AsRawFd for PlainStream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            PlainStream::Tcp(s) => s.as_raw_fd(),
            PlainStream::Unix(s) => s.as_raw_fd(),
        }
    }
}

impl AsyncReadRent for PlainStream {
    async fn read<T: IoBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
        match self {
            PlainStream::Tcp(s) => s.read(buf).await,
            PlainStream::Unix(s) => s.read(buf).await,
        }
    }

    async fn readv<T: IoVecBufMut>(&mut self, buf: T) -> BufResult<usize, T> {
        match self {
            PlainStream::Tcp(s) => s.readv(buf).await,
            PlainStream::Unix(s) => s.readv(buf).await,
        }
    }
}

impl AsyncWriteRent for PlainStream {
    async fn write<T: IoBuf>(&mut self, buf: T) -> BufResult<usize, T> {
        match self {
            PlainStream::Tcp(s) => s.write(buf).await,
            PlainStream::Unix(s) => s.write(buf).await,
        }
    }

    async fn writev<T: IoVecBuf>(&mut self, buf: T) -> BufResult<usize, T> {
        match self {
            PlainStream::Tcp(s) => s.writev(buf).await,
            PlainStream::Unix(s) => s.writev(buf).await,
        }
    }

    async fn flush(&mut self) -> io::Result<()> {
        match self {
            PlainStream::Tcp(s) => s.flush().await,
            PlainStream::Unix(s) => s.flush().await,
        }
    }

    async fn shutdown(&mut self) -> io::Result<()> {
        match self {
            PlainStream::Tcp(s) => s.shutdown().await,
            PlainStream::Unix(s) => s.shutdown().await,
        }
    }
}

unsafe impl Split for PlainStream {}

enum Transport {
    Plain(PlainStream),
    Tls(ClientTlsStream<PlainStream>),
    /// TLS to the target inside TLS to an https proxy.
    TlsInTls(ClientTlsStream<ClientTlsStream<PlainStream>>),
}

impl Transport {
    async fn read_some(&mut self, buf: Vec<u8>) -> BufResult<usize, Vec<u8>> {
        match self {
            Transport::Plain(s) => s.read(buf).await,
            Transport::Tls(s) => s.read(buf).await,
            Transport::TlsInTls(s) => s.read(buf).await,
        }
    }

    async fn write_all(&mut self, buf: Bytes) -> io::Result<()> {
        match self {
            Transport::Plain(s) => {
                s.write_all(buf).await.0?;
                s.flush().await
            }
            Transport::Tls(s) => {
                s.write_all(buf).await.0?;
                s.flush().await
            }
            Transport::TlsInTls(s) => {
                s.write_all(buf).await.0?;
                s.flush().await
            }
        }
    }

    fn alpn_protocol(&self) -> Option<Vec<u8>> {
        match self {
            Transport::Plain(_) => None,
            Transport::Tls(s) => s.alpn_protocol(),
            Transport::TlsInTls(s) => s.alpn_protocol(),
        }
    }
}

fn version_from_alpn(alpn: Option<&[u8]>) -> HttpVersion {
    match alpn {
        Some(b"h2") => HttpVersion::Http2,
        _ => HttpVersion::Http11,
    }
}

fn tls_error(e: impl std::fmt::Display) -> Error {
    Error::Connect(io::Error::new(io::ErrorKind::Other, e.to_string()))
}

fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket is closed")
}

/// TCP or unix socket, optionally wrapped in one or two TLS layers.
///
/// Reads and writes take separate locks so one task can read while another
/// writes. A timed out read or write closes the socket: the framing of
/// whatever was in flight is lost.
pub struct SocketStream {
    transport: UnsafeCell<Option<Transport>>,
    read_lock: AsyncMutex,
    write_lock: AsyncMutex,
    fd: RawFd,
    closed: Cell<bool>,
    negotiated: Cell<HttpVersion>,
}

impl SocketStream {
    pub fn new(stream: PlainStream) -> Self {
        Self {
            fd: stream.as_raw_fd(),
            transport: UnsafeCell::new(Some(Transport::Plain(stream))),
            read_lock: AsyncMutex::new(),
            write_lock: AsyncMutex::new(),
            closed: Cell::new(false),
            negotiated: Cell::new(HttpVersion::Http11),
        }
    }

    // SAFETY: the read half is only touched under `read_lock`, the write half
    // under `write_lock`, and `start_tls` holds both. Splitting one stream into
    // concurrently driven halves is what monoio's `Split` permits for these
    // stream types.
    #[allow(clippy::mut_from_ref)]
    fn transport(&self) -> Option<&mut Transport> {
        if self.closed.get() {
            return None;
        }
        unsafe { (*self.transport.get()).as_mut() }
    }
}

impl NetworkStream for SocketStream {
    async fn read(&self, max_bytes: usize, timeout: Option<Duration>) -> Result<Bytes> {
        let _guard = self.read_lock.lock().await?;
        let transport = self.transport().ok_or_else(|| Error::Read(closed_error()))?;
        let (res, mut buf) =
            match with_timeout(timeout, transport.read_some(Vec::with_capacity(max_bytes))).await
            {
                Some(r) => r,
                None => {
                    self.close();
                    return Err(Error::ReadTimeout);
                }
            };
        let n = res.map_err(Error::Read)?;
        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    async fn write(&self, data: Bytes, timeout: Option<Duration>) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await?;
        let transport = self.transport().ok_or_else(|| Error::Write(closed_error()))?;
        match with_timeout(timeout, transport.write_all(data)).await {
            Some(res) => res.map_err(Error::Write),
            None => {
                self.close();
                Err(Error::WriteTimeout)
            }
        }
    }

    async fn start_tls(
        &self,
        server_name: ServerName<'static>,
        tls_config: Arc<ClientConfig>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let _read = self.read_lock.lock().await?;
        let _write = self.write_lock.lock().await?;
        if self.closed.get() {
            return Err(Error::Connect(closed_error()));
        }
        // SAFETY: both locks are held, nothing else can touch the transport.
        let slot = unsafe { &mut *self.transport.get() };
        if matches!(slot, Some(Transport::TlsInTls(_))) {
            return Err(Error::Unsupported("TLS nested more than two levels"));
        }
        let transport = slot.take().ok_or_else(|| Error::Connect(closed_error()))?;

        #[cfg(feature = "logging")]
        tracing::debug!(server_name = ?server_name, "connection.start_tls");

        let connector = TlsConnector::from(tls_config);
        let handshake = async move {
            match transport {
                Transport::Plain(s) => connector
                    .connect(server_name, s)
                    .await
                    .map(Transport::Tls)
                    .map_err(tls_error),
                Transport::Tls(s) => connector
                    .connect(server_name, s)
                    .await
                    .map(Transport::TlsInTls)
                    .map_err(tls_error),
                Transport::TlsInTls(_) => Err(Error::Unsupported("TLS nested more than two levels")),
            }
        };
        let upgraded = match with_timeout(timeout, handshake).await {
            Some(Ok(t)) => t,
            Some(Err(e)) => {
                self.closed.set(true);
                return Err(e);
            }
            None => {
                self.closed.set(true);
                return Err(Error::ConnectTimeout);
            }
        };
        self.negotiated
            .set(version_from_alpn(upgraded.alpn_protocol().as_deref()));
        *slot = Some(upgraded);
        Ok(())
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        // wakes any in-flight read or write; the fd itself is released on drop
        unsafe {
            libc::shutdown(self.fd, libc::SHUT_RDWR);
        }
    }

    fn negotiated_protocol(&self) -> HttpVersion {
        self.negotiated.get()
    }

    fn is_peer_readable(&self) -> bool {
        if self.closed.get() {
            return true;
        }
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let n = unsafe { libc::poll(&mut pfd, 1, 0) };
        n > 0 && pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0
    }
}
