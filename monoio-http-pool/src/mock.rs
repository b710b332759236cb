//! Scripted streams and backend for tests.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    io,
    net::IpAddr,
    path::Path,
    rc::Rc,
    sync::Arc,
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use monoio_http_proto::h2::{frame::Frame, settings::SETTINGS_MAX_CONCURRENT_STREAMS};
use rustls::{pki_types::ServerName, ClientConfig};

use crate::{
    backend::{Backend, NetworkStream},
    config::HttpVersion,
    Error, Result,
};

/// Shared view into a [`MockStream`] that outlives the move into a connection.
#[derive(Clone, Default)]
pub(crate) struct MockHandle {
    pub written: Rc<RefCell<Vec<u8>>>,
    pub peer_closed: Rc<Cell<bool>>,
    pub closed: Rc<Cell<bool>>,
    pub tls_started: Rc<RefCell<Vec<String>>>,
}

impl MockHandle {
    pub fn written_str(&self) -> String {
        String::from_utf8_lossy(&self.written.borrow()).into_owned()
    }
}

/// Hands out queued chunks one per read, then EOF, or nothing at all once
/// [`MockStream::stall`] is set.
pub(crate) struct MockStream {
    chunks: RefCell<VecDeque<Bytes>>,
    http2: bool,
    stall: bool,
    handle: MockHandle,
}

impl MockStream {
    pub fn new<I, C>(chunks: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<Bytes>,
    {
        Self {
            chunks: RefCell::new(chunks.into_iter().map(Into::into).collect()),
            http2: false,
            stall: false,
            handle: MockHandle::default(),
        }
    }

    pub fn http2(mut self) -> Self {
        self.http2 = true;
        self
    }

    /// Reads past the script never complete.
    pub fn stall(mut self) -> Self {
        self.stall = true;
        self
    }

    pub fn handle(&self) -> MockHandle {
        self.handle.clone()
    }
}

impl NetworkStream for MockStream {
    async fn read(&self, _max_bytes: usize, _timeout: Option<Duration>) -> Result<Bytes> {
        if self.handle.closed.get() {
            return Err(Error::Read(io::ErrorKind::NotConnected.into()));
        }
        let next = self.chunks.borrow_mut().pop_front();
        match next {
            Some(chunk) => Ok(chunk),
            None if self.stall => std::future::pending().await,
            None => Ok(Bytes::new()),
        }
    }

    async fn write(&self, data: Bytes, _timeout: Option<Duration>) -> Result<()> {
        if self.handle.closed.get() {
            return Err(Error::Write(io::ErrorKind::NotConnected.into()));
        }
        self.handle.written.borrow_mut().extend_from_slice(&data);
        Ok(())
    }

    async fn start_tls(
        &self,
        server_name: ServerName<'static>,
        _tls_config: Arc<ClientConfig>,
        _timeout: Option<Duration>,
    ) -> Result<()> {
        self.handle
            .tls_started
            .borrow_mut()
            .push(server_name.to_str().into_owned());
        Ok(())
    }

    fn close(&self) {
        self.handle.closed.set(true);
    }

    fn negotiated_protocol(&self) -> HttpVersion {
        if self.http2 {
            HttpVersion::Http2
        } else {
            HttpVersion::Http11
        }
    }

    fn is_peer_readable(&self) -> bool {
        self.handle.peer_closed.get() || self.handle.closed.get()
    }
}

#[derive(Default)]
struct MockBackendInner {
    // None stands for a refused connect
    streams: RefCell<VecDeque<Option<MockStream>>>,
    connects: Cell<usize>,
    sleeps: RefCell<Vec<Duration>>,
    connect_delay: Cell<Option<Duration>>,
}

#[derive(Clone, Default)]
pub(crate) struct MockBackend {
    inner: Rc<MockBackendInner>,
}

impl MockBackend {
    pub fn new(streams: Vec<MockStream>) -> Self {
        let backend = Self::default();
        for s in streams {
            backend.push(s);
        }
        backend
    }

    pub fn push(&self, stream: MockStream) {
        self.inner.streams.borrow_mut().push_back(Some(stream));
    }

    pub fn push_connect_error(&self) {
        self.inner.streams.borrow_mut().push_back(None);
    }

    /// Makes every connect take `delay`, so concurrent requests overlap.
    pub fn connect_delay(&self, delay: Duration) {
        self.inner.connect_delay.set(Some(delay));
    }

    pub fn connects(&self) -> usize {
        self.inner.connects.get()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.inner.sleeps.borrow().clone()
    }

    async fn open(&self) -> Result<MockStream> {
        self.inner.connects.set(self.inner.connects.get() + 1);
        if let Some(delay) = self.inner.connect_delay.get() {
            monoio::time::sleep(delay).await;
        }
        match self.inner.streams.borrow_mut().pop_front() {
            Some(Some(stream)) => Ok(stream),
            _ => Err(Error::Connect(io::ErrorKind::ConnectionRefused.into())),
        }
    }
}

impl Backend for MockBackend {
    type Stream = MockStream;

    async fn open_tcp_stream(
        &self,
        _host: &str,
        _port: u16,
        _timeout: Option<Duration>,
        _local_address: Option<IpAddr>,
    ) -> Result<MockStream> {
        self.open().await
    }

    async fn open_uds_stream(&self, _path: &Path, _timeout: Option<Duration>) -> Result<MockStream> {
        self.open().await
    }

    async fn sleep(&self, duration: Duration) {
        self.inner.sleeps.borrow_mut().push(duration);
    }
}

pub(crate) fn h1_response(status_line: &str, body: &str) -> Bytes {
    Bytes::from(format!(
        "HTTP/1.1 {status_line}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    ))
}

fn encode(frame: Frame, buf: &mut BytesMut) {
    frame.encode(buf);
}

pub(crate) fn h2_settings(max_concurrent_streams: u32) -> Bytes {
    let mut buf = BytesMut::new();
    encode(
        Frame::Settings {
            ack: false,
            params: vec![(SETTINGS_MAX_CONCURRENT_STREAMS, max_concurrent_streams)],
        },
        &mut buf,
    );
    buf.freeze()
}

/// `200` response on `stream_id` with a one-frame body.
pub(crate) fn h2_response(stream_id: u32, body: &'static [u8]) -> Bytes {
    let mut buf = BytesMut::new();
    // 0x88 is the static-table entry for `:status: 200`
    encode(
        Frame::Headers {
            stream_id,
            block: Bytes::from_static(&[0x88]),
            end_stream: false,
            end_headers: true,
            priority: None,
        },
        &mut buf,
    );
    encode(
        Frame::Data {
            stream_id,
            payload: Bytes::from_static(body),
            end_stream: true,
            flow_controlled_length: body.len() as u32,
        },
        &mut buf,
    );
    buf.freeze()
}

pub(crate) fn h2_frame(frame: Frame) -> Bytes {
    let mut buf = BytesMut::new();
    encode(frame, &mut buf);
    buf.freeze()
}

pub(crate) fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}
