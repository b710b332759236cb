use std::{
    cell::{Cell, RefCell},
    fmt,
    net::IpAddr,
    path::PathBuf,
    rc::Rc,
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use monoio_http_proto::Headers;
use rustls::{pki_types::ServerName, ClientConfig};
use service_async::Param;

use crate::{
    backend::{Backend, NetworkStream},
    body::{ByteStream, FixedByteStream},
    config::{with_alpn, HttpVersion, PoolConfig, ProxyConfig, ReasonPhrase, Timeouts},
    http11::Http11Connection,
    http2::Http2Connection,
    origin::{Origin, Url},
    request::{merge_headers, Request},
    response::ConnectionResponse,
    util::{exponential_backoff, AsyncMutex},
    Error, Result,
};

const RETRIES_BACKOFF_FACTOR: f64 = 0.5;

/// How a [`Connection`] opens its socket and which protocols it may speak.
#[derive(Clone)]
pub(crate) struct ConnectOptions {
    pub http1: bool,
    pub http2: bool,
    pub keepalive_expiry: Option<Duration>,
    pub uds: Option<PathBuf>,
    pub local_address: Option<IpAddr>,
    pub retries: usize,
    /// ALPN already applied.
    pub tls_config: Arc<ClientConfig>,
}

impl ConnectOptions {
    pub(crate) fn direct(config: &PoolConfig) -> Self {
        Self {
            http1: config.http1,
            http2: config.http2,
            keepalive_expiry: config.keepalive_expiry,
            uds: config.uds.clone(),
            local_address: config.local_address,
            retries: config.retries,
            tls_config: with_alpn(&config.tls_config, config.http1, config.http2),
        }
    }

    /// Towards the proxy itself: HTTP/1.1 only, the proxy's TLS settings.
    pub(crate) fn proxy(config: &PoolConfig, proxy: &ProxyConfig) -> Self {
        Self {
            http1: true,
            http2: false,
            keepalive_expiry: config.keepalive_expiry,
            uds: None,
            local_address: config.local_address,
            retries: config.retries,
            tls_config: with_alpn(&proxy.tls_config, true, false),
        }
    }
}

/// Where a tunnelled connection's `CONNECT` goes.
pub(crate) struct TunnelRoute {
    pub proxy_origin: Origin,
    pub proxy_headers: Headers,
    pub proxy_options: ConnectOptions,
}

enum Versioned<S> {
    Http11(Http11Connection<S>),
    Http2(Http2Connection<S>),
}

impl<S> Clone for Versioned<S> {
    fn clone(&self) -> Self {
        match self {
            Versioned::Http11(c) => Versioned::Http11(c.clone()),
            Versioned::Http2(c) => Versioned::Http2(c.clone()),
        }
    }
}

macro_rules! dispatch {
    ($v:expr, $c:ident => $e:expr) => {
        match $v {
            Versioned::Http11($c) => $e,
            Versioned::Http2($c) => $e,
        }
    };
}

struct Inner<B: Backend> {
    origin: Origin,
    backend: B,
    options: ConnectOptions,
    tunnel: Option<Rc<TunnelRoute>>,
    connection: RefCell<Option<Versioned<B::Stream>>>,
    connect_failed: Cell<bool>,
    request_lock: AsyncMutex,
}

/// A pooled connection to one origin. It connects lazily on its first
/// request, then hands requests to the HTTP/1.1 or HTTP/2 connection the
/// negotiation produced.
pub struct Connection<B: Backend> {
    inner: Rc<Inner<B>>,
}

impl<B: Backend> Clone for Connection<B> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<B: Backend> Connection<B> {
    pub(crate) fn new(origin: Origin, backend: B, options: ConnectOptions) -> Self {
        Self::build(origin, backend, options, None)
    }

    pub(crate) fn tunnelled(
        origin: Origin,
        backend: B,
        options: ConnectOptions,
        tunnel: Rc<TunnelRoute>,
    ) -> Self {
        Self::build(origin, backend, options, Some(tunnel))
    }

    fn build(
        origin: Origin,
        backend: B,
        options: ConnectOptions,
        tunnel: Option<Rc<TunnelRoute>>,
    ) -> Self {
        Self {
            inner: Rc::new(Inner {
                origin,
                backend,
                options,
                tunnel,
                connection: RefCell::new(None),
                connect_failed: Cell::new(false),
                request_lock: AsyncMutex::new(),
            }),
        }
    }

    pub fn origin(&self) -> &Origin {
        &self.inner.origin
    }

    pub(crate) fn ptr_eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) async fn handle_request<Bd: ByteStream>(
        &self,
        request: &mut Request<Bd>,
    ) -> Result<ConnectionResponse<B::Stream>> {
        let versioned = {
            let _guard = self.inner.request_lock.lock().await?;
            let current = self.inner.connection.borrow().clone();
            match current {
                Some(v) => {
                    if !dispatch!(&v, c => c.is_available()) {
                        return Err(Error::NewConnectionRequired);
                    }
                    v
                }
                None if self.inner.connect_failed.get() => {
                    return Err(Error::NewConnectionRequired)
                }
                None => {
                    let mut attempt = ConnectAttempt {
                        failed: &self.inner.connect_failed,
                        completed: false,
                    };
                    let v = self.establish(request.timeouts()).await?;
                    attempt.completed = true;
                    *self.inner.connection.borrow_mut() = Some(v.clone());
                    v
                }
            }
        };
        dispatch!(&versioned, c => c.handle_request(request).await)
    }

    async fn establish(&self, timeouts: Timeouts) -> Result<Versioned<B::Stream>> {
        let stream = match &self.inner.tunnel {
            // the target connection adopts the proxy's socket
            Some(tunnel) => self.connect_tunnel(tunnel, timeouts).await?,
            None => {
                let stream = self
                    .open_stream(&self.inner.origin, &self.inner.options, timeouts)
                    .await?;
                if self.inner.origin.is_tls() {
                    stream
                        .start_tls(
                            server_name(&self.inner.origin)?,
                            self.inner.options.tls_config.clone(),
                            timeouts.connect,
                        )
                        .await?;
                }
                stream
            }
        };
        Ok(self.negotiate(stream))
    }

    /// Opens a socket to `origin`, retrying connect failures with backoff.
    async fn open_stream(
        &self,
        origin: &Origin,
        options: &ConnectOptions,
        timeouts: Timeouts,
    ) -> Result<Rc<B::Stream>> {
        let mut retries_left = options.retries;
        // the leading zero of the sequence is the first attempt
        let mut delays = exponential_backoff(RETRIES_BACKOFF_FACTOR).skip(1);
        loop {
            let opened = match &options.uds {
                Some(path) => self.inner.backend.open_uds_stream(path, timeouts.connect).await,
                None => {
                    self.inner
                        .backend
                        .open_tcp_stream(
                            origin.connect_host(),
                            origin.port,
                            timeouts.connect,
                            options.local_address,
                        )
                        .await
                }
            };
            match opened {
                Ok(stream) => return Ok(Rc::new(stream)),
                Err(e) if e.is_connect_error() && retries_left > 0 => {
                    retries_left -= 1;
                    let delay = delays.next().unwrap_or_default();
                    #[cfg(feature = "logging")]
                    tracing::debug!(%origin, ?delay, retries_left, "connection.retry");
                    self.inner.backend.sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// `CONNECT` through the proxy, then TLS to the target over the tunnel
    /// when the target is https.
    async fn connect_tunnel(
        &self,
        tunnel: &TunnelRoute,
        timeouts: Timeouts,
    ) -> Result<Rc<B::Stream>> {
        let target = &self.inner.origin;
        let proxy_stream = self
            .open_stream(&tunnel.proxy_origin, &tunnel.proxy_options, timeouts)
            .await?;
        if tunnel.proxy_origin.is_tls() {
            proxy_stream
                .start_tls(
                    server_name(&tunnel.proxy_origin)?,
                    tunnel.proxy_options.tls_config.clone(),
                    timeouts.connect,
                )
                .await?;
        }
        let proxy = Http11Connection::new(
            tunnel.proxy_origin.clone(),
            proxy_stream,
            tunnel.proxy_options.keepalive_expiry,
        );

        let authority = Bytes::from(target.authority());
        let headers = merge_headers(
            &[
                (Bytes::from_static(b"Host"), authority.clone()),
                (Bytes::from_static(b"Accept"), Bytes::from_static(b"*/*")),
            ],
            &tunnel.proxy_headers,
        );
        let url = Url::new(
            tunnel.proxy_origin.scheme.as_str(),
            tunnel.proxy_origin.host.clone(),
            Some(tunnel.proxy_origin.port),
            authority,
        );
        let mut connect = Request::new("CONNECT", url, headers, FixedByteStream::empty())
            .with_timeouts(timeouts);
        let mut response = proxy.handle_request(&mut connect).await?;
        while let Some(chunk) = response.body.next().await {
            chunk?;
        }
        response.body.close();

        if !(200..300).contains(&response.status) {
            proxy.close();
            let reason = response
                .extensions
                .get::<ReasonPhrase>()
                .map(|r| String::from_utf8_lossy(&r.0).into_owned())
                .unwrap_or_default();
            return Err(Error::Proxy(format!("{} {}", response.status, reason)));
        }
        #[cfg(feature = "logging")]
        tracing::debug!(proxy = %tunnel.proxy_origin, %target, "proxy.connect_tunnel");

        if target.is_tls() {
            proxy
                .start_tls(
                    server_name(target)?,
                    self.inner.options.tls_config.clone(),
                    timeouts.connect,
                )
                .await
        } else {
            Ok(proxy.stream())
        }
    }

    fn negotiate(&self, stream: Rc<B::Stream>) -> Versioned<B::Stream> {
        let options = &self.inner.options;
        let origin = self.inner.origin.clone();
        if stream.negotiated_protocol() == HttpVersion::Http2 || (options.http2 && !options.http1) {
            Versioned::Http2(Http2Connection::new(origin, stream, options.keepalive_expiry))
        } else {
            Versioned::Http11(Http11Connection::new(origin, stream, options.keepalive_expiry))
        }
    }

    pub fn http_version(&self) -> Option<HttpVersion> {
        self.inner.connection.borrow().as_ref().map(|v| match v {
            Versioned::Http11(_) => HttpVersion::Http11,
            Versioned::Http2(_) => HttpVersion::Http2,
        })
    }

    /// Not yet connected counts as available when HTTP/2 is possible, so
    /// concurrent requests wait on this connection instead of opening more.
    pub fn is_available(&self) -> bool {
        match &*self.inner.connection.borrow() {
            Some(v) => dispatch!(v, c => c.is_available()),
            None => self.inner.options.http2 && !self.inner.connect_failed.get(),
        }
    }

    pub fn has_expired(&self) -> bool {
        match &*self.inner.connection.borrow() {
            Some(v) => dispatch!(v, c => c.has_expired()),
            None => self.inner.connect_failed.get(),
        }
    }

    pub fn should_close(&self) -> bool {
        match &*self.inner.connection.borrow() {
            Some(v) => dispatch!(v, c => c.should_close() || c.is_closed()),
            None => self.inner.connect_failed.get(),
        }
    }

    pub fn is_idle(&self) -> bool {
        match &*self.inner.connection.borrow() {
            Some(v) => dispatch!(v, c => c.is_idle()),
            None => self.inner.connect_failed.get(),
        }
    }

    pub fn is_closed(&self) -> bool {
        match &*self.inner.connection.borrow() {
            Some(v) => dispatch!(v, c => c.is_closed()),
            None => self.inner.connect_failed.get(),
        }
    }

    pub fn info(&self) -> String {
        match &*self.inner.connection.borrow() {
            Some(v) => dispatch!(v, c => c.info()),
            None if self.inner.connect_failed.get() => "CONNECTION FAILED".to_string(),
            None => "CONNECTING".to_string(),
        }
    }

    /// Idempotent.
    pub fn close(&self) {
        if let Some(v) = &*self.inner.connection.borrow() {
            dispatch!(v, c => c.close());
        }
    }
}

impl<B: Backend> fmt::Debug for Connection<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Connection [{}, {}]>", self.inner.origin, self.info())
    }
}

/// Marks the connection permanently failed unless the connect attempt runs
/// to completion, including when the request is dropped mid-connect.
struct ConnectAttempt<'a> {
    failed: &'a Cell<bool>,
    completed: bool,
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.failed.set(true);
        }
    }
}

fn server_name(origin: &Origin) -> Result<ServerName<'static>> {
    Param::<Option<ServerName<'static>>>::param(origin)
        .ok_or_else(|| Error::LocalProtocol(format!("invalid TLS server name: {}", origin.host)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::default_tls_config,
        mock::{h1_response, h2_response, h2_settings, MockBackend, MockStream},
        origin::Scheme,
    };

    fn options(http1: bool, http2: bool, retries: usize) -> ConnectOptions {
        ConnectOptions {
            http1,
            http2,
            keepalive_expiry: None,
            uds: None,
            local_address: None,
            retries,
            tls_config: with_alpn(&default_tls_config(), http1, http2),
        }
    }

    fn get(scheme: &str) -> Request {
        Request::get(Url::new(scheme, "example.test", None, "/"))
    }

    #[monoio::test(enable_timer = true)]
    async fn connects_lazily_http11() {
        let backend = MockBackend::new(vec![MockStream::new([h1_response("200 OK", "hi")])]);
        let conn = Connection::new(
            Origin::new(Scheme::Http, "example.test", 80),
            backend.clone(),
            options(true, false, 0),
        );
        assert_eq!(conn.info(), "CONNECTING");
        assert!(!conn.is_available());
        let mut resp = conn.handle_request(&mut get("http")).await.unwrap();
        assert_eq!(conn.http_version(), Some(HttpVersion::Http11));
        while resp.body.next().await.is_some() {}
        assert_eq!(conn.info(), "HTTP/1.1, IDLE, Request Count: 1");
        assert_eq!(backend.connects(), 1);
    }

    #[monoio::test(enable_timer = true)]
    async fn alpn_selects_http2() {
        let stream = MockStream::new([h2_settings(100), h2_response(1, b"h2")]).http2();
        let handle = stream.handle();
        let backend = MockBackend::new(vec![stream]);
        let conn = Connection::new(
            Origin::new(Scheme::Https, "example.test", 443),
            backend,
            options(true, true, 0),
        );
        assert!(conn.is_available());
        let mut resp = conn.handle_request(&mut get("https")).await.unwrap();
        assert_eq!(conn.http_version(), Some(HttpVersion::Http2));
        assert_eq!(resp.body.next().await.unwrap().unwrap(), "h2");
        assert_eq!(*handle.tls_started.borrow(), vec!["example.test".to_string()]);
    }

    #[monoio::test(enable_timer = true)]
    async fn retries_with_backoff() {
        let backend = MockBackend::default();
        backend.push_connect_error();
        backend.push_connect_error();
        backend.push(MockStream::new([h1_response("200 OK", "")]));
        let conn = Connection::new(
            Origin::new(Scheme::Http, "example.test", 80),
            backend.clone(),
            options(true, false, 2),
        );
        assert!(conn.handle_request(&mut get("http")).await.is_ok());
        assert_eq!(backend.connects(), 3);
        assert_eq!(
            backend.sleeps(),
            vec![Duration::from_millis(500), Duration::from_secs(1)]
        );
    }

    #[monoio::test(enable_timer = true)]
    async fn failed_connect_is_permanent() {
        let backend = MockBackend::default();
        backend.push_connect_error();
        let conn = Connection::new(
            Origin::new(Scheme::Http, "example.test", 80),
            backend.clone(),
            options(true, true, 0),
        );
        let err = conn.handle_request(&mut get("http")).await.err().unwrap();
        assert!(err.is_connect_error());
        assert_eq!(conn.info(), "CONNECTION FAILED");
        assert!(conn.is_closed());
        assert!(!conn.is_available());
        assert!(matches!(
            conn.handle_request(&mut get("http")).await,
            Err(Error::NewConnectionRequired)
        ));
        assert_eq!(backend.connects(), 1);
    }

    #[monoio::test(enable_timer = true)]
    async fn dropped_while_connecting_is_failed() {
        let backend = MockBackend::new(vec![MockStream::new([h1_response("200 OK", "")])]);
        backend.connect_delay(Duration::from_millis(100));
        let conn = Connection::new(
            Origin::new(Scheme::Http, "example.test", 80),
            backend.clone(),
            options(true, true, 0),
        );
        let mut req = get("http");
        let res =
            monoio::time::timeout(Duration::from_millis(10), conn.handle_request(&mut req)).await;
        assert!(res.is_err());
        assert_eq!(conn.info(), "CONNECTION FAILED");
        assert!(conn.is_closed());
        assert!(!conn.is_available());
        assert!(matches!(
            conn.handle_request(&mut get("http")).await,
            Err(Error::NewConnectionRequired)
        ));
        assert_eq!(backend.connects(), 1);
    }

    #[monoio::test(enable_timer = true)]
    async fn http2_prior_knowledge() {
        let backend = MockBackend::new(vec![MockStream::new([
            h2_settings(100),
            h2_response(1, b""),
        ])]);
        let conn = Connection::new(
            Origin::new(Scheme::Http, "example.test", 80),
            backend,
            options(false, true, 0),
        );
        conn.handle_request(&mut get("http")).await.unwrap();
        assert_eq!(conn.http_version(), Some(HttpVersion::Http2));
    }

    #[monoio::test(enable_timer = true)]
    async fn tunnel_rejected_by_proxy() {
        let proxy_stream = MockStream::new([
            "HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n",
        ]);
        let handle = proxy_stream.handle();
        let backend = MockBackend::new(vec![proxy_stream]);
        let proxy_origin = Origin::new(Scheme::Http, "proxy.test", 8080);
        let conn = Connection::tunnelled(
            Origin::new(Scheme::Https, "example.test", 443),
            backend,
            options(true, false, 0),
            Rc::new(TunnelRoute {
                proxy_origin,
                proxy_headers: vec![(
                    Bytes::from_static(b"Proxy-Authorization"),
                    Bytes::from_static(b"Basic Zm9vOmJhcg=="),
                )],
                proxy_options: options(true, false, 0),
            }),
        );
        let err = conn.handle_request(&mut get("https")).await.err().unwrap();
        assert!(
            matches!(&err, Error::Proxy(msg) if msg == "407 Proxy Authentication Required"),
            "{err:?}"
        );
        let written = handle.written_str();
        assert!(written.starts_with("CONNECT example.test:443 HTTP/1.1\r\n"));
        assert!(written.contains("Accept: */*\r\n"));
        assert!(written.contains("Proxy-Authorization: Basic Zm9vOmJhcg==\r\n"));
        assert!(handle.closed.get());
    }
}
