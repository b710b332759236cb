use std::{
    cell::{Cell, RefCell},
    fmt,
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use http::Extensions;
use monoio_http_proto::h1::{ClientConnection, Event, RequestHead, ResponseHead, State};
use rustls::{pki_types::ServerName, ClientConfig};

use crate::{
    backend::NetworkStream,
    body::ByteStream,
    config::{HttpVersion, ReasonPhrase},
    origin::Origin,
    request::Request,
    response::{BodyStream, ConnectionResponse},
    Error, Result,
};

const READ_NUM_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Http11State {
    New,
    Active,
    Idle,
    Closed,
}

impl fmt::Display for Http11State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Http11State::New => "NEW",
            Http11State::Active => "ACTIVE",
            Http11State::Idle => "IDLE",
            Http11State::Closed => "CLOSED",
        })
    }
}

struct Inner<S> {
    origin: Origin,
    stream: Rc<S>,
    h11: RefCell<ClientConnection>,
    state: Cell<Http11State>,
    keepalive_expiry: Option<Duration>,
    expire_at: Cell<Option<Instant>>,
    request_count: Cell<usize>,
}

/// One HTTP/1.1 connection; a single request at a time, no pipelining.
pub struct Http11Connection<S> {
    inner: Rc<Inner<S>>,
}

impl<S> Clone for Http11Connection<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: NetworkStream> Http11Connection<S> {
    pub fn new(origin: Origin, stream: Rc<S>, keepalive_expiry: Option<Duration>) -> Self {
        Self {
            inner: Rc::new(Inner {
                origin,
                stream,
                h11: RefCell::new(ClientConnection::new()),
                state: Cell::new(Http11State::New),
                keepalive_expiry,
                expire_at: Cell::new(None),
                request_count: Cell::new(0),
            }),
        }
    }

    pub(crate) async fn handle_request<B: ByteStream>(
        &self,
        request: &mut Request<B>,
    ) -> Result<ConnectionResponse<S>> {
        let inner = &self.inner;
        match inner.state.get() {
            Http11State::New | Http11State::Idle => {
                inner.state.set(Http11State::Active);
                inner.expire_at.set(None);
                inner.request_count.set(inner.request_count.get() + 1);
            }
            _ => return Err(Error::NewConnectionRequired),
        }

        let timeouts = request.timeouts();
        let mut pending = PendingExchange {
            conn: self,
            armed: true,
        };
        let head = self.exchange(request, timeouts.write, timeouts.read).await?;
        pending.armed = false;

        let mut extensions = Extensions::new();
        extensions.insert(HttpVersion::Http11);
        extensions.insert(ReasonPhrase(head.reason.clone()));
        Ok(ConnectionResponse {
            status: head.status,
            headers: head.headers,
            extensions,
            body: BodyStream::Http11(Http11Body {
                conn: self.clone(),
                read_timeout: timeouts.read,
                done: false,
            }),
        })
    }

    async fn exchange<B: ByteStream>(
        &self,
        request: &mut Request<B>,
        write_timeout: Option<Duration>,
        read_timeout: Option<Duration>,
    ) -> Result<ResponseHead> {
        let head = RequestHead::new(
            request.method.clone(),
            request.url.target.clone(),
            request.headers.clone(),
        );
        let bytes = self.inner.h11.borrow_mut().send_request(&head)?;
        #[cfg(feature = "logging")]
        tracing::debug!(origin = %self.inner.origin, method = ?head.method, "http11.send_request_headers");
        self.inner.stream.write(bytes, write_timeout).await?;

        while let Some(chunk) = request.body.next().await {
            let bytes = self.inner.h11.borrow_mut().send_data(&chunk?)?;
            self.inner.stream.write(bytes, write_timeout).await?;
        }
        let bytes = self.inner.h11.borrow_mut().send_end_of_message()?;
        self.inner.stream.write(bytes, write_timeout).await?;

        loop {
            match self.receive_event(read_timeout).await? {
                Event::Response(head) => {
                    #[cfg(feature = "logging")]
                    tracing::debug!(origin = %self.inner.origin, status = head.status, "http11.receive_response_headers");
                    return Ok(head);
                }
                Event::ConnectionClosed => {
                    return Err(Error::RemoteProtocol(
                        "Server disconnected without sending a response.".into(),
                    ))
                }
                // 1xx responses are skipped
                _ => continue,
            }
        }
    }

    async fn receive_event(&self, timeout: Option<Duration>) -> Result<Event> {
        loop {
            let event = self.inner.h11.borrow_mut().next_event()?;
            if !matches!(event, Event::NeedData) {
                return Ok(event);
            }
            let data = self.inner.stream.read(READ_NUM_BYTES, timeout).await?;
            let mut h11 = self.inner.h11.borrow_mut();
            if data.is_empty() && h11.their_state() == State::SendResponse {
                return Err(Error::RemoteProtocol(
                    "Server disconnected without sending a response.".into(),
                ));
            }
            h11.receive_data(&data)?;
        }
    }

    /// Called once the response body is finished or abandoned.
    pub(crate) fn response_closed(&self) {
        let inner = &self.inner;
        if inner.state.get() == Http11State::Closed {
            return;
        }
        let mut h11 = inner.h11.borrow_mut();
        if h11.our_state() == State::Done && h11.their_state() == State::Done {
            if h11.start_next_cycle().is_ok() {
                inner.state.set(Http11State::Idle);
                inner
                    .expire_at
                    .set(inner.keepalive_expiry.map(|d| Instant::now() + d));
                return;
            }
        } else if h11.their_state() == State::SwitchedProtocol {
            // the socket now carries a tunnel; it is no longer ours to close
            return;
        }
        drop(h11);
        self.close();
    }

    /// Upgrades the socket in place, for tunnels through this connection.
    pub async fn start_tls(
        &self,
        server_name: ServerName<'static>,
        tls_config: Arc<ClientConfig>,
        timeout: Option<Duration>,
    ) -> Result<Rc<S>> {
        self.inner
            .stream
            .start_tls(server_name, tls_config, timeout)
            .await?;
        Ok(self.inner.stream.clone())
    }

    pub(crate) fn stream(&self) -> Rc<S> {
        self.inner.stream.clone()
    }

    pub fn close(&self) {
        let inner = &self.inner;
        if inner.state.replace(Http11State::Closed) == Http11State::Closed {
            return;
        }
        inner.h11.borrow_mut().send_connection_closed();
        inner.stream.close();
    }

    pub fn state(&self) -> Http11State {
        self.inner.state.get()
    }

    pub fn is_idle(&self) -> bool {
        self.inner.state.get() == Http11State::Idle
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.get() == Http11State::Closed
    }

    pub fn has_expired(&self) -> bool {
        self.is_idle()
            && self
                .inner
                .expire_at
                .get()
                .map_or(false, |at| Instant::now() >= at)
    }

    /// Idle and either past keep-alive or readable; the only thing an idle
    /// connection can read is EOF.
    pub fn should_close(&self) -> bool {
        self.is_idle() && (self.has_expired() || self.inner.stream.is_peer_readable())
    }

    pub fn is_available(&self) -> bool {
        self.is_idle() && !self.should_close()
    }

    pub fn info(&self) -> String {
        format!(
            "HTTP/1.1, {}, Request Count: {}",
            self.inner.state.get(),
            self.inner.request_count.get()
        )
    }

    pub fn origin(&self) -> &Origin {
        &self.inner.origin
    }
}

impl<S> fmt::Debug for Http11Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Http11Connection [{}, {}, Request Count: {}]>",
            self.inner.origin,
            self.inner.state.get(),
            self.inner.request_count.get()
        )
    }
}

/// Ends an exchange that fails or is dropped before the response head
/// arrives; the connection is then closed.
struct PendingExchange<'a, S: NetworkStream> {
    conn: &'a Http11Connection<S>,
    armed: bool,
}

impl<S: NetworkStream> Drop for PendingExchange<'_, S> {
    fn drop(&mut self) {
        if self.armed {
            self.conn.response_closed();
        }
    }
}

/// Response body read straight off the connection.
pub(crate) struct Http11Body<S: NetworkStream> {
    conn: Http11Connection<S>,
    read_timeout: Option<Duration>,
    done: bool,
}

impl<S: NetworkStream> Http11Body<S> {
    pub(crate) async fn next(&mut self) -> Option<Result<Bytes>> {
        if self.done {
            return None;
        }
        loop {
            match self.conn.receive_event(self.read_timeout).await {
                Ok(Event::Data(data)) => return Some(Ok(data)),
                Ok(Event::EndOfMessage(_)) | Ok(Event::Paused) | Ok(Event::ConnectionClosed) => {
                    self.close();
                    return None;
                }
                Ok(_) => continue,
                Err(e) => {
                    self.close();
                    return Some(Err(e));
                }
            }
        }
    }

    pub(crate) fn close(&mut self) {
        if !self.done {
            self.done = true;
            self.conn.response_closed();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        body::FixedByteStream,
        mock::{h1_response, MockStream},
        origin::{Scheme, Url},
    };

    fn connection(stream: MockStream) -> Http11Connection<MockStream> {
        Http11Connection::new(
            Origin::new(Scheme::Http, "example.test", 80),
            Rc::new(stream),
            None,
        )
    }

    fn get() -> Request {
        Request::get(Url::new("http", "example.test", None, "/"))
    }

    #[monoio::test(enable_timer = true)]
    async fn get_and_reuse() {
        let stream = MockStream::new([h1_response("200 OK", "hello"), h1_response("200 OK", "again")]);
        let handle = stream.handle();
        let conn = connection(stream);
        assert_eq!(conn.info(), "HTTP/1.1, NEW, Request Count: 0");

        let mut resp = conn.handle_request(&mut get()).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(&resp.headers[0].0[..], b"Content-Type");
        assert_eq!(
            resp.extensions.get::<ReasonPhrase>(),
            Some(&ReasonPhrase(Bytes::from_static(b"OK")))
        );
        assert_eq!(resp.body.next().await.unwrap().unwrap(), "hello");
        assert!(resp.body.next().await.is_none());
        assert!(conn.is_idle());
        assert!(conn.is_available());
        assert_eq!(conn.info(), "HTTP/1.1, IDLE, Request Count: 1");

        let mut resp = conn.handle_request(&mut get()).await.unwrap();
        assert_eq!(resp.body.next().await.unwrap().unwrap(), "again");
        assert!(resp.body.next().await.is_none());
        assert_eq!(conn.info(), "HTTP/1.1, IDLE, Request Count: 2");
        assert!(handle
            .written_str()
            .starts_with("GET / HTTP/1.1\r\nHost: example.test\r\n\r\n"));
    }

    #[monoio::test(enable_timer = true)]
    async fn dropped_before_response_closes() {
        let stream = MockStream::new(Vec::<Bytes>::new()).stall();
        let handle = stream.handle();
        let conn = connection(stream);
        let mut req = get();
        let res = monoio::time::timeout(
            Duration::from_millis(10),
            conn.handle_request(&mut req),
        )
        .await;
        assert!(res.is_err());
        assert!(conn.is_closed());
        assert!(handle.closed.get());
        assert!(matches!(
            conn.handle_request(&mut get()).await,
            Err(Error::NewConnectionRequired)
        ));
    }

    #[monoio::test(enable_timer = true)]
    async fn busy_connection_refuses() {
        let conn = connection(MockStream::new([h1_response("200 OK", "hello")]));
        let mut resp = conn.handle_request(&mut get()).await.unwrap();
        assert!(matches!(
            conn.handle_request(&mut get()).await,
            Err(Error::NewConnectionRequired)
        ));
        resp.body.close();
        // closing before the end of the body kills the connection
        assert!(conn.is_closed());
    }

    #[monoio::test(enable_timer = true)]
    async fn disconnect_without_response() {
        let conn = connection(MockStream::new(Vec::<Bytes>::new()));
        let err = conn.handle_request(&mut get()).await.err().unwrap();
        assert!(matches!(err, Error::RemoteProtocol(msg) if msg.contains("Server disconnected")));
        assert!(conn.is_closed());
    }

    #[monoio::test(enable_timer = true)]
    async fn informational_skipped() {
        let mut first = b"HTTP/1.1 100 Continue\r\n\r\n".to_vec();
        first.extend_from_slice(&h1_response("201 Created", "ok"));
        let conn = connection(MockStream::new([first]));
        let mut resp = conn.handle_request(&mut get()).await.unwrap();
        assert_eq!(resp.status, 201);
        assert_eq!(resp.body.next().await.unwrap().unwrap(), "ok");
    }

    #[monoio::test(enable_timer = true)]
    async fn chunked_request_body() {
        let stream = MockStream::new([h1_response("200 OK", "")]);
        let handle = stream.handle();
        let conn = connection(stream);
        let mut req = Request::new(
            "POST",
            Url::new("http", "example.test", None, "/upload"),
            vec![
                (Bytes::from_static(b"Host"), Bytes::from_static(b"example.test")),
                (Bytes::from_static(b"Transfer-Encoding"), Bytes::from_static(b"chunked")),
            ],
            FixedByteStream::new("abc"),
        );
        let mut resp = conn.handle_request(&mut req).await.unwrap();
        assert!(resp.body.next().await.is_none());
        assert!(handle.written_str().ends_with("\r\n\r\n3\r\nabc\r\n0\r\n\r\n"));
        assert!(conn.is_idle());
    }

    #[monoio::test(enable_timer = true)]
    async fn connection_close_header() {
        let response = "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 2\r\n\r\nok";
        let conn = connection(MockStream::new([response]));
        let mut resp = conn.handle_request(&mut get()).await.unwrap();
        assert_eq!(resp.body.next().await.unwrap().unwrap(), "ok");
        assert!(resp.body.next().await.is_none());
        assert!(conn.is_closed());
    }

    #[monoio::test(enable_timer = true)]
    async fn peer_disconnect_while_idle() {
        let stream = MockStream::new([h1_response("200 OK", "hello")]);
        let handle = stream.handle();
        let conn = connection(stream);
        let mut resp = conn.handle_request(&mut get()).await.unwrap();
        while resp.body.next().await.is_some() {}
        assert!(!conn.should_close());
        handle.peer_closed.set(true);
        assert!(conn.should_close());
        assert!(!conn.is_available());
    }

    #[monoio::test(enable_timer = true)]
    async fn keepalive_expiry() {
        let conn = Http11Connection::new(
            Origin::new(Scheme::Http, "example.test", 80),
            Rc::new(MockStream::new([h1_response("200 OK", "")])),
            Some(Duration::ZERO),
        );
        let mut resp = conn.handle_request(&mut get()).await.unwrap();
        while resp.body.next().await.is_some() {}
        assert!(conn.has_expired());
        assert!(conn.should_close());
    }
}
