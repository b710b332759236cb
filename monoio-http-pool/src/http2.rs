use std::{
    cell::{Cell, RefCell},
    collections::{HashMap, VecDeque},
    fmt,
    rc::Rc,
    sync::Arc,
    time::{Duration, Instant},
};

use bytes::Bytes;
use http::Extensions;
use local_sync::semaphore::Semaphore;
use monoio_http_proto::{
    common::header_value,
    h2::{
        settings::SETTINGS_MAX_CONCURRENT_STREAMS, ConnectionState, ErrorCode, Event,
        H2Connection, Settings,
    },
    Headers,
};
use rustls::{pki_types::ServerName, ClientConfig};

use crate::{
    backend::NetworkStream,
    body::ByteStream,
    config::HttpVersion,
    origin::Origin,
    request::Request,
    response::{BodyStream, ConnectionResponse},
    util::AsyncMutex,
    Error, Result,
};

const READ_NUM_BYTES: usize = 64 * 1024;
const LOCAL_MAX_CONCURRENT_STREAMS: u32 = 100;
const LOCAL_MAX_HEADER_LIST_SIZE: u32 = 65_536;
const WINDOW_INCREMENT: u32 = 1 << 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Http2State {
    Active,
    Idle,
    Closed,
}

impl fmt::Display for Http2State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Http2State::Active => "ACTIVE",
            Http2State::Idle => "IDLE",
            Http2State::Closed => "CLOSED",
        })
    }
}

struct Inner<S> {
    origin: Origin,
    stream: Rc<S>,
    h2: RefCell<H2Connection>,
    state: Cell<Http2State>,
    keepalive_expiry: Option<Duration>,
    expire_at: Cell<Option<Instant>>,
    request_count: Cell<usize>,

    init_lock: AsyncMutex,
    initialized: Cell<bool>,
    read_lock: AsyncMutex,
    write_lock: AsyncMutex,

    // one permit per open stream; shrinking below the in-use count is paid
    // back as streams finish
    max_streams: Semaphore,
    max_streams_limit: Cell<u32>,
    permit_debt: Cell<u32>,

    events: RefCell<HashMap<u32, VecDeque<Event>>>,
    failure: RefCell<Option<String>>,
    used_all_stream_ids: Cell<bool>,
}

/// A multiplexed HTTP/2 connection. Requests from any number of tasks share
/// it; whoever holds the read lock reads for everybody and routes events by
/// stream id.
pub struct Http2Connection<S> {
    inner: Rc<Inner<S>>,
}

impl<S> Clone for Http2Connection<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: NetworkStream> Http2Connection<S> {
    pub fn new(origin: Origin, stream: Rc<S>, keepalive_expiry: Option<Duration>) -> Self {
        Self::with_protocol(origin, stream, keepalive_expiry, H2Connection::new())
    }

    pub(crate) fn with_protocol(
        origin: Origin,
        stream: Rc<S>,
        keepalive_expiry: Option<Duration>,
        h2: H2Connection,
    ) -> Self {
        Self {
            inner: Rc::new(Inner {
                origin,
                stream,
                h2: RefCell::new(h2),
                state: Cell::new(Http2State::Idle),
                keepalive_expiry,
                expire_at: Cell::new(None),
                request_count: Cell::new(0),
                init_lock: AsyncMutex::new(),
                initialized: Cell::new(false),
                read_lock: AsyncMutex::new(),
                write_lock: AsyncMutex::new(),
                max_streams: Semaphore::new(LOCAL_MAX_CONCURRENT_STREAMS as usize),
                max_streams_limit: Cell::new(LOCAL_MAX_CONCURRENT_STREAMS),
                permit_debt: Cell::new(0),
                events: RefCell::new(HashMap::new()),
                failure: RefCell::new(None),
                used_all_stream_ids: Cell::new(false),
            }),
        }
    }

    pub(crate) async fn handle_request<B: ByteStream>(
        &self,
        request: &mut Request<B>,
    ) -> Result<ConnectionResponse<S>> {
        let inner = &self.inner;
        if inner.state.get() == Http2State::Closed {
            return Err(Error::NewConnectionRequired);
        }
        inner.state.set(Http2State::Active);
        inner.expire_at.set(None);
        inner.request_count.set(inner.request_count.get() + 1);

        let timeouts = request.timeouts();
        let mut pending = PendingStream {
            conn: self,
            initializing: false,
            stream_id: None,
            armed: true,
        };
        {
            let _guard = inner.init_lock.lock().await?;
            if !inner.initialized.get() {
                pending.initializing = true;
                self.send_connection_init(timeouts.write).await?;
                inner.initialized.set(true);
                pending.initializing = false;
            }
        }

        inner
            .max_streams
            .acquire()
            .await
            .map_err(|_| Error::NewConnectionRequired)?
            .forget();

        let headers = match build_headers(request) {
            Ok(h) => h,
            Err(e) => {
                self.release_permit();
                return Err(e);
            }
        };
        let end_stream = !request.has_body_headers();

        // id reservation and HEADERS go out together, ids must be opened in order
        let opened = {
            let mut h2 = inner.h2.borrow_mut();
            match h2.get_next_available_stream_id() {
                Ok(id) => h2
                    .send_headers(id, &headers, end_stream)
                    .and_then(|_| h2.increment_flow_control_window(WINDOW_INCREMENT, Some(id)))
                    .map(|_| Some(id)),
                Err(_) => Ok(None),
            }
        };
        let stream_id = match opened {
            Ok(Some(id)) => id,
            Ok(None) => {
                inner.used_all_stream_ids.set(true);
                inner.request_count.set(inner.request_count.get() - 1);
                self.release_permit();
                return Err(Error::NewConnectionRequired);
            }
            Err(e) => {
                self.release_permit();
                return Err(e.into());
            }
        };
        inner.events.borrow_mut().insert(stream_id, VecDeque::new());
        pending.stream_id = Some(stream_id);
        #[cfg(feature = "logging")]
        tracing::debug!(origin = %inner.origin, stream_id, "http2.send_request_headers");

        let head = self.exchange(request, stream_id, end_stream).await?;
        pending.armed = false;
        #[cfg(feature = "logging")]
        tracing::debug!(origin = %inner.origin, stream_id, status = head.0, "http2.receive_response_headers");

        let mut extensions = Extensions::new();
        extensions.insert(HttpVersion::Http2);
        Ok(ConnectionResponse {
            status: head.0,
            headers: head.1,
            extensions,
            body: BodyStream::Http2(Http2Body {
                conn: self.clone(),
                stream_id,
                read_timeout: timeouts.read,
                done: false,
            }),
        })
    }

    async fn send_connection_init(&self, timeout: Option<Duration>) -> Result<()> {
        {
            let mut h2 = self.inner.h2.borrow_mut();
            h2.update_settings(Settings {
                max_concurrent_streams: Some(LOCAL_MAX_CONCURRENT_STREAMS),
                max_header_list_size: Some(LOCAL_MAX_HEADER_LIST_SIZE),
                ..Settings::client_default()
            });
            h2.initiate_connection();
            h2.increment_flow_control_window(WINDOW_INCREMENT, None)?;
        }
        #[cfg(feature = "logging")]
        tracing::debug!(origin = %self.inner.origin, "http2.send_connection_init");
        self.flush(timeout).await
    }

    async fn exchange<B: ByteStream>(
        &self,
        request: &mut Request<B>,
        stream_id: u32,
        end_stream: bool,
    ) -> Result<(u16, Headers)> {
        let timeouts = request.timeouts();
        self.flush(timeouts.write).await?;

        if !end_stream {
            while let Some(chunk) = request.body.next().await {
                self.send_stream_data(stream_id, chunk?, timeouts.read, timeouts.write)
                    .await?;
            }
            self.inner.h2.borrow_mut().end_stream(stream_id)?;
            self.flush(timeouts.write).await?;
        }

        loop {
            match self.receive_event(stream_id, timeouts.read).await? {
                Event::ResponseReceived { headers, .. } => return parse_response(headers),
                Event::StreamReset { error_code, .. } => {
                    return Err(Error::RemoteProtocol(format!("stream reset: {error_code:?}")))
                }
                _ => continue,
            }
        }
    }

    async fn send_stream_data(
        &self,
        stream_id: u32,
        mut data: Bytes,
        read_timeout: Option<Duration>,
        write_timeout: Option<Duration>,
    ) -> Result<()> {
        while !data.is_empty() {
            let window = self.send_window(stream_id)?;
            if window == 0 {
                // a read may bring WINDOW_UPDATE
                self.pump(|| matches!(self.send_window(stream_id), Ok(w) if w > 0), read_timeout)
                    .await?;
                continue;
            }
            let chunk = data.split_to(data.len().min(window as usize));
            self.inner
                .h2
                .borrow_mut()
                .send_data(stream_id, chunk, false)?;
            self.flush(write_timeout).await?;
        }
        Ok(())
    }

    fn send_window(&self, stream_id: u32) -> Result<u32> {
        let h2 = self.inner.h2.borrow();
        Ok(h2
            .local_flow_control_window(stream_id)?
            .min(h2.max_outbound_frame_size()))
    }

    /// Next event queued for `stream_id`, reading from the socket as needed.
    async fn receive_event(&self, stream_id: u32, timeout: Option<Duration>) -> Result<Event> {
        loop {
            let next = match self.inner.events.borrow_mut().get_mut(&stream_id) {
                Some(queue) => queue.pop_front(),
                None => return Err(Error::LocalProtocol(format!("stream {stream_id} is closed"))),
            };
            if let Some(event) = next {
                return Ok(event);
            }
            self.check_failure()?;
            self.pump(|| self.has_events(stream_id), timeout).await?;
        }
    }

    fn has_events(&self, stream_id: u32) -> bool {
        self.inner
            .events
            .borrow()
            .get(&stream_id)
            .map_or(true, |q| !q.is_empty())
    }

    fn check_failure(&self) -> Result<()> {
        match self.inner.failure.borrow().as_ref() {
            Some(msg) => Err(Error::RemoteProtocol(msg.clone())),
            None => Ok(()),
        }
    }

    fn record_failure(&self, msg: impl Into<String>) {
        let mut failure = self.inner.failure.borrow_mut();
        if failure.is_none() {
            *failure = Some(msg.into());
        }
    }

    /// One read under the read lock, unless `ready` already holds once the
    /// lock is ours.
    async fn pump(&self, ready: impl Fn() -> bool, timeout: Option<Duration>) -> Result<()> {
        let _guard = self.inner.read_lock.lock().await?;
        if ready() {
            return Ok(());
        }
        self.check_failure()?;

        let data = match self.inner.stream.read(READ_NUM_BYTES, timeout).await {
            Ok(data) => data,
            Err(e) => {
                self.record_failure(e.to_string());
                return Err(e);
            }
        };
        if data.is_empty() {
            self.record_failure("Server disconnected");
            return Err(Error::RemoteProtocol("Server disconnected".into()));
        }

        let received = self.inner.h2.borrow_mut().receive_data(&data);
        let events = match received {
            Ok(events) => events,
            Err(e) => {
                self.record_failure(e.to_string());
                // GOAWAY is queued; best effort
                let _ = self.flush(None).await;
                return Err(e.into());
            }
        };
        for event in events {
            self.route(event);
        }
        self.flush(None).await
    }

    fn route(&self, event: Event) {
        match event {
            Event::RemoteSettingsChanged { .. } => {
                if let Some(max) = event.changed_setting(SETTINGS_MAX_CONCURRENT_STREAMS) {
                    self.resize_streams(max.min(LOCAL_MAX_CONCURRENT_STREAMS));
                }
            }
            Event::ConnectionTerminated { error_code, .. } => {
                self.record_failure(format!("connection terminated: {error_code:?}"));
            }
            Event::WindowUpdated { .. } => {}
            _ => {
                if let Some(id) = event.stream_id() {
                    if let Some(queue) = self.inner.events.borrow_mut().get_mut(&id) {
                        queue.push_back(event);
                    }
                }
            }
        }
    }

    fn resize_streams(&self, new_max: u32) {
        let inner = &self.inner;
        let old = inner.max_streams_limit.replace(new_max);
        if new_max > old {
            let mut grow = new_max - old;
            let debt = inner.permit_debt.get();
            let paid = debt.min(grow);
            inner.permit_debt.set(debt - paid);
            grow -= paid;
            inner.max_streams.add_permits(grow as usize);
        } else if new_max < old {
            inner.permit_debt.set(inner.permit_debt.get() + (old - new_max));
            // free permits pay the debt right away
            while inner.permit_debt.get() > 0 && inner.max_streams.available_permits() > 0 {
                match inner.max_streams.try_acquire() {
                    Ok(permit) => permit.forget(),
                    Err(_) => break,
                }
                inner.permit_debt.set(inner.permit_debt.get() - 1);
            }
        }
    }

    fn release_permit(&self) {
        let inner = &self.inner;
        match inner.permit_debt.get() {
            0 => inner.max_streams.add_permits(1),
            debt => inner.permit_debt.set(debt - 1),
        }
    }

    async fn flush(&self, timeout: Option<Duration>) -> Result<()> {
        let _guard = self.inner.write_lock.lock().await?;
        let data = self.inner.h2.borrow_mut().data_to_send();
        if data.is_empty() {
            return Ok(());
        }
        if let Err(e) = self.inner.stream.write(data, timeout).await {
            self.record_failure(e.to_string());
            return Err(e);
        }
        Ok(())
    }

    /// Writes whatever the protocol queued, e.g. a RST_STREAM after an
    /// abandoned body.
    pub(crate) async fn flush_pending(&self) {
        if !self.is_closed() {
            let _ = self.flush(None).await;
        }
    }

    /// Called once per stream when its response is done with; the stream's
    /// permit returns to the pool.
    pub(crate) fn response_closed(&self, stream_id: u32) {
        let inner = &self.inner;
        if inner.events.borrow_mut().remove(&stream_id).is_none() {
            return;
        }
        self.release_permit();
        inner.h2.borrow_mut().reset_stream(stream_id, ErrorCode::Cancel);
        self.finish_if_unused();
    }

    fn finish_if_unused(&self) {
        let inner = &self.inner;
        if !inner.events.borrow().is_empty() {
            return;
        }
        if inner.used_all_stream_ids.get() || inner.failure.borrow().is_some() {
            self.close();
        } else if inner.state.get() == Http2State::Active {
            inner.state.set(Http2State::Idle);
            inner
                .expire_at
                .set(inner.keepalive_expiry.map(|d| Instant::now() + d));
        }
    }

    /// Tunnels only ever run over HTTP/1.1.
    pub async fn start_tls(
        &self,
        _server_name: ServerName<'static>,
        _tls_config: Arc<ClientConfig>,
        _timeout: Option<Duration>,
    ) -> Result<Rc<S>> {
        Err(Error::Unsupported("start_tls on an HTTP/2 connection"))
    }

    /// Queues GOAWAY and shuts the socket. Idempotent.
    pub fn close(&self) {
        let inner = &self.inner;
        if inner.state.replace(Http2State::Closed) == Http2State::Closed {
            return;
        }
        inner.h2.borrow_mut().close_connection(ErrorCode::NoError);
        inner.stream.close();
        #[cfg(feature = "logging")]
        tracing::debug!(origin = %inner.origin, "http2.close");
    }

    pub fn state(&self) -> Http2State {
        self.inner.state.get()
    }

    pub fn is_idle(&self) -> bool {
        self.inner.state.get() == Http2State::Idle
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.get() == Http2State::Closed
    }

    pub fn has_expired(&self) -> bool {
        self.is_idle()
            && self
                .inner
                .expire_at
                .get()
                .map_or(false, |at| Instant::now() >= at)
    }

    pub fn should_close(&self) -> bool {
        self.is_idle() && (self.has_expired() || self.inner.stream.is_peer_readable())
    }

    pub fn is_available(&self) -> bool {
        !self.is_closed()
            && !self.inner.used_all_stream_ids.get()
            && self.inner.failure.borrow().is_none()
            && self.inner.h2.borrow().state() != ConnectionState::Closed
            && !self.should_close()
    }

    pub fn info(&self) -> String {
        format!(
            "HTTP/2, {}, Request Count: {}",
            self.inner.state.get(),
            self.inner.request_count.get()
        )
    }

    pub fn origin(&self) -> &Origin {
        &self.inner.origin
    }
}

impl<S> fmt::Debug for Http2Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "<Http2Connection [{}, {}, Request Count: {}]>",
            self.inner.origin,
            self.inner.state.get(),
            self.inner.request_count.get()
        )
    }
}

fn build_headers<B>(request: &Request<B>) -> Result<Headers> {
    let authority = header_value(&request.headers, b"host")
        .cloned()
        .ok_or_else(|| Error::LocalProtocol("Missing mandatory Host: header".into()))?;
    let mut headers: Headers = vec![
        (Bytes::from_static(b":method"), request.method.clone()),
        (Bytes::from_static(b":authority"), authority),
        (
            Bytes::from_static(b":scheme"),
            Bytes::copy_from_slice(request.url.scheme.as_bytes()),
        ),
        (Bytes::from_static(b":path"), request.url.target.clone()),
    ];
    headers.extend(
        request
            .headers
            .iter()
            .filter(|(name, _)| {
                !name.eq_ignore_ascii_case(b"host") && !name.eq_ignore_ascii_case(b"transfer-encoding")
            })
            .cloned(),
    );
    Ok(headers)
}

fn parse_response(headers: Headers) -> Result<(u16, Headers)> {
    let status = header_value(&headers, b":status")
        .and_then(|v| std::str::from_utf8(v).ok())
        .and_then(|v| v.parse::<u16>().ok())
        .ok_or_else(|| Error::RemoteProtocol("response without a valid :status".into()))?;
    let headers = headers
        .into_iter()
        .filter(|(name, _)| !name.starts_with(b":"))
        .collect();
    Ok((status, headers))
}

/// Unwinds a request that fails or is dropped before its response head: a
/// half-sent connection preface closes the connection, an opened stream is
/// reset and gives its permit back.
struct PendingStream<'a, S: NetworkStream> {
    conn: &'a Http2Connection<S>,
    initializing: bool,
    stream_id: Option<u32>,
    armed: bool,
}

impl<S: NetworkStream> Drop for PendingStream<'_, S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.initializing {
            self.conn.close();
            return;
        }
        match self.stream_id {
            Some(id) => self.conn.response_closed(id),
            None => self.conn.finish_if_unused(),
        }
    }
}

/// Response body of one stream.
pub(crate) struct Http2Body<S: NetworkStream> {
    conn: Http2Connection<S>,
    stream_id: u32,
    read_timeout: Option<Duration>,
    done: bool,
}

impl<S: NetworkStream> Http2Body<S> {
    pub(crate) async fn next(&mut self) -> Option<Result<Bytes>> {
        if self.done {
            return None;
        }
        loop {
            match self.conn.receive_event(self.stream_id, self.read_timeout).await {
                Ok(Event::DataReceived {
                    data,
                    flow_controlled_length,
                    ..
                }) => {
                    let acked = self
                        .conn
                        .inner
                        .h2
                        .borrow_mut()
                        .acknowledge_received_data(flow_controlled_length, self.stream_id);
                    if let Err(e) = acked {
                        self.close();
                        return Some(Err(e.into()));
                    }
                    if let Err(e) = self.conn.flush(None).await {
                        self.close();
                        return Some(Err(e));
                    }
                    if !data.is_empty() {
                        return Some(Ok(data));
                    }
                }
                Ok(Event::StreamEnded { .. }) => {
                    self.close();
                    return None;
                }
                Ok(Event::StreamReset { error_code, .. }) => {
                    self.close();
                    return Some(Err(Error::RemoteProtocol(format!(
                        "stream reset: {error_code:?}"
                    ))));
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
            self.conn.response_closed(self.stream_id);
        }
    }

    pub(crate) fn connection(&self) -> &Http2Connection<S> {
        &self.conn
    }
}
