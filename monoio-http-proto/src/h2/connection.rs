use std::collections::{HashMap, VecDeque};

use bytes::{Bytes, BytesMut};

use super::{
    error::{ErrorCode, H2Error},
    event::Event,
    flow_control::FlowControl,
    frame::{decode_frame, Frame},
    settings::Settings,
    stream::{H2Stream, StreamState},
};
use crate::common::Headers;

/// Client connection preface (RFC 7540 Section 3.5).
pub const PREFACE: &[u8] = b"PRI * HTTP/2.0\r\n\r\nSM\r\n\r\n";
pub const MAX_STREAM_ID: u32 = 0x7fff_ffff;

const MAX_HEADER_BLOCK: usize = 256 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Preface not sent yet.
    Idle,
    Open,
    /// GOAWAY sent or received, or a connection error happened.
    Closed,
}

struct HeaderBlock {
    stream_id: u32,
    end_stream: bool,
    block: BytesMut,
}

/// Client side of an HTTP/2 connection, without I/O.
///
/// Outgoing operations append frames to an internal buffer drained by
/// [`H2Connection::data_to_send`]; incoming bytes go through
/// [`H2Connection::receive_data`] and come back as [`Event`]s. SETTINGS and
/// PING are acknowledged automatically.
pub struct H2Connection {
    state: ConnectionState,
    local_settings: Settings,
    pending_local_settings: VecDeque<Settings>,
    acked_local_settings: Settings,
    remote_settings: Settings,
    send_window: FlowControl,
    recv_window: FlowControl,
    streams: HashMap<u32, H2Stream>,
    next_stream_id: u32,
    highest_stream_id: u32,
    max_stream_id: u32,
    encoder: fluke_hpack::Encoder<'static>,
    decoder: fluke_hpack::Decoder<'static>,
    recv_buf: BytesMut,
    send_buf: BytesMut,
    continuation: Option<HeaderBlock>,
    goaway_sent: bool,
}

impl Default for H2Connection {
    fn default() -> Self {
        Self::new()
    }
}

impl H2Connection {
    pub fn new() -> Self {
        Self {
            state: ConnectionState::Idle,
            local_settings: Settings::client_default(),
            pending_local_settings: VecDeque::new(),
            acked_local_settings: Settings::default(),
            remote_settings: Settings::default(),
            send_window: FlowControl::default(),
            recv_window: FlowControl::default(),
            streams: HashMap::new(),
            next_stream_id: 1,
            highest_stream_id: 0,
            max_stream_id: MAX_STREAM_ID,
            encoder: fluke_hpack::Encoder::new(),
            decoder: fluke_hpack::Decoder::new(),
            recv_buf: BytesMut::with_capacity(16 * 1024),
            send_buf: BytesMut::with_capacity(16 * 1024),
            continuation: None,
            goaway_sent: false,
        }
    }

    /// Lowers the highest stream id this connection will hand out.
    pub fn with_max_stream_id(mut self, max: u32) -> Self {
        self.max_stream_id = max.min(MAX_STREAM_ID);
        self
    }

    #[inline]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn local_settings(&self) -> &Settings {
        &self.local_settings
    }

    pub fn remote_settings(&self) -> &Settings {
        &self.remote_settings
    }

    /// Writes the preface and our SETTINGS.
    pub fn initiate_connection(&mut self) {
        if self.state != ConnectionState::Idle {
            return;
        }
        self.send_buf.extend_from_slice(PREFACE);
        self.write_settings();
        self.state = ConnectionState::Open;
    }

    /// Replaces our settings. Before the preface this only changes what
    /// `initiate_connection` will send.
    pub fn update_settings(&mut self, settings: Settings) {
        self.local_settings = settings;
        if self.state == ConnectionState::Open {
            self.write_settings();
        }
    }

    fn write_settings(&mut self) {
        Frame::Settings {
            ack: false,
            params: self.local_settings.to_pairs(),
        }
        .encode(&mut self.send_buf);
        self.pending_local_settings
            .push_back(self.local_settings.clone());
    }

    /// Reserves the next client stream id.
    pub fn get_next_available_stream_id(&mut self) -> Result<u32, H2Error> {
        if self.next_stream_id > self.max_stream_id {
            return Err(H2Error::NoAvailableStreamId);
        }
        let id = self.next_stream_id;
        self.next_stream_id = self.next_stream_id.saturating_add(2);
        Ok(id)
    }

    pub fn open_outbound_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn remote_max_concurrent_streams(&self) -> Option<u32> {
        self.remote_settings.max_concurrent_streams
    }

    #[inline]
    pub fn max_outbound_frame_size(&self) -> u32 {
        self.remote_settings.max_frame_size
    }

    /// How many DATA bytes may be sent on `stream_id` right now.
    pub fn local_flow_control_window(&self, stream_id: u32) -> Result<u32, H2Error> {
        let stream = self
            .streams
            .get(&stream_id)
            .ok_or(H2Error::StreamClosed(stream_id))?;
        Ok(stream
            .send_window
            .available()
            .min(self.send_window.available()))
    }

    pub fn send_headers(
        &mut self,
        stream_id: u32,
        headers: &[(Bytes, Bytes)],
        end_stream: bool,
    ) -> Result<(), H2Error> {
        self.ensure_open()?;
        if stream_id % 2 == 0 || stream_id <= self.highest_stream_id {
            return Err(H2Error::Local(format!("stream id {stream_id} can't be opened")));
        }
        if let Some(max) = self.remote_settings.max_concurrent_streams {
            if self.streams.len() >= max as usize {
                return Err(H2Error::Local(format!(
                    "peer allows at most {max} concurrent streams"
                )));
            }
        }

        let lowered: Vec<(Vec<u8>, &[u8])> = headers
            .iter()
            .map(|(n, v)| (n.to_ascii_lowercase(), v.as_ref()))
            .collect();
        let block = Bytes::from(
            self.encoder
                .encode(lowered.iter().map(|(n, v)| (n.as_slice(), *v))),
        );

        let max = self.remote_settings.max_frame_size as usize;
        let mut rest = block;
        let first = rest.split_to(rest.len().min(max));
        Frame::Headers {
            stream_id,
            block: first,
            end_stream,
            end_headers: rest.is_empty(),
            priority: None,
        }
        .encode(&mut self.send_buf);
        while !rest.is_empty() {
            let chunk = rest.split_to(rest.len().min(max));
            Frame::Continuation {
                stream_id,
                block: chunk,
                end_headers: rest.is_empty(),
            }
            .encode(&mut self.send_buf);
        }

        let mut stream = H2Stream::new(
            i64::from(self.remote_settings.initial_window_size),
            i64::from(self.local_settings.initial_window_size),
        );
        if end_stream {
            stream.close_local();
        }
        self.streams.insert(stream_id, stream);
        self.highest_stream_id = stream_id;
        Ok(())
    }

    pub fn send_data(&mut self, stream_id: u32, data: Bytes, end_stream: bool) -> Result<(), H2Error> {
        self.ensure_open()?;
        let max_frame = self.remote_settings.max_frame_size as usize;
        let conn_window = self.send_window.available();
        let stream = match self.streams.get_mut(&stream_id) {
            Some(s) if s.can_send() => s,
            _ => return Err(H2Error::StreamClosed(stream_id)),
        };
        if data.len() > max_frame {
            return Err(H2Error::Local(format!(
                "DATA of {} bytes exceeds frame size {max_frame}",
                data.len()
            )));
        }
        let len = data.len() as u32;
        if len > stream.send_window.available().min(conn_window) {
            return Err(H2Error::FlowControl(stream_id));
        }
        stream
            .send_window
            .consume(len)
            .map_err(|_| H2Error::FlowControl(stream_id))?;
        self.send_window
            .consume(len)
            .map_err(|_| H2Error::FlowControl(0))?;

        if end_stream {
            stream.close_local();
            if stream.state == StreamState::Closed {
                self.streams.remove(&stream_id);
            }
        }
        Frame::Data {
            stream_id,
            payload: data,
            end_stream,
            flow_controlled_length: len,
        }
        .encode(&mut self.send_buf);
        Ok(())
    }

    pub fn end_stream(&mut self, stream_id: u32) -> Result<(), H2Error> {
        self.send_data(stream_id, Bytes::new(), true)
    }

    /// Grows our receive window for the connection (`None`) or a stream.
    pub fn increment_flow_control_window(
        &mut self,
        increment: u32,
        stream_id: Option<u32>,
    ) -> Result<(), H2Error> {
        self.ensure_open()?;
        match stream_id {
            None | Some(0) => {
                self.recv_window
                    .increase(increment)
                    .map_err(|_| H2Error::FlowControl(0))?;
                self.write_window_update(0, increment);
            }
            Some(id) => {
                let stream = self
                    .streams
                    .get_mut(&id)
                    .ok_or(H2Error::StreamClosed(id))?;
                stream
                    .recv_window
                    .increase(increment)
                    .map_err(|_| H2Error::FlowControl(id))?;
                self.write_window_update(id, increment);
            }
        }
        Ok(())
    }

    /// Hands `len` consumed bytes back to the peer, on the stream (if it can
    /// still receive) and on the connection.
    pub fn acknowledge_received_data(&mut self, len: u32, stream_id: u32) -> Result<(), H2Error> {
        if len == 0 || self.state == ConnectionState::Closed {
            return Ok(());
        }
        self.increment_flow_control_window(len, None)?;
        if matches!(self.streams.get(&stream_id), Some(s) if s.can_receive()) {
            self.increment_flow_control_window(len, Some(stream_id))?;
        }
        Ok(())
    }

    /// Abandons a stream. Resetting a stream that is already gone does nothing.
    pub fn reset_stream(&mut self, stream_id: u32, error_code: ErrorCode) {
        if self.state != ConnectionState::Open {
            return;
        }
        if self.streams.remove(&stream_id).is_some() {
            Frame::RstStream {
                stream_id,
                error_code,
            }
            .encode(&mut self.send_buf);
        }
    }

    /// Sends GOAWAY. Further calls are no-ops.
    pub fn close_connection(&mut self, error_code: ErrorCode) {
        if !self.goaway_sent && self.state != ConnectionState::Idle {
            Frame::GoAway {
                last_stream_id: 0,
                error_code,
                debug_data: Bytes::new(),
            }
            .encode(&mut self.send_buf);
            self.goaway_sent = true;
        }
        self.state = ConnectionState::Closed;
    }

    /// Drains the bytes that must be written to the socket.
    pub fn data_to_send(&mut self) -> Bytes {
        self.send_buf.split().freeze()
    }

    /// Feeds bytes read from the socket.
    ///
    /// A connection error queues GOAWAY, closes the connection and is returned
    /// as `Err`.
    pub fn receive_data(&mut self, data: &[u8]) -> Result<Vec<Event>, H2Error> {
        let mut events = Vec::new();
        if self.state == ConnectionState::Closed {
            return Ok(events);
        }
        self.recv_buf.extend_from_slice(data);
        loop {
            let max = self.acked_local_settings.max_frame_size;
            let frame = match decode_frame(&mut self.recv_buf, max) {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => return Err(self.fail(e)),
            };
            if let Err(e) = self.handle_frame(frame, &mut events) {
                return Err(self.fail(e));
            }
        }
        Ok(events)
    }

    fn fail(&mut self, e: H2Error) -> H2Error {
        if let H2Error::Connection { code, .. } = &e {
            #[cfg(feature = "logging")]
            tracing::debug!("h2 connection error {:?}: {}", code, e);
            self.close_connection(*code);
        }
        e
    }

    fn ensure_open(&self) -> Result<(), H2Error> {
        match self.state {
            ConnectionState::Open => Ok(()),
            ConnectionState::Idle => Err(H2Error::Local("connection not initiated".into())),
            ConnectionState::Closed => Err(H2Error::Local("connection is closed".into())),
        }
    }

    fn write_window_update(&mut self, stream_id: u32, increment: u32) {
        if increment > 0 {
            Frame::WindowUpdate {
                stream_id,
                increment,
            }
            .encode(&mut self.send_buf);
        }
    }

    /// Frame for a stream we don't track: fine if it was closed, a protocol
    /// error if it was never opened.
    fn check_closed_stream(&self, stream_id: u32) -> Result<(), H2Error> {
        if stream_id % 2 == 0 || stream_id > self.highest_stream_id {
            return Err(H2Error::protocol(format!(
                "frame received on idle stream {stream_id}"
            )));
        }
        Ok(())
    }

    fn reset_locally(&mut self, stream_id: u32, error_code: ErrorCode, events: &mut Vec<Event>) {
        self.reset_stream(stream_id, error_code);
        events.push(Event::StreamReset {
            stream_id,
            error_code,
            remote_reset: false,
        });
    }

    fn end_remote(&mut self, stream_id: u32, events: &mut Vec<Event>) {
        if let Some(stream) = self.streams.get_mut(&stream_id) {
            stream.close_remote();
            if stream.state == StreamState::Closed {
                self.streams.remove(&stream_id);
            }
        }
        events.push(Event::StreamEnded { stream_id });
    }

    fn handle_frame(&mut self, frame: Frame, events: &mut Vec<Event>) -> Result<(), H2Error> {
        if let Some(pending) = &self.continuation {
            match &frame {
                Frame::Continuation { stream_id, .. } if *stream_id == pending.stream_id => (),
                _ => return Err(H2Error::protocol("expected CONTINUATION")),
            }
        }

        match frame {
            Frame::Data {
                stream_id,
                payload,
                end_stream,
                flow_controlled_length,
            } => {
                self.recv_window
                    .consume(flow_controlled_length)
                    .map_err(|_| {
                        H2Error::connection(
                            ErrorCode::FlowControlError,
                            "connection receive window exceeded",
                        )
                    })?;
                let accepted = match self.streams.get_mut(&stream_id) {
                    Some(stream) if stream.can_receive() => {
                        Some(stream.recv_window.consume(flow_controlled_length).is_ok())
                    }
                    _ => None,
                };
                match accepted {
                    Some(true) => {
                        events.push(Event::DataReceived {
                            stream_id,
                            data: payload,
                            flow_controlled_length,
                        });
                        if end_stream {
                            self.end_remote(stream_id, events);
                        }
                    }
                    Some(false) => {
                        self.reset_locally(stream_id, ErrorCode::FlowControlError, events)
                    }
                    None => {
                        self.check_closed_stream(stream_id)?;
                        // discarded data still counts against the connection window
                        self.recv_window
                            .increase(flow_controlled_length)
                            .map_err(|_| {
                                H2Error::connection(ErrorCode::FlowControlError, "window overflow")
                            })?;
                        self.write_window_update(0, flow_controlled_length);
                        Frame::RstStream {
                            stream_id,
                            error_code: ErrorCode::StreamClosed,
                        }
                        .encode(&mut self.send_buf);
                    }
                }
            }
            Frame::Headers {
                stream_id,
                block,
                end_stream,
                end_headers,
                ..
            } => {
                self.continuation = Some(HeaderBlock {
                    stream_id,
                    end_stream,
                    block: BytesMut::from(&block[..]),
                });
                if end_headers {
                    self.finish_header_block(events)?;
                }
            }
            Frame::Continuation {
                block, end_headers, ..
            } => {
                let pending = self
                    .continuation
                    .as_mut()
                    .ok_or_else(|| H2Error::protocol("unexpected CONTINUATION"))?;
                pending.block.extend_from_slice(&block);
                if pending.block.len() > MAX_HEADER_BLOCK {
                    return Err(H2Error::connection(
                        ErrorCode::EnhanceYourCalm,
                        "header block too large",
                    ));
                }
                if end_headers {
                    self.finish_header_block(events)?;
                }
            }
            Frame::Priority { .. } | Frame::Unknown { .. } => (),
            Frame::RstStream {
                stream_id,
                error_code,
            } => {
                if self.streams.remove(&stream_id).is_some() {
                    events.push(Event::StreamReset {
                        stream_id,
                        error_code,
                        remote_reset: true,
                    });
                } else {
                    self.check_closed_stream(stream_id)?;
                }
            }
            Frame::Settings { ack: true, .. } => {
                if let Some(settings) = self.pending_local_settings.pop_front() {
                    self.acked_local_settings = settings;
                }
                events.push(Event::SettingsAcknowledged);
            }
            Frame::Settings { ack: false, params } => {
                let old_initial = i64::from(self.remote_settings.initial_window_size);
                for (id, value) in params.iter() {
                    self.remote_settings.apply(*id, *value)?;
                }
                let delta = i64::from(self.remote_settings.initial_window_size) - old_initial;
                if delta != 0 {
                    for stream in self.streams.values_mut() {
                        stream.send_window.adjust(delta).map_err(|_| {
                            H2Error::connection(
                                ErrorCode::FlowControlError,
                                "INITIAL_WINDOW_SIZE change overflows a stream window",
                            )
                        })?;
                    }
                }
                Frame::Settings {
                    ack: true,
                    params: Vec::new(),
                }
                .encode(&mut self.send_buf);
                events.push(Event::RemoteSettingsChanged { changed: params });
            }
            Frame::PushPromise { .. } => {
                return Err(H2Error::protocol("PUSH_PROMISE received with push disabled"));
            }
            Frame::Ping {
                ack: false,
                opaque_data,
            } => {
                Frame::Ping {
                    ack: true,
                    opaque_data,
                }
                .encode(&mut self.send_buf);
                events.push(Event::PingReceived { data: opaque_data });
            }
            Frame::Ping {
                ack: true,
                opaque_data,
            } => events.push(Event::PingAckReceived { data: opaque_data }),
            Frame::GoAway {
                last_stream_id,
                error_code,
                debug_data,
            } => {
                self.state = ConnectionState::Closed;
                events.push(Event::ConnectionTerminated {
                    error_code,
                    last_stream_id,
                    additional_data: debug_data,
                });
            }
            Frame::WindowUpdate {
                stream_id: 0,
                increment,
            } => {
                if increment == 0 {
                    return Err(H2Error::protocol("WINDOW_UPDATE with 0 increment"));
                }
                self.send_window.increase(increment).map_err(|_| {
                    H2Error::connection(ErrorCode::FlowControlError, "connection window overflow")
                })?;
                events.push(Event::WindowUpdated {
                    stream_id: 0,
                    delta: increment,
                });
            }
            Frame::WindowUpdate {
                stream_id,
                increment,
            } => {
                let outcome = self
                    .streams
                    .get_mut(&stream_id)
                    .map(|s| increment > 0 && s.send_window.increase(increment).is_ok());
                match outcome {
                    Some(true) => events.push(Event::WindowUpdated {
                        stream_id,
                        delta: increment,
                    }),
                    Some(false) if increment == 0 => {
                        self.reset_locally(stream_id, ErrorCode::ProtocolError, events)
                    }
                    Some(false) => {
                        self.reset_locally(stream_id, ErrorCode::FlowControlError, events)
                    }
                    None => self.check_closed_stream(stream_id)?,
                }
            }
        }
        Ok(())
    }

    fn finish_header_block(&mut self, events: &mut Vec<Event>) -> Result<(), H2Error> {
        let pending = match self.continuation.take() {
            Some(p) => p,
            None => return Ok(()),
        };
        // always decode so the dynamic table stays in sync
        let decoded = self.decoder.decode(&pending.block).map_err(|e| {
            H2Error::connection(ErrorCode::CompressionError, format!("hpack: {e:?}"))
        })?;
        let headers: Headers = decoded
            .into_iter()
            .map(|(n, v)| (Bytes::from(n), Bytes::from(v)))
            .collect();
        let stream_id = pending.stream_id;

        let response_received = match self.streams.get(&stream_id) {
            Some(stream) if stream.can_receive() => stream.response_received,
            _ => {
                self.check_closed_stream(stream_id)?;
                Frame::RstStream {
                    stream_id,
                    error_code: ErrorCode::StreamClosed,
                }
                .encode(&mut self.send_buf);
                return Ok(());
            }
        };

        if response_received {
            if !pending.end_stream || headers.iter().any(|(n, _)| n.starts_with(b":")) {
                self.reset_locally(stream_id, ErrorCode::ProtocolError, events);
                return Ok(());
            }
            events.push(Event::TrailersReceived { stream_id, headers });
        } else {
            match response_status(&headers) {
                Some(status) if (100..200).contains(&status) => {
                    if pending.end_stream {
                        self.reset_locally(stream_id, ErrorCode::ProtocolError, events);
                        return Ok(());
                    }
                    events.push(Event::InformationalResponseReceived { stream_id, headers });
                }
                Some(_) => {
                    if let Some(stream) = self.streams.get_mut(&stream_id) {
                        stream.response_received = true;
                    }
                    events.push(Event::ResponseReceived { stream_id, headers });
                }
                None => {
                    self.reset_locally(stream_id, ErrorCode::ProtocolError, events);
                    return Ok(());
                }
            }
        }
        if pending.end_stream {
            self.end_remote(stream_id, events);
        }
        Ok(())
    }
}

/// `:status` of a response header block, if it is well formed: exactly one
/// `:status`, no request pseudo headers, pseudo headers first.
fn response_status(headers: &[(Bytes, Bytes)]) -> Option<u16> {
    let mut status = None;
    let mut regular_seen = false;
    for (name, value) in headers {
        if name.starts_with(b":") {
            if regular_seen || name.as_ref() != b":status" || status.is_some() {
                return None;
            }
            status = std::str::from_utf8(value).ok()?.parse::<u16>().ok();
            status?;
        } else {
            regular_seen = true;
        }
    }
    status.filter(|s| (100..1000).contains(s))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::h2::settings::{SETTINGS_INITIAL_WINDOW_SIZE, SETTINGS_MAX_CONCURRENT_STREAMS};

    struct Server {
        encoder: fluke_hpack::Encoder<'static>,
    }

    impl Server {
        fn new() -> Self {
            Self {
                encoder: fluke_hpack::Encoder::new(),
            }
        }

        fn headers(&mut self, stream_id: u32, status: &str, end_stream: bool) -> BytesMut {
            let block = self.encoder.encode(vec![
                (&b":status"[..], status.as_bytes()),
                (&b"content-type"[..], &b"text/plain"[..]),
            ]);
            let mut buf = BytesMut::new();
            Frame::Headers {
                stream_id,
                block: Bytes::from(block),
                end_stream,
                end_headers: true,
                priority: None,
            }
            .encode(&mut buf);
            buf
        }
    }

    fn frame(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        buf
    }

    fn data(stream_id: u32, payload: &'static [u8], end_stream: bool) -> BytesMut {
        frame(Frame::Data {
            stream_id,
            payload: Bytes::from_static(payload),
            end_stream,
            flow_controlled_length: payload.len() as u32,
        })
    }

    fn request_headers() -> Vec<(Bytes, Bytes)> {
        vec![
            (Bytes::from_static(b":method"), Bytes::from_static(b"GET")),
            (Bytes::from_static(b":authority"), Bytes::from_static(b"h2.test")),
            (Bytes::from_static(b":scheme"), Bytes::from_static(b"https")),
            (Bytes::from_static(b":path"), Bytes::from_static(b"/")),
        ]
    }

    fn open() -> H2Connection {
        let mut conn = H2Connection::new();
        conn.initiate_connection();
        conn.data_to_send();
        conn
    }

    #[test]
    fn preface_and_settings() {
        let mut conn = H2Connection::new();
        let mut settings = Settings::client_default();
        settings.max_concurrent_streams = Some(100);
        conn.update_settings(settings);
        conn.initiate_connection();
        let mut out = BytesMut::from(&conn.data_to_send()[..]);
        assert!(out.starts_with(PREFACE));
        let _ = out.split_to(PREFACE.len());
        match decode_frame(&mut out, 16384).unwrap().unwrap() {
            Frame::Settings { ack: false, params } => {
                assert!(params.contains(&(crate::h2::settings::SETTINGS_ENABLE_PUSH, 0)));
                assert!(params.contains(&(SETTINGS_MAX_CONCURRENT_STREAMS, 100)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn request_response() {
        let mut conn = open();
        let mut server = Server::new();
        let id = conn.get_next_available_stream_id().unwrap();
        assert_eq!(id, 1);
        conn.send_headers(id, &request_headers(), true).unwrap();

        let mut wire = frame(Frame::Settings {
            ack: false,
            params: vec![(SETTINGS_MAX_CONCURRENT_STREAMS, 10)],
        });
        wire.extend_from_slice(&server.headers(1, "200", false));
        wire.extend_from_slice(&data(1, b"hello", true));
        let events = conn.receive_data(&wire).unwrap();

        assert_eq!(events[0].changed_setting(SETTINGS_MAX_CONCURRENT_STREAMS), Some(10));
        match &events[1] {
            Event::ResponseReceived { stream_id, headers } => {
                assert_eq!(*stream_id, 1);
                assert_eq!(&headers[0].1[..], b"200");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(
            events[2],
            Event::DataReceived {
                stream_id: 1,
                data: Bytes::from_static(b"hello"),
                flow_controlled_length: 5
            }
        );
        assert_eq!(events[3], Event::StreamEnded { stream_id: 1 });
        assert_eq!(conn.open_outbound_streams(), 0);

        let mut out = BytesMut::from(&conn.data_to_send()[..]);
        let _headers = decode_frame(&mut out, 16384).unwrap().unwrap();
        assert_eq!(
            decode_frame(&mut out, 16384).unwrap().unwrap(),
            Frame::Settings {
                ack: true,
                params: Vec::new()
            }
        );
    }

    #[test]
    fn stream_ids_run_out() {
        let mut conn = open().with_max_stream_id(3);
        assert_eq!(conn.get_next_available_stream_id().unwrap(), 1);
        assert_eq!(conn.get_next_available_stream_id().unwrap(), 3);
        assert_eq!(
            conn.get_next_available_stream_id(),
            Err(H2Error::NoAvailableStreamId)
        );
    }

    #[test]
    fn send_respects_windows() {
        let mut conn = open();
        conn.receive_data(&frame(Frame::Settings {
            ack: false,
            params: vec![(SETTINGS_INITIAL_WINDOW_SIZE, 4)],
        }))
        .unwrap();
        conn.send_headers(1, &request_headers(), false).unwrap();
        assert_eq!(conn.local_flow_control_window(1).unwrap(), 4);
        assert_eq!(
            conn.send_data(1, Bytes::from_static(b"12345"), false),
            Err(H2Error::FlowControl(1))
        );
        conn.send_data(1, Bytes::from_static(b"1234"), false).unwrap();
        assert_eq!(conn.local_flow_control_window(1).unwrap(), 0);

        let events = conn
            .receive_data(&frame(Frame::WindowUpdate {
                stream_id: 1,
                increment: 10,
            }))
            .unwrap();
        assert_eq!(
            events,
            vec![Event::WindowUpdated {
                stream_id: 1,
                delta: 10
            }]
        );
        assert_eq!(conn.local_flow_control_window(1).unwrap(), 10);
        conn.end_stream(1).unwrap();
        assert!(conn.send_data(1, Bytes::from_static(b"x"), false).is_err());
    }

    #[test]
    fn acknowledge_sends_window_updates() {
        let mut conn = open();
        let mut server = Server::new();
        conn.send_headers(1, &request_headers(), true).unwrap();
        let mut wire = server.headers(1, "200", false);
        wire.extend_from_slice(&data(1, b"abc", false));
        conn.receive_data(&wire).unwrap();
        conn.data_to_send();

        conn.acknowledge_received_data(3, 1).unwrap();
        let mut out = BytesMut::from(&conn.data_to_send()[..]);
        assert_eq!(
            decode_frame(&mut out, 16384).unwrap().unwrap(),
            Frame::WindowUpdate {
                stream_id: 0,
                increment: 3
            }
        );
        assert_eq!(
            decode_frame(&mut out, 16384).unwrap().unwrap(),
            Frame::WindowUpdate {
                stream_id: 1,
                increment: 3
            }
        );
    }

    #[test]
    fn peer_reset() {
        let mut conn = open();
        conn.send_headers(1, &request_headers(), true).unwrap();
        let events = conn
            .receive_data(&frame(Frame::RstStream {
                stream_id: 1,
                error_code: ErrorCode::RefusedStream,
            }))
            .unwrap();
        assert_eq!(events[0].error_code(), Some(ErrorCode::RefusedStream));
        assert_eq!(events[0].stream_id(), Some(1));
        assert_eq!(conn.open_outbound_streams(), 0);
    }

    #[test]
    fn goaway_closes() {
        let mut conn = open();
        let events = conn
            .receive_data(&frame(Frame::GoAway {
                last_stream_id: 0,
                error_code: ErrorCode::NoError,
                debug_data: Bytes::from_static(b"bye"),
            }))
            .unwrap();
        assert!(matches!(events[0], Event::ConnectionTerminated { .. }));
        assert_eq!(events[0].stream_id(), None);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.send_headers(1, &request_headers(), true).is_err());
    }

    #[test]
    fn continuation_reassembled() {
        let mut conn = open();
        let mut encoder = fluke_hpack::Encoder::new();
        conn.send_headers(1, &request_headers(), true).unwrap();
        let block = Bytes::from(encoder.encode(vec![
            (&b":status"[..], &b"204"[..]),
            (&b"x-long"[..], &b"value"[..]),
        ]));
        let mut wire = frame(Frame::Headers {
            stream_id: 1,
            block: block.slice(..2),
            end_stream: true,
            end_headers: false,
            priority: None,
        });
        wire.extend_from_slice(&frame(Frame::Continuation {
            stream_id: 1,
            block: block.slice(2..),
            end_headers: true,
        }));
        let events = conn.receive_data(&wire).unwrap();
        assert!(matches!(&events[0], Event::ResponseReceived { headers, .. } if headers.len() == 2));
        assert_eq!(events[1], Event::StreamEnded { stream_id: 1 });
    }

    #[test]
    fn interleaved_continuation_is_connection_error() {
        let mut conn = open();
        conn.send_headers(1, &request_headers(), true).unwrap();
        conn.data_to_send();
        let mut wire = frame(Frame::Headers {
            stream_id: 1,
            block: Bytes::from_static(&[0x88]),
            end_stream: false,
            end_headers: false,
            priority: None,
        });
        wire.extend_from_slice(&frame(Frame::Ping {
            ack: false,
            opaque_data: [0; 8],
        }));
        assert!(matches!(
            conn.receive_data(&wire),
            Err(H2Error::Connection {
                code: ErrorCode::ProtocolError,
                ..
            })
        ));
        assert_eq!(conn.state(), ConnectionState::Closed);
        let mut out = BytesMut::from(&conn.data_to_send()[..]);
        assert!(matches!(
            decode_frame(&mut out, 16384).unwrap().unwrap(),
            Frame::GoAway {
                error_code: ErrorCode::ProtocolError,
                ..
            }
        ));
    }

    #[test]
    fn ping_is_answered() {
        let mut conn = open();
        let events = conn
            .receive_data(&frame(Frame::Ping {
                ack: false,
                opaque_data: *b"pingpong",
            }))
            .unwrap();
        assert_eq!(events, vec![Event::PingReceived { data: *b"pingpong" }]);
        let mut out = BytesMut::from(&conn.data_to_send()[..]);
        assert_eq!(
            decode_frame(&mut out, 16384).unwrap().unwrap(),
            Frame::Ping {
                ack: true,
                opaque_data: *b"pingpong"
            }
        );
    }

    #[test]
    fn malformed_response_resets_stream() {
        let mut conn = open();
        let mut encoder = fluke_hpack::Encoder::new();
        conn.send_headers(1, &request_headers(), true).unwrap();
        let block = encoder.encode(vec![(&b"content-type"[..], &b"text/plain"[..])]);
        let events = conn
            .receive_data(&frame(Frame::Headers {
                stream_id: 1,
                block: Bytes::from(block),
                end_stream: false,
                end_headers: true,
                priority: None,
            }))
            .unwrap();
        assert_eq!(
            events,
            vec![Event::StreamReset {
                stream_id: 1,
                error_code: ErrorCode::ProtocolError,
                remote_reset: false
            }]
        );
    }

    #[test]
    fn data_on_idle_stream_is_error() {
        let mut conn = open();
        assert!(conn.receive_data(&data(5, b"x", false)).is_err());
    }

    #[test]
    fn concurrency_limit_enforced() {
        let mut conn = open();
        conn.receive_data(&frame(Frame::Settings {
            ack: false,
            params: vec![(SETTINGS_MAX_CONCURRENT_STREAMS, 1)],
        }))
        .unwrap();
        conn.send_headers(1, &request_headers(), true).unwrap();
        assert!(conn.send_headers(3, &request_headers(), true).is_err());
    }
}
