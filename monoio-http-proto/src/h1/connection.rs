use bytes::{Bytes, BytesMut};
use monoio_codec::{Decoded, Decoder, Encoder};

use super::{
    codec::{
        decoder::{
            BodyDecoder, BodyItem, ChunkedBodyDecoder, EofBodyDecoder, FixedBodyDecoder,
            ResponseHeadDecoder,
        },
        encoder::{ChunkedBodyEncoder, FixedBodyEncoder, HeadEncoder},
        RequestHead, ResponseHead,
    },
    state::State,
};
use crate::common::{
    error::ProtocolError, header_contains_token, header_value, is_field_value, is_token, Headers,
};

/// What the peer sent, as seen by [`ClientConnection::next_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A 1xx response. More responses follow.
    InformationalResponse(ResponseHead),
    Response(ResponseHead),
    Data(Bytes),
    /// End of the response body, with trailers if any were sent.
    EndOfMessage(Headers),
    ConnectionClosed,
    /// More bytes must be fed through `receive_data`.
    NeedData,
    /// The connection switched protocols, or bytes of a next cycle are
    /// already buffered. Nothing will be produced until the caller acts.
    Paused,
}

enum Outbound {
    Fixed { remaining: u64 },
    Chunked,
}

/// Client half of an HTTP/1.1 connection.
pub struct ClientConnection {
    our_state: State,
    their_state: State,
    keep_alive: bool,
    connect_pending: bool,
    request_method: Bytes,
    outbound: Option<Outbound>,
    inbound: Option<BodyDecoder>,
    buffer: BytesMut,
    eof: bool,
}

impl Default for ClientConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientConnection {
    pub fn new() -> Self {
        Self {
            our_state: State::Idle,
            their_state: State::Idle,
            keep_alive: true,
            connect_pending: false,
            request_method: Bytes::new(),
            outbound: None,
            inbound: None,
            buffer: BytesMut::with_capacity(8 * 1024),
            eof: false,
        }
    }

    #[inline]
    pub fn our_state(&self) -> State {
        self.our_state
    }

    #[inline]
    pub fn their_state(&self) -> State {
        self.their_state
    }

    /// Bytes received but not yet turned into events.
    pub fn trailing_data(&self) -> (&[u8], bool) {
        (&self.buffer, self.eof)
    }

    /// Encodes the request head. The body framing is taken from the
    /// `Content-Length` or `Transfer-Encoding` header; without either the
    /// request has no body.
    pub fn send_request(&mut self, head: &RequestHead) -> Result<Bytes, ProtocolError> {
        if self.our_state != State::Idle {
            return Err(ProtocolError::local(format!(
                "can't send a request in state {}",
                self.our_state
            )));
        }
        let outbound = match validate_request(head) {
            Ok(o) => o,
            Err(e) => {
                self.our_state = State::Error;
                return Err(e);
            }
        };

        let mut dst = BytesMut::new();
        HeadEncoder
            .encode(head, &mut dst)
            .map_err(|e| ProtocolError::local(e.to_string()))?;

        if header_contains_token(&head.headers, b"connection", b"close") {
            self.keep_alive = false;
        }
        self.connect_pending = head.method.eq_ignore_ascii_case(b"CONNECT");
        self.request_method = head.method.clone();
        self.outbound = Some(outbound);
        self.our_state = State::SendBody;
        if self.their_state == State::Idle {
            self.their_state = State::SendResponse;
        }
        Ok(dst.freeze())
    }

    pub fn send_data(&mut self, data: &[u8]) -> Result<Bytes, ProtocolError> {
        if self.our_state != State::SendBody {
            return Err(ProtocolError::local(format!(
                "can't send data in state {}",
                self.our_state
            )));
        }
        let mut dst = BytesMut::with_capacity(data.len() + 12);
        match self.outbound.as_mut() {
            Some(Outbound::Fixed { remaining }) => {
                if data.len() as u64 > *remaining {
                    self.our_state = State::Error;
                    return Err(ProtocolError::local(
                        "too much data for declared Content-Length",
                    ));
                }
                *remaining -= data.len() as u64;
                FixedBodyEncoder
                    .encode(data, &mut dst)
                    .map_err(|e| ProtocolError::local(e.to_string()))?;
            }
            Some(Outbound::Chunked) => {
                ChunkedBodyEncoder
                    .encode(Some(data), &mut dst)
                    .map_err(|e| ProtocolError::local(e.to_string()))?;
            }
            None => return Err(ProtocolError::local("no request body in progress")),
        }
        Ok(dst.freeze())
    }

    pub fn send_end_of_message(&mut self) -> Result<Bytes, ProtocolError> {
        if self.our_state != State::SendBody {
            return Err(ProtocolError::local(format!(
                "can't end the message in state {}",
                self.our_state
            )));
        }
        let mut dst = BytesMut::new();
        match self.outbound.take() {
            Some(Outbound::Fixed { remaining }) if remaining > 0 => {
                self.our_state = State::Error;
                return Err(ProtocolError::local(
                    "too little data for declared Content-Length",
                ));
            }
            Some(Outbound::Chunked) => {
                ChunkedBodyEncoder
                    .encode(None, &mut dst)
                    .map_err(|e| ProtocolError::local(e.to_string()))?;
            }
            _ => (),
        }
        self.our_state = if self.connect_pending {
            State::MightSwitchProtocol
        } else {
            State::Done
        };
        self.settle();
        Ok(dst.freeze())
    }

    /// Records that we are closing our side. Nothing needs to be written.
    pub fn send_connection_closed(&mut self) {
        self.our_state = State::Closed;
        self.settle();
    }

    /// Feeds bytes read from the socket. An empty slice signals EOF.
    pub fn receive_data(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        if data.is_empty() {
            self.eof = true;
            return Ok(());
        }
        if self.eof {
            return Err(ProtocolError::local("received data after EOF"));
        }
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    pub fn next_event(&mut self) -> Result<Event, ProtocolError> {
        if self.their_state == State::Error {
            return Err(ProtocolError::remote(
                "can't receive data when peer state is ERROR",
            ));
        }
        match self.read_event() {
            Ok(event) => Ok(event),
            Err(e) => {
                self.their_state = State::Error;
                self.settle();
                Err(e)
            }
        }
    }

    /// Resets both halves for the next request. Both must be [`State::Done`].
    pub fn start_next_cycle(&mut self) -> Result<(), ProtocolError> {
        if self.our_state != State::Done || self.their_state != State::Done {
            return Err(ProtocolError::local(format!(
                "not in a reusable state. self state: {}, peer state: {}",
                self.our_state, self.their_state
            )));
        }
        self.our_state = State::Idle;
        self.their_state = State::Idle;
        self.keep_alive = true;
        self.connect_pending = false;
        self.request_method = Bytes::new();
        self.outbound = None;
        self.inbound = None;
        Ok(())
    }

    fn read_event(&mut self) -> Result<Event, ProtocolError> {
        match self.their_state {
            State::MightSwitchProtocol | State::SwitchedProtocol => Ok(Event::Paused),
            State::Done if !self.buffer.is_empty() => Ok(Event::Paused),
            State::Idle | State::Done | State::MustClose => {
                if !self.buffer.is_empty() {
                    return Err(ProtocolError::remote(format!(
                        "unexpected data in state {}",
                        self.their_state
                    )));
                }
                if self.eof {
                    self.their_state = State::Closed;
                    self.settle();
                    return Ok(Event::ConnectionClosed);
                }
                Ok(Event::NeedData)
            }
            State::Closed => Ok(Event::ConnectionClosed),
            State::SendResponse => self.read_head(),
            State::SendBody => self.read_body(),
            State::Error => Err(ProtocolError::remote(
                "can't receive data when peer state is ERROR",
            )),
        }
    }

    fn read_head(&mut self) -> Result<Event, ProtocolError> {
        let head = match ResponseHeadDecoder.decode(&mut self.buffer) {
            Ok(Decoded::Some(head)) => head,
            Ok(_) if self.eof => {
                return Err(ProtocolError::remote(
                    "peer closed connection without sending complete response",
                ))
            }
            Ok(_) => return Ok(Event::NeedData),
            Err(e) => return Err(ProtocolError::remote(e.to_string())),
        };

        if head.version == 0 || header_contains_token(&head.headers, b"connection", b"close") {
            self.keep_alive = false;
        }
        if (100..200).contains(&head.status) {
            if head.status == 101 {
                return Err(ProtocolError::remote(
                    "received 101 Switching Protocols without an upgrade request",
                ));
            }
            return Ok(Event::InformationalResponse(head));
        }

        if self.connect_pending {
            self.connect_pending = false;
            if (200..300).contains(&head.status) {
                self.their_state = State::SwitchedProtocol;
                self.settle();
                return Ok(Event::Response(head));
            }
            if self.our_state == State::MightSwitchProtocol {
                self.our_state = State::Done;
            }
        }

        let decoder = self.body_decoder(&head)?;
        if matches!(decoder, BodyDecoder::Eof(_)) {
            self.keep_alive = false;
        }
        self.inbound = Some(decoder);
        self.their_state = State::SendBody;
        self.settle();
        Ok(Event::Response(head))
    }

    fn read_body(&mut self) -> Result<Event, ProtocolError> {
        let decoder = self
            .inbound
            .as_mut()
            .ok_or_else(|| ProtocolError::local("no response body in progress"))?;
        let item = if self.eof {
            decoder.decode_eof(&mut self.buffer)
        } else {
            decoder.decode(&mut self.buffer)
        }
        .map_err(|e| ProtocolError::remote(e.to_string()))?;

        match item {
            Decoded::Some(BodyItem::Data(data)) => Ok(Event::Data(data)),
            Decoded::Some(BodyItem::End(trailers)) => {
                self.inbound = None;
                self.their_state = State::Done;
                self.settle();
                Ok(Event::EndOfMessage(trailers))
            }
            _ if self.eof => Err(ProtocolError::remote(
                "peer closed connection without sending complete message body",
            )),
            _ => Ok(Event::NeedData),
        }
    }

    fn body_decoder(&self, head: &ResponseHead) -> Result<BodyDecoder, ProtocolError> {
        if self.request_method.eq_ignore_ascii_case(b"HEAD")
            || head.status == 204
            || head.status == 304
        {
            return Ok(BodyDecoder::Fixed(FixedBodyDecoder::new(0)));
        }
        if header_value(&head.headers, b"transfer-encoding").is_some() {
            let chunked = head
                .headers
                .iter()
                .filter(|(n, _)| n.eq_ignore_ascii_case(b"transfer-encoding"))
                .flat_map(|(_, v)| v.split(|b| *b == b','))
                .last()
                .map(|t| t.trim_ascii().eq_ignore_ascii_case(b"chunked"))
                .unwrap_or(false);
            return Ok(if chunked {
                BodyDecoder::Chunked(ChunkedBodyDecoder::default())
            } else {
                BodyDecoder::Eof(EofBodyDecoder)
            });
        }
        let mut length = None;
        for (_, value) in head
            .headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(b"content-length"))
        {
            for part in value.split(|b| *b == b',') {
                let parsed = parse_content_length(part.trim_ascii())
                    .ok_or_else(|| ProtocolError::remote("bad Content-Length"))?;
                match length {
                    Some(l) if l != parsed => {
                        return Err(ProtocolError::remote("conflicting Content-Length"))
                    }
                    _ => length = Some(parsed),
                }
            }
        }
        Ok(match length {
            Some(l) => BodyDecoder::Fixed(FixedBodyDecoder::new(l)),
            None => BodyDecoder::Eof(EofBodyDecoder),
        })
    }

    fn settle(&mut self) {
        if !self.keep_alive {
            if self.our_state == State::Done {
                self.our_state = State::MustClose;
            }
            if self.their_state == State::Done {
                self.their_state = State::MustClose;
            }
        }
        match (self.our_state, self.their_state) {
            (State::MightSwitchProtocol, State::SwitchedProtocol) => {
                self.our_state = State::SwitchedProtocol
            }
            (State::Closed, State::Done) | (State::Closed, State::Idle) | (State::Error, State::Done) => {
                self.their_state = State::MustClose
            }
            (State::Done, State::Closed) | (State::Idle, State::Closed) | (State::Done, State::Error) => {
                self.our_state = State::MustClose
            }
            _ => (),
        }
    }
}

fn parse_content_length(value: &[u8]) -> Option<u64> {
    if value.is_empty() || !value.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(value).ok()?.parse().ok()
}

fn validate_request(head: &RequestHead) -> Result<Outbound, ProtocolError> {
    if !is_token(&head.method) {
        return Err(ProtocolError::local("illegal method"));
    }
    if head.target.is_empty() || head.target.iter().any(|b| *b <= b' ' || *b == 0x7f) {
        return Err(ProtocolError::local("illegal request target"));
    }
    for (name, value) in head.headers.iter() {
        if !is_token(name) {
            return Err(ProtocolError::local(format!(
                "illegal header name {:?}",
                String::from_utf8_lossy(name)
            )));
        }
        if !is_field_value(value) {
            return Err(ProtocolError::local(format!(
                "illegal header value for {:?}",
                String::from_utf8_lossy(name)
            )));
        }
    }
    if header_value(&head.headers, b"host").is_none() {
        return Err(ProtocolError::local("missing mandatory Host: header"));
    }

    if let Some(te) = header_value(&head.headers, b"transfer-encoding") {
        if !te.trim_ascii().eq_ignore_ascii_case(b"chunked") {
            return Err(ProtocolError::local(
                "only Transfer-Encoding: chunked is supported",
            ));
        }
        return Ok(Outbound::Chunked);
    }
    match header_value(&head.headers, b"content-length") {
        Some(cl) => parse_content_length(cl.trim_ascii())
            .map(|remaining| Outbound::Fixed { remaining })
            .ok_or_else(|| ProtocolError::local("bad Content-Length")),
        None => Ok(Outbound::Fixed { remaining: 0 }),
    }
}

#[cfg(test)]
mod tests {
    use quickcheck::quickcheck;

    use super::*;

    fn get(target: &'static str) -> RequestHead {
        RequestHead::new(
            "GET",
            target,
            vec![(
                Bytes::from_static(b"Host"),
                Bytes::from_static(b"example.test"),
            )],
        )
    }

    fn drain(conn: &mut ClientConnection) -> Vec<Event> {
        let mut events = Vec::new();
        loop {
            let event = conn.next_event().unwrap();
            let stop = matches!(
                event,
                Event::NeedData | Event::Paused | Event::ConnectionClosed
            );
            events.push(event);
            if stop {
                return events;
            }
        }
    }

    #[test]
    fn get_and_reuse() {
        let mut conn = ClientConnection::new();
        let out = conn.send_request(&get("/")).unwrap();
        assert_eq!(&out[..], b"GET / HTTP/1.1\r\nHost: example.test\r\n\r\n");
        assert!(conn.send_end_of_message().unwrap().is_empty());
        assert_eq!(conn.our_state(), State::Done);
        assert_eq!(conn.their_state(), State::SendResponse);

        conn.receive_data(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhel")
            .unwrap();
        let events = drain(&mut conn);
        assert!(matches!(&events[0], Event::Response(h) if h.status == 200));
        assert_eq!(events[1], Event::Data(Bytes::from_static(b"hel")));
        assert_eq!(events[2], Event::NeedData);

        conn.receive_data(b"lo").unwrap();
        let events = drain(&mut conn);
        assert_eq!(events[0], Event::Data(Bytes::from_static(b"lo")));
        assert_eq!(events[1], Event::EndOfMessage(Vec::new()));
        assert_eq!(conn.their_state(), State::Done);

        conn.start_next_cycle().unwrap();
        assert_eq!(conn.our_state(), State::Idle);
        assert!(conn.send_request(&get("/again")).is_ok());
    }

    #[test]
    fn request_body_framing() {
        let mut conn = ClientConnection::new();
        let mut head = get("/upload");
        head.headers.push((
            Bytes::from_static(b"Content-Length"),
            Bytes::from_static(b"3"),
        ));
        conn.send_request(&head).unwrap();
        assert_eq!(&conn.send_data(b"ab").unwrap()[..], b"ab");
        assert!(conn.send_data(b"cd").is_err());
        assert_eq!(conn.our_state(), State::Error);

        let mut conn = ClientConnection::new();
        conn.send_request(&head).unwrap();
        conn.send_data(b"ab").unwrap();
        assert!(conn.send_end_of_message().is_err());

        let mut conn = ClientConnection::new();
        let mut head = get("/stream");
        head.headers.push((
            Bytes::from_static(b"Transfer-Encoding"),
            Bytes::from_static(b"chunked"),
        ));
        conn.send_request(&head).unwrap();
        assert_eq!(&conn.send_data(b"hello").unwrap()[..], b"5\r\nhello\r\n");
        assert_eq!(&conn.send_end_of_message().unwrap()[..], b"0\r\n\r\n");
    }

    #[test]
    fn missing_host_is_local_error() {
        let mut conn = ClientConnection::new();
        let head = RequestHead::new("GET", "/", Vec::new());
        assert!(matches!(
            conn.send_request(&head),
            Err(ProtocolError::Local(_))
        ));
    }

    #[test]
    fn informational_then_final() {
        let mut conn = ClientConnection::new();
        conn.send_request(&get("/")).unwrap();
        conn.send_end_of_message().unwrap();
        conn.receive_data(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 204 No Content\r\n\r\n")
            .unwrap();
        let events = drain(&mut conn);
        assert!(matches!(&events[0], Event::InformationalResponse(h) if h.status == 100));
        assert!(matches!(&events[1], Event::Response(h) if h.status == 204));
        assert_eq!(events[2], Event::EndOfMessage(Vec::new()));
        assert_eq!(events[3], Event::NeedData);
    }

    #[test]
    fn head_response_has_no_body() {
        let mut conn = ClientConnection::new();
        let mut head = get("/");
        head.method = Bytes::from_static(b"HEAD");
        conn.send_request(&head).unwrap();
        conn.send_end_of_message().unwrap();
        conn.receive_data(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n")
            .unwrap();
        let events = drain(&mut conn);
        assert_eq!(events[1], Event::EndOfMessage(Vec::new()));
        assert_eq!(conn.their_state(), State::Done);
    }

    #[test]
    fn connection_close_forces_must_close() {
        let mut conn = ClientConnection::new();
        conn.send_request(&get("/")).unwrap();
        conn.send_end_of_message().unwrap();
        conn.receive_data(b"HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
        drain(&mut conn);
        assert_eq!(conn.our_state(), State::MustClose);
        assert_eq!(conn.their_state(), State::MustClose);
        assert!(conn.start_next_cycle().is_err());
    }

    #[test]
    fn read_until_close() {
        let mut conn = ClientConnection::new();
        conn.send_request(&get("/")).unwrap();
        conn.send_end_of_message().unwrap();
        conn.receive_data(b"HTTP/1.1 200 OK\r\n\r\nsome body").unwrap();
        let events = drain(&mut conn);
        assert_eq!(events[1], Event::Data(Bytes::from_static(b"some body")));
        conn.receive_data(b"").unwrap();
        let events = drain(&mut conn);
        assert_eq!(events[0], Event::EndOfMessage(Vec::new()));
        assert_eq!(events[1], Event::ConnectionClosed);
        assert_eq!(conn.their_state(), State::Closed);
    }

    #[test]
    fn eof_before_response() {
        let mut conn = ClientConnection::new();
        conn.send_request(&get("/")).unwrap();
        conn.send_end_of_message().unwrap();
        conn.receive_data(b"HTTP/1.1 200").unwrap();
        conn.receive_data(b"").unwrap();
        assert!(matches!(conn.next_event(), Err(ProtocolError::Remote(_))));
        assert_eq!(conn.their_state(), State::Error);
        assert_eq!(conn.our_state(), State::MustClose);
    }

    #[test]
    fn truncated_fixed_body() {
        let mut conn = ClientConnection::new();
        conn.send_request(&get("/")).unwrap();
        conn.send_end_of_message().unwrap();
        conn.receive_data(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabc")
            .unwrap();
        drain(&mut conn);
        conn.receive_data(b"").unwrap();
        assert!(conn.next_event().is_err());
    }

    #[test]
    fn connect_switches_protocol() {
        let mut conn = ClientConnection::new();
        let head = RequestHead::new(
            "CONNECT",
            "t.test:443",
            vec![(Bytes::from_static(b"Host"), Bytes::from_static(b"t.test:443"))],
        );
        conn.send_request(&head).unwrap();
        conn.send_end_of_message().unwrap();
        assert_eq!(conn.our_state(), State::MightSwitchProtocol);
        conn.receive_data(b"HTTP/1.1 200 Connection Established\r\n\r\n\x16\x03")
            .unwrap();
        let events = drain(&mut conn);
        assert!(matches!(&events[0], Event::Response(h) if &h.reason[..] == b"Connection Established"));
        assert_eq!(events[1], Event::Paused);
        assert_eq!(conn.our_state(), State::SwitchedProtocol);
        assert_eq!(conn.their_state(), State::SwitchedProtocol);
        assert_eq!(conn.trailing_data().0, b"\x16\x03");
    }

    #[test]
    fn connect_refused() {
        let mut conn = ClientConnection::new();
        let head = RequestHead::new(
            "CONNECT",
            "t.test:443",
            vec![(Bytes::from_static(b"Host"), Bytes::from_static(b"t.test:443"))],
        );
        conn.send_request(&head).unwrap();
        conn.send_end_of_message().unwrap();
        conn.receive_data(b"HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n")
            .unwrap();
        let events = drain(&mut conn);
        assert!(matches!(&events[0], Event::Response(h) if h.status == 407));
        assert_eq!(events[1], Event::EndOfMessage(Vec::new()));
        assert_eq!(conn.our_state(), State::Done);
        assert_eq!(conn.their_state(), State::Done);
    }

    #[test]
    fn idle_peer_eof() {
        let mut conn = ClientConnection::new();
        conn.receive_data(b"").unwrap();
        assert_eq!(conn.next_event().unwrap(), Event::ConnectionClosed);
        assert_eq!(conn.our_state(), State::MustClose);
    }

    quickcheck! {
        fn chunked_body_survives_any_split(body: Vec<u8>, split: usize) -> bool {
            let mut wire = BytesMut::from(&b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n"[..]);
            for chunk in body.chunks(7) {
                ChunkedBodyEncoder.encode(Some(chunk), &mut wire).unwrap();
            }
            ChunkedBodyEncoder.encode(None, &mut wire).unwrap();
            let split = split % (wire.len() + 1);

            let mut conn = ClientConnection::new();
            conn.send_request(&get("/")).unwrap();
            conn.send_end_of_message().unwrap();
            let mut received = Vec::new();
            let mut finished = false;
            for part in [&wire[..split], &wire[split..]] {
                if !part.is_empty() {
                    conn.receive_data(part).unwrap();
                }
                for event in drain(&mut conn) {
                    match event {
                        Event::Data(d) => received.extend_from_slice(&d),
                        Event::EndOfMessage(_) => finished = true,
                        _ => (),
                    }
                }
            }
            finished && received == body
        }
    }
}
