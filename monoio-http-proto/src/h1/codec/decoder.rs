use std::io;

use bytes::{Buf, Bytes, BytesMut};
use monoio_codec::{Decoded, Decoder};
use thiserror::Error as ThisError;

use crate::common::Headers;

pub const MAX_HEADERS: usize = 100;
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

#[derive(ThisError, Debug)]
pub enum DecodeError {
    #[error("httparse error {0}")]
    Parse(#[from] httparse::Error),
    #[error("response head exceeds {MAX_HEAD_SIZE} bytes")]
    TooLarge,
    #[error("invalid header")]
    Header,
    #[error("chunked")]
    Chunked,
    #[error("io error {0}")]
    Io(#[from] io::Error),
}

/// Status line and headers of a response, as received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub reason: Bytes,
    /// Minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    pub version: u8,
    pub headers: Headers,
}

struct HeaderIndex {
    name: (usize, usize),
    value: (usize, usize),
}

const EMPTY_HEADER_INDEX: HeaderIndex = HeaderIndex {
    name: (0, 0),
    value: (0, 0),
};

#[derive(Default)]
pub struct ResponseHeadDecoder;

impl Decoder for ResponseHeadDecoder {
    type Item = ResponseHead;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Decoded<Self::Item>, Self::Error> {
        let mut header_indices = [EMPTY_HEADER_INDEX; MAX_HEADERS];
        let (data_len, header_len, version, status, reason) = {
            let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
            let mut resp = httparse::Response::new(&mut headers);
            let base_ptr = src.as_ptr() as usize;

            let l = match resp.parse(src)? {
                httparse::Status::Complete(l) => l,
                httparse::Status::Partial => {
                    if src.len() > MAX_HEAD_SIZE {
                        return Err(DecodeError::TooLarge);
                    }
                    return Ok(Decoded::Insufficient);
                }
            };
            for (h, index) in resp.headers.iter().zip(header_indices.iter_mut()) {
                let n_begin = h.name.as_ptr() as usize - base_ptr;
                let n_end = n_begin + h.name.len();
                let v_begin = h.value.as_ptr() as usize - base_ptr;
                let v_end = v_begin + h.value.len();
                index.name = (n_begin, n_end);
                index.value = (v_begin, v_end);
            }
            let reason = match resp.reason {
                Some(r) if !r.is_empty() => {
                    let begin = r.as_ptr() as usize - base_ptr;
                    (begin, begin + r.len())
                }
                _ => (0, 0),
            };
            let version = resp.version.ok_or(DecodeError::Header)?;
            let status = resp.code.ok_or(DecodeError::Header)?;

            (l, resp.headers.len(), version, status, reason)
        };

        let data = src.split_to(data_len).freeze();
        let headers = header_indices
            .iter()
            .take(header_len)
            .map(|h| {
                (
                    data.slice(h.name.0..h.name.1),
                    data.slice(h.value.0..h.value.1),
                )
            })
            .collect();

        Ok(Decoded::Some(ResponseHead {
            status,
            reason: data.slice(reason.0..reason.1),
            version,
            headers,
        }))
    }
}

/// One step of a decoded message body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyItem {
    Data(Bytes),
    /// The body is complete. Carries trailers for chunked bodies.
    End(Headers),
}

pub struct FixedBodyDecoder {
    remaining: u64,
}

impl FixedBodyDecoder {
    pub fn new(length: u64) -> Self {
        Self { remaining: length }
    }
}

impl Decoder for FixedBodyDecoder {
    type Item = BodyItem;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Decoded<Self::Item>, Self::Error> {
        if self.remaining == 0 {
            return Ok(Decoded::Some(BodyItem::End(Vec::new())));
        }
        if src.is_empty() {
            return Ok(Decoded::Insufficient);
        }
        let n = (self.remaining.min(src.len() as u64)) as usize;
        self.remaining -= n as u64;
        Ok(Decoded::Some(BodyItem::Data(src.split_to(n).freeze())))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkedState {
    Size,
    Data(usize),
    DataEnd,
    Trailers,
    Done,
}

pub struct ChunkedBodyDecoder {
    state: ChunkedState,
}

impl Default for ChunkedBodyDecoder {
    fn default() -> Self {
        Self {
            state: ChunkedState::Size,
        }
    }
}

impl ChunkedBodyDecoder {
    fn decode_size(src: &mut BytesMut) -> Result<Decoded<usize>, DecodeError> {
        let line_end = match src.windows(2).position(|w| w == b"\r\n") {
            Some(p) => p,
            None => {
                if src.len() > MAX_HEAD_SIZE {
                    return Err(DecodeError::Chunked);
                }
                return Ok(Decoded::Insufficient);
            }
        };
        let mut len: usize = 0;
        let mut read = 0;
        for b in src[..line_end].iter() {
            let n = match b {
                b @ b'0'..=b'9' => b - b'0',
                b @ b'a'..=b'f' => b + 10 - b'a',
                b @ b'A'..=b'F' => b + 10 - b'A',
                // chunk extensions are ignored
                b';' | b' ' | b'\t' => break,
                _ => return Err(DecodeError::Chunked),
            };
            read += 1;
            len = len
                .checked_mul(16)
                .and_then(|l| l.checked_add(n as usize))
                .ok_or(DecodeError::Chunked)?;
        }
        if read == 0 || len > usize::MAX - 2 {
            return Err(DecodeError::Chunked);
        }
        src.advance(line_end + 2);
        Ok(Decoded::Some(len))
    }

    fn decode_trailers(src: &mut BytesMut) -> Result<Decoded<Headers>, DecodeError> {
        if src.starts_with(b"\r\n") {
            src.advance(2);
            return Ok(Decoded::Some(Vec::new()));
        }
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let (consumed, pairs) = match httparse::parse_headers(src, &mut headers)? {
            httparse::Status::Complete((consumed, parsed)) => (
                consumed,
                parsed
                    .iter()
                    .map(|h| {
                        (
                            Bytes::copy_from_slice(h.name.as_bytes()),
                            Bytes::copy_from_slice(h.value),
                        )
                    })
                    .collect::<Headers>(),
            ),
            httparse::Status::Partial => {
                if src.len() > MAX_HEAD_SIZE {
                    return Err(DecodeError::TooLarge);
                }
                return Ok(Decoded::Insufficient);
            }
        };
        src.advance(consumed);
        Ok(Decoded::Some(pairs))
    }
}

impl Decoder for ChunkedBodyDecoder {
    type Item = BodyItem;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Decoded<Self::Item>, Self::Error> {
        loop {
            match self.state {
                ChunkedState::Size => match Self::decode_size(src)? {
                    Decoded::Some(0) => self.state = ChunkedState::Trailers,
                    Decoded::Some(len) => self.state = ChunkedState::Data(len),
                    _ => return Ok(Decoded::Insufficient),
                },
                ChunkedState::Data(remaining) => {
                    if src.is_empty() {
                        return Ok(Decoded::Insufficient);
                    }
                    let n = remaining.min(src.len());
                    let data = src.split_to(n).freeze();
                    self.state = if n == remaining {
                        ChunkedState::DataEnd
                    } else {
                        ChunkedState::Data(remaining - n)
                    };
                    return Ok(Decoded::Some(BodyItem::Data(data)));
                }
                ChunkedState::DataEnd => {
                    if src.len() < 2 {
                        return Ok(Decoded::InsufficientAtLeast(2));
                    }
                    // \r\n
                    if &src[..2] != b"\r\n" {
                        return Err(DecodeError::Chunked);
                    }
                    src.advance(2);
                    self.state = ChunkedState::Size;
                }
                ChunkedState::Trailers => match Self::decode_trailers(src)? {
                    Decoded::Some(trailers) => {
                        self.state = ChunkedState::Done;
                        return Ok(Decoded::Some(BodyItem::End(trailers)));
                    }
                    _ => return Ok(Decoded::Insufficient),
                },
                ChunkedState::Done => return Ok(Decoded::Some(BodyItem::End(Vec::new()))),
            }
        }
    }
}

/// Body delimited by the peer closing the connection.
#[derive(Default)]
pub struct EofBodyDecoder;

impl Decoder for EofBodyDecoder {
    type Item = BodyItem;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Decoded<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(Decoded::Insufficient);
        }
        Ok(Decoded::Some(BodyItem::Data(src.split().freeze())))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Decoded<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Decoded::Some(item) => Ok(Decoded::Some(item)),
            _ => Ok(Decoded::Some(BodyItem::End(Vec::new()))),
        }
    }
}

/// Framing of an incoming body, chosen from the response head.
pub enum BodyDecoder {
    Fixed(FixedBodyDecoder),
    Chunked(ChunkedBodyDecoder),
    Eof(EofBodyDecoder),
}

impl Decoder for BodyDecoder {
    type Item = BodyItem;
    type Error = DecodeError;

    #[inline]
    fn decode(&mut self, src: &mut BytesMut) -> Result<Decoded<Self::Item>, Self::Error> {
        match self {
            BodyDecoder::Fixed(d) => d.decode(src),
            BodyDecoder::Chunked(d) => d.decode(src),
            BodyDecoder::Eof(d) => d.decode(src),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Decoded<Self::Item>, Self::Error> {
        match self {
            BodyDecoder::Eof(d) => d.decode_eof(src),
            _ => self.decode(src),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_head_keeps_case() {
        let mut data =
            BytesMut::from("HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Trace-ID: abc\r\n\r\nhello");
        let head = ResponseHeadDecoder.decode(&mut data).unwrap().unwrap();
        assert_eq!(head.status, 200);
        assert_eq!(head.version, 1);
        assert_eq!(&head.reason[..], b"OK");
        assert_eq!(&head.headers[1].0[..], b"X-Trace-ID");
        assert_eq!(&data[..], b"hello");
    }

    #[test]
    fn decode_partial_head() {
        let mut data = BytesMut::from("HTTP/1.1 200 OK\r\nContent-Len");
        assert!(matches!(ResponseHeadDecoder.decode(&mut data).unwrap(), Decoded::Insufficient));
        assert_eq!(data.len(), 28);
    }

    #[test]
    fn decode_head_without_reason() {
        let mut data = BytesMut::from("HTTP/1.1 204\r\n\r\n");
        let head = ResponseHeadDecoder.decode(&mut data).unwrap().unwrap();
        assert_eq!(head.status, 204);
        assert!(head.reason.is_empty());
    }

    #[test]
    fn oversized_head_rejected() {
        let mut data = BytesMut::from("HTTP/1.1 200 OK\r\n");
        data.extend_from_slice(&vec![b'a'; MAX_HEAD_SIZE + 1]);
        assert!(matches!(
            ResponseHeadDecoder.decode(&mut data),
            Err(DecodeError::TooLarge) | Err(DecodeError::Parse(_))
        ));
    }

    #[test]
    fn decode_fixed_body() {
        let mut data = BytesMut::from("balabalabalabala");
        let mut decoder = FixedBodyDecoder::new(8);
        assert_eq!(
            decoder.decode(&mut data).unwrap().unwrap(),
            BodyItem::Data(Bytes::from_static(b"balabala"))
        );
        assert_eq!(
            decoder.decode(&mut data).unwrap().unwrap(),
            BodyItem::End(Vec::new())
        );
        assert_eq!(data.len(), 8);
    }

    #[test]
    fn decode_chunked_body() {
        let mut data = BytesMut::from("a\r\n0000000000\r\n1;ext=1\r\nx\r\n0\r\n\r\n");
        let mut decoder = ChunkedBodyDecoder::default();
        assert_eq!(
            decoder.decode(&mut data).unwrap().unwrap(),
            BodyItem::Data(Bytes::from_static(b"0000000000"))
        );
        assert_eq!(
            decoder.decode(&mut data).unwrap().unwrap(),
            BodyItem::Data(Bytes::from_static(b"x"))
        );
        assert_eq!(
            decoder.decode(&mut data).unwrap().unwrap(),
            BodyItem::End(Vec::new())
        );
        assert!(data.is_empty());
    }

    #[test]
    fn decode_chunked_split_across_reads() {
        let mut decoder = ChunkedBodyDecoder::default();
        let mut data = BytesMut::from("5\r\nhel");
        assert_eq!(
            decoder.decode(&mut data).unwrap().unwrap(),
            BodyItem::Data(Bytes::from_static(b"hel"))
        );
        assert!(matches!(decoder.decode(&mut data).unwrap(), Decoded::Insufficient));
        data.extend_from_slice(b"lo\r\n0\r\nExpires: never\r\n\r\n");
        assert_eq!(
            decoder.decode(&mut data).unwrap().unwrap(),
            BodyItem::Data(Bytes::from_static(b"lo"))
        );
        match decoder.decode(&mut data).unwrap().unwrap() {
            BodyItem::End(trailers) => {
                assert_eq!(&trailers[0].0[..], b"Expires");
                assert_eq!(&trailers[0].1[..], b"never");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn chunk_terminator_hint() {
        let mut decoder = ChunkedBodyDecoder::default();
        let mut data = BytesMut::from("3\r\nabc\r");
        assert_eq!(
            decoder.decode(&mut data).unwrap(),
            Decoded::Some(BodyItem::Data(Bytes::from_static(b"abc")))
        );
        assert_eq!(
            decoder.decode(&mut data).unwrap(),
            Decoded::InsufficientAtLeast(2)
        );
        data.extend_from_slice(b"\n0\r\n\r\n");
        assert_eq!(
            decoder.decode(&mut data).unwrap(),
            Decoded::Some(BodyItem::End(Vec::new()))
        );
    }

    #[test]
    fn decode_too_big_chunked_body() {
        let mut data = BytesMut::from("a\r\n0000000000\r\ndeadbeefcafebabe0\r\nx\r\n0\r\n\r\n");
        let mut decoder = ChunkedBodyDecoder::default();
        assert_eq!(
            decoder.decode(&mut data).unwrap().unwrap(),
            BodyItem::Data(Bytes::from_static(b"0000000000"))
        );
        assert!(decoder.decode(&mut data).is_err());
    }

    #[test]
    fn decode_until_eof() {
        let mut data = BytesMut::from("partial");
        let mut decoder = BodyDecoder::Eof(EofBodyDecoder);
        assert_eq!(
            decoder.decode(&mut data).unwrap().unwrap(),
            BodyItem::Data(Bytes::from_static(b"partial"))
        );
        assert!(matches!(decoder.decode(&mut data).unwrap(), Decoded::Insufficient));
        assert_eq!(
            decoder.decode_eof(&mut data).unwrap().unwrap(),
            BodyItem::End(Vec::new())
        );
    }
}
