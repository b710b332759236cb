use std::{fmt::Write, io};

use bytes::{Bytes, BytesMut};
use monoio_codec::Encoder;

use crate::common::Headers;

const AVERAGE_HEADER_SIZE: usize = 30;

/// Request line and headers of an outgoing request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: Bytes,
    /// Origin-form (`/path?q`), absolute-form for forward proxies, or
    /// authority-form for `CONNECT`.
    pub target: Bytes,
    pub headers: Headers,
}

impl RequestHead {
    pub fn new(method: impl Into<Bytes>, target: impl Into<Bytes>, headers: Headers) -> Self {
        Self {
            method: method.into(),
            target: target.into(),
            headers,
        }
    }
}

pub struct HeadEncoder;

impl Encoder<&RequestHead> for HeadEncoder {
    type Error = io::Error;

    fn encode(&mut self, item: &RequestHead, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(256 + item.headers.len() * AVERAGE_HEADER_SIZE);
        dst.extend_from_slice(&item.method);
        dst.extend_from_slice(b" ");
        dst.extend_from_slice(&item.target);
        dst.extend_from_slice(b" HTTP/1.1\r\n");

        // names are written as given, casing untouched
        for (name, value) in item.headers.iter() {
            dst.extend_from_slice(name);
            dst.extend_from_slice(b": ");
            dst.extend_from_slice(value);
            dst.extend_from_slice(b"\r\n");
        }
        dst.extend_from_slice(b"\r\n");
        Ok(())
    }
}

pub struct FixedBodyEncoder;

impl Encoder<&[u8]> for FixedBodyEncoder {
    type Error = io::Error;

    fn encode(&mut self, item: &[u8], dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item);
        Ok(())
    }
}

pub struct ChunkedBodyEncoder;

impl Encoder<Option<&[u8]>> for ChunkedBodyEncoder {
    type Error = io::Error;

    fn encode(&mut self, item: Option<&[u8]>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = match item {
            Some(d) if !d.is_empty() => d,
            // an empty chunk would read as the terminator
            Some(_) => return Ok(()),
            None => {
                dst.extend_from_slice(b"0\r\n\r\n");
                return Ok(());
            }
        };
        // 8 size + \r\n + data + \r\n = 12 + data.len()
        dst.reserve(12 + data.len());
        dst.write_fmt(format_args!("{:X}\r\n", data.len()))
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "chunk size format failed"))?;
        dst.extend_from_slice(data);
        dst.extend_from_slice(b"\r\n");
        Ok(())
    }
}
