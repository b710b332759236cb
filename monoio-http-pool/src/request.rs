use bytes::Bytes;
use http::Extensions;
use monoio_http_proto::{common::header_value, Headers};

use crate::{body::FixedByteStream, config::Timeouts, origin::Url};

pub struct Request<B = FixedByteStream> {
    pub method: Bytes,
    pub url: Url,
    pub headers: Headers,
    pub body: B,
    /// Recognizes [`Timeouts`].
    pub extensions: Extensions,
}

impl<B> Request<B> {
    pub fn new(method: impl Into<Bytes>, url: Url, headers: Headers, body: B) -> Self {
        Self {
            method: method.into(),
            url,
            headers,
            body,
            extensions: Extensions::new(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.extensions.insert(timeouts);
        self
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts::from_extensions(&self.extensions)
    }

    /// A body is only sent when framing headers announce one.
    pub(crate) fn has_body_headers(&self) -> bool {
        header_value(&self.headers, b"content-length").is_some()
            || header_value(&self.headers, b"transfer-encoding").is_some()
    }
}

impl Request<FixedByteStream> {
    /// Body-less request with a `Host` header derived from `url`.
    pub fn get(url: Url) -> Self {
        let host = match url.port {
            Some(port) => format!("{}:{}", url.host, port),
            None => url.host.to_string(),
        };
        Self::new(
            "GET",
            url,
            vec![(Bytes::from_static(b"Host"), Bytes::from(host))],
            FixedByteStream::empty(),
        )
    }
}

/// `base` with every header `overrides` also names removed, followed by `overrides`.
pub(crate) fn merge_headers(base: &[(Bytes, Bytes)], overrides: &[(Bytes, Bytes)]) -> Headers {
    let mut merged: Headers = base
        .iter()
        .filter(|(name, _)| !overrides.iter().any(|(o, _)| o.eq_ignore_ascii_case(name)))
        .cloned()
        .collect();
    merged.extend(overrides.iter().cloned());
    merged
}
