use std::rc::Weak;

use bytes::Bytes;
use http::Extensions;
use monoio_http_proto::Headers;

use crate::{
    backend::{Backend, NetworkStream},
    body::ByteStream,
    config::{HttpVersion, ReasonPhrase},
    connection::Connection,
    http11::Http11Body,
    http2::Http2Body,
    pool::{ConnectionPool, PoolShared},
    Result,
};

pub(crate) enum BodyStream<S: NetworkStream> {
    Http11(Http11Body<S>),
    Http2(Http2Body<S>),
}

impl<S: NetworkStream> BodyStream<S> {
    pub(crate) async fn next(&mut self) -> Option<Result<Bytes>> {
        match self {
            BodyStream::Http11(b) => b.next().await,
            BodyStream::Http2(b) => b.next().await,
        }
    }

    /// Gives the connection back: HTTP/1.1 keeps it only if the exchange
    /// completed, HTTP/2 resets the stream if it is still open.
    pub(crate) fn close(&mut self) {
        match self {
            BodyStream::Http11(b) => b.close(),
            BodyStream::Http2(b) => b.close(),
        }
    }

    async fn flush(&self) {
        if let BodyStream::Http2(b) = self {
            b.connection().flush_pending().await;
        }
    }
}

/// What a connection hands back before the pool wraps it.
pub(crate) struct ConnectionResponse<S: NetworkStream> {
    pub status: u16,
    pub headers: Headers,
    pub extensions: Extensions,
    pub body: BodyStream<S>,
}

pub struct Response<B: Backend> {
    pub status: u16,
    pub headers: Headers,
    /// Carries [`HttpVersion`] and, for HTTP/1.1, [`ReasonPhrase`].
    pub extensions: Extensions,
    pub body: ResponseBody<B>,
}

impl<B: Backend> Response<B> {
    pub(crate) fn new(
        response: ConnectionResponse<B::Stream>,
        pool: Weak<PoolShared<B>>,
        connection: Connection<B>,
    ) -> Self {
        Self {
            status: response.status,
            headers: response.headers,
            extensions: response.extensions,
            body: ResponseBody {
                stream: response.body,
                checkout: Some(Checkout { pool, connection }),
            },
        }
    }

    pub fn http_version(&self) -> HttpVersion {
        self.extensions
            .get::<HttpVersion>()
            .copied()
            .unwrap_or(HttpVersion::Http11)
    }

    pub fn reason_phrase(&self) -> &[u8] {
        self.extensions
            .get::<ReasonPhrase>()
            .map(|r| r.0.as_ref())
            .unwrap_or_default()
    }

    /// Reads the whole body and releases the connection.
    pub async fn bytes(mut self) -> Result<Bytes> {
        self.body.collect().await
    }
}

struct Checkout<B: Backend> {
    pool: Weak<PoolShared<B>>,
    connection: Connection<B>,
}

impl<B: Backend> Checkout<B> {
    fn release(self) {
        if let Some(shared) = self.pool.upgrade() {
            ConnectionPool::from_shared(shared).on_response_closed(&self.connection);
        }
    }
}

/// Response body that returns its connection to the pool once it is
/// exhausted, fails, is closed or is dropped.
pub struct ResponseBody<B: Backend> {
    stream: BodyStream<B::Stream>,
    // option is for take on release
    checkout: Option<Checkout<B>>,
}

impl<B: Backend> ResponseBody<B> {
    fn release(&mut self) {
        if let Some(checkout) = self.checkout.take() {
            self.stream.close();
            checkout.release();
        }
    }
}

impl<B: Backend> ByteStream for ResponseBody<B> {
    async fn next(&mut self) -> Option<Result<Bytes>> {
        if self.checkout.is_none() {
            return None;
        }
        let item = self.stream.next().await;
        if !matches!(item, Some(Ok(_))) {
            self.release();
        }
        item
    }

    async fn close(&mut self) -> Result<()> {
        if self.checkout.is_some() {
            self.stream.close();
            self.stream.flush().await;
            self.release();
        }
        Ok(())
    }
}

impl<B: Backend> Drop for ResponseBody<B> {
    fn drop(&mut self) {
        if self.checkout.is_some() {
            #[cfg(feature = "logging")]
            tracing::debug!("response body dropped before close");
            self.release();
        }
    }
}
