use bytes::{Bytes, BytesMut};

use crate::Result;

/// Lazy, single-use byte sequence.
///
/// `close` must be called once the caller is done with the stream; reaching
/// the end through `next` does not close it.
#[allow(async_fn_in_trait)]
pub trait ByteStream {
    async fn next(&mut self) -> Option<Result<Bytes>>;

    async fn close(&mut self) -> Result<()>;

    /// Reads everything left and closes the stream.
    async fn collect(&mut self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        let res = loop {
            match self.next().await {
                Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                Some(Err(e)) => break Err(e),
                None => break Ok(()),
            }
        };
        self.close().await?;
        res.map(|_| buf.freeze())
    }
}

/// A stream over one in-memory buffer.
#[derive(Debug, Default, Clone)]
pub struct FixedByteStream {
    content: Option<Bytes>,
}

impl FixedByteStream {
    pub fn new(content: impl Into<Bytes>) -> Self {
        let content = content.into();
        Self {
            content: (!content.is_empty()).then_some(content),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }
}

impl ByteStream for FixedByteStream {
    async fn next(&mut self) -> Option<Result<Bytes>> {
        self.content.take().map(Ok)
    }

    async fn close(&mut self) -> Result<()> {
        self.content = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[monoio::test]
    async fn fixed_yields_once() {
        let mut body = FixedByteStream::new("hello");
        assert_eq!(body.next().await.unwrap().unwrap(), "hello");
        assert!(body.next().await.is_none());
        body.close().await.unwrap();
        body.close().await.unwrap();
    }

    #[monoio::test]
    async fn empty_yields_nothing() {
        let mut body = FixedByteStream::new(Bytes::new());
        assert!(body.next().await.is_none());
        assert!(FixedByteStream::empty().collect().await.unwrap().is_empty());
    }
}
