use std::collections::BTreeMap;

use crate::{
    backend::{Backend, MonoioBackend},
    body::ByteStream,
    config::PoolConfig,
    pool::ConnectionPool,
    request::Request,
    response::Response,
    Error, Result,
};

/// A pool whose connections go through an HTTP proxy.
///
/// Plain http targets are forwarded: the request line carries the
/// absolute-form URL and connections are pooled under the proxy origin.
/// https targets are tunnelled with `CONNECT`, and the tunnel is pooled
/// under the target origin. [`crate::ProxyMode`] overrides the choice.
pub struct HttpProxy<B: Backend = MonoioBackend> {
    pool: ConnectionPool<B>,
}

impl<B: Backend> Clone for HttpProxy<B> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl HttpProxy<MonoioBackend> {
    pub fn new(config: PoolConfig) -> Result<Self> {
        Self::with_backend(config, MonoioBackend)
    }
}

impl<B: Backend> HttpProxy<B> {
    /// `config` must carry a proxy, see [`crate::Builder::proxy_url`].
    pub fn with_backend(config: PoolConfig, backend: B) -> Result<Self> {
        match &config.proxy {
            Some(proxy) => {
                proxy.url.origin()?;
            }
            None => return Err(Error::LocalProtocol("no proxy URL configured".into())),
        }
        Ok(Self {
            pool: ConnectionPool::with_backend(config, backend),
        })
    }

    pub async fn handle_request<Bd: ByteStream>(
        &self,
        request: Request<Bd>,
    ) -> Result<Response<B>> {
        self.pool.handle_request(request).await
    }

    pub fn close(&self) {
        self.pool.close();
    }

    pub fn connection_info(&self) -> BTreeMap<String, Vec<String>> {
        self.pool.connection_info()
    }

    pub fn pool(&self) -> &ConnectionPool<B> {
        &self.pool
    }
}
