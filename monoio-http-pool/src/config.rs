use std::{net::IpAddr, path::PathBuf, sync::Arc, time::Duration};

use bytes::Bytes;
use http::Extensions;
use monoio_http_proto::Headers;
use rustls::ClientConfig;

use crate::{origin::Url, Error, Result};

/// Per-phase limits, read from the request `Extensions`. `None` waits forever.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Option<Duration>,
    pub read: Option<Duration>,
    pub write: Option<Duration>,
    pub pool: Option<Duration>,
}

impl Timeouts {
    pub fn from_extensions(extensions: &Extensions) -> Self {
        extensions.get::<Timeouts>().copied().unwrap_or_default()
    }
}

/// Protocol the response arrived on, stored in the response `Extensions`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpVersion {
    Http11,
    Http2,
}

impl HttpVersion {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            HttpVersion::Http11 => b"HTTP/1.1",
            HttpVersion::Http2 => b"HTTP/2",
        }
    }
}

/// HTTP/1.1 reason phrase, stored in the response `Extensions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReasonPhrase(pub Bytes);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProxyMode {
    /// Forward plain http, tunnel https.
    #[default]
    Default,
    ForwardOnly,
    TunnelOnly,
}

#[derive(Clone)]
pub struct ProxyConfig {
    pub url: Url,
    pub headers: Headers,
    pub mode: ProxyMode,
    /// Used when the proxy itself speaks https.
    pub tls_config: Arc<ClientConfig>,
}

#[derive(Clone)]
pub struct PoolConfig {
    pub max_connections: Option<usize>,
    pub max_keepalive_connections: Option<usize>,
    pub keepalive_expiry: Option<Duration>,
    pub http1: bool,
    pub http2: bool,
    pub uds: Option<PathBuf>,
    pub local_address: Option<IpAddr>,
    pub retries: usize,
    pub tls_config: Arc<ClientConfig>,
    pub proxy: Option<ProxyConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: Some(10),
            max_keepalive_connections: None,
            keepalive_expiry: None,
            http1: true,
            http2: false,
            uds: None,
            local_address: None,
            retries: 0,
            tls_config: default_tls_config(),
            proxy: None,
        }
    }
}

/// webpki roots, no client auth.
pub fn default_tls_config() -> Arc<ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    )
}

/// Copy of `base` advertising the enabled protocols over ALPN.
pub(crate) fn with_alpn(base: &ClientConfig, http1: bool, http2: bool) -> Arc<ClientConfig> {
    let mut config = base.clone();
    config.alpn_protocols.clear();
    if http1 {
        config.alpn_protocols.push(b"http/1.1".to_vec());
    }
    if http2 {
        config.alpn_protocols.push(b"h2".to_vec());
    }
    Arc::new(config)
}

#[derive(Default, Clone)]
pub struct Builder {
    config: PoolConfig,
    proxy_url: Option<Url>,
    proxy_headers: Headers,
    proxy_mode: ProxyMode,
    proxy_tls_config: Option<Arc<ClientConfig>>,
}

impl Builder {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` lifts the limit.
    pub fn max_connections(&mut self, max: Option<usize>) -> &mut Self {
        self.config.max_connections = max;
        self
    }

    pub fn max_keepalive_connections(&mut self, max: Option<usize>) -> &mut Self {
        self.config.max_keepalive_connections = max;
        self
    }

    pub fn keepalive_expiry(&mut self, expiry: Option<Duration>) -> &mut Self {
        self.config.keepalive_expiry = expiry;
        self
    }

    pub fn http1(&mut self, enabled: bool) -> &mut Self {
        self.config.http1 = enabled;
        self
    }

    pub fn http2(&mut self, enabled: bool) -> &mut Self {
        self.config.http2 = enabled;
        self
    }

    pub fn uds(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.config.uds = Some(path.into());
        self
    }

    pub fn local_address(&mut self, addr: IpAddr) -> &mut Self {
        self.config.local_address = Some(addr);
        self
    }

    pub fn retries(&mut self, retries: usize) -> &mut Self {
        self.config.retries = retries;
        self
    }

    pub fn tls_config(&mut self, config: Arc<ClientConfig>) -> &mut Self {
        self.config.tls_config = config;
        self
    }

    pub fn proxy_url(&mut self, url: Url) -> &mut Self {
        self.proxy_url = Some(url);
        self
    }

    pub fn proxy_headers(&mut self, headers: Headers) -> &mut Self {
        self.proxy_headers = headers;
        self
    }

    pub fn proxy_mode(&mut self, mode: ProxyMode) -> &mut Self {
        self.proxy_mode = mode;
        self
    }

    pub fn proxy_tls_config(&mut self, config: Arc<ClientConfig>) -> &mut Self {
        self.proxy_tls_config = Some(config);
        self
    }

    pub fn build(&self) -> Result<PoolConfig> {
        if !self.config.http1 && !self.config.http2 {
            return Err(Error::LocalProtocol(
                "at least one of http1 and http2 must be enabled".into(),
            ));
        }
        let mut config = self.config.clone();
        if let Some(url) = &self.proxy_url {
            // validated here so a bad proxy URL fails at construction
            url.origin()?;
            config.proxy = Some(ProxyConfig {
                url: url.clone(),
                headers: self.proxy_headers.clone(),
                mode: self.proxy_mode,
                tls_config: self
                    .proxy_tls_config
                    .clone()
                    .unwrap_or_else(|| config.tls_config.clone()),
            });
        }
        Ok(config)
    }
}
