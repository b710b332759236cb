use std::{fmt, hash::Hash};

use bytes::{BufMut, Bytes, BytesMut};
use http::Uri;
use rustls::pki_types::ServerName;
use service_async::Param;
use smol_str::SmolStr;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scheme {
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }

    fn parse(scheme: &str) -> Option<Self> {
        if scheme.eq_ignore_ascii_case("http") {
            Some(Scheme::Http)
        } else if scheme.eq_ignore_ascii_case("https") {
            Some(Scheme::Https)
        } else {
            None
        }
    }
}

/// `(scheme, host, port)`, the key connections are pooled under.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Origin {
    pub scheme: Scheme,
    pub host: SmolStr,
    pub port: u16,
}

impl Origin {
    pub fn new(scheme: Scheme, host: impl Into<SmolStr>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// `host:port`, as used by `CONNECT` and the HTTP/2 `:authority`.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Host with IPv6 brackets removed, suitable for resolving.
    pub fn connect_host(&self) -> &str {
        self.host.trim_start_matches('[').trim_end_matches(']')
    }

    pub fn is_tls(&self) -> bool {
        self.scheme == Scheme::Https
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
    }
}

impl fmt::Debug for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

// None for plaintext origins or hosts that are not valid TLS names.
impl Param<Option<ServerName<'static>>> for Origin {
    fn param(&self) -> Option<ServerName<'static>> {
        if !self.is_tls() {
            return None;
        }
        ServerName::try_from(self.connect_host().to_string()).ok()
    }
}

/// Request URL split the way the transport needs it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    pub scheme: SmolStr,
    pub host: SmolStr,
    pub port: Option<u16>,
    /// Origin-form path and query, or whatever target the request line carries.
    pub target: Bytes,
}

impl Url {
    pub fn new(
        scheme: impl Into<SmolStr>,
        host: impl Into<SmolStr>,
        port: Option<u16>,
        target: impl Into<Bytes>,
    ) -> Self {
        Self {
            scheme: scheme.into(),
            host: host.into(),
            port,
            target: target.into(),
        }
    }

    /// Rejects schemes other than http(s) and empty hosts.
    pub fn origin(&self) -> Result<Origin> {
        let scheme = Scheme::parse(&self.scheme).ok_or_else(|| {
            Error::UnsupportedProtocol(format!(
                "request URL has an unsupported protocol '{}://'",
                self.scheme
            ))
        })?;
        if self.host.is_empty() {
            return Err(Error::LocalProtocol("missing host in request URL".into()));
        }
        let port = self.port.unwrap_or_else(|| scheme.default_port());
        Ok(Origin::new(scheme, self.host.to_ascii_lowercase(), port))
    }

    /// `scheme://host[:port]target`; the port only appears if it was given.
    pub fn absolute_form(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            self.scheme.len() + self.host.len() + self.target.len() + 10,
        );
        buf.put_slice(self.scheme.as_bytes());
        buf.put_slice(b"://");
        buf.put_slice(self.host.as_bytes());
        if let Some(port) = self.port {
            buf.put_slice(format!(":{port}").as_bytes());
        }
        buf.put_slice(&self.target);
        buf.freeze()
    }
}

impl TryFrom<&Uri> for Url {
    type Error = Error;

    fn try_from(uri: &Uri) -> Result<Self> {
        let scheme = uri
            .scheme_str()
            .ok_or_else(|| Error::UnsupportedProtocol("request URL is missing a scheme".into()))?;
        let host = uri
            .host()
            .ok_or_else(|| Error::LocalProtocol("missing host in request URL".into()))?;
        let target = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| !pq.is_empty())
            .unwrap_or("/");
        Ok(Self::new(
            scheme,
            host,
            uri.port_u16(),
            Bytes::copy_from_slice(target.as_bytes()),
        ))
    }
}

impl TryFrom<Uri> for Url {
    type Error = Error;

    fn try_from(value: Uri) -> Result<Self> {
        Self::try_from(&value)
    }
}

impl TryFrom<&str> for Url {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        let uri = Uri::try_from(value).map_err(|e| Error::LocalProtocol(e.to_string()))?;
        Self::try_from(&uri)
    }
}
