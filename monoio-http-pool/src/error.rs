use std::io;

use monoio_http_proto::{h2::H2Error, ProtocolError};
use thiserror::Error as ThisError;

#[derive(ThisError, Debug)]
pub enum Error {
    #[error("unsupported protocol {0}")]
    UnsupportedProtocol(String),
    #[error("local protocol error {0}")]
    LocalProtocol(String),
    #[error("remote protocol error {0}")]
    RemoteProtocol(String),
    #[error("proxy error {0}")]
    Proxy(String),
    #[error("connect error {0}")]
    Connect(#[source] io::Error),
    #[error("connect timeout")]
    ConnectTimeout,
    #[error("read error {0}")]
    Read(#[source] io::Error),
    #[error("read timeout")]
    ReadTimeout,
    #[error("write error {0}")]
    Write(#[source] io::Error),
    #[error("write timeout")]
    WriteTimeout,
    #[error("close error {0}")]
    Close(#[source] io::Error),
    #[error("timed out waiting for a pool slot")]
    PoolTimeout,
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),
    /// The chosen connection can't take this request; the pool picks or
    /// opens another one. Never returned to callers.
    #[doc(hidden)]
    #[error("new connection required")]
    NewConnectionRequired,
}

impl Error {
    /// Failures worth another connect attempt.
    pub fn is_connect_error(&self) -> bool {
        matches!(self, Error::Connect(_) | Error::ConnectTimeout)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Error::ConnectTimeout | Error::ReadTimeout | Error::WriteTimeout | Error::PoolTimeout
        )
    }
}

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Local(msg) => Error::LocalProtocol(msg),
            ProtocolError::Remote(msg) => Error::RemoteProtocol(msg),
        }
    }
}

impl From<H2Error> for Error {
    fn from(e: H2Error) -> Self {
        ProtocolError::from(e).into()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
