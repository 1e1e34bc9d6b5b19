use std::error::Error as StdError;
use std::fmt;
use std::time::Duration;

use http::StatusCode;

use crate::Url;

/// A `Result` alias where the `Err` case is `ferry::Error`.
pub type Result<T> = std::result::Result<T, Error>;

pub(crate) type BoxError = Box<dyn StdError + Send + Sync>;

/// The Errors that may occur when executing a `Request`.
///
/// Note: Errors may include the full URL used to make the `Request`. If the
/// URL contains sensitive information (e.g. an API key as a query parameter),
/// be sure to remove it ([`without_url`](Error::without_url))
pub struct Error {
    inner: Box<Inner>,
}

struct Inner {
    kind: Kind,
    source: Option<BoxError>,
    url: Option<Url>,
    status: Option<StatusCode>,
}

/// The phase of a request that a timeout fired in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutPhase {
    /// Establishing a new connection.
    Connect,
    /// Waiting for the next bytes of a response.
    Read,
    /// The whole logical request, including redirects and retries.
    Request,
}

impl Error {
    pub(crate) fn new<E>(kind: Kind, source: Option<E>) -> Error
    where
        E: Into<BoxError>,
    {
        Error {
            inner: Box::new(Inner {
                kind,
                source: source.map(Into::into),
                url: None,
                status: None,
            }),
        }
    }

    /// Returns a possible URL related to this error.
    pub fn url(&self) -> Option<&Url> {
        self.inner.url.as_ref()
    }

    /// Returns a mutable reference to the URL related to this error
    ///
    /// This is useful if you need to remove sensitive information from the URL
    /// (e.g. an API key in the query), but do not want to remove the URL
    /// entirely.
    pub fn url_mut(&mut self) -> Option<&mut Url> {
        self.inner.url.as_mut()
    }

    /// Add a url related to this error (overwriting any existing)
    pub fn with_url(mut self, url: Url) -> Self {
        self.inner.url = Some(url);
        self
    }

    /// Strip the related url from this error (if, for example, it contains
    /// sensitive information)
    pub fn without_url(mut self) -> Self {
        self.inner.url = None;
        self
    }

    pub(crate) fn with_status(mut self, status: StatusCode) -> Self {
        self.inner.status = Some(status);
        self
    }

    /// Returns the status of the last response received, if the error was
    /// produced after one arrived.
    pub fn status(&self) -> Option<StatusCode> {
        self.inner.status
    }

    /// Returns true if the error is from a type Builder.
    pub fn is_builder(&self) -> bool {
        matches!(self.inner.kind, Kind::Builder)
    }

    /// Returns true if the error is from the redirect chain exceeding its
    /// maximum length, or from a redirect policy refusing to follow.
    pub fn is_redirect(&self) -> bool {
        matches!(self.inner.kind, Kind::Redirect(_))
    }

    /// Returns the number of redirects that were followed, if this is a
    /// redirect error.
    pub fn redirect_count(&self) -> Option<usize> {
        match self.inner.kind {
            Kind::Redirect(count) => Some(count),
            _ => None,
        }
    }

    /// Returns true if the error is related to a timeout.
    pub fn is_timeout(&self) -> bool {
        if matches!(self.inner.kind, Kind::Timeout { .. }) {
            return true;
        }

        let mut source = self.source();

        while let Some(err) = source {
            if err.is::<TimedOut>() {
                return true;
            }
            if let Some(io) = err.downcast_ref::<std::io::Error>() {
                if io.kind() == std::io::ErrorKind::TimedOut {
                    return true;
                }
            }
            source = err.source();
        }

        false
    }

    /// Returns the phase a timeout fired in, if this is a timeout error.
    pub fn timeout_phase(&self) -> Option<TimeoutPhase> {
        match self.inner.kind {
            Kind::Timeout { phase, .. } => Some(phase),
            _ => None,
        }
    }

    /// Returns true if the error is related to connect
    pub fn is_connect(&self) -> bool {
        matches!(self.inner.kind, Kind::Connect)
    }

    /// Returns true if the connection was closed by the peer before a
    /// response arrived.
    pub fn is_remotely_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::RemotelyClosed)
    }

    /// Returns true if the server kept refusing credentials.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self.inner.kind, Kind::Unauthorized)
    }

    /// Returns true if the proxy kept refusing credentials.
    pub fn is_proxy_auth_required(&self) -> bool {
        matches!(self.inner.kind, Kind::ProxyAuthRequired)
    }

    /// Returns true if an authentication challenge could not be parsed.
    pub fn is_malformed_challenge(&self) -> bool {
        matches!(self.inner.kind, Kind::MalformedChallenge)
    }

    /// Returns true if a connection ceiling rejected the request.
    pub fn is_pool_exhausted(&self) -> bool {
        matches!(self.inner.kind, Kind::PoolExhausted)
    }

    /// Returns true if the request was canceled.
    pub fn is_canceled(&self) -> bool {
        matches!(self.inner.kind, Kind::Canceled)
    }

    /// Returns true if the client was closed.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::Closed)
    }

    /// Returns true if the error is related to the request
    pub fn is_request(&self) -> bool {
        matches!(self.inner.kind, Kind::Request)
    }

    /// Returns true if the error is related to the request or response body
    pub fn is_body(&self) -> bool {
        matches!(self.inner.kind, Kind::Body)
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("ferry::Error");

        builder.field("kind", &self.inner.kind);

        if let Some(ref url) = self.inner.url {
            builder.field("url", &url.as_str());
        }
        if let Some(ref status) = self.inner.status {
            builder.field("status", status);
        }
        if let Some(ref source) = self.inner.source {
            builder.field("source", source);
        }

        builder.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner.kind {
            Kind::Builder => f.write_str("builder error")?,
            Kind::Request => f.write_str("error sending request")?,
            Kind::Connect => f.write_str("error trying to connect")?,
            Kind::Timeout { phase, limit } => {
                let phase = match phase {
                    TimeoutPhase::Connect => "connect",
                    TimeoutPhase::Read => "read",
                    TimeoutPhase::Request => "request",
                };
                write!(f, "{phase} timeout after {limit:?}")?;
            }
            Kind::RemotelyClosed => f.write_str("connection closed before a response was received")?,
            Kind::Redirect(count) => match self.inner.source {
                Some(_) => f.write_str("error following redirect")?,
                None => write!(f, "too many redirects ({count})")?,
            },
            Kind::Unauthorized => f.write_str("server rejected the credentials")?,
            Kind::ProxyAuthRequired => f.write_str("proxy rejected the credentials")?,
            Kind::MalformedChallenge => f.write_str("malformed authentication challenge")?,
            Kind::PoolExhausted => f.write_str("connection pool exhausted")?,
            Kind::Body => f.write_str("request or response body error")?,
            Kind::Canceled => f.write_str("request canceled")?,
            Kind::Closed => f.write_str("client closed")?,
        }

        if let Some(url) = &self.inner.url {
            write!(f, " for url ({url})")?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.source.as_ref().map(|e| &**e as _)
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Kind {
    Builder,
    Request,
    Connect,
    Timeout { phase: TimeoutPhase, limit: Duration },
    RemotelyClosed,
    Redirect(usize),
    Unauthorized,
    ProxyAuthRequired,
    MalformedChallenge,
    PoolExhausted,
    Body,
    Canceled,
    Closed,
}

// constructors

pub(crate) fn builder<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Builder, Some(e))
}

pub(crate) fn url_bad_scheme(url: Url) -> Error {
    Error::new(Kind::Builder, Some(BadScheme)).with_url(url)
}

pub(crate) fn request<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Request, Some(e))
}

pub(crate) fn connect<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Connect, Some(e))
}

pub(crate) fn timeout(phase: TimeoutPhase, limit: Duration) -> Error {
    Error::new(Kind::Timeout { phase, limit }, Some(TimedOut))
}

pub(crate) fn remotely_closed<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::RemotelyClosed, Some(e))
}

pub(crate) fn too_many_redirects(count: usize, status: StatusCode) -> Error {
    Error::new(Kind::Redirect(count), None::<Error>).with_status(status)
}

pub(crate) fn redirect<E: Into<BoxError>>(e: E, count: usize, status: StatusCode) -> Error {
    Error::new(Kind::Redirect(count), Some(e)).with_status(status)
}

pub(crate) fn unauthorized(status: StatusCode) -> Error {
    Error::new(Kind::Unauthorized, None::<Error>).with_status(status)
}

pub(crate) fn proxy_auth_required(status: StatusCode) -> Error {
    Error::new(Kind::ProxyAuthRequired, None::<Error>).with_status(status)
}

pub(crate) fn malformed_challenge<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::MalformedChallenge, Some(e))
}

pub(crate) fn pool_exhausted<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::PoolExhausted, Some(e))
}

pub(crate) fn body<E: Into<BoxError>>(e: E) -> Error {
    Error::new(Kind::Body, Some(e))
}

pub(crate) fn canceled() -> Error {
    Error::new(Kind::Canceled, None::<Error>)
}

pub(crate) fn closed() -> Error {
    Error::new(Kind::Closed, None::<Error>)
}

#[derive(Debug)]
pub(crate) struct TimedOut;

#[derive(Debug)]
pub(crate) struct BadScheme;

impl fmt::Display for BadScheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("URL scheme is not allowed")
    }
}

impl StdError for BadScheme {}

impl fmt::Display for TimedOut {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("operation timed out")
    }
}

impl StdError for TimedOut {}
