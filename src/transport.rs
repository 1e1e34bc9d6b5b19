//! The seam between the client and the wire.
//!
//! A [`Transport`] opens connections, and a [`Connection`] carries one
//! exchange at a time. The client never parses bytes itself: it hands a
//! fully-formed `http::Request` to the connection and receives the response
//! head plus a stream of body chunks.
//!
//! [`HttpTransport`] is the built-in implementation, plain HTTP/1.1 over TCP.

use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use futures_core::Stream;

use crate::error::BoxError;
use crate::partition::is_secure;
use crate::proxy::ProxyServer;
use crate::Url;
use url::Host;

mod http1;

pub use self::http1::HttpTransport;

/// A response body, delivered chunk by chunk.
pub type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send>>;

/// Alias for the `Future` type returned by [`Transport::connect`].
pub type Connecting = Pin<Box<dyn Future<Output = Result<Box<dyn Connection>, BoxError>> + Send>>;

/// Alias for the `Future` type returned by [`Connection::send`].
pub type Sending<'a> =
    Pin<Box<dyn Future<Output = Result<http::Response<BodyStream>, SendError>> + Send + 'a>>;

/// Opens connections to a [`Destination`].
///
/// It differs from a `tower::Service` in that it does not need a mutable
/// reference to `self`, and is assumed to always be ready to poll.
pub trait Transport: Send + Sync {
    fn connect(&self, dst: &Destination) -> Connecting;
}

/// One open connection.
pub trait Connection: Send + 'static {
    /// Send one request and wait for the response head.
    ///
    /// A connection carries a single exchange at a time; the body of the
    /// previous response must have been consumed before sending again.
    fn send(&mut self, request: http::Request<Bytes>) -> Sending<'_>;

    /// Whether the peer has not closed the connection.
    fn is_open(&self) -> bool;
}

/// Where a connection goes: the target itself, or the proxy in front of it.
#[derive(Clone, PartialEq, Eq)]
pub struct Destination {
    scheme: String,
    host: String,
    port: u16,
    proxied: bool,
}

impl Destination {
    pub(crate) fn new(url: &Url, proxy: Option<&ProxyServer>) -> Destination {
        match proxy {
            Some(proxy) => Destination {
                scheme: url.scheme().to_owned(),
                host: bare_host(proxy.host()).to_owned(),
                port: proxy.port_for(is_secure(url)),
                proxied: true,
            },
            None => Destination {
                scheme: url.scheme().to_owned(),
                host: match url.host() {
                    Some(Host::Ipv6(addr)) => addr.to_string(),
                    Some(host) => host.to_string(),
                    None => String::new(),
                },
                port: url.port_or_known_default().unwrap_or(80),
                proxied: false,
            },
        }
    }

    /// The scheme of the target, even when connecting to a proxy.
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// The host to open a connection to.
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Whether `host` and `port` are those of a proxy.
    pub fn is_proxied(&self) -> bool {
        self.proxied
    }
}

/// Strip the brackets of an IPv6 literal, which name resolution rejects.
fn bare_host(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)?;
        if self.proxied {
            f.write_str(" (proxy)")?;
        }
        Ok(())
    }
}

/// A failed exchange, and whether any of the request reached the wire.
///
/// A request that was never written can always be sent again on another
/// connection.
pub struct SendError {
    source: BoxError,
    written: bool,
}

impl SendError {
    pub fn new(source: impl Into<BoxError>, written: bool) -> SendError {
        SendError {
            source: source.into(),
            written,
        }
    }

    pub fn is_written(&self) -> bool {
        self.written
    }

    pub fn into_inner(self) -> Box<dyn StdError + Send + Sync> {
        self.source
    }
}

impl fmt::Debug for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendError")
            .field("source", &self.source)
            .field("written", &self.written)
            .finish()
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.source, f)
    }
}

impl StdError for SendError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.source)
    }
}
