//! Hooks into the life of a request.
//!
//! A [`Listener`] observes one request: the response head and body as they
//! arrive, plus redirects, retries and the final outcome. A
//! [`ResponseFilter`] is installed on the client and sees every response the
//! client intercepts (redirects and authentication challenges) before it
//! acts on them.
//!
//! Callbacks that can steer the request return an [`Outcome`].

use std::error::Error as StdError;
use std::fmt;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};

use crate::partition::PartitionKey;
use crate::{Request, Response, Url};

/// What to do after a callback.
pub enum Outcome {
    /// Keep going.
    Continue,
    /// Stop here and hand back what has been received so far as a success.
    /// The connection is not reused.
    Abort,
    /// Fail the request with this error.
    Err(Box<dyn StdError + Send + Sync>),
}

impl Outcome {
    pub fn err<E: Into<Box<dyn StdError + Send + Sync>>>(err: E) -> Outcome {
        Outcome::Err(err.into())
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Continue => f.write_str("Continue"),
            Outcome::Abort => f.write_str("Abort"),
            Outcome::Err(err) => f.debug_tuple("Err").field(err).finish(),
        }
    }
}

/// Events of a single request.
///
/// Every method has a no-op default. Response callbacks only fire for the
/// response that is handed back to the caller, not for redirects or
/// challenges the client answers itself.
#[allow(unused_variables)]
pub trait Listener: Send + Sync {
    fn on_status(&self, status: StatusCode) -> Outcome {
        Outcome::Continue
    }

    fn on_headers(&self, headers: &HeaderMap) -> Outcome {
        Outcome::Continue
    }

    fn on_body_chunk(&self, chunk: &Bytes) -> Outcome {
        Outcome::Continue
    }

    fn on_complete(&self, response: &Response) {}

    fn on_error(&self, error: &crate::Error) {}

    /// A failed exchange is about to be sent again.
    fn on_retry(&self, url: &Url, retries: u32) {}

    /// A redirect to `next` is about to be followed.
    fn on_redirect(&self, status: StatusCode, next: &Url) {}

    /// The connection that served this request went back to the pool.
    fn on_connection_pooled(&self, key: &PartitionKey) {}
}

/// Inspects intercepted responses before the client acts on them.
pub trait ResponseFilter: Send + Sync {
    /// `Continue` lets the client follow the redirect or answer the
    /// challenge, `Abort` hands the response back to the caller as is.
    fn filter(&self, ctx: &mut FilterContext<'_>) -> Outcome;
}

/// An intercepted response.
pub struct FilterContext<'a> {
    pub(crate) status: StatusCode,
    pub(crate) headers: &'a HeaderMap,
    pub(crate) url: &'a Url,
    pub(crate) next: Option<&'a mut Request>,
}

impl<'a> FilterContext<'a> {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        self.headers
    }

    /// The url that produced this response.
    pub fn url(&self) -> &Url {
        self.url
    }

    /// The request that will follow a redirect, open to rewriting.
    ///
    /// `None` for authentication challenges.
    pub fn next_request(&mut self) -> Option<&mut Request> {
        self.next.as_deref_mut()
    }
}

impl fmt::Debug for FilterContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterContext")
            .field("status", &self.status)
            .field("url", &self.url.as_str())
            .finish()
    }
}

/// Fans events out to every listener of a request.
#[derive(Clone, Default)]
pub(crate) struct Listeners(Vec<std::sync::Arc<dyn Listener>>);

impl Listeners {
    pub(crate) fn push(&mut self, listener: std::sync::Arc<dyn Listener>) {
        self.0.push(listener);
    }

    /// Run a steering callback on each listener, stopping at the first that
    /// does not continue.
    pub(crate) fn steer<F>(&self, mut f: F) -> Outcome
    where
        F: FnMut(&dyn Listener) -> Outcome,
    {
        for listener in &self.0 {
            match f(&**listener) {
                Outcome::Continue => {}
                other => return other,
            }
        }
        Outcome::Continue
    }

    pub(crate) fn each<F>(&self, mut f: F)
    where
        F: FnMut(&dyn Listener),
    {
        for listener in &self.0 {
            f(&**listener);
        }
    }
}

impl fmt::Debug for Listeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Listeners({})", self.0.len())
    }
}
