use std::fmt;

use bytes::Bytes;

use crate::header::HeaderMap;
use crate::{StatusCode, Url, Version};

/// A Response to a submitted `Request`.
///
/// The body has been read in full by the time a `Response` is handed out,
/// unless a listener aborted the exchange, in which case it holds what had
/// arrived until then.
pub struct Response {
    status: StatusCode,
    version: Version,
    headers: HeaderMap,
    url: Url,
    body: Bytes,
    aborted: bool,
}

impl Response {
    pub(crate) fn new(
        status: StatusCode,
        version: Version,
        headers: HeaderMap,
        url: Url,
        body: Bytes,
        aborted: bool,
    ) -> Response {
        Response {
            status,
            version,
            headers,
            url,
            body,
            aborted,
        }
    }

    /// Get the `StatusCode` of this `Response`.
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the HTTP `Version` of this `Response`.
    #[inline]
    pub fn version(&self) -> Version {
        self.version
    }

    /// Get the `Headers` of this `Response`.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a mutable reference to the `Headers` of this `Response`.
    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Get the final `Url` of this `Response`, after any redirects.
    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get the content-length of the response body.
    pub fn content_length(&self) -> u64 {
        self.body.len() as u64
    }

    /// Whether a listener cut the exchange short.
    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Get the full response body as `Bytes`.
    pub fn bytes(&self) -> &Bytes {
        &self.body
    }

    /// Take the full response body.
    pub fn into_bytes(self) -> Bytes {
        self.body
    }

    /// Get the full response text.
    ///
    /// Invalid UTF-8 sequences are replaced with U+FFFD.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Response")
            .field("url", &self.url.as_str())
            .field("status", &self.status())
            .field("headers", self.headers())
            .finish()
    }
}

impl From<Response> for http::Response<Bytes> {
    fn from(r: Response) -> http::Response<Bytes> {
        let mut res = http::Response::new(r.body);
        *res.status_mut() = r.status;
        *res.version_mut() = r.version;
        *res.headers_mut() = r.headers;
        res
    }
}
