//! Redirect Handling
//!
//! By default, a `Client` will automatically handle HTTP redirects, having a
//! maximum redirect chain of 5 hops. To customize this behavior, a
//! `redirect::Policy` can be used with a `ClientBuilder`.
//!
//! How the next request is derived from the previous one depends on the
//! status:
//!
//! - `303 See Other` always becomes a `GET` without a body.
//! - `301` and `302` become a `GET` without a body, unless strict 302
//!   handling is enabled, in which case they behave like `307`.
//! - `307` and `308` keep the method and the body.

use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use http::{Method, StatusCode};

use crate::header::{
    HeaderMap, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HOST, TRANSFER_ENCODING,
};
use crate::Url;

/// A type that controls the policy on how to handle the following of redirects.
///
/// The default value has a maximum of 5 redirects it will follow in a chain
/// before returning an error.
///
/// - `limited` can be used have the same as the default behavior, but adjust
///   the allowed maximum redirect hops in a chain.
/// - `none` can be used to disable all redirect behavior.
/// - `custom` can be used to create a customized policy.
pub struct Policy {
    inner: PolicyKind,
}

/// A type that holds information on the next request and previous requests
/// in redirect chain.
#[derive(Debug)]
pub struct Attempt<'a> {
    status: StatusCode,
    next: &'a Url,
    previous: &'a [Url],
}

/// An action to perform when a redirect status code is found.
#[derive(Debug)]
pub struct Action {
    inner: ActionKind,
}

impl Policy {
    /// Create a `Policy` with a maximum number of redirects.
    ///
    /// An `Error` will be returned if the max is reached.
    pub fn limited(max: usize) -> Self {
        Self {
            inner: PolicyKind::Limit(max),
        }
    }

    /// Create a `Policy` that does not follow any redirect.
    pub fn none() -> Self {
        Self {
            inner: PolicyKind::None,
        }
    }

    /// Create a custom `Policy` using the passed function.
    ///
    /// # Note
    ///
    /// The default `Policy` handles a maximum loop
    /// chain, but the custom variant does not do that for you automatically.
    /// The custom policy should have some way of handling those.
    ///
    /// # Example
    ///
    /// ```rust
    /// # use ferry::{Error, redirect};
    /// #
    /// # fn run() -> Result<(), Error> {
    /// let custom = redirect::Policy::custom(|attempt| {
    ///     if attempt.previous().len() > 5 {
    ///         attempt.error("too many redirects")
    ///     } else if attempt.url().host_str() == Some("example.domain") {
    ///         // prevent redirects to 'example.domain'
    ///         attempt.stop()
    ///     } else {
    ///         attempt.follow()
    ///     }
    /// });
    /// let client = ferry::Client::builder()
    ///     .redirect(custom)
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn custom<T>(policy: T) -> Self
    where
        T: FnMut(Attempt) -> Action + Send + Sync + 'static,
    {
        Self {
            inner: PolicyKind::Custom(Arc::new(Mutex::new(policy))),
        }
    }

    /// Apply this policy to a given [`Attempt`] to produce a [`Action`].
    pub fn redirect(&self, attempt: Attempt) -> Action {
        match self.inner {
            PolicyKind::Custom(ref custom) => {
                let mut custom = custom.lock().unwrap_or_else(PoisonError::into_inner);
                custom(attempt)
            }
            PolicyKind::Limit(max) => {
                // `previous` holds the original url too
                if attempt.previous.len() > max {
                    attempt.error(TooManyRedirects)
                } else {
                    attempt.follow()
                }
            }
            PolicyKind::None => attempt.stop(),
        }
    }

    pub(crate) fn check(&self, status: StatusCode, next: &Url, previous: &[Url]) -> ActionKind {
        self.redirect(Attempt {
            status,
            next,
            previous,
        })
        .inner
    }
}

impl Default for Policy {
    fn default() -> Policy {
        Policy::limited(5)
    }
}

impl<'a> Attempt<'a> {
    /// Get the type of redirect.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the next URL to redirect to.
    pub fn url(&self) -> &Url {
        self.next
    }

    /// Get the list of previous URLs that have already been requested in this chain.
    pub fn previous(&self) -> &[Url] {
        self.previous
    }

    /// Returns an action meaning the client should follow the next URL.
    pub fn follow(self) -> Action {
        Action {
            inner: ActionKind::Follow,
        }
    }

    /// Returns an action meaning the client should not follow the next URL.
    ///
    /// The 30x response will be returned as the `Ok` result.
    pub fn stop(self) -> Action {
        Action {
            inner: ActionKind::Stop,
        }
    }

    /// Returns an action failing the redirect with an error.
    ///
    /// The `Error` will be returned for the result of the sent request.
    pub fn error<E: Into<Box<dyn StdError + Send + Sync>>>(self, error: E) -> Action {
        Action {
            inner: ActionKind::Error(error.into()),
        }
    }
}

enum PolicyKind {
    Custom(Arc<Mutex<dyn FnMut(Attempt) -> Action + Send + Sync + 'static>>),
    Limit(usize),
    None,
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("Policy").field(&self.inner).finish()
    }
}

impl fmt::Debug for PolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            PolicyKind::Custom(..) => f.pad("Custom"),
            PolicyKind::Limit(max) => f.debug_tuple("Limit").field(&max).finish(),
            PolicyKind::None => f.pad("None"),
        }
    }
}

// pub(crate)

#[derive(Debug)]
pub(crate) enum ActionKind {
    Follow,
    Stop,
    Error(Box<dyn StdError + Send + Sync>),
}

pub(crate) fn is_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

/// Method and body of the request following a redirect with `status`.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Rewrite {
    pub(crate) method: Method,
    pub(crate) keep_body: bool,
}

pub(crate) fn rewrite(status: StatusCode, method: &Method, strict_302: bool) -> Rewrite {
    let keep_body = match status {
        StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT => true,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => strict_302,
        _ => false,
    };
    let method = if keep_body || *method == Method::HEAD {
        method.clone()
    } else {
        Method::GET
    };
    Rewrite { method, keep_body }
}

/// Headers carried over to the next hop.
///
/// `Host` and `Content-Length` are recomputed for every hop, and the body
/// headers go away with the body.
pub(crate) fn propagated_headers(headers: &HeaderMap, keep_body: bool, strip_auth: bool) -> HeaderMap {
    let mut headers = headers.clone();
    headers.remove(HOST);
    headers.remove(CONTENT_LENGTH);
    if !keep_body {
        headers.remove(CONTENT_TYPE);
        headers.remove(TRANSFER_ENCODING);
    }
    if strip_auth {
        headers.remove(AUTHORIZATION);
    }
    headers
}

/// Whether `a` and `b` share scheme, host and port.
pub(crate) fn same_base(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}

#[derive(Debug)]
pub(crate) struct TooManyRedirects;

impl fmt::Display for TooManyRedirects {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("too many redirects")
    }
}

impl StdError for TooManyRedirects {}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn chain(n: usize) -> Vec<Url> {
        (0..n)
            .map(|i| Url::parse(&format!("http://a.b/c/{i}")).unwrap())
            .collect()
    }

    #[test]
    fn test_redirect_policy_limit() {
        let policy = Policy::default();
        let next = Url::parse("http://x.y/z").unwrap();

        // the original request plus four redirects
        match policy.check(StatusCode::FOUND, &next, &chain(5)) {
            ActionKind::Follow => (),
            other => panic!("unexpected {other:?}"),
        }

        match policy.check(StatusCode::FOUND, &next, &chain(6)) {
            ActionKind::Error(err) if err.is::<TooManyRedirects>() => (),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_redirect_policy_limit_to_0() {
        let policy = Policy::limited(0);
        let next = Url::parse("http://x.y/z").unwrap();

        match policy.check(StatusCode::FOUND, &next, &chain(1)) {
            ActionKind::Error(err) if err.is::<TooManyRedirects>() => (),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_redirect_policy_none() {
        let next = Url::parse("http://x.y/z").unwrap();
        assert!(matches!(
            Policy::none().check(StatusCode::FOUND, &next, &chain(1)),
            ActionKind::Stop
        ));
    }

    #[test]
    fn test_redirect_policy_custom() {
        let policy = Policy::custom(|attempt| {
            if attempt.url().host_str() == Some("foo") {
                attempt.stop()
            } else {
                attempt.follow()
            }
        });

        let next = Url::parse("http://bar/baz").unwrap();
        match policy.check(StatusCode::FOUND, &next, &[]) {
            ActionKind::Follow => (),
            other => panic!("unexpected {other:?}"),
        }

        let next = Url::parse("http://foo/baz").unwrap();
        match policy.check(StatusCode::FOUND, &next, &[]) {
            ActionKind::Stop => (),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn method_and_body_per_status() {
        let post = Method::POST;
        let cases = [
            (StatusCode::SEE_OTHER, false, Method::GET, false),
            (StatusCode::SEE_OTHER, true, Method::GET, false),
            (StatusCode::MOVED_PERMANENTLY, false, Method::GET, false),
            (StatusCode::MOVED_PERMANENTLY, true, Method::POST, true),
            (StatusCode::FOUND, false, Method::GET, false),
            (StatusCode::FOUND, true, Method::POST, true),
            (StatusCode::TEMPORARY_REDIRECT, false, Method::POST, true),
            (StatusCode::PERMANENT_REDIRECT, false, Method::POST, true),
        ];
        for (status, strict, method, keep_body) in cases {
            assert_eq!(
                rewrite(status, &post, strict),
                Rewrite { method, keep_body },
                "{status} strict={strict}"
            );
        }

        assert_eq!(rewrite(StatusCode::SEE_OTHER, &Method::HEAD, false).method, Method::HEAD);
    }

    #[test]
    fn propagated_headers_drop_hop_specific() {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("example.com"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("3"));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic Zm9vOmJhcg=="));
        headers.insert("x-custom", HeaderValue::from_static("1"));

        let kept = propagated_headers(&headers, true, false);
        assert!(kept.get(HOST).is_none());
        assert!(kept.get(CONTENT_LENGTH).is_none());
        assert_eq!(kept[CONTENT_TYPE], "text/plain");
        assert_eq!(kept[AUTHORIZATION], "Basic Zm9vOmJhcg==");
        assert_eq!(kept["x-custom"], "1");

        let dropped = propagated_headers(&headers, false, true);
        assert!(dropped.get(CONTENT_TYPE).is_none());
        assert!(dropped.get(AUTHORIZATION).is_none());
        assert_eq!(dropped["x-custom"], "1");
    }

    #[test]
    fn same_base_compares_scheme_host_port() {
        let a = Url::parse("http://example.com/a").unwrap();
        assert!(same_base(&a, &Url::parse("http://example.com:80/b?c").unwrap()));
        assert!(!same_base(&a, &Url::parse("https://example.com/a").unwrap()));
        assert!(!same_base(&a, &Url::parse("http://example.com:8080/a").unwrap()));
        assert!(!same_base(&a, &Url::parse("http://other.com/a").unwrap()));
    }
}
