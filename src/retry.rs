//! Retry requests
//!
//! A `Client` has the ability to retry requests, by sending additional copies
//! to the server when an exchange fails at the transport level: the
//! connection could not be established, or the peer closed it before a
//! response arrived.
//!
//! # Defaults
//!
//! The default retry behavior of a `Client` is write-safety aware. A request
//! is replayed on a fresh connection if none of it reached the wire, or if
//! its method is idempotent. Once any byte of a non-idempotent request has
//! been transmitted, the failure is final. Up to 5 retries are made per
//! logical request.
//!
//! # Scoped
//!
//! A retry policy built with [`for_host()`] only applies to requests within a
//! user-defined scope, and includes a retry budget that permits 20% extra
//! requests to be sent. The retry history applied by a budget should likely
//! only be applied to the same host.
//!
//! # Classifiers
//!
//! A retry policy needs to be configured with a classifier that determines
//! if a failed exchange should be retried. **Requests should not be
//! retried** if the server cannot safely handle the same request twice, or if
//! it causes side effects.

use std::sync::Arc;
use std::time::Duration;

use tower::retry::budget::{Budget as _, TpsBudget as Budget};

use crate::Url;

pub use self::classify::{Action, Classify, ReqRep};
pub use self::scope::Scope;

/// Builder to configure retries
///
/// Construct with [`for_host()`].
#[derive(Debug)]
pub struct Builder {
    budget: Option<f32>,
    classifier: classify::Classifier,
    max_retries_per_request: u32,
    scope: scope::Scoped,
}

/// The internal type that we convert the builder into.
#[derive(Clone, Debug)]
pub(crate) struct Policy {
    budget: Option<Arc<Budget>>,
    classifier: classify::Classifier,
    max_retries_per_request: u32,
    scope: scope::Scoped,
}

/// Create a retry builder with a request scope.
///
/// To provide a scope that isn't a closure, use the more general
/// [`Builder::scoped()`].
pub fn for_host<S>(host: S) -> Builder
where
    S: for<'a> PartialEq<&'a str> + Send + Sync + 'static,
{
    scoped(move |url| host == url.host_str().unwrap_or(""))
}

/// Create a retry policy that will never retry any request.
pub fn never() -> Builder {
    scoped(|_| false).no_budget().max_retries_per_request(0)
}

fn scoped<F>(func: F) -> Builder
where
    F: Fn(&Url) -> bool + Send + Sync + 'static,
{
    Builder::scoped(scope::ScopeFn(func))
}

// ===== impl Builder =====

impl Builder {
    /// Create a scoped retry policy.
    ///
    /// For a more convenient constructor, see [`for_host()`].
    pub fn scoped(scope: impl scope::Scope) -> Self {
        Self {
            budget: Some(0.2),
            classifier: classify::Classifier::WriteSafety,
            max_retries_per_request: 5,
            scope: scope::Scoped::Dyn(Arc::new(scope)),
        }
    }

    /// Set no retry budget.
    ///
    /// Sets that no budget will be enforced. This could also be considered
    /// to be an infinite budget.
    pub fn no_budget(mut self) -> Self {
        self.budget = None;
        self
    }

    /// Sets the max extra load the budget will allow.
    ///
    /// For example, if you send 1,000 requests per second, setting a maximum
    /// extra load value of `0.3` would allow 300 more requests per second
    /// in retries.
    ///
    /// # Panics
    ///
    /// This method will panic if `extra_percent` is less than `0.0`, or
    /// greater than `1000.0`.
    pub fn max_extra_load(mut self, extra_percent: f32) -> Self {
        assert!(extra_percent >= 0.0);
        assert!(extra_percent <= 1000.0);
        self.budget = Some(extra_percent);
        self
    }

    /// Set the max retries allowed per request.
    ///
    /// For each logical (initial) request, only retry up to `max` times. The
    /// budget may stop retries earlier.
    ///
    /// Default is 5 retries.
    pub fn max_retries_per_request(mut self, max: u32) -> Self {
        self.max_retries_per_request = max;
        self
    }

    /// Provide a classifier to determine if a request should be retried.
    ///
    /// # Example
    ///
    /// ```rust
    /// # fn with_builder(builder: ferry::retry::Builder) -> ferry::retry::Builder {
    /// builder.classify_fn(|req_rep| {
    ///     if !req_rep.is_written() {
    ///         req_rep.retryable()
    ///     } else {
    ///         req_rep.success()
    ///     }
    /// })
    /// # }
    /// ```
    pub fn classify_fn<F>(self, func: F) -> Self
    where
        F: Fn(classify::ReqRep<'_>) -> classify::Action + Send + Sync + 'static,
    {
        self.classify(classify::ClassifyFn(func))
    }

    /// Provide a classifier to determine if a request should be retried.
    pub fn classify(mut self, classifier: impl classify::Classify) -> Self {
        self.classifier = classify::Classifier::Dyn(Arc::new(classifier));
        self
    }

    pub(crate) fn default() -> Builder {
        Self {
            // unscoped write-safety retries don't need a budget
            budget: None,
            classifier: classify::Classifier::WriteSafety,
            max_retries_per_request: 5,
            scope: scope::Scoped::Unscoped,
        }
    }

    pub(crate) fn into_policy(self) -> Policy {
        let budget = self
            .budget
            .map(|p| Arc::new(Budget::new(Duration::from_secs(10), 10, p)));
        Policy {
            budget,
            classifier: self.classifier,
            max_retries_per_request: self.max_retries_per_request,
            scope: self.scope,
        }
    }
}

// ===== internal ======

impl Policy {
    /// Whether the failed exchange described by `req_rep` may be sent again,
    /// `retries` having been made already.
    pub(crate) fn retry(&self, req_rep: ReqRep<'_>, retries: u32) -> bool {
        if retries >= self.max_retries_per_request {
            log::trace!("max_retries_per_request hit");
            return false;
        }
        if !self.scope.applies_to(req_rep.url()) {
            return false;
        }
        match self.classifier.classify(req_rep) {
            Action::Success => {
                log::trace!("shouldn't retry!");
                false
            }
            Action::Retryable => {
                log::trace!("could retry!");
                if self.budget.as_ref().map(|b| b.withdraw()).unwrap_or(true) {
                    true
                } else {
                    log::debug!("retryable but could not withdraw from budget");
                    false
                }
            }
        }
    }

    /// Record a request that needed no retry.
    pub(crate) fn deposit(&self) {
        if let Some(ref budget) = self.budget {
            budget.deposit();
        }
    }
}

// sealed types and traits on purpose while exploring design space
mod scope {
    use crate::Url;

    pub trait Scope: Send + Sync + 'static {
        fn applies_to(&self, url: &Url) -> bool;
    }

    pub struct ScopeFn<F>(pub(super) F);

    impl<F> Scope for ScopeFn<F>
    where
        F: Fn(&Url) -> bool + Send + Sync + 'static,
    {
        fn applies_to(&self, url: &Url) -> bool {
            (self.0)(url)
        }
    }

    #[derive(Clone)]
    pub(super) enum Scoped {
        Unscoped,
        Dyn(std::sync::Arc<dyn Scope>),
    }

    impl Scoped {
        pub(super) fn applies_to(&self, url: &Url) -> bool {
            let ret = match self {
                Self::Unscoped => true,
                Self::Dyn(s) => s.applies_to(url),
            };
            log::trace!("retry in scope: {ret}");
            ret
        }
    }

    impl std::fmt::Debug for Scoped {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::Unscoped => f.write_str("Unscoped"),
                Self::Dyn(_) => f.write_str("Scoped"),
            }
        }
    }
}

// sealed types and traits on purpose while exploring design space
mod classify {
    use http::Method;

    use crate::Url;

    pub trait Classify: Send + Sync + 'static {
        fn classify(&self, req_rep: ReqRep<'_>) -> Action;
    }

    // A blanket impl for closures causes inference issues at the call site,
    // every closure would need `: ReqRep` in its arguments.
    pub struct ClassifyFn<F>(pub(super) F);

    impl<F> Classify for ClassifyFn<F>
    where
        F: Fn(ReqRep<'_>) -> Action + Send + Sync + 'static,
    {
        fn classify(&self, req_rep: ReqRep<'_>) -> Action {
            (self.0)(req_rep)
        }
    }

    /// A request that failed before a response arrived.
    #[derive(Debug, Clone, Copy)]
    pub struct ReqRep<'a> {
        method: &'a Method,
        url: &'a Url,
        error: &'a crate::Error,
        written: bool,
    }

    impl<'a> ReqRep<'a> {
        pub(crate) fn new(
            method: &'a Method,
            url: &'a Url,
            error: &'a crate::Error,
            written: bool,
        ) -> ReqRep<'a> {
            ReqRep {
                method,
                url,
                error,
                written,
            }
        }

        pub fn method(&self) -> &Method {
            self.method
        }

        pub fn url(&self) -> &'a Url {
            self.url
        }

        pub fn error(&self) -> &crate::Error {
            self.error
        }

        /// Whether any part of the request reached the wire.
        pub fn is_written(&self) -> bool {
            self.written
        }

        pub fn retryable(self) -> Action {
            Action::Retryable
        }

        pub fn success(self) -> Action {
            Action::Success
        }

        fn is_safe_to_replay(&self) -> bool {
            !self.written || self.method.is_idempotent()
        }
    }

    #[must_use]
    #[derive(Debug, PartialEq, Eq)]
    pub enum Action {
        Success,
        Retryable,
    }

    #[derive(Clone)]
    pub(super) enum Classifier {
        WriteSafety,
        Dyn(std::sync::Arc<dyn Classify>),
    }

    impl Classifier {
        pub(super) fn classify(&self, req_rep: ReqRep<'_>) -> Action {
            match self {
                Self::WriteSafety => {
                    if req_rep.is_safe_to_replay() {
                        Action::Retryable
                    } else {
                        Action::Success
                    }
                }
                Self::Dyn(c) => c.classify(req_rep),
            }
        }
    }

    impl std::fmt::Debug for Classifier {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Self::WriteSafety => f.write_str("WriteSafety"),
                Self::Dyn(_) => f.write_str("Classifier"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn closed() -> crate::Error {
        crate::error::remotely_closed("reset")
    }

    #[test]
    fn write_safety_by_default() {
        let policy = Builder::default().into_policy();
        let url = Url::parse("http://example.com/").unwrap();
        let err = closed();

        assert!(policy.retry(ReqRep::new(&Method::POST, &url, &err, false), 0));
        assert!(!policy.retry(ReqRep::new(&Method::POST, &url, &err, true), 0));
        assert!(policy.retry(ReqRep::new(&Method::PUT, &url, &err, true), 0));
        assert!(policy.retry(ReqRep::new(&Method::GET, &url, &err, true), 4));
        assert!(!policy.retry(ReqRep::new(&Method::GET, &url, &err, true), 5));
    }

    #[test]
    fn never_retries() {
        let policy = never().into_policy();
        let url = Url::parse("http://example.com/").unwrap();
        let err = closed();
        assert!(!policy.retry(ReqRep::new(&Method::GET, &url, &err, false), 0));
    }

    #[test]
    fn scoped_to_host() {
        let policy = for_host("example.com").no_budget().into_policy();
        let err = closed();

        let inside = Url::parse("http://example.com/a").unwrap();
        assert!(policy.retry(ReqRep::new(&Method::GET, &inside, &err, false), 0));

        let outside = Url::parse("http://other.com/a").unwrap();
        assert!(!policy.retry(ReqRep::new(&Method::GET, &outside, &err, false), 0));
    }

    #[test]
    fn custom_classifier() {
        let policy = Builder::default()
            .classify_fn(|req_rep| {
                if req_rep.error().is_connect() {
                    req_rep.retryable()
                } else {
                    req_rep.success()
                }
            })
            .max_retries_per_request(1)
            .into_policy();
        let url = Url::parse("http://example.com/").unwrap();

        let refused = crate::error::connect("refused");
        assert!(policy.retry(ReqRep::new(&Method::POST, &url, &refused, true), 0));
        assert!(!policy.retry(ReqRep::new(&Method::POST, &url, &refused, true), 1));

        let err = closed();
        assert!(!policy.retry(ReqRep::new(&Method::GET, &url, &err, false), 0));
    }

    #[test]
    fn budget_limits_retries() {
        let policy = for_host("example.com")
            .max_extra_load(0.0)
            .max_retries_per_request(1000)
            .into_policy();
        let url = Url::parse("http://example.com/").unwrap();
        let err = closed();

        // only the minimum reserve is available without deposits
        let granted = (0..500)
            .filter(|_| policy.retry(ReqRep::new(&Method::GET, &url, &err, false), 0))
            .count();
        assert!(granted > 0);
        assert!(granted < 500, "granted {granted}");
    }
}
