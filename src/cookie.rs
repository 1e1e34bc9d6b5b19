//! HTTP Cookies
//!
//! [`Jar`] is a thread-safe, in-memory cookie store following the matching
//! rules of RFC 6265:
//!
//! - a cookie is identified by its name (case-insensitive), domain
//!   (case-insensitive) and path (case-sensitive); storing a cookie with the
//!   same identity replaces the previous one;
//! - without a `Domain` attribute a cookie is host-only, and is never sent to
//!   subdomains;
//! - without a `Path` attribute the cookie takes the directory of the request
//!   path;
//! - `Secure` cookies are only sent over secure schemes; ports are ignored.

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::{Duration, SystemTime};

use crate::header::HeaderValue;
use crate::Url;

/// Actions for a cookie store providing session support.
pub trait CookieStore: Send + Sync {
    /// Store a set of Set-Cookie header values received from `url`
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url);
    /// Get any Cookie values in the store for `url`
    fn cookies(&self, url: &Url) -> Option<HeaderValue>;
    /// Drop cookies that have expired. The client calls this periodically.
    fn evict_expired(&self) {}
}

/// A single HTTP cookie.
#[derive(Clone)]
pub struct Cookie(cookie_crate::Cookie<'static>);

/// A good default `CookieStore` implementation.
///
/// This is the implementation used when simply calling `cookie_store(true)`
/// on a `ClientBuilder`. This type is exposed to allow creating one and
/// filling in cookies directly, and to share one jar between clients.
#[derive(Default)]
pub struct Jar {
    domains: RwLock<HashMap<String, HashMap<CookieKey, StoredCookie>>>,
    creation: AtomicU64,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CookieKey {
    name: String,
    path: String,
}

struct StoredCookie {
    cookie: Cookie,
    host_only: bool,
    expires_at: Option<SystemTime>,
    path: String,
    order: u64,
}

// ===== impl Cookie =====

impl Cookie {
    /// Create a session cookie with no attributes.
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Cookie {
        Cookie(cookie_crate::Cookie::new(name.into(), value.into()))
    }

    /// Parse a single `Set-Cookie` value.
    pub fn parse(value: &str) -> Result<Cookie, CookieParseError> {
        cookie_crate::Cookie::parse(value.to_owned())
            .map(Cookie)
            .map_err(CookieParseError)
    }

    fn from_header(value: &HeaderValue) -> Result<Cookie, CookieParseError> {
        std::str::from_utf8(value.as_bytes())
            .map_err(cookie_crate::ParseError::from)
            .map_err(CookieParseError)
            .and_then(Cookie::parse)
    }

    /// The name of the cookie.
    pub fn name(&self) -> &str {
        self.0.name()
    }

    /// The value of the cookie.
    pub fn value(&self) -> &str {
        self.0.value()
    }

    /// Returns true if the 'HttpOnly' directive is enabled.
    pub fn http_only(&self) -> bool {
        self.0.http_only().unwrap_or(false)
    }

    /// Returns true if the 'Secure' directive is enabled.
    pub fn secure(&self) -> bool {
        self.0.secure().unwrap_or(false)
    }

    /// Returns the path directive of the cookie, if set.
    pub fn path(&self) -> Option<&str> {
        self.0.path()
    }

    /// Returns the domain directive of the cookie, if set.
    pub fn domain(&self) -> Option<&str> {
        self.0.domain()
    }

    /// Get the Max-Age information, in seconds. Zero or negative means the
    /// cookie is already expired.
    pub fn max_age(&self) -> Option<i64> {
        self.0.max_age().map(|d| d.whole_seconds())
    }

    /// The cookie expiration time.
    pub fn expires(&self) -> Option<SystemTime> {
        self.0.expires_datetime().map(SystemTime::from)
    }

    /// Set the Max-Age attribute, in seconds.
    pub fn set_max_age(&mut self, seconds: i64) {
        self.0
            .set_max_age(cookie_crate::time::Duration::seconds(seconds));
    }

    /// Absolute expiry, from Max-Age if present, else Expires.
    fn expires_at(&self, now: SystemTime) -> Option<SystemTime> {
        match self.max_age() {
            Some(secs) if secs <= 0 => Some(SystemTime::UNIX_EPOCH),
            // past what SystemTime can represent: never expires
            Some(secs) => now.checked_add(Duration::from_secs(secs.unsigned_abs())),
            None => self.expires(),
        }
    }
}

impl fmt::Debug for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Renders `name=value`, the form sent in a `Cookie` request header.
impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}={}", self.name(), self.value())
    }
}

// ===== impl Jar =====

impl Jar {
    /// Add a cookie str to this jar.
    ///
    /// # Example
    ///
    /// ```
    /// use ferry::{cookie::Jar, Url};
    ///
    /// let cookie = "foo=bar; Domain=yolo.local";
    /// let url = "https://yolo.local".parse::<Url>().unwrap();
    ///
    /// let jar = Jar::default();
    /// jar.add_cookie_str(cookie, &url);
    /// assert_eq!(jar.get(&url).len(), 1);
    /// ```
    pub fn add_cookie_str(&self, cookie: &str, url: &Url) {
        match Cookie::parse(cookie) {
            Ok(cookie) => self.add(url, cookie),
            Err(err) => log::warn!("ignoring malformed Set-Cookie from {url}: {err}"),
        }
    }

    /// Store `cookie` as received from `url`.
    ///
    /// A cookie that is already expired removes any stored cookie with the
    /// same identity instead.
    pub fn add(&self, url: &Url, cookie: Cookie) {
        self.add_at(url, cookie, SystemTime::now());
    }

    fn add_at(&self, url: &Url, cookie: Cookie, now: SystemTime) {
        let Some(request_host) = url.host_str().map(str::to_ascii_lowercase) else {
            return;
        };

        let (domain, host_only) = match cookie.domain().map(|d| d.trim_start_matches('.')) {
            Some(domain) if !domain.is_empty() => {
                let domain = domain.to_ascii_lowercase();
                if !domain_match(&request_host, &domain) {
                    log::debug!("rejecting cookie for domain {domain} set by {request_host}");
                    return;
                }
                (domain, false)
            }
            _ => (request_host, true),
        };

        let path = match cookie.path() {
            Some(path) if path.starts_with('/') => path.to_owned(),
            _ => default_path(url.path()),
        };

        let key = CookieKey {
            name: cookie.name().to_ascii_lowercase(),
            path: path.clone(),
        };
        let expires_at = cookie.expires_at(now);

        let mut domains = self.domains.write().unwrap_or_else(PoisonError::into_inner);
        if expires_at.map_or(false, |at| at <= now) {
            if let Some(cookies) = domains.get_mut(&domain) {
                if cookies.remove(&key).is_some() {
                    log::trace!("expired cookie {} removed for {domain}", key.name);
                }
                if cookies.is_empty() {
                    domains.remove(&domain);
                }
            }
            return;
        }

        let order = self.creation.fetch_add(1, Ordering::Relaxed);
        domains.entry(domain).or_default().insert(
            key,
            StoredCookie {
                cookie,
                host_only,
                expires_at,
                path,
                order,
            },
        );
    }

    /// Cookies that should be sent to `url`.
    pub fn get(&self, url: &Url) -> Vec<Cookie> {
        self.get_at(url, SystemTime::now())
    }

    fn get_at(&self, url: &Url, now: SystemTime) -> Vec<Cookie> {
        let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
            return Vec::new();
        };
        let request_path = match url.path() {
            "" => "/",
            path => path,
        };
        let secure = crate::partition::is_secure(url);

        let domains = self.domains.read().unwrap_or_else(PoisonError::into_inner);
        let mut matched: Vec<&StoredCookie> = Vec::new();

        for domain in candidate_domains(&host) {
            let Some(cookies) = domains.get(domain) else {
                continue;
            };
            let exact = domain == host;
            matched.extend(cookies.values().filter(|stored| {
                (exact || !stored.host_only)
                    && path_match(&stored.path, request_path)
                    && (secure || !stored.cookie.secure())
                    && !stored.is_expired(now)
            }));
        }

        // longer paths first, then oldest first
        matched.sort_by(|a, b| b.path.len().cmp(&a.path.len()).then(a.order.cmp(&b.order)));
        matched.into_iter().map(|s| s.cookie.clone()).collect()
    }

    /// Every unexpired cookie in the jar.
    pub fn get_all(&self) -> Vec<Cookie> {
        let now = SystemTime::now();
        let domains = self.domains.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<&StoredCookie> = domains
            .values()
            .flat_map(|cookies| cookies.values())
            .filter(|stored| !stored.is_expired(now))
            .collect();
        all.sort_by_key(|s| s.order);
        all.into_iter().map(|s| s.cookie.clone()).collect()
    }

    /// Remove every cookie matching `predicate`. Returns whether any was
    /// removed.
    pub fn remove<F>(&self, predicate: F) -> bool
    where
        F: Fn(&Cookie) -> bool,
    {
        let mut removed = false;
        let mut domains = self.domains.write().unwrap_or_else(PoisonError::into_inner);
        domains.retain(|_, cookies| {
            cookies.retain(|_, stored| {
                let hit = predicate(&stored.cookie);
                removed |= hit;
                !hit
            });
            !cookies.is_empty()
        });
        removed
    }

    /// Number of cookies held, counting expired ones until they are
    /// evicted.
    pub fn len(&self) -> usize {
        self.domains
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(HashMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every cookie.
    pub fn clear(&self) {
        self.domains
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Drop expired cookies from storage.
    pub fn evict_expired(&self) {
        self.evict_expired_at(SystemTime::now());
    }

    fn evict_expired_at(&self, now: SystemTime) {
        let mut domains = self.domains.write().unwrap_or_else(PoisonError::into_inner);
        domains.retain(|_, cookies| {
            cookies.retain(|_, stored| !stored.is_expired(now));
            !cookies.is_empty()
        });
    }

    #[cfg(test)]
    fn domain_count(&self) -> usize {
        self.domains.read().unwrap().len()
    }
}

impl StoredCookie {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

impl CookieStore for Jar {
    fn set_cookies(&self, cookie_headers: &mut dyn Iterator<Item = &HeaderValue>, url: &Url) {
        for header in cookie_headers {
            match Cookie::from_header(header) {
                Ok(cookie) => self.add(url, cookie),
                Err(err) => log::warn!("ignoring malformed Set-Cookie from {url}: {err}"),
            }
        }
    }

    fn cookies(&self, url: &Url) -> Option<HeaderValue> {
        let s = self
            .get(url)
            .iter()
            .map(Cookie::to_string)
            .collect::<Vec<_>>()
            .join("; ");

        if s.is_empty() {
            return None;
        }

        HeaderValue::from_maybe_shared(bytes::Bytes::from(s)).ok()
    }

    fn evict_expired(&self) {
        Jar::evict_expired(self);
    }
}

impl fmt::Debug for Jar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Jar").finish_non_exhaustive()
    }
}

/// The host itself, then each parent domain. IP addresses have no parents.
fn candidate_domains(host: &str) -> impl Iterator<Item = &str> {
    let is_ip = host.parse::<IpAddr>().is_ok() || host.starts_with('[');
    let mut next = Some(host);
    std::iter::from_fn(move || {
        let current = next?;
        next = if is_ip {
            None
        } else {
            current.find('.').map(|idx| &current[idx + 1..])
        };
        Some(current)
    })
    .filter(|d| !d.is_empty())
}

/// RFC 6265 section 5.1.3
fn domain_match(host: &str, domain: &str) -> bool {
    if host == domain {
        return true;
    }
    host.len() > domain.len()
        && host.ends_with(domain)
        && host.as_bytes()[host.len() - domain.len() - 1] == b'.'
        && host.parse::<IpAddr>().is_err()
}

/// RFC 6265 section 5.1.4
fn path_match(cookie_path: &str, request_path: &str) -> bool {
    if cookie_path == request_path {
        return true;
    }
    request_path.starts_with(cookie_path)
        && (cookie_path.ends_with('/')
            || request_path.as_bytes().get(cookie_path.len()) == Some(&b'/'))
}

fn default_path(request_path: &str) -> String {
    match request_path.rfind('/') {
        Some(idx) if idx > 0 => request_path[..idx].to_owned(),
        _ => "/".to_owned(),
    }
}

/// Error representing a parse failure of a 'Set-Cookie' header.
pub struct CookieParseError(cookie_crate::ParseError);

impl fmt::Debug for CookieParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for CookieParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::error::Error for CookieParseError {}

/// Starts the periodic sweep of a client's cookie store, once, from inside
/// a runtime.
pub(crate) struct Eviction {
    period: Option<Duration>,
    started: AtomicBool,
}

impl Eviction {
    pub(crate) fn new(period: Option<Duration>) -> Eviction {
        Eviction {
            period,
            started: AtomicBool::new(false),
        }
    }

    pub(crate) fn ensure_started(&self, store: &Arc<dyn CookieStore>) {
        let Some(period) = self.period else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }

        log::trace!("evicting expired cookies every {period:?}");
        handle.spawn(evict_every(Arc::downgrade(store), period));
    }
}

async fn evict_every(weak: Weak<dyn CookieStore>, period: Duration) {
    let start = tokio::time::Instant::now() + period;
    let mut interval = tokio::time::interval_at(start, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(store) = weak.upgrade() else {
            break;
        };
        store.evict_expired();
    }
    log::trace!("cookie eviction stopped");
}
