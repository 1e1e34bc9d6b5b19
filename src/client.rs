use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::auth::Authenticator;
use crate::config::{ConnectTimeout, FollowRedirects, ReadTimeout, RequestConfig, RequestTimeout};
use crate::cookie::{CookieStore, Eviction, Jar};
use crate::handler::ResponseFilter;
use crate::header::{HeaderMap, HeaderValue, USER_AGENT};
use crate::into_url::IntoUrlSealed;
use crate::keep_alive::{DefaultKeepAlive, KeepAlive};
use crate::pool::{ClientStats, Limits, Permit, Pool, PoolConfig, Poolable};
use crate::request::{Request, RequestBuilder};
use crate::response::Response;
use crate::transport::{Connection, HttpTransport, Transport};
use crate::{exchange, redirect, retry, IntoUrl, Method, ProxyServer, Realm};

static DEFAULT_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// An asynchronous `Client` to make Requests with.
///
/// The Client has various configuration values to tweak, but the defaults
/// are set to what is usually the most commonly desired value. To configure a
/// `Client`, use `Client::builder()`.
///
/// The `Client` holds a connection pool and a cookie jar internally, so it is
/// advised that you create one and **reuse** it. Cloning a `Client` shares
/// them; separate clients share nothing unless handed the same jar.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientRef>,
}

/// A `ClientBuilder` can be used to create a `Client` with custom configuration.
#[must_use]
pub struct ClientBuilder {
    config: Config,
}

struct Config {
    error: Option<crate::Error>,
    headers: HeaderMap,
    connect_timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    timeout: Option<Duration>,
    pool: PoolConfig,
    max_connections: Option<usize>,
    max_connections_per_host: Option<usize>,
    keep_alive: Arc<dyn KeepAlive>,
    redirect_policy: redirect::Policy,
    follow_redirects: bool,
    strict_302: bool,
    strip_authorization_on_redirect: bool,
    retry: retry::Builder,
    max_request_retries: Option<u32>,
    cookie_store: Option<Arc<dyn CookieStore>>,
    cookie_eviction_period: Option<Duration>,
    realm: Option<Realm>,
    proxy: Option<ProxyServer>,
    transport: Arc<dyn Transport>,
    filters: Vec<Arc<dyn ResponseFilter>>,
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ClientBuilder {
    /// Constructs a new `ClientBuilder`.
    ///
    /// This is the same as `Client::builder()`.
    pub fn new() -> ClientBuilder {
        let mut headers: HeaderMap<HeaderValue> = HeaderMap::with_capacity(1);
        headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));

        ClientBuilder {
            config: Config {
                error: None,
                headers,
                connect_timeout: Some(Duration::from_secs(5)),
                read_timeout: Some(Duration::from_secs(60)),
                timeout: Some(Duration::from_secs(60)),
                pool: PoolConfig::default(),
                max_connections: None,
                max_connections_per_host: None,
                keep_alive: Arc::new(DefaultKeepAlive),
                redirect_policy: redirect::Policy::default(),
                follow_redirects: true,
                strict_302: false,
                strip_authorization_on_redirect: false,
                retry: retry::Builder::default(),
                max_request_retries: None,
                cookie_store: Some(Arc::new(Jar::default())),
                cookie_eviction_period: Some(Duration::from_secs(30)),
                realm: None,
                proxy: None,
                transport: Arc::new(HttpTransport::new()),
                filters: Vec::new(),
            },
        }
    }

    /// Returns a `Client` that uses this `ClientBuilder` configuration.
    ///
    /// # Errors
    ///
    /// This method fails if a configured value was invalid.
    pub fn build(self) -> crate::Result<Client> {
        let config = self.config;

        if let Some(err) = config.error {
            return Err(err);
        }

        let mut retry = config.retry;
        if let Some(max) = config.max_request_retries {
            retry = retry.max_retries_per_request(max);
        }

        Ok(Client {
            inner: Arc::new(ClientRef {
                headers: config.headers,
                connect_timeout: RequestConfig::new(Some(config.connect_timeout)),
                read_timeout: RequestConfig::new(Some(config.read_timeout)),
                request_timeout: RequestConfig::new(Some(config.timeout)),
                follow_redirects: RequestConfig::new(Some(config.follow_redirects)),
                pool: Pool::new(config.pool),
                limits: Limits::new(config.max_connections, config.max_connections_per_host),
                keep_alive: config.keep_alive,
                redirect_policy: config.redirect_policy,
                strict_302: config.strict_302,
                strip_authorization_on_redirect: config.strip_authorization_on_redirect,
                retry: retry.into_policy(),
                cookie_store: config.cookie_store,
                cookie_eviction: Eviction::new(config.cookie_eviction_period),
                auth: Authenticator::new(),
                realm: config.realm,
                proxy: config.proxy,
                transport: config.transport,
                filters: config.filters,
            }),
        })
    }

    // Higher-level options

    /// Sets the `User-Agent` header to be used by this client.
    pub fn user_agent<V>(mut self, value: V) -> ClientBuilder
    where
        V: TryInto<HeaderValue>,
        V::Error: Into<http::Error>,
    {
        match value.try_into() {
            Ok(value) => {
                self.config.headers.insert(USER_AGENT, value);
            }
            Err(e) => {
                self.config.error = Some(crate::error::builder(e.into()));
            }
        };
        self
    }

    /// Sets the default headers for every request.
    ///
    /// Headers set on a request take precedence.
    pub fn default_headers(mut self, headers: HeaderMap) -> ClientBuilder {
        for (key, value) in headers.iter() {
            self.config.headers.insert(key, value.clone());
        }
        self
    }

    /// Enable a persistent cookie store for the client.
    ///
    /// Cookies received in responses will be preserved and included in
    /// additional requests. Enabled by default.
    pub fn cookie_store(mut self, enable: bool) -> ClientBuilder {
        self.config.cookie_store = if enable {
            Some(Arc::new(Jar::default()))
        } else {
            None
        };
        self
    }

    /// Set the persistent cookie store for the client.
    ///
    /// Cookies received in responses will be passed to this store, and
    /// additional requests will query this store for cookies. Handing the
    /// same store to several clients shares it.
    pub fn cookie_provider<C: CookieStore + 'static>(mut self, cookie_store: Arc<C>) -> ClientBuilder {
        self.config.cookie_store = Some(cookie_store as _);
        self
    }

    /// How often expired cookies are dropped from the cookie store.
    ///
    /// Pass `None` to keep them until the store itself removes them.
    /// Default is 30 seconds.
    pub fn cookie_eviction_period<D>(mut self, period: D) -> ClientBuilder
    where
        D: Into<Option<Duration>>,
    {
        self.config.cookie_eviction_period = period.into();
        self
    }

    // Redirect options

    /// Set a `redirect::Policy` for this client.
    ///
    /// Default will follow redirects up to a maximum of 5.
    pub fn redirect(mut self, policy: redirect::Policy) -> ClientBuilder {
        self.config.redirect_policy = policy;
        self
    }

    /// Follow at most `max` redirects per request.
    pub fn max_redirects(self, max: usize) -> ClientBuilder {
        self.redirect(redirect::Policy::limited(max))
    }

    /// Whether to follow redirects at all. Requests can override this.
    ///
    /// Default is `true`.
    pub fn follow_redirects(mut self, enable: bool) -> ClientBuilder {
        self.config.follow_redirects = enable;
        self
    }

    /// Keep the method and body on `301` and `302` redirects, as for `307`.
    ///
    /// Default is `false`, which turns them into a `GET` without a body.
    pub fn strict_302(mut self, enable: bool) -> ClientBuilder {
        self.config.strict_302 = enable;
        self
    }

    /// Drop the `Authorization` header when following a redirect.
    ///
    /// Default is `false`, the header is forwarded.
    pub fn strip_authorization_on_redirect(mut self, enable: bool) -> ClientBuilder {
        self.config.strip_authorization_on_redirect = enable;
        self
    }

    // Retry options

    /// Set a request retry policy.
    ///
    /// Default is a write-safety aware policy retrying up to 5 times.
    pub fn retry(mut self, policy: retry::Builder) -> ClientBuilder {
        self.config.retry = policy;
        self
    }

    /// Retry a failed exchange at most `max` times per request.
    pub fn max_request_retries(mut self, max: u32) -> ClientBuilder {
        self.config.max_request_retries = Some(max);
        self
    }

    // Timeout options

    /// Enables a total request timeout.
    ///
    /// The timeout is applied from when the request starts connecting until
    /// the response body has finished, including redirects and retries.
    ///
    /// Default is 60 seconds. `None` means no timeout.
    pub fn timeout<T: Into<Option<Duration>>>(mut self, timeout: T) -> ClientBuilder {
        self.config.timeout = timeout.into();
        self
    }

    /// Set a timeout for only the connect phase of a `Client`.
    ///
    /// Default is 5 seconds.
    pub fn connect_timeout<T: Into<Option<Duration>>>(mut self, timeout: T) -> ClientBuilder {
        self.config.connect_timeout = timeout.into();
        self
    }

    /// Set the longest wait for the next bytes of a response.
    ///
    /// Default is 60 seconds.
    pub fn read_timeout<T: Into<Option<Duration>>>(mut self, timeout: T) -> ClientBuilder {
        self.config.read_timeout = timeout.into();
        self
    }

    // Pool options

    /// Set an optional timeout for idle sockets being kept-alive.
    ///
    /// Pass `None` to disable timeout.
    ///
    /// Default is 60 seconds.
    pub fn pool_idle_timeout<D>(mut self, val: D) -> ClientBuilder
    where
        D: Into<Option<Duration>>,
    {
        self.config.pool.idle_timeout = val.into();
        self
    }

    /// Sets the maximum idle connection per host allowed in the pool.
    pub fn pool_max_idle_per_host(mut self, max: usize) -> ClientBuilder {
        self.config.pool.max_idle_per_partition = max;
        self
    }

    /// Sets the maximum idle connections across all hosts.
    pub fn pool_max_idle(mut self, max: usize) -> ClientBuilder {
        self.config.pool.max_idle = Some(max);
        self
    }

    /// Destroy connections older than `ttl`, whether idle or not once
    /// they are released.
    pub fn connection_ttl<D>(mut self, ttl: D) -> ClientBuilder
    where
        D: Into<Option<Duration>>,
    {
        self.config.pool.ttl = ttl.into();
        self
    }

    /// How often the background task looks for expired idle connections.
    ///
    /// Default is 1 second.
    pub fn pool_cleaner_period(mut self, period: Duration) -> ClientBuilder {
        self.config.pool.cleaner_period = period;
        self
    }

    /// Cap the number of open connections. A request that would open one
    /// more fails with a pool-exhausted error.
    pub fn max_connections(mut self, max: usize) -> ClientBuilder {
        self.config.max_connections = Some(max);
        self
    }

    /// Cap the number of open connections to a single host.
    pub fn max_connections_per_host(mut self, max: usize) -> ClientBuilder {
        self.config.max_connections_per_host = Some(max);
        self
    }

    /// Whether connections are reused at all.
    ///
    /// Default is `true`.
    pub fn keep_alive(mut self, enable: bool) -> ClientBuilder {
        self.config.pool.keep_alive = enable;
        self
    }

    /// Replace the rules deciding whether a connection is reused after an
    /// exchange.
    pub fn keep_alive_strategy<K: KeepAlive>(mut self, strategy: K) -> ClientBuilder {
        self.config.keep_alive = Arc::new(strategy);
        self
    }

    // Auth and proxy options

    /// Credentials for every request that does not carry its own.
    pub fn realm(mut self, realm: Realm) -> ClientBuilder {
        self.config.realm = Some(realm);
        self
    }

    /// Route requests through `proxy`.
    pub fn proxy(mut self, proxy: ProxyServer) -> ClientBuilder {
        self.config.proxy = Some(proxy);
        self
    }

    // Plumbing

    /// Open connections with `transport` instead of plain HTTP/1.1 over TCP.
    pub fn transport<T: Transport + 'static>(mut self, transport: T) -> ClientBuilder {
        self.config.transport = Arc::new(transport);
        self
    }

    /// Inspect redirects and authentication challenges before they are acted
    /// on. Filters run in the order they were added.
    pub fn response_filter<F: ResponseFilter + 'static>(mut self, filter: F) -> ClientBuilder {
        self.config.filters.push(Arc::new(filter));
        self
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    /// Constructs a new `Client`.
    ///
    /// # Panics
    ///
    /// This method panics if the default configuration fails to build. Use
    /// `Client::builder()` if you wish to handle the failure as an `Error`
    /// instead of panicking.
    pub fn new() -> Client {
        ClientBuilder::new().build().expect("Client::new()")
    }

    /// Creates a `ClientBuilder` to configure a `Client`.
    ///
    /// This is the same as `ClientBuilder::new()`.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Convenience method to make a `GET` request to a URL.
    ///
    /// # Errors
    ///
    /// This method fails whenever the supplied `Url` cannot be parsed.
    pub fn get<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::GET, url)
    }

    /// Convenience method to make a `POST` request to a URL.
    pub fn post<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    /// Convenience method to make a `PUT` request to a URL.
    pub fn put<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::PUT, url)
    }

    /// Convenience method to make a `DELETE` request to a URL.
    pub fn delete<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::DELETE, url)
    }

    /// Convenience method to make a `HEAD` request to a URL.
    pub fn head<U: IntoUrl>(&self, url: U) -> RequestBuilder {
        self.request(Method::HEAD, url)
    }

    /// Start building a `Request` with the `Method` and `Url`.
    ///
    /// Returns a `RequestBuilder`, which will allow setting headers and
    /// the request body before sending.
    pub fn request<U: IntoUrl>(&self, method: Method, url: U) -> RequestBuilder {
        let req = url.into_url().map(move |url| Request::new(method, url));
        RequestBuilder::new(self.clone(), req)
    }

    /// Executes a `Request`.
    ///
    /// A `Request` can be built manually with `Request::new()` or obtained
    /// from a RequestBuilder with `RequestBuilder::build()`.
    ///
    /// # Errors
    ///
    /// This method fails if there was an error while sending request,
    /// redirect loop was detected or redirect limit was exhausted.
    pub fn execute(&self, request: Request) -> Pending {
        self.execute_request(request)
    }

    pub(super) fn execute_request(&self, req: Request) -> Pending {
        let token = CancellationToken::new();
        let fut = exchange::execute(self.inner.clone(), req, token.clone());
        Pending {
            inner: PendingInner::Request(Box::pin(fut)),
            token,
        }
    }

    /// A snapshot of open connections, per host.
    pub fn stats(&self) -> ClientStats {
        ClientStats::new(
            self.inner.limits.open_by_host(),
            self.inner.pool.idle_counts_by_host(),
        )
    }

    /// Destroy every idle connection to `host`. Returns how many were
    /// destroyed.
    pub fn flush_host(&self, host: &str) -> usize {
        self.inner
            .pool
            .flush_partitions(|key| key.host().eq_ignore_ascii_case(host))
    }

    /// The cookie store, if enabled.
    pub fn cookie_store(&self) -> Option<&Arc<dyn CookieStore>> {
        self.inner.cookie_store.as_ref()
    }

    /// The authentication state shared by this client's requests.
    pub fn authenticator(&self) -> &Authenticator {
        &self.inner.auth
    }

    /// Shut the client down.
    ///
    /// Idle connections are destroyed, connections in use are destroyed when
    /// their exchange ends, and new requests fail.
    pub fn close(&self) {
        self.inner.pool.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pool.is_closed()
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("Client");
        self.inner.fmt_fields(&mut builder);
        builder.finish()
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let config = &self.config;
        let mut builder = f.debug_struct("ClientBuilder");
        builder
            .field("connect_timeout", &config.connect_timeout)
            .field("read_timeout", &config.read_timeout)
            .field("timeout", &config.timeout)
            .field("pool", &config.pool)
            .field("redirect_policy", &config.redirect_policy)
            .field("retry", &config.retry);
        if let Some(ref proxy) = config.proxy {
            builder.field("proxy", proxy);
        }
        builder.finish()
    }
}

/// A connection as the pool stores it. The permit counts it against the
/// connection caps until it is dropped.
pub(crate) struct Conn {
    pub(crate) inner: Box<dyn Connection>,
    _permit: Permit,
}

impl Conn {
    pub(crate) fn new(inner: Box<dyn Connection>, permit: Permit) -> Conn {
        Conn {
            inner,
            _permit: permit,
        }
    }
}

impl Poolable for Conn {
    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}

pub(crate) struct ClientRef {
    pub(crate) headers: HeaderMap,
    pub(crate) connect_timeout: RequestConfig<ConnectTimeout>,
    pub(crate) read_timeout: RequestConfig<ReadTimeout>,
    pub(crate) request_timeout: RequestConfig<RequestTimeout>,
    pub(crate) follow_redirects: RequestConfig<FollowRedirects>,
    pub(crate) pool: Pool<Conn>,
    pub(crate) limits: Limits,
    pub(crate) keep_alive: Arc<dyn KeepAlive>,
    pub(crate) redirect_policy: redirect::Policy,
    pub(crate) strict_302: bool,
    pub(crate) strip_authorization_on_redirect: bool,
    pub(crate) retry: retry::Policy,
    pub(crate) cookie_store: Option<Arc<dyn CookieStore>>,
    pub(crate) cookie_eviction: Eviction,
    pub(crate) auth: Authenticator,
    pub(crate) realm: Option<Realm>,
    pub(crate) proxy: Option<ProxyServer>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) filters: Vec<Arc<dyn ResponseFilter>>,
}

impl ClientRef {
    fn fmt_fields(&self, f: &mut fmt::DebugStruct<'_, '_>) {
        f.field("pool", &self.pool);
        self.connect_timeout.fmt_as_field(f);
        self.read_timeout.fmt_as_field(f);
        self.request_timeout.fmt_as_field(f);
        f.field("redirect_policy", &self.redirect_policy);
        if let Some(ref proxy) = self.proxy {
            f.field("proxy", proxy);
        }
    }
}

/// A future of a `Response`, returned by `RequestBuilder::send()` and
/// `Client::execute()`.
///
/// Nothing happens until it is polled. Dropping it, or calling
/// [`CancelHandle::cancel`], stops the request and destroys the connection
/// it was using.
#[must_use = "futures do nothing unless polled"]
pub struct Pending {
    inner: PendingInner,
    token: CancellationToken,
}

enum PendingInner {
    Request(Pin<Box<dyn Future<Output = crate::Result<Response>> + Send>>),
    Error(Option<crate::Error>),
}

/// Cancels a request from another task.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl Pending {
    pub(super) fn new_err(err: crate::Error) -> Pending {
        Pending {
            inner: PendingInner::Error(Some(err)),
            token: CancellationToken::new(),
        }
    }

    /// A handle that cancels this request.
    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle {
            token: self.token.clone(),
        }
    }
}

impl CancelHandle {
    /// Cancel the request. It completes with a canceled error unless it
    /// already finished.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }
}

impl Future for Pending {
    type Output = crate::Result<Response>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.inner {
            PendingInner::Request(ref mut fut) => fut.as_mut().poll(cx),
            PendingInner::Error(ref mut err) => Poll::Ready(Err(err
                .take()
                .unwrap_or_else(|| crate::error::request("Pending polled after completion")))),
        }
    }
}

impl fmt::Debug for Pending {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.inner {
            PendingInner::Request(_) => f.debug_struct("Pending").finish_non_exhaustive(),
            PendingInner::Error(ref err) => f.debug_struct("Pending").field("error", err).finish(),
        }
    }
}
