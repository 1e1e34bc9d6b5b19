use std::convert::TryFrom;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Extensions, Request as HttpRequest};

use crate::config::{ConnectTimeout, FollowRedirects, ReadTimeout, RequestConfig, RequestTimeout};
use crate::handler::{Listener, Listeners};
use crate::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use crate::into_url::IntoUrlSealed;
use crate::{Client, Method, Pending, ProxyServer, Realm, Url};

/// A request which can be executed with `Client::execute()`.
#[derive(Clone)]
pub struct Request {
    method: Method,
    url: Url,
    headers: HeaderMap,
    body: Option<Bytes>,
    extensions: Extensions,
    realm: Option<Realm>,
    virtual_host: Option<String>,
    proxy: Option<ProxyServer>,
    listeners: Listeners,
}

/// A builder to construct the properties of a `Request`.
///
/// To construct a `RequestBuilder`, refer to the `Client` documentation.
#[must_use = "RequestBuilder does nothing until you 'send' it"]
pub struct RequestBuilder {
    client: Client,
    request: crate::Result<Request>,
}

impl Request {
    /// Constructs a new request.
    #[inline]
    pub fn new(method: Method, url: Url) -> Self {
        Request {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
            extensions: Extensions::new(),
            realm: None,
            virtual_host: None,
            proxy: None,
            listeners: Listeners::default(),
        }
    }

    /// Get the method.
    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Get a mutable reference to the method.
    #[inline]
    pub fn method_mut(&mut self) -> &mut Method {
        &mut self.method
    }

    /// Get the url.
    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Get a mutable reference to the url.
    #[inline]
    pub fn url_mut(&mut self) -> &mut Url {
        &mut self.url
    }

    /// Get the headers.
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a mutable reference to the headers.
    #[inline]
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Get the body.
    #[inline]
    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Get a mutable reference to the body.
    #[inline]
    pub fn body_mut(&mut self) -> &mut Option<Bytes> {
        &mut self.body
    }

    /// Get the request timeout, if set on this request.
    ///
    /// `Some(None)` means the request asked for no limit.
    #[inline]
    pub fn timeout(&self) -> Option<&Option<Duration>> {
        RequestConfig::<RequestTimeout>::get(&self.extensions)
    }

    /// Get a mutable reference to the request timeout.
    #[inline]
    pub fn timeout_mut(&mut self) -> &mut Option<Option<Duration>> {
        RequestConfig::<RequestTimeout>::get_mut(&mut self.extensions)
    }

    /// The credentials used for this request, overriding the client's.
    #[inline]
    pub fn realm(&self) -> Option<&Realm> {
        self.realm.as_ref()
    }

    /// The `Host` this request is sent with, when it differs from the url.
    #[inline]
    pub fn virtual_host(&self) -> Option<&str> {
        self.virtual_host.as_deref()
    }

    /// The proxy used for this request, overriding the client's.
    #[inline]
    pub fn proxy(&self) -> Option<&ProxyServer> {
        self.proxy.as_ref()
    }

    pub(crate) fn extensions(&self) -> &Extensions {
        &self.extensions
    }

    pub(crate) fn extensions_mut(&mut self) -> &mut Extensions {
        &mut self.extensions
    }

    pub(crate) fn listeners(&self) -> &Listeners {
        &self.listeners
    }

    pub(crate) fn drop_virtual_host(&mut self) {
        self.virtual_host = None;
    }

    /// Derive the request following a redirect to `url`.
    ///
    /// Everything but the target, method, headers and body carries over.
    /// The virtual host only survives when the base stays the same.
    pub(crate) fn redirected(
        &self,
        url: Url,
        method: Method,
        headers: HeaderMap,
        body: Option<Bytes>,
        keep_virtual_host: bool,
    ) -> Request {
        Request {
            method,
            url,
            headers,
            body,
            extensions: self.extensions.clone(),
            realm: self.realm.clone(),
            virtual_host: if keep_virtual_host {
                self.virtual_host.clone()
            } else {
                None
            },
            proxy: self.proxy.clone(),
            listeners: self.listeners.clone(),
        }
    }
}

impl RequestBuilder {
    pub(super) fn new(client: Client, request: crate::Result<Request>) -> RequestBuilder {
        RequestBuilder { client, request }
    }

    /// Assemble a builder starting from an existing `Client` and a `Request`.
    pub fn from_parts(client: Client, request: Request) -> RequestBuilder {
        RequestBuilder {
            client,
            request: crate::Result::Ok(request),
        }
    }

    /// Add a `Header` to this Request.
    pub fn header<K, V>(self, key: K, value: V) -> RequestBuilder
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        self.header_sensitive(key, value, false)
    }

    fn header_sensitive<K, V>(mut self, key: K, value: V, sensitive: bool) -> RequestBuilder
    where
        HeaderName: TryFrom<K>,
        <HeaderName as TryFrom<K>>::Error: Into<http::Error>,
        HeaderValue: TryFrom<V>,
        <HeaderValue as TryFrom<V>>::Error: Into<http::Error>,
    {
        let mut error = None;
        if let Ok(ref mut req) = self.request {
            match <HeaderName as TryFrom<K>>::try_from(key) {
                Ok(key) => match <HeaderValue as TryFrom<V>>::try_from(value) {
                    Ok(mut value) => {
                        value.set_sensitive(sensitive);
                        req.headers_mut().append(key, value);
                    }
                    Err(e) => error = Some(crate::error::builder(e.into())),
                },
                Err(e) => error = Some(crate::error::builder(e.into())),
            };
        }
        if let Some(err) = error {
            self.request = Err(err);
        }
        self
    }

    /// Add a set of Headers to the existing ones on this Request.
    ///
    /// The headers will be merged in to any already set.
    pub fn headers(mut self, headers: HeaderMap) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            crate::util::replace_headers(req.headers_mut(), headers);
        }
        self
    }

    /// Set the request body.
    pub fn body<T: Into<Bytes>>(mut self, body: T) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            *req.body_mut() = Some(body.into());
        }
        self
    }

    /// Set the request body with a `Content-Type`.
    pub fn body_with_type<T: Into<Bytes>>(self, content_type: &'static str, body: T) -> RequestBuilder {
        self.header(CONTENT_TYPE, HeaderValue::from_static(content_type))
            .body(body)
    }

    /// Enables a total request timeout.
    ///
    /// The timeout is applied from when the request starts connecting until
    /// the response body has finished, across redirects and retries. `None`
    /// disables the client's default for this request.
    pub fn timeout<T: Into<Option<Duration>>>(mut self, timeout: T) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            *req.timeout_mut() = Some(timeout.into());
        }
        self
    }

    /// Set a timeout for establishing new connections for this request.
    pub fn connect_timeout<T: Into<Option<Duration>>>(mut self, timeout: T) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            *RequestConfig::<ConnectTimeout>::get_mut(req.extensions_mut()) = Some(timeout.into());
        }
        self
    }

    /// Set the longest wait for the next bytes of the response.
    pub fn read_timeout<T: Into<Option<Duration>>>(mut self, timeout: T) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            *RequestConfig::<ReadTimeout>::get_mut(req.extensions_mut()) = Some(timeout.into());
        }
        self
    }

    /// Override whether redirects are followed for this request.
    pub fn follow_redirects(mut self, follow: bool) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            *RequestConfig::<FollowRedirects>::get_mut(req.extensions_mut()) = Some(follow);
        }
        self
    }

    /// Authenticate this request with `realm`.
    pub fn realm(mut self, realm: Realm) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.realm = Some(realm);
        }
        self
    }

    /// Send this request with a different `Host` than its url's.
    pub fn virtual_host(mut self, host: impl Into<String>) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.virtual_host = Some(host.into());
        }
        self
    }

    /// Route this request through `proxy`.
    pub fn proxy(mut self, proxy: ProxyServer) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.proxy = Some(proxy);
        }
        self
    }

    /// Observe this request with `listener`.
    pub fn listener<L: Listener + 'static>(self, listener: L) -> RequestBuilder {
        self.listener_arc(Arc::new(listener))
    }

    /// Observe this request with a shared listener.
    pub fn listener_arc(mut self, listener: Arc<dyn Listener>) -> RequestBuilder {
        if let Ok(ref mut req) = self.request {
            req.listeners.push(listener);
        }
        self
    }

    /// Build a `Request`, which can be inspected, modified and executed with
    /// `Client::execute()`.
    pub fn build(self) -> crate::Result<Request> {
        self.request
    }

    /// Build a `Request`, which can be inspected, modified and executed with
    /// `Client::execute()`.
    ///
    /// This is similar to [`RequestBuilder::build()`], but also returns the
    /// embedded `Client`.
    pub fn build_split(self) -> (Client, crate::Result<Request>) {
        (self.client, self.request)
    }

    /// Constructs the Request and sends it to the target URL, returning a
    /// future Response.
    ///
    /// # Errors
    ///
    /// This method fails if there was an error while sending request,
    /// redirect loop was detected or redirect limit was exhausted.
    ///
    /// # Example
    ///
    /// ```no_run
    /// # use ferry::Error;
    /// #
    /// # async fn run() -> Result<(), Error> {
    /// let response = ferry::Client::new()
    ///     .get("http://example.com")
    ///     .send()
    ///     .await?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn send(self) -> Pending {
        match self.request {
            Ok(req) => self.client.execute_request(req),
            Err(err) => Pending::new_err(err),
        }
    }

    /// Attempt to clone the RequestBuilder.
    ///
    /// `None` is returned if the builder holds an error.
    pub fn try_clone(&self) -> Option<RequestBuilder> {
        self.request
            .as_ref()
            .ok()
            .map(|req| RequestBuilder::from_parts(self.client.clone(), req.clone()))
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt_request_fields(&mut f.debug_struct("Request"), self).finish()
    }
}

impl fmt::Debug for RequestBuilder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut builder = f.debug_struct("RequestBuilder");
        match self.request {
            Ok(ref req) => fmt_request_fields(&mut builder, req).finish(),
            Err(ref err) => builder.field("error", err).finish(),
        }
    }
}

fn fmt_request_fields<'a, 'b>(
    f: &'a mut fmt::DebugStruct<'a, 'b>,
    req: &Request,
) -> &'a mut fmt::DebugStruct<'a, 'b> {
    f.field("method", &req.method)
        .field("url", &req.url.as_str())
        .field("headers", &req.headers)
}

impl<T> TryFrom<HttpRequest<T>> for Request
where
    T: Into<Bytes>,
{
    type Error = crate::Error;

    fn try_from(req: HttpRequest<T>) -> crate::Result<Self> {
        let (parts, body) = req.into_parts();
        let http::request::Parts {
            method,
            uri,
            headers,
            ..
        } = parts;
        let url = uri.to_string().as_str().into_url()?;
        let mut req = Request::new(method, url);
        req.headers = headers;
        req.body = Some(body.into());
        Ok(req)
    }
}
