//! Drives one logical request to completion.
//!
//! Each pass through the loop sends one [`Hop`] and inspects the response.
//! A redirect, an authentication challenge or a transport failure that may
//! be replayed produces the next hop, derived from the current one; anything
//! else ends the request. Hops are never modified once built.

use std::future::Future;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use http::response::Parts;
use tokio_util::sync::CancellationToken;

use crate::auth::{origin_space, proxy_space, select_challenge};
use crate::client::{ClientRef, Conn};
use crate::error::{self, TimeoutPhase};
use crate::handler::{FilterContext, Listeners, Outcome};
use crate::header::{
    HeaderMap, HeaderValue, AUTHORIZATION, HOST, LOCATION, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION,
    SET_COOKIE, WWW_AUTHENTICATE,
};
use crate::keep_alive::{RequestInfo, ResponseInfo};
use crate::partition::{is_secure, PartitionKey};
use crate::pool::Pooled;
use crate::redirect::{self, ActionKind, TooManyRedirects};
use crate::retry::ReqRep;
use crate::transport::{BodyStream, Destination};
use crate::{AuthScheme, Method, ProxyServer, Request, Response, StatusCode, Url};

pub(crate) async fn execute(
    client: std::sync::Arc<ClientRef>,
    request: Request,
    token: CancellationToken,
) -> crate::Result<Response> {
    let listeners = request.listeners().clone();
    let url = request.url().clone();
    let total = client.request_timeout.timeout(request.extensions());

    let result = tokio::select! {
        biased;
        _ = token.cancelled() => Err(error::canceled()),
        res = bounded(total, TimeoutPhase::Request, run(&client, request, &token)) => res.and_then(|r| r),
    };

    match result {
        Ok(response) => {
            listeners.each(|l| l.on_complete(&response));
            Ok(response)
        }
        Err(err) => {
            let err = if err.url().is_none() { err.with_url(url) } else { err };
            log::debug!("request failed: {err}");
            listeners.each(|l| l.on_error(&err));
            Err(err)
        }
    }
}

/// The state of a logical request as one hop is sent.
struct Hop {
    request: Request,
    /// Urls already requested, oldest first.
    previous: Vec<Url>,
    redirects: usize,
    retries: u32,
    /// Answer to the last `WWW-Authenticate` challenge.
    authorization: Option<HeaderValue>,
    auth_attempted: bool,
    /// Answer to the last `Proxy-Authenticate` challenge.
    proxy_authorization: Option<HeaderValue>,
    proxy_auth_attempted: bool,
}

/// What changes between a hop and the next one.
enum Delta {
    Retry,
    Authorization(HeaderValue),
    ProxyAuthorization(HeaderValue),
    Redirect(Request),
}

enum Step {
    Done(Response),
    Next(Hop),
}

impl Hop {
    fn first(request: Request) -> Hop {
        Hop {
            request,
            previous: Vec::new(),
            redirects: 0,
            retries: 0,
            authorization: None,
            auth_attempted: false,
            proxy_authorization: None,
            proxy_auth_attempted: false,
        }
    }

    fn next(self, delta: Delta) -> Hop {
        match delta {
            Delta::Retry => Hop {
                retries: self.retries + 1,
                ..self
            },
            Delta::Authorization(value) => Hop {
                authorization: Some(value),
                auth_attempted: true,
                ..self
            },
            Delta::ProxyAuthorization(value) => Hop {
                proxy_authorization: Some(value),
                proxy_auth_attempted: true,
                ..self
            },
            Delta::Redirect(request) => {
                let mut previous = self.previous;
                previous.push(self.request.url().clone());
                Hop {
                    request,
                    previous,
                    redirects: self.redirects + 1,
                    retries: self.retries,
                    authorization: None,
                    auth_attempted: false,
                    proxy_authorization: None,
                    proxy_auth_attempted: false,
                }
            }
        }
    }

    fn proxy<'a>(&'a self, client: &'a ClientRef) -> Option<&'a ProxyServer> {
        self.request
            .proxy()
            .or(client.proxy.as_ref())
            .filter(|proxy| proxy.applies_to(self.request.url()))
    }
}

async fn run(
    client: &ClientRef,
    request: Request,
    token: &CancellationToken,
) -> crate::Result<Response> {
    let mut hop = Hop::first(request);
    loop {
        if token.is_cancelled() {
            return Err(error::canceled());
        }
        if client.pool.is_closed() {
            return Err(error::closed());
        }

        let url = hop.request.url().clone();
        log::trace!("sending {} {}", hop.request.method(), url);
        match step(client, hop).await {
            Ok(Step::Done(response)) => return Ok(response),
            Ok(Step::Next(next)) => hop = next,
            Err(err) if err.url().is_none() => return Err(err.with_url(url)),
            Err(err) => return Err(err),
        }
    }
}

/// What the request put on the wire, beyond its own headers.
struct Sent {
    headers: HeaderMap,
    preemptive_auth: bool,
    preemptive_proxy_auth: bool,
}

async fn step(client: &ClientRef, hop: Hop) -> crate::Result<Step> {
    let proxy = hop.proxy(client);
    let key = PartitionKey::new(hop.request.url(), hop.request.virtual_host(), proxy);

    let mut conn = match connect(client, &key, &hop.request, proxy).await {
        Ok(conn) => conn,
        Err(err) => return retry(client, hop, err, false),
    };

    let (wire, sent) = wire_request(client, &hop, proxy)?;
    let read_timeout = client.read_timeout.timeout(hop.request.extensions());

    let response = match bounded(read_timeout, TimeoutPhase::Read, conn.inner.send(wire)).await? {
        Ok(response) => response,
        Err(err) => {
            let written = err.is_written();
            log::debug!(
                "exchange on {:?} failed (reused: {}, written: {written}): {err}",
                conn.id(),
                conn.is_reused()
            );
            drop(conn);
            return retry(client, hop, error::remotely_closed(err.into_inner()), written);
        }
    };

    let (parts, mut body) = response.into_parts();
    let url = hop.request.url();

    if let Some(ref store) = client.cookie_store {
        let mut cookies = parts.headers.get_all(SET_COOKIE).iter().peekable();
        if cookies.peek().is_some() {
            store.set_cookies(&mut cookies, url);
            client.cookie_eviction.ensure_started(store);
        }
    }

    if let Some(delta) = intercept(client, &hop, &parts, &sent)? {
        let drained = drain(&mut body, read_timeout).await;
        recycle(client, conn, drained, &hop.request, &sent, &parts);
        if let Delta::Redirect(ref next) = delta {
            hop.request
                .listeners()
                .each(|l| l.on_redirect(parts.status, next.url()));
        }
        return Ok(Step::Next(hop.next(delta)));
    }

    let listeners = hop.request.listeners();
    let mut aborted = steer(listeners, |l| l.on_status(parts.status))?
        || steer(listeners, |l| l.on_headers(&parts.headers))?;

    let mut buf = BytesMut::new();
    while !aborted {
        let Some(chunk) = next_chunk(&mut body, read_timeout).await? else {
            break;
        };
        let outcome = listeners.steer(|l| l.on_body_chunk(&chunk));
        buf.extend_from_slice(&chunk);
        aborted = settle(outcome)?;
    }

    if aborted {
        log::debug!("exchange aborted by a listener, not reusing {:?}", conn.id());
        drop(conn);
    } else {
        recycle(client, conn, true, &hop.request, &sent, &parts);
        client.retry.deposit();
    }

    let Parts {
        status,
        version,
        headers,
        ..
    } = parts;
    let url = hop.request.url().clone();
    Ok(Step::Done(Response::new(
        status,
        version,
        headers,
        url,
        buf.freeze(),
        aborted,
    )))
}

/// Decide whether the client answers this response itself.
fn intercept(
    client: &ClientRef,
    hop: &Hop,
    parts: &Parts,
    sent: &Sent,
) -> crate::Result<Option<Delta>> {
    let request = &hop.request;
    let url = request.url();
    let status = parts.status;

    if status == StatusCode::UNAUTHORIZED {
        let Some(realm) = request.realm().or(client.realm.as_ref()) else {
            return Ok(None);
        };
        let Some(challenge) = select_challenge(parts.headers.get_all(WWW_AUTHENTICATE), realm.scheme())
        else {
            log::debug!("401 without a {} challenge", realm.scheme().as_str());
            return Ok(None);
        };
        if hop.auth_attempted || sent.preemptive_auth {
            return Err(error::unauthorized(status));
        }
        let Some(value) = client.auth.authorize(
            realm,
            &origin_space(url),
            request.method(),
            url,
            request_body(request),
            Some(challenge.as_str()),
        )?
        else {
            return Ok(None);
        };
        log::debug!("answering {} challenge from {}", realm.scheme().as_str(), url);
        return Ok(filtered(client, parts, url, None)?.then_some(Delta::Authorization(value)));
    }

    if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
        let Some(proxy) = hop.proxy(client) else {
            return Ok(None);
        };
        let Some(realm) = proxy.proxy_realm() else {
            return Ok(None);
        };
        let Some(challenge) =
            select_challenge(parts.headers.get_all(PROXY_AUTHENTICATE), realm.scheme())
        else {
            return Ok(None);
        };
        if hop.proxy_auth_attempted || sent.preemptive_proxy_auth {
            return Err(error::proxy_auth_required(status));
        }
        let space = proxy_space(proxy.host(), proxy.port_for(is_secure(url)));
        let Some(value) = client.auth.authorize(
            realm,
            &space,
            request.method(),
            url,
            request_body(request),
            Some(challenge.as_str()),
        )?
        else {
            return Ok(None);
        };
        log::debug!("answering proxy challenge from {}", proxy.host());
        return Ok(filtered(client, parts, url, None)?.then_some(Delta::ProxyAuthorization(value)));
    }

    let follow = client
        .follow_redirects
        .fetch(request.extensions())
        .copied()
        .unwrap_or(true);
    if !follow || !redirect::is_redirect(status) {
        return Ok(None);
    }
    let Some(next) = location(&parts.headers, url) else {
        log::debug!("{status} from {url} without a usable Location");
        return Ok(None);
    };

    let mut previous = hop.previous.clone();
    previous.push(url.clone());
    match client.redirect_policy.check(status, &next, &previous) {
        ActionKind::Follow => {
            let rewrite = redirect::rewrite(status, request.method(), client.strict_302);
            let headers = redirect::propagated_headers(
                request.headers(),
                rewrite.keep_body,
                client.strip_authorization_on_redirect,
            );
            let body = if rewrite.keep_body {
                request.body().cloned()
            } else {
                None
            };
            let keep_virtual_host = redirect::same_base(url, &next);
            let mut next_request =
                request.redirected(next, rewrite.method, headers, body, keep_virtual_host);

            if !filtered(client, parts, url, Some(&mut next_request))? {
                return Ok(None);
            }
            // a filter may have pointed the request somewhere else
            if keep_virtual_host && !redirect::same_base(url, next_request.url()) {
                next_request.drop_virtual_host();
            }
            log::debug!("redirecting {status} {url} -> {}", next_request.url());
            Ok(Some(Delta::Redirect(next_request)))
        }
        ActionKind::Stop => {
            log::debug!("redirect policy stopped at {url}");
            Ok(None)
        }
        ActionKind::Error(err) => {
            if err.is::<TooManyRedirects>() {
                Err(error::too_many_redirects(hop.redirects, status))
            } else {
                Err(error::redirect(err, hop.redirects, status))
            }
        }
    }
}

/// Run the client's response filters. `false` means one aborted.
fn filtered(
    client: &ClientRef,
    parts: &Parts,
    url: &Url,
    next: Option<&mut Request>,
) -> crate::Result<bool> {
    let mut ctx = FilterContext {
        status: parts.status,
        headers: &parts.headers,
        url,
        next,
    };
    for filter in &client.filters {
        match filter.filter(&mut ctx) {
            Outcome::Continue => {}
            Outcome::Abort => return Ok(false),
            Outcome::Err(err) => return Err(error::request(err).with_status(parts.status)),
        }
    }
    Ok(true)
}

/// Run a steering callback over the listeners. `true` means abort.
fn steer<F>(listeners: &Listeners, f: F) -> crate::Result<bool>
where
    F: FnMut(&dyn crate::handler::Listener) -> Outcome,
{
    settle(listeners.steer(f))
}

fn settle(outcome: Outcome) -> crate::Result<bool> {
    match outcome {
        Outcome::Continue => Ok(false),
        Outcome::Abort => Ok(true),
        Outcome::Err(err) => Err(error::request(err)),
    }
}

fn retry(client: &ClientRef, hop: Hop, err: crate::Error, written: bool) -> crate::Result<Step> {
    if !(err.is_connect() || err.is_remotely_closed()) {
        return Err(err);
    }
    let request = &hop.request;
    let req_rep = ReqRep::new(request.method(), request.url(), &err, written);
    if !client.retry.retry(req_rep, hop.retries) {
        return Err(err);
    }

    let retries = hop.retries + 1;
    log::debug!("retrying {} {} ({retries}): {err}", request.method(), request.url());
    request.listeners().each(|l| l.on_retry(request.url(), retries));
    Ok(Step::Next(hop.next(Delta::Retry)))
}

/// Reuse an idle connection or open a new one.
async fn connect(
    client: &ClientRef,
    key: &PartitionKey,
    request: &Request,
    proxy: Option<&ProxyServer>,
) -> crate::Result<Pooled<Conn>> {
    if let Some(conn) = client.pool.acquire(key) {
        return Ok(conn);
    }

    let permit = client
        .limits
        .try_acquire(key.host())
        .map_err(error::pool_exhausted)?;
    let dst = Destination::new(request.url(), proxy);
    let timeout = client.connect_timeout.timeout(request.extensions());

    log::trace!("opening connection to {dst:?}");
    let inner = bounded(timeout, TimeoutPhase::Connect, client.transport.connect(&dst))
        .await?
        .map_err(error::connect)?;
    Ok(client.pool.track(Conn::new(inner, permit), key.clone()))
}

fn wire_request(
    client: &ClientRef,
    hop: &Hop,
    proxy: Option<&ProxyServer>,
) -> crate::Result<(http::Request<Bytes>, Sent)> {
    let request = &hop.request;
    let url = request.url();
    let mut headers = request.headers().clone();

    for name in client.headers.keys() {
        if !headers.contains_key(name) {
            for value in client.headers.get_all(name) {
                headers.append(name.clone(), value.clone());
            }
        }
    }

    if let Some(ref store) = client.cookie_store {
        crate::util::add_cookie_header(&mut headers, &**store, url);
    }

    let host = match request.virtual_host() {
        Some(vhost) => HeaderValue::from_str(vhost).map_err(error::builder)?,
        None => host_header(url)?,
    };
    headers.insert(HOST, host);

    let mut preemptive_auth = false;
    if let Some(ref value) = hop.authorization {
        headers.insert(AUTHORIZATION, value.clone());
    } else if let Some(realm) = request.realm().or(client.realm.as_ref()) {
        if realm.is_preemptive() && !headers.contains_key(AUTHORIZATION) {
            let value = client.auth.authorize(
                realm,
                &origin_space(url),
                request.method(),
                url,
                request_body(request),
                None,
            )?;
            if let Some(value) = value {
                // a Digest challenge may carry a fresh nonce, so only Basic
                // has used up its answer here
                preemptive_auth = realm.scheme() == AuthScheme::Basic;
                headers.insert(AUTHORIZATION, value);
            }
        }
    }

    let mut preemptive_proxy_auth = false;
    if let Some(proxy) = proxy {
        if let Some(ref value) = hop.proxy_authorization {
            headers.insert(PROXY_AUTHORIZATION, value.clone());
        } else if let Some(realm) = proxy.proxy_realm().filter(|r| r.is_preemptive()) {
            let space = proxy_space(proxy.host(), proxy.port_for(is_secure(url)));
            let value = client.auth.authorize(
                realm,
                &space,
                request.method(),
                url,
                request_body(request),
                None,
            )?;
            if let Some(value) = value {
                preemptive_proxy_auth = realm.scheme() == AuthScheme::Basic;
                headers.insert(PROXY_AUTHORIZATION, value);
            }
        }
    }

    let uri = if proxy.is_some() && !is_secure(url) {
        let mut absolute = url.clone();
        absolute.set_fragment(None);
        crate::into_url::try_uri(&absolute)?
    } else {
        let mut target = url.path().to_owned();
        if let Some(query) = url.query() {
            target.push('?');
            target.push_str(query);
        }
        target.parse::<http::Uri>().map_err(error::builder)?
    };

    let mut wire = http::Request::new(request.body().cloned().unwrap_or_default());
    *wire.method_mut() = request.method().clone();
    *wire.uri_mut() = uri;
    *wire.headers_mut() = headers.clone();

    Ok((
        wire,
        Sent {
            headers,
            preemptive_auth,
            preemptive_proxy_auth,
        },
    ))
}

fn host_header(url: &Url) -> crate::Result<HeaderValue> {
    let host = url.host_str().unwrap_or("");
    let value = match url.port() {
        Some(port) => HeaderValue::from_str(&format!("{host}:{port}")),
        None => HeaderValue::from_str(host),
    };
    value.map_err(error::builder)
}

fn request_body(request: &Request) -> &[u8] {
    request.body().map(|b| &b[..]).unwrap_or(&[])
}

fn location(headers: &HeaderMap, base: &Url) -> Option<Url> {
    let value = headers.get(LOCATION)?.to_str().ok()?;
    let next = base.join(value).ok()?;
    matches!(next.scheme(), "http" | "https").then_some(next)
}

/// Hand a finished connection back to the pool, or destroy it.
///
/// The keep-alive policy is consulted once, and only for an exchange that
/// ran to the end of its body.
fn recycle(
    client: &ClientRef,
    conn: Pooled<Conn>,
    complete: bool,
    request: &Request,
    sent: &Sent,
    parts: &Parts,
) {
    let reusable = complete
        && client.keep_alive.keep_alive(
            RequestInfo {
                method: request.method(),
                headers: &sent.headers,
            },
            ResponseInfo {
                version: parts.version,
                status: parts.status,
                headers: &parts.headers,
            },
        );
    if !reusable {
        log::trace!("closing connection {:?}", conn.id());
        return;
    }

    let key = conn.key().clone();
    if client.pool.release(conn) {
        request
            .listeners()
            .each(|l| l.on_connection_pooled(&key));
    }
}

/// Read and discard the rest of a body. `false` if it did not end cleanly.
async fn drain(body: &mut BodyStream, read_timeout: Option<Duration>) -> bool {
    loop {
        match next_chunk(body, read_timeout).await {
            Ok(Some(_)) => {}
            Ok(None) => return true,
            Err(err) => {
                log::debug!("discarding connection, body not drained: {err}");
                return false;
            }
        }
    }
}

async fn next_chunk(
    body: &mut BodyStream,
    read_timeout: Option<Duration>,
) -> crate::Result<Option<Bytes>> {
    bounded(read_timeout, TimeoutPhase::Read, body.next())
        .await?
        .transpose()
        .map_err(error::body)
}

/// Await `fut`, failing with a timeout of `phase` once `limit` has elapsed.
async fn bounded<F: Future>(
    limit: Option<Duration>,
    phase: TimeoutPhase,
    fut: F,
) -> crate::Result<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| error::timeout(phase, limit)),
        None => Ok(fut.await),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn location_resolves_relative_targets() {
        let base = Url::parse("http://example.com/a/b?x=1").unwrap();
        let mut headers = HeaderMap::new();

        headers.insert(LOCATION, HeaderValue::from_static("c"));
        assert_eq!(location(&headers, &base).unwrap().as_str(), "http://example.com/a/c");

        headers.insert(LOCATION, HeaderValue::from_static("//other.com/d"));
        assert_eq!(location(&headers, &base).unwrap().as_str(), "http://other.com/d");

        headers.insert(LOCATION, HeaderValue::from_static("ftp://example.com/"));
        assert!(location(&headers, &base).is_none());

        headers.remove(LOCATION);
        assert!(location(&headers, &base).is_none());
    }

    #[test]
    fn host_header_omits_default_port() {
        let url = Url::parse("http://example.com:80/").unwrap();
        assert_eq!(host_header(&url).unwrap(), "example.com");

        let url = Url::parse("http://example.com:8080/").unwrap();
        assert_eq!(host_header(&url).unwrap(), "example.com:8080");

        let url = Url::parse("http://[::1]:3000/").unwrap();
        assert_eq!(host_header(&url).unwrap(), "[::1]:3000");
    }

    #[test]
    fn hops_derive_without_touching_the_previous_one() {
        let url = Url::parse("http://example.com/start").unwrap();
        let first = Hop::first(Request::new(Method::GET, url));

        let authed = first.next(Delta::Authorization(HeaderValue::from_static("Basic eA==")));
        assert!(authed.auth_attempted);
        assert_eq!(authed.redirects, 0);

        let next = Request::new(Method::GET, Url::parse("http://example.com/next").unwrap());
        let moved = authed.next(Delta::Redirect(next));
        assert_eq!(moved.redirects, 1);
        assert!(!moved.auth_attempted);
        assert!(moved.authorization.is_none());
        assert_eq!(moved.previous.len(), 1);
        assert_eq!(moved.previous[0].path(), "/start");

        let retried = moved.next(Delta::Retry);
        assert_eq!(retried.retries, 1);
        assert_eq!(retried.redirects, 1);
    }

    #[tokio::test]
    async fn bounded_reports_phase() {
        let err = bounded(
            Some(Duration::from_millis(1)),
            TimeoutPhase::Connect,
            std::future::pending::<()>(),
        )
        .await
        .unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(err.timeout_phase(), Some(TimeoutPhase::Connect));

        assert_eq!(bounded(None, TimeoutPhase::Read, async { 7 }).await.unwrap(), 7);
    }
}
