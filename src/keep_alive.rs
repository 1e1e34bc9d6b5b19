//! Deciding whether a connection may be reused after an exchange.

use http::header::{HeaderMap, HeaderName, CONNECTION};
use http::{Method, StatusCode, Version};

static PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// What the policy sees of the request side of a finished exchange.
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo<'a> {
    pub method: &'a Method,
    pub headers: &'a HeaderMap,
}

/// What the policy sees of the response side of a finished exchange.
#[derive(Debug, Clone, Copy)]
pub struct ResponseInfo<'a> {
    pub version: Version,
    pub status: StatusCode,
    pub headers: &'a HeaderMap,
}

/// Decides, once per completed exchange, whether its connection may go back
/// to the pool.
pub trait KeepAlive: Send + Sync + 'static {
    /// Returns `true` if the connection can be reused.
    fn keep_alive(&self, request: RequestInfo<'_>, response: ResponseInfo<'_>) -> bool;
}

/// The HTTP/1.x rules.
///
/// - an explicit `close` from either side, including `Proxy-Connection:
///   close` on the response, forbids reuse;
/// - HTTP/1.0 is reused only when both sides asked for `keep-alive`;
/// - HTTP/1.1 and later are reused unless the request asked to close.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultKeepAlive;

impl KeepAlive for DefaultKeepAlive {
    fn keep_alive(&self, request: RequestInfo<'_>, response: ResponseInfo<'_>) -> bool {
        if has_token(request.headers, &CONNECTION, "close")
            || has_token(response.headers, &CONNECTION, "close")
            || has_token(response.headers, &PROXY_CONNECTION, "close")
        {
            return false;
        }

        match response.version {
            Version::HTTP_09 => false,
            Version::HTTP_10 => {
                has_token(request.headers, &CONNECTION, "keep-alive")
                    && has_token(response.headers, &CONNECTION, "keep-alive")
            }
            _ => true,
        }
    }
}

/// Never reuse connections.
#[derive(Debug, Default, Clone, Copy)]
pub struct NeverKeepAlive;

impl KeepAlive for NeverKeepAlive {
    fn keep_alive(&self, _: RequestInfo<'_>, _: ResponseInfo<'_>) -> bool {
        false
    }
}

fn has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(*name, HeaderValue::from_static(value));
        }
        map
    }

    fn decide(version: Version, req: &HeaderMap, res: &HeaderMap) -> bool {
        DefaultKeepAlive.keep_alive(
            RequestInfo {
                method: &Method::GET,
                headers: req,
            },
            ResponseInfo {
                version,
                status: StatusCode::OK,
                headers: res,
            },
        )
    }

    #[test]
    fn http11_defaults_to_keep_alive() {
        let none = HeaderMap::new();
        assert!(decide(Version::HTTP_11, &none, &none));
        assert!(decide(Version::HTTP_2, &none, &none));
    }

    #[test]
    fn explicit_close_wins() {
        let none = HeaderMap::new();
        let close = headers(&[("connection", "Close")]);
        assert!(!decide(Version::HTTP_11, &close, &none));
        assert!(!decide(Version::HTTP_11, &none, &close));

        let multi = headers(&[("connection", "upgrade, close")]);
        assert!(!decide(Version::HTTP_11, &none, &multi));
    }

    #[test]
    fn proxy_connection_close() {
        let none = HeaderMap::new();
        let proxy_close = headers(&[("proxy-connection", "close")]);
        assert!(!decide(Version::HTTP_11, &none, &proxy_close));
    }

    #[test]
    fn http10_needs_both_sides() {
        let none = HeaderMap::new();
        let ka = headers(&[("connection", "keep-alive")]);
        assert!(!decide(Version::HTTP_10, &none, &none));
        assert!(!decide(Version::HTTP_10, &ka, &none));
        assert!(!decide(Version::HTTP_10, &none, &ka));
        assert!(decide(Version::HTTP_10, &ka, &ka));
    }
}
