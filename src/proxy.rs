use std::fmt;

use crate::realm::Realm;
use crate::Url;

/// A proxy server that a `Client` (or a single `Request`) routes through.
///
/// Plain `http` targets are sent to the proxy in absolute form. The proxy's
/// own credentials, if any, are answered on a `407 Proxy Authentication
/// Required` with its [`Realm`].
///
/// ```
/// # use ferry::{ProxyServer, Realm};
/// let proxy = ProxyServer::new("proxy.local", 3128)
///     .secured_port(3129)
///     .realm(Realm::basic("alice", "secret"))
///     .non_proxy_host("*.internal")
///     .non_proxy_host("localhost");
/// assert!(proxy.is_ignored_for_host("db.internal"));
/// ```
#[derive(Clone)]
pub struct ProxyServer {
    host: String,
    port: u16,
    secured_port: u16,
    realm: Option<Realm>,
    non_proxy_hosts: Vec<String>,
}

impl ProxyServer {
    /// Route through `host:port`, for both plain and secured targets.
    pub fn new(host: impl Into<String>, port: u16) -> ProxyServer {
        ProxyServer {
            host: host.into(),
            port,
            secured_port: port,
            realm: None,
            non_proxy_hosts: Vec::new(),
        }
    }

    /// Use a different port for secured (`https`) targets.
    pub fn secured_port(mut self, port: u16) -> ProxyServer {
        self.secured_port = port;
        self
    }

    /// Credentials to answer the proxy's challenges with.
    pub fn realm(mut self, realm: Realm) -> ProxyServer {
        self.realm = Some(realm);
        self
    }

    /// A host that bypasses the proxy. A leading `*` matches any prefix, so
    /// `*.internal` covers every subdomain of `internal`.
    pub fn non_proxy_host(mut self, host: impl Into<String>) -> ProxyServer {
        self.non_proxy_hosts.push(host.into());
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// The port to connect to for a plain or secured target.
    pub fn port_for(&self, secured: bool) -> u16 {
        if secured {
            self.secured_port
        } else {
            self.port
        }
    }

    pub fn proxy_realm(&self) -> Option<&Realm> {
        self.realm.as_ref()
    }

    /// Whether requests to `host` skip this proxy.
    pub fn is_ignored_for_host(&self, host: &str) -> bool {
        self.non_proxy_hosts.iter().any(|pattern| {
            match pattern.strip_prefix('*') {
                Some(suffix) => {
                    host.len() >= suffix.len()
                        && host[host.len() - suffix.len()..].eq_ignore_ascii_case(suffix)
                }
                None => pattern.eq_ignore_ascii_case(host),
            }
        })
    }

    /// Whether `url` should be routed through this proxy.
    pub(crate) fn applies_to(&self, url: &Url) -> bool {
        url.host_str()
            .map(|host| !self.is_ignored_for_host(host))
            .unwrap_or(false)
    }
}

impl fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyServer")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("secured_port", &self.secured_port)
            .field("realm", &self.realm.is_some())
            .field("non_proxy_hosts", &self.non_proxy_hosts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_proxy_hosts() {
        let proxy = ProxyServer::new("proxy", 8080)
            .non_proxy_host("*.foo.com")
            .non_proxy_host("LOCALHOST");

        assert!(proxy.is_ignored_for_host("www.foo.com"));
        assert!(proxy.is_ignored_for_host("WWW.FOO.COM"));
        assert!(proxy.is_ignored_for_host("localhost"));
        assert!(!proxy.is_ignored_for_host("foo.org"));
        assert!(!proxy.is_ignored_for_host("com"));

        let url = Url::parse("http://bar.foo.com/x").unwrap();
        assert!(!proxy.applies_to(&url));
        let url = Url::parse("http://example.com/x").unwrap();
        assert!(proxy.applies_to(&url));
    }

    #[test]
    fn secured_port() {
        let proxy = ProxyServer::new("proxy", 8080);
        assert_eq!(proxy.port_for(true), 8080);

        let proxy = proxy.secured_port(8443);
        assert_eq!(proxy.port_for(false), 8080);
        assert_eq!(proxy.port_for(true), 8443);
    }
}
