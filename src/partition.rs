//! Partition keys for pooled connections.
//!
//! Two requests with the same effective destination (after a virtual host
//! override) and the same proxy produce equal keys, and may therefore share
//! idle connections.

use std::fmt;

use crate::proxy::ProxyServer;
use crate::Url;

/// Identifies the bucket a pooled connection belongs to.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey {
    target: String,
    host: String,
    proxy: Option<ProxyPart>,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct ProxyPart {
    host: String,
    port: u16,
    secured: bool,
}

impl PartitionKey {
    /// Build the key for `url`, reached through an optional virtual host and
    /// proxy.
    ///
    /// The virtual host is taken verbatim as the target authority, so
    /// `"example.com:8443"` and `"example.com"` partition separately.
    pub fn new(url: &Url, virtual_host: Option<&str>, proxy: Option<&ProxyServer>) -> PartitionKey {
        let (target, host) = match virtual_host {
            Some(vhost) => {
                let vhost = vhost.to_ascii_lowercase();
                let host = strip_port(&vhost).to_owned();
                (format!("{}://{}", url.scheme(), vhost), host)
            }
            None => {
                let host = url.host_str().unwrap_or("").to_ascii_lowercase();
                let port = url.port_or_known_default().unwrap_or(0);
                (format!("{}://{}:{}", url.scheme(), host, port), host)
            }
        };

        let proxy = proxy.map(|proxy| {
            let secured = is_secure(url);
            ProxyPart {
                host: proxy.host().to_ascii_lowercase(),
                port: proxy.port_for(secured),
                secured,
            }
        });

        PartitionKey {
            target,
            host,
            proxy,
        }
    }

    /// The target host, used to group pool statistics.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Whether this partition routes through a proxy.
    pub fn is_proxied(&self) -> bool {
        self.proxy.is_some()
    }
}

impl fmt::Debug for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.proxy {
            Some(ref proxy) => write!(
                f,
                "{} via {}:{}{}",
                self.target,
                proxy.host,
                proxy.port,
                if proxy.secured { " (secured)" } else { "" }
            ),
            None => f.write_str(&self.target),
        }
    }
}

pub(crate) fn is_secure(url: &Url) -> bool {
    matches!(url.scheme(), "https" | "wss")
}

fn strip_port(authority: &str) -> &str {
    if authority.starts_with('[') {
        // [v6]:port
        return match authority.find(']') {
            Some(end) => &authority[..=end],
            None => authority,
        };
    }
    match authority.rfind(':') {
        Some(idx) => &authority[..idx],
        None => authority,
    }
}
