use std::collections::HashMap;
use std::fmt;

/// A snapshot of a client's connections.
///
/// Every open connection is either active (leased to a request) or idle
/// (sitting in the pool).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientStats {
    per_host: HashMap<String, HostStats>,
}

/// Connection counts for a single host.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostStats {
    active: usize,
    idle: usize,
}

impl ClientStats {
    pub(crate) fn new(open: HashMap<String, usize>, idle: HashMap<String, usize>) -> ClientStats {
        let mut per_host: HashMap<String, HostStats> = HashMap::new();
        for (host, n) in open {
            per_host.entry(host).or_default().active = n;
        }
        for (host, n) in idle {
            let stats = per_host.entry(host).or_default();
            // idle connections are open too; counts read separately can skew
            stats.active = stats.active.saturating_sub(n);
            stats.idle = n;
        }
        ClientStats { per_host }
    }

    /// Stats keyed by host.
    pub fn stats_per_host(&self) -> &HashMap<String, HostStats> {
        &self.per_host
    }

    pub fn total_connection_count(&self) -> usize {
        self.per_host.values().map(HostStats::total_connection_count).sum()
    }

    pub fn total_active_connection_count(&self) -> usize {
        self.per_host.values().map(|s| s.active).sum()
    }

    pub fn total_idle_connection_count(&self) -> usize {
        self.per_host.values().map(|s| s.idle).sum()
    }
}

impl HostStats {
    pub fn total_connection_count(&self) -> usize {
        self.active + self.idle
    }

    pub fn host_active_connection_count(&self) -> usize {
        self.active
    }

    pub fn host_idle_connection_count(&self) -> usize {
        self.idle
    }
}

impl fmt::Display for ClientStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "There are {} total connections, {} are active and {} are idle.",
            self.total_connection_count(),
            self.total_active_connection_count(),
            self.total_idle_connection_count()
        )
    }
}

impl fmt::Display for HostStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "There are {} total connections, {} are active and {} are idle.",
            self.total_connection_count(),
            self.active,
            self.idle
        )
    }
}
