use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// Counts open connections, globally and per host, against optional
/// ceilings.
///
/// Every open connection owns a [`Permit`]; dropping the permit (with the
/// connection) gives the slot back.
#[derive(Clone)]
pub(crate) struct Limits {
    inner: Arc<Inner>,
}

struct Inner {
    max_total: Option<usize>,
    max_per_host: Option<usize>,
    counts: Mutex<Counts>,
}

#[derive(Default)]
struct Counts {
    total: usize,
    per_host: HashMap<String, usize>,
}

pub(crate) struct Permit {
    inner: Arc<Inner>,
    host: String,
}

/// A connection ceiling was reached.
#[derive(Debug)]
pub(crate) enum Exhausted {
    Total(usize),
    PerHost { host: String, max: usize },
}

impl Limits {
    pub(crate) fn new(max_total: Option<usize>, max_per_host: Option<usize>) -> Limits {
        Limits {
            inner: Arc::new(Inner {
                max_total,
                max_per_host,
                counts: Mutex::new(Counts::default()),
            }),
        }
    }

    /// Claim a slot for a new connection to `host`, without waiting.
    pub(crate) fn try_acquire(&self, host: &str) -> Result<Permit, Exhausted> {
        let mut counts = self
            .inner
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(max) = self.inner.max_total {
            if counts.total >= max {
                return Err(Exhausted::Total(max));
            }
        }
        let per_host = counts.per_host.get(host).copied().unwrap_or(0);
        if let Some(max) = self.inner.max_per_host {
            if per_host >= max {
                return Err(Exhausted::PerHost {
                    host: host.to_owned(),
                    max,
                });
            }
        }

        counts.total += 1;
        counts.per_host.insert(host.to_owned(), per_host + 1);
        Ok(Permit {
            inner: self.inner.clone(),
            host: host.to_owned(),
        })
    }

    /// Open connections per host.
    pub(crate) fn open_by_host(&self) -> HashMap<String, usize> {
        self.inner
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .per_host
            .clone()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        let mut counts = self
            .inner
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        counts.total = counts.total.saturating_sub(1);
        if let Some(n) = counts.per_host.get_mut(&self.host) {
            *n -= 1;
            if *n == 0 {
                counts.per_host.remove(&self.host);
            }
        }
    }
}

impl fmt::Debug for Permit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Permit").field(&self.host).finish()
    }
}

impl fmt::Display for Exhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Exhausted::Total(max) => write!(f, "too many connections: {max}"),
            Exhausted::PerHost { host, max } => {
                write!(f, "too many connections per host {host}: {max}")
            }
        }
    }
}

impl StdError for Exhausted {}
