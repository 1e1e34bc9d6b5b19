//! Idle connection pool.
//!
//! Connections are bucketed by [`PartitionKey`]. Each partition is a stack:
//! [`Pool::acquire`] hands out the most recently released connection, and
//! [`Pool::release`] pushes onto the top. Partitions are locked
//! individually, so unrelated destinations never contend.
//!
//! Connections removed by a sweep, a flush, or a rejected release are
//! dropped after the partition lock is released. Dropping a connection is
//! what destroys it.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use tokio::time::Instant;

use crate::partition::PartitionKey;

mod limits;
mod stats;

pub(crate) use self::limits::{Exhausted, Limits, Permit};
pub use self::stats::{ClientStats, HostStats};

/// A connection that can sit idle in a [`Pool`].
pub trait Poolable: Send + 'static {
    /// Whether the peer has not closed the connection.
    fn is_open(&self) -> bool;
}

/// Identifies one tracked connection for the lifetime of a pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

/// A connection tracked by a [`Pool`], either leased to a request or idle.
pub struct Pooled<T> {
    value: T,
    key: PartitionKey,
    id: ConnId,
    created_at: Instant,
    reused: bool,
}

impl<T> Pooled<T> {
    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn key(&self) -> &PartitionKey {
        &self.key
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Whether this lease came out of the idle pool rather than a fresh
    /// connect.
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("reused", &self.reused)
            .finish()
    }
}

/// Pool settings.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Whether released connections are kept at all.
    pub keep_alive: bool,
    /// Idle connections older than this are destroyed.
    pub idle_timeout: Option<Duration>,
    /// Connections older than this are destroyed regardless of use.
    pub ttl: Option<Duration>,
    /// Ceiling on idle connections within one partition.
    pub max_idle_per_partition: usize,
    /// Ceiling on idle connections across all partitions.
    pub max_idle: Option<usize>,
    /// Upper bound on how often the background sweep runs.
    pub cleaner_period: Duration,
}

impl Default for PoolConfig {
    fn default() -> PoolConfig {
        PoolConfig {
            keep_alive: true,
            idle_timeout: Some(Duration::from_secs(60)),
            ttl: None,
            max_idle_per_partition: usize::MAX,
            max_idle: None,
            cleaner_period: Duration::from_secs(1),
        }
    }
}

pub struct Pool<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    config: PoolConfig,
    partitions: RwLock<HashMap<PartitionKey, Arc<Partition<T>>>>,
    idle_total: AtomicUsize,
    closed: AtomicBool,
    next_id: AtomicU64,
    cleaner_started: AtomicBool,
}

struct Partition<T> {
    idle: Mutex<VecDeque<Idle<T>>>,
}

struct Idle<T> {
    idle_at: Instant,
    conn: Pooled<T>,
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Pool<T> {
        Pool {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Poolable> Pool<T> {
    pub fn new(config: PoolConfig) -> Pool<T> {
        Pool {
            inner: Arc::new(Inner {
                config,
                partitions: RwLock::new(HashMap::new()),
                idle_total: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                cleaner_started: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Start tracking a freshly established connection, leased to the
    /// caller.
    pub fn track(&self, value: T, key: PartitionKey) -> Pooled<T> {
        let id = ConnId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        Pooled {
            value,
            key,
            id,
            created_at: Instant::now(),
            reused: false,
        }
    }

    /// Take the most recently released idle connection for `key`.
    ///
    /// Never waits. Idle entries that turn out to be closed or expired are
    /// destroyed along the way. `None` means the caller must connect.
    pub fn acquire(&self, key: &PartitionKey) -> Option<Pooled<T>> {
        if self.is_closed() {
            return None;
        }
        let partition = self.inner.partition(key)?;

        let now = Instant::now();
        let mut discarded = Vec::new();
        let found = {
            let mut idle = lock(&partition.idle);
            loop {
                let Some(entry) = idle.pop_front() else {
                    break None;
                };
                self.inner.idle_total.fetch_sub(1, Ordering::AcqRel);
                if self.inner.is_expired(&entry, now) || !entry.conn.is_open() {
                    discarded.push(entry);
                    continue;
                }
                break Some(entry.conn);
            }
        };

        if !discarded.is_empty() {
            log::debug!(
                "discarded {} stale idle connection(s) for {:?}",
                discarded.len(),
                key
            );
        }
        drop(discarded);

        found.map(|mut conn| {
            log::trace!("reuse idle connection {:?} for {:?}", conn.id, key);
            conn.reused = true;
            conn
        })
    }

    /// Offer a connection back to the pool.
    ///
    /// Returns `false` when the connection was refused, in which case it has
    /// been destroyed: the pool is closed, keep-alive is disabled, the
    /// connection is closed or past its TTL, or an idle ceiling is met.
    pub fn release(&self, conn: Pooled<T>) -> bool {
        match self.try_release(conn) {
            Ok(()) => {
                self.ensure_cleaner();
                true
            }
            Err((conn, reason)) => {
                log::debug!("connection {:?} not pooled: {}", conn.id, reason);
                drop(conn);
                false
            }
        }
    }

    fn try_release(&self, conn: Pooled<T>) -> Result<(), (Pooled<T>, &'static str)> {
        let inner = &self.inner;
        if !inner.config.keep_alive {
            return Err((conn, "keep-alive disabled"));
        }
        if !conn.is_open() {
            return Err((conn, "closed by peer"));
        }
        if let Some(ttl) = inner.config.ttl {
            if conn.created_at.elapsed() >= ttl {
                return Err((conn, "ttl expired"));
            }
        }

        let partition = inner.partition_or_insert(&conn.key);
        let mut idle = lock(&partition.idle);

        // checked under the partition lock so `close` cannot miss this entry
        if inner.closed.load(Ordering::SeqCst) {
            return Err((conn, "pool closed"));
        }
        if idle.len() >= inner.config.max_idle_per_partition {
            return Err((conn, "partition idle ceiling reached"));
        }
        match inner.config.max_idle {
            Some(max) => {
                let reserved = inner
                    .idle_total
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        (n < max).then_some(n + 1)
                    });
                if reserved.is_err() {
                    return Err((conn, "global idle ceiling reached"));
                }
            }
            None => {
                inner.idle_total.fetch_add(1, Ordering::AcqRel);
            }
        }

        log::trace!("pooling idle connection {:?} for {:?}", conn.id, conn.key);
        idle.push_front(Idle {
            idle_at: Instant::now(),
            conn,
        });
        Ok(())
    }

    /// Remove every idle occurrence of `id`. Returns whether anything was
    /// removed.
    pub fn remove_all(&self, id: ConnId) -> bool {
        let mut removed = Vec::new();
        for partition in self.inner.snapshot() {
            let mut idle = lock(&partition.idle);
            let before = idle.len();
            let mut kept = VecDeque::with_capacity(before);
            for entry in idle.drain(..) {
                if entry.conn.id == id {
                    removed.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            *idle = kept;
        }
        self.inner
            .idle_total
            .fetch_sub(removed.len(), Ordering::AcqRel);
        !removed.is_empty()
    }

    /// Destroy all idle connections of partitions matching `predicate`.
    pub fn flush_partitions<F>(&self, predicate: F) -> usize
    where
        F: Fn(&PartitionKey) -> bool,
    {
        let targets: Vec<_> = {
            let partitions = read(&self.inner.partitions);
            partitions
                .iter()
                .filter(|(key, _)| predicate(key))
                .map(|(key, partition)| (key.clone(), partition.clone()))
                .collect()
        };

        let mut removed = Vec::new();
        for (key, partition) in targets {
            let mut idle = lock(&partition.idle);
            if !idle.is_empty() {
                log::debug!("flushing {} idle connection(s) for {:?}", idle.len(), key);
            }
            removed.extend(idle.drain(..));
        }
        self.inner
            .idle_total
            .fetch_sub(removed.len(), Ordering::AcqRel);
        removed.len()
    }

    /// Number of idle connections per target host.
    pub fn idle_counts_by_host(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for (key, partition) in read(&self.inner.partitions).iter() {
            let n = lock(&partition.idle).len();
            if n > 0 {
                *counts.entry(key.host().to_owned()).or_insert(0) += n;
            }
        }
        counts
    }

    /// Number of idle connections across all partitions.
    pub fn idle_count(&self) -> usize {
        self.inner.idle_total.load(Ordering::Acquire)
    }

    /// Destroy idle connections that are closed, idle for too long, or past
    /// their TTL. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut removed = Vec::new();
        for partition in self.inner.snapshot() {
            let mut idle = lock(&partition.idle);
            let mut kept = VecDeque::with_capacity(idle.len());
            for entry in idle.drain(..) {
                if self.inner.is_expired(&entry, now) || !entry.conn.is_open() {
                    removed.push(entry);
                } else {
                    kept.push_back(entry);
                }
            }
            *idle = kept;
        }
        let n = removed.len();
        self.inner.idle_total.fetch_sub(n, Ordering::AcqRel);
        if n > 0 {
            log::debug!("idle sweep closed {n} connection(s)");
        }
        n
    }

    /// Shut the pool down, destroying all idle connections. Any later
    /// release is refused.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let n = self.flush_partitions(|_| true);
        log::debug!("pool closed, {n} idle connection(s) destroyed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn ensure_cleaner(&self) {
        let config = &self.inner.config;
        let period = [config.idle_timeout, config.ttl]
            .into_iter()
            .flatten()
            .fold(config.cleaner_period, Duration::min);
        if config.idle_timeout.is_none() && config.ttl.is_none() {
            return;
        }
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self.inner.cleaner_started.swap(true, Ordering::AcqRel) {
            return;
        }

        log::trace!("starting pool cleaner every {period:?}");
        let weak = Arc::downgrade(&self.inner);
        handle.spawn(clean_idle(weak, period));
    }
}

async fn clean_idle<T: Poolable>(weak: Weak<Inner<T>>, period: Duration) {
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let Some(inner) = weak.upgrade() else {
            break;
        };
        if inner.closed.load(Ordering::SeqCst) {
            break;
        }
        Pool { inner }.sweep();
    }
    log::trace!("pool cleaner stopped");
}

impl<T> Inner<T> {
    fn partition(&self, key: &PartitionKey) -> Option<Arc<Partition<T>>> {
        read(&self.partitions).get(key).cloned()
    }

    fn partition_or_insert(&self, key: &PartitionKey) -> Arc<Partition<T>> {
        if let Some(partition) = self.partition(key) {
            return partition;
        }
        self.partitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_insert_with(|| {
                Arc::new(Partition {
                    idle: Mutex::new(VecDeque::new()),
                })
            })
            .clone()
    }

    fn snapshot(&self) -> Vec<Arc<Partition<T>>> {
        read(&self.partitions).values().cloned().collect()
    }

    fn is_expired(&self, entry: &Idle<T>, now: Instant) -> bool {
        if let Some(timeout) = self.config.idle_timeout {
            if now.saturating_duration_since(entry.idle_at) >= timeout {
                return true;
            }
        }
        if let Some(ttl) = self.config.ttl {
            if now.saturating_duration_since(entry.conn.created_at) >= ttl {
                return true;
            }
        }
        false
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("idle", &self.inner.idle_total.load(Ordering::Relaxed))
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}
