use std::{
    collections::HashMap,
    hash::Hash,
    net::SocketAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use parking_lot::RwLock;

use crate::parse::{HttpResponse, ProxyUri};

/// Cache of successful origin responses, keyed by request target.
pub type PageCache = Cache<ProxyUri, HttpResponse>;

/// Cache of resolved addresses, keyed by `host:port`. No TTL; entries are
/// evicted when a connect against them fails.
pub type AddrCache = Cache<String, AddrInfo>;

/// Resolved socket address retained from the last successful connect.
///
/// Address family and port are carried by the [`SocketAddr`] itself; the
/// socket type is always TCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrInfo {
    pub addr: SocketAddr,
}

impl From<SocketAddr> for AddrInfo {
    fn from(addr: SocketAddr) -> Self {
        Self { addr }
    }
}

type InsertionCallback<K, V> = Arc<dyn Fn(K, V) + Send + Sync>;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

/// Concurrent map with lazy TTL expiry and an insertion callback.
///
/// `get` and `contains` treat entries older than the TTL as absent and purge
/// them in place; there is no background sweeper. `put` replaces both value
/// and timestamp and then fires the insertion callback, outside the lock so
/// the caller's request path never waits on it.
#[derive(derive_more::Debug)]
pub struct Cache<K, V> {
    #[debug(skip)]
    entries: RwLock<HashMap<K, Entry<V>>>,
    ttl: Option<Duration>,
    #[debug(skip)]
    on_insert: RwLock<Option<InsertionCallback<K, V>>>,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Creates a cache whose entries never expire.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: None,
            on_insert: RwLock::new(None),
        }
    }

    /// Creates a cache whose entries expire `ttl` after insertion.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::new()
        }
    }

    fn is_fresh(&self, entry: &Entry<V>) -> bool {
        match self.ttl {
            Some(ttl) => entry.inserted_at.elapsed() < ttl,
            None => true,
        }
    }

    /// Returns a copy of the live value for `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        {
            let entries = self.entries.read();
            match entries.get(key) {
                None => return None,
                Some(entry) if self.is_fresh(entry) => return Some(entry.value.clone()),
                Some(_) => {}
            }
        }
        // Stale entry: purge it unless a newer insert raced us.
        self.purge_if_stale(key);
        None
    }

    /// True when a live value exists for `key`. Purges a stale one.
    pub fn contains(&self, key: &K) -> bool {
        {
            let entries = self.entries.read();
            match entries.get(key) {
                None => return false,
                Some(entry) if self.is_fresh(entry) => return true,
                Some(_) => {}
            }
        }
        self.purge_if_stale(key);
        false
    }

    fn purge_if_stale(&self, key: &K) {
        let mut entries = self.entries.write();
        let stale = entries.get(key).is_some_and(|entry| !self.is_fresh(entry));
        if stale {
            entries.remove(key);
        }
    }

    /// Inserts `value`, replacing any previous entry and its timestamp, then
    /// fires the insertion callback once.
    pub fn put(&self, key: K, value: V) {
        {
            let mut entries = self.entries.write();
            entries.insert(
                key.clone(),
                Entry {
                    value: value.clone(),
                    inserted_at: Instant::now(),
                },
            );
        }
        let callback = self.on_insert.read().clone();
        if let Some(callback) = callback {
            callback(key, value);
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.entries.write().remove(key).map(|entry| entry.value)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Installs the insertion callback.
    ///
    /// The callback runs on the inserting task after the entry is visible;
    /// it must hand off real work (the page cache's callback only spawns
    /// the prefetcher).
    pub fn set_insertion_callback(&self, callback: impl Fn(K, V) + Send + Sync + 'static) {
        *self.on_insert.write() = Some(Arc::new(callback));
    }
}

impl<K, V> Default for Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
