//! Thread-Safe Key-Value Store with Expiry Support
//!
//! This module implements the store shared by every client connection.
//! Keys and values are binary-safe byte strings; each entry may carry an
//! absolute expiry deadline.
//!
//! ## Concurrency Model
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          Store                              │
//! │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐           │
//! │  │ Shard 0 │ │ Shard 1 │ │ Shard 2 │ │ Shard N │           │
//! │  │ RwLock  │ │ RwLock  │ │ RwLock  │ │ RwLock  │           │
//! │  │ LruCache│ │ LruCache│ │ LruCache│ │ LruCache│           │
//! │  └─────────┘ └─────────┘ └─────────┘ └─────────┘           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Keys are distributed across shards by hash. Single-key operations lock
//! one shard. Multi-key operations (`delete`, `exists`) lock every shard
//! they touch in ascending shard order and hold the locks for the whole
//! operation, so they never observe a half-applied concurrent write and
//! never deadlock against each other.
//!
//! ## Expiry
//!
//! Expired entries are invisible to every read. `get` removes them on the
//! spot; the background sweeper in [`crate::storage::expiry`] removes the
//! ones nobody reads.
//!
//! ## Capacity
//!
//! A store built with [`Store::with_max_keys`] holds at most that many
//! entries. Inserting a new key into a full store first evicts the least
//! recently used entry. Each shard keeps its entries in recency order and
//! every access stamps the entry with a tick from a store-wide clock, so the
//! oldest shard tail is the oldest entry in the store. `get` and `set` count
//! as accesses; `exists` does not.

use bytes::Bytes;
use lru::LruCache;
use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::debug;

/// Number of shards for the store.
const NUM_SHARDS: usize = 64;

/// Longest accepted key, in bytes.
pub const MAX_KEY_LEN: usize = 512;

type ShardMap = LruCache<Bytes, Entry>;

/// Errors returned by store operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The key is empty or longer than [`MAX_KEY_LEN`].
    #[error("invalid key: {0}")]
    InvalidArgument(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Checks that a key is non-empty and at most [`MAX_KEY_LEN`] bytes.
pub fn validate_key(key: &[u8]) -> StoreResult<()> {
    if key.is_empty() {
        return Err(StoreError::InvalidArgument("key is empty".to_string()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(StoreError::InvalidArgument(format!(
            "key is {} bytes, limit is {}",
            key.len(),
            MAX_KEY_LEN
        )));
    }
    Ok(())
}

/// A stored value with an optional expiry deadline.
#[derive(Debug, Clone)]
pub struct Entry {
    /// The stored value
    pub value: Bytes,
    /// When this entry expires (None = never expires)
    pub expires_at: Option<Instant>,
    /// Store clock reading at the last access
    last_access: u64,
}

impl Entry {
    /// Creates an entry that never expires.
    pub fn new(value: Bytes) -> Self {
        Self {
            value,
            expires_at: None,
            last_access: 0,
        }
    }

    /// Creates an entry expiring `ttl` from now.
    ///
    /// A ttl too large to represent as an `Instant` never expires.
    pub fn with_ttl(value: Bytes, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now().checked_add(ttl),
            last_access: 0,
        }
    }

    /// Checks if this entry has expired.
    #[inline]
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }

    #[inline]
    fn is_expired_at(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|exp| now >= exp)
    }
}

#[derive(Debug)]
struct Shard {
    data: RwLock<ShardMap>,
}

impl Shard {
    fn new() -> Self {
        Self {
            data: RwLock::new(LruCache::unbounded()),
        }
    }
}

/// The key-value store shared by all connections.
///
/// Wrap it in an `Arc` and hand a clone to every consumer; all methods take
/// `&self`.
///
/// # Example
///
/// ```
/// use linekv::storage::Store;
/// use bytes::Bytes;
/// use std::time::Duration;
///
/// let store = Store::new();
///
/// store.set(Bytes::from("name"), Bytes::from("linekv"), None).unwrap();
/// assert_eq!(store.get(&Bytes::from("name")).unwrap(), Some(Bytes::from("linekv")));
///
/// store
///     .set(Bytes::from("session"), Bytes::from("abc123"), Some(Duration::from_secs(60)))
///     .unwrap();
/// assert_eq!(store.exists(&[Bytes::from("name"), Bytes::from("session")]).unwrap(), 2);
/// ```
pub struct Store {
    shards: Vec<Shard>,

    /// Entry limit; `None` means unbounded
    max_keys: Option<usize>,
    /// Serializes inserts into a bounded store
    eviction_lock: Mutex<()>,
    /// Ticks once per access, read under the accessed shard's write lock
    clock: AtomicU64,

    /// Entries physically present, including expired ones not yet purged
    key_count: AtomicU64,
    get_count: AtomicU64,
    set_count: AtomicU64,
    del_count: AtomicU64,
    expired_count: AtomicU64,
    evicted_count: AtomicU64,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("shards", &self.shards.len())
            .field("max_keys", &self.max_keys)
            .field("key_count", &self.key_count.load(Ordering::Relaxed))
            .finish()
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    /// Creates an empty, unbounded store.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Creates an empty store holding at most `max_keys` entries. A limit of
    /// zero is treated as one.
    pub fn with_max_keys(max_keys: usize) -> Self {
        Self::build(Some(max_keys.max(1)))
    }

    fn build(max_keys: Option<usize>) -> Self {
        Self {
            shards: (0..NUM_SHARDS).map(|_| Shard::new()).collect(),
            max_keys,
            eviction_lock: Mutex::new(()),
            clock: AtomicU64::new(0),
            key_count: AtomicU64::new(0),
            get_count: AtomicU64::new(0),
            set_count: AtomicU64::new(0),
            del_count: AtomicU64::new(0),
            expired_count: AtomicU64::new(0),
            evicted_count: AtomicU64::new(0),
        }
    }

    /// The entry limit, if any.
    pub fn max_keys(&self) -> Option<usize> {
        self.max_keys
    }

    #[inline]
    fn shard_index(&self, key: &[u8]) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % NUM_SHARDS
    }

    #[inline]
    fn shard(&self, key: &[u8]) -> &Shard {
        &self.shards[self.shard_index(key)]
    }

    fn shard_indices(&self, keys: &[Bytes]) -> BTreeSet<usize> {
        keys.iter().map(|k| self.shard_index(k)).collect()
    }

    /// Write-locks every shard holding one of `keys`, lowest index first.
    fn write_shards(&self, keys: &[Bytes]) -> BTreeMap<usize, RwLockWriteGuard<'_, ShardMap>> {
        self.shard_indices(keys)
            .into_iter()
            .map(|i| (i, self.shards[i].data.write()))
            .collect()
    }

    /// Read-locks every shard holding one of `keys`, lowest index first.
    fn read_shards(&self, keys: &[Bytes]) -> BTreeMap<usize, RwLockReadGuard<'_, ShardMap>> {
        self.shard_indices(keys)
            .into_iter()
            .map(|i| (i, self.shards[i].data.read()))
            .collect()
    }

    fn record_purge(&self, count: u64) {
        self.key_count.fetch_sub(count, Ordering::Relaxed);
        self.expired_count.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Stores `entry` as the most recently used entry of its shard.
    fn insert(&self, key: Bytes, mut entry: Entry) {
        let mut data = self.shard(&key).data.write();
        entry.last_access = self.tick();
        if data.put(key, entry).is_none() {
            self.key_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Removes the least recently used entry in the store. Returns false if
    /// the store is empty.
    fn evict_one(&self) -> bool {
        loop {
            let oldest = self
                .shards
                .iter()
                .enumerate()
                .filter_map(|(index, shard)| {
                    shard
                        .data
                        .read()
                        .peek_lru()
                        .map(|(key, entry)| (entry.last_access, index, key.clone()))
                })
                .min_by_key(|(last_access, _, _)| *last_access);

            let Some((last_access, index, key)) = oldest else {
                return false;
            };

            let mut data = self.shards[index].data.write();
            // Touched or replaced since it was picked
            if data.peek(&key).map(|entry| entry.last_access) != Some(last_access) {
                continue;
            }
            if let Some(entry) = data.pop(&key) {
                if entry.is_expired() {
                    self.record_purge(1);
                } else {
                    self.key_count.fetch_sub(1, Ordering::Relaxed);
                    self.evicted_count.fetch_add(1, Ordering::Relaxed);
                    debug!(key = ?key, "Evicted least recently used key");
                }
            }
            return true;
        }
    }

    /// Inserts or overwrites a key.
    ///
    /// The value and the expiry are replaced together: overwriting a key that
    /// had a ttl with `ttl = None` makes it persistent. A new key inserted
    /// into a full store evicts the least recently used entry first.
    pub fn set(&self, key: Bytes, value: Bytes, ttl: Option<Duration>) -> StoreResult<()> {
        validate_key(&key)?;
        self.set_count.fetch_add(1, Ordering::Relaxed);

        let entry = match ttl {
            Some(ttl) => Entry::with_ttl(value, ttl),
            None => Entry::new(value),
        };

        let Some(max_keys) = self.max_keys else {
            self.insert(key, entry);
            return Ok(());
        };

        let _guard = self.eviction_lock.lock();
        if !self.shard(&key).data.read().contains(&key) {
            while self.len() >= max_keys as u64 && self.evict_one() {}
        }
        self.insert(key, entry);
        Ok(())
    }

    /// Gets the value for a key.
    ///
    /// Returns `None` if the key doesn't exist or has expired. An expired
    /// entry found here is removed. In a bounded store a hit marks the key
    /// as most recently used.
    pub fn get(&self, key: &Bytes) -> StoreResult<Option<Bytes>> {
        validate_key(key)?;
        self.get_count.fetch_add(1, Ordering::Relaxed);

        let shard = self.shard(key);

        // Fast path: recency only matters to a bounded store, so a read lock
        // will do otherwise
        if self.max_keys.is_none() {
            let data = shard.data.read();
            match data.peek(key) {
                Some(entry) if !entry.is_expired() => return Ok(Some(entry.value.clone())),
                Some(_) => {}
                None => return Ok(None),
            }
        }

        let mut data = shard.data.write();
        match data.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.last_access = self.tick();
                Ok(Some(entry.value.clone()))
            }
            Some(_) => {
                data.pop(key);
                self.record_purge(1);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Deletes keys and returns how many live keys were removed.
    ///
    /// Expired entries are purged but not counted. A key listed twice counts
    /// once.
    pub fn delete(&self, keys: &[Bytes]) -> StoreResult<u64> {
        for key in keys {
            validate_key(key)?;
        }
        self.del_count.fetch_add(1, Ordering::Relaxed);

        let mut shards = self.write_shards(keys);
        let now = Instant::now();
        let mut removed = 0;
        let mut purged = 0;

        for key in keys {
            let Some(data) = shards.get_mut(&self.shard_index(key)) else {
                continue;
            };
            if let Some(entry) = data.pop(key) {
                if entry.is_expired_at(now) {
                    purged += 1;
                } else {
                    removed += 1;
                }
            }
        }

        self.key_count.fetch_sub(removed, Ordering::Relaxed);
        if purged > 0 {
            self.record_purge(purged);
        }
        Ok(removed)
    }

    /// Counts the distinct keys among `keys` that are present and unexpired.
    ///
    /// Never modifies the store.
    pub fn exists(&self, keys: &[Bytes]) -> StoreResult<u64> {
        for key in keys {
            validate_key(key)?;
        }

        let shards = self.read_shards(keys);
        let now = Instant::now();
        let mut seen = HashSet::with_capacity(keys.len());

        let count = keys
            .iter()
            .filter(|key| seen.insert(*key))
            .filter(|key| {
                shards
                    .get(&self.shard_index(key))
                    .and_then(|data| data.peek(*key))
                    .is_some_and(|entry| !entry.is_expired_at(now))
            })
            .count();

        Ok(count as u64)
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> u64 {
        self.key_count.load(Ordering::Relaxed)
    }

    /// Returns true if the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns operation counters.
    pub fn stats(&self) -> StoreStats {
        StoreStats {
            keys: self.key_count.load(Ordering::Relaxed),
            get_ops: self.get_count.load(Ordering::Relaxed),
            set_ops: self.set_count.load(Ordering::Relaxed),
            del_ops: self.del_count.load(Ordering::Relaxed),
            expired: self.expired_count.load(Ordering::Relaxed),
            evicted: self.evicted_count.load(Ordering::Relaxed),
        }
    }

    /// Removes expired entries from all shards and returns how many were
    /// removed. Called by the expiry sweeper.
    pub fn cleanup_expired(&self) -> u64 {
        let now = Instant::now();
        let mut cleaned = 0u64;

        for shard in &self.shards {
            let expired: Vec<Bytes> = shard
                .data
                .read()
                .iter()
                .filter(|(_, entry)| entry.is_expired_at(now))
                .map(|(key, _)| key.clone())
                .collect();
            if expired.is_empty() {
                continue;
            }

            let mut data = shard.data.write();
            for key in &expired {
                // Re-check: the key may have been rewritten in between
                if data.peek(key).is_some_and(|entry| entry.is_expired_at(now)) {
                    data.pop(key);
                    cleaned += 1;
                }
            }
        }

        if cleaned > 0 {
            self.record_purge(cleaned);
        }
        cleaned
    }
}

/// Store statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    /// Number of entries currently stored
    pub keys: u64,
    /// Total GET operations
    pub get_ops: u64,
    /// Total SET operations
    pub set_ops: u64,
    /// Total DEL operations
    pub del_ops: u64,
    /// Total expired entries purged
    pub expired: u64,
    /// Total live entries evicted to stay within capacity
    pub evicted: u64,
}
