//! Sharded Robin Hood hash map with lock-free readers.
//!
//! [`RobinMap`] splits the key space across `1 << SHARD_BITS` independent
//! Robin Hood tables, routed by the *high* bits of a single per-operation
//! hash. Readers traverse a shard without taking its lock, validating each
//! slot against a per-slot sequence counter; writers serialise on a TTAS
//! spin lock per shard. Replaced tables are reclaimed through
//! [`petek`]'s epoch scheme, so a reader never observes freed memory.
//!
//! Intended for process-local shared dictionaries (rate-limit counters,
//! connection tables, interned caches, memoization fronts) where a single
//! mutex becomes the bottleneck but a fully lock-free map is overkill.
//!
//! # Example
//!
//! ```rust
//! use petek_map::RobinMap;
//!
//! let map: RobinMap<u64, String> = RobinMap::new();
//!
//! assert!(map.insert(7, "seven".to_string()));
//! assert!(!map.insert(7, "again".to_string()));
//! assert_eq!(map.get(&7), Some("seven".to_string()));
//!
//! assert!(map.remove(&7));
//! assert_eq!(map.get(&7), None);
//! ```
//!
//! # Consistency
//!
//! Within one shard, writes linearise in lock order and a successful read
//! returns a value that was present during the read. Across shards there is
//! no global ordering: [`len`](RobinMap::len) sums per-shard counters and is
//! exact only while no writer is active.

#![warn(missing_docs)]

mod shard;
mod util;

use std::borrow::Borrow;
use std::hash::{BuildHasher, Hash};

use crossbeam_utils::CachePadded;
use foldhash::fast::FixedState;
use petek::EpochManager;

use crate::shard::Shard;
use crate::util::shard_index;

/// A concurrent hash map sharded over Robin Hood tables.
///
/// `SHARD_BITS` (0..=16, default 6) fixes the shard count at
/// `1 << SHARD_BITS`. Keys must hash identically to their borrowed forms,
/// as with any hashed container.
///
/// Values are returned *by clone*: readers snapshot a slot rather than
/// borrow into the table, which is what lets them run without locking while
/// writers mutate. Wrap large payloads in `Arc` to make the clone cheap.
pub struct RobinMap<K, V, S = FixedState, const SHARD_BITS: u32 = 6> {
    shards: Box<[CachePadded<Shard<K, V>>]>,
    epoch: EpochManager,
    hasher: S,
}

// The contract is stated here rather than left to auto-derivation through
// the shard internals, so a future internal field cannot widen it silently.

// SAFETY: RobinMap can be sent between threads if K, V, S are Send; sending
// the map moves ownership of every table and the hasher.
unsafe impl<K: Send, V: Send, S: Send, const SHARD_BITS: u32> Send
    for RobinMap<K, V, S, SHARD_BITS>
{
}

// SAFETY: shared access is synchronised by the per-shard writer locks and
// per-slot sequence counters; `&self` operations still move values in and
// out of the tables, hence Send on K and V (matching Shard's Sync bound).
// The hasher is only ever read.
unsafe impl<K: Send + Sync, V: Send + Sync, S: Sync, const SHARD_BITS: u32> Sync
    for RobinMap<K, V, S, SHARD_BITS>
{
}

impl<K, V> RobinMap<K, V>
where
    K: Hash + Eq + Clone + 'static,
    V: Clone + 'static,
{
    /// Create an empty map with the default hasher and 64 shards.
    pub fn new() -> Self {
        Self::with_hasher(FixedState::default())
    }
}

impl<K, V> Default for RobinMap<K, V>
where
    K: Hash + Eq + Clone + 'static,
    V: Clone + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, S, const SHARD_BITS: u32> RobinMap<K, V, S, SHARD_BITS>
where
    K: Hash + Eq + Clone + 'static,
    V: Clone + 'static,
    S: BuildHasher,
{
    /// Create an empty map with a custom hasher.
    pub fn with_hasher(hasher: S) -> Self {
        const {
            assert!(SHARD_BITS <= 16, "SHARD_BITS must be in 0..=16");
        }
        Self {
            shards: (0..1usize << SHARD_BITS)
                .map(|_| CachePadded::new(Shard::new()))
                .collect(),
            epoch: EpochManager::new(),
            hasher,
        }
    }

    /// Number of shards, `1 << SHARD_BITS`.
    pub fn num_shards(&self) -> usize {
        1 << SHARD_BITS
    }

    /// The map's hasher.
    pub fn hasher(&self) -> &S {
        &self.hasher
    }

    #[inline]
    fn shard_for(&self, hash: u64) -> &Shard<K, V> {
        &self.shards[shard_index(hash, SHARD_BITS)]
    }

    /// Look up a key and return a clone of its value. Lock-free.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let _guard = self.epoch.pin();
        let hash = self.hasher.hash_one(key);
        self.shard_for(hash).find(hash, key)
    }

    /// True if the key is present. Lock-free.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let _guard = self.epoch.pin();
        let hash = self.hasher.hash_one(key);
        self.shard_for(hash).contains(hash, key)
    }

    /// 1 if the key is present, 0 otherwise.
    pub fn count<Q>(&self, key: &Q) -> usize
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        usize::from(self.contains_key(key))
    }

    /// Insert a key-value pair. Returns true if the key was newly inserted,
    /// false if it was already present (the existing value is kept).
    pub fn insert(&self, key: K, value: V) -> bool {
        let _guard = self.epoch.pin();
        let hash = self.hasher.hash_one(&key);
        self.shard_for(hash).insert(hash, key, value, &self.epoch)
    }

    /// Remove a key. Returns true if it was present.
    pub fn remove<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let _guard = self.epoch.pin();
        let hash = self.hasher.hash_one(key);
        self.shard_for(hash).erase(hash, key, &self.epoch)
    }

    /// Insert a key-value pair, overwriting any existing value. Returns true
    /// if the key was newly inserted, false if an existing value was
    /// replaced.
    pub fn insert_or_assign(&self, key: K, value: V) -> bool {
        let _guard = self.epoch.pin();
        let hash = self.hasher.hash_one(&key);
        self.shard_for(hash)
            .insert_or_assign(hash, key, value, &self.epoch)
    }

    /// Insert `factory()` if the key is absent. Returns true on insertion;
    /// the factory is invoked at most once and only when the key was absent
    /// at the time the shard's writer lock was taken.
    ///
    /// The factory runs under that lock and must not call back into this
    /// map.
    pub fn try_insert_with<F>(&self, key: K, factory: F) -> bool
    where
        F: FnOnce() -> V,
    {
        let _guard = self.epoch.pin();
        let hash = self.hasher.hash_one(&key);
        self.shard_for(hash)
            .try_insert_with(hash, key, factory, &self.epoch)
    }

    /// The value now associated with the key: the existing one, or `value`
    /// after inserting it.
    pub fn get_or_insert(&self, key: K, value: V) -> V {
        let _guard = self.epoch.pin();
        let hash = self.hasher.hash_one(&key);
        self.shard_for(hash)
            .get_or_insert(hash, key, value, &self.epoch)
    }

    /// The value now associated with the key: the existing one, or
    /// `factory()` after inserting it. The factory is invoked at most once,
    /// only when the key was absent, and runs under the shard's writer lock
    /// and must not call back into this map.
    pub fn get_or_insert_with<F>(&self, key: K, factory: F) -> V
    where
        F: FnOnce() -> V,
    {
        let _guard = self.epoch.pin();
        let hash = self.hasher.hash_one(&key);
        self.shard_for(hash)
            .get_or_insert_with(hash, key, factory, &self.epoch)
    }

    /// Total entry count, summed over shards with relaxed loads.
    ///
    /// Exact per shard under that shard's writer lock; the cross-shard sum
    /// is an approximation unless the caller has quiesced all writers.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.len()).sum()
    }

    /// True if the map appears empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove all entries from all shards.
    pub fn clear(&self) {
        let _guard = self.epoch.pin();
        for shard in self.shards.iter() {
            shard.clear(&self.epoch);
        }
    }

    /// Pre-size every shard so `count` entries in total fit without further
    /// resizing, assuming an even spread across shards.
    pub fn reserve(&self, count: usize) {
        let _guard = self.epoch.pin();
        let shards = self.num_shards();
        let per_shard = count / shards + usize::from(count % shards != 0);
        for shard in self.shards.iter() {
            shard.reserve(per_shard, &self.epoch);
        }
    }

    /// Total slot capacity, summed over shards.
    pub fn capacity(&self) -> usize {
        let _guard = self.epoch.pin();
        self.shards.iter().map(|shard| shard.capacity()).sum()
    }
}
