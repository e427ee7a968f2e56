//! Lock-striped map for read-heavy, write-light shared state.
//!
//! Reads take a shared lock on one shard; writes take an exclusive lock on
//! the shard owning the key. There is no map-wide lock.

use core::hash::{BuildHasher, Hash};

use hashbrown::{DefaultHashBuilder, HashMap};
use parking_lot::RwLock;

pub const DEFAULT_SHARDS: usize = 32;

pub struct ShardedMap<K, V> {
    shards: Box<[RwLock<HashMap<K, V>>]>,
    hasher: DefaultHashBuilder,
}

impl<K: Eq + Hash, V> ShardedMap<K, V> {
    pub fn new() -> Self {
        Self::with_shards(DEFAULT_SHARDS)
    }

    pub fn with_shards(count: usize) -> Self {
        let count = count.max(1);
        let shards = (0..count).map(|_| RwLock::new(HashMap::new())).collect();
        Self {
            shards,
            hasher: DefaultHashBuilder::default(),
        }
    }

    #[inline]
    fn shard(&self, key: &K) -> &RwLock<HashMap<K, V>> {
        let h = self.hasher.hash_one(key);
        &self.shards[(h as usize) % self.shards.len()]
    }

    /// Read a value under the shard's shared lock.
    pub fn read<R>(&self, key: &K, f: impl FnOnce(Option<&V>) -> R) -> R {
        let guard = self.shard(key).read();
        f(guard.get(key))
    }

    /// Mutate (or create with `init`) the value for `key` under the shard's exclusive lock.
    pub fn upsert<R>(
        &self,
        key: K,
        init: impl FnOnce() -> V,
        f: impl FnOnce(&mut V) -> R,
    ) -> R {
        let mut guard = self.shard(&key).write();
        f(guard.entry(key).or_insert_with(init))
    }

    /// Mutate an existing value; returns `None` when absent.
    pub fn update<R>(&self, key: &K, f: impl FnOnce(&mut V) -> R) -> Option<R> {
        let mut guard = self.shard(key).write();
        guard.get_mut(key).map(f)
    }

    pub fn insert(&self, key: K, value: V) -> Option<V> {
        self.shard(&key).write().insert(key, value)
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.shard(key).write().remove(key)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.shard(key).read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }

    /// Visit every entry, one shard at a time. Not a consistent snapshot
    /// across shards under concurrent writes.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        for shard in self.shards.iter() {
            let guard = shard.read();
            for (k, v) in guard.iter() {
                f(k, v);
            }
        }
    }

    /// Keep entries where `keep` returns true; returns the number removed.
    pub fn retain(&self, mut keep: impl FnMut(&K, &mut V) -> bool) -> usize {
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut guard = shard.write();
            let before = guard.len();
            guard.retain(|k, v| keep(k, v));
            removed += before - guard.len();
        }
        removed
    }

    pub fn clear(&self) {
        for shard in self.shards.iter() {
            shard.write().clear();
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> ShardedMap<K, V> {
    pub fn get(&self, key: &K) -> Option<V> {
        self.read(key, |v| v.cloned())
    }

    /// Owned copy of every entry.
    pub fn entries(&self) -> Vec<(K, V)> {
        let mut out = Vec::with_capacity(self.len());
        self.for_each(|k, v| out.push((k.clone(), v.clone())));
        out
    }
}

impl<K: Eq + Hash, V> Default for ShardedMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
