use crate::config::{ConfigError, StoreConfig};
use crate::counted_map::{CountedId, CountedMap, PutResult};
use crate::error::InsertError;
use crate::indexed_map::{Duplicate, EntryId};
use crate::reentrancy::DebugReentrancy;
use core::borrow::Borrow;
use core::cell::Cell;
use core::fmt;
use core::hash::{BuildHasher, Hash, Hasher};
use core::ops::Deref;
use parking_lot::RwLock;
use std::collections::hash_map::RandomState;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

struct Shard<K, V> {
    map: RwLock<CountedMap<K, V>>,
    reentrancy: DebugReentrancy,
}

struct Inner<K, V, S> {
    shards: Box<[Shard<K, V>]>,
    shift: u32,
    hasher: S,
}

impl<K, V, S> Inner<K, V, S> {
    #[inline]
    fn shard_index(&self, hash: u64) -> usize {
        // Skip the top 7 bits; hashbrown uses them for its control bytes.
        (hash << 7).checked_shr(self.shift).unwrap_or(0) as usize
    }
}

impl<K, V, S> Inner<K, V, S>
where
    K: Eq,
{
    /// Return one unit of count for the entry behind `ch`.
    fn release(&self, idx: usize, ch: CountedId) {
        let shard = &self.shards[idx];

        // Fast path: not the last handle, so a shared lock is enough.
        let ch = {
            let _g = shard.reentrancy.enter();
            let map = shard.map.read();
            match map.put_shared(ch) {
                Ok(()) => return,
                Err(ch) => ch,
            }
        };

        // Possibly the last handle: decrement and remove under exclusion so no
        // reader can observe a zero count.
        let removed = {
            let _g = shard.reentrancy.enter();
            let mut map = shard.map.write();
            map.put(ch)
        };
        if let PutResult::Removed { key, value } = removed {
            debug!(shard = idx, "reclaimed entry");
            // Dropped with the lock released: these may own handles into this store.
            drop(key);
            drop(value);
        }
    }
}

/// A concurrent map whose entries are kept alive by `Handle`s.
///
/// Every successful `insert` or `get` returns a `Handle` that accounts for one
/// unit of the entry's reference count. Dropping the handle gives it back; when
/// the last one goes the entry is removed. Cloning an `RcStore` shares the
/// same backing map.
pub struct RcStore<K, V, S = RandomState> {
    inner: Arc<Inner<K, V, S>>,
}

impl<K, V, S> Clone for RcStore<K, V, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> RcStore<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::with_hasher(RandomState::new())
    }

    pub fn with_config(config: StoreConfig) -> Result<Self, ConfigError> {
        Self::with_config_and_hasher(config, RandomState::new())
    }
}

impl<K, V, S> Default for RcStore<K, V, S>
where
    K: Eq + Hash + Clone,
    V: Clone,
    S: BuildHasher + Default,
{
    fn default() -> Self {
        Self::with_hasher(S::default())
    }
}

impl<K, V, S> RcStore<K, V, S>
where
    K: Eq + Hash + Clone,
    V: Clone,
    S: BuildHasher,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self::build(StoreConfig::default(), hasher)
    }

    pub fn with_config_and_hasher(config: StoreConfig, hasher: S) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::build(config, hasher))
    }

    fn build(config: StoreConfig, hasher: S) -> Self {
        let per_shard = config.shard_capacity();
        let shards = (0..config.shards)
            .map(|_| Shard {
                map: RwLock::new(CountedMap::with_capacity(per_shard)),
                reentrancy: DebugReentrancy::new(),
            })
            .collect();
        debug!(
            shards = config.shards,
            capacity = config.capacity,
            "created rc store"
        );
        Self {
            inner: Arc::new(Inner {
                shards,
                shift: u64::BITS - config.shards.trailing_zeros(),
                hasher,
            }),
        }
    }

    #[inline]
    fn locate<Q>(&self, q: &Q) -> (u64, usize)
    where
        Q: ?Sized + Hash,
    {
        let hash = self.inner.hasher.hash_one(q);
        (hash, self.inner.shard_index(hash))
    }

    pub fn shard_count(&self) -> usize {
        self.inner.shards.len()
    }

    /// Number of live entries. Shards are visited one at a time, so under
    /// concurrent use the total is not an atomic snapshot.
    pub fn len(&self) -> usize {
        self.inner.shards.iter().map(|s| s.map.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.shards.iter().all(|s| s.map.read().is_empty())
    }

    pub fn contains_key<Q>(&self, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let (hash, idx) = self.locate(q);
        let shard = &self.inner.shards[idx];
        let _g = shard.reentrancy.enter();
        let found = shard.map.read().contains_key(hash, q);
        found
    }

    /// Current reference count of a live entry, i.e. the number of
    /// outstanding handles to it.
    pub fn ref_count<Q>(&self, q: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let (hash, idx) = self.locate(q);
        let shard = &self.inner.shards[idx];
        let _g = shard.reentrancy.enter();
        let count = shard.map.read().ref_count(hash, q);
        count
    }

    /// Insert a new entry with a reference count of one.
    ///
    /// If the key is already present nothing is replaced: the error carries a
    /// handle to the existing entry (counted like any other handle) and the
    /// rejected key and value are dropped.
    pub fn insert(&self, key: K, value: V) -> Result<Handle<K, V, S>, InsertError<K, V, S>> {
        let (hash, idx) = self.locate(&key);
        let shard = &self.inner.shards[idx];
        // Snapshot for the handle before locking; no user code beyond
        // `K: Eq` runs under the write lock on this path.
        let handle_key = key.clone();
        let handle_value = value.clone();

        let res = {
            let _g = shard.reentrancy.enter();
            let mut map = shard.map.write();
            match map.insert(hash, key, value) {
                Ok(ch) => Ok(ch),
                Err(dup) => Err(Self::acquire_duplicate(&map, dup)),
            }
        };

        match res {
            Ok(ch) => {
                trace!(shard = idx, "inserted entry");
                Ok(self.handle(idx, ch, handle_key, handle_value))
            }
            Err((existing, rejected)) => {
                trace!(shard = idx, "insert rejected: key already present");
                drop(rejected);
                Err(InsertError::AlreadyExists(existing.into_handle(self, idx)))
            }
        }
    }

    /// Like `insert`, but builds the value only if the key is absent.
    ///
    /// `default` runs while the key's shard is locked exclusively, so it must
    /// not use this store (debug builds panic if it touches the same shard).
    pub fn insert_with<F>(&self, key: K, default: F) -> Result<Handle<K, V, S>, InsertError<K, V, S>>
    where
        F: FnOnce() -> V,
    {
        let (hash, idx) = self.locate(&key);
        let shard = &self.inner.shards[idx];
        let handle_key = key.clone();
        let snapshot: Cell<Option<V>> = Cell::new(None);

        let res = {
            let _g = shard.reentrancy.enter();
            let mut map = shard.map.write();
            let built = map.insert_with(hash, key, || {
                let value = default();
                snapshot.set(Some(value.clone()));
                value
            });
            match built {
                Ok(ch) => Ok(ch),
                Err(dup) => Err(Self::acquire_duplicate(&map, dup)),
            }
        };

        match res {
            Ok(ch) => {
                trace!(shard = idx, "inserted entry");
                let value = snapshot
                    .take()
                    .expect("constructor runs whenever an entry is inserted");
                Ok(self.handle(idx, ch, handle_key, value))
            }
            Err((existing, rejected)) => {
                trace!(shard = idx, "insert rejected: key already present");
                drop(rejected);
                drop(handle_key);
                Err(InsertError::AlreadyExists(existing.into_handle(self, idx)))
            }
        }
    }

    /// Return a handle to the entry for `key`, inserting `default()` first if
    /// there is none. The same locking rules as `insert_with` apply.
    pub fn get_or_insert_with<F>(&self, key: K, default: F) -> Handle<K, V, S>
    where
        F: FnOnce() -> V,
    {
        if let Some(h) = self.get(&key) {
            return h;
        }
        match self.insert_with(key, default) {
            Ok(h) => h,
            // Lost a race with another inserter; share its entry.
            Err(e) => e.into_handle(),
        }
    }

    /// Look up `q` and, if present, return a new handle to it.
    pub fn get<Q>(&self, q: &Q) -> Option<Handle<K, V, S>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let (hash, idx) = self.locate(q);
        let shard = &self.inner.shards[idx];
        let found = {
            let _g = shard.reentrancy.enter();
            let map = shard.map.read();
            map.acquire(hash, q, |k, v| (k.clone(), v.clone()))
        };
        match found {
            Some((ch, (key, value))) => {
                trace!(shard = idx, "get hit");
                Some(self.handle(idx, ch, key, value))
            }
            None => {
                trace!(shard = idx, "get miss");
                None
            }
        }
    }

    fn handle(&self, shard: usize, ch: CountedId, key: K, value: V) -> Handle<K, V, S> {
        Handle {
            key,
            value,
            shard,
            counted: Some(ch),
            store: Arc::downgrade(&self.inner),
        }
    }

    // Runs under the shard's write lock.
    fn acquire_duplicate<T>(
        map: &CountedMap<K, V>,
        dup: Duplicate<K, T>,
    ) -> (Acquired<K, V>, (K, T)) {
        let Duplicate {
            existing,
            key,
            payload,
        } = dup;
        let (ch, (k, v)) = map
            .acquire_id(existing, |k, v| (k.clone(), v.clone()))
            .expect("duplicate must reference a live entry");
        (
            Acquired {
                ch,
                key: k,
                value: v,
            },
            (key, payload),
        )
    }
}

// A freshly minted count plus the snapshot that goes into its handle.
struct Acquired<K, V> {
    ch: CountedId,
    key: K,
    value: V,
}

impl<K, V> Acquired<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn into_handle<S: BuildHasher>(self, store: &RcStore<K, V, S>, shard: usize) -> Handle<K, V, S> {
        store.handle(shard, self.ch, self.key, self.value)
    }
}

impl<K, V, S> fmt::Debug for RcStore<K, V, S>
where
    K: Eq,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len: usize = self.inner.shards.iter().map(|s| s.map.read().len()).sum();
        f.debug_struct("RcStore")
            .field("shards", &self.inner.shards.len())
            .field("len", &len)
            .finish()
    }
}

/// One counted reference to an `RcStore` entry.
///
/// Holds a copy of the entry's key and value taken when the handle was
/// created. Not `Clone`: use `acquire` (or `RcStore::get`) for another
/// counted reference. Dropping the handle releases its count and removes the
/// entry if it was the last one. The handle does not keep the store alive;
/// once every `RcStore` clone is gone, dropping it does nothing.
pub struct Handle<K, V, S = RandomState>
where
    K: Eq,
{
    key: K,
    value: V,
    shard: usize,
    // `None` only while dropping.
    counted: Option<CountedId>,
    store: Weak<Inner<K, V, S>>,
}

impl<K, V, S> Handle<K, V, S>
where
    K: Eq,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    /// The value as it was when this handle was created.
    pub fn value(&self) -> &V {
        &self.value
    }

    /// Whether the store this handle came from still exists.
    pub fn is_attached(&self) -> bool {
        self.store.strong_count() > 0
    }

    /// Release this reference now. Equivalent to dropping the handle.
    pub fn release(self) {
        drop(self)
    }

    fn entry_id(&self) -> Option<EntryId> {
        self.counted.as_ref().map(CountedId::id)
    }
}

impl<K, V, S> Handle<K, V, S>
where
    K: Eq + Clone,
    V: Clone,
{
    /// Take another counted reference to the same entry, with a fresh copy
    /// of its current key and value. `None` if the store is gone.
    pub fn acquire(&self) -> Option<Self> {
        let inner = self.store.upgrade()?;
        let id = self.entry_id()?;
        let shard = &inner.shards[self.shard];
        let acquired = {
            let _g = shard.reentrancy.enter();
            let map = shard.map.read();
            map.acquire_id(id, |k, v| (k.clone(), v.clone()))
        };
        // This handle's own count keeps the entry present.
        let (ch, (key, value)) =
            acquired.expect("entry must be live while a handle to it exists");
        Some(Handle {
            key,
            value,
            shard: self.shard,
            counted: Some(ch),
            store: Weak::clone(&self.store),
        })
    }
}

impl<K, V, S> Deref for Handle<K, V, S>
where
    K: Eq,
{
    type Target = V;

    fn deref(&self) -> &V {
        &self.value
    }
}

impl<K, V, S> Drop for Handle<K, V, S>
where
    K: Eq,
{
    fn drop(&mut self) {
        let Some(ch) = self.counted.take() else {
            return;
        };
        match self.store.upgrade() {
            Some(inner) => inner.release(self.shard, ch),
            None => {
                // The count went away with the store.
                trace!("store already dropped; nothing to release");
                ch.abandon();
            }
        }
    }
}

impl<K, V, S> PartialEq for Handle<K, V, S>
where
    K: Eq,
{
    fn eq(&self, other: &Self) -> bool {
        // Entry ids are only unique within one shard.
        Weak::ptr_eq(&self.store, &other.store)
            && self.shard == other.shard
            && self.entry_id() == other.entry_id()
    }
}

impl<K, V, S> Eq for Handle<K, V, S> where K: Eq {}

impl<K, V, S> Hash for Handle<K, V, S>
where
    K: Eq,
{
    fn hash<H: Hasher>(&self, state: &mut H) {
        (self.store.as_ptr() as *const () as usize).hash(state);
        self.shard.hash(state);
        self.entry_id().hash(state);
    }
}

impl<K, V, S> fmt::Debug for Handle<K, V, S>
where
    K: Eq + fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("key", &self.key)
            .field("value", &self.value)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_shard_routes_everything_to_zero() {
        let store: RcStore<u64, u64> =
            RcStore::with_config(StoreConfig::new().with_shards(1)).unwrap();
        for hash in [0, 1, u64::MAX, 0x8000_0000_0000_0000] {
            assert_eq!(store.inner.shard_index(hash), 0);
        }
    }

    #[test]
    fn shard_index_stays_in_range() {
        let store: RcStore<u64, u64> =
            RcStore::with_config(StoreConfig::new().with_shards(16)).unwrap();
        let mut seen = [false; 16];
        for i in 0..10_000u64 {
            let (_hash, idx) = store.locate(&i);
            assert!(idx < 16);
            seen[idx] = true;
        }
        assert!(seen.iter().all(|s| *s), "keys should spread over all shards");
    }

    #[test]
    fn release_fast_path_keeps_entry() {
        let store: RcStore<String, i32> = RcStore::new();
        let a = store.insert("k".into(), 1).unwrap();
        let b = store.get("k").unwrap();
        assert_eq!(store.ref_count("k"), Some(2));
        drop(a);
        assert_eq!(store.ref_count("k"), Some(1));
        drop(b);
        assert_eq!(store.ref_count("k"), None);
    }

    #[test]
    fn first_entries_of_different_shards_are_not_equal() {
        let store: RcStore<u64, u64> =
            RcStore::with_config(StoreConfig::new().with_shards(16)).unwrap();
        let a = store.insert(0, 0).unwrap();
        // A key routed to another shard lands in that shard's first slot,
        // so both handles carry the same entry id.
        let other = (1..)
            .find(|k| store.locate(k).1 != a.shard)
            .expect("some key maps to another shard");
        let b = store.insert(other, other).unwrap();
        assert_ne!(a.shard, b.shard);
        assert_eq!(a.entry_id(), b.entry_id());
        assert!(a != b);
    }

    #[test]
    fn handles_are_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<RcStore<String, Vec<u8>>>();
        assert_send_sync::<Handle<String, Vec<u8>>>();
    }
}
