//! IndexedMap: structural layer with stable generational ids.
//!
//! The caller supplies each key's hash. The store hashes a key once, uses
//! the hash to pick a shard, and passes the same hash down here, so
//! `K: Hash` never runs while a shard lock is held. Entries keep their hash
//! and rehashing the index uses the stored value.

// The plain `insert`/`insert_with`/`iter` entry points serve tests and benches.
#![cfg_attr(not(feature = "bench_internal"), allow(dead_code))]

use core::borrow::Borrow;
use hashbrown::hash_table::Entry as TableEntry;
use hashbrown::HashTable;
use slotmap::{DefaultKey, SlotMap};

/// Stable id of an entry. Generational: once an entry is removed its id never
/// resolves again, even if the slot is reused.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct EntryId(DefaultKey);

impl EntryId {
    #[inline]
    fn raw(self) -> DefaultKey {
        self.0
    }
}

#[derive(Debug)]
struct Entry<K, V> {
    key: K,
    value: V,
    hash: u64,
}

/// A rejected insert: the key was already present.
///
/// Hands the caller's inputs back so they can be dropped outside any lock.
#[derive(Debug)]
pub struct Duplicate<K, T> {
    pub existing: EntryId,
    pub key: K,
    pub payload: T,
}

pub struct IndexedMap<K, V> {
    index: HashTable<DefaultKey>,
    slots: SlotMap<DefaultKey, Entry<K, V>>,
}

impl<K, V> Default for IndexedMap<K, V>
where
    K: Eq,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> IndexedMap<K, V>
where
    K: Eq,
{
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            index: HashTable::with_capacity(capacity),
            slots: SlotMap::with_capacity_and_key(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn find<Q>(&self, hash: u64, q: &Q) -> Option<EntryId>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        self.index
            .find(hash, |&k| {
                self.slots
                    .get(k)
                    .map(|e| e.key.borrow() == q)
                    .unwrap_or(false)
            })
            .map(|&k| EntryId(k))
    }

    pub fn contains_key<Q>(&self, hash: u64, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        self.find(hash, q).is_some()
    }

    pub fn insert(&mut self, hash: u64, key: K, value: V) -> Result<EntryId, Duplicate<K, V>> {
        self.insert_seeded(hash, key, value, |v| v)
    }

    /// Insert, calling `default` only when the key is absent. On a duplicate
    /// the unused constructor is returned as the payload.
    pub fn insert_with<F>(
        &mut self,
        hash: u64,
        key: K,
        default: F,
    ) -> Result<EntryId, Duplicate<K, F>>
    where
        F: FnOnce() -> V,
    {
        self.insert_seeded(hash, key, default, |f| f())
    }

    /// Insert `make(seed)` when the key is absent; otherwise return `seed`
    /// untouched.
    pub fn insert_seeded<T, F>(
        &mut self,
        hash: u64,
        key: K,
        seed: T,
        make: F,
    ) -> Result<EntryId, Duplicate<K, T>>
    where
        F: FnOnce(T) -> V,
    {
        match self.index.entry(
            hash,
            |&kk| self.slots.get(kk).map(|e| e.key == key).unwrap_or(false),
            |&kk| self.slots.get(kk).map(|e| e.hash).unwrap_or(0),
        ) {
            TableEntry::Occupied(o) => Err(Duplicate {
                existing: EntryId(*o.get()),
                key,
                payload: seed,
            }),
            TableEntry::Vacant(v) => {
                let value = make(seed);
                let k = self.slots.insert(Entry { key, value, hash });
                let _ = v.insert(k);
                Ok(EntryId(k))
            }
        }
    }

    /// Unlink an entry and hand back its key and value.
    pub fn remove(&mut self, id: EntryId) -> Option<(K, V)> {
        let k = id.raw();
        let entry = self.slots.remove(k)?;
        self.index
            .find_entry(entry.hash, |&kk| kk == k)
            .expect("index must reference every live slot")
            .remove();
        Some((entry.key, entry.value))
    }

    pub fn value(&self, id: EntryId) -> Option<&V> {
        self.slots.get(id.raw()).map(|e| &e.value)
    }

    pub fn entry(&self, id: EntryId) -> Option<(&K, &V)> {
        self.slots.get(id.raw()).map(|e| (&e.key, &e.value))
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &K, &V)> {
        self.slots
            .iter()
            .map(|(k, e)| (EntryId(k), &e.key, &e.value))
    }
}
