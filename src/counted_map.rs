//! CountedMap: per-entry reference counting atop IndexedMap using tokens.
//!
//! Counts are atomic so that minting a token (and returning one that is not
//! the last) only needs a shared borrow of the map. Returning the last token
//! needs `&mut self`, which is where removal at zero happens. Behind a
//! `RwLock` that means: read lock to acquire, write lock to reclaim.

use crate::indexed_map::{Duplicate, EntryId, IndexedMap};
use crate::tokens::{AtomicCount, Count, Token};
use core::borrow::Borrow;

#[derive(Debug)]
pub struct Counted<V> {
    pub refcount: AtomicCount,
    pub value: V,
}

impl<V> Counted<V> {
    pub fn new(value: V) -> Self {
        Self {
            refcount: AtomicCount::new(0),
            value,
        }
    }
}

pub struct CountedMap<K, V> {
    inner: IndexedMap<K, Counted<V>>,
}

/// Entry id carrying a linear token for one unit of that entry's count.
#[derive(Debug)]
pub struct CountedId {
    id: EntryId,
    token: Token<AtomicCount>, // owned and consumed by put()
}

impl CountedId {
    pub fn id(&self) -> EntryId {
        self.id
    }

    /// Give up the count without returning it; only valid once the map that
    /// minted it has been dropped.
    pub fn abandon(self) {
        self.token.abandon();
    }
}

/// Result of returning a token; indicates whether the entry was removed.
pub enum PutResult<K, V> {
    Live,
    Removed { key: K, value: V },
}

impl<K, V> CountedMap<K, V>
where
    K: Eq,
{
    #[cfg(test)]
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: IndexedMap::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains_key<Q>(&self, hash: u64, q: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        self.inner.contains_key(hash, q)
    }

    pub fn ref_count<Q>(&self, hash: u64, q: &Q) -> Option<usize>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
    {
        let id = self.inner.find(hash, q)?;
        self.inner.value(id).map(|c| c.refcount.load())
    }

    /// Look up `q` and mint a token for it.
    ///
    /// `read` sees the entry before the token exists, so a panic inside it
    /// leaves the count untouched.
    pub fn acquire<Q, R, F>(&self, hash: u64, q: &Q, read: F) -> Option<(CountedId, R)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Eq,
        F: FnOnce(&K, &V) -> R,
    {
        let id = self.inner.find(hash, q)?;
        self.acquire_id(id, read)
    }

    /// Mint another token for a known entry. `None` if the id is stale.
    pub fn acquire_id<R, F>(&self, id: EntryId, read: F) -> Option<(CountedId, R)>
    where
        F: FnOnce(&K, &V) -> R,
    {
        let (key, counted) = self.inner.entry(id)?;
        let r = read(key, &counted.value);
        let token = counted.refcount.get();
        Some((CountedId { id, token }, r))
    }

    /// Insert a new key -> value and mint the first token for it.
    pub fn insert(&mut self, hash: u64, key: K, value: V) -> Result<CountedId, Duplicate<K, V>> {
        let id = self.inner.insert_seeded(hash, key, value, Counted::new)?;
        Ok(self.mint_first(id))
    }

    /// Insert using a lazy value constructor; only calls `default()` when inserting.
    pub fn insert_with<F>(
        &mut self,
        hash: u64,
        key: K,
        default: F,
    ) -> Result<CountedId, Duplicate<K, F>>
    where
        F: FnOnce() -> V,
    {
        let id = self
            .inner
            .insert_seeded(hash, key, default, |f| Counted::new(f()))?;
        Ok(self.mint_first(id))
    }

    fn mint_first(&self, id: EntryId) -> CountedId {
        let entry = self
            .inner
            .value(id)
            .expect("entry must exist immediately after successful insert");
        let token = entry.refcount.get();
        CountedId { id, token }
    }

    /// Return a token unless it is the entry's last; never removes.
    ///
    /// Safe to call concurrently with `acquire` and other `put_shared`
    /// calls. On `Err` the caller must come back through `put`.
    pub fn put_shared(&self, h: CountedId) -> Result<(), CountedId> {
        let CountedId { id, token } = h;
        let entry = self
            .inner
            .value(id)
            .expect("CountedId must refer to a live entry when returned");
        entry
            .refcount
            .put_unless_last(token)
            .map_err(|token| CountedId { id, token })
    }

    /// Return a token for an entry; removes and returns (K, V) when count hits zero.
    pub fn put(&mut self, h: CountedId) -> PutResult<K, V> {
        let CountedId { id, token } = h;
        let entry = self
            .inner
            .value(id)
            .expect("CountedId must refer to a live entry when returned to put()");
        let now_zero = entry.refcount.put(token);
        if now_zero {
            let (k, v) = self
                .inner
                .remove(id)
                .expect("entry must exist when count reaches zero");
            PutResult::Removed {
                key: k,
                value: v.value,
            }
        } else {
            PutResult::Live
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::Cell;

    fn h(s: &str) -> u64 {
        // Stable toy hash; collisions are fine for these tests.
        s.bytes().fold(0xcbf2_9ce4_8422_2325u64, |acc, b| {
            (acc ^ b as u64).wrapping_mul(0x1000_0000_01b3)
        })
    }

    // Property-based invariant: for each key, entry liveness in the map
    // matches whether there exists at least one outstanding `CountedId`
    // for that key, and the stored count equals the number outstanding.
    //
    // Invariants exercised:
    // - `insert` mints exactly one token on success; duplicates do not mint.
    // - `acquire`/`acquire_id` mint one token when the key is present.
    // - `put_shared` refuses the last token; `put` removes the entry exactly
    //   when the last token is returned.
    proptest! {
        #[test]
        fn prop_counted_map_liveness(keys in 1usize..=5, ops in proptest::collection::vec((0u8..=5u8, 0usize..100usize), 1..100)) {
            let mut m: CountedMap<String, i32> = CountedMap::new();
            let mut live: Vec<Vec<CountedId>> = std::iter::repeat_with(Vec::new).take(keys).collect();

            for (op, raw_k) in ops.into_iter() {
                let k = raw_k % keys;
                let key = format!("k{}", k);
                match op {
                    // Insert new entry with value == k
                    0 => {
                        if let Ok(ch) = m.insert(h(&key), key.clone(), k as i32) {
                            live[k].push(ch);
                        }
                    }
                    // Acquire by key
                    1 => {
                        if let Some((ch, v)) = m.acquire(h(&key), key.as_str(), |_k, v| *v) {
                            prop_assert_eq!(v, k as i32);
                            live[k].push(ch);
                        }
                    }
                    // Acquire by id from an outstanding token
                    2 => {
                        if let Some(id) = live[k].last().map(|ch| ch.id()) {
                            let (ch, ()) = m.acquire_id(id, |_, _| ()).expect("live id resolves");
                            live[k].push(ch);
                        }
                    }
                    // Shared put; falls back to exclusive put for the last token
                    3 => {
                        if let Some(ch) = live[k].pop() {
                            if let Err(ch) = m.put_shared(ch) {
                                prop_assert!(live[k].is_empty());
                                let removed = matches!(m.put(ch), PutResult::Removed { .. });
                                prop_assert!(removed, "last token must remove the entry");
                            }
                        }
                    }
                    // Exclusive put of one token
                    4 => {
                        if let Some(ch) = live[k].pop() {
                            match m.put(ch) {
                                PutResult::Live => prop_assert!(!live[k].is_empty()),
                                PutResult::Removed { key: rk, value } => {
                                    prop_assert!(live[k].is_empty());
                                    prop_assert_eq!(rk, key.clone());
                                    prop_assert_eq!(value, k as i32);
                                }
                            }
                        }
                    }
                    // Return all tokens for this key
                    5 => {
                        while let Some(ch) = live[k].pop() { let _ = m.put(ch); }
                    }
                    _ => unreachable!(),
                }

                prop_assert_eq!(m.contains_key(h(&key), key.as_str()), !live[k].is_empty());
                let expected = if live[k].is_empty() { None } else { Some(live[k].len()) };
                prop_assert_eq!(m.ref_count(h(&key), key.as_str()), expected);
            }

            // Drain remaining tokens and verify emptiness
            for (k, ids) in live.iter_mut().enumerate() {
                while let Some(ch) = ids.pop() { let _ = m.put(ch); }
                let key = format!("k{}", k);
                prop_assert!(!m.contains_key(h(&key), key.as_str()));
            }
            prop_assert!(m.is_empty());
        }
    }

    /// insert_with is lazy (the constructor runs only on insertion) and mints
    /// one token. On duplicate, the constructor does not run and no token is
    /// minted. Returning the last token removes the entry and yields `(K, V)`.
    #[test]
    fn insert_with_is_lazy_and_mints_token() {
        let mut m: CountedMap<String, i32> = CountedMap::new();
        let calls = Cell::new(0);

        let Ok(ch) = m.insert_with(h("k"), "k".to_string(), || {
            calls.set(calls.get() + 1);
            7
        }) else {
            panic!("insert into an empty map must succeed");
        };
        assert_eq!(calls.get(), 1);
        assert_eq!(m.ref_count(h("k"), "k"), Some(1));

        let dup = m.insert_with(h("k"), "k".to_string(), || {
            calls.set(calls.get() + 1);
            99
        });
        match dup {
            Err(d) => assert_eq!(d.existing, ch.id()),
            Ok(_) => panic!("unexpected insert of duplicate"),
        }
        assert_eq!(calls.get(), 1);
        assert_eq!(m.ref_count(h("k"), "k"), Some(1));

        match m.put(ch) {
            PutResult::Removed { key, value } => {
                assert_eq!(key, "k");
                assert_eq!(value, 7);
            }
            PutResult::Live => panic!("expected removal"),
        }
        assert!(!m.contains_key(h("k"), "k"));
    }

    /// A rejected `insert` hands back the attempted key and value untouched.
    #[test]
    fn duplicate_insert_returns_inputs() {
        let mut m: CountedMap<String, String> = CountedMap::new();
        let ch = m.insert(h("a"), "a".into(), "first".into()).unwrap();
        let d = match m.insert(h("a"), "a".into(), "second".into()) {
            Err(d) => d,
            Ok(_) => panic!("duplicate must be rejected"),
        };
        assert_eq!(d.existing, ch.id());
        assert_eq!(d.payload, "second");
        let (ch2, v) = m.acquire_id(d.existing, |_, v| v.clone()).unwrap();
        assert_eq!(v, "first");
        assert!(matches!(m.put(ch2), PutResult::Live));
        assert!(matches!(m.put(ch), PutResult::Removed { .. }));
    }

    /// A panicking reader leaves the count untouched.
    #[test]
    fn panicking_reader_does_not_mint() {
        let mut m: CountedMap<String, i32> = CountedMap::new();
        let ch = m.insert(h("p"), "p".into(), 1).unwrap();
        let res = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            m.acquire(h("p"), "p", |_, _| panic!("reader failed"))
        }));
        assert!(res.is_err());
        assert_eq!(m.ref_count(h("p"), "p"), Some(1));
        let _ = m.put(ch);
    }

    /// Tokens for a stale id cannot be minted.
    #[test]
    fn acquire_id_rejects_stale_ids() {
        let mut m: CountedMap<&'static str, i32> = CountedMap::new();
        let ch = m.insert(h("x"), "x", 1).unwrap();
        let id = ch.id();
        assert!(matches!(m.put(ch), PutResult::Removed { .. }));
        assert!(m.acquire_id(id, |_, _| ()).is_none());
    }

    /// Negative behavior: dropping a `CountedId` without returning it panics
    /// due to the underlying `Token`'s `Drop` implementation.
    #[test]
    fn dropping_counted_id_without_put_panics() {
        use std::panic::{catch_unwind, AssertUnwindSafe};
        let res = catch_unwind(AssertUnwindSafe(|| {
            let mut m: CountedMap<&'static str, i32> = CountedMap::new();
            let ch = m.insert(h("boom"), "boom", 1).unwrap();
            drop(ch);
        }));
        assert!(
            res.is_err(),
            "expected panic when CountedId is dropped without put"
        );
    }
}
