#![cfg(test)]

// Property tests for IndexedMap kept inside the crate so they do not
// require feature gates to access internal modules.

use crate::indexed_map::{Duplicate, EntryId, IndexedMap};
use proptest::prelude::*;
use std::cell::Cell;
use std::collections::hash_map::RandomState;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::{BuildHasher, Hash};
use std::rc::Rc;

// Key newtype with Borrow<str> to exercise borrowed lookup.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
struct Key(String);
impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
impl std::borrow::Borrow<str> for Key {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// Pool-indexed operations to improve shrinking: indices shrink to earlier keys,
// pool length shrinks, and op lists shrink in length.
#[derive(Clone, Debug)]
enum OpI {
    Insert(usize, i32),
    InsertWith(usize, i32),
    Remove(usize),
    Find(usize),
    Contains(String),
    Iterate,
}

fn key_from(pool: &[String], i: usize) -> Key {
    Key(pool[i].clone())
}

fn arb_scenario() -> impl Strategy<Value = (Vec<String>, Vec<OpI>)> {
    proptest::collection::vec("[a-z]{0,5}", 1..=8).prop_flat_map(|pool| {
        let idxs: Vec<usize> = (0..pool.len()).collect();
        let idx = proptest::sample::select(idxs);
        let contains_pool = proptest::sample::select(pool.clone());
        let op = prop_oneof![
            (idx.clone(), any::<i32>()).prop_map(|(i, v)| OpI::Insert(i, v)),
            (idx.clone(), any::<i32>()).prop_map(|(i, v)| OpI::InsertWith(i, v)),
            idx.clone().prop_map(OpI::Remove),
            idx.clone().prop_map(OpI::Find),
            prop_oneof![
                contains_pool.prop_map(|s: String| s),
                "[a-z]{0,5}".prop_map(|s| s)
            ]
            .prop_map(OpI::Contains),
            Just(OpI::Iterate),
        ];
        proptest::collection::vec(op, 1..60).prop_map(move |ops| (pool.clone(), ops))
    })
}

// Hashes with a real hasher, or with a constant to force every key into one
// probe chain.
#[derive(Clone, Copy, Debug)]
enum Hashing {
    Random,
    Constant,
}

struct Hasher {
    mode: Hashing,
    state: RandomState,
}

impl Hasher {
    fn new(mode: Hashing) -> Self {
        Self {
            mode,
            state: RandomState::new(),
        }
    }

    fn hash<Q: Hash + ?Sized>(&self, q: &Q) -> u64 {
        match self.mode {
            Hashing::Random => self.state.hash_one(q),
            Hashing::Constant => 0,
        }
    }
}

// State-machine equivalence against std::collections::HashMap.
// Invariants exercised across random operation sequences:
// - Duplicate keys are rejected with the existing id and the inputs handed
//   back; on success a unique stable id is returned.
// - `find`/`contains_key` parity and id stability for live entries.
// - `remove(id)` returns the owned `(K, V)` matching the model and
//   invalidates the id.
// - `iter` yields each live entry exactly once.
// - Stale ids never resolve; `len`/`is_empty` parity with the model.
fn run_state_machine(pool: Vec<String>, ops: Vec<OpI>, mode: Hashing) -> Result<(), TestCaseError> {
    let hasher = Hasher::new(mode);
    let mut sut: IndexedMap<Key, i32> = IndexedMap::new();
    let mut model: HashMap<Key, i32> = HashMap::new();
    let mut live: HashMap<Key, EntryId> = HashMap::new();
    let mut stale: Vec<EntryId> = Vec::new();

    let default_calls = Rc::new(Cell::new(0));
    for op in ops {
        match op {
            OpI::Insert(i, v) => {
                let k = key_from(&pool, i);
                let already = model.contains_key(&k);
                match sut.insert(hasher.hash(&k), k.clone(), v) {
                    Ok(id) => {
                        prop_assert!(!already, "insert must fail on duplicate");
                        let prev = live.insert(k.clone(), id);
                        prop_assert!(prev.is_none());
                        model.insert(k, v);
                    }
                    Err(Duplicate {
                        existing,
                        key,
                        payload,
                    }) => {
                        prop_assert!(already, "duplicate error only when key exists");
                        prop_assert_eq!(Some(&existing), live.get(&k));
                        prop_assert_eq!(key, k);
                        prop_assert_eq!(payload, v);
                    }
                }
            }
            OpI::InsertWith(i, v) => {
                let k = key_from(&pool, i);
                let already = model.contains_key(&k);
                let counter = default_calls.clone();
                let before = counter.get();
                match sut.insert_with(hasher.hash(&k), k.clone(), move || {
                    counter.set(counter.get() + 1);
                    v
                }) {
                    Ok(id) => {
                        prop_assert!(!already, "insert_with must fail on duplicate");
                        prop_assert_eq!(default_calls.get(), before + 1);
                        let prev = live.insert(k.clone(), id);
                        prop_assert!(prev.is_none());
                        model.insert(k, v);
                    }
                    Err(_) => {
                        prop_assert!(already, "duplicate error only when key exists");
                        prop_assert_eq!(default_calls.get(), before, "default must not run on duplicate");
                    }
                }
            }
            OpI::Remove(i) => {
                let k = key_from(&pool, i);
                if let Some(&id) = live.get(&k) {
                    let (kk, vv) = sut.remove(id).expect("id valid for removal");
                    prop_assert!(kk == k);
                    let mv = model.remove(&kk).expect("present in model");
                    prop_assert_eq!(vv, mv);
                    let _ = live.remove(&k);
                    stale.push(id);
                } else {
                    prop_assert!(sut.find(hasher.hash(&k), &k).is_none());
                }
            }
            OpI::Find(i) => {
                let k = key_from(&pool, i);
                let s = sut.find(hasher.hash(&k), &k);
                prop_assert_eq!(s.is_some(), model.contains_key(&k));
                if let Some(id) = s {
                    prop_assert_eq!(Some(&id), live.get(&k));
                    prop_assert_eq!(sut.value(id), model.get(&k));
                }
            }
            OpI::Contains(s) => {
                // `str` and `Key` hash identically, as `Borrow` requires.
                let has = sut.contains_key(hasher.hash(&Key(s.clone())), s.as_str());
                let has_model = model.keys().any(|k| k.0 == s);
                prop_assert_eq!(has, has_model);
            }
            OpI::Iterate => {
                let s_keys: BTreeSet<_> = sut.iter().map(|(_, k, _)| k.clone()).collect();
                let m_keys: BTreeSet<_> = model.keys().cloned().collect();
                prop_assert_eq!(s_keys, m_keys);
            }
        }

        for &id in &stale {
            prop_assert!(sut.value(id).is_none());
        }
        prop_assert_eq!(sut.len(), model.len());
        prop_assert_eq!(sut.is_empty(), model.is_empty());
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_state_machine((pool, ops) in arb_scenario()) {
        run_state_machine(pool, ops, Hashing::Random)?;
    }

    // Same invariants under worst-case collisions, stressing equality probing.
    #[test]
    fn prop_state_machine_with_collisions((pool, ops) in arb_scenario()) {
        run_state_machine(pool, ops, Hashing::Constant)?;
    }
}
