//! rc-store: a concurrent, sharded map whose entries are reference counted
//! by the handles handed out for them, and removed the moment the last
//! handle is dropped.
//!
//! ```
//! use rc_store::RcStore;
//!
//! let topics: RcStore<String, u32> = RcStore::new();
//! let sub = topics.insert("news".to_string(), 7).unwrap();
//! let other = topics.get("news").expect("present while `sub` lives");
//! assert_eq!(*other, 7);
//! assert_eq!(topics.ref_count("news"), Some(2));
//!
//! drop(sub);
//! drop(other);
//! assert!(topics.get("news").is_none());
//! ```
//!
//! Internal Design:
//!
//! Summary
//! - Goal: build RcStore in layers so each piece can be reasoned about
//!   independently, then shard the result for concurrent use.
//! - Layers:
//!   - IndexedMap<K, V>: structural map returning stable generational
//!     `EntryId`s. Callers pass each key's hash in; the map stores it and
//!     never calls `K: Hash` itself.
//!   - CountedMap<K, V>: wraps IndexedMap and adds an atomic per-entry
//!     reference count. Each unit of count is a linear `Token` that must be
//!     returned (or abandoned once the map is gone).
//!   - RcStore<K, V, S>: `N` shards, each a `parking_lot::RwLock` around a
//!     CountedMap, behind one `Arc`. Public API hands out `Handle`s; each
//!     handle owns one token, a copy of the key and value, and a `Weak`
//!     back-link to the shards.
//!
//! Locking
//! - `get` holds the key's shard lock shared and bumps the atomic count.
//! - Dropping a handle first tries to decrement under the shared lock; this
//!   only succeeds when another handle keeps the count at one or more. The
//!   last handle takes the lock exclusively, decrements to zero and unlinks
//!   the entry in the same critical section, so no reader ever sees a zero
//!   count.
//! - `insert` holds the shard lock exclusively.
//! - Different shards never contend. No operation holds two shard locks, and
//!   no lock outlives the call that took it; handles hold no guards.
//!
//! Reentrancy
//! - User code that runs under a shard lock: `K: Eq` while probing,
//!   `K: Clone`/`V: Clone` when a handle is built, and the constructor given
//!   to `insert_with`/`get_or_insert_with`. It must not call back into the
//!   same shard. Debug builds detect this per thread and panic instead of
//!   deadlocking.
//! - Removed keys and values are dropped after the lock is released, so their
//!   destructors may drop handles into the same store (cascading removal).
//!
//! Lifetimes
//! - `RcStore` is a cheap `Arc` clone; clones share the entries.
//! - Handles never keep the store alive. When the last `RcStore` goes, all
//!   entries are dropped with it; handles that outlive it keep their copied
//!   key and value, and dropping them is a no-op.
//!
//! Overflow semantics
//! - Like `Arc`, the process aborts if an entry's count would exceed
//!   `isize::MAX`.
//!
//! Notes and non-goals
//! - No in-place mutation of stored values: handles carry snapshots.
//! - No explicit `remove()`/`clear()`; removal occurs when the last handle is
//!   dropped, to preserve refcount semantics.
//! - `len()`/`is_empty()` visit shards one at a time and are not atomic
//!   snapshots under concurrent use.

mod config;
mod counted_map;
mod error;
mod indexed_map;
mod indexed_map_proptest;
mod reentrancy;
mod store;
mod tokens;

// Public surface
pub use config::{ConfigError, StoreConfig};
pub use error::InsertError;
pub use reentrancy::{DebugReentrancy, ReentrancyGuard};
pub use store::{Handle, RcStore};

#[cfg(feature = "bench_internal")]
pub use indexed_map::{Duplicate, EntryId, IndexedMap};
