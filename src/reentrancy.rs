//! Debug-only reentrancy guard.
//!
//! Shard locks are not reentrant: a thread that enters a shard while it is
//! already inside that shard (for example from a `K: Eq` or `V: Clone` impl
//! that calls back into the store) would deadlock on the lock. In debug
//! builds each tracker records, per thread, whether it has been entered and
//! panics on nested entry before the lock is touched. In release builds this
//! compiles to a zero-cost no-op.
//!
//! Entering *different* trackers from the same thread is allowed.

use core::marker::PhantomData;

#[cfg(debug_assertions)]
use std::cell::RefCell;
#[cfg(debug_assertions)]
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(debug_assertions)]
static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

#[cfg(debug_assertions)]
thread_local! {
    // Ids of the trackers this thread is currently inside.
    static ENTERED: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Per-instance reentrancy tracker. Embed this next to a lock and guard each
/// acquisition with `let _g = self.reentrancy.enter();`.
#[derive(Debug)]
pub struct DebugReentrancy {
    #[cfg(debug_assertions)]
    id: usize,
}

impl DebugReentrancy {
    pub fn new() -> Self {
        Self {
            #[cfg(debug_assertions)]
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Enter a guarded section. In debug builds, panics if the current thread
    /// is already inside this tracker.
    #[inline]
    pub fn enter(&self) -> ReentrancyGuard<'_> {
        #[cfg(debug_assertions)]
        {
            let id = self.id;
            ENTERED.with(|entered| {
                let mut entered = entered.borrow_mut();
                assert!(
                    !entered.contains(&id),
                    "reentrancy detected: nested entry into a store shard"
                );
                entered.push(id);
            });
            ReentrancyGuard {
                id,
                _owner: PhantomData,
            }
        }

        #[cfg(not(debug_assertions))]
        {
            ReentrancyGuard {
                _owner: PhantomData,
            }
        }
    }
}

impl Default for DebugReentrancy {
    fn default() -> Self {
        Self::new()
    }
}

/// RAII guard returned by `DebugReentrancy::enter`.
pub struct ReentrancyGuard<'a> {
    #[cfg(debug_assertions)]
    id: usize,
    _owner: PhantomData<&'a DebugReentrancy>,
}

impl Drop for ReentrancyGuard<'_> {
    fn drop(&mut self) {
        #[cfg(debug_assertions)]
        {
            let id = self.id;
            // The thread-local may already be torn down during thread exit.
            let _ = ENTERED.try_with(|entered| {
                let mut entered = entered.borrow_mut();
                if let Some(pos) = entered.iter().rposition(|&e| e == id) {
                    entered.swap_remove(pos);
                }
            });
        }
    }
}
