//! Linear tokens and counting traits.
//!
//! Tokens are zero-sized proofs that a unit was acquired from a counter of
//! a given type. Dropping a token panics; the only valid ways to dispose of
//! it are returning it to the originating counter via `Count::put` (or
//! `AtomicCount::put_unless_last`), or `Token::abandon` once that counter no
//! longer exists.

use core::marker::PhantomData;
use std::sync::atomic::{fence, AtomicUsize, Ordering};

/// Zero-sized, linear token branded by its counter type.
pub struct Token<C> {
    // `fn() -> C` keeps the token `Send + Sync` whatever `C` is.
    _ctr: PhantomData<fn() -> C>,
}

impl<C> Token<C> {
    #[inline]
    pub(crate) fn new() -> Self {
        Self { _ctr: PhantomData }
    }

    /// Discard a token whose counter has been destroyed.
    ///
    /// The unit it stood for went away together with the counter, so there
    /// is nothing to return it to.
    #[inline]
    pub fn abandon(self) {
        core::mem::forget(self);
    }
}

impl<C> core::fmt::Debug for Token<C> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("Token")
    }
}

impl<C> Drop for Token<C> {
    fn drop(&mut self) {
        // Fail fast on misuse, but never turn an unwind into an abort.
        if !std::thread::panicking() {
            panic!("Token dropped without Count::put");
        }
    }
}

/// A source of counted references, enforced by linear Token flow.
pub trait Count {
    /// The token type minted by this counter.
    type Token: Sized;

    /// Acquire one counted reference and return a linear token for it.
    fn get(&self) -> Self::Token;

    /// Return (consume) a previously acquired token.
    /// Returns true if the count is now zero.
    fn put(&self, t: Self::Token) -> bool;
}

/// Thread-safe per-entry reference counter.
///
/// Increments may race freely with each other. Callers serialize the final
/// decrement (the one that reaches zero) against increments externally; see
/// `put_unless_last` for the decrement that is safe to run concurrently.
#[derive(Debug)]
pub struct AtomicCount {
    count: AtomicUsize,
}

// Same limit as `Arc`: past this we cannot trust the count any more.
const MAX_COUNT: usize = isize::MAX as usize;

impl AtomicCount {
    pub fn new(initial: usize) -> Self {
        Self {
            count: AtomicUsize::new(initial),
        }
    }

    /// Current number of outstanding tokens.
    #[inline]
    pub fn load(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Return a token only if it is not the last one outstanding.
    ///
    /// On `Err` the token is handed back untouched and the count is unchanged;
    /// the caller must then return it with `Count::put` while holding whatever
    /// exclusion protects removal at zero.
    #[inline]
    pub fn put_unless_last(&self, t: Token<Self>) -> Result<(), Token<Self>> {
        let mut c = self.count.load(Ordering::Relaxed);
        loop {
            assert!(c > 0, "AtomicCount underflow");
            if c == 1 {
                return Err(t);
            }
            match self
                .count
                .compare_exchange_weak(c, c - 1, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => {
                    core::mem::forget(t);
                    return Ok(());
                }
                Err(actual) => c = actual,
            }
        }
    }
}

impl Count for AtomicCount {
    type Token = Token<Self>;

    #[inline]
    fn get(&self) -> Self::Token {
        let prev = self.count.fetch_add(1, Ordering::Relaxed);
        if prev >= MAX_COUNT {
            // Follow Arc semantics: abort on overflow rather than continue unsafely.
            std::process::abort();
        }
        Token::new()
    }

    #[inline]
    fn put(&self, t: Self::Token) -> bool {
        let prev = self.count.fetch_sub(1, Ordering::Release);
        assert!(prev > 0, "AtomicCount underflow");
        core::mem::forget(t);
        if prev == 1 {
            fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }
}
