use crate::store::Handle;
use core::fmt;

/// Error returned by `RcStore::insert` and `RcStore::insert_with`.
///
/// Not exceptional: a concurrent writer may have created the entry first.
/// The payload is a counted handle to the entry that is already present, so
/// the caller can carry on without a second lookup.
pub enum InsertError<K, V, S = std::collections::hash_map::RandomState>
where
    K: Eq,
{
    AlreadyExists(Handle<K, V, S>),
}

impl<K, V, S> InsertError<K, V, S>
where
    K: Eq,
{
    /// The handle to the existing entry.
    pub fn into_handle(self) -> Handle<K, V, S> {
        match self {
            InsertError::AlreadyExists(h) => h,
        }
    }

    pub fn handle(&self) -> &Handle<K, V, S> {
        match self {
            InsertError::AlreadyExists(h) => h,
        }
    }
}

impl<K, V, S> fmt::Debug for InsertError<K, V, S>
where
    K: Eq + fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsertError::AlreadyExists(h) => f.debug_tuple("AlreadyExists").field(h).finish(),
        }
    }
}

impl<K, V, S> fmt::Display for InsertError<K, V, S>
where
    K: Eq,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InsertError::AlreadyExists(_) => f.write_str("key already exists in the store"),
        }
    }
}

impl<K, V, S> std::error::Error for InsertError<K, V, S>
where
    K: Eq + fmt::Debug,
    V: fmt::Debug,
{
}
