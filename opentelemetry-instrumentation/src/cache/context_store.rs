use crate::cache::{CacheBuilder, KeyedCache};
use crate::error::CacheError;
use std::fmt;
use std::sync::Arc;

/// Instrumentation state attached to objects of type `K`.
///
/// A context store is the side table an instrumentation uses to carry state
/// from one call on a foreign object to a later one, e.g. from the call that
/// opened a session to the call that closes it. Keys are always weak: the
/// state of an object lives exactly as long as the object.
///
/// ```
/// use opentelemetry_instrumentation::cache::ContextStore;
/// use std::sync::Arc;
///
/// struct Connection;
/// struct ConnectionState { queries: usize }
///
/// let store: ContextStore<Connection, ConnectionState> = ContextStore::new();
/// let connection = Arc::new(Connection);
///
/// store.put(&connection, ConnectionState { queries: 0 });
/// assert_eq!(store.get(&connection).map(|s| s.queries), Some(0));
///
/// drop(connection);
/// assert!(store.is_empty());
/// ```
pub struct ContextStore<K: ?Sized, V> {
    cache: KeyedCache<K, V>,
}

impl<K, V> ContextStore<K, V>
where
    K: ?Sized + Send + Sync,
    V: Send + Sync,
{
    /// Create an empty store.
    pub fn new() -> Self {
        ContextStore {
            cache: CacheBuilder::new().weak_keys().build(),
        }
    }

    /// The state attached to `key`.
    pub fn get(&self, key: &Arc<K>) -> Option<Arc<V>> {
        self.cache.get(key)
    }

    /// Attaches `value` to `key`, replacing any previous state. Returns
    /// `false`, dropping `value`, while state for `key` is being computed.
    pub fn put(&self, key: &Arc<K>, value: V) -> bool {
        self.cache.insert(key, value)
    }

    /// Attaches `value` to `key` unless state is already attached, and
    /// returns the attached state.
    pub fn put_if_absent(&self, key: &Arc<K>, value: V) -> Result<Arc<V>, CacheError> {
        self.cache.compute_if_absent(key, move |_| value)
    }

    /// Returns the state attached to `key`, attaching the result of
    /// `compute` first if none is.
    pub fn compute_if_absent<F>(&self, key: &Arc<K>, compute: F) -> Result<Arc<V>, CacheError>
    where
        F: FnOnce(&K) -> V,
    {
        self.cache.compute_if_absent(key, compute)
    }

    /// Detaches and returns the state of `key`.
    pub fn remove(&self, key: &Arc<K>) -> Option<Arc<V>> {
        self.cache.remove(key)
    }

    /// Number of live objects with attached state.
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    /// Returns `true` if no live object has attached state.
    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// Drops the entries of objects that no longer exist.
    pub fn clean_up(&self) {
        self.cache.clean_up()
    }
}

impl<K, V> Default for ContextStore<K, V>
where
    K: ?Sized + Send + Sync,
    V: Send + Sync,
{
    fn default() -> Self {
        ContextStore::new()
    }
}

impl<K: ?Sized, V> fmt::Debug for ContextStore<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextStore")
            .field("cache", &self.cache)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Session;

    #[test]
    fn put_if_absent_returns_winner() {
        let store = ContextStore::<Session, &'static str>::new();
        let session = Arc::new(Session);

        assert_eq!(*store.put_if_absent(&session, "first").unwrap(), "first");
        assert_eq!(*store.put_if_absent(&session, "second").unwrap(), "first");
        assert_eq!(*store.compute_if_absent(&session, |_| "third").unwrap(), "first");
    }

    #[test]
    fn put_replaces_and_remove_detaches() {
        let store = ContextStore::<Session, u32>::new();
        let session = Arc::new(Session);

        assert!(store.put(&session, 1));
        assert!(store.put(&session, 2));
        assert_eq!(store.get(&session).as_deref(), Some(&2));
        assert_eq!(store.remove(&session).as_deref(), Some(&2));
        assert!(store.get(&session).is_none());
        assert!(store.remove(&session).is_none());
    }

    #[test]
    fn state_dies_with_key() {
        let store = ContextStore::<Session, u32>::new();
        let session = Arc::new(Session);
        let state = store.put_if_absent(&session, 7).unwrap();

        drop(session);
        assert!(store.is_empty());
        store.clean_up();
        assert_eq!(*state, 7);
    }
}
