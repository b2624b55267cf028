//! Side tables keyed by object identity.
//!
//! A [`KeyedCache`] attaches a value to an object owned by someone else,
//! typically a client or session handle handed out by an instrumented
//! library, without requiring anything from the object's type. Keys are
//! `Arc`s compared by pointer identity, never by value: two equal but
//! distinct objects have distinct entries.
//!
//! Entries are stored in a sharded map so that operations on different keys
//! never contend on one lock. The value of a key is computed at most once;
//! racing callers block until the winner publishes and then observe the
//! same `Arc<V>`.
//!
//! With weak keys (the default) an entry does not keep its key alive and is
//! treated as absent once the key is dropped. The stored [`Weak`] keeps the
//! key's allocation reserved, so a new object can never be allocated at the
//! address of a key that still has an entry.
use crate::error::CacheError;
use crate::otel_debug;
use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

mod context_store;

pub use context_store::ContextStore;

/// Builder for [`KeyedCache`].
///
/// ```
/// use opentelemetry_instrumentation::cache::CacheBuilder;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let cache = CacheBuilder::new()
///     .maximum_size(1024)
///     .expire_after_write(Duration::from_secs(60))
///     .build::<String, usize>();
///
/// let key = Arc::new("users".to_string());
/// let len = cache.compute_if_absent(&key, |k| k.len()).unwrap();
/// assert_eq!(*len, 5);
/// ```
#[derive(Clone, Debug, Default)]
pub struct CacheBuilder {
    strong_keys: bool,
    maximum_size: Option<usize>,
    expire_after_write: Option<Duration>,
}

impl CacheBuilder {
    /// Create a builder with weak keys and no size or time bound.
    pub fn new() -> Self {
        CacheBuilder::default()
    }

    /// Entries die with their key. This is the default.
    pub fn weak_keys(mut self) -> Self {
        self.strong_keys = false;
        self
    }

    /// Entries keep their key alive until evicted or invalidated.
    pub fn strong_keys(mut self) -> Self {
        self.strong_keys = true;
        self
    }

    /// Bounds the number of entries. Inserting past the bound first purges
    /// entries whose key was dropped or whose value expired, then evicts
    /// the entry written longest ago.
    pub fn maximum_size(mut self, maximum_size: usize) -> Self {
        self.maximum_size = Some(maximum_size);
        self
    }

    /// Entries are treated as absent once `duration` elapsed since their
    /// value was written.
    pub fn expire_after_write(mut self, duration: Duration) -> Self {
        self.expire_after_write = Some(duration);
        self
    }

    /// Build the cache.
    pub fn build<K, V>(self) -> KeyedCache<K, V>
    where
        K: ?Sized + Send + Sync,
        V: Send + Sync,
    {
        KeyedCache {
            map: DashMap::new(),
            strong_keys: self.strong_keys,
            maximum_size: self.maximum_size,
            expire_after_write: self.expire_after_write,
        }
    }
}

/// A concurrent map from `Arc<K>` identity to `Arc<V>`.
pub struct KeyedCache<K: ?Sized, V> {
    map: DashMap<usize, Entry<K, V>>,
    strong_keys: bool,
    maximum_size: Option<usize>,
    expire_after_write: Option<Duration>,
}

struct Entry<K: ?Sized, V> {
    key: KeyRef<K>,
    slot: Arc<Slot<V>>,
}

enum KeyRef<K: ?Sized> {
    Weak(Weak<K>),
    Strong(Arc<K>),
}

impl<K: ?Sized> KeyRef<K> {
    fn is_live(&self) -> bool {
        match self {
            KeyRef::Weak(weak) => weak.strong_count() > 0,
            KeyRef::Strong(_) => true,
        }
    }
}

struct Slot<V> {
    value: OnceCell<Stored<V>>,
    initializer: Mutex<Option<ThreadId>>,
    /// Callers holding the slot between lookup and the end of their write.
    claims: AtomicUsize,
}

struct Stored<V> {
    value: Arc<V>,
    written_at: Instant,
}

impl<V> Slot<V> {
    fn empty() -> Self {
        Slot {
            value: OnceCell::new(),
            initializer: Mutex::new(None),
            claims: AtomicUsize::new(0),
        }
    }

    fn filled(value: V) -> Self {
        Slot {
            value: OnceCell::with_value(Stored {
                value: Arc::new(value),
                written_at: Instant::now(),
            }),
            initializer: Mutex::new(None),
            claims: AtomicUsize::new(0),
        }
    }

    fn initializer(&self) -> MutexGuard<'_, Option<ThreadId>> {
        self.initializer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Empty and claimed by a caller about to write it.
    fn is_in_flight(&self) -> bool {
        self.value.get().is_none() && self.claims.load(Ordering::Acquire) > 0
    }

    fn is_expired(&self, ttl: Option<Duration>, now: Instant) -> bool {
        match (self.value.get(), ttl) {
            (Some(stored), Some(ttl)) => now.saturating_duration_since(stored.written_at) >= ttl,
            _ => false,
        }
    }

    /// Fails when the calling thread is the one computing this slot.
    fn check_reentrant(&self) -> Result<(), CacheError> {
        if self.value.get().is_none() && *self.initializer() == Some(thread::current().id()) {
            otel_debug!(name: "KeyedCache.Reentrant");
            return Err(CacheError::Reentrant);
        }
        Ok(())
    }
}

/// A caller's hold on a slot. Taken while the shard entry is locked and
/// released on drop, so the slot reads as in flight for the whole window
/// between lookup and the write.
struct Claim<V> {
    slot: Arc<Slot<V>>,
}

impl<V> Claim<V> {
    fn new(slot: &Arc<Slot<V>>) -> Self {
        slot.claims.fetch_add(1, Ordering::AcqRel);
        Claim {
            slot: Arc::clone(slot),
        }
    }
}

impl<V> Deref for Claim<V> {
    type Target = Slot<V>;

    fn deref(&self) -> &Slot<V> {
        &self.slot
    }
}

impl<V> Drop for Claim<V> {
    fn drop(&mut self) {
        self.slot.claims.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Marks the current thread as the initializer of a slot until dropped,
/// including when the computation unwinds.
struct InFlight<'a, V> {
    slot: &'a Slot<V>,
}

impl<'a, V> InFlight<'a, V> {
    fn enter(slot: &'a Slot<V>) -> Self {
        *slot.initializer() = Some(thread::current().id());
        InFlight { slot }
    }
}

impl<V> Drop for InFlight<'_, V> {
    fn drop(&mut self) {
        *self.slot.initializer() = None;
    }
}

fn address<K: ?Sized>(key: &Arc<K>) -> usize {
    Arc::as_ptr(key) as *const () as usize
}

impl<K, V> KeyedCache<K, V>
where
    K: ?Sized + Send + Sync,
    V: Send + Sync,
{
    /// Create a cache with weak keys and no bounds.
    pub fn new() -> Self {
        CacheBuilder::new().build()
    }

    /// Create a [`CacheBuilder`].
    pub fn builder() -> CacheBuilder {
        CacheBuilder::new()
    }

    /// Returns the value of `key`, computing it with `compute` if absent.
    ///
    /// `compute` runs at most once per key even when several threads ask
    /// concurrently; the others block until it returns and then share its
    /// value. If `compute` asks this cache for the same key on the same
    /// thread, the inner call fails with [`CacheError::Reentrant`]. If
    /// `compute` panics the panic propagates and the key stays absent.
    pub fn compute_if_absent<F>(&self, key: &Arc<K>, compute: F) -> Result<Arc<V>, CacheError>
    where
        F: FnOnce(&K) -> V,
    {
        let (slot, inserted) = self.slot_for(key);
        if let Some(stored) = slot.value.get() {
            return Ok(Arc::clone(&stored.value));
        }
        slot.check_reentrant()?;

        let stored = slot.value.get_or_init(|| {
            let _in_flight = InFlight::enter(&slot);
            Stored {
                value: Arc::new(compute(key)),
                written_at: Instant::now(),
            }
        });
        let value = Arc::clone(&stored.value);
        if inserted {
            self.enforce_maximum_size();
        }
        Ok(value)
    }

    /// Stores `value` for `key` unless a value is present or being
    /// computed. Returns whether `value` was stored.
    ///
    /// Blocks while another thread computes the value of `key`.
    pub fn put_if_absent(&self, key: &Arc<K>, value: V) -> Result<bool, CacheError> {
        let (slot, inserted) = self.slot_for(key);
        if slot.value.get().is_some() {
            return Ok(false);
        }
        slot.check_reentrant()?;

        let stored = slot
            .value
            .set(Stored {
                value: Arc::new(value),
                written_at: Instant::now(),
            })
            .is_ok();
        if inserted {
            self.enforce_maximum_size();
        }
        Ok(stored)
    }

    /// Stores `value` for `key`, replacing any present value. Returns
    /// whether `value` was stored.
    ///
    /// A key whose value is being computed keeps the computed value and
    /// `value` is dropped.
    pub fn insert(&self, key: &Arc<K>, value: V) -> bool {
        let entry = Entry {
            key: self.key_ref(key),
            slot: Arc::new(Slot::filled(value)),
        };
        let added = match self.map.entry(address(key)) {
            MapEntry::Occupied(mut occupied) => {
                if occupied.get().slot.is_in_flight() {
                    otel_debug!(name: "KeyedCache.InsertSkipped");
                    return false;
                }
                occupied.insert(entry);
                false
            }
            MapEntry::Vacant(vacant) => {
                vacant.insert(entry);
                true
            }
        };
        if added {
            self.enforce_maximum_size();
        }
        true
    }

    /// The value of `key`, if present.
    pub fn get(&self, key: &Arc<K>) -> Option<Arc<V>> {
        let entry = self.map.get(&address(key))?;
        if !entry.key.is_live() || entry.slot.is_expired(self.expire_after_write, Instant::now()) {
            return None;
        }
        entry.slot.value.get().map(|stored| Arc::clone(&stored.value))
    }

    /// Removes the value of `key` and returns it.
    ///
    /// A key whose value is being computed is left in place and `None` is
    /// returned.
    pub fn remove(&self, key: &Arc<K>) -> Option<Arc<V>> {
        let (_, entry) = self
            .map
            .remove_if(&address(key), |_, entry| !entry.slot.is_in_flight())?;
        if !entry.key.is_live() {
            return None;
        }
        entry.slot.value.get().map(|stored| Arc::clone(&stored.value))
    }

    /// Removes the value of `key`. Returns whether a value was removed.
    ///
    /// A key whose value is being computed is left in place.
    pub fn invalidate(&self, key: &Arc<K>) -> bool {
        self.remove(key).is_some()
    }

    /// Removes every entry whose value is not being computed.
    pub fn invalidate_all(&self) {
        self.map.retain(|_, entry| entry.slot.is_in_flight());
    }

    /// Number of live entries holding a value.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.map
            .iter()
            .filter(|entry| {
                entry.key.is_live()
                    && entry.slot.value.get().is_some()
                    && !entry.slot.is_expired(self.expire_after_write, now)
            })
            .count()
    }

    /// Returns `true` if no live entry holds a value.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Purges entries whose key was dropped, whose value expired, or whose
    /// computation panicked. Keys being computed are kept.
    pub fn clean_up(&self) {
        let now = Instant::now();
        let ttl = self.expire_after_write;
        self.map.retain(|_, entry| {
            entry.slot.is_in_flight()
                || (entry.key.is_live()
                    && entry.slot.value.get().is_some()
                    && !entry.slot.is_expired(ttl, now))
        });
    }

    fn key_ref(&self, key: &Arc<K>) -> KeyRef<K> {
        if self.strong_keys {
            KeyRef::Strong(Arc::clone(key))
        } else {
            KeyRef::Weak(Arc::downgrade(key))
        }
    }

    /// Claims the slot of `key`, creating one when the key has none or its
    /// entry is dead or expired. The claim is taken under the map's shard
    /// lock, which is released on return, so computations never run under
    /// it.
    fn slot_for(&self, key: &Arc<K>) -> (Claim<V>, bool) {
        let now = Instant::now();
        match self.map.entry(address(key)) {
            MapEntry::Occupied(mut occupied) => {
                let entry = occupied.get();
                if entry.key.is_live() && !entry.slot.is_expired(self.expire_after_write, now) {
                    return (Claim::new(&entry.slot), false);
                }
                let slot = Arc::new(Slot::empty());
                let claim = Claim::new(&slot);
                occupied.insert(Entry {
                    key: self.key_ref(key),
                    slot,
                });
                (claim, false)
            }
            MapEntry::Vacant(vacant) => {
                let slot = Arc::new(Slot::empty());
                let claim = Claim::new(&slot);
                vacant.insert(Entry {
                    key: self.key_ref(key),
                    slot,
                });
                (claim, true)
            }
        }
    }

    fn enforce_maximum_size(&self) {
        let Some(maximum_size) = self.maximum_size else {
            return;
        };
        if self.map.len() <= maximum_size {
            return;
        }
        // Dead and expired entries go before any live one is evicted.
        self.clean_up();
        while self.map.len() > maximum_size {
            let oldest = self
                .map
                .iter()
                .filter_map(|entry| {
                    entry
                        .slot
                        .value
                        .get()
                        .map(|stored| (*entry.key(), stored.written_at, Arc::clone(&entry.slot)))
                })
                .min_by_key(|(_, written_at, _)| *written_at);
            let Some((address, _, slot)) = oldest else {
                return;
            };
            self.map
                .remove_if(&address, |_, entry| Arc::ptr_eq(&entry.slot, &slot));
            otel_debug!(name: "KeyedCache.Evicted");
        }
    }
}

impl<K, V> Default for KeyedCache<K, V>
where
    K: ?Sized + Send + Sync,
    V: Send + Sync,
{
    fn default() -> Self {
        KeyedCache::new()
    }
}

impl<K: ?Sized, V> fmt::Debug for KeyedCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyedCache")
            .field("entries", &self.map.len())
            .field("strong_keys", &self.strong_keys)
            .field("maximum_size", &self.maximum_size)
            .field("expire_after_write", &self.expire_after_write)
            .finish()
    }
}
