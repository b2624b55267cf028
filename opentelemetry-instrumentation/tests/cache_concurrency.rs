use opentelemetry_instrumentation::cache::{ContextStore, KeyedCache};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

struct Connection {
    #[allow(dead_code)]
    id: usize,
}

#[test]
fn racing_compute_if_absent_computes_once_per_key() {
    let cache: Arc<KeyedCache<Connection, usize>> = Arc::new(KeyedCache::new());
    let keys: Vec<Arc<Connection>> = (0..4).map(|id| Arc::new(Connection { id })).collect();
    let computations = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(Barrier::new(16));

    let handles: Vec<_> = (0..16)
        .map(|i| {
            let cache = Arc::clone(&cache);
            let keys = keys.clone();
            let computations = Arc::clone(&computations);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let key = &keys[i % keys.len()];
                cache
                    .compute_if_absent(key, |_| {
                        computations.fetch_add(1, Ordering::SeqCst);
                        i
                    })
                    .unwrap()
            })
        })
        .collect();
    let results: Vec<Arc<usize>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(computations.load(Ordering::SeqCst), keys.len());
    for (i, value) in results.iter().enumerate() {
        let stored = cache.get(&keys[i % keys.len()]).unwrap();
        assert!(Arc::ptr_eq(value, &stored));
    }
}

#[test]
fn racing_put_if_absent_stores_exactly_one() {
    for _ in 0..32 {
        let store: Arc<ContextStore<Connection, &'static str>> = Arc::new(ContextStore::new());
        let key = Arc::new(Connection { id: 1 });
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = ["v1", "v2"]
            .into_iter()
            .map(|value| {
                let store = Arc::clone(&store);
                let key = Arc::clone(&key);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    store.put_if_absent(&key, value).unwrap()
                })
            })
            .collect();
        let winners: Vec<Arc<&'static str>> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(Arc::ptr_eq(&winners[0], &winners[1]));
        let stored = store.compute_if_absent(&key, |_| "v3").unwrap();
        assert!(Arc::ptr_eq(&stored, &winners[0]));
    }
}

#[test]
fn racing_keyed_put_if_absent_reports_single_winner() {
    let cache: Arc<KeyedCache<Connection, usize>> = Arc::new(KeyedCache::new());
    let key = Arc::new(Connection { id: 2 });
    let barrier = Arc::new(Barrier::new(8));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let cache = Arc::clone(&cache);
            let key = Arc::clone(&key);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache.put_if_absent(&key, i).unwrap()
            })
        })
        .collect();
    let stored: usize = handles
        .into_iter()
        .map(|h| usize::from(h.join().unwrap()))
        .sum();

    assert_eq!(stored, 1);
    assert_eq!(cache.len(), 1);
}

#[test]
fn entries_of_dropped_keys_are_purged() {
    let cache: KeyedCache<Connection, usize> = KeyedCache::new();
    let keys: Vec<_> = (0..100).map(|id| Arc::new(Connection { id })).collect();
    for (i, key) in keys.iter().enumerate() {
        cache.put_if_absent(key, i).unwrap();
    }
    assert_eq!(cache.len(), 100);

    drop(keys);
    cache.clean_up();
    assert!(cache.is_empty());
}
