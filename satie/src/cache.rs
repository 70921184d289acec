// src/cache.rs
//
// Reference-counted TTL cache shared by all workers. Lookups take the
// shared lock; the miss path takes the exclusive lock only if that does
// not block, so request latency stays bounded while another worker is
// building an entry. The caller's reference is the Arc itself: cloning on
// lookup is the ref, dropping is the unref, and an entry evicted from the
// map survives until the last outstanding reference is gone.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Why a lookup produced no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMiss {
    /// The create collaborator declined to build an entry.
    Absent,
    /// A writer holds the exclusive lock; the caller should fall back to a
    /// floating entry instead of blocking.
    WouldBlock,
}

pub struct Entry<T> {
    pub value: T,
    deadline: Instant,
    floating: bool,
}

impl<T> Entry<T> {
    pub fn is_floating(&self) -> bool {
        self.floating
    }

    fn is_fresh(&self, now: Instant) -> bool {
        self.deadline > now
    }
}

#[derive(Default)]
pub struct CacheStats {
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub evictions: AtomicU64,
}

pub struct Cache<T> {
    map: RwLock<HashMap<String, Arc<Entry<T>>>>,
    ttl: Duration,
    stats: CacheStats,
}

impl<T> Cache<T> {
    pub fn new(ttl_secs: u64) -> Self {
        Self {
            map: RwLock::new(HashMap::new()),
            ttl: Duration::from_secs(ttl_secs),
            stats: CacheStats::default(),
        }
    }

    /// Look up `key`, building and inserting it via `create` on a miss.
    ///
    /// Fresh hit: returns a new reference under the shared lock.
    /// Miss/expired: takes the exclusive lock without blocking (WouldBlock
    /// otherwise), re-checks for a racing writer's insert, then calls
    /// `create` and inserts with `deadline = now + ttl`. Expired entries
    /// found on the way are removed from the map; outstanding references
    /// keep them alive until dropped.
    pub fn get_and_ref(
        &self,
        key: &str,
        create: impl FnOnce() -> Option<T>,
    ) -> Result<Arc<Entry<T>>, CacheMiss> {
        let now = Instant::now();

        // If the cache is locked by a writer, don't wait for it to be
        // unlocked: the caller falls back to a floating entry.
        {
            let map = match self.map.try_read() {
                Some(guard) => guard,
                None => return Err(CacheMiss::WouldBlock),
            };
            if let Some(entry) = map.get(key) {
                if entry.is_fresh(now) {
                    self.stats.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.clone());
                }
            }
        }

        let mut map = match self.map.try_write() {
            Some(guard) => guard,
            None => return Err(CacheMiss::WouldBlock),
        };

        // Another writer may have raced us here; re-check before creating.
        if let Some(entry) = map.get(key) {
            if entry.is_fresh(now) {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry.clone());
            }
            map.remove(key);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        match create() {
            Some(value) => {
                let entry = Arc::new(Entry {
                    value,
                    deadline: now + self.ttl,
                    floating: false,
                });
                map.insert(key.to_string(), entry.clone());
                Ok(entry)
            }
            None => Err(CacheMiss::Absent),
        }
    }

    /// Wrap a value built outside the map. Floating entries are owned
    /// solely by their references and are never visible to other lookups.
    pub fn floating(value: T) -> Arc<Entry<T>> {
        Arc::new(Entry {
            value,
            deadline: Instant::now(),
            floating: true,
        })
    }

    /// Drop every cached entry. References still held elsewhere drain
    /// naturally; the map itself is empty on return.
    pub fn clear(&self) {
        let mut map = self.map.write();
        self.stats
            .evictions
            .fetch_add(map.len() as u64, Ordering::Relaxed);
        map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }

    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.stats.hits.load(Ordering::Relaxed),
            self.stats.misses.load(Ordering::Relaxed),
            self.stats.evictions.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_hit_returns_same_entry() {
        let cache: Cache<u32> = Cache::new(60);
        let a = cache.get_and_ref("k", || Some(7)).unwrap();
        let b = cache.get_and_ref("k", || panic!("must not rebuild")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.value, 7);
        let (hits, misses, _) = cache.stats();
        assert_eq!((hits, misses), (1, 1));
    }

    #[test]
    fn test_create_failure_is_absent() {
        let cache: Cache<u32> = Cache::new(60);
        assert!(matches!(
            cache.get_and_ref("k", || None),
            Err(CacheMiss::Absent)
        ));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_reference_outlives_eviction() {
        let cache: Cache<u32> = Cache::new(0); // everything expires immediately
        let held = cache.get_and_ref("k", || Some(1)).unwrap();
        // Expired on the next lookup: evicted from the map and recreated,
        // while the held reference stays valid.
        let fresh = cache.get_and_ref("k", || Some(2)).unwrap();
        assert_eq!(held.value, 1);
        assert_eq!(fresh.value, 2);
        assert!(!Arc::ptr_eq(&held, &fresh));
        let (_, _, evictions) = cache.stats();
        assert_eq!(evictions, 1);
    }

    #[test]
    fn test_refcount_pairs_with_drop() {
        let cache: Cache<u32> = Cache::new(60);
        let a = cache.get_and_ref("k", || Some(1)).unwrap();
        let b = cache.get_and_ref("k", || Some(1)).unwrap();
        // map + two callers
        assert_eq!(Arc::strong_count(&a), 3);
        drop(b);
        assert_eq!(Arc::strong_count(&a), 2);
        cache.clear();
        assert_eq!(Arc::strong_count(&a), 1);
    }

    #[test]
    fn test_would_block_while_writer_holds_lock() {
        let cache: Cache<u32> = Cache::new(60);
        let _guard = cache.map.write();
        assert!(matches!(
            cache.get_and_ref("k", || Some(1)),
            Err(CacheMiss::WouldBlock)
        ));
    }

    #[test]
    fn test_floating_entries_stay_out_of_the_map() {
        let cache: Cache<u32> = Cache::new(60);
        let f = Cache::floating(9);
        assert!(f.is_floating());
        assert_eq!(cache.len(), 0);
        assert_eq!(Arc::strong_count(&f), 1);
    }

    #[test]
    fn test_single_creation_under_contention() {
        let cache: Arc<Cache<u32>> = Arc::new(Cache::new(60));
        let created = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let created = created.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    match cache.get_and_ref("hot", || {
                        created.fetch_add(1, Ordering::SeqCst);
                        Some(42)
                    }) {
                        Ok(e) => assert_eq!(e.value, 42),
                        Err(CacheMiss::WouldBlock) => {}
                        Err(CacheMiss::Absent) => panic!("create never declines"),
                    }
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        // Exactly one create call is retained; the double-check under the
        // exclusive lock prevents every other builder from running at all.
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }
}
