//! Key/value store with per-entry TTL.
//!
//! Eviction is both lazy (reads treat entries past their deadline as absent)
//! and deferred (each `put` schedules one removal task on the current tokio
//! runtime). Every write carries a fresh generation; a deferred removal only
//! deletes the entry it was scheduled for, never a later replacement.

use dashmap::DashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::Instant;

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    generation: u64,
    eviction: Option<AbortHandle>,
}

impl<V> CacheEntry<V> {
    fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    fn cancel_eviction(&self) {
        if let Some(handle) = self.eviction.as_ref() {
            handle.abort();
        }
    }
}

struct CacheInner<K, V> {
    entries: DashMap<K, CacheEntry<V>>,
    generation: AtomicU64,
}

pub struct ExpiringCache<K, V> {
    inner: Arc<CacheInner<K, V>>,
}

impl<K, V> Clone for ExpiringCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> Default for ExpiringCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> ExpiringCache<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: DashMap::new(),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Store `value` under `key` until `ttl` elapses, replacing any previous
    /// entry and cancelling its pending removal.
    pub fn put(&self, key: K, value: V, ttl: Duration) {
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed) + 1;
        let expires_at = Instant::now() + ttl;
        let eviction = schedule_eviction(
            Arc::downgrade(&self.inner),
            key.clone(),
            generation,
            expires_at,
        );
        let previous = self.inner.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at,
                generation,
                eviction,
            },
        );
        if let Some(previous) = previous {
            previous.cancel_eviction();
        }
    }

    /// Current value, without extending its lifetime.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        {
            let entry = self.inner.entries.get(key)?;
            if !entry.is_expired_at(now) {
                return Some(entry.value.clone());
            }
        }
        self.evict_if_expired(key, now);
        None
    }

    #[cfg(test)]
    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Remove immediately. Deleting an absent key is a no-op.
    pub fn delete(&self, key: &K) -> bool {
        match self.inner.entries.remove(key) {
            Some((_, entry)) => {
                entry.cancel_eviction();
                !entry.is_expired_at(Instant::now())
            }
            None => false,
        }
    }

    /// Remove and return the live value, if any.
    pub fn take(&self, key: &K) -> Option<V> {
        let (_, entry) = self.inner.entries.remove(key)?;
        entry.cancel_eviction();
        if entry.is_expired_at(Instant::now()) {
            return None;
        }
        Some(entry.value)
    }

    /// Mutate a live entry in place. The deadline is left untouched.
    pub fn update(&self, key: &K, f: impl FnOnce(&mut V)) -> bool {
        let now = Instant::now();
        {
            let Some(mut entry) = self.inner.entries.get_mut(key) else {
                return false;
            };
            if !entry.is_expired_at(now) {
                f(&mut entry.value);
                return true;
            }
        }
        self.evict_if_expired(key, now);
        false
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.inner
            .entries
            .iter()
            .filter(|entry| !entry.is_expired_at(now))
            .count()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub fn clear(&self) {
        for entry in self.inner.entries.iter() {
            entry.cancel_eviction();
        }
        self.inner.entries.clear();
    }

    fn evict_if_expired(&self, key: &K, now: Instant) {
        self.inner
            .entries
            .remove_if(key, |_, entry| entry.is_expired_at(now));
    }
}

fn schedule_eviction<K, V>(
    inner: Weak<CacheInner<K, V>>,
    key: K,
    generation: u64,
    expires_at: Instant,
) -> Option<AbortHandle>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    // Outside a runtime only lazy eviction applies.
    let handle = tokio::runtime::Handle::try_current().ok()?;
    let task = handle.spawn(async move {
        tokio::time::sleep_until(expires_at).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        inner
            .entries
            .remove_if(&key, |_, entry| entry.generation == generation);
    });
    Some(task.abort_handle())
}

#[cfg(test)]
mod tests {
    use super::*;

    const THIRTY_MINUTES: Duration = Duration::from_secs(30 * 60);

    fn raw_len<K: Eq + Hash, V>(cache: &ExpiringCache<K, V>) -> usize {
        cache.inner.entries.len()
    }

    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn one_millisecond_ttl_expires_on_deadline() {
        let cache = ExpiringCache::new();
        cache.put("k", 1, Duration::from_millis(1));
        assert_eq!(cache.get(&"k"), Some(1));

        tokio::time::advance(Duration::from_micros(999)).await;
        assert_eq!(cache.get(&"k"), Some(1), "still live strictly before ttl");

        tokio::time::advance(Duration::from_micros(1)).await;
        assert_eq!(cache.get(&"k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn thirty_minute_ttl_expires_on_deadline() {
        let cache = ExpiringCache::new();
        cache.put("k", "transcript".to_string(), THIRTY_MINUTES);

        tokio::time::advance(THIRTY_MINUTES - Duration::from_millis(1)).await;
        assert_eq!(cache.get(&"k").as_deref(), Some("transcript"));

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cache.get(&"k"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_removal_drops_expired_entry_without_reads() {
        let cache = ExpiringCache::new();
        cache.put("k", 1, Duration::from_millis(5));
        assert_eq!(raw_len(&cache), 1);

        tokio::time::advance(Duration::from_millis(6)).await;
        settle().await;
        assert_eq!(raw_len(&cache), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn replacement_survives_original_timer() {
        let cache = ExpiringCache::new();
        cache.put("k", "old", Duration::from_millis(10));
        tokio::time::advance(Duration::from_millis(5)).await;
        cache.put("k", "new", THIRTY_MINUTES);

        tokio::time::advance(Duration::from_millis(20)).await;
        settle().await;
        assert_eq!(cache.get(&"k"), Some("new"));
        assert_eq!(raw_len(&cache), 1);
    }

    fn generation_of<K: Eq + Hash, V>(cache: &ExpiringCache<K, V>, key: &K) -> u64 {
        cache.inner.entries.get(key).map(|e| e.generation).expect("entry")
    }

    #[tokio::test(start_paused = true)]
    async fn deferred_removal_is_anchored_at_put_time() {
        let cache = ExpiringCache::new();
        cache.put("k", 1, Duration::from_millis(5));
        // The eviction task is not polled until after the clock has moved.
        tokio::time::advance(Duration::from_millis(5)).await;
        settle().await;
        assert_eq!(raw_len(&cache), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_ignores_entry_with_newer_generation() {
        let cache: ExpiringCache<&str, &str> = ExpiringCache::new();
        cache.put("k", "first", THIRTY_MINUTES);
        let first_generation = generation_of(&cache, &"k");
        let stale = schedule_eviction(
            Arc::downgrade(&cache.inner),
            "k",
            first_generation,
            Instant::now() + Duration::from_millis(1),
        );
        assert!(stale.is_some());

        cache.put("k", "fresh", THIRTY_MINUTES);
        assert_ne!(generation_of(&cache, &"k"), first_generation);

        tokio::time::advance(Duration::from_millis(2)).await;
        settle().await;
        assert_eq!(cache.get(&"k"), Some("fresh"));
        assert_eq!(raw_len(&cache), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_for_live_generation_removes_entry() {
        let cache: ExpiringCache<&str, &str> = ExpiringCache::new();
        cache.put("k", "live", THIRTY_MINUTES);
        let generation = generation_of(&cache, &"k");
        schedule_eviction(
            Arc::downgrade(&cache.inner),
            "k",
            generation,
            Instant::now() + Duration::from_millis(1),
        );

        tokio::time::advance(Duration::from_millis(2)).await;
        settle().await;
        assert_eq!(raw_len(&cache), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_then_rewrite_is_not_removed_by_first_timer() {
        let cache = ExpiringCache::new();
        cache.put("k", 1, Duration::from_millis(10));
        assert!(cache.delete(&"k"));
        assert!(!cache.delete(&"k"), "second delete is a no-op");
        cache.put("k", 2, THIRTY_MINUTES);

        tokio::time::advance(Duration::from_millis(15)).await;
        settle().await;
        assert_eq!(cache.get(&"k"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn update_keeps_deadline_and_take_removes() {
        let cache = ExpiringCache::new();
        cache.put("k", 1, Duration::from_millis(10));
        tokio::time::advance(Duration::from_millis(5)).await;
        assert!(cache.update(&"k", |v| *v += 1));
        assert_eq!(cache.get(&"k"), Some(2));

        tokio::time::advance(Duration::from_millis(5)).await;
        assert!(!cache.update(&"k", |v| *v += 1), "update does not revive");

        cache.put("t", 9, THIRTY_MINUTES);
        assert_eq!(cache.take(&"t"), Some(9));
        assert_eq!(cache.take(&"t"), None);
    }

    #[test]
    fn works_without_a_runtime_using_lazy_expiry() {
        let cache = ExpiringCache::new();
        cache.put(1u32, "a", Duration::from_secs(60));
        cache.put(2u32, "b", Duration::ZERO);
        assert_eq!(cache.get(&1), Some("a"));
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}
