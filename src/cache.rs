//! Time-bounded memoization of fetch outcomes.

use crate::fetch::{FailureKind, Fetch, FetchOutcome};
use crate::image::GenerationRequest;
use async_trait::async_trait;
use mini_moka::sync::Cache;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default lifetime of a cached outcome.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);
/// Default maximum number of cached outcomes.
pub const DEFAULT_CAPACITY: u64 = 256;

/// Bounded in-memory map whose entries expire a fixed time after insertion.
///
/// Cloning is cheap and clones share storage, so one cache can be handed to
/// concurrent tasks.
#[derive(Clone)]
pub struct TtlCache<K, V> {
    entries: Cache<K, V>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Creates a cache holding at most `capacity` entries for `ttl` each.
    pub fn new(capacity: u64, ttl: Duration) -> Self {
        let entries = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();

        Self { entries, ttl }
    }

    /// Returns the live value for `key`, if any.
    pub fn get(&self, key: &K) -> Option<V> {
        self.entries.get(key)
    }

    /// Stores `value`, restarting the TTL for `key`.
    pub fn insert(&self, key: K, value: V) {
        self.entries.insert(key, value);
    }

    /// Drops the entry for `key`.
    pub fn invalidate(&self, key: &K) {
        self.entries.invalidate(key);
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.invalidate_all();
    }

    /// Approximate number of live entries.
    pub fn len(&self) -> u64 {
        self.entries.entry_count()
    }

    /// Check if cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the configured time-to-live.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Identity of a request for caching purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Prompt as sent upstream.
    pub prompt: String,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Variation index within a batch.
    pub variation: Option<u32>,
}

impl From<&GenerationRequest> for CacheKey {
    fn from(request: &GenerationRequest) -> Self {
        Self {
            prompt: request.prompt.clone(),
            width: request.width,
            height: request.height,
            variation: request.variation,
        }
    }
}

/// Caching decorator for any [`Fetch`] implementation.
///
/// Hits return the very same `Arc<FetchOutcome>` that was stored, without
/// touching the wrapped fetcher.
pub struct CachedFetcher<F> {
    inner: F,
    cache: TtlCache<CacheKey, Arc<FetchOutcome>>,
    cache_failures: bool,
}

impl<F: Fetch> CachedFetcher<F> {
    /// Wraps `inner` with a one-hour, 256-entry cache.
    pub fn new(inner: F) -> Self {
        Self::with_cache(inner, TtlCache::new(DEFAULT_CAPACITY, DEFAULT_TTL))
    }

    /// Wraps `inner` with a caller-supplied cache, which may be shared.
    pub fn with_cache(inner: F, cache: TtlCache<CacheKey, Arc<FetchOutcome>>) -> Self {
        Self {
            inner,
            cache,
            cache_failures: false,
        }
    }

    /// Also memoize failed outcomes (except invalid input and cancellation).
    pub fn cache_failures(mut self, enabled: bool) -> Self {
        self.cache_failures = enabled;
        self
    }

    /// Returns the underlying cache.
    pub fn cache(&self) -> &TtlCache<CacheKey, Arc<FetchOutcome>> {
        &self.cache
    }

    /// Returns the wrapped fetcher.
    pub fn inner(&self) -> &F {
        &self.inner
    }

    fn should_store(&self, outcome: &FetchOutcome) -> bool {
        match outcome {
            FetchOutcome::Success(_) => true,
            FetchOutcome::Failure(failure) => {
                self.cache_failures
                    && !matches!(
                        failure.kind,
                        FailureKind::InvalidArgument | FailureKind::Cancelled
                    )
            }
        }
    }
}

#[async_trait]
impl<F: Fetch> Fetch for CachedFetcher<F> {
    async fn fetch(&self, request: &GenerationRequest) -> Arc<FetchOutcome> {
        let key = CacheKey::from(request);

        if let Some(hit) = self.cache.get(&key) {
            tracing::debug!(variation = ?key.variation, "cache hit");
            return hit;
        }

        let outcome = self.inner.fetch(request).await;
        if self.should_store(&outcome) {
            self.cache.insert(key, Arc::clone(&outcome));
        }
        outcome
    }

    fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancellation_token()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::{GeneratedImage, GenerationMetadata, ImageFormat};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingFetch {
        calls: AtomicU32,
        fail: bool,
    }

    impl CountingFetch {
        fn new(fail: bool) -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail,
            }
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Fetch for CountingFetch {
        async fn fetch(&self, _request: &GenerationRequest) -> Arc<FetchOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Arc::new(FetchOutcome::failure(
                    FailureKind::UpstreamError,
                    "failed after 3 attempts: API error: 500 - boom",
                    3,
                ));
            }
            Arc::new(FetchOutcome::Success(GeneratedImage::new(
                vec![1, 2, 3],
                ImageFormat::Png,
                GenerationMetadata::default(),
            )))
        }

        fn cancellation_token(&self) -> CancellationToken {
            CancellationToken::new()
        }
    }

    #[test]
    fn test_ttl_cache_basic_operations() {
        let cache: TtlCache<String, u32> = TtlCache::new(16, Duration::from_secs(60));
        assert_eq!(cache.get(&"a".to_string()), None);

        cache.insert("a".to_string(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));

        cache.invalidate(&"a".to_string());
        assert_eq!(cache.get(&"a".to_string()), None);
        assert_eq!(cache.ttl(), Duration::from_secs(60));
    }

    #[test]
    fn test_ttl_cache_clear_drops_everything() {
        let cache: TtlCache<u32, u32> = TtlCache::new(16, Duration::from_secs(60));
        for k in 1..=3 {
            cache.insert(k, k * 10);
        }
        assert_eq!(cache.get(&2), Some(20));

        cache.clear();
        assert!((1..=3).all(|k| cache.get(&k).is_none()));

        cache.insert(4, 40);
        assert_eq!(cache.get(&4), Some(40));
    }

    #[test]
    fn test_ttl_cache_expires_entries() {
        let cache: TtlCache<u32, u32> = TtlCache::new(16, Duration::from_millis(50));
        cache.insert(7, 49);
        assert_eq!(cache.get(&7), Some(49));

        std::thread::sleep(Duration::from_millis(150));
        assert_eq!(cache.get(&7), None);
    }

    #[test]
    fn test_cache_key_includes_variation() {
        let base = GenerationRequest::new("A fox");
        assert_ne!(CacheKey::from(&base), CacheKey::from(&base.with_variation(1)));
        assert_ne!(
            CacheKey::from(&base.with_variation(1)),
            CacheKey::from(&base.with_variation(2))
        );
        assert_ne!(
            CacheKey::from(&base),
            CacheKey::from(&base.clone().with_size(512, 512))
        );
        assert_eq!(CacheKey::from(&base), CacheKey::from(&base.clone()));
    }

    #[tokio::test]
    async fn test_hit_returns_same_outcome_without_refetch() {
        let fetcher = CachedFetcher::new(CountingFetch::new(false));
        let request = GenerationRequest::new("A fox").with_variation(1);

        let first = fetcher.fetch(&request).await;
        let second = fetcher.fetch(&request).await;

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(fetcher.inner().calls(), 1);

        let other = fetcher.fetch(&request.clone().with_size(512, 512)).await;
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(fetcher.inner().calls(), 2);
    }

    #[tokio::test]
    async fn test_expired_entry_is_refetched() {
        let cache = TtlCache::new(16, Duration::from_millis(50));
        let fetcher = CachedFetcher::with_cache(CountingFetch::new(false), cache);
        let request = GenerationRequest::new("A fox");

        let first = fetcher.fetch(&request).await;
        tokio::time::sleep(Duration::from_millis(150)).await;
        let second = fetcher.fetch(&request).await;

        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(fetcher.inner().calls(), 2);
    }

    #[tokio::test]
    async fn test_failures_not_cached_by_default() {
        let fetcher = CachedFetcher::new(CountingFetch::new(true));
        let request = GenerationRequest::new("A fox");

        fetcher.fetch(&request).await;
        fetcher.fetch(&request).await;
        assert_eq!(fetcher.inner().calls(), 2);

        let caching = CachedFetcher::new(CountingFetch::new(true)).cache_failures(true);
        let first = caching.fetch(&request).await;
        let second = caching.fetch(&request).await;
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(caching.inner().calls(), 1);
    }
}
