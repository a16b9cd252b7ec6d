//! Response cache in front of the update resolver.
//!
//! Entries are keyed by deployment key, then by the client-independent part
//! of the update check query, so every install polling the same deployment
//! with the same version and label shares one entry.
use crate::metrics_defs::{RESPONSE_CACHE_HIT, RESPONSE_CACHE_INVALIDATION, RESPONSE_CACHE_MISS};
use crate::resolver::UpdateCheckCacheResponse;
use async_trait::async_trait;
use moka::sync::Cache;
use shared::counter;
use std::sync::Arc;
use std::time::Duration;

#[async_trait]
pub trait ResponseCache: Send + Sync {
    async fn get(&self, key: &str, query: &str) -> Option<Arc<UpdateCheckCacheResponse>>;

    async fn set(&self, key: &str, query: &str, response: Arc<UpdateCheckCacheResponse>);

    /// Drops every entry for the deployment.
    async fn invalidate(&self, key: &str);
}

type QueryCache = Cache<String, Arc<UpdateCheckCacheResponse>>;

const DEFAULT_QUERY_LIMIT: u64 = 1_000;

pub struct MemoryResponseCache {
    cache: Cache<String, QueryCache>,
    ttl: Duration,
    query_limit: u64,
}

impl MemoryResponseCache {
    /// `max_capacity` bounds the number of deployments held.
    pub fn new(max_capacity: u64, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(ttl)
            .build();

        MemoryResponseCache {
            cache,
            ttl,
            query_limit: DEFAULT_QUERY_LIMIT,
        }
    }

    /// Bounds the number of distinct queries held for one deployment.
    pub fn with_query_limit(mut self, query_limit: u64) -> Self {
        self.query_limit = query_limit;
        self
    }

    pub fn deployment_count(&self) -> u64 {
        self.cache.entry_count()
    }

    fn queries(&self) -> QueryCache {
        Cache::builder()
            .max_capacity(self.query_limit)
            .time_to_live(self.ttl)
            .build()
    }
}

#[async_trait]
impl ResponseCache for MemoryResponseCache {
    async fn get(&self, key: &str, query: &str) -> Option<Arc<UpdateCheckCacheResponse>> {
        let hit = self.cache.get(key).and_then(|queries| queries.get(query));

        let metric_def = match hit {
            Some(_) => RESPONSE_CACHE_HIT,
            None => RESPONSE_CACHE_MISS,
        };
        counter!(metric_def).increment(1);
        hit
    }

    async fn set(&self, key: &str, query: &str, response: Arc<UpdateCheckCacheResponse>) {
        let queries = self.cache.get_with(key.to_string(), || self.queries());
        queries.insert(query.to_string(), response);
    }

    async fn invalidate(&self, key: &str) {
        self.cache.invalidate(key);
        counter!(RESPONSE_CACHE_INVALIDATION).increment(1);
    }
}

/// Cache that never holds anything, for running without one.
pub struct NoopResponseCache;

#[async_trait]
impl ResponseCache for NoopResponseCache {
    async fn get(&self, _key: &str, _query: &str) -> Option<Arc<UpdateCheckCacheResponse>> {
        None
    }

    async fn set(&self, _key: &str, _query: &str, _response: Arc<UpdateCheckCacheResponse>) {}

    async fn invalidate(&self, _key: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::UpdateDecision;

    fn response(label: &str) -> Arc<UpdateCheckCacheResponse> {
        Arc::new(UpdateCheckCacheResponse {
            original: UpdateDecision {
                label: label.into(),
                ..Default::default()
            },
            rollout: None,
            rollout_percent: None,
        })
    }

    #[tokio::test]
    async fn entries_are_per_deployment_and_query() {
        let cache = MemoryResponseCache::new(100, Duration::from_secs(60));
        cache.set("key-a", "1.0.0|v1", response("v2")).await;
        cache.set("key-a", "1.0.0|", response("v3")).await;
        cache.set("key-b", "1.0.0|v1", response("v9")).await;

        assert_eq!(cache.get("key-a", "1.0.0|v1").await.unwrap().original.label, "v2");
        assert_eq!(cache.get("key-a", "1.0.0|").await.unwrap().original.label, "v3");
        assert!(cache.get("key-a", "2.0.0|").await.is_none());

        cache.invalidate("key-a").await;
        assert!(cache.get("key-a", "1.0.0|v1").await.is_none());
        assert!(cache.get("key-a", "1.0.0|").await.is_none());
        assert!(cache.get("key-b", "1.0.0|v1").await.is_some());
    }

    #[tokio::test]
    async fn entries_expire() {
        let cache = MemoryResponseCache::new(100, Duration::from_millis(50));
        cache.set("key-a", "q", response("v1")).await;
        assert!(cache.get("key-a", "q").await.is_some());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(cache.get("key-a", "q").await.is_none());
    }

    #[tokio::test]
    async fn queries_per_deployment_are_bounded() {
        let cache = MemoryResponseCache::new(100, Duration::from_secs(60)).with_query_limit(10);
        for n in 0..30 {
            cache.set("key-a", &format!("{n}.0.0|"), response("v1")).await;
        }

        let queries = cache.cache.get("key-a").unwrap();
        queries.run_pending_tasks();
        assert!(queries.entry_count() <= 10, "{}", queries.entry_count());
    }

    #[tokio::test]
    async fn noop_cache_is_always_empty() {
        let cache = NoopResponseCache;
        cache.set("key-a", "q", response("v1")).await;
        assert!(cache.get("key-a", "q").await.is_none());
    }
}
