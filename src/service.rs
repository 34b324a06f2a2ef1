//! Cache-aside lookup service: the public face of the pipeline.
//!
//! ```text
//! lookup(entity, id, priority)
//!     │ normalize key
//!     ├── local store hit ────────────────▶ LookupResult { source: Cache }
//!     └── miss
//!         ├── registry: attach (or create + enqueue dispatcher job)
//!         ├── high-priority attach promotes the queued job
//!         ├── await broadcast outcome
//!         └── persist via upsert_if_absent ▶ LookupResult { source: Upstream }
//! ```
//!
//! The service is the only component that touches the local store; the
//! dispatcher and registry deal purely in upstream outcomes. Every waiter
//! persists the record it receives, which is safe because the store's
//! `upsert_if_absent` is atomic and first-writer-wins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::config::LookupConfig;
use crate::dispatcher::{PriorityDispatcher, QueueStats};
use crate::domain::model::{CatalogRecord, EntityType, LookupKey, LookupResult, Priority, Source};
use crate::domain::ports::{LocalStore, UpstreamClient};
use crate::error::{Error, Result};
use crate::limiter::RateLimiter;
use crate::registry::InFlightRegistry;

// =============================================================================
// Statistics
// =============================================================================

#[derive(Debug, Default)]
struct ServiceStats {
    cache_hits: AtomicU64,
    upstream_fetches: AtomicU64,
}

/// Combined pipeline snapshot for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineStats {
    pub cache_hits: u64,
    pub upstream_fetches: u64,
    /// Lookups currently outstanding in the in-flight registry
    pub pending: usize,
    pub queue: QueueStats,
}

// =============================================================================
// Cache-Aside Lookup Service
// =============================================================================

/// Entry point for catalog lookups and upstream searches.
pub struct CacheAsideLookupService {
    config: LookupConfig,
    store: Arc<dyn LocalStore>,
    upstream: Arc<dyn UpstreamClient>,
    limiter: Arc<RateLimiter>,
    registry: Arc<InFlightRegistry>,
    dispatcher: Arc<PriorityDispatcher>,
    shutdown: CancellationToken,
    stats: ServiceStats,
}

impl CacheAsideLookupService {
    pub fn new(
        config: LookupConfig,
        store: Arc<dyn LocalStore>,
        upstream: Arc<dyn UpstreamClient>,
        limiter: Arc<RateLimiter>,
        registry: Arc<InFlightRegistry>,
        dispatcher: Arc<PriorityDispatcher>,
    ) -> Result<Self> {
        config.validate()?;
        let shutdown = dispatcher.shutdown_token();
        Ok(Self {
            config,
            store,
            upstream,
            limiter,
            registry,
            dispatcher,
            shutdown,
            stats: ServiceStats::default(),
        })
    }

    /// Look up one entity by identifier, serving from the local store when
    /// possible and otherwise going through the dispatch pipeline.
    pub async fn lookup(
        &self,
        entity: EntityType,
        identifier: &str,
        priority: Priority,
    ) -> Result<LookupResult> {
        self.lookup_inner(entity, identifier, priority, None).await
    }

    /// Like [`lookup`], but the caller can abandon the wait. Cancellation
    /// is local to this caller: the underlying job keeps running and its
    /// result still lands in the store for everyone else.
    ///
    /// [`lookup`]: CacheAsideLookupService::lookup
    pub async fn lookup_with_cancel(
        &self,
        entity: EntityType,
        identifier: &str,
        priority: Priority,
        cancel: &CancellationToken,
    ) -> Result<LookupResult> {
        self.lookup_inner(entity, identifier, priority, Some(cancel))
            .await
    }

    #[instrument(skip(self, cancel), fields(entity = %entity, identifier, priority = %priority))]
    async fn lookup_inner(
        &self,
        entity: EntityType,
        identifier: &str,
        priority: Priority,
        cancel: Option<&CancellationToken>,
    ) -> Result<LookupResult> {
        let key = LookupKey::new(entity, identifier)?;

        // Cache path: never consumes a token, never touches the queue
        if let Some(record) = self.store.find_by_key(&key).await? {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(key = %key, "served from local store");
            return Ok(LookupResult {
                record,
                source: Source::Cache,
            });
        }

        if !self.config.enabled {
            return Err(Error::Disabled);
        }

        let (waiter, is_new) = self.registry.get_or_attach(&key, priority);
        if is_new {
            if let Err(err) = self.dispatcher.enqueue(key.clone(), priority) {
                // Late attachers between get_or_attach and here must not hang
                self.registry.resolve(&key, Err(err.clone()));
                return Err(err);
            }
        } else if priority == Priority::High {
            self.dispatcher.promote(&key);
        }

        let outcome = match cancel {
            Some(token) => waiter.wait_with_cancel(token).await,
            None => waiter.wait().await,
        };
        let record = outcome?;
        self.stats.upstream_fetches.fetch_add(1, Ordering::Relaxed);

        let stored = self.persist(record).await;
        Ok(LookupResult {
            record: stored,
            source: Source::Upstream,
        })
    }

    /// Resolve a batch of identifiers concurrently. Results come back in
    /// input order; each element fails or succeeds on its own.
    pub async fn lookup_many(
        &self,
        entity: EntityType,
        identifiers: &[String],
        priority: Priority,
    ) -> Vec<Result<LookupResult>> {
        join_all(
            identifiers
                .iter()
                .map(|id| self.lookup(entity, id, priority)),
        )
        .await
    }

    /// Free-text search passed through to the upstream catalog, paced by
    /// the same token bucket as lookups. Results are not persisted: search
    /// hits have no stable natural key until the user picks one.
    #[instrument(skip(self, query), fields(entity = %entity, page, page_size))]
    pub async fn search(
        &self,
        entity: EntityType,
        query: &str,
        page: u32,
        page_size: u32,
    ) -> Result<Vec<CatalogRecord>> {
        if !self.config.enabled {
            return Err(Error::Disabled);
        }
        self.limiter.acquire(&self.shutdown).await.map_err(|e| {
            if self.shutdown.is_cancelled() {
                Error::ShuttingDown
            } else {
                e
            }
        })?;
        self.upstream.search(entity, query, page, page_size).await
    }

    /// Snapshot of cache counters, registry depth, and queue state.
    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            cache_hits: self.stats.cache_hits.load(Ordering::Relaxed),
            upstream_fetches: self.stats.upstream_fetches.load(Ordering::Relaxed),
            pending: self.registry.len(),
            queue: self.dispatcher.stats(),
        }
    }

    /// Persist an upstream record, falling back to the fetched copy when
    /// the store write fails. Lookup callers still get their record; the
    /// next lookup for the key will retry the write.
    async fn persist(&self, record: CatalogRecord) -> CatalogRecord {
        match self.store.upsert_if_absent(record.clone()).await {
            Ok(stored) => stored,
            Err(err) => {
                warn!(entity = %record.entity, key = %record.key, %err, "failed to persist upstream record");
                record
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory_store::InMemoryStore;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    struct ScriptedUpstream {
        failures: Mutex<HashMap<String, Error>>,
        calls: AtomicU64,
    }

    impl ScriptedUpstream {
        fn new() -> Self {
            Self {
                failures: Mutex::new(HashMap::new()),
                calls: AtomicU64::new(0),
            }
        }

        fn fail_with(&self, identifier: &str, err: Error) {
            self.failures.lock().insert(identifier.to_string(), err);
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl UpstreamClient for ScriptedUpstream {
        async fn fetch_by_key(&self, key: &LookupKey) -> Result<CatalogRecord> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.failures.lock().get(key.identifier()) {
                return Err(err.clone());
            }
            Ok(CatalogRecord::new(key, format!("upstream {}", key.identifier())))
        }

        async fn search(
            &self,
            _entity: EntityType,
            query: &str,
            _page: u32,
            _page_size: u32,
        ) -> Result<Vec<CatalogRecord>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let key = LookupKey::new(EntityType::Book, "9780000000001").unwrap();
            Ok(vec![CatalogRecord::new(&key, query.to_string())])
        }
    }

    struct Harness {
        service: Arc<CacheAsideLookupService>,
        store: Arc<InMemoryStore>,
        upstream: Arc<ScriptedUpstream>,
        dispatcher: Arc<PriorityDispatcher>,
    }

    fn harness(config: LookupConfig) -> Harness {
        let limiter = Arc::new(RateLimiter::new(
            config.requests_per_second,
            config.burst_capacity,
        ));
        let registry = Arc::new(InFlightRegistry::new());
        let store = Arc::new(InMemoryStore::new());
        let upstream = Arc::new(ScriptedUpstream::new());
        let dispatcher = PriorityDispatcher::new(
            config.clone(),
            Arc::clone(&limiter),
            Arc::clone(&registry),
            Arc::clone(&upstream) as Arc<dyn UpstreamClient>,
        )
        .unwrap();
        let service = Arc::new(
            CacheAsideLookupService::new(
                config,
                Arc::clone(&store) as Arc<dyn LocalStore>,
                Arc::clone(&upstream) as Arc<dyn UpstreamClient>,
                limiter,
                registry,
                Arc::clone(&dispatcher),
            )
            .unwrap(),
        );
        Harness {
            service,
            store,
            upstream,
            dispatcher,
        }
    }

    fn fast_config() -> LookupConfig {
        LookupConfig {
            requests_per_second: 1000.0,
            burst_capacity: 1000,
            worker_count: 2,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cache_hit_skips_pipeline() {
        let h = harness(fast_config());
        let key = LookupKey::new(EntityType::Book, "9780134685991").unwrap();
        h.store
            .upsert_if_absent(CatalogRecord::new(&key, "Effective Java"))
            .await
            .unwrap();

        // Workers never started; a hit must not need them
        let result = h
            .service
            .lookup(EntityType::Book, "978-0-13-468599-1", Priority::High)
            .await
            .unwrap();

        assert_eq!(result.source, Source::Cache);
        assert_eq!(result.record.display_name, "Effective Java");
        assert_eq!(h.upstream.calls(), 0);
        assert_eq!(h.service.stats().cache_hits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_miss_fetches_and_persists() {
        let h = harness(fast_config());
        PriorityDispatcher::start(&h.dispatcher);

        let result = h
            .service
            .lookup(EntityType::Book, "9780134685991", Priority::Low)
            .await
            .unwrap();
        assert_eq!(result.source, Source::Upstream);
        assert_eq!(h.upstream.calls(), 1);
        assert_eq!(h.store.len(), 1);

        // Second call is a pure cache hit
        let again = h
            .service
            .lookup(EntityType::Book, "9780134685991", Priority::Low)
            .await
            .unwrap();
        assert_eq!(again.source, Source::Cache);
        assert_eq!(h.upstream.calls(), 1);

        h.dispatcher.drain().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_deduplicate() {
        let h = harness(fast_config());
        PriorityDispatcher::start(&h.dispatcher);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let service = Arc::clone(&h.service);
            handles.push(tokio::spawn(async move {
                service
                    .lookup(EntityType::Author, "Ursula K. Le Guin", Priority::Low)
                    .await
            }));
        }

        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.record.display_name, "upstream ursula k. le guin");
        }

        // One upstream fetch, one stored row, for eight callers
        assert_eq!(h.upstream.calls(), 1);
        assert_eq!(h.store.len(), 1);
        h.dispatcher.drain().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_identifier_rejected_before_queue() {
        let h = harness(fast_config());
        let result = h.service.lookup(EntityType::Book, "---", Priority::Low).await;
        assert_matches!(result, Err(Error::InvalidIdentifier(_)));
        assert_eq!(h.upstream.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_serves_hits_but_rejects_misses() {
        let mut config = fast_config();
        config.enabled = false;
        let h = harness(config);

        let key = LookupKey::new(EntityType::Book, "9780134685991").unwrap();
        h.store
            .upsert_if_absent(CatalogRecord::new(&key, "Effective Java"))
            .await
            .unwrap();

        let hit = h
            .service
            .lookup(EntityType::Book, "9780134685991", Priority::Low)
            .await
            .unwrap();
        assert_eq!(hit.source, Source::Cache);

        let miss = h
            .service
            .lookup(EntityType::Book, "9999999999999", Priority::Low)
            .await;
        assert_matches!(miss, Err(Error::Disabled));
        assert_eq!(h.upstream.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_many_preserves_order_and_isolates_failures() {
        let h = harness(fast_config());
        h.upstream.fail_with(
            "9780000000002",
            Error::NotFound {
                entity: "book".into(),
                key: "9780000000002".into(),
            },
        );
        PriorityDispatcher::start(&h.dispatcher);

        let ids = vec![
            "9780000000001".to_string(),
            "9780000000002".to_string(),
            "9780000000003".to_string(),
        ];
        let results = h
            .service
            .lookup_many(EntityType::Book, &ids, Priority::Low)
            .await;

        assert_eq!(results.len(), 3);
        assert_matches!(&results[0], Ok(r) if r.record.key == "9780000000001");
        assert_matches!(&results[1], Err(Error::NotFound { .. }));
        assert_matches!(&results[2], Ok(r) if r.record.key == "9780000000003");
        assert_eq!(h.store.len(), 2);
        h.dispatcher.drain().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_is_local_to_caller() {
        let h = harness(fast_config());
        // Workers deliberately not started so the job stays queued

        let cancel = CancellationToken::new();
        let service = Arc::clone(&h.service);
        let cancelled_caller = tokio::spawn({
            let cancel = cancel.clone();
            async move {
                service
                    .lookup_with_cancel(EntityType::Book, "9780134685991", Priority::Low, &cancel)
                    .await
            }
        });

        let service = Arc::clone(&h.service);
        let patient_caller = tokio::spawn(async move {
            service
                .lookup(EntityType::Book, "9780134685991", Priority::Low)
                .await
        });

        tokio::task::yield_now().await;
        cancel.cancel();
        assert_matches!(
            cancelled_caller.await.unwrap(),
            Err(Error::Cancelled)
        );

        // The job still completes for the patient caller
        PriorityDispatcher::start(&h.dispatcher);
        let result = patient_caller.await.unwrap().unwrap();
        assert_eq!(result.source, Source::Upstream);
        assert_eq!(h.upstream.calls(), 1);
        h.dispatcher.drain().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_lookup_after_drain_fails_fast() {
        let h = harness(fast_config());
        h.dispatcher.drain().await;

        let result = h
            .service
            .lookup(EntityType::Book, "9780134685991", Priority::Low)
            .await;
        assert_matches!(result, Err(Error::ShuttingDown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_passes_through_rate_limited() {
        let config = LookupConfig {
            requests_per_second: 1.0,
            burst_capacity: 1,
            ..fast_config()
        };
        let h = harness(config);

        let start = tokio::time::Instant::now();
        let first = h
            .service
            .search(EntityType::Book, "tolkien", 1, 10)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        // Bucket drained; the second search waits for refill
        h.service
            .search(EntityType::Book, "le guin", 1, 10)
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(990));
        assert_eq!(h.upstream.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_search_rejected_when_disabled() {
        let mut config = fast_config();
        config.enabled = false;
        let h = harness(config);

        let result = h.service.search(EntityType::Book, "tolkien", 1, 10).await;
        assert_matches!(result, Err(Error::Disabled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_reflect_traffic() {
        let h = harness(fast_config());
        PriorityDispatcher::start(&h.dispatcher);

        h.service
            .lookup(EntityType::Book, "9780134685991", Priority::Low)
            .await
            .unwrap();
        h.service
            .lookup(EntityType::Book, "9780134685991", Priority::Low)
            .await
            .unwrap();

        let stats = h.service.stats();
        assert_eq!(stats.upstream_fetches, 1);
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.queue.succeeded_total, 1);
        h.dispatcher.drain().await;
    }
}
