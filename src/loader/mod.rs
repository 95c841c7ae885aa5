/// Batched, request-scoped record loading
///
/// Every lookup issued during one logical request goes through a loader.
/// Concurrent loads of the same kind coalesce into a single batch fetch
/// against the record store, and results stay memoized until the request
/// releases its loaders. One [`Loaders`] bundle is built per request and
/// never shared across requests.
pub mod fetchers;
pub mod keys;

pub use fetchers::{
    ActorFetcher, AggregationFetcher, LabelFetcher, PostFetcher, PostGateFetcher,
    PostViewerStateFetcher, RelationshipFetcher, ReplyFetcher, ThreadGateFetcher,
};
pub use keys::ViewerKey;

use crate::error::{AppViewError, AppViewResult};
use crate::store::RecordStore;
use async_trait::async_trait;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::warn;

/// One record kind's batch fetch
///
/// `fetch` receives a deduplicated key set and returns whatever rows exist;
/// keys without a row are filled in from `missing`, so absence is a value,
/// never an error.
#[async_trait]
pub trait BatchFetch: Send + Sync {
    type Key: Clone + Eq + Hash + Send + Sync + 'static;
    type Value: Clone + Send + Sync + 'static;

    /// Metric label for this kind
    const KIND: &'static str;

    async fn fetch(
        &self,
        keys: &[Self::Key],
    ) -> AppViewResult<HashMap<Self::Key, Self::Value>>;

    /// Default value for keys the store has no row for
    fn missing(&self, key: &Self::Key) -> Self::Value;
}

enum Slot<V> {
    Pending,
    Ready(Result<V, String>),
}

struct BatchState<K, V> {
    slots: HashMap<K, Slot<V>>,
    queue: Vec<K>,
}

impl<K, V> Default for BatchState<K, V> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
            queue: Vec::new(),
        }
    }
}

/// Coalesces concurrent `load` calls into one `fetch` per wave
///
/// A load registers its key, yields once so sibling loads in the same wave
/// can register too, then whoever wins the flush lock drains the whole
/// queue in a single fetch. Everyone else finds their slot filled when the
/// lock frees up. Results are memoized until [`Batcher::release`].
pub struct Batcher<F: BatchFetch> {
    fetcher: F,
    state: Mutex<BatchState<F::Key, F::Value>>,
    flush_lock: tokio::sync::Mutex<()>,
}

/// Puts drained keys back on the queue if a flush future is dropped before
/// its fetch completes, so waiters behind the flush lock can retry them.
struct RequeueGuard<'a, F: BatchFetch> {
    batcher: &'a Batcher<F>,
    keys: Option<Vec<F::Key>>,
}

impl<F: BatchFetch> Drop for RequeueGuard<'_, F> {
    fn drop(&mut self) {
        if let Some(keys) = self.keys.take() {
            self.batcher.state().queue.extend(keys);
        }
    }
}

impl<F: BatchFetch> Batcher<F> {
    pub fn new(fetcher: F) -> Self {
        Self {
            fetcher,
            state: Mutex::new(BatchState::default()),
            flush_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn state(&self) -> MutexGuard<'_, BatchState<F::Key, F::Value>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_ready(&self, key: &F::Key) -> Option<AppViewResult<F::Value>> {
        match self.state().slots.get(key) {
            Some(Slot::Ready(Ok(value))) => Some(Ok(value.clone())),
            Some(Slot::Ready(Err(msg))) => Some(Err(AppViewError::Upstream(msg.clone()))),
            _ => None,
        }
    }

    fn enqueue(&self, key: &F::Key) {
        let mut state = self.state();
        if !state.slots.contains_key(key) {
            state.slots.insert(key.clone(), Slot::Pending);
            state.queue.push(key.clone());
        }
    }

    /// Load one key, coalescing with every other load issued in the same
    /// wave of this batcher
    pub async fn load(&self, key: F::Key) -> AppViewResult<F::Value> {
        if let Some(ready) = self.try_ready(&key) {
            return ready;
        }
        self.enqueue(&key);
        // Give sibling loads in this wave a chance to register before the
        // first flusher drains the queue
        tokio::task::yield_now().await;
        self.resolve(key).await
    }

    /// Load a key set. All keys register before the first await, so one
    /// flush covers the entire set. Output order matches input order.
    pub async fn load_many(&self, keys: &[F::Key]) -> AppViewResult<Vec<F::Value>> {
        for key in keys {
            if self.try_ready(key).is_none() {
                self.enqueue(key);
            }
        }
        tokio::task::yield_now().await;

        let mut values = Vec::with_capacity(keys.len());
        for key in keys {
            values.push(self.resolve(key.clone()).await?);
        }
        Ok(values)
    }

    async fn resolve(&self, key: F::Key) -> AppViewResult<F::Value> {
        loop {
            if let Some(ready) = self.try_ready(&key) {
                return ready;
            }

            let _flush = self.flush_lock.lock().await;
            // Another flusher may have filled our slot while we waited
            if let Some(ready) = self.try_ready(&key) {
                return ready;
            }

            let batch: Vec<F::Key> = std::mem::take(&mut self.state().queue);
            if batch.is_empty() {
                // A cancelled flush is mid-restore; let it finish
                tokio::task::yield_now().await;
                continue;
            }

            crate::metrics::record_loader_batch(F::KIND, batch.len());

            let mut guard = RequeueGuard {
                batcher: self,
                keys: Some(batch.clone()),
            };
            let fetched = self.fetcher.fetch(&batch).await;
            guard.keys = None;

            let mut state = self.state();
            match fetched {
                Ok(mut found) => {
                    for key in &batch {
                        let value = found
                            .remove(key)
                            .unwrap_or_else(|| self.fetcher.missing(key));
                        state.slots.insert(key.clone(), Slot::Ready(Ok(value)));
                    }
                }
                Err(e) => {
                    warn!("{} batch fetch of {} keys failed: {}", F::KIND, batch.len(), e);
                    crate::metrics::record_error("batch_fetch", F::KIND);
                    let msg = e.to_string();
                    for key in &batch {
                        state
                            .slots
                            .insert(key.clone(), Slot::Ready(Err(msg.clone())));
                    }
                }
            }
        }
    }

    /// Drop every memoized entry. Call at request end, never while loads
    /// are in flight.
    pub fn release(&self) {
        let mut state = self.state();
        state.slots.clear();
        state.queue.clear();
    }
}

/// The per-request loader bundle
///
/// Construct one per incoming request and call [`Loaders::release`] (or
/// drop the bundle) when the response is done. Sharing a bundle across
/// requests would leak memoized viewer state between viewers.
pub struct Loaders {
    pub posts: Batcher<PostFetcher>,
    pub actors: Batcher<ActorFetcher>,
    pub aggregations: Batcher<AggregationFetcher>,
    pub post_viewer_states: Batcher<PostViewerStateFetcher>,
    pub relationships: Batcher<RelationshipFetcher>,
    pub labels: Batcher<LabelFetcher>,
    pub thread_gates: Batcher<ThreadGateFetcher>,
    pub post_gates: Batcher<PostGateFetcher>,
    pub replies: Batcher<ReplyFetcher>,
}

impl Loaders {
    pub fn new(store: std::sync::Arc<dyn RecordStore>, reply_page_limit: u32) -> Self {
        Self {
            posts: Batcher::new(PostFetcher::new(store.clone())),
            actors: Batcher::new(ActorFetcher::new(store.clone())),
            aggregations: Batcher::new(AggregationFetcher::new(store.clone())),
            post_viewer_states: Batcher::new(PostViewerStateFetcher::new(store.clone())),
            relationships: Batcher::new(RelationshipFetcher::new(store.clone())),
            labels: Batcher::new(LabelFetcher::new(store.clone())),
            thread_gates: Batcher::new(ThreadGateFetcher::new(store.clone())),
            post_gates: Batcher::new(PostGateFetcher::new(store.clone())),
            replies: Batcher::new(ReplyFetcher::new(store, reply_page_limit)),
        }
    }

    /// Clear all memoized entries across every kind
    pub fn release(&self) {
        self.posts.release();
        self.actors.release();
        self.aggregations.release();
        self.post_viewer_states.release();
        self.relationships.release();
        self.labels.release();
        self.thread_gates.release();
        self.post_gates.release();
        self.replies.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingFetcher {
        calls: AtomicUsize,
        batches: Mutex<Vec<Vec<String>>>,
    }

    impl CountingFetcher {
        fn new() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                batches: Mutex::new(Vec::new()),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BatchFetch for CountingFetcher {
        type Key = String;
        type Value = String;
        const KIND: &'static str = "counting";

        async fn fetch(&self, keys: &[String]) -> AppViewResult<HashMap<String, String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batches
                .lock()
                .unwrap()
                .push(keys.to_vec());
            Ok(keys
                .iter()
                .filter(|k| !k.starts_with("missing"))
                .map(|k| (k.clone(), format!("value:{}", k)))
                .collect())
        }

        fn missing(&self, _key: &String) -> String {
            "default".to_string()
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl BatchFetch for FailingFetcher {
        type Key = String;
        type Value = String;
        const KIND: &'static str = "failing";

        async fn fetch(&self, _keys: &[String]) -> AppViewResult<HashMap<String, String>> {
            Err(AppViewError::Upstream("store unreachable".to_string()))
        }

        fn missing(&self, _key: &String) -> String {
            String::new()
        }
    }

    #[tokio::test]
    async fn test_concurrent_loads_coalesce_into_one_batch() {
        let batcher = Arc::new(Batcher::new(CountingFetcher::new()));

        let (a, b, a_again) = futures::join!(
            batcher.load("a".to_string()),
            batcher.load("b".to_string()),
            batcher.load("a".to_string()),
        );

        assert_eq!(a.unwrap(), "value:a");
        assert_eq!(b.unwrap(), "value:b");
        assert_eq!(a_again.unwrap(), "value:a");

        assert_eq!(batcher.fetcher.calls(), 1);
        let batches = batcher.fetcher.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        // Deduplicated union of the wave's keys
        let mut keys = batches[0].clone();
        keys.sort();
        assert_eq!(keys, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_results_memoize_across_waves() {
        let batcher = Batcher::new(CountingFetcher::new());

        assert_eq!(batcher.load("a".to_string()).await.unwrap(), "value:a");
        assert_eq!(batcher.load("a".to_string()).await.unwrap(), "value:a");

        assert_eq!(batcher.fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_absent_keys_resolve_to_the_kind_default() {
        let batcher = Batcher::new(CountingFetcher::new());
        let value = batcher.load("missing-1".to_string()).await.unwrap();
        assert_eq!(value, "default");
    }

    #[tokio::test]
    async fn test_failing_batch_fails_all_pending_loads() {
        let batcher = Batcher::new(FailingFetcher);

        let (a, b) = futures::join!(
            batcher.load("a".to_string()),
            batcher.load("b".to_string()),
        );

        assert!(a.is_err());
        assert!(b.is_err());
    }

    #[tokio::test]
    async fn test_load_many_registers_before_awaiting() {
        let batcher = Batcher::new(CountingFetcher::new());

        let values = batcher
            .load_many(&["a".to_string(), "b".to_string(), "c".to_string()])
            .await
            .unwrap();

        assert_eq!(values, vec!["value:a", "value:b", "value:c"]);
        assert_eq!(batcher.fetcher.calls(), 1);
    }

    #[tokio::test]
    async fn test_release_clears_memoization() {
        let batcher = Batcher::new(CountingFetcher::new());

        batcher.load("a".to_string()).await.unwrap();
        batcher.release();
        batcher.load("a".to_string()).await.unwrap();

        assert_eq!(batcher.fetcher.calls(), 2);
    }
}
