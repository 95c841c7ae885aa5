/// Application context and dependency injection
use crate::cache::{RedisBackend, ResultCache};
use crate::config::AppViewConfig;
use crate::error::AppViewResult;
use crate::hydration::{HydrationSnapshot, Hydrator, ViewerContextBuilder};
use crate::loader::Loaders;
use crate::store::{PostgresRecordStore, RecordStore};
use crate::thread::ThreadAssembler;
use crate::views::ImageUriBuilder;
use std::sync::Arc;

/// Process-wide services: configuration, the record store and the result
/// cache. Everything request-scoped (loaders, hydrators, assemblers) is
/// minted per call and discarded with the request.
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<AppViewConfig>,
    pub store: Arc<dyn RecordStore>,
    pub cache: ResultCache,
}

impl AppContext {
    /// Create the context from configuration.
    pub async fn new(config: AppViewConfig) -> AppViewResult<Self> {
        // Connect the record store
        let store: Arc<dyn RecordStore> =
            Arc::new(PostgresRecordStore::connect(&config.store).await?);

        // Connect the result cache when enabled; a disabled cache serves
        // every lookup as a miss
        let cache = if config.cache.enabled {
            let backend = RedisBackend::connect(&config.cache).await?;
            ResultCache::new(Arc::new(backend), config.cache.clone())
        } else {
            tracing::info!("Result cache disabled - reads go straight to the store");
            ResultCache::disabled()
        };

        Ok(Self {
            config: Arc::new(config),
            store,
            cache,
        })
    }

    /// Assemble a context over explicit parts, for embedding and tests.
    pub fn with_parts(
        config: AppViewConfig,
        store: Arc<dyn RecordStore>,
        cache: ResultCache,
    ) -> Self {
        Self {
            config: Arc::new(config),
            store,
            cache,
        }
    }

    /// Fresh request-scoped loaders. Loader memoization is viewer-scoped,
    /// so instances must never be shared across requests.
    pub fn loaders(&self) -> Loaders {
        Loaders::new(self.store.clone(), self.config.thread.reply_page_limit)
    }

    /// Fresh request-scoped thread assembler.
    pub fn thread_assembler(&self) -> ThreadAssembler {
        ThreadAssembler::new(
            self.store.clone(),
            self.cache.clone(),
            self.config.hydration.clone(),
            self.config.thread.clone(),
        )
    }

    pub fn viewer_context_builder(&self) -> ViewerContextBuilder {
        ViewerContextBuilder::new(self.store.clone())
    }

    pub fn image_uris(&self) -> ImageUriBuilder {
        ImageUriBuilder::new(
            self.config.hydration.cdn_url.clone(),
            self.config.hydration.video_url.clone(),
        )
    }

    /// One-shot hydration with its own request-scoped loader set.
    pub async fn hydrate(
        &self,
        uris: &[String],
        viewer_did: Option<&str>,
    ) -> AppViewResult<HydrationSnapshot> {
        let loaders = self.loaders();
        let hydrator = Hydrator::new(&loaders, &self.config.hydration);
        hydrator.hydrate(uris, viewer_did).await
    }
}
