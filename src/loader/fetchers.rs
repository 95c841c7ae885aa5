/// Per-kind batch fetchers over the record store
///
/// Each fetcher adapts one [`RecordStore`] accessor to the [`BatchFetch`]
/// contract and defines the default value for keys without a row: `None`
/// for posts, actors and gates, zeroed counters for aggregations, empty
/// state for viewer kinds, empty lists for labels and replies.
use crate::error::AppViewResult;
use crate::loader::keys::ViewerKey;
use crate::loader::BatchFetch;
use crate::store::{
    ActorRecord, ActorRelationship, LabelRecord, PostAggregation, PostGateRecord, PostRecord,
    PostViewerState, RecordStore, ThreadGateRecord,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

pub struct PostFetcher {
    store: Arc<dyn RecordStore>,
}

impl PostFetcher {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BatchFetch for PostFetcher {
    type Key = String;
    type Value = Option<PostRecord>;
    const KIND: &'static str = "posts";

    async fn fetch(&self, keys: &[String]) -> AppViewResult<HashMap<String, Option<PostRecord>>> {
        let found = self.store.get_posts(keys).await?;
        Ok(found.into_iter().map(|(k, v)| (k, Some(v))).collect())
    }

    fn missing(&self, _key: &String) -> Option<PostRecord> {
        None
    }
}

pub struct ActorFetcher {
    store: Arc<dyn RecordStore>,
}

impl ActorFetcher {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BatchFetch for ActorFetcher {
    type Key = String;
    type Value = Option<ActorRecord>;
    const KIND: &'static str = "actors";

    async fn fetch(&self, keys: &[String]) -> AppViewResult<HashMap<String, Option<ActorRecord>>> {
        let found = self.store.get_actors(keys).await?;
        Ok(found.into_iter().map(|(k, v)| (k, Some(v))).collect())
    }

    fn missing(&self, _key: &String) -> Option<ActorRecord> {
        None
    }
}

pub struct AggregationFetcher {
    store: Arc<dyn RecordStore>,
}

impl AggregationFetcher {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BatchFetch for AggregationFetcher {
    type Key = String;
    type Value = PostAggregation;
    const KIND: &'static str = "aggregations";

    async fn fetch(&self, keys: &[String]) -> AppViewResult<HashMap<String, PostAggregation>> {
        self.store.get_aggregations(keys).await
    }

    /// Absent rows mean zero engagement, never null
    fn missing(&self, _key: &String) -> PostAggregation {
        PostAggregation::default()
    }
}

pub struct PostViewerStateFetcher {
    store: Arc<dyn RecordStore>,
}

impl PostViewerStateFetcher {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BatchFetch for PostViewerStateFetcher {
    type Key = ViewerKey;
    type Value = PostViewerState;
    const KIND: &'static str = "post_viewer_states";

    async fn fetch(
        &self,
        keys: &[ViewerKey],
    ) -> AppViewResult<HashMap<ViewerKey, PostViewerState>> {
        let mut out = HashMap::new();
        for (viewer, subjects) in group_by_viewer(keys) {
            let states = self.store.get_post_viewer_states(&viewer, &subjects).await?;
            for (subject, state) in states {
                out.insert(ViewerKey::new(subject, viewer.clone()), state);
            }
        }
        Ok(out)
    }

    fn missing(&self, _key: &ViewerKey) -> PostViewerState {
        PostViewerState::default()
    }
}

pub struct RelationshipFetcher {
    store: Arc<dyn RecordStore>,
}

impl RelationshipFetcher {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BatchFetch for RelationshipFetcher {
    type Key = ViewerKey;
    type Value = ActorRelationship;
    const KIND: &'static str = "relationships";

    async fn fetch(
        &self,
        keys: &[ViewerKey],
    ) -> AppViewResult<HashMap<ViewerKey, ActorRelationship>> {
        let mut out = HashMap::new();
        for (viewer, subjects) in group_by_viewer(keys) {
            let rels = self.store.get_actor_relationships(&viewer, &subjects).await?;
            for (subject, rel) in rels {
                out.insert(ViewerKey::new(subject, viewer.clone()), rel);
            }
        }
        Ok(out)
    }

    fn missing(&self, _key: &ViewerKey) -> ActorRelationship {
        ActorRelationship::default()
    }
}

/// Group well-formed viewer keys into per-viewer subject batches. Malformed
/// keys are left out so they fall through to the kind's default.
fn group_by_viewer(keys: &[ViewerKey]) -> HashMap<String, Vec<String>> {
    let mut by_viewer: HashMap<String, Vec<String>> = HashMap::new();
    for key in keys {
        if key.is_malformed() {
            continue;
        }
        by_viewer
            .entry(key.viewer.clone())
            .or_default()
            .push(key.subject.clone());
    }
    by_viewer
}

pub struct LabelFetcher {
    store: Arc<dyn RecordStore>,
}

impl LabelFetcher {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BatchFetch for LabelFetcher {
    type Key = String;
    type Value = Vec<LabelRecord>;
    const KIND: &'static str = "labels";

    async fn fetch(&self, keys: &[String]) -> AppViewResult<HashMap<String, Vec<LabelRecord>>> {
        self.store.get_labels(keys).await
    }

    fn missing(&self, _key: &String) -> Vec<LabelRecord> {
        Vec::new()
    }
}

pub struct ThreadGateFetcher {
    store: Arc<dyn RecordStore>,
}

impl ThreadGateFetcher {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BatchFetch for ThreadGateFetcher {
    type Key = String;
    type Value = Option<ThreadGateRecord>;
    const KIND: &'static str = "thread_gates";

    async fn fetch(
        &self,
        keys: &[String],
    ) -> AppViewResult<HashMap<String, Option<ThreadGateRecord>>> {
        let found = self.store.get_thread_gates(keys).await?;
        Ok(found.into_iter().map(|(k, v)| (k, Some(v))).collect())
    }

    fn missing(&self, _key: &String) -> Option<ThreadGateRecord> {
        None
    }
}

pub struct PostGateFetcher {
    store: Arc<dyn RecordStore>,
}

impl PostGateFetcher {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl BatchFetch for PostGateFetcher {
    type Key = String;
    type Value = Option<PostGateRecord>;
    const KIND: &'static str = "post_gates";

    async fn fetch(
        &self,
        keys: &[String],
    ) -> AppViewResult<HashMap<String, Option<PostGateRecord>>> {
        let found = self.store.get_post_gates(keys).await?;
        Ok(found.into_iter().map(|(k, v)| (k, Some(v))).collect())
    }

    fn missing(&self, _key: &String) -> Option<PostGateRecord> {
        None
    }
}

/// Fetches one recency-ordered page of direct replies per parent
pub struct ReplyFetcher {
    store: Arc<dyn RecordStore>,
    limit_per_parent: u32,
}

impl ReplyFetcher {
    pub fn new(store: Arc<dyn RecordStore>, limit_per_parent: u32) -> Self {
        Self {
            store,
            limit_per_parent,
        }
    }
}

#[async_trait]
impl BatchFetch for ReplyFetcher {
    type Key = String;
    type Value = Vec<PostRecord>;
    const KIND: &'static str = "replies";

    async fn fetch(&self, keys: &[String]) -> AppViewResult<HashMap<String, Vec<PostRecord>>> {
        self.store.get_replies(keys, self.limit_per_parent).await
    }

    fn missing(&self, _key: &String) -> Vec<PostRecord> {
        Vec::new()
    }
}
