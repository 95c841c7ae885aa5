/// Viewer context assembly
///
/// Gathers one viewer's relationship state (follows, blocks, mutes, thread
/// mutes, muted-list membership) for filtering decisions. The full context
/// backs thread assembly; the per-subset builders back feed hydration where
/// loading the whole graph would be wasteful.
use crate::loader::{Loaders, ViewerKey};
use crate::store::{ActorRelationship, PostViewerState, RecordStore};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// One viewer's relationship state, expanded to flat DID/URI sets
#[derive(Debug, Clone, Default)]
pub struct ViewerContext {
    pub viewer_did: String,
    pub following: HashSet<String>,
    pub followers: HashSet<String>,
    pub blocking: HashSet<String>,
    pub blocked_by: HashSet<String>,
    /// Directly muted DIDs plus every current member of the viewer's muted
    /// lists. Expanded at build time, never cached across requests.
    pub muted: HashSet<String>,
    pub muted_thread_roots: HashSet<String>,
}

impl ViewerContext {
    /// Block in either direction. The two directions come from the same
    /// table read both ways and stay distinct sets.
    pub fn blocks(&self, did: &str) -> bool {
        self.blocking.contains(did) || self.blocked_by.contains(did)
    }

    /// True when the viewer should not see this actor's content at all
    pub fn hides_actor(&self, did: &str) -> bool {
        self.blocks(did) || self.muted.contains(did)
    }

    pub fn follows(&self, did: &str) -> bool {
        self.following.contains(did)
    }
}

/// Builds [`ViewerContext`] and per-subset viewer state maps
pub struct ViewerContextBuilder {
    store: Arc<dyn RecordStore>,
}

impl ViewerContextBuilder {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Assemble the full relationship state for one viewer. Individual
    /// lookup failures degrade to empty sets so a response can still be
    /// served; each degradation is logged.
    pub async fn build(&self, viewer_did: &str) -> ViewerContext {
        if viewer_did.is_empty() {
            return ViewerContext::default();
        }

        let (following, followers, blocking, blocked_by, muted, thread_roots, list_muted) = futures::join!(
            self.store.get_following_dids(viewer_did),
            self.store.get_follower_dids(viewer_did),
            self.store.get_blocking_dids(viewer_did),
            self.store.get_blocked_by_dids(viewer_did),
            self.store.get_muted_dids(viewer_did),
            self.store.get_muted_thread_roots(viewer_did),
            self.expand_muted_lists(viewer_did),
        );

        let mut muted = degrade(muted, viewer_did, "muted");
        muted.extend(degrade(list_muted, viewer_did, "list mutes"));

        ViewerContext {
            viewer_did: viewer_did.to_string(),
            following: degrade(following, viewer_did, "following"),
            followers: degrade(followers, viewer_did, "followers"),
            blocking: degrade(blocking, viewer_did, "blocking"),
            blocked_by: degrade(blocked_by, viewer_did, "blocked-by"),
            muted,
            muted_thread_roots: degrade(thread_roots, viewer_did, "thread mutes"),
        }
    }

    /// Current members of every list the viewer has muted. Recomputed per
    /// call since list membership changes out from under the viewer.
    async fn expand_muted_lists(
        &self,
        viewer_did: &str,
    ) -> crate::error::AppViewResult<HashSet<String>> {
        let list_uris = self.store.get_muted_list_uris(viewer_did).await?;
        if list_uris.is_empty() {
            return Ok(HashSet::new());
        }
        self.store.get_list_members(&list_uris).await
    }

    /// Relationship state for a bounded DID subset, batched through the
    /// request's loaders. Failures degrade to an empty map (callers treat
    /// a missing entry as the default relationship).
    pub async fn build_actor_states(
        &self,
        viewer_did: &str,
        dids: &[String],
        loaders: &Loaders,
    ) -> HashMap<String, ActorRelationship> {
        if viewer_did.is_empty() || dids.is_empty() {
            return HashMap::new();
        }
        let keys: Vec<ViewerKey> = dids
            .iter()
            .map(|did| ViewerKey::new(did.clone(), viewer_did))
            .collect();

        match loaders.relationships.load_many(&keys).await {
            Ok(states) => dids.iter().cloned().zip(states).collect(),
            Err(e) => {
                warn!("Degrading actor viewer state for {}: {}", viewer_did, e);
                HashMap::new()
            }
        }
    }

    /// Per-post viewer state for a bounded URI subset, batched through the
    /// request's loaders
    pub async fn build_post_states(
        &self,
        viewer_did: &str,
        uris: &[String],
        loaders: &Loaders,
    ) -> HashMap<String, PostViewerState> {
        if viewer_did.is_empty() || uris.is_empty() {
            return HashMap::new();
        }
        let keys: Vec<ViewerKey> = uris
            .iter()
            .map(|uri| ViewerKey::new(uri.clone(), viewer_did))
            .collect();

        match loaders.post_viewer_states.load_many(&keys).await {
            Ok(states) => uris.iter().cloned().zip(states).collect(),
            Err(e) => {
                warn!("Degrading post viewer state for {}: {}", viewer_did, e);
                HashMap::new()
            }
        }
    }
}

fn degrade(
    result: crate::error::AppViewResult<HashSet<String>>,
    viewer_did: &str,
    what: &str,
) -> HashSet<String> {
    match result {
        Ok(set) => set,
        Err(e) => {
            warn!("Degrading {} set for {}: {}", what, viewer_did, e);
            crate::metrics::record_error("viewer_context", what);
            HashSet::new()
        }
    }
}
