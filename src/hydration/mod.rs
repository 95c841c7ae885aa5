/// Hydration engine
///
/// Takes a set of post URIs plus an optional viewer and produces a
/// [`HydrationSnapshot`]: every record, aggregation, label, gate and
/// viewer-state needed to render those posts, loaded in as few store
/// round-trips as the batchers allow. Partial data degrades to defaults;
/// only the primary post and actor loads can fail the whole call.
pub mod embed;
pub mod labels;
pub mod viewer;

pub use embed::EmbedResolver;
pub use labels::{FilterPreferences, LabelVerdict};
pub use viewer::{ViewerContext, ViewerContextBuilder};

use crate::config::HydrationConfig;
use crate::error::AppViewResult;
use crate::loader::{Loaders, ViewerKey};
use crate::metrics::{record_error, record_hydration};
use crate::store::{
    ActorRecord, ActorRelationship, LabelRecord, PostAggregation, PostGateRecord, PostRecord,
    PostViewerState, ThreadGateRecord,
};
use crate::views::{ActorViewBasic, EmbedView, ImageUriBuilder, LabelView, PostView, ViewerStateView};
use futures::future::join_all;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::{debug, warn};

/// Everything loaded for one hydrate call. Posts and actors are keyed by
/// URI and DID with absent rows omitted; a missing entry means "not found",
/// not "zero". Aggregations and viewer states fall back to defaults through
/// the accessors.
#[derive(Debug, Default)]
pub struct HydrationSnapshot {
    pub posts: HashMap<String, PostRecord>,
    pub actors: HashMap<String, ActorRecord>,
    pub aggregations: HashMap<String, PostAggregation>,
    pub post_viewer_states: HashMap<String, PostViewerState>,
    pub actor_viewer_states: HashMap<String, ActorRelationship>,
    pub embeds: HashMap<String, EmbedView>,
    /// Effective labels per subject: a post's own labels merged with its
    /// author's, an actor's just its own
    pub labels: HashMap<String, Vec<LabelRecord>>,
    pub thread_gates: HashMap<String, ThreadGateRecord>,
    pub post_gates: HashMap<String, PostGateRecord>,
    pub viewer_did: Option<String>,
}

impl HydrationSnapshot {
    fn for_viewer(viewer_did: Option<&str>) -> Self {
        Self {
            viewer_did: viewer_did.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn post(&self, uri: &str) -> Option<&PostRecord> {
        self.posts.get(uri)
    }

    pub fn actor(&self, did: &str) -> Option<&ActorRecord> {
        self.actors.get(did)
    }

    pub fn aggregation(&self, uri: &str) -> PostAggregation {
        self.aggregations.get(uri).copied().unwrap_or_default()
    }

    pub fn labels_for(&self, subject: &str) -> &[LabelRecord] {
        self.labels.get(subject).map(Vec::as_slice).unwrap_or(&[])
    }

    /// True when the post record carries a takedown reference or its
    /// effective labels include a takedown sentinel.
    pub fn is_taken_down(&self, uri: &str) -> bool {
        let record_takedown = self
            .posts
            .get(uri)
            .map(|post| post.takedown_ref.is_some())
            .unwrap_or(false);
        record_takedown || labels::is_taken_down(self.labels_for(uri))
    }

    /// URIs from `uris` whose effective labels pass the viewer's filter.
    pub fn filter_content(&self, uris: &[String], prefs: Option<&FilterPreferences>) -> Vec<String> {
        labels::filter_content(uris, &self.labels, prefs)
    }

    /// Render one post. `None` when the post or its author was not loaded.
    pub fn post_view(&self, uri: &str, uris: &ImageUriBuilder) -> Option<PostView> {
        let post = self.posts.get(uri)?;
        let author = self.actors.get(&post.author_did)?;
        let aggregation = self.aggregation(uri);

        let viewer = self.viewer_did.as_ref().map(|_| {
            let state = self.post_viewer_states.get(uri).cloned().unwrap_or_default();
            ViewerStateView::from_state(&state)
        });

        let mut view = PostView {
            uri: post.uri.clone(),
            cid: post.cid.clone(),
            author: ActorViewBasic::from_record(author, self.labels_for(&post.author_did), uris),
            text: post.text.clone(),
            embed: self.embeds.get(uri).cloned(),
            like_count: 0,
            repost_count: 0,
            reply_count: 0,
            quote_count: 0,
            bookmark_count: 0,
            viewer,
            labels: self.labels_for(uri).iter().map(LabelView::from_record).collect(),
            created_at: post.created_at,
            indexed_at: post.indexed_at,
        };
        view.apply_aggregation(&aggregation);
        Some(view)
    }
}

pub struct Hydrator<'a> {
    loaders: &'a Loaders,
    config: &'a HydrationConfig,
}

impl<'a> Hydrator<'a> {
    pub fn new(loaders: &'a Loaders, config: &'a HydrationConfig) -> Self {
        Self { loaders, config }
    }

    /// Hydrate `uris` for an optional viewer.
    ///
    /// Posts load first, then the parent/root posts any of them reply to,
    /// then one parallel wave for actors, aggregations, labels, gates and
    /// viewer state, then embeds. Aggregation, label, gate and viewer-state
    /// failures degrade to defaults; post and actor failures propagate.
    pub async fn hydrate(
        &self,
        uris: &[String],
        viewer_did: Option<&str>,
    ) -> AppViewResult<HydrationSnapshot> {
        let requested = dedup(uris);
        if requested.is_empty() {
            return Ok(HydrationSnapshot::for_viewer(viewer_did));
        }
        let started = Instant::now();

        let mut posts: HashMap<String, PostRecord> = HashMap::new();
        let loaded = self.loaders.posts.load_many(&requested).await?;
        for (uri, maybe) in requested.iter().zip(loaded) {
            if let Some(post) = maybe {
                posts.insert(uri.clone(), post);
            }
        }

        // Reply pointers outside the requested set are loaded too, so
        // parent/root context is available to callers
        let requested_set: HashSet<&str> = requested.iter().map(String::as_str).collect();
        let mut context_uris: Vec<String> = Vec::new();
        let mut context_seen: HashSet<String> = HashSet::new();
        for post in posts.values() {
            for pointer in [&post.parent_uri, &post.root_uri] {
                if let Some(uri) = pointer {
                    if !requested_set.contains(uri.as_str()) && context_seen.insert(uri.clone()) {
                        context_uris.push(uri.clone());
                    }
                }
            }
        }
        if !context_uris.is_empty() {
            let context = self.loaders.posts.load_many(&context_uris).await?;
            for (uri, maybe) in context_uris.iter().zip(context) {
                if let Some(post) = maybe {
                    posts.insert(uri.clone(), post);
                }
            }
        }

        let mut author_dids: Vec<String> = Vec::new();
        let mut did_seen: HashSet<&str> = HashSet::new();
        for uri in requested.iter().chain(context_uris.iter()) {
            if let Some(post) = posts.get(uri) {
                if did_seen.insert(post.author_did.as_str()) {
                    author_dids.push(post.author_did.clone());
                }
            }
        }
        let loaded_uris: Vec<String> = requested
            .iter()
            .chain(context_uris.iter())
            .filter(|uri| posts.contains_key(*uri))
            .cloned()
            .collect();
        let label_subjects: Vec<String> = loaded_uris
            .iter()
            .chain(author_dids.iter())
            .cloned()
            .collect();

        let (post_state_keys, actor_state_keys) = match viewer_did {
            Some(viewer) => (
                loaded_uris
                    .iter()
                    .map(|uri| ViewerKey::new(uri.clone(), viewer))
                    .collect::<Vec<_>>(),
                author_dids
                    .iter()
                    .map(|did| ViewerKey::new(did.clone(), viewer))
                    .collect::<Vec<_>>(),
            ),
            None => (Vec::new(), Vec::new()),
        };

        let (
            actors_loaded,
            aggregations_loaded,
            labels_loaded,
            post_states_loaded,
            actor_states_loaded,
            thread_gates_loaded,
            post_gates_loaded,
        ) = futures::join!(
            self.loaders.actors.load_many(&author_dids),
            self.loaders.aggregations.load_many(&loaded_uris),
            self.loaders.labels.load_many(&label_subjects),
            self.loaders.post_viewer_states.load_many(&post_state_keys),
            self.loaders.relationships.load_many(&actor_state_keys),
            self.loaders.thread_gates.load_many(&requested),
            self.loaders.post_gates.load_many(&requested),
        );

        // Deactivated and taken-down authors are dropped here, so their
        // posts stop rendering everywhere downstream
        let mut actors: HashMap<String, ActorRecord> = HashMap::new();
        for (did, maybe) in author_dids.iter().zip(actors_loaded?) {
            if let Some(actor) = maybe {
                if actor.is_active() {
                    actors.insert(did.clone(), actor);
                } else {
                    debug!("Omitting inactive actor {}", did);
                }
            }
        }

        let aggregations: HashMap<String, PostAggregation> = loaded_uris
            .iter()
            .cloned()
            .zip(degrade(aggregations_loaded, "aggregations"))
            .collect();
        let post_viewer_states: HashMap<String, PostViewerState> = post_state_keys
            .iter()
            .map(|key| key.subject.clone())
            .zip(degrade(post_states_loaded, "post viewer states"))
            .collect();
        let actor_viewer_states: HashMap<String, ActorRelationship> = actor_state_keys
            .iter()
            .map(|key| key.subject.clone())
            .zip(degrade(actor_states_loaded, "actor viewer states"))
            .collect();
        let thread_gates: HashMap<String, ThreadGateRecord> = requested
            .iter()
            .cloned()
            .zip(degrade(thread_gates_loaded, "reply gates"))
            .filter_map(|(uri, gate)| gate.map(|g| (uri, g)))
            .collect();
        let post_gates: HashMap<String, PostGateRecord> = requested
            .iter()
            .cloned()
            .zip(degrade(post_gates_loaded, "embed gates"))
            .filter_map(|(uri, gate)| gate.map(|g| (uri, g)))
            .collect();

        let raw_labels: HashMap<String, Vec<LabelRecord>> = label_subjects
            .iter()
            .cloned()
            .zip(degrade(labels_loaded, "labels"))
            .collect();
        let mut effective: HashMap<String, Vec<LabelRecord>> = HashMap::new();
        for did in &author_dids {
            let own = raw_labels.get(did).map(Vec::as_slice).unwrap_or(&[]);
            let merged = labels::effective_labels(own, &[]);
            if !merged.is_empty() {
                effective.insert(did.clone(), merged);
            }
        }
        for uri in &loaded_uris {
            let Some(post) = posts.get(uri) else { continue };
            let own = raw_labels.get(uri).map(Vec::as_slice).unwrap_or(&[]);
            let author = raw_labels
                .get(&post.author_did)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            let merged = labels::effective_labels(own, author);
            if !merged.is_empty() {
                effective.insert(uri.clone(), merged);
            }
        }

        let resolver = EmbedResolver::new(self.loaders, self.config);
        let resolutions = join_all(posts.values().map(|post| {
            let resolver = &resolver;
            async move { (post.uri.clone(), resolver.resolve_embed(post).await) }
        }))
        .await;
        let mut embeds: HashMap<String, EmbedView> = HashMap::new();
        for (uri, view) in resolutions {
            if let Some(view) = view {
                embeds.insert(uri, view);
            }
        }

        record_hydration(viewer_did.is_some(), started.elapsed().as_secs_f64());
        debug!(
            "Hydrated {} posts ({} requested) for {}",
            posts.len(),
            requested.len(),
            viewer_did.unwrap_or("public")
        );

        Ok(HydrationSnapshot {
            posts,
            actors,
            aggregations,
            post_viewer_states,
            actor_viewer_states,
            embeds,
            labels: effective,
            thread_gates,
            post_gates,
            viewer_did: viewer_did.map(str::to_string),
        })
    }
}

fn dedup(uris: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    uris.iter()
        .filter(|uri| seen.insert(uri.as_str()))
        .cloned()
        .collect()
}

fn degrade<T>(result: AppViewResult<Vec<T>>, what: &str) -> Vec<T> {
    match result {
        Ok(values) => values,
        Err(e) => {
            warn!("Degrading {}: {}", what, e);
            record_error("degraded_data", "hydration");
            Vec::new()
        }
    }
}
