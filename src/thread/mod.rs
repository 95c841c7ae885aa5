/// Thread assembly
///
/// Builds the ancestor chain and descendant tree around one anchor post.
/// Ancestors are walked one load per level up to the height bound, with
/// blocked or muted authors spliced out of the chain. Descendants are walked
/// breadth-first to the depth bound, reply-gate and viewer filtered, sorted
/// by a deterministic total order and truncated by the branching factor.
/// Assembled trees are cached per (anchor, depth, height, viewer) with a
/// short TTL; reply-gate contexts cache separately and longer.
pub mod gate;

pub use gate::GateContext;

use crate::cache::{encode_key_part, namespaces, ResultCache};
use crate::config::{HydrationConfig, ThreadConfig};
use crate::error::AppViewResult;
use crate::hydration::{Hydrator, ViewerContext, ViewerContextBuilder};
use crate::loader::Loaders;
use crate::metrics::{record_thread_assembled, record_thread_cached};
use crate::store::{PostRecord, RecordStore};
use crate::uri::{did_from_uri, AtUri};
use crate::views::{ImageUriBuilder, PostView, ThreadItemView, ThreadPostView};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Depth bound for reply-count badges
const DEFAULT_COUNT_DEPTH: u32 = 3;

/// An assembled thread as a node arena. Children always carry a larger
/// index than their parent, so traversal by index is well-founded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadTree {
    pub nodes: Vec<ThreadNode>,
    /// Index of the anchor node in `nodes`
    pub anchor: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadNode {
    pub uri: String,
    /// Levels from the anchor: ancestors negative, descendants positive
    pub depth: i32,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub post: PostView,
}

impl ThreadTree {
    /// Nested wire shape: the anchor carries its ancestor chain through
    /// `parent` and its descendant subtree through `replies`. `None` only
    /// when the anchor index is out of bounds.
    pub fn render(&self) -> Option<ThreadItemView> {
        let anchor = self.nodes.get(self.anchor)?;
        let parent = anchor
            .parent
            .filter(|&p| p < self.anchor)
            .and_then(|p| self.render_ancestor(p))
            .map(Box::new);
        Some(ThreadItemView::Post(Box::new(ThreadPostView {
            post: anchor.post.clone(),
            parent,
            replies: self.render_children(self.anchor),
        })))
    }

    fn render_ancestor(&self, index: usize) -> Option<ThreadItemView> {
        let node = self.nodes.get(index)?;
        let parent = node
            .parent
            .filter(|&p| p < index)
            .and_then(|p| self.render_ancestor(p))
            .map(Box::new);
        Some(ThreadItemView::Post(Box::new(ThreadPostView {
            post: node.post.clone(),
            parent,
            replies: None,
        })))
    }

    fn render_children(&self, index: usize) -> Option<Vec<ThreadItemView>> {
        let node = self.nodes.get(index)?;
        let rendered: Vec<ThreadItemView> = node
            .children
            .iter()
            .filter(|&&child| child > index)
            .filter_map(|&child| {
                let reply = self.nodes.get(child)?;
                Some(ThreadItemView::Post(Box::new(ThreadPostView {
                    post: reply.post.clone(),
                    parent: None,
                    replies: self.render_children(child),
                })))
            })
            .collect();
        if rendered.is_empty() {
            None
        } else {
            Some(rendered)
        }
    }
}

/// Lightweight parent/root context for feed cards, no tree assembly
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadContext {
    pub has_parent: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root_author_did: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_author_did: Option<String>,
}

enum Assembly {
    Tree(ThreadTree),
    NotFound,
    Blocked,
}

/// Assembles threads against one store and cache. Every entry builds its
/// own [`Loaders`], so memoized reads never outlive a single assembly and a
/// held assembler never leaks them across requests.
pub struct ThreadAssembler {
    store: Arc<dyn RecordStore>,
    cache: ResultCache,
    hydration: HydrationConfig,
    config: ThreadConfig,
}

struct WalkNode {
    record: PostRecord,
    children: Vec<usize>,
    depth: i32,
}

impl ThreadAssembler {
    pub fn new(
        store: Arc<dyn RecordStore>,
        cache: ResultCache,
        hydration: HydrationConfig,
        config: ThreadConfig,
    ) -> Self {
        Self {
            store,
            cache,
            hydration,
            config,
        }
    }

    /// Loader bundle scoped to one call; dropping it releases the memos
    fn request_loaders(&self) -> Loaders {
        Loaders::new(self.store.clone(), self.config.reply_page_limit)
    }

    /// Assemble the thread around `anchor_uri`. `Ok(None)` when the anchor
    /// is absent, taken down, or block-hidden from the viewer.
    pub async fn assemble_thread(
        &self,
        anchor_uri: &str,
        depth: Option<u32>,
        parent_height: Option<u32>,
        viewer_did: Option<&str>,
    ) -> AppViewResult<Option<ThreadTree>> {
        match self
            .assemble_inner(anchor_uri, depth, parent_height, viewer_did)
            .await?
        {
            Assembly::Tree(tree) => Ok(Some(tree)),
            Assembly::NotFound | Assembly::Blocked => Ok(None),
        }
    }

    /// Like [`assemble_thread`](Self::assemble_thread), rendered to the
    /// nested wire shape with tombstones for absent or blocked anchors.
    pub async fn thread_view(
        &self,
        anchor_uri: &str,
        depth: Option<u32>,
        parent_height: Option<u32>,
        viewer_did: Option<&str>,
    ) -> AppViewResult<ThreadItemView> {
        let rendered = match self
            .assemble_inner(anchor_uri, depth, parent_height, viewer_did)
            .await?
        {
            Assembly::Tree(tree) => tree.render(),
            Assembly::Blocked => Some(ThreadItemView::Blocked {
                uri: anchor_uri.to_string(),
            }),
            Assembly::NotFound => None,
        };
        Ok(rendered.unwrap_or(ThreadItemView::NotFound {
            uri: anchor_uri.to_string(),
        }))
    }

    async fn assemble_inner(
        &self,
        anchor_uri: &str,
        depth: Option<u32>,
        parent_height: Option<u32>,
        viewer_did: Option<&str>,
    ) -> AppViewResult<Assembly> {
        AtUri::parse(anchor_uri)?;
        let depth = depth
            .unwrap_or(self.config.default_depth)
            .min(self.config.max_depth);
        let parent_height = parent_height
            .unwrap_or(self.config.default_parent_height)
            .min(self.config.max_parent_height);

        let cache_key = thread_cache_key(anchor_uri, depth, parent_height, viewer_did);
        if let Some(tree) = self
            .cache
            .get::<ThreadTree>(namespaces::THREAD, &cache_key)
            .await
        {
            record_thread_cached();
            return Ok(Assembly::Tree(tree));
        }
        let started = Instant::now();
        let loaders = self.request_loaders();

        let anchor = match loaders.posts.load(anchor_uri.to_string()).await? {
            Some(post) if post.takedown_ref.is_none() => post,
            _ => return Ok(Assembly::NotFound),
        };

        let viewer_ctx = match viewer_did {
            Some(did) => ViewerContextBuilder::new(self.store.clone()).build(did).await,
            None => ViewerContext::default(),
        };
        if viewer_ctx.blocks(&anchor.author_did) {
            return Ok(Assembly::Blocked);
        }

        // Ancestor walk, nearest first. Hidden ancestors are spliced out of
        // the chain without counting against the height bound; a missing
        // parent ends the walk.
        let mut ancestors: Vec<PostRecord> = Vec::new();
        let mut topmost_loaded: Option<PostRecord> = None;
        let mut walked: HashSet<String> = HashSet::new();
        walked.insert(anchor.uri.clone());
        let mut cursor = anchor.parent_uri.clone();
        while ancestors.len() < parent_height as usize {
            let Some(parent_uri) = cursor else { break };
            if !walked.insert(parent_uri.clone()) {
                warn!(
                    "Parent cycle at {} while walking ancestors of {}",
                    parent_uri, anchor_uri
                );
                break;
            }
            let Some(parent) = loaders.posts.load(parent_uri).await? else {
                break;
            };
            cursor = parent.parent_uri.clone();
            topmost_loaded = Some(parent.clone());
            if parent.takedown_ref.is_some() || viewer_ctx.hides_actor(&parent.author_did) {
                continue;
            }
            ancestors.push(parent);
        }

        // The gate lives on the thread root: the topmost post the walk
        // reached, the anchor itself when there are no ancestors
        let root = topmost_loaded.unwrap_or_else(|| anchor.clone());
        let gate_ctx = self.gate_context(&loaders, &root).await;

        let mut arena: Vec<WalkNode> = Vec::with_capacity(ancestors.len() + 1);
        let height = ancestors.len();
        for (i, record) in ancestors.iter().rev().cloned().enumerate() {
            arena.push(WalkNode {
                record,
                children: Vec::new(),
                depth: i as i32 - height as i32,
            });
            if i > 0 {
                arena[i - 1].children.push(i);
            }
        }
        let anchor_index = arena.len();
        arena.push(WalkNode {
            record: anchor.clone(),
            children: Vec::new(),
            depth: 0,
        });
        if anchor_index > 0 {
            arena[anchor_index - 1].children.push(anchor_index);
        }

        // Descendant walk, breadth-first: one reply batch and one engagement
        // batch per level
        let mut frontier: Vec<usize> = vec![anchor_index];
        for _ in 0..depth {
            if frontier.is_empty() {
                break;
            }
            let parent_uris: Vec<String> = frontier
                .iter()
                .map(|&i| arena[i].record.uri.clone())
                .collect();
            let reply_lists = loaders.replies.load_many(&parent_uris).await?;

            let mut level_candidates: Vec<(usize, Vec<PostRecord>)> = Vec::new();
            for (&parent_index, replies) in frontier.iter().zip(reply_lists) {
                let qualifying: Vec<PostRecord> = replies
                    .into_iter()
                    .filter(|reply| reply.takedown_ref.is_none())
                    .filter(|reply| !walked.contains(&reply.uri))
                    .filter(|reply| !viewer_ctx.hides_actor(&reply.author_did))
                    .filter(|reply| !gate_ctx.hides(&reply.uri))
                    .filter(|reply| gate_ctx.permits(&reply.author_did))
                    .collect();
                level_candidates.push((parent_index, qualifying));
            }

            let level_uris: Vec<String> = level_candidates
                .iter()
                .flat_map(|(_, replies)| replies.iter().map(|r| r.uri.clone()))
                .collect();
            let engagement: HashMap<String, i64> =
                match loaders.aggregations.load_many(&level_uris).await {
                    Ok(values) => level_uris
                        .iter()
                        .cloned()
                        .zip(values.into_iter().map(|agg| agg.engagement()))
                        .collect(),
                    Err(e) => {
                        warn!("Degrading reply engagement sort: {}", e);
                        HashMap::new()
                    }
                };

            let mut next_frontier: Vec<usize> = Vec::new();
            for (parent_index, mut replies) in level_candidates {
                sort_replies(&mut replies, &root.author_did, &engagement);
                if parent_index != anchor_index {
                    replies.truncate(self.config.branching_factor as usize);
                }
                let parent_depth = arena[parent_index].depth;
                for reply in replies {
                    if !walked.insert(reply.uri.clone()) {
                        continue;
                    }
                    let index = arena.len();
                    arena.push(WalkNode {
                        record: reply,
                        children: Vec::new(),
                        depth: parent_depth + 1,
                    });
                    arena[parent_index].children.push(index);
                    next_frontier.push(index);
                }
            }
            frontier = next_frontier;
        }

        // One hydration pass over every walked node, then drop whatever
        // cannot be rendered: an unrenderable ancestor truncates the chain
        // above it, an unrenderable reply drops its subtree
        let node_uris: Vec<String> = arena.iter().map(|node| node.record.uri.clone()).collect();
        let hydrator = Hydrator::new(&loaders, &self.hydration);
        let snapshot = hydrator.hydrate(&node_uris, viewer_did).await?;
        let image_uris = ImageUriBuilder::new(
            self.hydration.cdn_url.clone(),
            self.hydration.video_url.clone(),
        );
        let mut views: Vec<Option<PostView>> = arena
            .iter()
            .map(|node| {
                if snapshot.is_taken_down(&node.record.uri) {
                    None
                } else {
                    snapshot.post_view(&node.record.uri, &image_uris)
                }
            })
            .collect();

        let Some(anchor_post) = views[anchor_index].take() else {
            return Ok(Assembly::NotFound);
        };

        let mut nodes: Vec<ThreadNode> = Vec::new();
        let mut chain_start = anchor_index;
        while chain_start > 0 && views[chain_start - 1].is_some() {
            chain_start -= 1;
        }
        for i in chain_start..anchor_index {
            let Some(post) = views[i].take() else { break };
            let index = nodes.len();
            nodes.push(ThreadNode {
                uri: arena[i].record.uri.clone(),
                depth: i as i32 - anchor_index as i32,
                parent: index.checked_sub(1),
                children: Vec::new(),
                post,
            });
            if index > 0 {
                nodes[index - 1].children.push(index);
            }
        }

        let anchor_final = nodes.len();
        nodes.push(ThreadNode {
            uri: anchor.uri.clone(),
            depth: 0,
            parent: anchor_final.checked_sub(1),
            children: Vec::new(),
            post: anchor_post,
        });
        if anchor_final > 0 {
            nodes[anchor_final - 1].children.push(anchor_final);
        }

        let mut queue: VecDeque<(usize, usize)> = arena[anchor_index]
            .children
            .iter()
            .map(|&child| (child, anchor_final))
            .collect();
        while let Some((i, parent_final)) = queue.pop_front() {
            let Some(post) = views[i].take() else { continue };
            let index = nodes.len();
            nodes.push(ThreadNode {
                uri: arena[i].record.uri.clone(),
                depth: arena[i].depth,
                parent: Some(parent_final),
                children: Vec::new(),
                post,
            });
            nodes[parent_final].children.push(index);
            for &child in &arena[i].children {
                queue.push_back((child, index));
            }
        }

        let tree = ThreadTree {
            nodes,
            anchor: anchor_final,
        };
        self.cache
            .set(
                namespaces::THREAD,
                &cache_key,
                &tree,
                self.cache.config().thread_ttl,
            )
            .await;
        record_thread_assembled(tree.nodes.len(), started.elapsed().as_secs_f64());
        debug!(
            "Assembled thread {} ({} nodes, depth {}, height {}) for {}",
            anchor_uri,
            tree.nodes.len(),
            depth,
            parent_height,
            viewer_did.unwrap_or("public")
        );
        Ok(Assembly::Tree(tree))
    }

    /// Gate context for a root post, cached viewer-independently with the
    /// longer gate TTL. Degraded builds are served for the current request
    /// but never cached.
    async fn gate_context(&self, loaders: &Loaders, root: &PostRecord) -> GateContext {
        let key = encode_key_part(&root.uri);
        if let Some(ctx) = self.cache.get::<GateContext>(namespaces::GATE, &key).await {
            return ctx;
        }
        let (gate, gate_degraded) = match loaders.thread_gates.load(root.uri.clone()).await {
            Ok(gate) => (gate, false),
            Err(e) => {
                warn!("Degrading reply gate for {}: {}", root.uri, e);
                (None, true)
            }
        };
        let ctx = GateContext::build(self.store.as_ref(), root, gate.as_ref()).await;
        // Only complete builds go in the cache; a degraded ruling must not
        // outlive the request that hit the failure
        if !gate_degraded && !ctx.degraded {
            self.cache
                .set(namespaces::GATE, &key, &ctx, self.cache.config().gate_ttl)
                .await;
        }
        ctx
    }

    /// Parent/root author context for one post, at most three loads.
    /// `Ok(None)` when the post is absent.
    pub async fn thread_context(&self, uri: &str) -> AppViewResult<Option<ThreadContext>> {
        AtUri::parse(uri)?;
        let key = encode_key_part(uri);
        if let Some(ctx) = self
            .cache
            .get::<ThreadContext>(namespaces::THREAD_CONTEXT, &key)
            .await
        {
            return Ok(Some(ctx));
        }

        let loaders = self.request_loaders();
        let Some(post) = loaders.posts.load(uri.to_string()).await? else {
            return Ok(None);
        };
        // A deleted parent or root still names its author in the URI
        // authority, which is all the context callers need
        let parent_author_did = match &post.parent_uri {
            Some(parent_uri) => match loaders.posts.load(parent_uri.clone()).await? {
                Some(parent) => Some(parent.author_did),
                None => did_from_uri(parent_uri).map(str::to_string),
            },
            None => None,
        };
        let root_author_did = match &post.root_uri {
            Some(root_uri) => match loaders.posts.load(root_uri.clone()).await? {
                Some(root) => Some(root.author_did),
                None => did_from_uri(root_uri).map(str::to_string),
            },
            None => None,
        };

        let ctx = ThreadContext {
            has_parent: post.parent_uri.is_some(),
            root_author_did,
            parent_author_did,
        };
        self.cache
            .set(
                namespaces::THREAD_CONTEXT,
                &key,
                &ctx,
                self.cache.config().default_ttl,
            )
            .await;
        Ok(Some(ctx))
    }

    /// Count descendants of `uri` down to `max_depth` levels (default 3),
    /// for reply-count badges.
    pub async fn count_replies(&self, uri: &str, max_depth: Option<u32>) -> AppViewResult<i64> {
        AtUri::parse(uri)?;
        let depth = max_depth.unwrap_or(DEFAULT_COUNT_DEPTH);
        let key = format!("{}:{}", encode_key_part(uri), depth);
        if let Some(count) = self.cache.get::<i64>(namespaces::REPLY_COUNT, &key).await {
            return Ok(count);
        }
        let count = self.store.count_thread_replies(uri, depth).await?;
        self.cache
            .set(
                namespaces::REPLY_COUNT,
                &key,
                &count,
                self.cache.config().default_ttl,
            )
            .await;
        Ok(count)
    }

    /// Drop every cached tree, count, context and gate anchored at `uri`.
    /// The ingestion side calls this on new replies and gate or moderation
    /// changes; TTL expiry remains the backstop when it does not.
    pub async fn invalidate(&self, uri: &str) -> u64 {
        let encoded = encode_key_part(uri);
        let prefix = format!("{}:", encoded);
        let mut removed = self
            .cache
            .invalidate_prefix(namespaces::THREAD, &prefix)
            .await;
        removed += self
            .cache
            .invalidate_prefix(namespaces::REPLY_COUNT, &prefix)
            .await;
        self.cache
            .invalidate(namespaces::THREAD_CONTEXT, &encoded)
            .await;
        self.cache.invalidate(namespaces::GATE, &encoded).await;
        removed
    }
}

/// Total order for sibling replies: the root author's posts first, then by
/// likes + reposts descending, then by creation time descending. Stable, so
/// re-sorting sorted input is a no-op.
fn sort_replies(
    replies: &mut [PostRecord],
    root_author_did: &str,
    engagement: &HashMap<String, i64>,
) {
    replies.sort_by(|a, b| {
        let a_op = a.author_did == root_author_did;
        let b_op = b.author_did == root_author_did;
        b_op.cmp(&a_op)
            .then_with(|| {
                let ea = engagement.get(&a.uri).copied().unwrap_or(0);
                let eb = engagement.get(&b.uri).copied().unwrap_or(0);
                eb.cmp(&ea)
            })
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
}

fn thread_cache_key(
    anchor_uri: &str,
    depth: u32,
    parent_height: u32,
    viewer_did: Option<&str>,
) -> String {
    let viewer = viewer_did
        .map(encode_key_part)
        .unwrap_or_else(|| "public".to_string());
    format!(
        "{}:{}:{}:{}",
        encode_key_part(anchor_uri),
        depth,
        parent_height,
        viewer
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn reply_record(uri: &str, author: &str, age_secs: i64) -> PostRecord {
        PostRecord {
            uri: uri.to_string(),
            cid: format!("cid-{}", uri),
            author_did: author.to_string(),
            text: "reply".to_string(),
            parent_uri: Some("at://did:plc:root/app.bsky.feed.post/root".to_string()),
            root_uri: Some("at://did:plc:root/app.bsky.feed.post/root".to_string()),
            embed: None,
            mention_dids: Vec::new(),
            created_at: Utc::now() - Duration::seconds(age_secs),
            indexed_at: Utc::now(),
            takedown_ref: None,
        }
    }

    #[test]
    fn test_sort_puts_root_author_first_then_engagement_then_recency() {
        let mut replies = vec![
            reply_record("at://x/p/old", "did:plc:b", 300),
            reply_record("at://x/p/hot", "did:plc:c", 200),
            reply_record("at://x/p/op", "did:plc:root", 100),
            reply_record("at://x/p/new", "did:plc:d", 10),
        ];
        let engagement: HashMap<String, i64> =
            [("at://x/p/hot".to_string(), 50)].into_iter().collect();

        sort_replies(&mut replies, "did:plc:root", &engagement);

        let order: Vec<&str> = replies.iter().map(|r| r.uri.as_str()).collect();
        assert_eq!(order, vec!["at://x/p/op", "at://x/p/hot", "at://x/p/new", "at://x/p/old"]);
    }

    #[test]
    fn test_sort_is_idempotent() {
        let mut replies = vec![
            reply_record("at://x/p/1", "did:plc:a", 30),
            reply_record("at://x/p/2", "did:plc:b", 20),
            reply_record("at://x/p/3", "did:plc:c", 10),
        ];
        let engagement: HashMap<String, i64> = [
            ("at://x/p/1".to_string(), 5),
            ("at://x/p/2".to_string(), 5),
            ("at://x/p/3".to_string(), 1),
        ]
        .into_iter()
        .collect();

        sort_replies(&mut replies, "did:plc:root", &engagement);
        let first: Vec<String> = replies.iter().map(|r| r.uri.clone()).collect();
        sort_replies(&mut replies, "did:plc:root", &engagement);
        let second: Vec<String> = replies.iter().map(|r| r.uri.clone()).collect();

        assert_eq!(first, second);
        // equal engagement ties break on recency
        assert_eq!(first[0], "at://x/p/2");
        assert_eq!(first[1], "at://x/p/1");
    }

    #[test]
    fn test_cache_key_discriminates_viewer_and_escapes() {
        let public = thread_cache_key("at://did:plc:a/app.bsky.feed.post/1", 6, 80, None);
        let authed = thread_cache_key(
            "at://did:plc:a/app.bsky.feed.post/1",
            6,
            80,
            Some("did:plc:viewer"),
        );

        assert!(public.ends_with(":public"));
        assert_ne!(public, authed);
        // the anchor URI's own colons never produce separator collisions
        assert!(!public.contains("at://"));
        assert_eq!(public.matches(':').count(), 3);
    }

    #[test]
    fn test_render_skips_malformed_indices() {
        let post = PostView {
            uri: "at://x/p/1".to_string(),
            cid: "cid".to_string(),
            author: crate::views::ActorViewBasic {
                did: "did:plc:a".to_string(),
                handle: "a.test".to_string(),
                display_name: None,
                avatar: None,
                labels: Vec::new(),
            },
            text: "hi".to_string(),
            embed: None,
            like_count: 0,
            repost_count: 0,
            reply_count: 0,
            quote_count: 0,
            bookmark_count: 0,
            viewer: None,
            labels: Vec::new(),
            created_at: Utc::now(),
            indexed_at: Utc::now(),
        };
        // a child index pointing backwards must not recurse
        let tree = ThreadTree {
            nodes: vec![ThreadNode {
                uri: "at://x/p/1".to_string(),
                depth: 0,
                parent: None,
                children: vec![0],
                post,
            }],
            anchor: 0,
        };

        match tree.render() {
            Some(ThreadItemView::Post(node)) => assert!(node.replies.is_none()),
            other => panic!("expected anchor node, got {:?}", other),
        }
    }
}
