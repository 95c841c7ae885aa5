/// In-memory record store
///
/// Backs tests and embedded setups with the same accessor contract the
/// Postgres store implements. Fixture data is inserted through the
/// `insert_*`/`add_*` helpers; per-method call counters let tests assert
/// batching behavior, and [`MemoryRecordStore::fail_next`] scripts
/// transient accessor failures.
use crate::error::{AppViewError, AppViewResult};
use crate::store::models::*;
use crate::store::RecordStore;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::RwLock;

#[derive(Default)]
struct Tables {
    posts: HashMap<String, PostRecord>,
    actors: HashMap<String, ActorRecord>,
    aggregations: HashMap<String, PostAggregation>,
    labels: HashMap<String, Vec<LabelRecord>>,
    thread_gates: HashMap<String, ThreadGateRecord>,
    post_gates: HashMap<String, PostGateRecord>,
    /// follower DID -> subject DID -> follow record URI
    follows: HashMap<String, HashMap<String, String>>,
    /// blocker DID -> subject DID -> block record URI
    blocks: HashMap<String, HashMap<String, String>>,
    /// viewer DID -> muted DIDs
    mutes: HashMap<String, HashSet<String>>,
    /// viewer DID -> muted thread root URIs
    thread_mutes: HashMap<String, HashSet<String>>,
    /// viewer DID -> muted list URIs
    list_mutes: HashMap<String, Vec<String>>,
    /// list URI -> member DIDs
    list_members: HashMap<String, HashSet<String>>,
    /// viewer DID -> post URI -> like record URI
    likes: HashMap<String, HashMap<String, String>>,
    /// viewer DID -> post URI -> repost record URI
    reposts: HashMap<String, HashMap<String, String>>,
    /// viewer DID -> bookmarked post URIs
    bookmarks: HashMap<String, HashSet<String>>,
}

/// In-memory implementation of [`RecordStore`]
#[derive(Default)]
pub struct MemoryRecordStore {
    tables: RwLock<Tables>,
    total_calls: AtomicU64,
    calls_by_method: Mutex<HashMap<&'static str, u64>>,
    /// method -> remaining scripted failures
    failures: Mutex<HashMap<&'static str, u64>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn bump(&self, method: &'static str) -> AppViewResult<()> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut calls) = self.calls_by_method.lock() {
            *calls.entry(method).or_insert(0) += 1;
        }
        if let Ok(mut failures) = self.failures.lock() {
            if let Some(remaining) = failures.get_mut(method) {
                *remaining -= 1;
                if *remaining == 0 {
                    failures.remove(method);
                }
                return Err(AppViewError::Upstream(format!("{} unavailable", method)));
            }
        }
        Ok(())
    }

    /// Total accessor calls made against this store
    pub fn total_calls(&self) -> u64 {
        self.total_calls.load(Ordering::Relaxed)
    }

    /// Accessor calls made for one method (e.g. "get_posts")
    pub fn calls(&self, method: &str) -> u64 {
        self.calls_by_method
            .lock()
            .map(|calls| calls.get(method).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Reset the call counters (fixture data stays)
    pub fn reset_calls(&self) {
        self.total_calls.store(0, Ordering::Relaxed);
        if let Ok(mut calls) = self.calls_by_method.lock() {
            calls.clear();
        }
    }

    /// Make the next `count` calls to `method` fail with an upstream error
    pub fn fail_next(&self, method: &'static str, count: u64) {
        if count == 0 {
            return;
        }
        if let Ok(mut failures) = self.failures.lock() {
            *failures.entry(method).or_insert(0) += count;
        }
    }

    // ---- fixture helpers ----

    pub async fn insert_post(&self, post: PostRecord) {
        self.tables.write().await.posts.insert(post.uri.clone(), post);
    }

    pub async fn remove_post(&self, uri: &str) {
        self.tables.write().await.posts.remove(uri);
    }

    pub async fn insert_actor(&self, actor: ActorRecord) {
        self.tables
            .write()
            .await
            .actors
            .insert(actor.did.clone(), actor);
    }

    pub async fn set_aggregation(&self, uri: &str, agg: PostAggregation) {
        self.tables
            .write()
            .await
            .aggregations
            .insert(uri.to_string(), agg);
    }

    pub async fn add_label(&self, label: LabelRecord) {
        self.tables
            .write()
            .await
            .labels
            .entry(label.subject.clone())
            .or_default()
            .push(label);
    }

    pub async fn set_thread_gate(&self, gate: ThreadGateRecord) {
        self.tables
            .write()
            .await
            .thread_gates
            .insert(gate.post_uri.clone(), gate);
    }

    pub async fn set_post_gate(&self, gate: PostGateRecord) {
        self.tables
            .write()
            .await
            .post_gates
            .insert(gate.post_uri.clone(), gate);
    }

    pub async fn add_follow(&self, follower: &str, subject: &str, uri: &str) {
        self.tables
            .write()
            .await
            .follows
            .entry(follower.to_string())
            .or_default()
            .insert(subject.to_string(), uri.to_string());
    }

    pub async fn add_block(&self, blocker: &str, subject: &str, uri: &str) {
        self.tables
            .write()
            .await
            .blocks
            .entry(blocker.to_string())
            .or_default()
            .insert(subject.to_string(), uri.to_string());
    }

    pub async fn add_mute(&self, viewer: &str, subject: &str) {
        self.tables
            .write()
            .await
            .mutes
            .entry(viewer.to_string())
            .or_default()
            .insert(subject.to_string());
    }

    pub async fn add_thread_mute(&self, viewer: &str, root_uri: &str) {
        self.tables
            .write()
            .await
            .thread_mutes
            .entry(viewer.to_string())
            .or_default()
            .insert(root_uri.to_string());
    }

    pub async fn add_list_mute(&self, viewer: &str, list_uri: &str) {
        self.tables
            .write()
            .await
            .list_mutes
            .entry(viewer.to_string())
            .or_default()
            .push(list_uri.to_string());
    }

    pub async fn add_list_member(&self, list_uri: &str, member_did: &str) {
        self.tables
            .write()
            .await
            .list_members
            .entry(list_uri.to_string())
            .or_default()
            .insert(member_did.to_string());
    }

    pub async fn add_like(&self, viewer: &str, post_uri: &str, like_uri: &str) {
        self.tables
            .write()
            .await
            .likes
            .entry(viewer.to_string())
            .or_default()
            .insert(post_uri.to_string(), like_uri.to_string());
    }

    pub async fn add_repost(&self, viewer: &str, post_uri: &str, repost_uri: &str) {
        self.tables
            .write()
            .await
            .reposts
            .entry(viewer.to_string())
            .or_default()
            .insert(post_uri.to_string(), repost_uri.to_string());
    }

    pub async fn add_bookmark(&self, viewer: &str, post_uri: &str) {
        self.tables
            .write()
            .await
            .bookmarks
            .entry(viewer.to_string())
            .or_default()
            .insert(post_uri.to_string());
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get_posts(&self, uris: &[String]) -> AppViewResult<HashMap<String, PostRecord>> {
        self.bump("get_posts")?;
        let tables = self.tables.read().await;
        Ok(uris
            .iter()
            .filter_map(|uri| tables.posts.get(uri).map(|p| (uri.clone(), p.clone())))
            .collect())
    }

    async fn get_actors(&self, dids: &[String]) -> AppViewResult<HashMap<String, ActorRecord>> {
        self.bump("get_actors")?;
        let tables = self.tables.read().await;
        Ok(dids
            .iter()
            .filter_map(|did| tables.actors.get(did).map(|a| (did.clone(), a.clone())))
            .collect())
    }

    async fn get_aggregations(
        &self,
        uris: &[String],
    ) -> AppViewResult<HashMap<String, PostAggregation>> {
        self.bump("get_aggregations")?;
        let tables = self.tables.read().await;
        Ok(uris
            .iter()
            .filter_map(|uri| tables.aggregations.get(uri).map(|a| (uri.clone(), *a)))
            .collect())
    }

    async fn get_post_viewer_states(
        &self,
        viewer: &str,
        uris: &[String],
    ) -> AppViewResult<HashMap<String, PostViewerState>> {
        self.bump("get_post_viewer_states")?;
        let tables = self.tables.read().await;
        let likes = tables.likes.get(viewer);
        let reposts = tables.reposts.get(viewer);
        let bookmarks = tables.bookmarks.get(viewer);
        let thread_mutes = tables.thread_mutes.get(viewer);

        let mut out = HashMap::new();
        for uri in uris {
            let root = tables
                .posts
                .get(uri)
                .and_then(|p| p.root_uri.clone())
                .unwrap_or_else(|| uri.clone());
            let state = PostViewerState {
                like_uri: likes.and_then(|m| m.get(uri).cloned()),
                repost_uri: reposts.and_then(|m| m.get(uri).cloned()),
                bookmarked: bookmarks.map(|s| s.contains(uri)).unwrap_or(false),
                thread_muted: thread_mutes.map(|s| s.contains(&root)).unwrap_or(false),
            };
            if state != PostViewerState::default() {
                out.insert(uri.clone(), state);
            }
        }
        Ok(out)
    }

    async fn get_actor_relationships(
        &self,
        viewer: &str,
        dids: &[String],
    ) -> AppViewResult<HashMap<String, ActorRelationship>> {
        self.bump("get_actor_relationships")?;
        let tables = self.tables.read().await;

        // Expand the viewer's muted lists once per call, not per subject
        let mut list_muted: HashSet<&String> = HashSet::new();
        if let Some(list_uris) = tables.list_mutes.get(viewer) {
            for list_uri in list_uris {
                if let Some(members) = tables.list_members.get(list_uri) {
                    list_muted.extend(members.iter());
                }
            }
        }

        let mut out = HashMap::new();
        for did in dids {
            let rel = ActorRelationship {
                following_uri: tables
                    .follows
                    .get(viewer)
                    .and_then(|m| m.get(did).cloned()),
                followed_by_uri: tables
                    .follows
                    .get(did)
                    .and_then(|m| m.get(viewer).cloned()),
                blocking_uri: tables.blocks.get(viewer).and_then(|m| m.get(did).cloned()),
                blocked_by: tables
                    .blocks
                    .get(did)
                    .map(|m| m.contains_key(viewer))
                    .unwrap_or(false),
                muted: tables
                    .mutes
                    .get(viewer)
                    .map(|s| s.contains(did))
                    .unwrap_or(false)
                    || list_muted.contains(did),
            };
            if rel != ActorRelationship::default() {
                out.insert(did.clone(), rel);
            }
        }
        Ok(out)
    }

    async fn get_labels(
        &self,
        subjects: &[String],
    ) -> AppViewResult<HashMap<String, Vec<LabelRecord>>> {
        self.bump("get_labels")?;
        let tables = self.tables.read().await;
        Ok(subjects
            .iter()
            .filter_map(|s| {
                tables.labels.get(s).map(|labels| {
                    let mut labels = labels.clone();
                    labels.sort_by(|a, b| a.created_at.cmp(&b.created_at));
                    (s.clone(), labels)
                })
            })
            .collect())
    }

    async fn get_thread_gates(
        &self,
        post_uris: &[String],
    ) -> AppViewResult<HashMap<String, ThreadGateRecord>> {
        self.bump("get_thread_gates")?;
        let tables = self.tables.read().await;
        Ok(post_uris
            .iter()
            .filter_map(|uri| {
                tables
                    .thread_gates
                    .get(uri)
                    .map(|g| (uri.clone(), g.clone()))
            })
            .collect())
    }

    async fn get_post_gates(
        &self,
        post_uris: &[String],
    ) -> AppViewResult<HashMap<String, PostGateRecord>> {
        self.bump("get_post_gates")?;
        let tables = self.tables.read().await;
        Ok(post_uris
            .iter()
            .filter_map(|uri| tables.post_gates.get(uri).map(|g| (uri.clone(), g.clone())))
            .collect())
    }

    async fn get_replies(
        &self,
        parent_uris: &[String],
        limit_per_parent: u32,
    ) -> AppViewResult<HashMap<String, Vec<PostRecord>>> {
        self.bump("get_replies")?;
        let tables = self.tables.read().await;
        let mut out: HashMap<String, Vec<PostRecord>> = HashMap::new();
        for parent in parent_uris {
            let mut replies: Vec<PostRecord> = tables
                .posts
                .values()
                .filter(|p| {
                    p.parent_uri.as_deref() == Some(parent.as_str()) && p.takedown_ref.is_none()
                })
                .cloned()
                .collect();
            // Newest first; URI breaks created_at ties so pagination at the
            // cap boundary stays deterministic
            replies.sort_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then_with(|| b.uri.cmp(&a.uri))
            });
            replies.truncate(limit_per_parent as usize);
            if !replies.is_empty() {
                out.insert(parent.clone(), replies);
            }
        }
        Ok(out)
    }

    async fn get_following_dids(&self, did: &str) -> AppViewResult<HashSet<String>> {
        self.bump("get_following_dids")?;
        let tables = self.tables.read().await;
        Ok(tables
            .follows
            .get(did)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_follower_dids(&self, did: &str) -> AppViewResult<HashSet<String>> {
        self.bump("get_follower_dids")?;
        let tables = self.tables.read().await;
        Ok(tables
            .follows
            .iter()
            .filter(|(_, subjects)| subjects.contains_key(did))
            .map(|(follower, _)| follower.clone())
            .collect())
    }

    async fn get_blocking_dids(&self, viewer: &str) -> AppViewResult<HashSet<String>> {
        self.bump("get_blocking_dids")?;
        let tables = self.tables.read().await;
        Ok(tables
            .blocks
            .get(viewer)
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn get_blocked_by_dids(&self, viewer: &str) -> AppViewResult<HashSet<String>> {
        self.bump("get_blocked_by_dids")?;
        let tables = self.tables.read().await;
        Ok(tables
            .blocks
            .iter()
            .filter(|(_, subjects)| subjects.contains_key(viewer))
            .map(|(blocker, _)| blocker.clone())
            .collect())
    }

    async fn get_muted_dids(&self, viewer: &str) -> AppViewResult<HashSet<String>> {
        self.bump("get_muted_dids")?;
        let tables = self.tables.read().await;
        Ok(tables.mutes.get(viewer).cloned().unwrap_or_default())
    }

    async fn get_muted_thread_roots(&self, viewer: &str) -> AppViewResult<HashSet<String>> {
        self.bump("get_muted_thread_roots")?;
        let tables = self.tables.read().await;
        Ok(tables.thread_mutes.get(viewer).cloned().unwrap_or_default())
    }

    async fn get_muted_list_uris(&self, viewer: &str) -> AppViewResult<Vec<String>> {
        self.bump("get_muted_list_uris")?;
        let tables = self.tables.read().await;
        Ok(tables.list_mutes.get(viewer).cloned().unwrap_or_default())
    }

    async fn get_list_members(&self, list_uris: &[String]) -> AppViewResult<HashSet<String>> {
        self.bump("get_list_members")?;
        let tables = self.tables.read().await;
        let mut members = HashSet::new();
        for list_uri in list_uris {
            if let Some(list) = tables.list_members.get(list_uri) {
                members.extend(list.iter().cloned());
            }
        }
        Ok(members)
    }

    async fn count_thread_replies(&self, root_uri: &str, max_depth: u32) -> AppViewResult<i64> {
        self.bump("count_thread_replies")?;
        let tables = self.tables.read().await;

        // Build a parent -> children index once, then walk level by level.
        // Taken-down posts are not counted and not descended through.
        let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
        for post in tables.posts.values() {
            if post.takedown_ref.is_some() {
                continue;
            }
            if let Some(parent) = post.parent_uri.as_deref() {
                children.entry(parent).or_default().push(&post.uri);
            }
        }

        let mut count: i64 = 0;
        let mut frontier: Vec<&str> = vec![root_uri];
        let mut seen: HashSet<&str> = HashSet::new();
        for _ in 0..max_depth {
            let mut next = Vec::new();
            for parent in frontier {
                if let Some(kids) = children.get(parent) {
                    for kid in kids {
                        if seen.insert(kid) {
                            count += 1;
                            next.push(*kid);
                        }
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            frontier = next;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn post(uri: &str, author: &str, parent: Option<&str>) -> PostRecord {
        PostRecord {
            uri: uri.to_string(),
            cid: format!("cid-{}", uri),
            author_did: author.to_string(),
            text: "hello".to_string(),
            parent_uri: parent.map(String::from),
            root_uri: None,
            embed: None,
            mention_dids: Vec::new(),
            created_at: Utc::now(),
            indexed_at: Utc::now(),
            takedown_ref: None,
        }
    }

    #[tokio::test]
    async fn test_absent_posts_are_omitted() {
        let store = MemoryRecordStore::new();
        store
            .insert_post(post("at://did:plc:a/app.bsky.feed.post/1", "did:plc:a", None))
            .await;

        let found = store
            .get_posts(&[
                "at://did:plc:a/app.bsky.feed.post/1".to_string(),
                "at://did:plc:a/app.bsky.feed.post/missing".to_string(),
            ])
            .await
            .unwrap();

        assert_eq!(found.len(), 1);
        assert!(found.contains_key("at://did:plc:a/app.bsky.feed.post/1"));
    }

    #[tokio::test]
    async fn test_scripted_failures_consume_then_recover() {
        let store = MemoryRecordStore::new();
        store.fail_next("get_posts", 1);

        assert!(store.get_posts(&[]).await.is_err());
        assert!(store.get_posts(&[]).await.is_ok());
        // other methods are unaffected
        assert!(store.get_actors(&[]).await.is_ok());
        // failed calls still count
        assert_eq!(store.calls("get_posts"), 2);
    }

    #[tokio::test]
    async fn test_relationship_directions_are_distinct() {
        let store = MemoryRecordStore::new();
        store
            .add_block("did:plc:bea", "did:plc:viewer", "at://did:plc:bea/block/1")
            .await;

        let rels = store
            .get_actor_relationships("did:plc:viewer", &["did:plc:bea".to_string()])
            .await
            .unwrap();

        let rel = &rels["did:plc:bea"];
        assert!(rel.blocking_uri.is_none());
        assert!(rel.blocked_by);
    }

    #[tokio::test]
    async fn test_list_mute_expands_to_members() {
        let store = MemoryRecordStore::new();
        let list = "at://did:plc:viewer/app.bsky.graph.list/spam";
        store.add_list_mute("did:plc:viewer", list).await;
        store.add_list_member(list, "did:plc:spammer").await;

        let rels = store
            .get_actor_relationships("did:plc:viewer", &["did:plc:spammer".to_string()])
            .await
            .unwrap();
        assert!(rels["did:plc:spammer"].muted);
    }

    #[tokio::test]
    async fn test_count_thread_replies_depth_bound() {
        let store = MemoryRecordStore::new();
        let root = "at://did:plc:a/app.bsky.feed.post/root";
        store.insert_post(post(root, "did:plc:a", None)).await;
        store
            .insert_post(post(
                "at://did:plc:b/app.bsky.feed.post/r1",
                "did:plc:b",
                Some(root),
            ))
            .await;
        store
            .insert_post(post(
                "at://did:plc:c/app.bsky.feed.post/r2",
                "did:plc:c",
                Some("at://did:plc:b/app.bsky.feed.post/r1"),
            ))
            .await;

        assert_eq!(store.count_thread_replies(root, 1).await.unwrap(), 1);
        assert_eq!(store.count_thread_replies(root, 2).await.unwrap(), 2);
        assert_eq!(store.count_thread_replies(root, 10).await.unwrap(), 2);
    }
}
