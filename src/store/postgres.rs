/// PostgreSQL record store
///
/// Read-only accessor over the tables the ingestion pipeline maintains.
/// Every lookup is batched with `= ANY($1)` so one loader flush costs one
/// round trip per record kind.
use crate::config::StoreConfig;
use crate::error::{AppViewError, AppViewResult};
use crate::store::models::*;
use crate::store::RecordStore;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use tracing::{error, info, warn};

/// PostgreSQL implementation of [`RecordStore`]
#[derive(Clone)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    /// Connect a new pool using the store configuration
    pub async fn connect(config: &StoreConfig) -> AppViewResult<Self> {
        info!("Connecting to PostgreSQL record store...");
        info!("  Max connections: {}", config.max_connections);
        info!("  Min connections: {}", config.min_connections);

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(std::time::Duration::from_secs(config.connect_timeout))
            .connect(&config.database_url)
            .await
            .map_err(|e| {
                error!("Failed to connect to PostgreSQL: {}", e);
                AppViewError::Database(e)
            })?;

        info!("✓ PostgreSQL connection established");

        Ok(Self { pool })
    }

    /// Wrap an existing pool (tests, shared pools)
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn post_from_row(row: &PgRow) -> PostRecord {
    let uri: String = row.get("uri");
    let embed = parse_embed(row.get("embed_json"), &uri);
    PostRecord {
        cid: row.get("cid"),
        author_did: row.get("author_did"),
        text: row.get("text"),
        parent_uri: row.get("parent_uri"),
        root_uri: row.get("root_uri"),
        embed,
        mention_dids: parse_string_list(row.get("mention_dids")),
        created_at: row.get("created_at"),
        indexed_at: row.get("indexed_at"),
        takedown_ref: row.get("takedown_ref"),
        uri,
    }
}

fn actor_from_row(row: &PgRow) -> ActorRecord {
    ActorRecord {
        did: row.get("did"),
        handle: row.get("handle"),
        display_name: row.get("display_name"),
        avatar_cid: row.get("avatar_cid"),
        is_labeler: row.get("is_labeler"),
        indexed_at: row.get("indexed_at"),
        deactivated_at: row.get("deactivated_at"),
        takedown_ref: row.get("takedown_ref"),
    }
}

/// Decode a stored embed blob. An unparseable blob degrades to the
/// `Unknown` variant instead of failing the whole batch.
fn parse_embed(raw: Option<String>, uri: &str) -> Option<EmbedSpec> {
    let raw = raw?;
    match serde_json::from_str(&raw) {
        Ok(spec) => Some(spec),
        Err(e) => {
            warn!("Unparseable embed on {}: {}", uri, e);
            Some(EmbedSpec::Unknown)
        }
    }
}

fn parse_string_list(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn parse_gate_rules(raw: Option<String>, uri: &str) -> Option<ThreadGateRules> {
    let raw = raw?;
    match serde_json::from_str(&raw) {
        Ok(rules) => Some(rules),
        Err(e) => {
            warn!("Unparseable thread gate rules on {}: {}", uri, e);
            None
        }
    }
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn get_posts(&self, uris: &[String]) -> AppViewResult<HashMap<String, PostRecord>> {
        if uris.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            "SELECT uri, cid, author_did, text, parent_uri, root_uri, embed_json,
                    mention_dids, created_at, indexed_at, takedown_ref
             FROM posts
             WHERE uri = ANY($1)",
        )
        .bind(uris)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let post = post_from_row(row);
                (post.uri.clone(), post)
            })
            .collect())
    }

    async fn get_actors(&self, dids: &[String]) -> AppViewResult<HashMap<String, ActorRecord>> {
        if dids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            "SELECT did, handle, display_name, avatar_cid, is_labeler, indexed_at,
                    deactivated_at, takedown_ref
             FROM actors
             WHERE did = ANY($1)",
        )
        .bind(dids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let actor = actor_from_row(row);
                (actor.did.clone(), actor)
            })
            .collect())
    }

    async fn get_aggregations(
        &self,
        uris: &[String],
    ) -> AppViewResult<HashMap<String, PostAggregation>> {
        if uris.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            "SELECT uri, like_count, repost_count, reply_count, quote_count, bookmark_count
             FROM post_aggregations
             WHERE uri = ANY($1)",
        )
        .bind(uris)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                (
                    row.get::<String, _>("uri"),
                    PostAggregation {
                        like_count: row.get("like_count"),
                        repost_count: row.get("repost_count"),
                        reply_count: row.get("reply_count"),
                        quote_count: row.get("quote_count"),
                        bookmark_count: row.get("bookmark_count"),
                    },
                )
            })
            .collect())
    }

    async fn get_post_viewer_states(
        &self,
        viewer: &str,
        uris: &[String],
    ) -> AppViewResult<HashMap<String, PostViewerState>> {
        if uris.is_empty() {
            return Ok(HashMap::new());
        }
        let mut states: HashMap<String, PostViewerState> = HashMap::new();

        let likes = sqlx::query(
            "SELECT subject_uri, uri FROM likes
             WHERE creator_did = $1 AND subject_uri = ANY($2)",
        )
        .bind(viewer)
        .bind(uris)
        .fetch_all(&self.pool)
        .await?;
        for row in &likes {
            states
                .entry(row.get("subject_uri"))
                .or_default()
                .like_uri = Some(row.get("uri"));
        }

        let reposts = sqlx::query(
            "SELECT subject_uri, uri FROM reposts
             WHERE creator_did = $1 AND subject_uri = ANY($2)",
        )
        .bind(viewer)
        .bind(uris)
        .fetch_all(&self.pool)
        .await?;
        for row in &reposts {
            states
                .entry(row.get("subject_uri"))
                .or_default()
                .repost_uri = Some(row.get("uri"));
        }

        let bookmarks = sqlx::query(
            "SELECT subject_uri FROM bookmarks
             WHERE creator_did = $1 AND subject_uri = ANY($2)",
        )
        .bind(viewer)
        .bind(uris)
        .fetch_all(&self.pool)
        .await?;
        for row in &bookmarks {
            states
                .entry(row.get("subject_uri"))
                .or_default()
                .bookmarked = true;
        }

        // A thread mute covers every post whose root matches the muted root
        let thread_muted = sqlx::query(
            "SELECT p.uri FROM posts p
             JOIN thread_mutes tm ON tm.root_uri = COALESCE(p.root_uri, p.uri)
             WHERE tm.creator_did = $1 AND p.uri = ANY($2)",
        )
        .bind(viewer)
        .bind(uris)
        .fetch_all(&self.pool)
        .await?;
        for row in &thread_muted {
            states.entry(row.get("uri")).or_default().thread_muted = true;
        }

        Ok(states)
    }

    async fn get_actor_relationships(
        &self,
        viewer: &str,
        dids: &[String],
    ) -> AppViewResult<HashMap<String, ActorRelationship>> {
        if dids.is_empty() {
            return Ok(HashMap::new());
        }
        let mut rels: HashMap<String, ActorRelationship> = HashMap::new();

        let following = sqlx::query(
            "SELECT subject_did, uri FROM follows
             WHERE creator_did = $1 AND subject_did = ANY($2)",
        )
        .bind(viewer)
        .bind(dids)
        .fetch_all(&self.pool)
        .await?;
        for row in &following {
            rels.entry(row.get("subject_did")).or_default().following_uri =
                Some(row.get("uri"));
        }

        let followed_by = sqlx::query(
            "SELECT creator_did, uri FROM follows
             WHERE subject_did = $1 AND creator_did = ANY($2)",
        )
        .bind(viewer)
        .bind(dids)
        .fetch_all(&self.pool)
        .await?;
        for row in &followed_by {
            rels.entry(row.get("creator_did"))
                .or_default()
                .followed_by_uri = Some(row.get("uri"));
        }

        let blocking = sqlx::query(
            "SELECT subject_did, uri FROM blocks
             WHERE creator_did = $1 AND subject_did = ANY($2)",
        )
        .bind(viewer)
        .bind(dids)
        .fetch_all(&self.pool)
        .await?;
        for row in &blocking {
            rels.entry(row.get("subject_did")).or_default().blocking_uri =
                Some(row.get("uri"));
        }

        let blocked_by = sqlx::query(
            "SELECT creator_did FROM blocks
             WHERE subject_did = $1 AND creator_did = ANY($2)",
        )
        .bind(viewer)
        .bind(dids)
        .fetch_all(&self.pool)
        .await?;
        for row in &blocked_by {
            rels.entry(row.get("creator_did")).or_default().blocked_by = true;
        }

        let muted = sqlx::query(
            "SELECT subject_did FROM mutes
             WHERE creator_did = $1 AND subject_did = ANY($2)",
        )
        .bind(viewer)
        .bind(dids)
        .fetch_all(&self.pool)
        .await?;
        for row in &muted {
            rels.entry(row.get("subject_did")).or_default().muted = true;
        }

        let list_muted = sqlx::query(
            "SELECT DISTINCT li.subject_did FROM list_mutes lm
             JOIN list_items li ON li.list_uri = lm.list_uri
             WHERE lm.creator_did = $1 AND li.subject_did = ANY($2)",
        )
        .bind(viewer)
        .bind(dids)
        .fetch_all(&self.pool)
        .await?;
        for row in &list_muted {
            rels.entry(row.get("subject_did")).or_default().muted = true;
        }

        Ok(rels)
    }

    async fn get_labels(
        &self,
        subjects: &[String],
    ) -> AppViewResult<HashMap<String, Vec<LabelRecord>>> {
        if subjects.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            "SELECT src, subject, val, neg, created_at
             FROM labels
             WHERE subject = ANY($1)
             ORDER BY created_at ASC",
        )
        .bind(subjects)
        .fetch_all(&self.pool)
        .await?;

        let mut out: HashMap<String, Vec<LabelRecord>> = HashMap::new();
        for row in &rows {
            let label = LabelRecord {
                src: row.get("src"),
                subject: row.get("subject"),
                val: row.get("val"),
                neg: row.get("neg"),
                created_at: row.get::<DateTime<Utc>, _>("created_at"),
            };
            out.entry(label.subject.clone()).or_default().push(label);
        }
        Ok(out)
    }

    async fn get_thread_gates(
        &self,
        post_uris: &[String],
    ) -> AppViewResult<HashMap<String, ThreadGateRecord>> {
        if post_uris.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            "SELECT uri, post_uri, allow_json, hidden_uris, indexed_at
             FROM thread_gates
             WHERE post_uri = ANY($1)",
        )
        .bind(post_uris)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let uri: String = row.get("uri");
                let gate = ThreadGateRecord {
                    post_uri: row.get("post_uri"),
                    allow: parse_gate_rules(row.get("allow_json"), &uri),
                    hidden_uris: parse_string_list(row.get("hidden_uris")),
                    indexed_at: row.get("indexed_at"),
                    uri,
                };
                (gate.post_uri.clone(), gate)
            })
            .collect())
    }

    async fn get_post_gates(
        &self,
        post_uris: &[String],
    ) -> AppViewResult<HashMap<String, PostGateRecord>> {
        if post_uris.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(
            "SELECT uri, post_uri, disable_embedding, detached_uris, indexed_at
             FROM post_gates
             WHERE post_uri = ANY($1)",
        )
        .bind(post_uris)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let gate = PostGateRecord {
                    uri: row.get("uri"),
                    post_uri: row.get("post_uri"),
                    disable_embedding: row.get("disable_embedding"),
                    detached_uris: parse_string_list(row.get("detached_uris")),
                    indexed_at: row.get("indexed_at"),
                };
                (gate.post_uri.clone(), gate)
            })
            .collect())
    }

    async fn get_replies(
        &self,
        parent_uris: &[String],
        limit_per_parent: u32,
    ) -> AppViewResult<HashMap<String, Vec<PostRecord>>> {
        if parent_uris.is_empty() {
            return Ok(HashMap::new());
        }
        // ROW_NUMBER keeps the per-parent page to the newest N replies in a
        // single round trip for the whole frontier
        let rows = sqlx::query(
            "SELECT uri, cid, author_did, text, parent_uri, root_uri, embed_json,
                    mention_dids, created_at, indexed_at, takedown_ref
             FROM (
                 SELECT p.*, ROW_NUMBER() OVER (
                     PARTITION BY p.parent_uri
                     ORDER BY p.created_at DESC, p.uri DESC
                 ) AS rn
                 FROM posts p
                 WHERE p.parent_uri = ANY($1) AND p.takedown_ref IS NULL
             ) ranked
             WHERE rn <= $2",
        )
        .bind(parent_uris)
        .bind(limit_per_parent as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut out: HashMap<String, Vec<PostRecord>> = HashMap::new();
        for row in &rows {
            let post = post_from_row(row);
            if let Some(parent) = post.parent_uri.clone() {
                out.entry(parent).or_default().push(post);
            }
        }
        Ok(out)
    }

    async fn get_following_dids(&self, did: &str) -> AppViewResult<HashSet<String>> {
        let rows = sqlx::query("SELECT subject_did FROM follows WHERE creator_did = $1")
            .bind(did)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get("subject_did")).collect())
    }

    async fn get_follower_dids(&self, did: &str) -> AppViewResult<HashSet<String>> {
        let rows = sqlx::query("SELECT creator_did FROM follows WHERE subject_did = $1")
            .bind(did)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get("creator_did")).collect())
    }

    async fn get_blocking_dids(&self, viewer: &str) -> AppViewResult<HashSet<String>> {
        let rows = sqlx::query("SELECT subject_did FROM blocks WHERE creator_did = $1")
            .bind(viewer)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get("subject_did")).collect())
    }

    async fn get_blocked_by_dids(&self, viewer: &str) -> AppViewResult<HashSet<String>> {
        let rows = sqlx::query("SELECT creator_did FROM blocks WHERE subject_did = $1")
            .bind(viewer)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get("creator_did")).collect())
    }

    async fn get_muted_dids(&self, viewer: &str) -> AppViewResult<HashSet<String>> {
        let rows = sqlx::query("SELECT subject_did FROM mutes WHERE creator_did = $1")
            .bind(viewer)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get("subject_did")).collect())
    }

    async fn get_muted_thread_roots(&self, viewer: &str) -> AppViewResult<HashSet<String>> {
        let rows = sqlx::query("SELECT root_uri FROM thread_mutes WHERE creator_did = $1")
            .bind(viewer)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get("root_uri")).collect())
    }

    async fn get_muted_list_uris(&self, viewer: &str) -> AppViewResult<Vec<String>> {
        let rows = sqlx::query("SELECT list_uri FROM list_mutes WHERE creator_did = $1")
            .bind(viewer)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|row| row.get("list_uri")).collect())
    }

    async fn get_list_members(&self, list_uris: &[String]) -> AppViewResult<HashSet<String>> {
        if list_uris.is_empty() {
            return Ok(HashSet::new());
        }
        let rows = sqlx::query(
            "SELECT DISTINCT subject_did FROM list_items WHERE list_uri = ANY($1)",
        )
        .bind(list_uris)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get("subject_did")).collect())
    }

    async fn count_thread_replies(&self, root_uri: &str, max_depth: u32) -> AppViewResult<i64> {
        // Depth bound terminates the recursion even if the reply graph has a
        // cycle from out-of-order ingestion
        let row = sqlx::query(
            "WITH RECURSIVE descendants AS (
                 SELECT uri, 1 AS depth FROM posts
                 WHERE parent_uri = $1 AND takedown_ref IS NULL
                 UNION ALL
                 SELECT p.uri, d.depth + 1 FROM posts p
                 JOIN descendants d ON p.parent_uri = d.uri
                 WHERE d.depth < $2 AND p.takedown_ref IS NULL
             )
             SELECT COUNT(*) AS total FROM descendants",
        )
        .bind(root_uri)
        .bind(max_depth as i64)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get("total"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unparseable_embed_degrades_to_unknown() {
        let embed = parse_embed(
            Some("{\"type\": 42}".to_string()),
            "at://did:plc:a/app.bsky.feed.post/1",
        );
        assert_eq!(embed, Some(EmbedSpec::Unknown));
    }

    #[test]
    fn test_missing_embed_stays_none() {
        assert_eq!(parse_embed(None, "at://x"), None);
    }

    #[test]
    fn test_string_list_tolerates_garbage() {
        assert!(parse_string_list(Some("not json".to_string())).is_empty());
        assert_eq!(
            parse_string_list(Some("[\"did:plc:a\"]".to_string())),
            vec!["did:plc:a".to_string()]
        );
    }

    #[test]
    fn test_gate_rules_parse() {
        let rules = parse_gate_rules(
            Some("{\"mentions\": true, \"following\": false, \"list_uris\": [], \"unknown\": 0}".to_string()),
            "at://did:plc:a/app.bsky.feed.threadgate/1",
        );
        assert!(rules.map(|r| r.mentions).unwrap_or(false));
    }
}
