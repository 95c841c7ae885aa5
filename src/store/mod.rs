/// Record store accessor
///
/// Read-only, batched access to the rows the ingestion pipeline writes.
/// The schema and its migrations belong to the ingestion side; this crate
/// only consumes it. Supports multiple backend implementations
/// (Postgres, in-memory).
pub mod memory;
pub mod models;
pub mod postgres;

pub use memory::MemoryRecordStore;
pub use models::*;
pub use postgres::PostgresRecordStore;

use crate::error::AppViewResult;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

/// Batched read accessor over the normalized record tables
///
/// All batch methods tolerate empty key slices (returning an empty map) and
/// omit keys with no matching row; they never error on absence. Result maps
/// are keyed by the input key so callers distinguish "absent" from any
/// default explicitly.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch posts by URI
    async fn get_posts(&self, uris: &[String]) -> AppViewResult<HashMap<String, PostRecord>>;

    /// Fetch actors by DID
    async fn get_actors(&self, dids: &[String]) -> AppViewResult<HashMap<String, ActorRecord>>;

    /// Fetch engagement counters by post URI; absent rows are simply omitted
    /// (callers substitute all-zero counters)
    async fn get_aggregations(
        &self,
        uris: &[String],
    ) -> AppViewResult<HashMap<String, PostAggregation>>;

    /// Fetch the viewer's per-post state (likes, reposts, bookmarks)
    async fn get_post_viewer_states(
        &self,
        viewer: &str,
        uris: &[String],
    ) -> AppViewResult<HashMap<String, PostViewerState>>;

    /// Fetch the viewer's relationship to each actor
    async fn get_actor_relationships(
        &self,
        viewer: &str,
        dids: &[String],
    ) -> AppViewResult<HashMap<String, ActorRelationship>>;

    /// Fetch labels by subject (post URI or actor DID), oldest first
    async fn get_labels(
        &self,
        subjects: &[String],
    ) -> AppViewResult<HashMap<String, Vec<LabelRecord>>>;

    /// Fetch reply-gates by the post URI they apply to
    async fn get_thread_gates(
        &self,
        post_uris: &[String],
    ) -> AppViewResult<HashMap<String, ThreadGateRecord>>;

    /// Fetch embed-gates by the post URI they apply to
    async fn get_post_gates(
        &self,
        post_uris: &[String],
    ) -> AppViewResult<HashMap<String, PostGateRecord>>;

    /// Fetch up to `limit_per_parent` direct replies per parent, newest
    /// first. Taken-down replies are excluded; parents with no replies are
    /// omitted.
    async fn get_replies(
        &self,
        parent_uris: &[String],
        limit_per_parent: u32,
    ) -> AppViewResult<HashMap<String, Vec<PostRecord>>>;

    /// DIDs the given actor follows
    async fn get_following_dids(&self, did: &str) -> AppViewResult<HashSet<String>>;

    /// DIDs following the given actor
    async fn get_follower_dids(&self, did: &str) -> AppViewResult<HashSet<String>>;

    /// DIDs the viewer blocks
    async fn get_blocking_dids(&self, viewer: &str) -> AppViewResult<HashSet<String>>;

    /// DIDs blocking the viewer (same table, opposite direction)
    async fn get_blocked_by_dids(&self, viewer: &str) -> AppViewResult<HashSet<String>>;

    /// DIDs the viewer muted directly
    async fn get_muted_dids(&self, viewer: &str) -> AppViewResult<HashSet<String>>;

    /// Thread roots the viewer muted
    async fn get_muted_thread_roots(&self, viewer: &str) -> AppViewResult<HashSet<String>>;

    /// Lists the viewer muted (membership is expanded at call time)
    async fn get_muted_list_uris(&self, viewer: &str) -> AppViewResult<Vec<String>>;

    /// Union of current members across the given lists
    async fn get_list_members(&self, list_uris: &[String]) -> AppViewResult<HashSet<String>>;

    /// Count all descendants of a post down to `max_depth` levels, without
    /// materializing the tree. Taken-down posts are neither counted nor
    /// descended through.
    async fn count_thread_replies(&self, root_uri: &str, max_depth: u32) -> AppViewResult<i64>;
}
