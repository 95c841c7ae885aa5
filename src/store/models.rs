/// Row projections over the normalized AppView schema
///
/// These are read-only snapshots of what the ingestion pipeline indexed.
/// The read layer never writes them and must tolerate referential gaps
/// (a parent post may be deleted between two loads).
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sentinel handle for actors whose handle failed verification
pub const INVALID_HANDLE: &str = "handle.invalid";

/// A post row as indexed from the firehose
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostRecord {
    pub uri: String,
    pub cid: String,
    pub author_did: String,
    pub text: String,
    /// Direct parent when this post is a reply
    pub parent_uri: Option<String>,
    /// Thread root as declared by the record; absent, self, or possibly a
    /// broken pointer, so never trusted without walking parents
    pub root_uri: Option<String>,
    /// Normalized embed attached to the post, if any
    pub embed: Option<EmbedSpec>,
    /// Mention DIDs extracted from rich-text facets at index time
    pub mention_dids: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub indexed_at: DateTime<Utc>,
    /// Set when the record is administratively taken down
    pub takedown_ref: Option<String>,
}

impl PostRecord {
    /// Whether this post is a reply to something
    pub fn is_reply(&self) -> bool {
        self.parent_uri.is_some()
    }
}

/// An actor (account) row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActorRecord {
    pub did: String,
    /// May be the `handle.invalid` sentinel when verification failed
    pub handle: String,
    pub display_name: Option<String>,
    pub avatar_cid: Option<String>,
    pub is_labeler: bool,
    pub indexed_at: DateTime<Utc>,
    /// Set while the account is self-deactivated
    pub deactivated_at: Option<DateTime<Utc>>,
    /// Set when the account is administratively taken down
    pub takedown_ref: Option<String>,
}

impl ActorRecord {
    pub fn has_valid_handle(&self) -> bool {
        self.handle != INVALID_HANDLE
    }

    /// Whether the account's content may be served at all
    pub fn is_active(&self) -> bool {
        self.takedown_ref.is_none() && self.deactivated_at.is_none()
    }
}

/// Per-post engagement counters; absent rows mean all zeroes, never null
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostAggregation {
    pub like_count: i64,
    pub repost_count: i64,
    pub reply_count: i64,
    pub quote_count: i64,
    pub bookmark_count: i64,
}

impl PostAggregation {
    /// Engagement score used for reply ranking
    pub fn engagement(&self) -> i64 {
        self.like_count + self.repost_count
    }
}

/// Per (post, viewer) state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostViewerState {
    /// URI of the viewer's like record, when liked
    pub like_uri: Option<String>,
    /// URI of the viewer's repost record, when reposted
    pub repost_uri: Option<String>,
    pub bookmarked: bool,
    pub thread_muted: bool,
}

/// Per (actor, viewer) relationship state
///
/// Follow and block relations are revocable records, so they carry the
/// record URI; the reverse directions are plain booleans.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorRelationship {
    pub following_uri: Option<String>,
    pub followed_by_uri: Option<String>,
    pub blocking_uri: Option<String>,
    pub blocked_by: bool,
    pub muted: bool,
}

impl ActorRelationship {
    /// Either block direction hides content between the two parties
    pub fn blocked_either_way(&self) -> bool {
        self.blocking_uri.is_some() || self.blocked_by
    }
}

/// A moderation label emitted by a labeler
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelRecord {
    /// DID of the labeler that issued the label
    pub src: String,
    /// Labeled subject: a post URI or an actor DID
    pub subject: String,
    /// Label value (porn, spam, !takedown, ...)
    pub val: String,
    /// Negation: retracts an earlier (src, val) on the same subject
    pub neg: bool,
    pub created_at: DateTime<Utc>,
}

/// Reply-gate attached to a thread root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadGateRecord {
    /// URI of the gate record itself
    pub uri: String,
    /// Root post the gate applies to
    pub post_uri: String,
    /// `None` means the gate does not restrict replying (it may still hide
    /// specific replies); `Some` means only matching authors may reply
    pub allow: Option<ThreadGateRules>,
    /// Replies the root author explicitly hid
    pub hidden_uris: Vec<String>,
    pub indexed_at: DateTime<Utc>,
}

/// Allow-rules of a reply-gate
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThreadGateRules {
    /// Actors mentioned in the root post may reply
    pub mentions: bool,
    /// Actors the root author follows may reply
    pub following: bool,
    /// Members of these lists may reply
    pub list_uris: Vec<String>,
    /// Count of allow-rules the indexer did not recognize
    pub unknown: u32,
}

impl ThreadGateRecord {
    /// Whether the gate restricts who may reply at all
    pub fn restricts_replies(&self) -> bool {
        self.allow.is_some()
    }
}

/// Embed-gate (quote policy) attached to a post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostGateRecord {
    pub uri: String,
    /// Post the gate applies to
    pub post_uri: String,
    /// Author disabled quoting this post entirely
    pub disable_embedding: bool,
    /// Quote posts the author detached from this post
    pub detached_uris: Vec<String>,
    pub indexed_at: DateTime<Utc>,
}

/// Normalized embed stored on a post row
///
/// Closed over the kinds the indexer understands; anything else lands on
/// `Unknown` instead of failing deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EmbedSpec {
    Images {
        images: Vec<ImageSpec>,
    },
    External {
        uri: String,
        title: String,
        description: String,
        thumb_cid: Option<String>,
    },
    Video {
        cid: String,
        alt: Option<String>,
        aspect_ratio: Option<AspectRatio>,
    },
    Record {
        uri: String,
        cid: String,
    },
    RecordWithMedia {
        uri: String,
        cid: String,
        media: Box<EmbedSpec>,
    },
    #[serde(other)]
    Unknown,
}

/// A single image inside an images embed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageSpec {
    pub cid: String,
    pub alt: String,
    pub aspect_ratio: Option<AspectRatio>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AspectRatio {
    pub width: u32,
    pub height: u32,
}
