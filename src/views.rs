/// Wire-shaped view objects
///
/// Serializable (camelCase) output types assembled by the hydrator and the
/// thread assembler. These carry no loading logic of their own; everything
/// here is a plain data shape plus constructors from store records.
use crate::store::{ActorRecord, AspectRatio, LabelRecord, PostAggregation, PostViewerState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Derives content-addressed media URLs from DID + CID pairs
#[derive(Debug, Clone)]
pub struct ImageUriBuilder {
    cdn_url: String,
    video_url: String,
}

impl ImageUriBuilder {
    pub fn new(cdn_url: impl Into<String>, video_url: impl Into<String>) -> Self {
        Self {
            cdn_url: cdn_url.into(),
            video_url: video_url.into(),
        }
    }

    pub fn feed_thumbnail(&self, did: &str, cid: &str) -> String {
        format!("{}/img/feed_thumbnail/plain/{}/{}@jpeg", self.cdn_url, did, cid)
    }

    pub fn feed_fullsize(&self, did: &str, cid: &str) -> String {
        format!("{}/img/feed_fullsize/plain/{}/{}@jpeg", self.cdn_url, did, cid)
    }

    pub fn avatar(&self, did: &str, cid: &str) -> String {
        format!("{}/img/avatar/plain/{}/{}@jpeg", self.cdn_url, did, cid)
    }

    pub fn video_playlist(&self, did: &str, cid: &str) -> String {
        format!("{}/watch/{}/{}/playlist.m3u8", self.video_url, did, cid)
    }

    pub fn video_thumbnail(&self, did: &str, cid: &str) -> String {
        format!("{}/watch/{}/{}/thumbnail.jpg", self.video_url, did, cid)
    }
}

/// A surfaced moderation label
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelView {
    pub src: String,
    pub uri: String,
    pub val: String,
    pub cts: DateTime<Utc>,
}

impl LabelView {
    pub fn from_record(label: &LabelRecord) -> Self {
        Self {
            src: label.src.clone(),
            uri: label.subject.clone(),
            val: label.val.clone(),
            cts: label.created_at,
        }
    }
}

/// Compact actor card used inside posts, quotes and thread nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorViewBasic {
    pub did: String,
    pub handle: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<LabelView>,
}

impl ActorViewBasic {
    pub fn from_record(
        actor: &ActorRecord,
        labels: &[LabelRecord],
        uris: &ImageUriBuilder,
    ) -> Self {
        Self {
            did: actor.did.clone(),
            handle: actor.handle.clone(),
            display_name: actor.display_name.clone(),
            avatar: actor
                .avatar_cid
                .as_ref()
                .map(|cid| uris.avatar(&actor.did, cid)),
            labels: labels.iter().map(LabelView::from_record).collect(),
        }
    }
}

/// The requesting viewer's state on one post
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewerStateView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub like: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repost: Option<String>,
    pub bookmarked: bool,
    pub thread_muted: bool,
}

impl ViewerStateView {
    pub fn from_state(state: &PostViewerState) -> Self {
        Self {
            like: state.like_uri.clone(),
            repost: state.repost_uri.clone(),
            bookmarked: state.bookmarked,
            thread_muted: state.thread_muted,
        }
    }
}

/// A resolved image with addressable thumbnail and full-size URLs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageView {
    pub thumb: String,
    pub fullsize: String,
    pub alt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<AspectRatio>,
}

/// A resolved external link card
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalCard {
    pub uri: String,
    pub title: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumb: Option<String>,
}

/// A resolved video with playlist and poster URLs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoView {
    pub playlist: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<AspectRatio>,
}

/// A quoted record, fully resolved
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotedRecord {
    pub uri: String,
    pub cid: String,
    pub author: ActorViewBasic,
    pub text: String,
    pub like_count: i64,
    pub repost_count: i64,
    pub reply_count: i64,
    pub quote_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embed: Option<Box<EmbedView>>,
    pub created_at: DateTime<Utc>,
    pub indexed_at: DateTime<Utc>,
}

/// Resolution outcome for a quoted record reference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum QuoteView {
    Found { record: Box<QuotedRecord> },
    /// Absent target, or a reference past the depth limit / back into an
    /// already-visited record
    NotFound { uri: String },
    Blocked { uri: String },
    /// The quoted author detached this quote or disabled embedding
    Detached { uri: String },
}

/// A fully resolved embed attachment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EmbedView {
    Images { images: Vec<ImageView> },
    External { external: ExternalCard },
    Video { video: VideoView },
    Record { record: QuoteView },
    RecordWithMedia { record: QuoteView, media: Box<EmbedView> },
    /// Unknown embed kind, surfaced rather than dropped
    Unsupported,
}

/// A fully hydrated post
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostView {
    pub uri: String,
    pub cid: String,
    pub author: ActorViewBasic,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embed: Option<EmbedView>,
    pub like_count: i64,
    pub repost_count: i64,
    pub reply_count: i64,
    pub quote_count: i64,
    pub bookmark_count: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub viewer: Option<ViewerStateView>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub labels: Vec<LabelView>,
    pub created_at: DateTime<Utc>,
    pub indexed_at: DateTime<Utc>,
}

impl PostView {
    pub fn apply_aggregation(&mut self, agg: &PostAggregation) {
        self.like_count = agg.like_count;
        self.repost_count = agg.repost_count;
        self.reply_count = agg.reply_count;
        self.quote_count = agg.quote_count;
        self.bookmark_count = agg.bookmark_count;
    }
}

/// One node of a rendered thread, tombstoning gaps the viewer may not see
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ThreadItemView {
    Post(Box<ThreadPostView>),
    NotFound { uri: String },
    Blocked { uri: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThreadPostView {
    pub post: PostView,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent: Option<Box<ThreadItemView>>,
    /// Absent when this node has no loaded descendants
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replies: Option<Vec<ThreadItemView>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_uri_shapes() {
        let uris = ImageUriBuilder::new("https://cdn.example", "https://video.example");
        assert_eq!(
            uris.feed_thumbnail("did:plc:a", "bafy123"),
            "https://cdn.example/img/feed_thumbnail/plain/did:plc:a/bafy123@jpeg"
        );
        assert_eq!(
            uris.video_playlist("did:plc:a", "bafy123"),
            "https://video.example/watch/did:plc:a/bafy123/playlist.m3u8"
        );
    }

    #[test]
    fn test_embed_view_serializes_tagged() {
        let view = EmbedView::External {
            external: ExternalCard {
                uri: "https://example.com".to_string(),
                title: "Example".to_string(),
                description: String::new(),
                thumb: None,
            },
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["type"], "external");
        assert_eq!(json["external"]["uri"], "https://example.com");
        assert!(json["external"].get("thumb").is_none());
    }

    #[test]
    fn test_quote_view_states_serialize_tagged() {
        let view = QuoteView::NotFound {
            uri: "at://did:plc:a/app.bsky.feed.post/gone".to_string(),
        };
        let json = serde_json::to_value(&view).unwrap();
        assert_eq!(json["state"], "notFound");
    }

    #[test]
    fn test_thread_post_view_omits_unloaded_replies() {
        let actor = ActorRecord {
            did: "did:plc:a".to_string(),
            handle: "alice.test".to_string(),
            display_name: None,
            avatar_cid: None,
            is_labeler: false,
            indexed_at: Utc::now(),
            deactivated_at: None,
            takedown_ref: None,
        };
        let uris = ImageUriBuilder::new("https://cdn.example", "https://video.example");
        let post = PostView {
            uri: "at://did:plc:a/app.bsky.feed.post/1".to_string(),
            cid: "cid".to_string(),
            author: ActorViewBasic::from_record(&actor, &[], &uris),
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
        let node = ThreadItemView::Post(Box::new(ThreadPostView {
            post,
            parent: None,
            replies: None,
        }));
        let json = serde_json::to_value(&node).unwrap();
        assert!(json.get("replies").is_none());
        assert!(json.get("parent").is_none());
        assert_eq!(json["type"], "post");
    }
}
