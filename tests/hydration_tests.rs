/// Hydration integration tests
///
/// Drives the hydrator over the in-memory record store and asserts the
/// batching contract, viewer isolation, embed resolution and label
/// propagation end to end.
use aurora_lens::config::HydrationConfig;
use aurora_lens::hydration::Hydrator;
use aurora_lens::loader::Loaders;
use aurora_lens::store::{
    ActorRecord, EmbedSpec, ImageSpec, LabelRecord, MemoryRecordStore, PostAggregation, PostRecord,
};
use aurora_lens::views::{EmbedView, ImageUriBuilder, QuoteView};
use chrono::{Duration, Utc};
use std::sync::Arc;

fn post_at(author: &str, rkey: &str) -> String {
    format!("at://{}/app.bsky.feed.post/{}", author, rkey)
}

fn post(
    uri: &str,
    author: &str,
    parent: Option<&str>,
    root: Option<&str>,
    age_secs: i64,
) -> PostRecord {
    let now = Utc::now();
    PostRecord {
        uri: uri.to_string(),
        cid: format!("cid-{}", uri),
        author_did: author.to_string(),
        text: format!("text of {}", uri),
        parent_uri: parent.map(String::from),
        root_uri: root.map(String::from),
        embed: None,
        mention_dids: Vec::new(),
        created_at: now - Duration::seconds(age_secs),
        indexed_at: now,
        takedown_ref: None,
    }
}

fn actor(did: &str) -> ActorRecord {
    ActorRecord {
        did: did.to_string(),
        handle: format!("{}.test", did.rsplit(':').next().unwrap_or("user")),
        display_name: None,
        avatar_cid: None,
        is_labeler: false,
        indexed_at: Utc::now(),
        deactivated_at: None,
        takedown_ref: None,
    }
}

async fn seed(store: &MemoryRecordStore, record: PostRecord) {
    store.insert_actor(actor(&record.author_did)).await;
    store.insert_post(record).await;
}

fn image_uris(config: &HydrationConfig) -> ImageUriBuilder {
    ImageUriBuilder::new(config.cdn_url.clone(), config.video_url.clone())
}

#[tokio::test]
async fn test_feed_page_hydrates_with_one_call_per_concern() {
    let store = Arc::new(MemoryRecordStore::new());
    let mut uris = Vec::new();
    for name in ["ana", "ben", "cao"] {
        let did = format!("did:plc:{}", name);
        let uri = post_at(&did, "post");
        seed(&store, post(&uri, &did, None, None, 10)).await;
        store
            .set_aggregation(
                &uri,
                PostAggregation {
                    like_count: 1,
                    ..Default::default()
                },
            )
            .await;
        uris.push(uri);
    }
    store
        .add_like("did:plc:viewer", &uris[0], "at://did:plc:viewer/like/1")
        .await;

    let loaders = Loaders::new(store.clone(), 100);
    let config = HydrationConfig::default();
    let snapshot = Hydrator::new(&loaders, &config)
        .hydrate(&uris, Some("did:plc:viewer"))
        .await
        .unwrap();

    assert_eq!(snapshot.posts.len(), 3);
    for method in [
        "get_posts",
        "get_actors",
        "get_aggregations",
        "get_labels",
        "get_post_viewer_states",
        "get_actor_relationships",
        "get_thread_gates",
        "get_post_gates",
    ] {
        assert_eq!(store.calls(method), 1, "{} should batch into one call", method);
    }
}

#[tokio::test]
async fn test_public_hydration_skips_viewer_lookups() {
    let store = Arc::new(MemoryRecordStore::new());
    let uri = post_at("did:plc:ana", "post");
    seed(&store, post(&uri, "did:plc:ana", None, None, 10)).await;

    let loaders = Loaders::new(store.clone(), 100);
    let config = HydrationConfig::default();
    let snapshot = Hydrator::new(&loaders, &config)
        .hydrate(&[uri.clone()], None)
        .await
        .unwrap();

    assert_eq!(store.calls("get_post_viewer_states"), 0);
    assert_eq!(store.calls("get_actor_relationships"), 0);

    let view = snapshot
        .post_view(&uri, &image_uris(&config))
        .expect("post renders");
    assert!(view.viewer.is_none());
}

#[tokio::test]
async fn test_viewer_states_never_leak_between_viewers() {
    let store = Arc::new(MemoryRecordStore::new());
    let uri = post_at("did:plc:author", "post");
    seed(&store, post(&uri, "did:plc:author", None, None, 10)).await;
    store
        .add_like("did:plc:fan", &uri, "at://did:plc:fan/like/1")
        .await;
    store
        .add_follow("did:plc:fan", "did:plc:author", "at://did:plc:fan/follow/1")
        .await;

    let config = HydrationConfig::default();
    let uris = image_uris(&config);

    // Loaders memoize per request, so each viewer gets a fresh set
    let loaders = Loaders::new(store.clone(), 100);
    let fan_snapshot = Hydrator::new(&loaders, &config)
        .hydrate(&[uri.clone()], Some("did:plc:fan"))
        .await
        .unwrap();
    let fan_post = fan_snapshot.post_view(&uri, &uris).unwrap();
    assert_eq!(
        fan_post.viewer.as_ref().and_then(|v| v.like.as_deref()),
        Some("at://did:plc:fan/like/1")
    );
    assert_eq!(
        fan_snapshot
            .actor_viewer_states
            .get("did:plc:author")
            .and_then(|rel| rel.following_uri.as_deref()),
        Some("at://did:plc:fan/follow/1")
    );

    let loaders = Loaders::new(store.clone(), 100);
    let other_snapshot = Hydrator::new(&loaders, &config)
        .hydrate(&[uri.clone()], Some("did:plc:other"))
        .await
        .unwrap();
    let other_post = other_snapshot.post_view(&uri, &uris).unwrap();
    assert_eq!(
        other_post.viewer.as_ref().and_then(|v| v.like.as_deref()),
        None
    );
    assert!(other_snapshot
        .actor_viewer_states
        .get("did:plc:author")
        .map(|rel| rel.following_uri.is_none())
        .unwrap_or(true));
}

#[tokio::test]
async fn test_reply_context_posts_are_loaded_and_renderable() {
    let store = Arc::new(MemoryRecordStore::new());
    let root = post_at("did:plc:root", "r");
    let parent = post_at("did:plc:mid", "p");
    let reply = post_at("did:plc:leaf", "c");
    seed(&store, post(&root, "did:plc:root", None, None, 300)).await;
    seed(
        &store,
        post(&parent, "did:plc:mid", Some(&root), Some(&root), 200),
    )
    .await;
    seed(
        &store,
        post(&reply, "did:plc:leaf", Some(&parent), Some(&root), 100),
    )
    .await;

    let loaders = Loaders::new(store.clone(), 100);
    let config = HydrationConfig::default();
    let snapshot = Hydrator::new(&loaders, &config)
        .hydrate(&[reply.clone()], None)
        .await
        .unwrap();

    // One wave for the requested post, one for its parent and root
    assert_eq!(store.calls("get_posts"), 2);
    let uris = image_uris(&config);
    assert!(snapshot.post_view(&parent, &uris).is_some());
    assert!(snapshot.post_view(&root, &uris).is_some());
}

#[tokio::test]
async fn test_embeds_resolve_within_hydration() {
    let store = Arc::new(MemoryRecordStore::new());
    let quoted = post_at("did:plc:quoted", "original");
    seed(&store, post(&quoted, "did:plc:quoted", None, None, 100)).await;
    store
        .set_aggregation(
            &quoted,
            PostAggregation {
                like_count: 7,
                ..Default::default()
            },
        )
        .await;

    let with_images = post_at("did:plc:painter", "pics");
    let mut record = post(&with_images, "did:plc:painter", None, None, 50);
    record.embed = Some(EmbedSpec::Images {
        images: vec![ImageSpec {
            cid: "bafyimg".to_string(),
            alt: "a dog".to_string(),
            aspect_ratio: None,
        }],
    });
    seed(&store, record).await;

    let quoting = post_at("did:plc:fan", "quote");
    let mut record = post(&quoting, "did:plc:fan", None, None, 10);
    record.embed = Some(EmbedSpec::Record {
        uri: quoted.clone(),
        cid: "cid-quoted".to_string(),
    });
    seed(&store, record).await;

    let loaders = Loaders::new(store.clone(), 100);
    let config = HydrationConfig::default();
    let snapshot = Hydrator::new(&loaders, &config)
        .hydrate(&[with_images.clone(), quoting.clone()], None)
        .await
        .unwrap();

    let Some(EmbedView::Images { images }) = snapshot.embeds.get(&with_images) else {
        panic!("images embed should resolve");
    };
    assert_eq!(images.len(), 1);
    assert_eq!(
        images[0].thumb,
        "https://cdn.bsky.app/img/feed_thumbnail/plain/did:plc:painter/bafyimg@jpeg"
    );

    let Some(EmbedView::Record {
        record: QuoteView::Found { record },
    }) = snapshot.embeds.get(&quoting)
    else {
        panic!("quote embed should resolve");
    };
    assert_eq!(record.uri, quoted);
    assert_eq!(record.like_count, 7);
    assert_eq!(record.author.did, "did:plc:quoted");
}

#[tokio::test]
async fn test_mutual_quotes_resolve_one_level_then_tombstone() {
    let store = Arc::new(MemoryRecordStore::new());
    let first = post_at("did:plc:one", "first");
    let second = post_at("did:plc:two", "second");
    let mut record = post(&first, "did:plc:one", None, None, 100);
    record.embed = Some(EmbedSpec::Record {
        uri: second.clone(),
        cid: "cid-2".to_string(),
    });
    seed(&store, record).await;
    let mut record = post(&second, "did:plc:two", None, None, 50);
    record.embed = Some(EmbedSpec::Record {
        uri: first.clone(),
        cid: "cid-1".to_string(),
    });
    seed(&store, record).await;

    let loaders = Loaders::new(store.clone(), 100);
    let config = HydrationConfig::default();
    let snapshot = Hydrator::new(&loaders, &config)
        .hydrate(&[first.clone()], None)
        .await
        .unwrap();

    let Some(EmbedView::Record {
        record: QuoteView::Found { record },
    }) = snapshot.embeds.get(&first)
    else {
        panic!("outer quote should resolve");
    };
    assert_eq!(record.uri, second);
    let Some(nested) = record.embed.as_deref() else {
        panic!("nested embed should be present");
    };
    assert_eq!(
        *nested,
        EmbedView::Record {
            record: QuoteView::NotFound { uri: first.clone() }
        }
    );
}

#[tokio::test]
async fn test_author_labels_reach_the_rendered_post() {
    let store = Arc::new(MemoryRecordStore::new());
    let uri = post_at("did:plc:sus", "post");
    seed(&store, post(&uri, "did:plc:sus", None, None, 10)).await;
    let now = Utc::now();
    store
        .add_label(LabelRecord {
            src: "did:plc:labeler".to_string(),
            subject: "did:plc:sus".to_string(),
            val: "spam".to_string(),
            neg: false,
            created_at: now - Duration::seconds(60),
        })
        .await;
    // A negated pair cancels out
    store
        .add_label(LabelRecord {
            src: "did:plc:labeler".to_string(),
            subject: "did:plc:sus".to_string(),
            val: "rude".to_string(),
            neg: false,
            created_at: now - Duration::seconds(50),
        })
        .await;
    store
        .add_label(LabelRecord {
            src: "did:plc:labeler".to_string(),
            subject: "did:plc:sus".to_string(),
            val: "rude".to_string(),
            neg: true,
            created_at: now - Duration::seconds(40),
        })
        .await;

    let loaders = Loaders::new(store.clone(), 100);
    let config = HydrationConfig::default();
    let snapshot = Hydrator::new(&loaders, &config)
        .hydrate(&[uri.clone()], None)
        .await
        .unwrap();

    let view = snapshot.post_view(&uri, &image_uris(&config)).unwrap();
    let vals: Vec<&str> = view.labels.iter().map(|l| l.val.as_str()).collect();
    assert!(vals.contains(&"spam"));
    assert!(!vals.contains(&"rude"));
    // The author card carries its own labels too
    assert_eq!(view.author.labels.len(), 1);
    assert_eq!(view.author.labels[0].val, "spam");
}

#[tokio::test]
async fn test_missing_rows_yield_absent_posts_and_zero_counts() {
    let store = Arc::new(MemoryRecordStore::new());
    let real = post_at("did:plc:ana", "here");
    seed(&store, post(&real, "did:plc:ana", None, None, 10)).await;
    let ghost = post_at("did:plc:ana", "gone");

    let loaders = Loaders::new(store.clone(), 100);
    let config = HydrationConfig::default();
    let snapshot = Hydrator::new(&loaders, &config)
        .hydrate(&[real.clone(), ghost.clone()], None)
        .await
        .unwrap();

    let uris = image_uris(&config);
    assert!(snapshot.post(&ghost).is_none());
    assert!(snapshot.post_view(&ghost, &uris).is_none());

    let view = snapshot.post_view(&real, &uris).unwrap();
    assert_eq!(view.like_count, 0);
    assert_eq!(view.repost_count, 0);
    assert_eq!(view.reply_count, 0);
    assert_eq!(view.quote_count, 0);
    assert_eq!(view.bookmark_count, 0);
}
