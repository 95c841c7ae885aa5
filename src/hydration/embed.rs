/// Embed resolution
///
/// Turns the raw embed spec on a post into a fully resolved [`EmbedView`]:
/// image and video specs become content-addressed CDN URLs, quoted records
/// load through the request's loaders and recurse into their own embeds.
/// Recursion is bounded by a depth limit and a visited set; anything past
/// either bound resolves to a placeholder instead of erroring.
use crate::config::HydrationConfig;
use crate::loader::{Loaders, ViewerKey};
use crate::store::{EmbedSpec, PostRecord};
use crate::views::{
    ActorViewBasic, EmbedView, ExternalCard, ImageUriBuilder, ImageView, QuoteView, QuotedRecord,
    VideoView,
};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use tracing::warn;

pub struct EmbedResolver<'a> {
    loaders: &'a Loaders,
    uris: ImageUriBuilder,
    max_depth: u32,
    /// Top-level resolutions memoized per post URI for the lifetime of the
    /// resolver, so a post referenced from several parents in one request
    /// resolves once
    memo: Mutex<HashMap<String, Option<EmbedView>>>,
}

impl<'a> EmbedResolver<'a> {
    pub fn new(loaders: &'a Loaders, config: &HydrationConfig) -> Self {
        Self {
            loaders,
            uris: ImageUriBuilder::new(config.cdn_url.clone(), config.video_url.clone()),
            max_depth: config.max_embed_depth,
            memo: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a post's embed. A post without one resolves to `None`.
    pub async fn resolve_embed(&self, post: &PostRecord) -> Option<EmbedView> {
        let spec = post.embed.as_ref()?;

        if let Some(memoized) = self
            .memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&post.uri)
        {
            return memoized.clone();
        }

        let mut visited = HashSet::new();
        visited.insert(post.uri.clone());
        let view = self
            .resolve_spec(spec, &post.author_did, &post.uri, 0, &mut visited)
            .await;

        self.memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(post.uri.clone(), view.clone());
        view
    }

    /// `depth` counts quote hops taken from the post under resolution.
    /// Boxing breaks the async recursion through quoted records.
    fn resolve_spec<'s>(
        &'s self,
        spec: &'s EmbedSpec,
        author_did: &'s str,
        embedder_uri: &'s str,
        depth: u32,
        visited: &'s mut HashSet<String>,
    ) -> BoxFuture<'s, Option<EmbedView>> {
        Box::pin(async move {
            match spec {
                EmbedSpec::Images { images } => {
                    // Entries without a blob reference are dropped rather
                    // than rendered as broken links
                    let resolved: Vec<ImageView> = images
                        .iter()
                        .filter(|image| !image.cid.is_empty())
                        .map(|image| ImageView {
                            thumb: self.uris.feed_thumbnail(author_did, &image.cid),
                            fullsize: self.uris.feed_fullsize(author_did, &image.cid),
                            alt: image.alt.clone(),
                            aspect_ratio: image.aspect_ratio,
                        })
                        .collect();
                    if resolved.is_empty() {
                        None
                    } else {
                        Some(EmbedView::Images { images: resolved })
                    }
                }
                EmbedSpec::External {
                    uri,
                    title,
                    description,
                    thumb_cid,
                } => Some(EmbedView::External {
                    external: ExternalCard {
                        uri: uri.clone(),
                        title: title.clone(),
                        description: description.clone(),
                        thumb: thumb_cid
                            .as_ref()
                            .filter(|cid| !cid.is_empty())
                            .map(|cid| self.uris.feed_thumbnail(author_did, cid)),
                    },
                }),
                EmbedSpec::Video {
                    cid,
                    alt,
                    aspect_ratio,
                } => {
                    if cid.is_empty() {
                        return None;
                    }
                    Some(EmbedView::Video {
                        video: VideoView {
                            playlist: self.uris.video_playlist(author_did, cid),
                            thumbnail: Some(self.uris.video_thumbnail(author_did, cid)),
                            alt: alt.clone(),
                            aspect_ratio: *aspect_ratio,
                        },
                    })
                }
                EmbedSpec::Record { uri, .. } => {
                    let record = self
                        .resolve_quote(uri, author_did, embedder_uri, depth + 1, visited)
                        .await;
                    Some(EmbedView::Record { record })
                }
                EmbedSpec::RecordWithMedia { uri, media, .. } => {
                    let record = self
                        .resolve_quote(uri, author_did, embedder_uri, depth + 1, visited)
                        .await;
                    let media_view = self
                        .resolve_spec(media, author_did, embedder_uri, depth, visited)
                        .await;
                    match media_view {
                        Some(media) => Some(EmbedView::RecordWithMedia {
                            record,
                            media: Box::new(media),
                        }),
                        // With the media unresolvable, degrade to a plain
                        // quote instead of dropping the whole embed
                        None => Some(EmbedView::Record { record }),
                    }
                }
                EmbedSpec::Unknown => Some(EmbedView::Unsupported),
            }
        })
    }

    async fn resolve_quote(
        &self,
        uri: &str,
        embedder_did: &str,
        embedder_uri: &str,
        depth: u32,
        visited: &mut HashSet<String>,
    ) -> QuoteView {
        if depth > self.max_depth || visited.contains(uri) {
            return QuoteView::NotFound {
                uri: uri.to_string(),
            };
        }

        let post = match self.loaders.posts.load(uri.to_string()).await {
            Ok(Some(post)) => post,
            Ok(None) => {
                return QuoteView::NotFound {
                    uri: uri.to_string(),
                }
            }
            Err(e) => {
                warn!("Degrading quote of {}: {}", uri, e);
                return QuoteView::NotFound {
                    uri: uri.to_string(),
                };
            }
        };
        if post.takedown_ref.is_some() {
            return QuoteView::NotFound {
                uri: uri.to_string(),
            };
        }

        // A block in either direction between the two authors suppresses
        // the quote
        if post.author_did != embedder_did {
            match self
                .loaders
                .relationships
                .load(ViewerKey::new(post.author_did.clone(), embedder_did))
                .await
            {
                Ok(rel) => {
                    if rel.blocking_uri.is_some() || rel.blocked_by {
                        return QuoteView::Blocked {
                            uri: uri.to_string(),
                        };
                    }
                }
                Err(e) => {
                    warn!("Ignoring unreadable block state for quote {}: {}", uri, e);
                }
            }
        }

        // The quoted author can detach individual embedders or turn off
        // embedding for the post entirely
        match self.loaders.post_gates.load(uri.to_string()).await {
            Ok(Some(gate)) => {
                if gate.disable_embedding
                    || gate.detached_uris.iter().any(|d| d == embedder_uri)
                {
                    return QuoteView::Detached {
                        uri: uri.to_string(),
                    };
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!("Ignoring unreadable embed gate on {}: {}", uri, e);
            }
        }

        let author = match self.loaders.actors.load(post.author_did.clone()).await {
            Ok(Some(actor)) if actor.is_active() => actor,
            Ok(_) => {
                return QuoteView::NotFound {
                    uri: uri.to_string(),
                }
            }
            Err(e) => {
                warn!("Degrading quote author for {}: {}", uri, e);
                return QuoteView::NotFound {
                    uri: uri.to_string(),
                };
            }
        };

        let aggregation = match self.loaders.aggregations.load(uri.to_string()).await {
            Ok(agg) => agg,
            Err(e) => {
                warn!("Degrading quote aggregation for {}: {}", uri, e);
                Default::default()
            }
        };

        visited.insert(uri.to_string());
        let embed = match &post.embed {
            Some(spec) => self
                .resolve_spec(spec, &post.author_did, &post.uri, depth, visited)
                .await
                .map(Box::new),
            None => None,
        };

        QuoteView::Found {
            record: Box::new(QuotedRecord {
                uri: post.uri.clone(),
                cid: post.cid.clone(),
                author: ActorViewBasic::from_record(&author, &[], &self.uris),
                text: post.text.clone(),
                like_count: aggregation.like_count,
                repost_count: aggregation.repost_count,
                reply_count: aggregation.reply_count,
                quote_count: aggregation.quote_count,
                embed,
                created_at: post.created_at,
                indexed_at: post.indexed_at,
            }),
        }
    }
}
