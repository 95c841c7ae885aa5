/// AT-URI parsing and collection constants
///
/// The read layer keys everything by AT-URI (`at://{did}/{collection}/{rkey}`)
/// and frequently needs just the authority (author DID) of a URI without a
/// full parse.
use crate::error::{AppViewError, AppViewResult};
use std::fmt;

/// Record collections the read layer cares about
pub mod collections {
    pub const POST: &str = "app.bsky.feed.post";
    pub const THREADGATE: &str = "app.bsky.feed.threadgate";
    pub const POSTGATE: &str = "app.bsky.feed.postgate";
    pub const LIST: &str = "app.bsky.graph.list";
}

/// A parsed AT Protocol URI
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AtUri {
    /// DID of the repository owner
    pub did: String,
    /// Record collection (e.g. "app.bsky.feed.post")
    pub collection: String,
    /// Record key
    pub rkey: String,
}

impl AtUri {
    /// Parse an AT-URI string
    pub fn parse(uri: &str) -> AppViewResult<Self> {
        let rest = uri.strip_prefix("at://").ok_or_else(|| {
            AppViewError::Validation(format!("Missing at:// prefix: {}", uri))
        })?;

        let parts: Vec<&str> = rest.splitn(3, '/').collect();
        if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
            return Err(AppViewError::Validation(format!(
                "Expected at://did/collection/rkey: {}",
                uri
            )));
        }

        Ok(Self {
            did: parts[0].to_string(),
            collection: parts[1].to_string(),
            rkey: parts[2].to_string(),
        })
    }
}

impl fmt::Display for AtUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "at://{}/{}/{}", self.did, self.collection, self.rkey)
    }
}

/// Extract the authority (author DID) from an AT-URI without a full parse
///
/// Returns `None` for strings that are not AT-URIs or have an empty
/// authority component.
pub fn did_from_uri(uri: &str) -> Option<&str> {
    let rest = uri.strip_prefix("at://")?;
    let did = rest.split('/').next()?;
    if did.is_empty() {
        None
    } else {
        Some(did)
    }
}
