/// Composite loader keys
///
/// Viewer-scoped kinds (post viewer state, actor relationships) key their
/// entries by subject and viewer together so entries for different viewers
/// can never collide in one loader.
use serde::{Deserialize, Serialize};

/// Separator for the encoded form. URIs and DIDs use single colons, so a
/// double colon never occurs inside either component.
pub const KEY_SEPARATOR: &str = "::";

/// A subject (post URI or actor DID) scoped to one viewer DID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ViewerKey {
    pub subject: String,
    pub viewer: String,
}

impl ViewerKey {
    pub fn new(subject: impl Into<String>, viewer: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            viewer: viewer.into(),
        }
    }

    /// True when either component is empty; such keys resolve to the
    /// kind's default state without touching the store
    pub fn is_malformed(&self) -> bool {
        self.subject.is_empty() || self.viewer.is_empty()
    }

    pub fn encode(&self) -> String {
        format!("{}{}{}", self.subject, KEY_SEPARATOR, self.viewer)
    }

    /// Split an encoded key back into components. The separator search runs
    /// from the right so subjects containing the separator (never the case
    /// for well-formed URIs) still split deterministically.
    pub fn decode(raw: &str) -> Option<Self> {
        let (subject, viewer) = raw.rsplit_once(KEY_SEPARATOR)?;
        if subject.is_empty() || viewer.is_empty() {
            return None;
        }
        Some(Self::new(subject, viewer))
    }
}
