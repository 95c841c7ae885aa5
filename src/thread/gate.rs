/// Reply-gate evaluation
///
/// A root post's reply-gate restricts who may reply anywhere in its thread.
/// [`GateContext`] captures everything needed to evaluate the gate against
/// any reply author: the parsed allow-rules plus the supporting sets they
/// reference (the root author's follows, allow-listed list memberships, the
/// root's mention DIDs). The context is viewer-independent and serializable,
/// so complete contexts cache well under the root URI; a degraded build only
/// holds for the request that made it.
use crate::metrics::record_gate_evaluation;
use crate::store::{PostRecord, RecordStore, ThreadGateRecord, ThreadGateRules};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::warn;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateContext {
    /// `None` when there is no gate, or the gate does not restrict replying
    pub rules: Option<ThreadGateRules>,
    pub root_author_did: String,
    /// DIDs mentioned in the root post, for the mentions rule
    pub root_mention_dids: Vec<String>,
    /// The root author's follow set, loaded only when the gate allows
    /// followed actors
    pub root_author_following: HashSet<String>,
    /// Expanded membership of allow-listed lists
    pub list_members: HashSet<String>,
    /// Replies the root author explicitly hid
    pub hidden_uris: HashSet<String>,
    /// Set when a supporting-set load failed and came back empty; degraded
    /// contexts must not be cached
    #[serde(skip)]
    pub degraded: bool,
}

impl GateContext {
    /// A context that restricts nothing.
    pub fn unrestricted(root_author_did: impl Into<String>) -> Self {
        Self {
            rules: None,
            root_author_did: root_author_did.into(),
            root_mention_dids: Vec::new(),
            root_author_following: HashSet::new(),
            list_members: HashSet::new(),
            hidden_uris: HashSet::new(),
            degraded: false,
        }
    }

    /// Build the evaluation context for a root post and its gate record,
    /// loading only the supporting sets the active rules reference. A
    /// failing set load degrades to an empty set and marks the whole
    /// context degraded.
    pub async fn build(
        store: &dyn RecordStore,
        root: &PostRecord,
        gate: Option<&ThreadGateRecord>,
    ) -> Self {
        let Some(gate) = gate else {
            return Self::unrestricted(root.author_did.clone());
        };

        let rules = gate.allow.clone();
        let needs_following = rules.as_ref().map(|r| r.following).unwrap_or(false);
        let list_uris: Vec<String> = rules
            .as_ref()
            .map(|r| r.list_uris.clone())
            .unwrap_or_default();

        let ((root_author_following, follows_degraded), (list_members, lists_degraded)) =
            futures::join!(
                load_following(store, &root.author_did, needs_following),
                load_list_members(store, &list_uris),
            );

        Self {
            rules,
            root_author_did: root.author_did.clone(),
            root_mention_dids: root.mention_dids.clone(),
            root_author_following,
            list_members,
            hidden_uris: gate.hidden_uris.iter().cloned().collect(),
            degraded: follows_degraded || lists_degraded,
        }
    }

    /// Whether the gate permits a reply from `reply_author_did`.
    ///
    /// The root author is always exempt. Rules are tried in order: mentions,
    /// following, list membership. A gate whose every allow-rule was
    /// unrecognized cannot be enforced and permits the reply.
    pub fn permits(&self, reply_author_did: &str) -> bool {
        let Some(rules) = &self.rules else {
            return true;
        };

        if reply_author_did == self.root_author_did {
            record_gate_evaluation("permitted");
            return true;
        }
        if rules.mentions && self.root_mention_dids.iter().any(|d| d == reply_author_did) {
            record_gate_evaluation("permitted");
            return true;
        }
        if rules.following && self.root_author_following.contains(reply_author_did) {
            record_gate_evaluation("permitted");
            return true;
        }
        if !rules.list_uris.is_empty() && self.list_members.contains(reply_author_did) {
            record_gate_evaluation("permitted");
            return true;
        }

        if rules.unknown > 0 && !rules.mentions && !rules.following && rules.list_uris.is_empty() {
            warn!(
                "Reply gate on {} has only unrecognized rules, permitting reply from {}",
                self.root_author_did, reply_author_did
            );
            record_gate_evaluation("fail_open");
            return true;
        }

        record_gate_evaluation("denied");
        false
    }

    /// Whether the root author hid this reply.
    pub fn hides(&self, reply_uri: &str) -> bool {
        self.hidden_uris.contains(reply_uri)
    }
}

async fn load_following(
    store: &dyn RecordStore,
    did: &str,
    needed: bool,
) -> (HashSet<String>, bool) {
    if !needed {
        return (HashSet::new(), false);
    }
    match store.get_following_dids(did).await {
        Ok(set) => (set, false),
        Err(e) => {
            warn!("Degrading gate follow set for {}: {}", did, e);
            (HashSet::new(), true)
        }
    }
}

async fn load_list_members(
    store: &dyn RecordStore,
    list_uris: &[String],
) -> (HashSet<String>, bool) {
    if list_uris.is_empty() {
        return (HashSet::new(), false);
    }
    match store.get_list_members(list_uris).await {
        Ok(set) => (set, false),
        Err(e) => {
            warn!("Degrading gate list membership: {}", e);
            (HashSet::new(), true)
        }
    }
}
