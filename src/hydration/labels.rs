/// Label propagation and read-time moderation decisions
///
/// Content inherits its author's labels on top of its own. Takedown
/// sentinels and spam always hide; adult-content values hide only when the
/// viewer opted in to filtering, otherwise they surface for client-side
/// blurring.
use crate::store::LabelRecord;
use std::collections::{BTreeMap, HashMap, HashSet};

/// Sentinel values that fully hide a subject regardless of preferences
pub const TAKEDOWN_VALUES: &[&str] = &["!takedown", "!suspend"];

/// Values hidden for every viewer, preference or not
pub const ALWAYS_HIDE_VALUES: &[&str] = &["spam"];

/// Adult-content values: shown blurred by default, hidden on opt-in
pub const ADULT_VALUES: &[&str] = &["porn", "sexual", "nudity"];

/// A viewer's moderation filter preferences
#[derive(Debug, Clone, Default)]
pub struct FilterPreferences {
    /// Hide adult-content labels entirely instead of blurring
    pub hide_adult_content: bool,
    /// Additional label values the viewer chose to hide
    pub hidden_values: HashSet<String>,
}

/// Hide/blur decision for one subject
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LabelVerdict {
    pub hide: bool,
    pub blur: bool,
}

/// Merge a subject's own labels with its author's inherited labels.
///
/// Negations apply in timestamp order: a later `neg` tombstone removes the
/// matching `(src, val)` pair. The result deduplicates by `(src, val)` and
/// comes back in `(src, val)` order so identical inputs serialize
/// identically.
pub fn effective_labels(own: &[LabelRecord], author: &[LabelRecord]) -> Vec<LabelRecord> {
    let mut combined: Vec<&LabelRecord> = own.iter().chain(author.iter()).collect();
    combined.sort_by(|a, b| a.created_at.cmp(&b.created_at));

    let mut active: BTreeMap<(String, String), LabelRecord> = BTreeMap::new();
    for label in combined {
        let pair = (label.src.clone(), label.val.clone());
        if label.neg {
            active.remove(&pair);
        } else {
            active.insert(pair, label.clone());
        }
    }
    active.into_values().collect()
}

/// True when the effective label set carries a takedown sentinel
pub fn is_taken_down(labels: &[LabelRecord]) -> bool {
    labels
        .iter()
        .any(|label| TAKEDOWN_VALUES.contains(&label.val.as_str()))
}

/// Hide/blur decision for an effective label set under the viewer's
/// preferences. Takedown sentinels short-circuit everything else.
pub fn verdict(labels: &[LabelRecord], prefs: Option<&FilterPreferences>) -> LabelVerdict {
    if is_taken_down(labels) {
        return LabelVerdict {
            hide: true,
            blur: true,
        };
    }

    let mut out = LabelVerdict::default();
    for label in labels {
        let val = label.val.as_str();
        if ALWAYS_HIDE_VALUES.contains(&val) {
            out.hide = true;
        }
        if ADULT_VALUES.contains(&val) {
            out.blur = true;
            if prefs.map(|p| p.hide_adult_content).unwrap_or(false) {
                out.hide = true;
            }
        }
        if prefs
            .map(|p| p.hidden_values.contains(val))
            .unwrap_or(false)
        {
            out.hide = true;
        }
    }
    out
}

/// The subset of `uris` whose effective labels pass the viewer's filter.
/// Callers intersect their result sets against this to enforce moderation.
pub fn filter_content(
    uris: &[String],
    labels: &HashMap<String, Vec<LabelRecord>>,
    prefs: Option<&FilterPreferences>,
) -> Vec<String> {
    uris.iter()
        .filter(|uri| {
            let effective = labels.get(*uri).map(Vec::as_slice).unwrap_or(&[]);
            !verdict(effective, prefs).hide
        })
        .cloned()
        .collect()
}
