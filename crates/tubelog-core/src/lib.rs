//! Core domain model, field diffing and revision-log codec for tubelog.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "tubelog-core";

/// Tracked video columns, in the order change descriptions are emitted.
pub const VIDEO_FIELDS: [&str; 7] = [
    "title",
    "channel",
    "publish_time",
    "description",
    "duration",
    "status",
    "url",
];

/// Tracked comment columns, in the order change descriptions are emitted.
pub const COMMENT_FIELDS: [&str; 4] = [
    "comment",
    "author_name",
    "author_channel_url",
    "comment_time_kst",
];

/// Flat string-valued field mapping. Names that were never set read as "".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldSet(BTreeMap<String, String>);

impl FieldSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> &str {
        self.0.get(name).map(String::as_str).unwrap_or_default()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copy of this mapping restricted to `tracked`, with absent names filled as "".
    pub fn project(&self, tracked: &[&str]) -> Self {
        tracked
            .iter()
            .map(|name| (name.to_string(), self.get(name).to_string()))
            .collect()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for FieldSet {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldDiff {
    pub changed: bool,
    pub descriptions: Vec<String>,
}

/// Compare `old` against `new` over `tracked`, describing each differing field as
/// `(field: old → new)` in `tracked` order.
pub fn diff_fields(tracked: &[&str], old: &FieldSet, new: &FieldSet) -> FieldDiff {
    let descriptions: Vec<String> = tracked
        .iter()
        .filter_map(|field| {
            let before = old.get(field);
            let after = new.get(field);
            (before != after).then(|| format!("({field}: {before} → {after})"))
        })
        .collect();

    FieldDiff {
        changed: !descriptions.is_empty(),
        descriptions,
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("revision log does not open with a round marker: {snippet:?}")]
pub struct MalformedRevisionLog {
    pub snippet: String,
}

fn round_marker() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| Regex::new(r"\b(\d+)\.").expect("round marker pattern is valid"))
}

fn leading_round_marker() -> &'static Regex {
    static LEADING: OnceLock<Regex> = OnceLock::new();
    LEADING.get_or_init(|| Regex::new(r"^\s*\d+\. ").expect("leading marker pattern is valid"))
}

/// Count the `N.` round markers in a legacy log blob.
///
/// A non-blank log that does not open with a marker cannot have been produced by
/// [`append_round`] and is reported as malformed.
pub fn count_rounds(log: &str) -> Result<u32, MalformedRevisionLog> {
    if log.trim().is_empty() {
        return Ok(0);
    }
    if !leading_round_marker().is_match(log) {
        return Err(MalformedRevisionLog {
            snippet: log.chars().take(40).collect(),
        });
    }
    let count = round_marker().find_iter(log).count();
    Ok(u32::try_from(count).unwrap_or(u32::MAX))
}

/// Next round number for a log blob; a malformed log counts as zero rounds.
pub fn next_round_number(log: &str) -> u32 {
    count_rounds(log).unwrap_or(0).saturating_add(1)
}

/// Append `"{round}. change, change"` to `log`, separated by a single space.
pub fn append_round(log: &str, changes: &[String], round: u32) -> String {
    if changes.is_empty() {
        return log.to_string();
    }
    let entry = format!("{round}. {}", changes.join(", "));
    if log.trim().is_empty() {
        entry
    } else {
        format!("{log} {entry}")
    }
}

/// Human-readable revision history plus the explicit count of rounds it holds.
///
/// `rounds == 0` with a non-blank `text` marks a row written before the counter
/// was persisted; its round count is recovered from the text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionLog {
    pub text: String,
    pub rounds: u32,
}

impl RevisionLog {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_legacy(&self) -> bool {
        self.rounds == 0 && !self.text.trim().is_empty()
    }

    pub fn recorded_rounds(&self) -> Result<u32, MalformedRevisionLog> {
        if self.is_legacy() {
            count_rounds(&self.text)
        } else {
            Ok(self.rounds)
        }
    }

    pub fn next_round(&self) -> u32 {
        self.recorded_rounds().unwrap_or(0).saturating_add(1)
    }

    /// Log extended by one round, or an unchanged copy when `changes` is empty.
    pub fn with_round(&self, changes: &[String]) -> Self {
        if changes.is_empty() {
            return self.clone();
        }
        let round = self.next_round();
        Self {
            text: append_round(&self.text, changes, round),
            rounds: round,
        }
    }
}

/// Identity of a comment, which the platform does not give a stable id.
///
/// Absent components are stored as "", so `None` and `Some("")` compare equal.
/// Two anonymous comments on the same video with the same timestamp share a key
/// and are treated as one record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CommentKey {
    pub video_id: String,
    pub author_channel_id: String,
    pub comment_time_kst: String,
}

impl CommentKey {
    pub fn new(video_id: impl Into<String>, author: Option<&str>, time: Option<&str>) -> Self {
        Self {
            video_id: video_id.into(),
            author_channel_id: author.unwrap_or_default().trim().to_string(),
            comment_time_kst: time.unwrap_or_default().trim().to_string(),
        }
    }

    pub fn author(&self) -> Option<&str> {
        Some(self.author_channel_id.as_str()).filter(|s| !s.is_empty())
    }

    pub fn timestamp(&self) -> Option<&str> {
        Some(self.comment_time_kst.as_str()).filter(|s| !s.is_empty())
    }

    /// Names of the optional components that are empty and widen collision risk.
    pub fn missing_components(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.author().is_none() {
            missing.push("author_channel_id");
        }
        if self.timestamp().is_none() {
            missing.push("comment_time_kst");
        }
        missing
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub id: String,
    pub fields: FieldSet,
    pub revisions: RevisionLog,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommentRecord {
    pub key: CommentKey,
    pub fields: FieldSet,
    pub revisions: RevisionLog,
}

impl CommentRecord {
    /// Record over the tracked comment columns. The `comment_time_kst` field is
    /// taken from the key: both are the same stored column.
    pub fn new(key: CommentKey, fields: &FieldSet, revisions: RevisionLog) -> Self {
        let mut fields = fields.project(&COMMENT_FIELDS);
        fields.set("comment_time_kst", key.comment_time_kst.clone());
        Self {
            key,
            fields,
            revisions,
        }
    }
}

/// Latest raw payload for a video plus how many reconciliations changed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSnapshot {
    pub video_id: String,
    pub raw_json: String,
    pub revised_count: u32,
}

impl RawSnapshot {
    /// Snapshot after observing `raw_json`: the payload is always replaced, the
    /// counter only moves when the structured view changed.
    pub fn observe(
        existing: Option<Self>,
        video_id: &str,
        raw_json: impl Into<String>,
        changed: bool,
    ) -> Self {
        let bump = u32::from(changed);
        match existing {
            Some(prev) => Self {
                video_id: prev.video_id,
                raw_json: raw_json.into(),
                revised_count: prev.revised_count.saturating_add(bump),
            },
            None => Self {
                video_id: video_id.to_string(),
                raw_json: raw_json.into(),
                revised_count: bump,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Inserted,
    Updated { round: u32, changes: Vec<String> },
    Unchanged,
}

impl ReconcileOutcome {
    pub fn changed(&self) -> bool {
        matches!(self, Self::Updated { .. })
    }
}
