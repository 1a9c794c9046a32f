use serde::{Deserialize, Serialize};

use crate::time::VirtualTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UpdateKind {
    TagValue,
    Supervision,
}

impl std::fmt::Display for UpdateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateKind::TagValue => write!(f, "TagValue"),
            UpdateKind::Supervision => write!(f, "Supervision"),
        }
    }
}

/// Identifies one replayed stream: a tag's value history or its supervision events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UpdateId {
    pub tag_id: u64,
    pub kind: UpdateKind,
}

impl UpdateId {
    pub fn tag(tag_id: u64) -> Self {
        Self { tag_id, kind: UpdateKind::TagValue }
    }

    pub fn supervision(tag_id: u64) -> Self {
        Self { tag_id, kind: UpdateKind::Supervision }
    }

    pub fn is_supervision(&self) -> bool {
        self.kind == UpdateKind::Supervision
    }
}

impl std::fmt::Display for UpdateId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.kind, self.tag_id)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Quality {
    #[default]
    Valid,
    Invalid { reason: String },
}

/// One recorded value update with its source timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub id: UpdateId,
    pub timestamp: VirtualTime,
    pub value: serde_json::Value,
    #[serde(default)]
    pub quality: Quality,
}

impl HistoryRecord {
    pub fn new(id: UpdateId, timestamp: VirtualTime, value: serde_json::Value) -> Self {
        Self { id, timestamp, value, quality: Quality::Valid }
    }
}

/// What a publish sink receives during playback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PublishedUpdate {
    /// Value at the current virtual time, sent right after a (re)initialisation.
    Initial(HistoryRecord),
    /// A record fired by the scheduler at its virtual time.
    Live(HistoryRecord),
    /// Placeholder for an id that has no record at or before `time`.
    Invalidated {
        id: UpdateId,
        time: VirtualTime,
        reason: String,
    },
}

impl PublishedUpdate {
    pub fn id(&self) -> UpdateId {
        match self {
            PublishedUpdate::Initial(r) | PublishedUpdate::Live(r) => r.id,
            PublishedUpdate::Invalidated { id, .. } => *id,
        }
    }

    /// Virtual time the update describes.
    pub fn time(&self) -> VirtualTime {
        match self {
            PublishedUpdate::Initial(r) | PublishedUpdate::Live(r) => r.timestamp,
            PublishedUpdate::Invalidated { time, .. } => *time,
        }
    }
}

/// Order ids so supervision streams come after every tag-value stream.
///
/// A tag-value update resets consumer-side supervision state, so supervision
/// events must land last. Relative order is otherwise preserved.
pub fn sort_supervision_last(ids: &mut [UpdateId]) {
    ids.sort_by_key(|id| id.is_supervision());
}
