use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One heading line extracted from a document outline. `index` is assigned
/// once at parse time and is the only stable identity for an entry; it must
/// survive re-leveling, filtering, and rendering untouched. Lines the codec
/// could not parse are kept as pass-through entries with `index: None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TocEntry {
    pub index: Option<usize>,
    pub level: u32,
    pub title: String,
    pub page: Option<i64>,
    pub roman: Option<String>,
    pub front: bool,
    pub marked: bool,
    pub raw: String,
}

impl TocEntry {
    pub fn is_parsed(&self) -> bool {
        self.index.is_some()
    }
}

/// Closed section vocabulary. `Other` is both a valid member and the value
/// downstream consumers assume when an entry carries no label at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionLabel {
    ExecutiveSummary,
    Context,
    Methodology,
    Findings,
    Conclusions,
    Recommendations,
    Annexes,
    Other,
}

pub const SECTION_TYPES: [SectionLabel; 8] = [
    SectionLabel::ExecutiveSummary,
    SectionLabel::Context,
    SectionLabel::Methodology,
    SectionLabel::Findings,
    SectionLabel::Conclusions,
    SectionLabel::Recommendations,
    SectionLabel::Annexes,
    SectionLabel::Other,
];

impl SectionLabel {
    pub fn as_str(self) -> &'static str {
        match self {
            SectionLabel::ExecutiveSummary => "executive_summary",
            SectionLabel::Context => "context",
            SectionLabel::Methodology => "methodology",
            SectionLabel::Findings => "findings",
            SectionLabel::Conclusions => "conclusions",
            SectionLabel::Recommendations => "recommendations",
            SectionLabel::Annexes => "annexes",
            SectionLabel::Other => "other",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        SECTION_TYPES
            .iter()
            .copied()
            .find(|label| label.as_str() == value.trim())
    }
}

/// Labels keyed by original entry index. Absence means "not yet classified",
/// never "other"; only terminal consumers default absent entries.
pub type LabelMap = BTreeMap<usize, SectionLabel>;

/// A downstream text fragment to tag with a section label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    #[serde(default)]
    pub page_num: Option<i64>,
    #[serde(default)]
    pub headings: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section_label: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Result of tagging a chunk: either a bare label or a set of metadata field
/// updates for callers that write several fields at once.
#[derive(Debug, Clone, PartialEq)]
pub enum TagOutcome {
    SingleLabel(SectionLabel),
    FieldUpdates(BTreeMap<String, serde_json::Value>),
}

impl TagOutcome {
    pub fn label(&self) -> SectionLabel {
        match self {
            TagOutcome::SingleLabel(label) => *label,
            TagOutcome::FieldUpdates(fields) => fields
                .get("section_label")
                .and_then(|value| value.as_str())
                .and_then(SectionLabel::parse)
                .unwrap_or(SectionLabel::Other),
        }
    }
}
