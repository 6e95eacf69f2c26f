use super::{BeadId, ProjectId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const STAGE_LABEL_PREFIX: &str = "stage:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BeadStatus {
    #[default]
    Open,
    Closed,
}

impl BeadStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Closed => "closed",
        }
    }
}

/// Unit of work owned by the external task tracker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bead {
    pub id: BeadId,
    /// Filled in by the bead source when a file omits it.
    #[serde(default)]
    pub project: ProjectId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: BeadStatus,
    /// 0 is the highest priority, 4 the lowest.
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub depends_on: Vec<BeadId>,
    #[serde(default)]
    pub estimate_minutes: Option<u32>,
    pub created_at: DateTime<Utc>,
}

const fn default_priority() -> u8 {
    2
}

impl Bead {
    #[must_use]
    pub const fn is_open(&self) -> bool {
        matches!(self.status, BeadStatus::Open)
    }

    /// Pipeline stage encoded in a `stage:<name>` label, if any.
    #[must_use]
    pub fn stage_label(&self) -> Option<&str> {
        self.labels.iter().find_map(|label| parse_stage_label(label))
    }
}

#[must_use]
pub fn parse_stage_label(label: &str) -> Option<&str> {
    label
        .trim()
        .strip_prefix(STAGE_LABEL_PREFIX)
        .map(str::trim)
        .filter(|stage| !stage.is_empty())
}

#[must_use]
pub fn stage_label(stage: &str) -> String {
    format!("{STAGE_LABEL_PREFIX}{stage}")
}
