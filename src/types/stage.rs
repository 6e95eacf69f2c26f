use super::{BeadId, DispatchId, ProjectId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status of one stage visit in a bead's pipeline history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Started,
    Passed,
    Failed,
    Reverted,
}

impl StageStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Passed => "passed",
            Self::Failed => "failed",
            Self::Reverted => "reverted",
        }
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for StageStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "started" => Ok(Self::Started),
            "passed" => Ok(Self::Passed),
            "failed" => Ok(Self::Failed),
            "reverted" => Ok(Self::Reverted),
            _ => Err(format!("Unknown stage status: {value}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageHistoryEntry {
    pub stage: String,
    pub status: StageStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub dispatch_id: Option<DispatchId>,
}

/// Pipeline position keyed by (project, bead id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeadStage {
    pub project: ProjectId,
    pub bead_id: BeadId,
    pub workflow: String,
    pub current_stage: String,
    pub stage_index: u32,
    pub total_stages: u32,
    pub completed: bool,
    pub updated_at: DateTime<Utc>,
    pub history: Vec<StageHistoryEntry>,
}

impl BeadStage {
    #[must_use]
    pub const fn is_final_stage(&self) -> bool {
        self.stage_index + 1 >= self.total_stages
    }
}

/// Initial stage placement written together with a dispatch row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageAssignment {
    pub workflow: String,
    pub stage: String,
    pub stage_index: u32,
    pub total_stages: u32,
}
