#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

//! Ordered, named pipeline stages per workflow. Pure lookup, no state.

use crate::types::{StageAssignment, Tier};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const DEFAULT_WORKFLOW: &str = "standard";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    /// Worker role dispatched for this stage.
    pub role: String,
    /// Starting tier for a fresh dispatch at this stage.
    #[serde(default)]
    pub tier: Tier,
}

impl StageDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>, role: impl Into<String>, tier: Tier) -> Self {
        Self {
            name: name.into(),
            role: role.into(),
            tier,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub name: String,
    pub stages: Vec<StageDefinition>,
}

impl WorkflowDefinition {
    #[must_use]
    pub fn new(name: impl Into<String>, stages: Vec<StageDefinition>) -> Self {
        Self {
            name: name.into(),
            stages,
        }
    }

    /// plan -> implement -> review -> qa
    #[must_use]
    pub fn standard() -> Self {
        Self::new(
            DEFAULT_WORKFLOW,
            vec![
                StageDefinition::new("plan", "planner", Tier::Balanced),
                StageDefinition::new("implement", "coder", Tier::Fast),
                StageDefinition::new("review", "reviewer", Tier::Balanced),
                StageDefinition::new("qa", "qa", Tier::Fast),
            ],
        )
    }

    #[must_use]
    pub fn total_stages(&self) -> u32 {
        u32::try_from(self.stages.len()).unwrap_or(u32::MAX)
    }

    #[must_use]
    pub fn first_stage(&self) -> Option<&StageDefinition> {
        self.stages.first()
    }

    #[must_use]
    pub fn stage_index(&self, name: &str) -> Option<u32> {
        self.stages
            .iter()
            .position(|stage| stage.name == name)
            .and_then(|index| u32::try_from(index).ok())
    }

    #[must_use]
    pub fn stage_at(&self, index: u32) -> Option<&StageDefinition> {
        usize::try_from(index)
            .ok()
            .and_then(|index| self.stages.get(index))
    }

    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|stage| stage.name == name)
    }

    #[must_use]
    pub fn next_stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stage_index(name)
            .and_then(|index| self.stage_at(index.saturating_add(1)))
    }

    #[must_use]
    pub fn is_final(&self, name: &str) -> bool {
        self.stage_index(name)
            .is_some_and(|index| index.saturating_add(1) == self.total_stages())
    }

    /// Resolve the stage a bead should be dispatched for: the labelled one when
    /// it belongs to this workflow, otherwise the first stage.
    #[must_use]
    pub fn resolve(&self, stage_label: Option<&str>) -> Option<StageAssignment> {
        let index = stage_label
            .and_then(|label| self.stage_index(label))
            .unwrap_or(0);
        self.stage_at(index).map(|stage| StageAssignment {
            workflow: self.name.clone(),
            stage: stage.name.clone(),
            stage_index: index,
            total_stages: self.total_stages(),
        })
    }
}

/// Workflow lookup by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Workflows {
    by_name: BTreeMap<String, WorkflowDefinition>,
}

impl Workflows {
    #[must_use]
    pub fn new(definitions: impl IntoIterator<Item = WorkflowDefinition>) -> Self {
        Self {
            by_name: definitions
                .into_iter()
                .map(|definition| (definition.name.clone(), definition))
                .collect(),
        }
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&WorkflowDefinition> {
        self.by_name.get(name)
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }
}
