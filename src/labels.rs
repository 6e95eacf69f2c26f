#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use crate::error::Result;
use crate::types::{parse_stage_label, stage_label};
use itertools::Itertools;
use serde::{Deserialize, Serialize};

/// Normalized label set: trimmed, no empties, first occurrence wins, order kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Labels(Vec<String>);

impl Labels {
    #[must_use]
    pub fn new<I, S>(labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            labels
                .into_iter()
                .map(|label| label.as_ref().trim().to_string())
                .filter(|label| !label.is_empty())
                .unique()
                .collect(),
        )
    }

    /// Parse a raw comma or newline delimited string.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        Self::new(raw.split([',', '\n']))
    }

    /// Replace any `stage:` label with the given stage, appended last.
    #[must_use]
    pub fn with_stage(self, stage: &str) -> Self {
        let stage = stage_label(stage);
        Self::new(
            self.0
                .into_iter()
                .filter(|label| parse_stage_label(label).is_none())
                .chain(std::iter::once(stage)),
        )
    }

    #[must_use]
    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    #[must_use]
    pub fn into_vec(self) -> Vec<String> {
        self.0
    }

    /// Storage form: a JSON array, so labels may carry commas.
    ///
    /// # Errors
    /// Returns `SerializationError` if encoding fails.
    pub fn to_storage(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.0)?)
    }

    /// Read the storage form. Anything that is not a JSON array is treated
    /// as a comma-joined list.
    #[must_use]
    pub fn from_storage(stored: &str) -> Self {
        serde_json::from_str::<Vec<String>>(stored)
            .map_or_else(|_| Self::new(stored.split(',')), Self::new)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<String>> for Labels {
    fn from(labels: Vec<String>) -> Self {
        Self::new(labels)
    }
}

impl From<&[String]> for Labels {
    fn from(labels: &[String]) -> Self {
        Self::new(labels)
    }
}

impl From<&str> for Labels {
    fn from(raw: &str) -> Self {
        Self::parse(raw)
    }
}
