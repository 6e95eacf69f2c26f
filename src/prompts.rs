use std::path::{Path, PathBuf};

use tokio::fs;

use crate::error::{Result, SwarmError};
use crate::types::{Bead, StageAssignment};

/// Embedded worker prompt used when a workspace has no template of its own.
pub const DISPATCH_PROMPT_TEMPLATE: &str = include_str!("prompt_template.md");

/// Values substituted into a prompt template.
#[derive(Debug, Clone, Copy)]
pub struct PromptContext<'a> {
    pub bead: &'a Bead,
    pub stage: Option<&'a StageAssignment>,
    pub role: &'a str,
}

#[must_use]
pub fn canonical_prompt_path(workspace: &Path) -> PathBuf {
    workspace.join(".swarm").join("prompt.md")
}

/// Loads `.swarm/prompt.md` from the workspace, falling back to the embedded
/// template when the file does not exist.
///
/// # Errors
///
/// Returns an error when the template exists but cannot be read.
pub async fn load_prompt_template(workspace: &Path) -> Result<String> {
    match fs::read_to_string(canonical_prompt_path(workspace)).await {
        Ok(template) => Ok(template),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            Ok(DISPATCH_PROMPT_TEMPLATE.to_string())
        }
        Err(err) => Err(SwarmError::from(err)),
    }
}

#[must_use]
pub fn render_prompt(template: &str, context: &PromptContext<'_>) -> String {
    let stage = context.stage.map_or("", |stage| stage.stage.as_str());
    let workflow = context.stage.map_or("", |stage| stage.workflow.as_str());
    template
        .replace("{bead_id}", context.bead.id.value())
        .replace("{project}", context.bead.project.value())
        .replace("{title}", &context.bead.title)
        .replace("{stage}", stage)
        .replace("{workflow}", workflow)
        .replace("{role}", context.role)
}
