use super::{BeadSource, PortFuture};
use crate::config::SchedulerConfig;
use crate::labels::Labels;
use crate::types::{Bead, BeadId, ProjectId};
use crate::{Result, SwarmError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::debug;

pub const DEFAULT_BEADS_FILE: &str = "beads.json";

/// Beads kept as a JSON array per project. Label writes rewrite the file
/// through a temporary sibling and a rename.
#[derive(Debug, Default)]
pub struct JsonBeadSource {
    files: BTreeMap<ProjectId, PathBuf>,
    write_lock: Mutex<()>,
}

impl JsonBeadSource {
    #[must_use]
    pub fn new(files: BTreeMap<ProjectId, PathBuf>) -> Self {
        Self {
            files,
            write_lock: Mutex::new(()),
        }
    }

    /// One file per configured project: `beads_file`, or `beads.json` in the
    /// project workspace.
    #[must_use]
    pub fn from_config(config: &SchedulerConfig) -> Self {
        let files = config
            .projects
            .iter()
            .map(|(name, project)| {
                let path = project
                    .beads_file
                    .clone()
                    .unwrap_or_else(|| project.workspace.join(DEFAULT_BEADS_FILE));
                (ProjectId::new(name.clone()), path)
            })
            .collect();
        Self::new(files)
    }

    fn path_for(&self, project: &ProjectId) -> Result<&Path> {
        self.files
            .get(project)
            .map(PathBuf::as_path)
            .ok_or_else(|| SwarmError::ConfigError(format!("No bead file for project {project}")))
    }

    async fn read(&self, project: &ProjectId) -> Result<Vec<Bead>> {
        let path = self.path_for(project)?;
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut beads: Vec<Bead> = serde_json::from_str(&content)?;
        for bead in &mut beads {
            bead.project = project.clone();
        }
        Ok(beads)
    }
}

impl BeadSource for JsonBeadSource {
    fn list_beads<'a>(&'a self, project: &'a ProjectId) -> PortFuture<'a, Vec<Bead>> {
        Box::pin(async move { self.read(project).await })
    }

    fn set_stage_label<'a>(
        &'a self,
        project: &'a ProjectId,
        bead_id: &'a BeadId,
        stage: &'a str,
    ) -> PortFuture<'a, ()> {
        Box::pin(async move {
            let _guard = self.write_lock.lock().await;
            let mut beads = self.read(project).await?;
            let bead = beads
                .iter_mut()
                .find(|bead| &bead.id == bead_id)
                .ok_or_else(|| {
                    SwarmError::BeadError(format!("Bead {bead_id} not found in project {project}"))
                })?;
            bead.labels = Labels::from(bead.labels.as_slice())
                .with_stage(stage)
                .into_vec();

            let path = self.path_for(project)?;
            let tmp = path.with_extension("json.tmp");
            tokio::fs::write(&tmp, serde_json::to_vec_pretty(&beads)?).await?;
            tokio::fs::rename(&tmp, path).await?;
            debug!(project = %project, bead_id = %bead_id, stage, "Wrote stage label");
            Ok(())
        })
    }
}
