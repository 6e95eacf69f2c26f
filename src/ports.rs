//! Collaborator seams: the worker dispatcher and the bead source.

mod json_beads;
mod process_dispatcher;

pub use json_beads::JsonBeadSource;
pub use process_dispatcher::ProcessDispatcher;

use crate::types::{AgentId, Bead, BeadId, ProjectId};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

pub type PortFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Opaque worker handle returned by a [`Dispatcher`]; stored on the dispatch row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DispatchHandle(i64);

impl DispatchHandle {
    #[must_use]
    pub const fn new(value: i64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn value(self) -> i64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRequest {
    pub agent: AgentId,
    pub prompt: String,
    pub provider: String,
    pub thinking_level: String,
    pub workdir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Running,
    Exited,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessState {
    pub state: ProcessStatus,
    pub exit_code: Option<i32>,
}

impl ProcessState {
    #[must_use]
    pub const fn running() -> Self {
        Self {
            state: ProcessStatus::Running,
            exit_code: None,
        }
    }

    #[must_use]
    pub const fn exited(exit_code: Option<i32>) -> Self {
        Self {
            state: ProcessStatus::Exited,
            exit_code,
        }
    }

    #[must_use]
    pub const fn unknown() -> Self {
        Self {
            state: ProcessStatus::Unknown,
            exit_code: None,
        }
    }

    /// Exited with status zero.
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        matches!(self.state, ProcessStatus::Exited) && matches!(self.exit_code, Some(0))
    }
}

/// Starts and supervises worker processes or sessions.
pub trait Dispatcher: Send + Sync {
    /// Start a worker. Implementations abort when `cancel` fires before the
    /// worker exists.
    fn dispatch<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        request: &'a DispatchRequest,
    ) -> PortFuture<'a, DispatchHandle>;

    fn is_alive(&self, handle: DispatchHandle) -> PortFuture<'_, bool>;

    fn kill(&self, handle: DispatchHandle) -> PortFuture<'_, ()>;

    fn session_name(&self, handle: DispatchHandle) -> String;

    fn process_state(&self, handle: DispatchHandle) -> PortFuture<'_, ProcessState>;
}

/// Read access to beads; writes are limited to stage labels.
pub trait BeadSource: Send + Sync {
    /// Every bead of `project`, open or closed.
    fn list_beads<'a>(&'a self, project: &'a ProjectId) -> PortFuture<'a, Vec<Bead>>;

    fn set_stage_label<'a>(
        &'a self,
        project: &'a ProjectId,
        bead_id: &'a BeadId,
        stage: &'a str,
    ) -> PortFuture<'a, ()>;
}
