#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use super::{DispatchHandle, DispatchRequest, Dispatcher, PortFuture, ProcessState};
use crate::config::DispatcherConfig;
use crate::liveness::{Liveness, LivenessChecker};
use crate::{Result, SwarmError};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug)]
enum Tracked {
    Running(Child),
    Exited(Option<i32>),
}

/// Runs each worker as a local shell command built from a template. Children
/// are tracked in memory, so handles do not survive a restart.
#[derive(Debug)]
pub struct ProcessDispatcher {
    command: String,
    prompt_dir: PathBuf,
    children: Mutex<HashMap<i64, Tracked>>,
}

impl ProcessDispatcher {
    #[must_use]
    pub fn new(config: &DispatcherConfig) -> Self {
        Self {
            command: config.command.clone(),
            prompt_dir: std::env::temp_dir().join("swarm-prompts"),
            children: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn with_prompt_dir(mut self, prompt_dir: PathBuf) -> Self {
        self.prompt_dir = prompt_dir;
        self
    }

    fn render(&self, request: &DispatchRequest, prompt_file: &std::path::Path) -> String {
        self.command
            .replace("{agent}", request.agent.value())
            .replace("{provider}", &request.provider)
            .replace("{thinking}", &request.thinking_level)
            .replace("{workdir}", &request.workdir.display().to_string())
            .replace("{prompt_file}", &prompt_file.display().to_string())
    }

    async fn spawn(&self, request: &DispatchRequest) -> Result<DispatchHandle> {
        tokio::fs::create_dir_all(&self.prompt_dir).await?;
        let prompt_file = self.prompt_dir.join(format!(
            "{}-{}.md",
            request.agent.value(),
            uuid::Uuid::new_v4()
        ));
        tokio::fs::write(&prompt_file, &request.prompt).await?;

        let command_line = self.render(request, &prompt_file);
        let child = Command::new("sh")
            .arg("-c")
            .arg(&command_line)
            .current_dir(&request.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| SwarmError::DispatchFailed(format!("Failed to spawn worker: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| SwarmError::DispatchFailed("Worker exited before reporting a pid".to_string()))?;

        let handle = DispatchHandle::new(i64::from(pid));
        self.children
            .lock()
            .await
            .insert(handle.value(), Tracked::Running(child));
        info!(handle = handle.value(), agent = %request.agent, provider = %request.provider, "Started worker");
        Ok(handle)
    }

    async fn poll(&self, handle: DispatchHandle) -> Result<ProcessState> {
        let mut children = self.children.lock().await;
        let tracked = children.get_mut(&handle.value()).ok_or_else(|| {
            SwarmError::DispatchFailed(format!("Unknown worker handle {}", handle.value()))
        })?;
        let status = match tracked {
            Tracked::Exited(code) => return Ok(ProcessState::exited(*code)),
            Tracked::Running(child) => child.try_wait()?,
        };
        match status {
            None => Ok(ProcessState::running()),
            Some(status) => {
                let code = status.code();
                *tracked = Tracked::Exited(code);
                debug!(handle = handle.value(), exit_code = ?code, "Worker exited");
                Ok(ProcessState::exited(code))
            }
        }
    }
}

impl Dispatcher for ProcessDispatcher {
    fn dispatch<'a>(
        &'a self,
        cancel: &'a CancellationToken,
        request: &'a DispatchRequest,
    ) -> PortFuture<'a, DispatchHandle> {
        Box::pin(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => Err(SwarmError::DispatchFailed(
                    "Dispatch cancelled before the worker started".to_string(),
                )),
                handle = self.spawn(request) => handle,
            }
        })
    }

    fn is_alive(&self, handle: DispatchHandle) -> PortFuture<'_, bool> {
        Box::pin(async move {
            self.poll(handle)
                .await
                .map(|state| state == ProcessState::running())
        })
    }

    fn kill(&self, handle: DispatchHandle) -> PortFuture<'_, ()> {
        Box::pin(async move {
            let mut children = self.children.lock().await;
            if let Some(Tracked::Running(child)) = children.get_mut(&handle.value()) {
                child.start_kill()?;
                info!(handle = handle.value(), "Killed worker");
            }
            Ok(())
        })
    }

    fn session_name(&self, handle: DispatchHandle) -> String {
        format!("swarm-{}", handle.value())
    }

    fn process_state(&self, handle: DispatchHandle) -> PortFuture<'_, ProcessState> {
        Box::pin(async move {
            match self.poll(handle).await {
                Ok(state) => Ok(state),
                Err(SwarmError::DispatchFailed(_)) => Ok(ProcessState::unknown()),
                Err(err) => Err(err),
            }
        })
    }
}

impl LivenessChecker for ProcessDispatcher {
    fn probe(&self, handle: DispatchHandle) -> PortFuture<'_, Liveness> {
        Box::pin(async move {
            Ok(match self.poll(handle).await {
                Ok(state) if state == ProcessState::running() => Liveness::Live,
                Ok(_) => Liveness::Missing,
                Err(_) => Liveness::Unknown,
            })
        })
    }
}
