#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

use crate::error::{Result, SwarmError};
use crate::health::HealthConfig;
use crate::rate_limiter::RateLimitConfig;
use crate::retry::RetryPolicy;
use crate::types::{ProjectId, Tier};
use crate::workflow::{WorkflowDefinition, Workflows, DEFAULT_WORKFLOW};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

pub const DEFAULT_CONFIG_PATH: &str = ".swarm/dispatch.toml";
pub const DEFAULT_DATABASE_URL: &str = "sqlite://.swarm/dispatch.db";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub database_url: Option<String>,
    /// Identity written into claim leases taken by this scheduler.
    pub holder: String,
    pub tick_interval_secs: u64,
    pub max_per_tick: usize,
    pub cooldown_secs: u64,
    pub lease_expiry_secs: u64,
    pub dispatch_timeout_secs: u64,
    pub projects: BTreeMap<String, ProjectConfig>,
    pub tiers: TierConfig,
    pub providers: BTreeMap<String, ProviderConfig>,
    pub rate_limits: RateLimitConfig,
    pub retry: RetryPolicy,
    pub health: HealthConfig,
    pub workflows: Vec<WorkflowDefinition>,
    pub dispatcher: DispatcherConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            holder: "swarm-scheduler".to_string(),
            tick_interval_secs: 60,
            max_per_tick: 3,
            cooldown_secs: 300,
            lease_expiry_secs: 900,
            dispatch_timeout_secs: 60,
            projects: BTreeMap::new(),
            tiers: TierConfig::default(),
            providers: BTreeMap::new(),
            rate_limits: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
            health: HealthConfig::default(),
            workflows: vec![WorkflowDefinition::standard()],
            dispatcher: DispatcherConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    pub workspace: PathBuf,
    pub enabled: bool,
    pub max_concurrent: u32,
    pub workflow: String,
    /// Tie-break between projects for beads of equal priority; lower first.
    pub priority: u8,
    /// JSON bead list read by the file-backed bead source.
    pub beads_file: Option<PathBuf>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from("."),
            enabled: true,
            max_concurrent: 3,
            workflow: DEFAULT_WORKFLOW.to_string(),
            priority: 2,
            beads_file: None,
        }
    }
}

/// Tier -> ordered provider names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierConfig {
    pub fast: Vec<String>,
    pub balanced: Vec<String>,
    pub premium: Vec<String>,
}

impl TierConfig {
    #[must_use]
    pub fn providers(&self, tier: Tier) -> &[String] {
        match tier {
            Tier::Fast => &self.fast,
            Tier::Balanced => &self.balanced,
            Tier::Premium => &self.premium,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        Tier::LADDER
            .iter()
            .all(|tier| self.providers(*tier).is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Subscription-authenticated providers count against the usage windows.
    pub authed: bool,
    pub thinking_level: String,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            authed: true,
            thinking_level: "medium".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Command template; `{agent}`, `{provider}`, `{thinking}`, `{workdir}` and
    /// `{prompt_file}` are substituted.
    pub command: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            command: "echo {agent} {provider} {prompt_file}".to_string(),
        }
    }
}

/// Provider picked for a requested tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSelection {
    pub tier: Tier,
    pub provider: String,
    pub authed: bool,
    pub thinking_level: String,
}

impl SchedulerConfig {
    #[must_use]
    pub const fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    #[must_use]
    pub const fn lease_expiry(&self) -> Duration {
        Duration::from_secs(self.lease_expiry_secs)
    }

    #[must_use]
    pub const fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    #[must_use]
    pub fn workflow_registry(&self) -> Workflows {
        Workflows::new(self.workflows.iter().cloned())
    }

    #[must_use]
    pub fn project(&self, project: &ProjectId) -> Option<&ProjectConfig> {
        self.projects.get(project.value())
    }

    pub fn enabled_projects(&self) -> impl Iterator<Item = (ProjectId, &ProjectConfig)> {
        self.projects
            .iter()
            .filter(|(_, project)| project.enabled)
            .map(|(name, project)| (ProjectId::new(name.clone()), project))
    }

    /// First provider at `tier`, walking up the ladder when a tier is unstaffed.
    #[must_use]
    pub fn select_provider(&self, tier: Tier) -> Option<ProviderSelection> {
        Tier::LADDER
            .iter()
            .filter(|candidate| **candidate >= tier)
            .find_map(|candidate| {
                self.tiers
                    .providers(*candidate)
                    .first()
                    .map(|provider| (*candidate, provider))
            })
            .map(|(tier, provider)| {
                let settings = self.providers.get(provider).cloned().unwrap_or_default();
                ProviderSelection {
                    tier,
                    provider: provider.clone(),
                    authed: settings.authed,
                    thinking_level: settings.thinking_level,
                }
            })
    }

    /// # Errors
    /// Returns `ConfigError` for configurations the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.tiers.is_empty() {
            return Err(SwarmError::ConfigError(
                "at least one tier must list a provider".to_string(),
            ));
        }
        if self.max_per_tick == 0 {
            return Err(SwarmError::ConfigError(
                "max_per_tick must be greater than zero".to_string(),
            ));
        }
        self.rate_limits.validate()?;
        self.retry.validate()?;

        let workflows = self.workflow_registry();
        if let Some(empty) = self.workflows.iter().find(|w| w.stages.is_empty()) {
            return Err(SwarmError::ConfigError(format!(
                "workflow {} has no stages",
                empty.name
            )));
        }
        if let Some((name, project)) = self
            .projects
            .iter()
            .find(|(_, project)| !workflows.contains(&project.workflow))
        {
            return Err(SwarmError::ConfigError(format!(
                "project {name} uses unknown workflow {}",
                project.workflow
            )));
        }
        Ok(())
    }
}

/// # Errors
/// Returns an error when the file cannot be read, parsed or validated.
pub async fn load_config(path: Option<PathBuf>) -> Result<SchedulerConfig> {
    let config_path = path.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    if !config_path.exists() {
        return Err(SwarmError::ConfigError(format!(
            "config file not found: {}",
            config_path.display()
        )));
    }

    let content = tokio::fs::read_to_string(&config_path)
        .await
        .map_err(|e| SwarmError::ConfigError(format!("Failed to read config: {e}")))?;

    let config = parse_config_content(&content)?;
    config.validate()?;
    Ok(config)
}

/// # Errors
/// Returns `ConfigError` when the TOML does not describe a scheduler config.
pub fn parse_config_content(content: &str) -> Result<SchedulerConfig> {
    let mut config: SchedulerConfig = toml::from_str(content)
        .map_err(|e| SwarmError::ConfigError(format!("Invalid config: {e}")))?;
    config.database_url = config.database_url.map(|url| expand_env_vars(&url));
    Ok(config)
}

/// Flag, then `SWARM_DATABASE_URL`, then config, then the default file.
#[must_use]
pub fn resolve_database_url(flag: Option<&str>, config: Option<&SchedulerConfig>) -> String {
    resolve_database_url_from(flag, config, |key| std::env::var(key).ok())
}

fn resolve_database_url_from<F>(
    flag: Option<&str>,
    config: Option<&SchedulerConfig>,
    env_lookup: F,
) -> String
where
    F: Fn(&str) -> Option<String>,
{
    flag.map(str::to_string)
        .or_else(|| env_lookup("SWARM_DATABASE_URL"))
        .or_else(|| config.and_then(|config| config.database_url.clone()))
        .map(|url| url.trim().to_string())
        .filter(|url| !url.is_empty())
        .unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string())
}

fn expand_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    while let Some(start) = result.find("${") {
        if let Some(end) = result[start..].find('}') {
            let var_part = &result[start + 2..start + end];
            let (var_name, default) = var_part.split_once(":-").unwrap_or((var_part, ""));
            let value = std::env::var(var_name).unwrap_or_else(|_| default.to_string());
            result.replace_range(start..=(start + end), &value);
        } else {
            break;
        }
    }
    result
}

/// Hot-reloadable configuration. Readers take one immutable snapshot per tick;
/// reload swaps the pointer and never mutates a snapshot in place.
#[derive(Debug, Clone)]
pub struct ConfigHandle {
    sender: Arc<watch::Sender<Arc<SchedulerConfig>>>,
}

impl ConfigHandle {
    #[must_use]
    pub fn new(config: SchedulerConfig) -> Self {
        let (sender, _receiver) = watch::channel(Arc::new(config));
        Self {
            sender: Arc::new(sender),
        }
    }

    #[must_use]
    pub fn current(&self) -> Arc<SchedulerConfig> {
        Arc::clone(&self.sender.borrow())
    }

    /// # Errors
    /// Returns `ConfigError` and keeps the old snapshot if validation fails.
    pub fn replace(&self, config: SchedulerConfig) -> Result<()> {
        config.validate()?;
        self.sender.send_replace(Arc::new(config));
        Ok(())
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<SchedulerConfig>> {
        self.sender.subscribe()
    }

    /// # Errors
    /// Returns an error when the file cannot be loaded; the old snapshot stays active.
    pub async fn reload_from(&self, path: &Path) -> Result<()> {
        let config = load_config(Some(path.to_path_buf())).await?;
        self.replace(config)
    }
}
