#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![forbid(unsafe_code)]

mod cli;
mod output;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands, OutcomeArg, OutputFormat, PlanCommand};
use output::{emit_error, emit_output, map_error_to_exit_code};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use swarm::config::{load_config, resolve_database_url, DEFAULT_CONFIG_PATH};
use swarm::diagnostics::classify_failure;
use swarm::liveness::{DispatcherLiveness, TimeoutLivenessChecker};
use swarm::ports::{Dispatcher, JsonBeadSource, ProcessDispatcher};
use swarm::{
    ConfigHandle, DispatchId, DispatchOutcome, RateLimiter, Scheduler, SchedulerConfig, SwarmDb,
    SwarmError,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    let output = cli.output.clone();
    let command = command_name(&cli.command);
    if let Err(err) = run(cli).await {
        let swarm_error = err.downcast_ref::<SwarmError>();
        let code = swarm_error.map_or("INTERNAL", SwarmError::code);
        emit_error(&output, command, &format!("{err:#}"), code);
        std::process::exit(swarm_error.map_or(1, map_error_to_exit_code));
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

const fn command_name(command: &Commands) -> &'static str {
    match command {
        Commands::InitDb => "init-db",
        Commands::Tick => "tick",
        Commands::Run => "run",
        Commands::Status => "status",
        Commands::Plan { .. } => "plan",
        Commands::Health { .. } => "health",
        Commands::Complete { .. } => "complete",
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let Cli {
        command,
        config,
        database_url,
        output,
        ..
    } = cli;
    let config_path = config.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    match command {
        Commands::InitDb => {
            let loaded = optional_config(&config_path).await?;
            let url = resolve_database_url(database_url.as_deref(), loaded.as_ref());
            SwarmDb::new(&url).await.context("initialising store")?;
            emit_output(
                &output,
                "init-db",
                json!({ "database_url": url, "message": format!("Store ready at {url}") }),
            );
            Ok(())
        }

        Commands::Tick => {
            let scheduler = build_scheduler(&config_path, database_url.as_deref()).await?;
            let report = scheduler.run_tick(&CancellationToken::new()).await?;
            emit_output(&output, "tick", serde_json::to_value(report)?);
            Ok(())
        }

        Commands::Run => {
            let scheduler = build_scheduler(&config_path, database_url.as_deref()).await?;
            run_loop(&scheduler, &config_path).await;
            emit_output(&output, "run", json!({ "message": "Scheduler stopped" }));
            Ok(())
        }

        Commands::Status => {
            let loaded = optional_config(&config_path).await?;
            let db = open_store(database_url.as_deref(), loaded.as_ref()).await?;
            let limits = loaded.map(|config| config.rate_limits).unwrap_or_default();
            let allocation = db.get_current_allocation().await?;
            let stages = db.get_running_dispatch_stage_counts().await?;
            let usage = RateLimiter::new(db.clone(), limits).usage_snapshot().await?;
            let gate = db.get_plan_gate().await?;
            emit_output(
                &output,
                "status",
                json!({
                    "gate": gate,
                    "allocation": allocation,
                    "stages": stages,
                    "usage": usage,
                }),
            );
            Ok(())
        }

        Commands::Plan { action } => {
            let loaded = optional_config(&config_path).await?;
            let db = open_store(database_url.as_deref(), loaded.as_ref()).await?;
            match action {
                PlanCommand::Activate { plan_id, approver } => {
                    db.activate_plan(&plan_id, &approver).await?;
                    emit_output(
                        &output,
                        "plan",
                        json!({
                            "plan_id": plan_id,
                            "approved_by": approver,
                            "message": format!("Plan {plan_id} active"),
                        }),
                    );
                }
                PlanCommand::Clear => {
                    let cleared = db.clear_plan().await?;
                    emit_output(
                        &output,
                        "plan",
                        json!({ "cleared": cleared, "message": "Plan gate closed" }),
                    );
                }
            }
            Ok(())
        }

        Commands::Health { limit } => {
            let loaded = optional_config(&config_path).await?;
            let db = open_store(database_url.as_deref(), loaded.as_ref()).await?;
            let events = db.get_recent_health_events(limit).await?;
            emit_output(&output, "health", json!({ "events": events }));
            Ok(())
        }

        Commands::Complete {
            dispatch_id,
            outcome,
            revert_to,
            summary,
            exit_code,
        } => {
            let scheduler = build_scheduler(&config_path, database_url.as_deref()).await?;
            let outcome = completion_outcome(outcome, revert_to, summary, exit_code)?;
            let result = scheduler
                .complete_dispatch(DispatchId::new(dispatch_id), outcome)
                .await?;
            emit_output(&output, "complete", serde_json::to_value(result)?);
            Ok(())
        }
    }
}

fn completion_outcome(
    outcome: OutcomeArg,
    revert_to: Option<String>,
    summary: String,
    exit_code: Option<i32>,
) -> swarm::Result<DispatchOutcome> {
    Ok(match outcome {
        OutcomeArg::Completed => DispatchOutcome::Completed,
        OutcomeArg::ChangesRequested => DispatchOutcome::ChangesRequested {
            revert_to: revert_to.ok_or_else(|| {
                SwarmError::ConfigError("--revert-to is required with changes-requested".to_string())
            })?,
        },
        OutcomeArg::Failed => DispatchOutcome::Failed {
            category: classify_failure(&summary, exit_code),
            summary,
            exit_code,
        },
        OutcomeArg::Cancelled => DispatchOutcome::Cancelled,
        OutcomeArg::Interrupted => DispatchOutcome::Interrupted,
    })
}

async fn optional_config(path: &Path) -> swarm::Result<Option<SchedulerConfig>> {
    if path.exists() {
        load_config(Some(path.to_path_buf())).await.map(Some)
    } else {
        Ok(None)
    }
}

async fn open_store(flag: Option<&str>, config: Option<&SchedulerConfig>) -> anyhow::Result<SwarmDb> {
    let url = resolve_database_url(flag, config);
    SwarmDb::new(&url)
        .await
        .with_context(|| format!("opening store {url}"))
}

async fn build_scheduler(config_path: &Path, database_url: Option<&str>) -> anyhow::Result<Scheduler> {
    let config = load_config(Some(config_path.to_path_buf())).await?;
    let db = open_store(database_url, Some(&config)).await?;
    let dispatcher: Arc<dyn Dispatcher> = Arc::new(ProcessDispatcher::new(&config.dispatcher));
    let liveness = TimeoutLivenessChecker::new(
        DispatcherLiveness::new(Arc::clone(&dispatcher)),
        config.health.probe_timeout(),
    );
    let beads = JsonBeadSource::from_config(&config);
    Ok(Scheduler::new(
        ConfigHandle::new(config),
        db,
        dispatcher,
        Arc::new(beads),
        Arc::new(liveness),
    ))
}

/// Tick until ctrl-c, re-reading the config file before each tick. A config
/// that fails to load or validate leaves the previous one in force.
async fn run_loop(scheduler: &Scheduler, config_path: &Path) {
    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                shutdown.cancel();
            }
            Err(err) => warn!(error = %err, "Cannot listen for ctrl-c; run until killed"),
        }
    });

    while !cancel.is_cancelled() {
        if let Err(err) = scheduler.config().reload_from(config_path).await {
            warn!(error = %err, path = %config_path.display(), "Config reload failed; keeping previous config");
        }
        if let Err(err) = scheduler.run_tick(&cancel).await {
            warn!(error = %err, "Tick failed");
        }
        let interval = scheduler.config().current().tick_interval();
        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(interval) => {}
        }
    }
}
