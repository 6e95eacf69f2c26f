use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "swarm")]
#[command(about = "Bead dispatch scheduler for coding-agent swarms")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to config file (default: .swarm/dispatch.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(long, global = true)]
    pub database_url: Option<String>,

    #[arg(long, global = true, value_enum, default_value = "json")]
    pub output: OutputFormat,

    /// Emit logs as JSON lines instead of text.
    #[arg(long, global = true, default_value_t = false)]
    pub log_json: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the store and apply the schema
    InitDb,
    /// Run a single scheduler tick
    Tick,
    /// Tick on an interval until interrupted
    Run,
    /// Show active allocation, stage counts and quota usage
    Status,
    /// Manage the execution plan gate
    Plan {
        #[command(subcommand)]
        action: PlanCommand,
    },
    /// Show recent health events
    Health {
        #[arg(short, long, default_value = "20")]
        limit: u32,
    },
    /// Report how a dispatched worker finished
    Complete {
        dispatch_id: i64,
        #[arg(long, value_enum, default_value = "completed")]
        outcome: OutcomeArg,
        /// Stage to send the bead back to with `changes-requested`
        #[arg(long)]
        revert_to: Option<String>,
        #[arg(long, default_value = "")]
        summary: String,
        #[arg(long)]
        exit_code: Option<i32>,
    },
}

#[derive(Subcommand)]
pub enum PlanCommand {
    Activate {
        plan_id: String,
        #[arg(long)]
        approver: String,
    },
    Clear,
}

#[derive(Clone, Debug, ValueEnum, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, ValueEnum, PartialEq, Eq)]
pub enum OutcomeArg {
    Completed,
    ChangesRequested,
    Failed,
    Cancelled,
    Interrupted,
}
