//! Statekeeper command-line interface: offline validation and read-only planning.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::debug;
use statekeeper_core::{
    approval::{ApprovalStore, SqliteApprovalRepository},
    config::{StatekeeperConfig, DEFAULT_CONFIG_PATH},
    logging,
    plan::{Plan, PlanAction},
    service::ReconcileService,
    state::{default_template, json_schema, DesiredState},
    StatekeeperError,
};
use statekeeper_system::{SambaShareProvider, SystemZfsProvider};
use serde_json::to_string_pretty;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(
    name = "statekeeper",
    version,
    about = "Declarative ZFS and Samba state for a NAS host."
)]
struct Cli {
    /// Path to the statekeeper configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Parse and validate a desired-state file without touching the host.
    Validate {
        /// State file to check; defaults to `state.path` from the configuration.
        file: Option<PathBuf>,
    },

    /// Show what an apply would do right now. Never mutates anything.
    Plan {
        /// Emit the plan as JSON instead of a table.
        #[arg(long)]
        json: bool,
    },

    /// Print the JSON schema of the desired-state file.
    Schema,

    /// Print an annotated starter state file.
    Template,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    logging::init("statekeeper", "warn");
    let cli = Cli::parse();

    match cli.command {
        Commands::Validate { file } => {
            let path = match file {
                Some(path) => path,
                None => load_config(&cli.config)?.state.path,
            };
            validate(&path)?;
        }
        Commands::Plan { json } => {
            let config = Arc::new(load_config(&cli.config)?);
            debug!("planning against {}", config.state.path.display());
            let zfs = SystemZfsProvider::from_config(&config)?;
            let shares = SambaShareProvider::from_config(&config)?;
            let repository = SqliteApprovalRepository::open(&config.database.path)
                .with_context(|| format!("open database {}", config.database.path.display()))?;
            let approvals = ApprovalStore::open(Box::new(repository))?;
            let service = ReconcileService::new(config.clone(), zfs, shares, approvals);

            let plan = service.plan()?;
            if json {
                println!("{}", to_string_pretty(&plan)?);
            } else {
                print_plan(&plan);
            }
        }
        Commands::Schema => {
            println!("{}", to_string_pretty(&json_schema())?);
        }
        Commands::Template => {
            print!("{}", default_template());
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<StatekeeperConfig> {
    StatekeeperConfig::load(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn validate(path: &Path) -> Result<()> {
    let content =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    match DesiredState::parse(&content) {
        Ok(state) => {
            println!("{} is valid: {}", path.display(), state.summary());
            Ok(())
        }
        Err(StatekeeperError::Validation { field, message }) => {
            eprintln!("{} is invalid:", path.display());
            eprintln!("  - {field}: {message}");
            anyhow::bail!("validation failed")
        }
        Err(err) => Err(err).with_context(|| format!("parse {}", path.display())),
    }
}

fn print_plan(plan: &Plan) {
    println!(
        "{:<8} {:<8} {:<32} {:<9} {}",
        "ACTION", "KIND", "NAME", "RISK", "DETAILS"
    );
    for item in &plan.items {
        let mut details: Vec<String> = item.changes.iter().map(ToString::to_string).collect();
        if item.action == PlanAction::Blocked {
            details.push(if item.approved {
                "approved".to_string()
            } else {
                "needs approval".to_string()
            });
        }
        println!(
            "{:<8} {:<8} {:<32} {:<9} {}",
            item.action.to_string(),
            item.kind.to_string(),
            item.name,
            item.risk_level.to_string(),
            details.join("; ")
        );
        if let Some(reason) = item.block_reason.as_deref().filter(|_| !item.approved) {
            println!("         {reason}");
        }
    }

    let s = &plan.summary;
    println!();
    println!(
        "{} to create, {} to modify, {} to delete, {} blocked, {} unchanged.",
        s.create_count, s.modify_count, s.delete_count, s.blocked_count, s.nop_count
    );
    if !s.safe_to_apply {
        println!("Apply is gated until every blocked item is approved.");
    }
}
