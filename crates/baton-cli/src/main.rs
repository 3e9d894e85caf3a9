//! baton CLI - agent-facing interface to the shared task ledger.
//!
//! 結果は常に JSON で stdout に、ログは stderr に出します。
//!
//! | exit | 意味                                   |
//! |------|----------------------------------------|
//! | 0    | allowed / success                      |
//! | 1    | not allowed / refused / doctor findings |
//! | 2    | task not found                         |
//! | 3    | ledger unavailable or corrupt          |
//! | 4    | lock timeout (retry later)             |
//! | 5    | configuration error                    |

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use baton_core::app::BuildError;
use baton_core::config::ConfigError;
use baton_core::domain::ErrorKind;
use baton_core::{AgentId, CoordinatorBuilder, CoordinatorConfig, CoordinatorError, TaskStatus};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, error};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "baton", about = "Claim, validate and complete tasks in a shared ledger")]
struct Cli {
    /// Ledger file (defaults to TASKS/MASTER_TASKS.json)
    #[arg(long, global = true, env = "BATON_LEDGER")]
    ledger: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check whether an agent may start a task now
    Validate {
        task_id: String,
        agent_id: Option<String>,
    },
    /// Move a task to a new status (in_progress or completed)
    Transition {
        task_id: String,
        status: TaskStatus,
        agent_id: Option<String>,
    },
    /// Claim a task (transition to in_progress)
    Claim { task_id: String, agent_id: String },
    /// Complete a task
    Complete {
        task_id: String,
        agent_id: Option<String>,
    },
    /// List tasks the agent could claim right now
    Ready { agent_id: Option<String> },
    /// Counts by status and active claims
    Status,
    /// Read-only consistency check of the ledger
    Doctor,
    /// Release every stale claim
    Reclaim,
}

#[derive(Serialize)]
struct Failure {
    success: bool,
    reason: String,
    kind: &'static str,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing();

    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            error!(error = %format!("{err:#}"), "baton failed");
            let (code, kind) = classify(&err);
            let failure = Failure {
                success: false,
                reason: format!("{err:#}"),
                kind,
            };
            if let Ok(json) = serde_json::to_string_pretty(&failure) {
                println!("{json}");
            }
            ExitCode::from(code)
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("BATON_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = CoordinatorConfig::from_env()?;
    if let Some(ledger) = cli.ledger {
        config.ledger = ledger;
    }
    debug!(ledger = %config.ledger.display(), "using ledger");
    let coordinator = CoordinatorBuilder::from_config(&config).build()?;

    let code = match cli.command {
        Command::Validate { task_id, agent_id } => {
            let agent = agent_id.map(AgentId::new);
            let decision = coordinator.validate(&task_id, agent.as_ref()).await?;
            print_json(&decision)?;
            verdict(decision.allowed)
        }
        Command::Transition {
            task_id,
            status,
            agent_id,
        } => {
            let agent = agent_id.map(AgentId::new);
            let outcome = coordinator
                .transition(&task_id, status, agent.as_ref())
                .await?;
            print_json(&outcome)?;
            verdict(outcome.success)
        }
        Command::Claim { task_id, agent_id } => {
            let outcome = coordinator
                .claim(&task_id, &AgentId::new(agent_id))
                .await?;
            print_json(&outcome)?;
            verdict(outcome.success)
        }
        Command::Complete { task_id, agent_id } => {
            let agent = agent_id.map(AgentId::new);
            let outcome = coordinator.complete(&task_id, agent.as_ref()).await?;
            print_json(&outcome)?;
            verdict(outcome.success)
        }
        Command::Ready { agent_id } => {
            let agent = agent_id.map(AgentId::new);
            print_json(&coordinator.ready(agent.as_ref()).await?)?;
            ExitCode::SUCCESS
        }
        Command::Status => {
            print_json(&coordinator.status().await?)?;
            ExitCode::SUCCESS
        }
        Command::Doctor => {
            let report = coordinator.doctor().await?;
            print_json(&report)?;
            verdict(report.healthy)
        }
        Command::Reclaim => {
            print_json(&coordinator.reclaim_stale().await?)?;
            ExitCode::SUCCESS
        }
    };
    Ok(code)
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("failed to render result")?;
    println!("{json}");
    Ok(())
}

fn verdict(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(1)
    }
}

fn classify(err: &anyhow::Error) -> (u8, &'static str) {
    if let Some(err) = err.downcast_ref::<CoordinatorError>() {
        return match err {
            CoordinatorError::NotFound(_) => (2, "not_found"),
            CoordinatorError::LockTimeout { .. } => (4, "lock_timeout"),
            _ => match err.kind() {
                ErrorKind::Transient => (4, "transient"),
                ErrorKind::Permanent | ErrorKind::Infrastructure => (3, "store"),
            },
        };
    }
    if err.downcast_ref::<ConfigError>().is_some() || err.downcast_ref::<BuildError>().is_some() {
        return (5, "config");
    }
    (3, "internal")
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn transition_parses_status() {
        let cli = Cli::try_parse_from(["baton", "transition", "T0", "in_progress", "A"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Transition { status: TaskStatus::InProgress, .. }
        ));

        assert!(Cli::try_parse_from(["baton", "transition", "T0", "review"]).is_err());
    }

    #[test]
    fn errors_map_to_exit_codes() {
        let not_found = anyhow::Error::new(CoordinatorError::NotFound("T9".into()));
        assert_eq!(classify(&not_found), (2, "not_found"));

        let timeout = anyhow::Error::new(CoordinatorError::LockTimeout { attempts: 5 });
        assert_eq!(classify(&timeout), (4, "lock_timeout"));

        let corrupt = anyhow::Error::new(CoordinatorError::StoreCorrupt {
            location: "t.json".into(),
            detail: "eof".into(),
        });
        assert_eq!(classify(&corrupt), (3, "store"));

        let config = anyhow::Error::new(BuildError::NoLockAttempts);
        assert_eq!(classify(&config), (5, "config"));
    }
}
