use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{error, info};

use weir::config::Config;
use weir::core::{TaskGraph, TaskId};
use weir::git::GitOps;
use weir::orchestration::{self, HookRegistry, LevelController, RunOutcome};
use weir::Result;

/// weir - level-gated parallel task orchestrator
#[derive(Parser, Debug)]
#[command(name = "weir")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    WEIR_DEBUG=1     Enable debug logging (alternative to --debug)\n    WEIR_LOG         tracing filter directives, e.g. weir=debug")]
pub struct Cli {
    /// Repository to orchestrate (defaults to the current directory)
    #[arg(short = 'r', long, global = true, default_value = ".")]
    pub repo: PathBuf,

    /// Enable debug logging (writes to <state_dir>/weir.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Validate a task graph file without running it
    Validate {
        /// Path to the task graph JSON
        graph: PathBuf,
    },

    /// Start a new run over a task graph
    Run {
        /// Path to the task graph JSON
        graph: PathBuf,

        /// Override max_workers from the config file
        #[arg(short = 'w', long)]
        workers: Option<usize>,
    },

    /// Continue the recorded run after a pause, block or crash
    Resume {
        /// Override max_workers from the config file
        #[arg(short = 'w', long)]
        workers: Option<usize>,
    },

    /// Ask the running coordinator to pause
    Stop {
        /// Terminate running tasks instead of letting them finish
        #[arg(long)]
        force: bool,
    },

    /// Show the recorded run
    Status {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Reset a blocked task or level for another attempt
    Retry {
        #[command(subcommand)]
        target: RetryTarget,
    },
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum RetryTarget {
    /// Reset one blocked task to pending
    Task { id: String },
    /// Reopen a blocked level
    Level { level: u32 },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let repo = GitOps::new(&cli.repo)?.repo_path().to_path_buf();
    let mut config = Config::load(&repo)?;

    match cli.command {
        Command::Validate { graph } => run_validate(&graph),
        Command::Run { graph, workers } => {
            if let Some(n) = workers {
                config.max_workers = n;
            }
            init_logging(&repo, &config, cli.debug)?;
            let graph = TaskGraph::from_file(&graph)?;
            let controller = LevelController::start(&repo, config, graph, HookRegistry::new())?;
            drive(controller)
        }
        Command::Resume { workers } => {
            if let Some(n) = workers {
                config.max_workers = n;
            }
            init_logging(&repo, &config, cli.debug)?;
            let controller = LevelController::resume(&repo, config, HookRegistry::new())?;
            drive(controller)
        }
        Command::Stop { force } => {
            orchestration::request_stop(&repo, &config, force)?;
            println!(
                "Stop requested{}. The coordinator pauses at its next tick.",
                if force { " (force)" } else { "" }
            );
            Ok(())
        }
        Command::Status { json } => {
            let report = orchestration::status(&repo, &config)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print!("{}", report);
            }
            Ok(())
        }
        Command::Retry { target } => {
            let events = match target {
                RetryTarget::Task { id } => {
                    orchestration::retry_task(&repo, &config, &TaskId::new(id))?
                }
                RetryTarget::Level { level } => orchestration::retry_level(&repo, &config, level)?,
            };
            for event in &events {
                println!("{}", event);
            }
            println!("Run `weir resume` to continue.");
            Ok(())
        }
    }
}

fn init_logging(repo: &Path, config: &Config, debug: bool) -> Result<()> {
    let path = weir::log::init(&config.state_dir(repo), debug)?;
    println!("Logging to {}", path.display());
    Ok(())
}

fn run_validate(path: &Path) -> Result<()> {
    let graph = TaskGraph::from_file(path)?;
    let report = graph.validate();
    for warning in &report.warnings {
        println!("warning: {}", warning);
    }
    for error in &report.errors {
        println!("error: {}", error);
    }
    if report.ok {
        println!(
            "{}: {} tasks in {} levels, ok",
            path.display(),
            graph.len(),
            graph.level_numbers().len()
        );
        Ok(())
    } else {
        println!("{}: {} errors", path.display(), report.errors.len());
        std::process::exit(1);
    }
}

/// Run the controller on a tokio runtime; Ctrl-C forces a pause.
fn drive(mut controller: LevelController) -> Result<()> {
    let run_id = controller.context().run_id.clone();
    println!("Run {}", run_id);

    let rt = tokio::runtime::Runtime::new()?;
    let outcome = rt.block_on(async {
        let cancel = controller.cancel_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received, stopping");
                cancel.cancel();
            }
        });
        controller.run().await
    });

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(run = %run_id, error = %e, "run failed");
            return Err(e);
        }
    };
    println!("{}", outcome);
    match outcome {
        RunOutcome::Completed => Ok(()),
        RunOutcome::Paused { .. } => {
            println!("Run `weir resume` to continue.");
            Ok(())
        }
        RunOutcome::Blocked { .. } => {
            println!("Inspect with `weir status`, then `weir retry` and `weir resume`.");
            std::process::exit(2);
        }
    }
}
