use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{debug, info};

use colony::config::Config;
use colony::core::TaskSubmission;
use colony::orchestration::{
    ColonyEvent, ColonyHandle, Coordinator, DistributionAnalytics, EventReceiver, LoopbackProbe,
    RegistrySummary, SchedulerMetrics,
};
use colony::{Error, Result};

/// Colony - caste-based task scheduler for agent swarms
#[derive(Parser, Debug)]
#[command(name = "colony")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    COLONY_DEBUG=1     Enable debug logging (alternative to --debug)\n    COLONY_LOG=...     Explicit tracing filter directive")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.colony/colony.log)
    #[arg(short = 'd', long)]
    pub debug: bool,

    /// Config file (defaults to ~/.colony/colony.toml)
    #[arg(short = 'c', long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Write the default configuration
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate the configuration and list castes
    CheckConfig,

    /// Run a batch of tasks against simulated workers
    Run {
        /// JSON file holding an array of task submissions
        #[arg(long)]
        tasks: PathBuf,

        /// Print the final report as JSON
        #[arg(long)]
        json: bool,

        /// Give up if the batch has not finished after this many seconds
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    colony::log::init_with_debug(cli.debug);
    if colony::log::is_debug() {
        if let Ok(path) = Config::log_path() {
            eprintln!("Debug logging to {}", path.display());
        }
    }

    match cli.command {
        Command::InitConfig { force } => run_init_config(cli.config.as_deref(), force),
        Command::CheckConfig => run_check_config(cli.config.as_deref()),
        Command::Run {
            tasks,
            json,
            timeout_secs,
        } => run_batch(
            cli.config.as_deref(),
            &tasks,
            json,
            Duration::from_secs(timeout_secs),
        ),
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
}

fn run_init_config(path: Option<&Path>, force: bool) -> Result<()> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => {
            std::fs::create_dir_all(Config::colony_dir()?)?;
            Config::config_path()?
        }
    };
    if path.exists() && !force {
        return Err(Error::Validation(format!(
            "{} already exists (use --force to overwrite)",
            path.display()
        )));
    }
    Config::default().save_to(&path)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn run_check_config(path: Option<&Path>) -> Result<()> {
    let config = load_config(path)?;
    println!("Configuration OK ({} castes)", config.castes.len());
    for caste in &config.castes {
        let critical = if config.recovery.is_critical(&caste.name) {
            " [critical]"
        } else {
            ""
        };
        println!(
            "  {:<12} {}..{} workers  {}{}",
            caste.name, caste.min_count, caste.max_count, caste.specialization, critical
        );
    }
    for (kind, caste) in &config.routes {
        println!("  route {} -> {}", kind, caste);
    }
    Ok(())
}

fn read_tasks(path: &Path) -> Result<Vec<TaskSubmission>> {
    let raw = std::fs::read_to_string(path)?;
    let tasks: Vec<TaskSubmission> = serde_json::from_str(&raw)?;
    if tasks.is_empty() {
        return Err(Error::Validation(format!("{} holds no tasks", path.display())));
    }
    Ok(tasks)
}

fn run_batch(config: Option<&Path>, tasks: &Path, as_json: bool, timeout: Duration) -> Result<()> {
    let config = load_config(config)?;
    let submissions = read_tasks(tasks)?;

    let rt = tokio::runtime::Runtime::new()?;
    let (analytics, summary) = rt.block_on(async {
        let (handle, events) = Coordinator::start(
            config,
            Arc::new(LoopbackProbe),
            Arc::new(SchedulerMetrics),
        )?;

        let outcome = tokio::time::timeout(timeout, drive(&handle, events, submissions)).await;
        let report = match outcome {
            Ok(Ok(())) => Ok((handle.analytics().await?, handle.summary().await?)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout(timeout)),
        };
        handle.shutdown().await?;
        report
    })?;

    if as_json {
        let output = json!({
            "analytics": analytics,
            "workers": summary,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        print_report(&analytics, &summary);
    }
    Ok(())
}

/// Submit every task, then act as the worker runtime until all of them
/// reach a terminal state. Assigned tasks complete immediately.
async fn drive(
    handle: &ColonyHandle,
    mut events: EventReceiver,
    submissions: Vec<TaskSubmission>,
) -> Result<()> {
    let total = submissions.len();
    for submission in submissions {
        let id = handle.submit(submission).await?;
        debug!(task = %id, "submitted");
    }

    while !is_settled(&handle.analytics().await?, total) {
        let Some(event) = events.recv().await else {
            return Err(Error::ChannelClosed);
        };
        match event {
            ColonyEvent::TaskAssigned {
                task_id,
                worker_id,
                epoch,
                ..
            } => {
                let result = json!({ "simulated": true, "worker": worker_id });
                handle.complete_with_epoch(&task_id, epoch, result).await?;
            }
            ColonyEvent::CancelRequested { task_id, .. } => {
                handle.acknowledge_cancel(&task_id).await?;
            }
            other => debug!(?other, "event"),
        }
    }
    info!(total, "batch settled");
    Ok(())
}

fn is_settled(analytics: &DistributionAnalytics, total: usize) -> bool {
    analytics.completed + analytics.failed + analytics.cancelled >= total
}

fn print_report(analytics: &DistributionAnalytics, summary: &RegistrySummary) {
    println!("Tasks");
    println!("  total:      {}", analytics.total);
    println!("  completed:  {}", analytics.completed);
    println!("  failed:     {}", analytics.failed);
    println!("  cancelled:  {}", analytics.cancelled);
    println!("  success:    {:.1}%", analytics.success_rate * 100.0);
    println!("  avg time:   {:.3}s", analytics.average_duration_secs);
    for (kind, count) in &analytics.by_type {
        println!("  {:<12} {}", kind, count);
    }
    println!();
    println!("Workers ({})", summary.total);
    for (caste, counts) in &summary.by_caste {
        println!(
            "  {:<12} active {} (idle {}, working {}, error {})  standby {}  bounds {}..{}",
            caste,
            counts.active,
            counts.idle,
            counts.working,
            counts.error,
            counts.standby,
            counts.min,
            counts.max
        );
    }
    for (worker, assigned) in &analytics.by_worker {
        println!("  {:<16} {} assignments", worker, assigned);
    }
}
