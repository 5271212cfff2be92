//! `everping`: command scheduler daemon and operator CLI.

use clap::{Parser, Subcommand};
use everping_core::{config::default_config_path, EverpingConfig};
use tracing::{error, info};

mod console;
mod daemon;
mod sync;

const DEFAULT_FILTER: &str = "everping=info,everping_scheduler=info,everping_worker=info,\
     everping_executor=info,everping_alerts=info,everping_metrics=info";

#[derive(Parser)]
#[command(name = "everping", version, about = "Scheduled command runner with metrics and alerts")]
struct Cli {
    /// Config file (default: $EVERPING_CONFIG, else ~/.everping/everping.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler, workers and maintenance until interrupted
    Run,
    /// List tasks and their next fire time
    Tasks,
    /// Show recent runs, newest first
    Runs {
        #[arg(long)]
        task: Option<String>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Queue a manual run of a task
    Fire { task: String },
    /// List jobs in the registry file
    Jobs,
    /// Show alert state, or every recorded occurrence with --history
    Alerts {
        #[arg(long)]
        history: bool,
        /// Only this alert key (`task:condition`), with --history
        #[arg(long, requires = "history")]
        key: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Print a metric series as `timestamp<TAB>value`
    Metrics {
        task: String,
        key: String,
        #[arg(long)]
        since_hours: Option<u32>,
    },
    /// Enable a task (clears its last configuration error)
    Enable { task: String },
    /// Disable a task
    Disable { task: String },
    /// Delete finished runs (active runs are kept)
    ClearRuns,
    /// Delete metric samples, for one task or all
    ClearMetrics {
        #[arg(long)]
        task: Option<String>,
    },
    /// Delete alert history and alerts whose suppression window has ended
    ClearAlerts,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_FILTER.into()),
        )
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = match EverpingConfig::load(Some(config_path.as_str())) {
        Ok(config) => config,
        Err(e) => {
            error!(code = e.code(), path = %config_path, "{e}");
            return Err(e.into());
        }
    };

    let console = || console::Console::open(&config);
    let output = match cli.command {
        Command::Run => {
            info!(config = %config_path, "starting everping");
            return daemon::run(config.clone()).await;
        }
        Command::Tasks => console()?.tasks()?,
        Command::Runs { task, limit } => console()?.runs(task.as_deref(), limit)?,
        Command::Fire { task } => console()?.fire(&task)?,
        Command::Jobs => console()?.jobs()?,
        Command::Alerts {
            history: false, ..
        } => console()?.alerts()?,
        Command::Alerts { key, limit, .. } => console()?.alert_history(key.as_deref(), limit)?,
        Command::Metrics {
            task,
            key,
            since_hours,
        } => console()?.metrics(&task, &key, since_hours)?,
        Command::Enable { task } => console()?.set_enabled(&task, true)?,
        Command::Disable { task } => console()?.set_enabled(&task, false)?,
        Command::ClearRuns => console()?.clear_runs()?,
        Command::ClearMetrics { task } => console()?.clear_metrics(task.as_deref())?,
        Command::ClearAlerts => console()?.clear_alerts()?,
    };
    print!("{output}");
    Ok(())
}
