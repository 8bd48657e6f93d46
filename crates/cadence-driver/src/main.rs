use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cadence_core::CadenceConfig;
use cadence_scheduler::{
    Frequency, Job, JobId, JobRepository, LogRepository, SchedulerError, Subscriber,
};
use cadence_store::SqliteStore;
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;

mod builtins;
mod driver;

use driver::Services;

#[derive(Parser)]
#[command(name = "cadence", about = "Recurring job scheduler")]
struct Cli {
    /// Config file (default: $CADENCE_CONFIG, then ~/.cadence/cadence.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Poll for due jobs and run them until interrupted
    Daemon,
    /// Run every due job once and exit
    Tick,
    /// Run one job now
    Run {
        id: String,
        /// Leave last_run / next_run untouched
        #[arg(long)]
        no_schedule: bool,
    },
    /// List all jobs with their state and time until next run
    List,
    /// Create a job
    Add {
        #[arg(long)]
        name: String,
        /// YEARLY, MONTHLY, WEEKLY, DAILY, HOURLY, MINUTELY or SECONDLY
        #[arg(long)]
        frequency: Frequency,
        /// Recurrence parameters, e.g. "interval:15" or "byhour:9;byminute:0,30"
        #[arg(long)]
        params: Option<String>,
        /// Internal command name
        #[arg(
            long,
            conflicts_with = "shell_command",
            required_unless_present = "shell_command"
        )]
        command: Option<String>,
        /// External command line
        #[arg(long)]
        shell_command: Option<String>,
        #[arg(long, default_value = "")]
        args: String,
        /// Hand the command line to the configured shell
        #[arg(long)]
        run_in_shell: bool,
        /// "Full Name <email>", repeatable
        #[arg(long = "subscriber")]
        subscribers: Vec<Subscriber>,
    },
    /// Enable a job; its next run is computed from its last run
    Enable { id: String },
    /// Disable a job; it is never due while disabled
    Disable { id: String },
    /// Clear a stale running flag left by a crash
    Reset { id: String },
    /// Delete a job and its logs
    Remove { id: String },
    /// Show a job's logs, newest first
    Logs { id: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "cadence=info,cadence_driver=info,cadence_scheduler=info,cadence_store=info".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    // explicit --config > CADENCE_CONFIG > ~/.cadence/cadence.toml
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("CADENCE_CONFIG").ok());
    let config = CadenceConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        tracing::warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        CadenceConfig::default()
    });

    let store = SqliteStore::open(&config.database.path)
        .with_context(|| format!("opening {}", config.database.path))?;
    let services = Services::new(&config, store);

    match cli.command {
        Commands::Daemon => {
            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    let _ = shutdown_tx.send(true);
                }
            });
            let poll = Duration::from_secs(config.driver.poll_interval_secs);
            driver::run_loop(Arc::new(services), poll, shutdown_rx).await;
        }
        Commands::Tick => {
            let ran = tokio::task::spawn_blocking(move || driver::tick(&services))
                .await??;
            println!("ran {ran} job(s)");
        }
        Commands::Run { id, no_schedule } => {
            let mut job = load_job(&services.store, &id)?;
            let (job, report) = tokio::task::spawn_blocking(move || {
                job.run(&services.context(), !no_schedule)
                    .map(|report| (job, report))
            })
            .await??;
            println!(
                "{} {} at {}",
                job.name,
                if report.success {
                    "succeeded"
                } else {
                    "failed"
                },
                report.run_date.format("%Y-%m-%d %H:%M:%S")
            );
            if let Some(log) = report.log {
                print!("{}", log.body());
            }
        }
        Commands::List => {
            for job in services.store.list()? {
                println!("{}  {:<8}  {job}", job.id, job.state().to_string());
            }
        }
        Commands::Add {
            name,
            frequency,
            params,
            command,
            shell_command,
            args,
            run_in_shell,
            subscribers,
        } => {
            let mut job = Job::new(name, frequency);
            job.params = params;
            job.command = command.unwrap_or_default();
            job.shell_command = shell_command.unwrap_or_default();
            job.args = args;
            job.run_in_shell = run_in_shell;
            job.subscribers = subscribers;
            job.command_spec()?;
            job.persist(&services.store, Utc::now())?;
            info!(job_id = %job.id, name = %job.name, "job added");
            println!("{}", job.id);
        }
        Commands::Enable { id } => {
            let mut job = load_job(&services.store, &id)?;
            job.set_disabled(false);
            job.persist(&services.store, Utc::now())?;
            println!("{job}");
        }
        Commands::Disable { id } => {
            let mut job = load_job(&services.store, &id)?;
            job.set_disabled(true);
            job.persist(&services.store, Utc::now())?;
            println!("{job}");
        }
        Commands::Reset { id } => {
            let mut job = load_job(&services.store, &id)?;
            job.is_running = false;
            job.persist(&services.store, Utc::now())?;
            info!(job_id = %job.id, "running flag cleared");
        }
        Commands::Remove { id } => {
            services.store.delete(&JobId::from(id.as_str()))?;
        }
        Commands::Logs { id } => {
            let job = load_job(&services.store, &id)?;
            for log in services.store.for_job(&job.id)? {
                println!(
                    "=== {} [{}]",
                    log.run_date.format("%Y-%m-%d %H:%M:%S"),
                    if log.success { "ok" } else { "FAILED" }
                );
                println!("{}", log.body());
            }
        }
    }

    Ok(())
}

fn load_job(store: &SqliteStore, id: &str) -> Result<Job, SchedulerError> {
    store
        .get(&JobId::from(id))?
        .ok_or_else(|| SchedulerError::JobNotFound { id: id.to_string() })
}
