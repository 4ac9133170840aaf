//! Cadence: store-backed job scheduler
//!
//! Main binary with subcommands:
//! - `worker`: Process jobs until Ctrl-C
//! - `schedule` / `every` / `now`: Add jobs
//! - `remove` / `list`: Manage stored jobs

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cadence_scheduler::interval::parse_human_interval;
use cadence_scheduler::{
    EveryOptions, JobFilter, JobStatus, Scheduler, SchedulerConfig, When,
};
use cadence_store::FileStore;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use miette::Result;
use serde_json::Value;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod shell;
mod worker;

/// Parse a duration such as "2 seconds", "10m" or "1500" (milliseconds).
fn parse_duration(s: &str) -> Result<Duration, String> {
    parse_human_interval(s).map_err(|e| e.to_string())
}

/// Parse job data as JSON.
fn parse_json(s: &str) -> Result<Value, String> {
    serde_json::from_str(s).map_err(|e| format!("invalid JSON: {}", e))
}

fn parse_status(s: &str) -> Result<JobStatus, String> {
    s.parse()
}

/// Parse a schedule time: "now", an RFC 3339 timestamp, or a human delay
/// such as "in 10 minutes".
fn parse_when(s: &str) -> When {
    if s.trim().eq_ignore_ascii_case("now") {
        return When::Now;
    }
    match DateTime::parse_from_rfc3339(s.trim()) {
        Ok(at) => When::At(at.with_timezone(&Utc)),
        Err(_) => When::Human(s.to_string()),
    }
}

#[derive(Parser)]
#[command(name = "cadence")]
#[command(about = "Store-backed job scheduler", long_about = None)]
struct Cli {
    /// Path of the JSON job store
    #[arg(long, global = true, env = "CADENCE_STORE", default_value = "cadence-jobs.json")]
    store: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a worker that processes `shell` jobs until Ctrl-C
    Worker {
        /// Identity written into every lease this worker takes
        #[arg(long, env = "CADENCE_WORKER_ID", default_value = "0")]
        worker_id: String,

        /// Claim attempts per scan tick
        #[arg(long, env = "CADENCE_CONCURRENCY", default_value = "10")]
        concurrency: usize,

        /// Scan tick period
        #[arg(long, env = "CADENCE_SCAN_INTERVAL", value_parser = parse_duration, default_value = "2 seconds")]
        scan_interval: Duration,

        /// How long a lease stays valid before the job may be reclaimed
        #[arg(long, env = "CADENCE_LOCK_LIFETIME", value_parser = parse_duration, default_value = "10 minutes")]
        lock_lifetime: Duration,

        /// Processor timeout for each job run
        #[arg(long, env = "CADENCE_JOB_TIMEOUT", value_parser = parse_duration, default_value = "20 seconds")]
        timeout: Duration,
    },

    /// Schedule a one-shot job
    Schedule {
        /// "now", an RFC 3339 timestamp, or a delay such as "in 5 minutes"
        when: String,

        /// Job name
        name: String,

        /// Job data as JSON
        #[arg(long, value_parser = parse_json, default_value = "{}")]
        data: Value,
    },

    /// Schedule a recurring job
    Every {
        /// Interval such as "10 minutes" or "one hour"
        interval: String,

        /// Job name
        name: String,

        /// Job data as JSON
        #[arg(long, value_parser = parse_json, default_value = "{}")]
        data: Value,

        /// Run the first time immediately instead of one interval from now
        #[arg(long)]
        run_now: bool,
    },

    /// Schedule a one-shot job to run immediately
    Now {
        /// Job name
        name: String,

        /// Job data as JSON
        #[arg(long, value_parser = parse_json, default_value = "{}")]
        data: Value,
    },

    /// Remove jobs by name and data
    Remove {
        /// Job name
        name: String,

        /// Job data as JSON
        #[arg(long, value_parser = parse_json, default_value = "{}")]
        data: Value,

        /// Which records to remove
        #[arg(long, value_enum, default_value_t = RemoveScope::All)]
        scope: RemoveScope,
    },

    /// Print stored jobs as JSON lines
    List {
        /// Only jobs with this name
        #[arg(long)]
        name: Option<String>,

        /// Only jobs with this status (scheduled, processing, done, error)
        #[arg(long, value_parser = parse_status)]
        status: Option<JobStatus>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum RemoveScope {
    /// Every record for the key
    All,
    /// Failed records
    Errors,
    /// Finished or still-pending records
    DoneOrScheduled,
    /// Processing records whose lease has expired
    Dead,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "cadence=info".to_string()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Worker {
            worker_id,
            concurrency,
            scan_interval,
            lock_lifetime,
            timeout,
        } => {
            let config = SchedulerConfig::default()
                .worker_id(worker_id)
                .concurrency(concurrency)
                .scan_interval(scan_interval)
                .lock_lifetime(lock_lifetime)
                .default_timeout(timeout);
            worker::run(&cli.store, config).await
        }

        Commands::Schedule { when, name, data } => {
            let scheduler = open_manager(&cli.store).await?;
            let job = scheduler
                .schedule(parse_when(&when), &name, data)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            print_json(&job)
        }

        Commands::Every {
            interval,
            name,
            data,
            run_now,
        } => {
            let scheduler = open_manager(&cli.store).await?;
            let job = scheduler
                .every(&interval, &name, data, EveryOptions { run_now })
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            print_json(&job)
        }

        Commands::Now { name, data } => {
            let scheduler = open_manager(&cli.store).await?;
            let job = scheduler
                .now(&name, data)
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            print_json(&job)
        }

        Commands::Remove { name, data, scope } => {
            let scheduler = open_manager(&cli.store).await?;
            let removed = match scope {
                RemoveScope::All => scheduler.remove(&name, &data).await,
                RemoveScope::Errors => scheduler.remove_errors(&name, &data).await,
                RemoveScope::DoneOrScheduled => {
                    scheduler.remove_done_or_scheduled(&name, &data).await
                }
                RemoveScope::Dead => scheduler.remove_dead(&name, &data).await,
            }
            .map_err(|e| miette::miette!("{}", e))?;
            tracing::info!(name = %name, removed, "removed jobs");
            println!("{}", removed);
            Ok(())
        }

        Commands::List { name, status } => {
            let scheduler = open_manager(&cli.store).await?;
            let jobs = scheduler
                .list_jobs(&list_filter(name, status))
                .await
                .map_err(|e| miette::miette!("{}", e))?;
            for job in &jobs {
                print_json(job)?;
            }
            Ok(())
        }
    }
}

/// A scheduler that only manages records; it never claims jobs.
async fn open_manager(store_path: &Path) -> Result<Scheduler> {
    let store = FileStore::open(store_path)
        .await
        .map_err(|e| miette::miette!("failed to open job store: {}", e))?;
    Scheduler::new(
        Arc::new(store),
        SchedulerConfig::default().process_jobs(false),
    )
    .map_err(|e| miette::miette!("{}", e))
}

fn list_filter(name: Option<String>, status: Option<JobStatus>) -> JobFilter {
    let mut filter = JobFilter::new();
    if let Some(name) = name {
        filter = filter.name(name);
    }
    if let Some(status) = status {
        filter = filter.status(status);
    }
    filter
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    let line = serde_json::to_string(value).map_err(|e| miette::miette!("{}", e))?;
    println!("{}", line);
    Ok(())
}
