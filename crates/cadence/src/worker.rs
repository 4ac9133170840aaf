//! Long-running worker: processes jobs from a store until Ctrl-C.

use std::path::Path;
use std::sync::Arc;

use cadence_scheduler::{JobOptions, Scheduler, SchedulerConfig, SchedulerEvent};
use cadence_store::FileStore;
use miette::Result;
use tokio::sync::{broadcast::error::RecvError, watch};
use tracing::{error, info, warn};

use crate::shell;

pub async fn run(store_path: &Path, config: SchedulerConfig) -> Result<()> {
    let store = FileStore::open(store_path)
        .await
        .map_err(|e| miette::miette!("failed to open job store: {}", e))?;

    let scheduler =
        Scheduler::new(Arc::new(store), config).map_err(|e| miette::miette!("{}", e))?;
    scheduler
        .define_job(shell::SHELL_JOB, shell::processor(), JobOptions::new())
        .map_err(|e| miette::miette!("{}", e))?;

    // Subscribe before starting so the first tick's events are not missed
    let mut events = scheduler.subscribe();

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    info!(
        store = %store_path.display(),
        worker_id = %scheduler.config().worker_id,
        concurrency = scheduler.config().concurrency,
        "starting worker"
    );
    scheduler.start_jobs_processing();

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event log fell behind");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    scheduler.close();
    info!("worker stopped; jobs still running were left to finish or time out");
    Ok(())
}

fn log_event(event: &SchedulerEvent) {
    match event {
        SchedulerEvent::Error { message, .. } => error!("{}", message),
        SchedulerEvent::Completed { job } => {
            info!(id = %job.id, name = %job.name, "job completed");
        }
        SchedulerEvent::Rescheduled {
            job,
            next_run_at,
            err_counter,
        } => {
            info!(id = %job.id, name = %job.name, %next_run_at, err_counter, "job rescheduled");
        }
        SchedulerEvent::GaveUp { job, failures } => {
            error!(id = %job.id, name = %job.name, failures, "job abandoned");
        }
        SchedulerEvent::LateCompletion {
            job,
            elapsed,
            timeout,
        } => {
            warn!(
                id = %job.id,
                name = %job.name,
                elapsed_ms = elapsed.as_millis() as u64,
                timeout_ms = timeout.as_millis() as u64,
                "job finished after its timeout"
            );
        }
    }
}
