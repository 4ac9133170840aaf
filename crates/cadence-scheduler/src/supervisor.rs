//! Runs one claimed job and races it against its timeout.

use std::sync::Arc;

use cadence_store::JobRecord;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep};
use tracing::{debug, trace};

use crate::registry::Settler;
use crate::scheduler::Inner;
use crate::{JobError, ProcessorResult, policy};

enum FirstSettlement {
    Processor(ProcessorResult),
    TimedOut,
}

/// Drive `job` from claim to completion.
///
/// The first settlement, whether from the processor or the timer, decides the
/// outcome and is the only one handed to the completion policy. Settlements
/// that arrive afterwards are recorded as late completions. Timing out does
/// not stop the processor.
pub(crate) async fn supervise(inner: Arc<Inner>, job: JobRecord) {
    let Some(definition) = inner.registry.get(&job.name) else {
        policy::complete(&inner, &job, Err(JobError::NoProcessor(job.name.clone()))).await;
        return;
    };

    let timeout = definition
        .options
        .timeout
        .unwrap_or(inner.config.default_timeout);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let started = Instant::now();

    debug!(timeout_ms = timeout.as_millis() as u64, "running job processor");
    definition.processor.start(job.data.clone(), Settler::new(tx));

    // A processor that drops every settler without settling disables the
    // first branch and leaves the run to the timer.
    let first = tokio::select! {
        Some(result) = rx.recv() => FirstSettlement::Processor(result),
        _ = sleep(timeout) => FirstSettlement::TimedOut,
    };

    let outcome = match first {
        FirstSettlement::Processor(Ok(())) => Ok(()),
        FirstSettlement::Processor(Err(message)) => Err(JobError::Processor(message)),
        FirstSettlement::TimedOut => Err(JobError::Timeout { timeout }),
    };
    trace!(elapsed_ms = started.elapsed().as_millis() as u64, "job settled");
    policy::complete(&inner, &job, outcome).await;

    while rx.recv().await.is_some() {
        policy::record_late_completion(&inner, &job, started.elapsed(), timeout).await;
    }
}
