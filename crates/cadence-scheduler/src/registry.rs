//! Job processors and the per-scheduler registry that maps names to them.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures_util::FutureExt;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::SchedulerError;

/// What a processor reports: `Err` carries the failure message.
pub type ProcessorResult = Result<(), String>;

type StartFn = dyn Fn(Value, Settler) + Send + Sync;

/// Sending half of a job run's settlement channel.
///
/// The supervisor keeps the receiving half and treats the first message as
/// the outcome; anything after that is a late settlement.
#[derive(Clone)]
pub(crate) struct Settler {
    tx: mpsc::UnboundedSender<ProcessorResult>,
}

impl Settler {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ProcessorResult>) -> Self {
        Self { tx }
    }

    fn settle(&self, result: ProcessorResult) {
        // The supervisor only goes away once every settler is dropped.
        let _ = self.tx.send(result);
    }
}

/// Handle given to callback-style processors to report completion.
///
/// Consumed on use, so each handle settles at most once. Dropping it without
/// calling [`done`](Completion::done) leaves the run to its timeout.
pub struct Completion {
    settler: Settler,
}

impl Completion {
    /// Report the outcome of the run.
    pub fn done(self, result: ProcessorResult) {
        self.settler.settle(result);
    }

    /// Report success.
    pub fn ok(self) {
        self.done(Ok(()));
    }

    /// Report failure.
    pub fn fail(self, message: impl Into<String>) {
        self.done(Err(message.into()));
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}

/// User code that runs a job, given the job's `data`.
///
/// Both calling conventions end up as the same thing: a function that is
/// started with the payload and settles through a channel.
#[derive(Clone)]
pub struct Processor {
    start: Arc<StartFn>,
}

impl Processor {
    /// A processor from an async function.
    ///
    /// The future runs on its own task. A panic, either while building the
    /// future or while polling it, settles the run as a failure.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ProcessorResult> + Send + 'static,
    {
        Self {
            start: Arc::new(move |data, settler: Settler| {
                let fut = match std::panic::catch_unwind(AssertUnwindSafe(|| f(data))) {
                    Ok(fut) => fut,
                    Err(panic) => {
                        settler.settle(Err(panic_message(&*panic)));
                        return;
                    }
                };
                tokio::spawn(async move {
                    let result = AssertUnwindSafe(fut)
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| Err(panic_message(&*panic)));
                    settler.settle(result);
                });
            }),
        }
    }

    /// A processor in callback style.
    ///
    /// `f` is called synchronously with the payload and a [`Completion`]. It
    /// should hand the work off (e.g. spawn a task) and return quickly. An
    /// `Err` return or a panic counts as a settlement; if the completion is
    /// invoked afterwards, that later call is reported as a late completion.
    pub fn with_callback<F>(f: F) -> Self
    where
        F: Fn(Value, Completion) -> ProcessorResult + Send + Sync + 'static,
    {
        Self {
            start: Arc::new(move |data, settler: Settler| {
                let completion = Completion {
                    settler: settler.clone(),
                };
                match std::panic::catch_unwind(AssertUnwindSafe(|| f(data, completion))) {
                    Ok(Ok(())) => {}
                    Ok(Err(message)) => settler.settle(Err(message)),
                    Err(panic) => settler.settle(Err(panic_message(&*panic))),
                }
            }),
        }
    }

    pub(crate) fn start(&self, data: Value, settler: Settler) {
        (self.start)(data, settler)
    }
}

impl std::fmt::Debug for Processor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Processor(<function>)")
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let detail = if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    format!("processor panicked: {}", detail)
}

/// Per-name job options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOptions {
    /// How long a run may take before it is recorded as timed out. Falls back
    /// to the scheduler's default timeout when unset.
    pub timeout: Option<Duration>,
}

impl JobOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A registered processor with its options.
#[derive(Debug, Clone)]
pub struct Definition {
    pub processor: Processor,
    pub options: JobOptions,
}

/// Name → processor map owned by one scheduler.
#[derive(Debug, Default)]
pub struct JobRegistry {
    definitions: RwLock<HashMap<String, Definition>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `processor` under `name`. Each name may be defined once.
    pub fn define(
        &self,
        name: &str,
        processor: Processor,
        options: JobOptions,
    ) -> Result<(), SchedulerError> {
        let mut definitions = self
            .definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if definitions.contains_key(name) {
            return Err(SchedulerError::DuplicateDefinition(name.to_string()));
        }
        definitions.insert(name.to_string(), Definition { processor, options });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Definition> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Names of every registered job, in no particular order.
    pub fn names(&self) -> Vec<String> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    /// Remove one definition. Returns whether it existed.
    pub fn remove(&self, name: &str) -> bool {
        self.definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    /// Remove every definition.
    pub fn clear(&self) {
        self.definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
