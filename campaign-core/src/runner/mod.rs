//! Execution backends.
//!
//! A [`Runner`] owns the registry of a campaign, creates runs from input
//! rows, launches them with bounded parallelism, polls them for
//! completion and failure, and supports cancellation and cleanup.
//!
//! Status transitions of every run go through the registry, where terminal
//! states are final. A run becomes `Running` only when it's actually
//! launched, so at any moment the number of `Running` runs stays within
//! the configured parallelism.
//!
//! [`Runner`]: trait.Runner.html

pub mod internal;
pub mod local;
pub mod slurm;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::registry::{Registry, RunStatus};
use crate::row::Row;
use crate::worker::Execution;
use crate::RunId;

/// Runtime context handed to a runner on creation.
#[derive(Clone)]
pub struct RunnerContext {
    /// Overrides the configured run command, e.g. with an in-process
    /// function.
    pub execution: Option<Execution>,
    /// Raised when the user asks to stop, checked while waiting.
    pub interrupt: Arc<AtomicBool>,
}

impl Default for RunnerContext {
    fn default() -> Self {
        RunnerContext {
            execution: None,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl RunnerContext {
    pub fn with_execution(execution: Execution) -> Self {
        RunnerContext {
            execution: Some(execution),
            ..RunnerContext::default()
        }
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }
}

/// Outcome of cancelling every non-terminal run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CancelReport {
    /// Runs that were queued or running, with whether their execution was
    /// actually stopped.
    pub runs: Vec<(RunId, bool)>,
}

impl CancelReport {
    /// Runs whose execution was genuinely interrupted or never started.
    pub fn effective(&self) -> Vec<RunId> {
        self.runs.iter().filter(|(_, e)| *e).map(|(id, _)| *id).collect()
    }

    /// Runs that may still be executing somewhere.
    pub fn unsupported(&self) -> Vec<RunId> {
        self.runs.iter().filter(|(_, e)| !*e).map(|(id, _)| *id).collect()
    }
}

/// Execution backend.
pub trait Runner {
    fn label(&self) -> &'static str;

    fn registry(&self) -> &Arc<Registry>;

    /// Creates a single run. Blocks until it's terminal if `wait` is set.
    fn spawn_run(&mut self, input: Row, wait: bool) -> Result<RunId> {
        let ids = self.spawn_array(vec![input], wait)?;
        ids.into_iter()
            .next()
            .ok_or_else(|| Error::Other("no run was created".to_string()))
    }

    /// Creates a run per input row, ids are contiguous and increasing.
    /// Blocks until all of them are terminal if `wait` is set.
    fn spawn_array(&mut self, inputs: Vec<Row>, wait: bool) -> Result<Vec<RunId>>;

    /// Advances in-flight runs without blocking.
    fn poll(&mut self) -> Result<()>;

    /// Blocks until every given run is terminal.
    fn wait(&mut self, ids: &[RunId]) -> Result<()>;

    /// Blocks until every run of the registry is terminal.
    fn wait_all(&mut self) -> Result<()> {
        let ids = self.registry().ids();
        self.wait(&ids)
    }

    /// Returns crashed runs not reported before, logging each of them.
    fn check_runs(&mut self) -> Result<Vec<RunId>> {
        Ok(report_crashes(self.registry()))
    }

    /// Moves every queued or running run to `Cancelled`.
    fn cancel_all(&mut self) -> Result<CancelReport>;

    /// Removes per-run artifacts of terminal runs and the transport state.
    fn clean(&mut self) -> Result<()>;
}

/// Registers new runs with their inputs, all starting out `Queued`.
pub(crate) fn allocate_runs(registry: &Registry, inputs: Vec<Row>) -> Result<Vec<RunId>> {
    let range = registry.allocate(inputs.len());
    for (id, input) in range.clone().zip(inputs) {
        registry.set_input(id, input)?;
    }
    Ok(range.collect())
}

/// Logs every crashed run exactly once.
pub(crate) fn report_crashes(registry: &Registry) -> Vec<RunId> {
    let mut reported = Vec::new();
    for id in registry.with_status(RunStatus::Crashed) {
        if let Ok(true) = registry.take_crash_report(id) {
            match registry.failure(id) {
                Ok(Some(failure)) => warn!("run {} crashed: {}", id, failure),
                _ => warn!("run {} crashed", id),
            }
            reported.push(id);
        }
    }
    reported
}

pub(crate) fn all_terminal(registry: &Registry, ids: &[RunId]) -> Result<bool> {
    for id in ids {
        match registry.get_status(*id) {
            Ok(status) if status.is_terminal() => (),
            Ok(_) => return Ok(false),
            Err(Error::UnknownRun(_)) => (),
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Splits a worker command line into program and arguments, defaulting to
/// the current executable with the `worker` subcommand.
pub(crate) fn worker_command(line: &Option<String>) -> Result<Vec<String>> {
    match line {
        Some(line) => {
            let args = shlex::split(line).ok_or_else(|| {
                Error::InvalidConfiguration(format!("can't parse worker command: {}", line))
            })?;
            if args.is_empty() {
                return Err(Error::InvalidConfiguration(
                    "empty worker command".to_string(),
                ));
            }
            Ok(args)
        }
        None => {
            let exe = std::env::current_exe()?;
            Ok(vec![exe.to_string_lossy().to_string(), "worker".to_string()])
        }
    }
}

/// Run ids in the order they are admitted, with a halt flag raised by the
/// first staging failure.
#[derive(Debug, Default)]
pub(crate) struct Admission {
    queue: std::collections::VecDeque<RunId>,
    halted: Option<String>,
}

impl Admission {
    pub fn push(&mut self, ids: &[RunId]) {
        self.queue.extend(ids.iter().copied());
    }

    pub fn next(&mut self) -> Option<RunId> {
        if self.halted.is_some() {
            return None;
        }
        self.queue.pop_front()
    }

    pub fn drain(&mut self) -> Vec<RunId> {
        self.queue.drain(..).collect()
    }

    /// Stops admitting runs, cancelling every queued one.
    pub fn halt(&mut self, registry: &Registry, reason: String) {
        if self.halted.is_none() {
            error!("aborting batch: {}", reason);
            self.halted = Some(reason);
        }
        for id in self.drain() {
            let _ = registry.set_status(id, RunStatus::Cancelled);
        }
    }

    pub fn check(&self) -> Result<()> {
        match &self.halted {
            Some(reason) => Err(Error::StagingFailure(reason.clone())),
            None => Ok(()),
        }
    }
}
