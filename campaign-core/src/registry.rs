//! Run registry holding per-run input and output rows and status.
//!
//! Slots are stored in an arena indexed by run id. Identifiers are handed
//! out in increasing order and never reused, a removed slot stays vacant.
//!
//! Value cells of a slot have exactly one writer: the interface that
//! claimed the slot. The runner only reads them, except for the input row
//! which it sets before the run is launched. Publishing of the output
//! happens through the slot's `done` flag, stored with release ordering
//! after the output has been written, so a reader observing `done` with
//! acquire ordering also observes the output.

use std::fmt;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::row::{Row, Schema};
use crate::{exit_code, Float, RunId};

/// Lifecycle status of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RunStatus {
    Queued,
    Running,
    Done,
    Crashed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        match self {
            RunStatus::Done | RunStatus::Crashed | RunStatus::Cancelled => true,
            RunStatus::Queued | RunStatus::Running => false,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::Done => "done",
            RunStatus::Crashed => "crashed",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Reason a run ended up crashed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RunFailure {
    /// Preprocessor could not stage the inputs.
    Staging(String),
    /// Postprocessor could not parse the produced output.
    MalformedOutput(String),
    /// Simulation itself failed.
    Execution(String),
    /// Worker could not talk to the runner or was misconfigured.
    Interface(String),
    /// Execution ended without signaling completion.
    NoSignal(Option<i32>),
    /// Run exceeded its wall clock limit and was killed.
    TimedOut(Float),
}

impl RunFailure {
    /// Translates a worker process exit code into a failure.
    pub fn from_exit_code(code: Option<i32>) -> RunFailure {
        match code {
            Some(exit_code::STAGING) => RunFailure::Staging("worker failed staging".to_string()),
            Some(exit_code::MALFORMED_OUTPUT) => {
                RunFailure::MalformedOutput("worker couldn't parse output".to_string())
            }
            Some(exit_code::EXECUTION) => {
                RunFailure::Execution("simulation exited with failure".to_string())
            }
            Some(exit_code::CONFIGURATION) => {
                RunFailure::Interface("worker configuration or interface error".to_string())
            }
            other => RunFailure::NoSignal(other),
        }
    }

    pub fn from_error(error: &Error) -> RunFailure {
        match error {
            e if e.is_staging() => RunFailure::Staging(e.to_string()),
            Error::MalformedOutput(m) => RunFailure::MalformedOutput(m.clone()),
            Error::ExecutionFailed(m) => RunFailure::Execution(m.clone()),
            e => RunFailure::Interface(e.to_string()),
        }
    }

    pub fn is_staging(&self) -> bool {
        match self {
            RunFailure::Staging(_) => true,
            _ => false,
        }
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunFailure::Staging(m) => write!(f, "staging failed: {}", m),
            RunFailure::MalformedOutput(m) => write!(f, "malformed output: {}", m),
            RunFailure::Execution(m) => write!(f, "execution failed: {}", m),
            RunFailure::Interface(m) => write!(f, "interface error: {}", m),
            RunFailure::NoSignal(Some(code)) => {
                write!(f, "exited with code {} without signaling completion", code)
            }
            RunFailure::NoSignal(None) => write!(f, "terminated without signaling completion"),
            RunFailure::TimedOut(secs) => write!(f, "timed out after {}s", secs),
        }
    }
}

/// Registry slot of a single run.
#[derive(Debug)]
pub struct RunSlot {
    id: RunId,
    input: Mutex<Row>,
    output: Mutex<Row>,
    time: Mutex<Float>,
    status: Mutex<RunStatus>,
    failure: Mutex<Option<RunFailure>>,
    done: AtomicBool,
    claimed: AtomicBool,
    reported: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // poisoning is ignored, cells are replaced whole
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl RunSlot {
    fn new(id: RunId, input: Row, output: Row) -> Self {
        RunSlot {
            id,
            input: Mutex::new(input),
            output: Mutex::new(output),
            time: Mutex::new(0.),
            status: Mutex::new(RunStatus::Queued),
            failure: Mutex::new(None),
            done: AtomicBool::new(false),
            claimed: AtomicBool::new(false),
            reported: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> RunId {
        self.id
    }

    pub fn input(&self) -> MutexGuard<'_, Row> {
        lock(&self.input)
    }

    pub fn output(&self) -> MutexGuard<'_, Row> {
        lock(&self.output)
    }

    pub fn time(&self) -> Float {
        *lock(&self.time)
    }

    pub fn set_time(&self, secs: Float) {
        *lock(&self.time) = secs;
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Publishes the output. Returns `false` if the run was already done.
    pub fn mark_done(&self) -> bool {
        if self.done.swap(true, Ordering::AcqRel) {
            return false;
        }
        let mut status = lock(&self.status);
        if !status.is_terminal() {
            *status = RunStatus::Done;
        }
        true
    }

    pub fn status(&self) -> RunStatus {
        *lock(&self.status)
    }
}

/// Arena of run slots indexed by run id.
#[derive(Debug)]
pub struct Registry {
    slots: RwLock<Vec<Option<Arc<RunSlot>>>>,
    input_schema: Arc<Schema>,
    output_schema: Arc<Schema>,
}

impl Registry {
    /// Creates a registry with room for `capacity` runs. It grows beyond
    /// that as needed.
    pub fn new(input_schema: Arc<Schema>, output_schema: Arc<Schema>, capacity: usize) -> Self {
        Registry {
            slots: RwLock::new(Vec::with_capacity(capacity)),
            input_schema,
            output_schema,
        }
    }

    pub fn input_schema(&self) -> &Arc<Schema> {
        &self.input_schema
    }

    pub fn output_schema(&self) -> &Arc<Schema> {
        &self.output_schema
    }

    /// Allocates `n` new slots and returns their ids.
    pub fn allocate(&self, n: usize) -> Range<RunId> {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        let start = slots.len() as RunId;
        for id in start..start + n as RunId {
            slots.push(Some(Arc::new(RunSlot::new(
                id,
                self.input_schema.default_row(),
                self.output_schema.default_row(),
            ))));
        }
        trace!("allocated runs {}..{}", start, start + n as RunId);
        start..start + n as RunId
    }

    /// Number of ids handed out so far, including removed ones.
    pub fn len(&self) -> usize {
        self.slots.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of all slots still present.
    pub fn ids(&self) -> Vec<RunId> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|s| s.as_ref().map(|s| s.id))
            .collect()
    }

    pub fn slot(&self, run_id: RunId) -> Result<Arc<RunSlot>> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(run_id as usize)
            .and_then(|s| s.clone())
            .ok_or(Error::UnknownRun(run_id))
    }

    /// Hands out write access to the run's cells. Only one claim per run
    /// ever succeeds.
    pub fn claim(&self, run_id: RunId) -> Result<Arc<RunSlot>> {
        let slot = self.slot(run_id)?;
        if slot.claimed.swap(true, Ordering::AcqRel) {
            return Err(Error::SlotAlreadyClaimed(run_id));
        }
        Ok(slot)
    }

    pub fn set_input(&self, run_id: RunId, row: Row) -> Result<()> {
        let slot = self.slot(run_id)?;
        if !Arc::ptr_eq(row.schema(), &self.input_schema) && **row.schema() != *self.input_schema {
            return Err(Error::Other(format!(
                "input row for run {} doesn't match the input schema",
                run_id
            )));
        }
        *slot.input() = row;
        Ok(())
    }

    pub fn input(&self, run_id: RunId) -> Result<Row> {
        Ok(self.slot(run_id)?.input().clone())
    }

    /// Output of the run, present only once the run is done.
    pub fn read_output(&self, run_id: RunId) -> Result<Option<Row>> {
        let slot = self.slot(run_id)?;
        if slot.is_done() {
            Ok(Some(slot.output().clone()))
        } else {
            Ok(None)
        }
    }

    /// Sets the status of a run. Terminal states are final, a transition
    /// out of one is ignored and `false` is returned.
    pub fn set_status(&self, run_id: RunId, status: RunStatus) -> Result<bool> {
        let slot = self.slot(run_id)?;
        let mut current = lock(&slot.status);
        if current.is_terminal() {
            return Ok(false);
        }
        if status == RunStatus::Done && !slot.is_done() {
            return Err(Error::Other(format!(
                "run {} can only become done through its interface",
                run_id
            )));
        }
        *current = status;
        Ok(true)
    }

    pub fn get_status(&self, run_id: RunId) -> Result<RunStatus> {
        Ok(self.slot(run_id)?.status())
    }

    /// Records a crash together with its reason.
    pub fn set_crashed(&self, run_id: RunId, failure: RunFailure) -> Result<bool> {
        let slot = self.slot(run_id)?;
        let changed = self.set_status(run_id, RunStatus::Crashed)?;
        if changed {
            *lock(&slot.failure) = Some(failure);
        }
        Ok(changed)
    }

    pub fn failure(&self, run_id: RunId) -> Result<Option<RunFailure>> {
        Ok(lock(&self.slot(run_id)?.failure).clone())
    }

    /// Marks the crash of a run as reported. Returns `true` only the first
    /// time it's called for a crashed run.
    pub fn take_crash_report(&self, run_id: RunId) -> Result<bool> {
        let slot = self.slot(run_id)?;
        if slot.status() != RunStatus::Crashed {
            return Ok(false);
        }
        Ok(!slot.reported.swap(true, Ordering::AcqRel))
    }

    pub fn elapsed(&self, run_id: RunId) -> Result<Duration> {
        Ok(Duration::from_secs_f64(self.slot(run_id)?.time().max(0.)))
    }

    pub fn is_done(&self, run_id: RunId) -> Result<bool> {
        Ok(self.slot(run_id)?.is_done())
    }

    /// Frees the slot of a terminal run. Its id stays taken.
    pub fn remove(&self, run_id: RunId) -> Result<()> {
        let mut slots = self.slots.write().unwrap_or_else(|e| e.into_inner());
        match slots.get_mut(run_id as usize) {
            Some(slot @ Some(_)) => {
                let terminal = slot.as_ref().map(|s| s.status().is_terminal()) == Some(true);
                if !terminal {
                    return Err(Error::Other(format!(
                        "run {} is still in flight and can't be removed",
                        run_id
                    )));
                }
                *slot = None;
                Ok(())
            }
            _ => Err(Error::UnknownRun(run_id)),
        }
    }

    /// Ids of runs in the given status.
    pub fn with_status(&self, status: RunStatus) -> Vec<RunId> {
        self.slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|s| s.as_ref())
            .filter(|s| s.status() == status)
            .map(|s| s.id)
            .collect()
    }

    /// Completed runs as `(id, input, output)`, ordered by id.
    pub fn completed(&self) -> Vec<(RunId, Row, Row)> {
        let slots: Vec<Arc<RunSlot>> = self
            .slots
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter_map(|s| s.clone())
            .collect();
        slots
            .iter()
            .filter(|s| s.is_done() && s.status() == RunStatus::Done)
            .map(|s| (s.id, s.input().clone(), s.output().clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Field;
    use crate::var::{Var, VarType};

    fn registry() -> Registry {
        let schema = |name: &str| {
            Arc::new(Schema::new(vec![Field {
                name: name.to_string(),
                vtype: VarType::Float,
                len: None,
            }]))
        };
        Registry::new(schema("u"), schema("f"), 2)
    }

    #[test]
    fn allocation_grows_and_never_reuses_ids() {
        let registry = registry();
        assert_eq!(registry.allocate(2), 0..2);
        assert_eq!(registry.allocate(3), 2..5);
        registry.set_status(1, RunStatus::Cancelled).unwrap();
        registry.remove(1).unwrap();
        assert!(registry.slot(1).is_err());
        assert_eq!(registry.allocate(1), 5..6);
        assert_eq!(registry.ids(), vec![0, 2, 3, 4, 5]);
    }

    #[test]
    fn output_is_visible_only_after_done() {
        let registry = registry();
        let id = registry.allocate(1).start;
        let slot = registry.claim(id).unwrap();
        slot.output().set("f", Var::Float(4.)).unwrap();
        assert_eq!(registry.read_output(id).unwrap(), None);
        assert!(slot.mark_done());
        assert!(!slot.mark_done());
        let out = registry.read_output(id).unwrap().unwrap();
        assert_eq!(out.get("f"), Some(&Var::Float(4.)));
        assert_eq!(registry.get_status(id).unwrap(), RunStatus::Done);
    }

    #[test]
    fn single_claim_per_run() {
        let registry = registry();
        let id = registry.allocate(1).start;
        registry.claim(id).unwrap();
        match registry.claim(id) {
            Err(Error::SlotAlreadyClaimed(i)) => assert_eq!(i, id),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn terminal_states_are_final() {
        let registry = registry();
        let id = registry.allocate(1).start;
        registry.set_status(id, RunStatus::Running).unwrap();
        assert!(registry
            .set_crashed(id, RunFailure::NoSignal(Some(1)))
            .unwrap());
        assert!(!registry.set_status(id, RunStatus::Cancelled).unwrap());
        assert_eq!(registry.get_status(id).unwrap(), RunStatus::Crashed);
        assert!(registry.take_crash_report(id).unwrap());
        assert!(!registry.take_crash_report(id).unwrap());
    }
}
