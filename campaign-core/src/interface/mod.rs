//! Per-run transport endpoints.
//!
//! Each run talks to its runner through a pair of endpoints. The worker
//! side implements [`Interface`], giving access to exactly one run's
//! input and output rows, elapsed time and completion signal. The runner
//! side implements [`RunnerInterface`], which makes inputs available to
//! workers and moves published outputs into the [`Registry`].
//!
//! Cross-boundary transports publish `done` only after the output is
//! written, and the runner side copies the output into the registry
//! before marking the run done there.
//!
//! [`Interface`]: trait.Interface.html
//! [`RunnerInterface`]: trait.RunnerInterface.html
//! [`Registry`]: ../registry/struct.Registry.html

pub mod filesystem;
pub mod internal;

use std::ops::{Deref, DerefMut};
use std::sync::MutexGuard;

use crate::error::Result;
use crate::row::Row;
use crate::{Float, RunId};

/// Read access to a row, either locked in the registry or held locally.
pub enum RowRef<'a> {
    Guard(MutexGuard<'a, Row>),
    Local(&'a Row),
}

impl Deref for RowRef<'_> {
    type Target = Row;
    fn deref(&self) -> &Row {
        match self {
            RowRef::Guard(g) => g,
            RowRef::Local(r) => r,
        }
    }
}

/// Write access to a row, either locked in the registry or held locally.
pub enum RowMut<'a> {
    Guard(MutexGuard<'a, Row>),
    Local(&'a mut Row),
}

impl Deref for RowMut<'_> {
    type Target = Row;
    fn deref(&self) -> &Row {
        match self {
            RowMut::Guard(g) => g,
            RowMut::Local(r) => r,
        }
    }
}

impl DerefMut for RowMut<'_> {
    fn deref_mut(&mut self) -> &mut Row {
        match self {
            RowMut::Guard(g) => g,
            RowMut::Local(r) => r,
        }
    }
}

/// Worker side of a run's transport, scoped to a single run.
///
/// Every operation other than `connect` fails with `NotReady` until the
/// handshake with the runner side succeeded.
pub trait Interface: Send {
    fn label(&self) -> &'static str;

    fn run_id(&self) -> RunId;

    /// Performs the handshake with the runner side, fetching the input.
    fn connect(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn input(&self) -> Result<RowRef<'_>>;

    fn output(&mut self) -> Result<RowMut<'_>>;

    /// Elapsed execution time in seconds.
    fn time(&self) -> Result<Float>;

    fn set_time(&mut self, secs: Float) -> Result<()>;

    /// Signals completion, publishing output and time. Calling it again is
    /// a no-op.
    fn done(&mut self) -> Result<()>;
}

/// Runner side of a transport, serving all runs of a registry.
pub trait RunnerInterface: Send {
    fn label(&self) -> &'static str;

    /// Makes the run's input available to its worker. Called right before
    /// the run is launched.
    fn prepare(&mut self, run_id: RunId) -> Result<()>;

    /// Collects whatever the worker published. Returns `true` once the
    /// output is in the registry and the run is marked done there.
    fn poll_run(&mut self, run_id: RunId) -> Result<bool>;

    /// Environment variables a worker process needs to reach this
    /// endpoint.
    fn worker_env(&self, run_id: RunId) -> Vec<(String, String)>;

    /// Releases transport state of a single finished run.
    fn clean_run(&mut self, run_id: RunId) -> Result<()>;

    /// Releases all transport state.
    fn clean(&mut self) -> Result<()>;
}
