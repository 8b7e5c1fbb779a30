//! In-process transport aliasing the registry cells directly.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::interface::{Interface, RowMut, RowRef, RunnerInterface};
use crate::registry::{Registry, RunSlot};
use crate::{Float, RunId};

pub const LABEL: &str = "internal";

pub struct InternalInterface {
    run_id: RunId,
    registry: Arc<Registry>,
    slot: Option<Arc<RunSlot>>,
}

impl InternalInterface {
    pub fn new(registry: Arc<Registry>, run_id: RunId) -> Self {
        InternalInterface {
            run_id,
            registry,
            slot: None,
        }
    }

    fn slot(&self) -> Result<&Arc<RunSlot>> {
        self.slot.as_ref().ok_or(Error::NotReady)
    }
}

impl Interface for InternalInterface {
    fn label(&self) -> &'static str {
        LABEL
    }

    fn run_id(&self) -> RunId {
        self.run_id
    }

    fn connect(&mut self) -> Result<()> {
        if self.slot.is_none() {
            self.slot = Some(self.registry.claim(self.run_id)?);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.slot.is_some()
    }

    fn input(&self) -> Result<RowRef<'_>> {
        Ok(RowRef::Guard(self.slot()?.input()))
    }

    fn output(&mut self) -> Result<RowMut<'_>> {
        Ok(RowMut::Guard(self.slot()?.output()))
    }

    fn time(&self) -> Result<Float> {
        Ok(self.slot()?.time())
    }

    fn set_time(&mut self, secs: Float) -> Result<()> {
        self.slot()?.set_time(secs);
        Ok(())
    }

    fn done(&mut self) -> Result<()> {
        self.slot()?.mark_done();
        Ok(())
    }
}

/// Runner side of the in-process transport. Workers write straight into
/// the registry so there's nothing to move.
pub struct InternalRunnerInterface {
    registry: Arc<Registry>,
}

impl InternalRunnerInterface {
    pub fn new(registry: Arc<Registry>) -> Self {
        InternalRunnerInterface { registry }
    }
}

impl RunnerInterface for InternalRunnerInterface {
    fn label(&self) -> &'static str {
        LABEL
    }

    fn prepare(&mut self, run_id: RunId) -> Result<()> {
        self.registry.slot(run_id).map(|_| ())
    }

    fn poll_run(&mut self, run_id: RunId) -> Result<bool> {
        self.registry.is_done(run_id)
    }

    fn worker_env(&self, _run_id: RunId) -> Vec<(String, String)> {
        Vec::new()
    }

    fn clean_run(&mut self, _run_id: RunId) -> Result<()> {
        Ok(())
    }

    fn clean(&mut self) -> Result<()> {
        Ok(())
    }
}
