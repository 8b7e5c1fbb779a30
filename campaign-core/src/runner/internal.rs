//! In-process backend running every run as a cooperative task on a
//! single-threaded scheduler.
//!
//! Tasks only make progress while the runner drives its scheduler, that is
//! within `poll`, `wait` and the blocking variants of `spawn_*`. Command
//! executions are awaited as child processes killed when their task is
//! dropped, function executions run to completion within one step.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use fnv::FnvHashMap;
use tokio::runtime::Runtime;
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, LocalSet};
use tokio_util::sync::CancellationToken;

use crate::config::{ResolvedConfig, RunnerConfig};
use crate::error::{Error, Result};
use crate::interface::internal::InternalInterface;
use crate::plugins::Plugins;
use crate::registry::{Registry, RunFailure, RunStatus};
use crate::row::Row;
use crate::runner::{all_terminal, allocate_runs, report_crashes, CancelReport, Runner, RunnerContext};
use crate::worker::{check_status, Execution, Postprocessor, Preprocessor, Worker, WorkerSettings};
use crate::RunId;

pub const LABEL: &str = "internal";

/// Scheduler step used while waiting.
const STEP: Duration = Duration::from_millis(2);

struct Task {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

pub struct InternalRunner {
    registry: Arc<Registry>,
    runtime: Runtime,
    local: LocalSet,
    execution: Execution,
    pre: Arc<dyn Preprocessor>,
    post: Arc<dyn Postprocessor>,
    settings: WorkerSettings,
    permits: Arc<Semaphore>,
    halt: CancellationToken,
    halt_reason: Rc<RefCell<Option<String>>>,
    tasks: FnvHashMap<RunId, Task>,
    context: RunnerContext,
}

pub(crate) fn new_boxed(
    config: &ResolvedConfig,
    plugins: &Plugins,
    context: RunnerContext,
) -> Result<Box<dyn Runner>> {
    let parallel = match &config.run.runner {
        RunnerConfig::Internal(c) => c.parallel,
        other => {
            return Err(Error::InvalidConfiguration(format!(
                "expected internal runner configuration, got {}",
                other.class()
            )))
        }
    };
    let execution = match (&context.execution, &config.run.command) {
        (Some(execution), _) => execution.clone(),
        (None, Some(command)) => Execution::Command(command.clone()),
        (None, None) => {
            return Err(Error::InvalidConfiguration(
                "internal runner needs either a command or a simulation function".to_string(),
            ))
        }
    };
    let registry = Arc::new(Registry::new(
        config.input_schema(),
        config.output_schema(),
        config.expected_runs(),
    ));
    let settings = WorkerSettings {
        base_dir: config.base_dir.clone(),
        run_dir: config.run.run_dir.clone(),
        stdout: config.run.stdout.clone(),
        stderr: config.run.stderr.clone(),
    };
    Ok(Box::new(InternalRunner::new(
        registry,
        execution,
        plugins.preprocessor(config)?,
        plugins.postprocessor(config)?,
        settings,
        parallel,
        context,
    )?))
}

impl InternalRunner {
    /// Creates the runner. Parallelism is unbounded when `parallel` is
    /// `None`.
    pub fn new(
        registry: Arc<Registry>,
        execution: Execution,
        pre: Arc<dyn Preprocessor>,
        post: Arc<dyn Postprocessor>,
        settings: WorkerSettings,
        parallel: Option<usize>,
        context: RunnerContext,
    ) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        let permits = match parallel {
            Some(0) => {
                return Err(Error::InvalidConfiguration(
                    "parallel must be at least 1".to_string(),
                ))
            }
            Some(n) => n,
            None => Semaphore::MAX_PERMITS,
        };
        Ok(InternalRunner {
            registry,
            runtime,
            local: LocalSet::new(),
            execution,
            pre,
            post,
            settings,
            permits: Arc::new(Semaphore::new(permits)),
            halt: CancellationToken::new(),
            halt_reason: Rc::new(RefCell::new(None)),
            tasks: FnvHashMap::default(),
            context,
        })
    }

    fn launch(&mut self, id: RunId) {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let registry = self.registry.clone();
        let permits = self.permits.clone();
        let halt = self.halt.clone();
        let halt_reason = self.halt_reason.clone();
        let mut worker = Worker::new(
            Box::new(InternalInterface::new(registry.clone(), id)),
            self.pre.clone(),
            self.post.clone(),
            self.execution.clone(),
            self.settings.clone(),
        );
        let handle = self.local.spawn_local(async move {
            let _permit = tokio::select! {
                permit = permits.acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => return,
                },
                _ = token.cancelled() => return,
                _ = halt.cancelled() => {
                    let _ = registry.set_status(id, RunStatus::Cancelled);
                    return;
                }
            };
            if halt.is_cancelled() {
                let _ = registry.set_status(id, RunStatus::Cancelled);
                return;
            }
            match registry.set_status(id, RunStatus::Running) {
                Ok(true) => (),
                _ => return,
            }
            let result = tokio::select! {
                result = run_worker(&mut worker) => result,
                _ = token.cancelled() => return,
            };
            if let Err(e) = result {
                let failure = RunFailure::from_error(&e);
                if failure.is_staging() {
                    halt_reason
                        .borrow_mut()
                        .get_or_insert_with(|| format!("run {}: {}", id, e));
                    halt.cancel();
                }
                let _ = registry.set_crashed(id, failure);
            }
        });
        self.tasks.insert(id, Task { handle, cancel });
    }

    /// Runs the scheduler for a single step.
    fn step(&mut self, duration: Duration) {
        let local = &self.local;
        self.runtime.block_on(local.run_until(async move {
            tokio::time::sleep(duration).await;
        }));
    }

    /// Drops finished tasks, marking runs that ended without a terminal
    /// status as crashed.
    fn reap(&mut self) {
        let registry = &self.registry;
        self.tasks.retain(|id, task| {
            if !task.handle.is_finished() {
                return true;
            }
            if let Ok(status) = registry.get_status(*id) {
                if !status.is_terminal() {
                    let _ = registry.set_crashed(*id, RunFailure::NoSignal(None));
                }
            }
            false
        });
    }

    fn check_halt(&self) -> Result<()> {
        if self.halt.is_cancelled() {
            let reason = self
                .halt_reason
                .borrow()
                .clone()
                .unwrap_or_else(|| "staging failed".to_string());
            return Err(Error::StagingFailure(reason));
        }
        Ok(())
    }
}

async fn run_worker(worker: &mut Worker) -> Result<()> {
    worker.prepare()?;
    tokio::task::yield_now().await;
    match worker.execution().clone() {
        Execution::Function(_) => worker.execute()?,
        Execution::Command(line) => {
            let mut command = tokio::process::Command::from(worker.command()?);
            command.kill_on_drop(true);
            let status = command.status().await.map_err(|e| {
                Error::ExecutionFailed(format!("can't start `{}`: {}", line, e))
            })?;
            check_status(&line, status)?;
        }
    }
    tokio::task::yield_now().await;
    worker.finish()
}

impl Runner for InternalRunner {
    fn label(&self) -> &'static str {
        LABEL
    }

    fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn spawn_array(&mut self, inputs: Vec<Row>, wait: bool) -> Result<Vec<RunId>> {
        self.check_halt()?;
        let ids = allocate_runs(&self.registry, inputs)?;
        for id in &ids {
            self.launch(*id);
        }
        debug!("spawned {} internal runs", ids.len());
        if wait {
            self.wait(&ids)?;
        }
        Ok(ids)
    }

    fn poll(&mut self) -> Result<()> {
        self.step(Duration::from_millis(0));
        self.reap();
        Ok(())
    }

    fn wait(&mut self, ids: &[RunId]) -> Result<()> {
        loop {
            if self.context.is_interrupted() {
                return Err(Error::Interrupted);
            }
            self.step(STEP);
            self.reap();
            if all_terminal(&self.registry, ids)? {
                break;
            }
        }
        self.check_runs()?;
        self.check_halt()
    }

    fn check_runs(&mut self) -> Result<Vec<RunId>> {
        self.reap();
        Ok(report_crashes(&self.registry))
    }

    fn cancel_all(&mut self) -> Result<CancelReport> {
        let mut report = CancelReport::default();
        for (id, task) in self.tasks.drain() {
            task.cancel.cancel();
            task.handle.abort();
            if let Ok(true) = self.registry.set_status(id, RunStatus::Cancelled) {
                report.runs.push((id, true));
            }
        }
        // let aborted tasks drop their child processes
        self.step(Duration::from_millis(0));
        report.runs.sort_unstable();
        info!("cancelled {} runs", report.runs.len());
        Ok(report)
    }

    fn clean(&mut self) -> Result<()> {
        let run_dir = self.settings.run_dir.clone();
        for id in self.registry.ids() {
            if self.registry.get_status(id)?.is_terminal() {
                self.pre.clean(&run_dir.join(crate::run_dir_name(id)))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{Field, Schema};
    use crate::var::{Var, VarType};
    use crate::worker::{post, pre};

    fn schema(names: &[&str]) -> Arc<Schema> {
        Arc::new(Schema::new(
            names
                .iter()
                .map(|n| Field {
                    name: n.to_string(),
                    vtype: VarType::Float,
                    len: None,
                })
                .collect(),
        ))
    }

    fn runner(dir: &std::path::Path, execution: Execution, parallel: Option<usize>) -> InternalRunner {
        let registry = Arc::new(Registry::new(schema(&["u", "v"]), schema(&["f"]), 8));
        InternalRunner::new(
            registry,
            execution,
            Arc::new(pre::NoPreprocessor),
            Arc::new(post::NoPostprocessor),
            WorkerSettings {
                base_dir: dir.to_path_buf(),
                run_dir: dir.to_path_buf(),
                stdout: "stdout".to_string(),
                stderr: None,
            },
            parallel,
            RunnerContext::default(),
        )
        .unwrap()
    }

    fn input(runner: &InternalRunner, u: f64, v: f64) -> Row {
        let mut row = runner.registry().input_schema().default_row();
        row.set("u", Var::Float(u)).unwrap();
        row.set("v", Var::Float(v)).unwrap();
        row
    }

    #[test]
    fn sums_are_computed_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner(dir.path(), crate::mock::sum(), Some(2));
        let inputs = vec![input(&runner, 1., 2.), input(&runner, 3., 4.), input(&runner, 5., 6.)];
        let ids = runner.spawn_array(inputs, true).unwrap();
        assert_eq!(ids, vec![0, 1, 2]);
        let outputs: Vec<Var> = ids
            .iter()
            .map(|id| runner.registry().read_output(*id).unwrap().unwrap().values()[0].clone())
            .collect();
        assert_eq!(outputs, vec![Var::Float(3.), Var::Float(7.), Var::Float(11.)]);
    }

    #[test]
    fn polling_drives_runs_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner(dir.path(), crate::mock::sum(), Some(1));
        runner.poll().unwrap();
        let ids = runner
            .spawn_array(vec![input(&runner, 1., 2.), input(&runner, 3., 4.)], false)
            .unwrap();
        for _ in 0..100 {
            runner.poll().unwrap();
            if all_terminal(runner.registry(), &ids).unwrap() {
                break;
            }
        }
        runner.wait_all().unwrap();
        assert_eq!(runner.registry().with_status(RunStatus::Done), ids);
    }

    #[test]
    fn failing_function_crashes_only_its_run() {
        let dir = tempfile::tempdir().unwrap();
        let execution = Execution::function(|input, output| {
            let u = input.get_float("u")?;
            if u < 0. {
                return Err(Error::ExecutionFailed("negative".to_string()));
            }
            output.set("f", Var::Float(u))
        });
        let mut runner = runner(dir.path(), execution, None);
        let inputs = vec![input(&runner, 1., 0.), input(&runner, -1., 0.)];
        let ids = runner.spawn_array(inputs, true).unwrap();
        assert_eq!(runner.registry().get_status(ids[0]).unwrap(), RunStatus::Done);
        assert_eq!(runner.registry().get_status(ids[1]).unwrap(), RunStatus::Crashed);
        // already reported while waiting
        assert!(runner.check_runs().unwrap().is_empty());
    }

    #[test]
    fn cancel_all_stops_queued_runs() {
        let dir = tempfile::tempdir().unwrap();
        let mut runner = runner(dir.path(), crate::mock::sum(), Some(1));
        let inputs = vec![input(&runner, 1., 2.); 4];
        let ids = runner.spawn_array(inputs, false).unwrap();
        let report = runner.cancel_all().unwrap();
        assert_eq!(report.effective(), ids);
        for id in ids {
            assert_eq!(runner.registry().get_status(id).unwrap(), RunStatus::Cancelled);
            assert!(runner.registry().read_output(id).unwrap().is_none());
        }
    }

    #[test]
    fn staging_failure_aborts_batch() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::new(schema(&["u", "v"]), schema(&["f"]), 8));
        let pre = pre::TemplatePreprocessor::new(&crate::config::TemplatePreConfig {
            path: dir.path().join("missing"),
            ..Default::default()
        });
        let mut runner = InternalRunner::new(
            registry,
            crate::mock::sum(),
            Arc::new(pre),
            Arc::new(post::NoPostprocessor),
            WorkerSettings {
                base_dir: dir.path().to_path_buf(),
                run_dir: dir.path().to_path_buf(),
                stdout: "stdout".to_string(),
                stderr: None,
            },
            Some(1),
            RunnerContext::default(),
        )
        .unwrap();
        let inputs = vec![input(&runner, 1., 2.); 3];
        match runner.spawn_array(inputs, true) {
            Err(Error::StagingFailure(_)) => (),
            other => panic!("unexpected: {:?}", other),
        }
        let registry = runner.registry().clone();
        assert_eq!(registry.get_status(0).unwrap(), RunStatus::Crashed);
        assert_eq!(registry.with_status(RunStatus::Cancelled), vec![1, 2]);
    }
}
