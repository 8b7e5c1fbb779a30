//! Backend running each run in a worker subprocess on the local machine.

use std::fs::{self, File};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fnv::FnvHashMap;

use crate::config::{ResolvedConfig, RunnerConfig};
use crate::error::{Error, Result};
use crate::interface::RunnerInterface;
use crate::plugins::Plugins;
use crate::registry::{Registry, RunFailure, RunStatus};
use crate::row::Row;
use crate::runner::{
    all_terminal, allocate_runs, worker_command, Admission, CancelReport, Runner, RunnerContext,
};
use crate::worker::{Execution, Preprocessor};
use crate::{run_dir_name, RunId, ENV_RUN_ID, ENV_WORKER_CONFIG};

pub const LABEL: &str = "local";

struct LocalRun {
    child: Child,
    started: Instant,
}

pub struct LocalRunner {
    registry: Arc<Registry>,
    interface: Box<dyn RunnerInterface>,
    pre: Arc<dyn Preprocessor>,
    worker_command: Vec<String>,
    worker_config: PathBuf,
    base_dir: PathBuf,
    run_dir: PathBuf,
    log_dir: PathBuf,
    parallel: usize,
    sleep: Duration,
    timeout: Option<Duration>,
    admission: Admission,
    running: FnvHashMap<RunId, LocalRun>,
    context: RunnerContext,
}

pub(crate) fn new_boxed(
    config: &ResolvedConfig,
    plugins: &Plugins,
    context: RunnerContext,
) -> Result<Box<dyn Runner>> {
    let local = match &config.run.runner {
        RunnerConfig::Local(c) => c,
        other => {
            return Err(Error::InvalidConfiguration(format!(
                "expected local runner configuration, got {}",
                other.class()
            )))
        }
    };
    if let Some(Execution::Function(_)) = context.execution {
        return Err(Error::InvalidConfiguration(
            "in-process simulation functions require the internal runner".to_string(),
        ));
    }
    if config.run.command.is_none() {
        return Err(Error::InvalidConfiguration(
            "local runner needs a run command".to_string(),
        ));
    }
    let registry = Arc::new(Registry::new(
        config.input_schema(),
        config.output_schema(),
        config.expected_runs(),
    ));
    let interface = plugins.runner_interface(config, registry.clone())?;
    let worker_config = config.write_worker_config()?;
    fs::create_dir_all(&config.run.log_path)?;
    Ok(Box::new(LocalRunner {
        interface,
        pre: plugins.preprocessor(config)?,
        worker_command: worker_command(&local.worker_command)?,
        worker_config,
        base_dir: config.base_dir.clone(),
        run_dir: config.run.run_dir.clone(),
        log_dir: config.run.log_path.clone(),
        parallel: local.parallel.count().max(1),
        sleep: Duration::from_secs_f64(local.sleep.max(0.)),
        timeout: local.timeout.map(|t| Duration::from_secs_f64(t.max(0.))),
        admission: Admission::default(),
        running: FnvHashMap::default(),
        registry,
        context,
    }))
}

impl LocalRunner {
    fn launch(&mut self, id: RunId) -> Result<()> {
        if let Err(e) = self.interface.prepare(id) {
            self.registry
                .set_crashed(id, RunFailure::Interface(e.to_string()))?;
            return Ok(());
        }
        let path = self.log_dir.join(format!("{}.log", run_dir_name(id)));
        let (stdout, stderr) = match File::create(&path).and_then(|f| Ok((f.try_clone()?, f))) {
            Ok(log) => log,
            Err(e) => {
                self.registry.set_crashed(
                    id,
                    RunFailure::Interface(format!("can't open log {}: {}", path.display(), e)),
                )?;
                return Ok(());
            }
        };
        if !self.registry.set_status(id, RunStatus::Running)? {
            return Ok(());
        }
        let mut command = Command::new(&self.worker_command[0]);
        command
            .args(&self.worker_command[1..])
            .current_dir(&self.base_dir)
            .env(ENV_RUN_ID, id.to_string())
            .env(ENV_WORKER_CONFIG, &self.worker_config)
            .envs(self.interface.worker_env(id))
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);
        match command.spawn() {
            Ok(child) => {
                trace!("run {}: started worker process {}", id, child.id());
                self.running.insert(
                    id,
                    LocalRun {
                        child,
                        started: Instant::now(),
                    },
                );
            }
            Err(e) => {
                self.registry.set_crashed(
                    id,
                    RunFailure::Interface(format!("can't start worker process: {}", e)),
                )?;
            }
        }
        Ok(())
    }

    /// Collects finished, failed and timed out worker processes.
    fn collect(&mut self) -> Result<()> {
        let ids: Vec<RunId> = self.running.keys().copied().collect();
        for id in ids {
            let done = match self.interface.poll_run(id) {
                Ok(done) => done,
                Err(e) => {
                    self.kill(id);
                    self.registry.set_crashed(id, RunFailure::from_error(&e))?;
                    continue;
                }
            };
            let exited = match self.running.get_mut(&id) {
                Some(run) => run.child.try_wait()?.map(|status| status.code()),
                None => continue,
            };
            match exited {
                Some(code) => {
                    self.running.remove(&id);
                    // output may land between the poll and the exit
                    let done = done || self.interface.poll_run(id).unwrap_or(false);
                    if !done {
                        let failure = RunFailure::from_exit_code(code);
                        if failure.is_staging() {
                            self.admission
                                .halt(&self.registry, format!("run {}: {}", id, failure));
                        }
                        self.registry.set_crashed(id, failure)?;
                    }
                }
                None if !done => {
                    let timed_out = match (self.timeout, self.running.get(&id)) {
                        (Some(timeout), Some(run)) => run.started.elapsed() > timeout,
                        _ => false,
                    };
                    if timed_out {
                        self.kill(id);
                        let secs = self.timeout.map(|t| t.as_secs_f64()).unwrap_or(0.);
                        self.registry.set_crashed(id, RunFailure::TimedOut(secs))?;
                    }
                }
                None => (),
            }
        }
        Ok(())
    }

    /// Kills the worker process of a run. Returns whether it was still
    /// alive.
    fn kill(&mut self, id: RunId) -> bool {
        match self.running.remove(&id) {
            Some(mut run) => {
                let killed = run.child.kill().is_ok();
                let _ = run.child.wait();
                killed
            }
            None => false,
        }
    }
}

impl Runner for LocalRunner {
    fn label(&self) -> &'static str {
        LABEL
    }

    fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    fn spawn_array(&mut self, inputs: Vec<Row>, wait: bool) -> Result<Vec<RunId>> {
        self.admission.check()?;
        let ids = allocate_runs(&self.registry, inputs)?;
        self.admission.push(&ids);
        self.poll()?;
        if wait {
            self.wait(&ids)?;
        }
        Ok(ids)
    }

    fn poll(&mut self) -> Result<()> {
        self.collect()?;
        while self.running.len() < self.parallel {
            match self.admission.next() {
                Some(id) => self.launch(id)?,
                None => break,
            }
        }
        Ok(())
    }

    fn wait(&mut self, ids: &[RunId]) -> Result<()> {
        loop {
            if self.context.is_interrupted() {
                return Err(Error::Interrupted);
            }
            self.poll()?;
            if all_terminal(&self.registry, ids)? {
                break;
            }
            thread::sleep(self.sleep);
        }
        self.check_runs()?;
        self.admission.check()
    }

    fn cancel_all(&mut self) -> Result<CancelReport> {
        let mut report = CancelReport::default();
        for id in self.admission.drain() {
            if self.registry.set_status(id, RunStatus::Cancelled)? {
                report.runs.push((id, true));
            }
        }
        let running: Vec<RunId> = self.running.keys().copied().collect();
        for id in running {
            if self.interface.poll_run(id).unwrap_or(false) {
                self.running.remove(&id);
                continue;
            }
            let killed = self.kill(id);
            if self.registry.set_status(id, RunStatus::Cancelled)? {
                report.runs.push((id, killed));
            }
        }
        report.runs.sort_unstable();
        info!("cancelled {} runs", report.runs.len());
        Ok(report)
    }

    fn clean(&mut self) -> Result<()> {
        for id in self.registry.ids() {
            if self.registry.get_status(id)?.is_terminal() {
                self.pre.clean(&self.run_dir.join(run_dir_name(id)))?;
                self.interface.clean_run(id)?;
            }
        }
        if self.running.is_empty() {
            self.interface.clean()?;
        }
        Ok(())
    }
}

impl Drop for LocalRunner {
    fn drop(&mut self) {
        let ids: Vec<RunId> = self.running.keys().copied().collect();
        for id in ids {
            self.kill(id);
        }
    }
}
