//! Execution of a single run.
//!
//! A [`Worker`] goes through the run lifecycle: connect to the runner
//! through its interface, stage inputs with the preprocessor, execute the
//! simulation, extract outputs with the postprocessor, publish elapsed
//! time and signal completion.
//!
//! [`Worker`]: struct.Worker.html

pub mod post;
pub mod pre;

use std::fmt;
use std::fs::File;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Instant;

use crate::config::WorkerConfig;
use crate::error::{Error, Result};
use crate::interface::Interface;
use crate::plugins::Plugins;
use crate::row::Row;
use crate::{run_dir_name, RunId, ENV_RUN_ID};

pub use post::Postprocessor;
pub use pre::Preprocessor;

/// Signature of an in-process simulation.
pub type SimulationFn = dyn Fn(&Row, &mut Row) -> Result<()> + Send + Sync;

/// How the simulation of a run is invoked.
#[derive(Clone)]
pub enum Execution {
    /// Command line executed in the run's working directory.
    Command(String),
    /// In-process function of the input row filling the output row.
    Function(Arc<SimulationFn>),
}

impl Execution {
    pub fn function<F>(f: F) -> Self
    where
        F: Fn(&Row, &mut Row) -> Result<()> + Send + Sync + 'static,
    {
        Execution::Function(Arc::new(f))
    }
}

impl fmt::Debug for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Execution::Command(c) => write!(f, "Command({:?})", c),
            Execution::Function(_) => write!(f, "Function"),
        }
    }
}

/// Where a worker runs and where it puts captured output streams.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub base_dir: PathBuf,
    /// Parent of the `run_XXX` directories.
    pub run_dir: PathBuf,
    pub stdout: String,
    pub stderr: Option<String>,
}

impl WorkerSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        WorkerSettings {
            base_dir: config.base_dir.clone(),
            run_dir: config.run_dir.clone(),
            stdout: config.stdout.clone(),
            stderr: config.stderr.clone(),
        }
    }
}

/// Worker executing one run.
pub struct Worker {
    run_id: RunId,
    interface: Box<dyn Interface>,
    pre: Arc<dyn Preprocessor>,
    post: Arc<dyn Postprocessor>,
    execution: Execution,
    settings: WorkerSettings,
    started: Option<Instant>,
}

impl Worker {
    pub fn new(
        interface: Box<dyn Interface>,
        pre: Arc<dyn Preprocessor>,
        post: Arc<dyn Postprocessor>,
        execution: Execution,
        settings: WorkerSettings,
    ) -> Self {
        Worker {
            run_id: interface.run_id(),
            interface,
            pre,
            post,
            execution,
            settings,
            started: None,
        }
    }

    /// Creates the worker of a worker process from its configuration.
    pub fn from_config(config: &WorkerConfig, run_id: RunId, plugins: &Plugins) -> Result<Self> {
        let command = config.command.clone().ok_or_else(|| {
            Error::InvalidConfiguration("no command configured for the run".to_string())
        })?;
        let interface = plugins.worker_interface(config, run_id)?;
        Ok(Worker::new(
            interface,
            Arc::from(pre::from_config(&config.pre)),
            Arc::from(post::from_config(&config.post)),
            Execution::Command(command),
            WorkerSettings::from_config(config),
        ))
    }

    /// Creates the worker of a worker process, reading run id and
    /// configuration location from the environment.
    pub fn from_env(plugins: &Plugins) -> Result<Self> {
        let (run_id, config) = WorkerConfig::from_env()?;
        Worker::from_config(&config, run_id, plugins)
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn interface(&self) -> &dyn Interface {
        self.interface.as_ref()
    }

    pub fn execution(&self) -> &Execution {
        &self.execution
    }

    /// Directory the run stages into.
    pub fn run_dir(&self) -> PathBuf {
        self.settings.run_dir.join(run_dir_name(self.run_id))
    }

    /// Directory the simulation is executed in.
    pub fn work_dir(&self) -> PathBuf {
        if self.pre.requires_working_directory() || self.post.requires_working_directory() {
            self.run_dir()
        } else {
            self.settings.base_dir.clone()
        }
    }

    /// Connects the interface and stages the inputs.
    pub fn prepare(&mut self) -> Result<()> {
        self.interface.connect()?;
        let input = self.interface.input()?.clone();
        info!("run {}: preprocessing ({})", self.run_id, self.pre.label());
        let run_dir = self.run_dir();
        self.pre.prepare(&input, &run_dir)?;
        if !self.pre.requires_working_directory() && self.post.requires_working_directory() {
            std::fs::create_dir_all(&run_dir)?;
        }
        self.started = Some(Instant::now());
        Ok(())
    }

    /// Builds the simulation process of a command execution.
    pub fn command(&self) -> Result<Command> {
        let line = match &self.execution {
            Execution::Command(c) => c,
            Execution::Function(_) => {
                return Err(Error::Other(
                    "function execution has no command".to_string(),
                ))
            }
        };
        let args = shlex::split(line)
            .ok_or_else(|| Error::InvalidConfiguration(format!("can't parse command: {}", line)))?;
        let (program, args) = args
            .split_first()
            .ok_or_else(|| Error::InvalidConfiguration("empty command".to_string()))?;
        let work_dir = self.work_dir();
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&work_dir)
            .env(ENV_RUN_ID, self.run_id.to_string())
            .stdin(Stdio::null())
            .stdout(File::create(work_dir.join(&self.settings.stdout))?);
        match &self.settings.stderr {
            Some(stderr) => command.stderr(File::create(work_dir.join(stderr))?),
            None => command.stderr(Stdio::inherit()),
        };
        Ok(command)
    }

    /// Runs the simulation to completion on the current thread.
    pub fn execute(&mut self) -> Result<()> {
        info!("run {}: executing", self.run_id);
        match self.execution.clone() {
            Execution::Command(line) => {
                let status = self.command()?.status().map_err(|e| {
                    Error::ExecutionFailed(format!("can't start `{}`: {}", line, e))
                })?;
                check_status(&line, status)
            }
            Execution::Function(f) => {
                let input = self.interface.input()?.clone();
                let mut output = self.interface.output()?;
                f(&input, &mut *output)
            }
        }
    }

    /// Extracts outputs, publishes elapsed time and signals completion.
    pub fn finish(&mut self) -> Result<()> {
        let elapsed = self
            .started
            .map(|s| s.elapsed().as_secs_f64())
            .unwrap_or(0.);
        info!("run {}: postprocessing ({})", self.run_id, self.post.label());
        let work_dir = self.work_dir();
        {
            let post = self.post.clone();
            let mut output = self.interface.output()?;
            post.retrieve(&work_dir, &mut *output)?;
        }
        self.interface.set_time(elapsed)?;
        self.interface.done()?;
        debug!("run {}: done after {:.3}s", self.run_id, elapsed);
        Ok(())
    }

    /// Goes through the whole lifecycle.
    pub fn work(&mut self) -> Result<()> {
        self.prepare()?;
        self.execute()?;
        self.finish()
    }

    /// Removes the staged run directory.
    pub fn clean(&self) -> Result<()> {
        self.pre.clean(&self.run_dir())
    }
}

pub fn check_status(line: &str, status: std::process::ExitStatus) -> Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(Error::ExecutionFailed(format!(
            "`{}` exited with {}",
            line, status
        )))
    }
}

/// Runs the worker of a worker process and maps the outcome to the
/// process exit code.
pub fn run_worker_process(plugins: &Plugins) -> i32 {
    let mut worker = match Worker::from_env(plugins) {
        Ok(w) => w,
        Err(e) => {
            error!("worker setup failed: {}", e);
            return crate::exit_code::CONFIGURATION;
        }
    };
    match worker.work() {
        Ok(()) => crate::exit_code::SUCCESS,
        Err(e) => {
            error!("run {} failed: {}", worker.run_id(), e);
            e.exit_code()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use crate::interface::internal::InternalInterface;
    use crate::registry::Registry;
    use crate::row::{Field, Schema};
    use crate::var::{Var, VarType};

    fn registry() -> Arc<Registry> {
        let schema = |names: &[&str]| {
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
        };
        Arc::new(Registry::new(schema(&["u", "v"]), schema(&["f"]), 1))
    }

    fn settings(dir: &Path) -> WorkerSettings {
        WorkerSettings {
            base_dir: dir.to_path_buf(),
            run_dir: dir.to_path_buf(),
            stdout: "stdout".to_string(),
            stderr: None,
        }
    }

    #[test]
    fn function_worker_publishes_output() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let id = registry.allocate(1).start;
        let mut input = registry.input_schema().default_row();
        input.set("u", Var::Float(1.)).unwrap();
        input.set("v", Var::Float(2.)).unwrap();
        registry.set_input(id, input).unwrap();

        let mut worker = Worker::new(
            Box::new(InternalInterface::new(registry.clone(), id)),
            Arc::new(pre::NoPreprocessor),
            Arc::new(post::NoPostprocessor),
            Execution::function(|input, output| {
                let sum = input.get_float("u")? + input.get_float("v")?;
                output.set("f", Var::Float(sum))
            }),
            settings(dir.path()),
        );
        worker.work().unwrap();
        let output = registry.read_output(id).unwrap().unwrap();
        assert_eq!(output.get("f"), Some(&Var::Float(3.)));
        assert_eq!(worker.work_dir(), dir.path().to_path_buf());
    }

    #[cfg(unix)]
    #[test]
    fn command_worker_reads_stdout() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let id = registry.allocate(1).start;
        let mut worker = Worker::new(
            Box::new(InternalInterface::new(registry.clone(), id)),
            Arc::new(pre::NoPreprocessor),
            Arc::new(post::JsonPostprocessor::new(&Default::default())),
            Execution::Command("sh -c 'echo {\\\"f\\\": 42}'".to_string()),
            settings(dir.path()),
        );
        worker.work().unwrap();
        let output = registry.read_output(id).unwrap().unwrap();
        assert_eq!(output.get("f"), Some(&Var::Float(42.)));
        assert!(dir.path().join("run_000").join("stdout").exists());
    }

    #[cfg(unix)]
    #[test]
    fn failing_command_is_execution_failure() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry();
        let id = registry.allocate(1).start;
        let mut worker = Worker::new(
            Box::new(InternalInterface::new(registry.clone(), id)),
            Arc::new(pre::NoPreprocessor),
            Arc::new(post::NoPostprocessor),
            Execution::Command("sh -c 'exit 3'".to_string()),
            settings(dir.path()),
        );
        match worker.work() {
            Err(Error::ExecutionFailed(_)) => (),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(!registry.is_done(id).unwrap());
    }
}
