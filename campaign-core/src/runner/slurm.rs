//! Cluster backend submitting one Slurm job per run.
//!
//! The transport is polled every `sleep` seconds, the scheduler every
//! `poll` seconds to catch jobs that ended without signaling completion.

use std::fs;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fnv::FnvHashMap;

use crate::config::{OptionValue, Parallel, ResolvedConfig, RunnerConfig, SlurmRunnerConfig};
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

pub const LABEL: &str = "slurm";

/// Job states after which a job is gone for good.
const FINAL_STATES: &[&str] = &[
    "BOOT_FAIL",
    "CANCELLED",
    "COMPLETED",
    "DEADLINE",
    "FAILED",
    "NODE_FAIL",
    "OUT_OF_MEMORY",
    "PREEMPTED",
    "TIMEOUT",
];

pub fn is_final_state(state: &str) -> bool {
    let state = state.split_whitespace().next().unwrap_or("");
    FINAL_STATES.contains(&state)
}

/// Batch script running the worker command for the run given through the
/// environment.
pub fn generate_script(config: &SlurmRunnerConfig, worker_command: &[String]) -> Result<String> {
    let mut script = String::from("#!/bin/bash\n");
    for (key, value) in &config.options {
        match value {
            OptionValue::Bool(true) => script.push_str(&format!("#SBATCH --{}\n", key)),
            OptionValue::Bool(false) => (),
            value => script.push_str(&format!("#SBATCH --{}={}\n", key, value)),
        }
    }
    match config.cpus {
        Parallel::All => script.push_str("#SBATCH --exclusive\n"),
        Parallel::Count(n) => script.push_str(&format!("#SBATCH --cpus-per-task={}\n", n)),
    }
    script.push('\n');
    if config.openmp {
        match config.cpus {
            Parallel::All => script.push_str("export OMP_NUM_THREADS=$SLURM_CPUS_ON_NODE\n"),
            Parallel::Count(_) => {
                script.push_str("export OMP_NUM_THREADS=$SLURM_CPUS_PER_TASK\n")
            }
        }
        script.push_str("export OMP_PLACES=threads\n\n");
    }
    let command = shlex::try_join(worker_command.iter().map(|s| s.as_str()))
        .map_err(|e| Error::InvalidConfiguration(format!("can't quote worker command: {}", e)))?;
    match &config.prefix {
        Some(prefix) if !prefix.is_empty() => {
            script.push_str(&format!("{} {}\n", prefix, command))
        }
        _ => script.push_str(&format!("{}\n", command)),
    }
    Ok(script)
}

/// Extracts the job id from the output of `sbatch --parsable`, which is
/// `<job id>[;<cluster>]`.
pub fn parse_sbatch_output(output: &str) -> Result<String> {
    let id = output
        .lines()
        .map(|l| l.trim())
        .find(|l| !l.is_empty())
        .and_then(|l| l.split(';').next())
        .map(|id| id.trim())
        .unwrap_or("");
    if id.is_empty() || !id.chars().all(|c| c.is_ascii_digit() || c == '_') {
        return Err(Error::ParsingError(format!(
            "unexpected sbatch output: {:?}",
            output
        )));
    }
    Ok(id.to_string())
}

/// Parses `squeue --noheader --format="%i %T"` output into job states.
pub fn parse_squeue_output(output: &str) -> FnvHashMap<String, String> {
    output
        .lines()
        .filter_map(|line| {
            let mut split = line.split_whitespace();
            match (split.next(), split.next()) {
                (Some(id), Some(state)) => Some((id.to_string(), state.to_string())),
                _ => None,
            }
        })
        .collect()
}

pub struct SlurmRunner {
    registry: Arc<Registry>,
    interface: Box<dyn RunnerInterface>,
    pre: Arc<dyn Preprocessor>,
    config: SlurmRunnerConfig,
    script: PathBuf,
    worker_config: PathBuf,
    base_dir: PathBuf,
    run_dir: PathBuf,
    log_dir: PathBuf,
    admission: Admission,
    jobs: FnvHashMap<RunId, String>,
    last_poll: Instant,
    context: RunnerContext,
}

pub(crate) fn new_boxed(
    config: &ResolvedConfig,
    plugins: &Plugins,
    context: RunnerContext,
) -> Result<Box<dyn Runner>> {
    let slurm = match &config.run.runner {
        RunnerConfig::Slurm(c) => c.clone(),
        other => {
            return Err(Error::InvalidConfiguration(format!(
                "expected slurm runner configuration, got {}",
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
            "slurm runner needs a run command".to_string(),
        ));
    }
    if slurm.custom {
        if !slurm.path.is_file() {
            return Err(Error::InvalidConfiguration(format!(
                "custom batch script not found: {}",
                slurm.path.display()
            )));
        }
    } else {
        let script = generate_script(&slurm, &worker_command(&slurm.worker_command)?)?;
        fs::write(&slurm.path, script)?;
        debug!("wrote batch script {}", slurm.path.display());
    }
    let registry = Arc::new(Registry::new(
        config.input_schema(),
        config.output_schema(),
        config.expected_runs(),
    ));
    fs::create_dir_all(&config.run.log_path)?;
    Ok(Box::new(SlurmRunner {
        interface: plugins.runner_interface(config, registry.clone())?,
        pre: plugins.preprocessor(config)?,
        script: slurm.path.clone(),
        worker_config: config.write_worker_config()?,
        base_dir: config.base_dir.clone(),
        run_dir: config.run.run_dir.clone(),
        log_dir: config.run.log_path.clone(),
        admission: Admission::default(),
        jobs: FnvHashMap::default(),
        last_poll: Instant::now(),
        config: slurm,
        registry,
        context,
    }))
}

fn command_output(command: &mut Command, name: &str) -> Result<std::process::Output> {
    command
        .output()
        .map_err(|e| Error::ExecutionFailed(format!("can't run {}: {}", name, e)))
}

impl SlurmRunner {
    fn submit(&mut self, id: RunId) -> Result<()> {
        if let Err(e) = self.interface.prepare(id) {
            self.registry
                .set_crashed(id, RunFailure::Interface(e.to_string()))?;
            return Ok(());
        }
        let mut export = format!(
            "--export=ALL,{}={},{}={}",
            ENV_RUN_ID,
            id,
            ENV_WORKER_CONFIG,
            self.worker_config.display()
        );
        for (key, value) in self.interface.worker_env(id) {
            export.push_str(&format!(",{}={}", key, value));
        }
        let log = self.log_dir.join(format!("{}.log", run_dir_name(id)));
        let output = match command_output(
            Command::new(&self.config.sbatch)
                .arg("--parsable")
                .arg(export)
                .arg(format!("--output={}", log.display()))
                .arg(format!("--chdir={}", self.base_dir.display()))
                .arg(&self.script),
            &self.config.sbatch,
        ) {
            Ok(output) => output,
            Err(e) => {
                self.registry
                    .set_crashed(id, RunFailure::Interface(e.to_string()))?;
                return Ok(());
            }
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            self.registry
                .set_crashed(id, RunFailure::Interface(format!("sbatch failed: {}", stderr.trim())))?;
            return Ok(());
        }
        let job = match parse_sbatch_output(&String::from_utf8_lossy(&output.stdout)) {
            Ok(job) => job,
            Err(e) => {
                warn!("run {}: a job may have been submitted but can't be tracked", id);
                self.registry
                    .set_crashed(id, RunFailure::Interface(e.to_string()))?;
                return Ok(());
            }
        };
        if self.registry.set_status(id, RunStatus::Running)? {
            debug!("run {}: submitted as job {}", id, job);
            self.jobs.insert(id, job);
        }
        Ok(())
    }

    /// Queries the scheduler for the state of the submitted jobs. Jobs
    /// missing from the answer are no longer known to it.
    fn query(&self) -> Result<Option<FnvHashMap<String, String>>> {
        if self.jobs.is_empty() {
            return Ok(Some(FnvHashMap::default()));
        }
        let ids: Vec<&str> = self.jobs.values().map(|j| j.as_str()).collect();
        let output = match command_output(
            Command::new(&self.config.squeue)
                .arg("--noheader")
                .arg("--format=%i %T")
                .arg(format!("--jobs={}", ids.join(","))),
            &self.config.squeue,
        ) {
            Ok(output) => output,
            Err(e) => {
                warn!("{}", e);
                return Ok(None);
            }
        };
        if output.status.success() {
            return Ok(Some(parse_squeue_output(&String::from_utf8_lossy(
                &output.stdout,
            ))));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("Invalid job id") {
            Ok(Some(FnvHashMap::default()))
        } else {
            warn!("squeue failed: {}", stderr.trim());
            Ok(None)
        }
    }

    fn collect(&mut self) -> Result<()> {
        let ids: Vec<RunId> = self.jobs.keys().copied().collect();
        for id in &ids {
            match self.interface.poll_run(*id) {
                Ok(true) => {
                    self.jobs.remove(id);
                }
                Ok(false) => (),
                Err(e) => {
                    if let Some(job) = self.jobs.remove(id) {
                        self.scancel(&[job]);
                    }
                    self.registry.set_crashed(*id, RunFailure::from_error(&e))?;
                }
            }
        }
        if self.last_poll.elapsed() < Duration::from_secs_f64(self.config.poll.max(0.)) {
            return Ok(());
        }
        self.last_poll = Instant::now();
        let states = match self.query()? {
            Some(states) => states,
            None => return Ok(()),
        };
        let ids: Vec<RunId> = self.jobs.keys().copied().collect();
        for id in ids {
            let job = match self.jobs.get(&id) {
                Some(job) => job.clone(),
                None => continue,
            };
            let state = states.get(&job).map(|s| s.as_str());
            let gone = match state {
                None => true,
                Some(state) => is_final_state(state),
            };
            if !gone || self.interface.poll_run(id).unwrap_or(false) {
                if gone {
                    self.jobs.remove(&id);
                }
                continue;
            }
            self.jobs.remove(&id);
            let failure = match state {
                Some("TIMEOUT") => RunFailure::TimedOut(0.),
                Some(state) => RunFailure::Execution(format!("job {} ended {}", job, state)),
                None => RunFailure::NoSignal(None),
            };
            self.registry.set_crashed(id, failure)?;
        }
        Ok(())
    }

    /// Cancels the given jobs, returns whether the scheduler accepted it.
    fn scancel(&self, jobs: &[String]) -> bool {
        if jobs.is_empty() {
            return true;
        }
        match Command::new(&self.config.scancel).args(jobs).output() {
            Ok(output) if output.status.success() => true,
            Ok(output) => {
                warn!(
                    "scancel failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                false
            }
            Err(e) => {
                warn!("can't run {}: {}", self.config.scancel, e);
                false
            }
        }
    }
}

impl Runner for SlurmRunner {
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
        let limit = self.config.parallel.unwrap_or(usize::MAX).max(1);
        while self.jobs.len() < limit {
            match self.admission.next() {
                Some(id) => self.submit(id)?,
                None => break,
            }
        }
        Ok(())
    }

    fn wait(&mut self, ids: &[RunId]) -> Result<()> {
        let sleep = Duration::from_secs_f64(self.config.sleep.max(0.));
        loop {
            if self.context.is_interrupted() {
                return Err(Error::Interrupted);
            }
            self.poll()?;
            if all_terminal(&self.registry, ids)? {
                break;
            }
            thread::sleep(sleep);
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
        let jobs: Vec<(RunId, String)> = self.jobs.drain().collect();
        let accepted = self.scancel(&jobs.iter().map(|(_, j)| j.clone()).collect::<Vec<_>>());
        for (id, _) in jobs {
            if self.registry.set_status(id, RunStatus::Cancelled)? {
                report.runs.push((id, accepted));
            }
        }
        report.runs.sort_unstable();
        let unsupported = report.unsupported();
        if !unsupported.is_empty() {
            warn!("jobs of runs {:?} may still be running", unsupported);
        }
        Ok(report)
    }

    fn clean(&mut self) -> Result<()> {
        for id in self.registry.ids() {
            if self.registry.get_status(id)?.is_terminal() {
                self.pre.clean(&self.run_dir.join(run_dir_name(id)))?;
                self.interface.clean_run(id)?;
            }
        }
        if self.jobs.is_empty() {
            self.interface.clean()?;
            if !self.config.custom && self.script.is_file() {
                fs::remove_file(&self.script)?;
            }
        }
        Ok(())
    }
}
