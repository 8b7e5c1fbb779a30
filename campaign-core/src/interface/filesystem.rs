//! Shared directory transport.
//!
//! Each run gets its own directory `<path>/run_XXX` holding:
//!
//! - `input.json`, written by the runner before launch,
//! - `output.json` and `time`, written by the worker,
//! - `done`, an empty marker the worker renames into place last.
//!
//! All files are written to a temporary name first and renamed, so a
//! reader never sees a partially written file.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fnv::FnvHashMap;

use crate::config::{FilesystemInterfaceConfig, InterfaceConfig, WorkerConfig};
use crate::error::{Error, Result};
use crate::interface::{Interface, RowMut, RowRef, RunnerInterface};
use crate::registry::{Registry, RunSlot};
use crate::row::{Row, Schema};
use crate::{run_dir_name, Float, RunId};

pub const LABEL: &str = "filesystem";

const INPUT_FILE: &str = "input.json";
const OUTPUT_FILE: &str = "output.json";
const TIME_FILE: &str = "time";
const DONE_MARKER: &str = "done";

/// Environment variable pointing workers at the shared directory.
pub const ENV_PATH: &str = "CAMPAIGN_INTERFACE_PATH";

fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn config(config: &InterfaceConfig) -> Result<&FilesystemInterfaceConfig> {
    match config {
        InterfaceConfig::Filesystem(c) => Ok(c),
        other => Err(Error::InvalidConfiguration(format!(
            "expected filesystem interface configuration, got {}",
            other.class()
        ))),
    }
}

/// Worker side of the filesystem transport.
pub struct FilesystemInterface {
    run_id: RunId,
    dir: PathBuf,
    input_schema: Arc<Schema>,
    input: Option<Row>,
    output: Row,
    time: Float,
    done: bool,
}

impl FilesystemInterface {
    pub fn new(path: &Path, run_id: RunId, input: Arc<Schema>, output: Arc<Schema>) -> Self {
        FilesystemInterface {
            run_id,
            dir: path.join(run_dir_name(run_id)),
            input_schema: input,
            input: None,
            output: output.default_row(),
            time: 0.,
            done: false,
        }
    }

    pub fn from_worker_config(config: &WorkerConfig, run_id: RunId) -> Result<Self> {
        let path = match std::env::var(ENV_PATH) {
            Ok(p) => PathBuf::from(p),
            Err(_) => self::config(&config.interface)?.path.clone(),
        };
        Ok(FilesystemInterface::new(
            &path,
            run_id,
            config.input_schema(),
            config.output_schema(),
        ))
    }

    fn check_connected(&self) -> Result<()> {
        if self.input.is_some() {
            Ok(())
        } else {
            Err(Error::NotReady)
        }
    }
}

impl Interface for FilesystemInterface {
    fn label(&self) -> &'static str {
        LABEL
    }

    fn run_id(&self) -> RunId {
        self.run_id
    }

    fn connect(&mut self) -> Result<()> {
        if self.input.is_some() {
            return Ok(());
        }
        let path = self.dir.join(INPUT_FILE);
        let bytes = fs::read(&path).map_err(|e| {
            Error::IoError(format!("can't read run input at {}: {}", path.display(), e))
        })?;
        let json: serde_json::Value = serde_json::from_slice(&bytes)?;
        self.input = Some(Row::from_json(self.input_schema.clone(), &json)?);
        debug!("run {} connected through {}", self.run_id, self.dir.display());
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.input.is_some()
    }

    fn input(&self) -> Result<RowRef<'_>> {
        self.input.as_ref().map(RowRef::Local).ok_or(Error::NotReady)
    }

    fn output(&mut self) -> Result<RowMut<'_>> {
        self.check_connected()?;
        Ok(RowMut::Local(&mut self.output))
    }

    fn time(&self) -> Result<Float> {
        self.check_connected()?;
        Ok(self.time)
    }

    fn set_time(&mut self, secs: Float) -> Result<()> {
        self.check_connected()?;
        self.time = secs;
        Ok(())
    }

    fn done(&mut self) -> Result<()> {
        self.check_connected()?;
        if self.done {
            return Ok(());
        }
        write_atomic(
            &self.dir.join(OUTPUT_FILE),
            &serde_json::to_vec(&self.output.to_json())?,
        )?;
        write_atomic(&self.dir.join(TIME_FILE), self.time.to_string().as_bytes())?;
        write_atomic(&self.dir.join(DONE_MARKER), &[])?;
        self.done = true;
        Ok(())
    }
}

/// Runner side of the filesystem transport.
pub struct FilesystemRunnerInterface {
    path: PathBuf,
    registry: Arc<Registry>,
    slots: FnvHashMap<RunId, Arc<RunSlot>>,
}

impl FilesystemRunnerInterface {
    pub fn new(path: PathBuf, registry: Arc<Registry>) -> Result<Self> {
        fs::create_dir_all(&path)?;
        Ok(FilesystemRunnerInterface {
            path,
            registry,
            slots: FnvHashMap::default(),
        })
    }

    pub fn from_config(config: &InterfaceConfig, registry: Arc<Registry>) -> Result<Self> {
        FilesystemRunnerInterface::new(self::config(config)?.path.clone(), registry)
    }

    fn run_dir(&self, run_id: RunId) -> PathBuf {
        self.path.join(run_dir_name(run_id))
    }
}

impl RunnerInterface for FilesystemRunnerInterface {
    fn label(&self) -> &'static str {
        LABEL
    }

    fn prepare(&mut self, run_id: RunId) -> Result<()> {
        let slot = self.registry.claim(run_id)?;
        let dir = self.run_dir(run_id);
        if dir.exists() {
            fs::remove_dir_all(&dir)?;
        }
        fs::create_dir_all(&dir)?;
        let input = slot.input().to_json();
        write_atomic(&dir.join(INPUT_FILE), &serde_json::to_vec(&input)?)?;
        self.slots.insert(run_id, slot);
        Ok(())
    }

    fn poll_run(&mut self, run_id: RunId) -> Result<bool> {
        let slot = match self.slots.get(&run_id) {
            Some(s) => s,
            None => return self.registry.is_done(run_id),
        };
        if slot.is_done() {
            return Ok(true);
        }
        let dir = self.path.join(run_dir_name(run_id));
        if !dir.join(DONE_MARKER).exists() {
            return Ok(false);
        }
        let bytes = fs::read(dir.join(OUTPUT_FILE))?;
        let json: serde_json::Value = serde_json::from_slice(&bytes)
            .map_err(|e| Error::MalformedOutput(format!("run {}: {}", run_id, e)))?;
        let output = Row::from_json(self.registry.output_schema().clone(), &json)?;
        let time = fs::read_to_string(dir.join(TIME_FILE))
            .ok()
            .and_then(|t| t.trim().parse::<Float>().ok())
            .unwrap_or(0.);
        slot.output().copy_from(&output);
        slot.set_time(time);
        slot.mark_done();
        Ok(true)
    }

    fn worker_env(&self, _run_id: RunId) -> Vec<(String, String)> {
        vec![(ENV_PATH.to_string(), self.path.to_string_lossy().to_string())]
    }

    fn clean_run(&mut self, run_id: RunId) -> Result<()> {
        self.slots.remove(&run_id);
        let dir = self.run_dir(run_id);
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        Ok(())
    }

    fn clean(&mut self) -> Result<()> {
        self.slots.clear();
        if self.path.exists() {
            fs::remove_dir_all(&self.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::Field;
    use crate::var::{Var, VarType};

    fn schema(name: &str) -> Arc<Schema> {
        Arc::new(Schema::new(vec![Field {
            name: name.to_string(),
            vtype: VarType::Float,
            len: None,
        }]))
    }

    #[test]
    fn output_reaches_registry_after_done_marker() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::new(schema("u"), schema("f"), 1));
        let id = registry.allocate(1).start;
        let mut input = registry.input_schema().default_row();
        input.set("u", Var::Float(0.5)).unwrap();
        registry.set_input(id, input).unwrap();

        let mut runner_side = FilesystemRunnerInterface::new(dir.path().to_path_buf(), registry.clone()).unwrap();
        runner_side.prepare(id).unwrap();

        let mut worker_side = FilesystemInterface::new(dir.path(), id, schema("u"), schema("f"));
        assert!(worker_side.time().is_err());
        worker_side.connect().unwrap();
        let u = worker_side.input().unwrap().get_float("u").unwrap();
        worker_side
            .output()
            .unwrap()
            .set("f", Var::Float(u * 2.))
            .unwrap();
        worker_side.set_time(1.5).unwrap();
        assert!(!runner_side.poll_run(id).unwrap());

        worker_side.done().unwrap();
        worker_side.done().unwrap();
        assert!(runner_side.poll_run(id).unwrap());
        let output = registry.read_output(id).unwrap().unwrap();
        assert_eq!(output.get("f"), Some(&Var::Float(1.)));
        assert_eq!(registry.elapsed(id).unwrap().as_secs_f64(), 1.5);

        runner_side.clean_run(id).unwrap();
        assert!(!dir.path().join(run_dir_name(id)).exists());
    }

    #[test]
    fn malformed_output_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::new(schema("u"), schema("f"), 1));
        let id = registry.allocate(1).start;
        let mut runner_side = FilesystemRunnerInterface::new(dir.path().to_path_buf(), registry.clone()).unwrap();
        runner_side.prepare(id).unwrap();
        let run_dir = dir.path().join(run_dir_name(id));
        fs::write(run_dir.join(OUTPUT_FILE), b"{\"g\": 1}").unwrap();
        fs::write(run_dir.join(DONE_MARKER), b"").unwrap();
        match runner_side.poll_run(id) {
            Err(Error::MalformedOutput(_)) => (),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(registry.read_output(id).unwrap(), None);
    }
}
