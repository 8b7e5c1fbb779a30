//! Configuration as written by the user and its resolved, typed form.
//!
//! Loading happens in two steps. [`Config`] mirrors the configuration
//! file and only checks its overall shape. Pluggable sections (runner,
//! interface, preprocessor, postprocessor, surrogate and acquisition
//! strategy) are kept as loosely typed [`PluginEntry`] values, either a
//! bare class name or a table with a `class` entry. [`Config::resolve`]
//! then checks every class against the [`Plugins`] registry, parses the
//! section into its typed form, rejecting unknown fields, and makes all
//! paths absolute.
//!
//! [`Config`]: struct.Config.html
//! [`PluginEntry`]: enum.PluginEntry.html
//! [`Config::resolve`]: struct.Config.html#method.resolve
//! [`Plugins`]: ../plugins/struct.Plugins.html

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use linked_hash_map::LinkedHashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};
use crate::plugins::{Plugins, Section};
use crate::row::Schema;
use crate::util;
use crate::variable::{VariableEntry, Variables};
use crate::{Float, RunId, CONFIG_FILE, CONFIG_FILE_YAML, STATE_DIR_NAME, WORKER_CONFIG_FILE};

pub const DEFAULT_NTRAIN: usize = 10;

/// Configuration as read from the configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Base directory, defaults to the directory holding the configuration
    /// file.
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    /// Number of runs in the initial batch.
    #[serde(default = "default_ntrain")]
    pub ntrain: usize,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub variables: LinkedHashMap<String, VariableEntry>,
    #[serde(default)]
    pub files: FilesConfig,
    #[serde(default, deserialize_with = "command_or_table")]
    pub run: RunEntry,
    #[serde(default)]
    pub fit: FitEntry,
    #[serde(default)]
    pub active_learning: ActiveLearningEntry,
}

fn default_ntrain() -> usize {
    DEFAULT_NTRAIN
}

impl Default for Config {
    fn default() -> Self {
        Config {
            base_dir: None,
            ntrain: DEFAULT_NTRAIN,
            seed: None,
            variables: LinkedHashMap::new(),
            files: FilesConfig::default(),
            run: RunEntry::default(),
            fit: FitEntry::default(),
            active_learning: ActiveLearningEntry::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilesConfig {
    pub input: PathBuf,
    pub output: PathBuf,
}

impl Default for FilesConfig {
    fn default() -> Self {
        FilesConfig {
            input: PathBuf::from("input.txt"),
            output: PathBuf::from("output.txt"),
        }
    }
}

/// Pluggable section: either a bare class name or a table holding a
/// `class` entry next to the class-specific parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PluginEntry {
    Class(String),
    Table(serde_json::Map<String, serde_json::Value>),
}

impl PluginEntry {
    pub fn class(&self) -> Option<&str> {
        match self {
            PluginEntry::Class(c) => Some(c),
            PluginEntry::Table(t) => t.get("class").and_then(|c| c.as_str()),
        }
    }

    fn into_value(self) -> serde_json::Value {
        match self {
            PluginEntry::Class(c) => serde_json::json!({ "class": c }),
            PluginEntry::Table(t) => serde_json::Value::Object(t),
        }
    }
}

impl From<&str> for PluginEntry {
    fn from(class: &str) -> Self {
        PluginEntry::Class(class.to_string())
    }
}

/// The `run` section. Can also be given as a single string, in which case
/// it's the command to execute and everything else is left at defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RunEntry {
    pub runner: Option<PluginEntry>,
    pub interface: Option<PluginEntry>,
    pub pre: Option<PluginEntry>,
    pub post: Option<PluginEntry>,
    /// Command line of the simulation.
    pub command: Option<String>,
    pub stdout: String,
    pub stderr: Option<String>,
    /// Remove run directories and transport state after the batch.
    pub clean: bool,
    pub log_path: PathBuf,
    /// Directory holding the `run_XXX` working directories.
    pub run_dir: PathBuf,
}

impl Default for RunEntry {
    fn default() -> Self {
        RunEntry {
            runner: None,
            interface: None,
            pre: None,
            post: None,
            command: None,
            stdout: "stdout".to_string(),
            stderr: Some("stderr".to_string()),
            clean: true,
            log_path: PathBuf::from("log"),
            run_dir: PathBuf::from("."),
        }
    }
}

fn command_or_table<'de, D>(deserializer: D) -> std::result::Result<RunEntry, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error as _;
    let value = serde_json::Value::deserialize(deserializer)?;
    match value {
        serde_json::Value::String(command) => Ok(RunEntry {
            command: Some(command),
            ..RunEntry::default()
        }),
        other => serde_json::from_value(other).map_err(D::Error::custom),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FitEntry {
    pub surrogate: Option<PluginEntry>,
    pub save: Option<PathBuf>,
    pub load: Option<PathBuf>,
}

impl Default for FitEntry {
    fn default() -> Self {
        FitEntry {
            surrogate: None,
            save: Some(PathBuf::from("model.bin")),
            load: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActiveLearningEntry {
    /// Defaults to whether any `ActiveLearning` variable is declared.
    pub enabled: Option<bool>,
    pub iterations: usize,
    pub batch_size: usize,
    /// Candidate grid points per active learning dimension.
    pub resolution: usize,
    /// Persist the final surrogate to `fit.save`.
    pub save: bool,
    pub acquisition: Option<PluginEntry>,
}

impl Default for ActiveLearningEntry {
    fn default() -> Self {
        ActiveLearningEntry {
            enabled: None,
            iterations: 10,
            batch_size: 1,
            resolution: 20,
            save: false,
            acquisition: None,
        }
    }
}

/// Concurrency limit, either a number or `all` for the number of
/// available cpus.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Parallel {
    All,
    Count(usize),
}

impl Parallel {
    pub fn count(&self) -> usize {
        match self {
            Parallel::All => available_cpus(),
            Parallel::Count(n) => (*n).max(1),
        }
    }
}

impl Default for Parallel {
    fn default() -> Self {
        Parallel::All
    }
}

impl fmt::Display for Parallel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Parallel::All => write!(f, "all"),
            Parallel::Count(n) => write!(f, "{}", n),
        }
    }
}

impl Serialize for Parallel {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Parallel::All => serializer.serialize_str("all"),
            Parallel::Count(n) => serializer.serialize_u64(*n as u64),
        }
    }
}

impl<'de> Deserialize<'de> for Parallel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        use serde::de::Error as _;
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Count(usize),
            Word(String),
        }
        match Repr::deserialize(deserializer)? {
            Repr::Count(n) => Ok(Parallel::Count(n)),
            Repr::Word(w) if w == "all" => Ok(Parallel::All),
            Repr::Word(w) => Err(D::Error::custom(format!(
                "expected a number or \"all\", got \"{}\"",
                w
            ))),
        }
    }
}

pub fn available_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum RunnerConfig {
    Internal(InternalRunnerConfig),
    Local(LocalRunnerConfig),
    Slurm(SlurmRunnerConfig),
}

impl RunnerConfig {
    pub fn class(&self) -> &'static str {
        match self {
            RunnerConfig::Internal(_) => "internal",
            RunnerConfig::Local(_) => "local",
            RunnerConfig::Slurm(_) => "slurm",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InternalRunnerConfig {
    /// Unbounded when not set.
    pub parallel: Option<usize>,
}

impl Default for InternalRunnerConfig {
    fn default() -> Self {
        InternalRunnerConfig { parallel: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocalRunnerConfig {
    pub parallel: Parallel,
    /// Seconds between polls.
    pub sleep: Float,
    /// Wall clock limit per run in seconds.
    pub timeout: Option<Float>,
    /// Command starting a worker process, defaults to the running
    /// executable with the `worker` argument.
    pub worker_command: Option<String>,
}

impl Default for LocalRunnerConfig {
    fn default() -> Self {
        LocalRunnerConfig {
            parallel: Parallel::All,
            sleep: 0.05,
            timeout: None,
            worker_command: None,
        }
    }
}

/// Scalar value of a scheduler option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OptionValue {
    Bool(bool),
    Int(i64),
    Float(Float),
    Str(String),
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Bool(v) => write!(f, "{}", v),
            OptionValue::Int(v) => write!(f, "{}", v),
            OptionValue::Float(v) => write!(f, "{}", v),
            OptionValue::Str(v) => write!(f, "{}", v),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SlurmRunnerConfig {
    /// Maximum number of jobs in the scheduler at once, unbounded when not
    /// set.
    pub parallel: Option<usize>,
    /// Seconds between transport polls.
    pub sleep: Float,
    /// Seconds between scheduler polls.
    pub poll: Float,
    /// Batch script location.
    pub path: PathBuf,
    /// Use an existing batch script at `path` instead of generating one.
    pub custom: bool,
    pub prefix: Option<String>,
    #[serde(alias = "OpenMP")]
    pub openmp: bool,
    pub cpus: Parallel,
    /// Long options passed to the scheduler, e.g. `time` or `account`.
    pub options: LinkedHashMap<String, OptionValue>,
    pub sbatch: String,
    pub squeue: String,
    pub scancel: String,
    pub worker_command: Option<String>,
}

impl Default for SlurmRunnerConfig {
    fn default() -> Self {
        let mut options = LinkedHashMap::new();
        options.insert(
            "job-name".to_string(),
            OptionValue::Str("campaign".to_string()),
        );
        SlurmRunnerConfig {
            parallel: None,
            sleep: 0.1,
            poll: 60.,
            path: PathBuf::from("slurm.bash"),
            custom: false,
            prefix: Some("srun".to_string()),
            openmp: false,
            cpus: Parallel::Count(1),
            options,
            sbatch: "sbatch".to_string(),
            squeue: "squeue".to_string(),
            scancel: "scancel".to_string(),
            worker_command: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum InterfaceConfig {
    Internal,
    Filesystem(FilesystemInterfaceConfig),
    Tcp(TcpInterfaceConfig),
}

impl InterfaceConfig {
    pub fn class(&self) -> &'static str {
        match self {
            InterfaceConfig::Internal => "internal",
            InterfaceConfig::Filesystem(_) => "filesystem",
            InterfaceConfig::Tcp(_) => "tcp",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FilesystemInterfaceConfig {
    /// Directory shared between runner and workers.
    pub path: PathBuf,
}

impl Default for FilesystemInterfaceConfig {
    fn default() -> Self {
        FilesystemInterfaceConfig {
            path: PathBuf::from(STATE_DIR_NAME).join(crate::INTERFACE_DIR_NAME),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TcpInterfaceConfig {
    /// Address the runner binds to.
    pub address: String,
    /// Port the runner binds to, any free port when zero.
    pub port: u16,
    /// Address workers connect to, defaults to the bound address.
    pub connect: Option<String>,
    /// Read timeout in milliseconds.
    pub timeout: u64,
    pub retries: u32,
    /// Seconds between connection retries.
    #[serde(alias = "retry-sleep")]
    pub retry_sleep: Float,
}

impl Default for TcpInterfaceConfig {
    fn default() -> Self {
        TcpInterfaceConfig {
            address: "127.0.0.1".to_string(),
            port: 0,
            connect: None,
            timeout: 2500,
            retries: 3,
            retry_sleep: 1.,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum PreConfig {
    None,
    Template(TemplatePreConfig),
}

impl PreConfig {
    pub fn class(&self) -> &'static str {
        match self {
            PreConfig::None => "none",
            PreConfig::Template(_) => "template",
        }
    }
}

/// Either a single name or a list of names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Names {
    One(String),
    Many(Vec<String>),
}

impl Names {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Names::One(s) => s.split_whitespace().map(|s| s.to_string()).collect(),
            Names::Many(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TemplatePreConfig {
    /// Template directory to copy from.
    pub path: PathBuf,
    /// Files within the template holding placeholders, all files if not
    /// set.
    pub param_files: Option<Names>,
    /// Fail on placeholders without a matching input.
    pub strict: bool,
    /// Replace an existing run directory.
    pub overwrite: bool,
}

impl Default for TemplatePreConfig {
    fn default() -> Self {
        TemplatePreConfig {
            path: PathBuf::from("template"),
            param_files: None,
            strict: false,
            overwrite: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum PostConfig {
    None,
    Json(JsonPostConfig),
    Numpytxt(NumpytxtPostConfig),
}

impl PostConfig {
    pub fn class(&self) -> &'static str {
        match self {
            PostConfig::None => "none",
            PostConfig::Json(_) => "json",
            PostConfig::Numpytxt(_) => "numpytxt",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JsonPostConfig {
    /// File to read, relative to the run directory.
    pub path: PathBuf,
}

impl Default for JsonPostConfig {
    fn default() -> Self {
        JsonPostConfig {
            path: PathBuf::from("stdout"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NumpytxtPostConfig {
    pub path: PathBuf,
    /// Column order, `all` or unset for all outputs in declaration order.
    pub names: Option<Names>,
}

impl Default for NumpytxtPostConfig {
    fn default() -> Self {
        NumpytxtPostConfig {
            path: PathBuf::from("stdout"),
            names: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum SurrogateConfig {
    Idw(IdwConfig),
}

impl SurrogateConfig {
    pub fn class(&self) -> &'static str {
        match self {
            SurrogateConfig::Idw(_) => "idw",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdwConfig {
    pub power: Float,
    /// Distance at which the uncertainty approaches the output variance,
    /// relative to the normalized input domain.
    pub length_scale: Float,
}

impl Default for IdwConfig {
    fn default() -> Self {
        IdwConfig {
            power: 2.,
            length_scale: 0.2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum AcquisitionConfig {
    SimpleExploration,
    ExplorationWithDistancePenalty {
        #[serde(default = "default_penalty")]
        c: Float,
    },
    WeightedExploration {
        #[serde(default = "default_weight")]
        weight: Float,
    },
    ProbabilityOfImprovement {
        #[serde(default = "default_xi")]
        xi: Float,
    },
    ExpectedImprovement {
        #[serde(default = "default_xi")]
        xi: Float,
    },
    #[serde(rename = "expected_improvement_2")]
    ExpectedImprovement2 {
        #[serde(default = "default_xi")]
        xi: Float,
        #[serde(default = "default_exploration_factor")]
        exploration_factor: Float,
    },
    AlternatingExploration {
        #[serde(default = "default_period")]
        period: usize,
    },
}

fn default_penalty() -> Float {
    1.
}
fn default_weight() -> Float {
    0.5
}
fn default_xi() -> Float {
    0.01
}
fn default_exploration_factor() -> Float {
    0.5
}
fn default_period() -> usize {
    2
}

impl AcquisitionConfig {
    pub fn class(&self) -> &'static str {
        match self {
            AcquisitionConfig::SimpleExploration => "simple_exploration",
            AcquisitionConfig::ExplorationWithDistancePenalty { .. } => {
                "exploration_with_distance_penalty"
            }
            AcquisitionConfig::WeightedExploration { .. } => "weighted_exploration",
            AcquisitionConfig::ProbabilityOfImprovement { .. } => "probability_of_improvement",
            AcquisitionConfig::ExpectedImprovement { .. } => "expected_improvement",
            AcquisitionConfig::ExpectedImprovement2 { .. } => "expected_improvement_2",
            AcquisitionConfig::AlternatingExploration { .. } => "alternating_exploration",
        }
    }
}

/// Run related part of the resolved configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub runner: RunnerConfig,
    pub interface: InterfaceConfig,
    pub pre: PreConfig,
    pub post: PostConfig,
    pub command: Option<String>,
    pub stdout: String,
    pub stderr: Option<String>,
    pub clean: bool,
    pub log_path: PathBuf,
    pub run_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitConfig {
    pub surrogate: SurrogateConfig,
    pub save: Option<PathBuf>,
    pub load: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveLearningConfig {
    pub iterations: usize,
    pub batch_size: usize,
    pub resolution: usize,
    pub save: bool,
    pub acquisition: AcquisitionConfig,
}

/// Fully validated configuration with absolute paths.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConfig {
    pub base_dir: PathBuf,
    pub ntrain: usize,
    pub seed: Option<u64>,
    pub variables: Variables,
    pub files: FilesConfig,
    pub run: RunConfig,
    pub fit: FitConfig,
    /// Present only when active learning is enabled.
    pub active_learning: Option<ActiveLearningConfig>,
}

impl Config {
    /// Reads the configuration file from the given directory, trying the
    /// toml file first.
    pub fn from_dir(dir: impl AsRef<Path>) -> Result<Config> {
        let dir = dir.as_ref();
        let toml_path = dir.join(CONFIG_FILE);
        if toml_path.is_file() {
            return Config::from_path(&toml_path);
        }
        let yaml_path = dir.join(CONFIG_FILE_YAML);
        if yaml_path.is_file() {
            return Config::from_path(&yaml_path);
        }
        Err(Error::InvalidConfiguration(format!(
            "no {} found in {}",
            CONFIG_FILE,
            dir.display()
        )))
    }

    /// Reads the configuration file at the given path. A relative or
    /// missing base directory is taken relative to the file's directory.
    pub fn from_path(path: &Path) -> Result<Config> {
        debug!("reading configuration from {}", path.display());
        let mut config: Config = util::deser_struct_from_path(path)?;
        let file_dir = path
            .canonicalize()?
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_default();
        config.base_dir = Some(match config.base_dir.take() {
            Some(base) => util::absolute(&file_dir, &base),
            None => file_dir,
        });
        Ok(config)
    }

    pub fn from_str_toml(s: &str) -> Result<Config> {
        Ok(toml::from_str(s)?)
    }

    /// Validates the configuration against the registered plugins.
    pub fn resolve(self, plugins: &Plugins) -> Result<ResolvedConfig> {
        let base_dir = match &self.base_dir {
            Some(b) => b.clone(),
            None => std::env::current_dir()?,
        };
        let abs = |p: &Path| util::absolute(&base_dir, p);

        let variables = Variables::from_entries(&self.variables)?;

        let run = self.run;
        let mut runner: RunnerConfig = parse_section(
            plugins,
            Section::Runner,
            run.runner.unwrap_or_else(|| "local".into()),
        )?;
        let default_interface = match runner {
            RunnerConfig::Internal(_) => "internal",
            _ => "filesystem",
        };
        let mut interface: InterfaceConfig = parse_section(
            plugins,
            Section::Interface,
            run.interface.unwrap_or_else(|| default_interface.into()),
        )?;
        let mut pre: PreConfig = parse_section(
            plugins,
            Section::Pre,
            run.pre.unwrap_or_else(|| "template".into()),
        )?;
        let mut post: PostConfig = parse_section(
            plugins,
            Section::Post,
            run.post.unwrap_or_else(|| "json".into()),
        )?;

        match &mut runner {
            RunnerConfig::Local(local) => {
                local.parallel = Parallel::Count(local.parallel.count());
            }
            RunnerConfig::Slurm(slurm) => {
                slurm.path = abs(&slurm.path);
                if let Parallel::Count(0) = slurm.cpus {
                    return Err(Error::InvalidConfiguration(
                        "slurm cpus must be a positive integer or \"all\"".to_string(),
                    ));
                }
            }
            RunnerConfig::Internal(_) => (),
        }
        match (&runner, &interface) {
            (RunnerConfig::Internal(_), InterfaceConfig::Internal) => (),
            (RunnerConfig::Internal(_), _) | (_, InterfaceConfig::Internal) => {
                return Err(Error::InvalidConfiguration(format!(
                    "the {} interface can't be used with the {} runner",
                    interface.class(),
                    runner.class()
                )))
            }
            _ => (),
        }
        match &mut interface {
            InterfaceConfig::Filesystem(fs) => fs.path = abs(&fs.path),
            InterfaceConfig::Tcp(tcp) if tcp.timeout == 0 => {
                return Err(Error::InvalidConfiguration(
                    "tcp timeout must be a positive number of milliseconds".to_string(),
                ))
            }
            _ => (),
        }
        if let PreConfig::Template(template) = &mut pre {
            template.path = abs(&template.path);
        }
        if let PostConfig::Numpytxt(numpytxt) = &mut post {
            if let Some(Names::One(s)) = &numpytxt.names {
                if s == "all" {
                    numpytxt.names = None;
                }
            }
            if let Some(names) = &numpytxt.names {
                for name in names.to_vec() {
                    if !variables.outputs().any(|v| v.name == name) {
                        return Err(Error::InvalidConfiguration(format!(
                            "numpytxt postprocessor names unknown output {}",
                            name
                        )));
                    }
                }
            }
        }

        let surrogate: SurrogateConfig = parse_section(
            plugins,
            Section::Surrogate,
            self.fit.surrogate.unwrap_or_else(|| "idw".into()),
        )?;
        let fit = FitConfig {
            surrogate,
            save: self.fit.save.map(|p| abs(&p)),
            load: self.fit.load.map(|p| abs(&p)),
        };

        let al = self.active_learning;
        let enabled = al.enabled.unwrap_or_else(|| variables.has_active());
        let active_learning = if enabled {
            if !variables.has_active() {
                return Err(Error::InvalidConfiguration(
                    "active learning is enabled but no ActiveLearning variable is declared"
                        .to_string(),
                ));
            }
            if al.batch_size == 0 || al.resolution == 0 {
                return Err(Error::InvalidConfiguration(
                    "active learning batch_size and resolution must be positive".to_string(),
                ));
            }
            let acquisition: AcquisitionConfig = parse_section(
                plugins,
                Section::Acquisition,
                al.acquisition
                    .unwrap_or_else(|| "simple_exploration".into()),
            )?;
            Some(ActiveLearningConfig {
                iterations: al.iterations,
                batch_size: al.batch_size,
                resolution: al.resolution,
                save: al.save,
                acquisition,
            })
        } else {
            None
        };

        if variables.outputs().next().is_none() {
            warn!("no output variables declared");
        }

        Ok(ResolvedConfig {
            ntrain: self.ntrain,
            seed: self.seed,
            variables,
            files: FilesConfig {
                input: abs(&self.files.input),
                output: abs(&self.files.output),
            },
            run: RunConfig {
                runner,
                interface,
                pre,
                post,
                command: run.command,
                stdout: run.stdout,
                stderr: run.stderr,
                clean: run.clean,
                log_path: abs(&run.log_path),
                run_dir: abs(&run.run_dir),
            },
            fit,
            active_learning,
            base_dir,
        })
    }
}

/// Checks the section's class against the registry and parses it into
/// its typed form.
fn parse_section<T: DeserializeOwned>(
    plugins: &Plugins,
    section: Section,
    entry: PluginEntry,
) -> Result<T> {
    let class = entry
        .class()
        .ok_or_else(|| {
            Error::InvalidConfiguration(format!("{} section is missing a class", section))
        })?
        .to_string();
    plugins.check(section, &class)?;
    serde_json::from_value(entry.into_value()).map_err(|e| {
        Error::InvalidConfiguration(format!("{} `{}`: {}", section, class, e))
    })
}

impl ResolvedConfig {
    /// Resolves the configuration found in the given directory.
    pub fn from_dir(dir: impl AsRef<Path>, plugins: &Plugins) -> Result<ResolvedConfig> {
        Config::from_dir(dir)?.resolve(plugins)
    }

    pub fn state_dir(&self) -> PathBuf {
        self.base_dir.join(STATE_DIR_NAME)
    }

    pub fn input_schema(&self) -> Arc<Schema> {
        Arc::new(self.variables.input_schema())
    }

    pub fn output_schema(&self) -> Arc<Schema> {
        Arc::new(self.variables.output_schema())
    }

    /// Number of runs the registry is pre-sized for.
    pub fn expected_runs(&self) -> usize {
        self.ntrain
            + self
                .active_learning
                .as_ref()
                .map(|al| al.iterations * al.batch_size)
                .unwrap_or(0)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            base_dir: self.base_dir.clone(),
            run_dir: self.run.run_dir.clone(),
            command: self.run.command.clone(),
            stdout: self.run.stdout.clone(),
            stderr: self.run.stderr.clone(),
            interface: self.run.interface.clone(),
            pre: self.run.pre.clone(),
            post: self.run.post.clone(),
            input: self.variables.input_schema(),
            output: self.variables.output_schema(),
        }
    }

    /// Writes the worker configuration into the state directory and
    /// returns its path.
    pub fn write_worker_config(&self) -> Result<PathBuf> {
        let dir = self.state_dir();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(WORKER_CONFIG_FILE);
        self.worker_config().save(&path)?;
        Ok(path)
    }
}

/// Run-level subset of the configuration needed by a worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkerConfig {
    pub base_dir: PathBuf,
    pub run_dir: PathBuf,
    pub command: Option<String>,
    pub stdout: String,
    pub stderr: Option<String>,
    pub interface: InterfaceConfig,
    pub pre: PreConfig,
    pub post: PostConfig,
    pub input: Schema,
    pub output: Schema,
}

impl WorkerConfig {
    pub fn save(&self, path: &Path) -> Result<()> {
        let value = toml::Value::try_from(self)?;
        std::fs::write(path, toml::to_string(&value)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<WorkerConfig> {
        util::deser_struct_from_path(path)
    }

    /// Locates the worker configuration through the environment.
    pub fn from_env() -> Result<(RunId, WorkerConfig)> {
        let run_id = std::env::var(crate::ENV_RUN_ID)
            .map_err(|_| Error::InvalidConfiguration(format!("{} not set", crate::ENV_RUN_ID)))?
            .parse::<RunId>()?;
        let path = std::env::var(crate::ENV_WORKER_CONFIG).map_err(|_| {
            Error::InvalidConfiguration(format!("{} not set", crate::ENV_WORKER_CONFIG))
        })?;
        Ok((run_id, WorkerConfig::load(Path::new(&path))?))
    }

    pub fn input_schema(&self) -> Arc<Schema> {
        Arc::new(self.input.clone())
    }

    pub fn output_schema(&self) -> Arc<Schema> {
        Arc::new(self.output.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
        ntrain = 4
        seed = 3

        [variables]
        u = "Uniform(4.7, 5.3)"
        v = { kind = "Uniform", range = [0.555, 0.6] }
        c = 2
        f = "Output"

        [run]
        command = "python3 ../simulation.py"

        [run.runner]
        class = "local"
        parallel = 2

        [run.post]
        class = "numpytxt"
        names = "f"
    "#;

    #[test]
    fn resolve_fills_defaults_and_absolute_paths() {
        let mut config = Config::from_str_toml(CONFIG).unwrap();
        config.base_dir = Some(PathBuf::from("/tmp/study"));
        let resolved = config.resolve(&Plugins::default()).unwrap();
        assert_eq!(resolved.ntrain, 4);
        assert_eq!(
            resolved.run.runner,
            RunnerConfig::Local(LocalRunnerConfig {
                parallel: Parallel::Count(2),
                ..Default::default()
            })
        );
        assert_eq!(resolved.run.interface.class(), "filesystem");
        match &resolved.run.pre {
            PreConfig::Template(t) => assert_eq!(t.path, PathBuf::from("/tmp/study/template")),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(resolved.files.input, PathBuf::from("/tmp/study/input.txt"));
        assert!(resolved.active_learning.is_none());
        assert_eq!(resolved.expected_runs(), 4);
    }

    #[test]
    fn resolution_is_deterministic() {
        let mut config = Config::from_str_toml(CONFIG).unwrap();
        config.base_dir = Some(PathBuf::from("/tmp/study"));
        let first = config.clone().resolve(&Plugins::default()).unwrap();
        let second = config.resolve(&Plugins::default()).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            first.files,
            FilesConfig {
                input: PathBuf::from("/tmp/study/input.txt"),
                output: PathBuf::from("/tmp/study/output.txt"),
            }
        );
    }

    #[test]
    fn run_can_be_a_bare_command() {
        let config = Config::from_str_toml("run = \"./simulate --fast\"").unwrap();
        assert_eq!(config.run.command.as_deref(), Some("./simulate --fast"));
        assert_eq!(config.run.stdout, "stdout");
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(Config::from_str_toml("ntrian = 3").is_err());

        let mut config =
            Config::from_str_toml("[run.runner]\nclass = \"local\"\nparalel = 2").unwrap();
        config.base_dir = Some(PathBuf::from("/tmp"));
        match config.resolve(&Plugins::default()) {
            Err(Error::InvalidConfiguration(msg)) => assert!(msg.contains("paralel")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn unknown_class_is_invalid_configuration() {
        let mut config = Config::from_str_toml("[run]\nrunner = \"lokal\"").unwrap();
        config.base_dir = Some(PathBuf::from("/tmp"));
        match config.resolve(&Plugins::default()) {
            Err(Error::InvalidConfiguration(msg)) => assert!(msg.contains("local")),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn active_learning_follows_variables() {
        let mut config = Config::from_str_toml(
            "[variables]\nx = \"ActiveLearning(0, 1)\"\nf = \"Output\"\n\
             [active_learning]\niterations = 3\nbatch_size = 2\n\
             [active_learning.acquisition]\nclass = \"expected_improvement\"\nxi = 0.1",
        )
        .unwrap();
        config.base_dir = Some(PathBuf::from("/tmp"));
        let resolved = config.resolve(&Plugins::default()).unwrap();
        let al = resolved.active_learning.clone().unwrap();
        assert_eq!(
            al.acquisition,
            AcquisitionConfig::ExpectedImprovement { xi: 0.1 }
        );
        assert_eq!(resolved.expected_runs(), 10 + 6);

        let mut config = Config::from_str_toml(
            "[variables]\nx = \"Uniform(0, 1)\"\n[active_learning]\nenabled = true",
        )
        .unwrap();
        config.base_dir = Some(PathBuf::from("/tmp"));
        assert!(config.resolve(&Plugins::default()).is_err());
    }

    #[test]
    fn worker_config_survives_toml() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::from_str_toml(CONFIG).unwrap();
        config.base_dir = Some(dir.path().to_path_buf());
        let resolved = config.resolve(&Plugins::default()).unwrap();
        let path = resolved.write_worker_config().unwrap();
        let loaded = WorkerConfig::load(&path).unwrap();
        assert_eq!(loaded, resolved.worker_config());
    }
}
