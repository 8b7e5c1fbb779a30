//! This library implements the run orchestration layer of `campaign`.
//!
//! Programming interface is centered around the [`Runner`] trait, which
//! creates runs, bounds their concurrency, exchanges parameter and result
//! data with each run through a pluggable transport, detects failures and
//! supports cancellation and cleanup. Each run is executed by a [`Worker`]
//! going through a *pre* -> *execute* -> *post* lifecycle, talking to its
//! runner through an [`Interface`].
//!
//! On top of the runner sits the [`ActiveLearning`] loop, which seeds an
//! initial batch of runs, fits a [`Surrogate`] to the completed ones and
//! then keeps extending the run set with points picked by an acquisition
//! strategy, until the iteration budget is exhausted.
//!
//!
//! # Backends and transports
//!
//! Three execution backends are provided: `internal` (cooperative tasks on
//! a single-threaded scheduler, used for testing and for pure-function
//! simulations), `local` (bounded pool of worker subprocesses) and `slurm`
//! (one cluster job per run). Transports bridging the worker and the runner
//! are `internal` (aliasing the registry directly) and `filesystem`
//! (shared directory). A message-passing transport over TCP lives in
//! `campaign-net`.
//!
//! Variants are picked by name from the resolved configuration. The
//! mapping from names to constructors is held by [`Plugins`], populated
//! once at startup.
//!
//! # Example
//!
//! ```ignore
//! use campaign_core::{Config, Plugins};
//!
//! let plugins = Plugins::default();
//! let config = Config::from_dir(std::env::current_dir()?)?.resolve(&plugins)?;
//! let mut runner = plugins.runner(&config, Default::default())?;
//! let inputs = config.variables.sample_inputs(config.ntrain, config.seed)?;
//! runner.spawn_array(inputs, true)?;
//! ```
//!
//! [`Runner`]: runner/trait.Runner.html
//! [`Worker`]: worker/struct.Worker.html
//! [`Interface`]: interface/trait.Interface.html
//! [`ActiveLearning`]: active/struct.ActiveLearning.html
//! [`Surrogate`]: surrogate/trait.Surrogate.html
//! [`Plugins`]: plugins/struct.Plugins.html

#[macro_use]
extern crate serde;
#[macro_use]
extern crate log;

// reexports
pub use active::ActiveLearning;
pub use config::{Config, ResolvedConfig, WorkerConfig};
pub use error::{Error, Result};
pub use interface::{Interface, RunnerInterface};
pub use plugins::Plugins;
pub use registry::{Registry, RunFailure, RunStatus};
pub use row::{Row, Schema};
pub use runner::{CancelReport, Runner, RunnerContext};
pub use surrogate::Surrogate;
pub use var::{Var, VarType};
pub use worker::Worker;

pub mod active;
pub mod config;
pub mod error;
pub mod interface;
pub mod mock;
pub mod plugins;
pub mod registry;
pub mod row;
pub mod runner;
pub mod surrogate;
pub mod table;
pub mod var;
pub mod variable;
pub mod worker;

mod util;

pub const VERSION: &'static str = env!("CARGO_PKG_VERSION");

/// Default name of the configuration file within the base directory.
pub const CONFIG_FILE: &str = "campaign.toml";
/// Alternative configuration file name, requires the `yaml` feature.
pub const CONFIG_FILE_YAML: &str = "campaign.yaml";

/// Name of the directory holding internal state, relative to base directory.
pub const STATE_DIR_NAME: &str = ".campaign";
/// Name of the serialized worker configuration within the state directory.
pub const WORKER_CONFIG_FILE: &str = "worker.toml";
/// Name of the filesystem transport directory within the state directory.
pub const INTERFACE_DIR_NAME: &str = "interface";

/// Environment variable carrying the run id to a worker process.
pub const ENV_RUN_ID: &str = "CAMPAIGN_RUN_ID";
/// Environment variable carrying the path to the worker configuration.
pub const ENV_WORKER_CONFIG: &str = "CAMPAIGN_WORKER_CONFIG";

/// Process exit codes used by worker processes to report how they failed.
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const CONFIGURATION: i32 = 2;
    pub const STAGING: i32 = 3;
    pub const MALFORMED_OUTPUT: i32 = 4;
    pub const EXECUTION: i32 = 5;
}

/// Floating point number type used throughout the library.
pub type Float = f64;
/// Integer number type used throughout the library.
pub type Int = i64;

/// Run unique integer identifier type. Identifiers are handed out in
/// increasing order and never reused.
pub type RunId = u32;
/// Variable string identifier type.
pub type VarName = String;

/// Formats the directory name used for a single run, e.g. `run_007`.
pub fn run_dir_name(run_id: RunId) -> String {
    format!("run_{:03}", run_id)
}
