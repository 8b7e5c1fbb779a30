//! Startup-time registry of pluggable variants.
//!
//! Every pluggable section of the configuration names its variant by a
//! class string. [`Plugins`] maps those strings to constructors and is
//! populated once when the program starts, with the variants of this crate
//! registered by default. Other crates add theirs with the `register_*`
//! methods, e.g. the message-passing transport of `campaign-net`.
//!
//! [`Plugins`]: struct.Plugins.html

use std::fmt;
use std::sync::Arc;

use fnv::FnvHashMap;

use crate::active::acquisition::{self, Acquisition};
use crate::config::{AcquisitionConfig, ResolvedConfig, SurrogateConfig, WorkerConfig};
use crate::error::{Error, Result};
use crate::interface::filesystem::{FilesystemInterface, FilesystemRunnerInterface};
use crate::interface::internal::InternalRunnerInterface;
use crate::interface::{Interface, RunnerInterface};
use crate::registry::Registry;
use crate::runner::{self, Runner, RunnerContext};
use crate::surrogate::{self, Surrogate};
use crate::util;
use crate::worker::{post, pre, Postprocessor, Preprocessor};
use crate::RunId;

/// Configuration sections holding pluggable variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Runner,
    Interface,
    Pre,
    Post,
    Surrogate,
    Acquisition,
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Section::Runner => "runner",
            Section::Interface => "interface",
            Section::Pre => "preprocessor",
            Section::Post => "postprocessor",
            Section::Surrogate => "surrogate",
            Section::Acquisition => "acquisition function",
        };
        write!(f, "{}", s)
    }
}

pub type RunnerCtor = fn(&ResolvedConfig, &Plugins, RunnerContext) -> Result<Box<dyn Runner>>;
pub type RunnerInterfaceCtor = fn(&ResolvedConfig, Arc<Registry>) -> Result<Box<dyn RunnerInterface>>;
pub type InterfaceCtor = fn(&WorkerConfig, RunId) -> Result<Box<dyn Interface>>;
pub type PreCtor = fn(&ResolvedConfig) -> Result<Arc<dyn Preprocessor>>;
pub type PostCtor = fn(&ResolvedConfig) -> Result<Arc<dyn Postprocessor>>;
pub type SurrogateCtor = fn(&SurrogateConfig) -> Result<Box<dyn Surrogate>>;
pub type AcquisitionCtor = fn(&AcquisitionConfig) -> Result<Box<dyn Acquisition>>;

/// Both ends of a transport.
#[derive(Clone, Copy)]
pub struct TransportPlugin {
    pub runner: RunnerInterfaceCtor,
    /// Missing for transports that only work within a single process.
    pub worker: Option<InterfaceCtor>,
}

/// Mapping from class names to constructors.
#[derive(Clone)]
pub struct Plugins {
    runners: FnvHashMap<String, RunnerCtor>,
    interfaces: FnvHashMap<String, TransportPlugin>,
    pre: FnvHashMap<String, PreCtor>,
    post: FnvHashMap<String, PostCtor>,
    surrogates: FnvHashMap<String, SurrogateCtor>,
    acquisitions: FnvHashMap<String, AcquisitionCtor>,
}

impl Default for Plugins {
    /// Registry with all variants provided by this crate.
    fn default() -> Self {
        let mut plugins = Plugins::empty();
        plugins.register_runner("internal", runner::internal::new_boxed);
        plugins.register_runner("local", runner::local::new_boxed);
        plugins.register_runner("slurm", runner::slurm::new_boxed);

        plugins.register_interface(
            "internal",
            TransportPlugin {
                runner: |_, registry| Ok(Box::new(InternalRunnerInterface::new(registry))),
                worker: None,
            },
        );
        plugins.register_interface(
            "filesystem",
            TransportPlugin {
                runner: |config, registry| {
                    Ok(Box::new(FilesystemRunnerInterface::from_config(
                        &config.run.interface,
                        registry,
                    )?))
                },
                worker: Some(|config, run_id| {
                    Ok(Box::new(FilesystemInterface::from_worker_config(
                        config, run_id,
                    )?))
                }),
            },
        );

        plugins.register_pre("none", |config| Ok(Arc::from(pre::from_config(&config.run.pre))));
        plugins.register_pre("template", |config| {
            Ok(Arc::from(pre::from_config(&config.run.pre)))
        });
        for name in &["none", "json", "numpytxt"] {
            plugins.register_post(name, |config| {
                Ok(Arc::from(post::from_config(&config.run.post)))
            });
        }

        plugins.register_surrogate("idw", surrogate::from_config);

        for name in acquisition::NAMES {
            plugins.register_acquisition(name, acquisition::from_config);
        }
        plugins
    }
}

impl Plugins {
    /// Registry without any variants.
    pub fn empty() -> Self {
        Plugins {
            runners: FnvHashMap::default(),
            interfaces: FnvHashMap::default(),
            pre: FnvHashMap::default(),
            post: FnvHashMap::default(),
            surrogates: FnvHashMap::default(),
            acquisitions: FnvHashMap::default(),
        }
    }

    pub fn register_runner(&mut self, class: &str, ctor: RunnerCtor) {
        self.runners.insert(class.to_string(), ctor);
    }

    pub fn register_interface(&mut self, class: &str, transport: TransportPlugin) {
        self.interfaces.insert(class.to_string(), transport);
    }

    pub fn register_pre(&mut self, class: &str, ctor: PreCtor) {
        self.pre.insert(class.to_string(), ctor);
    }

    pub fn register_post(&mut self, class: &str, ctor: PostCtor) {
        self.post.insert(class.to_string(), ctor);
    }

    pub fn register_surrogate(&mut self, class: &str, ctor: SurrogateCtor) {
        self.surrogates.insert(class.to_string(), ctor);
    }

    pub fn register_acquisition(&mut self, class: &str, ctor: AcquisitionCtor) {
        self.acquisitions.insert(class.to_string(), ctor);
    }

    /// Registered class names of a section, sorted.
    pub fn names(&self, section: Section) -> Vec<&str> {
        let mut names: Vec<&str> = match section {
            Section::Runner => self.runners.keys().map(|k| k.as_str()).collect(),
            Section::Interface => self.interfaces.keys().map(|k| k.as_str()).collect(),
            Section::Pre => self.pre.keys().map(|k| k.as_str()).collect(),
            Section::Post => self.post.keys().map(|k| k.as_str()).collect(),
            Section::Surrogate => self.surrogates.keys().map(|k| k.as_str()).collect(),
            Section::Acquisition => self.acquisitions.keys().map(|k| k.as_str()).collect(),
        };
        names.sort_unstable();
        names
    }

    /// Fails with `InvalidConfiguration` if no variant is registered under
    /// the given class.
    pub fn check(&self, section: Section, class: &str) -> Result<()> {
        let names = self.names(section);
        if names.contains(&class) {
            return Ok(());
        }
        let hint = match util::get_similar(class, &names) {
            Some(similar) => format!(", did you mean `{}`?", similar),
            None => format!(", available: {}", names.join(", ")),
        };
        Err(Error::InvalidConfiguration(format!(
            "unknown {} class `{}`{}",
            section, class, hint
        )))
    }

    fn missing(section: Section, class: &str) -> Error {
        Error::InvalidConfiguration(format!("no {} registered as `{}`", section, class))
    }

    pub fn runner(&self, config: &ResolvedConfig, context: RunnerContext) -> Result<Box<dyn Runner>> {
        let class = config.run.runner.class();
        let ctor = self
            .runners
            .get(class)
            .ok_or_else(|| Plugins::missing(Section::Runner, class))?;
        ctor(config, self, context)
    }

    pub fn runner_interface(
        &self,
        config: &ResolvedConfig,
        registry: Arc<Registry>,
    ) -> Result<Box<dyn RunnerInterface>> {
        let class = config.run.interface.class();
        let transport = self
            .interfaces
            .get(class)
            .ok_or_else(|| Plugins::missing(Section::Interface, class))?;
        (transport.runner)(config, registry)
    }

    pub fn worker_interface(&self, config: &WorkerConfig, run_id: RunId) -> Result<Box<dyn Interface>> {
        let class = config.interface.class();
        let ctor = self
            .interfaces
            .get(class)
            .ok_or_else(|| Plugins::missing(Section::Interface, class))?
            .worker
            .ok_or_else(|| {
                Error::InvalidConfiguration(format!(
                    "the {} interface can't be used from a worker process",
                    class
                ))
            })?;
        ctor(config, run_id)
    }

    pub fn preprocessor(&self, config: &ResolvedConfig) -> Result<Arc<dyn Preprocessor>> {
        let class = config.run.pre.class();
        let ctor = self
            .pre
            .get(class)
            .ok_or_else(|| Plugins::missing(Section::Pre, class))?;
        ctor(config)
    }

    pub fn postprocessor(&self, config: &ResolvedConfig) -> Result<Arc<dyn Postprocessor>> {
        let class = config.run.post.class();
        let ctor = self
            .post
            .get(class)
            .ok_or_else(|| Plugins::missing(Section::Post, class))?;
        ctor(config)
    }

    pub fn surrogate(&self, config: &SurrogateConfig) -> Result<Box<dyn Surrogate>> {
        let class = config.class();
        let ctor = self
            .surrogates
            .get(class)
            .ok_or_else(|| Plugins::missing(Section::Surrogate, class))?;
        ctor(config)
    }

    pub fn acquisition(&self, config: &AcquisitionConfig) -> Result<Box<dyn Acquisition>> {
        let class = config.class();
        let ctor = self
            .acquisitions
            .get(class)
            .ok_or_else(|| Plugins::missing(Section::Acquisition, class))?;
        ctor(config)
    }
}

#[test]
fn check_suggests_similar_class() {
    let plugins = Plugins::default();
    assert!(plugins.check(Section::Runner, "slurm").is_ok());
    match plugins.check(Section::Runner, "slurn") {
        Err(Error::InvalidConfiguration(msg)) => assert!(msg.contains("did you mean `slurm`")),
        other => panic!("unexpected: {:?}", other),
    }
    match Plugins::empty().check(Section::Interface, "tcp") {
        Err(Error::InvalidConfiguration(msg)) => assert!(msg.contains("unknown interface")),
        other => panic!("unexpected: {:?}", other),
    }
}
