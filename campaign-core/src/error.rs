//! Error types.

use std::io;
use std::num::{ParseFloatError, ParseIntError};
use std::str::ParseBoolError;

use crate::RunId;

pub type Result<T> = core::result::Result<T, Error>;

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::IoError(e.to_string())
    }
}

/// Crate-wide error type.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("interface not ready: connect first")]
    NotReady,
    #[error("unknown run: {0}")]
    UnknownRun(RunId),
    #[error("run {0} cells already claimed by another interface")]
    SlotAlreadyClaimed(RunId),

    #[error("io error: {0}")]
    IoError(String),

    #[cfg(feature = "yaml")]
    #[error("yaml deserialization error: {0}")]
    YamlDeserError(#[from] serde_yaml::Error),
    #[error("toml deserialization error: {0}")]
    TomlDeserError(#[from] toml::de::Error),
    #[error("toml serialization error: {0}")]
    TomlSerError(#[from] toml::ser::Error),
    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("bincode error: {0}")]
    BincodeError(#[from] bincode::Error),

    #[error("parsing error: {0}")]
    ParsingError(String),
    #[error("failed parsing int: {0}")]
    ParseIntError(#[from] ParseIntError),
    #[error("failed parsing float: {0}")]
    ParseFloatError(#[from] ParseFloatError),
    #[error("failed parsing bool: {0}")]
    ParseBoolError(#[from] ParseBoolError),

    #[error("invalid var type: {0}")]
    InvalidVarType(String),
    #[error("unknown variable kind: {0}")]
    UnknownVariableKind(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("staging failed: {0}")]
    StagingFailure(String),
    #[error("missing placeholder `{placeholder}` in {file}")]
    MissingPlaceholder { placeholder: String, file: String },
    #[error("malformed output: {0}")]
    MalformedOutput(String),
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("surrogate error: {0}")]
    Surrogate(String),

    #[error("interrupted")]
    Interrupted,
    #[error("timed out: {0}")]
    TimedOut(String),

    #[error("other error: {0}")]
    Other(String),
}

impl Error {
    /// Staging failures indicate systemic misconfiguration and abort the
    /// whole batch.
    pub fn is_staging(&self) -> bool {
        match self {
            Error::StagingFailure(_) | Error::MissingPlaceholder { .. } => true,
            _ => false,
        }
    }

    /// Process exit code a worker process uses to report this error.
    pub fn exit_code(&self) -> i32 {
        use crate::exit_code;
        match self {
            e if e.is_staging() => exit_code::STAGING,
            Error::MalformedOutput(_) => exit_code::MALFORMED_OUTPUT,
            Error::ExecutionFailed(_) => exit_code::EXECUTION,
            _ => exit_code::CONFIGURATION,
        }
    }
}
