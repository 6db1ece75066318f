use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: Box<figment::Error>,
    },

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write config {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("No per-user configuration directory available")]
    NoConfigDir,

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum ReachabilityError {
    #[error("ssh could not be started: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("ssh timed out after {0}s")]
    Timeout(u64),

    #[error("ssh exited with {status}: {stderr}")]
    Exit { status: String, stderr: String },

    #[error("unexpected reply from remote: {0:?}")]
    UnexpectedOutput(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BuildError {
    #[error("{field} is required for the {strategy} strategy")]
    MissingField {
        field: &'static str,
        strategy: &'static str,
    },

    #[error("Invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Pipeline has no stages")]
    EmptyPipeline,

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wire pipe into {program}: {source}")]
    Pipe {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with {status}")]
    StageFailed { program: String, status: String },
}
