use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("setup failed: {0}")]
    Setup(#[from] SetupError),

    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    #[error("teardown failed: {0}")]
    Teardown(String),

    #[error("docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("testcontainers error: {0}")]
    TestContainers(#[from] testcontainers::TestcontainersError),
}

impl Error {
    /// True when the harness never got the agent running, as opposed to a
    /// failure observed while it ran or while it was being stopped.
    pub fn is_setup(&self) -> bool {
        matches!(self, Error::Setup(_))
    }
}

#[derive(Error, Debug)]
pub enum SetupError {
    #[error("failed to create run directory: {0}")]
    TempDir(#[source] std::io::Error),

    #[error("failed to write config to {path}: {source}")]
    ConfigWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    ConfigParse(String),

    #[error("agent binary not found: {0}")]
    BinaryNotFound(PathBuf),

    #[error("failed to start agent: {0}")]
    AgentStart(String),

    #[error("failed to bind fake backend on {addr}: {source}")]
    BackendBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read self-describe metadata at {path}: {message}")]
    MetadataRead { path: PathBuf, message: String },

    #[error("no self-describe metadata for monitor type '{0}'")]
    MonitorMetadataNotFound(String),
}

#[derive(Error, Debug)]
pub enum WireError {
    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("frame truncated after {read} of {expected} bytes")]
    Truncated { read: usize, expected: usize },

    #[error("failed to decode frame: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("connection error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
