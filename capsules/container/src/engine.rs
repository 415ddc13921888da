use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::build::BuildStream;

/// Operations the capsule needs from a container runtime.
///
/// Implementations must be cheap to share behind an `Arc`; every method may be
/// called concurrently for different images and containers.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Starts an image build. An `Err` here means nothing was built and no
    /// output was produced.
    async fn build(&self, request: &BuildRequest) -> Result<BuildStream, EngineError>;

    async fn remove_image(&self, tag: &str) -> Result<(), EngineError>;

    /// Creates (but does not start) a container, returning its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    /// Attaches to the combined stdout/stderr of a container in follow mode.
    async fn follow_output(&self, id: &str) -> Result<OutputFollower, EngineError>;

    /// Resolves once the container terminates, with its exit status code.
    async fn wait_container(&self, id: &str) -> Result<i64, EngineError>;

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), EngineError>;

    /// Forced removal; succeeds for running containers too.
    async fn remove_container(&self, id: &str) -> Result<(), EngineError>;
}

#[derive(Debug, Clone)]
pub struct BuildRequest {
    pub context: PathBuf,
    pub recipe: String,
    pub tag: String,
}

/// Memory and CPU caps applied at container creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    #[serde(default)]
    pub memory_mb: Option<u64>,
    /// CFS quota in microseconds per 100ms period.
    #[serde(default)]
    pub cpu_quota: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub name: Option<String>,
    pub container_port: u16,
    pub host_port: u16,
    pub limits: ResourceLimits,
    pub env: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
}

impl ContainerSpec {
    pub fn port_binding(&self) -> String {
        format!("{}:{}/tcp", self.host_port, self.container_port)
    }
}

/// Live output of a container. Dropping the follower detaches from the
/// container and stops the background reader.
#[derive(Debug)]
pub struct OutputFollower {
    chunks: mpsc::Receiver<String>,
    task: Option<JoinHandle<()>>,
}

impl OutputFollower {
    pub fn new(chunks: mpsc::Receiver<String>, task: Option<JoinHandle<()>>) -> Self {
        Self { chunks, task }
    }

    /// Next chunk of output, or `None` once the container's streams close.
    pub async fn next_chunk(&mut self) -> Option<String> {
        self.chunks.recv().await
    }
}

impl Drop for OutputFollower {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Failed to spawn container runtime {runtime}: {source}")]
    Spawn {
        runtime: String,
        source: std::io::Error,
    },
    #[error("`{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
    #[error("`{command}` produced unexpected output: {output}")]
    InvalidOutput { command: String, output: String },
    #[error("`{command}` did not finish within {timeout:?}")]
    TimedOut { command: String, timeout: Duration },
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },
    #[error("container runtime unavailable: {message}")]
    Unavailable { message: String },
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Spawn { .. } => "ENGINE_SPAWN_FAILED",
            EngineError::CommandFailed { .. } => "ENGINE_COMMAND_FAILED",
            EngineError::InvalidOutput { .. } => "ENGINE_INVALID_OUTPUT",
            EngineError::TimedOut { .. } => "ENGINE_TIMED_OUT",
            EngineError::NotFound { .. } => "ENGINE_NOT_FOUND",
            EngineError::Unavailable { .. } => "ENGINE_UNAVAILABLE",
        }
    }
}
