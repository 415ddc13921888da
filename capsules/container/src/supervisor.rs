use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::Stream;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{ContainerEngine, ContainerSpec, EngineError, ResourceLimits};

const EVENT_CAPACITY: usize = 256;
/// How long the exit observer waits for trailing output before reporting.
const OUTPUT_DRAIN: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub run_id: String,
    pub image: String,
    pub container_port: u16,
    pub host_port: u16,
    pub limits: ResourceLimits,
    pub env: BTreeMap<String, String>,
}

impl LaunchRequest {
    fn container_spec(&self) -> ContainerSpec {
        let mut labels = BTreeMap::new();
        labels.insert("shipyard.run".to_string(), self.run_id.clone());
        ContainerSpec {
            image: self.image.clone(),
            name: Some(format!("shipyard-{}", self.run_id)),
            container_port: self.container_port,
            host_port: self.host_port,
            limits: self.limits,
            env: self.env.clone(),
            labels,
        }
    }
}

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to create container: {source}")]
    Create { source: EngineError },
    #[error("failed to start container {container_id}: {source}")]
    Start {
        container_id: String,
        source: EngineError,
    },
    #[error("failed to attach to container {container_id}: {source}")]
    Attach {
        container_id: String,
        source: EngineError,
    },
}

impl LaunchError {
    /// The container left behind by a partial launch, if one was created.
    pub fn container_id(&self) -> Option<&str> {
        match self {
            LaunchError::Create { .. } => None,
            LaunchError::Start { container_id, .. } | LaunchError::Attach { container_id, .. } => {
                Some(container_id)
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            LaunchError::Create { .. } => "CONTAINER_CREATE_FAILED",
            LaunchError::Start { .. } => "CONTAINER_START_FAILED",
            LaunchError::Attach { .. } => "CONTAINER_ATTACH_FAILED",
        }
    }
}

/// Termination notice for a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExitReport {
    pub status_code: Option<i64>,
    pub error: Option<String>,
}

impl ExitReport {
    pub fn line(&self) -> String {
        let body = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("CONTAINER_EXIT: {}", body)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerEvent {
    Output(String),
    /// Always the final event of a sequence.
    Exited(ExitReport),
}

impl ContainerEvent {
    pub fn display_line(&self) -> String {
        match self {
            ContainerEvent::Output(chunk) => chunk.clone(),
            ContainerEvent::Exited(report) => report.line(),
        }
    }
}

/// Output and exit notice of one container. Ends after the exit event, or
/// early if the owning [`ContainerHandle`] is released.
#[derive(Debug)]
pub struct ContainerEvents {
    rx: mpsc::Receiver<ContainerEvent>,
}

impl ContainerEvents {
    pub async fn next_event(&mut self) -> Option<ContainerEvent> {
        self.rx.recv().await
    }
}

impl Stream for ContainerEvents {
    type Item = ContainerEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Owns the background tasks observing a container.
#[derive(Debug)]
pub struct ContainerHandle {
    container_id: String,
    tasks: Vec<JoinHandle<()>>,
}

impl ContainerHandle {
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Detaches from the container. Safe to call more than once.
    pub fn release(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ContainerHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug)]
pub struct LaunchedContainer {
    pub container_id: String,
    pub host_port: u16,
    pub events: ContainerEvents,
    pub handle: ContainerHandle,
}

/// Result of tearing a container down. Removal is attempted even when the
/// graceful stop fails.
#[derive(Debug)]
pub struct StopOutcome {
    pub graceful: Result<(), EngineError>,
    pub removal: Result<(), EngineError>,
}

impl StopOutcome {
    pub fn removed(&self) -> bool {
        self.removal.is_ok()
    }
}

#[derive(Clone)]
pub struct ContainerSupervisor {
    engine: Arc<dyn ContainerEngine>,
    stop_timeout: Duration,
}

impl ContainerSupervisor {
    pub fn new(engine: Arc<dyn ContainerEngine>, stop_timeout: Duration) -> Self {
        Self {
            engine,
            stop_timeout,
        }
    }

    /// Creates, starts and attaches to a container. On `Err`, a container may
    /// still exist (see [`LaunchError::container_id`]); the caller owns its
    /// removal.
    pub async fn launch(&self, request: LaunchRequest) -> Result<LaunchedContainer, LaunchError> {
        let spec = request.container_spec();
        let container_id = self
            .engine
            .create_container(&spec)
            .await
            .map_err(|source| LaunchError::Create { source })?;
        debug!(run_id = %request.run_id, container = %container_id, "container created");

        self.engine
            .start_container(&container_id)
            .await
            .map_err(|source| LaunchError::Start {
                container_id: container_id.clone(),
                source,
            })?;

        let mut follower = self
            .engine
            .follow_output(&container_id)
            .await
            .map_err(|source| LaunchError::Attach {
                container_id: container_id.clone(),
                source,
            })?;

        info!(
            run_id = %request.run_id,
            container = %container_id,
            binding = %spec.port_binding(),
            "container started"
        );

        let (tx, rx) = mpsc::channel(EVENT_CAPACITY);
        let (drained_tx, drained_rx) = oneshot::channel::<()>();

        let output_tx = tx.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(chunk) = follower.next_chunk().await {
                if output_tx.send(ContainerEvent::Output(chunk)).await.is_err() {
                    break;
                }
            }
            let _ = drained_tx.send(());
        });

        let engine = self.engine.clone();
        let id = container_id.clone();
        let observer = tokio::spawn(async move {
            let report = match engine.wait_container(&id).await {
                Ok(code) => ExitReport {
                    status_code: Some(code),
                    error: None,
                },
                Err(err) => {
                    warn!(container = %id, error = %err, "failed to observe container exit");
                    ExitReport {
                        status_code: None,
                        error: Some(err.to_string()),
                    }
                }
            };
            let _ = tokio::time::timeout(OUTPUT_DRAIN, drained_rx).await;
            let _ = tx.send(ContainerEvent::Exited(report)).await;
        });

        Ok(LaunchedContainer {
            container_id: container_id.clone(),
            host_port: spec.host_port,
            events: ContainerEvents { rx },
            handle: ContainerHandle {
                container_id,
                tasks: vec![forwarder, observer],
            },
        })
    }

    /// Graceful stop within the configured timeout, then forced removal.
    pub async fn stop(&self, container_id: &str) -> StopOutcome {
        let graceful = self
            .engine
            .stop_container(container_id, self.stop_timeout)
            .await;
        if let Err(err) = &graceful {
            debug!(container = %container_id, error = %err, "graceful stop failed; removing anyway");
        }
        let removal = self.remove(container_id).await;
        StopOutcome { graceful, removal }
    }

    pub async fn remove(&self, container_id: &str) -> Result<(), EngineError> {
        self.engine.remove_container(container_id).await
    }
}
