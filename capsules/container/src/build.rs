use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_util::Stream;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::engine::{BuildRequest, ContainerEngine, EngineError};

pub const DEFAULT_RECIPE_FILE: &str = "Dockerfile";
const BUILD_EVENT_CAPACITY: usize = 256;

/// One structured item of build output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum BuildEvent {
    Log(String),
    Status(String),
    Error(String),
}

impl BuildEvent {
    pub fn message(&self) -> &str {
        match self {
            BuildEvent::Log(m) | BuildEvent::Status(m) | BuildEvent::Error(m) => m,
        }
    }

    /// Renders the event the way it is shown to log observers.
    pub fn display_line(&self) -> String {
        match self {
            BuildEvent::Error(m) => format!("ERROR: {}", m),
            other => other.message().to_string(),
        }
    }
}

/// How the engine reported the end of a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildExit {
    Succeeded,
    Failed { message: String },
}

#[derive(Debug, Clone, Copy)]
pub struct BuildSummary {
    pub output_events: usize,
    pub duration: Duration,
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("image build failed before producing output: {message}")]
    PreStream { message: String },
    #[error("image build failed after {output_events} output events: {message}")]
    InStream {
        message: String,
        output_events: usize,
    },
}

impl BuildError {
    pub fn is_pre_stream(&self) -> bool {
        matches!(self, BuildError::PreStream { .. })
    }

    pub fn message(&self) -> &str {
        match self {
            BuildError::PreStream { message } | BuildError::InStream { message, .. } => message,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            BuildError::PreStream { .. } => "BUILD_PRE_STREAM",
            BuildError::InStream { .. } => "BUILD_IN_STREAM",
        }
    }
}

/// Producer half of a build, held by engine implementations.
#[derive(Debug)]
pub struct BuildSink {
    events: mpsc::Sender<BuildEvent>,
    exit: oneshot::Sender<BuildExit>,
}

impl BuildSink {
    /// Returns `false` once the consumer has gone away; producers should stop
    /// building at that point.
    pub async fn send(&self, event: BuildEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    /// Resolves once the consumer has dropped its stream.
    pub async fn closed(&self) {
        self.events.closed().await
    }

    pub fn finish(self, exit: BuildExit) {
        let _ = self.exit.send(exit);
    }
}

/// Finite, single-use sequence of [`BuildEvent`]s followed by an outcome.
///
/// Poll it as a `Stream` to observe events, then call [`BuildStream::finish`]
/// to obtain the result. `finish` drains anything left unread, so callers
/// that only care about the result can call it directly.
#[derive(Debug)]
pub struct BuildStream {
    events: mpsc::Receiver<BuildEvent>,
    exit: oneshot::Receiver<BuildExit>,
    output_events: usize,
    last_error: Option<String>,
    started: Instant,
}

impl BuildStream {
    pub fn channel() -> (BuildSink, BuildStream) {
        let (events_tx, events_rx) = mpsc::channel(BUILD_EVENT_CAPACITY);
        let (exit_tx, exit_rx) = oneshot::channel();
        (
            BuildSink {
                events: events_tx,
                exit: exit_tx,
            },
            BuildStream {
                events: events_rx,
                exit: exit_rx,
                output_events: 0,
                last_error: None,
                started: Instant::now(),
            },
        )
    }

    fn observe(&mut self, event: &BuildEvent) {
        match event {
            BuildEvent::Error(message) => self.last_error = Some(message.clone()),
            _ => self.output_events += 1,
        }
    }

    pub async fn finish(mut self) -> Result<BuildSummary, BuildError> {
        while let Some(event) = self.events.recv().await {
            self.observe(&event);
        }

        let exit = (&mut self.exit).await.unwrap_or_else(|_| BuildExit::Failed {
            message: "build ended without reporting an exit status".to_string(),
        });
        let output_events = self.output_events;
        let summary = BuildSummary {
            output_events,
            duration: self.started.elapsed(),
        };

        match (exit, self.last_error) {
            (BuildExit::Succeeded, None) => Ok(summary),
            (BuildExit::Succeeded, Some(message)) => Err(BuildError::InStream {
                message,
                output_events,
            }),
            (BuildExit::Failed { message }, last_error) => {
                let message = last_error.unwrap_or(message);
                if output_events == 0 {
                    Err(BuildError::PreStream { message })
                } else {
                    Err(BuildError::InStream {
                        message,
                        output_events,
                    })
                }
            }
        }
    }
}

impl Stream for BuildStream {
    type Item = BuildEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match this.events.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                this.observe(&event);
                Poll::Ready(Some(event))
            }
            other => other,
        }
    }
}

/// Validates a build request and hands it to the engine.
#[derive(Clone)]
pub struct ImageBuilder {
    engine: Arc<dyn ContainerEngine>,
    recipe: String,
}

impl ImageBuilder {
    pub fn new(engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            engine,
            recipe: DEFAULT_RECIPE_FILE.to_string(),
        }
    }

    /// Opens the build stream. Every `Err` returned here is a pre-stream
    /// failure; in-stream failures surface from [`BuildStream::finish`].
    pub async fn build(&self, workspace: &Path, tag: &str) -> Result<BuildStream, BuildError> {
        validate_tag(tag).map_err(|message| BuildError::PreStream { message })?;

        let is_dir = tokio::fs::metadata(workspace)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(BuildError::PreStream {
                message: format!("Workspace does not exist: {}", workspace.display()),
            });
        }

        let recipe_path = workspace.join(&self.recipe);
        if tokio::fs::metadata(&recipe_path).await.is_err() {
            return Err(BuildError::PreStream {
                message: format!("Recipe not found at: {}", recipe_path.display()),
            });
        }

        let request = BuildRequest {
            context: workspace.to_path_buf(),
            recipe: self.recipe.clone(),
            tag: tag.to_string(),
        };
        debug!(image = %tag, context = %workspace.display(), "opening build stream");
        let stream = self
            .engine
            .build(&request)
            .await
            .map_err(|err| BuildError::PreStream {
                message: err.to_string(),
            })?;
        info!(image = %tag, "image build started");
        Ok(stream)
    }

    /// Best-effort image removal; the caller records the outcome.
    pub async fn remove(&self, tag: &str) -> Result<(), EngineError> {
        self.engine.remove_image(tag).await
    }
}

fn validate_tag(tag: &str) -> Result<(), String> {
    let (repository, version) = match tag.rsplit_once(':') {
        Some((repo, version)) if !repo.is_empty() => (repo, Some(version)),
        _ => (tag, None),
    };
    if repository.is_empty() {
        return Err("Image tag cannot be empty".to_string());
    }
    let repository_ok = repository.chars().all(|c| {
        c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-' | '/')
    });
    if !repository_ok {
        return Err(format!("Malformed image repository in tag '{}'", tag));
    }
    if let Some(version) = version {
        let version_ok = !version.is_empty()
            && version.len() <= 128
            && version
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if !version_ok {
            return Err(format!("Malformed image version in tag '{}'", tag));
        }
    }
    Ok(())
}
