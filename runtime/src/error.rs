use capsules_container::{BuildError, LaunchError};
use capsules_stack::RecipeError;
use serde::Serialize;
use thiserror::Error;

use crate::runs::StoreError;
use crate::workspace::WorkspaceError;

/// Everything that can abort a run.
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error(transparent)]
    Recipe(#[from] RecipeError),
    #[error(transparent)]
    Build(#[from] BuildError),
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("run {0} not found")]
    NotFound(String),
    #[error("failed to allocate a host port: {0}")]
    PortAllocation(String),
    #[error(transparent)]
    Registry(#[from] StoreError),
    #[error("run cancelled during {stage}")]
    Cancelled { stage: String },
    #[error("background task failed: {0}")]
    Task(String),
}

impl RunError {
    /// Stable kind string reported to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            RunError::Workspace(_) => "workspace",
            RunError::Recipe(_) => "recipe",
            RunError::Build(err) if err.is_pre_stream() => "build_pre_stream",
            RunError::Build(_) => "build_in_stream",
            RunError::Launch(_) => "launch",
            RunError::NotFound(_) => "not_found",
            RunError::PortAllocation(_) => "port_allocation",
            RunError::Registry(_) => "registry",
            RunError::Cancelled { .. } => "cancelled",
            RunError::Task(_) => "internal",
        }
    }

    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for RunError {
    fn from(err: tokio::task::JoinError) -> Self {
        RunError::Task(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_errors_map_to_distinct_kinds() {
        let pre = RunError::from(BuildError::PreStream {
            message: "daemon down".into(),
        });
        let mid = RunError::from(BuildError::InStream {
            message: "exit code: 1".into(),
            output_events: 4,
        });
        assert_eq!(pre.kind(), "build_pre_stream");
        assert_eq!(mid.kind(), "build_in_stream");
        assert_eq!(pre.to_body().message, "image build failed before producing output: daemon down");
    }

    #[test]
    fn cancellation_names_the_stage() {
        let err = RunError::Cancelled {
            stage: "building".into(),
        };
        assert_eq!(err.kind(), "cancelled");
        assert_eq!(err.to_string(), "run cancelled during building");
    }
}
