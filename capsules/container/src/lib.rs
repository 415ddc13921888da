//! Container runtime capsule: builds images and supervises containers.
//!
//! Everything here goes through the [`ContainerEngine`] contract. The default
//! engine shells out to the `docker` CLI; the [`StubEngine`] keeps images and
//! containers in memory so the lifecycle can be exercised without a daemon.
//!
//! Output never comes back through callbacks. Builds yield a [`BuildStream`]
//! and launched containers yield a [`ContainerEvents`] sequence; both are
//! finite and can only be consumed once.

pub mod build;
pub mod docker;
pub mod engine;
pub mod stub;
pub mod supervisor;

pub use build::{BuildError, BuildEvent, BuildExit, BuildSink, BuildStream, BuildSummary, ImageBuilder};
pub use docker::DockerCli;
pub use engine::{BuildRequest, ContainerEngine, ContainerSpec, EngineError, OutputFollower, ResourceLimits};
pub use stub::{StubBuild, StubEngine};
pub use supervisor::{
    ContainerEvent, ContainerEvents, ContainerHandle, ContainerSupervisor, ExitReport,
    LaunchError, LaunchRequest, LaunchedContainer, StopOutcome,
};

use std::sync::Arc;

/// Which engine backs a deployment, selected by a single setting string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeKind {
    Binary(String),
    Stub,
}

impl RuntimeKind {
    /// `stub` (any case) selects the in-memory engine, an empty value falls
    /// back to `docker`, anything else is taken as the CLI binary to invoke.
    pub fn from_setting(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.eq_ignore_ascii_case("stub") {
            RuntimeKind::Stub
        } else if trimmed.is_empty() {
            RuntimeKind::Binary("docker".to_string())
        } else {
            RuntimeKind::Binary(trimmed.to_string())
        }
    }

    pub fn into_engine(self) -> Arc<dyn ContainerEngine> {
        match self {
            RuntimeKind::Binary(bin) => Arc::new(DockerCli::new(bin)),
            RuntimeKind::Stub => Arc::new(StubEngine::new()),
        }
    }
}

pub(crate) fn truncate(text: &str, limit: usize) -> String {
    if text.len() <= limit {
        return text.to_string();
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut truncated = text[..cut].to_string();
    truncated.push_str("… (truncated)");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_kind_parses_stub_and_binaries() {
        assert_eq!(RuntimeKind::from_setting("STUB"), RuntimeKind::Stub);
        assert_eq!(
            RuntimeKind::from_setting(""),
            RuntimeKind::Binary("docker".to_string())
        );
        assert_eq!(
            RuntimeKind::from_setting(" podman "),
            RuntimeKind::Binary("podman".to_string())
        );
    }

    #[test]
    fn truncate_limits_output_on_char_boundary() {
        let long = "é".repeat(3000);
        let truncated = truncate(&long, 1001);
        assert!(truncated.ends_with("… (truncated)"));
        assert!(truncated.len() < long.len());
    }
}
