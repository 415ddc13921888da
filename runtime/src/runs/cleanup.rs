//! Per-run resource ledger and teardown report.

use std::fmt;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use capsules_container::ContainerHandle;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CleanupStep {
    Container,
    Image,
    Workspace,
    Port,
}

impl CleanupStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupStep::Container => "container",
            CleanupStep::Image => "image",
            CleanupStep::Workspace => "workspace",
            CleanupStep::Port => "port",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum CleanupOutcome {
    Ok,
    Failed { reason: String },
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupEntry {
    pub step: CleanupStep,
    #[serde(flatten)]
    pub outcome: CleanupOutcome,
}

/// Outcome of every teardown step, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub steps: Vec<CleanupEntry>,
}

impl CleanupReport {
    pub fn record(&mut self, step: CleanupStep, outcome: CleanupOutcome) {
        self.steps.push(CleanupEntry { step, outcome });
    }

    pub fn outcome(&self, step: CleanupStep) -> Option<&CleanupOutcome> {
        self.steps
            .iter()
            .find(|entry| entry.step == step)
            .map(|entry| &entry.outcome)
    }

    pub fn is_clean(&self) -> bool {
        !self
            .steps
            .iter()
            .any(|entry| matches!(entry.outcome, CleanupOutcome::Failed { .. }))
    }
}

impl fmt::Display for CleanupReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for entry in &self.steps {
            if !first {
                f.write_str(" ")?;
            }
            first = false;
            match &entry.outcome {
                CleanupOutcome::Ok => write!(f, "{}=ok", entry.step.as_str())?,
                CleanupOutcome::Skipped => write!(f, "{}=skipped", entry.step.as_str())?,
                CleanupOutcome::Failed { reason } => {
                    write!(f, "{}=failed({})", entry.step.as_str(), reason)?
                }
            }
        }
        Ok(())
    }
}

/// Resources a run currently owns.
#[derive(Debug, Default)]
pub struct Resources {
    pub workspace: Option<PathBuf>,
    pub image: Option<String>,
    pub container: Option<String>,
    pub handle: Option<ContainerHandle>,
    pub port: Option<u16>,
}

#[derive(Debug, Default)]
struct LedgerState {
    closed: bool,
    held: Resources,
}

/// Records what a run has acquired so teardown releases each resource once.
///
/// Once [`ResourceLedger::close`] has run, registrations are refused and the
/// registering stage must release the resource itself.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    state: Mutex<LedgerState>,
}

impl ResourceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LedgerState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn register_workspace(&self, path: PathBuf) -> bool {
        let mut state = self.state();
        if state.closed {
            return false;
        }
        state.held.workspace = Some(path);
        true
    }

    pub fn register_image(&self, tag: String) -> bool {
        let mut state = self.state();
        if state.closed {
            return false;
        }
        state.held.image = Some(tag);
        true
    }

    pub fn register_port(&self, port: u16) -> bool {
        let mut state = self.state();
        if state.closed {
            return false;
        }
        state.held.port = Some(port);
        true
    }

    /// On refusal the handle is given back so the caller can release it.
    pub fn register_container(
        &self,
        id: String,
        handle: Option<ContainerHandle>,
    ) -> Result<(), Option<ContainerHandle>> {
        let mut state = self.state();
        if state.closed {
            return Err(handle);
        }
        state.held.container = Some(id);
        state.held.handle = handle;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Closes the ledger and hands every held resource to the caller. Only
    /// the first call gets anything.
    pub fn close(&self) -> Option<Resources> {
        let mut state = self.state();
        if state.closed {
            return None;
        }
        state.closed = true;
        Some(std::mem::take(&mut state.held))
    }
}
