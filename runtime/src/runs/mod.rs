//! Run lifecycle: records, the store, resource teardown and the pipeline
//! that drives a run from upload to a live container.

pub mod cleanup;
pub mod models;
pub mod orchestrator;
pub mod store;

pub use cleanup::{CleanupEntry, CleanupOutcome, CleanupReport, CleanupStep, ResourceLedger, Resources};
pub use models::{CreateRunResponse, RunRecord, RunStage, RunStatus, RunStatusView, StopAck};
pub use orchestrator::RunOrchestrator;
pub use store::{transition, InMemoryRunStore, RunStore, RunUpdate, StoreError};
