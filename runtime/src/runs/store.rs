use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use super::models::{RunRecord, RunStage};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("run {0} already exists")]
    Duplicate(String),
    #[error("run {0} not found")]
    NotFound(String),
    #[error("run {run_id}: illegal transition {from} -> {to}")]
    IllegalTransition {
        run_id: String,
        from: RunStage,
        to: RunStage,
    },
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Duplicate(_) => "STORE_DUPLICATE",
            StoreError::NotFound(_) => "STORE_NOT_FOUND",
            StoreError::IllegalTransition { .. } => "STORE_ILLEGAL_TRANSITION",
        }
    }
}

/// A mutation applied to a record under its lock. Returning `Err` leaves the
/// stored record untouched.
pub type RunUpdate = Box<dyn FnOnce(&mut RunRecord) -> Result<(), StoreError> + Send>;

/// Authoritative table of live runs.
#[async_trait]
pub trait RunStore: Send + Sync {
    async fn create(&self, record: RunRecord) -> Result<RunRecord, StoreError>;

    async fn get(&self, run_id: &str) -> Option<RunRecord>;

    /// Applies `update` atomically with respect to other updates of the same
    /// run and returns the merged record.
    async fn update(&self, run_id: &str, update: RunUpdate) -> Result<RunRecord, StoreError>;

    /// Returns the removed record, if there was one.
    async fn delete(&self, run_id: &str) -> Option<RunRecord>;

    async fn list(&self) -> Vec<RunRecord>;
}

/// Moves a run to `stage`, failing if the lifecycle graph forbids it.
pub async fn transition(
    store: &dyn RunStore,
    run_id: &str,
    stage: RunStage,
) -> Result<RunRecord, StoreError> {
    let id = run_id.to_string();
    store
        .update(
            run_id,
            Box::new(move |record| {
                let from = record.stage;
                if record.advance(stage) {
                    Ok(())
                } else {
                    Err(StoreError::IllegalTransition {
                        run_id: id,
                        from,
                        to: stage,
                    })
                }
            }),
        )
        .await
}

type Slot = Arc<Mutex<Option<RunRecord>>>;

/// Process-local store. The outer map lock is only held to find a run's
/// slot; mutations lock that slot alone, so distinct runs never contend.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRunStore {
    runs: Arc<RwLock<HashMap<String, Slot>>>,
}

impl InMemoryRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, run_id: &str) -> Option<Slot> {
        self.runs.read().await.get(run_id).cloned()
    }
}

#[async_trait]
impl RunStore for InMemoryRunStore {
    async fn create(&self, record: RunRecord) -> Result<RunRecord, StoreError> {
        let mut runs = self.runs.write().await;
        if runs.contains_key(&record.run_id) {
            return Err(StoreError::Duplicate(record.run_id));
        }
        runs.insert(
            record.run_id.clone(),
            Arc::new(Mutex::new(Some(record.clone()))),
        );
        Ok(record)
    }

    async fn get(&self, run_id: &str) -> Option<RunRecord> {
        let slot = self.slot(run_id).await?;
        let guard = slot.lock().await;
        guard.clone()
    }

    async fn update(&self, run_id: &str, update: RunUpdate) -> Result<RunRecord, StoreError> {
        let slot = self
            .slot(run_id)
            .await
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;
        let mut guard = slot.lock().await;
        let current = guard
            .as_ref()
            .ok_or_else(|| StoreError::NotFound(run_id.to_string()))?;

        let mut draft = current.clone();
        update(&mut draft)?;
        *guard = Some(draft.clone());
        Ok(draft)
    }

    async fn delete(&self, run_id: &str) -> Option<RunRecord> {
        let slot = self.runs.write().await.remove(run_id)?;
        let mut guard = slot.lock().await;
        guard.take()
    }

    async fn list(&self) -> Vec<RunRecord> {
        let slots: Vec<Slot> = self.runs.read().await.values().cloned().collect();
        let mut runs = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(record) = slot.lock().await.clone() {
                runs.push(record);
            }
        }
        runs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.run_id.cmp(&a.run_id))
        });
        runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn record(id: &str) -> RunRecord {
        RunRecord::new(id, PathBuf::from(format!("/tmp/{}", id)), format!("shipyard:{}", id))
    }

    #[tokio::test]
    async fn create_rejects_duplicates() {
        let store = InMemoryRunStore::new();
        store.create(record("a")).await.unwrap();
        assert!(matches!(
            store.create(record("a")).await,
            Err(StoreError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_updates_merge_without_lost_writes() {
        let store = InMemoryRunStore::new();
        store.create(record("a")).await.unwrap();

        let mut tasks = Vec::new();
        for i in 0..50u16 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .update(
                        "a",
                        Box::new(move |r| {
                            if i % 2 == 0 {
                                r.host_port = Some(r.host_port.unwrap_or(0) + 1);
                            } else {
                                r.container_port = Some(r.container_port.unwrap_or(0) + 1);
                            }
                            Ok(())
                        }),
                    )
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let merged = store.get("a").await.unwrap();
        assert_eq!(merged.host_port, Some(25));
        assert_eq!(merged.container_port, Some(25));
    }

    #[tokio::test]
    async fn failed_update_leaves_record_untouched() {
        let store = InMemoryRunStore::new();
        store.create(record("a")).await.unwrap();

        let err = transition(&store, "a", RunStage::Running).await.unwrap_err();
        assert_eq!(err.code(), "STORE_ILLEGAL_TRANSITION");
        assert_eq!(store.get("a").await.unwrap().stage, RunStage::Created);

        transition(&store, "a", RunStage::Extracting).await.unwrap();
        assert_eq!(store.get("a").await.unwrap().stage, RunStage::Extracting);
    }

    #[tokio::test]
    async fn deleted_runs_are_not_found() {
        let store = InMemoryRunStore::new();
        store.create(record("a")).await.unwrap();
        assert!(store.delete("a").await.is_some());
        assert!(store.delete("a").await.is_none());
        assert!(store.get("a").await.is_none());
        assert!(matches!(
            transition(&store, "a", RunStage::Extracting).await,
            Err(StoreError::NotFound(_))
        ));
        assert!(store.list().await.is_empty());
    }
}
