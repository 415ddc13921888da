use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use capsules_container::{
    ContainerEngine, ContainerEvent, ContainerEvents, ContainerSupervisor, EngineError,
    ImageBuilder, LaunchRequest, LaunchedContainer,
};
use capsules_stack::{MarkerDetector, RecipeGenerator, StackDetector, TemplateRecipeGenerator};
use futures_util::StreamExt;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::cleanup::{CleanupOutcome, CleanupReport, CleanupStep, ResourceLedger, Resources};
use super::models::{CreateRunResponse, RunRecord, RunStage, RunStatusView, StopAck};
use super::store::{transition, InMemoryRunStore, RunStore};
use crate::config::Config;
use crate::error::{ErrorBody, RunError};
use crate::logs::{LogBroadcaster, LogChannel};
use crate::ports::PortAllocator;
use crate::telemetry::RunMetrics;
use crate::workspace::WorkspaceStore;

/// Per-run control block shared by the pipeline and `stop`.
struct RunHandle {
    run_id: String,
    cancel: watch::Sender<bool>,
    ledger: ResourceLedger,
    /// Held by the pipeline for the length of each stage, the build
    /// included; teardown takes it before releasing anything.
    busy: tokio::sync::Mutex<()>,
    report: OnceCell<CleanupReport>,
    retired: AtomicBool,
}

impl RunHandle {
    fn new(run_id: &str) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            run_id: run_id.to_string(),
            cancel,
            ledger: ResourceLedger::new(),
            busy: tokio::sync::Mutex::new(()),
            report: OnceCell::new(),
            retired: AtomicBool::new(false),
        }
    }

    fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    async fn cancelled(&self) {
        let mut rx = self.cancel.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Releases everything the run holds, once. Later callers get the
    /// report of the first teardown.
    async fn teardown(&self, services: &RunServices) -> CleanupReport {
        self.report
            .get_or_init(|| async {
                let _busy = self.busy.lock().await;
                let held = self.ledger.close().unwrap_or_default();
                services.release(&self.run_id, held).await
            })
            .await
            .clone()
    }
}

/// Engine-facing services a teardown needs, shared with the exit watchers.
struct RunServices {
    workspaces: WorkspaceStore,
    ports: PortAllocator,
    builder: ImageBuilder,
    supervisor: ContainerSupervisor,
}

/// Drives runs from upload to teardown.
pub struct RunOrchestrator {
    config: Config,
    store: Arc<dyn RunStore>,
    logs: LogBroadcaster,
    services: Arc<RunServices>,
    detector: Arc<dyn StackDetector>,
    recipes: Arc<dyn RecipeGenerator>,
    active: Mutex<HashMap<String, Arc<RunHandle>>>,
}

impl RunOrchestrator {
    pub fn new(config: Config, engine: Arc<dyn ContainerEngine>) -> Self {
        Self {
            store: Arc::new(InMemoryRunStore::new()),
            logs: LogBroadcaster::new(config.log_history, config.log_retention),
            services: Arc::new(RunServices {
                workspaces: WorkspaceStore::new(config.workspace_root.clone()),
                ports: PortAllocator::new(),
                builder: ImageBuilder::new(Arc::clone(&engine)),
                supervisor: ContainerSupervisor::new(engine, config.stop_timeout),
            }),
            detector: Arc::new(MarkerDetector::new()),
            recipes: Arc::new(TemplateRecipeGenerator::new(
                config.template_source(),
                config.default_container_port,
            )),
            active: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_detector(mut self, detector: Arc<dyn StackDetector>) -> Self {
        self.detector = detector;
        self
    }

    pub fn with_recipe_generator(mut self, recipes: Arc<dyn RecipeGenerator>) -> Self {
        self.recipes = recipes;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn logs(&self) -> &LogBroadcaster {
        &self.logs
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.services.ports
    }

    fn active(&self) -> MutexGuard<'_, HashMap<String, Arc<RunHandle>>> {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn build_log(&self, run_id: &str, message: impl Into<String>) {
        self.logs.publish(run_id, LogChannel::BuildLog, message);
    }

    fn response(
        &self,
        run_id: &str,
        host_port: Option<u16>,
        error: Option<ErrorBody>,
    ) -> CreateRunResponse {
        CreateRunResponse {
            run_id: run_id.to_string(),
            log_channel: self.config.log_channel_url(run_id),
            service_url: host_port.map(|port| self.config.service_url(port)),
            host_port,
            error,
        }
    }

    /// Runs the whole pipeline and reports the outcome. Never fails: errors
    /// come back in the response's `error` field.
    pub async fn create_run(&self, archive: Vec<u8>) -> CreateRunResponse {
        let run_id = Uuid::new_v4().to_string();
        match self.admit(&run_id).await {
            Ok(handle) => self.execute(handle, archive).await,
            Err(err) => self.rejected(&run_id, err),
        }
    }

    /// Registers the run and drives it on a background task.
    pub async fn submit_run(self: &Arc<Self>, archive: Vec<u8>) -> CreateRunResponse {
        let run_id = Uuid::new_v4().to_string();
        let handle = match self.admit(&run_id).await {
            Ok(handle) => handle,
            Err(err) => return self.rejected(&run_id, err),
        };
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            orchestrator.execute(handle, archive).await;
        });
        self.response(&run_id, None, None)
    }

    async fn admit(&self, run_id: &str) -> Result<Arc<RunHandle>, RunError> {
        let record = RunRecord::new(
            run_id,
            self.services.workspaces.path_for(run_id),
            self.config.image_tag(run_id),
        );
        self.logs.open(run_id);
        self.store.create(record).await?;

        let handle = Arc::new(RunHandle::new(run_id));
        self.active().insert(run_id.to_string(), Arc::clone(&handle));
        RunMetrics::run_admitted();
        info!(run = %run_id, "run admitted");
        self.build_log(run_id, format!("Run {} accepted", run_id));
        Ok(handle)
    }

    fn rejected(&self, run_id: &str, err: RunError) -> CreateRunResponse {
        error!(run = %run_id, error = %err, "run could not be admitted");
        self.build_log(run_id, format!("ERROR: {}", err));
        self.logs.close(run_id);
        self.response(run_id, None, Some(err.to_body()))
    }

    async fn execute(&self, handle: Arc<RunHandle>, archive: Vec<u8>) -> CreateRunResponse {
        let outcome = self.drive(&handle, archive).await;
        self.conclude(&handle, outcome).await
    }

    async fn enter(&self, handle: &RunHandle, stage: RunStage) -> Result<(), RunError> {
        if handle.is_cancelled() {
            return Err(RunError::Cancelled {
                stage: stage.to_string(),
            });
        }
        match transition(self.store.as_ref(), &handle.run_id, stage).await {
            Ok(_) => {
                debug!(run = %handle.run_id, %stage, "stage entered");
                Ok(())
            }
            Err(_) if handle.is_cancelled() => Err(RunError::Cancelled {
                stage: stage.to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    async fn drive(&self, handle: &Arc<RunHandle>, archive: Vec<u8>) -> Result<u16, RunError> {
        let run_id = handle.run_id.as_str();

        let workspace = {
            let _busy = handle.busy.lock().await;
            self.enter(handle, RunStage::Extracting).await?;
            let path = self.services.workspaces.path_for(run_id);
            if !handle.ledger.register_workspace(path.clone()) {
                return Err(RunError::Cancelled {
                    stage: RunStage::Extracting.to_string(),
                });
            }
            self.build_log(run_id, format!("Extracting archive ({} bytes)", archive.len()));
            self.services.workspaces.extract(run_id, archive).await?;
            path
        };

        let detection = {
            let _busy = handle.busy.lock().await;
            self.enter(handle, RunStage::Detecting).await?;
            let detector = Arc::clone(&self.detector);
            let path = workspace.clone();
            let detection = tokio::task::spawn_blocking(move || detector.detect(&path)).await?;
            self.build_log(
                run_id,
                format!(
                    "Detected stack: {} ({})",
                    detection.stack_type,
                    detection.rationale.join("; ")
                ),
            );
            let detected = detection.clone();
            self.store
                .update(
                    run_id,
                    Box::new(move |record| {
                        record.detected_stack = Some(detected);
                        record.touch();
                        Ok(())
                    }),
                )
                .await?;
            detection
        };

        let recipe = {
            let _busy = handle.busy.lock().await;
            self.enter(handle, RunStage::Generating).await?;
            let recipes = Arc::clone(&self.recipes);
            let path = workspace.clone();
            let detected = detection.clone();
            let recipe =
                tokio::task::spawn_blocking(move || recipes.generate(&detected, &path)).await??;
            if recipe.fallback {
                self.build_log(
                    run_id,
                    format!(
                        "No template for {}; using '{}'",
                        detection.stack_type, recipe.template
                    ),
                );
            }
            self.build_log(run_id, format!("Recipe written from template '{}'", recipe.template));
            let port = recipe.port;
            self.store
                .update(
                    run_id,
                    Box::new(move |record| {
                        record.container_port = Some(port);
                        record.touch();
                        Ok(())
                    }),
                )
                .await?;
            recipe
        };

        let tag = self.config.image_tag(run_id);
        {
            let _busy = handle.busy.lock().await;
            self.enter(handle, RunStage::Building).await?;
            self.build_log(run_id, format!("Building image {}", tag));
            let started = Instant::now();
            let mut stream = self.services.builder.build(&workspace, &tag).await?;

            loop {
                let next = tokio::select! {
                    event = stream.next() => event,
                    _ = handle.cancelled() => {
                        info!(run = %run_id, image = %tag, "build interrupted");
                        // The engine may still commit the tag after the
                        // stream is dropped; teardown removes it if so.
                        if !handle.ledger.register_image(tag.clone()) {
                            self.remove_orphaned_image(run_id, &tag).await;
                        }
                        return Err(RunError::Cancelled {
                            stage: RunStage::Building.to_string(),
                        });
                    }
                };
                match next {
                    Some(event) => self.build_log(run_id, event.display_line()),
                    None => break,
                }
            }

            let result = stream.finish().await;
            let seconds = started.elapsed().as_secs_f64();
            match result {
                Ok(summary) => {
                    RunMetrics::build_duration(seconds, "ok");
                    info!(run = %run_id, image = %tag, seconds, "image built");
                    self.build_log(
                        run_id,
                        format!(
                            "Image built in {:.1}s ({} output events)",
                            seconds, summary.output_events
                        ),
                    );
                }
                Err(err) => {
                    RunMetrics::build_duration(seconds, "failed");
                    return Err(err.into());
                }
            }

            if !handle.ledger.register_image(tag.clone()) {
                self.remove_orphaned_image(run_id, &tag).await;
                return Err(RunError::Cancelled {
                    stage: RunStage::Building.to_string(),
                });
            }
        }

        let host_port = {
            let _busy = handle.busy.lock().await;
            self.enter(handle, RunStage::Allocating).await?;
            let port = self
                .services.ports
                .allocate()
                .await
                .map_err(|err| RunError::PortAllocation(err.to_string()))?;
            if !handle.ledger.register_port(port) {
                self.services.ports.release(port);
                return Err(RunError::Cancelled {
                    stage: RunStage::Allocating.to_string(),
                });
            }
            self.store
                .update(
                    run_id,
                    Box::new(move |record| {
                        record.host_port = Some(port);
                        record.touch();
                        Ok(())
                    }),
                )
                .await?;
            self.build_log(run_id, format!("Allocated host port {}", port));
            port
        };

        {
            let _busy = handle.busy.lock().await;
            self.enter(handle, RunStage::Launching).await?;
            let request = LaunchRequest {
                run_id: run_id.to_string(),
                image: tag.clone(),
                container_port: recipe.port,
                host_port,
                limits: self.config.resource_limits(),
                env: BTreeMap::new(),
            };

            let LaunchedContainer {
                container_id,
                events,
                handle: container,
                ..
            } = match self.services.supervisor.launch(request).await {
                Ok(launched) => launched,
                Err(err) => {
                    if let Some(id) = err.container_id() {
                        if handle.ledger.register_container(id.to_string(), None).is_err() {
                            if let Err(err) = self.services.supervisor.remove(id).await {
                                warn!(run = %run_id, container = %id, error = %err, "failed to remove orphaned container");
                            }
                        }
                    }
                    return Err(err.into());
                }
            };

            if let Err(orphan) = handle
                .ledger
                .register_container(container_id.clone(), Some(container))
            {
                drop(orphan);
                let outcome = self.services.supervisor.stop(&container_id).await;
                if let Err(err) = outcome.removal {
                    warn!(run = %run_id, container = %container_id, error = %err, "failed to remove orphaned container");
                }
                return Err(RunError::Cancelled {
                    stage: RunStage::Launching.to_string(),
                });
            }

            let id = container_id.clone();
            self.store
                .update(
                    run_id,
                    Box::new(move |record| {
                        record.container_id = Some(id);
                        record.touch();
                        Ok(())
                    }),
                )
                .await?;
            self.build_log(
                run_id,
                format!(
                    "Container {} started on host port {} (container port {})",
                    container_id, host_port, recipe.port
                ),
            );
            self.enter(handle, RunStage::Running).await?;
            self.spawn_forwarder(handle, events);
        }

        Ok(host_port)
    }

    /// Publishes container output on the `log` channel. When the container
    /// exits on its own the run is torn down, but its record stays visible
    /// as stopped until `stop` retires it.
    fn spawn_forwarder(&self, handle: &Arc<RunHandle>, mut events: ContainerEvents) {
        let store = Arc::clone(&self.store);
        let logs = self.logs.clone();
        let services = Arc::clone(&self.services);
        let handle = Arc::clone(handle);
        tokio::spawn(async move {
            let run_id = handle.run_id.clone();
            while let Some(event) = events.next_event().await {
                logs.publish(&run_id, LogChannel::Log, event.display_line());
                let ContainerEvent::Exited(report) = event else {
                    continue;
                };
                info!(run = %run_id, code = ?report.status_code, "container exited");
                let code = report.status_code;
                let updated = store
                    .update(
                        &run_id,
                        Box::new(move |record| {
                            record.exit_code = code;
                            if record.stage == RunStage::Running {
                                record.advance(RunStage::Stopped);
                            } else {
                                record.touch();
                            }
                            Ok(())
                        }),
                    )
                    .await;
                if let Err(err) = updated {
                    debug!(run = %run_id, error = %err, "exit recorded after run was removed");
                }
                if handle.is_cancelled() {
                    break;
                }
                let cleanup = handle.teardown(&services).await;
                logs.publish(
                    &run_id,
                    LogChannel::BuildLog,
                    format!("Container exited. Cleanup: {}", cleanup),
                );
                break;
            }
        });
    }

    async fn conclude(
        &self,
        handle: &Arc<RunHandle>,
        outcome: Result<u16, RunError>,
    ) -> CreateRunResponse {
        let run_id = handle.run_id.as_str();
        match outcome {
            Ok(host_port) => {
                info!(run = %run_id, port = host_port, "run is live");
                let stack = self
                    .store
                    .get(run_id)
                    .await
                    .and_then(|record| record.detected_stack)
                    .map(|detection| detection.stack_type.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                RunMetrics::run_started(&stack);
                self.response(run_id, Some(host_port), None)
            }
            // `stop` owns the teardown of cancelled runs.
            Err(err) if handle.is_cancelled() => {
                info!(run = %run_id, reason = %err, "run cancelled");
                self.build_log(run_id, format!("Run cancelled: {}", err));
                let body = ErrorBody {
                    kind: "cancelled".to_string(),
                    message: err.to_string(),
                };
                self.response(run_id, None, Some(body))
            }
            Err(err) => self.fail(handle, err).await,
        }
    }

    async fn fail(&self, handle: &Arc<RunHandle>, err: RunError) -> CreateRunResponse {
        let run_id = handle.run_id.as_str();
        let body = err.to_body();
        error!(run = %run_id, kind = %body.kind, error = %body.message, "run failed");
        RunMetrics::run_failed(&body.kind);

        let message = body.message.clone();
        let marked = self
            .store
            .update(
                run_id,
                Box::new(move |record| {
                    record.advance(RunStage::Failed);
                    record.error = Some(message);
                    Ok(())
                }),
            )
            .await;
        if let Err(err) = marked {
            warn!(run = %run_id, error = %err, "could not mark run as failed");
        }
        self.build_log(run_id, format!("ERROR: {}", body.message));

        let report = handle.teardown(&self.services).await;
        self.build_log(run_id, format!("Cleanup: {}", report));
        self.retire(handle).await;

        self.response(run_id, None, Some(body))
    }

    /// Stops a run in any stage. `NotFound` when the run is unknown or
    /// already retired.
    pub async fn stop(&self, run_id: &str) -> Result<StopAck, RunError> {
        let handle = self
            .active()
            .get(run_id)
            .cloned()
            .ok_or_else(|| RunError::NotFound(run_id.to_string()))?;
        info!(run = %run_id, "stop requested");
        handle.cancel();

        let stopping = self
            .store
            .update(
                run_id,
                Box::new(|record| {
                    record.advance(RunStage::Stopping);
                    Ok(())
                }),
            )
            .await;
        if stopping.is_ok() {
            self.build_log(run_id, "Stopping run");
        }

        let report = handle.teardown(&self.services).await;

        let _ = self
            .store
            .update(
                run_id,
                Box::new(|record| {
                    record.advance(RunStage::Stopped);
                    Ok(())
                }),
            )
            .await;
        if !handle.retired.load(Ordering::SeqCst) {
            RunMetrics::run_stopped();
            self.build_log(run_id, format!("Run stopped. Cleanup: {}", report));
        }
        self.retire(&handle).await;

        Ok(StopAck {
            run_id: run_id.to_string(),
            stopped: true,
            cleanup: report,
        })
    }

    async fn remove_orphaned_image(&self, run_id: &str, tag: &str) {
        match self.services.builder.remove(tag).await {
            Ok(()) | Err(EngineError::NotFound { .. }) => {}
            Err(err) => {
                warn!(run = %run_id, image = %tag, error = %err, "failed to remove orphaned image");
            }
        }
    }

    async fn retire(&self, handle: &RunHandle) {
        if handle.retired.swap(true, Ordering::SeqCst) {
            return;
        }
        self.store.delete(&handle.run_id).await;
        self.logs.close(&handle.run_id);
        self.active().remove(&handle.run_id);
        RunMetrics::run_released();
    }

    pub async fn status(&self, run_id: &str) -> Result<RunStatusView, RunError> {
        self.store
            .get(run_id)
            .await
            .map(|record| record.view())
            .ok_or_else(|| RunError::NotFound(run_id.to_string()))
    }

    pub async fn list(&self) -> Vec<RunStatusView> {
        self.store
            .list()
            .await
            .into_iter()
            .map(|record| record.view())
            .collect()
    }

    /// Stops every live run; used on shutdown.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<String> = self.active().keys().cloned().collect();
        let mut stopped = 0;
        for id in ids {
            if self.stop(&id).await.is_ok() {
                stopped += 1;
            }
        }
        stopped
    }
}

impl RunServices {
    /// Releases resources in reverse order of acquisition.
    async fn release(&self, run_id: &str, held: Resources) -> CleanupReport {
        let mut report = CleanupReport::default();

        let container = match &held.container {
            Some(id) => {
                let outcome = self.supervisor.stop(id).await;
                if let Err(err) = &outcome.graceful {
                    debug!(run = %run_id, container = %id, error = %err, "graceful stop failed");
                }
                match outcome.removal {
                    Ok(()) => CleanupOutcome::Ok,
                    Err(err) => CleanupOutcome::Failed {
                        reason: err.to_string(),
                    },
                }
            }
            None => CleanupOutcome::Skipped,
        };
        report.record(CleanupStep::Container, container);
        if let Some(mut observer) = held.handle {
            observer.release();
        }

        let image = match &held.image {
            Some(tag) => match self.builder.remove(tag).await {
                Ok(()) => CleanupOutcome::Ok,
                // A cancelled build may never have committed its tag.
                Err(EngineError::NotFound { .. }) => CleanupOutcome::Skipped,
                Err(err) => CleanupOutcome::Failed {
                    reason: err.to_string(),
                },
            },
            None => CleanupOutcome::Skipped,
        };
        report.record(CleanupStep::Image, image);

        let workspace = match &held.workspace {
            Some(path) => match self.workspaces.remove(path).await {
                Ok(_) => CleanupOutcome::Ok,
                Err(err) => CleanupOutcome::Failed {
                    reason: err.to_string(),
                },
            },
            None => CleanupOutcome::Skipped,
        };
        report.record(CleanupStep::Workspace, workspace);

        let port = match held.port {
            Some(port) => {
                self.ports.release(port);
                CleanupOutcome::Ok
            }
            None => CleanupOutcome::Skipped,
        };
        report.record(CleanupStep::Port, port);

        for entry in &report.steps {
            if let CleanupOutcome::Failed { reason } = &entry.outcome {
                warn!(run = %run_id, step = entry.step.as_str(), %reason, "cleanup step failed");
                RunMetrics::cleanup_failure(entry.step.as_str());
            }
        }
        info!(run = %run_id, cleanup = %report, "teardown complete");
        report
    }
}
