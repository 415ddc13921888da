use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::build::{BuildEvent, BuildExit, BuildStream};
use crate::engine::{BuildRequest, ContainerEngine, ContainerSpec, EngineError, OutputFollower};

/// Exit code reported for containers that were stopped or force-removed.
pub const STUB_STOP_EXIT_CODE: i64 = 143;

/// Scripted outcome for the next builds run by a [`StubEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StubBuild {
    Succeed,
    /// The build is accepted but fails before emitting any output.
    FailBeforeOutput(String),
    /// The build emits its first step, then an error.
    FailMidStream(String),
    /// The engine refuses to open a build at all.
    Unreachable(String),
    /// The tag is committed right after the first step, then the build
    /// keeps running for the given time whether or not anyone is reading.
    TagThenStall(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StubContainerState {
    Created,
    Running,
    Exited(i64),
}

/// Snapshot of one stub container.
#[derive(Debug, Clone)]
pub struct StubContainer {
    pub id: String,
    pub spec: ContainerSpec,
    pub state: StubContainerState,
    pub removed: bool,
}

struct ContainerSlot {
    info: StubContainer,
    exit: watch::Sender<Option<i64>>,
}

struct StubState {
    build: StubBuild,
    step_delay: Duration,
    builds_started: usize,
    images: BTreeSet<String>,
    removed_images: Vec<String>,
    containers: HashMap<String, ContainerSlot>,
    next_container: u64,
    occupied_ports: HashSet<u16>,
    create_error: Option<String>,
    start_error: Option<String>,
    remove_image_error: Option<String>,
    output: Vec<String>,
    exit_after: Option<(Duration, i64)>,
}

impl Default for StubState {
    fn default() -> Self {
        Self {
            build: StubBuild::Succeed,
            step_delay: Duration::ZERO,
            builds_started: 0,
            images: BTreeSet::new(),
            removed_images: Vec::new(),
            containers: HashMap::new(),
            next_container: 0,
            occupied_ports: HashSet::new(),
            create_error: None,
            start_error: None,
            remove_image_error: None,
            output: vec!["listening".to_string()],
            exit_after: None,
        }
    }
}

/// In-memory engine. Clones share state, so a test can keep one clone for
/// scripting and inspection while the system under test owns another.
#[derive(Clone, Default)]
pub struct StubEngine {
    state: Arc<Mutex<StubState>>,
}

impl std::fmt::Debug for StubEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("StubEngine")
            .field("images", &state.images.len())
            .field("containers", &state.containers.len())
            .finish()
    }
}

impl StubEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, StubState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn set_build(&self, build: StubBuild) {
        self.state().build = build;
    }

    /// Delay between emitted build steps; lets tests act while a build is
    /// still in flight.
    pub fn set_step_delay(&self, delay: Duration) {
        self.state().step_delay = delay;
    }

    pub fn fail_create(&self, message: impl Into<String>) {
        self.state().create_error = Some(message.into());
    }

    pub fn fail_start(&self, message: impl Into<String>) {
        self.state().start_error = Some(message.into());
    }

    pub fn fail_remove_image(&self, message: impl Into<String>) {
        self.state().remove_image_error = Some(message.into());
    }

    /// Marks a host port as held by something outside the engine.
    pub fn occupy_port(&self, port: u16) {
        self.state().occupied_ports.insert(port);
    }

    /// Lines every started container writes to its output.
    pub fn set_output<I, S>(&self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.state().output = lines.into_iter().map(Into::into).collect();
    }

    /// Started containers terminate on their own after `delay`.
    pub fn exit_after(&self, delay: Duration, code: i64) {
        self.state().exit_after = Some((delay, code));
    }

    pub fn builds_started(&self) -> usize {
        self.state().builds_started
    }

    pub fn images(&self) -> Vec<String> {
        self.state().images.iter().cloned().collect()
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.state().removed_images.clone()
    }

    pub fn containers(&self) -> Vec<StubContainer> {
        let mut all: Vec<StubContainer> = self
            .state()
            .containers
            .values()
            .map(|slot| slot.info.clone())
            .collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    pub fn container(&self, id: &str) -> Option<StubContainer> {
        self.state().containers.get(id).map(|slot| slot.info.clone())
    }

    /// Containers that are running and not removed.
    pub fn live_containers(&self) -> Vec<StubContainer> {
        self.containers()
            .into_iter()
            .filter(|c| !c.removed && c.state == StubContainerState::Running)
            .collect()
    }

    fn terminate(&self, id: &str, code: i64) -> bool {
        let mut state = self.state();
        match state.containers.get_mut(id) {
            Some(slot) if slot.info.state == StubContainerState::Running => {
                slot.info.state = StubContainerState::Exited(code);
                slot.exit.send_replace(Some(code));
                true
            }
            _ => false,
        }
    }

    fn missing(what: &'static str, id: &str) -> EngineError {
        EngineError::NotFound {
            what,
            id: id.to_string(),
        }
    }

    fn refused(command: &str, message: &str) -> EngineError {
        EngineError::CommandFailed {
            command: format!("stub {}", command),
            status: "exit status: 1".to_string(),
            stderr: message.to_string(),
        }
    }
}

#[async_trait]
impl ContainerEngine for StubEngine {
    async fn build(&self, request: &BuildRequest) -> Result<BuildStream, EngineError> {
        let (script, delay) = {
            let mut state = self.state();
            state.builds_started += 1;
            (state.build.clone(), state.step_delay)
        };
        if let StubBuild::Unreachable(message) = script {
            return Err(EngineError::Unavailable { message });
        }

        let recipe = tokio::fs::read_to_string(request.context.join(&request.recipe))
            .await
            .unwrap_or_default();
        let steps: Vec<String> = recipe
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect();

        let (sink, stream) = BuildStream::channel();
        let engine = self.clone();
        let tag = request.tag.clone();
        tokio::spawn(async move {
            match script {
                StubBuild::FailBeforeOutput(message) => {
                    sink.finish(BuildExit::Failed { message });
                }
                StubBuild::FailMidStream(message) => {
                    let first = steps.first().cloned().unwrap_or_default();
                    let step = BuildEvent::Status(format!("Step 1/{} : {}", steps.len(), first));
                    if !sink.send(step).await {
                        return;
                    }
                    tokio::time::sleep(delay).await;
                    if !sink.send(BuildEvent::Error(message.clone())).await {
                        return;
                    }
                    sink.finish(BuildExit::Failed { message });
                }
                StubBuild::TagThenStall(stall) => {
                    let first = steps.first().cloned().unwrap_or_default();
                    let step = BuildEvent::Status(format!("Step 1/{} : {}", steps.len(), first));
                    if !sink.send(step).await {
                        return;
                    }
                    engine.state().images.insert(tag.clone());
                    tokio::time::sleep(stall).await;
                    if !sink
                        .send(BuildEvent::Status(format!("Successfully tagged {}", tag)))
                        .await
                    {
                        debug!(image = %tag, "stub build finished after its consumer left");
                        return;
                    }
                    sink.finish(BuildExit::Succeeded);
                }
                StubBuild::Succeed | StubBuild::Unreachable(_) => {
                    let total = steps.len();
                    for (index, step) in steps.iter().enumerate() {
                        let event =
                            BuildEvent::Status(format!("Step {}/{} : {}", index + 1, total, step));
                        if !sink.send(event).await {
                            debug!(image = %tag, "stub build cancelled");
                            return;
                        }
                        tokio::time::sleep(delay).await;
                    }
                    if !sink
                        .send(BuildEvent::Status(format!("Successfully tagged {}", tag)))
                        .await
                    {
                        return;
                    }
                    engine.state().images.insert(tag);
                    sink.finish(BuildExit::Succeeded);
                }
            }
        });

        Ok(stream)
    }

    async fn remove_image(&self, tag: &str) -> Result<(), EngineError> {
        let mut state = self.state();
        if let Some(message) = state.remove_image_error.clone() {
            return Err(Self::refused("rmi", &message));
        }
        if !state.images.remove(tag) {
            return Err(Self::missing("image", tag));
        }
        state.removed_images.push(tag.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let mut state = self.state();
        if let Some(message) = state.create_error.clone() {
            return Err(Self::refused("create", &message));
        }
        if !state.images.contains(&spec.image) {
            return Err(Self::missing("image", &spec.image));
        }
        state.next_container += 1;
        let id = format!("stub-{:012x}", state.next_container);
        let (exit, _) = watch::channel(None);
        state.containers.insert(
            id.clone(),
            ContainerSlot {
                info: StubContainer {
                    id: id.clone(),
                    spec: spec.clone(),
                    state: StubContainerState::Created,
                    removed: false,
                },
                exit,
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        let exit_after = {
            let mut state = self.state();
            if let Some(message) = state.start_error.clone() {
                return Err(Self::refused("start", &message));
            }
            let host_port = match state.containers.get(id) {
                Some(slot) if !slot.info.removed => slot.info.spec.host_port,
                _ => return Err(Self::missing("container", id)),
            };
            let port_taken = state.occupied_ports.contains(&host_port)
                || state.containers.values().any(|other| {
                    other.info.id != id
                        && !other.info.removed
                        && other.info.state == StubContainerState::Running
                        && other.info.spec.host_port == host_port
                });
            if port_taken {
                return Err(Self::refused(
                    "start",
                    &format!(
                        "Bind for 0.0.0.0:{} failed: port is already allocated",
                        host_port
                    ),
                ));
            }
            if let Some(slot) = state.containers.get_mut(id) {
                slot.info.state = StubContainerState::Running;
            }
            state.exit_after
        };

        if let Some((delay, code)) = exit_after {
            let engine = self.clone();
            let id = id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                engine.terminate(&id, code);
            });
        }
        Ok(())
    }

    async fn follow_output(&self, id: &str) -> Result<OutputFollower, EngineError> {
        let (lines, mut exit) = {
            let state = self.state();
            let slot = state
                .containers
                .get(id)
                .ok_or_else(|| Self::missing("container", id))?;
            (state.output.clone(), slot.exit.subscribe())
        };

        let (tx, rx) = mpsc::channel(lines.len().max(1));
        let task = tokio::spawn(async move {
            for line in lines {
                if tx.send(format!("{}\n", line)).await.is_err() {
                    return;
                }
            }
            let _ = exit.wait_for(|code| code.is_some()).await;
        });
        Ok(OutputFollower::new(rx, Some(task)))
    }

    async fn wait_container(&self, id: &str) -> Result<i64, EngineError> {
        let mut exit = {
            let state = self.state();
            state
                .containers
                .get(id)
                .map(|slot| slot.exit.subscribe())
                .ok_or_else(|| Self::missing("container", id))?
        };
        let code = exit
            .wait_for(|code| code.is_some())
            .await
            .map_err(|_| EngineError::Unavailable {
                message: format!("container {} vanished", id),
            })?;
        Ok((*code).unwrap_or(STUB_STOP_EXIT_CODE))
    }

    async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<(), EngineError> {
        let known = self
            .state()
            .containers
            .get(id)
            .map(|slot| !slot.info.removed)
            .unwrap_or(false);
        if !known {
            return Err(Self::missing("container", id));
        }
        self.terminate(id, STUB_STOP_EXIT_CODE);
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        self.terminate(id, STUB_STOP_EXIT_CODE);
        let mut state = self.state();
        match state.containers.get_mut(id) {
            Some(slot) if !slot.info.removed => {
                slot.info.removed = true;
                if slot.info.state == StubContainerState::Created {
                    slot.exit.send_replace(Some(STUB_STOP_EXIT_CODE));
                }
                Ok(())
            }
            _ => Err(Self::missing("container", id)),
        }
    }
}
