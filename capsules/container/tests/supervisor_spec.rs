use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use capsules_container::{
    BuildError, BuildEvent, ContainerEvent, ContainerSupervisor, ImageBuilder, LaunchError,
    LaunchRequest, ResourceLimits, StubBuild, StubEngine,
};
use futures_util::StreamExt;
use tempfile::TempDir;

fn workspace_with_recipe() -> TempDir {
    let dir = TempDir::new().unwrap();
    std::fs::write(
        dir.path().join("Dockerfile"),
        "FROM node:20-alpine\nWORKDIR /app\nCOPY . .\nCMD [\"node\", \"index.js\"]\n",
    )
    .unwrap();
    dir
}

fn launch_request(image: &str, host_port: u16) -> LaunchRequest {
    LaunchRequest {
        run_id: "run-1".to_string(),
        image: image.to_string(),
        container_port: 3000,
        host_port,
        limits: ResourceLimits {
            memory_mb: Some(512),
            cpu_quota: Some(50000),
        },
        env: BTreeMap::new(),
    }
}

async fn build(stub: &StubEngine, tag: &str) {
    let workspace = workspace_with_recipe();
    let builder = ImageBuilder::new(Arc::new(stub.clone()));
    builder
        .build(workspace.path(), tag)
        .await
        .unwrap()
        .finish()
        .await
        .unwrap();
}

#[tokio::test]
async fn given_recipe_when_build_then_step_events_stream_in_order() {
    let stub = StubEngine::new();
    let workspace = workspace_with_recipe();
    let builder = ImageBuilder::new(Arc::new(stub.clone()));

    let mut stream = builder.build(workspace.path(), "shipyard:abc").await.unwrap();
    let mut lines = Vec::new();
    while let Some(event) = stream.next().await {
        lines.push(event.display_line());
    }
    let summary = stream.finish().await.unwrap();

    assert_eq!(lines.first().map(String::as_str), Some("Step 1/4 : FROM node:20-alpine"));
    assert_eq!(lines.last().map(String::as_str), Some("Successfully tagged shipyard:abc"));
    assert_eq!(summary.output_events, 5);
    assert_eq!(stub.images(), vec!["shipyard:abc".to_string()]);
}

#[tokio::test]
async fn given_missing_workspace_when_build_then_pre_stream_without_engine_call() {
    let stub = StubEngine::new();
    let builder = ImageBuilder::new(Arc::new(stub.clone()));
    let dir = TempDir::new().unwrap();

    let err = builder
        .build(&dir.path().join("missing"), "shipyard:abc")
        .await
        .unwrap_err();

    assert!(err.is_pre_stream());
    assert!(err.message().starts_with("Workspace does not exist"));
    assert_eq!(stub.builds_started(), 0);
}

#[tokio::test]
async fn given_missing_recipe_when_build_then_pre_stream() {
    let stub = StubEngine::new();
    let builder = ImageBuilder::new(Arc::new(stub.clone()));
    let dir = TempDir::new().unwrap();

    let err = builder.build(dir.path(), "shipyard:abc").await.unwrap_err();

    assert!(err.is_pre_stream());
    assert!(err.message().starts_with("Recipe not found at"));
}

#[tokio::test]
async fn given_unreachable_engine_when_build_then_pre_stream() {
    let stub = StubEngine::new();
    stub.set_build(StubBuild::Unreachable("Cannot connect to the Docker daemon".into()));
    let builder = ImageBuilder::new(Arc::new(stub.clone()));
    let workspace = workspace_with_recipe();

    let err = builder.build(workspace.path(), "shipyard:abc").await.unwrap_err();

    assert!(matches!(err, BuildError::PreStream { .. }));
    assert!(err.message().contains("Docker daemon"));
}

#[tokio::test]
async fn given_failing_step_when_build_then_in_stream_with_error_event() {
    let stub = StubEngine::new();
    stub.set_build(StubBuild::FailMidStream("npm ERR! missing script".into()));
    let builder = ImageBuilder::new(Arc::new(stub.clone()));
    let workspace = workspace_with_recipe();

    let mut stream = builder.build(workspace.path(), "shipyard:abc").await.unwrap();
    let mut saw_error = false;
    while let Some(event) = stream.next().await {
        if let BuildEvent::Error(message) = event {
            assert_eq!(message, "npm ERR! missing script");
            saw_error = true;
        }
    }
    let err = stream.finish().await.unwrap_err();

    assert!(saw_error);
    assert!(!err.is_pre_stream());
    assert!(stub.images().is_empty());
}

#[tokio::test]
async fn given_built_image_when_launch_then_output_then_exit_event() {
    let stub = StubEngine::new();
    stub.set_output(["server listening on 3000"]);
    stub.exit_after(Duration::from_millis(50), 0);
    build(&stub, "shipyard:abc").await;

    let supervisor = ContainerSupervisor::new(Arc::new(stub.clone()), Duration::from_secs(5));
    let mut launched = supervisor
        .launch(launch_request("shipyard:abc", 41001))
        .await
        .unwrap();

    let container = stub.container(&launched.container_id).unwrap();
    assert_eq!(container.spec.host_port, 41001);
    assert_eq!(container.spec.container_port, 3000);
    assert_eq!(container.spec.limits.memory_mb, Some(512));

    let mut events = Vec::new();
    while let Some(event) = launched.events.next_event().await {
        events.push(event);
    }

    assert_eq!(
        events.first(),
        Some(&ContainerEvent::Output("server listening on 3000\n".to_string()))
    );
    match events.last() {
        Some(ContainerEvent::Exited(report)) => {
            assert_eq!(report.status_code, Some(0));
            assert_eq!(report.line(), r#"CONTAINER_EXIT: {"statusCode":0,"error":null}"#);
        }
        other => panic!("expected exit event, got {:?}", other),
    }
}

#[tokio::test]
async fn given_port_conflict_when_launch_then_start_error_carries_container() {
    let stub = StubEngine::new();
    stub.occupy_port(41002);
    build(&stub, "shipyard:abc").await;

    let supervisor = ContainerSupervisor::new(Arc::new(stub.clone()), Duration::from_secs(5));
    let err = supervisor
        .launch(launch_request("shipyard:abc", 41002))
        .await
        .unwrap_err();

    assert!(matches!(err, LaunchError::Start { .. }));
    assert!(err.to_string().contains("port is already allocated"));
    let leftover = err.container_id().unwrap().to_string();
    supervisor.remove(&leftover).await.unwrap();
    assert!(stub.container(&leftover).unwrap().removed);
}

#[tokio::test]
async fn given_running_container_when_stop_then_removed_even_after_stop_failure() {
    let stub = StubEngine::new();
    build(&stub, "shipyard:abc").await;
    let supervisor = ContainerSupervisor::new(Arc::new(stub.clone()), Duration::from_secs(1));
    let launched = supervisor
        .launch(launch_request("shipyard:abc", 41003))
        .await
        .unwrap();

    let outcome = supervisor.stop(&launched.container_id).await;
    assert!(outcome.graceful.is_ok());
    assert!(outcome.removed());
    assert!(stub.live_containers().is_empty());

    let again = supervisor.stop(&launched.container_id).await;
    assert!(again.graceful.is_err());
    assert!(!again.removed());
}
