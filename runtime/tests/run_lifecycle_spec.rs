use std::io::{Cursor, Write};
use std::sync::Arc;
use std::time::Duration;

use capsules_container::{StubBuild, StubEngine};
use capsules_stack::StackKind;
use runtime::logs::{LogChannel, LogItem};
use runtime::runs::{CleanupOutcome, CleanupStep, RunStage, RunStatus};
use runtime::{Config, RunError, RunOrchestrator};
use tempfile::TempDir;
use zip::write::FileOptions;

fn zip_of(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body) in files {
        writer.start_file(*name, FileOptions::default()).unwrap();
        writer.write_all(body.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

fn express_app() -> Vec<u8> {
    zip_of(&[
        (
            "package.json",
            r#"{"name":"api","scripts":{"start":"node server.js"},"dependencies":{"express":"^4.18.0"}}"#,
        ),
        ("server.js", "require('express')().listen(3000)"),
    ])
}

fn orchestrator(stub: &StubEngine) -> (Arc<RunOrchestrator>, TempDir) {
    let root = TempDir::new().unwrap();
    let config = Config {
        workspace_root: root.path().to_path_buf(),
        stop_timeout: Duration::from_millis(200),
        ..Config::default()
    };
    let orchestrator = RunOrchestrator::new(config, Arc::new(stub.clone()));
    (Arc::new(orchestrator), root)
}

fn build_log(orchestrator: &RunOrchestrator, run_id: &str) -> Vec<String> {
    orchestrator
        .logs()
        .history(run_id)
        .into_iter()
        .filter(|message| message.channel == LogChannel::BuildLog)
        .map(|message| message.message)
        .collect()
}

#[tokio::test]
async fn given_express_app_when_created_then_node_container_runs_on_fresh_host_port() {
    let stub = StubEngine::new();
    let (orchestrator, root) = orchestrator(&stub);

    let response = orchestrator.create_run(express_app()).await;
    assert!(!response.is_error(), "unexpected error: {:?}", response.error);

    let host_port = response.host_port.expect("host port");
    assert_ne!(host_port, 3000);
    assert_eq!(
        response.service_url.as_deref(),
        Some(format!("http://localhost:{}/", host_port).as_str())
    );
    assert_eq!(
        response.log_channel,
        format!("http://localhost:8080/runs/{}/logs", response.run_id)
    );

    let status = orchestrator.status(&response.run_id).await.unwrap();
    assert_eq!(status.status, RunStatus::Running);
    assert_eq!(status.stage, RunStage::Running);
    assert_eq!(status.host_port, Some(host_port));
    assert_eq!(
        status.detected_stack.as_ref().map(|d| d.stack_type),
        Some(StackKind::Node)
    );

    let container_id = status.container_id.expect("container id");
    let container = stub.container(&container_id).unwrap();
    assert_eq!(container.spec.host_port, host_port);
    assert_eq!(container.spec.container_port, 3000);
    assert_eq!(container.spec.image, format!("shipyard:{}", response.run_id));

    let recipe = std::fs::read_to_string(root.path().join(&response.run_id).join("Dockerfile")).unwrap();
    assert!(recipe.contains("FROM node"));
    assert!(recipe.contains("EXPOSE 3000"));
    assert!(recipe.contains(r#""node server.js""#));

    let lines = build_log(&orchestrator, &response.run_id);
    assert!(lines.iter().any(|line| line.starts_with("Detected stack: node")));
    assert!(lines.iter().any(|line| line.starts_with("Step 1/")));

    orchestrator.stop(&response.run_id).await.unwrap();
}

#[tokio::test]
async fn given_live_run_when_subscribed_then_container_output_arrives_on_log_channel() {
    let stub = StubEngine::new();
    stub.set_output(["Server listening on 3000"]);
    let (orchestrator, _root) = orchestrator(&stub);

    let response = orchestrator.create_run(express_app()).await;
    let mut subscription = orchestrator.logs().join(&response.run_id).unwrap();

    let output = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(item) = subscription.recv().await {
            if let LogItem::Message(message) = item {
                if message.channel == LogChannel::Log {
                    return Some(message.message);
                }
            }
        }
        None
    })
    .await
    .unwrap();
    assert_eq!(output.as_deref().map(str::trim_end), Some("Server listening on 3000"));

    orchestrator.stop(&response.run_id).await.unwrap();
}

#[tokio::test]
async fn given_unrecognised_project_when_created_then_default_template_serves_it() {
    let stub = StubEngine::new();
    let (orchestrator, root) = orchestrator(&stub);

    let response = orchestrator
        .create_run(zip_of(&[("notes.txt", "just some notes")]))
        .await;
    assert!(!response.is_error(), "unexpected error: {:?}", response.error);

    let status = orchestrator.status(&response.run_id).await.unwrap();
    assert_eq!(
        status.detected_stack.as_ref().map(|d| d.stack_type),
        Some(StackKind::Unknown)
    );
    let recipe = std::fs::read_to_string(root.path().join(&response.run_id).join("Dockerfile")).unwrap();
    assert!(recipe.contains("http.server 3000"));

    orchestrator.stop(&response.run_id).await.unwrap();
}

#[tokio::test]
async fn given_corrupt_archive_when_created_then_workspace_error_and_nothing_built() {
    let stub = StubEngine::new();
    let (orchestrator, root) = orchestrator(&stub);

    let response = orchestrator.create_run(b"this is not a zip".to_vec()).await;
    let error = response.error.clone().expect("error body");
    assert_eq!(error.kind, "workspace");

    assert_eq!(stub.builds_started(), 0);
    assert!(stub.containers().is_empty());
    assert!(!root.path().join(&response.run_id).exists());
    assert!(matches!(
        orchestrator.status(&response.run_id).await,
        Err(RunError::NotFound(_))
    ));
    assert_eq!(orchestrator.ports().leased_count(), 0);

    let lines = build_log(&orchestrator, &response.run_id);
    assert!(lines.iter().any(|line| line.starts_with("ERROR:")));
}

#[tokio::test]
async fn given_port_conflict_at_start_when_created_then_launch_error_and_image_removed() {
    let stub = StubEngine::new();
    stub.fail_start("Bind for 0.0.0.0:41000 failed: port is already allocated");
    let (orchestrator, root) = orchestrator(&stub);

    let response = orchestrator.create_run(express_app()).await;
    let error = response.error.clone().expect("error body");
    assert_eq!(error.kind, "launch");
    assert!(error.message.contains("port is already allocated"));

    let tag = format!("shipyard:{}", response.run_id);
    assert!(stub.removed_images().contains(&tag));
    assert!(stub.images().is_empty());
    assert!(stub.containers().iter().all(|c| c.removed));
    assert!(!root.path().join(&response.run_id).exists());
    assert_eq!(orchestrator.ports().leased_count(), 0);
    assert!(response.host_port.is_none());
}

#[tokio::test]
async fn given_build_failing_mid_stream_when_created_then_output_kept_and_error_reported() {
    let stub = StubEngine::new();
    stub.set_build(StubBuild::FailMidStream("npm ERR! missing script".into()));
    let (orchestrator, root) = orchestrator(&stub);

    let response = orchestrator.create_run(express_app()).await;
    assert_eq!(response.error.as_ref().map(|e| e.kind.as_str()), Some("build_in_stream"));

    let lines = build_log(&orchestrator, &response.run_id);
    assert!(lines.iter().any(|line| line.starts_with("Step 1/")));
    assert!(lines.iter().any(|line| line.contains("npm ERR! missing script")));
    assert!(stub.images().is_empty());
    assert!(!root.path().join(&response.run_id).exists());
}

#[tokio::test]
async fn given_unreachable_engine_when_created_then_pre_stream_build_error() {
    let stub = StubEngine::new();
    stub.set_build(StubBuild::Unreachable("Cannot connect to the Docker daemon".into()));
    let (orchestrator, _root) = orchestrator(&stub);

    let response = orchestrator.create_run(express_app()).await;
    assert_eq!(response.error.as_ref().map(|e| e.kind.as_str()), Some("build_pre_stream"));
    assert!(stub.containers().is_empty());
}

#[tokio::test]
async fn given_running_run_when_stopped_twice_then_second_stop_is_a_no_op() {
    let stub = StubEngine::new();
    let (orchestrator, root) = orchestrator(&stub);
    let response = orchestrator.create_run(express_app()).await;
    let run_id = response.run_id.clone();

    let ack = orchestrator.stop(&run_id).await.expect("first stop finds the run");
    assert!(ack.stopped);
    assert!(ack.cleanup.is_clean(), "cleanup: {}", ack.cleanup);
    assert_eq!(ack.cleanup.outcome(CleanupStep::Container), Some(&CleanupOutcome::Ok));
    assert_eq!(ack.cleanup.outcome(CleanupStep::Image), Some(&CleanupOutcome::Ok));
    assert_eq!(ack.cleanup.outcome(CleanupStep::Workspace), Some(&CleanupOutcome::Ok));
    assert_eq!(ack.cleanup.outcome(CleanupStep::Port), Some(&CleanupOutcome::Ok));

    assert!(stub.live_containers().is_empty());
    assert!(stub.images().is_empty());
    assert!(!root.path().join(&run_id).exists());
    assert_eq!(orchestrator.ports().leased_count(), 0);

    assert!(matches!(orchestrator.stop(&run_id).await, Err(RunError::NotFound(id)) if id == run_id));
    assert!(matches!(orchestrator.status(&run_id).await, Err(RunError::NotFound(_))));
    let unknown = orchestrator.stop("no-such-run").await.unwrap_err();
    assert_eq!(unknown.kind(), "not_found");
}

#[tokio::test]
async fn given_concurrent_uploads_when_created_then_each_run_gets_its_own_port() {
    let stub = StubEngine::new();
    let (orchestrator, _root) = orchestrator(&stub);

    let runs = futures_util::future::join_all(
        (0..4).map(|_| orchestrator.create_run(express_app())),
    )
    .await;

    let mut ports: Vec<u16> = runs
        .iter()
        .map(|response| response.host_port.expect("every run is live"))
        .collect();
    ports.sort_unstable();
    ports.dedup();
    assert_eq!(ports.len(), 4);
    assert_eq!(stub.live_containers().len(), 4);
    assert_eq!(orchestrator.list().await.len(), 4);

    assert_eq!(orchestrator.shutdown().await, 4);
    assert!(stub.live_containers().is_empty());
    assert!(orchestrator.list().await.is_empty());
}

#[tokio::test]
async fn given_build_in_flight_when_stopped_then_build_is_abandoned_and_nothing_leaks() {
    let stub = StubEngine::new();
    stub.set_step_delay(Duration::from_millis(200));
    let (orchestrator, root) = orchestrator(&stub);

    let response = orchestrator.submit_run(express_app()).await;
    assert!(response.host_port.is_none());
    let run_id = response.run_id.clone();

    let mut building = false;
    for _ in 0..100 {
        if let Ok(status) = orchestrator.status(&run_id).await {
            if status.stage == RunStage::Building {
                building = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(building, "run never reached the build stage");

    let ack = orchestrator.stop(&run_id).await.expect("run is active");
    assert_eq!(ack.cleanup.outcome(CleanupStep::Container), Some(&CleanupOutcome::Skipped));
    assert_eq!(ack.cleanup.outcome(CleanupStep::Image), Some(&CleanupOutcome::Skipped));
    assert_eq!(ack.cleanup.outcome(CleanupStep::Workspace), Some(&CleanupOutcome::Ok));

    // Give the abandoned build a chance to notice.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(stub.images().is_empty());
    assert!(stub.containers().is_empty());
    assert!(!root.path().join(&run_id).exists());
    assert!(orchestrator.status(&run_id).await.is_err());
    assert_eq!(orchestrator.ports().leased_count(), 0);
}

#[tokio::test]
async fn given_tag_committed_after_stop_when_build_is_abandoned_then_image_is_removed() {
    let stub = StubEngine::new();
    stub.set_build(StubBuild::TagThenStall(Duration::from_secs(5)));
    let (orchestrator, root) = orchestrator(&stub);

    let response = orchestrator.submit_run(express_app()).await;
    let run_id = response.run_id.clone();
    let tag = format!("shipyard:{}", run_id);

    let mut committed = false;
    for _ in 0..200 {
        if stub.images().contains(&tag) {
            committed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(committed, "build never committed its tag");

    let ack = tokio::time::timeout(Duration::from_secs(2), orchestrator.stop(&run_id))
        .await
        .expect("stop does not wait for the build to finish")
        .expect("run is active");
    assert_eq!(ack.cleanup.outcome(CleanupStep::Image), Some(&CleanupOutcome::Ok));
    assert_eq!(ack.cleanup.outcome(CleanupStep::Container), Some(&CleanupOutcome::Skipped));
    assert!(stub.images().is_empty());
    assert!(stub.removed_images().contains(&tag));
    assert!(!root.path().join(&run_id).exists());
    assert!(orchestrator.status(&run_id).await.is_err());
}

#[tokio::test]
async fn given_image_removal_refused_when_stopped_then_failure_is_reported_and_run_still_retired() {
    let stub = StubEngine::new();
    let (orchestrator, root) = orchestrator(&stub);
    let response = orchestrator.create_run(express_app()).await;
    assert!(!response.is_error(), "unexpected error: {:?}", response.error);
    let run_id = response.run_id.clone();

    stub.fail_remove_image("conflict: unable to remove repository reference");
    let ack = orchestrator.stop(&run_id).await.expect("run is active");

    match ack.cleanup.outcome(CleanupStep::Image) {
        Some(CleanupOutcome::Failed { reason }) => {
            assert!(reason.contains("unable to remove repository reference"))
        }
        other => panic!("image step should have failed, got {:?}", other),
    }
    assert!(!ack.cleanup.is_clean());
    assert_eq!(ack.cleanup.outcome(CleanupStep::Container), Some(&CleanupOutcome::Ok));
    assert_eq!(ack.cleanup.outcome(CleanupStep::Workspace), Some(&CleanupOutcome::Ok));
    assert_eq!(ack.cleanup.outcome(CleanupStep::Port), Some(&CleanupOutcome::Ok));

    assert!(orchestrator.status(&run_id).await.is_err());
    assert!(!root.path().join(&run_id).exists());
    assert_eq!(orchestrator.ports().leased_count(), 0);
    assert!(stub.live_containers().is_empty());
}

#[tokio::test]
async fn given_container_create_refused_when_created_then_launch_error_with_nothing_to_stop() {
    let stub = StubEngine::new();
    stub.fail_create("no space left on device");
    let (orchestrator, root) = orchestrator(&stub);

    let response = orchestrator.create_run(express_app()).await;
    let error = response.error.clone().expect("error body");
    assert_eq!(error.kind, "launch");
    assert!(error.message.contains("no space left on device"));

    let lines = build_log(&orchestrator, &response.run_id);
    let cleanup = lines
        .iter()
        .find(|line| line.starts_with("Cleanup: "))
        .expect("cleanup report published");
    assert_eq!(cleanup, "Cleanup: container=skipped image=ok workspace=ok port=ok");

    assert!(stub.containers().is_empty());
    assert!(stub.images().is_empty());
    assert!(!root.path().join(&response.run_id).exists());
    assert!(orchestrator.status(&response.run_id).await.is_err());
    assert_eq!(orchestrator.ports().leased_count(), 0);
}

#[tokio::test]
async fn given_container_exits_on_its_own_when_observed_then_run_reports_stopped_with_code() {
    let stub = StubEngine::new();
    stub.exit_after(Duration::from_millis(50), 0);
    let (orchestrator, root) = orchestrator(&stub);

    let response = orchestrator.create_run(express_app()).await;
    let run_id = response.run_id.clone();

    let mut exited = None;
    for _ in 0..200 {
        let status = orchestrator.status(&run_id).await.unwrap();
        if status.status == RunStatus::Stopped {
            exited = Some(status);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let status = exited.expect("run never reported the exit");
    assert_eq!(status.exit_code, Some(0));

    let marker = orchestrator
        .logs()
        .history(&run_id)
        .into_iter()
        .find(|message| message.channel == LogChannel::Log && message.message.starts_with("CONTAINER_EXIT:"))
        .map(|message| message.message);
    assert_eq!(
        marker.as_deref(),
        Some(r#"CONTAINER_EXIT: {"statusCode":0,"error":null}"#)
    );

    let mut released = false;
    for _ in 0..200 {
        if build_log(&orchestrator, &run_id)
            .iter()
            .any(|line| line.starts_with("Container exited. Cleanup: "))
        {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(released, "exited run was never torn down");
    assert!(!root.path().join(&run_id).exists());
    assert!(stub.images().is_empty());
    assert_eq!(orchestrator.ports().leased_count(), 0);

    let status = orchestrator.status(&run_id).await.expect("record kept until stop");
    assert_eq!(status.status, RunStatus::Stopped);
    assert_eq!(status.exit_code, Some(0));

    let ack = orchestrator.stop(&run_id).await.expect("exited runs are still owned until stopped");
    assert_eq!(ack.cleanup.outcome(CleanupStep::Workspace), Some(&CleanupOutcome::Ok));
    assert_eq!(ack.cleanup.outcome(CleanupStep::Image), Some(&CleanupOutcome::Ok));
    assert!(orchestrator.status(&run_id).await.is_err());
}
