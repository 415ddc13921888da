use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, warn};

use crate::build::{BuildEvent, BuildExit, BuildStream};
use crate::engine::{BuildRequest, ContainerEngine, ContainerSpec, EngineError, OutputFollower};
use crate::truncate;

const OUTPUT_CHANNEL_CAPACITY: usize = 256;
const READ_CHUNK_BYTES: usize = 8192;
const LOG_TAIL_LINES: &str = "200";
/// Extra time granted to the CLI on top of the container stop timeout.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Container engine backed by the `docker` command line (or a compatible
/// binary such as `podman`).
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn command(&self) -> Command {
        let mut command = Command::new(&self.binary);
        command.stdin(Stdio::null());
        command.kill_on_drop(true);
        command
    }

    /// Runs a short-lived CLI command and returns its trimmed stdout.
    async fn run(&self, mut command: Command) -> Result<String, EngineError> {
        let cmdline = command_line_string(&command);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        debug!(command = %cmdline, "invoking container runtime");

        let output = command.output().await.map_err(|source| EngineError::Spawn {
            runtime: self.binary.clone(),
            source,
        })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(EngineError::CommandFailed {
                command: cmdline,
                status: output.status.to_string(),
                stderr: truncate(String::from_utf8_lossy(&output.stderr).trim(), 2048),
            })
        }
    }
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn build(&self, request: &BuildRequest) -> Result<BuildStream, EngineError> {
        let mut command = self.command();
        configure_build(&mut command, request);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| EngineError::Spawn {
            runtime: self.binary.clone(),
            source,
        })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(EngineError::Unavailable {
                message: "build process did not expose its output pipes".to_string(),
            });
        };

        let (sink, stream) = BuildStream::channel();
        let tag = request.tag.clone();
        tokio::spawn(async move {
            let stdout = LinesStream::new(BufReader::new(stdout).lines());
            let stderr = LinesStream::new(BufReader::new(stderr).lines());
            let mut merged = futures_util::stream::select(stdout, stderr);
            let mut last_error: Option<String> = None;

            loop {
                let next = tokio::select! {
                    line = merged.next() => line,
                    _ = sink.closed() => {
                        debug!(image = %tag, "build consumer gone; killing build");
                        let _ = child.kill().await;
                        return;
                    }
                };
                let Some(line) = next else {
                    break;
                };
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(image = %tag, error = %err, "failed to read build output");
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                let event = classify_build_line(&line);
                if let BuildEvent::Error(message) = &event {
                    last_error = Some(message.clone());
                }
                if !sink.send(event).await {
                    // Consumer is gone: the build was cancelled.
                    let _ = child.kill().await;
                    return;
                }
            }

            let waited = tokio::select! {
                status = child.wait() => Some(status),
                _ = sink.closed() => None,
            };
            let Some(waited) = waited else {
                let _ = child.kill().await;
                return;
            };
            let exit = match waited {
                Ok(status) if status.success() => BuildExit::Succeeded,
                Ok(status) => BuildExit::Failed {
                    message: last_error.unwrap_or_else(|| format!("build exited with {}", status)),
                },
                Err(err) => BuildExit::Failed {
                    message: format!("failed to wait for build process: {}", err),
                },
            };
            sink.finish(exit);
        });

        Ok(stream)
    }

    async fn remove_image(&self, tag: &str) -> Result<(), EngineError> {
        let mut command = self.command();
        command.arg("rmi").arg("--force").arg(tag);
        match self.run(command).await {
            Ok(_) => Ok(()),
            Err(EngineError::CommandFailed { stderr, .. }) if stderr.contains("No such image") => {
                Err(EngineError::NotFound {
                    what: "image",
                    id: tag.to_string(),
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, EngineError> {
        let mut command = self.command();
        configure_create(&mut command, spec);
        let cmdline = command_line_string(&command);
        let stdout = self.run(command).await?;
        let id = stdout.lines().last().unwrap_or("").trim().to_string();
        if id.is_empty() {
            return Err(EngineError::InvalidOutput {
                command: cmdline,
                output: stdout,
            });
        }
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        let mut command = self.command();
        command.arg("start").arg(id);
        self.run(command).await.map(|_| ())
    }

    async fn follow_output(&self, id: &str) -> Result<OutputFollower, EngineError> {
        let mut command = self.command();
        command
            .arg("logs")
            .arg("--follow")
            .arg("--tail")
            .arg(LOG_TAIL_LINES)
            .arg(id);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let mut child = command.spawn().map_err(|source| EngineError::Spawn {
            runtime: self.binary.clone(),
            source,
        })?;

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let container = id.to_string();
        let task = tokio::spawn(async move {
            let out = stdout.map(|pipe| tokio::spawn(forward_chunks(pipe, tx.clone())));
            let err = stderr.map(|pipe| tokio::spawn(forward_chunks(pipe, tx.clone())));
            drop(tx);
            for reader in [out, err].into_iter().flatten() {
                let _ = reader.await;
            }
            match child.wait().await {
                Ok(status) => debug!(container = %container, %status, "log follower exited"),
                Err(err) => warn!(container = %container, error = %err, "log follower wait failed"),
            }
        });

        Ok(OutputFollower::new(rx, Some(task)))
    }

    async fn wait_container(&self, id: &str) -> Result<i64, EngineError> {
        let mut command = self.command();
        command.arg("wait").arg(id);
        let cmdline = command_line_string(&command);
        let stdout = self.run(command).await?;
        let code = stdout
            .lines()
            .last()
            .and_then(|line| line.trim().parse::<i64>().ok());
        match code {
            Some(code) => Ok(code),
            None => Err(EngineError::InvalidOutput {
                command: cmdline,
                output: stdout,
            }),
        }
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<(), EngineError> {
        let mut command = self.command();
        command
            .arg("stop")
            .arg("--time")
            .arg(timeout.as_secs().max(1).to_string())
            .arg(id);
        let cmdline = command_line_string(&command);
        let limit = timeout + STOP_GRACE;
        match tokio::time::timeout(limit, self.run(command)).await {
            Ok(result) => result.map(|_| ()),
            Err(_) => Err(EngineError::TimedOut {
                command: cmdline,
                timeout: limit,
            }),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), EngineError> {
        let mut command = self.command();
        command.arg("rm").arg("--force").arg(id);
        self.run(command).await.map(|_| ())
    }
}

async fn forward_chunks<R>(mut pipe: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; READ_CHUNK_BYTES];
    loop {
        match pipe.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                let chunk = String::from_utf8_lossy(&buffer[..n]).to_string();
                if tx.send(chunk).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(error = %err, "failed to read container output");
                break;
            }
        }
    }
}

fn configure_build(command: &mut Command, request: &BuildRequest) {
    command.arg("build");
    command.arg("--progress").arg("plain");
    command.arg("--rm");
    command.arg("--tag").arg(&request.tag);
    command
        .arg("--file")
        .arg(request.context.join(&request.recipe));
    command.arg(&request.context);
}

fn configure_create(command: &mut Command, spec: &ContainerSpec) {
    command.arg("create");
    if let Some(name) = &spec.name {
        command.arg("--name").arg(name);
    }
    command.arg("--network").arg("bridge");
    command.arg("--publish").arg(spec.port_binding());

    if let Some(memory_mb) = spec.limits.memory_mb {
        command.arg("--memory").arg(format!("{}m", memory_mb));
    }
    if let Some(quota) = spec.limits.cpu_quota {
        command.arg("--cpu-quota").arg(quota.to_string());
    }

    command
        .arg("--env")
        .arg(format!("PORT={}", spec.container_port));
    for (key, value) in &spec.env {
        command.arg("--env").arg(format!("{}={}", key, value));
    }
    for (key, value) in &spec.labels {
        command.arg("--label").arg(format!("{}={}", key, value));
    }

    command.arg(&spec.image);
}

/// Maps one line of `docker build --progress plain` (or legacy builder)
/// output onto a structured event.
pub fn classify_build_line(line: &str) -> BuildEvent {
    let trimmed = line.trim();

    // BuildKit prefixes every line with a step marker such as `#7 `.
    let body = match trimmed.strip_prefix('#') {
        Some(rest) => match rest.split_once(' ') {
            Some((step, body)) if step.chars().all(|c| c.is_ascii_digit()) => body.trim(),
            _ => trimmed,
        },
        None => trimmed,
    };

    if let Some(message) = body
        .strip_prefix("ERROR:")
        .or_else(|| body.strip_prefix("ERROR "))
        .or_else(|| body.strip_prefix("error:"))
    {
        return BuildEvent::Error(message.trim().to_string());
    }

    let is_status = body.starts_with('[')
        || body.starts_with("Step ")
        || body.starts_with("DONE")
        || body.starts_with("CACHED")
        || body.starts_with("naming to")
        || body.starts_with("writing image")
        || body.starts_with("Successfully built")
        || body.starts_with("Successfully tagged");

    if is_status {
        BuildEvent::Status(trimmed.to_string())
    } else {
        BuildEvent::Log(trimmed.to_string())
    }
}

fn shell_escape(arg: &str) -> String {
    if arg.is_empty() {
        return "''".to_string();
    }
    let escaped = arg.replace('\'', "'\\''");
    format!("'{}'", escaped)
}

fn command_line_string(cmd: &Command) -> String {
    let std_cmd = cmd.as_std();
    let mut s = String::new();
    s.push_str(&std_cmd.get_program().to_string_lossy());
    for a in std_cmd.get_args() {
        s.push(' ');
        let a = a.to_string_lossy();
        if a.is_empty() || a.contains(' ') || a.contains('"') || a.contains('\'') {
            s.push_str(&shell_escape(&a));
        } else {
            s.push_str(&a);
        }
    }
    s
}
