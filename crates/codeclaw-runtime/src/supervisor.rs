//! C7 Container Supervisor — spawns one sandboxed agent run per
//! `run()` call, streams marker-delimited output back to the caller.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    RemoveContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::errors::SupervisorError;
use crate::mount_security::ApprovedMount;

type Result<T> = std::result::Result<T, SupervisorError>;

const START_MARKER: &str = "---CLAWCODE_OUTPUT_START---";
const END_MARKER: &str = "---CLAWCODE_OUTPUT_END---";
const MAX_OUTPUT_BYTES: usize = 10 * 1024 * 1024;
const IDLE_TIMEOUT_SLACK: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize)]
pub struct RunInput {
    pub prompt: String,
    pub session_id: Option<String>,
    pub group_folder: String,
    pub chat_jid: String,
    pub is_main: bool,
    pub is_scheduled_task: bool,
    pub assistant_name: String,
    pub secrets: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputChunk {
    pub status: String,
    pub result: Option<String>,
    #[serde(rename = "newSessionId")]
    pub new_session_id: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Success { chunks: Vec<OutputChunk> },
    Error { message: String },
}

pub struct RunConfig {
    pub image: String,
    pub container_timeout: Duration,
    pub idle_timeout: Duration,
    pub repo_checkout: Option<PathBuf>,
    pub group_folder_path: PathBuf,
    pub agent_state_path: PathBuf,
    pub ipc_path: PathBuf,
    pub global_mounts: Vec<(PathBuf, &'static str, bool)>,
    pub additional_mounts: Vec<ApprovedMount>,
    pub host_uid: u32,
    pub timezone: String,
}

pub struct ContainerSupervisor {
    docker: Docker,
}

impl ContainerSupervisor {
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_socket_defaults().map_err(|_| SupervisorError::DockerUnavailable)?;
        docker.ping().await.map_err(|_| SupervisorError::DockerUnavailable)?;
        Ok(Self { docker })
    }

    pub async fn is_available(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    fn assemble_mounts(&self, config: &RunConfig) -> Vec<Mount> {
        let mut mounts = Vec::new();
        if let Some(repo) = &config.repo_checkout {
            mounts.push(bind(repo, "/workspace/repo", false));
        }
        mounts.push(bind(&config.group_folder_path, "/workspace/group", false));
        for (host, container, read_only) in &config.global_mounts {
            mounts.push(bind(host, container, *read_only));
        }
        mounts.push(bind(&config.agent_state_path, "/home/node/.claude", false));
        mounts.push(bind(&config.ipc_path, "/workspace/ipc", false));
        for extra in &config.additional_mounts {
            mounts.push(bind(&extra.host_path, &extra.container_path, !extra.read_write));
        }
        mounts
    }

    async fn ensure_image(&self, image: &str) -> Result<()> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }
        let opts = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(opts), None, None);
        while let Some(item) = stream.next().await {
            item.map_err(SupervisorError::SpawnFailed)?;
        }
        Ok(())
    }

    /// Spawns a single run, streaming each parsed chunk to `on_output`
    /// as it arrives. Returns once the container exits or a timeout
    /// forces a stop.
    pub async fn run(
        &self,
        input: RunInput,
        config: RunConfig,
        on_output: impl Fn(OutputChunk) + Send + 'static,
    ) -> Result<RunOutcome> {
        self.ensure_image(&config.image).await?;

        let mounts = self.assemble_mounts(&config);
        let host_config = HostConfig {
            mounts: Some(mounts),
            cap_drop: Some(vec!["ALL".to_string()]),
            cap_add: Some(vec!["SYS_ADMIN".to_string()]),
            security_opt: Some(vec!["no-new-privileges".to_string()]),
            pids_limit: Some(512),
            extra_hosts: Some(vec!["metadata.google.internal:0.0.0.0".to_string()]),
            ..Default::default()
        };

        let mut env = vec![format!("TZ={}", config.timezone)];
        let user = if config.host_uid != 0 && config.host_uid != 1000 {
            Some(config.host_uid.to_string())
        } else {
            None
        };
        env.push(format!("CLAWCODE_ASSISTANT={}", input.assistant_name));

        let container_config = Config {
            image: Some(config.image.clone()),
            env: Some(env),
            host_config: Some(host_config),
            user,
            open_stdin: Some(true),
            stdin_once: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(false),
            ..Default::default()
        };

        let container_name = format!("codeclaw-{}-{}", config.group_folder_path.display(), uuid::Uuid::new_v4());
        let create_opts = CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };
        let response = self
            .docker
            .create_container(Some(create_opts), container_config)
            .await
            .map_err(SupervisorError::SpawnFailed)?;
        let container_id = response.id;

        let attach_opts = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            ..Default::default()
        };
        let AttachContainerResults { mut output, mut input: stdin_sink } = self
            .docker
            .attach_container(&container_id, Some(attach_opts))
            .await
            .map_err(SupervisorError::SpawnFailed)?;

        self.docker
            .start_container::<String>(&container_id, None)
            .await
            .map_err(SupervisorError::SpawnFailed)?;

        let stdin_payload = serde_json::to_vec(&input).unwrap_or_default();
        stdin_sink
            .write_all(&stdin_payload)
            .await
            .map_err(|e| SupervisorError::SpawnFailed(bollard::errors::Error::IOError { err: e }))?;
        let _ = stdin_sink.shutdown().await;
        drop(stdin_sink);

        let hard_timeout = config.container_timeout.max(config.idle_timeout + IDLE_TIMEOUT_SLACK);
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<OutputChunk>();

        let mut buffer = String::new();
        let mut stderr_tail: Vec<u8> = Vec::new();
        let mut total_bytes = 0usize;
        let mut truncated = false;
        let mut any_chunk_emitted = false;

        let deadline = tokio::time::sleep(hard_timeout);
        tokio::pin!(deadline);
        let idle = tokio::time::sleep(config.idle_timeout);
        tokio::pin!(idle);

        let drain_task = tokio::spawn(async move {
            while let Some(chunk) = chunk_rx.recv().await {
                on_output(chunk);
            }
        });

        loop {
            tokio::select! {
                item = output.next() => {
                    match item {
                        Some(Ok(log)) => {
                            let bytes = log.into_bytes();
                            total_bytes += bytes.len();
                            if total_bytes > MAX_OUTPUT_BYTES {
                                truncated = true;
                                continue;
                            }
                            if let Ok(text) = std::str::from_utf8(&bytes) {
                                buffer.push_str(text);
                            }
                            stderr_tail.extend_from_slice(&bytes);
                            if stderr_tail.len() > 200 {
                                let drop_n = stderr_tail.len() - 200;
                                stderr_tail.drain(0..drop_n);
                            }
                            while let Some((chunk, rest)) = extract_chunk(&buffer) {
                                buffer = rest;
                                any_chunk_emitted = true;
                                idle.as_mut().reset(tokio::time::Instant::now() + config.idle_timeout);
                                let _ = chunk_tx.send(chunk);
                            }
                        }
                        Some(Err(_)) | None => break,
                    }
                }
                _ = &mut idle => {
                    self.graceful_stop(&container_id).await;
                    break;
                }
                _ = &mut deadline => {
                    self.graceful_stop(&container_id).await;
                    break;
                }
            }
        }

        drop(chunk_tx);
        let _ = drain_task.await;

        let exit_code = self.docker.inspect_container(&container_id, None).await.ok()
            .and_then(|c| c.state)
            .and_then(|s| s.exit_code)
            .unwrap_or(-1);

        let _ = self
            .docker
            .remove_container(&container_id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
            .await;

        if exit_code != 0 && !any_chunk_emitted {
            return Err(SupervisorError::NonZeroExitNoOutput {
                exit_code,
                stderr_tail: String::from_utf8_lossy(&stderr_tail).to_string(),
            });
        }

        let outcome = if truncated || exit_code == 0 || any_chunk_emitted {
            RunOutcome::Success { chunks: Vec::new() }
        } else {
            RunOutcome::Error {
                message: String::from_utf8_lossy(&stderr_tail).to_string(),
            }
        };
        Ok(outcome)
    }

    async fn graceful_stop(&self, container_id: &str) {
        let stop_opts = StopContainerOptions { t: 10 };
        if self.docker.stop_container(container_id, Some(stop_opts)).await.is_err() {
            let _ = self
                .docker
                .remove_container(container_id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
                .await;
        }
    }
}

fn bind(host: &PathBuf, container: &str, read_only: bool) -> Mount {
    Mount {
        target: Some(container.to_string()),
        source: Some(host.to_string_lossy().to_string()),
        typ: Some(MountTypeEnum::BIND),
        read_only: Some(read_only),
        ..Default::default()
    }
}

/// Extracts the first complete marker pair from `buffer`, returning the
/// parsed chunk and the remainder of the buffer after the end marker.
/// Text outside markers is diagnostic and is discarded.
fn extract_chunk(buffer: &str) -> Option<(OutputChunk, String)> {
    let start = buffer.find(START_MARKER)?;
    let after_start = start + START_MARKER.len();
    let end = buffer[after_start..].find(END_MARKER)?;
    let json_slice = &buffer[after_start..after_start + end];
    let rest = buffer[after_start + end + END_MARKER.len()..].to_string();
    match serde_json::from_str::<OutputChunk>(json_slice.trim()) {
        Ok(chunk) => Some((chunk, rest)),
        Err(_) => Some((
            OutputChunk {
                status: "error".to_string(),
                result: None,
                new_session_id: None,
                error: Some("malformed output chunk".to_string()),
            },
            rest,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_chunk_parses_single_pair() {
        let buffer = format!(
            "diagnostic noise\n{START_MARKER}\n{{\"status\":\"success\",\"result\":\"ok\",\"newSessionId\":null,\"error\":null}}\n{END_MARKER}\ntrailing"
        );
        let (chunk, rest) = extract_chunk(&buffer).unwrap();
        assert_eq!(chunk.status, "success");
        assert_eq!(chunk.result.as_deref(), Some("ok"));
        assert_eq!(rest, "\ntrailing");
    }

    #[test]
    fn extract_chunk_returns_none_without_complete_pair() {
        let buffer = format!("{START_MARKER}\n{{\"status\":\"success\"}}");
        assert!(extract_chunk(&buffer).is_none());
    }

    #[test]
    fn extract_chunk_handles_multiple_pairs_in_sequence() {
        let buffer = format!(
            "{START_MARKER}\n{{\"status\":\"success\",\"result\":\"a\",\"newSessionId\":null,\"error\":null}}\n{END_MARKER}{START_MARKER}\n{{\"status\":\"success\",\"result\":\"b\",\"newSessionId\":null,\"error\":null}}\n{END_MARKER}"
        );
        let (first, rest) = extract_chunk(&buffer).unwrap();
        assert_eq!(first.result.as_deref(), Some("a"));
        let (second, rest2) = extract_chunk(&rest).unwrap();
        assert_eq!(second.result.as_deref(), Some("b"));
        assert!(rest2.is_empty());
    }

    #[test]
    fn extract_chunk_marks_malformed_json_as_error_without_dropping_stream() {
        let buffer = format!("{START_MARKER}\nnot json{END_MARKER}tail");
        let (chunk, rest) = extract_chunk(&buffer).unwrap();
        assert_eq!(chunk.status, "error");
        assert_eq!(rest, "tail");
    }
}
