use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    InspectContainerOptions, LogOutput, RemoveContainerOptions, ResizeContainerTtyOptions,
    StartContainerOptions, StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerStateStatusEnum, HostConfig};
use futures::StreamExt;
use tokio_util::io::StreamReader;

use crate::errors::{BackendError, ProvisionError};
use crate::sessions::models::{BackendKind, PullPolicy};

use super::{BackendDriver, ExecOutput, SandboxHandle, SandboxSpec, SandboxStream, with_timeout};

/// Seconds a container gets to exit after SIGTERM before it is killed.
const STOP_GRACE_SECS: i64 = 10;

/// Local container backend on the Docker Engine API.
pub struct DockerDriver {
    docker: Docker,
}

impl DockerDriver {
    pub fn connect() -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to Docker")?;
        Ok(Self { docker })
    }

    /// Whether the engine answers. Used for a startup warning only.
    pub async fn ping(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    async fn image_present(&self, image: &str) -> Result<bool, ProvisionError> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(provision_error(image, e)),
        }
    }

    async fn pull_image(&self, image: &str) -> Result<(), ProvisionError> {
        tracing::info!(image, "pulling image");
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(step) = progress.next().await {
            if let Err(e) = step {
                return Err(match e {
                    bollard::errors::Error::DockerResponseServerError { message, .. } => {
                        ProvisionError::ImagePullFailed {
                            image: image.to_string(),
                            reason: message,
                        }
                    }
                    other => provision_error(image, other),
                });
            }
        }
        Ok(())
    }

    async fn ensure_image(&self, spec: &SandboxSpec) -> Result<(), ProvisionError> {
        match spec.pull_policy {
            PullPolicy::Always => self.pull_image(&spec.image).await,
            PullPolicy::IfNotPresent => {
                if self.image_present(&spec.image).await? {
                    Ok(())
                } else {
                    self.pull_image(&spec.image).await
                }
            }
            PullPolicy::Never => {
                if self.image_present(&spec.image).await? {
                    Ok(())
                } else {
                    Err(ProvisionError::ImagePullFailed {
                        image: spec.image.clone(),
                        reason: "image not present locally and pull policy is never".to_string(),
                    })
                }
            }
        }
    }

    fn container_config(spec: &SandboxSpec) -> Config<String> {
        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        let labels: HashMap<String, String> = spec.labels.clone().into_iter().collect();
        Config {
            image: Some(spec.image.clone()),
            cmd: spec.command.clone(),
            env: Some(env),
            working_dir: Some(spec.workdir.clone()),
            labels: Some(labels),
            tty: Some(true),
            open_stdin: Some(true),
            attach_stdin: Some(true),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            host_config: Some(HostConfig {
                memory: spec.resources.memory_bytes(),
                nano_cpus: Some(spec.resources.nano_cpus()),
                auto_remove: Some(false),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

#[async_trait]
impl BackendDriver for DockerDriver {
    fn kind(&self) -> BackendKind {
        BackendKind::LocalContainer
    }

    async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle, ProvisionError> {
        self.ensure_image(spec).await?;

        // Leftover from an interrupted attempt.
        match self
            .docker
            .remove_container(
                &spec.name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => tracing::debug!(container = %spec.name, "removed stale container"),
            Err(e) if is_not_found(&e) => {}
            Err(e) => return Err(provision_error(&spec.image, e)),
        }

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };
        self.docker
            .create_container(Some(options), Self::container_config(spec))
            .await
            .map_err(|e| provision_error(&spec.image, e))?;

        self.docker
            .start_container(&spec.name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| provision_error(&spec.image, e))?;

        tracing::info!(container = %spec.name, image = %spec.image, "container started");
        Ok(spec.handle())
    }

    async fn attach_stream(&self, handle: &SandboxHandle) -> Result<SandboxStream, BackendError> {
        let options = AttachContainerOptions::<String> {
            stdin: Some(true),
            stdout: Some(true),
            stderr: Some(true),
            stream: Some(true),
            logs: Some(false),
            detach_keys: None,
        };
        let AttachContainerResults { output, input } = self
            .docker
            .attach_container(&handle.name, Some(options))
            .await
            .map_err(|e| backend_error(&handle.name, e))?;

        let chunks = output.map(|item| {
            item.map(LogOutput::into_bytes)
                .map_err(|e| std::io::Error::other(e.to_string()))
        });
        Ok(SandboxStream {
            reader: Box::pin(StreamReader::new(chunks)),
            writer: input,
        })
    }

    async fn exec(
        &self,
        handle: &SandboxHandle,
        argv: &[String],
        timeout: Duration,
    ) -> Result<ExecOutput, BackendError> {
        let name = handle.name.clone();
        with_timeout(timeout, async {
            let exec = self
                .docker
                .create_exec(
                    &name,
                    CreateExecOptions {
                        cmd: Some(argv.to_vec()),
                        attach_stdout: Some(true),
                        attach_stderr: Some(true),
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| backend_error(&name, e))?;

            let mut stdout = String::new();
            let mut stderr = String::new();
            if let StartExecResults::Attached { mut output, .. } = self
                .docker
                .start_exec(&exec.id, None)
                .await
                .map_err(|e| backend_error(&name, e))?
            {
                while let Some(msg) = output.next().await {
                    match msg.map_err(|e| backend_error(&name, e))? {
                        LogOutput::StdOut { message } | LogOutput::Console { message } => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        LogOutput::StdErr { message } => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        LogOutput::StdIn { .. } => {}
                    }
                }
            }

            let inspect = self
                .docker
                .inspect_exec(&exec.id)
                .await
                .map_err(|e| backend_error(&name, e))?;

            Ok(ExecOutput {
                stdout,
                stderr,
                exit_code: inspect.exit_code.unwrap_or(-1),
            })
        })
        .await
    }

    async fn resize(&self, handle: &SandboxHandle, rows: u16, cols: u16) -> Result<(), BackendError> {
        self.docker
            .resize_container_tty(
                &handle.name,
                ResizeContainerTtyOptions {
                    height: rows,
                    width: cols,
                },
            )
            .await
            .map_err(|e| backend_error(&handle.name, e))
    }

    async fn stop(&self, handle: &SandboxHandle) -> Result<(), BackendError> {
        match self
            .docker
            .stop_container(&handle.name, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) || is_not_modified(&e) => Ok(()),
            Err(e) => Err(backend_error(&handle.name, e)),
        }
    }

    async fn remove(&self, handle: &SandboxHandle) -> Result<(), BackendError> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(&handle.name, Some(options)).await {
            Ok(()) => {
                tracing::info!(container = %handle, "container removed");
                Ok(())
            }
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(backend_error(&handle.name, e)),
        }
    }

    async fn exists(&self, handle: &SandboxHandle) -> Result<bool, BackendError> {
        match self
            .docker
            .inspect_container(&handle.name, None::<InspectContainerOptions>)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(backend_error(&handle.name, e)),
        }
    }

    async fn exit_status(&self, handle: &SandboxHandle) -> Result<Option<i64>, BackendError> {
        let info = self
            .docker
            .inspect_container(&handle.name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| backend_error(&handle.name, e))?;
        Ok(info.state.and_then(|state| {
            if state.status == Some(ContainerStateStatusEnum::EXITED) {
                state.exit_code
            } else {
                None
            }
        }))
    }
}

// ── Error mapping ─────────────────────────────────────────────────────

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn is_not_modified(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 304,
            ..
        }
    )
}

fn provision_error(image: &str, e: bollard::errors::Error) -> ProvisionError {
    match e {
        bollard::errors::Error::DockerResponseServerError { message, .. }
            if is_quota_message(&message) =>
        {
            ProvisionError::ResourceQuotaExceeded(message)
        }
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message,
        } => ProvisionError::ImagePullFailed {
            image: image.to_string(),
            reason: message,
        },
        other => ProvisionError::Unavailable(other.to_string()),
    }
}

fn is_quota_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("quota") || lower.contains("insufficient") || lower.contains("no space left")
}

fn backend_error(name: &str, e: bollard::errors::Error) -> BackendError {
    if is_not_found(&e) {
        BackendError::NotFound(name.to_string())
    } else {
        BackendError::Engine(e.to_string())
    }
}
