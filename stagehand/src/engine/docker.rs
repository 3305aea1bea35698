//! Docker implementation of [`Engine`].

use super::{ByteStream, Engine, ExecId, ExecSpec, ExitResult, UnitId, VolumeId, unit_name};
use crate::stage::{LaunchSpec, env_entries};
use crate::stream::{OutputFrame, Sink, Transport};
use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    DownloadFromContainerOptions, InspectContainerOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions, StopContainerOptions, UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, HostConfigLogConfig};
use bollard::volume::CreateVolumeOptions;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream::BoxStream;
use stagehand_shared::{StagehandError, StagehandResult};
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Engine client backed by the Docker API.
///
/// Cheap to clone; all clones share one connection pool.
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect using the standard `DOCKER_HOST` environment conventions.
    pub fn connect() -> StagehandResult<Self> {
        let docker = Docker::connect_with_defaults().map_err(engine_err)?;
        Ok(Self { docker })
    }

    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }
}

fn engine_err(e: bollard::errors::Error) -> StagehandError {
    StagehandError::Engine(e.to_string())
}

/// A finished unit or exec must carry an exit code; a missing one is never
/// taken as success.
fn exit_result(
    what: &str,
    exit_code: Option<i64>,
    running: Option<bool>,
) -> StagehandResult<ExitResult> {
    let running = running.unwrap_or(false);
    match exit_code {
        Some(exit_code) => Ok(ExitResult { exit_code, running }),
        None if running => Ok(ExitResult {
            exit_code: 0,
            running,
        }),
        None => Err(StagehandError::Engine(format!(
            "{} reported no exit code",
            what
        ))),
    }
}

fn is_not_found(e: &bollard::errors::Error) -> bool {
    matches!(
        e,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn container_config(spec: &LaunchSpec, attach_stdin: bool) -> Config<String> {
    Config {
        image: Some(spec.image.clone()),
        working_dir: spec.working_dir.clone(),
        entrypoint: spec.entrypoint.clone(),
        cmd: (!spec.command.is_empty()).then(|| spec.command.clone()),
        env: Some(env_entries(&spec.env)),
        attach_stdin: Some(attach_stdin),
        open_stdin: Some(attach_stdin),
        stdin_once: Some(attach_stdin),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        host_config: Some(HostConfig {
            binds: Some(spec.bindings.iter().map(|b| b.to_bind()).collect()),
            init: Some(spec.init),
            log_config: Some(HostConfigLogConfig {
                typ: Some("none".to_string()),
                config: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn to_frame(
    item: Result<LogOutput, bollard::errors::Error>,
) -> Option<StagehandResult<OutputFrame>> {
    match item {
        Ok(LogOutput::StdOut { message } | LogOutput::Console { message }) => {
            Some(Ok(OutputFrame::Stdout(message)))
        }
        Ok(LogOutput::StdErr { message }) => Some(Ok(OutputFrame::Stderr(message))),
        Ok(LogOutput::StdIn { .. }) => None,
        Err(e) => Some(Err(StagehandError::Stream(e.to_string()))),
    }
}

fn frames(
    output: std::pin::Pin<
        Box<dyn futures::Stream<Item = Result<LogOutput, bollard::errors::Error>> + Send>,
    >,
) -> BoxStream<'static, StagehandResult<OutputFrame>> {
    output
        .filter_map(|item| futures::future::ready(to_frame(item)))
        .boxed()
}

#[async_trait]
impl Engine for DockerEngine {
    async fn create_unit(&self, spec: &LaunchSpec, attach_stdin: bool) -> StagehandResult<UnitId> {
        let name = unit_name(&spec.name_prefix);
        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                container_config(spec, attach_stdin),
            )
            .await
            .map_err(engine_err)?;

        for warning in &response.warnings {
            tracing::warn!(unit = %name, "{}", warning);
        }
        Ok(UnitId::new(response.id))
    }

    async fn attach(&self, unit: &UnitId, stdin: bool) -> StagehandResult<Transport> {
        let AttachContainerResults { output, input } = self
            .docker
            .attach_container(
                unit.as_str(),
                Some(AttachContainerOptions::<String> {
                    stdin: Some(stdin),
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(false),
                    detach_keys: None,
                }),
            )
            .await
            .map_err(engine_err)?;

        Ok(Transport::new(frames(output), input))
    }

    async fn start(&self, unit: &UnitId) -> StagehandResult<()> {
        self.docker
            .start_container(unit.as_str(), None::<StartContainerOptions<String>>)
            .await
            .map_err(engine_err)
    }

    async fn inspect(&self, unit: &UnitId) -> StagehandResult<ExitResult> {
        let details = self
            .docker
            .inspect_container(unit.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(engine_err)?;
        let state = details.state.ok_or_else(|| {
            StagehandError::Engine(format!("unit {} reported no state", unit.short()))
        })?;

        exit_result(&format!("unit {}", unit.short()), state.exit_code, state.running)
    }

    async fn stop(&self, unit: &UnitId, timeout: Duration) -> StagehandResult<()> {
        self.docker
            .stop_container(
                unit.as_str(),
                Some(StopContainerOptions {
                    t: timeout.as_secs() as i64,
                }),
            )
            .await
            .map_err(engine_err)
    }

    async fn remove(&self, unit: &UnitId) -> StagehandResult<()> {
        self.docker
            .remove_container(
                unit.as_str(),
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(engine_err)
    }

    async fn image_exists(&self, image: &str) -> StagehandResult<bool> {
        match self.docker.inspect_image(image).await {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(engine_err(e)),
        }
    }

    async fn pull(&self, image: &str, progress: &mut Sink) -> StagehandResult<()> {
        let mut updates = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image.to_string(),
                ..Default::default()
            }),
            None,
            None,
        );

        while let Some(update) = updates.next().await {
            let update = update.map_err(engine_err)?;
            if let Some(error) = update.error {
                return Err(StagehandError::Engine(format!(
                    "pulling {} failed: {}",
                    image, error
                )));
            }
            if let Some(status) = update.status {
                let line = match update.id {
                    Some(id) => format!("{}: {}\n", id, status),
                    None => format!("{}\n", status),
                };
                progress.write_all(line.as_bytes()).await?;
            }
        }
        progress.flush().await?;
        Ok(())
    }

    async fn image_digests(&self, image: &str) -> StagehandResult<Vec<String>> {
        let details = self.docker.inspect_image(image).await.map_err(engine_err)?;
        Ok(details.repo_digests.unwrap_or_default())
    }

    async fn create_volume(&self) -> StagehandResult<VolumeId> {
        let volume = self
            .docker
            .create_volume(CreateVolumeOptions::<String>::default())
            .await
            .map_err(engine_err)?;
        Ok(VolumeId::new(volume.name))
    }

    async fn remove_volume(&self, volume: &VolumeId) -> StagehandResult<()> {
        self.docker
            .remove_volume(volume.as_str(), None)
            .await
            .map_err(engine_err)
    }

    async fn copy_from(&self, unit: &UnitId, path: &str) -> StagehandResult<ByteStream> {
        let docker = self.docker.clone();
        let unit = unit.as_str().to_string();
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };

        Ok(Box::pin(async_stream::stream! {
            let mut chunks = Box::pin(docker.download_from_container(&unit, Some(options)));
            while let Some(chunk) = chunks.next().await {
                yield chunk.map_err(engine_err);
            }
        }))
    }

    async fn copy_to(&self, unit: &UnitId, dir: &str, archive: Bytes) -> StagehandResult<()> {
        self.docker
            .upload_to_container(
                unit.as_str(),
                Some(UploadToContainerOptions {
                    path: dir.to_string(),
                    ..Default::default()
                }),
                archive,
            )
            .await
            .map_err(engine_err)
    }

    async fn create_exec(&self, unit: &UnitId, spec: &ExecSpec) -> StagehandResult<ExecId> {
        let created = self
            .docker
            .create_exec(
                unit.as_str(),
                CreateExecOptions {
                    cmd: Some(spec.command.clone()),
                    env: Some(env_entries(&spec.env)),
                    working_dir: spec.working_dir.clone(),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(engine_err)?;
        Ok(ExecId::new(created.id))
    }

    async fn start_exec(&self, exec: &ExecId) -> StagehandResult<Transport> {
        match self
            .docker
            .start_exec(exec.as_str(), None)
            .await
            .map_err(engine_err)?
        {
            StartExecResults::Attached { output, input } => {
                Ok(Transport::new(frames(output), input))
            }
            StartExecResults::Detached => Err(StagehandError::Engine(format!(
                "exec {} started detached",
                exec.short()
            ))),
        }
    }

    async fn inspect_exec(&self, exec: &ExecId) -> StagehandResult<ExitResult> {
        let details = self
            .docker
            .inspect_exec(exec.as_str())
            .await
            .map_err(engine_err)?;
        exit_result(
            &format!("exec {}", exec.short()),
            details.exit_code,
            details.running,
        )
    }
}
