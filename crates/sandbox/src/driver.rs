//! Thin capability layer over the Docker Engine API.
//!
//! The driver encapsulates every engine call and classifies engine responses
//! into [`EngineError`]. It performs no retries and holds no lifecycle
//! policy; both live in the [`manager`](crate::manager) above it.

use std::collections::HashMap;
use std::pin::Pin;

use async_trait::async_trait;
use bollard::Docker;
use bollard::body_full;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    BuildImageOptionsBuilder, CreateContainerOptionsBuilder, ListContainersOptionsBuilder,
    RemoveContainerOptionsBuilder, StartContainerOptions, StopContainerOptionsBuilder,
};
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use proto::EngineError;
use tokio::io::AsyncWrite;
use tracing::debug;

/// Boxed chunk stream produced by an attached exec.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, EngineError>> + Send>>;

/// Duplex byte channel of a started exec.
///
/// `output` is everything the process writes; `input` feeds its stdin.
/// Callers that only care about the exit code must still drain `output` to
/// end-of-stream before inspecting the exec.
pub struct ExecStream {
    pub output: ByteStream,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

/// One bind mount entry of a container spec.
#[derive(Debug, Clone)]
pub struct BindMount {
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl BindMount {
    fn to_bind_string(&self) -> String {
        if self.read_only {
            format!("{}:{}:ro", self.source, self.target)
        } else {
            format!("{}:{}", self.source, self.target)
        }
    }
}

/// Everything needed to create one container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub name: String,
    pub tty: bool,
    pub binds: Vec<BindMount>,
    pub memory_bytes: i64,
    pub cpu_nanocores: i64,
    pub pids_limit: i64,
    pub network_mode: String,
    pub labels: HashMap<String, String>,
}

/// Parameters of one exec inside a running container.
#[derive(Debug, Clone)]
pub struct ExecSpec {
    pub cmd: Vec<String>,
    pub attach_stdin: bool,
    pub attach_stdout: bool,
    pub attach_stderr: bool,
    pub tty: bool,
}

/// Result of inspecting an exec. `exit_code` is undefined while the output
/// stream has not been fully consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecStatus {
    pub exit_code: Option<i64>,
    pub running: bool,
}

/// Capability over a container engine.
#[async_trait]
pub trait ContainerDriver: Send + Sync {
    /// Whether an image with this tag exists locally.
    async fn image_exists(&self, name: &str) -> Result<bool, EngineError>;

    /// Build an image from a single in-memory Dockerfile.
    async fn build_image(&self, name: &str, dockerfile: &[u8]) -> Result<(), EngineError>;

    /// Create a container and return its engine id.
    async fn create_container(&self, spec: ContainerSpec) -> Result<String, EngineError>;

    async fn start_container(&self, id: &str) -> Result<(), EngineError>;

    /// Stop with a grace period before the engine kills the process.
    async fn stop_container(&self, id: &str, grace_secs: i64) -> Result<(), EngineError>;

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError>;

    /// Create an exec instance; it does not run until started.
    async fn exec_create(&self, id: &str, spec: ExecSpec) -> Result<String, EngineError>;

    /// Start an exec attached, returning its duplex stream. `tty` must match
    /// the flag given at creation: with a TTY the engine emits raw bytes,
    /// without one it multiplexes stdout/stderr behind framing headers.
    async fn exec_start(&self, exec_id: &str, tty: bool) -> Result<ExecStream, EngineError>;

    async fn exec_inspect(&self, exec_id: &str) -> Result<ExecStatus, EngineError>;

    /// Ids of containers carrying the given label key, running or not.
    async fn list_containers(&self, label: &str) -> Result<Vec<String>, EngineError>;
}

/// [`ContainerDriver`] implementation over the local Docker socket.
pub struct DockerDriver {
    docker: Docker,
}

impl DockerDriver {
    /// Connect using the platform's default socket.
    pub fn connect() -> Result<Self, EngineError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| EngineError::Engine(format!("Failed to connect to Docker daemon: {e}")))?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerDriver for DockerDriver {
    async fn image_exists(&self, name: &str) -> Result<bool, EngineError> {
        match self.docker.inspect_image(name).await {
            Ok(_) => Ok(true),
            Err(e) => match classify(e) {
                EngineError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }

    async fn build_image(&self, name: &str, dockerfile: &[u8]) -> Result<(), EngineError> {
        let context = build_context_tar(dockerfile)?;
        let options = BuildImageOptionsBuilder::default()
            .dockerfile("Dockerfile")
            .t(name)
            .rm(true)
            .build();

        let mut stream = self
            .docker
            .build_image(options, None, Some(body_full(context.into())));

        while let Some(item) = stream.next().await {
            let info = item.map_err(|e| EngineError::Build(e.to_string()))?;
            if let Some(message) = info.error {
                return Err(EngineError::Build(message));
            }
            if let Some(step) = info.stream
                && !step.trim().is_empty()
            {
                debug!("build[{name}]: {}", step.trim_end());
            }
        }

        Ok(())
    }

    async fn create_container(&self, spec: ContainerSpec) -> Result<String, EngineError> {
        let binds: Vec<String> = spec.binds.iter().map(BindMount::to_bind_string).collect();

        let host_config = HostConfig {
            binds: if binds.is_empty() { None } else { Some(binds) },
            memory: Some(spec.memory_bytes),
            nano_cpus: Some(spec.cpu_nanocores),
            pids_limit: Some(spec.pids_limit),
            network_mode: Some(spec.network_mode.clone()),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            ..Default::default()
        };

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            cmd: Some(vec!["/bin/bash".to_string()]),
            tty: Some(spec.tty),
            open_stdin: Some(spec.tty),
            labels: Some(spec.labels.clone()),
            host_config: Some(host_config),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(
                Some(
                    CreateContainerOptionsBuilder::default()
                        .name(&spec.name)
                        .build(),
                ),
                body,
            )
            .await
            .map_err(classify)?;

        Ok(created.id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await
            .map_err(classify)
    }

    async fn stop_container(&self, id: &str, grace_secs: i64) -> Result<(), EngineError> {
        self.docker
            .stop_container(
                id,
                Some(
                    StopContainerOptionsBuilder::default()
                        .t(grace_secs as i32)
                        .build(),
                ),
            )
            .await
            .map_err(classify)
    }

    async fn remove_container(&self, id: &str, force: bool) -> Result<(), EngineError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptionsBuilder::default().force(force).build()),
            )
            .await
            .map_err(classify)
    }

    async fn exec_create(&self, id: &str, spec: ExecSpec) -> Result<String, EngineError> {
        let created = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(spec.cmd),
                    attach_stdin: Some(spec.attach_stdin),
                    attach_stdout: Some(spec.attach_stdout),
                    attach_stderr: Some(spec.attach_stderr),
                    tty: Some(spec.tty),
                    ..Default::default()
                },
            )
            .await
            .map_err(classify)?;

        Ok(created.id)
    }

    async fn exec_start(&self, exec_id: &str, tty: bool) -> Result<ExecStream, EngineError> {
        let started = self
            .docker
            .start_exec(
                exec_id,
                Some(StartExecOptions {
                    detach: false,
                    tty,
                    ..Default::default()
                }),
            )
            .await
            .map_err(classify)?;

        match started {
            StartExecResults::Attached { output, input } => Ok(ExecStream {
                output: Box::pin(output.map(|item| {
                    item.map(|log| log.into_bytes())
                        .map_err(|e| EngineError::Engine(e.to_string()))
                })),
                input,
            }),
            StartExecResults::Detached => Err(EngineError::Engine(
                "exec started detached, expected attached stream".to_string(),
            )),
        }
    }

    async fn exec_inspect(&self, exec_id: &str) -> Result<ExecStatus, EngineError> {
        let inspect = self.docker.inspect_exec(exec_id).await.map_err(classify)?;
        Ok(ExecStatus {
            exit_code: inspect.exit_code,
            running: inspect.running.unwrap_or(false),
        })
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<String>, EngineError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);

        let containers = self
            .docker
            .list_containers(Some(
                ListContainersOptionsBuilder::default()
                    .all(true)
                    .filters(&filters)
                    .build(),
            ))
            .await
            .map_err(classify)?;

        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}

/// Classifies a bollard error into the driver taxonomy.
fn classify(err: bollard::errors::Error) -> EngineError {
    use bollard::errors::Error::DockerResponseServerError;
    match err {
        DockerResponseServerError {
            status_code: 404,
            message,
        } => EngineError::NotFound(message),
        DockerResponseServerError {
            status_code: 409,
            message,
        } => EngineError::AlreadyExists(message),
        other => EngineError::Engine(other.to_string()),
    }
}

/// Packs a single Dockerfile into the tar build context the engine expects.
fn build_context_tar(dockerfile: &[u8]) -> Result<Vec<u8>, EngineError> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(dockerfile.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();

    builder
        .append_data(&mut header, "Dockerfile", dockerfile)
        .map_err(|e| EngineError::Build(format!("Failed to build context archive: {e}")))?;

    builder
        .into_inner()
        .map_err(|e| EngineError::Build(format!("Failed to finalize context archive: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_mount_renders_read_only_suffix() {
        let ro = BindMount {
            source: "/srv/challenges/one".into(),
            target: "/challenge".into(),
            read_only: true,
        };
        assert_eq!(ro.to_bind_string(), "/srv/challenges/one:/challenge:ro");

        let rw = BindMount {
            source: "/tmp/scratch".into(),
            target: "/scratch".into(),
            read_only: false,
        };
        assert_eq!(rw.to_bind_string(), "/tmp/scratch:/scratch");
    }

    #[test]
    fn classify_maps_engine_status_codes() {
        let not_found = classify(bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "no such container".into(),
        });
        assert!(matches!(not_found, EngineError::NotFound(_)));

        let conflict = classify(bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "name in use".into(),
        });
        assert!(matches!(conflict, EngineError::AlreadyExists(_)));

        let other = classify(bollard::errors::Error::DockerResponseServerError {
            status_code: 500,
            message: "boom".into(),
        });
        assert!(matches!(other, EngineError::Engine(_)));
    }

    #[test]
    fn build_context_contains_single_dockerfile_entry() {
        let archive = build_context_tar(b"FROM debian:bookworm-slim\n").expect("archive");
        let mut ar = tar::Archive::new(std::io::Cursor::new(archive));
        let names: Vec<String> = ar
            .entries()
            .expect("entries")
            .map(|entry| {
                entry
                    .expect("entry")
                    .path()
                    .expect("path")
                    .to_string_lossy()
                    .to_string()
            })
            .collect();
        assert_eq!(names, vec!["Dockerfile".to_string()]);
    }
}
