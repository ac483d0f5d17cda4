//! In-memory [`ContainerDriver`] for exercising the lifecycle without a
//! Docker daemon.
//!
//! Script execs replay configurable output and exit codes, and — like the
//! real engine — leave the exit code undefined until their output stream has
//! been drained. PTY execs echo whatever is written to their stdin back out,
//! which is enough to drive the terminal relay end to end.

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use proto::EngineError;
use tokio::io::AsyncWrite;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::driver::{ContainerDriver, ContainerSpec, ExecSpec, ExecStatus, ExecStream};

struct FakeContainer {
    spec: ContainerSpec,
    running: bool,
    executed_scripts: Vec<String>,
}

struct FakeExec {
    container_id: String,
    tty: bool,
    /// Script path for non-PTY execs; `None` marks an interactive shell.
    script: Option<String>,
    exit_code: i64,
    output: Vec<u8>,
    drained: Arc<AtomicBool>,
}

#[derive(Default)]
struct FakeState {
    images: HashSet<String>,
    containers: HashMap<String, FakeContainer>,
    execs: HashMap<String, FakeExec>,
    script_exits: HashMap<String, i64>,
    script_outputs: HashMap<String, Vec<u8>>,
    builds: usize,
    creates: usize,
    removes: usize,
    fail_build: bool,
    fail_create: bool,
    fail_stop: bool,
    fail_remove: bool,
    fail_remove_once: HashSet<String>,
    fail_exec_start: bool,
    build_delay: Option<Duration>,
    next_container: u64,
    next_exec: u64,
}

/// Scriptable in-memory container engine.
#[derive(Default)]
pub struct FakeDriver {
    state: Mutex<FakeState>,
}

impl FakeDriver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().expect("fake driver state poisoned")
    }

    /// Pre-register an image tag as already built.
    pub fn add_image(&self, name: &str) {
        self.lock().images.insert(name.to_string());
    }

    /// Make every build take this long, to widen race windows in tests.
    pub fn set_build_delay(&self, delay: Duration) {
        self.lock().build_delay = Some(delay);
    }

    /// Exit code for script execs whose path ends with `script_name`.
    pub fn set_script_exit(&self, script_name: &str, code: i64) {
        self.lock()
            .script_exits
            .insert(script_name.to_string(), code);
    }

    /// Output replayed by script execs whose path ends with `script_name`.
    pub fn set_script_output(&self, script_name: &str, output: Vec<u8>) {
        self.lock()
            .script_outputs
            .insert(script_name.to_string(), output);
    }

    pub fn fail_build(&self, fail: bool) {
        self.lock().fail_build = fail;
    }

    pub fn fail_create(&self, fail: bool) {
        self.lock().fail_create = fail;
    }

    pub fn fail_stop(&self, fail: bool) {
        self.lock().fail_stop = fail;
    }

    pub fn fail_remove(&self, fail: bool) {
        self.lock().fail_remove = fail;
    }

    /// Fail exactly the next removal of this container id.
    pub fn fail_remove_once_for(&self, id: &str) {
        self.lock().fail_remove_once.insert(id.to_string());
    }

    pub fn fail_exec_start(&self, fail: bool) {
        self.lock().fail_exec_start = fail;
    }

    pub fn build_count(&self) -> usize {
        self.lock().builds
    }

    pub fn create_count(&self) -> usize {
        self.lock().creates
    }

    pub fn remove_count(&self) -> usize {
        self.lock().removes
    }

    pub fn container_exists(&self, id: &str) -> bool {
        self.lock().containers.contains_key(id)
    }

    pub fn container_running(&self, id: &str) -> bool {
        self.lock()
            .containers
            .get(id)
            .map(|c| c.running)
            .unwrap_or(false)
    }

    /// Spec the container was created with.
    pub fn container_spec(&self, id: &str) -> Option<ContainerSpec> {
        self.lock().containers.get(id).map(|c| c.spec.clone())
    }

    /// Script paths executed inside the container, in order.
    pub fn executed_scripts(&self, id: &str) -> Vec<String> {
        self.lock()
            .containers
            .get(id)
            .map(|c| c.executed_scripts.clone())
            .unwrap_or_default()
    }

    /// Whether the exec was created with a TTY.
    pub fn exec_was_tty(&self, exec_id: &str) -> bool {
        self.lock()
            .execs
            .get(exec_id)
            .map(|e| e.tty)
            .unwrap_or(false)
    }

    fn script_settings(state: &FakeState, path: &str) -> (i64, Vec<u8>) {
        for (name, code) in &state.script_exits {
            if path.ends_with(name.as_str()) {
                let output = Self::script_output_for(state, path);
                return (*code, output);
            }
        }
        (0, Self::script_output_for(state, path))
    }

    fn script_output_for(state: &FakeState, path: &str) -> Vec<u8> {
        for (name, output) in &state.script_outputs {
            if path.ends_with(name.as_str()) {
                return output.clone();
            }
        }
        Vec::new()
    }
}

#[async_trait]
impl ContainerDriver for FakeDriver {
    async fn image_exists(&self, name: &str) -> Result<bool, EngineError> {
        Ok(self.lock().images.contains(name))
    }

    async fn build_image(&self, name: &str, _dockerfile: &[u8]) -> Result<(), EngineError> {
        let delay = {
            let state = self.lock();
            if state.fail_build {
                return Err(EngineError::Build("injected build failure".into()));
            }
            state.build_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        state.builds += 1;
        state.images.insert(name.to_string());
        Ok(())
    }

    async fn create_container(&self, spec: ContainerSpec) -> Result<String, EngineError> {
        let mut state = self.lock();
        if state.fail_create {
            return Err(EngineError::Engine("injected create failure".into()));
        }
        if state.containers.values().any(|c| c.spec.name == spec.name) {
            return Err(EngineError::AlreadyExists(spec.name));
        }

        state.next_container += 1;
        let id = format!("ctr-{:04}", state.next_container);
        state.creates += 1;
        state.containers.insert(
            id.clone(),
            FakeContainer {
                spec,
                running: false,
                executed_scripts: Vec::new(),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), EngineError> {
        let mut state = self.lock();
        match state.containers.get_mut(id) {
            Some(container) => {
                container.running = true;
                Ok(())
            }
            None => Err(EngineError::NotFound(format!("no such container: {id}"))),
        }
    }

    async fn stop_container(&self, id: &str, _grace_secs: i64) -> Result<(), EngineError> {
        let mut state = self.lock();
        if state.fail_stop {
            return Err(EngineError::Engine("injected stop failure".into()));
        }
        match state.containers.get_mut(id) {
            Some(container) => {
                container.running = false;
                Ok(())
            }
            None => Err(EngineError::NotFound(format!("no such container: {id}"))),
        }
    }

    async fn remove_container(&self, id: &str, _force: bool) -> Result<(), EngineError> {
        let mut state = self.lock();
        if state.fail_remove {
            return Err(EngineError::Engine("injected remove failure".into()));
        }
        if state.fail_remove_once.remove(id) {
            return Err(EngineError::Engine("injected one-shot remove failure".into()));
        }
        match state.containers.remove(id) {
            Some(_) => {
                state.removes += 1;
                Ok(())
            }
            None => Err(EngineError::NotFound(format!("no such container: {id}"))),
        }
    }

    async fn exec_create(&self, id: &str, spec: ExecSpec) -> Result<String, EngineError> {
        let mut state = self.lock();
        if !state.containers.contains_key(id) {
            return Err(EngineError::NotFound(format!("no such container: {id}")));
        }

        let script = if spec.cmd.len() == 2 && spec.cmd[0] == "/bin/bash" {
            Some(spec.cmd[1].clone())
        } else {
            None
        };

        let (exit_code, output) = match &script {
            Some(path) => Self::script_settings(&state, path),
            None => (0, Vec::new()),
        };

        state.next_exec += 1;
        let exec_id = format!("exec-{:04}", state.next_exec);
        state.execs.insert(
            exec_id.clone(),
            FakeExec {
                container_id: id.to_string(),
                tty: spec.tty,
                script,
                exit_code,
                output,
                drained: Arc::new(AtomicBool::new(false)),
            },
        );
        Ok(exec_id)
    }

    async fn exec_start(&self, exec_id: &str, _tty: bool) -> Result<ExecStream, EngineError> {
        let mut state = self.lock();
        if state.fail_exec_start {
            return Err(EngineError::Engine("injected exec failure".into()));
        }

        let (script, container_id, output, drained) = {
            let exec = state
                .execs
                .get(exec_id)
                .ok_or_else(|| EngineError::NotFound(format!("no such exec: {exec_id}")))?;
            (
                exec.script.clone(),
                exec.container_id.clone(),
                exec.output.clone(),
                exec.drained.clone(),
            )
        };

        match script {
            Some(path) => {
                if let Some(container) = state.containers.get_mut(&container_id) {
                    container.executed_scripts.push(path);
                }

                // Replay scripted chunks, then flip the drained flag so the
                // exit code becomes defined — mirroring engine semantics.
                let mut chunks: VecDeque<Bytes> = VecDeque::new();
                for piece in output.chunks(512) {
                    chunks.push_back(Bytes::copy_from_slice(piece));
                }
                let stream =
                    futures_util::stream::unfold((chunks, drained), |(mut chunks, drained)| async move {
                        match chunks.pop_front() {
                            Some(chunk) => {
                                Some((Ok::<Bytes, EngineError>(chunk), (chunks, drained)))
                            }
                            None => {
                                drained.store(true, Ordering::SeqCst);
                                None
                            }
                        }
                    });

                Ok(ExecStream {
                    output: Box::pin(stream),
                    input: Box::pin(tokio::io::sink()),
                })
            }
            None => {
                // Interactive PTY: echo stdin back as output.
                let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Bytes>();
                Ok(ExecStream {
                    output: Box::pin(
                        UnboundedReceiverStream::new(rx).map(Ok::<Bytes, EngineError>),
                    ),
                    input: Box::pin(EchoWriter { tx }),
                })
            }
        }
    }

    async fn exec_inspect(&self, exec_id: &str) -> Result<ExecStatus, EngineError> {
        let state = self.lock();
        let exec = state
            .execs
            .get(exec_id)
            .ok_or_else(|| EngineError::NotFound(format!("no such exec: {exec_id}")))?;

        if exec.script.is_some() && exec.drained.load(Ordering::SeqCst) {
            Ok(ExecStatus {
                exit_code: Some(exec.exit_code),
                running: false,
            })
        } else {
            Ok(ExecStatus {
                exit_code: None,
                running: true,
            })
        }
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<String>, EngineError> {
        let state = self.lock();
        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| c.spec.labels.contains_key(label))
            .map(|(id, _)| id.clone())
            .collect())
    }
}

/// AsyncWrite half of the fake PTY: every write is echoed to the output
/// channel; dropping it ends the output stream.
struct EchoWriter {
    tx: tokio::sync::mpsc::UnboundedSender<Bytes>,
}

impl AsyncWrite for EchoWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.tx.send(Bytes::copy_from_slice(buf)).is_err() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "pty output closed",
            )));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}
