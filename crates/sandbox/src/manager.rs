//! Per-challenge container lifecycle.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use futures_util::StreamExt;
use proto::{ChallengeId, SandboxError, UserId};
use store::ChallengeCatalog;
use tracing::{debug, info, warn};

use crate::driver::{BindMount, ContainerDriver, ContainerSpec, ExecSpec, ExecStream};

/// Label keys stamped onto every challenge container so the cleanup path can
/// find them without consulting the in-memory registry.
pub const LABEL_USER_ID: &str = "challenges.user_id";
pub const LABEL_CHALLENGE_ID: &str = "challenges.challenge_id";
pub const LABEL_CREATED_AT: &str = "challenges.created_at";

/// Mount target of the challenge directory inside every container.
const CHALLENGE_MOUNT: &str = "/challenge";
const SETUP_SCRIPT: &str = "setup.sh";
const VALIDATE_SCRIPT: &str = "validate.sh";

/// Cap on exec output retained for diagnostics.
const MAX_CAPTURED_OUTPUT: usize = 4096;

/// Base image with a minimum shell toolset and a non-root user. Built once,
/// lazily, when no image with the configured tag exists.
const BASE_DOCKERFILE: &str = r#"FROM debian:bookworm-slim

RUN apt-get update && apt-get install -y --no-install-recommends \
        bash \
        coreutils \
        procps \
        grep \
        sed \
        python3 \
    && rm -rf /var/lib/apt/lists/*

RUN useradd --create-home --shell /bin/bash challenger

USER challenger
WORKDIR /home/challenger

CMD ["/bin/bash"]
"#;

/// Resource and naming profile for challenge containers.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub image_name: String,
    pub memory_bytes: i64,
    pub cpu_nanocores: i64,
    pub pids_limit: i64,
    pub network_mode: String,
    pub stop_grace_secs: i64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image_name: "challenges-base:latest".to_string(),
            memory_bytes: 512 * 1024 * 1024,
            cpu_nanocores: 500_000_000,
            pids_limit: 100,
            network_mode: "none".to_string(),
            stop_grace_secs: 5,
        }
    }
}

/// An interactive shell attached inside a container.
pub struct PtySession {
    pub exec_id: String,
    pub stream: ExecStream,
}

/// Provisions, validates, and reclaims per-challenge containers.
///
/// Stateless apart from the lazily set image flag; safe to share behind an
/// `Arc` across request handlers and the cleanup loop.
pub struct ContainerManager {
    driver: Arc<dyn ContainerDriver>,
    catalog: Arc<ChallengeCatalog>,
    config: SandboxConfig,
    image_ready: tokio::sync::Mutex<bool>,
}

impl ContainerManager {
    pub fn new(
        driver: Arc<dyn ContainerDriver>,
        catalog: Arc<ChallengeCatalog>,
        config: SandboxConfig,
    ) -> Self {
        Self {
            driver,
            catalog,
            config,
            image_ready: tokio::sync::Mutex::new(false),
        }
    }

    /// Make sure the base image exists, building it if necessary.
    ///
    /// Concurrent callers serialize on the flag mutex, so at most one build
    /// runs; the rest observe the flag and return once it finishes.
    pub async fn ensure_image(&self) -> Result<(), SandboxError> {
        let mut ready = self.image_ready.lock().await;
        if *ready {
            return Ok(());
        }

        let exists = self
            .driver
            .image_exists(&self.config.image_name)
            .await
            .map_err(|e| SandboxError::ImageBuild(e.to_string()))?;

        if !exists {
            info!("Building base image {}", self.config.image_name);
            self.driver
                .build_image(&self.config.image_name, BASE_DOCKERFILE.as_bytes())
                .await
                .map_err(|e| SandboxError::ImageBuild(e.to_string()))?;
        }

        *ready = true;
        Ok(())
    }

    /// Create and start a container for one (challenge, user) pair.
    ///
    /// The challenge directory is mounted read-only at `/challenge`; if it
    /// ships a `setup.sh`, that runs to completion before the container id is
    /// returned. Any failure after creation removes the container again.
    pub async fn create_for_challenge(
        &self,
        challenge_id: ChallengeId,
        user_id: UserId,
    ) -> Result<String, SandboxError> {
        let dir = self
            .catalog
            .dir(challenge_id)
            .map_err(|_| SandboxError::ChallengeNotFound(challenge_id))?
            .to_path_buf();

        let mut labels = HashMap::new();
        labels.insert(LABEL_USER_ID.to_string(), user_id.to_string());
        labels.insert(LABEL_CHALLENGE_ID.to_string(), challenge_id.to_string());
        labels.insert(
            LABEL_CREATED_AT.to_string(),
            chrono::Utc::now().to_rfc3339(),
        );

        let spec = ContainerSpec {
            image: self.config.image_name.clone(),
            name: container_name(user_id, challenge_id),
            tty: true,
            binds: vec![BindMount {
                source: dir.display().to_string(),
                target: CHALLENGE_MOUNT.to_string(),
                read_only: true,
            }],
            memory_bytes: self.config.memory_bytes,
            cpu_nanocores: self.config.cpu_nanocores,
            pids_limit: self.config.pids_limit,
            network_mode: self.config.network_mode.clone(),
            labels,
        };

        let container_id = self
            .driver
            .create_container(spec)
            .await
            .map_err(|e| SandboxError::Create(e.to_string()))?;

        if let Err(e) = self.bootstrap(&container_id, &dir).await {
            let _ = self.driver.remove_container(&container_id, true).await;
            return Err(e);
        }

        info!("Container {container_id} ready for user {user_id} challenge {challenge_id}");
        Ok(container_id)
    }

    async fn bootstrap(&self, container_id: &str, dir: &Path) -> Result<(), SandboxError> {
        self.driver
            .start_container(container_id)
            .await
            .map_err(|e| SandboxError::Create(e.to_string()))?;

        if dir.join(SETUP_SCRIPT).is_file() {
            debug!("Running setup script in {container_id}");
            let status = self
                .run_script(container_id, format!("{CHALLENGE_MOUNT}/{SETUP_SCRIPT}"))
                .await
                .map_err(|e| SandboxError::Create(format!("setup failed: {e}")))?;
            if status != Some(0) {
                return Err(SandboxError::Create(format!(
                    "setup script exited with {status:?}"
                )));
            }
        }

        Ok(())
    }

    /// Run the challenge's validation script and report its verdict.
    ///
    /// The exec's output stream is drained to end-of-stream before the exec
    /// is inspected; the engine leaves the exit code undefined until then.
    /// Transport failures degrade to `false` so the caller still records the
    /// attempt.
    pub async fn validate(&self, container_id: &str, challenge_id: ChallengeId) -> bool {
        match self
            .run_script(container_id, format!("{CHALLENGE_MOUNT}/{VALIDATE_SCRIPT}"))
            .await
        {
            Ok(Some(0)) => true,
            Ok(code) => {
                debug!("Validation for challenge {challenge_id} in {container_id} exited {code:?}");
                false
            }
            Err(e) => {
                warn!("Validation transport error for challenge {challenge_id} in {container_id}: {e}");
                false
            }
        }
    }

    async fn run_script(
        &self,
        container_id: &str,
        script_path: String,
    ) -> Result<Option<i64>, proto::EngineError> {
        let exec_id = self
            .driver
            .exec_create(
                container_id,
                ExecSpec {
                    cmd: vec!["/bin/bash".to_string(), script_path],
                    attach_stdin: false,
                    attach_stdout: true,
                    attach_stderr: true,
                    tty: false,
                },
            )
            .await?;

        let ExecStream { mut output, input } = self.driver.exec_start(&exec_id, false).await?;
        drop(input);

        // Drain to end-of-stream; a blocked exec pipe also blocks the exit code.
        let mut captured = String::new();
        while let Some(chunk) = output.next().await {
            let bytes = chunk?;
            if captured.len() < MAX_CAPTURED_OUTPUT {
                captured.push_str(&String::from_utf8_lossy(&bytes));
            }
        }
        if !captured.trim().is_empty() {
            debug!(
                "script output from {container_id}: {}",
                truncate(&captured, MAX_CAPTURED_OUTPUT)
            );
        }

        let status = self.driver.exec_inspect(&exec_id).await?;
        Ok(status.exit_code)
    }

    /// Attach an interactive bash PTY inside the container.
    ///
    /// The TTY flag is set on both the exec creation and the start call;
    /// without it the engine frames stdout/stderr with multiplex headers
    /// that corrupt terminal rendering.
    pub async fn attach_pty(&self, container_id: &str) -> Result<PtySession, SandboxError> {
        let exec_id = self
            .driver
            .exec_create(
                container_id,
                ExecSpec {
                    cmd: vec!["/bin/bash".to_string()],
                    attach_stdin: true,
                    attach_stdout: true,
                    attach_stderr: true,
                    tty: true,
                },
            )
            .await
            .map_err(|e| SandboxError::Attach(e.to_string()))?;

        let stream = self
            .driver
            .exec_start(&exec_id, true)
            .await
            .map_err(|e| SandboxError::Attach(e.to_string()))?;

        Ok(PtySession { exec_id, stream })
    }

    /// Stop (best effort) and force-remove a container.
    pub async fn remove(&self, container_id: &str) -> Result<(), SandboxError> {
        if let Err(e) = self
            .driver
            .stop_container(container_id, self.config.stop_grace_secs)
            .await
        {
            // Already-dead containers fail to stop; removal below decides.
            debug!("Stop of {container_id} failed: {e}");
        }

        self.driver
            .remove_container(container_id, true)
            .await
            .map_err(|e| SandboxError::Remove(e.to_string()))?;

        debug!("Removed container {container_id}");
        Ok(())
    }

    /// Remove every container carrying the challenge label.
    ///
    /// Keeps going past individual failures and reports the first one.
    pub async fn cleanup_all(&self) -> Result<(), SandboxError> {
        let ids = self
            .driver
            .list_containers(LABEL_USER_ID)
            .await
            .map_err(|e| SandboxError::Remove(e.to_string()))?;

        let total = ids.len();
        let mut first_error = None;
        for id in ids {
            if let Err(e) = self.remove(&id).await {
                warn!("Failed to remove container {id}: {e}");
                first_error.get_or_insert(e);
            }
        }

        if total > 0 {
            info!("Cleanup pass over {total} labeled container(s) done");
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn container_name(user_id: UserId, challenge_id: ChallengeId) -> String {
    format!(
        "challenge-{user_id}-{challenge_id}-{}",
        uuid::Uuid::new_v4().simple()
    )
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        s.chars().take(max_chars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::FakeDriver;
    use std::sync::Arc;

    async fn catalog_with_challenge(
        setup: bool,
    ) -> (tempfile::TempDir, Arc<ChallengeCatalog>) {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dir = tmp.path().join("first-steps");
        std::fs::create_dir_all(&dir).expect("challenge dir");
        std::fs::write(dir.join("challenge.yaml"), "id: 1\ntitle: \"First steps\"\npoints: 100\n")
            .expect("manifest");
        std::fs::write(dir.join("validate.sh"), "#!/bin/bash\nexit 0\n").expect("validate");
        if setup {
            std::fs::write(dir.join("setup.sh"), "#!/bin/bash\ntouch /tmp/ready\n")
                .expect("setup");
        }
        let catalog = ChallengeCatalog::load(tmp.path()).await.expect("catalog");
        (tmp, Arc::new(catalog))
    }

    fn manager(driver: Arc<FakeDriver>, catalog: Arc<ChallengeCatalog>) -> ContainerManager {
        ContainerManager::new(driver, catalog, SandboxConfig::default())
    }

    #[tokio::test]
    async fn ensure_image_builds_once_even_under_concurrency() {
        let driver = Arc::new(FakeDriver::new());
        driver.set_build_delay(std::time::Duration::from_millis(30));
        let (_tmp, catalog) = catalog_with_challenge(false).await;
        let mgr = Arc::new(manager(driver.clone(), catalog));

        let mut handles = Vec::new();
        for _ in 0..6 {
            let mgr = mgr.clone();
            handles.push(tokio::spawn(async move { mgr.ensure_image().await }));
        }
        for handle in handles {
            handle.await.expect("join").expect("ensure");
        }

        assert_eq!(driver.build_count(), 1);
    }

    #[tokio::test]
    async fn ensure_image_skips_build_when_tag_exists() {
        let driver = Arc::new(FakeDriver::new());
        driver.add_image("challenges-base:latest");
        let (_tmp, catalog) = catalog_with_challenge(false).await;
        let mgr = manager(driver.clone(), catalog);

        mgr.ensure_image().await.expect("ensure");
        assert_eq!(driver.build_count(), 0);
    }

    #[tokio::test]
    async fn create_for_challenge_mounts_and_labels_the_container() {
        let driver = Arc::new(FakeDriver::new());
        let (_tmp, catalog) = catalog_with_challenge(false).await;
        let mgr = manager(driver.clone(), catalog);

        let id = mgr.create_for_challenge(1, 42).await.expect("create");

        let spec = driver.container_spec(&id).expect("spec");
        assert_eq!(spec.network_mode, "none");
        assert_eq!(spec.pids_limit, 100);
        assert_eq!(spec.binds.len(), 1);
        assert!(spec.binds[0].read_only);
        assert_eq!(spec.binds[0].target, "/challenge");
        assert!(std::path::Path::new(&spec.binds[0].source).is_absolute());
        assert_eq!(spec.labels.get(LABEL_USER_ID).map(String::as_str), Some("42"));
        assert_eq!(
            spec.labels.get(LABEL_CHALLENGE_ID).map(String::as_str),
            Some("1")
        );
        assert!(spec.labels.contains_key(LABEL_CREATED_AT));
        assert!(driver.container_running(&id));
    }

    #[tokio::test]
    async fn create_for_challenge_runs_setup_script_when_present() {
        let driver = Arc::new(FakeDriver::new());
        let (_tmp, catalog) = catalog_with_challenge(true).await;
        let mgr = manager(driver.clone(), catalog);

        let id = mgr.create_for_challenge(1, 42).await.expect("create");

        let scripts = driver.executed_scripts(&id);
        assert_eq!(scripts, vec!["/challenge/setup.sh".to_string()]);
    }

    #[tokio::test]
    async fn create_for_unknown_challenge_reports_not_found() {
        let driver = Arc::new(FakeDriver::new());
        let (_tmp, catalog) = catalog_with_challenge(false).await;
        let mgr = manager(driver.clone(), catalog);

        let err = mgr.create_for_challenge(99, 42).await.expect_err("create");
        assert!(matches!(err, SandboxError::ChallengeNotFound(99)));
        assert_eq!(driver.create_count(), 0);
    }

    #[tokio::test]
    async fn failed_setup_removes_the_container_again() {
        let driver = Arc::new(FakeDriver::new());
        driver.set_script_exit("setup.sh", 1);
        let (_tmp, catalog) = catalog_with_challenge(true).await;
        let mgr = manager(driver.clone(), catalog);

        let err = mgr.create_for_challenge(1, 42).await.expect_err("create");
        assert!(matches!(err, SandboxError::Create(_)));
        assert_eq!(driver.remove_count(), 1);
    }

    #[tokio::test]
    async fn validate_true_on_exit_zero_false_otherwise() {
        let driver = Arc::new(FakeDriver::new());
        let (_tmp, catalog) = catalog_with_challenge(false).await;
        let mgr = manager(driver.clone(), catalog);
        let id = mgr.create_for_challenge(1, 42).await.expect("create");

        assert!(mgr.validate(&id, 1).await);

        driver.set_script_exit("validate.sh", 1);
        assert!(!mgr.validate(&id, 1).await);
    }

    #[tokio::test]
    async fn validate_degrades_to_false_on_transport_error() {
        let driver = Arc::new(FakeDriver::new());
        driver.fail_exec_start(true);
        let (_tmp, catalog) = catalog_with_challenge(false).await;
        let mgr = manager(driver.clone(), catalog);

        assert!(!mgr.validate("whatever", 1).await);
    }

    #[tokio::test]
    async fn validate_drains_output_before_inspecting() {
        let driver = Arc::new(FakeDriver::new());
        driver.set_script_output("validate.sh", b"checking files...\nok\n".to_vec());
        let (_tmp, catalog) = catalog_with_challenge(false).await;
        let mgr = manager(driver.clone(), catalog);
        let id = mgr.create_for_challenge(1, 42).await.expect("create");

        // The fake's exit code stays undefined until the stream is drained,
        // so a passing verdict proves the drain happened first.
        assert!(mgr.validate(&id, 1).await);
    }

    #[tokio::test]
    async fn remove_swallows_stop_failure_but_not_remove_failure() {
        let driver = Arc::new(FakeDriver::new());
        let (_tmp, catalog) = catalog_with_challenge(false).await;
        let mgr = manager(driver.clone(), catalog);
        let id = mgr.create_for_challenge(1, 42).await.expect("create");

        driver.fail_stop(true);
        mgr.remove(&id).await.expect("remove despite stop failure");
        assert!(!driver.container_exists(&id));

        driver.fail_remove(true);
        let err = mgr.remove("gone").await.expect_err("remove");
        assert!(matches!(err, SandboxError::Remove(_)));
    }

    #[tokio::test]
    async fn cleanup_all_continues_past_failures_and_reports_first() {
        let driver = Arc::new(FakeDriver::new());
        let (_tmp, catalog) = catalog_with_challenge(false).await;
        let mgr = manager(driver.clone(), catalog);
        let a = mgr.create_for_challenge(1, 1).await.expect("create a");
        let b = mgr.create_for_challenge(1, 2).await.expect("create b");

        driver.fail_remove_once_for(&a);
        let err = mgr.cleanup_all().await.expect_err("first failure surfaces");
        assert!(matches!(err, SandboxError::Remove(_)));
        // The other container was still reclaimed.
        assert!(!driver.container_exists(&b));
    }

    #[tokio::test]
    async fn attach_pty_requests_tty_on_create_and_start() {
        let driver = Arc::new(FakeDriver::new());
        let (_tmp, catalog) = catalog_with_challenge(false).await;
        let mgr = manager(driver.clone(), catalog);
        let id = mgr.create_for_challenge(1, 42).await.expect("create");

        let pty = mgr.attach_pty(&id).await.expect("attach");
        assert!(driver.exec_was_tty(&pty.exec_id));
    }
}
