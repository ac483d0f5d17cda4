//! Periodic reclamation of expired sessions and their containers.

use std::sync::Arc;
use std::time::Duration;

use sandbox::ContainerManager;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::registry::SessionManager;

/// Scans for expired sessions on a fixed interval and reclaims them.
pub struct CleanupLoop {
    registry: Arc<SessionManager>,
    sandbox: Arc<ContainerManager>,
    interval: Duration,
}

impl CleanupLoop {
    pub fn new(
        registry: Arc<SessionManager>,
        sandbox: Arc<ContainerManager>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            sandbox,
            interval,
        }
    }

    /// Run until the stop signal fires. The first pass runs immediately;
    /// a stop during a pass lets that pass finish.
    pub async fn run(self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        info!(
            "Cleanup loop started (interval: {}s)",
            self.interval.as_secs()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_once().await;
                }
                _ = stop.changed() => {
                    info!("Cleanup loop stopped");
                    return;
                }
            }
        }
    }

    /// One reclamation pass.
    ///
    /// Container removal failures are logged and the session is still marked
    /// expired, so a stuck container cannot wedge the loop into retrying the
    /// same session forever; `cleanup_all` at shutdown is the backstop.
    pub async fn run_once(&self) {
        let expired = self.registry.list_expired();
        if expired.is_empty() {
            debug!("Cleanup pass: nothing expired");
            return;
        }

        info!("Cleanup pass: {} expired session(s)", expired.len());
        for session in expired {
            if let Err(e) = self.sandbox.remove(&session.container_id).await {
                warn!(
                    "Failed to remove container {} for expired session {}: {e}",
                    session.container_id, session.id
                );
            }
            self.registry.mark_expired(session.id);
        }
    }
}
