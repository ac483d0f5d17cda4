//! Server entrypoint and startup wiring.

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use gateway::{
    AppState, AuthTokens, CleanupLoop, SessionManager, TerminalGateway, router,
    wire_session_close,
};
use sandbox::{ContainerDriver, ContainerManager, DockerDriver};
use store::{ChallengeCatalog, ProgressStore};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, Layer, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "shellside", about = "Containerized shell challenge platform")]
struct Cli {
    /// Path to config.toml (default: ~/.shellside/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Console log level when RUST_LOG is unset
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Also write debug-level logs to ~/.shellside/debug.log
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the session server
    Serve,

    /// Mint a development token for a user id
    Token {
        user_id: i64,
        /// Token lifetime in seconds
        #[arg(long, default_value_t = 3600)]
        ttl_secs: u64,
    },
}

/// State directory under the user's home (config, PID file, debug log).
fn state_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".shellside")
}

/// Marks one running server per state directory. The file is written when
/// the guard is acquired and removed when it drops, which also covers the
/// error-return paths out of `cmd_serve`.
struct PidGuard {
    path: PathBuf,
}

impl PidGuard {
    async fn write_at(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, std::process::id().to_string()).await?;
        info!("PID file written: {}", path.display());
        Ok(Self { path })
    }
}

impl Drop for PidGuard {
    fn drop(&mut self) {
        if std::fs::remove_file(&self.path).is_ok() {
            info!("PID file removed: {}", self.path.display());
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let console_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    // WorkerGuard must outlive main() so buffered file writes are flushed on exit.
    let _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>;

    if cli.debug {
        let log_dir = state_dir();
        std::fs::create_dir_all(&log_dir).ok();
        let appender = tracing_appender::rolling::never(&log_dir, "debug.log");
        let (writer, guard) = tracing_appender::non_blocking(appender);
        _file_guard = Some(guard);

        let console = fmt::layer().with_target(false).with_filter(console_filter);
        let file = fmt::layer()
            .with_writer(writer)
            .with_target(true)
            .with_ansi(false)
            .with_filter(EnvFilter::new("debug,hyper_util=info,sqlx=info"));
        tracing_subscriber::registry().with(console).with(file).init();
    } else {
        _file_guard = None;
        fmt()
            .with_env_filter(console_filter)
            .with_target(false)
            .init();
    }

    let config = Config::load(cli.config.as_deref()).unwrap_or_else(|e| {
        warn!("Failed to load config ({e}), using defaults");
        Config::default()
    });

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => cmd_serve(config).await,
        Commands::Token { user_id, ttl_secs } => cmd_token(config, user_id, ttl_secs),
    }
}

fn cmd_token(config: Config, user_id: i64, ttl_secs: u64) -> anyhow::Result<()> {
    let secret = config.resolved_secret().context("token secret")?;
    let token = AuthTokens::new(secret).issue(user_id, Duration::from_secs(ttl_secs));
    println!("{token}");
    Ok(())
}

async fn cmd_serve(config: Config) -> anyhow::Result<()> {
    let secret = config.resolved_secret().context("token secret")?;

    let pid_guard = PidGuard::write_at(state_dir().join("shellside.pid"))
        .await
        .context("write pid file")?;

    let catalog = Arc::new(
        ChallengeCatalog::load(&config.challenges.root)
            .await
            .with_context(|| format!("load challenges from {}", config.challenges.root))?,
    );
    let progress = Arc::new(
        ProgressStore::open(&config.database.url)
            .await
            .context("open progress store")?,
    );

    let driver: Arc<dyn ContainerDriver> =
        Arc::new(DockerDriver::connect().context("connect to container engine")?);
    let sandbox = Arc::new(ContainerManager::new(
        driver,
        catalog.clone(),
        config.sandbox_config(),
    ));
    sandbox.ensure_image().await.context("ensure base image")?;

    // Sessions do not survive restarts, so any labeled container left over
    // from a previous process is an orphan.
    if let Err(e) = sandbox.cleanup_all().await {
        warn!("Startup container sweep reported an error: {e}");
    }

    let registry = Arc::new(SessionManager::new(config.session_limits()));
    let terminals = Arc::new(TerminalGateway::new());
    wire_session_close(&registry, terminals.clone());
    let tokens = Arc::new(AuthTokens::new(secret));
    let accepting = Arc::new(AtomicBool::new(true));

    let state = AppState {
        registry: registry.clone(),
        sandbox: sandbox.clone(),
        progress,
        catalog,
        terminals: terminals.clone(),
        tokens,
        accepting: accepting.clone(),
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    let reaper = CleanupLoop::new(
        registry.clone(),
        sandbox.clone(),
        Duration::from_secs(config.cleanup.interval_secs),
    );
    let reaper_handle = tokio::spawn(reaper.run(stop_rx));

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("parse listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;
    info!("Listening on {addr}");

    // The teardown runs inside the graceful-shutdown future so terminal
    // sockets are already closed when axum waits for connections to drain.
    let shutdown = shutdown_after_signal(
        accepting,
        stop_tx,
        registry,
        sandbox,
        terminals,
        Duration::from_millis(config.shutdown.drain_timeout_ms),
    );

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")?;

    let _ = reaper_handle.await;
    drop(pid_guard);
    info!("Shutdown complete");
    Ok(())
}

/// Completes once SIGTERM or SIGINT has arrived and the session teardown has
/// run: refuse new sessions, stop the cleanup loop, close every terminal,
/// let the streams drain for the configured bound, then reclaim whatever
/// containers are still registered.
async fn shutdown_after_signal(
    accepting: Arc<AtomicBool>,
    stop_reaper: watch::Sender<bool>,
    registry: Arc<SessionManager>,
    sandbox: Arc<ContainerManager>,
    terminals: Arc<TerminalGateway>,
    drain: Duration,
) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT, draining sessions"),
            _ = sigterm.recv() => info!("Received SIGTERM, draining sessions"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl-C, draining sessions");
    }

    accepting.store(false, Ordering::SeqCst);
    let _ = stop_reaper.send(true);

    terminals.close_all();
    tokio::time::sleep(drain).await;

    for session in registry.list_active() {
        if let Err(e) = sandbox.remove(&session.container_id).await {
            warn!(
                "Failed to remove container {} during shutdown: {e}",
                session.container_id
            );
        }
        registry.end(session.id);
    }
    info!("Session teardown complete");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_dir_lives_under_home() {
        let dir = state_dir();
        assert!(dir.to_string_lossy().ends_with(".shellside"));
    }

    #[tokio::test]
    async fn pid_guard_writes_own_pid_and_cleans_up_on_drop() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let pid_path = tmp.path().join("nested/shellside.pid");

        let guard = PidGuard::write_at(&pid_path).await.expect("pid write");
        assert!(pid_path.exists());
        let written = tokio::fs::read_to_string(&pid_path)
            .await
            .expect("read pid");
        assert_eq!(written.parse::<u32>().expect("numeric pid"), std::process::id());

        drop(guard);
        assert!(!pid_path.exists());
    }

    #[tokio::test]
    async fn pid_guard_drop_tolerates_already_removed_file() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let pid_path = tmp.path().join("shellside.pid");

        let guard = PidGuard::write_at(&pid_path).await.expect("pid write");
        tokio::fs::remove_file(&pid_path).await.expect("remove early");
        drop(guard);
        assert!(!pid_path.exists());
    }
}
