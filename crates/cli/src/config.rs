use std::path::{Path, PathBuf};
use std::time::Duration;

use gateway::SessionLimits;
use proto::ConfigError;
use sandbox::SandboxConfig;
use serde::{Deserialize, Serialize};

/// Environment variable overriding `auth.token_secret`.
const TOKEN_SECRET_ENV: &str = "SHELLSIDE_TOKEN_SECRET";

/// Top-level server configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Listener address and port.
    #[serde(default)]
    pub server: ServerConfig,

    /// Container resource profile.
    #[serde(default)]
    pub container: ContainerConfig,

    /// Admission caps and time budgets.
    #[serde(default)]
    pub session: SessionConfig,

    /// Cleanup loop cadence.
    #[serde(default)]
    pub cleanup: CleanupConfig,

    /// Challenge catalog location.
    #[serde(default)]
    pub challenges: ChallengesConfig,

    /// Progress database location.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Token verification settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Graceful shutdown bounds.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerConfig {
    /// Tag of the base image to ensure/build.
    pub image_name: String,
    pub memory_bytes: i64,
    pub cpu_nanocores: i64,
    pub pids_limit: i64,
    pub network_mode: String,
    pub stop_grace_secs: i64,
}

impl Default for ContainerConfig {
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

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub max_per_user: usize,
    pub max_total: usize,
    pub idle_timeout_secs: u64,
    pub max_duration_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_per_user: 1,
            max_total: 15,
            idle_timeout_secs: 600,
            max_duration_secs: 900,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    pub interval_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChallengesConfig {
    /// Directory scanned for challenge manifests.
    pub root: String,
}

impl Default for ChallengesConfig {
    fn default() -> Self {
        Self {
            root: "./challenges".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "~/.shellside/progress.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// HMAC key for token verification. `SHELLSIDE_TOKEN_SECRET` overrides.
    #[serde(default)]
    pub token_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownConfig {
    /// How long to let terminal streams drain before containers are removed.
    pub drain_timeout_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: 1000,
        }
    }
}

impl Config {
    /// Default config path under `~/.shellside/`.
    pub fn default_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".shellside").join("config.toml")
    }

    /// Load from the given path (or the default path), then apply
    /// environment overrides. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);

        let mut config = if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            toml::from_str(&raw).map_err(|e| ConfigError::Toml(e.to_string()))?
        } else {
            Self::default()
        };

        if let Ok(secret) = std::env::var(TOKEN_SECRET_ENV)
            && !secret.is_empty()
        {
            config.auth.token_secret = secret;
        }

        Ok(config)
    }

    /// The token secret, required to be non-empty before serving.
    pub fn resolved_secret(&self) -> Result<String, ConfigError> {
        if self.auth.token_secret.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "auth.token_secret".to_string(),
                reason: format!("must be set (or export {TOKEN_SECRET_ENV})"),
            });
        }
        Ok(self.auth.token_secret.clone())
    }

    /// Container resource profile for the sandbox manager.
    pub fn sandbox_config(&self) -> SandboxConfig {
        SandboxConfig {
            image_name: self.container.image_name.clone(),
            memory_bytes: self.container.memory_bytes,
            cpu_nanocores: self.container.cpu_nanocores,
            pids_limit: self.container.pids_limit,
            network_mode: self.container.network_mode.clone(),
            stop_grace_secs: self.container.stop_grace_secs,
        }
    }

    /// Admission caps and time budgets for the session registry.
    pub fn session_limits(&self) -> SessionLimits {
        SessionLimits {
            max_per_user: self.session.max_per_user,
            max_total: self.session.max_total,
            idle_timeout: Duration::from_secs(self.session.idle_timeout_secs),
            max_duration: Duration::from_secs(self.session.max_duration_secs),
        }
    }
}
