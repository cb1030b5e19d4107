use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::model::RunnerType;
use crate::platform::{NativePlatform, Platform};

pub const CONFIG_PATH_ENV: &str = "AGENT_CORE_CONFIG";
const CONFIG_FILE_NAME: &str = "config.toml";
const EMBEDDED_DB_FILE: &str = "agent-core.db";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbBackend {
    Server,
    Embedded,
}

impl DbBackend {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "server" => Ok(DbBackend::Server),
            "embedded" => Ok(DbBackend::Embedded),
            other => Err(invalid(
                "db.backend",
                format!("expected 'server' or 'embedded', got '{}'", other),
            )),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerDbConfig {
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: Option<String>,
    pub database: String,
}

impl ServerDbConfig {
    pub fn connection_url(&self) -> String {
        if let Some(url) = self.url.as_ref().filter(|u| !u.trim().is_empty()) {
            return url.clone();
        }
        let auth = match &self.password {
            Some(pw) if !pw.is_empty() => format!("{}:{}", self.user, pw),
            _ => self.user.clone(),
        };
        format!(
            "postgres://{}@{}:{}/{}",
            auth,
            if self.host.is_empty() { "localhost" } else { &self.host },
            if self.port == 0 { 5432 } else { self.port },
            self.database
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddedDbConfig {
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub backend: String,
    pub server: ServerDbConfig,
    pub embedded: EmbeddedDbConfig,
    pub max_open_conns: u32,
    pub max_idle_conns: u32,
    pub conn_max_lifetime_ms: u64,
    pub max_retries: u32,
    pub base_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub retry_jitter_factor: f64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            backend: "embedded".to_string(),
            server: ServerDbConfig::default(),
            embedded: EmbeddedDbConfig::default(),
            max_open_conns: 25,
            max_idle_conns: 5,
            conn_max_lifetime_ms: 300_000,
            max_retries: 10,
            base_retry_delay_ms: 1_000,
            max_retry_delay_ms: 30_000,
            retry_jitter_factor: 0.25,
        }
    }
}

impl DbConfig {
    pub fn backend(&self) -> Result<DbBackend, ConfigError> {
        DbBackend::parse(&self.backend)
    }

    /// Embedded database file: explicit path, then `DATA_ROOT`, then the
    /// user's home data directory.
    pub fn embedded_path(&self) -> PathBuf {
        match &self.embedded.path {
            Some(path) => path.clone(),
            None => NativePlatform::data_dir().join(EMBEDDED_DB_FILE),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub max_concurrent_runs: usize,
    pub default_run_timeout_minutes: i64,
    pub cancel_grace_seconds: u64,
    pub idempotency_ttl_hours: i64,
    pub store_retry_attempts: u32,
    pub scheduler_tick_ms: u64,
    pub default_requires_approval: bool,
    pub lock_ttl_seconds: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_concurrent_runs: 4,
            default_run_timeout_minutes: 30,
            cancel_grace_seconds: 10,
            idempotency_ttl_hours: 24,
            store_retry_attempts: 3,
            scheduler_tick_ms: 500,
            default_requires_approval: false,
            lock_ttl_seconds: 300,
        }
    }
}

impl RuntimeConfig {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_seconds)
    }

    pub fn scheduler_tick(&self) -> Duration {
        Duration::from_millis(self.scheduler_tick_ms.max(10))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub allow_list: Vec<String>,
    /// argv template per runner type; `{task}` and `{workspace}` are substituted.
    pub commands: HashMap<String, Vec<String>>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        let mut commands = HashMap::new();
        commands.insert(
            "claude-code".to_string(),
            vec!["claude".into(), "-p".into(), "{task}".into()],
        );
        commands.insert(
            "codex".to_string(),
            vec!["codex".into(), "exec".into(), "{task}".into()],
        );
        commands.insert(
            "opencode".to_string(),
            vec!["opencode".into(), "run".into(), "{task}".into()],
        );
        Self {
            allow_list: RunnerType::ALL.iter().map(|r| r.as_str().to_string()).collect(),
            commands,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    pub default_root: Option<PathBuf>,
    pub sandbox_root: Option<PathBuf>,
    pub commit_on_apply: bool,
}

impl WorkspaceConfig {
    pub fn default_root(&self) -> PathBuf {
        self.default_root
            .clone()
            .unwrap_or_else(NativePlatform::home_dir)
    }

    pub fn sandbox_root(&self) -> PathBuf {
        self.sandbox_root
            .clone()
            .unwrap_or_else(|| NativePlatform::data_dir().join("sandboxes"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 17890,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub db: DbConfig,
    pub runtime: RuntimeConfig,
    pub runner: RunnerConfig,
    pub workspace: WorkspaceConfig,
    pub server: ServerConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load from `explicit`, `AGENT_CORE_CONFIG`, or `<data_root>/config.toml`
    /// (in that order), apply environment overrides, then validate.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_PATH_ENV).ok().map(PathBuf::from))
            .or_else(|| {
                let candidate = NativePlatform::data_dir().join(CONFIG_FILE_NAME);
                candidate.exists().then_some(candidate)
            });

        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
                    path: path.clone(),
                    source,
                })?;
                let parsed = Self::from_toml_str(&raw).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?;
                info!("Loaded configuration from {}", path.display());
                parsed
            }
            None => AppConfig::default(),
        };

        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(backend) = get("AGENT_CORE_DB_BACKEND") {
            self.db.backend = backend;
        }
        if let Some(url) = get("DATABASE_URL") {
            self.db.server.url = Some(url);
        }
        if let Some(path) = get("AGENT_CORE_DB_PATH") {
            self.db.embedded.path = Some(PathBuf::from(path));
        }
        if let Some(raw) = get("AGENT_CORE_MAX_CONCURRENT_RUNS") {
            self.runtime.max_concurrent_runs = raw
                .parse()
                .map_err(|_| invalid("runtime.max_concurrent_runs", format!("'{}' is not an integer", raw)))?;
        }
        if let Some(raw) = get("AGENT_CORE_DEFAULT_TIMEOUT_MINUTES") {
            self.runtime.default_run_timeout_minutes = raw.parse().map_err(|_| {
                invalid(
                    "runtime.default_run_timeout_minutes",
                    format!("'{}' is not an integer", raw),
                )
            })?;
        }
        if let Some(raw) = get("AGENT_CORE_RUNNER_ALLOW_LIST") {
            self.runner.allow_list = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        if let Some(root) = get("AGENT_CORE_WORKSPACE_ROOT") {
            self.workspace.default_root = Some(PathBuf::from(root));
        }
        if let Some(host) = get("AGENT_CORE_API_HOST") {
            self.server.host = host;
        }
        if let Some(raw) = get("AGENT_CORE_API_PORT") {
            self.server.port = raw
                .parse()
                .map_err(|_| invalid("server.port", format!("'{}' is not a port", raw)))?;
        }
        if let Some(level) = get("AGENT_CORE_LOG_LEVEL") {
            self.logging.level = level;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let backend = self.db.backend()?;
        if backend == DbBackend::Server
            && self.db.server.url.as_deref().is_none_or(|u| u.trim().is_empty())
            && self.db.server.database.trim().is_empty()
        {
            return Err(invalid(
                "db.server",
                "either db.server.url or db.server.database is required",
            ));
        }
        if self.db.max_open_conns == 0 {
            return Err(invalid("db.max_open_conns", "must be at least 1"));
        }
        if !(0.0..=1.0).contains(&self.db.retry_jitter_factor) {
            return Err(invalid("db.retry_jitter_factor", "must be within [0, 1]"));
        }
        if self.db.base_retry_delay_ms > self.db.max_retry_delay_ms {
            return Err(invalid(
                "db.base_retry_delay_ms",
                "must not exceed db.max_retry_delay_ms",
            ));
        }
        if self.runtime.max_concurrent_runs == 0 {
            return Err(invalid("runtime.max_concurrent_runs", "must be at least 1"));
        }
        if self.runtime.default_run_timeout_minutes <= 0 {
            return Err(invalid(
                "runtime.default_run_timeout_minutes",
                "must be greater than zero",
            ));
        }
        if self.runtime.idempotency_ttl_hours <= 0 {
            return Err(invalid("runtime.idempotency_ttl_hours", "must be greater than zero"));
        }
        for tag in &self.runner.allow_list {
            if RunnerType::from_tag(tag).is_none() {
                return Err(invalid(
                    "runner.allow_list",
                    format!("unknown runner type '{}'", tag),
                ));
            }
        }
        for key in self.runner.commands.keys() {
            if RunnerType::from_tag(key).is_none() {
                return Err(invalid(
                    "runner.commands",
                    format!("unknown runner type '{}'", key),
                ));
            }
        }
        if let Some(root) = &self.workspace.default_root
            && !root.is_absolute()
        {
            return Err(invalid("workspace.default_root", "must be an absolute path"));
        }
        Ok(())
    }

    pub fn runner_allow_list(&self) -> Vec<RunnerType> {
        self.runner
            .allow_list
            .iter()
            .filter_map(|t| RunnerType::from_tag(t))
            .collect()
    }
}
