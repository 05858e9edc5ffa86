//! Configuration loading for the scrapeflow engine.
//!
//! Loads layered `.env` files and environment variables prefixed with
//! `SCRAPEFLOW_`, producing a typed [`AppConfig`].

use std::{collections::BTreeMap, env, net::SocketAddr, path::PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application configuration derived from `SCRAPEFLOW_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppConfig {
    #[serde(default = "default_profile")]
    pub profile: String,
    #[serde(default = "default_api_bind_addr")]
    pub api_bind_addr: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub log_format: String,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,
    #[serde(default = "default_db_acquire_timeout_ms")]
    pub db_acquire_timeout_ms: u64,
    /// Base URL workers use for the HTTP callback channel (handed to each
    /// worker via the `API_BASE_URL` environment variable).
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Shared secret for the callback channel. When set, callbacks must carry
    /// it in the `X-Scraper-Secret` header; when unset, callbacks are open.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scraper_secret: Option<String>,
    /// Cap on retained log lines per job. 0 keeps every line.
    #[serde(default = "default_max_log_lines")]
    pub max_log_lines: u64,
    #[serde(default)]
    pub worker: WorkerConfig,
}

/// Worker process configuration: how to launch the scraper and where it
/// writes its output.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct WorkerConfig {
    /// Interpreter or binary used to launch the worker (default: `python3`)
    ///
    /// Environment variable: `SCRAPEFLOW_WORKER_COMMAND`
    #[serde(default = "default_worker_command")]
    pub command: String,

    /// Worker script path, passed as the first argument when non-empty
    ///
    /// Environment variable: `SCRAPEFLOW_WORKER_SCRIPT`
    #[serde(default = "default_worker_script")]
    pub script: String,

    /// Whether workers are launched with `--headless` (default: true)
    ///
    /// Environment variable: `SCRAPEFLOW_WORKER_HEADLESS`
    #[serde(default = "default_worker_headless")]
    pub headless: bool,

    /// Maximum wall-clock seconds a worker may run before the supervisor
    /// kills it and fails the job. 0 disables the bound.
    ///
    /// Environment variable: `SCRAPEFLOW_WORKER_TIMEOUT_SECS`
    #[serde(default = "default_worker_timeout_secs")]
    pub timeout_secs: u64,

    /// Directory the worker writes result files into; the ingestion pipeline
    /// reads `<output_dir>/csv/<safe_name>.csv` from here.
    ///
    /// Environment variable: `SCRAPEFLOW_WORKER_OUTPUT_DIR`
    #[serde(default = "default_worker_output_dir")]
    pub output_dir: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            command: default_worker_command(),
            script: default_worker_script(),
            headless: default_worker_headless(),
            timeout_secs: default_worker_timeout_secs(),
            output_dir: default_worker_output_dir(),
        }
    }
}

impl WorkerConfig {
    /// Validate worker launch configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::MissingWorkerCommand);
        }

        if self.output_dir.trim().is_empty() {
            return Err(ConfigError::MissingWorkerOutputDir);
        }

        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: default_profile(),
            api_bind_addr: default_api_bind_addr(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            database_url: default_database_url(),
            db_max_connections: default_db_max_connections(),
            db_acquire_timeout_ms: default_db_acquire_timeout_ms(),
            api_base_url: default_api_base_url(),
            scraper_secret: None,
            max_log_lines: default_max_log_lines(),
            worker: WorkerConfig::default(),
        }
    }
}

impl AppConfig {
    /// Returns the configured bind address as a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        self.api_bind_addr.parse()
    }

    /// Returns a redacted JSON representation (secrets are redacted).
    pub fn redacted_json(&self) -> serde_json::Result<String> {
        let mut config = self.clone();
        if config.scraper_secret.is_some() {
            config.scraper_secret = Some("[REDACTED]".to_string());
        }
        serde_json::to_string_pretty(&config)
    }

    /// Validates the configuration, returning an error if required settings are missing.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.database_url.trim().is_empty() {
            return Err(ConfigError::MissingDatabaseUrl);
        }

        url::Url::parse(&self.api_base_url).map_err(|source| ConfigError::InvalidApiBaseUrl {
            value: self.api_base_url.clone(),
            source,
        })?;

        self.worker.validate()?;

        Ok(())
    }
}

fn default_profile() -> String {
    "local".to_string()
}

fn default_api_bind_addr() -> String {
    // The worker's default callback base points at port 5000.
    "0.0.0.0:5000".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_database_url() -> String {
    "sqlite://scrapeflow.db?mode=rwc".to_string()
}

fn default_db_max_connections() -> u32 {
    10
}

fn default_db_acquire_timeout_ms() -> u64 {
    5000
}

fn default_api_base_url() -> String {
    "http://localhost:5000/api".to_string()
}

fn default_max_log_lines() -> u64 {
    0
}

fn default_worker_command() -> String {
    "python3".to_string()
}

fn default_worker_script() -> String {
    "scripts/scraper.py".to_string()
}

fn default_worker_headless() -> bool {
    true
}

fn default_worker_timeout_secs() -> u64 {
    1800 // 30 minutes
}

fn default_worker_output_dir() -> String {
    "output_files".to_string()
}

/// Errors that can occur while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load environment file {path}: {source}")]
    EnvFile {
        path: PathBuf,
        source: dotenvy::Error,
    },
    #[error("invalid api bind address '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("database URL is empty; set SCRAPEFLOW_DATABASE_URL")]
    MissingDatabaseUrl,
    #[error("invalid api base url '{value}': {source}")]
    InvalidApiBaseUrl {
        value: String,
        source: url::ParseError,
    },
    #[error("worker command is empty; set SCRAPEFLOW_WORKER_COMMAND")]
    MissingWorkerCommand,
    #[error("worker output directory is empty; set SCRAPEFLOW_WORKER_OUTPUT_DIR")]
    MissingWorkerOutputDir,
}

/// Loads configuration using layered `.env` files and `SCRAPEFLOW_*` env vars.
pub struct ConfigLoader {
    base_dir: PathBuf,
}

impl ConfigLoader {
    /// Creates a new loader rooted at the current working directory.
    pub fn new() -> Self {
        Self {
            base_dir: env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
        }
    }

    /// Creates a loader rooted at the provided directory (useful for tests).
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Loads configuration: `.env` layers first, process environment last so
    /// it wins.
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        let (mut layered, profile_hint) = self.collect_layered_env()?;

        // Overlay process environment last so it wins.
        for (key, value) in env::vars() {
            if let Some(stripped) = key.strip_prefix("SCRAPEFLOW_") {
                layered.insert(stripped.to_string(), value);
            }
        }

        let profile = layered
            .remove("PROFILE")
            .filter(|v| !v.is_empty())
            .unwrap_or(profile_hint);
        let api_bind_addr = layered
            .remove("API_BIND_ADDR")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_api_bind_addr);
        let log_level = layered
            .remove("LOG_LEVEL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_level);
        let log_format = layered
            .remove("LOG_FORMAT")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_log_format);
        let database_url = layered
            .remove("DATABASE_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_database_url);
        let db_max_connections = layered
            .remove("DB_MAX_CONNECTIONS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_max_connections);
        let db_acquire_timeout_ms = layered
            .remove("DB_ACQUIRE_TIMEOUT_MS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_db_acquire_timeout_ms);
        let api_base_url = layered
            .remove("API_BASE_URL")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_api_base_url);
        let scraper_secret = layered.remove("SCRAPER_SECRET").and_then(|val| {
            let trimmed = val.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        });
        let max_log_lines = layered
            .remove("MAX_LOG_LINES")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_max_log_lines);

        let worker_command = layered
            .remove("WORKER_COMMAND")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_worker_command);
        let worker_script = layered
            .remove("WORKER_SCRIPT")
            .unwrap_or_else(default_worker_script);
        let worker_headless = layered
            .remove("WORKER_HEADLESS")
            .as_deref()
            .map(parse_bool)
            .unwrap_or_else(default_worker_headless);
        let worker_timeout_secs = layered
            .remove("WORKER_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok())
            .unwrap_or_else(default_worker_timeout_secs);
        let worker_output_dir = layered
            .remove("WORKER_OUTPUT_DIR")
            .filter(|v| !v.is_empty())
            .unwrap_or_else(default_worker_output_dir);

        let worker = WorkerConfig {
            command: worker_command,
            script: worker_script,
            headless: worker_headless,
            timeout_secs: worker_timeout_secs,
            output_dir: worker_output_dir,
        };

        let config = AppConfig {
            profile,
            api_bind_addr,
            log_level,
            log_format,
            database_url,
            db_max_connections,
            db_acquire_timeout_ms,
            api_base_url,
            scraper_secret,
            max_log_lines,
            worker,
        };

        // Validate configuration
        config.validate()?;

        match config.bind_addr() {
            Ok(_) => Ok(config),
            Err(source) => Err(ConfigError::InvalidBindAddr {
                value: config.api_bind_addr.clone(),
                source,
            }),
        }
    }

    fn collect_layered_env(&self) -> Result<(BTreeMap<String, String>, String), ConfigError> {
        let mut values = BTreeMap::new();

        self.merge_dotenv(self.base_dir.join(".env"), &mut values)?;
        self.merge_dotenv(self.base_dir.join(".env.local"), &mut values)?;

        let profile = env::var("SCRAPEFLOW_PROFILE")
            .ok()
            .or_else(|| values.get("PROFILE").cloned())
            .unwrap_or_else(default_profile);

        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}", &profile)),
            &mut values,
        )?;
        self.merge_dotenv(
            self.base_dir.join(format!(".env.{}.local", &profile)),
            &mut values,
        )?;

        Ok((values, profile))
    }

    fn merge_dotenv(
        &self,
        path: PathBuf,
        values: &mut BTreeMap<String, String>,
    ) -> Result<(), ConfigError> {
        match dotenvy::from_path_iter(&path) {
            Ok(iter) => {
                for item in iter {
                    let (key, value) = item.map_err(|source| ConfigError::EnvFile {
                        path: path.clone(),
                        source,
                    })?;
                    if let Some(stripped) = key.strip_prefix("SCRAPEFLOW_") {
                        values.insert(stripped.to_string(), value);
                    }
                }
                Ok(())
            }
            Err(dotenvy::Error::Io(ref io_err))
                if io_err.kind() == std::io::ErrorKind::NotFound =>
            {
                Ok(())
            }
            Err(err) => Err(ConfigError::EnvFile { path, source: err }),
        }
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
