use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::flow::HighWaterMark;
use crate::stage::io::{DEFAULT_LINE_LIMIT, DEFAULT_READ_CHUNK};

pub const ENV_HIGH_WATER_BYTES: &str = "SLUICE_HIGH_WATER_BYTES";
pub const ENV_HIGH_WATER_RECORDS: &str = "SLUICE_HIGH_WATER_RECORDS";
pub const ENV_READ_CHUNK: &str = "SLUICE_READ_CHUNK";
pub const ENV_MAX_LINE: &str = "SLUICE_MAX_LINE";
pub const ENV_TIMEOUT_MS: &str = "SLUICE_TIMEOUT_MS";
pub const ENV_HOST: &str = "SLUICE_HOST";
pub const ENV_PORT: &str = "SLUICE_PORT";
pub const ENV_LOG_LEVEL: &str = "SLUICE_LOG_LEVEL";
pub const ENV_LOG_DIR: &str = "SLUICE_LOG_DIR";
pub const ENV_REPLY_FIELD: &str = "SLUICE_REPLY_FIELD";

// -----------------------------------------------------------------------------
// Key/value sources
// -----------------------------------------------------------------------------

/// Where configuration values come from.
pub trait ConfigSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn keys(&self) -> Vec<String>;
}

/// What happened to the `.env` file an [`EnvConfig`] was primed from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EnvFileStatus {
    Loaded,
    Missing,
    Invalid(String),
}

/// Process environment, optionally primed from a `.env` file.
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    env_file: Option<(PathBuf, EnvFileStatus)>,
}

impl EnvConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `env_file` into the environment first. Variables already set win.
    ///
    /// Logs nothing; report the outcome with [`EnvConfig::log_env_file`]
    /// once tracing is installed.
    pub fn with_env_file(env_file: &Path) -> Self {
        let status = if env_file.exists() {
            match dotenvy::from_path(env_file) {
                Ok(()) => EnvFileStatus::Loaded,
                Err(e) => EnvFileStatus::Invalid(e.to_string()),
            }
        } else {
            EnvFileStatus::Missing
        };
        Self {
            env_file: Some((env_file.to_path_buf(), status)),
        }
    }

    pub fn env_file(&self) -> Option<&Path> {
        self.env_file.as_ref().map(|(path, _)| path.as_path())
    }

    pub fn env_file_status(&self) -> Option<&EnvFileStatus> {
        self.env_file.as_ref().map(|(_, status)| status)
    }

    pub fn log_env_file(&self) {
        match &self.env_file {
            Some((path, EnvFileStatus::Loaded)) => info!("Loaded .env from {}", path.display()),
            Some((path, EnvFileStatus::Missing)) => {
                warn!("could not load .env from {}", path.display())
            }
            Some((path, EnvFileStatus::Invalid(reason))) => {
                error!("could not parse {}: {reason}", path.display())
            }
            None => {}
        }
    }
}

impl ConfigSource for EnvConfig {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn keys(&self) -> Vec<String> {
        std::env::vars().map(|(k, _)| k).collect()
    }
}

/// In-memory values, handy for tests and embedding.
#[derive(Clone, Debug, Default)]
pub struct MapConfig {
    map: DashMap<String, String>,
}

impl MapConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, key: &str, value: &str) {
        self.map.insert(key.to_string(), value.to_string());
    }

    pub fn del(&self, key: &str) {
        self.map.remove(key);
    }
}

impl ConfigSource for MapConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.map.get(key).map(|v| v.clone())
    }

    fn keys(&self) -> Vec<String> {
        self.map.iter().map(|entry| entry.key().clone()).collect()
    }
}

fn parse<T>(source: &dyn ConfigSource, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match source.get(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
    }
}

// -----------------------------------------------------------------------------
// Settings
// -----------------------------------------------------------------------------

/// Knobs for one pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub high_water_mark: HighWaterMark,
    /// Upper bound for a single read from a byte source.
    pub read_chunk_size: usize,
    /// Longest line a framed source accepts before failing the stream.
    pub max_line: usize,
    /// Destroy the run if it has not completed after this long.
    pub timeout: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            high_water_mark: HighWaterMark::default(),
            read_chunk_size: DEFAULT_READ_CHUNK,
            max_line: DEFAULT_LINE_LIMIT,
            timeout: None,
        }
    }
}

impl PipelineConfig {
    pub fn with_high_water_mark(mut self, mark: HighWaterMark) -> Self {
        self.high_water_mark = mark;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn from_env() -> Result<Self> {
        Self::load(&EnvConfig::new())
    }

    /// Defaults overridden by whatever `source` sets.
    pub fn load(source: &dyn ConfigSource) -> Result<Self> {
        let mut config = Self::default();
        if let Some(bytes) = parse(source, ENV_HIGH_WATER_BYTES)? {
            config.high_water_mark = config.high_water_mark.with_bytes(bytes);
        }
        if let Some(records) = parse(source, ENV_HIGH_WATER_RECORDS)? {
            config.high_water_mark = config.high_water_mark.with_records(records);
        }
        if let Some(size) = parse::<usize>(source, ENV_READ_CHUNK)? {
            config.read_chunk_size = size.max(1);
        }
        if let Some(limit) = parse::<usize>(source, ENV_MAX_LINE)? {
            config.max_line = limit.max(1);
        }
        if let Some(ms) = parse::<u64>(source, ENV_TIMEOUT_MS)? {
            config.timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }
        Ok(config)
    }
}

/// Settings for the pattern service and its client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
    /// Envelope field that carries the reply route.
    pub reply_field: String,
    pub pipeline: PipelineConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8080,
            log_level: "info".into(),
            log_dir: None,
            reply_field: sluice_wire::REPLY_FIELD.into(),
            pipeline: PipelineConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self> {
        Self::load(&EnvConfig::new())
    }

    pub fn load(source: &dyn ConfigSource) -> Result<Self> {
        let mut config = Self {
            pipeline: PipelineConfig::load(source)?,
            ..Self::default()
        };
        if let Some(host) = source.get(ENV_HOST).filter(|h| !h.trim().is_empty()) {
            config.host = host.trim().to_string();
        }
        if let Some(port) = parse(source, ENV_PORT)? {
            config.port = port;
        }
        if let Some(level) = source.get(ENV_LOG_LEVEL).filter(|l| !l.trim().is_empty()) {
            config.log_level = level.trim().to_string();
        }
        if let Some(dir) = source.get(ENV_LOG_DIR).filter(|d| !d.trim().is_empty()) {
            config.log_dir = Some(PathBuf::from(dir.trim()));
        }
        if let Some(field) = source.get(ENV_REPLY_FIELD).filter(|f| !f.trim().is_empty()) {
            config.reply_field = field.trim().to_string();
        }
        Ok(config)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::write;
    use tempfile::tempdir;

    #[test]
    fn map_config_basic() {
        let cfg = MapConfig::new();
        cfg.set("foo", "bar");
        assert_eq!(cfg.get("foo"), Some("bar".to_string()));
        assert_eq!(cfg.keys(), vec!["foo".to_string()]);
        cfg.del("foo");
        assert_eq!(cfg.get("foo"), None);
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = ServiceConfig::load(&MapConfig::new()).unwrap();
        assert_eq!(config, ServiceConfig::default());
        assert_eq!(config.reply_field, "returnPath");
        assert_eq!(config.address(), "127.0.0.1:8080");
    }

    #[test]
    fn values_override_defaults() {
        let cfg = MapConfig::new();
        cfg.set(ENV_HIGH_WATER_RECORDS, "4");
        cfg.set(ENV_TIMEOUT_MS, "250");
        cfg.set(ENV_PORT, "9999");
        cfg.set(ENV_REPLY_FIELD, "replyTo");
        cfg.set(ENV_LOG_DIR, " /tmp/sluice ");

        let config = ServiceConfig::load(&cfg).unwrap();
        assert_eq!(config.pipeline.high_water_mark.records, 4);
        assert_eq!(config.pipeline.timeout, Some(Duration::from_millis(250)));
        assert_eq!(config.port, 9999);
        assert_eq!(config.reply_field, "replyTo");
        assert_eq!(config.log_dir, Some(PathBuf::from("/tmp/sluice")));
    }

    #[test]
    fn zero_timeout_means_none() {
        let cfg = MapConfig::new();
        cfg.set(ENV_TIMEOUT_MS, "0");
        assert_eq!(PipelineConfig::load(&cfg).unwrap().timeout, None);
    }

    #[test]
    fn garbage_is_reported_with_the_key() {
        let cfg = MapConfig::new();
        cfg.set(ENV_PORT, "eighty");
        let err = ServiceConfig::load(&cfg).unwrap_err();
        assert!(format!("{err:#}").contains(ENV_PORT));
    }

    #[test]
    fn env_file_is_loaded() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(".env");
        write(&path, "SLUICE_TEST_ONLY_KEY=from-file\n").unwrap();

        let env = EnvConfig::with_env_file(&path);
        assert_eq!(env.get("SLUICE_TEST_ONLY_KEY"), Some("from-file".into()));
        assert_eq!(env.env_file(), Some(path.as_path()));
        assert_eq!(env.env_file_status(), Some(&EnvFileStatus::Loaded));
    }

    #[test]
    fn missing_env_file_is_remembered_for_later_logging() {
        let dir = tempdir().unwrap();
        let env = EnvConfig::with_env_file(&dir.path().join("absent.env"));
        assert_eq!(env.env_file_status(), Some(&EnvFileStatus::Missing));
        assert_eq!(EnvConfig::new().env_file_status(), None);
    }

    #[test]
    fn max_line_is_configurable() {
        let cfg = MapConfig::new();
        assert_eq!(PipelineConfig::load(&cfg).unwrap().max_line, DEFAULT_LINE_LIMIT);
        cfg.set(ENV_MAX_LINE, "64");
        assert_eq!(PipelineConfig::load(&cfg).unwrap().max_line, 64);
    }
}
