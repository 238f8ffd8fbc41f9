use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Top-level configuration loaded from `.bagula/config.toml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
#[derive(Default)]
pub struct PlatformConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub analyzer: AnalyzerConfig,
    pub auth: AuthConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    /// Upper bound on any single store/queue/analyzer call made by a handler.
    pub request_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
#[derive(Default)]
pub struct StorageConfig {
    /// SQLite database file. Defaults to `<data_dir>/bagula.db`.
    pub database_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QueueConfig {
    pub workers: usize,
    pub capacity: usize,
    pub enqueue_timeout_ms: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Baseline window length as a multiple of the requested window.
    pub baseline_window_multiplier: u32,
    pub warning_threshold_pct: f64,
    pub critical_threshold_pct: f64,
    pub anomaly_z_threshold: f64,
    pub min_samples: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AuthConfig {
    pub min_key_length: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ApiConfig {
    pub max_page_size: u32,
    pub max_window_hours: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

// --- Default implementations ---

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 8000,
            request_timeout_ms: 10_000,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            capacity: 1024,
            enqueue_timeout_ms: 2_000,
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            shutdown_grace_secs: 10,
        }
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            baseline_window_multiplier: 7,
            warning_threshold_pct: 20.0,
            critical_threshold_pct: 50.0,
            anomaly_z_threshold: 3.0,
            min_samples: 5,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self { min_key_length: 10 }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            max_page_size: 1000,
            max_window_hours: 24 * 90,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "bagula=info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Errors produced while loading the config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

impl PlatformConfig {
    /// Load config from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };

        let config: Self = toml::from_str(&contents).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue.workers == 0 {
            return Err(ConfigError::Invalid("queue.workers must be at least 1".into()));
        }
        if self.queue.capacity == 0 {
            return Err(ConfigError::Invalid("queue.capacity must be at least 1".into()));
        }
        if self.queue.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "queue.max_attempts must be at least 1".into(),
            ));
        }
        if self.api.max_page_size == 0 {
            return Err(ConfigError::Invalid(
                "api.max_page_size must be at least 1".into(),
            ));
        }
        if self.analyzer.critical_threshold_pct < self.analyzer.warning_threshold_pct {
            return Err(ConfigError::Invalid(
                "analyzer.critical_threshold_pct must not be below warning_threshold_pct".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = PlatformConfig::load(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(cfg.server.port, 8000);
        assert_eq!(cfg.auth.min_key_length, 10);
        assert_eq!(cfg.queue.workers, 4);
        assert!(cfg.storage.database_path.is_none());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[server]\nport = 9100\n\n[queue]\nworkers = 2\n\n[logging]\nformat = \"json\"\n",
        )
        .unwrap();

        let cfg = PlatformConfig::load(&path).unwrap();
        assert_eq!(cfg.server.port, 9100);
        assert_eq!(cfg.server.bind, "127.0.0.1");
        assert_eq!(cfg.queue.workers, 2);
        assert_eq!(cfg.queue.capacity, 1024);
        assert_eq!(cfg.logging.format, LogFormat::Json);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();

        let err = PlatformConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn zero_workers_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[queue]\nworkers = 0\n").unwrap();

        let err = PlatformConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("queue.workers"));
    }

    #[test]
    fn inverted_thresholds_rejected() {
        let mut cfg = PlatformConfig::default();
        cfg.analyzer.warning_threshold_pct = 60.0;
        cfg.analyzer.critical_threshold_pct = 30.0;
        assert!(cfg.validate().is_err());
    }
}
