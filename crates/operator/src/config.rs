use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::pod::WorkerDefaults;

pub const CONFIG_ENV: &str = "ALPINE_OPERATOR_CONFIG";
pub const NAMESPACE_ENV: &str = "ALPINE_OPERATOR_NAMESPACE";
pub const METRICS_ADDR_ENV: &str = "ALPINE_OPERATOR_METRICS_ADDR";

const DEFAULT_METRICS_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_ERROR_REQUEUE_SECS: u64 = 10;
const DEFAULT_RECONCILE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid metrics address {0:?}")]
    MetricsAddr(String),
}

/// On-disk TOML layout; every key is optional.
#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub namespace: Option<String>,
    pub metrics_addr: Option<String>,
    pub error_requeue_secs: Option<u64>,
    pub reconcile_timeout_secs: Option<u64>,
    pub worker: Option<WorkerDefaults>,
}

#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    /// Namespace to watch; all namespaces when `None`.
    pub namespace: Option<String>,
    pub metrics_addr: SocketAddr,
    /// Delay before a failed pass is retried.
    pub error_requeue: Duration,
    pub reconcile_timeout: Option<Duration>,
    pub worker: WorkerDefaults,
}

impl EffectiveConfig {
    /// Loads from `path`, else `$ALPINE_OPERATOR_CONFIG`, else built-in defaults,
    /// then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
        Self::from_sources(path.as_deref(), |key| std::env::var(key).ok())
    }

    pub fn from_sources(path: Option<&Path>, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut file_cfg = match path {
            Some(path) => read_file(path)?,
            None => FileConfig::default(),
        };

        if let Some(ns) = env(NAMESPACE_ENV).filter(|v| !v.is_empty()) {
            file_cfg.namespace = Some(ns);
        }
        if let Some(addr) = env(METRICS_ADDR_ENV).filter(|v| !v.is_empty()) {
            file_cfg.metrics_addr = Some(addr);
        }

        let raw_addr = file_cfg.metrics_addr.unwrap_or_else(|| DEFAULT_METRICS_ADDR.to_string());
        let metrics_addr = raw_addr.parse().map_err(|_| ConfigError::MetricsAddr(raw_addr.clone()))?;
        let error_requeue_secs = file_cfg.error_requeue_secs.unwrap_or(DEFAULT_ERROR_REQUEUE_SECS).max(1);
        let reconcile_timeout = match file_cfg.reconcile_timeout_secs.unwrap_or(DEFAULT_RECONCILE_TIMEOUT_SECS) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };

        Ok(Self {
            namespace: file_cfg.namespace.filter(|ns| !ns.is_empty()),
            metrics_addr,
            error_requeue: Duration::from_secs(error_requeue_secs),
            reconcile_timeout,
            worker: file_cfg.worker.unwrap_or_default(),
        })
    }
}

fn read_file(path: &Path) -> Result<FileConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
    debug!(path = ?path, len = content.len(), "config.read");
    toml::from_str(&content).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
}
