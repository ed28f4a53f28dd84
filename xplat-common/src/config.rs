//! Layered service configuration
//!
//! Resolution order, highest priority first:
//! 1. Command-line argument / environment variable (collected by the binary into
//!    [`ConfigOverrides`])
//! 2. TOML config file
//! 3. Compiled default
//!
//! A missing default TOML file is not an error; the service starts on defaults.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Default HTTP listen address
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:3000";
/// Default inference service base URL
pub const DEFAULT_INFERENCE_URL: &str = "http://127.0.0.1:8080";
/// Virtual-host routing key understood by the inference ingress
pub const DEFAULT_INFERENCE_HOST_HEADER: &str =
    "kserve-custom-inference-service.default.example.com";
pub const DEFAULT_INFERENCE_TIMEOUT_SECS: u64 = 60;
/// Signed artifact URLs stay valid for one hour
pub const DEFAULT_PRESIGN_TTL_SECS: u64 = 3600;
pub const DEFAULT_WORKER_COUNT: usize = 4;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

const CONFIG_DIR_NAME: &str = "xplat";
const CONFIG_FILE_NAME: &str = "xplat-predict.toml";

/// On-disk TOML configuration. Every field is optional.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TomlConfig {
    pub bind_address: Option<String>,
    pub data_folder: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub log_level: Option<String>,
    pub inference: InferenceToml,
    pub storage: StorageToml,
    pub queue: QueueToml,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceToml {
    pub base_url: Option<String>,
    pub host_header: Option<String>,
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageToml {
    pub artifact_folder: Option<PathBuf>,
    pub public_base_url: Option<String>,
    pub signing_secret: Option<String>,
    pub presign_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueToml {
    pub worker_count: Option<usize>,
    pub max_attempts: Option<u32>,
    pub retry_backoff_ms: Option<u64>,
    pub poll_interval_ms: Option<u64>,
}

/// Values supplied on the command line or through the environment
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub bind_address: Option<String>,
    pub data_folder: Option<PathBuf>,
    pub database_path: Option<PathBuf>,
    pub log_level: Option<String>,
    pub inference_url: Option<String>,
    pub inference_host_header: Option<String>,
    pub artifact_folder: Option<PathBuf>,
    pub public_base_url: Option<String>,
    pub signing_secret: Option<String>,
    pub worker_count: Option<usize>,
}

/// External inference service settings
#[derive(Debug, Clone)]
pub struct InferenceConfig {
    pub base_url: String,
    pub host_header: String,
    pub timeout: Duration,
}

/// Artifact storage settings
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub artifact_folder: PathBuf,
    pub public_base_url: String,
    pub signing_secret: String,
    pub presign_ttl: Duration,
}

/// Job queue and worker settings
#[derive(Debug, Clone)]
pub struct QueueConfig {
    pub worker_count: usize,
    pub max_attempts: u32,
    pub retry_backoff: Duration,
    pub poll_interval: Duration,
}

/// Fully resolved configuration
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub bind_address: String,
    pub data_folder: PathBuf,
    pub database_path: PathBuf,
    pub log_level: String,
    pub inference: InferenceConfig,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
}

impl ServiceConfig {
    /// Merge overrides, TOML values and compiled defaults, then validate
    pub fn resolve(overrides: &ConfigOverrides, file: &TomlConfig) -> Result<Self> {
        let bind_address = pick(&overrides.bind_address, &file.bind_address)
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let data_folder = pick(&overrides.data_folder, &file.data_folder)
            .unwrap_or_else(default_data_folder);

        let database_path = pick(&overrides.database_path, &file.database_path)
            .unwrap_or_else(|| data_folder.join("xplat.db"));

        let log_level = pick(&overrides.log_level, &file.log_level)
            .unwrap_or_else(|| "info".to_string());

        let base_url = pick(&overrides.inference_url, &file.inference.base_url)
            .unwrap_or_else(|| DEFAULT_INFERENCE_URL.to_string());
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(Error::Config(format!(
                "Inference base URL must start with http:// or https://: {}",
                base_url
            )));
        }

        let host_header = pick(&overrides.inference_host_header, &file.inference.host_header)
            .unwrap_or_else(|| DEFAULT_INFERENCE_HOST_HEADER.to_string());

        let artifact_folder = pick(&overrides.artifact_folder, &file.storage.artifact_folder)
            .unwrap_or_else(|| data_folder.join("artifacts"));

        let public_base_url = pick(&overrides.public_base_url, &file.storage.public_base_url)
            .unwrap_or_else(|| format!("http://{}", bind_address));

        let signing_secret = match pick(&overrides.signing_secret, &file.storage.signing_secret) {
            Some(secret) if !secret.trim().is_empty() => secret,
            _ => {
                warn!("No artifact signing secret configured; generated a random one (signed URLs will not survive a restart)");
                generate_secret()
            }
        };

        let worker_count = pick(&overrides.worker_count, &file.queue.worker_count)
            .unwrap_or(DEFAULT_WORKER_COUNT);
        if worker_count == 0 {
            return Err(Error::Config("queue.worker_count must be at least 1".to_string()));
        }

        let max_attempts = file.queue.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS);
        if max_attempts == 0 {
            return Err(Error::Config("queue.max_attempts must be at least 1".to_string()));
        }

        Ok(Self {
            bind_address,
            data_folder,
            database_path,
            log_level,
            inference: InferenceConfig {
                base_url: base_url.trim_end_matches('/').to_string(),
                host_header,
                timeout: Duration::from_secs(
                    file.inference.timeout_secs.unwrap_or(DEFAULT_INFERENCE_TIMEOUT_SECS),
                ),
            },
            storage: StorageConfig {
                artifact_folder,
                public_base_url: public_base_url.trim_end_matches('/').to_string(),
                signing_secret,
                presign_ttl: Duration::from_secs(
                    file.storage.presign_ttl_secs.unwrap_or(DEFAULT_PRESIGN_TTL_SECS),
                ),
            },
            queue: QueueConfig {
                worker_count,
                max_attempts,
                retry_backoff: Duration::from_millis(
                    file.queue.retry_backoff_ms.unwrap_or(DEFAULT_RETRY_BACKOFF_MS),
                ),
                poll_interval: Duration::from_millis(
                    file.queue.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS),
                ),
            },
        })
    }
}

fn pick<T: Clone>(first: &Option<T>, second: &Option<T>) -> Option<T> {
    first.clone().or_else(|| second.clone())
}

fn generate_secret() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    format!("{:016x}{:016x}", rng.gen::<u64>(), rng.gen::<u64>())
}

/// Platform default for the TOML config file
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
}

/// OS-dependent default data folder (database + artifacts)
pub fn default_data_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join(CONFIG_DIR_NAME))
        .unwrap_or_else(|| PathBuf::from("./xplat_data"))
}

/// Read and parse a TOML config file
pub fn load_toml_config(path: &Path) -> Result<TomlConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
    toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
}

/// Load the TOML layer
///
/// An explicitly requested file must exist. The platform default file is
/// optional: when absent the service runs on defaults.
pub fn load_toml_layer(explicit: Option<&Path>) -> Result<TomlConfig> {
    if let Some(path) = explicit {
        info!("Loading configuration from {}", path.display());
        return load_toml_config(path);
    }

    match default_config_path() {
        Some(path) if path.exists() => {
            info!("Loading configuration from {}", path.display());
            load_toml_config(&path)
        }
        Some(path) => {
            info!("No config file at {} - using defaults", path.display());
            Ok(TomlConfig::default())
        }
        None => {
            warn!("Could not determine config directory - using defaults");
            Ok(TomlConfig::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_nothing_configured() {
        let config = ServiceConfig::resolve(&ConfigOverrides::default(), &TomlConfig::default())
            .unwrap();

        assert_eq!(config.bind_address, DEFAULT_BIND_ADDRESS);
        assert_eq!(config.inference.base_url, DEFAULT_INFERENCE_URL);
        assert_eq!(config.inference.host_header, DEFAULT_INFERENCE_HOST_HEADER);
        assert_eq!(config.storage.presign_ttl, Duration::from_secs(3600));
        assert_eq!(config.queue.worker_count, DEFAULT_WORKER_COUNT);
        assert_eq!(config.database_path, config.data_folder.join("xplat.db"));
        assert_eq!(config.storage.public_base_url, "http://127.0.0.1:3000");
        assert_eq!(config.storage.signing_secret.len(), 32);
    }

    #[test]
    fn test_override_beats_toml() {
        let overrides = ConfigOverrides {
            inference_url: Some("http://cli:1".to_string()),
            ..Default::default()
        };
        let file = TomlConfig {
            inference: InferenceToml {
                base_url: Some("http://toml:2".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let config = ServiceConfig::resolve(&overrides, &file).unwrap();
        assert_eq!(config.inference.base_url, "http://cli:1");
    }

    #[test]
    fn test_toml_beats_default() {
        let file = TomlConfig {
            queue: QueueToml {
                worker_count: Some(9),
                max_attempts: Some(5),
                ..Default::default()
            },
            storage: StorageToml {
                signing_secret: Some("s3cret".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let config = ServiceConfig::resolve(&ConfigOverrides::default(), &file).unwrap();
        assert_eq!(config.queue.worker_count, 9);
        assert_eq!(config.queue.max_attempts, 5);
        assert_eq!(config.storage.signing_secret, "s3cret");
    }

    #[test]
    fn test_zero_workers_rejected() {
        let overrides = ConfigOverrides {
            worker_count: Some(0),
            ..Default::default()
        };
        let result = ServiceConfig::resolve(&overrides, &TomlConfig::default());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_non_http_inference_url_rejected() {
        let overrides = ConfigOverrides {
            inference_url: Some("ftp://models".to_string()),
            ..Default::default()
        };
        let result = ServiceConfig::resolve(&overrides, &TomlConfig::default());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_trailing_slashes_trimmed() {
        let overrides = ConfigOverrides {
            inference_url: Some("http://models:8080/".to_string()),
            public_base_url: Some("https://cdn.example.com/".to_string()),
            ..Default::default()
        };
        let config = ServiceConfig::resolve(&overrides, &TomlConfig::default()).unwrap();
        assert_eq!(config.inference.base_url, "http://models:8080");
        assert_eq!(config.storage.public_base_url, "https://cdn.example.com");
    }
}
