use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub downloads: DownloadConfig,
    pub node: NodeConfig,
    pub storage: StorageConfig,
    pub transfer: TransferConfig,
    pub uploads: UploadConfig,
    /// Enables dangerous operations like purge. Must never be true in production.
    pub test_mode: bool,
    /// Maximum size in bytes of an upload or a remotely fetched file
    pub max_upload_size: u64,
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub bind_address: String,
    pub data_dir: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Local,
    S3,
}

/// Canned ACL applied to objects written by a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ObjectAcl {
    #[default]
    Private,
    PublicRead,
}

impl ObjectAcl {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectAcl::Private => "private",
            ObjectAcl::PublicRead => "public-read",
        }
    }
}

impl FromStr for ObjectAcl {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "private" => Ok(ObjectAcl::Private),
            "public-read" => Ok(ObjectAcl::PublicRead),
            other => Err(ConfigError::ValidationError(format!(
                "unknown ACL '{other}' (expected private or public-read)"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket: String,
    /// Base URL of the S3-compatible service, e.g. https://s3.us-east-1.amazonaws.com
    pub endpoint: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

/// One durable store target. Stores are listed in download preference order.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub name: String,
    pub backend: StorageBackend,
    pub acl: ObjectAcl,
    /// A record becomes ready once any required store holds a complete copy.
    pub required: bool,
    /// Directory for the local backend
    pub local_path: String,
    /// Connection settings, required when backend is s3
    pub s3: Option<S3Config>,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub stores: Vec<StoreConfig>,
}

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Staging directory for in-progress and completed uploads
    pub temp_dir: String,
    /// Sessions idle for longer than this are purged along with their data
    pub session_ttl: Duration,
    pub sweep_interval: Duration,
    /// Content-type prefixes admitted by the default admission predicate.
    /// Empty admits everything.
    pub allowed_types: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub fetch_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DownloadConfig {
    pub cache_control: String,
}

impl StoreConfig {
    pub fn local(name: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            backend: StorageBackend::Local,
            acl: ObjectAcl::Private,
            required: true,
            local_path: path.to_string(),
            s3: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            stores: vec![StoreConfig::local("local", "./files")],
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            temp_dir: "./uploads".to_string(),
            session_ttl: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
            allowed_types: vec!["image/".to_string()],
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(60),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            cache_control: "public, max-age=31536000".to_string(),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key).ok().map(|v| v == "true" || v == "1")
}

/// Environment prefix for a store's settings: `primary-s3` -> `STORE_PRIMARY_S3_`.
fn store_env_prefix(name: &str) -> String {
    format!("STORE_{}_", name.to_uppercase().replace('-', "_"))
}

fn load_store(name: &str) -> Result<StoreConfig, ConfigError> {
    let prefix = store_env_prefix(name);
    let var = |suffix: &str| std::env::var(format!("{prefix}{suffix}")).ok();

    let backend = match var("BACKEND")
        .unwrap_or_else(|| "local".to_string())
        .to_lowercase()
        .as_str()
    {
        "s3" => StorageBackend::S3,
        "local" => StorageBackend::Local,
        other => {
            return Err(ConfigError::ValidationError(format!(
                "{prefix}BACKEND has unknown value '{other}'"
            )))
        }
    };

    let acl = match var("ACL") {
        Some(acl) => acl.parse()?,
        None => ObjectAcl::default(),
    };

    let s3 = match backend {
        StorageBackend::S3 => Some(S3Config {
            bucket: var("BUCKET").unwrap_or_default(),
            endpoint: var("ENDPOINT")
                .unwrap_or_else(|| "https://s3.amazonaws.com".to_string()),
            region: var("REGION").unwrap_or_else(|| "us-east-1".to_string()),
            access_key_id: var("ACCESS_KEY_ID")
                .or_else(|| std::env::var("AWS_ACCESS_KEY_ID").ok())
                .unwrap_or_default(),
            secret_access_key: var("SECRET_ACCESS_KEY")
                .or_else(|| std::env::var("AWS_SECRET_ACCESS_KEY").ok())
                .unwrap_or_default(),
        }),
        StorageBackend::Local => None,
    };

    Ok(StoreConfig {
        name: name.to_string(),
        backend,
        acl,
        required: env_flag(&format!("{prefix}REQUIRED")).unwrap_or(true),
        local_path: var("PATH").unwrap_or_else(|| format!("./files/{name}")),
        s3,
    })
}

impl Config {
    /// Load configuration from environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let data_dir = std::env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string());

        let test_mode = env_flag("TEST_MODE").unwrap_or(false);

        let max_upload_size = env_or("MAX_UPLOAD_SIZE", 50 * 1024 * 1024); // 50MB

        let stores = match std::env::var("STORES") {
            Ok(names) => names
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(load_store)
                .collect::<Result<Vec<_>, _>>()?,
            Err(_) => {
                let local_storage_path =
                    std::env::var("LOCAL_STORAGE_PATH").unwrap_or_else(|_| "./files".to_string());
                vec![StoreConfig::local("local", &local_storage_path)]
            }
        };

        let upload_defaults = UploadConfig::default();
        let allowed_types = match std::env::var("UPLOAD_ALLOWED_TYPES") {
            Ok(types) => types
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty() && s != "*")
                .collect(),
            Err(_) => upload_defaults.allowed_types,
        };

        let transfer_defaults = TransferConfig::default();

        let config = Config {
            downloads: DownloadConfig {
                cache_control: std::env::var("DOWNLOAD_CACHE_CONTROL")
                    .unwrap_or_else(|_| DownloadConfig::default().cache_control),
            },
            node: NodeConfig {
                bind_address,
                data_dir,
            },
            storage: StorageConfig { stores },
            transfer: TransferConfig {
                max_attempts: env_or("TRANSFER_MAX_ATTEMPTS", transfer_defaults.max_attempts),
                initial_backoff: Duration::from_millis(env_or(
                    "TRANSFER_INITIAL_BACKOFF_MS",
                    transfer_defaults.initial_backoff.as_millis() as u64,
                )),
                max_backoff: Duration::from_millis(env_or(
                    "TRANSFER_MAX_BACKOFF_MS",
                    transfer_defaults.max_backoff.as_millis() as u64,
                )),
                fetch_timeout: Duration::from_secs(env_or(
                    "FETCH_TIMEOUT_SECONDS",
                    transfer_defaults.fetch_timeout.as_secs(),
                )),
            },
            uploads: UploadConfig {
                temp_dir: std::env::var("TEMP_DIR").unwrap_or(upload_defaults.temp_dir),
                session_ttl: Duration::from_secs(env_or(
                    "UPLOAD_TTL_SECONDS",
                    upload_defaults.session_ttl.as_secs(),
                )),
                sweep_interval: Duration::from_secs(env_or(
                    "UPLOAD_SWEEP_INTERVAL_SECONDS",
                    upload_defaults.sweep_interval.as_secs(),
                )),
                allowed_types,
            },
            test_mode,
            max_upload_size,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.stores.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one store must be configured".to_string(),
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for store in &self.storage.stores {
            if store.name.is_empty() || store.name.contains('/') {
                return Err(ConfigError::ValidationError(format!(
                    "invalid store name '{}'",
                    store.name
                )));
            }
            if !seen.insert(store.name.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "store '{}' is configured twice",
                    store.name
                )));
            }
            if store.backend == StorageBackend::S3 {
                let prefix = store_env_prefix(&store.name);
                let s3 = store.s3.as_ref().ok_or_else(|| {
                    ConfigError::ValidationError(format!("{prefix}BUCKET is required for s3"))
                })?;
                if s3.bucket.is_empty() {
                    return Err(ConfigError::ValidationError(format!(
                        "{prefix}BUCKET is required when {prefix}BACKEND=s3"
                    )));
                }
                if s3.access_key_id.is_empty() || s3.secret_access_key.is_empty() {
                    return Err(ConfigError::ValidationError(format!(
                        "credentials are required for s3 store '{}'",
                        store.name
                    )));
                }
            }
        }

        if !self.storage.stores.iter().any(|s| s.required) {
            return Err(ConfigError::ValidationError(
                "at least one store must be required".to_string(),
            ));
        }

        if self.transfer.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "TRANSFER_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        if self.transfer.initial_backoff > self.transfer.max_backoff {
            tracing::warn!(
                "TRANSFER_INITIAL_BACKOFF_MS exceeds TRANSFER_MAX_BACKOFF_MS; \
                 every retry will wait the maximum backoff"
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            downloads: DownloadConfig::default(),
            node: NodeConfig {
                bind_address: "127.0.0.1:0".to_string(),
                data_dir: "./data".to_string(),
            },
            storage: StorageConfig::default(),
            transfer: TransferConfig::default(),
            uploads: UploadConfig::default(),
            test_mode: false,
            max_upload_size: 1024,
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn test_duplicate_store_names_rejected() {
        let mut config = base_config();
        config
            .storage
            .stores
            .push(StoreConfig::local("local", "./other"));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_no_required_store_rejected() {
        let mut config = base_config();
        config.storage.stores[0].required = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_s3_store_requires_bucket() {
        let mut config = base_config();
        config.storage.stores.push(StoreConfig {
            name: "s3-store".to_string(),
            backend: StorageBackend::S3,
            acl: ObjectAcl::PublicRead,
            required: false,
            local_path: String::new(),
            s3: Some(S3Config {
                bucket: String::new(),
                endpoint: "http://localhost:9000".to_string(),
                region: "us-east-1".to_string(),
                access_key_id: "key".to_string(),
                secret_access_key: "secret".to_string(),
            }),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_acl_parse() {
        assert_eq!(
            "public-read".parse::<ObjectAcl>().unwrap(),
            ObjectAcl::PublicRead
        );
        assert_eq!("PRIVATE".parse::<ObjectAcl>().unwrap(), ObjectAcl::Private);
        assert!("world-writable".parse::<ObjectAcl>().is_err());
    }

    #[test]
    fn test_store_env_prefix() {
        assert_eq!(store_env_prefix("s3-store"), "STORE_S3_STORE_");
    }
}
