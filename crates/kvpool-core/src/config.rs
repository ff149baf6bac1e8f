//! kvpool.toml configuration parser.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{ConfigError, ConfigResult};
use crate::resource::ResourceType;
use crate::settings::{BackendSettings, SettingsResolver};

/// Worker count used when neither worker setting is present.
pub const DEFAULT_MAX_WORKERS: usize = 128;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// MongoDB settings keyed by environment name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub mongodb: HashMap<String, BackendSettings>,
    /// Redis settings keyed by environment name.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub redis: HashMap<String, BackendSettings>,
    pub cache: Option<CacheConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Environment used to select backend settings.
    pub environment: String,
    pub max_threads_per_app_server: Option<usize>,
    /// Fallback worker count when `max_threads_per_app_server` is unset or zero.
    pub max_servers: Option<usize>,
    /// Poll `artifact` and request a restart when it changes.
    pub auto_reload: bool,
    /// Application build artifact watched by the reload watcher.
    pub artifact: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            max_threads_per_app_server: None,
            max_servers: None,
            auto_reload: false,
            artifact: None,
        }
    }
}

impl ServerConfig {
    /// Number of worker contexts, which is also the per-type connection capacity.
    pub fn max_workers(&self) -> usize {
        self.max_threads_per_app_server
            .filter(|n| *n > 0)
            .or(self.max_servers.filter(|n| *n > 0))
            .unwrap_or(DEFAULT_MAX_WORKERS)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub path: PathBuf,
    /// On-disk size that triggers eviction of old entries; `0` disables it.
    #[serde(default)]
    pub threshold_file_size: u64,
    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: u64,
}

fn default_gc_interval_secs() -> u64 {
    60
}

impl AppConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        debug!(?path, "configuration loaded");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Per-environment settings table for `ty`.
    pub fn backends(&self, ty: ResourceType) -> &HashMap<String, BackendSettings> {
        match ty {
            ResourceType::MongoDb => &self.mongodb,
            ResourceType::Redis => &self.redis,
        }
    }

    pub fn backends_mut(&mut self, ty: ResourceType) -> &mut HashMap<String, BackendSettings> {
        match ty {
            ResourceType::MongoDb => &mut self.mongodb,
            ResourceType::Redis => &mut self.redis,
        }
    }
}

impl SettingsResolver for AppConfig {
    fn is_available(&self, ty: ResourceType, environment: &str) -> bool {
        self.backends(ty).contains_key(environment)
    }

    fn resolve(&self, ty: ResourceType, environment: &str) -> ConfigResult<BackendSettings> {
        let settings = self
            .backends(ty)
            .get(environment)
            .ok_or_else(|| ConfigError::NotConfigured {
                ty,
                environment: environment.to_string(),
            })?
            .normalized();
        settings.validate(ty, environment)?;

        debug!(
            %ty,
            environment,
            host = ?settings.host,
            port = ?settings.port,
            database = ?settings.database_name,
            "resolved backend settings"
        );
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
[server]
environment = "production"
max_threads_per_app_server = 16
auto_reload = true
artifact = "lib/libapp.so"

[redis.production]
host = "redis.internal"
port = 6380
password = "secret"

[mongodb.development]
database_name = "app_dev"

[cache]
path = "cache.redb"
threshold_file_size = 1048576
"#;

    #[test]
    fn parses_full_config() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.server.environment, "production");
        assert_eq!(config.server.max_workers(), 16);
        assert!(config.server.auto_reload);
        assert_eq!(
            config.server.artifact.as_deref(),
            Some(Path::new("lib/libapp.so"))
        );

        let redis = &config.redis["production"];
        assert_eq!(redis.host.as_deref(), Some("redis.internal"));
        assert_eq!(redis.port, Some(6380));

        let cache = config.cache.unwrap();
        assert_eq!(cache.threshold_file_size, 1_048_576);
        assert_eq!(cache.gc_interval_secs, 60);
    }

    #[test]
    fn empty_config_uses_defaults() {
        let config = AppConfig::from_toml_str("").unwrap();
        assert_eq!(config.server.environment, "development");
        assert_eq!(config.server.max_workers(), DEFAULT_MAX_WORKERS);
        assert!(config.redis.is_empty());
        assert!(config.cache.is_none());
    }

    #[test]
    fn max_workers_falls_back_to_max_servers() {
        let server = ServerConfig {
            max_threads_per_app_server: Some(0),
            max_servers: Some(24),
            ..ServerConfig::default()
        };
        assert_eq!(server.max_workers(), 24);
    }

    #[test]
    fn availability_follows_environment() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        assert!(config.is_available(ResourceType::Redis, "production"));
        assert!(!config.is_available(ResourceType::Redis, "development"));
        assert!(config.is_available(ResourceType::MongoDb, "development"));
        assert!(!config.is_available(ResourceType::MongoDb, "production"));
    }

    #[test]
    fn resolve_normalizes_and_validates() {
        let mut config = AppConfig::from_toml_str(SAMPLE).unwrap();
        let redis = config.resolve(ResourceType::Redis, "production").unwrap();
        assert_eq!(redis.password.as_deref(), Some("secret"));

        let err = config
            .resolve(ResourceType::MongoDb, "production")
            .unwrap_err();
        assert!(matches!(err, ConfigError::NotConfigured { .. }));

        config
            .backends_mut(ResourceType::MongoDb)
            .insert("staging".to_string(), BackendSettings {
                database_name: Some("  ".to_string()),
                ..BackendSettings::default()
            });
        let err = config.resolve(ResourceType::MongoDb, "staging").unwrap_err();
        assert!(matches!(err, ConfigError::MissingDatabaseName { .. }));
    }

    #[test]
    fn roundtrips_through_toml() {
        let config = AppConfig::from_toml_str(SAMPLE).unwrap();
        let rendered = config.to_toml_string().unwrap();
        let reparsed = AppConfig::from_toml_str(&rendered).unwrap();
        assert_eq!(reparsed.redis, config.redis);
        assert_eq!(reparsed.server.max_workers(), 16);
    }

    #[test]
    fn from_file_reports_missing_path() {
        let err = AppConfig::from_file(Path::new("/nonexistent/kvpool.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn from_file_reads_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.server.environment, "production");
    }
}
