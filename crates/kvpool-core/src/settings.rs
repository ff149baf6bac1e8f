//! Backend connection settings and the resolver seam used by the pools.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, ConfigResult};
use crate::resource::ResourceType;

/// Connection parameters for one backend in one environment.
///
/// Mirrors a `[redis.<env>]` / `[mongodb.<env>]` table in `kvpool.toml`.
/// Blank strings and a zero port are treated as unset.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSettings {
    pub database_name: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub user_name: Option<String>,
    pub password: Option<String>,
    pub connect_options: Option<String>,
}

impl BackendSettings {
    /// Trim every string field and drop the ones that end up empty.
    pub fn normalized(&self) -> Self {
        fn clean(value: &Option<String>) -> Option<String> {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        }

        Self {
            database_name: clean(&self.database_name),
            host: clean(&self.host),
            port: self.port.filter(|p| *p > 0),
            user_name: clean(&self.user_name),
            password: clean(&self.password),
            connect_options: clean(&self.connect_options),
        }
    }

    /// Check the settings are usable for `ty`.
    pub fn validate(&self, ty: ResourceType, environment: &str) -> ConfigResult<()> {
        if ty.requires_database_name() && self.database_name.is_none() {
            return Err(ConfigError::MissingDatabaseName {
                ty,
                environment: environment.to_string(),
            });
        }
        Ok(())
    }

    /// Host to connect to, defaulting to loopback.
    pub fn host_or_default(&self) -> &str {
        self.host.as_deref().unwrap_or("127.0.0.1")
    }

    /// Port to connect to, defaulting to the type's well-known port.
    pub fn port_or_default(&self, ty: ResourceType) -> u16 {
        self.port.unwrap_or(ty.default_port())
    }

    /// `host:port` address string for `ty`.
    pub fn address(&self, ty: ResourceType) -> String {
        format!("{}:{}", self.host_or_default(), self.port_or_default(ty))
    }
}

impl fmt::Debug for BackendSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSettings")
            .field("database_name", &self.database_name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user_name", &self.user_name)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("connect_options", &self.connect_options)
            .finish()
    }
}

/// Resolves connection parameters for a `(type, environment)` pair.
///
/// The connection pool consults this every time it (re)opens a cold slot,
/// so implementations may reflect configuration changes between opens.
pub trait SettingsResolver: Send + Sync {
    /// Whether `ty` is configured and enabled for `environment`.
    fn is_available(&self, ty: ResourceType, environment: &str) -> bool;

    /// Connection parameters for `ty` in `environment`.
    fn resolve(&self, ty: ResourceType, environment: &str) -> ConfigResult<BackendSettings>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalized_drops_blank_fields() {
        let raw = BackendSettings {
            database_name: Some("  app ".to_string()),
            host: Some("   ".to_string()),
            port: Some(0),
            user_name: Some(String::new()),
            password: None,
            connect_options: Some("ssl=true".to_string()),
        };
        let clean = raw.normalized();
        assert_eq!(clean.database_name.as_deref(), Some("app"));
        assert_eq!(clean.host, None);
        assert_eq!(clean.port, None);
        assert_eq!(clean.user_name, None);
        assert_eq!(clean.connect_options.as_deref(), Some("ssl=true"));
    }

    #[test]
    fn address_falls_back_to_defaults() {
        let settings = BackendSettings::default();
        assert_eq!(settings.address(ResourceType::Redis), "127.0.0.1:6379");
        assert_eq!(settings.address(ResourceType::MongoDb), "127.0.0.1:27017");
    }

    #[test]
    fn mongodb_requires_database_name() {
        let settings = BackendSettings::default();
        assert!(settings.validate(ResourceType::Redis, "dev").is_ok());
        let err = settings.validate(ResourceType::MongoDb, "dev").unwrap_err();
        assert!(matches!(err, ConfigError::MissingDatabaseName { .. }));
    }

    #[test]
    fn debug_redacts_password() {
        let settings = BackendSettings {
            password: Some("hunter2".to_string()),
            ..BackendSettings::default()
        };
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("***"));
    }
}
