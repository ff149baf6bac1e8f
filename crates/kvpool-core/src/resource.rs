//! Resource types: the closed set of pooled backend kinds.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// A category of pooled backend connection.
///
/// Each member maps to a driver name, a config section name and a dense
/// index used to address per-type pool state in fixed-size arrays.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    /// MongoDB document store.
    MongoDb,
    /// Redis key/value store.
    Redis,
}

impl ResourceType {
    /// Every registered type, ordered by [`index`](Self::index).
    pub const ALL: [ResourceType; 2] = [ResourceType::MongoDb, ResourceType::Redis];

    /// Number of registered types.
    pub const COUNT: usize = Self::ALL.len();

    /// Dense index into per-type state arrays.
    pub const fn index(self) -> usize {
        match self {
            ResourceType::MongoDb => 0,
            ResourceType::Redis => 1,
        }
    }

    /// Upper-case driver name, as used in logs and connection registries.
    pub const fn driver_name(self) -> &'static str {
        match self {
            ResourceType::MongoDb => "MONGODB",
            ResourceType::Redis => "REDIS",
        }
    }

    /// Name of the `kvpool.toml` section holding this type's settings.
    pub const fn section(self) -> &'static str {
        match self {
            ResourceType::MongoDb => "mongodb",
            ResourceType::Redis => "redis",
        }
    }

    /// Port used when the settings leave it unset.
    pub const fn default_port(self) -> u16 {
        match self {
            ResourceType::MongoDb => 27017,
            ResourceType::Redis => 6379,
        }
    }

    /// Whether the settings must name a database for this type.
    ///
    /// Redis addresses databases by number and falls back to `0`.
    pub const fn requires_database_name(self) -> bool {
        !matches!(self, ResourceType::Redis)
    }

    /// Look up a type by driver or section name (case-insensitive).
    pub fn from_driver_name(name: &str) -> Result<Self, ConfigError> {
        Self::ALL
            .into_iter()
            .find(|ty| {
                ty.driver_name().eq_ignore_ascii_case(name) || ty.section().eq_ignore_ascii_case(name)
            })
            .ok_or_else(|| ConfigError::UnknownType(name.to_string()))
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.section())
    }
}

impl FromStr for ResourceType {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_driver_name(s.trim())
    }
}
