//! kvpool-core: shared vocabulary for the kvpool application server.
//!
//! Holds the pieces every other kvpool crate agrees on:
//!
//! - [`ResourceType`]: the closed set of pooled backend kinds
//! - [`NamedStack`]: the thread-safe LIFO every pool is built from
//! - [`BackendSettings`] and the [`SettingsResolver`] seam
//! - [`AppConfig`]: the `kvpool.toml` configuration file

pub mod config;
pub mod error;
pub mod resource;
pub mod settings;
pub mod stack;

pub use config::{AppConfig, CacheConfig, ServerConfig};
pub use error::{ConfigError, ConfigResult};
pub use resource::ResourceType;
pub use settings::{BackendSettings, SettingsResolver};
pub use stack::NamedStack;
