//! Configuration manager
//!
//! Layers built-in defaults, an optional configuration file and
//! `DISPATCH__`-prefixed environment variables, then exposes the result both
//! as typed [`DispatchSettings`] and through dotted-key accessors.

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use tracing::{debug, info};

use common::error::{Error, Result};

use crate::settings::DispatchSettings;

/// Environment variable prefix for overrides, e.g.
/// `DISPATCH__LOAD_BALANCER__STRATEGY=least-loaded`
pub const ENV_PREFIX: &str = "DISPATCH";

/// Configuration manager for the dispatcher
#[derive(Debug, Clone)]
pub struct ConfigManager {
    /// Typed settings
    settings: DispatchSettings,

    /// Settings as a value tree, used by the dotted-key accessors
    values: serde_json::Value,
}

impl ConfigManager {
    /// Creates a configuration manager from defaults and the environment
    pub fn new() -> Result<Self> {
        Self::build(Config::builder())
    }

    /// Creates a configuration manager from a TOML, YAML or JSON file,
    /// with environment overrides applied on top
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from {}", path.display());

        Self::build(Config::builder().add_source(File::from(path).required(true)))
    }

    /// Creates a configuration manager from an in-memory TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Self::build(Config::builder().add_source(File::from_str(content, FileFormat::Toml)))
    }

    /// Creates a configuration manager from already-built settings
    pub fn from_settings(settings: DispatchSettings) -> Result<Self> {
        settings.validate()?;
        let values = serde_json::to_value(&settings)?;
        Ok(Self { settings, values })
    }

    fn build(builder: config::ConfigBuilder<config::builder::DefaultState>) -> Result<Self> {
        let raw = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let settings: DispatchSettings = raw
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;

        debug!("Resolved configuration: {:?}", settings);

        Self::from_settings(settings)
    }

    /// Gets the typed settings
    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    fn lookup(&self, key: &str) -> Result<&serde_json::Value> {
        key.split('.')
            .try_fold(&self.values, |value, part| value.get(part))
            .filter(|value| !value.is_null())
            .ok_or_else(|| Error::NotFound(format!("Configuration key '{}'", key)))
    }

    /// Gets a string value
    pub fn get_string(&self, key: &str) -> Result<String> {
        match self.lookup(key)? {
            serde_json::Value::String(s) => Ok(s.clone()),
            other => Ok(other.to_string()),
        }
    }

    /// Gets a floating-point value
    pub fn get_f64(&self, key: &str) -> Result<f64> {
        self.lookup(key)?
            .as_f64()
            .ok_or_else(|| Error::Config(format!("Configuration key '{}' is not a number", key)))
    }

    /// Gets an unsigned integer value
    pub fn get_u64(&self, key: &str) -> Result<u64> {
        self.lookup(key)?
            .as_u64()
            .ok_or_else(|| Error::Config(format!("Configuration key '{}' is not an integer", key)))
    }

    /// Gets a size value
    pub fn get_usize(&self, key: &str) -> Result<usize> {
        self.get_u64(key).map(|v| v as usize)
    }

    /// Gets a boolean value
    pub fn get_bool(&self, key: &str) -> Result<bool> {
        self.lookup(key)?
            .as_bool()
            .ok_or_else(|| Error::Config(format!("Configuration key '{}' is not a boolean", key)))
    }

    /// Gets a duration stored in milliseconds
    pub fn get_duration(&self, key: &str) -> Result<Duration> {
        self.get_u64(key).map(Duration::from_millis)
    }
}
