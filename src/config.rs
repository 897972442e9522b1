//! Configuration
//!
//! [`EvolutionsConfig`] and [`DatabaseConfig`] load from `config/config.toml`
//! (sections `[evolutions]` and `[database]`) and from environment variables
//! prefixed `EVOLUTIONS__`, e.g. `EVOLUTIONS__EVOLUTIONS__META_TABLE`.

use crate::evolution::state_store::{Namespace, DEFAULT_META_TABLE};
use crate::evolution::{EvolutionError, SubstitutionContext, DEFAULT_DATABASE};
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

const CONFIG_FILE: &str = "config/config.toml";
const ENV_PREFIX: &str = "EVOLUTIONS";

/// Settings for one evolve/cleanup call
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct EvolutionsConfig {
    /// Run each statement on its own instead of one transaction per script
    #[serde(default = "default_autocommit")]
    pub autocommit: bool,

    /// Schema holding the meta table; empty for the default search path
    #[serde(default)]
    pub schema: String,

    #[serde(default = "default_meta_table")]
    pub meta_table: String,

    #[serde(default)]
    pub substitutions: SubstitutionContext,

    /// Upper bound on waiting for the evolutions lock, in milliseconds
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
}

fn default_autocommit() -> bool {
    true
}

fn default_meta_table() -> String {
    DEFAULT_META_TABLE.to_string()
}

fn default_lock_timeout_ms() -> u64 {
    60_000
}

impl Default for EvolutionsConfig {
    fn default() -> Self {
        Self {
            autocommit: default_autocommit(),
            schema: String::new(),
            meta_table: default_meta_table(),
            substitutions: SubstitutionContext::default(),
            lock_timeout_ms: default_lock_timeout_ms(),
        }
    }
}

impl EvolutionsConfig {
    #[must_use]
    pub fn with_autocommit(mut self, autocommit: bool) -> Self {
        self.autocommit = autocommit;
        self
    }

    #[must_use]
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    #[must_use]
    pub fn with_meta_table(mut self, meta_table: impl Into<String>) -> Self {
        self.meta_table = meta_table.into();
        self
    }

    #[must_use]
    pub fn with_substitutions(mut self, substitutions: SubstitutionContext) -> Self {
        self.substitutions = substitutions;
        self
    }

    #[must_use]
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn namespace(&self) -> Namespace {
        Namespace::new(&self.schema, &self.meta_table)
    }

    /// Reject settings that cannot name a meta table or a variable
    pub fn validate(&self) -> Result<(), EvolutionError> {
        if self.meta_table.trim().is_empty() {
            return Err(EvolutionError::Config(
                "meta_table cannot be empty".to_string(),
            ));
        }
        if self.meta_table.contains('\0') || self.schema.contains('\0') {
            return Err(EvolutionError::Config(
                "schema and meta_table cannot contain NUL characters".to_string(),
            ));
        }
        if self.substitutions.prefix.is_empty() && !self.substitutions.is_noop() {
            return Err(EvolutionError::Config(
                "substitution prefix cannot be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Load from `config/config.toml` section `[evolutions]`, falling back to env vars.
    ///
    /// A missing section yields the defaults.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_settings(&load_settings()?)
    }

    /// Read the `evolutions` section of already-built settings
    pub fn from_settings(settings: &Config) -> Result<Self, ConfigError> {
        match settings.get::<EvolutionsConfig>("evolutions") {
            Ok(config) => Ok(config),
            Err(ConfigError::NotFound(_)) => Ok(Self::default()),
            Err(e) => Err(ConfigError::Message(format!(
                "Evolutions configuration could not be loaded from file or environment: {e}"
            ))),
        }
    }
}

/// Target database
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatabaseConfig {
    /// Logical name; selects the script set
    #[serde(default = "default_database_name")]
    pub name: String,
    pub url: String,
}

fn default_database_name() -> String {
    DEFAULT_DATABASE.to_string()
}

impl DatabaseConfig {
    /// Load from `config/config.toml` section `[database]`, falling back to env vars.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_settings(&load_settings()?)
    }

    pub fn from_settings(settings: &Config) -> Result<Self, ConfigError> {
        settings.get::<DatabaseConfig>("database").map_err(|e| {
            ConfigError::Message(format!(
                "Database configuration could not be loaded from file or environment: {e}"
            ))
        })
    }
}

fn load_settings() -> Result<Config, ConfigError> {
    let builder = Config::builder()
        .add_source(File::with_name(CONFIG_FILE).required(false))
        .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    match builder.build() {
        Ok(settings) => Ok(settings),
        Err(err) => {
            // unreadable file: retry with the environment alone
            if std::path::Path::new(CONFIG_FILE).exists() {
                log::warn!("Failed to load {CONFIG_FILE}, falling back to env: {err}");
            }
            Config::builder()
                .add_source(Environment::with_prefix(ENV_PREFIX).separator("__"))
                .build()
                .map_err(|env_err| {
                    ConfigError::Message(format!(
                        "Failed to load configuration from file and env: {err}, then env-only error: {env_err}"
                    ))
                })
        }
    }
}
