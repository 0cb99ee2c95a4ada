//! Server configuration read from the environment.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::storage::StorageConfig;
use crate::sync::ManagerConfig;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?}")]
    Invalid { name: String, value: String },
}

/// Everything the server binary needs to start
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub storage: StorageConfig,
    pub manager: ManagerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            storage: StorageConfig::default(),
            manager: ManagerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Read `PORT`, `STORAGE_PATH`, `USER_WAIT_TIMEOUT_MS`,
    /// `COLLECT_USERS_TIMEOUT_MS`, `INSTANCE_CLEANUP_TIMEOUT_MS`,
    /// `MAX_INSTANCES`, `SAVE_DEBOUNCE_MS` and `BUS_ADDRESS`. Unset
    /// variables keep their defaults; the timeouts and `MAX_INSTANCES` must
    /// be non-zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(port) = parse(&lookup, "PORT")? {
            config.port = port;
        }
        if let Some(path) = lookup("STORAGE_PATH") {
            config.storage.path = path;
        }
        if let Some(ms) = parse(&lookup, "SAVE_DEBOUNCE_MS")? {
            config.storage.save_debounce = Duration::from_millis(ms);
        }
        if let Some(timeout) = parse_millis(&lookup, "USER_WAIT_TIMEOUT_MS")? {
            config.manager.user_wait_timeout = timeout;
        }
        if let Some(timeout) = parse_millis(&lookup, "COLLECT_USERS_TIMEOUT_MS")? {
            config.manager.collect_users_timeout = timeout;
        }
        if let Some(timeout) = parse_millis(&lookup, "INSTANCE_CLEANUP_TIMEOUT_MS")? {
            config.manager.instance_cleanup_timeout = timeout;
        }
        if let Some(max) = parse_positive(&lookup, "MAX_INSTANCES")? {
            config.manager.max_instances = max;
        }
        if let Some(address) = lookup("BUS_ADDRESS") {
            config.manager.address = address;
        }

        Ok(config)
    }
}

fn parse<F, T>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match lookup(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                name: name.to_string(),
                value,
            }),
    }
}

/// A non-zero millisecond duration
fn parse_millis<F>(lookup: &F, name: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_positive::<F, u64>(lookup, name)?.map(Duration::from_millis))
}

fn parse_positive<F, T>(lookup: &F, name: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Default + PartialEq,
{
    match parse::<F, T>(lookup, name)? {
        Some(value) if value == T::default() => Err(ConfigError::Invalid {
            name: name.to_string(),
            value: lookup(name).unwrap_or_default(),
        }),
        value => Ok(value),
    }
}
