//! Process-wide configuration, loaded once at startup from the
//! environment and immutable thereafter.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::domain::error::BridgeError;

const DEFAULT_DB_PATH: &str = "./acp2.db";
const DEFAULT_AGENTS_CONFIG: &str = "./agents.json";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0";
const DEFAULT_BIND_PORT: u16 = 8001;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_GRACE_PERIOD_MS: u64 = 2000;

#[derive(Debug, Clone)]
pub struct Config {
    /// Bearer token callers must present. `None` disables auth entirely.
    pub auth_token: Option<String>,
    pub log_level: String,
    pub db_path: PathBuf,
    pub agents_config_path: PathBuf,
    pub bind_addr: IpAddr,
    pub bind_port: u16,
    pub idle_timeout: Duration,
    pub grace_period: Duration,
    pub persist_updates: bool,
}

impl Config {
    /// Loads configuration from the process environment.
    ///
    /// # Errors
    /// Returns [`BridgeError::ConfigError`] if a value is present but
    /// cannot be parsed (e.g. a non-numeric port).
    pub fn from_env() -> Result<Self, BridgeError> {
        let auth_token = env_nonempty("ACP2_AUTH_TOKEN");

        let log_level = std::env::var("ACP2_LOG_LEVEL").unwrap_or_else(|_| "INFO".to_string());

        let db_path = std::env::var("ACP2_DB_PATH")
            .unwrap_or_else(|_| DEFAULT_DB_PATH.to_string())
            .into();

        let agents_config_path = std::env::var("ACP2_AGENTS_CONFIG")
            .unwrap_or_else(|_| DEFAULT_AGENTS_CONFIG.to_string())
            .into();

        let bind_addr = match std::env::var("ACP2_BIND_ADDR") {
            Ok(value) => value
                .parse()
                .map_err(|err| BridgeError::ConfigError(format!("invalid ACP2_BIND_ADDR: {err}")))?,
            Err(_) => DEFAULT_BIND_ADDR
                .parse()
                .expect("default bind addr is always valid"),
        };

        let bind_port = match std::env::var("ACP2_BIND_PORT") {
            Ok(value) => value
                .parse()
                .map_err(|err| BridgeError::ConfigError(format!("invalid ACP2_BIND_PORT: {err}")))?,
            Err(_) => DEFAULT_BIND_PORT,
        };

        let idle_timeout = Duration::from_secs(parse_env_or("ACP2_IDLE_TIMEOUT_SECS", DEFAULT_IDLE_TIMEOUT_SECS)?);
        let grace_period = Duration::from_millis(parse_env_or("ACP2_GRACE_PERIOD_MS", DEFAULT_GRACE_PERIOD_MS)?);

        let persist_updates = matches!(
            std::env::var("ACP2_PERSIST_UPDATES").as_deref(),
            Ok("1") | Ok("true")
        );

        Ok(Self {
            auth_token,
            log_level,
            db_path,
            agents_config_path,
            bind_addr,
            bind_port,
            idle_timeout,
            grace_period,
            persist_updates,
        })
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}

fn parse_env_or<T>(key: &str, default: T) -> Result<T, BridgeError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(value) => value
            .parse()
            .map_err(|err| BridgeError::ConfigError(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}
