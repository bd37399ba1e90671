use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::env;

/// Controller-side configuration, loaded from (ascending precedence)
/// built-in defaults, an optional `.env` file, and process environment
/// variables. Validated eagerly: an invalid bind address or a zero interval
/// aborts startup rather than failing at first use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub api: ApiConfig,
    pub store: StoreConfig,
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the embedded database file. `:memory:` is accepted and is
    /// what the test suite uses.
    pub database_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub tick_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub agent_grace_period_secs: u64,
    pub cancel_grace_secs: u64,
}

impl ControllerConfig {
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("loaded .env file from {:?}", path),
            Err(e) => tracing::debug!("no .env file loaded: {}", e),
        }

        let host = env::var("DISPATCHD_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        host.parse::<std::net::IpAddr>()
            .map_err(|_| CoreError::InvalidInput(format!("DISPATCHD_HOST '{host}' is not a valid bind address")))?;

        let port: u16 = env::var("DISPATCHD_PORT")
            .unwrap_or_else(|_| "7700".to_string())
            .parse()
            .map_err(|_| CoreError::InvalidInput("DISPATCHD_PORT must be a valid port number".into()))?;

        let allowed_origins = env::var("DISPATCHD_ALLOWED_ORIGINS")
            .unwrap_or_else(|_| "http://localhost:3000".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let database_path =
            env::var("DISPATCHD_DATABASE_PATH").unwrap_or_else(|_| "dispatchd.db".to_string());

        let tick_interval_secs = parse_positive_secs(
            "DISPATCHD_TICK_INTERVAL_SECS",
            crate::constants::SCHEDULER_TICK_INTERVAL_SECS,
        )?;
        let heartbeat_interval_secs = parse_positive_secs(
            "DISPATCHD_HEARTBEAT_INTERVAL_SECS",
            crate::constants::DEFAULT_HEARTBEAT_INTERVAL_SECS,
        )?;
        let agent_grace_period_secs = parse_positive_secs(
            "DISPATCHD_AGENT_GRACE_PERIOD_SECS",
            crate::constants::AGENT_GRACE_PERIOD_SECS,
        )?;
        let cancel_grace_secs = parse_positive_secs(
            "DISPATCHD_CANCEL_GRACE_SECS",
            crate::constants::CANCEL_GRACE_SECS,
        )?;

        Ok(ControllerConfig {
            api: ApiConfig {
                host,
                port,
                allowed_origins,
            },
            store: StoreConfig { database_path },
            scheduler: SchedulerConfig {
                tick_interval_secs,
                heartbeat_interval_secs,
                agent_grace_period_secs,
                cancel_grace_secs,
            },
        })
    }

    /// Presence timeout derived from the configured heartbeat interval, per
    /// spec §4.2: 3x the heartbeat period, floored at 90s.
    pub fn presence_timeout_secs(&self) -> u64 {
        (self.scheduler.heartbeat_interval_secs * crate::constants::PRESENCE_TIMEOUT_MULTIPLIER)
            .max(crate::constants::PRESENCE_TIMEOUT_FLOOR_SECS)
    }
}

fn parse_positive_secs(var: &str, default: u64) -> Result<u64> {
    match env::var(var) {
        Ok(raw) => {
            let value: u64 = raw
                .parse()
                .map_err(|_| CoreError::InvalidInput(format!("{var} must be a positive integer")))?;
            if value == 0 {
                return Err(CoreError::InvalidInput(format!("{var} must be greater than zero")));
            }
            Ok(value)
        }
        Err(_) => Ok(default),
    }
}

/// Agent-side configuration. CLI flags (the highest-precedence override, see
/// spec §6.4) are merged on top of this by `dispatchd-agent`'s `main`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub server_url: String,
    pub machine_name: String,
    pub install_dir: String,
    pub heartbeat_interval_secs: u64,
    pub config_update_interval_secs: u64,
    pub log_level: String,
}

impl AgentConfig {
    pub fn load() -> Result<Self> {
        match dotenvy::dotenv() {
            Ok(path) => tracing::info!("loaded .env file from {:?}", path),
            Err(e) => tracing::debug!("no .env file loaded: {}", e),
        }

        Ok(AgentConfig {
            server_url: env::var("DISPATCHD_SERVER_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:7700".to_string()),
            machine_name: env::var("DISPATCHD_MACHINE_NAME").unwrap_or_else(|_| default_machine_name()),
            install_dir: env::var("DISPATCHD_INSTALL_DIR").unwrap_or_else(|_| ".".to_string()),
            heartbeat_interval_secs: parse_positive_secs(
                "DISPATCHD_HEARTBEAT_INTERVAL_SECS",
                crate::constants::DEFAULT_HEARTBEAT_INTERVAL_SECS,
            )?,
            config_update_interval_secs: parse_positive_secs(
                "DISPATCHD_CONFIG_UPDATE_INTERVAL_SECS",
                crate::constants::DEFAULT_CONFIG_UPDATE_INTERVAL_SECS,
            )?,
            log_level: env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.server_url.trim().is_empty() {
            return Err(CoreError::InvalidInput("server_url cannot be empty".into()));
        }
        if !(self.server_url.starts_with("http://") || self.server_url.starts_with("https://")) {
            return Err(CoreError::InvalidInput(
                "server_url must start with http:// or https://".into(),
            ));
        }
        if self.machine_name.trim().is_empty() {
            return Err(CoreError::InvalidInput("machine_name cannot be empty".into()));
        }
        Ok(())
    }
}

fn default_machine_name() -> String {
    hostname_fallback()
}

fn hostname_fallback() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "unnamed-agent".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn controller_config_loads_with_defaults() {
        for var in [
            "DISPATCHD_HOST",
            "DISPATCHD_PORT",
            "DISPATCHD_ALLOWED_ORIGINS",
            "DISPATCHD_DATABASE_PATH",
        ] {
            std::env::remove_var(var);
        }
        let cfg = ControllerConfig::load().expect("defaults should be valid");
        assert_eq!(cfg.api.host, "127.0.0.1");
        assert_eq!(cfg.api.port, 7700);
        assert_eq!(cfg.presence_timeout_secs(), 90);
    }

    #[test]
    #[serial]
    fn rejects_zero_tick_interval() {
        std::env::set_var("DISPATCHD_TICK_INTERVAL_SECS", "0");
        let result = ControllerConfig::load();
        std::env::remove_var("DISPATCHD_TICK_INTERVAL_SECS");
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn rejects_an_invalid_bind_address() {
        std::env::set_var("DISPATCHD_HOST", "not an address");
        let result = ControllerConfig::load();
        std::env::remove_var("DISPATCHD_HOST");
        assert!(result.is_err());
    }

    #[test]
    fn agent_config_validate_rejects_bad_url() {
        let mut cfg = AgentConfig {
            server_url: "not-a-url".into(),
            machine_name: "m1".into(),
            install_dir: ".".into(),
            heartbeat_interval_secs: 30,
            config_update_interval_secs: 600,
            log_level: "info".into(),
        };
        assert!(cfg.validate().is_err());
        cfg.server_url = "http://localhost:7700".into();
        assert!(cfg.validate().is_ok());
    }
}
