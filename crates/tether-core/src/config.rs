//! tether.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::duration::parse_duration;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_DATA_DIR: &str = "/var/lib/tether";
const DEFAULT_ENVIRONMENT: &str = "production";
const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_REMOTE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TetherConfig {
    pub server: Option<ServerConfig>,
    pub broker: Option<BrokerConfig>,
    pub provision: Option<ProvisionConfig>,
    pub remote: Option<RemoteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub port: Option<u16>,
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Which key of a service's `endpoint` map this deployment talks to.
    pub environment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionConfig {
    pub poll_interval: Option<String>,
    pub poll_timeout: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub timeout: Option<String>,
}

/// Fully resolved broker knobs, with defaults applied.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerSettings {
    pub environment: String,
    pub poll_interval: Duration,
    pub poll_timeout: Duration,
    pub remote_timeout: Duration,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            environment: DEFAULT_ENVIRONMENT.to_string(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            remote_timeout: DEFAULT_REMOTE_TIMEOUT,
        }
    }
}

impl TetherConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: TetherConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn port(&self) -> u16 {
        self.server
            .as_ref()
            .and_then(|s| s.port)
            .unwrap_or(DEFAULT_PORT)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.server
            .as_ref()
            .and_then(|s| s.data_dir.clone())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }

    /// Resolve broker settings, rejecting unparseable duration strings.
    pub fn broker_settings(&self) -> anyhow::Result<BrokerSettings> {
        let defaults = BrokerSettings::default();
        let provision = self.provision.as_ref();

        let environment = self
            .broker
            .as_ref()
            .and_then(|b| b.environment.clone())
            .unwrap_or(defaults.environment);
        let poll_interval = duration_or(
            provision.and_then(|p| p.poll_interval.as_deref()),
            "provision.poll_interval",
            defaults.poll_interval,
        )?;
        let poll_timeout = duration_or(
            provision.and_then(|p| p.poll_timeout.as_deref()),
            "provision.poll_timeout",
            defaults.poll_timeout,
        )?;
        let remote_timeout = duration_or(
            self.remote.as_ref().and_then(|r| r.timeout.as_deref()),
            "remote.timeout",
            defaults.remote_timeout,
        )?;

        Ok(BrokerSettings {
            environment,
            poll_interval,
            poll_timeout,
            remote_timeout,
        })
    }

    /// Scaffold a config with every default spelled out.
    pub fn scaffold() -> Self {
        TetherConfig {
            server: Some(ServerConfig {
                port: Some(DEFAULT_PORT),
                data_dir: Some(PathBuf::from(DEFAULT_DATA_DIR)),
            }),
            broker: Some(BrokerConfig {
                environment: Some(DEFAULT_ENVIRONMENT.to_string()),
            }),
            provision: Some(ProvisionConfig {
                poll_interval: Some("500ms".to_string()),
                poll_timeout: Some("10m".to_string()),
            }),
            remote: Some(RemoteConfig {
                timeout: Some("10s".to_string()),
            }),
        }
    }
}

fn duration_or(value: Option<&str>, field: &str, default: Duration) -> anyhow::Result<Duration> {
    match value {
        Some(raw) => parse_duration(raw)
            .ok_or_else(|| anyhow::anyhow!("invalid duration for {field}: {raw:?}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: TetherConfig = toml::from_str("").unwrap();
        assert_eq!(config.port(), 8080);
        assert_eq!(config.data_dir(), PathBuf::from("/var/lib/tether"));
        assert_eq!(config.broker_settings().unwrap(), BrokerSettings::default());
    }

    #[test]
    fn test_parse_full() {
        let toml_str = r#"
[server]
port = 9000
data_dir = "/tmp/tether"

[broker]
environment = "test"

[provision]
poll_interval = "250ms"
poll_timeout = "2m"

[remote]
timeout = "3s"
"#;
        let config: TetherConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.port(), 9000);
        let settings = config.broker_settings().unwrap();
        assert_eq!(settings.environment, "test");
        assert_eq!(settings.poll_interval, Duration::from_millis(250));
        assert_eq!(settings.poll_timeout, Duration::from_secs(120));
        assert_eq!(settings.remote_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_invalid_duration_is_an_error() {
        let toml_str = r#"
[provision]
poll_interval = "often"
"#;
        let config: TetherConfig = toml::from_str(toml_str).unwrap();
        let err = config.broker_settings().unwrap_err();
        assert!(err.to_string().contains("provision.poll_interval"));
    }

    #[test]
    fn test_scaffold_round_trips() {
        let toml_str = TetherConfig::scaffold().to_toml_string().unwrap();
        let config: TetherConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.broker_settings().unwrap(), BrokerSettings::default());
    }
}
