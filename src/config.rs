//! Engine configuration
//!
//! Sessions are constructed from a [`DeviceConfig`] and may receive an
//! updated one at runtime, which re-evaluates transport selection and polling
//! without tearing the session down. The optional [`BrokerConfig`] describes
//! the one MQTT connection devices share.
//!
//! The demo binary loads everything from a single toml file under the user
//! config directory.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::protocol::message::{md5_hex, new_message_id};
use crate::protocol::HostAddress;
use crate::transport::mqtt::MqttIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportPreference {
    /// HTTP when a host is configured, MQTT otherwise.
    #[default]
    Auto,
    Http,
    Mqtt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device uuid as reported in `Appliance.System.All`.
    pub device_id: String,
    /// Signing key; absent means relying on the reply-key hack.
    #[serde(default)]
    pub key: Option<String>,
    /// Local address (`host` or `host:port`) for the HTTP transport.
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub transport: TransportPreference,
    #[serde(default = "default_polling_period")]
    pub polling_period_secs: u64,
}

fn default_polling_period() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    pub user_id: String,
    /// Session app id; a random one is minted when the file omits it.
    #[serde(default = "random_app_id")]
    pub app_id: String,
    pub key: String,
    /// Cloud brokers get the conservative polling treatment.
    #[serde(default)]
    pub cloud: bool,
}

fn default_broker_port() -> u16 {
    HostAddress::DEFAULT_MQTT_PORT
}

fn random_app_id() -> String {
    md5_hex(&[&new_message_id()])
}

impl BrokerConfig {
    pub fn address(&self) -> HostAddress {
        HostAddress::new(self.host.clone(), self.port)
    }

    pub fn identity(&self) -> MqttIdentity {
        MqttIdentity {
            user_id: self.user_id.clone(),
            app_id: self.app_id.clone(),
            key: self.key.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
    #[serde(default)]
    pub broker: Option<BrokerConfig>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("no user config directory available")]
    NoConfigDir,
}

impl EngineConfig {
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let base = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(base.join("merosslink").join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)?;
        info!(path = %path.display(), devices = config.devices.len(), "configuration loaded");
        Ok(config)
    }

    /// Loads the default file, falling back to an empty configuration when it
    /// does not exist yet.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load(&path)
        } else {
            info!(path = %path.display(), "no configuration file, starting empty");
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_file() {
        let config: EngineConfig = toml::from_str(
            r#"
            [[devices]]
            device_id = "9109182170548290882048e1e9522946"
            key = "secret"
            host = "10.0.0.17"
            transport = "http"
            polling_period_secs = 20

            [[devices]]
            device_id = "aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"

            [broker]
            host = "iot.meross.com"
            port = 443
            user_id = "12345"
            key = "secret"
            cloud = true
            "#,
        )
        .unwrap();
        assert_eq!(config.devices.len(), 2);
        assert_eq!(config.devices[0].transport, TransportPreference::Http);
        assert_eq!(config.devices[0].polling_period_secs, 20);
        // defaults
        assert_eq!(config.devices[1].transport, TransportPreference::Auto);
        assert_eq!(config.devices[1].polling_period_secs, 30);
        assert!(config.devices[1].key.is_none());

        let broker = config.broker.unwrap();
        assert!(broker.cloud);
        assert_eq!(broker.address(), HostAddress::new("iot.meross.com", 443));
        assert_eq!(broker.app_id.len(), 32);
        assert_eq!(
            broker.identity().client_id(),
            format!("app:{}", broker.app_id)
        );
    }

    #[test]
    fn empty_file_is_valid() {
        let config: EngineConfig = toml::from_str("").unwrap();
        assert!(config.devices.is_empty());
        assert!(config.broker.is_none());
    }
}
