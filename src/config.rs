//! Configuration file for the mqtt-agent binary
//!
//! TOML with one section per concern. Secrets never live in the file: the
//! username and password are read from environment variables whose names
//! the file supplies, and TLS material is referenced by path.

use crate::agent::{AgentSettings, RetrySettings};
use crate::protocol::{validate_topic_filter, QoS};
use crate::transport::{Credentials, ServerInfo};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// ALPN protocol AWS IoT expects for MQTT over port 443
pub const AWS_IOT_ALPN: &str = "x-amzn-mqtt-ca";

/// Longest client identifier every MQTT 3.1.1 broker must accept
const PORTABLE_CLIENT_ID_LEN: usize = 23;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub client: ClientSection,
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub retry: RetrySection,
    /// Filters the CLI subscribes to on start
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subscriptions: Vec<SubscriptionConfig>,
}

/// Broker endpoint and TLS material
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Host name, or an `mqtt://host:port` URL
    pub endpoint: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub alpn: Option<String>,
    #[serde(default)]
    pub disable_sni: bool,
    pub root_ca_path: Option<String>,
    pub client_cert_path: Option<String>,
    pub private_key_path: Option<String>,
}

fn default_port() -> u16 {
    8883
}

/// MQTT client identity and session timing
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientSection {
    #[serde(default = "default_identifier")]
    pub identifier: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u16,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_connack_timeout_ms")]
    pub connack_timeout_ms: u64,
    #[serde(default = "default_transport_timeout_ms")]
    pub transport_timeout_ms: u64,
}

fn default_identifier() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    // Keep within the portable client id length
    format!("mqtt-agent-{}", &id[..12])
}

fn default_keep_alive_secs() -> u16 {
    60
}

fn default_connack_timeout_ms() -> u64 {
    1000
}

fn default_transport_timeout_ms() -> u64 {
    750
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            identifier: default_identifier(),
            keep_alive_secs: default_keep_alive_secs(),
            username_env: None,
            password_env: None,
            connack_timeout_ms: default_connack_timeout_ms(),
            transport_timeout_ms: default_transport_timeout_ms(),
        }
    }
}

/// Fixed resource sizes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentSection {
    #[serde(default = "default_ten")]
    pub command_queue_depth: usize,
    #[serde(default = "default_ten")]
    pub command_pool_size: usize,
    #[serde(default = "default_ten")]
    pub subscription_capacity: usize,
    #[serde(default = "default_network_buffer_size")]
    pub network_buffer_size: usize,
}

fn default_ten() -> usize {
    10
}

fn default_network_buffer_size() -> usize {
    5000
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            command_queue_depth: default_ten(),
            command_pool_size: default_ten(),
            subscription_capacity: default_ten(),
            network_buffer_size: default_network_buffer_size(),
        }
    }
}

/// Reconnect backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetrySection {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_backoff_ms() -> u64 {
    500
}

fn default_max_backoff_ms() -> u64 {
    5000
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

/// One `[[subscriptions]]` entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubscriptionConfig {
    pub filter: String,
    #[serde(default)]
    pub qos: u8,
}

impl SubscriptionConfig {
    pub fn qos(&self) -> Result<QoS, ConfigError> {
        match QoS::from_u8(self.qos) {
            Ok(QoS::ExactlyOnce) | Err(_) => Err(ConfigError::InvalidConfig(format!(
                "subscription '{}' has unsupported QoS {}",
                self.filter, self.qos
            ))),
            Ok(qos) => Ok(qos),
        }
    }
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AgentConfig {
    /// Load and validate a TOML configuration file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let (host, _) = self.broker_address()?;
        if host.is_empty() {
            return Err(invalid("broker endpoint must not be empty"));
        }
        if self.broker.port == 0 {
            return Err(invalid("broker port must not be zero"));
        }

        let id = &self.client.identifier;
        if id.is_empty() {
            return Err(invalid("client identifier must not be empty"));
        }
        let portable = id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if id.len() > PORTABLE_CLIENT_ID_LEN || !portable {
            warn!(
                client_id = %id,
                "Client identifier is not portable; some brokers only accept 1-23 alphanumeric characters"
            );
        }

        let sizes = [
            ("command_queue_depth", self.agent.command_queue_depth),
            ("command_pool_size", self.agent.command_pool_size),
            ("subscription_capacity", self.agent.subscription_capacity),
            ("network_buffer_size", self.agent.network_buffer_size),
        ];
        for (name, value) in sizes {
            if value == 0 {
                return Err(invalid(format!("agent.{name} must be greater than zero")));
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(invalid("retry.max_attempts must be greater than zero"));
        }
        if self.retry.base_backoff_ms > self.retry.max_backoff_ms {
            return Err(invalid(format!(
                "retry.base_backoff_ms ({}) exceeds retry.max_backoff_ms ({})",
                self.retry.base_backoff_ms, self.retry.max_backoff_ms
            )));
        }

        for subscription in &self.subscriptions {
            validate_topic_filter(&subscription.filter).map_err(|e| {
                invalid(format!("subscription '{}': {e}", subscription.filter))
            })?;
            subscription.qos()?;
        }
        Ok(())
    }

    /// Host and port, accepting either a bare host or an `mqtt://` URL.
    pub fn broker_address(&self) -> Result<(String, u16), ConfigError> {
        let endpoint = self.broker.endpoint.trim();
        if !endpoint.contains("://") {
            return Ok((endpoint.to_string(), self.broker.port));
        }

        let url = url::Url::parse(endpoint)
            .map_err(|e| invalid(format!("broker endpoint '{endpoint}': {e}")))?;
        match url.scheme() {
            "mqtt" | "mqtts" | "tcp" | "ssl" => {}
            other => return Err(invalid(format!("unsupported broker scheme '{other}'"))),
        }
        let host = url
            .host_str()
            .ok_or_else(|| invalid(format!("broker endpoint '{endpoint}' has no host")))?;
        Ok((host.to_string(), url.port().unwrap_or(self.broker.port)))
    }

    fn get_env_var_required(env_var_name: Option<&String>) -> Result<Option<String>, ConfigError> {
        env_var_name
            .map(|name| {
                std::env::var(name).map_err(|_| ConfigError::EnvVarNotFound(name.clone()))
            })
            .transpose()
    }

    /// Resolve paths and environment variables into runtime settings.
    ///
    /// A named credential variable that is unset is an error.
    pub fn agent_settings(&self) -> Result<AgentSettings, ConfigError> {
        let (host, port) = self.broker_address()?;

        let username = Self::get_env_var_required(self.client.username_env.as_ref())?;
        let password = Self::get_env_var_required(self.client.password_env.as_ref())?;
        if password.is_some() && username.is_none() {
            return Err(invalid("a password requires a username as well"));
        }

        let alpn = match &self.broker.alpn {
            Some(alpn) => Some(alpn.clone()),
            None if port == 443 => Some(AWS_IOT_ALPN.to_string()),
            None => None,
        };
        let credentials = Credentials {
            root_ca_pem: read_pem(self.broker.root_ca_path.as_deref())?,
            client_cert_pem: read_pem(self.broker.client_cert_path.as_deref())?,
            private_key_pem: read_pem(self.broker.private_key_path.as_deref())?,
            alpn,
            disable_sni: self.broker.disable_sni,
        };

        Ok(AgentSettings {
            client_id: self.client.identifier.clone(),
            keep_alive: Duration::from_secs(u64::from(self.client.keep_alive_secs)),
            username,
            password,
            server: ServerInfo::new(host, port),
            credentials,
            connack_timeout: Duration::from_millis(self.client.connack_timeout_ms),
            transport_timeout: Duration::from_millis(self.client.transport_timeout_ms),
            command_queue_depth: self.agent.command_queue_depth,
            command_pool_size: self.agent.command_pool_size,
            subscription_capacity: self.agent.subscription_capacity,
            network_buffer_size: self.agent.network_buffer_size,
            retry: RetrySettings {
                max_attempts: self.retry.max_attempts,
                base_backoff: Duration::from_millis(self.retry.base_backoff_ms),
                max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
            },
            ..AgentSettings::default()
        })
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| invalid(e.to_string()))
    }

    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[broker]
endpoint = "localhost"
port = 1883

[client]
identifier = "test-agent"
"#;
        Self::from_toml(toml_content).expect("Test config should parse")
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidConfig(message.into())
}

fn read_pem(path: Option<&str>) -> Result<Option<String>, ConfigError> {
    path.map(std::fs::read_to_string).transpose().map_err(ConfigError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[broker]
endpoint = "a1b2c3-ats.iot.eu-west-1.amazonaws.com"
port = 8883
disable_sni = false

[client]
identifier = "thermostat-12"
keep_alive_secs = 30
username_env = "MQTT_USERNAME"
password_env = "MQTT_PASSWORD"
connack_timeout_ms = 2000

[agent]
command_queue_depth = 20
command_pool_size = 16
subscription_capacity = 8
network_buffer_size = 4096

[retry]
max_attempts = 3
base_backoff_ms = 250
max_backoff_ms = 4000

[[subscriptions]]
filter = "devices/thermostat-12/#"
qos = 1

[[subscriptions]]
filter = "broadcast/+"
"#;

        let config = AgentConfig::from_toml(toml_content).unwrap();
        assert_eq!(config.client.identifier, "thermostat-12");
        assert_eq!(config.client.keep_alive_secs, 30);
        assert_eq!(config.client.transport_timeout_ms, 750);
        assert_eq!(config.agent.command_pool_size, 16);
        assert_eq!(config.retry.base_backoff_ms, 250);
        assert_eq!(config.subscriptions.len(), 2);
        assert_eq!(config.subscriptions[0].qos().unwrap(), QoS::AtLeastOnce);
        assert_eq!(config.subscriptions[1].qos().unwrap(), QoS::AtMostOnce);
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = AgentConfig::from_toml("[broker]\nendpoint = \"broker.local\"\n").unwrap();

        assert_eq!(config.broker.port, 8883);
        assert!(config.client.identifier.starts_with("mqtt-agent-"));
        assert!(config.client.identifier.len() <= 23);
        assert_eq!(config.client.keep_alive_secs, 60);
        assert_eq!(config.agent, AgentSection::default());
        assert_eq!(config.retry, RetrySection::default());
        assert!(config.subscriptions.is_empty());
    }

    #[test]
    fn test_validation_errors() {
        let cases = [
            ("[broker]\nendpoint = \"\"\n", "endpoint"),
            ("[broker]\nendpoint = \"h\"\n[agent]\ncommand_pool_size = 0\n", "command_pool_size"),
            (
                "[broker]\nendpoint = \"h\"\n[retry]\nbase_backoff_ms = 9000\nmax_backoff_ms = 10\n",
                "base_backoff_ms",
            ),
            ("[broker]\nendpoint = \"h\"\n[[subscriptions]]\nfilter = \"a/#/b\"\n", "a/#/b"),
            ("[broker]\nendpoint = \"h\"\n[[subscriptions]]\nfilter = \"a\"\nqos = 2\n", "QoS"),
        ];
        for (content, needle) in cases {
            let error = AgentConfig::from_toml(content).unwrap_err();
            assert!(
                error.to_string().contains(needle),
                "expected '{needle}' in '{error}'"
            );
        }
    }

    #[test]
    fn test_broker_url_endpoint() {
        let mut config = AgentConfig::test_config();
        config.broker.endpoint = "mqtt://broker.example.com:1884".to_string();
        assert_eq!(
            config.broker_address().unwrap(),
            ("broker.example.com".to_string(), 1884)
        );

        config.broker.endpoint = "http://broker.example.com".to_string();
        assert!(config.broker_address().is_err());
    }

    #[test]
    fn test_port_443_implies_alpn() {
        let mut config = AgentConfig::test_config();
        config.broker.port = 443;
        let settings = config.agent_settings().unwrap();
        assert_eq!(settings.credentials.alpn.as_deref(), Some(AWS_IOT_ALPN));

        config.broker.port = 1883;
        let settings = config.agent_settings().unwrap();
        assert_eq!(settings.credentials.alpn, None);
        assert!(!settings.credentials.requires_tls());
    }

    #[test]
    fn test_agent_settings_conversion() {
        let config = AgentConfig::test_config();
        let settings = config.agent_settings().unwrap();

        assert_eq!(settings.client_id, "test-agent");
        assert_eq!(settings.server, ServerInfo::new("localhost", 1883));
        assert_eq!(settings.keep_alive, Duration::from_secs(60));
        assert_eq!(settings.connack_timeout, Duration::from_millis(1000));
        assert_eq!(settings.retry, RetrySettings::default());
    }

    #[test]
    fn test_credentials_from_environment() {
        let mut config = AgentConfig::test_config();
        config.client.username_env = Some("MQTT_AGENT_TEST_USERNAME".to_string());
        config.client.password_env = Some("MQTT_AGENT_TEST_PASSWORD".to_string());
        std::env::set_var("MQTT_AGENT_TEST_USERNAME", "device");
        std::env::set_var("MQTT_AGENT_TEST_PASSWORD", "secret");

        let settings = config.agent_settings().unwrap();
        assert_eq!(settings.username.as_deref(), Some("device"));
        assert_eq!(settings.password.as_deref(), Some("secret"));

        config.client.username_env = Some("MQTT_AGENT_TEST_UNSET".to_string());
        assert!(matches!(
            config.agent_settings(),
            Err(ConfigError::EnvVarNotFound(name)) if name == "MQTT_AGENT_TEST_UNSET"
        ));

        config.client.username_env = None;
        assert!(matches!(
            config.agent_settings(),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_load_from_file_reads_pem_paths() {
        // Arrange
        let mut pem = NamedTempFile::new().unwrap();
        writeln!(pem, "-----BEGIN CERTIFICATE-----").unwrap();
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            "[broker]\nendpoint = \"broker.local\"\nroot_ca_path = \"{}\"\n",
            pem.path().display()
        )
        .unwrap();

        // Act
        let config = AgentConfig::load_from_file(file.path()).unwrap();
        let settings = config.agent_settings().unwrap();

        // Assert
        assert!(settings
            .credentials
            .root_ca_pem
            .as_deref()
            .unwrap()
            .contains("BEGIN CERTIFICATE"));
        assert!(settings.credentials.requires_tls());
    }

    #[test]
    fn test_missing_file_and_pem() {
        let missing = AgentConfig::load_from_file(Path::new("/nonexistent/agent.toml"));
        assert!(matches!(missing, Err(ConfigError::FileRead(_))));

        let mut config = AgentConfig::test_config();
        config.broker.private_key_path = Some("/nonexistent/key.pem".to_string());
        assert!(matches!(config.agent_settings(), Err(ConfigError::FileRead(_))));
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = AgentConfig::test_config();
        let rendered = config.to_toml().unwrap();
        let parsed = AgentConfig::from_toml(&rendered).unwrap();
        assert_eq!(parsed, config);
    }
}
