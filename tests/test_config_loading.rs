//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.

use mqtt_agent::config::{AgentConfig, ConfigError};
use mqtt_agent::protocol::QoS;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[broker]
endpoint = "broker.local"
port = 1883

[client]
identifier = "gateway-1"
keep_alive_secs = 45

[[subscriptions]]
filter = "gateway-1/commands/#"
qos = 1
"#
    )
    .unwrap();

    let config = AgentConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.broker.endpoint, "broker.local");
    assert_eq!(config.client.identifier, "gateway-1");
    assert_eq!(config.subscriptions.len(), 1);
    assert_eq!(config.subscriptions[0].qos().unwrap(), QoS::AtLeastOnce);

    let settings = config.agent_settings().unwrap();
    assert_eq!(settings.server.to_string(), "broker.local:1883");
    assert_eq!(settings.keep_alive, Duration::from_secs(45));
    assert_eq!(settings.command_queue_depth, 10);
}

#[test]
fn test_config_fails_on_missing_broker_section() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "[client]\nidentifier = \"orphan\"\n").unwrap();

    let result = AgentConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_fails_on_malformed_toml() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "[broker\nendpoint = ").unwrap();

    let result = AgentConfig::load_from_file(temp_file.path());

    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[test]
fn test_config_rejects_zero_sized_resources() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        "[broker]\nendpoint = \"broker.local\"\n\n[agent]\nnetwork_buffer_size = 0\n"
    )
    .unwrap();

    let result = AgentConfig::load_from_file(temp_file.path());

    match result {
        Err(ConfigError::InvalidConfig(message)) => {
            assert!(message.contains("network_buffer_size"))
        }
        other => panic!("expected InvalidConfig, got {other:?}"),
    }
}

#[test]
fn test_config_show_output_parses_back() {
    let config = AgentConfig::from_toml(
        "[broker]\nendpoint = \"broker.local\"\n\n[client]\nidentifier = \"shown\"\n",
    )
    .unwrap();

    let rendered = config.to_toml().unwrap();

    assert!(rendered.contains("[broker]"));
    assert_eq!(AgentConfig::from_toml(&rendered).unwrap(), config);
}
