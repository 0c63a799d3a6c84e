//! Integration tests for configuration and broker properties loading

use badge_reader::domain::ErrorKind;
use badge_reader::infra::{Config, Properties};
use badge_reader::io::MqttConnector;
use std::io::Write;
use tempfile::NamedTempFile;

fn temp_file_with(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    temp_file.write_all(content.as_bytes()).unwrap();
    temp_file.flush().unwrap();
    temp_file
}

#[test]
fn test_load_config_from_file() {
    let config_content = r#"
[reader]
empty_poll_interval_ms = 250

[identity]
strip_status_word = true

[broker]
topic = "door-badges"
properties_file = "/etc/badge-reader/properties"
flush_timeout_ms = 5000
drain_grace_ms = 200

[metrics]
interval_secs = 15
"#;
    let temp_file = temp_file_with(config_content);

    let config = Config::from_file(temp_file.path()).unwrap();

    assert_eq!(config.empty_poll_interval_ms(), 250);
    assert!(config.strip_status_word());
    assert_eq!(config.topic(), "door-badges");
    assert_eq!(config.properties_file(), "/etc/badge-reader/properties");
    assert_eq!(config.flush_timeout_ms(), 5000);
    assert_eq!(config.drain_grace_ms(), 200);
    assert_eq!(config.metrics_interval_secs(), 15);
    assert_eq!(config.config_file(), temp_file.path().display().to_string());
}

#[test]
fn test_load_from_path_fallback() {
    let config = Config::load_from_path("/nonexistent/config.toml").unwrap();
    assert_eq!(config.topic(), "badge-reader");
    assert_eq!(config.properties_file(), "./properties");
    assert_eq!(config.flush_timeout_ms(), 15_000);
    assert!(!config.strip_status_word());
}

#[test]
fn test_malformed_config_is_configuration_error() {
    let temp_file = temp_file_with("[broker\ntopic = ");

    let err = Config::load_from_path(temp_file.path()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn test_empty_topic_rejected() {
    let temp_file = temp_file_with("[broker]\ntopic = \"  \"\n");
    assert!(Config::from_file(temp_file.path()).is_err());
}

#[test]
fn test_properties_file_to_connector() {
    let temp_file = temp_file_with(
        "# broker\nbootstrap.servers=broker.internal:8883\nclient.id = lobby-door\n\nacks=all\n",
    );

    let properties = Properties::from_file(temp_file.path()).unwrap();
    assert_eq!(properties.len(), 3);

    let connector = MqttConnector::from_properties(&properties).unwrap();
    assert_eq!(connector.host(), "broker.internal");
    assert_eq!(connector.port(), 8883);
    assert_eq!(connector.client_id(), "lobby-door");
}

#[test]
fn test_missing_properties_file_is_fatal() {
    let err = Properties::from_file("/nonexistent/properties").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn test_properties_without_servers_is_fatal() {
    let temp_file = temp_file_with("client.id=x\n");
    let properties = Properties::from_file(temp_file.path()).unwrap();

    let err = MqttConnector::from_properties(&properties).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}
