use rn_domain::config::{MaxWait, NodeConfig};

#[test]
fn default_master_is_localhost() {
    let config = NodeConfig::default();
    assert_eq!(config.master_uri, "http://localhost:11311/");
    assert_eq!(config.hostname, "localhost");
}

#[test]
fn default_connect_waits_forever() {
    let config = NodeConfig::default();
    assert_eq!(config.registry.max_wait(), MaxWait::Forever);
}

#[test]
fn full_toml_parses() {
    let toml_str = r#"
master_uri = "http://master:11311/"
hostname = "10.0.0.2"
namespace = "/robot"
anonymous = true

[remappings]
chatter = "/speech"

[registry]
attempt_timeout_ms = 100
max_wait_ms = 0
poll_interval_ms = 250

[transport]
max_frame_bytes = 1024
"#;
    let config: NodeConfig = toml::from_str(toml_str).unwrap();
    assert_eq!(config.master_uri, "http://master:11311/");
    assert!(config.anonymous);
    assert_eq!(config.remappings.get("chatter").unwrap(), "/speech");
    assert_eq!(config.registry.max_wait(), MaxWait::Once);
    assert_eq!(config.registry.poll_interval_ms, 250);
    assert_eq!(config.registry.warn_interval_secs, 60);
    assert_eq!(config.transport.max_frame_bytes, 1024);
    assert_eq!(config.transport.default_queue_size, 16);
    assert!(config.validate().is_empty());
}

#[test]
fn empty_toml_equals_defaults() {
    let config: NodeConfig = toml::from_str("").unwrap();
    let defaults = NodeConfig::default();
    assert_eq!(config.master_uri, defaults.master_uri);
    assert_eq!(config.transport.max_frame_bytes, defaults.transport.max_frame_bytes);
    assert_eq!(config.registry.max_wait_ms, defaults.registry.max_wait_ms);
}

#[test]
fn invalid_remapping_is_reported() {
    let toml_str = r#"
[remappings]
"bad name" = "/ok"
"#;
    let config: NodeConfig = toml::from_str(toml_str).unwrap();
    let issues = config.validate();
    assert_eq!(issues.len(), 1);
    assert!(issues[0].field.starts_with("remappings"));
}
