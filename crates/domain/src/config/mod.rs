mod registry;
mod transport;

pub use registry::*;
pub use transport::*;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Top-level config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Registry (master) XML-RPC endpoint.
    #[serde(default = "d_master_uri")]
    pub master_uri: String,
    /// Host name advertised to peers in slave and transport addresses.
    #[serde(default = "d_hostname")]
    pub hostname: String,
    /// Namespace relative names resolve against.
    #[serde(default = "d_namespace")]
    pub namespace: String,
    /// Append a random suffix to the node name so several copies can run.
    #[serde(default)]
    pub anonymous: bool,
    /// Let the message loader build schemas at runtime.  The transport never
    /// inspects payload schemas; this flag is carried for the loader.
    #[serde(default)]
    pub on_the_fly_messages: bool,
    /// Name remappings applied after resolution (`from` → `to`).
    #[serde(default)]
    pub remappings: HashMap<String, String>,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub transport: TransportConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            master_uri: d_master_uri(),
            hostname: d_hostname(),
            namespace: d_namespace(),
            anonymous: false,
            on_the_fly_messages: false,
            remappings: HashMap::new(),
            registry: RegistryConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl NodeConfig {
    /// Defaults overlaid with the standard `ROS_*` environment variables.
    ///
    /// `ROS_HOSTNAME` wins over `ROS_IP` when both are set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(uri) = non_empty("ROS_MASTER_URI") {
            cfg.master_uri = uri;
        }
        if let Some(host) = non_empty("ROS_HOSTNAME").or_else(|| non_empty("ROS_IP")) {
            cfg.hostname = host;
        }
        if let Some(ns) = non_empty("ROS_NAMESPACE") {
            cfg.namespace = ns;
        }
        cfg
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_master_uri() -> String {
    "http://localhost:11311/".into()
}
fn d_hostname() -> String {
    "localhost".into()
}
fn d_namespace() -> String {
    "/".into()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config validation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Severity level for a configuration issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Error,
    Warning,
}

/// A single configuration validation issue.
#[derive(Debug, Clone)]
pub struct ConfigError {
    pub severity: ConfigSeverity,
    pub field: String,
    pub message: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.severity {
            ConfigSeverity::Error => "ERROR",
            ConfigSeverity::Warning => "WARN",
        };
        write!(f, "[{tag}] {}: {}", self.field, self.message)
    }
}

impl NodeConfig {
    /// Validate the configuration and return a list of issues.
    pub fn validate(&self) -> Vec<ConfigError> {
        let mut errors = Vec::new();

        if !self.master_uri.starts_with("http://") && !self.master_uri.starts_with("https://") {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "master_uri".into(),
                message: format!("expected an http(s) URI, got {:?}", self.master_uri),
            });
        }

        if self.hostname.is_empty() {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "hostname".into(),
                message: "hostname must not be empty".into(),
            });
        }

        if let Err(e) = crate::names::validate(&self.namespace) {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "namespace".into(),
                message: e.to_string(),
            });
        }

        if self.registry.poll_interval_ms == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "registry.poll_interval_ms".into(),
                message: "poll interval must be greater than 0".into(),
            });
        }

        if self.transport.max_frame_bytes == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Error,
                field: "transport.max_frame_bytes".into(),
                message: "max_frame_bytes must be greater than 0".into(),
            });
        }

        if self.transport.default_queue_size == 0 {
            errors.push(ConfigError {
                severity: ConfigSeverity::Warning,
                field: "transport.default_queue_size".into(),
                message: "queue size 0 is treated as 1".into(),
            });
        }

        for (from, to) in &self.remappings {
            if crate::names::validate(from).is_err() || crate::names::validate(to).is_err() {
                errors.push(ConfigError {
                    severity: ConfigSeverity::Error,
                    field: format!("remappings[{from}]"),
                    message: format!("invalid remapping {from:?} -> {to:?}"),
                });
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let cfg = NodeConfig::default();
        assert!(cfg.validate().is_empty());
        assert_eq!(cfg.master_uri, "http://localhost:11311/");
        assert_eq!(cfg.namespace, "/");
    }

    #[test]
    fn env_overrides_apply() {
        let cfg = NodeConfig::from_lookup(|key| match key {
            "ROS_MASTER_URI" => Some("http://master:11311".into()),
            "ROS_IP" => Some("10.0.0.7".into()),
            "ROS_NAMESPACE" => Some("/robot".into()),
            _ => None,
        });
        assert_eq!(cfg.master_uri, "http://master:11311");
        assert_eq!(cfg.hostname, "10.0.0.7");
        assert_eq!(cfg.namespace, "/robot");
    }

    #[test]
    fn hostname_beats_ip() {
        let cfg = NodeConfig::from_lookup(|key| match key {
            "ROS_HOSTNAME" => Some("robot.local".into()),
            "ROS_IP" => Some("10.0.0.7".into()),
            _ => None,
        });
        assert_eq!(cfg.hostname, "robot.local");
    }

    #[test]
    fn blank_env_is_ignored() {
        let cfg = NodeConfig::from_lookup(|key| match key {
            "ROS_MASTER_URI" => Some("   ".into()),
            _ => None,
        });
        assert_eq!(cfg.master_uri, "http://localhost:11311/");
    }

    #[test]
    fn bad_master_uri_is_an_error() {
        let cfg = NodeConfig {
            master_uri: "localhost:11311".into(),
            ..Default::default()
        };
        let issues = cfg.validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, ConfigSeverity::Error);
        assert_eq!(issues[0].field, "master_uri");
    }

    #[test]
    fn zero_queue_is_only_a_warning() {
        let mut cfg = NodeConfig::default();
        cfg.transport.default_queue_size = 0;
        let issues = cfg.validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].severity, ConfigSeverity::Warning);
    }
}
