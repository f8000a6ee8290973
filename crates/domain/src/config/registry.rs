use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry connection
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Timeout applied to every individual registry RPC.
    #[serde(default = "d_2000")]
    pub attempt_timeout_ms: u64,
    /// Total time the initial connect may take.
    /// Negative retries forever, `0` makes exactly one attempt.
    #[serde(default = "d_forever")]
    pub max_wait_ms: i64,
    /// Fixed delay between connect attempts.
    #[serde(default = "d_500")]
    pub poll_interval_ms: u64,
    /// At most one "registry unreachable" warning is logged per window.
    #[serde(default = "d_60")]
    pub warn_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            attempt_timeout_ms: 2000,
            max_wait_ms: -1,
            poll_interval_ms: 500,
            warn_interval_secs: 60,
        }
    }
}

/// How long the initial registry connect may keep retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaxWait {
    /// Retry until the registry answers or the node shuts down.
    Forever,
    /// Exactly one attempt.
    Once,
    /// Retry until this much wall time has elapsed.
    Within(Duration),
}

impl MaxWait {
    pub fn from_millis(ms: i64) -> Self {
        match ms {
            ms if ms < 0 => MaxWait::Forever,
            0 => MaxWait::Once,
            ms => MaxWait::Within(Duration::from_millis(ms as u64)),
        }
    }
}

impl RegistryConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn warn_interval(&self) -> Duration {
        Duration::from_secs(self.warn_interval_secs)
    }

    pub fn max_wait(&self) -> MaxWait {
        MaxWait::from_millis(self.max_wait_ms)
    }
}

fn d_2000() -> u64 {
    2000
}
fn d_forever() -> i64 {
    -1
}
fn d_500() -> u64 {
    500
}
fn d_60() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_wait_sign_convention() {
        assert_eq!(MaxWait::from_millis(-1), MaxWait::Forever);
        assert_eq!(MaxWait::from_millis(-500), MaxWait::Forever);
        assert_eq!(MaxWait::from_millis(0), MaxWait::Once);
        assert_eq!(
            MaxWait::from_millis(1500),
            MaxWait::Within(Duration::from_millis(1500))
        );
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let cfg: RegistryConfig = toml::from_str("max_wait_ms = 0").unwrap();
        assert_eq!(cfg.max_wait(), MaxWait::Once);
        assert_eq!(cfg.poll_interval(), Duration::from_millis(500));
        assert_eq!(cfg.warn_interval(), Duration::from_secs(60));
    }
}
