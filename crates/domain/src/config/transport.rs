use std::time::Duration;

use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Peer transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Largest frame (header block or message) accepted or sent.
    #[serde(default = "d_max_frame")]
    pub max_frame_bytes: usize,
    /// How long a peer may take to complete the connection header exchange.
    #[serde(default = "d_5000")]
    pub handshake_timeout_ms: u64,
    /// Queue depth used when a publisher or subscriber does not pick one.
    #[serde(default = "d_16")]
    pub default_queue_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: d_max_frame(),
            handshake_timeout_ms: 5000,
            default_queue_size: 16,
        }
    }
}

impl TransportConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

fn d_max_frame() -> usize {
    1 << 30
}
fn d_5000() -> u64 {
    5000
}
fn d_16() -> usize {
    16
}
