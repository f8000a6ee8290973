//! Option types for publishers, subscribers and service clients.

use std::time::Duration;

/// What a publisher does when a subscriber's outbound queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Discard the oldest queued message to make room.
    #[default]
    DropOldest,
    /// Close the connection to that subscriber.
    Disconnect,
}

#[derive(Debug, Clone, Default)]
pub struct AdvertiseOptions {
    /// Deliver the most recent message to every subscriber that connects later.
    pub latch: bool,
    /// Per-subscriber outbound queue bound; `None` uses the transport default.
    pub queue_size: Option<usize>,
    pub overflow: OverflowPolicy,
}

impl AdvertiseOptions {
    pub fn latched() -> Self {
        Self {
            latch: true,
            ..Self::default()
        }
    }

    pub fn queue_size(mut self, n: usize) -> Self {
        self.queue_size = Some(n);
        self
    }

    pub fn overflow(mut self, policy: OverflowPolicy) -> Self {
        self.overflow = policy;
        self
    }
}

#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Inbound queue bound between the transport and the callback.
    /// Oldest messages are dropped when it is full.
    pub queue_size: Option<usize>,
    /// Deliver at most one message per window, always the newest.
    pub throttle: Option<Duration>,
    /// Reconnect to a publisher after its connection drops, as long as the
    /// registry still lists it.  `None` waits for the next publisher update.
    pub retry_delay: Option<Duration>,
    pub tcp_nodelay: bool,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            queue_size: None,
            throttle: None,
            retry_delay: None,
            tcp_nodelay: true,
        }
    }
}

impl SubscribeOptions {
    pub fn queue_size(mut self, n: usize) -> Self {
        self.queue_size = Some(n);
        self
    }

    pub fn throttle(mut self, window: Duration) -> Self {
        self.throttle = Some(window);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceClientOptions {
    /// Keep one connection open across calls instead of reconnecting per call.
    pub persistent: bool,
}

/// Outcome of the initial registry connect.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectReport {
    pub attempts: u32,
    /// "Registry unreachable" warnings actually emitted (the rest were throttled).
    pub warnings: u32,
}
