//! Node time: wall clock, or simulated time driven by the `/clock` topic.

use std::sync::atomic::{AtomicU64, Ordering};

use rn_protocol::Time;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockMode {
    Wall,
    /// Time only moves when a `/clock` message arrives; zero until the first.
    Simulated,
}

#[derive(Debug)]
pub struct ClockSource {
    mode: ClockMode,
    sim_nanos: AtomicU64,
}

impl ClockSource {
    pub fn new(mode: ClockMode) -> Self {
        Self {
            mode,
            sim_nanos: AtomicU64::new(0),
        }
    }

    pub fn wall() -> Self {
        Self::new(ClockMode::Wall)
    }

    pub fn simulated() -> Self {
        Self::new(ClockMode::Simulated)
    }

    /// Pick the mode from the `/use_sim_time` parameter value, if any.
    pub fn from_use_sim_time(value: Option<&serde_json::Value>) -> Self {
        let simulated = match value {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::Number(n)) => n.as_i64().is_some_and(|n| n != 0),
            Some(serde_json::Value::String(s)) => s == "true" || s == "1",
            _ => false,
        };
        if simulated {
            Self::simulated()
        } else {
            Self::wall()
        }
    }

    pub fn mode(&self) -> ClockMode {
        self.mode
    }

    pub fn is_simulated(&self) -> bool {
        self.mode == ClockMode::Simulated
    }

    pub fn now(&self) -> Time {
        match self.mode {
            ClockMode::Wall => Time::wall_now(),
            ClockMode::Simulated => Time::from_nanos(self.sim_nanos.load(Ordering::Acquire)),
        }
    }

    /// Record a `/clock` sample.  Ignored in wall mode.
    pub fn update(&self, t: Time) {
        if self.is_simulated() {
            self.sim_nanos.store(t.as_nanos(), Ordering::Release);
        }
    }
}
