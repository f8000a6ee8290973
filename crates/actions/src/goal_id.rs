//! Goal ids unique across clients: `<node name>-<counter>-<secs>.<nsecs>`.

use std::sync::atomic::{AtomicU64, Ordering};

use rn_protocol::actionlib::GoalId;
use rn_protocol::Time;

#[derive(Debug)]
pub struct GoalIdGenerator {
    prefix: String,
    counter: AtomicU64,
}

impl GoalIdGenerator {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            prefix: node_name.into(),
            counter: AtomicU64::new(0),
        }
    }

    /// A fresh id stamped with `now`.
    pub fn next(&self, now: Time) -> GoalId {
        let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        GoalId {
            stamp: now,
            id: format!("{}-{}-{}.{}", self.prefix, n, now.secs, now.nsecs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_and_counter() {
        let ids = GoalIdGenerator::new("/fib_client");
        let a = ids.next(Time::new(12, 500));
        let b = ids.next(Time::new(12, 500));
        assert_eq!(a.id, "/fib_client-1-12.500");
        assert_eq!(b.id, "/fib_client-2-12.500");
        assert_eq!(a.stamp, Time::new(12, 500));
    }
}
