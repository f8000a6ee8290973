//! Bounded single-consumer queue between producers and a connection or
//! callback task.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::types::OverflowPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PushOutcome {
    Queued,
    /// Queued after discarding the oldest entry.
    DroppedOldest,
    /// Not queued; the queue was full under [`OverflowPolicy::Disconnect`].
    Overflow,
    Closed,
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub(crate) struct BoundedQueue<T> {
    state: Mutex<State<T>>,
    notify: Notify,
    capacity: usize,
    policy: OverflowPolicy,
}

impl<T> BoundedQueue<T> {
    /// A capacity of zero is treated as one.
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity.min(64)),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
            policy,
        }
    }

    pub fn push(&self, item: T) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed {
                return PushOutcome::Closed;
            }
            if state.items.len() < self.capacity {
                state.items.push_back(item);
                PushOutcome::Queued
            } else {
                match self.policy {
                    OverflowPolicy::Disconnect => return PushOutcome::Overflow,
                    OverflowPolicy::DropOldest => {
                        state.items.pop_front();
                        state.items.push_back(item);
                        PushOutcome::DroppedOldest
                    }
                }
            }
        };
        self.notify.notify_one();
        outcome
    }

    /// Wait for the next item; `None` once closed and drained.
    pub async fn pop(&self) -> Option<T> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Wait for at least one item and take everything queued.
    pub async fn pop_all(&self) -> Option<Vec<T>> {
        loop {
            {
                let mut state = self.state.lock();
                if !state.items.is_empty() {
                    return Some(state.items.drain(..).collect());
                }
                if state.closed {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    pub fn close(&self) {
        self.state.lock().closed = true;
        self.notify.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn drop_oldest_keeps_newest() {
        let q = BoundedQueue::new(2, OverflowPolicy::DropOldest);
        assert_eq!(q.push(1), PushOutcome::Queued);
        assert_eq!(q.push(2), PushOutcome::Queued);
        assert_eq!(q.push(3), PushOutcome::DroppedOldest);
        assert_eq!(q.len(), 2);
        let items = futures_util::FutureExt::now_or_never(q.pop_all()).flatten();
        assert_eq!(items, Some(vec![2, 3]));
    }

    #[test]
    fn disconnect_policy_refuses_when_full() {
        let q = BoundedQueue::new(1, OverflowPolicy::Disconnect);
        assert_eq!(q.push("a"), PushOutcome::Queued);
        assert_eq!(q.push("b"), PushOutcome::Overflow);
        q.close();
        assert_eq!(q.push("c"), PushOutcome::Closed);
    }

    #[tokio::test]
    async fn pop_wakes_on_push_and_drains_before_close() {
        let q = Arc::new(BoundedQueue::new(4, OverflowPolicy::DropOldest));
        let consumer = {
            let q = q.clone();
            tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(v) = q.pop().await {
                    got.push(v);
                }
                got
            })
        };
        tokio::task::yield_now().await;
        q.push(1);
        q.push(2);
        q.close();
        assert_eq!(consumer.await.unwrap(), vec![1, 2]);
    }
}
