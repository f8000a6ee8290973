//! Action client: sends goals and follows them through the server's
//! status, feedback and result topics.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use rn_domain::{Error, Result};
use rn_node::names;
use rn_node::{AdvertiseOptions, NodeHandle, Publisher, SubscribeOptions, Subscriber};
use rn_protocol::actionlib::{GoalId, GoalStatusArray, GoalStatusEntry};
use rn_protocol::msg::Header;
use rn_protocol::Time;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::goal_id::GoalIdGenerator;
use crate::msg::{Action, ActionFeedback, ActionGoal, ActionResult};
use crate::status::GoalStatus;

#[derive(Debug, Clone)]
pub struct ActionClientOptions {
    /// A goal that is not finished is declared `LOST` when no status
    /// snapshot arrives for this long.
    pub liveness_timeout: Duration,
    pub queue_size: usize,
}

impl Default for ActionClientOptions {
    fn default() -> Self {
        Self {
            liveness_timeout: Duration::from_secs(5),
            queue_size: 50,
        }
    }
}

impl ActionClientOptions {
    pub fn liveness_timeout(mut self, d: Duration) -> Self {
        self.liveness_timeout = d;
        self
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Per-goal tracking
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct TrackState<R> {
    /// Header seq of the newest status snapshot applied.
    last_seq: Option<u32>,
    seen_in_status: bool,
    text: String,
    result: Option<R>,
}

/// Client-side view of one goal.  Status only ever moves forward along
/// the transition table and never leaves a terminal state.
struct GoalTracker<A: Action> {
    goal_id: GoalId,
    sent_at: Instant,
    state: Mutex<TrackState<A::Result>>,
    status: watch::Sender<GoalStatus>,
    feedback: watch::Sender<Option<A::Feedback>>,
    /// Set once the outcome is final: a result arrived, the goal was lost,
    /// or it finished and was retired without a result reaching us.
    done: watch::Sender<bool>,
}

impl<A: Action> GoalTracker<A> {
    fn new(goal_id: GoalId, sent_at: Instant) -> Self {
        Self {
            goal_id,
            sent_at,
            state: Mutex::new(TrackState {
                last_seq: None,
                seen_in_status: false,
                text: String::new(),
                result: None,
            }),
            status: watch::Sender::new(GoalStatus::Pending),
            feedback: watch::Sender::new(None),
            done: watch::Sender::new(false),
        }
    }

    fn current(&self) -> GoalStatus {
        *self.status.borrow()
    }

    /// Move to `next` if it is reachable from the current status.
    fn advance(&self, state: &mut TrackState<A::Result>, next: GoalStatus, text: &str) -> bool {
        let current = self.current();
        if current == next || current.is_terminal() || !current.can_reach(next) {
            return false;
        }
        state.text = text.to_owned();
        self.status.send_replace(next);
        tracing::debug!(goal = %self.goal_id.id, from = %current, to = %next, "goal status");
        if next == GoalStatus::Lost {
            self.done.send_replace(true);
        }
        true
    }

    fn advance_wire(&self, state: &mut TrackState<A::Result>, entry: &GoalStatusEntry) {
        match GoalStatus::from_wire(entry.status) {
            Some(next) => {
                self.advance(state, next, &entry.text);
            }
            None => tracing::debug!(
                goal = %self.goal_id.id,
                code = entry.status,
                "ignoring unknown status code"
            ),
        }
    }

    /// The server restarted its status sequence; the next snapshot is new.
    fn restart_stream(&self) {
        self.state.lock().last_seq = None;
    }

    /// Apply one status snapshot.  `entry` is this goal's row, if listed.
    fn on_status(&self, seq: u32, entry: Option<&GoalStatusEntry>) {
        let mut state = self.state.lock();
        if state.last_seq.is_some_and(|last| seq <= last) {
            return;
        }
        state.last_seq = Some(seq);

        match entry {
            Some(entry) => {
                state.seen_in_status = true;
                self.advance_wire(&mut state, entry);
            }
            None if state.seen_in_status => {
                let current = self.current();
                if !current.is_terminal() {
                    self.advance(&mut state, GoalStatus::Lost, "goal vanished from status");
                } else if state.result.is_none() {
                    self.done.send_replace(true);
                }
            }
            None => {}
        }
    }

    fn on_result(&self, status: &GoalStatusEntry, result: A::Result) {
        let mut state = self.state.lock();
        self.advance_wire(&mut state, status);
        let current = self.current();
        if current.is_terminal() && current != GoalStatus::Lost && state.result.is_none() {
            state.result = Some(result);
            self.done.send_replace(true);
        }
    }

    fn on_feedback(&self, status: &GoalStatusEntry, feedback: A::Feedback) {
        let mut state = self.state.lock();
        self.advance_wire(&mut state, status);
        if !self.current().is_terminal() {
            self.feedback.send_replace(Some(feedback));
        }
    }

    /// Declare the goal lost if the server has been silent too long.
    fn check_liveness(&self, last_status: Option<Instant>, window: Duration, now: Instant) {
        if self.current().is_terminal() {
            return;
        }
        let heard = last_status.map_or(self.sent_at, |at| at.max(self.sent_at));
        if now.saturating_duration_since(heard) > window {
            let mut state = self.state.lock();
            self.advance(&mut state, GoalStatus::Lost, "server stopped reporting status");
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Status stream
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// How far the status seq may step back and still count as a late
/// snapshot from the same server rather than a restarted one.
const STATUS_REORDER_WINDOW: u32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusOrder {
    Next,
    /// Duplicate or late; carries no news and proves nothing about liveness.
    Stale,
    /// The sequence jumped far back: a new server instance.
    Restarted,
}

/// Sequence and arrival time of the server's status snapshots.
#[derive(Debug, Default)]
struct StatusStream {
    last_seq: Option<u32>,
    heard_at: Option<Instant>,
}

impl StatusStream {
    fn observe(&mut self, seq: u32, now: Instant) -> StatusOrder {
        let order = match self.last_seq {
            Some(last) if seq <= last && last - seq <= STATUS_REORDER_WINDOW => {
                return StatusOrder::Stale
            }
            Some(last) if seq < last => StatusOrder::Restarted,
            _ => StatusOrder::Next,
        };
        self.last_seq = Some(seq);
        self.heard_at = Some(now);
        order
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ClientInner<A: Action> {
    nh: NodeHandle,
    namespace: String,
    ids: GoalIdGenerator,
    seq: AtomicU32,
    goal_pub: Publisher<ActionGoal<A>>,
    cancel_pub: Publisher<GoalId>,
    goals: Mutex<HashMap<String, Weak<GoalTracker<A>>>>,
    status: Mutex<StatusStream>,
}

impl<A: Action> ClientInner<A> {
    fn tracker(&self, id: &str) -> Option<Arc<GoalTracker<A>>> {
        self.goals.lock().get(id).and_then(Weak::upgrade)
    }

    /// Live trackers; entries whose handles are all gone are pruned.
    fn trackers(&self) -> Vec<Arc<GoalTracker<A>>> {
        let mut goals = self.goals.lock();
        goals.retain(|_, t| t.strong_count() > 0);
        goals.values().filter_map(Weak::upgrade).collect()
    }

    fn on_status(&self, msg: GoalStatusArray) {
        let seq = msg.header.seq;
        let order = self.status.lock().observe(seq, Instant::now());
        match order {
            StatusOrder::Stale => {
                tracing::trace!(action = %self.namespace, seq, "stale status snapshot");
                return;
            }
            StatusOrder::Restarted => {
                tracing::info!(action = %self.namespace, seq, "action server restarted");
                for tracker in self.trackers() {
                    tracker.restart_stream();
                }
            }
            StatusOrder::Next => {}
        }
        for tracker in self.trackers() {
            let entry = msg
                .status_list
                .iter()
                .find(|e| e.goal_id.id == tracker.goal_id.id);
            tracker.on_status(msg.header.seq, entry);
        }
    }

    fn on_result(&self, msg: ActionResult<A>) {
        if let Some(tracker) = self.tracker(&msg.status.goal_id.id) {
            tracker.on_result(&msg.status, msg.result);
        }
    }

    fn on_feedback(&self, msg: ActionFeedback<A>) {
        if let Some(tracker) = self.tracker(&msg.status.goal_id.id) {
            tracker.on_feedback(&msg.status, msg.feedback);
        }
    }

    fn publish_cancel(&self, request: GoalId) -> Result<()> {
        tracing::debug!(action = %self.namespace, goal = %request.id, stamp = %request.stamp, "cancel");
        self.cancel_pub.publish(&request)
    }
}

/// Client for one action namespace.
pub struct ActionClient<A: Action> {
    inner: Arc<ClientInner<A>>,
    /// `status`, `result` and `feedback`.
    subscribers: Vec<Subscriber>,
    cancel: CancellationToken,
}

impl<A: Action> ActionClient<A> {
    pub async fn start(nh: &NodeHandle, ns: &str, opts: ActionClientOptions) -> Result<Self> {
        let namespace = nh.resolve_name(ns)?;
        let topic = |leaf: &str| names::join(&namespace, leaf);

        let pub_opts = AdvertiseOptions::default().queue_size(opts.queue_size);
        let goal_pub = nh.advertise(&topic("goal"), pub_opts.clone()).await?;
        let cancel_pub = nh.advertise(&topic("cancel"), pub_opts).await?;

        let inner = Arc::new(ClientInner {
            nh: nh.clone(),
            namespace: namespace.clone(),
            ids: GoalIdGenerator::new(nh.name()),
            seq: AtomicU32::new(0),
            goal_pub,
            cancel_pub,
            goals: Mutex::new(HashMap::new()),
            status: Mutex::new(StatusStream::default()),
        });

        let sub_opts = SubscribeOptions::default().queue_size(opts.queue_size);
        let on_status = inner.clone();
        let status_sub = nh
            .subscribe(&topic("status"), sub_opts.clone(), move |msg: GoalStatusArray| {
                on_status.on_status(msg)
            })
            .await?;
        let on_result = inner.clone();
        let result_sub = nh
            .subscribe(&topic("result"), sub_opts.clone(), move |msg: ActionResult<A>| {
                on_result.on_result(msg)
            })
            .await?;
        let on_feedback = inner.clone();
        let feedback_sub = nh
            .subscribe(&topic("feedback"), sub_opts, move |msg: ActionFeedback<A>| {
                on_feedback.on_feedback(msg)
            })
            .await?;

        let cancel = CancellationToken::new();
        tokio::spawn(watchdog(
            Arc::downgrade(&inner),
            opts.liveness_timeout,
            cancel.clone(),
        ));
        tracing::info!(action = %namespace, "action client started");

        Ok(Self {
            inner,
            subscribers: vec![status_sub, result_sub, feedback_sub],
            cancel,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// True once every action topic is linked to the server and its status
    /// reports have started arriving.
    pub fn is_server_connected(&self) -> bool {
        self.inner.goal_pub.num_subscribers() > 0
            && self.inner.cancel_pub.num_subscribers() > 0
            && self.subscribers.iter().all(|s| s.num_publishers() > 0)
            && self.inner.status.lock().heard_at.is_some()
    }

    /// Wait until [`is_server_connected`](Self::is_server_connected).
    pub async fn wait_for_server(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_server_connected() {
                return Ok(());
            }
            if !self.inner.nh.ok() {
                return Err(Error::Shutdown);
            }
            if Instant::now() >= deadline {
                return Err(Error::Timeout(format!(
                    "action server {} not connected after {timeout:?}",
                    self.inner.namespace
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    /// Publish a new goal.  The handle tracks it until dropped.
    pub fn send_goal(&self, goal: A::Goal) -> Result<ClientGoalHandle<A>> {
        let now = self.inner.nh.now();
        let goal_id = self.inner.ids.next(now);
        let tracker = Arc::new(GoalTracker::new(goal_id.clone(), Instant::now()));
        self.inner
            .goals
            .lock()
            .insert(goal_id.id.clone(), Arc::downgrade(&tracker));

        let msg = ActionGoal::<A> {
            header: Header {
                seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
                stamp: now,
                frame_id: String::new(),
            },
            goal_id: goal_id.clone(),
            goal,
        };
        if let Err(e) = self.inner.goal_pub.publish(&msg) {
            self.inner.goals.lock().remove(&goal_id.id);
            return Err(e);
        }
        tracing::debug!(action = %self.inner.namespace, goal = %goal_id.id, "goal sent");

        Ok(ClientGoalHandle {
            client: self.inner.clone(),
            tracker,
        })
    }

    pub fn cancel_all_goals(&self) -> Result<()> {
        self.inner.publish_cancel(GoalId::default())
    }

    /// Cancel every goal stamped at or before `stamp`, from any client.
    pub fn cancel_goals_at_and_before_time(&self, stamp: Time) -> Result<()> {
        self.inner.publish_cancel(GoalId {
            stamp,
            id: String::new(),
        })
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for sub in self.subscribers.drain(..) {
            sub.shutdown().await;
        }
    }
}

impl<A: Action> Drop for ActionClient<A> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn watchdog<A: Action>(
    inner: Weak<ClientInner<A>>,
    window: Duration,
    cancel: CancellationToken,
) {
    let period = (window / 4).max(Duration::from_millis(10));
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        let Some(inner) = inner.upgrade() else { break };
        let last_status = inner.status.lock().heard_at;
        let now = Instant::now();
        for tracker in inner.trackers() {
            tracker.check_liveness(last_status, window, now);
        }
    }
}

// ── goal handle ─────────────────────────────────────────────────────

/// The client's side of one goal.
pub struct ClientGoalHandle<A: Action> {
    client: Arc<ClientInner<A>>,
    tracker: Arc<GoalTracker<A>>,
}

impl<A: Action> Clone for ClientGoalHandle<A> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            tracker: self.tracker.clone(),
        }
    }
}

impl<A: Action> ClientGoalHandle<A> {
    pub fn goal_id(&self) -> &GoalId {
        &self.tracker.goal_id
    }

    pub fn status(&self) -> GoalStatus {
        self.tracker.current()
    }

    /// Text the server attached to the latest status.
    pub fn status_text(&self) -> String {
        self.tracker.state.lock().text.clone()
    }

    pub fn status_watch(&self) -> watch::Receiver<GoalStatus> {
        self.tracker.status.subscribe()
    }

    /// Latest feedback, if any arrived.
    pub fn feedback(&self) -> Option<A::Feedback> {
        self.tracker.feedback.borrow().clone()
    }

    pub fn feedback_watch(&self) -> watch::Receiver<Option<A::Feedback>> {
        self.tracker.feedback.subscribe()
    }

    pub fn result(&self) -> Option<A::Result> {
        self.tracker.state.lock().result.clone()
    }

    pub fn is_done(&self) -> bool {
        *self.tracker.done.borrow()
    }

    /// Wait for the goal's final outcome and return its status.  `LOST`
    /// counts as an outcome; the result is then absent.
    pub async fn wait_for_result(&self, timeout: Duration) -> Result<GoalStatus> {
        let mut done = self.tracker.done.subscribe();
        let result = match tokio::time::timeout(timeout, done.wait_for(|d| *d)).await {
            Ok(Ok(_)) => Ok(self.status()),
            Ok(Err(_)) => Err(Error::Shutdown),
            Err(_) => Err(Error::Timeout(format!(
                "goal {} unfinished after {timeout:?}",
                self.tracker.goal_id.id
            ))),
        };
        result
    }

    /// Ask the server to cancel this goal.
    pub fn cancel(&self) -> Result<()> {
        self.client.publish_cancel(GoalId {
            stamp: Time::ZERO,
            id: self.tracker.goal_id.id.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::test_action::{Count, Int};

    fn tracker() -> GoalTracker<Count> {
        GoalTracker::new(
            GoalId {
                stamp: Time::new(1, 0),
                id: "g".into(),
            },
            Instant::now(),
        )
    }

    fn entry(status: GoalStatus) -> GoalStatusEntry {
        GoalStatusEntry {
            goal_id: GoalId {
                stamp: Time::new(1, 0),
                id: "g".into(),
            },
            status: status.as_wire(),
            text: String::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn status_follows_snapshots() {
        let t = tracker();
        t.on_status(1, Some(&entry(GoalStatus::Pending)));
        t.on_status(2, Some(&entry(GoalStatus::Active)));
        assert_eq!(t.current(), GoalStatus::Active);
        t.on_result(&entry(GoalStatus::Succeeded), Int(7));
        assert_eq!(t.current(), GoalStatus::Succeeded);
        assert_eq!(t.state.lock().result, Some(Int(7)));
        assert!(*t.done.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_snapshots_are_ignored() {
        let t = tracker();
        t.on_status(5, Some(&entry(GoalStatus::Active)));
        t.on_status(4, Some(&entry(GoalStatus::Preempting)));
        assert_eq!(t.current(), GoalStatus::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn status_never_moves_backwards() {
        let t = tracker();
        t.on_status(1, Some(&entry(GoalStatus::Active)));
        t.on_status(2, Some(&entry(GoalStatus::Pending)));
        assert_eq!(t.current(), GoalStatus::Active);
    }

    #[tokio::test(start_paused = true)]
    async fn terminal_status_is_final() {
        let t = tracker();
        t.on_result(&entry(GoalStatus::Aborted), Int(1));
        t.on_result(&entry(GoalStatus::Succeeded), Int(2));
        t.on_status(9, Some(&entry(GoalStatus::Active)));
        assert_eq!(t.current(), GoalStatus::Aborted);
        assert_eq!(t.state.lock().result, Some(Int(1)));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_from_status_after_seen_is_lost() {
        let t = tracker();
        // Not yet listed: the server may not have received it.
        t.on_status(1, None);
        assert_eq!(t.current(), GoalStatus::Pending);
        t.on_status(2, Some(&entry(GoalStatus::Active)));
        t.on_status(3, None);
        assert_eq!(t.current(), GoalStatus::Lost);
        assert!(*t.done.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn retired_without_result_is_done() {
        let t = tracker();
        t.on_status(1, Some(&entry(GoalStatus::Rejected)));
        assert!(!*t.done.borrow());
        t.on_status(2, None);
        assert_eq!(t.current(), GoalStatus::Rejected);
        assert!(*t.done.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn silence_marks_goal_lost() {
        let t = tracker();
        let window = Duration::from_secs(5);
        tokio::time::advance(Duration::from_secs(4)).await;
        t.check_liveness(None, window, Instant::now());
        assert_eq!(t.current(), GoalStatus::Pending);

        let heard = Instant::now();
        tokio::time::advance(Duration::from_secs(4)).await;
        t.check_liveness(Some(heard), window, Instant::now());
        assert_eq!(t.current(), GoalStatus::Pending);

        tokio::time::advance(Duration::from_secs(2)).await;
        t.check_liveness(Some(heard), window, Instant::now());
        assert_eq!(t.current(), GoalStatus::Lost);

        // A late result cannot revive a lost goal.
        t.on_result(&entry(GoalStatus::Succeeded), Int(3));
        assert_eq!(t.current(), GoalStatus::Lost);
        assert_eq!(t.state.lock().result, None);
    }

    #[tokio::test(start_paused = true)]
    async fn restarted_stream_reaches_trackers() {
        let t = tracker();
        t.on_status(120, Some(&entry(GoalStatus::Active)));
        // A restarted server numbers from zero and no longer knows the goal.
        t.on_status(0, None);
        assert_eq!(t.current(), GoalStatus::Active);
        t.restart_stream();
        t.on_status(0, None);
        assert_eq!(t.current(), GoalStatus::Lost);
    }

    #[tokio::test(start_paused = true)]
    async fn status_stream_orders_snapshots() {
        let mut stream = StatusStream::default();
        let start = Instant::now();
        assert_eq!(stream.observe(0, start), StatusOrder::Next);
        assert_eq!(stream.observe(200, start), StatusOrder::Next);

        // Late or duplicate snapshots do not count as hearing from the server.
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(stream.observe(200, Instant::now()), StatusOrder::Stale);
        assert_eq!(stream.observe(190, Instant::now()), StatusOrder::Stale);
        assert_eq!(stream.heard_at, Some(start));

        assert_eq!(stream.observe(2, Instant::now()), StatusOrder::Restarted);
        assert_eq!(stream.heard_at, Some(Instant::now()));
        assert_eq!(stream.observe(3, Instant::now()), StatusOrder::Next);
    }

    #[tokio::test(start_paused = true)]
    async fn feedback_stops_after_terminal() {
        let t = tracker();
        t.on_feedback(&entry(GoalStatus::Active), Int(1));
        assert_eq!(t.current(), GoalStatus::Active);
        assert_eq!(*t.feedback.borrow(), Some(Int(1)));
        t.on_result(&entry(GoalStatus::Succeeded), Int(9));
        t.on_feedback(&entry(GoalStatus::Active), Int(2));
        assert_eq!(*t.feedback.borrow(), Some(Int(1)));
    }
}
