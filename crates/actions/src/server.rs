//! Action server: accepts goals, tracks their lifecycle and reports it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rn_domain::Result;
use rn_node::names;
use rn_node::{AdvertiseOptions, NodeHandle, Publisher, SubscribeOptions, Subscriber};
use rn_protocol::actionlib::{GoalId, GoalStatusArray, GoalStatusEntry};
use rn_protocol::msg::Header;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::goal_id::GoalIdGenerator;
use crate::msg::{Action, ActionFeedback, ActionGoal, ActionResult};
use crate::status::GoalStatus;

#[derive(Debug, Clone)]
pub struct ActionServerOptions {
    /// Status snapshots per second, in addition to one per transition.
    pub status_frequency: f64,
    /// How long a finished goal stays in status snapshots.
    pub status_list_timeout: Duration,
    /// How long a retired goal id keeps being ignored if resubmitted.
    pub retired_id_timeout: Duration,
    /// Queue depth of the goal and cancel subscriptions.
    pub queue_size: usize,
}

impl Default for ActionServerOptions {
    fn default() -> Self {
        Self {
            status_frequency: 5.0,
            status_list_timeout: Duration::from_secs(5),
            retired_id_timeout: Duration::from_secs(60),
            queue_size: 50,
        }
    }
}

impl ActionServerOptions {
    pub fn status_frequency(mut self, hz: f64) -> Self {
        self.status_frequency = hz;
        self
    }

    pub fn status_list_timeout(mut self, d: Duration) -> Self {
        self.status_list_timeout = d;
        self
    }

    pub fn retired_id_timeout(mut self, d: Duration) -> Self {
        self.retired_id_timeout = d;
        self
    }

    fn status_period(&self) -> Duration {
        if self.status_frequency > 0.0 {
            Duration::from_secs_f64(1.0 / self.status_frequency)
        } else {
            Duration::from_secs(1)
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Goal table
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Server-side operations on a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GoalOp {
    Accept,
    Reject,
    Cancel,
    Succeed,
    Abort,
}

impl GoalOp {
    fn apply(self, from: GoalStatus) -> Option<GoalStatus> {
        use GoalStatus::*;
        match (self, from) {
            (GoalOp::Accept, Pending) => Some(Active),
            (GoalOp::Accept, Recalling) => Some(Preempting),
            (GoalOp::Reject, Pending | Recalling) => Some(Rejected),
            (GoalOp::Cancel, Pending | Recalling) => Some(Recalled),
            (GoalOp::Cancel, Active | Preempting) => Some(Preempted),
            (GoalOp::Succeed, Active | Preempting) => Some(Succeeded),
            (GoalOp::Abort, Active | Preempting) => Some(Aborted),
            _ => None,
        }
    }
}

/// What happened to an incoming goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Arrival {
    /// Tracked as `PENDING`; the goal callback should run.
    New,
    /// Cancelled before it arrived; already `RECALLED`.
    Recalled,
    /// Duplicate or retired id.
    Ignored,
}

struct GoalRecord<G> {
    goal_id: GoalId,
    /// `None` for a cancel request that arrived before its goal.
    goal: Option<Arc<G>>,
    status: GoalStatus,
    text: String,
    retire_at: Option<Instant>,
}

/// Every goal the server currently reports, plus ids it has retired
/// recently, each with the time it may be forgotten.
pub(crate) struct GoalTable<G> {
    goals: HashMap<String, GoalRecord<G>>,
    retired: HashMap<String, Instant>,
    last_cancel: rn_protocol::Time,
    keep: Duration,
    remember: Duration,
}

impl<G> GoalTable<G> {
    pub(crate) fn new(keep: Duration, remember: Duration) -> Self {
        Self {
            goals: HashMap::new(),
            retired: HashMap::new(),
            last_cancel: rn_protocol::Time::ZERO,
            keep,
            remember,
        }
    }

    pub(crate) fn arrive(&mut self, goal_id: &GoalId, goal: Arc<G>, now: Instant) -> Arrival {
        if self.retired.contains_key(&goal_id.id) {
            return Arrival::Ignored;
        }
        if let Some(record) = self.goals.get_mut(&goal_id.id) {
            if record.goal.is_some() {
                return Arrival::Ignored;
            }
            record.goal = Some(goal);
            record.goal_id.stamp = goal_id.stamp;
            record.status = GoalStatus::Recalled;
            record.text = "canceled before arrival".into();
            record.retire_at = Some(now + self.keep);
            return Arrival::Recalled;
        }

        let recalled = !goal_id.stamp.is_zero() && goal_id.stamp <= self.last_cancel;
        let (status, retire_at) = if recalled {
            (GoalStatus::Recalled, Some(now + self.keep))
        } else {
            (GoalStatus::Pending, None)
        };
        self.goals.insert(
            goal_id.id.clone(),
            GoalRecord {
                goal_id: goal_id.clone(),
                goal: Some(goal),
                status,
                text: String::new(),
                retire_at,
            },
        );
        if recalled {
            Arrival::Recalled
        } else {
            Arrival::New
        }
    }

    /// Apply a cancel request.  Returns the goals that moved to a
    /// cancel-requested state.
    pub(crate) fn cancel(&mut self, request: &GoalId, now: Instant) -> Vec<(GoalId, Arc<G>)> {
        let all = request.id.is_empty() && request.stamp.is_zero();
        let mut changed = Vec::new();
        let mut found = false;

        for record in self.goals.values_mut() {
            let Some(goal) = &record.goal else { continue };
            let by_id = !request.id.is_empty() && record.goal_id.id == request.id;
            found |= by_id;
            let by_stamp = !request.stamp.is_zero() && record.goal_id.stamp <= request.stamp;
            if !(all || by_id || by_stamp) {
                continue;
            }
            let next = match record.status {
                GoalStatus::Pending => GoalStatus::Recalling,
                GoalStatus::Active => GoalStatus::Preempting,
                _ => continue,
            };
            record.status = next;
            changed.push((record.goal_id.clone(), goal.clone()));
        }

        if !request.id.is_empty() && !found && !self.retired.contains_key(&request.id) {
            self.goals.insert(
                request.id.clone(),
                GoalRecord {
                    goal_id: request.clone(),
                    goal: None,
                    status: GoalStatus::Recalling,
                    text: String::new(),
                    retire_at: Some(now + self.keep),
                },
            );
        }
        if request.stamp > self.last_cancel {
            self.last_cancel = request.stamp;
        }
        changed
    }

    /// Returns the new status, or `None` when `op` is not valid for the
    /// goal's current status (or the goal is unknown).
    pub(crate) fn transition(
        &mut self,
        id: &str,
        op: GoalOp,
        text: String,
        now: Instant,
    ) -> Option<GoalStatus> {
        let record = self.goals.get_mut(id).filter(|r| r.goal.is_some())?;
        let next = op.apply(record.status)?;
        record.status = next;
        record.text = text;
        if next.is_terminal() {
            record.retire_at = Some(now + self.keep);
        }
        Some(next)
    }

    pub(crate) fn status(&self, id: &str) -> Option<GoalStatus> {
        self.goals.get(id).map(|r| r.status)
    }

    pub(crate) fn entry(&self, id: &str) -> Option<GoalStatusEntry> {
        self.goals.get(id).map(record_entry)
    }

    /// Drop records whose time is up.  Finished goals are remembered for
    /// a while so a resubmitted id stays ignored.
    pub(crate) fn retire(&mut self, now: Instant) -> usize {
        self.retired.retain(|_, forget_at| *forget_at > now);
        let expired: Vec<String> = self
            .goals
            .iter()
            .filter(|(_, r)| r.retire_at.is_some_and(|at| at <= now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(record) = self.goals.remove(id) {
                if record.status.is_terminal() {
                    self.retired.insert(id.clone(), now + self.remember);
                }
            }
        }
        expired.len()
    }

    pub(crate) fn snapshot(&self) -> Vec<GoalStatusEntry> {
        let mut list: Vec<&GoalRecord<G>> = self.goals.values().collect();
        list.sort_by(|a, b| {
            (a.goal_id.stamp, &a.goal_id.id).cmp(&(b.goal_id.stamp, &b.goal_id.id))
        });
        list.into_iter().map(record_entry).collect()
    }
}

fn record_entry<G>(record: &GoalRecord<G>) -> GoalStatusEntry {
    GoalStatusEntry {
        goal_id: record.goal_id.clone(),
        status: record.status.as_wire(),
        text: record.text.clone(),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Server
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ServerInner<A: Action> {
    nh: NodeHandle,
    namespace: String,
    table: Mutex<GoalTable<A::Goal>>,
    ids: GoalIdGenerator,
    seq: AtomicU32,
    status_pub: Publisher<GoalStatusArray>,
    result_pub: Publisher<ActionResult<A>>,
    feedback_pub: Publisher<ActionFeedback<A>>,
}

impl<A: Action> ServerInner<A> {
    fn header(&self) -> Header {
        Header {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            stamp: self.nh.now(),
            frame_id: String::new(),
        }
    }

    /// Called with the table locked so sequence numbers follow table order.
    fn publish_status(&self, table: &GoalTable<A::Goal>) {
        let msg = GoalStatusArray {
            header: self.header(),
            status_list: table.snapshot(),
        };
        if let Err(e) = self.status_pub.publish(&msg) {
            tracing::debug!(action = %self.namespace, error = %e, "status publish failed");
        }
    }

    fn publish_result(&self, table: &GoalTable<A::Goal>, id: &str, result: A::Result) {
        let Some(status) = table.entry(id) else { return };
        let msg = ActionResult::<A> {
            header: self.header(),
            status,
            result,
        };
        if let Err(e) = self.result_pub.publish(&msg) {
            tracing::debug!(action = %self.namespace, error = %e, "result publish failed");
        }
    }

    fn on_goal<F>(self: &Arc<Self>, msg: ActionGoal<A>, goal_cb: &F)
    where
        F: Fn(ServerGoalHandle<A>),
    {
        let mut goal_id = msg.goal_id;
        if goal_id.id.is_empty() {
            let stamp = if goal_id.stamp.is_zero() {
                self.nh.now()
            } else {
                goal_id.stamp
            };
            goal_id.id = self.ids.next(stamp).id;
        }
        let goal = Arc::new(msg.goal);

        let arrival = {
            let mut table = self.table.lock();
            let arrival = table.arrive(&goal_id, goal.clone(), Instant::now());
            match arrival {
                Arrival::New => self.publish_status(&table),
                Arrival::Recalled => {
                    self.publish_result(&table, &goal_id.id, A::Result::default());
                    self.publish_status(&table);
                }
                Arrival::Ignored => {}
            }
            arrival
        };
        tracing::debug!(action = %self.namespace, goal = %goal_id.id, ?arrival, "goal received");

        if arrival == Arrival::New {
            goal_cb(ServerGoalHandle {
                server: self.clone(),
                goal_id,
                goal,
            });
        }
    }

    fn on_cancel<F>(self: &Arc<Self>, request: GoalId, cancel_cb: &F)
    where
        F: Fn(ServerGoalHandle<A>),
    {
        let changed = {
            let mut table = self.table.lock();
            let changed = table.cancel(&request, Instant::now());
            self.publish_status(&table);
            changed
        };
        tracing::debug!(
            action = %self.namespace,
            goal = %request.id,
            stamp = %request.stamp,
            canceled = changed.len(),
            "cancel request"
        );
        for (goal_id, goal) in changed {
            cancel_cb(ServerGoalHandle {
                server: self.clone(),
                goal_id,
                goal,
            });
        }
    }

    fn apply(&self, id: &str, op: GoalOp, result: Option<A::Result>, text: String) -> bool {
        let mut table = self.table.lock();
        let from = table.status(id);
        let Some(next) = table.transition(id, op, text, Instant::now()) else {
            tracing::warn!(
                action = %self.namespace,
                goal = %id,
                ?op,
                status = ?from,
                "ignoring invalid goal transition"
            );
            return false;
        };
        if next.is_terminal() {
            self.publish_result(&table, id, result.unwrap_or_default());
        }
        self.publish_status(&table);
        true
    }
}

/// Serves one action namespace.  Dropping it (or `shutdown`) stops
/// accepting goals and stops status reports.
pub struct ActionServer<A: Action> {
    inner: Arc<ServerInner<A>>,
    subscribers: Vec<Subscriber>,
    cancel: CancellationToken,
}

impl<A: Action> ActionServer<A> {
    /// Advertise `ns/{status,result,feedback}`, subscribe to `ns/{goal,cancel}`
    /// and start the periodic status report.
    ///
    /// Callbacks run on the subscription's dispatch task; long work belongs
    /// in a task spawned from `goal_cb`.
    pub async fn start<G, C>(
        nh: &NodeHandle,
        ns: &str,
        opts: ActionServerOptions,
        goal_cb: G,
        cancel_cb: C,
    ) -> Result<Self>
    where
        G: Fn(ServerGoalHandle<A>) + Send + Sync + 'static,
        C: Fn(ServerGoalHandle<A>) + Send + Sync + 'static,
    {
        let namespace = nh.resolve_name(ns)?;
        let topic = |leaf: &str| names::join(&namespace, leaf);

        let pub_opts = AdvertiseOptions::default().queue_size(opts.queue_size);
        let status_pub = nh.advertise(&topic("status"), pub_opts.clone()).await?;
        let result_pub = nh.advertise(&topic("result"), pub_opts.clone()).await?;
        let feedback_pub = nh.advertise(&topic("feedback"), pub_opts).await?;

        let inner = Arc::new(ServerInner {
            nh: nh.clone(),
            namespace: namespace.clone(),
            table: Mutex::new(GoalTable::new(
                opts.status_list_timeout,
                opts.retired_id_timeout,
            )),
            ids: GoalIdGenerator::new(nh.name()),
            seq: AtomicU32::new(0),
            status_pub,
            result_pub,
            feedback_pub,
        });

        let sub_opts = SubscribeOptions::default().queue_size(opts.queue_size);
        let on_goal = inner.clone();
        let goal_sub = nh
            .subscribe(&topic("goal"), sub_opts.clone(), move |msg: ActionGoal<A>| {
                on_goal.on_goal(msg, &goal_cb)
            })
            .await?;
        let on_cancel = inner.clone();
        let cancel_sub = nh
            .subscribe(&topic("cancel"), sub_opts, move |msg: GoalId| {
                on_cancel.on_cancel(msg, &cancel_cb)
            })
            .await?;

        let cancel = CancellationToken::new();
        tokio::spawn(status_loop(inner.clone(), opts.status_period(), cancel.clone()));
        tracing::info!(action = %namespace, "action server started");

        Ok(Self {
            inner,
            subscribers: vec![goal_sub, cancel_sub],
            cancel,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Status of a goal the server still reports.
    pub fn goal_status(&self, id: &str) -> Option<GoalStatus> {
        self.inner.table.lock().status(id)
    }

    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for sub in self.subscribers.drain(..) {
            sub.shutdown().await;
        }
    }
}

impl<A: Action> Drop for ActionServer<A> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn status_loop<A: Action>(
    inner: Arc<ServerInner<A>>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut tick = tokio::time::interval(period);
    tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tick.tick() => {}
        }
        if !inner.nh.ok() {
            break;
        }
        let mut table = inner.table.lock();
        let retired = table.retire(Instant::now());
        if retired > 0 {
            tracing::trace!(action = %inner.namespace, retired, "retired goals");
        }
        inner.publish_status(&table);
    }
}

// ── goal handle ─────────────────────────────────────────────────────

/// The server's side of one goal.  Transitions that are not valid for the
/// goal's current status are logged and ignored; they return `false`.
pub struct ServerGoalHandle<A: Action> {
    server: Arc<ServerInner<A>>,
    goal_id: GoalId,
    goal: Arc<A::Goal>,
}

impl<A: Action> Clone for ServerGoalHandle<A> {
    fn clone(&self) -> Self {
        Self {
            server: self.server.clone(),
            goal_id: self.goal_id.clone(),
            goal: self.goal.clone(),
        }
    }
}

impl<A: Action> ServerGoalHandle<A> {
    pub fn goal(&self) -> &A::Goal {
        &self.goal
    }

    pub fn goal_id(&self) -> &GoalId {
        &self.goal_id
    }

    /// `None` once the goal has been retired.
    pub fn status(&self) -> Option<GoalStatus> {
        self.server.table.lock().status(&self.goal_id.id)
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.status().is_some_and(GoalStatus::is_cancel_requested)
    }

    pub fn set_accepted(&self, text: impl Into<String>) -> bool {
        self.server
            .apply(&self.goal_id.id, GoalOp::Accept, None, text.into())
    }

    pub fn set_rejected(&self, result: Option<A::Result>, text: impl Into<String>) -> bool {
        self.server
            .apply(&self.goal_id.id, GoalOp::Reject, result, text.into())
    }

    pub fn set_canceled(&self, result: Option<A::Result>, text: impl Into<String>) -> bool {
        self.server
            .apply(&self.goal_id.id, GoalOp::Cancel, result, text.into())
    }

    pub fn set_succeeded(&self, result: A::Result, text: impl Into<String>) -> bool {
        self.server
            .apply(&self.goal_id.id, GoalOp::Succeed, Some(result), text.into())
    }

    pub fn set_aborted(&self, result: A::Result, text: impl Into<String>) -> bool {
        self.server
            .apply(&self.goal_id.id, GoalOp::Abort, Some(result), text.into())
    }

    /// Publish feedback stamped with the goal's current status.  Ignored
    /// once the goal is finished.
    pub fn publish_feedback(&self, feedback: A::Feedback) -> bool {
        let table = self.server.table.lock();
        let Some(status) = table
            .entry(&self.goal_id.id)
            .filter(|e| GoalStatus::from_wire(e.status).is_some_and(|s| !s.is_terminal()))
        else {
            return false;
        };
        let msg = ActionFeedback::<A> {
            header: self.server.header(),
            status,
            feedback,
        };
        self.server.feedback_pub.publish(&msg).is_ok()
    }
}
