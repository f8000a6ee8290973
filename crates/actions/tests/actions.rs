//! End-to-end action tests: an action server and client on separate nodes,
//! wired through an in-process registry over loopback TCP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rn_actions::{
    Action, ActionClient, ActionClientOptions, ActionGoal, ActionResult, ActionServer,
    ActionServerOptions, ClientGoalHandle, GoalStatus, ServerGoalHandle,
};
use rn_node::config::NodeConfig;
use rn_node::msg::{Header, MessageReader, MessageWriter};
use rn_node::testing::InProcessRegistry;
use rn_node::{AdvertiseOptions, Error, Node, NodeBuilder, RosMessage};
use rn_protocol::actionlib::GoalStatusEntry;

// ── Test action: Fibonacci ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
struct FibGoal {
    order: i32,
}

impl RosMessage for FibGoal {
    fn msg_type() -> String {
        "test_actions/FibonacciGoal".into()
    }
    fn md5sum() -> String {
        "6889063349a00b249bd1661df429d822".into()
    }
    fn encode(&self, w: &mut MessageWriter) {
        w.i32(self.order);
    }
    fn decode(r: &mut MessageReader<'_>) -> rn_node::Result<Self> {
        Ok(Self { order: r.i32()? })
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
struct Sequence {
    sequence: Vec<i32>,
}

impl RosMessage for Sequence {
    fn msg_type() -> String {
        "test_actions/FibonacciSequence".into()
    }
    fn md5sum() -> String {
        "b81e37d2a31925a0e8ae261a8699cb79".into()
    }
    fn encode(&self, w: &mut MessageWriter) {
        w.seq(&self.sequence, |w, v| w.i32(*v));
    }
    fn decode(r: &mut MessageReader<'_>) -> rn_node::Result<Self> {
        Ok(Self {
            sequence: r.seq(|r| r.i32())?,
        })
    }
}

struct Fibonacci;

impl Action for Fibonacci {
    type Goal = FibGoal;
    type Result = Sequence;
    type Feedback = Sequence;

    fn action_type() -> String {
        "test_actions/Fibonacci".into()
    }
    fn action_goal_md5sum() -> String {
        "006871c7fa1d0e3d5fe2226bf17b2a94".into()
    }
    fn action_result_md5sum() -> String {
        "bee73a9fe29ae25e966e105f5553dd03".into()
    }
    fn action_feedback_md5sum() -> String {
        "73b8497a9f629a31c0020900e4148f07".into()
    }
}

fn fibonacci(order: i32) -> Vec<i32> {
    let mut seq = vec![0, 1];
    while seq.len() < order.max(0) as usize {
        let n = seq.len();
        seq.push(seq[n - 1] + seq[n - 2]);
    }
    seq.truncate(order.max(0) as usize);
    seq
}

// ── Helpers ─────────────────────────────────────────────────────────────

/// Log to the test writer; `RUST_LOG` picks the level.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn start(registry: &InProcessRegistry, name: &str) -> Node {
    init_tracing();
    NodeBuilder::new(name)
        .config(NodeConfig::default())
        .master_uri(registry.uri())
        .hostname("127.0.0.1")
        .bind_host("127.0.0.1")
        .max_wait(Duration::from_secs(5))
        .start()
        .await
        .unwrap()
}

/// Accept every goal and count up to `order`, one feedback step at a time,
/// unless a cancel is requested first.
fn run_fibonacci(goal: ServerGoalHandle<Fibonacci>) {
    goal.set_accepted("");
    tokio::spawn(async move {
        let full = fibonacci(goal.goal().order);
        for n in 1..=full.len() {
            if goal.is_cancel_requested() {
                goal.set_canceled(
                    Some(Sequence {
                        sequence: full[..n - 1].to_vec(),
                    }),
                    "preempted",
                );
                return;
            }
            goal.publish_feedback(Sequence {
                sequence: full[..n].to_vec(),
            });
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        goal.set_succeeded(Sequence { sequence: full }, "done");
    });
}

async fn fib_server(node: &Node, ns: &str) -> ActionServer<Fibonacci> {
    ActionServer::start(
        &node.handle(),
        ns,
        ActionServerOptions::default(),
        run_fibonacci,
        |_goal| {},
    )
    .await
    .unwrap()
}

async fn connected_client(
    node: &Node,
    ns: &str,
    opts: ActionClientOptions,
) -> ActionClient<Fibonacci> {
    let client = ActionClient::start(&node.handle(), ns, opts).await.unwrap();
    client.wait_for_server(Duration::from_secs(5)).await.unwrap();
    client
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Accepts every goal and never finishes one.
async fn accepting_server(
    node: &Node,
    ns: &str,
    opts: ActionServerOptions,
) -> ActionServer<Fibonacci> {
    ActionServer::start(
        &node.handle(),
        ns,
        opts,
        |goal: ServerGoalHandle<Fibonacci>| {
            goal.set_accepted("");
        },
        |_goal| {},
    )
    .await
    .unwrap()
}

async fn wait_for_status(goal: &ClientGoalHandle<Fibonacci>, status: GoalStatus) {
    let mut watch = goal.status_watch();
    tokio::time::timeout(Duration::from_secs(5), watch.wait_for(|s| *s == status))
        .await
        .expect("status within 5s")
        .expect("tracker alive");
}

// ── Tests ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn goal_succeeds_with_feedback() {
    let registry = InProcessRegistry::start().await.unwrap();
    let server_node = start(&registry, "/fib_server_ok").await;
    let client_node = start(&registry, "/fib_client_ok").await;
    let _server = fib_server(&server_node, "fibonacci_ok").await;
    let client =
        connected_client(&client_node, "/fibonacci_ok", ActionClientOptions::default()).await;

    let goal = client.send_goal(FibGoal { order: 6 }).unwrap();
    assert!(goal.goal_id().id.starts_with("/fib_client_ok-1-"));

    let mut watch = goal.status_watch();
    let observed = tokio::spawn(async move {
        let mut seen = vec![*watch.borrow_and_update()];
        while !seen[seen.len() - 1].is_terminal() && watch.changed().await.is_ok() {
            seen.push(*watch.borrow_and_update());
        }
        seen
    });

    let status = goal.wait_for_result(Duration::from_secs(10)).await.unwrap();
    assert_eq!(status, GoalStatus::Succeeded);
    assert_eq!(goal.result().unwrap().sequence, vec![0, 1, 1, 2, 3, 5]);
    assert_eq!(goal.status_text(), "done");
    assert!(goal.feedback().is_some());

    let seen = observed.await.unwrap();
    assert_eq!(seen.last(), Some(&GoalStatus::Succeeded));
    for pair in seen.windows(2) {
        assert!(pair[0].can_reach(pair[1]), "invalid path {seen:?}");
    }
}

#[tokio::test]
async fn cancel_preempts_active_goal() {
    let registry = InProcessRegistry::start().await.unwrap();
    let server_node = start(&registry, "/fib_server_cancel").await;
    let client_node = start(&registry, "/fib_client_cancel").await;
    let _server = fib_server(&server_node, "/fibonacci_cancel").await;
    let client =
        connected_client(&client_node, "/fibonacci_cancel", ActionClientOptions::default()).await;

    let goal = client.send_goal(FibGoal { order: 40 }).unwrap();
    wait_for_status(&goal, GoalStatus::Active).await;
    goal.cancel().unwrap();

    let status = goal.wait_for_result(Duration::from_secs(10)).await.unwrap();
    assert_eq!(status, GoalStatus::Preempted);
    let partial = goal.result().unwrap().sequence;
    assert!(partial.len() < 40);
}

#[tokio::test]
async fn rejected_goal_reports_reason() {
    let registry = InProcessRegistry::start().await.unwrap();
    let server_node = start(&registry, "/fib_server_reject").await;
    let client_node = start(&registry, "/fib_client_reject").await;
    let _server = ActionServer::<Fibonacci>::start(
        &server_node.handle(),
        "/fibonacci_reject",
        ActionServerOptions::default(),
        |goal: ServerGoalHandle<Fibonacci>| {
            if goal.goal().order < 0 {
                goal.set_rejected(None, "negative order");
            } else {
                run_fibonacci(goal);
            }
        },
        |_goal| {},
    )
    .await
    .unwrap();
    let client =
        connected_client(&client_node, "/fibonacci_reject", ActionClientOptions::default()).await;

    let goal = client.send_goal(FibGoal { order: -1 }).unwrap();
    let status = goal.wait_for_result(Duration::from_secs(5)).await.unwrap();
    assert_eq!(status, GoalStatus::Rejected);
    assert_eq!(goal.status_text(), "negative order");
    assert_eq!(goal.result(), Some(Sequence::default()));
}

#[tokio::test]
async fn cancel_before_accept_recalls() {
    let registry = InProcessRegistry::start().await.unwrap();
    let server_node = start(&registry, "/fib_server_recall").await;
    let client_node = start(&registry, "/fib_client_recall").await;
    // Goals are left pending; a cancel request recalls them.
    let server = ActionServer::<Fibonacci>::start(
        &server_node.handle(),
        "/fibonacci_recall",
        ActionServerOptions::default(),
        |_goal| {},
        |goal: ServerGoalHandle<Fibonacci>| {
            goal.set_canceled(None, "recalled");
        },
    )
    .await
    .unwrap();
    let client =
        connected_client(&client_node, "/fibonacci_recall", ActionClientOptions::default()).await;

    let goal = client.send_goal(FibGoal { order: 3 }).unwrap();
    goal.cancel().unwrap();

    let status = goal.wait_for_result(Duration::from_secs(5)).await.unwrap();
    assert_eq!(status, GoalStatus::Recalled);
    assert_eq!(server.goal_status(&goal.goal_id().id), Some(GoalStatus::Recalled));
}

#[tokio::test]
async fn goal_is_lost_when_server_goes_quiet() {
    let registry = InProcessRegistry::start().await.unwrap();
    let server_node = start(&registry, "/fib_server_lost").await;
    let client_node = start(&registry, "/fib_client_lost").await;
    let server =
        accepting_server(&server_node, "/fibonacci_lost", ActionServerOptions::default()).await;
    let client = connected_client(
        &client_node,
        "/fibonacci_lost",
        ActionClientOptions::default().liveness_timeout(Duration::from_millis(500)),
    )
    .await;

    let goal = client.send_goal(FibGoal { order: 3 }).unwrap();
    wait_for_status(&goal, GoalStatus::Active).await;

    server.shutdown().await;
    server_node.shutdown().await;

    let status = goal.wait_for_result(Duration::from_secs(5)).await.unwrap();
    assert_eq!(status, GoalStatus::Lost);
    assert_eq!(goal.result(), None);
}

#[tokio::test]
async fn goal_is_lost_when_server_restarts() {
    let registry = InProcessRegistry::start().await.unwrap();
    let first_node = start(&registry, "/fib_server_restart_a").await;
    let client_node = start(&registry, "/fib_client_restart").await;
    let first = accepting_server(
        &first_node,
        "/fibonacci_restart",
        ActionServerOptions::default().status_frequency(200.0),
    )
    .await;
    let client =
        connected_client(&client_node, "/fibonacci_restart", ActionClientOptions::default()).await;

    let goal = client.send_goal(FibGoal { order: 3 }).unwrap();
    wait_for_status(&goal, GoalStatus::Active).await;
    // Let the status sequence run well ahead of where a new server starts.
    tokio::time::sleep(Duration::from_millis(300)).await;

    first.shutdown().await;
    first_node.shutdown().await;
    let second_node = start(&registry, "/fib_server_restart_b").await;
    let _second =
        accepting_server(&second_node, "/fibonacci_restart", ActionServerOptions::default()).await;

    // The new server keeps reporting, so only its unknown goal list can
    // tell the client the goal is gone.
    let status = goal.wait_for_result(Duration::from_secs(4)).await.unwrap();
    assert_eq!(status, GoalStatus::Lost);
    assert_eq!(goal.result(), None);
}

#[tokio::test]
async fn duplicate_messages_for_finished_goal_are_ignored() {
    let registry = InProcessRegistry::start().await.unwrap();
    let server_node = start(&registry, "/fib_server_dup").await;
    let client_node = start(&registry, "/fib_client_dup").await;
    let replay_node = start(&registry, "/fib_replay_dup").await;

    let started = Arc::new(AtomicUsize::new(0));
    let counter = started.clone();
    let server = ActionServer::<Fibonacci>::start(
        &server_node.handle(),
        "/fibonacci_dup",
        ActionServerOptions::default(),
        move |goal: ServerGoalHandle<Fibonacci>| {
            counter.fetch_add(1, Ordering::SeqCst);
            run_fibonacci(goal);
        },
        |_goal| {},
    )
    .await
    .unwrap();
    let client =
        connected_client(&client_node, "/fibonacci_dup", ActionClientOptions::default()).await;

    let goal = client.send_goal(FibGoal { order: 4 }).unwrap();
    let status = goal.wait_for_result(Duration::from_secs(10)).await.unwrap();
    assert_eq!(status, GoalStatus::Succeeded);
    let result = goal.result();
    let mut status_watch = goal.status_watch();
    status_watch.borrow_and_update();

    let nh = replay_node.handle();
    let goal_pub = nh
        .advertise::<ActionGoal<Fibonacci>>("/fibonacci_dup/goal", AdvertiseOptions::default())
        .await
        .unwrap();
    let result_pub = nh
        .advertise::<ActionResult<Fibonacci>>("/fibonacci_dup/result", AdvertiseOptions::default())
        .await
        .unwrap();
    eventually("replay links", || {
        goal_pub.num_subscribers() > 0 && result_pub.num_subscribers() > 0
    })
    .await;

    // Same goal id again, then a contradicting result for it.
    goal_pub
        .publish(&ActionGoal {
            header: Header::default(),
            goal_id: goal.goal_id().clone(),
            goal: FibGoal { order: 9 },
        })
        .unwrap();
    result_pub
        .publish(&ActionResult {
            header: Header::default(),
            status: GoalStatusEntry {
                goal_id: goal.goal_id().clone(),
                status: GoalStatus::Aborted.as_wire(),
                text: "replayed".into(),
            },
            result: Sequence { sequence: vec![42] },
        })
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(server.goal_status(&goal.goal_id().id), Some(GoalStatus::Succeeded));
    assert_eq!(goal.status(), GoalStatus::Succeeded);
    assert_eq!(goal.status_text(), "done");
    assert_eq!(goal.result(), result);
    assert!(!status_watch.has_changed().unwrap());
}

#[tokio::test]
async fn wait_for_server_times_out_without_server() {
    let registry = InProcessRegistry::start().await.unwrap();
    let client_node = start(&registry, "/fib_client_alone").await;
    let client = ActionClient::<Fibonacci>::start(
        &client_node.handle(),
        "/nobody_home",
        ActionClientOptions::default(),
    )
    .await
    .unwrap();

    let err = client
        .wait_for_server(Duration::from_millis(300))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)), "{err}");
    assert!(!client.is_server_connected());
}
