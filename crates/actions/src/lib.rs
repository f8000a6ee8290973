//! `rn-actions` — long-running goals layered on plain topics.
//!
//! An action named `ns` is five topics under that namespace:
//!
//! ```text
//!   client                                server
//!     │ ── ns/goal      (ActionGoal)     ──▶ │
//!     │ ── ns/cancel    (GoalID)         ──▶ │
//!     │ ◀── ns/status   (GoalStatusArray) ── │  periodic + on every transition
//!     │ ◀── ns/feedback (ActionFeedback)  ── │
//!     │ ◀── ns/result   (ActionResult)    ── │  once per goal, on its terminal transition
//! ```
//!
//! The server is authoritative for goal status.  Clients observe it through
//! `status`, `feedback` and `result`, apply updates idempotently, and
//! synthesize [`GoalStatus::Lost`] themselves when the server goes quiet.

pub mod client;
pub mod goal_id;
pub mod msg;
pub mod server;
pub mod status;

pub use client::{ActionClient, ActionClientOptions, ClientGoalHandle};
pub use goal_id::GoalIdGenerator;
pub use msg::{Action, ActionFeedback, ActionGoal, ActionResult};
pub use server::{ActionServer, ActionServerOptions, ServerGoalHandle};
pub use status::GoalStatus;
