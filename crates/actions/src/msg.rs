//! The [`Action`] schema trait and the envelopes that carry user payloads
//! on the `goal`, `result` and `feedback` topics.

use std::fmt;

use rn_domain::Result;
use rn_protocol::actionlib::{GoalId, GoalStatusEntry};
use rn_protocol::msg::Header;
use rn_protocol::{MessageReader, MessageWriter, RosMessage};

/// Schema of one action: its three payload types plus the identity of the
/// envelopes wrapping them.  Normally emitted by the message generator.
pub trait Action: Send + Sync + 'static {
    type Goal: RosMessage + Clone;
    type Result: RosMessage + Clone + Default;
    type Feedback: RosMessage + Clone;

    /// Package-qualified name, e.g. `"demo_msgs/Fibonacci"`.
    fn action_type() -> String;
    fn action_goal_md5sum() -> String;
    fn action_result_md5sum() -> String;
    fn action_feedback_md5sum() -> String;
}

/// `<Action>ActionGoal`.
pub struct ActionGoal<A: Action> {
    pub header: Header,
    pub goal_id: GoalId,
    pub goal: A::Goal,
}

/// `<Action>ActionResult`, published once when a goal reaches a terminal state.
pub struct ActionResult<A: Action> {
    pub header: Header,
    pub status: GoalStatusEntry,
    pub result: A::Result,
}

/// `<Action>ActionFeedback`.
pub struct ActionFeedback<A: Action> {
    pub header: Header,
    pub status: GoalStatusEntry,
    pub feedback: A::Feedback,
}

impl<A: Action> RosMessage for ActionGoal<A> {
    fn msg_type() -> String {
        format!("{}ActionGoal", A::action_type())
    }
    fn md5sum() -> String {
        A::action_goal_md5sum()
    }
    fn encode(&self, w: &mut MessageWriter) {
        w.message(&self.header);
        w.message(&self.goal_id);
        w.message(&self.goal);
    }
    fn decode(r: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Self {
            header: r.message()?,
            goal_id: r.message()?,
            goal: r.message()?,
        })
    }
}

impl<A: Action> RosMessage for ActionResult<A> {
    fn msg_type() -> String {
        format!("{}ActionResult", A::action_type())
    }
    fn md5sum() -> String {
        A::action_result_md5sum()
    }
    fn encode(&self, w: &mut MessageWriter) {
        w.message(&self.header);
        w.message(&self.status);
        w.message(&self.result);
    }
    fn decode(r: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Self {
            header: r.message()?,
            status: r.message()?,
            result: r.message()?,
        })
    }
}

impl<A: Action> RosMessage for ActionFeedback<A> {
    fn msg_type() -> String {
        format!("{}ActionFeedback", A::action_type())
    }
    fn md5sum() -> String {
        A::action_feedback_md5sum()
    }
    fn encode(&self, w: &mut MessageWriter) {
        w.message(&self.header);
        w.message(&self.status);
        w.message(&self.feedback);
    }
    fn decode(r: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Self {
            header: r.message()?,
            status: r.message()?,
            feedback: r.message()?,
        })
    }
}

impl<A: Action> fmt::Debug for ActionGoal<A>
where
    A::Goal: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionGoal")
            .field("header", &self.header)
            .field("goal_id", &self.goal_id)
            .field("goal", &self.goal)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_action {
    //! A tiny action used by this crate's unit tests.

    use super::*;

    pub struct Count;

    #[derive(Debug, Clone, Default, PartialEq, Eq)]
    pub struct Int(pub i32);

    impl RosMessage for Int {
        fn msg_type() -> String {
            "test/Int".into()
        }
        fn md5sum() -> String {
            "da5909fbe378aeaf85e547e830cc1bb7".into()
        }
        fn encode(&self, w: &mut MessageWriter) {
            w.i32(self.0);
        }
        fn decode(r: &mut MessageReader<'_>) -> Result<Self> {
            Ok(Self(r.i32()?))
        }
    }

    impl Action for Count {
        type Goal = Int;
        type Result = Int;
        type Feedback = Int;

        fn action_type() -> String {
            "test/Count".into()
        }
        fn action_goal_md5sum() -> String {
            "0b7d4ec7d4d6b7e11a3c0a0b1e9f2c01".into()
        }
        fn action_result_md5sum() -> String {
            "0b7d4ec7d4d6b7e11a3c0a0b1e9f2c02".into()
        }
        fn action_feedback_md5sum() -> String {
            "0b7d4ec7d4d6b7e11a3c0a0b1e9f2c03".into()
        }
    }
}

#[cfg(test)]
mod tests {
    use rn_protocol::Time;

    use super::test_action::{Count, Int};
    use super::*;

    #[test]
    fn goal_envelope_layout() {
        let goal = ActionGoal::<Count> {
            header: Header {
                seq: 1,
                stamp: Time::new(2, 3),
                frame_id: String::new(),
            },
            goal_id: GoalId {
                stamp: Time::new(2, 3),
                id: "g".into(),
            },
            goal: Int(7),
        };
        let bytes = goal.to_bytes();
        let decoded = ActionGoal::<Count>::from_bytes(&bytes).unwrap();
        assert_eq!(decoded.goal, Int(7));
        assert_eq!(decoded.goal_id.id, "g");
        assert_eq!(ActionGoal::<Count>::msg_type(), "test/CountActionGoal");
        // header (4 + 8 + 4) + goal id (8 + 4 + 1) + payload (4)
        assert_eq!(bytes.len(), 16 + 13 + 4);
    }
}
