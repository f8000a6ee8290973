//! Wire types of the action protocol's `status` and `cancel` topics.
//!
//! The goal/feedback/result envelopes wrap user payload types and live in
//! the action crate; these are the fixed, payload-independent messages.

use rn_domain::Result;

use crate::msg::{Header, MessageReader, MessageWriter, RosMessage, Time};

/// `actionlib_msgs/GoalID`.  On the cancel topic an empty `id` with a zero
/// `stamp` means "all goals"; a non-zero stamp means "goals stamped at or
/// before this time".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct GoalId {
    pub stamp: Time,
    pub id: String,
}

impl RosMessage for GoalId {
    fn msg_type() -> String {
        "actionlib_msgs/GoalID".into()
    }
    fn md5sum() -> String {
        "302881f31927c1df708a2dbab0e80ee8".into()
    }
    fn message_definition() -> String {
        "time stamp\nstring id\n".into()
    }
    fn encode(&self, w: &mut MessageWriter) {
        w.time(self.stamp);
        w.string(&self.id);
    }
    fn decode(r: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Self {
            stamp: r.time()?,
            id: r.string()?,
        })
    }
}

/// `actionlib_msgs/GoalStatus`; `status` is the raw wire code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GoalStatusEntry {
    pub goal_id: GoalId,
    pub status: u8,
    pub text: String,
}

impl RosMessage for GoalStatusEntry {
    fn msg_type() -> String {
        "actionlib_msgs/GoalStatus".into()
    }
    fn md5sum() -> String {
        "d388f9b87b3c471f784434d671988d4a".into()
    }
    fn encode(&self, w: &mut MessageWriter) {
        w.message(&self.goal_id);
        w.u8(self.status);
        w.string(&self.text);
    }
    fn decode(r: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Self {
            goal_id: r.message()?,
            status: r.u8()?,
            text: r.string()?,
        })
    }
}

/// `actionlib_msgs/GoalStatusArray`: the periodic full status snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GoalStatusArray {
    pub header: Header,
    pub status_list: Vec<GoalStatusEntry>,
}

impl RosMessage for GoalStatusArray {
    fn msg_type() -> String {
        "actionlib_msgs/GoalStatusArray".into()
    }
    fn md5sum() -> String {
        "8b2b82f13216d0a8ea88bd3af735e619".into()
    }
    fn message_definition() -> String {
        "Header header\nGoalStatus[] status_list\n".into()
    }
    fn encode(&self, w: &mut MessageWriter) {
        w.message(&self.header);
        w.seq(&self.status_list, |w, s| w.message(s));
    }
    fn decode(r: &mut MessageReader<'_>) -> Result<Self> {
        Ok(Self {
            header: r.message()?,
            status_list: r.seq(|r| r.message())?,
        })
    }
}
