//! Goal lifecycle states and the transitions between them.

use std::fmt;

/// Status of one goal.  Discriminants are the wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum GoalStatus {
    Pending = 0,
    Active = 1,
    Preempted = 2,
    Succeeded = 3,
    Aborted = 4,
    Rejected = 5,
    Preempting = 6,
    Recalling = 7,
    Recalled = 8,
    /// Synthesized by the client when the server stops reporting the goal.
    Lost = 9,
}

impl GoalStatus {
    pub const ALL: [GoalStatus; 10] = [
        GoalStatus::Pending,
        GoalStatus::Active,
        GoalStatus::Preempted,
        GoalStatus::Succeeded,
        GoalStatus::Aborted,
        GoalStatus::Rejected,
        GoalStatus::Preempting,
        GoalStatus::Recalling,
        GoalStatus::Recalled,
        GoalStatus::Lost,
    ];

    pub fn from_wire(code: u8) -> Option<Self> {
        Self::ALL.get(usize::from(code)).copied()
    }

    pub fn as_wire(self) -> u8 {
        self as u8
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            GoalStatus::Preempted
                | GoalStatus::Recalled
                | GoalStatus::Rejected
                | GoalStatus::Aborted
                | GoalStatus::Succeeded
                | GoalStatus::Lost
        )
    }

    /// Cancel has been requested but the server has not settled the goal.
    pub fn is_cancel_requested(self) -> bool {
        matches!(self, GoalStatus::Preempting | GoalStatus::Recalling)
    }

    /// Single-step transitions.
    pub fn successors(self) -> &'static [GoalStatus] {
        use GoalStatus::*;
        match self {
            Pending => &[Active, Rejected, Recalling, Recalled, Lost],
            Recalling => &[Recalled, Rejected, Active, Preempting, Lost],
            Active => &[Preempting, Preempted, Succeeded, Aborted, Lost],
            Preempting => &[Preempted, Succeeded, Aborted, Lost],
            Preempted | Succeeded | Aborted | Rejected | Recalled | Lost => &[],
        }
    }

    pub fn can_transition(self, to: GoalStatus) -> bool {
        self.successors().contains(&to)
    }

    /// Whether `to` lies on some path from `self` of one or more steps.
    /// Clients use this to accept updates that skip states they never saw.
    pub fn can_reach(self, to: GoalStatus) -> bool {
        let mut seen = [false; 10];
        let mut stack = vec![self];
        while let Some(state) = stack.pop() {
            for &next in state.successors() {
                if next == to {
                    return true;
                }
                if !seen[next as usize] {
                    seen[next as usize] = true;
                    stack.push(next);
                }
            }
        }
        false
    }
}

impl fmt::Display for GoalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GoalStatus::Pending => "PENDING",
            GoalStatus::Active => "ACTIVE",
            GoalStatus::Preempted => "PREEMPTED",
            GoalStatus::Succeeded => "SUCCEEDED",
            GoalStatus::Aborted => "ABORTED",
            GoalStatus::Rejected => "REJECTED",
            GoalStatus::Preempting => "PREEMPTING",
            GoalStatus::Recalling => "RECALLING",
            GoalStatus::Recalled => "RECALLED",
            GoalStatus::Lost => "LOST",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::GoalStatus::*;
    use super::*;

    #[test]
    fn wire_codes() {
        for status in GoalStatus::ALL {
            assert_eq!(GoalStatus::from_wire(status.as_wire()), Some(status));
        }
        assert_eq!(Succeeded.as_wire(), 3);
        assert_eq!(Lost.as_wire(), 9);
        assert_eq!(GoalStatus::from_wire(10), None);
    }

    #[test]
    fn terminal_states_are_final() {
        for status in GoalStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            assert!(status.successors().is_empty(), "{status}");
            assert!(!GoalStatus::ALL.iter().any(|&to| status.can_reach(to)));
        }
    }

    #[test]
    fn every_live_state_can_be_lost() {
        for status in GoalStatus::ALL.into_iter().filter(|s| !s.is_terminal()) {
            assert!(status.can_transition(Lost), "{status}");
        }
    }

    #[test]
    fn reachability_skips_intermediate_states() {
        assert!(Pending.can_reach(Succeeded));
        assert!(Pending.can_reach(Preempted));
        assert!(Recalling.can_reach(Preempted));
        assert!(!Active.can_reach(Pending));
        assert!(!Active.can_reach(Recalled));
        assert!(!Preempting.can_reach(Active));
        assert!(!Pending.can_reach(Pending));
    }
}
