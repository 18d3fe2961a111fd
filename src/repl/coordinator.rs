use super::OpTime;

use std::time::Duration;

/// A replica-set member role state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberState {
    Startup,
    Primary,
    Secondary,
    Recovering,
    Rollback,
    Removed,
}

impl MemberState {
    pub fn is_primary(&self) -> bool {
        *self == MemberState::Primary
    }

    pub fn is_recovering(&self) -> bool {
        *self == MemberState::Recovering
    }
}

impl std::fmt::Display for MemberState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MemberState::Startup => "STARTUP",
            MemberState::Primary => "PRIMARY",
            MemberState::Secondary => "SECONDARY",
            MemberState::Recovering => "RECOVERING",
            MemberState::Rollback => "ROLLBACK",
            MemberState::Removed => "REMOVED",
        };
        write!(f, "{name}")
    }
}

/// The replication coordinator, as seen by the applier: it tracks the node's
/// replication progress and owns role-state transitions. The applier calls
/// it from the tail loop, the batcher thread, and the finalizer thread, so
/// implementations must be thread-safe.
pub trait Coordinator: Send + Sync {
    /// Advances the node's last applied optime. Never regresses; callers may
    /// race with state transitions publishing their own optimes.
    fn set_my_last_applied_op_time_forward(&self, op_time: OpTime);

    /// Advances the node's last durable optime. Never regresses.
    fn set_my_last_durable_op_time_forward(&self, op_time: OpTime);

    /// The node's last applied optime.
    fn my_last_applied_op_time(&self) -> OpTime;

    /// The node's current role state.
    fn member_state(&self) -> MemberState;

    /// True if the node is currently primary or secondary.
    fn is_in_primary_or_secondary_state(&self) -> bool;

    /// True if the operator has put the node in maintenance mode.
    fn maintenance_mode(&self) -> bool;

    /// Requests a transition to the given follower state. Returns false if
    /// the transition was refused.
    fn set_follower_mode(&self, state: MemberState) -> bool;

    /// True if a primary step-down is waiting for the applier to drain its
    /// queue.
    fn is_waiting_for_applier_to_drain(&self) -> bool;

    /// Signals that the applier has drained its queue.
    fn signal_drain_complete(&self);

    /// True if the node is catching up as part of a primary election.
    fn is_catching_up(&self) -> bool;

    /// The configured follower delay. Zero disables delayed application.
    fn slave_delay(&self) -> Duration;
}
