use std::fmt;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use super::state::{StateMachine, Transition};

/// Lifecycle states of a VM snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmSnapshotState {
    Allocated,
    Creating,
    Ready,
    Reverting,
    Expunging,
    Error,
    Expunged,
}

impl VmSnapshotState {
    /// A snapshot in any of these states blocks new snapshot work on its VM.
    pub const BUSY: &'static [VmSnapshotState] = &[
        VmSnapshotState::Allocated,
        VmSnapshotState::Creating,
        VmSnapshotState::Expunging,
        VmSnapshotState::Reverting,
    ];

    pub const TRANSITIONAL: &'static [VmSnapshotState] = &[
        VmSnapshotState::Allocated,
        VmSnapshotState::Creating,
        VmSnapshotState::Expunging,
        VmSnapshotState::Reverting,
    ];

    pub fn is_transitional(self) -> bool {
        Self::TRANSITIONAL.contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        self == VmSnapshotState::Expunged
    }
}

impl fmt::Display for VmSnapshotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VmSnapshotEvent {
    CreateRequested,
    RevertRequested,
    ExpungeRequested,
    OperationSucceeded,
    OperationFailed,
}

impl fmt::Display for VmSnapshotEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

use VmSnapshotEvent as Ev;
use VmSnapshotState as St;

const VM_SNAPSHOT_TRANSITIONS: &[Transition<VmSnapshotState, VmSnapshotEvent>] = &[
    Transition::new(St::Allocated, Ev::CreateRequested, St::Creating),
    // an allocation whose job never ran
    Transition::new(St::Allocated, Ev::OperationFailed, St::Error),
    Transition::usage(St::Creating, Ev::OperationSucceeded, St::Ready),
    Transition::new(St::Creating, Ev::OperationFailed, St::Error),
    Transition::new(St::Ready, Ev::RevertRequested, St::Reverting),
    Transition::new(St::Reverting, Ev::OperationSucceeded, St::Ready),
    Transition::new(St::Reverting, Ev::OperationFailed, St::Ready),
    Transition::new(St::Ready, Ev::ExpungeRequested, St::Expunging),
    Transition::new(St::Error, Ev::ExpungeRequested, St::Expunging),
    Transition::new(St::Expunging, Ev::ExpungeRequested, St::Expunging),
    Transition::usage(St::Expunging, Ev::OperationSucceeded, St::Expunged),
    Transition::new(St::Expunging, Ev::OperationFailed, St::Error),
    Transition::new(St::Expunged, Ev::ExpungeRequested, St::Expunged),
    Transition::new(St::Expunged, Ev::OperationSucceeded, St::Expunged),
    Transition::new(St::Expunged, Ev::OperationFailed, St::Expunged),
];

static VM_SNAPSHOT_MACHINE: LazyLock<StateMachine<VmSnapshotState, VmSnapshotEvent>> =
    LazyLock::new(|| StateMachine::from_table("vm-snapshot", VM_SNAPSHOT_TRANSITIONS));

/// The VM snapshot lifecycle table.
pub fn vm_snapshot_machine() -> &'static StateMachine<VmSnapshotState, VmSnapshotEvent> {
    &VM_SNAPSHOT_MACHINE
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestrationError;

    #[test]
    fn happy_path_walks_create_then_expunge() {
        let machine = vm_snapshot_machine();
        let mut state = St::Allocated;
        for event in [
            Ev::CreateRequested,
            Ev::OperationSucceeded,
            Ev::ExpungeRequested,
            Ev::OperationSucceeded,
        ] {
            state = machine.next_state(state, event).unwrap();
        }
        assert_eq!(state, St::Expunged);
    }

    #[test]
    fn revert_failure_returns_to_ready() {
        let machine = vm_snapshot_machine();
        assert_eq!(
            machine.next_state(St::Reverting, Ev::OperationFailed).unwrap(),
            St::Ready
        );
    }

    #[test]
    fn expunged_is_idempotent() {
        let machine = vm_snapshot_machine();
        assert_eq!(
            machine.next_state(St::Expunged, Ev::OperationSucceeded).unwrap(),
            St::Expunged
        );
        assert_eq!(
            machine.next_state(St::Expunged, Ev::OperationFailed).unwrap(),
            St::Expunged
        );
    }

    #[test]
    fn revert_from_error_is_rejected() {
        let err = vm_snapshot_machine()
            .transition(St::Error, Ev::RevertRequested)
            .unwrap_err();
        assert_eq!(
            err,
            OrchestrationError::NoTransition {
                machine: "vm-snapshot".into(),
                state: "Error".into(),
                event: "RevertRequested".into(),
            }
        );
    }

    #[test]
    fn state_display() {
        assert_eq!(St::Reverting.to_string(), "Reverting");
        assert_eq!(Ev::ExpungeRequested.to_string(), "ExpungeRequested");
    }
}
