use std::fmt;
use std::sync::LazyLock;

use serde::{Deserialize, Serialize};

use super::state::{StateMachine, Transition};

/// Lifecycle states of a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeState {
    /// Recorded, not yet created on primary storage.
    Allocated,
    Creating,
    Ready,
    Resizing,
    Migrating,
    Copying,
    /// Uploaded to secondary storage, waiting to be copied to a pool.
    Uploaded,
    Snapshotting,
    RevertSnapshotting,
    Attaching,
    /// Destroyed by the user but still recoverable.
    Destroy,
    Expunging,
    Expunged,
    NotUploaded,
    UploadInProgress,
    UploadError,
    UploadAbandoned,
}

impl VolumeState {
    /// States an operation is actively working on.
    pub const TRANSITIONAL: &'static [VolumeState] = &[
        VolumeState::Creating,
        VolumeState::Resizing,
        VolumeState::Migrating,
        VolumeState::Copying,
        VolumeState::Snapshotting,
        VolumeState::RevertSnapshotting,
        VolumeState::Attaching,
        VolumeState::Expunging,
        VolumeState::UploadInProgress,
        VolumeState::NotUploaded,
    ];

    pub fn is_transitional(self) -> bool {
        Self::TRANSITIONAL.contains(&self)
    }

    pub fn is_terminal(self) -> bool {
        self == VolumeState::Expunged
    }

    /// Upload states resolve through `OperationTimeout` when nothing is known.
    pub fn is_upload(self) -> bool {
        matches!(self, VolumeState::NotUploaded | VolumeState::UploadInProgress)
    }
}

impl fmt::Display for VolumeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Events that drive a volume through its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VolumeEvent {
    CreateRequested,
    CopyRequested,
    ResizeRequested,
    MigrationRequested,
    SnapshotRequested,
    RevertSnapshotRequested,
    AttachRequested,
    UploadRequested,
    DestroyRequested,
    RecoverRequested,
    ExpungingRequested,
    OperationRetry,
    OperationSucceeded,
    OperationFailed,
    OperationTimeout,
}

impl fmt::Display for VolumeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

use VolumeEvent as Ev;
use VolumeState as St;

const VOLUME_TRANSITIONS: &[Transition<VolumeState, VolumeEvent>] = &[
    // creation
    Transition::new(St::Allocated, Ev::CreateRequested, St::Creating),
    Transition::new(St::Allocated, Ev::DestroyRequested, St::Destroy),
    Transition::new(St::Creating, Ev::OperationRetry, St::Creating),
    Transition::new(St::Creating, Ev::CreateRequested, St::Creating),
    Transition::new(St::Creating, Ev::OperationFailed, St::Allocated),
    Transition::usage(St::Creating, Ev::OperationSucceeded, St::Ready),
    Transition::new(St::Creating, Ev::DestroyRequested, St::Destroy),
    // upload
    Transition::new(St::NotUploaded, Ev::UploadRequested, St::UploadInProgress),
    Transition::new(St::NotUploaded, Ev::OperationTimeout, St::UploadAbandoned),
    Transition::new(St::NotUploaded, Ev::DestroyRequested, St::Destroy),
    Transition::new(St::UploadInProgress, Ev::OperationSucceeded, St::Uploaded),
    Transition::new(St::UploadInProgress, Ev::OperationFailed, St::UploadError),
    Transition::new(St::UploadInProgress, Ev::OperationTimeout, St::UploadError),
    Transition::new(St::UploadError, Ev::DestroyRequested, St::Destroy),
    Transition::new(St::UploadAbandoned, Ev::DestroyRequested, St::Destroy),
    Transition::new(St::Uploaded, Ev::CopyRequested, St::Copying),
    Transition::new(St::Uploaded, Ev::DestroyRequested, St::Destroy),
    Transition::usage(St::Copying, Ev::OperationSucceeded, St::Ready),
    Transition::new(St::Copying, Ev::OperationFailed, St::Uploaded),
    // operations on a ready volume
    Transition::new(St::Ready, Ev::ResizeRequested, St::Resizing),
    Transition::usage(St::Resizing, Ev::OperationSucceeded, St::Ready),
    Transition::new(St::Resizing, Ev::OperationFailed, St::Ready),
    Transition::new(St::Ready, Ev::MigrationRequested, St::Migrating),
    Transition::new(St::Migrating, Ev::OperationSucceeded, St::Ready),
    Transition::new(St::Migrating, Ev::OperationFailed, St::Ready),
    Transition::new(St::Ready, Ev::SnapshotRequested, St::Snapshotting),
    Transition::new(St::Snapshotting, Ev::OperationSucceeded, St::Ready),
    Transition::new(St::Snapshotting, Ev::OperationFailed, St::Ready),
    Transition::new(St::Ready, Ev::RevertSnapshotRequested, St::RevertSnapshotting),
    Transition::new(St::RevertSnapshotting, Ev::OperationSucceeded, St::Ready),
    Transition::new(St::RevertSnapshotting, Ev::OperationFailed, St::Ready),
    Transition::new(St::Ready, Ev::AttachRequested, St::Attaching),
    Transition::new(St::Attaching, Ev::OperationSucceeded, St::Ready),
    Transition::new(St::Attaching, Ev::OperationFailed, St::Ready),
    // destruction
    Transition::usage(St::Ready, Ev::DestroyRequested, St::Destroy),
    Transition::new(St::Destroy, Ev::OperationSucceeded, St::Destroy),
    Transition::new(St::Destroy, Ev::OperationFailed, St::Destroy),
    Transition::usage(St::Destroy, Ev::RecoverRequested, St::Ready),
    Transition::new(St::Destroy, Ev::ExpungingRequested, St::Expunging),
    Transition::new(St::Expunging, Ev::ExpungingRequested, St::Expunging),
    Transition::usage(St::Expunging, Ev::OperationSucceeded, St::Expunged),
    Transition::new(St::Expunging, Ev::OperationFailed, St::Destroy),
    // terminal self-loops so late completion signals are no-ops
    Transition::new(St::Expunged, Ev::ExpungingRequested, St::Expunged),
    Transition::new(St::Expunged, Ev::OperationSucceeded, St::Expunged),
    Transition::new(St::Expunged, Ev::OperationFailed, St::Expunged),
];

static VOLUME_MACHINE: LazyLock<StateMachine<VolumeState, VolumeEvent>> =
    LazyLock::new(|| StateMachine::from_table("volume", VOLUME_TRANSITIONS));

/// The volume lifecycle table.
pub fn volume_machine() -> &'static StateMachine<VolumeState, VolumeEvent> {
    &VOLUME_MACHINE
}
