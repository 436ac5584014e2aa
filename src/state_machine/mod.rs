mod driver;
mod state;
mod vm_snapshot;
mod volume;

pub use driver::{StateDriver, TransitionListener, TransitionRecord, UsageRecorder};
pub use state::{Impact, StateMachine, Symbol, Transition};
pub use vm_snapshot::{VmSnapshotEvent, VmSnapshotState, vm_snapshot_machine};
pub use volume::{VolumeEvent, VolumeState, volume_machine};
