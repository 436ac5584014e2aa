//! Domain entities whose lifecycle is governed by a state machine.
//!
//! An entity's state lives in a [`Lifecycle`] cell. Only the crate's stores
//! advance it, and only after a transition was looked up in the entity's table.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state_machine::{
    StateMachine, Symbol, VmSnapshotEvent, VmSnapshotState, VolumeEvent, VolumeState,
    vm_snapshot_machine, volume_machine,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Volume,
    VmSnapshot,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Volume => write!(f, "volume"),
            EntityKind::VmSnapshot => write!(f, "vm snapshot"),
        }
    }
}

/// Kind of resource used as a serialization key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ResourceKind {
    Vm,
    Volume,
}

/// The owning resource whose id serializes conflicting work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerRef {
    pub kind: ResourceKind,
    pub id: u64,
}

impl OwnerRef {
    pub fn vm(id: u64) -> Self {
        Self {
            kind: ResourceKind::Vm,
            id,
        }
    }

    pub fn volume(id: u64) -> Self {
        Self {
            kind: ResourceKind::Volume,
            id,
        }
    }
}

impl fmt::Display for OwnerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ResourceKind::Vm => write!(f, "vm-{}", self.id),
            ResourceKind::Volume => write!(f, "volume-{}", self.id),
        }
    }
}

/// The acting principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub id: u64,
    pub name: String,
    pub admin: bool,
}

impl Account {
    pub fn user(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            admin: false,
        }
    }

    pub fn admin(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            admin: true,
        }
    }

    /// The principal background passes act as.
    pub fn system() -> Self {
        Self::admin(0, "system")
    }
}

/// Current state plus bookkeeping for optimistic concurrency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lifecycle<S> {
    state: S,
    update_count: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<S: Copy> Lifecycle<S> {
    pub fn new(state: S) -> Self {
        let now = Utc::now();
        Self {
            state,
            update_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn state(&self) -> S {
        self.state
    }

    pub fn update_count(&self) -> u64 {
        self.update_count
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub(crate) fn advance(&mut self, to: S) {
        self.state = to;
        self.update_count += 1;
        self.updated_at = Utc::now();
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, by: chrono::Duration) {
        self.updated_at = self.updated_at - by;
    }
}

/// A domain object whose state only changes through its state machine.
pub trait Entity: Clone + fmt::Debug + Serialize + Send + Sync + 'static {
    type State: Symbol + Serialize;
    type Event: Symbol;

    const KIND: EntityKind;

    fn id(&self) -> u64;

    fn assign_id(&mut self, id: u64);

    fn owner(&self) -> OwnerRef;

    fn lifecycle(&self) -> &Lifecycle<Self::State>;

    fn lifecycle_mut(&mut self) -> &mut Lifecycle<Self::State>;

    fn machine() -> &'static StateMachine<Self::State, Self::Event>;

    /// States that block new work of the same kind on the owner.
    fn busy_states() -> &'static [Self::State];

    /// States an in-flight operation leaves behind if it never finishes.
    fn transitional_states() -> &'static [Self::State];

    fn state(&self) -> Self::State {
        self.lifecycle().state()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeFormat {
    Raw,
    Qcow2,
    Vhd,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: u64,
    pub name: String,
    pub account_id: u64,
    pub size_bytes: u64,
    pub format: VolumeFormat,
    pub pool_id: Option<u64>,
    /// VM the volume is attached to.
    pub instance_id: Option<u64>,
    lifecycle: Lifecycle<VolumeState>,
}

impl Volume {
    pub fn new(
        name: impl Into<String>,
        account_id: u64,
        size_bytes: u64,
        format: VolumeFormat,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            account_id,
            size_bytes,
            format,
            pool_id: None,
            instance_id: None,
            lifecycle: Lifecycle::new(VolumeState::Allocated),
        }
    }

    /// A volume whose content will be uploaded by the user.
    pub fn for_upload(name: impl Into<String>, account_id: u64, format: VolumeFormat) -> Self {
        Self {
            lifecycle: Lifecycle::new(VolumeState::NotUploaded),
            ..Self::new(name, account_id, 0, format)
        }
    }

    pub fn attached_to(mut self, vm_id: u64) -> Self {
        self.instance_id = Some(vm_id);
        self
    }
}

impl Entity for Volume {
    type State = VolumeState;
    type Event = VolumeEvent;

    const KIND: EntityKind = EntityKind::Volume;

    fn id(&self) -> u64 {
        self.id
    }

    fn assign_id(&mut self, id: u64) {
        self.id = id;
    }

    fn owner(&self) -> OwnerRef {
        match self.instance_id {
            Some(vm) => OwnerRef::vm(vm),
            None => OwnerRef::volume(self.id),
        }
    }

    fn lifecycle(&self) -> &Lifecycle<VolumeState> {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle<VolumeState> {
        &mut self.lifecycle
    }

    fn machine() -> &'static StateMachine<VolumeState, VolumeEvent> {
        volume_machine()
    }

    fn busy_states() -> &'static [VolumeState] {
        VolumeState::TRANSITIONAL
    }

    fn transitional_states() -> &'static [VolumeState] {
        VolumeState::TRANSITIONAL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VmSnapshotType {
    Disk,
    DiskAndMemory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSnapshot {
    pub id: u64,
    pub vm_id: u64,
    pub account_id: u64,
    pub name: String,
    pub description: Option<String>,
    pub snapshot_type: VmSnapshotType,
    /// The snapshot the VM is currently based on.
    pub current: bool,
    pub parent_id: Option<u64>,
    pub size_bytes: u64,
    lifecycle: Lifecycle<VmSnapshotState>,
}

impl VmSnapshot {
    pub fn new(
        vm_id: u64,
        account_id: u64,
        name: impl Into<String>,
        snapshot_type: VmSnapshotType,
    ) -> Self {
        Self {
            id: 0,
            vm_id,
            account_id,
            name: name.into(),
            description: None,
            snapshot_type,
            current: false,
            parent_id: None,
            size_bytes: 0,
            lifecycle: Lifecycle::new(VmSnapshotState::Allocated),
        }
    }
}

impl Entity for VmSnapshot {
    type State = VmSnapshotState;
    type Event = VmSnapshotEvent;

    const KIND: EntityKind = EntityKind::VmSnapshot;

    fn id(&self) -> u64 {
        self.id
    }

    fn assign_id(&mut self, id: u64) {
        self.id = id;
    }

    fn owner(&self) -> OwnerRef {
        OwnerRef::vm(self.vm_id)
    }

    fn lifecycle(&self) -> &Lifecycle<VmSnapshotState> {
        &self.lifecycle
    }

    fn lifecycle_mut(&mut self) -> &mut Lifecycle<VmSnapshotState> {
        &mut self.lifecycle
    }

    fn machine() -> &'static StateMachine<VmSnapshotState, VmSnapshotEvent> {
        vm_snapshot_machine()
    }

    fn busy_states() -> &'static [VmSnapshotState] {
        VmSnapshotState::BUSY
    }

    fn transitional_states() -> &'static [VmSnapshotState] {
        VmSnapshotState::TRANSITIONAL
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PowerState {
    Running,
    Stopped,
    Starting,
    Stopping,
    Migrating,
    Destroyed,
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HypervisorType {
    Kvm,
    VMware,
    XenServer,
    Simulator,
}

impl fmt::Display for HypervisorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HypervisorType::Kvm => write!(f, "kvm"),
            HypervisorType::VMware => write!(f, "vmware"),
            HypervisorType::XenServer => write!(f, "xenserver"),
            HypervisorType::Simulator => write!(f, "simulator"),
        }
    }
}

/// The owning resource for snapshot and attached-volume work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachine {
    pub id: u64,
    pub name: String,
    pub account_id: u64,
    pub power_state: PowerState,
    pub hypervisor: HypervisorType,
}

impl VirtualMachine {
    pub fn new(
        id: u64,
        name: impl Into<String>,
        account_id: u64,
        hypervisor: HypervisorType,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            account_id,
            power_state: PowerState::Running,
            hypervisor,
        }
    }
}
