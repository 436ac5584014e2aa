use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};

use super::{OperationPhase, OperationTrace, Orchestrate, Services, compensate, dispatch, encode};
use crate::backend::SnapshotBackend;
use crate::context::CallContext;
use crate::error::{OrchestrationError, Result};
use crate::guard::LifecycleGuard;
use crate::model::{
    Entity, EntityKind, OwnerRef, PowerState, VirtualMachine, VmSnapshot, VmSnapshotType,
};
use crate::policy::Operation;
use crate::state_machine::{VmSnapshotEvent, VmSnapshotState};
use crate::store::EntityStore;
use crate::work_queue::Claim;

pub const VM_SNAPSHOT_DISPATCHER: &str = "VmSnapshotWork";

/// States a snapshot can be deleted from. `Expunging` lets a failed or
/// interrupted delete be retried.
const DELETABLE: &[VmSnapshotState] = &[
    VmSnapshotState::Ready,
    VmSnapshotState::Error,
    VmSnapshotState::Expunging,
];

/// Parameters of a new VM snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateVmSnapshot {
    pub name: String,
    pub description: Option<String>,
    pub snapshot_type: VmSnapshotType,
    /// Ask the guest agent to flush file systems first.
    pub quiesce: bool,
}

impl CreateVmSnapshot {
    pub fn disk(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            snapshot_type: VmSnapshotType::Disk,
            quiesce: false,
        }
    }

    pub fn with_memory(mut self) -> Self {
        self.snapshot_type = VmSnapshotType::DiskAndMemory;
        self
    }

    pub fn quiesced(mut self) -> Self {
        self.quiesce = true;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum VmSnapshotWork {
    Create { snapshot_id: u64, quiesce: bool },
    Delete { snapshot_id: u64 },
    Revert { snapshot_id: u64 },
    DeleteAll { vm_id: u64 },
}

/// Create, delete and revert VM snapshots, serialized per VM.
#[derive(Clone)]
pub struct VmSnapshotOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    services: Services,
    guard: LifecycleGuard<VmSnapshot>,
    backend: Arc<dyn SnapshotBackend>,
}

impl VmSnapshotOrchestrator {
    pub fn new(
        services: Services,
        snapshots: Arc<dyn EntityStore<VmSnapshot>>,
        backend: Arc<dyn SnapshotBackend>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                services,
                guard: LifecycleGuard::new(snapshots),
                backend,
            }),
        }
    }

    pub fn snapshots(&self) -> &dyn EntityStore<VmSnapshot> {
        self.inner.guard.store()
    }

    fn services(&self) -> &Services {
        &self.inner.services
    }

    /// The VM must exist, be accessible to the caller and sit in Running or
    /// Stopped.
    fn usable_vm(&self, ctx: &CallContext, vm_id: u64) -> Result<VirtualMachine> {
        let vm = self.accessible_vm(ctx, vm_id)?;
        if !matches!(vm.power_state, PowerState::Running | PowerState::Stopped) {
            return Err(OrchestrationError::InvalidParameter(format!(
                "vm {vm_id} is {}, snapshots need it Running or Stopped",
                vm.power_state
            )));
        }
        Ok(vm)
    }

    fn accessible_vm(&self, ctx: &CallContext, vm_id: u64) -> Result<VirtualMachine> {
        let vm = self.services().find_vm(vm_id)?;
        self.services()
            .access
            .check_access(ctx.principal(), vm.account_id, &format!("vm {vm_id}"))?;
        Ok(vm)
    }

    /// Take a snapshot of `vm_id`. Returns the snapshot once it is Ready.
    #[instrument(skip(self, ctx, request), fields(name = %request.name))]
    pub async fn create(
        &self,
        ctx: &CallContext,
        vm_id: u64,
        request: CreateVmSnapshot,
    ) -> Result<VmSnapshot> {
        let mut trace = OperationTrace::start("create vm snapshot", OwnerRef::vm(vm_id));
        let result = self.try_create(ctx, vm_id, request, &mut trace).await;
        trace.finish(result)
    }

    async fn try_create(
        &self,
        ctx: &CallContext,
        vm_id: u64,
        request: CreateVmSnapshot,
        trace: &mut OperationTrace,
    ) -> Result<VmSnapshot> {
        trace.enter(OperationPhase::Validating);
        let services = self.services();
        let vm = self.usable_vm(ctx, vm_id)?;
        let hypervisor = vm.hypervisor.to_string();
        services.capabilities.require(&hypervisor, Operation::VmSnapshot)?;
        if request.snapshot_type == VmSnapshotType::DiskAndMemory {
            services.capabilities.require(&hypervisor, Operation::VmSnapshotMemory)?;
            if vm.power_state != PowerState::Running {
                return Err(OrchestrationError::InvalidParameter(format!(
                    "memory snapshot of vm {vm_id} needs it Running"
                )));
            }
        }
        let name = request.name.trim().to_string();
        if name.is_empty() {
            return Err(OrchestrationError::InvalidParameter(
                "snapshot name must not be empty".into(),
            ));
        }

        let owner = OwnerRef::vm(vm_id);
        let claim = Claim::new(owner, EntityKind::VmSnapshot, VM_SNAPSHOT_DISPATCHER);
        let guard = &self.inner.guard;
        let store = self.snapshots();
        let limit = services.config.max_snapshots_per_vm;
        dispatch(self, services, ctx, claim, trace, |active| {
            guard.ensure_idle(owner, active, VmSnapshot::busy_states(), None)?;
            let existing: Vec<VmSnapshot> = store
                .list_by_owner(owner)
                .into_iter()
                .filter(|snapshot| !snapshot.state().is_terminal())
                .collect();
            if existing.iter().any(|snapshot| snapshot.name == name) {
                return Err(OrchestrationError::InvalidParameter(format!(
                    "vm {vm_id} already has a snapshot named {name}"
                )));
            }
            if existing.len() >= limit {
                return Err(OrchestrationError::ResourceLimitExceeded(format!(
                    "vm {vm_id} already has {limit} snapshots"
                )));
            }

            let mut snapshot = VmSnapshot::new(vm_id, vm.account_id, name, request.snapshot_type);
            snapshot.description = request.description;
            snapshot.parent_id = existing.iter().find(|s| s.current).map(|s| s.id);
            let snapshot = store.persist(snapshot);
            debug!(snapshot = snapshot.id, vm = vm_id, "snapshot allocated");
            Ok(VmSnapshotWork::Create {
                snapshot_id: snapshot.id,
                quiesce: request.quiesce,
            })
        })
        .await
    }

    /// Delete a snapshot. Deleting an expunged snapshot succeeds without
    /// doing anything.
    pub async fn delete(&self, ctx: &CallContext, snapshot_id: u64) -> Result<bool> {
        let snapshot = self.inner.guard.find(snapshot_id)?;
        let mut trace = OperationTrace::start("delete vm snapshot", snapshot.owner());
        let result = self.try_delete(ctx, snapshot, &mut trace).await;
        trace.finish(result)
    }

    async fn try_delete(
        &self,
        ctx: &CallContext,
        snapshot: VmSnapshot,
        trace: &mut OperationTrace,
    ) -> Result<bool> {
        trace.enter(OperationPhase::Validating);
        self.accessible_vm(ctx, snapshot.vm_id)?;
        if snapshot.state() == VmSnapshotState::Expunged {
            return Ok(true);
        }
        let snapshot_id = snapshot.id;
        let guard = &self.inner.guard;
        guard.guard(snapshot_id, DELETABLE, "delete")?;

        let owner = snapshot.owner();
        let claim =
            Claim::new(owner, EntityKind::VmSnapshot, VM_SNAPSHOT_DISPATCHER).entity(snapshot_id);
        dispatch(self, self.services(), ctx, claim, trace, |active| {
            guard.ensure_idle(owner, active, VmSnapshot::busy_states(), Some(snapshot_id))?;
            Ok(VmSnapshotWork::Delete { snapshot_id })
        })
        .await
    }

    /// Revert the VM to `snapshot_id`. Returns the VM with its new power
    /// state.
    pub async fn revert(&self, ctx: &CallContext, snapshot_id: u64) -> Result<VirtualMachine> {
        let snapshot = self.inner.guard.find(snapshot_id)?;
        let mut trace = OperationTrace::start("revert to vm snapshot", snapshot.owner());
        let result = self.try_revert(ctx, snapshot, &mut trace).await;
        trace.finish(result)
    }

    async fn try_revert(
        &self,
        ctx: &CallContext,
        snapshot: VmSnapshot,
        trace: &mut OperationTrace,
    ) -> Result<VirtualMachine> {
        trace.enter(OperationPhase::Validating);
        let vm = self.usable_vm(ctx, snapshot.vm_id)?;
        self.services()
            .capabilities
            .require(&vm.hypervisor.to_string(), Operation::VmSnapshotRevert)?;
        let snapshot_id = snapshot.id;
        let guard = &self.inner.guard;
        guard.guard(snapshot_id, &[VmSnapshotState::Ready], "revert")?;

        let owner = snapshot.owner();
        let claim =
            Claim::new(owner, EntityKind::VmSnapshot, VM_SNAPSHOT_DISPATCHER).entity(snapshot_id);
        dispatch(self, self.services(), ctx, claim, trace, |active| {
            guard.ensure_idle(owner, active, VmSnapshot::busy_states(), None)?;
            guard.guard(snapshot_id, &[VmSnapshotState::Ready], "revert")?;
            Ok(VmSnapshotWork::Revert { snapshot_id })
        })
        .await
    }

    /// Delete every Ready or Error snapshot of `vm_id` in one job. Returns
    /// how many were deleted.
    pub async fn delete_all(&self, ctx: &CallContext, vm_id: u64) -> Result<usize> {
        let mut trace = OperationTrace::start("delete all vm snapshots", OwnerRef::vm(vm_id));
        let result = self.try_delete_all(ctx, vm_id, &mut trace).await;
        trace.finish(result)
    }

    async fn try_delete_all(
        &self,
        ctx: &CallContext,
        vm_id: u64,
        trace: &mut OperationTrace,
    ) -> Result<usize> {
        trace.enter(OperationPhase::Validating);
        self.accessible_vm(ctx, vm_id)?;
        let owner = OwnerRef::vm(vm_id);
        let claim = Claim::new(owner, EntityKind::VmSnapshot, VM_SNAPSHOT_DISPATCHER);
        let guard = &self.inner.guard;
        dispatch(self, self.services(), ctx, claim, trace, |active| {
            guard.ensure_idle(owner, active, VmSnapshot::busy_states(), None)?;
            Ok(VmSnapshotWork::DeleteAll { vm_id })
        })
        .await
    }

    async fn run_create(&self, snapshot_id: u64, quiesce: bool) -> Result<VmSnapshot> {
        let store = self.snapshots();
        let driver = &self.services().driver;
        let snapshot = self
            .inner
            .guard
            .guard(snapshot_id, &[VmSnapshotState::Allocated], "create")?;
        let creating = driver.drive(store, &snapshot, VmSnapshotEvent::CreateRequested)?;

        let taken = match self.services().find_vm(creating.vm_id) {
            Ok(vm) => self.inner.backend.take_snapshot(&vm, &creating, quiesce).await,
            Err(err) => Err(err),
        };
        let info = match taken {
            Ok(info) => info,
            Err(err) => {
                compensate(driver, store, snapshot_id, VmSnapshotEvent::OperationFailed);
                return Err(err);
            }
        };

        let mut ready = driver.drive(store, &creating, VmSnapshotEvent::OperationSucceeded)?;
        ready.size_bytes = info.size_bytes;
        self.make_current(&mut ready);
        Ok(ready)
    }

    async fn run_delete(&self, snapshot_id: u64) -> Result<bool> {
        let store = self.snapshots();
        let driver = &self.services().driver;
        let snapshot = self.inner.guard.find(snapshot_id)?;
        if snapshot.state() == VmSnapshotState::Expunged {
            return Ok(true);
        }
        let snapshot = self.inner.guard.guard(snapshot_id, DELETABLE, "delete")?;
        let expunging = driver.drive(store, &snapshot, VmSnapshotEvent::ExpungeRequested)?;

        let deleted = match self.services().find_vm(expunging.vm_id) {
            Ok(vm) => self.inner.backend.delete_snapshot(&vm, &expunging).await,
            Err(err) => Err(err),
        };
        if let Err(err) = deleted {
            compensate(driver, store, snapshot_id, VmSnapshotEvent::OperationFailed);
            return Err(err);
        }

        let gone = driver.drive(store, &expunging, VmSnapshotEvent::OperationSucceeded)?;
        self.unlink(gone);
        Ok(true)
    }

    async fn run_revert(&self, snapshot_id: u64) -> Result<VirtualMachine> {
        let store = self.snapshots();
        let driver = &self.services().driver;
        let snapshot = self
            .inner
            .guard
            .guard(snapshot_id, &[VmSnapshotState::Ready], "revert")?;
        let vm = self.services().find_vm(snapshot.vm_id)?;
        let reverting = driver.drive(store, &snapshot, VmSnapshotEvent::RevertRequested)?;

        let power = match self.inner.backend.revert_to_snapshot(&vm, &reverting).await {
            Ok(power) => power,
            Err(err) => {
                compensate(driver, store, snapshot_id, VmSnapshotEvent::OperationFailed);
                return Err(err);
            }
        };

        let mut ready = driver.drive(store, &reverting, VmSnapshotEvent::OperationSucceeded)?;
        self.make_current(&mut ready);
        self.services().inventory.update_power_state(vm.id, power);
        self.services().find_vm(vm.id)
    }

    async fn run_delete_all(&self, ctx: &CallContext, vm_id: u64) -> Result<usize> {
        let mut targets: Vec<VmSnapshot> = self
            .snapshots()
            .list_by_owner(OwnerRef::vm(vm_id))
            .into_iter()
            .filter(|snapshot| {
                matches!(snapshot.state(), VmSnapshotState::Ready | VmSnapshotState::Error)
            })
            .collect();
        // Newest first so children go before their parents.
        targets.sort_by(|a, b| b.id.cmp(&a.id));

        let mut deleted = 0;
        for snapshot in targets {
            if self.delete(ctx, snapshot.id).await? {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Mark `snapshot` as the one the VM is based on and persist it.
    fn make_current(&self, snapshot: &mut VmSnapshot) {
        let store = self.snapshots();
        for mut other in store.list_by_owner(OwnerRef::vm(snapshot.vm_id)) {
            if other.current && other.id != snapshot.id {
                other.current = false;
                store.update(&other);
            }
        }
        snapshot.current = true;
        store.update(snapshot);
    }

    /// Take an expunged snapshot out of the VM's snapshot tree.
    fn unlink(&self, mut gone: VmSnapshot) {
        let store = self.snapshots();
        for mut child in store.list_by_owner(gone.owner()) {
            if child.parent_id == Some(gone.id) {
                child.parent_id = gone.parent_id;
                store.update(&child);
            }
        }
        if gone.current {
            if let Some(mut parent) = gone.parent_id.and_then(|id| store.find_by_id(id)) {
                parent.current = true;
                store.update(&parent);
            }
            gone.current = false;
            store.update(&gone);
        }
    }
}

#[async_trait]
impl Orchestrate for VmSnapshotOrchestrator {
    type Work = VmSnapshotWork;

    const DISPATCHER: &'static str = VM_SNAPSHOT_DISPATCHER;

    async fn execute(&self, ctx: &CallContext, work: VmSnapshotWork) -> Result<Value> {
        match work {
            VmSnapshotWork::Create {
                snapshot_id,
                quiesce,
            } => encode(&self.run_create(snapshot_id, quiesce).await?),
            VmSnapshotWork::Delete { snapshot_id } => encode(&self.run_delete(snapshot_id).await?),
            VmSnapshotWork::Revert { snapshot_id } => encode(&self.run_revert(snapshot_id).await?),
            VmSnapshotWork::DeleteAll { vm_id } => encode(&self.run_delete_all(ctx, vm_id).await?),
        }
    }

    async fn abandon(&self, work: VmSnapshotWork) {
        let snapshot_id = match work {
            VmSnapshotWork::Create { snapshot_id, .. }
            | VmSnapshotWork::Delete { snapshot_id }
            | VmSnapshotWork::Revert { snapshot_id } => snapshot_id,
            // Each inline delete settles its own snapshot.
            VmSnapshotWork::DeleteAll { .. } => return,
        };
        compensate(
            &self.services().driver,
            self.snapshots(),
            snapshot_id,
            VmSnapshotEvent::OperationFailed,
        );
    }
}
