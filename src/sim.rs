//! An in-process hypervisor and a fully wired cloud on top of the in-memory
//! stores. Used by the `demo` command and by tests.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::time::sleep;
use tracing::debug;

use crate::backend::{SnapshotBackend, SnapshotInfo, VolumeBackend};
use crate::config::OrchestratorConfig;
use crate::error::{OrchestrationError, Result};
use crate::model::{
    EntityKind, HypervisorType, PowerState, VirtualMachine, VmSnapshot, VmSnapshotType, Volume,
};
use crate::orchestrator::{Services, VmSnapshotOrchestrator, VolumeOrchestrator};
use crate::reconcile::{ProbeOutcome, Reconciler, SyncProbe};
use crate::state_machine::{StateDriver, UsageRecorder};
use crate::store::{MemoryInventory, MemoryStore, VmInventory};
use crate::work_queue::{QueueSettings, WorkQueue};

const MEMORY_IMAGE_BYTES: u64 = 2 << 30;
const DISK_DELTA_BYTES: u64 = 512 << 20;

/// Downstream calls that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SimOp {
    TakeSnapshot,
    DeleteSnapshot,
    RevertSnapshot,
    CreateVolume,
    ResizeVolume,
    MigrateVolume,
    ExpungeVolume,
}

impl fmt::Display for SimOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Hypervisor and storage agent with failure injection.
///
/// While held, every downstream call parks until [`release`](Self::release).
pub struct SimulatedHypervisor {
    latency: Duration,
    fail_next: Mutex<HashSet<SimOp>>,
    gate: Mutex<Option<Arc<Semaphore>>>,
    probes: Mutex<HashMap<(EntityKind, u64), ProbeOutcome>>,
    calls: Mutex<Vec<String>>,
    default_pool: AtomicU64,
}

impl Default for SimulatedHypervisor {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            fail_next: Mutex::new(HashSet::new()),
            gate: Mutex::new(None),
            probes: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            default_pool: AtomicU64::new(1),
        }
    }
}

impl SimulatedHypervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next call of `op` with an execution error.
    pub fn fail_next(&self, op: SimOp) {
        lock(&self.fail_next).insert(op);
    }

    pub fn hold(&self) {
        *lock(&self.gate) = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self) {
        if let Some(gate) = lock(&self.gate).take() {
            gate.close();
        }
    }

    /// What the reconciliation probe reports for an entity.
    pub fn set_probe(&self, kind: EntityKind, id: u64, outcome: ProbeOutcome) {
        lock(&self.probes).insert((kind, id), outcome);
    }

    /// Pool that new volumes land on.
    pub fn set_default_pool(&self, pool_id: u64) {
        self.default_pool.store(pool_id, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    async fn call(&self, op: SimOp, subject: String) -> Result<()> {
        lock(&self.calls).push(format!("{op} {subject}"));
        let gate = lock(&self.gate).clone();
        if let Some(gate) = gate {
            // Resolves with an error once the gate is closed.
            let _ = gate.acquire().await;
        }
        if !self.latency.is_zero() {
            sleep(self.latency).await;
        }
        if lock(&self.fail_next).remove(&op) {
            debug!(%op, subject = %subject, "injected failure");
            return Err(OrchestrationError::Execution(format!(
                "simulated {op} failure on {subject}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SnapshotBackend for SimulatedHypervisor {
    async fn take_snapshot(
        &self,
        vm: &VirtualMachine,
        snapshot: &VmSnapshot,
        _quiesce: bool,
    ) -> Result<SnapshotInfo> {
        self.call(SimOp::TakeSnapshot, format!("vm-{}/{}", vm.id, snapshot.name)).await?;
        let size_bytes = match snapshot.snapshot_type {
            VmSnapshotType::Disk => DISK_DELTA_BYTES,
            VmSnapshotType::DiskAndMemory => DISK_DELTA_BYTES + MEMORY_IMAGE_BYTES,
        };
        Ok(SnapshotInfo { size_bytes })
    }

    async fn delete_snapshot(&self, vm: &VirtualMachine, snapshot: &VmSnapshot) -> Result<()> {
        self.call(SimOp::DeleteSnapshot, format!("vm-{}/{}", vm.id, snapshot.name)).await
    }

    async fn revert_to_snapshot(
        &self,
        vm: &VirtualMachine,
        snapshot: &VmSnapshot,
    ) -> Result<PowerState> {
        self.call(SimOp::RevertSnapshot, format!("vm-{}/{}", vm.id, snapshot.name)).await?;
        Ok(match snapshot.snapshot_type {
            VmSnapshotType::Disk => PowerState::Stopped,
            VmSnapshotType::DiskAndMemory => PowerState::Running,
        })
    }
}

#[async_trait]
impl VolumeBackend for SimulatedHypervisor {
    async fn create_volume(&self, volume: &Volume) -> Result<u64> {
        self.call(SimOp::CreateVolume, format!("volume-{}", volume.id)).await?;
        Ok(volume
            .pool_id
            .unwrap_or_else(|| self.default_pool.load(Ordering::SeqCst)))
    }

    async fn resize_volume(&self, volume: &Volume, new_size: u64) -> Result<()> {
        self.call(SimOp::ResizeVolume, format!("volume-{} to {new_size}", volume.id)).await
    }

    async fn migrate_volume(&self, volume: &Volume, pool_id: u64) -> Result<()> {
        self.call(SimOp::MigrateVolume, format!("volume-{} to pool-{pool_id}", volume.id)).await
    }

    async fn expunge_volume(&self, volume: &Volume) -> Result<()> {
        self.call(SimOp::ExpungeVolume, format!("volume-{}", volume.id)).await
    }
}

#[async_trait]
impl SyncProbe for SimulatedHypervisor {
    async fn probe(&self, kind: EntityKind, id: u64, state: &str) -> Result<ProbeOutcome> {
        lock(&self.calls).push(format!("Probe {kind} {id} {state}"));
        Ok(lock(&self.probes)
            .get(&(kind, id))
            .copied()
            .unwrap_or(ProbeOutcome::Unknown))
    }
}

/// Stores, queue, orchestrators and reconciler wired over one simulated
/// hypervisor.
pub struct SimulatedCloud {
    pub config: OrchestratorConfig,
    pub queue: Arc<WorkQueue>,
    pub inventory: Arc<MemoryInventory>,
    pub volumes: Arc<MemoryStore<Volume>>,
    pub snapshots: Arc<MemoryStore<VmSnapshot>>,
    pub hypervisor: Arc<SimulatedHypervisor>,
    pub usage: Arc<UsageRecorder>,
    pub vm_snapshots: VmSnapshotOrchestrator,
    pub volume_ops: VolumeOrchestrator,
    pub reconciler: Arc<Reconciler>,
}

impl SimulatedCloud {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_hypervisor(config, SimulatedHypervisor::new())
    }

    pub fn with_hypervisor(config: OrchestratorConfig, hypervisor: SimulatedHypervisor) -> Self {
        let queue = WorkQueue::in_memory(QueueSettings::from(&config));
        let inventory = Arc::new(MemoryInventory::new());
        let volumes: Arc<MemoryStore<Volume>> = Arc::new(MemoryStore::new());
        let snapshots: Arc<MemoryStore<VmSnapshot>> = Arc::new(MemoryStore::new());
        let hypervisor = Arc::new(hypervisor);
        let usage = Arc::new(UsageRecorder::new());
        let driver = StateDriver::new().with_listener(usage.clone());

        let services = Services::new(queue.clone(), inventory.clone(), config.clone())
            .with_driver(driver.clone());
        let vm_snapshots =
            VmSnapshotOrchestrator::new(services.clone(), snapshots.clone(), hypervisor.clone());
        let volume_ops = VolumeOrchestrator::new(services, volumes.clone(), hypervisor.clone());
        let reconciler = Arc::new(
            Reconciler::new(
                volumes.clone(),
                snapshots.clone(),
                queue.items().clone(),
                hypervisor.clone(),
                driver,
                config.stale_after(),
            )
            .with_job_expiry(queue.jobs().clone(), config.job_retention()),
        );

        Self {
            config,
            queue,
            inventory,
            volumes,
            snapshots,
            hypervisor,
            usage,
            vm_snapshots,
            volume_ops,
            reconciler,
        }
    }

    pub fn add_vm(
        &self,
        id: u64,
        name: &str,
        account_id: u64,
        hypervisor: HypervisorType,
    ) -> VirtualMachine {
        self.inventory
            .persist_vm(VirtualMachine::new(id, name, account_id, hypervisor))
    }
}
