use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

use super::{OperationPhase, OperationTrace, Orchestrate, Services, compensate, dispatch, encode};
use crate::backend::VolumeBackend;
use crate::context::CallContext;
use crate::error::{OrchestrationError, Result};
use crate::guard::LifecycleGuard;
use crate::model::{Entity, EntityKind, PowerState, Volume, VolumeFormat};
use crate::policy::Operation;
use crate::state_machine::{VolumeEvent, VolumeState};
use crate::store::EntityStore;
use crate::work_queue::Claim;

pub const VOLUME_DISPATCHER: &str = "VolumeWork";

const DESTROYABLE: &[VolumeState] = &[
    VolumeState::Allocated,
    VolumeState::Ready,
    VolumeState::Uploaded,
    VolumeState::UploadError,
    VolumeState::UploadAbandoned,
    VolumeState::NotUploaded,
];

const EXPUNGEABLE: &[VolumeState] = &[VolumeState::Destroy, VolumeState::Expunging];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewVolume {
    pub name: String,
    pub size_bytes: u64,
    pub format: VolumeFormat,
    /// Attach the new volume to this VM.
    pub vm_id: Option<u64>,
}

impl NewVolume {
    pub fn new(name: impl Into<String>, size_bytes: u64, format: VolumeFormat) -> Self {
        Self {
            name: name.into(),
            size_bytes,
            format,
            vm_id: None,
        }
    }

    pub fn attached_to(mut self, vm_id: u64) -> Self {
        self.vm_id = Some(vm_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum VolumeWork {
    Create { volume_id: u64 },
    Resize { volume_id: u64, new_size: u64 },
    Migrate { volume_id: u64, pool_id: u64 },
    Destroy { volume_id: u64 },
    Recover { volume_id: u64 },
    Expunge { volume_id: u64 },
}

impl VolumeWork {
    fn volume_id(&self) -> u64 {
        match *self {
            VolumeWork::Create { volume_id }
            | VolumeWork::Resize { volume_id, .. }
            | VolumeWork::Migrate { volume_id, .. }
            | VolumeWork::Destroy { volume_id }
            | VolumeWork::Recover { volume_id }
            | VolumeWork::Expunge { volume_id } => volume_id,
        }
    }
}

/// Volume lifecycle operations. Attached volumes serialize on their VM,
/// detached ones on themselves.
#[derive(Clone)]
pub struct VolumeOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    services: Services,
    guard: LifecycleGuard<Volume>,
    backend: Arc<dyn VolumeBackend>,
}

impl VolumeOrchestrator {
    pub fn new(
        services: Services,
        volumes: Arc<dyn EntityStore<Volume>>,
        backend: Arc<dyn VolumeBackend>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                services,
                guard: LifecycleGuard::new(volumes),
                backend,
            }),
        }
    }

    pub fn volumes(&self) -> &dyn EntityStore<Volume> {
        self.inner.guard.store()
    }

    fn services(&self) -> &Services {
        &self.inner.services
    }

    fn accessible(&self, ctx: &CallContext, volume_id: u64) -> Result<Volume> {
        let volume = self.inner.guard.find(volume_id)?;
        self.services()
            .access
            .check_access(ctx.principal(), volume.account_id, &format!("volume {volume_id}"))?;
        Ok(volume)
    }

    /// Record a new volume in `Allocated`. Nothing is created on storage
    /// until [`create`](Self::create).
    pub fn allocate(&self, ctx: &CallContext, request: NewVolume) -> Result<Volume> {
        let name = request.name.trim();
        if name.is_empty() {
            return Err(OrchestrationError::InvalidParameter(
                "volume name must not be empty".into(),
            ));
        }
        if request.size_bytes == 0 {
            return Err(OrchestrationError::InvalidParameter("volume size must be positive".into()));
        }

        let mut volume = Volume::new(name, ctx.principal().id, request.size_bytes, request.format);
        if let Some(vm_id) = request.vm_id {
            let vm = self.services().find_vm(vm_id)?;
            self.services()
                .access
                .check_access(ctx.principal(), vm.account_id, &format!("vm {vm_id}"))?;
            volume.account_id = vm.account_id;
            volume = volume.attached_to(vm_id);
        }

        let volume = self.volumes().persist(volume);
        info!(volume = volume.id, owner = %volume.owner(), "volume allocated");
        Ok(volume)
    }

    /// Create an allocated volume on primary storage.
    pub async fn create(&self, ctx: &CallContext, volume_id: u64) -> Result<Volume> {
        let volume = self.accessible(ctx, volume_id)?;
        let mut trace = OperationTrace::start("create volume", volume.owner());
        trace.enter(OperationPhase::Validating);
        let work = VolumeWork::Create { volume_id };
        let result = self
            .submit(ctx, &volume, &[VolumeState::Allocated], "create", work, &mut trace)
            .await;
        trace.finish(result)
    }

    /// Grow or shrink a ready volume. Shrinking must be asked for explicitly.
    pub async fn resize(
        &self,
        ctx: &CallContext,
        volume_id: u64,
        new_size: u64,
        shrink_ok: bool,
    ) -> Result<Volume> {
        let volume = self.accessible(ctx, volume_id)?;
        let mut trace = OperationTrace::start("resize volume", volume.owner());
        let result = self.try_resize(ctx, volume, new_size, shrink_ok, &mut trace).await;
        trace.finish(result)
    }

    async fn try_resize(
        &self,
        ctx: &CallContext,
        volume: Volume,
        new_size: u64,
        shrink_ok: bool,
        trace: &mut OperationTrace,
    ) -> Result<Volume> {
        trace.enter(OperationPhase::Validating);
        self.inner.guard.guard(volume.id, &[VolumeState::Ready], "resize")?;
        if new_size == 0 {
            return Err(OrchestrationError::InvalidParameter("volume size must be positive".into()));
        }
        if new_size == volume.size_bytes {
            return Err(OrchestrationError::InvalidParameter(format!(
                "volume {} is already {new_size} bytes",
                volume.id
            )));
        }
        if new_size < volume.size_bytes && !shrink_ok {
            return Err(OrchestrationError::InvalidParameter(format!(
                "shrinking volume {} from {} to {new_size} bytes needs shrink_ok",
                volume.id, volume.size_bytes
            )));
        }
        if let Some(vm_id) = volume.instance_id {
            let vm = self.services().find_vm(vm_id)?;
            self.services()
                .capabilities
                .require(&vm.hypervisor.to_string(), Operation::VolumeResize)?;
        }

        let work = VolumeWork::Resize {
            volume_id: volume.id,
            new_size,
        };
        self.submit(ctx, &volume, &[VolumeState::Ready], "resize", work, trace).await
    }

    /// Move a ready volume to another storage pool.
    pub async fn migrate(&self, ctx: &CallContext, volume_id: u64, pool_id: u64) -> Result<Volume> {
        let volume = self.accessible(ctx, volume_id)?;
        let mut trace = OperationTrace::start("migrate volume", volume.owner());
        let result = self.try_migrate(ctx, volume, pool_id, &mut trace).await;
        trace.finish(result)
    }

    async fn try_migrate(
        &self,
        ctx: &CallContext,
        volume: Volume,
        pool_id: u64,
        trace: &mut OperationTrace,
    ) -> Result<Volume> {
        trace.enter(OperationPhase::Validating);
        self.inner.guard.guard(volume.id, &[VolumeState::Ready], "migrate")?;
        if volume.pool_id == Some(pool_id) {
            return Err(OrchestrationError::InvalidParameter(format!(
                "volume {} is already on pool {pool_id}",
                volume.id
            )));
        }
        if let Some(vm_id) = volume.instance_id {
            let vm = self.services().find_vm(vm_id)?;
            if vm.power_state == PowerState::Running {
                self.services()
                    .capabilities
                    .require(&vm.hypervisor.to_string(), Operation::VolumeLiveMigrate)?;
            }
        }

        let work = VolumeWork::Migrate {
            volume_id: volume.id,
            pool_id,
        };
        self.submit(ctx, &volume, &[VolumeState::Ready], "migrate", work, trace).await
    }

    /// Move a detached volume to `Destroy`, where it can still be recovered.
    pub async fn destroy(&self, ctx: &CallContext, volume_id: u64) -> Result<Volume> {
        let volume = self.accessible(ctx, volume_id)?;
        let mut trace = OperationTrace::start("destroy volume", volume.owner());
        trace.enter(OperationPhase::Validating);
        let result = match volume.instance_id {
            Some(vm_id) => Err(OrchestrationError::InvalidParameter(format!(
                "volume {volume_id} is attached to vm {vm_id}, detach it first"
            ))),
            None => {
                let work = VolumeWork::Destroy { volume_id };
                self.submit(ctx, &volume, DESTROYABLE, "destroy", work, &mut trace)
                    .await
            }
        };
        trace.finish(result)
    }

    pub async fn recover(&self, ctx: &CallContext, volume_id: u64) -> Result<Volume> {
        let volume = self.accessible(ctx, volume_id)?;
        let mut trace = OperationTrace::start("recover volume", volume.owner());
        trace.enter(OperationPhase::Validating);
        let work = VolumeWork::Recover { volume_id };
        let result = self
            .submit(ctx, &volume, &[VolumeState::Destroy], "recover", work, &mut trace)
            .await;
        trace.finish(result)
    }

    /// Remove a destroyed volume from storage for good. Expunging an
    /// expunged volume succeeds without doing anything.
    pub async fn expunge(&self, ctx: &CallContext, volume_id: u64) -> Result<bool> {
        let volume = self.accessible(ctx, volume_id)?;
        if volume.state() == VolumeState::Expunged {
            return Ok(true);
        }
        let mut trace = OperationTrace::start("expunge volume", volume.owner());
        trace.enter(OperationPhase::Validating);
        let work = VolumeWork::Expunge { volume_id };
        let result = self
            .submit(ctx, &volume, EXPUNGEABLE, "expunge", work, &mut trace)
            .await;
        trace.finish(result)
    }

    /// Guard the volume, then claim it on its owner and dispatch `work`.
    /// The state is checked again under the claim.
    async fn submit<T: DeserializeOwned>(
        &self,
        ctx: &CallContext,
        volume: &Volume,
        allowed: &'static [VolumeState],
        operation: &'static str,
        work: VolumeWork,
        trace: &mut OperationTrace,
    ) -> Result<T> {
        let guard = &self.inner.guard;
        guard.guard(volume.id, allowed, operation)?;

        let owner = volume.owner();
        let volume_id = volume.id;
        let claim = Claim::new(owner, EntityKind::Volume, VOLUME_DISPATCHER).entity(volume_id);
        dispatch(self, self.services(), ctx, claim, trace, |active| {
            guard.ensure_idle(owner, active, Volume::busy_states(), Some(volume_id))?;
            guard.guard(volume_id, allowed, operation)?;
            Ok(work)
        })
        .await
    }

    async fn run_create(&self, volume_id: u64) -> Result<Volume> {
        let store = self.volumes();
        let driver = &self.services().driver;
        let volume = self.inner.guard.guard(volume_id, &[VolumeState::Allocated], "create")?;
        let creating = driver.drive(store, &volume, VolumeEvent::CreateRequested)?;

        let pool_id = match self.inner.backend.create_volume(&creating).await {
            Ok(pool_id) => pool_id,
            Err(err) => {
                compensate(driver, store, volume_id, VolumeEvent::OperationFailed);
                return Err(err);
            }
        };

        let mut ready = driver.drive(store, &creating, VolumeEvent::OperationSucceeded)?;
        ready.pool_id = Some(pool_id);
        store.update(&ready);
        Ok(ready)
    }

    async fn run_resize(&self, volume_id: u64, new_size: u64) -> Result<Volume> {
        let store = self.volumes();
        let driver = &self.services().driver;
        let volume = self.inner.guard.guard(volume_id, &[VolumeState::Ready], "resize")?;
        let resizing = driver.drive(store, &volume, VolumeEvent::ResizeRequested)?;

        if let Err(err) = self.inner.backend.resize_volume(&resizing, new_size).await {
            compensate(driver, store, volume_id, VolumeEvent::OperationFailed);
            return Err(err);
        }

        let mut ready = driver.drive(store, &resizing, VolumeEvent::OperationSucceeded)?;
        ready.size_bytes = new_size;
        store.update(&ready);
        Ok(ready)
    }

    async fn run_migrate(&self, volume_id: u64, pool_id: u64) -> Result<Volume> {
        let store = self.volumes();
        let driver = &self.services().driver;
        let volume = self.inner.guard.guard(volume_id, &[VolumeState::Ready], "migrate")?;
        let migrating = driver.drive(store, &volume, VolumeEvent::MigrationRequested)?;

        if let Err(err) = self.inner.backend.migrate_volume(&migrating, pool_id).await {
            compensate(driver, store, volume_id, VolumeEvent::OperationFailed);
            return Err(err);
        }

        let mut ready = driver.drive(store, &migrating, VolumeEvent::OperationSucceeded)?;
        ready.pool_id = Some(pool_id);
        store.update(&ready);
        Ok(ready)
    }

    fn run_destroy(&self, volume_id: u64) -> Result<Volume> {
        let volume = self.inner.guard.guard(volume_id, DESTROYABLE, "destroy")?;
        self.services()
            .driver
            .drive(self.volumes(), &volume, VolumeEvent::DestroyRequested)
    }

    fn run_recover(&self, volume_id: u64) -> Result<Volume> {
        let volume = self.inner.guard.guard(volume_id, &[VolumeState::Destroy], "recover")?;
        self.services()
            .driver
            .drive(self.volumes(), &volume, VolumeEvent::RecoverRequested)
    }

    async fn run_expunge(&self, volume_id: u64) -> Result<bool> {
        let store = self.volumes();
        let driver = &self.services().driver;
        if self.inner.guard.find(volume_id)?.state() == VolumeState::Expunged {
            return Ok(true);
        }
        let volume = self.inner.guard.guard(volume_id, EXPUNGEABLE, "expunge")?;
        let expunging = driver.drive(store, &volume, VolumeEvent::ExpungingRequested)?;

        if let Err(err) = self.inner.backend.expunge_volume(&expunging).await {
            compensate(driver, store, volume_id, VolumeEvent::OperationFailed);
            return Err(err);
        }

        driver.drive(store, &expunging, VolumeEvent::OperationSucceeded)?;
        Ok(true)
    }
}

#[async_trait]
impl Orchestrate for VolumeOrchestrator {
    type Work = VolumeWork;

    const DISPATCHER: &'static str = VOLUME_DISPATCHER;

    async fn execute(&self, _ctx: &CallContext, work: VolumeWork) -> Result<Value> {
        match work {
            VolumeWork::Create { volume_id } => encode(&self.run_create(volume_id).await?),
            VolumeWork::Resize {
                volume_id,
                new_size,
            } => encode(&self.run_resize(volume_id, new_size).await?),
            VolumeWork::Migrate { volume_id, pool_id } => {
                encode(&self.run_migrate(volume_id, pool_id).await?)
            }
            VolumeWork::Destroy { volume_id } => encode(&self.run_destroy(volume_id)?),
            VolumeWork::Recover { volume_id } => encode(&self.run_recover(volume_id)?),
            VolumeWork::Expunge { volume_id } => encode(&self.run_expunge(volume_id).await?),
        }
    }

    async fn abandon(&self, work: VolumeWork) {
        compensate(
            &self.services().driver,
            self.volumes(),
            work.volume_id(),
            VolumeEvent::OperationFailed,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::model::{Account, HypervisorType, OwnerRef};
    use crate::sim::{SimOp, SimulatedCloud};
    use crate::store::VmInventory;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    const GIB: u64 = 1 << 30;

    fn cloud() -> SimulatedCloud {
        let cloud = SimulatedCloud::new(OrchestratorConfig {
            poll_interval_ms: 5,
            ..OrchestratorConfig::default()
        });
        cloud.add_vm(7, "web-7", 1, HypervisorType::Kvm);
        cloud
    }

    fn alice() -> CallContext {
        CallContext::new(Account::user(1, "alice"))
    }

    fn state(cloud: &SimulatedCloud, id: u64) -> VolumeState {
        cloud.volumes.find_by_id(id).unwrap().state()
    }

    async fn ready_volume(cloud: &SimulatedCloud, request: NewVolume) -> Volume {
        let volume = cloud.volume_ops.allocate(&alice(), request).unwrap();
        cloud.volume_ops.create(&alice(), volume.id).await.unwrap()
    }

    #[test]
    fn allocate_validates_input() {
        let cloud = cloud();
        let ctx = alice();
        let ops = &cloud.volume_ops;

        assert!(matches!(
            ops.allocate(&ctx, NewVolume::new(" ", GIB, VolumeFormat::Raw)),
            Err(OrchestrationError::InvalidParameter(_))
        ));
        assert!(matches!(
            ops.allocate(&ctx, NewVolume::new("data", 0, VolumeFormat::Raw)),
            Err(OrchestrationError::InvalidParameter(_))
        ));
        assert!(matches!(
            ops.allocate(&ctx, NewVolume::new("data", GIB, VolumeFormat::Raw).attached_to(404)),
            Err(OrchestrationError::InvalidParameter(_))
        ));
        let bob = CallContext::new(Account::user(2, "bob"));
        assert!(matches!(
            ops.allocate(&bob, NewVolume::new("data", GIB, VolumeFormat::Raw).attached_to(7)),
            Err(OrchestrationError::PermissionDenied(_))
        ));

        let volume = ops
            .allocate(&ctx, NewVolume::new("data", GIB, VolumeFormat::Qcow2).attached_to(7))
            .unwrap();
        assert_eq!(volume.state(), VolumeState::Allocated);
        assert_eq!(volume.owner(), OwnerRef::vm(7));
        assert_eq!(cloud.volumes.len(), 1);
        assert_eq!(cloud.queue.items().stats().queued, 0);
    }

    #[tokio::test]
    async fn create_lands_on_the_backend_pool() {
        let cloud = cloud();
        cloud.hypervisor.set_default_pool(3);

        let volume = ready_volume(&cloud, NewVolume::new("data", GIB, VolumeFormat::Raw)).await;
        assert_eq!(volume.state(), VolumeState::Ready);
        assert_eq!(volume.pool_id, Some(3));
        assert_eq!(cloud.volumes.find_by_id(volume.id).unwrap().pool_id, Some(3));
        assert_eq!(cloud.usage.records().len(), 1);
        assert!(cloud.queue.items().list().is_empty());
    }

    #[tokio::test]
    async fn failed_create_compensates_back_to_allocated() {
        let cloud = cloud();
        let ctx = alice();
        let volume = cloud
            .volume_ops
            .allocate(&ctx, NewVolume::new("data", GIB, VolumeFormat::Raw))
            .unwrap();
        cloud.hypervisor.fail_next(SimOp::CreateVolume);

        let err = cloud.volume_ops.create(&ctx, volume.id).await.unwrap_err();
        assert_eq!(
            err,
            OrchestrationError::Execution(format!(
                "simulated CreateVolume failure on volume-{}",
                volume.id
            ))
        );
        assert_eq!(state(&cloud, volume.id), VolumeState::Allocated);

        let retried = cloud.volume_ops.create(&ctx, volume.id).await.unwrap();
        assert_eq!(retried.state(), VolumeState::Ready);
    }

    #[tokio::test]
    async fn illegal_state_is_rejected_before_queueing() {
        let cloud = cloud();
        let ctx = alice();
        let volume = ready_volume(&cloud, NewVolume::new("data", GIB, VolumeFormat::Raw)).await;
        let queued = cloud.queue.items().stats().queued;

        let err = cloud.volume_ops.create(&ctx, volume.id).await.unwrap_err();
        assert!(matches!(
            err,
            OrchestrationError::IllegalState { ref operation, .. } if operation == "create"
        ));
        let err = cloud.volume_ops.recover(&ctx, volume.id).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::IllegalState { .. }));
        let err = cloud.volume_ops.resize(&ctx, 404, GIB, false).await.unwrap_err();
        assert_eq!(err, OrchestrationError::EntityNotFound { kind: EntityKind::Volume, id: 404 });
        assert_eq!(cloud.queue.items().stats().queued, queued);
    }

    #[tokio::test]
    async fn resize_rules() {
        let cloud = cloud();
        let ctx = alice();
        let volume = ready_volume(&cloud, NewVolume::new("data", 4 * GIB, VolumeFormat::Raw)).await;

        for (size, shrink_ok) in [(0, true), (4 * GIB, false), (2 * GIB, false)] {
            let err = cloud.volume_ops.resize(&ctx, volume.id, size, shrink_ok).await.unwrap_err();
            assert!(matches!(err, OrchestrationError::InvalidParameter(_)), "{size}");
        }

        let grown = cloud.volume_ops.resize(&ctx, volume.id, 8 * GIB, false).await.unwrap();
        assert_eq!(grown.size_bytes, 8 * GIB);
        let shrunk = cloud.volume_ops.resize(&ctx, volume.id, 2 * GIB, true).await.unwrap();
        assert_eq!(shrunk.size_bytes, 2 * GIB);
        assert_eq!(state(&cloud, volume.id), VolumeState::Ready);

        cloud.hypervisor.fail_next(SimOp::ResizeVolume);
        assert!(cloud.volume_ops.resize(&ctx, volume.id, 3 * GIB, false).await.is_err());
        let stored = cloud.volumes.find_by_id(volume.id).unwrap();
        assert_eq!(stored.state(), VolumeState::Ready);
        assert_eq!(stored.size_bytes, 2 * GIB);
    }

    #[tokio::test]
    async fn live_migration_needs_hypervisor_support() {
        let cloud = cloud();
        let ctx = alice();
        cloud.add_vm(8, "db-8", 1, HypervisorType::XenServer);
        let request = NewVolume::new("db", GIB, VolumeFormat::Vhd).attached_to(8);
        let volume = ready_volume(&cloud, request).await;

        let err = cloud.volume_ops.migrate(&ctx, volume.id, 2).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Unsupported(_)));
        let err = cloud.volume_ops.migrate(&ctx, volume.id, 1).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidParameter(_)));

        cloud.inventory.update_power_state(8, PowerState::Stopped);
        let moved = cloud.volume_ops.migrate(&ctx, volume.id, 2).await.unwrap();
        assert_eq!(moved.pool_id, Some(2));
        assert_eq!(moved.state(), VolumeState::Ready);
    }

    #[tokio::test]
    async fn destroy_recover_expunge() {
        let cloud = cloud();
        let ctx = alice();
        let request = NewVolume::new("root", GIB, VolumeFormat::Qcow2).attached_to(7);
        let attached = ready_volume(&cloud, request).await;
        let err = cloud.volume_ops.destroy(&ctx, attached.id).await.unwrap_err();
        assert!(matches!(err, OrchestrationError::InvalidParameter(_)));

        let volume = ready_volume(&cloud, NewVolume::new("scratch", GIB, VolumeFormat::Raw)).await;
        let destroyed = cloud.volume_ops.destroy(&ctx, volume.id).await.unwrap();
        assert_eq!(destroyed.state(), VolumeState::Destroy);
        let recovered = cloud.volume_ops.recover(&ctx, volume.id).await.unwrap();
        assert_eq!(recovered.state(), VolumeState::Ready);

        cloud.volume_ops.destroy(&ctx, volume.id).await.unwrap();
        assert!(cloud.volume_ops.expunge(&ctx, volume.id).await.unwrap());
        assert_eq!(state(&cloud, volume.id), VolumeState::Expunged);

        let queued = cloud.queue.items().stats().queued;
        assert!(cloud.volume_ops.expunge(&ctx, volume.id).await.unwrap());
        assert_eq!(cloud.queue.items().stats().queued, queued);
    }

    #[tokio::test]
    async fn failed_expunge_falls_back_to_destroy() {
        let cloud = cloud();
        let ctx = alice();
        let volume = ready_volume(&cloud, NewVolume::new("scratch", GIB, VolumeFormat::Raw)).await;
        cloud.volume_ops.destroy(&ctx, volume.id).await.unwrap();
        cloud.hypervisor.fail_next(SimOp::ExpungeVolume);

        assert!(cloud.volume_ops.expunge(&ctx, volume.id).await.is_err());
        assert_eq!(state(&cloud, volume.id), VolumeState::Destroy);
        assert!(cloud.volume_ops.expunge(&ctx, volume.id).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn volumes_of_one_vm_share_its_claim() {
        let cloud = cloud();
        let ctx = alice();
        let first_request = NewVolume::new("a", GIB, VolumeFormat::Raw).attached_to(7);
        let first = ready_volume(&cloud, first_request).await.id;
        let second_request = NewVolume::new("b", GIB, VolumeFormat::Raw).attached_to(7);
        let second = ready_volume(&cloud, second_request).await.id;
        let detached = ready_volume(&cloud, NewVolume::new("c", GIB, VolumeFormat::Raw)).await.id;
        cloud.hypervisor.hold();

        let pending = {
            let ops = cloud.volume_ops.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { ops.resize(&ctx, first, 2 * GIB, false).await })
        };
        timeout(Duration::from_secs(5), async {
            while state(&cloud, first) != VolumeState::Resizing {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        let err = cloud.volume_ops.resize(&ctx, second, 2 * GIB, false).await.unwrap_err();
        assert!(err.is_concurrency());

        // A different owner is not affected, it only waits on the gate.
        let other = {
            let ops = cloud.volume_ops.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { ops.resize(&ctx, detached, 2 * GIB, false).await })
        };
        cloud.hypervisor.release();
        assert_eq!(pending.await.unwrap().unwrap().size_bytes, 2 * GIB);
        assert_eq!(other.await.unwrap().unwrap().size_bytes, 2 * GIB);
    }
}
