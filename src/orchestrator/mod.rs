//! Business operations: validate, dispatch, then drive the entity's state
//! machine from inside the job body.
//!
//! Every operation walks `Requested -> Validating -> Dispatched` and ends in
//! `Succeeded` or `Failed`. Validation failures return before anything is
//! queued. Called from outside a job, an operation submits a work item and
//! waits on its [`JobOutcome`](crate::work_queue::JobOutcome); called from
//! inside a dispatched job, it claims a placeholder and runs inline.

mod vm_snapshot;
mod volume;

pub use vm_snapshot::{CreateVmSnapshot, VM_SNAPSHOT_DISPATCHER, VmSnapshotOrchestrator};
pub use volume::{NewVolume, VOLUME_DISPATCHER, VolumeOrchestrator};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::context::CallContext;
use crate::error::{OrchestrationError, Result};
use crate::model::{Entity, OwnerRef, VirtualMachine};
use crate::policy::{AccessChecker, CapabilityCatalog, OwnerOrAdmin, StaticCapabilities};
use crate::state_machine::StateDriver;
use crate::store::{EntityStore, VmInventory};
use crate::work_queue::{Claim, JobDispatcher, WorkItem, WorkQueue};

/// Collaborators shared by every orchestrator.
#[derive(Clone)]
pub struct Services {
    pub queue: Arc<WorkQueue>,
    pub inventory: Arc<dyn VmInventory>,
    pub access: Arc<dyn AccessChecker>,
    pub capabilities: Arc<dyn CapabilityCatalog>,
    pub driver: StateDriver,
    pub config: OrchestratorConfig,
}

impl Services {
    /// Owner-or-admin access and the standard hypervisor capability table.
    pub fn new(
        queue: Arc<WorkQueue>,
        inventory: Arc<dyn VmInventory>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            queue,
            inventory,
            access: Arc::new(OwnerOrAdmin),
            capabilities: Arc::new(StaticCapabilities::standard()),
            driver: StateDriver::new(),
            config,
        }
    }

    pub fn with_access(mut self, access: Arc<dyn AccessChecker>) -> Self {
        self.access = access;
        self
    }

    pub fn with_capabilities(mut self, capabilities: Arc<dyn CapabilityCatalog>) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn with_driver(mut self, driver: StateDriver) -> Self {
        self.driver = driver;
        self
    }

    pub(crate) fn find_vm(&self, vm_id: u64) -> Result<VirtualMachine> {
        self.inventory
            .find_vm(vm_id)
            .ok_or_else(|| {
                OrchestrationError::InvalidParameter(format!("vm {vm_id} does not exist"))
            })
    }
}

/// Phase of one orchestrated operation, not of the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationPhase {
    Requested,
    Validating,
    Dispatched,
    Succeeded,
    Failed,
}

impl fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Logs the phases of one operation as it moves through them.
pub(crate) struct OperationTrace {
    operation: &'static str,
    owner: OwnerRef,
    phase: OperationPhase,
    inline: bool,
}

impl OperationTrace {
    pub(crate) fn start(operation: &'static str, owner: OwnerRef) -> Self {
        debug!(operation, %owner, phase = %OperationPhase::Requested, "operation requested");
        Self {
            operation,
            owner,
            phase: OperationPhase::Requested,
            inline: false,
        }
    }

    pub(crate) fn enter(&mut self, phase: OperationPhase) {
        self.phase = phase;
        debug!(
            operation = self.operation,
            owner = %self.owner,
            phase = %phase,
            inline = self.inline,
            "operation phase"
        );
    }

    /// Log the terminal phase. Failures before dispatch are plain rejections.
    pub(crate) fn finish<T>(self, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => info!(
                operation = self.operation,
                owner = %self.owner,
                phase = %OperationPhase::Succeeded,
                inline = self.inline,
                "operation succeeded"
            ),
            Err(err) if self.phase == OperationPhase::Dispatched => warn!(
                operation = self.operation,
                owner = %self.owner,
                phase = %OperationPhase::Failed,
                error = %err,
                "operation failed"
            ),
            Err(err) => debug!(
                operation = self.operation,
                owner = %self.owner,
                phase = %OperationPhase::Failed,
                error = %err,
                "operation rejected"
            ),
        }
        result
    }
}

/// The job-body half of an orchestrator.
#[async_trait]
pub(crate) trait Orchestrate: Clone + Send + Sync + 'static {
    type Work: Serialize + DeserializeOwned + fmt::Debug + Send + Sync + 'static;

    const DISPATCHER: &'static str;

    async fn execute(&self, ctx: &CallContext, work: Self::Work) -> Result<Value>;

    /// Drive whatever the aborted `work` left mid-transition to its failure
    /// state.
    async fn abandon(&self, work: Self::Work);
}

struct WorkDispatcher<O>(O);

#[async_trait]
impl<O: Orchestrate> JobDispatcher for WorkDispatcher<O> {
    fn name(&self) -> &'static str {
        O::DISPATCHER
    }

    async fn run(&self, ctx: CallContext, payload: Value) -> Result<Value> {
        let work: O::Work = serde_json::from_value(payload).map_err(|e| {
            OrchestrationError::Unexpected(format!("unreadable {} payload: {e}", O::DISPATCHER))
        })?;
        debug!(dispatcher = O::DISPATCHER, ?work, "running work");
        self.0.execute(&ctx, work).await
    }

    async fn abandon(&self, _ctx: CallContext, payload: Value) {
        match serde_json::from_value::<O::Work>(payload) {
            Ok(work) => self.0.abandon(work).await,
            Err(e) => warn!(
                dispatcher = O::DISPATCHER,
                error = %e,
                "cannot abandon unreadable payload"
            ),
        }
    }
}

/// Submit `claim` and wait for the result, or run inline when `ctx` is
/// already inside a dispatched job.
///
/// `prepare` runs atomically with the claim and sees the owner's active work
/// items. Inline, the items of the enclosing job are hidden from it.
pub(crate) async fn dispatch<O, T, F>(
    orchestrator: &O,
    services: &Services,
    ctx: &CallContext,
    claim: Claim,
    trace: &mut OperationTrace,
    prepare: F,
) -> Result<T>
where
    O: Orchestrate,
    T: DeserializeOwned,
    F: FnOnce(&[WorkItem]) -> Result<O::Work>,
{
    if ctx.is_dispatched() {
        trace.inline = true;
        let (_placeholder, work) = services.queue.create_placeholder(ctx, claim, prepare)?;
        trace.enter(OperationPhase::Dispatched);
        let value = orchestrator.execute(ctx, work).await?;
        decode(value)
    } else {
        let dispatcher: Arc<dyn JobDispatcher> = Arc::new(WorkDispatcher(orchestrator.clone()));
        let outcome = services.queue.submit::<T, _>(ctx, claim, dispatcher, |active| {
            let work = prepare(active)?;
            encode(&work)
        })?;
        trace.enter(OperationPhase::Dispatched);
        outcome.get().await
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| OrchestrationError::Unexpected(format!("cannot encode result: {e}")))
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| OrchestrationError::Unexpected(format!("cannot decode result: {e}")))
}

/// Fire `event` on `id` if it is still mid-transition.
///
/// Used after a job body failed or was abandoned. Errors are logged; the
/// original failure is what the caller sees.
pub(crate) fn compensate<E: Entity>(
    driver: &StateDriver,
    store: &dyn EntityStore<E>,
    id: u64,
    event: E::Event,
) {
    let Some(entity) = store.find_by_id(id) else {
        warn!(kind = %E::KIND, id, "cannot compensate, entity is gone");
        return;
    };
    if !E::transitional_states().contains(&entity.state()) {
        return;
    }
    match driver.drive(store, &entity, event) {
        Ok(updated) => info!(
            kind = %E::KIND,
            id,
            from = %entity.state(),
            to = %updated.state(),
            "compensated failed operation"
        ),
        Err(err) => warn!(kind = %E::KIND, id, error = %err, "compensation failed"),
    }
}
