//! Periodic resolution of entities stuck mid-transition.
//!
//! A job that crashed or was abandoned can leave an entity in a transitional
//! state with no work item left to finish it. Such an entity blocks every
//! later operation on its owner, so the reconciler asks the downstream agent
//! what actually happened and drives the matching completion event.
//!
//! The owner is claimed through the work-item store for the whole
//! probe-and-drive step, so the reconciler never writes an entity while a job
//! of the same kind could start on it. The periodic loop also expires old
//! job records.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::error::{OrchestrationError, Result};
use crate::model::{Account, Entity, EntityKind, OwnerRef, VmSnapshot, Volume};
use crate::state_machine::{
    StateDriver, VmSnapshotEvent, VmSnapshotState, VolumeEvent, VolumeState,
};
use crate::store::EntityStore;
use crate::work_queue::{Claim, JobStore, PlaceholderGuard, WorkItem, WorkItemStore};

const RECONCILE_DISPATCHER: &str = "Reconciler";

/// What the downstream agent reports for a stuck entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeOutcome {
    /// The operation went through.
    Completed,
    Failed,
    /// The agent has no record of the operation.
    Unknown,
}

#[async_trait]
pub trait SyncProbe: Send + Sync {
    async fn probe(&self, kind: EntityKind, id: u64, state: &str) -> Result<ProbeOutcome>;
}

/// Maps a probe outcome to the event that finishes a stuck transition.
trait Resolve: Entity {
    fn resolution(state: Self::State, outcome: ProbeOutcome) -> Option<Self::Event>;
}

impl Resolve for Volume {
    fn resolution(state: VolumeState, outcome: ProbeOutcome) -> Option<VolumeEvent> {
        match outcome {
            ProbeOutcome::Completed => Some(VolumeEvent::OperationSucceeded),
            ProbeOutcome::Failed => Some(VolumeEvent::OperationFailed),
            ProbeOutcome::Unknown if state.is_upload() => Some(VolumeEvent::OperationTimeout),
            ProbeOutcome::Unknown => None,
        }
    }
}

impl Resolve for VmSnapshot {
    fn resolution(state: VmSnapshotState, outcome: ProbeOutcome) -> Option<VmSnapshotEvent> {
        // Nothing was sent downstream for an allocated snapshot.
        if state == VmSnapshotState::Allocated {
            return Some(VmSnapshotEvent::OperationFailed);
        }
        match outcome {
            ProbeOutcome::Completed => Some(VmSnapshotEvent::OperationSucceeded),
            ProbeOutcome::Failed => Some(VmSnapshotEvent::OperationFailed),
            ProbeOutcome::Unknown => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedEntity {
    pub kind: EntityKind,
    pub id: u64,
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StuckEntity {
    pub kind: EntityKind,
    pub id: u64,
    pub state: String,
    pub reason: String,
}

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub resolved: Vec<ResolvedEntity>,
    pub left_stuck: Vec<StuckEntity>,
    /// Entities whose owner still has live work of their kind.
    pub skipped: usize,
}

impl ReconcileReport {
    pub fn is_empty(&self) -> bool {
        self.resolved.is_empty() && self.left_stuck.is_empty() && self.skipped == 0
    }
}

pub struct Reconciler {
    volumes: Arc<dyn EntityStore<Volume>>,
    snapshots: Arc<dyn EntityStore<VmSnapshot>>,
    items: Arc<dyn WorkItemStore>,
    probe: Arc<dyn SyncProbe>,
    driver: StateDriver,
    stale_after: Duration,
    jobs: Option<Arc<dyn JobStore>>,
    job_retention: Duration,
}

/// `now - age`, or `None` when that is not representable.
fn cutoff(age: Duration) -> Option<DateTime<Utc>> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
}

impl Reconciler {
    pub fn new(
        volumes: Arc<dyn EntityStore<Volume>>,
        snapshots: Arc<dyn EntityStore<VmSnapshot>>,
        items: Arc<dyn WorkItemStore>,
        probe: Arc<dyn SyncProbe>,
        driver: StateDriver,
        stale_after: Duration,
    ) -> Self {
        Self {
            volumes,
            snapshots,
            items,
            probe,
            driver,
            stale_after,
            jobs: None,
            job_retention: Duration::ZERO,
        }
    }

    /// Also drop job records finished more than `retention` ago on every
    /// periodic pass.
    pub fn with_job_expiry(mut self, jobs: Arc<dyn JobStore>, retention: Duration) -> Self {
        self.jobs = Some(jobs);
        self.job_retention = retention;
        self
    }

    /// Resolve every transitional entity untouched for longer than
    /// `stale_after`.
    pub async fn reconcile_all(&self) -> ReconcileReport {
        // An unrepresentable horizon means nothing is old enough.
        let Some(cutoff) = cutoff(self.stale_after) else {
            return ReconcileReport::default();
        };

        let mut report = ReconcileReport::default();
        self.pass(&*self.volumes, None, Some(cutoff), &mut report).await;
        self.pass(&*self.snapshots, None, Some(cutoff), &mut report).await;
        report
    }

    /// Resolve the owner's transitional entities regardless of age, e.g.
    /// when its host reconnects.
    #[instrument(skip(self))]
    pub async fn reconcile_owner(&self, owner: OwnerRef) -> ReconcileReport {
        let mut report = ReconcileReport::default();
        self.pass(&*self.volumes, Some(owner), None, &mut report).await;
        self.pass(&*self.snapshots, Some(owner), None, &mut report).await;
        report
    }

    /// Remove job records finished longer than the retention ago. Returns
    /// how many went.
    pub fn expire_jobs(&self) -> usize {
        let Some(jobs) = &self.jobs else {
            return 0;
        };
        let Some(older_than) = cutoff(self.job_retention) else {
            return 0;
        };
        let expired = jobs.expire(older_than);
        if expired > 0 {
            debug!(expired, "expired finished jobs");
        }
        expired
    }

    /// Run `reconcile_all` and `expire_jobs` every `interval` until
    /// `shutdown` turns true or its sender goes away.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let report = self.reconcile_all().await;
                        if !report.is_empty() {
                            info!(
                                resolved = report.resolved.len(),
                                stuck = report.left_stuck.len(),
                                skipped = report.skipped,
                                "reconcile pass"
                            );
                        }
                        self.expire_jobs();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("reconciler stopping");
                            break;
                        }
                    }
                }
            }
        })
    }

    async fn pass<E: Resolve>(
        &self,
        store: &dyn EntityStore<E>,
        owner: Option<OwnerRef>,
        cutoff: Option<DateTime<Utc>>,
        report: &mut ReconcileReport,
    ) {
        let candidates: Vec<E> = match owner {
            Some(owner) => store
                .list_by_owner(owner)
                .into_iter()
                .filter(|entity| E::transitional_states().contains(&entity.state()))
                .collect(),
            None => store.list_in_states(E::transitional_states()),
        };

        for entity in candidates {
            if let Some(cutoff) = cutoff
                && entity.lifecycle().updated_at() > cutoff
            {
                continue;
            }
            let _hold = match self.hold(&entity) {
                Ok(hold) => hold,
                Err(err) => {
                    debug!(kind = %E::KIND, id = entity.id(), error = %err, "owner busy");
                    report.skipped += 1;
                    continue;
                }
            };
            // A job may have finished the transition before the claim.
            let Some(entity) = store
                .find_by_id(entity.id())
                .filter(|current| E::transitional_states().contains(&current.state()))
            else {
                continue;
            };

            let state = entity.state();
            match self.resolve(store, &entity).await {
                Ok(Some(updated)) => {
                    info!(
                        kind = %E::KIND,
                        id = entity.id(),
                        from = %state,
                        to = %updated.state(),
                        "resolved stuck entity"
                    );
                    report.resolved.push(ResolvedEntity {
                        kind: E::KIND,
                        id: entity.id(),
                        from: state.to_string(),
                        to: updated.state().to_string(),
                    });
                }
                Ok(None) => report.left_stuck.push(StuckEntity {
                    kind: E::KIND,
                    id: entity.id(),
                    state: state.to_string(),
                    reason: "downstream outcome unknown".into(),
                }),
                Err(err) => {
                    warn!(
                        kind = %E::KIND,
                        id = entity.id(),
                        state = %state,
                        error = %err,
                        "cannot resolve stuck entity"
                    );
                    report.left_stuck.push(StuckEntity {
                        kind: E::KIND,
                        id: entity.id(),
                        state: state.to_string(),
                        reason: err.to_string(),
                    });
                }
            }
        }
    }

    /// Claim the entity's owner until the guard drops. Fails when the owner
    /// already has active work of the entity's kind.
    fn hold<E: Entity>(&self, entity: &E) -> Result<PlaceholderGuard> {
        let owner = entity.owner();
        let claim = Claim::new(owner, E::KIND, RECONCILE_DISPATCHER).entity(entity.id());
        let item = self.items.claim(
            owner,
            Box::new(|active: &[WorkItem]| {
                if let Some(item) = active.iter().find(|item| item.entity_kind == E::KIND) {
                    return Err(OrchestrationError::ConcurrentOperation(format!(
                        "{owner} has {} work in progress (job {})",
                        E::KIND,
                        item.job_id
                    )));
                }
                Ok(WorkItem::hold(&claim, &Account::system()))
            }),
        )?;
        Ok(PlaceholderGuard::new(Arc::clone(&self.items), item.id))
    }

    async fn resolve<E: Resolve>(
        &self,
        store: &dyn EntityStore<E>,
        entity: &E,
    ) -> Result<Option<E>> {
        let state = entity.state();
        let outcome = self.probe.probe(E::KIND, entity.id(), &state.to_string()).await?;
        match E::resolution(state, outcome) {
            Some(event) => self.driver.drive(store, entity, event).map(Some),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::LifecycleGuard;
    use crate::model::{VmSnapshotType, VolumeFormat};
    use crate::store::MemoryStore;
    use crate::work_queue::{JobRecord, JobResult, JobStatus, MemoryJobStore, MemoryWorkItemStore};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::Notify;

    #[derive(Default)]
    struct FixedProbe {
        outcomes: Mutex<HashMap<(EntityKind, u64), ProbeOutcome>>,
        broken: bool,
    }

    impl FixedProbe {
        fn report(self, kind: EntityKind, id: u64, outcome: ProbeOutcome) -> Self {
            self.outcomes.lock().unwrap().insert((kind, id), outcome);
            self
        }
    }

    #[async_trait]
    impl SyncProbe for FixedProbe {
        async fn probe(&self, kind: EntityKind, id: u64, _state: &str) -> Result<ProbeOutcome> {
            if self.broken {
                return Err(OrchestrationError::Execution("agent unreachable".into()));
            }
            Ok(self
                .outcomes
                .lock()
                .unwrap()
                .get(&(kind, id))
                .copied()
                .unwrap_or(ProbeOutcome::Unknown))
        }
    }

    /// Reports `Completed` once released.
    #[derive(Clone, Default)]
    struct GatedProbe {
        entered: Arc<Notify>,
        release: Arc<Notify>,
    }

    #[async_trait]
    impl SyncProbe for GatedProbe {
        async fn probe(&self, _kind: EntityKind, _id: u64, _state: &str) -> Result<ProbeOutcome> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok(ProbeOutcome::Completed)
        }
    }

    struct Fixture {
        volumes: Arc<MemoryStore<Volume>>,
        snapshots: Arc<MemoryStore<VmSnapshot>>,
        items: Arc<MemoryWorkItemStore>,
        driver: StateDriver,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                volumes: Arc::new(MemoryStore::new()),
                snapshots: Arc::new(MemoryStore::new()),
                items: Arc::new(MemoryWorkItemStore::new()),
                driver: StateDriver::new(),
            }
        }

        fn reconciler(&self, probe: impl SyncProbe + 'static) -> Reconciler {
            Reconciler::new(
                self.volumes.clone(),
                self.snapshots.clone(),
                self.items.clone(),
                Arc::new(probe),
                self.driver.clone(),
                Duration::from_secs(600),
            )
        }

        /// A destroyed volume whose expunge job died halfway.
        fn crashed_expunge(&self) -> Volume {
            let mut volume = self.volumes.persist(Volume::new("scratch", 1, 10, VolumeFormat::Raw));
            for event in [
                VolumeEvent::CreateRequested,
                VolumeEvent::OperationSucceeded,
                VolumeEvent::DestroyRequested,
                VolumeEvent::ExpungingRequested,
            ] {
                volume = self.driver.drive(&*self.volumes, &volume, event).unwrap();
            }
            assert_eq!(volume.state(), VolumeState::Expunging);
            self.volumes.backdate(volume.id, chrono::Duration::minutes(20));
            volume
        }
    }

    #[tokio::test]
    async fn stuck_expunging_volume_is_expunged() {
        let fixture = Fixture::new();
        let volume = fixture.crashed_expunge();
        let probe =
            FixedProbe::default().report(EntityKind::Volume, volume.id, ProbeOutcome::Completed);
        let reconciler = fixture.reconciler(probe);

        let report = reconciler.reconcile_all().await;
        assert_eq!(report.resolved.len(), 1);
        assert_eq!(report.resolved[0].to, "Expunged");
        assert_eq!(fixture.volumes.find_by_id(volume.id).unwrap().state(), VolumeState::Expunged);
    }

    #[tokio::test]
    async fn stuck_expunging_volume_falls_back_to_destroy() {
        let fixture = Fixture::new();
        let volume = fixture.crashed_expunge();
        let probe =
            FixedProbe::default().report(EntityKind::Volume, volume.id, ProbeOutcome::Failed);
        let reconciler = fixture.reconciler(probe);

        reconciler.reconcile_all().await;
        assert_eq!(fixture.volumes.find_by_id(volume.id).unwrap().state(), VolumeState::Destroy);
    }

    #[tokio::test]
    async fn fresh_entities_wait_for_the_horizon() {
        let fixture = Fixture::new();
        let volume = fixture.volumes.persist(Volume::new("fresh", 1, 10, VolumeFormat::Raw));
        fixture
            .driver
            .drive(&*fixture.volumes, &volume, VolumeEvent::CreateRequested)
            .unwrap();
        let probe =
            FixedProbe::default().report(EntityKind::Volume, volume.id, ProbeOutcome::Completed);
        let reconciler = fixture.reconciler(probe);

        assert!(reconciler.reconcile_all().await.is_empty());

        let report = reconciler.reconcile_owner(OwnerRef::volume(volume.id)).await;
        assert_eq!(report.resolved.len(), 1);
        assert_eq!(fixture.volumes.find_by_id(volume.id).unwrap().state(), VolumeState::Ready);
    }

    #[tokio::test]
    async fn active_work_is_left_alone() {
        let fixture = Fixture::new();
        let volume = fixture.crashed_expunge();
        let ctx = crate::context::CallContext::new(Account::user(1, "alice"));
        fixture
            .items
            .claim(
                volume.owner(),
                Box::new(|_: &[WorkItem]| {
                    Ok(WorkItem::queued(
                        uuid::Uuid::new_v4(),
                        &Claim::new(volume.owner(), EntityKind::Volume, "VolumeWork"),
                        serde_json::Value::Null,
                        &ctx,
                    ))
                }),
            )
            .unwrap();
        let probe =
            FixedProbe::default().report(EntityKind::Volume, volume.id, ProbeOutcome::Completed);
        let reconciler = fixture.reconciler(probe);

        let report = reconciler.reconcile_all().await;
        assert_eq!(report.skipped, 1);
        assert_eq!(fixture.volumes.find_by_id(volume.id).unwrap().state(), VolumeState::Expunging);
    }

    #[tokio::test]
    async fn owner_stays_claimed_during_resolution() {
        let fixture = Fixture::new();
        let volume = fixture.crashed_expunge();
        let probe = GatedProbe::default();
        let reconciler = Arc::new(fixture.reconciler(probe.clone()));

        let pass = tokio::spawn({
            let reconciler = reconciler.clone();
            async move { reconciler.reconcile_all().await }
        });
        probe.entered.notified().await;

        // An orchestrator submitting against the same owner now.
        let guard = LifecycleGuard::new(fixture.volumes.clone() as Arc<dyn EntityStore<Volume>>);
        let ctx = crate::context::CallContext::new(Account::user(1, "alice"));
        let owner = volume.owner();
        let err = fixture
            .items
            .claim(
                owner,
                Box::new(|active: &[WorkItem]| {
                    guard.ensure_idle(owner, active, Volume::busy_states(), Some(volume.id))?;
                    Ok(WorkItem::queued(
                        uuid::Uuid::new_v4(),
                        &Claim::new(owner, EntityKind::Volume, "VolumeWork"),
                        serde_json::Value::Null,
                        &ctx,
                    ))
                }),
            )
            .unwrap_err();
        assert!(err.is_concurrency());

        probe.release.notify_one();
        let report = pass.await.unwrap();
        assert_eq!(report.resolved.len(), 1);
        assert_eq!(fixture.volumes.find_by_id(volume.id).unwrap().state(), VolumeState::Expunged);
        assert!(fixture.items.list().is_empty());
    }

    #[tokio::test]
    async fn finished_jobs_expire_after_retention() {
        let fixture = Fixture::new();
        let jobs = Arc::new(MemoryJobStore::new());
        let record = || JobRecord {
            id: uuid::Uuid::new_v4(),
            dispatcher: "VolumeWork".into(),
            owner: OwnerRef::volume(1),
            account_id: 1,
            status: JobStatus::InProgress,
            result: None,
            related: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        let (done, running) = (record(), record());
        let done_id = done.id;
        jobs.create(done);
        jobs.create(running);
        jobs.complete(done_id, JobResult::Succeeded(serde_json::Value::Null));

        let keeping = fixture
            .reconciler(FixedProbe::default())
            .with_job_expiry(jobs.clone(), Duration::from_secs(3600));
        assert_eq!(keeping.expire_jobs(), 0);

        let expiring = fixture
            .reconciler(FixedProbe::default())
            .with_job_expiry(jobs.clone(), Duration::ZERO);
        assert_eq!(expiring.expire_jobs(), 1);
        assert!(jobs.find_job_by_id(done_id).is_none());
        assert_eq!(jobs.list().len(), 1);
    }

    #[tokio::test]
    async fn probe_errors_leave_entity_stuck() {
        let fixture = Fixture::new();
        let volume = fixture.crashed_expunge();
        let reconciler = fixture.reconciler(FixedProbe {
            broken: true,
            ..FixedProbe::default()
        });

        let report = reconciler.reconcile_all().await;
        assert!(report.resolved.is_empty());
        assert_eq!(report.left_stuck.len(), 1);
        assert!(report.left_stuck[0].reason.contains("agent unreachable"));
        assert_eq!(fixture.volumes.find_by_id(volume.id).unwrap().state(), VolumeState::Expunging);
    }

    #[tokio::test]
    async fn unknown_upload_times_out() {
        let fixture = Fixture::new();
        let volume = fixture
            .volumes
            .persist(Volume::for_upload("image", 1, VolumeFormat::Qcow2));
        let volume = fixture
            .driver
            .drive(&*fixture.volumes, &volume, VolumeEvent::UploadRequested)
            .unwrap();
        let reconciler = fixture.reconciler(FixedProbe::default());

        reconciler.reconcile_owner(volume.owner()).await;
        assert_eq!(
            fixture.volumes.find_by_id(volume.id).unwrap().state(),
            VolumeState::UploadError
        );
    }

    #[tokio::test]
    async fn orphaned_allocated_snapshot_goes_to_error() {
        let fixture = Fixture::new();
        let snapshot = fixture
            .snapshots
            .persist(VmSnapshot::new(7, 1, "orphan", VmSnapshotType::Disk));
        let reconciler = fixture.reconciler(FixedProbe::default());

        let report = reconciler.reconcile_owner(OwnerRef::vm(7)).await;
        assert_eq!(report.resolved.len(), 1);
        assert_eq!(
            fixture.snapshots.find_by_id(snapshot.id).unwrap().state(),
            VmSnapshotState::Error
        );
    }

    #[tokio::test]
    async fn spawned_loop_stops_on_shutdown() {
        let fixture = Fixture::new();
        let volume = fixture.crashed_expunge();
        let probe =
            FixedProbe::default().report(EntityKind::Volume, volume.id, ProbeOutcome::Completed);
        let reconciler = Arc::new(fixture.reconciler(probe));
        let (tx, rx) = watch::channel(false);

        let handle = reconciler.spawn(Duration::from_millis(10), rx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(fixture.volumes.find_by_id(volume.id).unwrap().state(), VolumeState::Expunged);
    }
}
