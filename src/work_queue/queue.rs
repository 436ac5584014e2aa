use std::collections::hash_map::Entry;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::item::{Claim, MemoryWorkItemStore, WorkItem, WorkItemStore, WorkStep};
use super::job::{JobRecord, JobResult, JobStore, MemoryJobStore};
use super::outcome::JobOutcome;
use crate::config::OrchestratorConfig;
use crate::context::{CallContext, DispatchScope};
use crate::error::{JobFailure, OrchestrationError, Result};
use crate::model::OwnerRef;

/// Executes the payload of a queued work item.
#[async_trait]
pub trait JobDispatcher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, ctx: CallContext, payload: Value) -> Result<Value>;

    /// Called when the job exceeded its horizon and was aborted, so the
    /// dispatcher can drive its entity to a failure state.
    async fn abandon(&self, ctx: CallContext, payload: Value) {
        let _ = (ctx, payload);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    /// Fixed size of the worker pool.
    pub worker_count: usize,
    pub poll_interval: Duration,
    /// Horizon after which a running job is aborted.
    pub job_timeout: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for QueueSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            worker_count: config.worker_count.max(1),
            poll_interval: config.poll_interval(),
            job_timeout: config.job_timeout(),
        }
    }
}

struct QueuedJob {
    item: WorkItem,
    dispatcher: Arc<dyn JobDispatcher>,
}

/// Serializes work per owning resource.
///
/// Items sharing an owner run strictly one at a time in submission order.
/// Items on different owners run concurrently, bounded by the worker pool.
pub struct WorkQueue {
    items: Arc<dyn WorkItemStore>,
    jobs: Arc<dyn JobStore>,
    lanes: Mutex<HashMap<OwnerRef, VecDeque<QueuedJob>>>,
    workers: Arc<Semaphore>,
    settings: QueueSettings,
}

/// Holds a placeholder work item; expunges it when dropped.
#[must_use = "the placeholder is released as soon as the guard is dropped"]
pub struct PlaceholderGuard {
    items: Arc<dyn WorkItemStore>,
    item_id: u64,
}

impl PlaceholderGuard {
    pub(crate) fn new(items: Arc<dyn WorkItemStore>, item_id: u64) -> Self {
        Self { items, item_id }
    }

    pub fn item_id(&self) -> u64 {
        self.item_id
    }
}

impl Drop for PlaceholderGuard {
    fn drop(&mut self) {
        if !self.items.expunge(self.item_id) {
            warn!(item = self.item_id, "placeholder work item was already gone");
        }
    }
}

impl WorkQueue {
    pub fn new(
        items: Arc<dyn WorkItemStore>,
        jobs: Arc<dyn JobStore>,
        settings: QueueSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            items,
            jobs,
            lanes: Mutex::new(HashMap::new()),
            workers: Arc::new(Semaphore::new(settings.worker_count.max(1))),
            settings,
        })
    }

    pub fn in_memory(settings: QueueSettings) -> Arc<Self> {
        Self::new(
            Arc::new(MemoryWorkItemStore::new()),
            Arc::new(MemoryJobStore::new()),
            settings,
        )
    }

    pub fn items(&self) -> &Arc<dyn WorkItemStore> {
        &self.items
    }

    pub fn jobs(&self) -> &Arc<dyn JobStore> {
        &self.jobs
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Claim `claim.owner`, persist a work item and enqueue it.
    ///
    /// `prepare` runs inside the store's atomic claim with the owner's active
    /// items; it validates and returns the payload. Returns without waiting
    /// for the job to run.
    pub fn submit<T, F>(
        self: &Arc<Self>,
        ctx: &CallContext,
        claim: Claim,
        dispatcher: Arc<dyn JobDispatcher>,
        prepare: F,
    ) -> Result<JobOutcome<T>>
    where
        T: DeserializeOwned,
        F: FnOnce(&[WorkItem]) -> Result<Value>,
    {
        let job_id = Uuid::new_v4();
        let item = self.items.claim(
            claim.owner,
            Box::new(|active: &[WorkItem]| {
                let payload = prepare(active)?;
                Ok(WorkItem::queued(job_id, &claim, payload, ctx))
            }),
        )?;
        self.jobs.create(JobRecord::for_item(&item));
        info!(
            job = %job_id,
            owner = %item.owner,
            dispatcher = %item.dispatcher,
            "work item submitted"
        );

        let outcome = JobOutcome::new(
            job_id,
            item.id,
            Arc::clone(&self.jobs),
            self.settings.poll_interval,
        );
        self.enqueue(QueuedJob { item, dispatcher });
        Ok(outcome)
    }

    /// Claim exclusivity for work that runs inline inside an already
    /// dispatched job.
    ///
    /// Items of the enclosing job are invisible to `check`, so the nested
    /// operation does not conflict with its own parent. The returned value is
    /// whatever `check` produced.
    pub fn create_placeholder<R, F>(
        &self,
        ctx: &CallContext,
        claim: Claim,
        check: F,
    ) -> Result<(PlaceholderGuard, R)>
    where
        F: FnOnce(&[WorkItem]) -> Result<R>,
    {
        let scope = ctx.scope().ok_or_else(|| {
            OrchestrationError::Unexpected("placeholder requested outside a dispatched job".into())
        })?;
        let mut produced = None;
        let item = self.items.claim(
            claim.owner,
            Box::new(|active: &[WorkItem]| {
                let others: Vec<WorkItem> = active
                    .iter()
                    .filter(|item| !item.belongs_to(scope.job_id))
                    .cloned()
                    .collect();
                produced = Some(check(&others)?);
                Ok(WorkItem::placeholder(scope, &claim, ctx.principal()))
            }),
        )?;
        debug!(
            item = item.id,
            parent = %scope.job_id,
            owner = %item.owner,
            "placeholder claimed"
        );

        let guard = PlaceholderGuard::new(Arc::clone(&self.items), item.id);
        let value = produced.ok_or_else(|| {
            OrchestrationError::Unexpected("placeholder check produced no value".into())
        })?;
        Ok((guard, value))
    }

    /// Remove a placeholder or work item ahead of time.
    pub fn expunge(&self, work_item_id: u64) -> bool {
        self.items.expunge(work_item_id)
    }

    fn lanes(&self) -> MutexGuard<'_, HashMap<OwnerRef, VecDeque<QueuedJob>>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enqueue(self: &Arc<Self>, job: QueuedJob) {
        let owner = job.item.owner;
        let start_lane = match self.lanes().entry(owner) {
            Entry::Occupied(mut lane) => {
                lane.get_mut().push_back(job);
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(VecDeque::from([job]));
                true
            }
        };
        if start_lane {
            let queue = Arc::clone(self);
            tokio::spawn(async move { queue.drain(owner).await });
        }
    }

    /// Run the owner's lane until it is empty. The lane entry stays present
    /// while a job runs, which is what keeps a second drainer from starting.
    async fn drain(self: Arc<Self>, owner: OwnerRef) {
        loop {
            let next = {
                let mut lanes = self.lanes();
                match lanes.get_mut(&owner).and_then(VecDeque::pop_front) {
                    Some(job) => job,
                    None => {
                        lanes.remove(&owner);
                        return;
                    }
                }
            };
            self.execute(next).await;
        }
    }

    async fn execute(&self, job: QueuedJob) {
        let QueuedJob { item, dispatcher } = job;
        let Ok(_permit) = Arc::clone(&self.workers).acquire_owned().await else {
            warn!(job = %item.job_id, "worker pool closed, dropping job");
            return;
        };

        self.items.update_step(item.id, WorkStep::InProgress);
        let ctx = CallContext::dispatched(
            item.principal.clone(),
            DispatchScope {
                job_id: item.job_id,
                dispatcher: item.dispatcher.clone(),
                owner: item.owner,
            },
        );
        debug!(job = %item.job_id, owner = %item.owner, "job started");

        let mut body = {
            let dispatcher = Arc::clone(&dispatcher);
            let ctx = ctx.clone();
            let payload = item.payload.clone();
            tokio::spawn(async move { dispatcher.run(ctx, payload).await })
        };

        let result = match tokio::time::timeout(self.settings.job_timeout, &mut body).await {
            Ok(Ok(Ok(value))) => JobResult::Succeeded(value),
            Ok(Ok(Err(err))) => {
                debug!(job = %item.job_id, error = %err, "job failed");
                JobResult::Failed(JobFailure::from(err))
            }
            Ok(Err(join)) if join.is_panic() => {
                JobResult::Failed(JobFailure::system("job body panicked"))
            }
            Ok(Err(join)) => {
                JobResult::Failed(JobFailure::system(format!("job body aborted: {join}")))
            }
            Err(_) => {
                // Compensation must not run while the body is still being polled.
                body.abort();
                let _ = body.await;
                warn!(
                    job = %item.job_id,
                    owner = %item.owner,
                    horizon = ?self.settings.job_timeout,
                    "job exceeded its horizon, abandoning"
                );
                dispatcher.abandon(ctx, item.payload.clone()).await;
                JobResult::Failed(JobFailure::from(OrchestrationError::Timeout(format!(
                    "job {} exceeded {:?}",
                    item.job_id, self.settings.job_timeout
                ))))
            }
        };

        let step = match result {
            JobResult::Succeeded(_) => WorkStep::Completed,
            JobResult::Failed(_) => WorkStep::Failed,
        };
        self.items.update_step(item.id, step);
        // The outcome only reads the job record, so the item can go before
        // the result is published.
        self.items.expunge(item.id);
        if !self.jobs.complete(item.job_id, result) {
            warn!(job = %item.job_id, "job was already completed");
        }
        info!(job = %item.job_id, owner = %item.owner, step = ?step, "job finished");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Account, EntityKind};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::time::sleep;

    fn settings() -> QueueSettings {
        QueueSettings {
            worker_count: 4,
            poll_interval: Duration::from_millis(5),
            job_timeout: Duration::from_secs(5),
        }
    }

    fn ctx() -> CallContext {
        CallContext::new(Account::user(1, "alice"))
    }

    fn claim(owner: OwnerRef) -> Claim {
        Claim::new(owner, EntityKind::Volume, "Recorder")
    }

    /// Records start/end per payload and how many run at once.
    #[derive(Default)]
    struct Recorder {
        log: Mutex<Vec<String>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl JobDispatcher for Recorder {
        fn name(&self) -> &'static str {
            "Recorder"
        }

        async fn run(&self, _ctx: CallContext, payload: Value) -> Result<Value> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.log.lock().unwrap().push(format!("start {payload}"));
            sleep(Duration::from_millis(15)).await;
            self.log.lock().unwrap().push(format!("end {payload}"));
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(payload)
        }
    }

    struct Failing;

    #[async_trait]
    impl JobDispatcher for Failing {
        fn name(&self) -> &'static str {
            "Failing"
        }

        async fn run(&self, _ctx: CallContext, _payload: Value) -> Result<Value> {
            Err(OrchestrationError::Execution("disk full".into()))
        }
    }

    struct Panicking;

    #[async_trait]
    impl JobDispatcher for Panicking {
        fn name(&self) -> &'static str {
            "Panicking"
        }

        async fn run(&self, _ctx: CallContext, _payload: Value) -> Result<Value> {
            panic!("boom");
        }
    }

    #[derive(Default)]
    struct Hanging {
        body_dropped: AtomicBool,
        abandoned: AtomicBool,
        /// Whether the body was already gone when `abandon` ran.
        dropped_before_abandon: AtomicBool,
    }

    struct SetOnDrop<'a>(&'a AtomicBool);

    impl Drop for SetOnDrop<'_> {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl JobDispatcher for Hanging {
        fn name(&self) -> &'static str {
            "Hanging"
        }

        async fn run(&self, _ctx: CallContext, _payload: Value) -> Result<Value> {
            let _alive = SetOnDrop(&self.body_dropped);
            sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        }

        async fn abandon(&self, _ctx: CallContext, _payload: Value) {
            let dropped = self.body_dropped.load(Ordering::SeqCst);
            self.dropped_before_abandon.store(dropped, Ordering::SeqCst);
            self.abandoned.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_owner_runs_in_submission_order() {
        let queue = WorkQueue::in_memory(settings());
        let recorder = Arc::new(Recorder::default());
        let ctx = ctx();

        let outcomes: Vec<JobOutcome<u64>> = (1..=3u64)
            .map(|n| {
                queue
                    .submit(&ctx, claim(OwnerRef::vm(7)), recorder.clone(), |_| Ok(Value::from(n)))
                    .unwrap()
            })
            .collect();
        for (n, outcome) in (1..=3u64).zip(outcomes) {
            assert_eq!(outcome.get().await.unwrap(), n);
        }

        let log = recorder.log.lock().unwrap().clone();
        assert_eq!(
            log,
            vec!["start 1", "end 1", "start 2", "end 2", "start 3", "end 3"]
        );
        assert_eq!(recorder.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn different_owners_run_concurrently() {
        let queue = WorkQueue::in_memory(settings());
        let recorder = Arc::new(Recorder::default());
        let ctx = ctx();

        let outcomes: Vec<JobOutcome<u64>> = (1..=3u64)
            .map(|n| {
                queue
                    .submit(&ctx, claim(OwnerRef::vm(n)), recorder.clone(), |_| Ok(Value::from(n)))
                    .unwrap()
            })
            .collect();
        for outcome in outcomes {
            outcome.get().await.unwrap();
        }
        assert!(recorder.peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn worker_pool_bounds_concurrency() {
        let queue = WorkQueue::in_memory(QueueSettings {
            worker_count: 1,
            ..settings()
        });
        let recorder = Arc::new(Recorder::default());
        let ctx = ctx();

        let outcomes: Vec<JobOutcome<u64>> = (1..=3u64)
            .map(|n| {
                queue
                    .submit(&ctx, claim(OwnerRef::vm(n)), recorder.clone(), |_| Ok(Value::from(n)))
                    .unwrap()
            })
            .collect();
        for outcome in outcomes {
            outcome.get().await.unwrap();
        }
        assert_eq!(recorder.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_prepare_queues_nothing() {
        let queue = WorkQueue::in_memory(settings());
        let err = queue
            .submit::<u64, _>(&ctx(), claim(OwnerRef::vm(7)), Arc::new(Recorder::default()), |_| {
                Err(OrchestrationError::ConcurrentOperation("vm-7 busy".into()))
            })
            .err()
            .unwrap();
        assert!(err.is_concurrency());
        assert!(queue.items().list().is_empty());
        assert!(queue.jobs().list().is_empty());
    }

    #[tokio::test]
    async fn failure_is_delivered_and_item_removed() {
        let queue = WorkQueue::in_memory(settings());
        let outcome = queue
            .submit::<u64, _>(&ctx(), claim(OwnerRef::vm(7)), Arc::new(Failing), |_| {
                Ok(Value::Null)
            })
            .unwrap();
        let item_id = outcome.work_item_id();

        let err = outcome.get().await.unwrap_err();
        assert_eq!(err, OrchestrationError::Execution("disk full".into()));
        assert!(queue.items().find(item_id).is_none());
    }

    #[tokio::test]
    async fn panic_becomes_unexpected_failure() {
        let queue = WorkQueue::in_memory(settings());
        let err = queue
            .submit::<u64, _>(&ctx(), claim(OwnerRef::vm(7)), Arc::new(Panicking), |_| {
                Ok(Value::Null)
            })
            .unwrap()
            .get()
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Unexpected(ref msg) if msg.contains("panicked")));
    }

    #[tokio::test]
    async fn job_past_horizon_is_abandoned() {
        let queue = WorkQueue::in_memory(QueueSettings {
            job_timeout: Duration::from_millis(30),
            ..settings()
        });
        let hanging = Arc::new(Hanging::default());
        let outcome = queue
            .submit::<Value, _>(&ctx(), claim(OwnerRef::vm(7)), hanging.clone(), |_| {
                Ok(Value::Null)
            })
            .unwrap();
        let item_id = outcome.work_item_id();

        let err = outcome.get().await.unwrap_err();
        assert!(matches!(err, OrchestrationError::Timeout(_)));
        assert!(hanging.abandoned.load(Ordering::SeqCst));
        assert!(hanging.dropped_before_abandon.load(Ordering::SeqCst));
        assert!(queue.items().find(item_id).is_none());
    }

    #[tokio::test]
    async fn unread_outcome_leaves_no_item_behind() {
        let queue = WorkQueue::in_memory(settings());
        let recorder = Arc::new(Recorder::default());
        let outcome = queue
            .submit::<u64, _>(&ctx(), claim(OwnerRef::vm(7)), recorder, |_| {
                Ok(Value::from(1u64))
            })
            .unwrap();
        let job_id = outcome.job_id();

        let err = outcome
            .with_deadline(Duration::from_millis(1))
            .get()
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestrationError::Timeout(_)));

        for _ in 0..200 {
            if queue.jobs().find_job_by_id(job_id).is_some_and(|job| job.is_done()) {
                break;
            }
            sleep(Duration::from_millis(5)).await;
        }
        assert!(queue.jobs().find_job_by_id(job_id).unwrap().is_done());
        assert!(queue.items().list().is_empty());
        assert_eq!(queue.items().stats().expunged, 1);
    }

    #[tokio::test]
    async fn placeholder_outside_job_is_rejected() {
        let queue = WorkQueue::in_memory(settings());
        let err = queue
            .create_placeholder(&ctx(), claim(OwnerRef::vm(7)), |_| Ok(()))
            .err()
            .unwrap();
        assert!(matches!(err, OrchestrationError::Unexpected(_)));
    }

    #[tokio::test]
    async fn placeholder_ignores_parent_and_is_released_on_drop() {
        let queue = WorkQueue::in_memory(settings());
        let parent = Uuid::new_v4();
        let job_ctx = CallContext::dispatched(
            Account::user(1, "alice"),
            DispatchScope {
                job_id: parent,
                dispatcher: "Recorder".into(),
                owner: OwnerRef::vm(7),
            },
        );
        // The parent's own queued item is active on the same owner.
        queue
            .items()
            .claim(
                OwnerRef::vm(7),
                Box::new(|_: &[WorkItem]| {
                    Ok(WorkItem::queued(parent, &claim(OwnerRef::vm(7)), Value::Null, &ctx()))
                }),
            )
            .unwrap();

        let (guard, seen) = queue
            .create_placeholder(&job_ctx, claim(OwnerRef::vm(7)), |others| Ok(others.len()))
            .unwrap();
        assert_eq!(seen, 0);
        assert_eq!(queue.items().active_for(OwnerRef::vm(7)).len(), 2);

        drop(guard);
        assert_eq!(queue.items().active_for(OwnerRef::vm(7)).len(), 1);
        assert_eq!(queue.items().stats().placeholders, 1);
    }

    #[tokio::test]
    async fn placeholder_still_sees_unrelated_work() {
        let queue = WorkQueue::in_memory(settings());
        queue
            .items()
            .claim(
                OwnerRef::vm(7),
                Box::new(|_: &[WorkItem]| {
                    let unrelated = claim(OwnerRef::vm(7));
                    Ok(WorkItem::queued(Uuid::new_v4(), &unrelated, Value::Null, &ctx()))
                }),
            )
            .unwrap();
        let job_ctx = CallContext::dispatched(
            Account::user(1, "alice"),
            DispatchScope {
                job_id: Uuid::new_v4(),
                dispatcher: "Recorder".into(),
                owner: OwnerRef::vm(7),
            },
        );

        let err = queue
            .create_placeholder(&job_ctx, claim(OwnerRef::vm(7)), |others| {
                if others.is_empty() {
                    Ok(())
                } else {
                    Err(OrchestrationError::ConcurrentOperation("vm-7 busy".into()))
                }
            })
            .err()
            .unwrap();
        assert!(err.is_concurrency());
    }
}
