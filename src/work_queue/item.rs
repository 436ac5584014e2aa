use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::job::JobId;
use crate::context::{CallContext, DispatchScope};
use crate::error::Result;
use crate::model::{Account, EntityKind, OwnerRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkStep {
    Starting,
    InProgress,
    Completed,
    Failed,
}

/// What a caller wants to claim on an owning resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub owner: OwnerRef,
    pub entity_kind: EntityKind,
    pub entity_id: Option<u64>,
    pub dispatcher: &'static str,
}

impl Claim {
    pub fn new(owner: OwnerRef, entity_kind: EntityKind, dispatcher: &'static str) -> Self {
        Self {
            owner,
            entity_kind,
            entity_id: None,
            dispatcher,
        }
    }

    pub fn entity(mut self, id: u64) -> Self {
        self.entity_id = Some(id);
        self
    }
}

/// One unit of serialized work against an owning resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub id: u64,
    pub job_id: JobId,
    pub owner: OwnerRef,
    pub entity_kind: EntityKind,
    pub entity_id: Option<u64>,
    pub dispatcher: String,
    pub payload: serde_json::Value,
    pub step: WorkStep,
    pub related_job: Option<JobId>,
    /// Claims exclusivity for inline work; never executed.
    pub placeholder: bool,
    pub principal: Account,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkItem {
    pub(crate) fn queued(
        job_id: JobId,
        claim: &Claim,
        payload: serde_json::Value,
        ctx: &CallContext,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            job_id,
            owner: claim.owner,
            entity_kind: claim.entity_kind,
            entity_id: claim.entity_id,
            dispatcher: claim.dispatcher.to_string(),
            payload,
            step: WorkStep::Starting,
            related_job: ctx.scope().map(|scope| scope.job_id),
            placeholder: false,
            principal: ctx.principal().clone(),
            created_at: now,
            updated_at: now,
        }
    }

    pub(crate) fn placeholder(scope: &DispatchScope, claim: &Claim, principal: &Account) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            job_id: Uuid::new_v4(),
            owner: claim.owner,
            entity_kind: claim.entity_kind,
            entity_id: claim.entity_id,
            dispatcher: claim.dispatcher.to_string(),
            payload: serde_json::Value::Null,
            step: WorkStep::InProgress,
            related_job: Some(scope.job_id),
            placeholder: true,
            principal: principal.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    /// A placeholder held outside any job, e.g. by a maintenance pass.
    pub(crate) fn hold(claim: &Claim, principal: &Account) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            job_id: Uuid::new_v4(),
            owner: claim.owner,
            entity_kind: claim.entity_kind,
            entity_id: claim.entity_id,
            dispatcher: claim.dispatcher.to_string(),
            payload: serde_json::Value::Null,
            step: WorkStep::InProgress,
            related_job: None,
            placeholder: true,
            principal: principal.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(self.step, WorkStep::Starting | WorkStep::InProgress)
    }

    /// Whether this item belongs to the job `job_id`, directly or as one of
    /// its placeholders.
    pub fn belongs_to(&self, job_id: JobId) -> bool {
        self.job_id == job_id || self.related_job == Some(job_id)
    }
}

/// Counters kept by the coordination store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkItemStats {
    pub queued: u64,
    pub placeholders: u64,
    pub expunged: u64,
}

pub type Prepare<'a> = Box<dyn FnOnce(&[WorkItem]) -> Result<WorkItem> + 'a>;

/// Shared coordination state backing the queue's exclusivity.
///
/// In a clustered deployment this lives in shared storage, so the atomic
/// claim holds across processes and not only across tasks.
pub trait WorkItemStore: Send + Sync {
    /// Atomically hand the owner's active items to `prepare` and insert the
    /// item it builds. Nothing is inserted when `prepare` fails.
    fn claim(&self, owner: OwnerRef, prepare: Prepare<'_>) -> Result<WorkItem>;

    fn find(&self, id: u64) -> Option<WorkItem>;

    fn update_step(&self, id: u64, step: WorkStep) -> bool;

    fn expunge(&self, id: u64) -> bool;

    fn active_for(&self, owner: OwnerRef) -> Vec<WorkItem>;

    fn list(&self) -> Vec<WorkItem>;

    fn stats(&self) -> WorkItemStats;
}

#[derive(Debug)]
struct Items {
    items: BTreeMap<u64, WorkItem>,
    next_id: u64,
    stats: WorkItemStats,
}

#[derive(Debug)]
pub struct MemoryWorkItemStore {
    inner: Mutex<Items>,
}

impl Default for MemoryWorkItemStore {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Items {
                items: BTreeMap::new(),
                next_id: 1,
                stats: WorkItemStats::default(),
            }),
        }
    }
}

impl MemoryWorkItemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Items> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl WorkItemStore for MemoryWorkItemStore {
    fn claim(&self, owner: OwnerRef, prepare: Prepare<'_>) -> Result<WorkItem> {
        let mut inner = self.lock();
        let active: Vec<WorkItem> = inner
            .items
            .values()
            .filter(|item| item.owner == owner && item.is_active())
            .cloned()
            .collect();
        let mut item = prepare(&active)?;
        item.id = inner.next_id;
        inner.next_id += 1;
        if item.placeholder {
            inner.stats.placeholders += 1;
        } else {
            inner.stats.queued += 1;
        }
        inner.items.insert(item.id, item.clone());
        Ok(item)
    }

    fn find(&self, id: u64) -> Option<WorkItem> {
        self.lock().items.get(&id).cloned()
    }

    fn update_step(&self, id: u64, step: WorkStep) -> bool {
        match self.lock().items.get_mut(&id) {
            Some(item) => {
                item.step = step;
                item.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    fn expunge(&self, id: u64) -> bool {
        let mut inner = self.lock();
        let removed = inner.items.remove(&id).is_some();
        if removed {
            inner.stats.expunged += 1;
        }
        removed
    }

    fn active_for(&self, owner: OwnerRef) -> Vec<WorkItem> {
        self.lock()
            .items
            .values()
            .filter(|item| item.owner == owner && item.is_active())
            .cloned()
            .collect()
    }

    fn list(&self) -> Vec<WorkItem> {
        self.lock().items.values().cloned().collect()
    }

    fn stats(&self) -> WorkItemStats {
        self.lock().stats
    }
}
