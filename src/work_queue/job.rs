use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::item::WorkItem;
use crate::error::JobFailure;
use crate::model::OwnerRef;
use crate::store::{read, write};

pub type JobId = Uuid;

/// Tracks the lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    InProgress,
    Succeeded,
    Failed,
}

/// The marshalled result of a finished job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobResult {
    Succeeded(serde_json::Value),
    Failed(JobFailure),
}

/// One asynchronous job as seen by the job storage collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub dispatcher: String,
    pub owner: OwnerRef,
    pub account_id: u64,
    pub status: JobStatus,
    pub result: Option<JobResult>,
    /// The job this one was started from, if any.
    pub related: Option<JobId>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn for_item(item: &WorkItem) -> Self {
        Self {
            id: item.job_id,
            dispatcher: item.dispatcher.clone(),
            owner: item.owner,
            account_id: item.principal.id,
            status: JobStatus::InProgress,
            result: None,
            related: item.related_job,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status != JobStatus::InProgress
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.completed_at
            .map(|done| (done - self.created_at).num_milliseconds())
    }
}

pub trait JobStore: Send + Sync {
    fn create(&self, record: JobRecord);

    fn find_job_by_id(&self, id: JobId) -> Option<JobRecord>;

    /// Record the result of an in-progress job. The first completion wins;
    /// later ones return `false`.
    fn complete(&self, id: JobId, result: JobResult) -> bool;

    /// Drop finished jobs completed at or before `older_than`. Jobs still in
    /// progress are kept whatever their age.
    fn expire(&self, older_than: DateTime<Utc>) -> usize;

    fn list(&self) -> Vec<JobRecord>;
}

#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JobStore for MemoryJobStore {
    fn create(&self, record: JobRecord) {
        write(&self.jobs).insert(record.id, record);
    }

    fn find_job_by_id(&self, id: JobId) -> Option<JobRecord> {
        read(&self.jobs).get(&id).cloned()
    }

    fn complete(&self, id: JobId, result: JobResult) -> bool {
        let mut jobs = write(&self.jobs);
        match jobs.get_mut(&id) {
            Some(job) if !job.is_done() => {
                job.status = match result {
                    JobResult::Succeeded(_) => JobStatus::Succeeded,
                    JobResult::Failed(_) => JobStatus::Failed,
                };
                job.result = Some(result);
                job.completed_at = Some(Utc::now());
                true
            }
            _ => false,
        }
    }

    fn expire(&self, older_than: DateTime<Utc>) -> usize {
        let mut jobs = write(&self.jobs);
        let before = jobs.len();
        jobs.retain(|_, job| !job.completed_at.is_some_and(|done| done <= older_than));
        before - jobs.len()
    }

    fn list(&self) -> Vec<JobRecord> {
        let mut jobs: Vec<JobRecord> = read(&self.jobs).values().cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OrchestrationError;

    fn record() -> JobRecord {
        JobRecord {
            id: Uuid::new_v4(),
            dispatcher: "VolumeWork".into(),
            owner: OwnerRef::volume(3),
            account_id: 1,
            status: JobStatus::InProgress,
            result: None,
            related: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    #[test]
    fn first_completion_wins() {
        let store = MemoryJobStore::new();
        let job = record();
        let id = job.id;
        store.create(job);

        assert!(store.complete(id, JobResult::Succeeded(serde_json::json!(42))));
        assert!(!store.complete(
            id,
            JobResult::Failed(JobFailure::from(OrchestrationError::Timeout("late".into())))
        ));

        let stored = store.find_job_by_id(id).unwrap();
        assert_eq!(stored.status, JobStatus::Succeeded);
        assert_eq!(stored.result, Some(JobResult::Succeeded(serde_json::json!(42))));
        assert!(stored.duration_ms().is_some());
    }

    #[test]
    fn unknown_job_cannot_complete() {
        let store = MemoryJobStore::new();
        assert!(!store.complete(Uuid::new_v4(), JobResult::Succeeded(serde_json::Value::Null)));
        assert!(store.list().is_empty());
    }

    #[test]
    fn expire_drops_only_old_finished_jobs() {
        let store = MemoryJobStore::new();
        let finished = record();
        let running = record();
        let (finished_id, running_id) = (finished.id, running.id);
        store.create(finished);
        store.create(running);
        store.complete(finished_id, JobResult::Succeeded(serde_json::Value::Null));

        let long_ago = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(store.expire(long_ago), 0);

        assert_eq!(store.expire(Utc::now()), 1);
        assert!(store.find_job_by_id(finished_id).is_none());
        assert!(store.find_job_by_id(running_id).is_some());
    }

    #[test]
    fn job_record_serialization_roundtrip() {
        let job = record();
        let json = serde_json::to_string(&job).unwrap();
        let back: JobRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.status, JobStatus::InProgress);
    }
}
