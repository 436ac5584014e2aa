use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use tokio::time::sleep;
use tracing::debug;

use super::job::{JobId, JobRecord, JobResult, JobStore};
use crate::error::{OrchestrationError, Result};

/// Joins a caller to a submitted job.
///
/// The submitter owns the outcome; the job itself is shared and looked up by
/// id from job storage on every poll. The queue removes the work item when
/// the job finishes, so dropping an outcome unread leaks nothing.
pub struct JobOutcome<T> {
    job_id: JobId,
    work_item_id: u64,
    jobs: Arc<dyn JobStore>,
    poll_interval: Duration,
    deadline: Option<Duration>,
    _result: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> JobOutcome<T> {
    pub(crate) fn new(
        job_id: JobId,
        work_item_id: u64,
        jobs: Arc<dyn JobStore>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            job_id,
            work_item_id,
            jobs,
            poll_interval,
            deadline: None,
            _result: PhantomData,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn work_item_id(&self) -> u64 {
        self.work_item_id
    }

    /// Stop waiting after `deadline`. The job keeps running.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn is_done(&self) -> bool {
        self.jobs
            .find_job_by_id(self.job_id)
            .is_some_and(|job| job.is_done())
    }

    /// Wait for the job to finish and return its typed result.
    ///
    /// Domain failures come back as the error the job body raised;
    /// unexpected failures are wrapped.
    pub async fn get(self) -> Result<T> {
        let started = Instant::now();
        let record = loop {
            let record = self.jobs.find_job_by_id(self.job_id).ok_or_else(|| {
                OrchestrationError::Unexpected(format!("job {} disappeared", self.job_id))
            })?;
            if record.is_done() {
                break record;
            }
            if let Some(deadline) = self.deadline
                && started.elapsed() >= deadline
            {
                return Err(OrchestrationError::Timeout(format!(
                    "job {} still running after {deadline:?}",
                    self.job_id
                )));
            }
            sleep(self.poll_interval).await;
        };

        debug!(job = %self.job_id, status = ?record.status, "job finished");
        self.unmarshal(record)
    }

    fn unmarshal(&self, record: JobRecord) -> Result<T> {
        let job_id = self.job_id.to_string();
        match record.result {
            Some(JobResult::Succeeded(value)) => serde_json::from_value(value).map_err(|e| {
                OrchestrationError::Unexpected(format!(
                    "job {job_id} returned an unreadable result: {e}"
                ))
            }),
            Some(JobResult::Failed(failure)) => Err(failure.into_error(&job_id)),
            None => Err(OrchestrationError::Unexpected(format!(
                "job {job_id} finished without a result"
            ))),
        }
    }
}
