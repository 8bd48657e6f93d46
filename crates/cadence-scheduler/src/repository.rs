//! Persistence seams and an in-process implementation of both.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use crate::error::{Result, SchedulerError};
use crate::job::Job;
use crate::log::Log;
use crate::types::JobId;

pub trait JobRepository: Send + Sync {
    /// Jobs with `next_run <= now` that are neither disabled nor running,
    /// earliest `next_run` first.
    fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Insert or replace the job with `job.id`. Must be visible to the next
    /// `due_jobs` call as soon as it returns.
    fn save(&self, job: &Job) -> Result<()>;

    fn get(&self, id: &JobId) -> Result<Option<Job>>;

    /// Every job, enabled first, then by `next_run`.
    fn list(&self) -> Result<Vec<Job>>;

    /// Remove a job and its logs. `JobNotFound` if absent.
    fn delete(&self, id: &JobId) -> Result<()>;
}

pub trait LogRepository: Send + Sync {
    fn create(&self, log: &Log) -> Result<()>;

    /// Logs of one job, newest first.
    fn for_job(&self, job_id: &JobId) -> Result<Vec<Log>>;
}

/// Ordering shared by `list` implementations: enabled jobs first, then by
/// ascending `next_run` with unset values last.
pub fn listing_order(a: &Job, b: &Job) -> std::cmp::Ordering {
    a.disabled
        .cmp(&b.disabled)
        .then_with(|| match (a.next_run, b.next_run) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        })
        .then_with(|| a.name.cmp(&b.name))
}

/// Mutex-guarded maps; every call sees every completed write.
#[derive(Debug, Default)]
pub struct MemoryStore {
    jobs: Mutex<BTreeMap<JobId, Job>>,
    logs: Mutex<Vec<Log>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn jobs(&self) -> Result<MutexGuard<'_, BTreeMap<JobId, Job>>> {
        self.jobs
            .lock()
            .map_err(|_| SchedulerError::Storage("job map lock poisoned".to_string()))
    }

    fn logs(&self) -> Result<MutexGuard<'_, Vec<Log>>> {
        self.logs
            .lock()
            .map_err(|_| SchedulerError::Storage("log list lock poisoned".to_string()))
    }
}

impl JobRepository for MemoryStore {
    fn due_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut due: Vec<Job> = self
            .jobs()?
            .values()
            .filter(|job| job.is_due(now))
            .cloned()
            .collect();
        due.sort_by(listing_order);
        Ok(due)
    }

    fn save(&self, job: &Job) -> Result<()> {
        self.jobs()?.insert(job.id.clone(), job.clone());
        Ok(())
    }

    fn get(&self, id: &JobId) -> Result<Option<Job>> {
        Ok(self.jobs()?.get(id).cloned())
    }

    fn list(&self) -> Result<Vec<Job>> {
        let mut all: Vec<Job> = self.jobs()?.values().cloned().collect();
        all.sort_by(listing_order);
        Ok(all)
    }

    fn delete(&self, id: &JobId) -> Result<()> {
        if self.jobs()?.remove(id).is_none() {
            return Err(SchedulerError::JobNotFound { id: id.to_string() });
        }
        self.logs()?.retain(|log| &log.job_id != id);
        Ok(())
    }
}

impl LogRepository for MemoryStore {
    fn create(&self, log: &Log) -> Result<()> {
        self.logs()?.push(log.clone());
        Ok(())
    }

    fn for_job(&self, job_id: &JobId) -> Result<Vec<Log>> {
        let mut logs: Vec<Log> = self
            .logs()?
            .iter()
            .filter(|log| &log.job_id == job_id)
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.run_date.cmp(&a.run_date));
        Ok(logs)
    }
}
