// ABOUTME: Job runner: dispatches a job to the pull or push engine by mode
// ABOUTME: Holds a per-job lease so two runs of the same job id never overlap

use anyhow::Result;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::info;

use crate::config::{Job, JobKind};
use crate::error::SyncError;
use crate::pull::{PullEngine, PullResult};
use crate::push::{PushEngine, PushResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Pull(PullResult),
    Push(PushResult),
}

/// Released when dropped, including when the run fails or is cancelled.
struct Lease {
    held: Arc<Mutex<HashSet<String>>>,
    job_id: String,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.remove(&self.job_id);
    }
}

pub struct JobRunner {
    pull: PullEngine,
    push: PushEngine,
    held: Arc<Mutex<HashSet<String>>>,
}

impl JobRunner {
    pub fn new(pull: PullEngine, push: PushEngine) -> Self {
        Self {
            pull,
            push,
            held: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn acquire(&self, job_id: &str) -> Result<Lease> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(job_id.to_string()) {
            return Err(SyncError::Busy(job_id.to_string()).into());
        }
        Ok(Lease {
            held: Arc::clone(&self.held),
            job_id: job_id.to_string(),
        })
    }

    pub async fn run(&self, job: &Job) -> Result<RunOutcome> {
        let _lease = self.acquire(&job.id)?;
        info!(job = %job.id, mode = job.mode_name(), "Running job");
        match &job.kind {
            JobKind::Push(_) => Ok(RunOutcome::Push(self.push.run(job).await?)),
            JobKind::Pull(_) => Ok(RunOutcome::Pull(self.pull.run(job).await?)),
        }
    }
}
