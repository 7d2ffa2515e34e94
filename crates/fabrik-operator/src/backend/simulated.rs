//! In-process backend used by tests and by `fabrikd standalone`.
//!
//! Jobs start `processing` and either stay there until scripted with
//! [`SimulatedBackend::set_state`] or complete on their own after a number
//! of status polls. Transient failures can be injected for submit and poll.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use super::{BackendClient, BackendJob, BackendKind, BackendStatus};
use crate::error::{OperatorError, OperatorResult};

struct SimJob {
    job: BackendJob,
    state: String,
    polls: u32,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, SimJob>,
    by_key: HashMap<String, String>,
    order: Vec<String>,
    next_id: u64,
    failing_submits: u32,
    failing_polls: u32,
}

pub struct SimulatedBackend {
    kind: BackendKind,
    auto_complete_after: Option<u32>,
    inner: Mutex<Inner>,
}

impl SimulatedBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            kind,
            auto_complete_after: None,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Report success once a job has been polled `polls` times.
    pub fn with_auto_complete(mut self, polls: u32) -> Self {
        self.auto_complete_after = Some(polls);
        self
    }

    /// Backend-native spelling of a running job.
    pub fn running_state(&self) -> &'static str {
        "processing"
    }

    /// Backend-native spelling of a successful job.
    pub fn success_state(&self) -> &'static str {
        match self.kind {
            BackendKind::Director => "done",
            BackendKind::Snapshot | BackendKind::Agent => "succeeded",
        }
    }

    /// Backend-native spelling of a failed job.
    pub fn failure_state(&self) -> &'static str {
        match self.kind {
            BackendKind::Director => "error",
            BackendKind::Snapshot | BackendKind::Agent => "failed",
        }
    }

    /// Backend-native spelling of a cancelled job.
    pub fn cancelled_state(&self) -> &'static str {
        match self.kind {
            BackendKind::Director => "cancelled",
            BackendKind::Snapshot | BackendKind::Agent => "aborted",
        }
    }

    /// Force the raw state of a job. Returns false for an unknown id.
    pub async fn set_state(&self, job_id: &str, state: &str) -> bool {
        let mut inner = self.inner.lock().await;
        match inner.jobs.get_mut(job_id) {
            Some(job) => {
                job.state = state.to_string();
                true
            }
            None => false,
        }
    }

    /// Make the next `n` status queries fail with a backend error.
    pub async fn fail_next_polls(&self, n: u32) {
        self.inner.lock().await.failing_polls = n;
    }

    /// Make the next `n` submissions fail with a backend error.
    pub async fn fail_next_submits(&self, n: u32) {
        self.inner.lock().await.failing_submits = n;
    }

    /// Distinct jobs in submission order.
    pub async fn submitted_jobs(&self) -> Vec<BackendJob> {
        let inner = self.inner.lock().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.jobs.get(id))
            .map(|j| j.job.clone())
            .collect()
    }

    pub async fn job_id_for(&self, idempotency_key: &str) -> Option<String> {
        self.inner.lock().await.by_key.get(idempotency_key).cloned()
    }

    pub async fn raw_state(&self, job_id: &str) -> Option<String> {
        self.inner
            .lock()
            .await
            .jobs
            .get(job_id)
            .map(|j| j.state.clone())
    }
}

#[async_trait]
impl BackendClient for SimulatedBackend {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn submit(&self, job: &BackendJob) -> OperatorResult<String> {
        let mut inner = self.inner.lock().await;
        if inner.failing_submits > 0 {
            inner.failing_submits -= 1;
            return Err(OperatorError::backend(self.kind, "submit rejected (simulated)"));
        }
        if let Some(existing) = inner.by_key.get(&job.idempotency_key) {
            debug!(backend = %self.kind, job_id = %existing, "duplicate submission");
            return Ok(existing.clone());
        }

        inner.next_id += 1;
        let job_id = format!("{}-{}", self.kind, inner.next_id);
        inner
            .by_key
            .insert(job.idempotency_key.clone(), job_id.clone());
        inner.order.push(job_id.clone());
        inner.jobs.insert(
            job_id.clone(),
            SimJob {
                job: job.clone(),
                state: self.running_state().to_string(),
                polls: 0,
            },
        );
        debug!(backend = %self.kind, %job_id, operation = %job.operation, "job submitted");
        Ok(job_id)
    }

    async fn get_task_status(&self, job_id: &str) -> OperatorResult<BackendStatus> {
        let mut inner = self.inner.lock().await;
        if inner.failing_polls > 0 {
            inner.failing_polls -= 1;
            return Err(OperatorError::backend(self.kind, "status unavailable (simulated)"));
        }
        let success = self.success_state();
        let running = self.running_state();
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| OperatorError::backend(self.kind, format!("unknown job {job_id}")))?;
        job.polls += 1;
        if let Some(after) = self.auto_complete_after {
            if job.state == running && job.polls >= after {
                job.state = success.to_string();
            }
        }
        Ok(BackendStatus {
            state: job.state.clone(),
            description: format!("{} {} {}", job.job.operation, job.job.instance_id, job.state),
        })
    }

    async fn cancel(&self, job_id: &str) -> OperatorResult<()> {
        let cancelled = self.cancelled_state();
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| OperatorError::backend(self.kind, format!("unknown job {job_id}")))?;
        if self.kind.canonical_state(&job.state).is_finished() {
            return Ok(());
        }
        job.state = cancelled.to_string();
        debug!(backend = %self.kind, %job_id, "job cancelled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::JobState;
    use serde_json::Value;

    fn job(key: &str) -> BackendJob {
        BackendJob {
            kind: BackendKind::Snapshot,
            operation: "backup".to_string(),
            idempotency_key: key.to_string(),
            instance_id: "X".to_string(),
            deployment_name: None,
            payload: Value::Null,
        }
    }

    #[tokio::test]
    async fn submission_is_idempotent() {
        let backend = SimulatedBackend::new(BackendKind::Snapshot);
        let a = backend.submit(&job("k1")).await.unwrap();
        let b = backend.submit(&job("k1")).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(backend.submitted_jobs().await.len(), 1);
        assert_eq!(backend.job_id_for("k1").await, Some(a));
    }

    #[tokio::test]
    async fn auto_completes_after_polls() {
        let backend = SimulatedBackend::new(BackendKind::Director).with_auto_complete(2);
        let id = backend.submit(&job("k")).await.unwrap();
        let first = backend.get_task_status(&id).await.unwrap();
        assert_eq!(first.state, "processing");
        let second = backend.get_task_status(&id).await.unwrap();
        assert_eq!(
            BackendKind::Director.map_state(&second.state),
            Some(JobState::Succeeded)
        );
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let backend = SimulatedBackend::new(BackendKind::Agent);
        let id = backend.submit(&job("k")).await.unwrap();
        backend.fail_next_polls(1).await;
        let err = backend.get_task_status(&id).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(backend.get_task_status(&id).await.is_ok());
    }

    #[tokio::test]
    async fn cancel_only_running_jobs() {
        let backend = SimulatedBackend::new(BackendKind::Snapshot);
        let id = backend.submit(&job("k")).await.unwrap();
        backend.cancel(&id).await.unwrap();
        assert_eq!(backend.raw_state(&id).await.as_deref(), Some("aborted"));

        let done = backend.submit(&job("k2")).await.unwrap();
        backend.set_state(&done, "succeeded").await;
        backend.cancel(&done).await.unwrap();
        assert_eq!(backend.raw_state(&done).await.as_deref(), Some("succeeded"));
    }
}
