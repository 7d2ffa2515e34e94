//! Backend job contract.
//!
//! Deployment-director tasks, snapshot jobs and agent calls are long-running
//! and have no push channel. Operators submit a [`BackendJob`] and record the
//! returned handle; pollers query it with
//! [`BackendClient::get_task_status`] and map the backend's own state string
//! onto [`JobState`] through [`BackendKind::map_state`].

pub mod simulated;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::error::OperatorResult;

pub use simulated::SimulatedBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Director,
    Snapshot,
    Agent,
}

/// Canonical job outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    InProgress,
    Succeeded,
    Failed,
    Aborted,
}

impl JobState {
    pub fn is_finished(&self) -> bool {
        !matches!(self, JobState::InProgress)
    }
}

impl BackendKind {
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Director => "director",
            BackendKind::Snapshot => "snapshot",
            BackendKind::Agent => "agent",
        }
    }

    /// Map a backend-specific state string, `None` when unrecognised.
    pub fn map_state(&self, raw: &str) -> Option<JobState> {
        let raw = raw.trim().to_ascii_lowercase();
        let state = match (self, raw.as_str()) {
            (BackendKind::Director, "queued" | "processing" | "cancelling") => JobState::InProgress,
            (BackendKind::Director, "done") => JobState::Succeeded,
            (BackendKind::Director, "error" | "timeout") => JobState::Failed,
            (BackendKind::Director, "cancelled") => JobState::Aborted,

            (
                BackendKind::Snapshot,
                "pending" | "creating" | "copying" | "in progress" | "processing" | "aborting",
            ) => JobState::InProgress,
            (BackendKind::Snapshot, "succeeded" | "completed") => JobState::Succeeded,
            (BackendKind::Snapshot, "failed" | "error") => JobState::Failed,
            (BackendKind::Snapshot, "aborted") => JobState::Aborted,

            (BackendKind::Agent, "queued" | "processing") => JobState::InProgress,
            (BackendKind::Agent, "succeeded") => JobState::Succeeded,
            (BackendKind::Agent, "failed") => JobState::Failed,
            (BackendKind::Agent, "aborted") => JobState::Aborted,

            _ => return None,
        };
        Some(state)
    }

    /// Like [`map_state`](Self::map_state), treating unknown states as still
    /// running. The poller timeout bounds how long that can last.
    pub fn canonical_state(&self, raw: &str) -> JobState {
        self.map_state(raw).unwrap_or_else(|| {
            warn!(backend = %self, state = raw, "unrecognised backend state");
            JobState::InProgress
        })
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A unit of work submitted to a backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendJob {
    pub kind: BackendKind,
    pub operation: String,
    /// Submitting the same key twice returns the first job's handle.
    pub idempotency_key: String,
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_name: Option<String>,
    #[serde(default)]
    pub payload: Value,
}

/// Raw status as reported by the backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendStatus {
    pub state: String,
    #[serde(default)]
    pub description: String,
}

#[async_trait]
pub trait BackendClient: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Start a job and return its handle.
    async fn submit(&self, job: &BackendJob) -> OperatorResult<String>;

    async fn get_task_status(&self, job_id: &str) -> OperatorResult<BackendStatus>;

    /// Ask the backend to stop a job. Best effort; the job may still finish.
    async fn cancel(&self, job_id: &str) -> OperatorResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn director_states() {
        let d = BackendKind::Director;
        assert_eq!(d.map_state("queued"), Some(JobState::InProgress));
        assert_eq!(d.map_state("processing"), Some(JobState::InProgress));
        assert_eq!(d.map_state("done"), Some(JobState::Succeeded));
        assert_eq!(d.map_state("error"), Some(JobState::Failed));
        assert_eq!(d.map_state("timeout"), Some(JobState::Failed));
        assert_eq!(d.map_state("cancelled"), Some(JobState::Aborted));
    }

    #[test]
    fn snapshot_states() {
        let s = BackendKind::Snapshot;
        assert_eq!(s.map_state("In Progress"), Some(JobState::InProgress));
        assert_eq!(s.map_state("copying"), Some(JobState::InProgress));
        assert_eq!(s.map_state("completed"), Some(JobState::Succeeded));
        assert_eq!(s.map_state("error"), Some(JobState::Failed));
        assert_eq!(s.map_state("done"), None);
    }

    #[test]
    fn unknown_state_keeps_running() {
        assert_eq!(BackendKind::Agent.map_state("warming"), None);
        assert_eq!(
            BackendKind::Agent.canonical_state("warming"),
            JobState::InProgress
        );
        assert!(JobState::Aborted.is_finished());
        assert!(!JobState::InProgress.is_finished());
    }
}
