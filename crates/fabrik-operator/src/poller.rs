//! Status pollers.
//!
//! Backend jobs have no push channel, so each resource type gets a timer
//! loop that re-checks its `in_progress` and `aborting` resources:
//!
//! ```text
//! tick
//!  └── list state in (in_progress, aborting)
//!       └── per resource
//!            ├── poller lease (skip if another replica holds it)
//!            ├── in_progress past timeout ─▶ failed ("timeout")
//!            ├── in_progress ─▶ query source ─▶ map ─▶ patch on change
//!            └── aborting ─▶ cancel once ─▶ aborted when finished / abort timeout
//! ```
//!
//! The source is the backend job for backend kinds, the child resource for
//! tasks, and the current task for service flows. One resource's error is
//! logged and retried next tick; it never ends the loop.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use fabrik_state::{
    LabelSelector, Resource, ResourceKey, ResourceState, ResourceStatus, ResourceUpdate,
    epoch_millis, request_cancellation,
};

use crate::backend::{BackendKind, JobState};
use crate::claim::acquire_poller_lock;
use crate::context::EngineContext;
use crate::error::{OperatorError, OperatorResult};
use crate::kind::OperatorKind;
use crate::meta;
use crate::operator::instance_of;
use crate::serviceflow::{ServiceFlowOptions, create_flow_task, task_key};
use crate::status::conditional_update;
use crate::task::TaskDetails;

/// Counters for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub polled: usize,
    pub changed: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl TickSummary {
    pub fn merge(&mut self, other: TickSummary) {
        self.polled += other.polled;
        self.changed += other.changed;
        self.skipped += other.skipped;
        self.errors += other.errors;
    }
}

enum Polled {
    Changed,
    Unchanged,
    Skipped,
}

/// What a poll source reports for an `in_progress` resource.
enum Observation {
    Running,
    Finished(ResourceStatus),
    /// Status detail changed without a state change (flow relay).
    Progressed,
}

pub struct StatusPoller {
    kind: OperatorKind,
    ctx: EngineContext,
    interval: Duration,
    lease: Duration,
    timeout: Duration,
    abort_timeout: Duration,
}

impl StatusPoller {
    pub fn new(kind: OperatorKind, ctx: EngineContext) -> OperatorResult<Self> {
        let config = &ctx.config;
        let interval = config.poll_interval()?;
        let lease = interval + config.poll_relaxation()?;
        let timeout = config.timeout_for(kind)?;
        let abort_timeout = config.abort_timeout()?;
        Ok(Self {
            kind,
            ctx,
            interval,
            lease,
            timeout,
            abort_timeout,
        })
    }

    pub fn kind(&self) -> OperatorKind {
        self.kind
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(poller = %self.kind, interval = ?self.interval, timeout = ?self.timeout, "status poller started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let summary = self.tick().await;
                    if summary.polled > 0 {
                        debug!(poller = %self.kind, ?summary, "tick");
                    }
                }
                _ = shutdown.changed() => {
                    debug!(poller = %self.kind, "status poller shutting down");
                    break;
                }
            }
        }
    }

    /// Poll every `in_progress` and `aborting` resource once.
    pub async fn tick(&self) -> TickSummary {
        let mut summary = TickSummary::default();
        let selector = LabelSelector::everything()
            .states(&[ResourceState::InProgress, ResourceState::Aborting]);
        let resources = match self
            .ctx
            .client
            .list_resources(self.kind.group(), self.kind.kind(), &selector)
            .await
        {
            Ok(r) => r,
            Err(e) => {
                error!(poller = %self.kind, error = %e, "listing resources failed");
                summary.errors += 1;
                return summary;
            }
        };

        for resource in resources {
            summary.polled += 1;
            match self.poll_one(&resource).await {
                Ok(Polled::Changed) => summary.changed += 1,
                Ok(Polled::Unchanged) => {}
                Ok(Polled::Skipped) => summary.skipped += 1,
                Err(e) => {
                    summary.errors += 1;
                    warn!(poller = %self.kind, key = %resource.key, error = %e, "poll failed, retrying next tick");
                }
            }
        }
        summary
    }

    async fn poll_one(&self, resource: &Resource) -> OperatorResult<Polled> {
        let client = self.ctx.client.as_ref();
        let Some(resource) =
            acquire_poller_lock(client, resource, &self.ctx.identity, self.lease).await?
        else {
            return Ok(Polled::Skipped);
        };

        match resource.state() {
            ResourceState::InProgress => self.poll_in_progress(&resource).await,
            ResourceState::Aborting => self.poll_aborting(&resource).await,
            _ => Ok(Polled::Unchanged),
        }
    }

    async fn poll_in_progress(&self, resource: &Resource) -> OperatorResult<Polled> {
        let elapsed = time_in_state(resource);
        if elapsed > self.timeout {
            let description = format!(
                "{} {} exceeded timeout of {}s while in progress",
                self.kind,
                resource.key.id,
                self.timeout.as_secs()
            );
            warn!(poller = %self.kind, key = %resource.key, ?elapsed, "timeout");
            let status = resource
                .status
                .transitioned(ResourceState::Failed)
                .with_description(description)
                .with_error("timeout");
            return self.finish(resource, ResourceState::InProgress, status).await;
        }

        let observation = match self.kind {
            OperatorKind::Task => self.observe_task(resource).await?,
            OperatorKind::ServiceFlow => self.observe_flow(resource).await?,
            _ => self.observe_backend(resource).await?,
        };
        match observation {
            Observation::Running => Ok(Polled::Unchanged),
            Observation::Progressed => Ok(Polled::Changed),
            Observation::Finished(status) => {
                self.finish(resource, ResourceState::InProgress, status).await
            }
        }
    }

    async fn observe_backend(&self, resource: &Resource) -> OperatorResult<Observation> {
        let Some(job_id) = resource.metadata(meta::JOB_ID) else {
            // Still being submitted; the timeout covers a lost worker.
            return Ok(Observation::Running);
        };
        let backend_kind = self.backend_kind()?;
        let reported = self
            .ctx
            .backends
            .get(backend_kind)
            .get_task_status(job_id)
            .await?;
        let response = json!({
            "job_id": job_id,
            "state": reported.state,
            "description": reported.description,
        });
        let status = |state: ResourceState, description: String| {
            resource
                .status
                .transitioned(state)
                .with_description(description)
                .with_response(response.clone())
        };
        Ok(match backend_kind.canonical_state(&reported.state) {
            JobState::InProgress => Observation::Running,
            JobState::Succeeded => Observation::Finished(status(
                ResourceState::Succeeded,
                format!("{} {} succeeded.", self.kind, resource.key.id),
            )),
            JobState::Failed => Observation::Finished(
                status(
                    ResourceState::Failed,
                    format!(
                        "{} {} failed: {}",
                        self.kind, resource.key.id, reported.description
                    ),
                )
                .with_error(reported.state.clone()),
            ),
            // Nobody asked for this abort.
            JobState::Aborted => Observation::Finished(
                status(
                    ResourceState::Failed,
                    format!("{} {} was aborted by the backend", self.kind, resource.key.id),
                )
                .with_error(reported.state.clone()),
            ),
        })
    }

    async fn observe_task(&self, resource: &Resource) -> OperatorResult<Observation> {
        if resource.metadata(meta::JOB_ID).is_none() {
            return Ok(Observation::Running);
        }
        let key = self.task_child(resource)?;
        let child = match self.ctx.client.get_resource_status(&key).await {
            Ok(status) => status,
            Err(e) if e.is_not_found() => return Ok(Observation::Running),
            Err(e) => return Err(e.into()),
        };
        let status = |state: ResourceState, description: String| {
            resource
                .status
                .transitioned(state)
                .with_description(description)
                .with_response(json!({
                    "resource": key.to_string(),
                    "state": child.state,
                    "description": child.description,
                }))
        };
        Ok(match child.state {
            ResourceState::Succeeded => Observation::Finished(status(
                ResourceState::Succeeded,
                child.description.clone(),
            )),
            ResourceState::Failed | ResourceState::Aborted => Observation::Finished(
                status(
                    ResourceState::Failed,
                    format!("{} {}: {}", key.kind, child.state, child.description),
                )
                .with_error(child.error.clone().unwrap_or_else(|| child.state.to_string())),
            ),
            _ => Observation::Running,
        })
    }

    async fn observe_flow(&self, resource: &Resource) -> OperatorResult<Observation> {
        let Some(current) = resource
            .metadata(meta::CURRENT_TASK)
            .and_then(|v| v.parse::<u32>().ok())
        else {
            return Ok(Observation::Running);
        };
        let flow_id = resource.key.id.as_str();
        let options = ServiceFlowOptions::from_resource(resource)?;
        let flow = self.ctx.config.serviceflow(&options.serviceflow_name)?;
        let total = flow.tasks.len();

        let task = task_key(flow_id, current);
        let status = match self.ctx.client.get_resource_status(&task).await {
            Ok(status) => status,
            Err(e) if e.is_not_found() => return Ok(Observation::Running),
            Err(e) => return Err(e.into()),
        };

        match status.state {
            ResourceState::Succeeded if (current as usize) + 1 < total => {
                let next = current + 1;
                let next_key =
                    create_flow_task(self.ctx.client.as_ref(), flow_id, flow, &options, next)
                        .await?;
                let description = format!(
                    "Service flow {} is in progress: task {} of {total}.",
                    options.serviceflow_name,
                    next + 1
                );
                let written = conditional_update(self.ctx.client.as_ref(), resource.key(), |cur| {
                    if cur.state() != ResourceState::InProgress
                        || cur.metadata(meta::CURRENT_TASK) != Some(current.to_string().as_str())
                    {
                        return None;
                    }
                    Some(
                        ResourceUpdate::status(
                            cur.status
                                .clone()
                                .with_description(description.clone())
                                .with_last_operation(json!({ "current_task": next_key.id })),
                        )
                        .with_metadata(meta::CURRENT_TASK, next.to_string())
                        .with_metadata(meta::JOB_ID, next_key.to_string()),
                    )
                })
                .await?;
                info!(%flow_id, task = next, "service flow relayed to next task");
                Ok(if written.metadata(meta::CURRENT_TASK) == Some(next.to_string().as_str()) {
                    Observation::Progressed
                } else {
                    Observation::Running
                })
            }
            ResourceState::Succeeded => Ok(Observation::Finished(
                resource
                    .status
                    .transitioned(ResourceState::Succeeded)
                    .with_description(format!(
                        "Service flow {} completed.",
                        options.serviceflow_name
                    )),
            )),
            ResourceState::Failed | ResourceState::Aborted => Ok(Observation::Finished(
                resource
                    .status
                    .transitioned(ResourceState::Failed)
                    .with_description(format!(
                        "Service flow {} failed at task {} of {total}: {}",
                        options.serviceflow_name,
                        current + 1,
                        status.description
                    ))
                    .with_error(status.error.clone().unwrap_or_else(|| status.state.to_string())),
            )),
            _ => Ok(Observation::Running),
        }
    }

    async fn poll_aborting(&self, resource: &Resource) -> OperatorResult<Polled> {
        let finished = match self.kind {
            OperatorKind::Task | OperatorKind::ServiceFlow => self.abort_child(resource).await?,
            _ => self.abort_backend(resource).await?,
        };

        let description = match finished {
            Some(description) => description,
            None if time_in_state(resource) > self.abort_timeout => {
                warn!(poller = %self.kind, key = %resource.key, "abort timed out");
                format!(
                    "{} {} aborted after abort timeout of {}s",
                    self.kind,
                    resource.key.id,
                    self.abort_timeout.as_secs()
                )
            }
            None => return Ok(Polled::Unchanged),
        };
        let status = resource
            .status
            .transitioned(ResourceState::Aborted)
            .with_description(description);
        self.finish(resource, ResourceState::Aborting, status).await
    }

    /// Cancel the backend job once; `Some` once nothing is running any more.
    async fn abort_backend(&self, resource: &Resource) -> OperatorResult<Option<String>> {
        let Some(job_id) = resource.metadata(meta::JOB_ID) else {
            return Ok(self.abort_without_job(resource));
        };
        let backend = self.ctx.backends.get(self.backend_kind()?);
        if resource.metadata(meta::CANCEL_REQUESTED).is_none() {
            backend.cancel(job_id).await?;
            self.mark_cancel_requested(resource).await?;
            info!(poller = %self.kind, key = %resource.key, %job_id, "backend cancellation requested");
        }
        let reported = backend.get_task_status(job_id).await?;
        let state = backend.kind().canonical_state(&reported.state);
        Ok(state.is_finished().then(|| {
            format!(
                "{} {} aborted; backend job {} ended {}",
                self.kind, resource.key.id, job_id, reported.state
            )
        }))
    }

    /// Forward the cancellation to the child task once; `Some` once it
    /// reached a terminal state.
    async fn abort_child(&self, resource: &Resource) -> OperatorResult<Option<String>> {
        let child = match self.kind {
            OperatorKind::Task if resource.metadata(meta::JOB_ID).is_some() => {
                Some(self.task_child(resource)?)
            }
            OperatorKind::ServiceFlow => resource
                .metadata(meta::CURRENT_TASK)
                .and_then(|v| v.parse::<u32>().ok())
                .map(|order| task_key(&resource.key.id, order)),
            _ => None,
        };
        let Some(child) = child else {
            return Ok(self.abort_without_job(resource));
        };

        if resource.metadata(meta::CANCEL_REQUESTED).is_none() {
            match request_cancellation(self.ctx.client.as_ref(), &child).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
            self.mark_cancel_requested(resource).await?;
        }
        let state = match self.ctx.client.get_resource_status(&child).await {
            Ok(status) => status.state,
            Err(e) if e.is_not_found() => ResourceState::Aborted,
            Err(e) => return Err(e.into()),
        };
        Ok(state.is_terminal().then(|| {
            format!(
                "{} {} aborted; {} ended {}",
                self.kind, resource.key.id, child.id, state
            )
        }))
    }

    /// Nothing was submitted. If no worker holds the claim either, the
    /// abort is complete; otherwise the worker's checkpoint will see it.
    fn abort_without_job(&self, resource: &Resource) -> Option<String> {
        resource
            .metadata(meta::LOCKED_BY)
            .is_none()
            .then(|| format!("{} {} aborted before submission", self.kind, resource.key.id))
    }

    async fn mark_cancel_requested(&self, resource: &Resource) -> OperatorResult<()> {
        conditional_update(self.ctx.client.as_ref(), resource.key(), |_| {
            Some(
                ResourceUpdate::default()
                    .with_metadata(meta::CANCEL_REQUESTED, epoch_millis().to_string()),
            )
        })
        .await?;
        Ok(())
    }

    /// Write a terminal status if the resource is still in `expected`, then
    /// release its deployment lock.
    async fn finish(
        &self,
        resource: &Resource,
        expected: ResourceState,
        status: ResourceStatus,
    ) -> OperatorResult<Polled> {
        let state = status.state;
        let written = conditional_update(self.ctx.client.as_ref(), resource.key(), |current| {
            (current.state() == expected).then(|| ResourceUpdate::status(status.clone()))
        })
        .await?;
        if written.state() != state {
            debug!(key = %resource.key, current = %written.state(), "state moved underneath, skipping");
            return Ok(Polled::Unchanged);
        }
        info!(poller = %self.kind, key = %resource.key, %state, "resource finished");

        if self.kind.takes_deployment_lock() {
            if let Some(instance) = instance_of(resource) {
                if let Err(e) = self.ctx.locks.unlock(instance, resource.key()).await {
                    error!(key = %resource.key, %instance, error = %e, "deployment lock left behind");
                }
            }
        }
        Ok(Polled::Changed)
    }

    fn backend_kind(&self) -> OperatorResult<BackendKind> {
        self.kind
            .backend()
            .ok_or_else(|| OperatorError::Config(format!("{} has no backend", self.kind)))
    }

    fn task_child(&self, resource: &Resource) -> OperatorResult<ResourceKey> {
        let details: TaskDetails =
            resource
                .options_as()
                .map_err(|e| OperatorError::InvalidOptions {
                    key: resource.key.to_string(),
                    message: e.to_string(),
                })?;
        let task = self.ctx.registry.get_task(&details.task_type)?;
        Ok(task.child_key(&resource.key.id))
    }
}

fn time_in_state(resource: &Resource) -> Duration {
    Duration::from_millis(epoch_millis().saturating_sub(resource.status.state_changed_at_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabrik_state::{NewResource, StateStore, groups, kinds, labels};

    use crate::backend::{BackendClient, BackendJob, SimulatedBackend};
    use crate::config::FabrikConfig;
    use crate::context::Backends;

    struct Harness {
        store: StateStore,
        snapshot: Arc<SimulatedBackend>,
        ctx: EngineContext,
    }

    fn harness(config: FabrikConfig) -> Harness {
        let store = StateStore::open_in_memory().unwrap();
        let snapshot = Arc::new(SimulatedBackend::new(BackendKind::Snapshot));
        let backends = Backends::new(
            Arc::new(SimulatedBackend::new(BackendKind::Director)),
            snapshot.clone(),
            Arc::new(SimulatedBackend::new(BackendKind::Agent)),
        );
        let ctx = EngineContext::new(Arc::new(store.clone()), backends, config, "poller-test")
            .unwrap();
        Harness {
            store,
            snapshot,
            ctx,
        }
    }

    /// A backup already claimed and submitted, as the operator leaves it.
    async fn running_backup(h: &Harness, id: &str) -> (ResourceKey, String) {
        let key = ResourceKey::new(groups::BACKUP, kinds::DEFAULT_BACKUP, id);
        h.store
            .create_resource(
                NewResource::new(key.clone())
                    .with_label(labels::INSTANCE_GUID, "X")
                    .with_options(json!({ "instance_guid": "X" })),
            )
            .unwrap();
        let job_id = h
            .snapshot
            .submit(&BackendJob {
                kind: BackendKind::Snapshot,
                operation: "backup".into(),
                idempotency_key: id.into(),
                instance_id: "X".into(),
                deployment_name: None,
                payload: serde_json::Value::Null,
            })
            .await
            .unwrap();
        h.store
            .update_resource(
                &key,
                ResourceUpdate::status(ResourceStatus::new(ResourceState::InProgress))
                    .with_metadata(meta::JOB_ID, job_id.clone()),
            )
            .unwrap();
        (key, job_id)
    }

    #[tokio::test]
    async fn patches_only_on_change() {
        let h = harness(FabrikConfig::default());
        let (key, job_id) = running_backup(&h, "b1").await;
        let poller = StatusPoller::new(OperatorKind::Backup, h.ctx.clone()).unwrap();

        let summary = poller.tick().await;
        assert_eq!(summary.polled, 1);
        assert_eq!(summary.changed, 0);
        let status_before = h.store.get_resource(&key).unwrap().status;

        poller.tick().await;
        assert_eq!(h.store.get_resource(&key).unwrap().status, status_before);

        h.snapshot.set_state(&job_id, "completed").await;
        let summary = poller.tick().await;
        assert_eq!(summary.changed, 1);
        let resource = h.store.get_resource(&key).unwrap();
        assert_eq!(resource.state(), ResourceState::Succeeded);
        assert_eq!(resource.status.response["state"], "completed");
    }

    #[tokio::test]
    async fn backend_failure_maps_to_failed() {
        let h = harness(FabrikConfig::default());
        let (key, job_id) = running_backup(&h, "b1").await;
        h.snapshot.set_state(&job_id, "error").await;
        let poller = StatusPoller::new(OperatorKind::Backup, h.ctx.clone()).unwrap();
        poller.tick().await;
        let resource = h.store.get_resource(&key).unwrap();
        assert_eq!(resource.state(), ResourceState::Failed);
        assert_eq!(resource.status.error.as_deref(), Some("error"));
    }

    #[tokio::test]
    async fn timeout_forces_failure_without_backend_answer() {
        let mut config = FabrikConfig::default();
        config.poller.timeouts.insert("backup".into(), "1ms".into());
        let h = harness(config);
        let (key, _) = running_backup(&h, "b1").await;
        h.snapshot.fail_next_polls(100).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let poller = StatusPoller::new(OperatorKind::Backup, h.ctx.clone()).unwrap();
        poller.tick().await;
        let resource = h.store.get_resource(&key).unwrap();
        assert_eq!(resource.state(), ResourceState::Failed);
        assert!(resource.status.description.contains("timeout"));
    }

    #[tokio::test]
    async fn transient_errors_do_not_stop_the_tick() {
        let h = harness(FabrikConfig::default());
        let (first, _) = running_backup(&h, "b1").await;
        let (second, second_job) = running_backup(&h, "b2").await;
        h.snapshot.set_state(&second_job, "succeeded").await;
        h.snapshot.fail_next_polls(1).await;

        let poller = StatusPoller::new(OperatorKind::Backup, h.ctx.clone()).unwrap();
        let summary = poller.tick().await;
        assert_eq!(summary.errors, 1);
        assert_eq!(summary.changed, 1);
        assert_eq!(
            h.store.get_resource(&first).unwrap().state(),
            ResourceState::InProgress
        );
        assert_eq!(
            h.store.get_resource(&second).unwrap().state(),
            ResourceState::Succeeded
        );
    }

    #[tokio::test]
    async fn aborting_cancels_backend_once() {
        let h = harness(FabrikConfig::default());
        let (key, job_id) = running_backup(&h, "b1").await;
        request_cancellation(&h.store, &key).await.unwrap();

        let poller = StatusPoller::new(OperatorKind::Backup, h.ctx.clone()).unwrap();
        poller.tick().await;
        let resource = h.store.get_resource(&key).unwrap();
        assert_eq!(resource.state(), ResourceState::Aborted);
        assert!(resource.metadata(meta::CANCEL_REQUESTED).is_some());
        assert_eq!(h.snapshot.raw_state(&job_id).await.as_deref(), Some("aborted"));
    }

    #[tokio::test]
    async fn other_replica_lease_is_respected() {
        let h = harness(FabrikConfig::default());
        let (key, job_id) = running_backup(&h, "b1").await;
        h.store
            .update_resource(
                &key,
                ResourceUpdate::default()
                    .with_metadata(meta::POLLER_LOCKED_BY, "someone-else")
                    .with_metadata(meta::POLLER_LOCKED_AT, epoch_millis().to_string()),
            )
            .unwrap();
        h.snapshot.set_state(&job_id, "succeeded").await;

        let poller = StatusPoller::new(OperatorKind::Backup, h.ctx.clone()).unwrap();
        let summary = poller.tick().await;
        assert_eq!(summary.skipped, 1);
        assert_eq!(
            h.store.get_resource(&key).unwrap().state(),
            ResourceState::InProgress
        );
    }
}
