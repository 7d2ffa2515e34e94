//! Operators: one watch loop and a bounded worker pool per resource type.
//!
//! ```text
//! watch(group, kind) ──event──▶ dispatch ──key──▶ bounded queue
//!        ▲ bookmark                                   │
//!        └── re-established on end/error        N workers
//!                                                     │
//!                      claim ─▶ execute ─▶ record / fail ─▶ release
//! ```
//!
//! A failure while executing one resource is written to that resource's
//! status and never reaches the watch loop. Cancellation is checked at the
//! suspend points before a backend job is submitted; once a job exists the
//! status poller owns the abort.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use fabrik_state::{
    EventKind, LabelSelector, Resource, ResourceKey, ResourceState, ResourceUpdate, WatchEvent,
    WatchOptions, labels,
};

use crate::backend::BackendJob;
use crate::claim::{ClaimOutcome, claim, release};
use crate::context::EngineContext;
use crate::deployment::DeploymentPlanner;
use crate::error::{OperatorError, OperatorResult};
use crate::kind::OperatorKind;
use crate::meta;
use crate::options::OperationOptions;
use crate::serviceflow::{ServiceFlowOptions, create_flow_task};
use crate::status::conditional_update;
use crate::task::TaskDetails;

pub struct Operator {
    kind: OperatorKind,
    ctx: EngineContext,
    /// Present on the deployment operator only.
    planner: Option<DeploymentPlanner>,
    in_flight: Mutex<HashSet<String>>,
}

impl Operator {
    pub fn new(kind: OperatorKind, ctx: EngineContext) -> Self {
        let planner = (kind == OperatorKind::Deployment).then(|| {
            DeploymentPlanner::new(
                ctx.client.clone(),
                ctx.config.clone(),
                ctx.allocation_locks.clone(),
            )
        });
        Self {
            kind,
            ctx,
            planner,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn kind(&self) -> OperatorKind {
        self.kind
    }

    pub fn planner(&self) -> Option<&DeploymentPlanner> {
        self.planner.as_ref()
    }

    /// Run the watch loop and worker pool until `shutdown` flips.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) {
        let config = &self.ctx.config.operator;
        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let queue = Arc::new(Mutex::new(rx));

        let workers: Vec<JoinHandle<()>> = (0..config.workers)
            .map(|n| {
                let operator = self.clone();
                let queue = queue.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { operator.worker(n, queue, shutdown).await })
            })
            .collect();
        info!(operator = %self.kind, workers = workers.len(), "operator started");

        self.watch_loop(tx, shutdown).await;

        for worker in workers {
            let _ = worker.await;
        }
        info!(operator = %self.kind, "operator stopped");
    }

    async fn watch_loop(&self, tx: mpsc::Sender<ResourceKey>, mut shutdown: watch::Receiver<bool>) {
        let (timeout, error_delay) = match (
            self.ctx.config.watch_timeout(),
            self.ctx.config.watch_error_delay(),
        ) {
            (Ok(t), Ok(d)) => (t, d),
            (Err(e), _) | (_, Err(e)) => {
                error!(operator = %self.kind, error = %e, "invalid watch settings");
                return;
            }
        };
        let mut bookmark: Option<u64> = None;

        loop {
            if *shutdown.borrow() {
                return;
            }
            let mut options = WatchOptions::default().with_timeout(timeout);
            if let Some(revision) = bookmark {
                options = options.since(revision);
            }

            let watched = self
                .ctx
                .client
                .watch(
                    self.kind.group(),
                    self.kind.kind(),
                    LabelSelector::everything(),
                    options,
                )
                .await;
            let mut stream = match watched {
                Ok(stream) => stream,
                Err(e) if e.is_expired() => {
                    warn!(operator = %self.kind, error = %e, "bookmark expired, relisting");
                    bookmark = None;
                    continue;
                }
                Err(e) => {
                    error!(operator = %self.kind, error = %e, "watch failed, retrying");
                    tokio::select! {
                        _ = tokio::time::sleep(error_delay) => continue,
                        _ = shutdown.changed() => return,
                    }
                }
            };

            loop {
                tokio::select! {
                    event = stream.next() => match event {
                        Some(event) => self.dispatch(event, &tx).await,
                        None => {
                            bookmark = Some(stream.bookmark());
                            debug!(operator = %self.kind, ?bookmark, "watch ended, re-establishing");
                            break;
                        }
                    },
                    _ = shutdown.changed() => return,
                }
            }
        }
    }

    async fn dispatch(&self, event: WatchEvent, tx: &mpsc::Sender<ResourceKey>) {
        let resource = &event.resource;
        if event.kind == EventKind::Deleted {
            if let (Some(planner), Some(instance)) =
                (&self.planner, resource.label(labels::INSTANCE_GUID))
            {
                planner.cache().evict(instance).await;
                debug!(%instance, "deployment name evicted");
            }
            return;
        }
        if !wants(resource) {
            return;
        }

        let key = resource.key.clone();
        if !self.in_flight.lock().await.insert(key.id.clone()) {
            return;
        }
        // Waits when the queue is full.
        if tx.send(key.clone()).await.is_err() {
            self.in_flight.lock().await.remove(&key.id);
        }
    }

    async fn worker(
        &self,
        n: usize,
        queue: Arc<Mutex<mpsc::Receiver<ResourceKey>>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let next = {
                let mut rx = queue.lock().await;
                tokio::select! {
                    key = rx.recv() => key,
                    _ = shutdown.changed() => None,
                }
            };
            let Some(key) = next else {
                debug!(operator = %self.kind, worker = n, "worker exiting");
                return;
            };
            if let Err(e) = self.reconcile(&key).await {
                warn!(operator = %self.kind, %key, error = %e, "reconcile failed");
            }
            self.in_flight.lock().await.remove(&key.id);
        }
    }

    /// Process one resource: claim it, execute it, record the outcome.
    ///
    /// Errors returned here are store failures while bookkeeping; execution
    /// errors end up in the resource status instead.
    pub async fn reconcile(&self, key: &ResourceKey) -> OperatorResult<()> {
        let client = self.ctx.client.as_ref();
        let resource = match client.get_resource(key).await {
            Ok(r) => r,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        match resource.state() {
            ResourceState::InQueue => {}
            ResourceState::Aborting if wants(&resource) => {
                self.mark_aborted(&resource, "Aborted before processing started")
                    .await?;
                return Ok(());
            }
            state => {
                debug!(%key, %state, "nothing to do");
                return Ok(());
            }
        }

        let description = in_progress_description(self.kind, &resource);
        let claimed = match claim(client, &resource, &self.ctx.identity, &description).await? {
            ClaimOutcome::Claimed(r) => r,
            ClaimOutcome::Skipped(reason) => {
                debug!(%key, %reason, "skipped");
                return Ok(());
            }
        };
        info!(operator = %self.kind, %key, "processing");

        match self.execute(&claimed).await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {
                info!(%key, "cancelled before submission");
                self.mark_aborted(&claimed, "Aborted before backend job was submitted")
                    .await?;
            }
            Err(e) => {
                warn!(operator = %self.kind, %key, error = %e, "execution failed");
                self.fail(&claimed, &e).await?;
            }
        }

        release(client, key, &self.ctx.identity).await
    }

    async fn execute(&self, resource: &Resource) -> OperatorResult<()> {
        match self.kind {
            OperatorKind::Task => self.execute_task(resource).await,
            OperatorKind::ServiceFlow => self.execute_flow(resource).await,
            _ => self.execute_backend(resource).await,
        }
    }

    async fn execute_task(&self, resource: &Resource) -> OperatorResult<()> {
        let details: TaskDetails =
            resource
                .options_as()
                .map_err(|e| OperatorError::InvalidOptions {
                    key: resource.key.to_string(),
                    message: e.to_string(),
                })?;
        let task = self.ctx.registry.get_task(&details.task_type)?;
        self.checkpoint(resource.key()).await?;

        let out = task
            .run(self.ctx.client.as_ref(), &resource.key.id, details)
            .await?;
        let child = out
            .resource
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_default();
        let description = out
            .response
            .as_ref()
            .map(|r| r.description.clone())
            .unwrap_or_default();
        let response = serde_json::to_value(&out).unwrap_or_default();

        self.record(resource.key(), &child, &description, json!({ "resource": child }), response)
            .await
    }

    async fn execute_flow(&self, resource: &Resource) -> OperatorResult<()> {
        let options = ServiceFlowOptions::from_resource(resource)?;
        let flow = self.ctx.config.serviceflow(&options.serviceflow_name)?;
        for step in &flow.tasks {
            self.ctx.registry.get_task(&step.task_type)?;
        }
        self.checkpoint(resource.key()).await?;

        let flow_id = resource.key.id.as_str();
        let first = create_flow_task(self.ctx.client.as_ref(), flow_id, flow, &options, 0).await?;
        let description = format!(
            "Service flow {} is in progress: task 1 of {}.",
            options.serviceflow_name,
            flow.tasks.len()
        );
        conditional_update(self.ctx.client.as_ref(), resource.key(), |current| {
            let mut update = ResourceUpdate::default()
                .with_metadata(meta::CURRENT_TASK, "0")
                .with_metadata(meta::JOB_ID, first.to_string());
            if current.state() == ResourceState::InProgress {
                update.status = Some(
                    current
                        .status
                        .clone()
                        .with_description(description.clone())
                        .with_last_operation(json!({ "current_task": first.id })),
                );
            }
            Some(update)
        })
        .await?;
        Ok(())
    }

    async fn execute_backend(&self, resource: &Resource) -> OperatorResult<()> {
        let backend_kind = self.kind.backend().ok_or_else(|| {
            OperatorError::Config(format!("{} has no backend", self.kind))
        })?;
        let options = OperationOptions::from_resource(resource)?;
        let operation = options
            .operation
            .clone()
            .unwrap_or_else(|| self.kind.default_operation().to_string());

        if self.kind.takes_deployment_lock() {
            self.ctx
                .locks
                .lock(&options.instance_guid, &operation, resource.key())
                .await?;
        }

        let (deployment_name, payload) = match &self.planner {
            Some(planner) => {
                let prepared = planner.prepare(resource, &options).await?;
                let payload = json!({
                    "manifest": prepared.manifest_yaml,
                    "network_index": prepared.network_index,
                    "parameters": options.parameters,
                });
                (Some(prepared.deployment_name), payload)
            }
            None => (
                None,
                json!({ "plan_id": options.plan_id, "parameters": options.parameters }),
            ),
        };

        self.checkpoint(resource.key()).await?;

        let job = BackendJob {
            kind: backend_kind,
            operation: operation.clone(),
            idempotency_key: resource.key.id.clone(),
            instance_id: options.instance_guid.clone(),
            deployment_name: deployment_name.clone(),
            payload,
        };
        let job_id = self.ctx.backends.get(backend_kind).submit(&job).await?;
        info!(operator = %self.kind, key = %resource.key, %job_id, %operation, "backend job submitted");

        let last_operation = json!({
            "job_id": job_id,
            "backend": backend_kind.name(),
            "operation": operation,
            "deployment_name": deployment_name,
        });
        let description = in_progress_description(self.kind, resource);
        self.record(resource.key(), &job_id, &description, last_operation, serde_json::Value::Null)
            .await
    }

    /// Record the job handle. The status is only touched while still
    /// `in_progress`, so a concurrent cancellation request is preserved.
    async fn record(
        &self,
        key: &ResourceKey,
        job_id: &str,
        description: &str,
        last_operation: serde_json::Value,
        response: serde_json::Value,
    ) -> OperatorResult<()> {
        conditional_update(self.ctx.client.as_ref(), key, |current| {
            let mut update = ResourceUpdate::default().with_metadata(meta::JOB_ID, job_id);
            if current.state() == ResourceState::InProgress {
                let mut status = current
                    .status
                    .clone()
                    .with_description(description)
                    .with_last_operation(last_operation.clone());
                if !response.is_null() {
                    status = status.with_response(response.clone());
                }
                update.status = Some(status);
            }
            Some(update)
        })
        .await?;
        Ok(())
    }

    /// Cooperative cancellation point.
    async fn checkpoint(&self, key: &ResourceKey) -> OperatorResult<()> {
        let current = self.ctx.client.get_resource(key).await?;
        match current.state() {
            ResourceState::Aborting | ResourceState::Aborted => {
                Err(OperatorError::Cancelled(key.to_string()))
            }
            _ => Ok(()),
        }
    }

    async fn fail(&self, resource: &Resource, err: &OperatorError) -> OperatorResult<()> {
        let message = err.to_string();
        let description = format!("{} {} failed: {message}", self.kind, resource.key.id);
        conditional_update(self.ctx.client.as_ref(), resource.key(), |current| {
            let next = match current.state() {
                ResourceState::InProgress | ResourceState::InQueue => ResourceState::Failed,
                ResourceState::Aborting => ResourceState::Aborted,
                _ => return None,
            };
            Some(ResourceUpdate::status(
                current
                    .status
                    .transitioned(next)
                    .with_description(description.clone())
                    .with_error(message.clone()),
            ))
        })
        .await?;
        self.release_deployment_lock(resource).await;
        Ok(())
    }

    async fn mark_aborted(&self, resource: &Resource, description: &str) -> OperatorResult<()> {
        conditional_update(self.ctx.client.as_ref(), resource.key(), |current| {
            (current.state() == ResourceState::Aborting).then(|| {
                ResourceUpdate::status(
                    current
                        .status
                        .transitioned(ResourceState::Aborted)
                        .with_description(description),
                )
            })
        })
        .await?;
        self.release_deployment_lock(resource).await;
        Ok(())
    }

    async fn release_deployment_lock(&self, resource: &Resource) {
        if !self.kind.takes_deployment_lock() {
            return;
        }
        let Some(instance) = instance_of(resource) else {
            return;
        };
        if let Err(e) = self.ctx.locks.unlock(instance, resource.key()).await {
            warn!(key = %resource.key, error = %e, "failed to release deployment lock");
        }
    }
}

/// Queued resources, and aborting ones nobody has started on.
fn wants(resource: &Resource) -> bool {
    match resource.state() {
        ResourceState::InQueue => true,
        ResourceState::Aborting => {
            resource.metadata(meta::JOB_ID).is_none() && resource.metadata(meta::LOCKED_BY).is_none()
        }
        _ => false,
    }
}

/// Instance guid from the options, falling back to the label.
pub(crate) fn instance_of(resource: &Resource) -> Option<&str> {
    resource
        .options
        .get("instance_guid")
        .or_else(|| resource.options.get("instance_id"))
        .and_then(|v| v.as_str())
        .or_else(|| resource.label(labels::INSTANCE_GUID))
}

pub(crate) fn in_progress_description(kind: OperatorKind, resource: &Resource) -> String {
    let instance = instance_of(resource).unwrap_or("unknown");
    let operation = resource
        .options
        .get("operation")
        .and_then(|v| v.as_str())
        .unwrap_or(kind.default_operation());
    match kind {
        OperatorKind::Backup => format!("Backup of instance {instance} is in progress."),
        OperatorKind::Restore => format!("Restore of instance {instance} is in progress."),
        OperatorKind::Deployment => {
            format!("Deployment {operation} of instance {instance} is in progress.")
        }
        OperatorKind::AgentCall => format!("Agent {operation} for instance {instance} is in progress."),
        OperatorKind::Task => {
            let what = resource
                .options
                .get("task_description")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .or_else(|| resource.options.get("task_type").and_then(|v| v.as_str()))
                .unwrap_or("Task");
            format!("{what} is in progress.")
        }
        OperatorKind::ServiceFlow => {
            let name = resource
                .options
                .get("serviceflow_name")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown");
            format!("Service flow {name} is in progress.")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use fabrik_state::{NewResource, StateStore, groups, kinds, request_cancellation};

    use crate::backend::{BackendKind, SimulatedBackend};
    use crate::config::FabrikConfig;
    use crate::context::Backends;

    struct Harness {
        store: StateStore,
        snapshot: Arc<SimulatedBackend>,
        ctx: EngineContext,
    }

    fn harness() -> Harness {
        harness_with(StateStore::open_in_memory().unwrap())
    }

    fn harness_with(store: StateStore) -> Harness {
        let snapshot = Arc::new(SimulatedBackend::new(BackendKind::Snapshot));
        let backends = Backends::new(
            Arc::new(SimulatedBackend::new(BackendKind::Director)),
            snapshot.clone(),
            Arc::new(SimulatedBackend::new(BackendKind::Agent)),
        );
        let ctx = EngineContext::new(
            Arc::new(store.clone()),
            backends,
            FabrikConfig::default(),
            "op-test",
        )
        .unwrap();
        Harness {
            store,
            snapshot,
            ctx,
        }
    }

    fn backup(store: &StateStore, id: &str) -> ResourceKey {
        let key = ResourceKey::new(groups::BACKUP, kinds::DEFAULT_BACKUP, id);
        store
            .create_resource(
                NewResource::new(key.clone())
                    .with_label(labels::INSTANCE_GUID, "X")
                    .with_options(json!({ "instance_guid": "X", "plan_id": "P" })),
            )
            .unwrap();
        key
    }

    #[tokio::test]
    async fn backup_is_claimed_and_submitted() {
        let h = harness();
        let key = backup(&h.store, "b1");
        let operator = Operator::new(OperatorKind::Backup, h.ctx.clone());

        operator.reconcile(&key).await.unwrap();

        let resource = h.store.get_resource(&key).unwrap();
        assert_eq!(resource.state(), ResourceState::InProgress);
        assert_eq!(
            resource.status.description,
            "Backup of instance X is in progress."
        );
        let job_id = resource.metadata(meta::JOB_ID).unwrap();
        assert_eq!(h.snapshot.job_id_for("b1").await.as_deref(), Some(job_id));
        assert_eq!(resource.metadata(meta::LOCKED_BY), None);
        assert!(h.ctx.locks.check("X").await.unwrap().is_some());

        // A second pass does nothing.
        operator.reconcile(&key).await.unwrap();
        assert_eq!(h.snapshot.submitted_jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn invalid_options_fail_the_resource() {
        let h = harness();
        let key = ResourceKey::new(groups::BACKUP, kinds::DEFAULT_BACKUP, "bad");
        h.store
            .create_resource(NewResource::new(key.clone()).with_options(json!({ "plan_id": "P" })))
            .unwrap();
        let operator = Operator::new(OperatorKind::Backup, h.ctx.clone());
        operator.reconcile(&key).await.unwrap();

        let resource = h.store.get_resource(&key).unwrap();
        assert_eq!(resource.state(), ResourceState::Failed);
        assert!(resource.status.error.is_some());
        assert!(h.snapshot.submitted_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn locked_deployment_fails_second_backup() {
        let h = harness();
        let first = backup(&h.store, "b1");
        let second = backup(&h.store, "b2");
        let operator = Operator::new(OperatorKind::Backup, h.ctx.clone());
        operator.reconcile(&first).await.unwrap();
        operator.reconcile(&second).await.unwrap();

        let resource = h.store.get_resource(&second).unwrap();
        assert_eq!(resource.state(), ResourceState::Failed);
        assert!(resource.status.description.contains("locked"));
    }

    #[tokio::test]
    async fn aborting_before_start_goes_to_aborted() {
        let h = harness();
        let key = backup(&h.store, "b1");
        h.store
            .update_resource(
                &key,
                ResourceUpdate::status(fabrik_state::ResourceStatus::new(
                    ResourceState::Aborting,
                )),
            )
            .unwrap();
        let operator = Operator::new(OperatorKind::Backup, h.ctx.clone());
        operator.reconcile(&key).await.unwrap();
        assert_eq!(
            h.store.get_resource(&key).unwrap().state(),
            ResourceState::Aborted
        );
        assert!(h.snapshot.submitted_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn unknown_task_type_fails_task() {
        let h = harness();
        let key = ResourceKey::new(groups::SERVICE_FLOW, kinds::TASK, "t1");
        h.store
            .create_resource(NewResource::new(key.clone()).with_options(json!({
                "task_type": "NotARealType",
                "instance_id": "X",
            })))
            .unwrap();
        let operator = Operator::new(OperatorKind::Task, h.ctx.clone());
        operator.reconcile(&key).await.unwrap();

        let resource = h.store.get_resource(&key).unwrap();
        assert_eq!(resource.state(), ResourceState::Failed);
        assert!(resource.status.description.contains("unknown task type"));
    }

    #[tokio::test]
    async fn run_loop_processes_created_resources() {
        let h = harness();
        let operator = Arc::new(Operator::new(OperatorKind::Backup, h.ctx.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(operator.clone().run(shutdown_rx));

        let key = backup(&h.store, "b1");
        let mut state = ResourceState::InQueue;
        for _ in 0..100 {
            state = h.store.get_resource(&key).unwrap().state();
            if state == ResourceState::InProgress {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, ResourceState::InProgress);

        // Cancellation after submission is left to the poller.
        request_cancellation(&h.store, &key).await.unwrap();
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(
            h.store.get_resource(&key).unwrap().state(),
            ResourceState::Aborting
        );
    }

    #[tokio::test]
    async fn lagged_watch_relists_after_bookmark_expiry() {
        // Two retained events: any burst evicts the operator's bookmark.
        let h = harness_with(StateStore::open_in_memory().unwrap().with_history_capacity(2));
        let operator = Arc::new(Operator::new(OperatorKind::Backup, h.ctx.clone()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(operator.clone().run(shutdown_rx));
        // Let the watch come up on the empty store.
        tokio::time::sleep(Duration::from_millis(50)).await;

        // No await in between: the watcher cannot drain, so it lags.
        let key = backup(&h.store, "b1");
        for n in 0..1500 {
            h.store
                .create_resource(NewResource::new(ResourceKey::new(
                    groups::AGENT,
                    kinds::AGENT_CALL,
                    format!("call-{n}"),
                )))
                .unwrap();
        }

        let mut state = ResourceState::InQueue;
        for _ in 0..200 {
            state = h.store.get_resource(&key).unwrap().state();
            if state == ResourceState::InProgress {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(state, ResourceState::InProgress);
        assert_eq!(h.snapshot.submitted_jobs().await.len(), 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
