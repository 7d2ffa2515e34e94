//! Tasks: the closed set of units of work the registry dispatches to.
//!
//! A task turns an intent ("back up instance X") into a child resource that
//! an operator then drives. Running a task only initiates work; the child's
//! own status carries the outcome.
//!
//! Child ids are UUIDv5 of the task type and task id, so running the same
//! task twice lands on the same child.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, info};
use uuid::Uuid;

use fabrik_state::{
    NewResource, ResourceClient, ResourceKey, ResourceStatus, ResourceUpdate, groups, kinds,
    labels,
};

use crate::error::{OperatorError, OperatorResult};
use crate::status::conditional_update;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    #[serde(rename = "ServiceInstanceBackupTask")]
    ServiceInstanceBackup,
    #[serde(rename = "ServiceInstanceUpdateTask")]
    ServiceInstanceUpdate,
    #[serde(rename = "BlueprintTask")]
    Blueprint,
}

impl TaskType {
    pub const ALL: [TaskType; 3] = [
        TaskType::ServiceInstanceBackup,
        TaskType::ServiceInstanceUpdate,
        TaskType::Blueprint,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            TaskType::ServiceInstanceBackup => "ServiceInstanceBackupTask",
            TaskType::ServiceInstanceUpdate => "ServiceInstanceUpdateTask",
            TaskType::Blueprint => "BlueprintTask",
        }
    }

    /// `(group, kind)` of the resource this task creates.
    pub fn child_type(&self) -> (&'static str, &'static str) {
        match self {
            TaskType::ServiceInstanceBackup => (groups::BACKUP, kinds::DEFAULT_BACKUP),
            TaskType::ServiceInstanceUpdate => (groups::DEPLOYMENT, kinds::DIRECTOR),
            TaskType::Blueprint => (groups::AGENT, kinds::AGENT_CALL),
        }
    }

    fn operation(&self) -> &'static str {
        match self {
            TaskType::ServiceInstanceBackup => "backup",
            TaskType::ServiceInstanceUpdate => "update",
            TaskType::Blueprint => "blueprint",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TaskType {
    type Err = OperatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskType::ALL
            .into_iter()
            .find(|t| t.name() == s)
            .ok_or_else(|| OperatorError::UnknownTaskType(s.to_string()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub description: String,
}

/// Correlation object threaded through one [`Task::run`].
///
/// Stored as the options of `serviceflow/task` resources; `resource` and
/// `response` are outputs filled in by `run`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskDetails {
    pub task_type: String,
    #[serde(default)]
    pub task_description: String,
    pub instance_id: String,
    #[serde(default)]
    pub operation_params: Value,
    #[serde(default)]
    pub user: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serviceflow_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_order: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<TaskResponse>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    task_type: TaskType,
}

impl Task {
    pub(crate) fn new(task_type: TaskType) -> Self {
        Self { task_type }
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    /// Key of the child resource created for `task_id`.
    pub fn child_key(&self, task_id: &str) -> ResourceKey {
        let (group, kind) = self.task_type.child_type();
        let name = format!("{}/{}", self.task_type.name(), task_id);
        let id = Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes());
        ResourceKey::new(group, kind, id.to_string())
    }

    /// Create the child resource for `task_id` and record it in the
    /// returned details. Safe to call again with the same `task_id`.
    pub async fn run(
        &self,
        client: &dyn ResourceClient,
        task_id: &str,
        mut details: TaskDetails,
    ) -> OperatorResult<TaskDetails> {
        let key = self.child_key(task_id);
        let mut options = json!({
            "instance_guid": details.instance_id,
            "operation": self.task_type.operation(),
            "parameters": details.operation_params,
            "user": details.user,
        });
        if let Some(plan_id) = details.operation_params.get("plan_id") {
            options["plan_id"] = plan_id.clone();
        }

        let new = NewResource::new(key.clone())
            .with_label(labels::INSTANCE_GUID, details.instance_id.as_str())
            .with_label(labels::TASK_ID, task_id)
            .with_options(options);

        match client.create_resource(new).await {
            Ok(_) => info!(%task_id, child = %key, task_type = %self.task_type, "task started"),
            Err(e) if e.is_already_exists() => {
                debug!(%task_id, child = %key, "task child already exists")
            }
            Err(e) => return Err(e.into()),
        }

        let what = if details.task_description.is_empty() {
            self.task_type.name().to_string()
        } else {
            details.task_description.clone()
        };
        details.response = Some(TaskResponse {
            description: match self.task_type {
                TaskType::ServiceInstanceBackup => {
                    format!("Backup of instance {} is in progress.", details.instance_id)
                }
                _ => format!("{what} is in progress."),
            },
        });
        details.resource = Some(key);
        Ok(details)
    }

    /// Current status of the child resource recorded in `details`. Never
    /// writes.
    pub async fn get_status(
        &self,
        client: &dyn ResourceClient,
        details: &TaskDetails,
    ) -> OperatorResult<ResourceStatus> {
        let key = details.resource.as_ref().ok_or_else(|| OperatorError::InvalidOptions {
            key: details.task_type.clone(),
            message: "task has not been run".to_string(),
        })?;
        Ok(client.get_resource_status(key).await?)
    }

    /// Optimistic status write for a task resource, retried after
    /// re-reading on conflict.
    pub async fn update_status(
        &self,
        client: &dyn ResourceClient,
        key: &ResourceKey,
        status: ResourceStatus,
    ) -> OperatorResult<()> {
        conditional_update(client, key, |current| {
            // The store owns the timestamp; compare everything else.
            let mut wanted = status.clone();
            wanted.state_changed_at_ms = current.status.state_changed_at_ms;
            (current.status != wanted).then(|| ResourceUpdate::status(status.clone()))
        })
        .await?;
        Ok(())
    }
}
