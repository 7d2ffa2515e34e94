//! Serial service flows.
//!
//! A flow resource names a configured, ordered list of tasks. The flow
//! operator creates task `{flow_id}.0`; the flow poller creates
//! `{flow_id}.{n+1}` once task `n` succeeds. Task ids are deterministic so
//! a relay that runs twice creates nothing new.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use fabrik_state::{NewResource, Resource, ResourceClient, ResourceKey, groups, kinds, labels};

use crate::config::ServiceFlowDefinition;
use crate::error::{OperatorError, OperatorResult};
use crate::task::TaskDetails;

/// Options of a `serviceflow/serialserviceflow` resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServiceFlowOptions {
    pub serviceflow_name: String,
    pub instance_id: String,
    #[serde(default)]
    pub operation_params: Value,
    #[serde(default)]
    pub user: Value,
}

impl ServiceFlowOptions {
    pub fn from_resource(resource: &Resource) -> OperatorResult<Self> {
        resource
            .options_as()
            .map_err(|e| OperatorError::InvalidOptions {
                key: resource.key.to_string(),
                message: e.to_string(),
            })
    }
}

pub fn task_id(flow_id: &str, order: u32) -> String {
    format!("{flow_id}.{order}")
}

pub fn task_key(flow_id: &str, order: u32) -> ResourceKey {
    ResourceKey::new(groups::SERVICE_FLOW, kinds::TASK, task_id(flow_id, order))
}

/// Create the task resource for step `order` of a flow. Existing tasks are
/// left as they are.
pub async fn create_flow_task(
    client: &dyn ResourceClient,
    flow_id: &str,
    flow: &ServiceFlowDefinition,
    options: &ServiceFlowOptions,
    order: u32,
) -> OperatorResult<ResourceKey> {
    let step = flow.tasks.get(order as usize).ok_or_else(|| {
        OperatorError::Config(format!(
            "service flow '{}' has no task {order}",
            options.serviceflow_name
        ))
    })?;

    let details = TaskDetails {
        task_type: step.task_type.clone(),
        task_description: step.task_description.clone(),
        instance_id: options.instance_id.clone(),
        operation_params: if step.operation_params.is_null() {
            options.operation_params.clone()
        } else {
            step.operation_params.clone()
        },
        user: options.user.clone(),
        serviceflow_id: Some(flow_id.to_string()),
        task_order: Some(order),
        ..TaskDetails::default()
    };
    let key = task_key(flow_id, order);
    let new = NewResource::new(key.clone())
        .with_label(labels::SERVICEFLOW_ID, flow_id)
        .with_label(labels::TASK_ORDER, order.to_string())
        .with_label(labels::INSTANCE_GUID, options.instance_id.as_str())
        .with_options(serde_json::to_value(&details).map_err(|e| {
            OperatorError::InvalidOptions {
                key: key.to_string(),
                message: e.to_string(),
            }
        })?);

    match client.create_resource(new).await {
        Ok(_) => info!(%flow_id, order, task_type = %step.task_type, "flow task created"),
        Err(e) if e.is_already_exists() => debug!(%flow_id, order, "flow task already exists"),
        Err(e) => return Err(e.into()),
    }
    Ok(key)
}
