use serde::{Deserialize, Serialize};
use serde_json::Value;

use fabrik_state::Resource;

use crate::error::{OperatorError, OperatorResult};

/// Options payload shared by backup, restore, deployment and agent call
/// resources.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperationOptions {
    pub instance_guid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    /// Backend operation; the operator kind supplies a default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub user: Value,
}

impl OperationOptions {
    pub fn from_resource(resource: &Resource) -> OperatorResult<Self> {
        let options: Self = resource
            .options_as()
            .map_err(|e| OperatorError::InvalidOptions {
                key: resource.key.to_string(),
                message: e.to_string(),
            })?;
        if options.instance_guid.is_empty() {
            return Err(OperatorError::InvalidOptions {
                key: resource.key.to_string(),
                message: "instance_guid is required".to_string(),
            });
        }
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabrik_state::{NewResource, ResourceKey, StateStore, groups, kinds};
    use serde_json::json;

    fn stored(options: Value) -> Resource {
        let store = StateStore::open_in_memory().unwrap();
        store
            .create_resource(
                NewResource::new(ResourceKey::new(groups::BACKUP, kinds::DEFAULT_BACKUP, "b"))
                    .with_options(options),
            )
            .unwrap()
    }

    #[test]
    fn parses_backup_options() {
        let resource = stored(json!({ "instance_guid": "X", "plan_id": "P" }));
        let options = OperationOptions::from_resource(&resource).unwrap();
        assert_eq!(options.instance_guid, "X");
        assert_eq!(options.plan_id.as_deref(), Some("P"));
        assert_eq!(options.operation, None);
    }

    #[test]
    fn missing_instance_is_invalid() {
        let resource = stored(json!({ "plan_id": "P" }));
        let err = OperationOptions::from_resource(&resource).unwrap_err();
        assert!(matches!(err, OperatorError::InvalidOptions { .. }));
        assert!(err.is_precondition());
    }
}
