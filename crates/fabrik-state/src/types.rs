//! Domain types for the Fabrik resource store.
//!
//! A [`Resource`] is the unit of persisted intent: an immutable `options`
//! payload describing what to do, a mutable [`ResourceStatus`] describing
//! how far it got, and an `operator_metadata` side-channel for bookkeeping
//! that must not be confused with status.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{StateError, StateResult};

/// Resource groups known to the control plane.
pub mod groups {
    pub const LOCK: &str = "lock.servicefabrik.io";
    pub const DEPLOYMENT: &str = "deployment.servicefabrik.io";
    /// Holds both backups and restores.
    pub const BACKUP: &str = "backup.servicefabrik.io";
    pub const SERVICE_FLOW: &str = "serviceflow.servicefabrik.io";
    pub const AGENT: &str = "agent.servicefabrik.io";
}

/// Resource kinds (types) within the groups above.
pub mod kinds {
    pub const DEPLOYMENT_LOCKS: &str = "deploymentlock";
    pub const DIRECTOR: &str = "director";
    pub const DEFAULT_BACKUP: &str = "defaultbackup";
    pub const DEFAULT_RESTORE: &str = "defaultrestore";
    pub const TASK: &str = "task";
    pub const SERIAL_SERVICE_FLOW: &str = "serialserviceflow";
    pub const AGENT_CALL: &str = "agentcall";
}

/// Well-known label names.
pub mod labels {
    pub const INSTANCE_GUID: &str = "instance_guid";
    pub const SERVICEFLOW_ID: &str = "serviceflow_id";
    pub const TASK_ORDER: &str = "task_order";
    pub const TASK_ID: &str = "task_id";
}

/// Current wall-clock time as seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Current wall-clock time as milliseconds since the Unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ── Identity ───────────────────────────────────────────────────────

/// `(group, kind, id)` triple identifying a resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceKey {
    pub group: String,
    pub kind: String,
    pub id: String,
}

impl ResourceKey {
    pub fn new(group: impl Into<String>, kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Composite redb key: `{group}/{kind}/{id}`.
    pub fn table_key(&self) -> String {
        format!("{}/{}/{}", self.group, self.kind, self.id)
    }

    /// Key prefix shared by every resource of one `(group, kind)`.
    pub fn kind_prefix(group: &str, kind: &str) -> String {
        format!("{group}/{kind}/")
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.kind, self.id)
    }
}

// ── State ──────────────────────────────────────────────────────────

/// Lifecycle state of a resource.
///
/// `in_queue → in_progress → {succeeded | failed}`, with the
/// `aborting → aborted` branch for cooperative cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    InQueue,
    InProgress,
    Succeeded,
    Failed,
    Aborting,
    Aborted,
}

impl ResourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceState::InQueue => "in_queue",
            ResourceState::InProgress => "in_progress",
            ResourceState::Succeeded => "succeeded",
            ResourceState::Failed => "failed",
            ResourceState::Aborting => "aborting",
            ResourceState::Aborted => "aborted",
        }
    }

    /// No status write is accepted once a resource is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ResourceState::Succeeded | ResourceState::Failed | ResourceState::Aborted
        )
    }

    pub fn can_transition_to(&self, next: ResourceState) -> bool {
        use ResourceState::*;
        match self {
            InQueue => matches!(next, InQueue | InProgress | Failed | Aborting | Aborted),
            InProgress => matches!(next, InProgress | Succeeded | Failed | Aborting),
            Aborting => matches!(next, Aborting | Aborted),
            Succeeded | Failed | Aborted => false,
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_queue" => Ok(ResourceState::InQueue),
            "in_progress" => Ok(ResourceState::InProgress),
            "succeeded" => Ok(ResourceState::Succeeded),
            "failed" => Ok(ResourceState::Failed),
            "aborting" => Ok(ResourceState::Aborting),
            "aborted" => Ok(ResourceState::Aborted),
            other => Err(format!("unknown resource state: {other}")),
        }
    }
}

// ── Status ─────────────────────────────────────────────────────────

/// Mutable part of a resource, written by operators and pollers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub state: ResourceState,
    #[serde(default)]
    pub description: String,
    /// Free-form progress detail (e.g. the backend job handle).
    #[serde(default)]
    pub last_operation: Value,
    /// Free-form result or error detail.
    #[serde(default)]
    pub response: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Set by the store whenever `state` changes (epoch millis).
    #[serde(default)]
    pub state_changed_at_ms: u64,
}

impl ResourceStatus {
    pub fn new(state: ResourceState) -> Self {
        Self {
            state,
            description: String::new(),
            last_operation: Value::Null,
            response: Value::Null,
            error: None,
            state_changed_at_ms: 0,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_response(mut self, response: Value) -> Self {
        self.response = response;
        self
    }

    pub fn with_last_operation(mut self, last_operation: Value) -> Self {
        self.last_operation = last_operation;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Copy of this status moved to `state`, keeping the free-form fields.
    pub fn transitioned(&self, state: ResourceState) -> Self {
        Self {
            state,
            ..self.clone()
        }
    }
}

impl Default for ResourceStatus {
    fn default() -> Self {
        Self::new(ResourceState::InQueue)
    }
}

// ── Resource ───────────────────────────────────────────────────────

/// A persisted, typed, labeled record of intent and status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    #[serde(flatten)]
    pub key: ResourceKey,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Immutable after creation.
    #[serde(default)]
    pub options: Value,
    pub status: ResourceStatus,
    #[serde(default)]
    pub operator_metadata: BTreeMap<String, String>,
    /// Store revision of the last write to this resource.
    pub resource_version: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

impl Resource {
    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn state(&self) -> ResourceState {
        self.status.state
    }

    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }

    pub fn metadata(&self, name: &str) -> Option<&str> {
        self.operator_metadata.get(name).map(String::as_str)
    }

    /// Deserialize the options payload into a typed struct.
    pub fn options_as<T: DeserializeOwned>(&self) -> StateResult<T> {
        serde_json::from_value(self.options.clone())
            .map_err(|e| StateError::Deserialize(format!("{}: {e}", self.key)))
    }
}

/// Everything a caller supplies when creating a resource.
#[derive(Debug, Clone, PartialEq)]
pub struct NewResource {
    pub key: ResourceKey,
    pub labels: BTreeMap<String, String>,
    pub options: Value,
    pub status: ResourceStatus,
}

impl NewResource {
    /// A new resource in `in_queue` with no labels and empty options.
    pub fn new(key: ResourceKey) -> Self {
        Self {
            key,
            labels: BTreeMap::new(),
            options: Value::Null,
            status: ResourceStatus::default(),
        }
    }

    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    pub fn with_options(mut self, options: Value) -> Self {
        self.options = options;
        self
    }

    pub fn with_status(mut self, status: ResourceStatus) -> Self {
        self.status = status;
        self
    }
}

/// A conditional write against an existing resource.
///
/// `status` replaces the whole status when present. Metadata entries are
/// merged key by key; a `None` value removes the key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceUpdate {
    pub status: Option<ResourceStatus>,
    pub operator_metadata: BTreeMap<String, Option<String>>,
    pub expected_version: Option<u64>,
}

impl ResourceUpdate {
    pub fn status(status: ResourceStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn metadata(patch: BTreeMap<String, Option<String>>) -> Self {
        Self {
            operator_metadata: patch,
            ..Self::default()
        }
    }

    pub fn with_metadata(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.operator_metadata.insert(name.into(), Some(value.into()));
        self
    }

    pub fn without_metadata(mut self, name: impl Into<String>) -> Self {
        self.operator_metadata.insert(name.into(), None);
        self
    }

    /// Fail with a conflict unless the stored version equals `version`.
    pub fn expect_version(mut self, version: u64) -> Self {
        self.expected_version = Some(version);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_accept_nothing() {
        use ResourceState::*;
        for terminal in [Succeeded, Failed, Aborted] {
            for next in [InQueue, InProgress, Succeeded, Failed, Aborting, Aborted] {
                assert!(!terminal.can_transition_to(next), "{terminal} -> {next}");
            }
        }
    }

    #[test]
    fn abort_branch_reachable_from_in_progress_only_via_aborting() {
        use ResourceState::*;
        assert!(InProgress.can_transition_to(Aborting));
        assert!(!InProgress.can_transition_to(Aborted));
        assert!(Aborting.can_transition_to(Aborted));
        assert!(!Aborting.can_transition_to(Succeeded));
    }

    #[test]
    fn state_round_trips_through_str() {
        for s in ["in_queue", "in_progress", "succeeded", "failed", "aborting", "aborted"] {
            let state: ResourceState = s.parse().unwrap();
            assert_eq!(state.as_str(), s);
        }
        assert!("done".parse::<ResourceState>().is_err());
    }

    #[test]
    fn resource_serializes_with_flattened_key() {
        let resource = Resource {
            key: ResourceKey::new(groups::BACKUP, kinds::DEFAULT_BACKUP, "b-1"),
            labels: BTreeMap::from([(labels::INSTANCE_GUID.to_string(), "X".to_string())]),
            options: serde_json::json!({ "plan_id": "P" }),
            status: ResourceStatus::default(),
            operator_metadata: BTreeMap::new(),
            resource_version: 3,
            created_at: 1000,
            updated_at: 1000,
        };
        let json = serde_json::to_value(&resource).unwrap();
        assert_eq!(json["group"], "backup.servicefabrik.io");
        assert_eq!(json["status"]["state"], "in_queue");

        let back: Resource = serde_json::from_value(json).unwrap();
        assert_eq!(back, resource);
    }

    #[test]
    fn options_as_reports_key_on_mismatch() {
        #[derive(Debug, Deserialize)]
        #[allow(dead_code)]
        struct Opts {
            plan_id: u32,
        }
        let resource = Resource {
            key: ResourceKey::new("g", "k", "id"),
            labels: BTreeMap::new(),
            options: serde_json::json!({ "plan_id": "not-a-number" }),
            status: ResourceStatus::default(),
            operator_metadata: BTreeMap::new(),
            resource_version: 1,
            created_at: 0,
            updated_at: 0,
        };
        let err = resource.options_as::<Opts>().unwrap_err();
        assert!(err.to_string().contains("g/k/id"));
    }
}
