//! The closed set of resource types the engine drives.

use std::fmt;

use fabrik_state::{groups, kinds};

use crate::backend::BackendKind;

/// One operator and one status poller exist per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperatorKind {
    Task,
    Backup,
    Restore,
    Deployment,
    AgentCall,
    ServiceFlow,
}

impl OperatorKind {
    pub const ALL: [OperatorKind; 6] = [
        OperatorKind::Task,
        OperatorKind::Backup,
        OperatorKind::Restore,
        OperatorKind::Deployment,
        OperatorKind::AgentCall,
        OperatorKind::ServiceFlow,
    ];

    pub fn group(&self) -> &'static str {
        match self {
            OperatorKind::Task | OperatorKind::ServiceFlow => groups::SERVICE_FLOW,
            OperatorKind::Backup | OperatorKind::Restore => groups::BACKUP,
            OperatorKind::Deployment => groups::DEPLOYMENT,
            OperatorKind::AgentCall => groups::AGENT,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OperatorKind::Task => kinds::TASK,
            OperatorKind::Backup => kinds::DEFAULT_BACKUP,
            OperatorKind::Restore => kinds::DEFAULT_RESTORE,
            OperatorKind::Deployment => kinds::DIRECTOR,
            OperatorKind::AgentCall => kinds::AGENT_CALL,
            OperatorKind::ServiceFlow => kinds::SERIAL_SERVICE_FLOW,
        }
    }

    /// Short name used in configuration and logs.
    pub fn name(&self) -> &'static str {
        match self {
            OperatorKind::Task => "task",
            OperatorKind::Backup => "backup",
            OperatorKind::Restore => "restore",
            OperatorKind::Deployment => "deployment",
            OperatorKind::AgentCall => "agent_call",
            OperatorKind::ServiceFlow => "serviceflow",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    /// The backend whose jobs this kind submits, if it submits any.
    /// Tasks and flows are driven through child resources instead.
    pub fn backend(&self) -> Option<BackendKind> {
        match self {
            OperatorKind::Backup | OperatorKind::Restore => Some(BackendKind::Snapshot),
            OperatorKind::Deployment => Some(BackendKind::Director),
            OperatorKind::AgentCall => Some(BackendKind::Agent),
            OperatorKind::Task | OperatorKind::ServiceFlow => None,
        }
    }

    /// Operation submitted when the resource options name none.
    pub fn default_operation(&self) -> &'static str {
        match self {
            OperatorKind::Backup => "backup",
            OperatorKind::Restore => "restore",
            OperatorKind::Deployment => "create",
            OperatorKind::AgentCall => "call",
            OperatorKind::Task => "task",
            OperatorKind::ServiceFlow => "serviceflow",
        }
    }

    /// Whether work on this kind must hold the instance's deployment lock.
    pub fn takes_deployment_lock(&self) -> bool {
        matches!(
            self,
            OperatorKind::Backup | OperatorKind::Restore | OperatorKind::Deployment
        )
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_kind_maps_to_a_distinct_resource_type() {
        let mut seen = std::collections::HashSet::new();
        for kind in OperatorKind::ALL {
            assert!(seen.insert((kind.group(), kind.kind())));
            assert_eq!(OperatorKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(OperatorKind::from_name("snapshot"), None);
    }

    #[test]
    fn backend_kinds() {
        assert_eq!(OperatorKind::Backup.backend(), Some(BackendKind::Snapshot));
        assert_eq!(OperatorKind::Deployment.backend(), Some(BackendKind::Director));
        assert_eq!(OperatorKind::ServiceFlow.backend(), None);
        assert!(OperatorKind::Restore.takes_deployment_lock());
        assert!(!OperatorKind::AgentCall.takes_deployment_lock());
    }
}
