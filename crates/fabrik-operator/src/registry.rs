//! Task registry: task type name → [`Task`].
//!
//! The set is fixed at build time. Asking for anything else is a
//! configuration error, surfaced at startup by [`TaskRegistry::validate`]
//! and never retried at run time.

use std::collections::HashMap;

use crate::error::{OperatorError, OperatorResult};
use crate::task::{Task, TaskType};

#[derive(Debug, Clone)]
pub struct TaskRegistry {
    tasks: HashMap<&'static str, Task>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        let tasks = TaskType::ALL
            .into_iter()
            .map(|t| (t.name(), Task::new(t)))
            .collect();
        Self { tasks }
    }

    pub fn get_task(&self, task_type: &str) -> OperatorResult<Task> {
        self.tasks
            .get(task_type)
            .copied()
            .ok_or_else(|| OperatorError::UnknownTaskType(task_type.to_string()))
    }

    /// Reject configured task types with no implementation.
    pub fn validate(&self, task_types: &[String]) -> OperatorResult<()> {
        for task_type in task_types {
            self.get_task(task_type)?;
        }
        Ok(())
    }

    pub fn task_types(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.tasks.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for TaskRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_types_resolve() {
        let registry = TaskRegistry::new();
        let task = registry.get_task("ServiceInstanceBackupTask").unwrap();
        assert_eq!(task.task_type(), TaskType::ServiceInstanceBackup);
        assert_eq!(registry.task_types().len(), 3);
    }

    #[test]
    fn unknown_type_is_precondition_error() {
        let registry = TaskRegistry::new();
        let err = registry.get_task("NotARealType").unwrap_err();
        assert!(matches!(err, OperatorError::UnknownTaskType(ref t) if t == "NotARealType"));
        assert!(err.is_precondition());
        assert!(!err.is_retryable());
    }

    #[test]
    fn validate_rejects_unregistered() {
        let registry = TaskRegistry::new();
        registry
            .validate(&["BlueprintTask".to_string()])
            .unwrap();
        assert!(
            registry
                .validate(&["BlueprintTask".to_string(), "Bogus".to_string()])
                .is_err()
        );
    }
}
