//! fabrik-operator — the resource-driven orchestration engine.
//!
//! Requests arrive as resources in the store. For every resource type the
//! engine runs an [`Operator`] that watches, claims and executes queued
//! resources, and a [`StatusPoller`] that follows the long-running work
//! until it reaches a terminal state.
//!
//! # Architecture
//!
//! ```text
//! Engine
//!   ├── EngineContext (ResourceClient, Backends, TaskRegistry, config, LockManager)
//!   ├── Operator × 6
//!   │   ├── watch loop (bookmark resume, relist on expiry)
//!   │   ├── bounded queue → worker pool
//!   │   ├── claim (in_queue → in_progress, one conditional write)
//!   │   └── execute
//!   │       ├── task        → TaskRegistry → Task::run → child resource
//!   │       ├── backup/restore/agent call → BackendClient::submit
//!   │       ├── deployment  → DeploymentPlanner (name, segment, manifest) → submit
//!   │       └── serviceflow → task {flow}.0
//!   └── StatusPoller × 6
//!       ├── poller lease
//!       ├── timeout → failed
//!       ├── backend job / child / flow task → canonical state
//!       └── aborting → cancel → aborted
//! ```
//!
//! # Errors
//!
//! Nothing that goes wrong with one resource escapes to the loops: the
//! operator writes `failed` (or `aborted`) with a description, the poller
//! logs and retries on its next tick. Configuration problems are caught by
//! [`Engine::new`] before anything runs.

pub mod backend;
pub mod cache;
pub mod claim;
pub mod config;
pub mod context;
pub mod deployment;
pub mod engine;
pub mod error;
pub mod kind;
pub mod lock;
pub mod meta;
pub mod operator;
pub mod options;
pub mod poller;
pub mod registry;
pub mod serviceflow;
pub mod status;
pub mod task;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{
    BackendClient, BackendJob, BackendKind, BackendStatus, JobState, SimulatedBackend,
};
pub use cache::DeploymentNameCache;
pub use claim::{ClaimOutcome, claim};
pub use config::{FabrikConfig, FlowTaskDefinition, ServiceFlowDefinition, parse_duration};
pub use context::{Backends, EngineContext};
pub use deployment::{DeploymentPlanner, PreparedDeployment};
pub use engine::Engine;
pub use error::{OperatorError, OperatorResult};
pub use kind::OperatorKind;
pub use lock::{LockDetails, LockManager};
pub use operator::Operator;
pub use options::OperationOptions;
pub use poller::{StatusPoller, TickSummary};
pub use registry::TaskRegistry;
pub use serviceflow::ServiceFlowOptions;
pub use task::{Task, TaskDetails, TaskResponse, TaskType};
