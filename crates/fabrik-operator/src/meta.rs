//! Keys the engine writes into `operator_metadata`.

/// Identity of the worker currently processing the resource.
pub const LOCKED_BY: &str = "locked_by";
/// Epoch seconds at which the claim was taken.
pub const PROCESSING_STARTED_AT: &str = "processing_started_at";
/// Backend job handle, or the child resource key for tasks.
pub const JOB_ID: &str = "job_id";
/// Set once the poller has asked the backend to cancel.
pub const CANCEL_REQUESTED: &str = "cancel_requested";
pub const POLLER_LOCKED_BY: &str = "poller_locked_by";
/// Epoch millis.
pub const POLLER_LOCKED_AT: &str = "poller_locked_at";
pub const DEPLOYMENT_NAME: &str = "deployment_name";
pub const NETWORK_INDEX: &str = "network_index";
/// Order of the flow task currently running.
pub const CURRENT_TASK: &str = "current_task";
