//! Shared handles passed to every operator and poller.

use std::sync::Arc;

use fabrik_state::ResourceClient;

use crate::backend::{BackendClient, BackendKind, SimulatedBackend};
use crate::config::FabrikConfig;
use crate::error::OperatorResult;
use crate::lock::LockManager;
use crate::registry::TaskRegistry;

/// One client per backend.
#[derive(Clone)]
pub struct Backends {
    pub director: Arc<dyn BackendClient>,
    pub snapshot: Arc<dyn BackendClient>,
    pub agent: Arc<dyn BackendClient>,
}

impl Backends {
    pub fn new(
        director: Arc<dyn BackendClient>,
        snapshot: Arc<dyn BackendClient>,
        agent: Arc<dyn BackendClient>,
    ) -> Self {
        Self {
            director,
            snapshot,
            agent,
        }
    }

    /// Simulated backends that finish every job after `polls` status queries.
    pub fn simulated(polls: u32) -> Self {
        Self::new(
            Arc::new(SimulatedBackend::new(BackendKind::Director).with_auto_complete(polls)),
            Arc::new(SimulatedBackend::new(BackendKind::Snapshot).with_auto_complete(polls)),
            Arc::new(SimulatedBackend::new(BackendKind::Agent).with_auto_complete(polls)),
        )
    }

    pub fn get(&self, kind: BackendKind) -> &Arc<dyn BackendClient> {
        match kind {
            BackendKind::Director => &self.director,
            BackendKind::Snapshot => &self.snapshot,
            BackendKind::Agent => &self.agent,
        }
    }
}

#[derive(Clone)]
pub struct EngineContext {
    pub client: Arc<dyn ResourceClient>,
    pub backends: Backends,
    pub registry: TaskRegistry,
    pub config: Arc<FabrikConfig>,
    /// Stamped on claims, poller leases and locks.
    pub identity: String,
    pub locks: LockManager,
    /// Same owner, `deployment.allocation_lock_ttl` lifetime.
    pub allocation_locks: LockManager,
}

impl EngineContext {
    pub fn new(
        client: Arc<dyn ResourceClient>,
        backends: Backends,
        config: FabrikConfig,
        identity: impl Into<String>,
    ) -> OperatorResult<Self> {
        let identity = identity.into();
        let locks = LockManager::new(client.clone(), identity.clone(), config.lock_ttl()?);
        let allocation_locks = locks.clone().with_ttl(config.allocation_lock_ttl()?);
        Ok(Self {
            client,
            backends,
            registry: TaskRegistry::new(),
            config: Arc::new(config),
            identity,
            locks,
            allocation_locks,
        })
    }
}
