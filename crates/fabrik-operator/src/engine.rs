//! Engine: validated configuration plus one operator and one poller per
//! resource type.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;
use uuid::Uuid;

use fabrik_state::ResourceClient;

use crate::config::FabrikConfig;
use crate::context::{Backends, EngineContext};
use crate::error::{OperatorError, OperatorResult};
use crate::kind::OperatorKind;
use crate::operator::Operator;
use crate::poller::{StatusPoller, TickSummary};

pub struct Engine {
    ctx: EngineContext,
    operators: HashMap<OperatorKind, Arc<Operator>>,
    pollers: HashMap<OperatorKind, Arc<StatusPoller>>,
}

impl Engine {
    /// Validate `config` and build every operator and poller.
    ///
    /// Configured task types and service-flow steps without a registered
    /// implementation are rejected here rather than on first use.
    pub fn new(
        client: Arc<dyn ResourceClient>,
        backends: Backends,
        config: FabrikConfig,
        identity: Option<String>,
    ) -> OperatorResult<Self> {
        config.validate()?;
        let identity = identity
            .or_else(|| config.operator.identity.clone())
            .unwrap_or_else(|| format!("fabrik-{}", Uuid::new_v4()));

        let ctx = EngineContext::new(client, backends, config, identity)?;
        ctx.registry.validate(&ctx.config.tasks.enabled)?;
        for (name, flow) in &ctx.config.serviceflows {
            for step in &flow.tasks {
                ctx.registry.get_task(&step.task_type).map_err(|_| {
                    OperatorError::Config(format!(
                        "service flow '{name}' uses unknown task type '{}'",
                        step.task_type
                    ))
                })?;
            }
        }

        let mut operators = HashMap::new();
        let mut pollers = HashMap::new();
        for kind in OperatorKind::ALL {
            operators.insert(kind, Arc::new(Operator::new(kind, ctx.clone())));
            pollers.insert(kind, Arc::new(StatusPoller::new(kind, ctx.clone())?));
        }
        info!(identity = %ctx.identity, "engine configured");

        Ok(Self {
            ctx,
            operators,
            pollers,
        })
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    pub fn identity(&self) -> &str {
        &self.ctx.identity
    }

    pub fn operator(&self, kind: OperatorKind) -> Option<&Arc<Operator>> {
        self.operators.get(&kind)
    }

    pub fn poller(&self, kind: OperatorKind) -> Option<&Arc<StatusPoller>> {
        self.pollers.get(&kind)
    }

    /// Start every operator and poller; they stop when `shutdown` flips.
    pub fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::with_capacity(self.operators.len() + self.pollers.len());
        for kind in OperatorKind::ALL {
            if let Some(operator) = self.operators.get(&kind) {
                handles.push(tokio::spawn(operator.clone().run(shutdown.clone())));
            }
            if let Some(poller) = self.pollers.get(&kind) {
                handles.push(tokio::spawn(poller.clone().run(shutdown.clone())));
            }
        }
        info!(tasks = handles.len(), "engine started");
        handles
    }

    /// Run one tick of every poller.
    pub async fn poll_all(&self) -> TickSummary {
        let mut summary = TickSummary::default();
        for kind in OperatorKind::ALL {
            if let Some(poller) = self.pollers.get(&kind) {
                summary.merge(poller.tick().await);
            }
        }
        summary
    }
}
