//! Deployment preparation: name, network segment and manifest.
//!
//! ```text
//! resource metadata ──hit──▶ (name, index)
//!        │ miss
//! DeploymentNameCache ─hit─▶ (name, index parsed from name)
//!        │ miss
//! allocation lock ─▶ lowest free index ─▶ metadata + cache
//!        │
//! plan_networks(index) ─▶ DeploymentManifest ─▶ YAML
//! ```

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use fabrik_network::{DeploymentManifest, deployment_name, parse_deployment_name, plan_networks};
use fabrik_state::{LabelSelector, Resource, ResourceClient, ResourceUpdate, groups, kinds};

use crate::cache::DeploymentNameCache;
use crate::config::FabrikConfig;
use crate::error::{OperatorError, OperatorResult};
use crate::lock::{ALLOCATION_LOCK, LockManager};
use crate::meta;
use crate::options::OperationOptions;
use crate::status::conditional_update;

const ALLOCATION_BACKOFF: Duration = Duration::from_millis(25);
const ALLOCATION_BACKOFF_MAX: Duration = Duration::from_secs(1);
/// Lock times are whole seconds, so expiry can trail the TTL by up to one.
const ALLOCATION_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct PreparedDeployment {
    pub deployment_name: String,
    pub network_index: u32,
    pub manifest: DeploymentManifest,
    pub manifest_yaml: String,
}

pub struct DeploymentPlanner {
    client: Arc<dyn ResourceClient>,
    config: Arc<FabrikConfig>,
    /// Locks taken with the short allocation TTL.
    allocation_locks: LockManager,
    cache: DeploymentNameCache,
}

impl DeploymentPlanner {
    pub fn new(
        client: Arc<dyn ResourceClient>,
        config: Arc<FabrikConfig>,
        allocation_locks: LockManager,
    ) -> Self {
        Self {
            cache: DeploymentNameCache::new(client.clone()),
            client,
            config,
            allocation_locks,
        }
    }

    pub fn cache(&self) -> &DeploymentNameCache {
        &self.cache
    }

    /// Resolve the deployment name and segment for `resource` and render
    /// its manifest.
    pub async fn prepare(
        &self,
        resource: &Resource,
        options: &OperationOptions,
    ) -> OperatorResult<PreparedDeployment> {
        let (name, index) = self.resolve(resource, &options.instance_guid).await?;

        let network = &self.config.network;
        let plans = plan_networks(&network.networks, index, &network.segmentation)?;
        let deployment = &self.config.deployment;
        let properties = json!({
            "instance_guid": options.instance_guid,
            "plan_id": options.plan_id,
            "parameters": options.parameters,
        });
        let manifest = DeploymentManifest::build(
            name.clone(),
            deployment.release.clone(),
            &deployment.instance_group,
            &plans,
            properties,
        );
        let manifest_yaml = manifest.to_yaml()?;
        debug!(deployment = %name, index, "manifest rendered");

        Ok(PreparedDeployment {
            deployment_name: name,
            network_index: index,
            manifest,
            manifest_yaml,
        })
    }

    async fn resolve(&self, resource: &Resource, instance_id: &str) -> OperatorResult<(String, u32)> {
        let prefix = &self.config.deployment.name_prefix;

        if let (Some(name), Some(index)) = (
            resource.metadata(meta::DEPLOYMENT_NAME),
            resource
                .metadata(meta::NETWORK_INDEX)
                .and_then(|v| v.parse::<u32>().ok()),
        ) {
            return Ok((name.to_string(), index));
        }

        if let Some(name) = self.cache.get(instance_id).await? {
            if let Some((index, _)) = parse_deployment_name(prefix, &name) {
                self.record(resource, &name, index).await?;
                return Ok((name, index));
            }
            debug!(%instance_id, deployment = %name, "cached name has foreign prefix, reallocating");
        }

        self.acquire_allocation_lock(resource).await?;
        let allocated = self.allocate(resource, instance_id).await;
        if let Err(e) = self
            .allocation_locks
            .unlock(ALLOCATION_LOCK, resource.key())
            .await
        {
            warn!(key = %resource.key, error = %e, "failed to release allocation lock");
        }
        let (name, index) = allocated?;
        self.cache.insert(instance_id, &name).await;
        Ok((name, index))
    }

    /// Wait for the allocation lock, at most one TTL plus grace: by then a
    /// lock left by a crashed replica has expired and is taken over.
    async fn acquire_allocation_lock(&self, resource: &Resource) -> OperatorResult<()> {
        let deadline = Instant::now() + self.allocation_locks.ttl() + ALLOCATION_GRACE;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self
                .allocation_locks
                .lock(ALLOCATION_LOCK, "allocate", resource.key())
                .await
            {
                Ok(_) => return Ok(()),
                Err(OperatorError::DeploymentLocked { .. }) if Instant::now() < deadline => {
                    tokio::time::sleep((ALLOCATION_BACKOFF * attempt).min(ALLOCATION_BACKOFF_MAX))
                        .await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Pick the lowest index no other deployment uses. Runs under the
    /// allocation lock.
    async fn allocate(&self, resource: &Resource, instance_id: &str) -> OperatorResult<(String, u32)> {
        let capacity = self.config.network.segmentation.capacity;
        let used: BTreeSet<u32> = self
            .client
            .list_resources(groups::DEPLOYMENT, kinds::DIRECTOR, &LabelSelector::everything())
            .await?
            .iter()
            .filter(|r| r.key != resource.key)
            .filter_map(|r| r.metadata(meta::NETWORK_INDEX)?.parse().ok())
            .collect();
        let index = (0..capacity)
            .find(|i| !used.contains(i))
            .ok_or(OperatorError::NoSegmentAvailable(capacity))?;

        let name = deployment_name(&self.config.deployment.name_prefix, index, instance_id);
        self.record(resource, &name, index).await?;
        info!(%instance_id, deployment = %name, index, "network segment allocated");
        Ok((name, index))
    }

    async fn record(&self, resource: &Resource, name: &str, index: u32) -> OperatorResult<()> {
        conditional_update(self.client.as_ref(), resource.key(), |_| {
            Some(
                ResourceUpdate::default()
                    .with_metadata(meta::DEPLOYMENT_NAME, name)
                    .with_metadata(meta::NETWORK_INDEX, index.to_string()),
            )
        })
        .await?;
        Ok(())
    }
}
