//! The resource store contract consumed by the engine.
//!
//! Operators and tasks only ever see `Arc<dyn ResourceClient>`; the embedded
//! [`StateStore`] implements it directly, and a remote store could sit
//! behind the same trait.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::error::StateResult;
use crate::selector::LabelSelector;
use crate::store::StateStore;
use crate::types::*;
use crate::watch::{Watch, WatchOptions};

/// How many times a cancellation request re-reads after a conflict.
const CANCEL_ATTEMPTS: usize = 3;

#[async_trait]
pub trait ResourceClient: Send + Sync {
    async fn create_resource(&self, new: NewResource) -> StateResult<Resource>;

    async fn get_resource(&self, key: &ResourceKey) -> StateResult<Resource>;

    async fn get_resource_status(&self, key: &ResourceKey) -> StateResult<ResourceStatus> {
        Ok(self.get_resource(key).await?.status)
    }

    /// Optimistic write of status and/or operator metadata.
    async fn update_resource(
        &self,
        key: &ResourceKey,
        update: ResourceUpdate,
    ) -> StateResult<Resource>;

    async fn update_resource_status(
        &self,
        key: &ResourceKey,
        status: ResourceStatus,
        expected_version: Option<u64>,
    ) -> StateResult<Resource> {
        let update = ResourceUpdate {
            status: Some(status),
            expected_version,
            ..ResourceUpdate::default()
        };
        self.update_resource(key, update).await
    }

    /// Merge `patch` into the metadata side-channel; `None` removes a key.
    async fn patch_operator_metadata(
        &self,
        key: &ResourceKey,
        patch: BTreeMap<String, Option<String>>,
        expected_version: Option<u64>,
    ) -> StateResult<Resource> {
        let update = ResourceUpdate {
            operator_metadata: patch,
            expected_version,
            ..ResourceUpdate::default()
        };
        self.update_resource(key, update).await
    }

    async fn list_resources(
        &self,
        group: &str,
        kind: &str,
        selector: &LabelSelector,
    ) -> StateResult<Vec<Resource>>;

    async fn delete_resource(
        &self,
        key: &ResourceKey,
        expected_version: Option<u64>,
    ) -> StateResult<Resource>;

    async fn watch(
        &self,
        group: &str,
        kind: &str,
        selector: LabelSelector,
        options: WatchOptions,
    ) -> StateResult<Watch>;
}

#[async_trait]
impl ResourceClient for StateStore {
    async fn create_resource(&self, new: NewResource) -> StateResult<Resource> {
        StateStore::create_resource(self, new)
    }

    async fn get_resource(&self, key: &ResourceKey) -> StateResult<Resource> {
        StateStore::get_resource(self, key)
    }

    async fn update_resource(
        &self,
        key: &ResourceKey,
        update: ResourceUpdate,
    ) -> StateResult<Resource> {
        StateStore::update_resource(self, key, update)
    }

    async fn list_resources(
        &self,
        group: &str,
        kind: &str,
        selector: &LabelSelector,
    ) -> StateResult<Vec<Resource>> {
        StateStore::list_resources(self, group, kind, selector)
    }

    async fn delete_resource(
        &self,
        key: &ResourceKey,
        expected_version: Option<u64>,
    ) -> StateResult<Resource> {
        StateStore::delete_resource(self, key, expected_version)
    }

    async fn watch(
        &self,
        group: &str,
        kind: &str,
        selector: LabelSelector,
        options: WatchOptions,
    ) -> StateResult<Watch> {
        StateStore::watch(self, group, kind, selector, options)
    }
}

/// Ask for a resource to be cancelled.
///
/// `in_queue` resources have nothing running and go straight to `aborted`;
/// `in_progress` ones move to `aborting` and the owning poller finishes the
/// job. Terminal or already-aborting resources are left alone. Returns the
/// resource as it stands afterwards.
pub async fn request_cancellation(
    client: &dyn ResourceClient,
    key: &ResourceKey,
) -> StateResult<Resource> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let resource = client.get_resource(key).await?;
        let next = match resource.state() {
            ResourceState::InQueue => ResourceState::Aborted,
            ResourceState::InProgress => ResourceState::Aborting,
            state => {
                debug!(%key, %state, "cancellation requested on settled resource");
                return Ok(resource);
            }
        };
        let status = resource
            .status
            .transitioned(next)
            .with_description("Cancellation requested");
        match client
            .update_resource_status(key, status, Some(resource.resource_version))
            .await
        {
            Ok(updated) => {
                info!(%key, state = %next, "cancellation recorded");
                return Ok(updated);
            }
            Err(e) if e.is_conflict() && attempt < CANCEL_ATTEMPTS => continue,
            Err(e) => return Err(e),
        }
    }
}
