//! Read-through `instance_id → deployment name` cache.
//!
//! The store is the source of truth: director resources carry the name in
//! `operator_metadata.deployment_name` and are labelled with the instance
//! guid. A miss falls through to a labelled list and populates the entry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use fabrik_state::{LabelSelector, ResourceClient, groups, kinds, labels};

use crate::error::OperatorResult;
use crate::meta;

pub struct DeploymentNameCache {
    client: Arc<dyn ResourceClient>,
    names: RwLock<HashMap<String, String>>,
}

impl DeploymentNameCache {
    pub fn new(client: Arc<dyn ResourceClient>) -> Self {
        Self {
            client,
            names: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, instance_id: &str) -> OperatorResult<Option<String>> {
        if let Some(name) = self.names.read().await.get(instance_id) {
            return Ok(Some(name.clone()));
        }

        let selector = LabelSelector::everything().eq(labels::INSTANCE_GUID, instance_id);
        let resources = self
            .client
            .list_resources(groups::DEPLOYMENT, kinds::DIRECTOR, &selector)
            .await?;
        let found = resources
            .iter()
            .find_map(|r| r.metadata(meta::DEPLOYMENT_NAME))
            .map(str::to_string);

        if let Some(ref name) = found {
            debug!(%instance_id, deployment = %name, "deployment name cache populated");
            self.names
                .write()
                .await
                .insert(instance_id.to_string(), name.clone());
        }
        Ok(found)
    }

    pub async fn insert(&self, instance_id: &str, name: &str) {
        self.names
            .write()
            .await
            .insert(instance_id.to_string(), name.to_string());
    }

    pub async fn evict(&self, instance_id: &str) -> Option<String> {
        self.names.write().await.remove(instance_id)
    }

    pub async fn len(&self) -> usize {
        self.names.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabrik_state::{NewResource, ResourceKey, ResourceUpdate, StateStore};

    #[tokio::test]
    async fn miss_falls_through_to_store() {
        let store = StateStore::open_in_memory().unwrap();
        let key = ResourceKey::new(groups::DEPLOYMENT, kinds::DIRECTOR, "d1");
        store
            .create_resource(NewResource::new(key.clone()).with_label(labels::INSTANCE_GUID, "X"))
            .unwrap();
        let cache = DeploymentNameCache::new(Arc::new(store.clone()));

        assert_eq!(cache.get("X").await.unwrap(), None);
        assert_eq!(cache.len().await, 0);

        store
            .update_resource(
                &key,
                ResourceUpdate::default()
                    .with_metadata(meta::DEPLOYMENT_NAME, "service-fabrik-0000-X"),
            )
            .unwrap();
        assert_eq!(
            cache.get("X").await.unwrap().as_deref(),
            Some("service-fabrik-0000-X")
        );
        assert_eq!(cache.len().await, 1);

        assert!(cache.evict("X").await.is_some());
        assert_eq!(cache.len().await, 0);
    }

    #[tokio::test]
    async fn inserted_entries_are_served_locally() {
        let store = StateStore::open_in_memory().unwrap();
        let cache = DeploymentNameCache::new(Arc::new(store));
        cache.insert("Y", "sf-0001-Y").await;
        assert_eq!(cache.get("Y").await.unwrap().as_deref(), Some("sf-0001-Y"));
    }
}
