//! Test doubles shared by unit tests.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;

use fabrik_state::{
    LabelSelector, NewResource, Resource, ResourceClient, ResourceKey, ResourceUpdate, StateError,
    StateResult, StateStore, Watch, WatchOptions,
};

/// Store whose next `failures` deletes fail with a write error.
pub struct FlakyDeletes {
    store: StateStore,
    failures: AtomicU32,
}

impl FlakyDeletes {
    pub fn new(store: StateStore, failures: u32) -> Self {
        Self {
            store,
            failures: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl ResourceClient for FlakyDeletes {
    async fn create_resource(&self, new: NewResource) -> StateResult<Resource> {
        self.store.create_resource(new)
    }

    async fn get_resource(&self, key: &ResourceKey) -> StateResult<Resource> {
        self.store.get_resource(key)
    }

    async fn update_resource(
        &self,
        key: &ResourceKey,
        update: ResourceUpdate,
    ) -> StateResult<Resource> {
        self.store.update_resource(key, update)
    }

    async fn list_resources(
        &self,
        group: &str,
        kind: &str,
        selector: &LabelSelector,
    ) -> StateResult<Vec<Resource>> {
        self.store.list_resources(group, kind, selector)
    }

    async fn delete_resource(
        &self,
        key: &ResourceKey,
        expected_version: Option<u64>,
    ) -> StateResult<Resource> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(StateError::Write("disk unavailable".into()));
        }
        self.store.delete_resource(key, expected_version)
    }

    async fn watch(
        &self,
        group: &str,
        kind: &str,
        selector: LabelSelector,
        options: WatchOptions,
    ) -> StateResult<Watch> {
        self.store.watch(group, kind, selector, options)
    }
}
