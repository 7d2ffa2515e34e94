//! Conflict-retrying conditional writes.

use fabrik_state::{Resource, ResourceClient, ResourceKey, ResourceUpdate};
use tracing::debug;

use crate::error::{OperatorError, OperatorResult};

/// Attempts made before a persistent conflict is surfaced.
pub const CONFLICT_RETRIES: usize = 3;

/// Re-read `key`, let `f` decide on an update, and write it against the
/// version just read. On a version conflict the resource is re-read and `f`
/// asked again, up to [`CONFLICT_RETRIES`] times.
///
/// `f` returning `None` means no write is needed; the current resource is
/// returned unchanged.
pub async fn conditional_update<F>(
    client: &dyn ResourceClient,
    key: &ResourceKey,
    mut f: F,
) -> OperatorResult<Resource>
where
    F: FnMut(&Resource) -> Option<ResourceUpdate> + Send,
{
    for attempt in 1..=CONFLICT_RETRIES {
        let current = client.get_resource(key).await?;
        let Some(update) = f(&current) else {
            return Ok(current);
        };
        match client
            .update_resource(key, update.expect_version(current.resource_version))
            .await
        {
            Ok(updated) => return Ok(updated),
            Err(e) if e.is_conflict() => {
                debug!(%key, attempt, "conflicting write, re-reading");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(OperatorError::Conflict(key.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use fabrik_state::{
        NewResource, ResourceState, ResourceStatus, StateStore, groups, kinds,
    };

    fn store() -> (StateStore, ResourceKey) {
        let store = StateStore::open_in_memory().unwrap();
        let key = ResourceKey::new(groups::BACKUP, kinds::DEFAULT_BACKUP, "b");
        store.create_resource(NewResource::new(key.clone())).unwrap();
        (store, key)
    }

    #[tokio::test]
    async fn retries_after_concurrent_write() {
        let (store, key) = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let store2 = store.clone();
        let key2 = key.clone();
        let counter = calls.clone();

        let updated = conditional_update(&store, &key, move |_| {
            // Sneak in a competing write before the first attempt lands.
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                store2
                    .update_resource(&key2, ResourceUpdate::default().with_metadata("x", "1"))
                    .unwrap();
            }
            Some(ResourceUpdate::status(
                ResourceStatus::new(ResourceState::InProgress).with_description("mine"),
            ))
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(updated.status.description, "mine");
        assert_eq!(updated.metadata("x"), Some("1"));
    }

    #[tokio::test]
    async fn none_skips_the_write() {
        let (store, key) = store();
        let before = store.get_resource(&key).unwrap();
        let after = conditional_update(&store, &key, |_| None).await.unwrap();
        assert_eq!(before.resource_version, after.resource_version);
    }

    #[tokio::test]
    async fn invalid_transition_is_not_retried() {
        let (store, key) = store();
        store
            .update_resource(
                &key,
                ResourceUpdate::status(ResourceStatus::new(ResourceState::Aborted)),
            )
            .unwrap();
        let err = conditional_update(&store, &key, |_| {
            Some(ResourceUpdate::status(ResourceStatus::new(
                ResourceState::Succeeded,
            )))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, OperatorError::State(_)));
    }
}
