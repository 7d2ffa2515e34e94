//! Claim discipline.
//!
//! A worker owns a resource once it has moved it `in_queue → in_progress`
//! in a single conditional write against the version it observed. Losing
//! that race (version conflict, or the resource is no longer queued) is not
//! an error: the outcome is [`ClaimOutcome::Skipped`].
//!
//! Pollers use a softer lease in `operator_metadata` so that two replicas
//! do not query the backend for the same resource on the same tick.

use std::time::Duration;

use fabrik_state::{
    Resource, ResourceClient, ResourceKey, ResourceState, ResourceUpdate, StateError,
    epoch_millis, epoch_secs,
};
use tracing::debug;

use crate::error::OperatorResult;
use crate::meta;
use crate::status::conditional_update;

#[derive(Debug)]
pub enum ClaimOutcome {
    Claimed(Resource),
    Skipped(String),
}

/// Try to take ownership of a queued resource.
pub async fn claim(
    client: &dyn ResourceClient,
    resource: &Resource,
    identity: &str,
    description: &str,
) -> OperatorResult<ClaimOutcome> {
    let key = resource.key();
    if resource.state() != ResourceState::InQueue {
        return Ok(ClaimOutcome::Skipped(format!(
            "resource is {}",
            resource.state()
        )));
    }

    let status = resource
        .status
        .transitioned(ResourceState::InProgress)
        .with_description(description);
    let update = ResourceUpdate::status(status)
        .with_metadata(meta::LOCKED_BY, identity)
        .with_metadata(meta::PROCESSING_STARTED_AT, epoch_secs().to_string())
        .expect_version(resource.resource_version);

    match client.update_resource(key, update).await {
        Ok(claimed) => {
            debug!(%key, %identity, "claimed");
            Ok(ClaimOutcome::Claimed(claimed))
        }
        Err(e) if lost_race(&e) => {
            debug!(%key, %identity, reason = %e, "claim lost");
            Ok(ClaimOutcome::Skipped(e.to_string()))
        }
        Err(e) => Err(e.into()),
    }
}

fn lost_race(e: &StateError) -> bool {
    matches!(
        e,
        StateError::Conflict { .. } | StateError::InvalidTransition { .. } | StateError::NotFound(_)
    )
}

/// Drop the processing stamps if `identity` still holds them.
pub async fn release(
    client: &dyn ResourceClient,
    key: &ResourceKey,
    identity: &str,
) -> OperatorResult<()> {
    let result = conditional_update(client, key, |current| {
        (current.metadata(meta::LOCKED_BY) == Some(identity)).then(|| {
            ResourceUpdate::default()
                .without_metadata(meta::LOCKED_BY)
                .without_metadata(meta::PROCESSING_STARTED_AT)
        })
    })
    .await;
    match result {
        Ok(_) => Ok(()),
        Err(crate::OperatorError::State(e)) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Take or renew the poller lease on `resource`.
///
/// Returns the resource as written, or `None` when another identity holds a
/// lease younger than `stale_after` or a concurrent write got there first.
pub async fn acquire_poller_lock(
    client: &dyn ResourceClient,
    resource: &Resource,
    identity: &str,
    stale_after: Duration,
) -> OperatorResult<Option<Resource>> {
    let now = epoch_millis();
    if let Some(holder) = resource.metadata(meta::POLLER_LOCKED_BY) {
        let locked_at = resource
            .metadata(meta::POLLER_LOCKED_AT)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let fresh = now.saturating_sub(locked_at) < stale_after.as_millis() as u64;
        if holder != identity && fresh {
            debug!(key = %resource.key, %holder, "poller lease held elsewhere");
            return Ok(None);
        }
    }

    let update = ResourceUpdate::default()
        .with_metadata(meta::POLLER_LOCKED_BY, identity)
        .with_metadata(meta::POLLER_LOCKED_AT, now.to_string())
        .expect_version(resource.resource_version);
    match client.update_resource(resource.key(), update).await {
        Ok(updated) => Ok(Some(updated)),
        Err(e) if e.is_conflict() || e.is_not_found() => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use fabrik_state::{NewResource, StateStore, groups, kinds};

    fn queued(store: &StateStore) -> Resource {
        store
            .create_resource(NewResource::new(ResourceKey::new(
                groups::BACKUP,
                kinds::DEFAULT_BACKUP,
                "b-1",
            )))
            .unwrap()
    }

    #[tokio::test]
    async fn claim_stamps_owner() {
        let store = StateStore::open_in_memory().unwrap();
        let resource = queued(&store);
        let ClaimOutcome::Claimed(claimed) = claim(&store, &resource, "op-a", "working")
            .await
            .unwrap()
        else {
            panic!("expected claim");
        };
        assert_eq!(claimed.state(), ResourceState::InProgress);
        assert_eq!(claimed.metadata(meta::LOCKED_BY), Some("op-a"));
        assert!(claimed.metadata(meta::PROCESSING_STARTED_AT).is_some());

        release(&store, resource.key(), "op-b").await.unwrap();
        let still = store.get_resource(resource.key()).unwrap();
        assert_eq!(still.metadata(meta::LOCKED_BY), Some("op-a"));

        release(&store, resource.key(), "op-a").await.unwrap();
        let released = store.get_resource(resource.key()).unwrap();
        assert_eq!(released.metadata(meta::LOCKED_BY), None);
        assert_eq!(released.state(), ResourceState::InProgress);
    }

    #[tokio::test]
    async fn exactly_one_concurrent_claim_wins() {
        let store = StateStore::open_in_memory().unwrap();
        let resource = queued(&store);
        let client: Arc<dyn ResourceClient> = Arc::new(store.clone());

        let mut handles = Vec::new();
        for i in 0..8 {
            let client = client.clone();
            let resource = resource.clone();
            handles.push(tokio::spawn(async move {
                claim(client.as_ref(), &resource, &format!("worker-{i}"), "go")
                    .await
                    .unwrap()
            }));
        }
        let mut claimed = 0;
        for handle in handles {
            if matches!(handle.await.unwrap(), ClaimOutcome::Claimed(_)) {
                claimed += 1;
            }
        }
        assert_eq!(claimed, 1);
    }

    #[tokio::test]
    async fn non_queued_is_skipped() {
        let store = StateStore::open_in_memory().unwrap();
        let resource = queued(&store);
        let first = claim(&store, &resource, "a", "x").await.unwrap();
        let ClaimOutcome::Claimed(current) = first else {
            panic!("expected claim");
        };
        assert!(matches!(
            claim(&store, &current, "b", "x").await.unwrap(),
            ClaimOutcome::Skipped(_)
        ));
    }

    #[tokio::test]
    async fn poller_lease_excludes_other_replicas() {
        let store = StateStore::open_in_memory().unwrap();
        let resource = queued(&store);
        let window = Duration::from_secs(60);

        let held = acquire_poller_lock(&store, &resource, "p1", window)
            .await
            .unwrap()
            .unwrap();
        assert!(
            acquire_poller_lock(&store, &held, "p2", window)
                .await
                .unwrap()
                .is_none()
        );
        let renewed = acquire_poller_lock(&store, &held, "p1", window)
            .await
            .unwrap()
            .unwrap();
        // A stale lease can be taken over.
        let taken = acquire_poller_lock(&store, &renewed, "p2", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(taken.metadata(meta::POLLER_LOCKED_BY), Some("p2"));
    }
}
