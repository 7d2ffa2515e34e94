//! Deployment locks.
//!
//! A lock is a resource `lock/deploymentlock/<target>` whose options record
//! which operation holds it, on behalf of which resource, and until when.
//! Creation is the acquire step, so the store's `AlreadyExists` check
//! serializes competing replicas. Expired locks may be taken over.
//! Release retries store errors a bounded number of times; holders release
//! after going terminal and are not revisited.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fabrik_state::{
    NewResource, ResourceClient, ResourceKey, ResourceState, ResourceStatus, epoch_secs, groups,
    kinds, labels,
};

use crate::error::{OperatorError, OperatorResult};
use crate::status::CONFLICT_RETRIES;

/// Lock target serializing network segment allocation across replicas.
pub const ALLOCATION_LOCK: &str = "network-segment-allocation";

const UNLOCK_ATTEMPTS: u32 = 5;
const UNLOCK_RETRY_DELAY: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockDetails {
    pub operation: String,
    /// Resource on whose behalf the lock is held.
    pub holder: String,
    /// Engine identity that took the lock.
    pub owner: String,
    pub lock_time: u64,
    pub lock_ttl_secs: u64,
}

impl LockDetails {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.lock_time.saturating_add(self.lock_ttl_secs)
    }
}

#[derive(Clone)]
pub struct LockManager {
    client: Arc<dyn ResourceClient>,
    owner: String,
    ttl: Duration,
}

impl LockManager {
    pub fn new(client: Arc<dyn ResourceClient>, owner: impl Into<String>, ttl: Duration) -> Self {
        Self {
            client,
            owner: owner.into(),
            ttl,
        }
    }

    /// Same owner and store, different TTL for locks taken through it.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn lock_key(target: &str) -> ResourceKey {
        ResourceKey::new(groups::LOCK, kinds::DEPLOYMENT_LOCKS, target)
    }

    /// Acquire the lock on `target` for `holder`. Re-entrant for the same
    /// holder; fails with `DeploymentLocked` while another holder's lock is
    /// live.
    pub async fn lock(
        &self,
        target: &str,
        operation: &str,
        holder: &ResourceKey,
    ) -> OperatorResult<LockDetails> {
        let key = Self::lock_key(target);
        let holder = holder.to_string();
        for _ in 0..CONFLICT_RETRIES {
            let details = LockDetails {
                operation: operation.to_string(),
                holder: holder.clone(),
                owner: self.owner.clone(),
                lock_time: epoch_secs(),
                lock_ttl_secs: self.ttl.as_secs(),
            };
            let new = NewResource::new(key.clone())
                .with_label(labels::INSTANCE_GUID, target)
                .with_options(serde_json::to_value(&details).map_err(|e| {
                    OperatorError::InvalidOptions {
                        key: key.to_string(),
                        message: e.to_string(),
                    }
                })?)
                .with_status(
                    ResourceStatus::new(ResourceState::InProgress)
                        .with_description(format!("locked for {operation}")),
                );

            match self.client.create_resource(new).await {
                Ok(_) => {
                    info!(%target, %operation, %holder, "deployment lock acquired");
                    return Ok(details);
                }
                Err(e) if e.is_already_exists() => {}
                Err(e) => return Err(e.into()),
            }

            let existing = match self.client.get_resource(&key).await {
                Ok(r) => r,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e.into()),
            };
            let current: LockDetails = existing.options_as()?;
            if current.holder == holder {
                return Ok(current);
            }
            if !current.is_expired(epoch_secs()) {
                return Err(OperatorError::DeploymentLocked {
                    instance_id: target.to_string(),
                    operation: current.operation,
                    holder: current.holder,
                });
            }

            warn!(%target, stale_holder = %current.holder, "taking over expired deployment lock");
            match self
                .client
                .delete_resource(&key, Some(existing.resource_version))
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_conflict() || e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Err(OperatorError::Conflict(key.to_string()))
    }

    /// Release the lock on `target` if `holder` holds it.
    pub async fn unlock(&self, target: &str, holder: &ResourceKey) -> OperatorResult<bool> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_unlock(target, holder).await {
                Ok(released) => return Ok(released),
                Err(e) if attempt < UNLOCK_ATTEMPTS => {
                    warn!(%target, %holder, attempt, error = %e, "deployment lock release failed, retrying");
                    tokio::time::sleep(UNLOCK_RETRY_DELAY * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_unlock(&self, target: &str, holder: &ResourceKey) -> OperatorResult<bool> {
        let key = Self::lock_key(target);
        let existing = match self.client.get_resource(&key).await {
            Ok(r) => r,
            Err(e) if e.is_not_found() => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let current: LockDetails = existing.options_as()?;
        if current.holder != holder.to_string() {
            debug!(%target, %holder, lock_holder = %current.holder, "not our lock, leaving it");
            return Ok(false);
        }
        match self
            .client
            .delete_resource(&key, Some(existing.resource_version))
            .await
        {
            Ok(_) => {
                info!(%target, %holder, "deployment lock released");
                Ok(true)
            }
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// The live lock on `target`, if any.
    pub async fn check(&self, target: &str) -> OperatorResult<Option<LockDetails>> {
        match self.client.get_resource(&Self::lock_key(target)).await {
            Ok(r) => {
                let details: LockDetails = r.options_as()?;
                Ok((!details.is_expired(epoch_secs())).then_some(details))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fabrik_state::{StateError, StateStore};

    use crate::testing::FlakyDeletes;

    fn flaky(failures: u32) -> (StateStore, LockManager) {
        let store = StateStore::open_in_memory().unwrap();
        let client = Arc::new(FlakyDeletes::new(store.clone(), failures));
        let locks = LockManager::new(client, "fabrik-0", Duration::from_secs(3600));
        (store, locks)
    }

    fn manager(ttl: Duration) -> LockManager {
        let store = StateStore::open_in_memory().unwrap();
        LockManager::new(Arc::new(store), "fabrik-0", ttl)
    }

    fn holder(id: &str) -> ResourceKey {
        ResourceKey::new(groups::BACKUP, kinds::DEFAULT_BACKUP, id)
    }

    #[tokio::test]
    async fn second_holder_is_refused() {
        let locks = manager(Duration::from_secs(3600));
        locks.lock("X", "backup", &holder("b1")).await.unwrap();
        // Re-entrant.
        locks.lock("X", "backup", &holder("b1")).await.unwrap();

        let err = locks.lock("X", "restore", &holder("r1")).await.unwrap_err();
        match err {
            OperatorError::DeploymentLocked {
                operation, holder, ..
            } => {
                assert_eq!(operation, "backup");
                assert!(holder.ends_with("/b1"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(locks.check("X").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unlock_only_by_holder() {
        let locks = manager(Duration::from_secs(3600));
        locks.lock("X", "backup", &holder("b1")).await.unwrap();
        assert!(!locks.unlock("X", &holder("b2")).await.unwrap());
        assert!(locks.unlock("X", &holder("b1")).await.unwrap());
        assert!(locks.check("X").await.unwrap().is_none());
        locks.lock("X", "restore", &holder("r1")).await.unwrap();
    }

    #[tokio::test]
    async fn expired_lock_is_taken_over() {
        let locks = manager(Duration::ZERO);
        locks.lock("X", "backup", &holder("b1")).await.unwrap();
        let details = locks.lock("X", "restore", &holder("r1")).await.unwrap();
        assert_eq!(details.operation, "restore");
    }

    #[tokio::test]
    async fn unlock_retries_transient_store_errors() {
        let (store, locks) = flaky(2);
        locks.lock("X", "backup", &holder("b1")).await.unwrap();
        assert!(locks.unlock("X", &holder("b1")).await.unwrap());
        assert!(store.get_resource(&LockManager::lock_key("X")).is_err());
        locks.lock("X", "restore", &holder("r1")).await.unwrap();
    }

    #[tokio::test]
    async fn unlock_gives_up_after_bounded_attempts() {
        let (store, locks) = flaky(UNLOCK_ATTEMPTS);
        locks.lock("X", "backup", &holder("b1")).await.unwrap();
        let err = locks.unlock("X", &holder("b1")).await.unwrap_err();
        assert!(matches!(err, OperatorError::State(StateError::Write(_))));
        assert!(store.get_resource(&LockManager::lock_key("X")).is_ok());
        // The store has recovered; a later release goes through.
        assert!(locks.unlock("X", &holder("b1")).await.unwrap());
    }

    #[tokio::test]
    async fn with_ttl_overrides_lock_lifetime() {
        let locks = manager(Duration::from_secs(3600));
        let short = locks.clone().with_ttl(Duration::from_secs(5));
        let details = short.lock("X", "allocate", &holder("b1")).await.unwrap();
        assert_eq!(details.lock_ttl_secs, 5);
        assert_eq!(details.owner, "fabrik-0");
        assert_eq!(locks.ttl(), Duration::from_secs(3600));
    }
}
