//! StateStore — redb-backed resource persistence for Fabrik.
//!
//! Provides versioned CRUD over resources plus label-filtered listing and
//! watches. All values are JSON-serialized into redb's `&[u8]` value
//! columns. The store supports both on-disk and in-memory backends (the
//! latter for testing).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::selector::LabelSelector;
use crate::tables::*;
use crate::types::*;
use crate::watch::{
    DEFAULT_HISTORY_CAPACITY, EventKind, Watch, WatchEvent, WatchHub, WatchOptions,
};

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Outcome of a write closure run inside [`StateStore::mutate`].
enum Mutation {
    Put(EventKind, Resource),
    Remove(Resource),
}

/// Thread-safe resource store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    hub: Arc<WatchHub>,
}

impl StateStore {
    /// Open (or create) a persistent resource store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory resource store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_database(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_database(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            hub: Arc::new(WatchHub::new(DEFAULT_HISTORY_CAPACITY)),
        }
    }

    /// Replace the watch history with one retaining `capacity` events.
    /// Only meaningful before any watch or write.
    pub fn with_history_capacity(mut self, capacity: usize) -> Self {
        self.hub = Arc::new(WatchHub::new(capacity));
        self
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(RESOURCES).map_err(map_err!(Table))?;
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Revision of the last committed write.
    pub fn revision(&self) -> StateResult<u64> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let meta = txn.open_table(META).map_err(map_err!(Table))?;
        let revision = meta
            .get(REVISION_KEY)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(0);
        Ok(revision)
    }

    // ── Write path ─────────────────────────────────────────────────

    /// Run one write transaction against `key` and publish the change.
    ///
    /// The hub lock is held from before the transaction until after the
    /// event is published, which keeps event order equal to commit order.
    fn mutate<F>(&self, key: &ResourceKey, op: F) -> StateResult<Resource>
    where
        F: FnOnce(Option<Resource>, u64) -> StateResult<Mutation>,
    {
        let table_key = key.table_key();
        self.hub.locked(|hub| {
            let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
            let (revision, kind, resource) = {
                let mut table = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
                let mut meta = txn.open_table(META).map_err(map_err!(Table))?;

                let current: Option<Resource> =
                    match table.get(table_key.as_str()).map_err(map_err!(Read))? {
                        Some(guard) => Some(
                            serde_json::from_slice(guard.value())
                                .map_err(map_err!(Deserialize))?,
                        ),
                        None => None,
                    };
                let last = meta
                    .get(REVISION_KEY)
                    .map_err(map_err!(Read))?
                    .map(|guard| guard.value())
                    .unwrap_or(0);
                let revision = last + 1;

                let (kind, resource) = match op(current, revision)? {
                    Mutation::Put(kind, resource) => {
                        let value = serde_json::to_vec(&resource).map_err(map_err!(Serialize))?;
                        table
                            .insert(table_key.as_str(), value.as_slice())
                            .map_err(map_err!(Write))?;
                        (kind, resource)
                    }
                    Mutation::Remove(resource) => {
                        table.remove(table_key.as_str()).map_err(map_err!(Write))?;
                        (EventKind::Deleted, resource)
                    }
                };
                meta.insert(REVISION_KEY, revision)
                    .map_err(map_err!(Write))?;
                (revision, kind, resource)
            };
            txn.commit().map_err(map_err!(Transaction))?;

            hub.publish(WatchEvent {
                kind,
                revision,
                resource: resource.clone(),
            });
            debug!(key = %table_key, revision, ?kind, "resource written");
            Ok(resource)
        })
    }

    // ── Resources ──────────────────────────────────────────────────

    /// Create a resource. Fails with `AlreadyExists` if the id is taken.
    pub fn create_resource(&self, new: NewResource) -> StateResult<Resource> {
        let key = new.key.clone();
        self.mutate(&key, move |current, revision| {
            if current.is_some() {
                return Err(StateError::AlreadyExists(new.key.to_string()));
            }
            let now = epoch_secs();
            let mut status = new.status;
            status.state_changed_at_ms = epoch_millis();
            Ok(Mutation::Put(
                EventKind::Added,
                Resource {
                    key: new.key,
                    labels: new.labels,
                    options: new.options,
                    status,
                    operator_metadata: BTreeMap::new(),
                    resource_version: revision,
                    created_at: now,
                    updated_at: now,
                },
            ))
        })
    }

    /// Get a resource by key.
    pub fn get_resource(&self, key: &ResourceKey) -> StateResult<Resource> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
        match table.get(key.table_key().as_str()).map_err(map_err!(Read))? {
            Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize)),
            None => Err(StateError::NotFound(key.to_string())),
        }
    }

    /// Apply a conditional status and/or metadata update.
    ///
    /// Rejects stale `expected_version`s with `Conflict` and status writes
    /// that are not valid lifecycle transitions with `InvalidTransition`.
    pub fn update_resource(
        &self,
        key: &ResourceKey,
        update: ResourceUpdate,
    ) -> StateResult<Resource> {
        self.mutate(key, move |current, revision| {
            let mut resource = current.ok_or_else(|| StateError::NotFound(key.to_string()))?;
            if let Some(expected) = update.expected_version {
                if expected != resource.resource_version {
                    return Err(StateError::Conflict {
                        key: key.to_string(),
                        expected,
                        actual: resource.resource_version,
                    });
                }
            }
            if let Some(mut status) = update.status {
                let from = resource.status.state;
                if !from.can_transition_to(status.state) {
                    return Err(StateError::InvalidTransition {
                        key: key.to_string(),
                        from,
                        to: status.state,
                    });
                }
                status.state_changed_at_ms = if from == status.state {
                    resource.status.state_changed_at_ms
                } else {
                    epoch_millis()
                };
                resource.status = status;
            }
            for (name, value) in update.operator_metadata {
                match value {
                    Some(v) => resource.operator_metadata.insert(name, v),
                    None => resource.operator_metadata.remove(&name),
                };
            }
            resource.resource_version = revision;
            resource.updated_at = epoch_secs();
            Ok(Mutation::Put(EventKind::Modified, resource))
        })
    }

    /// Delete a resource, optionally only if it is still at `expected_version`.
    pub fn delete_resource(
        &self,
        key: &ResourceKey,
        expected_version: Option<u64>,
    ) -> StateResult<Resource> {
        self.mutate(key, move |current, _| {
            let resource = current.ok_or_else(|| StateError::NotFound(key.to_string()))?;
            if let Some(expected) = expected_version {
                if expected != resource.resource_version {
                    return Err(StateError::Conflict {
                        key: key.to_string(),
                        expected,
                        actual: resource.resource_version,
                    });
                }
            }
            Ok(Mutation::Remove(resource))
        })
    }

    /// List resources of one `(group, kind)` matching `selector`, ordered by id.
    pub fn list_resources(
        &self,
        group: &str,
        kind: &str,
        selector: &LabelSelector,
    ) -> StateResult<Vec<Resource>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
        self.scan(&table, group, kind, selector)
    }

    fn scan(
        &self,
        table: &impl ReadableTable<&'static str, &'static [u8]>,
        group: &str,
        kind: &str,
        selector: &LabelSelector,
    ) -> StateResult<Vec<Resource>> {
        let prefix = ResourceKey::kind_prefix(group, kind);
        let mut results = Vec::new();
        for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            let resource: Resource =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if selector.matches(&resource) {
                results.push(resource);
            }
        }
        Ok(results)
    }

    // ── Watches ────────────────────────────────────────────────────

    /// Establish a watch on one `(group, kind)`.
    ///
    /// Without a bookmark the watch first yields every current match as an
    /// `Added` event, then live changes. With a bookmark it replays retained
    /// history after that revision, or fails with `Expired`.
    pub fn watch(
        &self,
        group: &str,
        kind: &str,
        selector: LabelSelector,
        options: WatchOptions,
    ) -> StateResult<Watch> {
        self.hub.locked(|hub| {
            let (backlog, bookmark) = match options.since {
                Some(since) => (hub.replay_after(since)?, since),
                None => {
                    let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
                    let table = txn.open_table(RESOURCES).map_err(map_err!(Table))?;
                    let meta = txn.open_table(META).map_err(map_err!(Table))?;
                    let revision = meta
                        .get(REVISION_KEY)
                        .map_err(map_err!(Read))?
                        .map(|guard| guard.value())
                        .unwrap_or(0);
                    let listed = self
                        .scan(&table, group, kind, &selector)?
                        .into_iter()
                        .map(|resource| WatchEvent {
                            kind: EventKind::Added,
                            revision: resource.resource_version,
                            resource,
                        })
                        .collect();
                    (listed, revision)
                }
            };
            debug!(%group, %kind, %selector, bookmark, "watch established");
            Ok(Watch::new(
                group,
                kind,
                selector,
                backlog,
                hub.subscribe(),
                options.timeout,
                bookmark,
            ))
        })
    }
}
