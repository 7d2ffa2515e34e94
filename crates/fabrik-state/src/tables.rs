//! redb table definitions for the Fabrik resource store.

use redb::TableDefinition;

/// Resources keyed by `{group}/{kind}/{id}`, JSON-serialized.
pub const RESOURCES: TableDefinition<&str, &[u8]> = TableDefinition::new("resources");

/// Store-wide counters (currently only the write revision).
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key in [`META`] holding the revision of the last committed write.
pub const REVISION_KEY: &str = "revision";
