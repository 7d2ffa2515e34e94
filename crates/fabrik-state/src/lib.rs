//! fabrik-state — the resource store consumed by the Fabrik control plane.
//!
//! Every request handled by the broker is recorded as a typed, labeled
//! [`Resource`] identified by `(group, kind, id)`. Operators watch resources
//! of one kind, claim them with optimistic writes, and drive their
//! [`ResourceStatus`] to a terminal state.
//!
//! # Architecture
//!
//! ```text
//!   create / update / patch / delete
//!              │
//!              ▼
//!   ┌─────────────────────┐  commit   ┌──────────────────┐
//!   │ StateStore (redb)   │──────────▶│ WatchHub         │
//!   │ resources + revision│           │ history + bcast  │
//!   └─────────────────────┘           └────────┬─────────┘
//!                                              │ WatchEvent{rev}
//!                                              ▼
//!                                     Watch (selector, bookmark)
//! ```
//!
//! Resources are JSON-serialized into redb's `&[u8]` value columns under the
//! composite key `{group}/{kind}/{id}`. A single store-wide revision counter
//! doubles as every resource's `resource_version`, which makes optimistic
//! concurrency checks and watch bookmarks the same number.
//!
//! The [`ResourceClient`] trait is the seam the engine depends on; the
//! embedded [`StateStore`] is one implementation of it.

pub mod client;
pub mod error;
pub mod selector;
pub mod store;
pub mod tables;
pub mod types;
pub mod watch;

pub use client::{ResourceClient, request_cancellation};
pub use error::{StateError, StateResult};
pub use selector::LabelSelector;
pub use store::StateStore;
pub use types::*;
pub use watch::{EventKind, Watch, WatchEvent, WatchOptions};
