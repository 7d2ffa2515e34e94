//! Resumable watches over resource changes.
//!
//! Every committed write becomes a [`WatchEvent`] stamped with the store
//! revision. The [`WatchHub`] keeps a bounded history of recent events so a
//! watcher can resume from its bookmark after the stream ends; a bookmark
//! older than the retained history yields [`StateError::Expired`] and the
//! caller must relist.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{StateError, StateResult};
use crate::selector::LabelSelector;
use crate::types::Resource;

/// Default number of events retained for bookmark resumption.
pub const DEFAULT_HISTORY_CAPACITY: usize = 4096;

const BROADCAST_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
}

/// A single change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub revision: u64,
    /// The resource after the change (before it, for deletions).
    pub resource: Resource,
}

/// Options for establishing a watch.
#[derive(Debug, Clone, Default)]
pub struct WatchOptions {
    /// Resume after this revision. `None` lists current matches first.
    pub since: Option<u64>,
    /// The stream ends once this elapses.
    pub timeout: Option<Duration>,
}

impl WatchOptions {
    pub fn since(mut self, revision: u64) -> Self {
        self.since = Some(revision);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

struct HubInner {
    history: VecDeque<WatchEvent>,
    capacity: usize,
    /// Highest revision that has been evicted from `history`.
    compacted: u64,
}

/// Fan-out point between the store's write path and its watchers.
///
/// The store holds the hub lock across commit and publish, so history order
/// equals commit order and a new watcher never misses an event between its
/// initial listing and its subscription.
pub struct WatchHub {
    inner: Mutex<HubInner>,
    tx: broadcast::Sender<WatchEvent>,
}

impl WatchHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            inner: Mutex::new(HubInner {
                history: VecDeque::with_capacity(capacity.min(1024)),
                capacity: capacity.max(1),
                compacted: 0,
            }),
            tx,
        }
    }

    /// Run `f` while holding the hub lock. Writes and watch setup go through here.
    pub(crate) fn locked<T>(&self, f: impl FnOnce(&mut HubGuard<'_>) -> T) -> T {
        let mut inner = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let mut guard = HubGuard {
            inner: &mut *inner,
            tx: &self.tx,
        };
        f(&mut guard)
    }
}

pub(crate) struct HubGuard<'a> {
    inner: &'a mut HubInner,
    tx: &'a broadcast::Sender<WatchEvent>,
}

impl HubGuard<'_> {
    pub(crate) fn publish(&mut self, event: WatchEvent) {
        if self.inner.history.len() >= self.inner.capacity {
            if let Some(evicted) = self.inner.history.pop_front() {
                self.inner.compacted = evicted.revision;
            }
        }
        self.inner.history.push_back(event.clone());
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.tx.subscribe()
    }

    /// Events after `since`, or `Expired` if some of them were evicted.
    pub(crate) fn replay_after(&self, since: u64) -> StateResult<Vec<WatchEvent>> {
        if since < self.inner.compacted {
            return Err(StateError::Expired {
                since,
                oldest: self.inner.compacted + 1,
            });
        }
        Ok(self
            .inner
            .history
            .iter()
            .filter(|e| e.revision > since)
            .cloned()
            .collect())
    }
}

/// A stream of change events for one `(group, kind)` and selector.
pub struct Watch {
    group: String,
    kind: String,
    selector: LabelSelector,
    backlog: VecDeque<WatchEvent>,
    rx: broadcast::Receiver<WatchEvent>,
    deadline: Option<Instant>,
    bookmark: u64,
}

impl Watch {
    pub(crate) fn new(
        group: &str,
        kind: &str,
        selector: LabelSelector,
        backlog: Vec<WatchEvent>,
        rx: broadcast::Receiver<WatchEvent>,
        timeout: Option<Duration>,
        bookmark: u64,
    ) -> Self {
        let mut watch = Self {
            group: group.to_string(),
            kind: kind.to_string(),
            selector,
            backlog: VecDeque::new(),
            rx,
            deadline: timeout.map(|t| Instant::now() + t),
            bookmark,
        };
        watch.backlog = backlog.into_iter().filter(|e| watch.wants(e)).collect();
        watch
    }

    /// Revision of the last event this watch has seen, matching or not.
    /// Pass it as [`WatchOptions::since`] to resume.
    pub fn bookmark(&self) -> u64 {
        self.bookmark
    }

    /// Next matching event, or `None` when the stream has ended (timeout,
    /// lag, or store shutdown). An ended stream should be re-established
    /// from [`Watch::bookmark`].
    pub async fn next(&mut self) -> Option<WatchEvent> {
        if let Some(event) = self.backlog.pop_front() {
            self.bookmark = self.bookmark.max(event.revision);
            return Some(event);
        }
        loop {
            let received = match self.deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, self.rx.recv()).await {
                    Ok(r) => r,
                    Err(_) => {
                        debug!(group = %self.group, kind = %self.kind, bookmark = self.bookmark, "watch timed out");
                        return None;
                    }
                },
                None => self.rx.recv().await,
            };
            match received {
                Ok(event) => {
                    if event.revision <= self.bookmark {
                        continue;
                    }
                    self.bookmark = event.revision;
                    if self.wants(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(group = %self.group, kind = %self.kind, skipped, "watch lagged, closing stream");
                    return None;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    fn wants(&self, event: &WatchEvent) -> bool {
        let key = &event.resource.key;
        key.group == self.group && key.kind == self.kind && self.selector.matches(&event.resource)
    }
}
