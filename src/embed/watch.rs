//! Watch hub for the in-process store.
//!
//! Watchers are registered and notified while the store's write lock is held,
//! so each watcher sees committed revisions in order with no gap between the
//! history replayed at registration and live notifications.

use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::debug;

use crate::rpc::{Event, ResponseHeader, RpcError, RpcResult, WatchResponse};

/// A key range `[key, range_end)`.
///
/// An empty `range_end` selects `key` alone; `range_end == [0]` selects every
/// key at or after `key`.
#[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct KeyRange {
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
}

impl KeyRange {
    pub fn new(key: Vec<u8>, range_end: Vec<u8>) -> Self {
        Self { key, range_end }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        if key < &self.key[..] {
            return false;
        }

        if self.range_end.is_empty() {
            key == &self.key[..]
        } else if self.range_end == [0] {
            true
        } else {
            key < &self.range_end[..]
        }
    }
}

pub type WatchSender = mpsc::UnboundedSender<RpcResult<WatchResponse>>;

struct Watcher {
    range: KeyRange,
    prev_kv: bool,
    tx: WatchSender,
}

impl Watcher {
    fn select(&self, events: &[Event]) -> Vec<Event> {
        events
            .iter()
            .filter(|event| self.range.contains(&event.kv.key))
            .map(|event| {
                let mut event = event.clone();
                if !self.prev_kv {
                    event.prev_kv = None;
                }
                event
            })
            .collect()
    }
}

pub struct WatchHub {
    watchers: DashMap<i64, Watcher>,
    next_watch_id: AtomicI64,
}

impl Default for WatchHub {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchHub {
    pub fn new() -> Self {
        WatchHub {
            watchers: DashMap::new(),
            next_watch_id: AtomicI64::new(1),
        }
    }

    /// Registers a watcher after replaying `history` (events at or after its
    /// start revision, in revision order) onto `tx`.
    pub fn create_watch(
        &self,
        range: KeyRange,
        prev_kv: bool,
        history: &[Event],
        header: &ResponseHeader,
        tx: WatchSender,
    ) -> i64 {
        self.prune_closed();

        let watch_id = self.next_watch_id.fetch_add(1, Ordering::SeqCst);
        let watcher = Watcher { range, prev_kv, tx };

        // one response per past revision, the same shape live commits have
        let mut start = 0;
        while start < history.len() {
            let revision = history[start].kv.mod_revision;
            let end = history[start..]
                .iter()
                .position(|event| event.kv.mod_revision != revision)
                .map_or(history.len(), |offset| start + offset);

            let events = watcher.select(&history[start..end]);
            if !events.is_empty() {
                let _ = watcher.tx.send(Ok(WatchResponse {
                    header: ResponseHeader {
                        revision,
                        ..header.clone()
                    },
                    events,
                    ..Default::default()
                }));
            }
            start = end;
        }

        self.watchers.insert(watch_id, watcher);
        debug!(watch_id, "watch created");
        watch_id
    }

    /// Delivers one committed transaction to every matching watcher.
    pub fn notify(&self, events: &[Event], header: &ResponseHeader) {
        if events.is_empty() {
            return;
        }

        for entry in self.watchers.iter() {
            let selected = entry.value().select(events);
            if selected.is_empty() {
                continue;
            }
            let resp = WatchResponse {
                header: header.clone(),
                events: selected,
                ..Default::default()
            };
            let _ = entry.value().tx.send(Ok(resp));
        }

        self.prune_closed();
    }

    /// Drops watchers whose receiver is gone, whatever range they cover.
    fn prune_closed(&self) {
        self.watchers.retain(|watch_id, watcher| {
            if watcher.tx.is_closed() {
                debug!(watch_id = *watch_id, "watch receiver dropped");
                return false;
            }
            true
        });
    }

    /// Fails and removes every watcher.
    pub fn fail_all(&self, err: RpcError) {
        let ids: Vec<i64> = self.watchers.iter().map(|entry| *entry.key()).collect();
        for watch_id in ids {
            if let Some((_, watcher)) = self.watchers.remove(&watch_id) {
                let _ = watcher.tx.send(Err(err.clone()));
            }
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }
}
