//! In-memory multi-version key space.
//!
//! Every write transaction that changes at least one key commits at exactly one
//! new revision. Recent event history is retained so watches can start at a
//! past revision; once it exceeds its limit the oldest whole revisions are
//! dropped and watches starting before them fail with `Compacted`.

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;

use parking_lot::{Mutex, MutexGuard};

use super::watch::KeyRange;
use crate::rpc::{
    Compare, CompareResult, CompareTarget, DeleteRangeRequest, DeleteRangeResponse, Event,
    EventType, KeyValue, PutRequest, PutResponse, RangeRequest, RangeResponse, RpcError,
    RpcResult,
};

/// Events kept for watch replay by default.
pub const DEFAULT_HISTORY_LIMIT: usize = 10_000;

pub struct MvccStore {
    state: Mutex<StoreState>,
}

impl Default for MvccStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MvccStore {
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    pub fn with_history_limit(history_limit: usize) -> Self {
        MvccStore {
            state: Mutex::new(StoreState {
                kvs: BTreeMap::new(),
                revision: 1,
                history: VecDeque::new(),
                history_limit,
                compact_revision: 1,
            }),
        }
    }

    /// Locks the key space. Every write and every watch registration happens
    /// under this lock.
    pub fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock()
    }
}

pub struct StoreState {
    kvs: BTreeMap<Vec<u8>, KeyValue>,
    revision: i64,
    history: VecDeque<Event>,
    history_limit: usize,
    /// Oldest revision whose events are still fully retained.
    compact_revision: i64,
}

impl StoreState {
    pub fn current_revision(&self) -> i64 {
        self.revision
    }

    pub fn range(&self, req: &RangeRequest) -> RangeResponse {
        let matched = self.matching(&req.key, &req.range_end);
        let count = matched.len();

        let kvs = if req.count_only {
            Vec::new()
        } else {
            let take = if req.limit > 0 {
                req.limit as usize
            } else {
                count
            };
            matched.into_iter().take(take).cloned().collect()
        };
        let more = req.limit > 0 && count > req.limit as usize;

        RangeResponse {
            kvs,
            count: count as i64,
            more,
            ..Default::default()
        }
    }

    /// Events committed at or after `start_revision`, in revision order.
    pub fn history_since(&self, start_revision: i64) -> RpcResult<Vec<Event>> {
        if start_revision < self.compact_revision {
            return Err(RpcError::Compacted {
                compact_revision: self.compact_revision,
            });
        }
        let from = self
            .history
            .partition_point(|event| event.kv.mod_revision < start_revision);
        Ok(self.history.range(from..).cloned().collect())
    }

    pub fn compact_revision(&self) -> i64 {
        self.compact_revision
    }

    fn trim_history(&mut self) {
        while self.history.len() > self.history_limit {
            let Some(oldest) = self.history.front().map(|event| event.kv.mod_revision) else {
                break;
            };
            while self
                .history
                .front()
                .is_some_and(|event| event.kv.mod_revision == oldest)
            {
                self.history.pop_front();
            }
            self.compact_revision = oldest + 1;
        }
    }

    /// Evaluates a compare; a missing key reads as zero revisions, zero
    /// version and no lease, and never matches a value compare.
    pub fn compare(&self, cmp: &Compare) -> bool {
        let kv = self.kvs.get(&cmp.key);
        let ordering = match &cmp.target {
            CompareTarget::Version(v) => kv.map_or(0, |kv| kv.version).cmp(v),
            CompareTarget::CreateRevision(rev) => kv.map_or(0, |kv| kv.create_revision).cmp(rev),
            CompareTarget::ModRevision(rev) => kv.map_or(0, |kv| kv.mod_revision).cmp(rev),
            CompareTarget::Lease(lease) => kv.map_or(0, |kv| kv.lease).cmp(lease),
            CompareTarget::Value(value) => match kv {
                Some(kv) => kv.value.as_slice().cmp(value.as_slice()),
                None => return false,
            },
        };

        match cmp.result {
            CompareResult::Equal => ordering.is_eq(),
            CompareResult::Greater => ordering.is_gt(),
            CompareResult::Less => ordering.is_lt(),
            CompareResult::NotEqual => ordering.is_ne(),
        }
    }

    pub fn begin(&mut self) -> WriteTxn<'_> {
        let revision = self.revision + 1;
        WriteTxn {
            state: self,
            revision,
            events: Vec::new(),
        }
    }

    fn matching(&self, key: &[u8], range_end: &[u8]) -> Vec<&KeyValue> {
        if range_end.is_empty() {
            return self.kvs.get(key).into_iter().collect();
        }

        let range = KeyRange::new(key.to_vec(), range_end.to_vec());
        self.kvs
            .range::<[u8], _>((Bound::Included(key), Bound::Unbounded))
            .take_while(|(k, _)| range.contains(k))
            .map(|(_, kv)| kv)
            .collect()
    }
}

/// Writes staged at one pending revision.
pub struct WriteTxn<'a> {
    state: &'a mut StoreState,
    revision: i64,
    events: Vec<Event>,
}

impl WriteTxn<'_> {
    pub fn range(&self, req: &RangeRequest) -> RangeResponse {
        self.state.range(req)
    }

    pub fn put(&mut self, req: &PutRequest) -> PutResponse {
        let prev = self.state.kvs.get(&req.key).cloned();
        let kv = KeyValue {
            key: req.key.clone(),
            create_revision: prev.as_ref().map_or(self.revision, |p| p.create_revision),
            mod_revision: self.revision,
            version: prev.as_ref().map_or(1, |p| p.version + 1),
            value: req.value.clone(),
            lease: req.lease,
        };

        self.state.kvs.insert(req.key.clone(), kv.clone());
        self.events.push(Event {
            event_type: EventType::Put,
            kv,
            prev_kv: prev.clone(),
        });

        PutResponse {
            prev_kv: if req.prev_kv { prev } else { None },
            ..Default::default()
        }
    }

    pub fn delete_range(&mut self, req: &DeleteRangeRequest) -> DeleteRangeResponse {
        let keys: Vec<Vec<u8>> = self
            .state
            .matching(&req.key, &req.range_end)
            .into_iter()
            .map(|kv| kv.key.clone())
            .collect();

        let mut prev_kvs = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(prev) = self.state.kvs.remove(&key) else {
                continue;
            };
            let tombstone = KeyValue {
                key,
                mod_revision: self.revision,
                ..Default::default()
            };
            self.events.push(Event {
                event_type: EventType::Delete,
                kv: tombstone,
                prev_kv: Some(prev.clone()),
            });
            prev_kvs.push(prev);
        }

        DeleteRangeResponse {
            deleted: prev_kvs.len() as i64,
            prev_kvs: if req.prev_kv { prev_kvs } else { Vec::new() },
            ..Default::default()
        }
    }

    /// Publishes the staged events and returns them. The revision only
    /// advances if something changed.
    pub fn commit(self) -> Vec<Event> {
        if !self.events.is_empty() {
            self.state.revision = self.revision;
            self.state.history.extend(self.events.iter().cloned());
            self.state.trim_history();
        }
        self.events
    }
}
