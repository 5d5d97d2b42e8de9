//! Single-member, in-process store serving the lease and KV APIs.
//!
//! Used by the crate's tests and benches, and usable by applications that want
//! the coordination recipes without a remote cluster. Besides the services it
//! exposes a few fault-injection switches that mimic what a client sees from a
//! real cluster member:
//!
//! - [`EmbeddedCluster::stop`] / [`EmbeddedCluster::restart`]: the member is
//!   unreachable. New calls fail with `Unavailable`, keepalive and watch streams
//!   break. Leases keep expiring, as the rest of the cluster moves on.
//! - [`EmbeddedCluster::lose_leader`] / [`EmbeddedCluster::restore_leader`]:
//!   keepalive streams fail with `NoLeader` and cannot be reopened; lease expiry
//!   is suspended until a leader returns, at which point every lease is renewed.

pub mod lease;
pub mod store;
pub mod watch;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, watch as state_watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::{ReceiverStream, UnboundedReceiverStream};
use tracing::{debug, info, warn};

use self::lease::LeaseManager;
use self::store::{MvccStore, StoreState};
use self::watch::{KeyRange, WatchHub};
use crate::rpc::{
    DeleteRangeRequest, DeleteRangeResponse, Event, EventType, KeepAliveStream, KvApi, LeaseApi,
    LeaseGrantResponse, LeaseId, LeaseKeepAliveRequest, LeaseKeepAliveResponse,
    LeaseLeasesResponse, LeaseRevokeResponse, LeaseStatus, LeaseTimeToLiveResponse, PutRequest,
    PutResponse, RangeRequest, RangeResponse, RequestOp, ResponseHeader, ResponseOp, RpcError,
    RpcResult, TxnRequest, TxnResponse, WatchRequest, WatchStream, NO_LEASE,
};

const EXPIRY_CHECK_INTERVAL: Duration = Duration::from_millis(100);
const KEEP_ALIVE_STREAM_BUFFER: usize = 16;

/// Reachability of the member as seen by clients.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberState {
    Healthy,
    NoLeader,
    Down,
}

/// Member state plus a counter bumped on every stop, so streams opened before
/// a stop/restart cycle break even if the restart is observed first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct MemberStatus {
    state: MemberState,
    incarnation: u64,
}

pub struct EmbeddedCluster {
    inner: Arc<ClusterInner>,
    expiry_task: JoinHandle<()>,
}

struct ClusterInner {
    cluster_id: u64,
    member_id: u64,
    store: MvccStore,
    leases: LeaseManager,
    watches: WatchHub,
    state: state_watch::Sender<MemberStatus>,
    keep_alive_requests: DashMap<LeaseId, u64>,
}

impl EmbeddedCluster {
    /// Starts the member and its lease expiry loop.
    pub fn start() -> Arc<Self> {
        let (state, _) = state_watch::channel(MemberStatus {
            state: MemberState::Healthy,
            incarnation: 0,
        });
        let inner = Arc::new(ClusterInner {
            cluster_id: 1,
            member_id: 1,
            store: MvccStore::new(),
            leases: LeaseManager::new(),
            watches: WatchHub::new(),
            state,
            keep_alive_requests: DashMap::new(),
        });

        let expiry_task = tokio::spawn(inner.clone().run_expiry_loop());
        info!("embedded cluster started");

        Arc::new(Self { inner, expiry_task })
    }

    pub fn member_state(&self) -> MemberState {
        self.inner.state.borrow().state
    }

    /// Makes the member unreachable.
    pub fn stop(&self) {
        info!("embedded member stopped");
        self.inner.state.send_modify(|status| {
            status.state = MemberState::Down;
            status.incarnation += 1;
        });
        self.inner
            .watches
            .fail_all(RpcError::Unavailable("member stopped".to_string()));
    }

    pub fn restart(&self) {
        info!("embedded member restarted");
        self.inner
            .state
            .send_modify(|status| status.state = MemberState::Healthy);
    }

    pub fn lose_leader(&self) {
        info!("embedded member lost its leader");
        self.inner
            .state
            .send_modify(|status| status.state = MemberState::NoLeader);
    }

    pub fn restore_leader(&self) {
        info!("embedded member regained a leader");
        self.inner.leases.refresh_all();
        self.inner
            .state
            .send_modify(|status| status.state = MemberState::Healthy);
    }

    /// Renewal requests received for `id` across all keepalive streams.
    pub fn keep_alive_requests(&self, id: LeaseId) -> u64 {
        self.inner
            .keep_alive_requests
            .get(&id)
            .map_or(0, |count| *count)
    }

    pub fn revision(&self) -> i64 {
        self.inner.store.lock().current_revision()
    }

    pub fn lease_count(&self) -> usize {
        self.inner.leases.count()
    }

    pub fn watcher_count(&self) -> usize {
        self.inner.watches.watcher_count()
    }
}

impl Drop for EmbeddedCluster {
    fn drop(&mut self) {
        self.expiry_task.abort();
    }
}

impl ClusterInner {
    fn header(&self, revision: i64) -> ResponseHeader {
        ResponseHeader {
            cluster_id: self.cluster_id,
            member_id: self.member_id,
            revision,
            raft_term: 1,
        }
    }

    fn check_available(&self) -> RpcResult<()> {
        match self.state.borrow().state {
            MemberState::Down => Err(RpcError::Unavailable("member stopped".to_string())),
            MemberState::Healthy | MemberState::NoLeader => Ok(()),
        }
    }

    /// Commits a write, keeps lease attachments in step and notifies watchers.
    fn publish(&self, state: &StoreState, events: &[Event]) {
        for event in events {
            if let Some(prev) = &event.prev_kv {
                let reattached = event.event_type == EventType::Put && prev.lease == event.kv.lease;
                if prev.lease != NO_LEASE && !reattached {
                    self.leases.detach(prev.lease, &prev.key);
                }
            }
            if event.event_type == EventType::Put && event.kv.lease != NO_LEASE {
                if let Err(e) = self.leases.attach(event.kv.lease, event.kv.key.clone()) {
                    warn!(lease_id = event.kv.lease, error = %e, "failed to attach key to lease");
                }
            }
        }
        self.watches
            .notify(events, &self.header(state.current_revision()));
    }

    /// Deletes the keys of a removed lease in one revision.
    fn delete_lease_keys(&self, state: &mut StoreState, keys: &[Vec<u8>]) {
        if keys.is_empty() {
            return;
        }
        let mut txn = state.begin();
        for key in keys {
            txn.delete_range(&DeleteRangeRequest::key(key.clone()));
        }
        let events = txn.commit();
        self.publish(state, &events);
    }

    fn check_leases(&self, ops: &[RequestOp]) -> RpcResult<()> {
        for op in ops {
            if let RequestOp::Put(put) = op {
                if put.lease != NO_LEASE && !self.leases.contains(put.lease) {
                    return Err(RpcError::LeaseNotFound);
                }
            }
        }
        Ok(())
    }

    async fn run_expiry_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(EXPIRY_CHECK_INTERVAL);
        loop {
            interval.tick().await;

            if self.state.borrow().state == MemberState::NoLeader {
                continue;
            }

            let mut state = self.store.lock();
            for expired in self.leases.take_expired(Instant::now()) {
                debug!(
                    lease_id = expired.lease_id,
                    key_count = expired.keys.len(),
                    "deleting keys of expired lease"
                );
                self.delete_lease_keys(&mut state, &expired.keys);
            }
        }
    }

    async fn serve_keep_alive(
        self: Arc<Self>,
        mut requests: mpsc::Receiver<LeaseKeepAliveRequest>,
        responses: mpsc::Sender<RpcResult<LeaseKeepAliveResponse>>,
    ) {
        let mut state_rx = self.state.subscribe();
        let incarnation = state_rx.borrow_and_update().incarnation;

        loop {
            tokio::select! {
                req = requests.recv() => {
                    let Some(req) = req else { break };
                    *self.keep_alive_requests.entry(req.id).or_insert(0) += 1;

                    // unknown or expired leases are answered with ttl 0
                    let ttl = self.leases.renew(req.id).unwrap_or(0);
                    let revision = self.store.lock().current_revision();
                    let resp = LeaseKeepAliveResponse {
                        header: self.header(revision),
                        id: req.id,
                        ttl,
                    };
                    if responses.send(Ok(resp)).await.is_err() {
                        break;
                    }
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let status = *state_rx.borrow_and_update();
                    let err = if status.incarnation != incarnation {
                        RpcError::Unavailable("member stopped".to_string())
                    } else {
                        match status.state {
                            MemberState::Healthy => continue,
                            MemberState::NoLeader => RpcError::NoLeader,
                            MemberState::Down => RpcError::Unavailable("member stopped".to_string()),
                        }
                    };
                    let _ = responses.send(Err(err)).await;
                    break;
                }
            }
        }

        debug!("keepalive stream closed");
    }
}

#[async_trait]
impl LeaseApi for EmbeddedCluster {
    async fn lease_grant(&self, ttl: i64, id: LeaseId) -> RpcResult<LeaseGrantResponse> {
        self.inner.check_available()?;
        let lease = self.inner.leases.grant(id, ttl)?;
        let revision = self.inner.store.lock().current_revision();
        Ok(LeaseGrantResponse {
            header: self.inner.header(revision),
            id: lease.id,
            ttl: lease.granted_ttl,
        })
    }

    async fn lease_revoke(&self, id: LeaseId) -> RpcResult<LeaseRevokeResponse> {
        self.inner.check_available()?;
        let mut state = self.inner.store.lock();
        let keys = self.inner.leases.revoke(id)?;
        self.inner.delete_lease_keys(&mut state, &keys);
        Ok(LeaseRevokeResponse {
            header: self.inner.header(state.current_revision()),
        })
    }

    async fn lease_time_to_live(
        &self,
        id: LeaseId,
        keys: bool,
    ) -> RpcResult<LeaseTimeToLiveResponse> {
        self.inner.check_available()?;
        let revision = self.inner.store.lock().current_revision();
        let header = self.inner.header(revision);

        Ok(match self.inner.leases.time_to_live(id) {
            Some((ttl, granted_ttl, attached)) => LeaseTimeToLiveResponse {
                header,
                id,
                ttl,
                granted_ttl,
                keys: if keys { attached } else { Vec::new() },
            },
            None => LeaseTimeToLiveResponse {
                header,
                id,
                ttl: -1,
                ..Default::default()
            },
        })
    }

    async fn lease_leases(&self) -> RpcResult<LeaseLeasesResponse> {
        self.inner.check_available()?;
        let revision = self.inner.store.lock().current_revision();
        Ok(LeaseLeasesResponse {
            header: self.inner.header(revision),
            leases: self
                .inner
                .leases
                .list()
                .into_iter()
                .map(|id| LeaseStatus { id })
                .collect(),
        })
    }

    async fn lease_keep_alive(&self) -> RpcResult<KeepAliveStream> {
        match self.member_state() {
            MemberState::Down => return Err(RpcError::Unavailable("member stopped".to_string())),
            MemberState::NoLeader => return Err(RpcError::NoLeader),
            MemberState::Healthy => {}
        }

        let (req_tx, req_rx) = mpsc::channel(KEEP_ALIVE_STREAM_BUFFER);
        let (resp_tx, resp_rx) = mpsc::channel(KEEP_ALIVE_STREAM_BUFFER);
        tokio::spawn(self.inner.clone().serve_keep_alive(req_rx, resp_tx));

        Ok(KeepAliveStream {
            requests: req_tx,
            responses: Box::pin(ReceiverStream::new(resp_rx)),
        })
    }
}

#[async_trait]
impl KvApi for EmbeddedCluster {
    async fn put(&self, req: PutRequest) -> RpcResult<PutResponse> {
        self.inner.check_available()?;
        let mut state = self.inner.store.lock();
        if req.lease != NO_LEASE && !self.inner.leases.contains(req.lease) {
            return Err(RpcError::LeaseNotFound);
        }

        let mut txn = state.begin();
        let mut resp = txn.put(&req);
        let events = txn.commit();
        self.inner.publish(&state, &events);

        resp.header = self.inner.header(state.current_revision());
        Ok(resp)
    }

    async fn range(&self, req: RangeRequest) -> RpcResult<RangeResponse> {
        self.inner.check_available()?;
        let state = self.inner.store.lock();
        let mut resp = state.range(&req);
        resp.header = self.inner.header(state.current_revision());
        Ok(resp)
    }

    async fn delete_range(&self, req: DeleteRangeRequest) -> RpcResult<DeleteRangeResponse> {
        self.inner.check_available()?;
        let mut state = self.inner.store.lock();

        let mut txn = state.begin();
        let mut resp = txn.delete_range(&req);
        let events = txn.commit();
        self.inner.publish(&state, &events);

        resp.header = self.inner.header(state.current_revision());
        Ok(resp)
    }

    async fn txn(&self, req: TxnRequest) -> RpcResult<TxnResponse> {
        self.inner.check_available()?;
        let mut state = self.inner.store.lock();

        let succeeded = req.compare.iter().all(|cmp| state.compare(cmp));
        let ops = if succeeded { &req.success } else { &req.failure };
        self.inner.check_leases(ops)?;

        let mut txn = state.begin();
        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            responses.push(match op {
                RequestOp::Range(range) => ResponseOp::Range(txn.range(range)),
                RequestOp::Put(put) => ResponseOp::Put(txn.put(put)),
                RequestOp::DeleteRange(delete) => ResponseOp::DeleteRange(txn.delete_range(delete)),
            });
        }
        let events = txn.commit();
        self.inner.publish(&state, &events);

        Ok(TxnResponse {
            header: self.inner.header(state.current_revision()),
            succeeded,
            responses,
        })
    }

    async fn watch(&self, req: WatchRequest) -> RpcResult<WatchStream> {
        self.inner.check_available()?;
        let state = self.inner.store.lock();

        let (tx, rx) = mpsc::unbounded_channel();
        let history = if req.start_revision > 0 {
            state.history_since(req.start_revision)?
        } else {
            Vec::new()
        };
        let header = self.inner.header(state.current_revision());
        self.inner.watches.create_watch(
            KeyRange::new(req.key, req.range_end),
            req.prev_kv,
            &history,
            &header,
            tx,
        );

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }
}
