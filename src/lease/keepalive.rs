//! Keepalive multiplexer.
//!
//! One worker task per client owns every keepalive registration and a single
//! duplex stream to the lease service. Callers talk to it only through a bounded
//! command queue; responses are fanned out to per-consumer bounded channels.
//!
//! Delivery never blocks the worker: a full consumer channel drops that
//! response, but the renewal deadline is always advanced from it, so a slow
//! consumer cannot make its lease decay. A registration's channels close when
//! the lease is reported gone (`ttl <= 0`), when no response arrives before its
//! deadline, or when the multiplexer shuts down.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use super::{LeaseError, LeaseResult};
use crate::client::config::KeepAliveConfig;
use crate::rpc::{
    KeepAliveStream, LeaseApi, LeaseId, LeaseKeepAliveRequest, LeaseKeepAliveResponse, RpcError,
    RpcResult,
};

/// Per-consumer options for [`KeepAliveMultiplexer::track`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrackOptions {
    /// Close this consumer's channel as soon as the stream reports leader loss
    /// instead of waiting for the lease deadline.
    pub require_leader: bool,
}

impl TrackOptions {
    pub fn require_leader() -> Self {
        Self {
            require_leader: true,
        }
    }
}

/// Receiving side of one consumer's keepalive deliveries.
///
/// `recv` returning `None` is the only terminal signal: the lease expired, was
/// revoked, the consumer's scope was cancelled, or the multiplexer halted.
/// Use `time_to_live` to tell these apart.
#[derive(Debug)]
pub struct KeepAliveChannel {
    id: LeaseId,
    rx: mpsc::Receiver<LeaseKeepAliveResponse>,
}

impl KeepAliveChannel {
    pub fn lease(&self) -> LeaseId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<LeaseKeepAliveResponse> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<LeaseKeepAliveResponse, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }

    /// Number of responses buffered and not yet received.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl Stream for KeepAliveChannel {
    type Item = LeaseKeepAliveResponse;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

enum Command {
    Register {
        id: LeaseId,
        consumer: Consumer,
    },
    Deregister {
        id: LeaseId,
        consumer_id: u64,
    },
    Tracked {
        reply: oneshot::Sender<Vec<LeaseId>>,
    },
}

struct Consumer {
    consumer_id: u64,
    tx: mpsc::Sender<LeaseKeepAliveResponse>,
    require_leader: bool,
    /// Cancels the consumer's scope watcher once the worker drops this consumer.
    _released: DropGuard,
}

struct Registration {
    consumers: Vec<Consumer>,
    next_keep_alive: Instant,
    deadline: Instant,
}

/// Handle to the keepalive worker of one client connection.
pub struct KeepAliveMultiplexer {
    cmd_tx: mpsc::Sender<Command>,
    halted: Arc<Mutex<Option<String>>>,
    stop: CancellationToken,
    next_consumer_id: AtomicU64,
    response_channel_size: usize,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl KeepAliveMultiplexer {
    /// Spawns the worker. Must be called from within a tokio runtime.
    pub fn spawn(api: Arc<dyn LeaseApi>, config: KeepAliveConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_queue_size);
        let (conn_tx, conn_rx) = mpsc::channel(1);
        let halted = Arc::new(Mutex::new(None));
        let stop = CancellationToken::new();

        let worker = KeepAliveWorker {
            api,
            backoff: config.retry_backoff_min,
            response_channel_size: config.response_channel_size,
            config,
            cmd_rx,
            conn_tx,
            conn_rx,
            stream: None,
            connecting: false,
            send_backlog: false,
            retry_at: None,
            registrations: HashMap::new(),
            halted: halted.clone(),
            stop: stop.clone(),
        };
        let response_channel_size = worker.response_channel_size;
        let handle = tokio::spawn(worker.run());

        Self {
            cmd_tx,
            halted,
            stop,
            next_consumer_id: AtomicU64::new(1),
            response_channel_size,
            worker: Mutex::new(Some(handle)),
        }
    }

    /// Registers `id` for periodic renewal and returns a delivery channel.
    ///
    /// Cancelling `cancel` closes only this channel; the lease registration
    /// survives while other consumers of the same lease remain.
    pub async fn track(
        &self,
        id: LeaseId,
        opts: TrackOptions,
        cancel: CancellationToken,
    ) -> LeaseResult<KeepAliveChannel> {
        if let Some(reason) = self.halted.lock().clone() {
            return Err(LeaseError::KeepAliveHalted { reason });
        }

        let (tx, rx) = mpsc::channel(self.response_channel_size);
        let consumer_id = self.next_consumer_id.fetch_add(1, Ordering::Relaxed);
        let released = CancellationToken::new();
        let consumer = Consumer {
            consumer_id,
            tx,
            require_leader: opts.require_leader,
            _released: released.clone().drop_guard(),
        };

        self.cmd_tx
            .send(Command::Register { id, consumer })
            .await
            .map_err(|_| self.halted_error())?;

        let cmd_tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = cmd_tx.send(Command::Deregister { id, consumer_id }).await;
                }
                _ = released.cancelled() => {}
            }
        });

        Ok(KeepAliveChannel { id, rx })
    }

    /// Lease ids that currently hold a registration.
    pub async fn tracked(&self) -> LeaseResult<Vec<LeaseId>> {
        let (reply, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Tracked { reply })
            .await
            .map_err(|_| self.halted_error())?;
        rx.await.map_err(|_| self.halted_error())
    }

    pub fn is_halted(&self) -> bool {
        self.halted.lock().is_some()
    }

    /// Stops the worker, closing every outstanding channel. Idempotent.
    pub async fn shutdown(&self, reason: impl Into<String>) {
        {
            let mut halted = self.halted.lock();
            if halted.is_none() {
                *halted = Some(reason.into());
            }
        }
        self.stop.cancel();

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "keepalive worker terminated abnormally");
            }
        }
    }

    fn halted_error(&self) -> LeaseError {
        let reason = self
            .halted
            .lock()
            .clone()
            .unwrap_or_else(|| "keepalive worker exited".to_string());
        LeaseError::KeepAliveHalted { reason }
    }
}

impl Drop for KeepAliveMultiplexer {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

enum WorkerEvent {
    Stop,
    Command(Option<Command>),
    Response(Option<RpcResult<LeaseKeepAliveResponse>>),
    Connected(Option<RpcResult<KeepAliveStream>>),
    Tick,
}

/// Sole owner of the registration table and the keepalive stream.
struct KeepAliveWorker {
    api: Arc<dyn LeaseApi>,
    config: KeepAliveConfig,
    response_channel_size: usize,
    cmd_rx: mpsc::Receiver<Command>,
    conn_tx: mpsc::Sender<RpcResult<KeepAliveStream>>,
    conn_rx: mpsc::Receiver<RpcResult<KeepAliveStream>>,
    stream: Option<KeepAliveStream>,
    connecting: bool,
    /// Set while due requests are waiting for room on the request stream.
    send_backlog: bool,
    retry_at: Option<Instant>,
    backoff: Duration,
    registrations: HashMap<LeaseId, Registration>,
    halted: Arc<Mutex<Option<String>>>,
    stop: CancellationToken,
}

async fn next_response(
    stream: &mut Option<KeepAliveStream>,
) -> Option<RpcResult<LeaseKeepAliveResponse>> {
    match stream {
        Some(stream) => stream.responses.next().await,
        None => std::future::pending().await,
    }
}

impl KeepAliveWorker {
    async fn run(mut self) {
        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let event = tokio::select! {
                _ = self.stop.cancelled() => WorkerEvent::Stop,
                cmd = self.cmd_rx.recv() => WorkerEvent::Command(cmd),
                resp = next_response(&mut self.stream) => WorkerEvent::Response(resp),
                conn = self.conn_rx.recv() => WorkerEvent::Connected(conn),
                _ = tick.tick() => WorkerEvent::Tick,
            };

            let keep_running = match event {
                WorkerEvent::Stop | WorkerEvent::Command(None) => false,
                WorkerEvent::Command(Some(cmd)) => {
                    self.on_command(cmd);
                    true
                }
                WorkerEvent::Response(Some(Ok(resp))) => {
                    self.on_response(resp);
                    // every answer frees a request slot on the stream
                    if self.send_backlog {
                        self.send_due(Instant::now());
                    }
                    true
                }
                WorkerEvent::Response(Some(Err(e))) => self.on_stream_error(e),
                WorkerEvent::Response(None) => self.on_stream_error(RpcError::Unavailable(
                    "keepalive stream closed".to_string(),
                )),
                WorkerEvent::Connected(Some(Ok(stream))) => {
                    self.connecting = false;
                    debug!(leases = self.registrations.len(), "keepalive stream established");
                    self.stream = Some(stream);
                    self.send_due(Instant::now());
                    true
                }
                WorkerEvent::Connected(Some(Err(e))) => {
                    self.connecting = false;
                    self.on_stream_error(e)
                }
                WorkerEvent::Connected(None) => true,
                WorkerEvent::Tick => {
                    self.on_tick(Instant::now());
                    true
                }
            };

            if !keep_running {
                break;
            }
        }

        let reason = {
            let mut halted = self.halted.lock();
            halted
                .get_or_insert_with(|| "keepalive multiplexer stopped".to_string())
                .clone()
        };
        info!(
            reason = %reason,
            closed = self.registrations.len(),
            "keepalive multiplexer halted"
        );
        self.cmd_rx.close();
        self.registrations.clear();
        self.stream = None;
    }

    fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Register { id, consumer } => {
                let now = Instant::now();
                match self.registrations.entry(id) {
                    Entry::Occupied(mut entry) => entry.get_mut().consumers.push(consumer),
                    Entry::Vacant(entry) => {
                        entry.insert(Registration {
                            consumers: vec![consumer],
                            next_keep_alive: now,
                            deadline: now + self.config.first_keep_alive_timeout,
                        });
                    }
                }
                debug!(lease_id = id, "lease registered for keepalive");

                if self.stream.is_some() {
                    self.send_due(now);
                } else {
                    self.maybe_connect(now);
                }
            }
            Command::Deregister { id, consumer_id } => {
                if let Some(reg) = self.registrations.get_mut(&id) {
                    reg.consumers.retain(|c| c.consumer_id != consumer_id);
                    if reg.consumers.is_empty() {
                        self.registrations.remove(&id);
                        debug!(lease_id = id, "keepalive registration cancelled");
                    }
                }
            }
            Command::Tracked { reply } => {
                let mut ids: Vec<LeaseId> = self.registrations.keys().copied().collect();
                ids.sort_unstable();
                let _ = reply.send(ids);
            }
        }
    }

    fn on_response(&mut self, resp: LeaseKeepAliveResponse) {
        self.backoff = self.config.retry_backoff_min;

        let id = resp.id;
        let Some(reg) = self.registrations.get_mut(&id) else {
            return;
        };

        if resp.ttl <= 0 {
            debug!(lease_id = id, "lease not found; closing keepalive channels");
            self.registrations.remove(&id);
            return;
        }

        let now = Instant::now();
        let ttl = Duration::from_secs(resp.ttl as u64);
        reg.next_keep_alive = now + ttl / 3;
        reg.deadline = now + ttl;

        reg.consumers.retain(|consumer| match consumer.tx.try_send(resp.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(
                    lease_id = id,
                    "lease keepalive response queue is full; dropping response send"
                );
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });

        if reg.consumers.is_empty() {
            self.registrations.remove(&id);
        }
    }

    /// Returns false when the error halts the multiplexer.
    fn on_stream_error(&mut self, err: RpcError) -> bool {
        self.stream = None;
        self.send_backlog = false;

        if !err.is_transient() {
            *self.halted.lock() = Some(err.to_string());
            return false;
        }

        if err == RpcError::NoLeader {
            self.close_require_leader();
        }

        let now = Instant::now();
        self.retry_at = Some(now + self.backoff);
        warn!(
            error = %err,
            retry_in = ?self.backoff,
            leases = self.registrations.len(),
            "keepalive stream failed; reconnecting"
        );
        self.backoff = (self.backoff * 2).min(self.config.retry_backoff_max);
        true
    }

    fn on_tick(&mut self, now: Instant) {
        self.registrations.retain(|id, reg| {
            reg.consumers.retain(|c| !c.tx.is_closed());
            if reg.consumers.is_empty() {
                return false;
            }
            if reg.deadline <= now {
                debug!(lease_id = *id, "keepalive deadline passed; closing channels");
                return false;
            }
            true
        });

        if self.stream.is_some() {
            self.send_due(now);
        } else {
            self.maybe_connect(now);
        }
    }

    fn close_require_leader(&mut self) {
        self.registrations.retain(|id, reg| {
            reg.consumers.retain(|c| !c.require_leader);
            if reg.consumers.is_empty() {
                debug!(lease_id = *id, "leader lost; closing require-leader keepalive");
                return false;
            }
            true
        });
    }

    fn maybe_connect(&mut self, now: Instant) {
        if self.connecting || self.stream.is_some() || self.registrations.is_empty() {
            return;
        }
        if self.retry_at.is_some_and(|at| now < at) {
            return;
        }

        self.connecting = true;
        self.retry_at = None;
        let api = self.api.clone();
        let conn_tx = self.conn_tx.clone();
        tokio::spawn(async move {
            let result = api.lease_keep_alive().await;
            let _ = conn_tx.send(result).await;
        });
    }

    fn send_due(&mut self, now: Instant) {
        let Some(stream) = self.stream.as_ref() else {
            return;
        };

        let mut broken = false;
        let mut backlog = false;
        for (id, reg) in self.registrations.iter_mut() {
            if reg.next_keep_alive > now {
                continue;
            }
            match stream.requests.try_send(LeaseKeepAliveRequest { id: *id }) {
                // resend on the tick cadence until a response arrives
                Ok(()) => reg.next_keep_alive = now + self.config.tick_interval,
                // still due; picked up again as responses drain the stream
                Err(TrySendError::Full(_)) => {
                    backlog = true;
                    break;
                }
                Err(TrySendError::Closed(_)) => {
                    broken = true;
                    break;
                }
            }
        }
        self.send_backlog = backlog;

        if broken {
            self.on_stream_error(RpcError::Unavailable(
                "keepalive request stream closed".to_string(),
            ));
        }
    }
}
