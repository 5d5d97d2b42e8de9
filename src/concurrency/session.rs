use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::Client;
use crate::lease::{LeaseError, LeaseResult};
use crate::rpc::{LeaseId, RpcError, NO_LEASE};

/// Options for [`Session::with_options`].
#[derive(Clone, Debug, Default)]
pub struct SessionOptions {
    ttl: Option<i64>,
    lease: LeaseId,
    cancel: Option<CancellationToken>,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease TTL in seconds when a lease is granted for the session.
    pub fn with_ttl(mut self, ttl: i64) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Adopts an existing lease instead of granting one.
    pub fn with_lease(mut self, lease: LeaseId) -> Self {
        self.lease = lease;
        self
    }

    /// Parent scope; cancelling it orphans the session.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// A lease kept alive for as long as the session is in use.
///
/// Clones share the same lease. The session is done as soon as its keepalive
/// channel closes, whatever the cause.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    client: Client,
    lease: LeaseId,
    ttl: i64,
    ctx: CancellationToken,
    done: CancellationToken,
    revoked: AtomicBool,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.ctx.cancel();
    }
}

impl Session {
    /// Grants a lease with the client's default session TTL and keeps it alive.
    pub async fn new(client: &Client) -> LeaseResult<Self> {
        Self::with_options(client, SessionOptions::default()).await
    }

    pub async fn with_options(client: &Client, opts: SessionOptions) -> LeaseResult<Self> {
        let ttl = opts.ttl.unwrap_or(client.config().session_ttl);
        let lease = if opts.lease == NO_LEASE {
            client.lease().grant(ttl).await?.id
        } else {
            opts.lease
        };

        let ctx = match &opts.cancel {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let mut keep_alive = match client.lease().keep_alive(lease, ctx.clone()).await {
            Ok(channel) => channel,
            Err(e) => {
                ctx.cancel();
                return Err(e);
            }
        };

        let done = CancellationToken::new();
        let signal = done.clone();
        tokio::spawn(async move {
            while keep_alive.recv().await.is_some() {}
            debug!(lease_id = lease, "session keepalive closed");
            signal.cancel();
        });

        debug!(lease_id = lease, ttl, "session established");
        Ok(Self {
            inner: Arc::new(SessionInner {
                client: client.clone(),
                lease,
                ttl,
                ctx,
                done,
                revoked: AtomicBool::new(false),
            }),
        })
    }

    pub fn lease(&self) -> LeaseId {
        self.inner.lease
    }

    pub fn ttl(&self) -> i64 {
        self.inner.ttl
    }

    pub fn client(&self) -> &Client {
        &self.inner.client
    }

    /// Scope of the session's keepalive; cancelled by `orphan` and `close`.
    pub fn ctx(&self) -> &CancellationToken {
        &self.inner.ctx
    }

    /// Resolves once the session's lease is no longer kept alive.
    pub async fn done(&self) {
        self.inner.done.cancelled().await
    }

    pub fn is_done(&self) -> bool {
        self.inner.done.is_cancelled()
    }

    /// A token cancelled together with `done`, for use in `select!`.
    pub fn done_token(&self) -> CancellationToken {
        self.inner.done.clone()
    }

    /// Stops keeping the lease alive without revoking it; the lease then
    /// expires by TTL. Idempotent.
    pub async fn orphan(&self) {
        self.inner.ctx.cancel();
        self.inner.done.cancelled().await;
    }

    /// Orphans the session and revokes its lease, deleting every key attached
    /// to it. Idempotent once it has succeeded; after a failure it can be
    /// called again.
    pub async fn close(&self) -> LeaseResult<()> {
        self.orphan().await;

        if self.inner.revoked.load(Ordering::SeqCst) {
            return Ok(());
        }

        let deadline = Duration::from_secs(self.inner.ttl.max(1) as u64);
        let revoke = self.inner.client.lease().revoke(self.inner.lease);
        match tokio::time::timeout(deadline, revoke).await {
            // already expired counts as revoked
            Ok(Ok(_)) | Ok(Err(LeaseError::NotFound)) => {
                self.inner.revoked.store(true, Ordering::SeqCst);
                Ok(())
            }
            // left unmarked so a later close retries the revoke
            Ok(Err(e)) => Err(e),
            Err(_) => {
                warn!(lease_id = self.inner.lease, "session revoke timed out");
                Err(LeaseError::Rpc(RpcError::Unavailable(
                    "lease revoke timed out".to_string(),
                )))
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("lease", &self.inner.lease)
            .field("ttl", &self.inner.ttl)
            .field("done", &self.is_done())
            .finish()
    }
}
