//! Client-side lease handling.
//!
//! [`Lessor`] wraps the unary lease calls and owns the connection's
//! [`KeepAliveMultiplexer`]; every `keep_alive` on a client shares that one
//! worker and its single keepalive stream.

pub mod keepalive;

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::client::config::KeepAliveConfig;
use crate::rpc::{
    LeaseApi, LeaseGrantResponse, LeaseId, LeaseKeepAliveRequest, LeaseKeepAliveResponse,
    LeaseLeasesResponse, LeaseRevokeResponse, LeaseTimeToLiveResponse, RpcError, NO_LEASE,
};

pub use keepalive::{KeepAliveChannel, KeepAliveMultiplexer, TrackOptions};

/// Lease-related errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    #[error("requested lease not found")]
    NotFound,

    #[error("lease TTL is too large")]
    TtlTooLarge,

    #[error("keepalive halted: {reason}")]
    KeepAliveHalted { reason: String },

    #[error("client closed")]
    Canceled,

    #[error(transparent)]
    Rpc(RpcError),
}

impl From<RpcError> for LeaseError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::LeaseNotFound => LeaseError::NotFound,
            RpcError::LeaseTtlTooLarge => LeaseError::TtlTooLarge,
            RpcError::Canceled => LeaseError::Canceled,
            other => LeaseError::Rpc(other),
        }
    }
}

pub type LeaseResult<T> = Result<T, LeaseError>;

/// Lease operations of one client connection.
pub struct Lessor {
    api: Arc<dyn LeaseApi>,
    keep_alives: KeepAliveMultiplexer,
    stop: CancellationToken,
}

impl Lessor {
    /// Creates the lessor and spawns its keepalive worker.
    ///
    /// Unary calls fail with [`LeaseError::Canceled`] once `stop` is cancelled.
    pub fn new(api: Arc<dyn LeaseApi>, config: KeepAliveConfig, stop: CancellationToken) -> Self {
        let keep_alives = KeepAliveMultiplexer::spawn(api.clone(), config);
        Self {
            api,
            keep_alives,
            stop,
        }
    }

    /// Grants a lease with a server-assigned id.
    pub async fn grant(&self, ttl: i64) -> LeaseResult<LeaseGrantResponse> {
        self.call(self.api.lease_grant(ttl, NO_LEASE)).await
    }

    /// Grants a lease with a caller-chosen id.
    pub async fn grant_with_id(&self, ttl: i64, id: LeaseId) -> LeaseResult<LeaseGrantResponse> {
        self.call(self.api.lease_grant(ttl, id)).await
    }

    pub async fn revoke(&self, id: LeaseId) -> LeaseResult<LeaseRevokeResponse> {
        self.call(self.api.lease_revoke(id)).await
    }

    /// Remaining TTL of `id`; `ttl == -1` if the lease is unknown or expired.
    pub async fn time_to_live(
        &self,
        id: LeaseId,
        with_keys: bool,
    ) -> LeaseResult<LeaseTimeToLiveResponse> {
        let mut resp = self.call(self.api.lease_time_to_live(id, with_keys)).await?;
        resp.keys.sort();
        Ok(resp)
    }

    pub async fn leases(&self) -> LeaseResult<LeaseLeasesResponse> {
        self.call(self.api.lease_leases()).await
    }

    /// Keeps `id` alive until `cancel` fires or the lease goes away.
    pub async fn keep_alive(
        &self,
        id: LeaseId,
        cancel: CancellationToken,
    ) -> LeaseResult<KeepAliveChannel> {
        self.keep_alive_with(id, TrackOptions::default(), cancel)
            .await
    }

    pub async fn keep_alive_with(
        &self,
        id: LeaseId,
        opts: TrackOptions,
        cancel: CancellationToken,
    ) -> LeaseResult<KeepAliveChannel> {
        self.keep_alives.track(id, opts, cancel).await
    }

    /// Renews `id` exactly once over a dedicated stream.
    pub async fn keep_alive_once(&self, id: LeaseId) -> LeaseResult<LeaseKeepAliveResponse> {
        let mut stream = self.call(self.api.lease_keep_alive()).await?;

        stream
            .requests
            .send(LeaseKeepAliveRequest { id })
            .await
            .map_err(|_| {
                LeaseError::Rpc(RpcError::Unavailable(
                    "keepalive stream closed".to_string(),
                ))
            })?;

        let resp = self
            .call(async {
                stream.responses.next().await.unwrap_or_else(|| {
                    Err(RpcError::Unavailable(
                        "keepalive stream closed".to_string(),
                    ))
                })
            })
            .await?;

        if resp.ttl <= 0 {
            return Err(LeaseError::NotFound);
        }
        debug!(lease_id = id, ttl = resp.ttl, "lease renewed once");
        Ok(resp)
    }

    pub fn multiplexer(&self) -> &KeepAliveMultiplexer {
        &self.keep_alives
    }

    /// Closes every keepalive channel and rejects further tracking.
    pub async fn close(&self) {
        self.keep_alives.shutdown("client closed").await;
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, RpcError>>,
    ) -> LeaseResult<T> {
        if self.stop.is_cancelled() {
            return Err(LeaseError::Canceled);
        }
        tokio::select! {
            _ = self.stop.cancelled() => Err(LeaseError::Canceled),
            res = fut => res.map_err(LeaseError::from),
        }
    }
}
