//! Boundary to the lease and key-value services.
//!
//! The core only talks to the store through these two traits, so the same
//! keepalive, session and recipe logic runs against a gRPC transport or the
//! in-process [`crate::embed::EmbeddedCluster`].

pub mod types;

use async_trait::async_trait;
use thiserror::Error;

pub use types::*;

/// Errors reported by the lease and KV services.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("requested lease not found")]
    LeaseNotFound,

    #[error("lease TTL is too large")]
    LeaseTtlTooLarge,

    #[error("no leader")]
    NoLeader,

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("request canceled")]
    Canceled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("required revision has been compacted; oldest retained is {compact_revision}")]
    Compacted { compact_revision: i64 },
}

impl RpcError {
    /// Whether a stream failing with this error is worth reopening.
    ///
    /// Unavailable and leader-loss conditions are expected to clear; internal
    /// errors may be a broken frame. Everything else halts the caller.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RpcError::NoLeader | RpcError::Unavailable(_) | RpcError::Internal(_)
        )
    }
}

pub type RpcResult<T> = Result<T, RpcError>;

/// Lease service: unary administration calls plus the keepalive duplex stream.
#[async_trait]
pub trait LeaseApi: Send + Sync {
    async fn lease_grant(&self, ttl: i64, id: LeaseId) -> RpcResult<LeaseGrantResponse>;

    async fn lease_revoke(&self, id: LeaseId) -> RpcResult<LeaseRevokeResponse>;

    async fn lease_time_to_live(
        &self,
        id: LeaseId,
        keys: bool,
    ) -> RpcResult<LeaseTimeToLiveResponse>;

    async fn lease_leases(&self) -> RpcResult<LeaseLeasesResponse>;

    /// Opens a keepalive stream. Fails with `NoLeader` when the member cannot
    /// reach a leader, since every stream requires one.
    async fn lease_keep_alive(&self) -> RpcResult<KeepAliveStream>;
}

/// Transactional key-value service with change notification.
#[async_trait]
pub trait KvApi: Send + Sync {
    async fn put(&self, req: PutRequest) -> RpcResult<PutResponse>;

    async fn range(&self, req: RangeRequest) -> RpcResult<RangeResponse>;

    async fn delete_range(&self, req: DeleteRangeRequest) -> RpcResult<DeleteRangeResponse>;

    async fn txn(&self, req: TxnRequest) -> RpcResult<TxnResponse>;

    async fn watch(&self, req: WatchRequest) -> RpcResult<WatchStream>;
}
