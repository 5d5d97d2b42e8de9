//! Client handle bundling the KV service, the lessor and shutdown state.

pub mod config;

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::lease::Lessor;
use crate::rpc::{
    DeleteRangeRequest, DeleteRangeResponse, KvApi, LeaseApi, LeaseId, PutRequest, PutResponse,
    RangeRequest, RangeResponse, RpcError, RpcResult, TxnRequest, TxnResponse, WatchRequest,
    WatchStream,
};

pub use config::{ClientConfig, KeepAliveConfig};

/// Client construction errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type ClientResult<T> = Result<T, ClientError>;

/// A connection to the store. Cheap to clone; all clones share one lessor.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    kv: Arc<dyn KvApi>,
    lessor: Lessor,
    config: ClientConfig,
    stop: CancellationToken,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl Client {
    /// Builds a client over separate KV and lease services.
    ///
    /// Spawns the keepalive worker, so it must run inside a tokio runtime.
    pub fn new(
        kv: Arc<dyn KvApi>,
        lease: Arc<dyn LeaseApi>,
        config: ClientConfig,
    ) -> ClientResult<Self> {
        config.validate()?;

        let stop = CancellationToken::new();
        let lessor = Lessor::new(lease, config.keep_alive.clone(), stop.clone());

        Ok(Self {
            inner: Arc::new(ClientInner {
                kv,
                lessor,
                config,
                stop,
            }),
        })
    }

    /// Builds a client over a backend serving both services.
    pub fn from_backend<B>(backend: Arc<B>, config: ClientConfig) -> ClientResult<Self>
    where
        B: KvApi + LeaseApi + 'static,
    {
        Self::new(backend.clone(), backend, config)
    }

    pub fn lease(&self) -> &Lessor {
        &self.inner.lessor
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Token cancelled when the client closes.
    pub fn closed(&self) -> &CancellationToken {
        &self.inner.stop
    }

    pub fn is_closed(&self) -> bool {
        self.inner.stop.is_cancelled()
    }

    pub async fn put(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> RpcResult<PutResponse> {
        self.put_request(PutRequest::new(key, value)).await
    }

    pub async fn put_with_lease(
        &self,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
        lease: LeaseId,
    ) -> RpcResult<PutResponse> {
        self.put_request(PutRequest::new(key, value).with_lease(lease))
            .await
    }

    pub async fn put_request(&self, req: PutRequest) -> RpcResult<PutResponse> {
        self.ensure_open()?;
        self.inner.kv.put(req).await
    }

    pub async fn get(&self, key: impl Into<Vec<u8>>) -> RpcResult<RangeResponse> {
        self.range(RangeRequest::key(key)).await
    }

    pub async fn get_prefix(&self, prefix: impl Into<Vec<u8>>) -> RpcResult<RangeResponse> {
        self.range(RangeRequest::prefix(prefix)).await
    }

    pub async fn range(&self, req: RangeRequest) -> RpcResult<RangeResponse> {
        self.ensure_open()?;
        self.inner.kv.range(req).await
    }

    pub async fn delete(&self, key: impl Into<Vec<u8>>) -> RpcResult<DeleteRangeResponse> {
        self.delete_range(DeleteRangeRequest::key(key)).await
    }

    pub async fn delete_prefix(
        &self,
        prefix: impl Into<Vec<u8>>,
    ) -> RpcResult<DeleteRangeResponse> {
        self.delete_range(DeleteRangeRequest::prefix(prefix)).await
    }

    pub async fn delete_range(&self, req: DeleteRangeRequest) -> RpcResult<DeleteRangeResponse> {
        self.ensure_open()?;
        self.inner.kv.delete_range(req).await
    }

    pub async fn txn(&self, req: TxnRequest) -> RpcResult<TxnResponse> {
        self.ensure_open()?;
        self.inner.kv.txn(req).await
    }

    pub async fn watch(&self, req: WatchRequest) -> RpcResult<WatchStream> {
        self.ensure_open()?;
        self.inner.kv.watch(req).await
    }

    /// Closes the client: pending unary calls fail with `Canceled` and every
    /// keepalive channel closes. Idempotent.
    pub async fn close(&self) {
        if !self.inner.stop.is_cancelled() {
            info!("closing client");
        }
        self.inner.stop.cancel();
        self.inner.lessor.close().await;
    }

    fn ensure_open(&self) -> RpcResult<()> {
        if self.inner.stop.is_cancelled() {
            return Err(RpcError::Canceled);
        }
        Ok(())
    }
}
