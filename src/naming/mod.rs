//! Service discovery on top of the KV store.

pub mod endpoints;
pub mod resolver;

use thiserror::Error;

use crate::rpc::RpcError;

pub use endpoints::{Endpoint, EndpointManager, Operation, Update, UpdateWithOpts, WatchChannel};
pub use resolver::Resolver;

#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("endpoint target must not be empty")]
    InvalidTarget,

    #[error("key {key:?} is outside target {target:?}")]
    KeyOutsideTarget { key: String, target: String },

    #[error("endpoint encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error(transparent)]
    Rpc(#[from] RpcError),
}

pub type EndpointResult<T> = Result<T, EndpointError>;
