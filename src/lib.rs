//! # rusd-client: lease liveness and coordination recipes
//!
//! Client-side layer over an etcd-style store that offers leases, transactions
//! and watches. It provides:
//!
//! - **Keepalive multiplexing**: any number of leases renewed over one shared
//!   duplex stream, with a per-lease delivery channel that closes on expiry,
//!   revocation or shutdown
//! - **Sessions**: a lease kept alive on the caller's behalf, with a `done`
//!   signal for recipes built on top
//! - **Double barrier**: N-party enter/leave rendezvous
//! - **Endpoint directory**: service endpoints under a key prefix, watched as
//!   atomic per-transaction batches
//!
//! The store is reached through the [`rpc::LeaseApi`] and [`rpc::KvApi`]
//! traits. [`embed::EmbeddedCluster`] implements both in process.
//!
//! # Usage
//!
//! ```no_run
//! use rusd_client::{Client, ClientConfig, EmbeddedCluster, Session};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let cluster = EmbeddedCluster::start();
//! let client = Client::from_backend(cluster, ClientConfig::default())?;
//!
//! let session = Session::new(&client).await?;
//! client
//!     .put_with_lease("service/instance-1", "10.0.0.1:8080", session.lease())
//!     .await?;
//!
//! session.close().await?;
//! client.close().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod concurrency;
pub mod embed;
pub mod lease;
pub mod naming;
pub mod recipes;
pub mod rpc;

pub use client::{Client, ClientConfig, ClientError, KeepAliveConfig};
pub use concurrency::{Session, SessionOptions};
pub use embed::EmbeddedCluster;
pub use lease::{KeepAliveChannel, LeaseError, Lessor, TrackOptions};
pub use naming::{Endpoint, EndpointError, EndpointManager, Resolver};
pub use recipes::{DoubleBarrier, RecipeError};
pub use rpc::{LeaseId, RpcError};
