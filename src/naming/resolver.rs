//! Live view of a service's endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::endpoints::{Endpoint, EndpointManager, Operation, Update};
use super::EndpointResult;

/// Keeps the endpoint set of one target up to date from an endpoint watch.
///
/// Every batch is applied atomically, so readers never see half of a
/// multi-endpoint update.
pub struct Resolver {
    endpoints: Arc<RwLock<BTreeMap<String, Endpoint>>>,
    generation: watch::Receiver<u64>,
    cancel: CancellationToken,
}

impl Resolver {
    pub async fn start(manager: &EndpointManager) -> EndpointResult<Self> {
        let cancel = CancellationToken::new();
        let mut updates = manager.new_watch_channel(cancel.clone()).await?;

        let endpoints = Arc::new(RwLock::new(BTreeMap::new()));
        let (generation_tx, generation) = watch::channel(0u64);

        let shared = endpoints.clone();
        let target = manager.target().to_string();
        tokio::spawn(async move {
            while let Some(batch) = updates.next().await {
                apply(&mut shared.write(), batch);
                generation_tx.send_modify(|generation| *generation += 1);
            }
            debug!(service = %target, "resolver stopped");
        });

        Ok(Self {
            endpoints,
            generation,
            cancel,
        })
    }

    /// Addresses of all known endpoints, sorted and deduplicated.
    pub fn addresses(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self
            .endpoints
            .read()
            .values()
            .map(|endpoint| endpoint.addr.clone())
            .collect();
        addrs.sort();
        addrs.dedup();
        addrs
    }

    pub fn endpoints(&self) -> BTreeMap<String, Endpoint> {
        self.endpoints.read().clone()
    }

    /// Waits until another batch has been applied. Returns false once the
    /// resolver has stopped.
    pub async fn changed(&mut self) -> bool {
        self.generation.changed().await.is_ok()
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn apply(endpoints: &mut BTreeMap<String, Endpoint>, batch: Vec<Update>) {
    for update in batch {
        match update.op {
            Operation::Add => {
                endpoints.insert(update.key, update.endpoint);
            }
            Operation::Delete => {
                endpoints.remove(&update.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_batch() {
        let mut endpoints = BTreeMap::new();
        apply(
            &mut endpoints,
            vec![
                Update {
                    op: Operation::Add,
                    key: "svc/a".to_string(),
                    endpoint: Endpoint::new("10.0.0.1:80"),
                },
                Update {
                    op: Operation::Add,
                    key: "svc/b".to_string(),
                    endpoint: Endpoint::new("10.0.0.2:80"),
                },
            ],
        );
        apply(
            &mut endpoints,
            vec![Update {
                op: Operation::Delete,
                key: "svc/a".to_string(),
                endpoint: Endpoint::default(),
            }],
        );

        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints["svc/b"].addr, "10.0.0.2:80");
    }
}
