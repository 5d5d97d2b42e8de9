//! Name → endpoint directory stored under a key prefix.
//!
//! Each endpoint lives at a full key `<target>/<name>` holding
//! `{"Op":0,"Addr":"...","Metadata":...}`. Watchers receive changes as batches,
//! one batch per committed transaction, so a multi-operation [`Update`] is never
//! observed half-applied.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{EndpointError, EndpointResult};
use crate::client::Client;
use crate::rpc::{
    DeleteRangeRequest, Event, EventType, KeyValue, LeaseId, PutRequest, RequestOp, TxnRequest,
    WatchRequest, WatchResponse, NO_LEASE,
};

/// A network address plus opaque, JSON-encodable metadata.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Endpoint {
    pub addr: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Endpoint {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    Add,
    Delete,
}

/// One change to the directory. Deletes carry a default endpoint.
#[derive(Clone, Debug, PartialEq)]
pub struct Update {
    pub op: Operation,
    pub key: String,
    pub endpoint: Endpoint,
}

/// An [`Update`] plus write options.
#[derive(Clone, Debug, PartialEq)]
pub struct UpdateWithOpts {
    pub update: Update,
    pub lease: LeaseId,
}

impl UpdateWithOpts {
    pub fn add(key: impl Into<String>, endpoint: Endpoint) -> Self {
        Self {
            update: Update {
                op: Operation::Add,
                key: key.into(),
                endpoint,
            },
            lease: NO_LEASE,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self {
            update: Update {
                op: Operation::Delete,
                key: key.into(),
                endpoint: Endpoint::default(),
            },
            lease: NO_LEASE,
        }
    }

    /// Attaches an added endpoint to `lease`, so it disappears with it.
    pub fn with_lease(mut self, lease: LeaseId) -> Self {
        self.lease = lease;
        self
    }
}

#[derive(Serialize, Deserialize)]
struct StoredEndpoint {
    #[serde(rename = "Op")]
    op: u8,
    #[serde(flatten)]
    endpoint: Endpoint,
}

fn encode(endpoint: &Endpoint) -> EndpointResult<Vec<u8>> {
    let stored = StoredEndpoint {
        op: 0,
        endpoint: endpoint.clone(),
    };
    Ok(serde_json::to_vec(&stored)?)
}

fn decode(value: &[u8]) -> EndpointResult<Endpoint> {
    let stored: StoredEndpoint = serde_json::from_slice(value)?;
    Ok(stored.endpoint)
}

/// Batches of directory changes. Ends when the watch's scope is cancelled or
/// the underlying watch fails.
pub type WatchChannel = ReceiverStream<Vec<Update>>;

pub struct EndpointManager {
    client: Client,
    target: String,
}

impl EndpointManager {
    pub fn new(client: &Client, target: impl Into<String>) -> EndpointResult<Self> {
        let target = target.into();
        if target.is_empty() {
            return Err(EndpointError::InvalidTarget);
        }
        Ok(Self {
            client: client.clone(),
            target,
        })
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub async fn add_endpoint(&self, key: impl Into<String>, endpoint: Endpoint) -> EndpointResult<()> {
        self.update(vec![UpdateWithOpts::add(key, endpoint)]).await
    }

    pub async fn delete_endpoint(&self, key: impl Into<String>) -> EndpointResult<()> {
        self.update(vec![UpdateWithOpts::delete(key)]).await
    }

    /// Applies every update in one transaction.
    pub async fn update(&self, updates: Vec<UpdateWithOpts>) -> EndpointResult<()> {
        let mut ops = Vec::with_capacity(updates.len());
        for UpdateWithOpts { update, lease } in &updates {
            self.check_key(&update.key)?;
            ops.push(match update.op {
                Operation::Add => RequestOp::Put(
                    PutRequest::new(update.key.clone(), encode(&update.endpoint)?)
                        .with_lease(*lease),
                ),
                Operation::Delete => {
                    RequestOp::DeleteRange(DeleteRangeRequest::key(update.key.clone()))
                }
            });
        }

        self.client.txn(TxnRequest::new().and_then(ops)).await?;
        debug!(service = %self.target, updates = updates.len(), "endpoints updated");
        Ok(())
    }

    /// Current endpoints keyed by their full key.
    pub async fn list(&self) -> EndpointResult<BTreeMap<String, Endpoint>> {
        let resp = self.client.get_prefix(self.prefix()).await?;
        resp.kvs
            .iter()
            .map(|kv| Ok((key_string(kv), decode(&kv.value)?)))
            .collect()
    }

    /// Streams directory changes until `cancel` fires.
    ///
    /// The first batch is the current contents as `Add` updates, unless the
    /// directory is empty; later batches follow the store's commit order.
    pub async fn new_watch_channel(&self, cancel: CancellationToken) -> EndpointResult<WatchChannel> {
        let snapshot = self.client.get_prefix(self.prefix()).await?;
        let initial: Vec<Update> = snapshot
            .kvs
            .iter()
            .filter_map(|kv| added(kv, &self.target))
            .collect();

        let mut stream = self
            .client
            .watch(WatchRequest::prefix(self.prefix()).from_revision(snapshot.header.revision + 1))
            .await?;

        let (tx, rx) = mpsc::channel(1);
        let target = self.target.clone();
        tokio::spawn(async move {
            if !initial.is_empty() && tx.send(initial).await.is_err() {
                return;
            }

            let mut batcher = RevisionBatcher::default();
            loop {
                let resp = tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tx.closed() => break,
                    resp = stream.next() => resp,
                };

                let resp = match resp {
                    Some(Ok(resp)) => resp,
                    Some(Err(e)) => {
                        warn!(service = %target, error = %e, "endpoint watch failed");
                        break;
                    }
                    None => break,
                };

                for batch in batcher.push(&resp, &target) {
                    if tx.send(batch).await.is_err() {
                        return;
                    }
                }
            }
            debug!(service = %target, "endpoint watch closed");
        });

        Ok(ReceiverStream::new(rx))
    }

    fn prefix(&self) -> String {
        format!("{}/", self.target)
    }

    fn check_key(&self, key: &str) -> EndpointResult<()> {
        if key.len() <= self.target.len() + 1 || !key.starts_with(&self.prefix()) {
            return Err(EndpointError::KeyOutsideTarget {
                key: key.to_string(),
                target: self.target.clone(),
            });
        }
        Ok(())
    }
}

fn key_string(kv: &KeyValue) -> String {
    String::from_utf8_lossy(&kv.key).into_owned()
}

fn added(kv: &KeyValue, target: &str) -> Option<Update> {
    match decode(&kv.value) {
        Ok(endpoint) => Some(Update {
            op: Operation::Add,
            key: key_string(kv),
            endpoint,
        }),
        Err(e) => {
            warn!(service = %target, key = %key_string(kv), error = %e, "skipping undecodable endpoint");
            None
        }
    }
}

fn to_update(event: &Event, target: &str) -> Option<Update> {
    match event.event_type {
        EventType::Put => added(&event.kv, target),
        EventType::Delete => Some(Update {
            op: Operation::Delete,
            key: key_string(&event.kv),
            endpoint: Endpoint::default(),
        }),
    }
}

/// Regroups watch responses into one batch per revision. A revision split
/// across fragmented responses is held back until its last fragment.
#[derive(Default)]
struct RevisionBatcher {
    revision: i64,
    pending: Vec<Update>,
}

impl RevisionBatcher {
    fn push(&mut self, resp: &WatchResponse, target: &str) -> Vec<Vec<Update>> {
        let mut ready = Vec::new();

        for event in &resp.events {
            if event.kv.mod_revision != self.revision {
                self.flush(&mut ready);
                self.revision = event.kv.mod_revision;
            }
            if let Some(update) = to_update(event, target) {
                self.pending.push(update);
            }
        }
        if !resp.fragment {
            self.flush(&mut ready);
        }

        ready
    }

    fn flush(&mut self, ready: &mut Vec<Vec<Update>>) {
        if !self.pending.is_empty() {
            ready.push(std::mem::take(&mut self.pending));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: EventType, key: &str, revision: i64) -> Event {
        let value = match event_type {
            EventType::Put => encode(&Endpoint::new("127.0.0.1:2379")).unwrap(),
            EventType::Delete => Vec::new(),
        };
        Event {
            event_type,
            kv: KeyValue {
                key: key.as_bytes().to_vec(),
                mod_revision: revision,
                value,
                ..Default::default()
            },
            prev_kv: None,
        }
    }

    #[test]
    fn test_stored_format() {
        let endpoint = Endpoint::new("127.0.0.1").with_metadata(serde_json::json!("metadata"));
        let encoded = encode(&endpoint).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&encoded).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"Op": 0, "Addr": "127.0.0.1", "Metadata": "metadata"})
        );
        assert_eq!(decode(&encoded).unwrap(), endpoint);
    }

    #[test]
    fn test_decode_without_metadata() {
        let endpoint = decode(br#"{"Op":0,"Addr":"10.0.0.1:80"}"#).unwrap();
        assert_eq!(endpoint.addr, "10.0.0.1:80");
        assert!(endpoint.metadata.is_null());
        assert!(decode(b"not json").is_err());
    }

    #[test]
    fn test_batcher_splits_by_revision() {
        let mut batcher = RevisionBatcher::default();
        let resp = WatchResponse {
            events: vec![
                event(EventType::Put, "foo/a", 5),
                event(EventType::Delete, "foo/b", 5),
                event(EventType::Put, "foo/c", 6),
            ],
            ..Default::default()
        };

        let batches = batcher.push(&resp, "foo");
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[0][1].op, Operation::Delete);
        assert_eq!(batches[1].len(), 1);
    }

    #[test]
    fn test_batcher_joins_fragments() {
        let mut batcher = RevisionBatcher::default();
        let first = WatchResponse {
            events: vec![event(EventType::Put, "foo/a", 7)],
            fragment: true,
            ..Default::default()
        };
        let last = WatchResponse {
            events: vec![event(EventType::Put, "foo/b", 7)],
            ..Default::default()
        };

        assert!(batcher.push(&first, "foo").is_empty());
        let batches = batcher.push(&last, "foo");
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
    }

    #[test]
    fn test_batcher_skips_undecodable_puts() {
        let mut batcher = RevisionBatcher::default();
        let mut bad = event(EventType::Put, "foo/bad", 3);
        bad.kv.value = b"garbage".to_vec();
        let resp = WatchResponse {
            events: vec![bad],
            ..Default::default()
        };
        assert!(batcher.push(&resp, "foo").is_empty());
    }
}
