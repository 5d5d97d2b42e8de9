//! N-party double barrier.
//!
//! Store layout under the barrier name `b`:
//!
//! - `b/waiters/<lease>-<uuid>`: one key per entrant, attached to the
//!   entrant's session lease so it disappears if the entrant dies.
//! - `b/ready`: written once the waiter count reaches the expected count;
//!   releases every entrant blocked in [`DoubleBarrier::enter`].
//!
//! Entrants are ranked by the create revision of their waiter key. The entrant
//! ranked last within the count writes the ready marker; anyone ranked beyond
//! it removes its key again and gets [`RecipeError::TooManyClients`].

use std::collections::HashSet;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{wait_events, RecipeError, RecipeResult};
use crate::concurrency::Session;
use crate::rpc::{
    Compare, CompareResult, DeleteRangeRequest, EventType, PutRequest, RangeRequest, RequestOp,
    ResponseOp, RpcError, TxnRequest, WatchRequest,
};

pub struct DoubleBarrier {
    session: Session,
    name: String,
    count: usize,
    /// Our waiter key and its create revision, once entered.
    entered: Option<(Vec<u8>, i64)>,
    /// Create revision of the ready marker of the round we entered.
    ready_revision: i64,
}

impl DoubleBarrier {
    pub fn new(session: &Session, name: impl Into<String>, count: usize) -> Self {
        Self {
            session: session.clone(),
            name: name.into(),
            count,
            entered: None,
            ready_revision: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_entered(&self) -> bool {
        self.entered.is_some()
    }

    /// Blocks until `count` entrants have entered.
    pub async fn enter(&mut self) -> RecipeResult<()> {
        self.enter_with(&CancellationToken::new()).await
    }

    /// Like [`enter`](Self::enter), giving up when `cancel` fires. An abandoned
    /// entry removes its own waiter key.
    pub async fn enter_with(&mut self, cancel: &CancellationToken) -> RecipeResult<()> {
        if self.entered.is_some() {
            return Ok(());
        }
        if self.session.is_done() {
            return Err(RecipeError::SessionExpired);
        }

        self.check_capacity().await?;

        let (key, revision) = self.create_waiter().await?;
        match self.await_ready(&key, revision, cancel).await {
            Ok(ready_revision) => {
                debug!(barrier = %self.name, revision, "entered double barrier");
                self.ready_revision = ready_revision;
                self.entered = Some((key, revision));
                Ok(())
            }
            Err(e) => {
                self.remove_waiter(&key).await;
                Err(e)
            }
        }
    }

    /// Blocks until every entrant has left. Leaving a barrier that was never
    /// entered is a no-op.
    pub async fn leave(&mut self) -> RecipeResult<()> {
        self.leave_with(&CancellationToken::new()).await
    }

    pub async fn leave_with(&mut self, cancel: &CancellationToken) -> RecipeResult<()> {
        let Some((key, _)) = self.entered.take() else {
            return Ok(());
        };
        let client = self.session.client();

        client.delete(key).await?;

        let resp = client.get_prefix(self.waiters_prefix()).await?;
        if !resp.kvs.is_empty() {
            let mut remaining: HashSet<Vec<u8>> =
                resp.kvs.into_iter().map(|kv| kv.key).collect();
            let req = WatchRequest::prefix(self.waiters_prefix())
                .from_revision(resp.header.revision + 1);

            wait_events(client, req, cancel, None, |event| {
                match event.event_type {
                    EventType::Delete => {
                        remaining.remove(&event.kv.key);
                    }
                    EventType::Put => {
                        remaining.insert(event.kv.key.clone());
                    }
                }
                remaining.is_empty()
            })
            .await?;
        }

        // only this round's marker; a later round may already have written its own
        let clear_ready = TxnRequest::new()
            .when(vec![Compare::create_revision(
                self.ready_key(),
                CompareResult::Equal,
                self.ready_revision,
            )])
            .and_then(vec![RequestOp::DeleteRange(DeleteRangeRequest::key(
                self.ready_key(),
            ))]);
        client.txn(clear_ready).await?;

        debug!(barrier = %self.name, "left double barrier");
        self.ready_revision = 0;
        Ok(())
    }

    fn waiters_prefix(&self) -> String {
        format!("{}/waiters/", self.name)
    }

    fn ready_key(&self) -> String {
        format!("{}/ready", self.name)
    }

    /// Rejects an entry that could never be admitted without touching the store.
    async fn check_capacity(&self) -> RecipeResult<()> {
        let snapshot = TxnRequest::new().and_then(vec![
            RequestOp::Range(RangeRequest::key(self.ready_key())),
            RequestOp::Range(RangeRequest {
                count_only: true,
                ..RangeRequest::prefix(self.waiters_prefix())
            }),
        ]);
        let resp = self.session.client().txn(snapshot).await?;

        let mut counts = resp.responses.iter().map(|op| match op {
            ResponseOp::Range(range) => range.count,
            _ => 0,
        });
        let ready = counts.next().unwrap_or(0);
        let waiters = counts.next().unwrap_or(0);

        if ready > 0 || waiters >= self.count as i64 {
            debug!(barrier = %self.name, waiters, "double barrier is full");
            return Err(RecipeError::TooManyClients);
        }
        Ok(())
    }

    async fn create_waiter(&self) -> RecipeResult<(Vec<u8>, i64)> {
        let key = format!(
            "{}{:x}-{}",
            self.waiters_prefix(),
            self.session.lease(),
            Uuid::new_v4()
        )
        .into_bytes();

        let create = TxnRequest::new()
            .when(vec![Compare::create_revision(
                key.clone(),
                CompareResult::Equal,
                0,
            )])
            .and_then(vec![RequestOp::Put(
                PutRequest::new(key.clone(), Vec::new()).with_lease(self.session.lease()),
            )]);

        let resp = match self.session.client().txn(create).await {
            Ok(resp) => resp,
            Err(RpcError::LeaseNotFound) => return Err(RecipeError::SessionExpired),
            Err(e) => return Err(e.into()),
        };
        if !resp.succeeded {
            return Err(RecipeError::Rpc(RpcError::Internal(
                "waiter key already exists".to_string(),
            )));
        }

        Ok((key, resp.header.revision))
    }

    /// Waits for the ready marker and returns its create revision.
    async fn await_ready(
        &self,
        key: &[u8],
        revision: i64,
        cancel: &CancellationToken,
    ) -> RecipeResult<i64> {
        let client = self.session.client();

        let mut waiters = client.get_prefix(self.waiters_prefix()).await?.kvs;
        waiters.sort_by_key(|kv| kv.create_revision);
        let rank = waiters
            .iter()
            .position(|kv| kv.key == key)
            .ok_or(RecipeError::SessionExpired)?;

        if rank >= self.count {
            debug!(barrier = %self.name, rank, "entered past capacity");
            return Err(RecipeError::TooManyClients);
        }

        if rank + 1 == self.count {
            let mark = TxnRequest::new()
                .when(vec![Compare::create_revision(
                    self.ready_key(),
                    CompareResult::Equal,
                    0,
                )])
                .and_then(vec![RequestOp::Put(PutRequest::new(
                    self.ready_key(),
                    Vec::new(),
                ))])
                .or_else(vec![RequestOp::Range(RangeRequest::key(self.ready_key()))]);
            let resp = client.txn(mark).await?;

            if resp.succeeded {
                return Ok(resp.header.revision);
            }
            if let Some(ResponseOp::Range(range)) = resp.responses.first() {
                if let Some(ready) = range.kvs.first() {
                    return Ok(ready.create_revision);
                }
            }
        }

        let ready_key = self.ready_key().into_bytes();
        let mut ready_revision = 0;
        let done = self.session.done_token();
        wait_events(
            client,
            WatchRequest::key(ready_key.clone()).from_revision(revision),
            cancel,
            Some(&done),
            |event| {
                if event.event_type == EventType::Put && event.kv.key == ready_key {
                    ready_revision = event.kv.create_revision;
                    return true;
                }
                false
            },
        )
        .await?;

        Ok(ready_revision)
    }

    async fn remove_waiter(&self, key: &[u8]) {
        if let Err(e) = self.session.client().delete(key.to_vec()).await {
            warn!(barrier = %self.name, error = %e, "failed to remove abandoned waiter key");
        }
    }
}
