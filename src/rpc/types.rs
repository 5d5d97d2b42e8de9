//! Request and response messages exchanged with the lease and KV services.
//!
//! These mirror the etcd v3 API shapes closely enough that a gRPC transport can
//! map them one-to-one, while staying free of any generated code.

use std::pin::Pin;

use tokio::sync::mpsc;
use tokio_stream::Stream;

use super::RpcResult;

/// Server-assigned lease identifier.
pub type LeaseId = i64;

/// Lease id meaning "no lease attached".
pub const NO_LEASE: LeaseId = 0;

/// Largest TTL, in seconds, the lease service accepts.
pub const MAX_LEASE_TTL: i64 = 9_000_000_000;

/// Response header attached to every reply.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseHeader {
    pub cluster_id: u64,
    pub member_id: u64,
    pub revision: i64,
    pub raft_term: u64,
}

/// A key-value pair with MVCC metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub create_revision: i64,
    pub mod_revision: i64,
    pub version: i64,
    pub value: Vec<u8>,
    pub lease: LeaseId,
}

/// Event type for watch notifications.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

/// A single change within a watch response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Event {
    pub event_type: EventType,
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeaseGrantResponse {
    pub header: ResponseHeader,
    pub id: LeaseId,
    pub ttl: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeaseRevokeResponse {
    pub header: ResponseHeader,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeaseTimeToLiveResponse {
    pub header: ResponseHeader,
    pub id: LeaseId,
    /// Remaining seconds, or -1 when the lease is unknown or expired.
    pub ttl: i64,
    pub granted_ttl: i64,
    pub keys: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeaseStatus {
    pub id: LeaseId,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeaseLeasesResponse {
    pub header: ResponseHeader,
    pub leases: Vec<LeaseStatus>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LeaseKeepAliveRequest {
    pub id: LeaseId,
}

/// A renewal acknowledgment. `ttl <= 0` means the lease no longer exists.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeaseKeepAliveResponse {
    pub header: ResponseHeader,
    pub id: LeaseId,
    pub ttl: i64,
}

/// Boxed stream type used for server-to-client halves of duplex calls.
pub type BoxStream<T> = Pin<Box<dyn Stream<Item = T> + Send>>;

/// Client half of a keepalive duplex stream.
///
/// Dropping `requests` ends the stream from the client side. The response half
/// yields `Err` once when the stream fails and then terminates.
pub struct KeepAliveStream {
    pub requests: mpsc::Sender<LeaseKeepAliveRequest>,
    pub responses: BoxStream<RpcResult<LeaseKeepAliveResponse>>,
}

impl std::fmt::Debug for KeepAliveStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeepAliveStream")
            .field("requests_closed", &self.requests.is_closed())
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PutRequest {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub lease: LeaseId,
    pub prev_kv: bool,
}

impl PutRequest {
    pub fn new(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn with_lease(mut self, lease: LeaseId) -> Self {
        self.lease = lease;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PutResponse {
    pub header: ResponseHeader,
    pub prev_kv: Option<KeyValue>,
}

/// Range query over `[key, range_end)`. An empty `range_end` selects `key` only.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeRequest {
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
    /// Maximum number of keys returned; 0 means unlimited.
    pub limit: i64,
    pub count_only: bool,
}

impl RangeRequest {
    pub fn key(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn prefix(prefix: impl Into<Vec<u8>>) -> Self {
        let key = prefix.into();
        let range_end = prefix_end(&key);
        Self {
            key,
            range_end,
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RangeResponse {
    pub header: ResponseHeader,
    pub kvs: Vec<KeyValue>,
    pub count: i64,
    pub more: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteRangeRequest {
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
    pub prev_kv: bool,
}

impl DeleteRangeRequest {
    pub fn key(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn prefix(prefix: impl Into<Vec<u8>>) -> Self {
        let key = prefix.into();
        let range_end = prefix_end(&key);
        Self {
            key,
            range_end,
            ..Default::default()
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeleteRangeResponse {
    pub header: ResponseHeader,
    pub deleted: i64,
    pub prev_kvs: Vec<KeyValue>,
}

/// Comparison outcome required for a [`Compare`] to hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareResult {
    Equal,
    Greater,
    Less,
    NotEqual,
}

/// Field of the stored key compared against the operand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CompareTarget {
    Version(i64),
    CreateRevision(i64),
    ModRevision(i64),
    Value(Vec<u8>),
    Lease(LeaseId),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Compare {
    pub key: Vec<u8>,
    pub result: CompareResult,
    pub target: CompareTarget,
}

impl Compare {
    pub fn create_revision(key: impl Into<Vec<u8>>, result: CompareResult, rev: i64) -> Self {
        Self {
            key: key.into(),
            result,
            target: CompareTarget::CreateRevision(rev),
        }
    }

    pub fn mod_revision(key: impl Into<Vec<u8>>, result: CompareResult, rev: i64) -> Self {
        Self {
            key: key.into(),
            result,
            target: CompareTarget::ModRevision(rev),
        }
    }

    pub fn version(key: impl Into<Vec<u8>>, result: CompareResult, version: i64) -> Self {
        Self {
            key: key.into(),
            result,
            target: CompareTarget::Version(version),
        }
    }

    pub fn value(key: impl Into<Vec<u8>>, result: CompareResult, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            result,
            target: CompareTarget::Value(value.into()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RequestOp {
    Range(RangeRequest),
    Put(PutRequest),
    DeleteRange(DeleteRangeRequest),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResponseOp {
    Range(RangeResponse),
    Put(PutResponse),
    DeleteRange(DeleteRangeResponse),
}

/// Atomic compare-and-apply request. All writes commit at one revision.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxnRequest {
    pub compare: Vec<Compare>,
    pub success: Vec<RequestOp>,
    pub failure: Vec<RequestOp>,
}

impl TxnRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compare: Vec<Compare>) -> Self {
        self.compare = compare;
        self
    }

    pub fn and_then(mut self, ops: Vec<RequestOp>) -> Self {
        self.success = ops;
        self
    }

    pub fn or_else(mut self, ops: Vec<RequestOp>) -> Self {
        self.failure = ops;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TxnResponse {
    pub header: ResponseHeader,
    pub succeeded: bool,
    pub responses: Vec<ResponseOp>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WatchRequest {
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
    /// First revision to deliver; 0 means "from the next revision".
    pub start_revision: i64,
    pub prev_kv: bool,
}

impl WatchRequest {
    pub fn key(key: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            ..Default::default()
        }
    }

    pub fn prefix(prefix: impl Into<Vec<u8>>) -> Self {
        let key = prefix.into();
        let range_end = prefix_end(&key);
        Self {
            key,
            range_end,
            ..Default::default()
        }
    }

    pub fn from_revision(mut self, rev: i64) -> Self {
        self.start_revision = rev;
        self
    }
}

/// A batch of events. Events of one transaction share a `mod_revision`; a
/// response may carry several revisions, and `fragment` marks a revision that
/// continues in the next response.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WatchResponse {
    pub header: ResponseHeader,
    pub events: Vec<Event>,
    pub compact_revision: i64,
    pub fragment: bool,
    pub canceled: bool,
}

pub type WatchStream = BoxStream<RpcResult<WatchResponse>>;

/// Returns the range end that selects every key starting with `prefix`.
pub fn prefix_end(prefix: &[u8]) -> Vec<u8> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.last_mut() {
        if *last < 0xff {
            *last += 1;
            return end;
        }
        end.pop();
    }
    // every byte was 0xff: range to the end of the keyspace
    vec![0]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_end() {
        assert_eq!(prefix_end(b"foo/"), b"foo0".to_vec());
        assert_eq!(prefix_end(b"a\xff"), b"b".to_vec());
        assert_eq!(prefix_end(b"\xff\xff"), vec![0]);
        assert_eq!(prefix_end(b""), vec![0]);
    }

    #[test]
    fn test_prefix_request_isolates_sibling_names() {
        let req = RangeRequest::prefix("foo/");
        assert!(b"foo/a".as_slice() >= req.key.as_slice());
        assert!(b"foo/a".as_slice() < req.range_end.as_slice());
        assert!(b"foo_other/a".as_slice() >= req.range_end.as_slice());
    }
}
