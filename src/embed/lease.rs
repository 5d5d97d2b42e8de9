//! Lease table with heap-ordered expiry.
//!
//! Expired leases are not removed lazily on access: the cluster's expiry loop
//! drains [`LeaseManager::take_expired`] so that attached keys are deleted in
//! the same revision as the lease disappears.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::rpc::{LeaseId, RpcError, RpcResult, MAX_LEASE_TTL, NO_LEASE};

#[derive(Clone, Debug)]
pub struct Lease {
    pub id: LeaseId,
    pub granted_ttl: i64,
    pub expires_at: Instant,
}

impl Lease {
    /// Remaining whole seconds, never negative.
    pub fn remaining_ttl(&self, now: Instant) -> i64 {
        self.expires_at.saturating_duration_since(now).as_secs() as i64
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
struct LeaseExpiry {
    expires_at: Instant,
    lease_id: LeaseId,
}

/// A lease removed by expiry together with the keys it carried.
#[derive(Debug, Clone)]
pub struct ExpiredLease {
    pub lease_id: LeaseId,
    pub keys: Vec<Vec<u8>>,
}

pub struct LeaseManager {
    leases: RwLock<HashMap<LeaseId, Lease>>,
    lease_keys: RwLock<HashMap<LeaseId, HashSet<Vec<u8>>>>,
    next_lease_id: AtomicI64,
    /// Min-heap of expiry candidates; stale entries are skipped on pop.
    expiry_queue: RwLock<BinaryHeap<Reverse<LeaseExpiry>>>,
}

impl Default for LeaseManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseManager {
    pub fn new() -> Self {
        LeaseManager {
            leases: RwLock::new(HashMap::new()),
            lease_keys: RwLock::new(HashMap::new()),
            next_lease_id: AtomicI64::new(1),
            expiry_queue: RwLock::new(BinaryHeap::new()),
        }
    }

    /// Grants a lease. `id == 0` picks the next free id.
    pub fn grant(&self, id: LeaseId, ttl: i64) -> RpcResult<Lease> {
        if ttl <= 0 {
            return Err(RpcError::InvalidArgument(format!(
                "TTL must be positive, got {}",
                ttl
            )));
        }
        if ttl > MAX_LEASE_TTL {
            return Err(RpcError::LeaseTtlTooLarge);
        }

        let mut leases = self.leases.write();

        let lease_id = if id == NO_LEASE {
            loop {
                let candidate = self.next_lease_id.fetch_add(1, Ordering::SeqCst);
                if !leases.contains_key(&candidate) {
                    break candidate;
                }
            }
        } else if leases.contains_key(&id) {
            return Err(RpcError::InvalidArgument(format!(
                "lease {} already exists",
                id
            )));
        } else {
            id
        };

        let lease = Lease {
            id: lease_id,
            granted_ttl: ttl,
            expires_at: Instant::now() + Duration::from_secs(ttl as u64),
        };
        leases.insert(lease_id, lease.clone());
        self.lease_keys.write().insert(lease_id, HashSet::new());
        self.schedule(&lease);

        debug!(lease_id, ttl, "lease granted");
        Ok(lease)
    }

    /// Removes a lease and returns its attached keys.
    pub fn revoke(&self, id: LeaseId) -> RpcResult<Vec<Vec<u8>>> {
        if self.leases.write().remove(&id).is_none() {
            return Err(RpcError::LeaseNotFound);
        }
        let keys = self.take_keys(id);
        debug!(lease_id = id, key_count = keys.len(), "lease revoked");
        Ok(keys)
    }

    /// Resets the lease's expiry to its granted TTL and returns that TTL.
    pub fn renew(&self, id: LeaseId) -> Option<i64> {
        let mut leases = self.leases.write();
        let lease = leases.get_mut(&id)?;
        lease.expires_at = Instant::now() + Duration::from_secs(lease.granted_ttl as u64);
        let ttl = lease.granted_ttl;
        let lease = lease.clone();
        drop(leases);

        self.schedule(&lease);
        Some(ttl)
    }

    /// Renews every lease, used when a stalled expiry clock resumes.
    pub fn refresh_all(&self) {
        let ids: Vec<LeaseId> = self.leases.read().keys().copied().collect();
        for id in ids {
            self.renew(id);
        }
    }

    pub fn contains(&self, id: LeaseId) -> bool {
        self.leases.read().contains_key(&id)
    }

    pub fn attach(&self, lease_id: LeaseId, key: Vec<u8>) -> RpcResult<()> {
        match self.lease_keys.write().get_mut(&lease_id) {
            Some(keys) => {
                keys.insert(key);
                Ok(())
            }
            None => Err(RpcError::LeaseNotFound),
        }
    }

    pub fn detach(&self, lease_id: LeaseId, key: &[u8]) {
        if let Some(keys) = self.lease_keys.write().get_mut(&lease_id) {
            keys.remove(key);
        }
    }

    /// `(remaining, granted, keys)` for a live lease.
    pub fn time_to_live(&self, id: LeaseId) -> Option<(i64, i64, Vec<Vec<u8>>)> {
        let (ttl, granted_ttl) = {
            let leases = self.leases.read();
            let lease = leases.get(&id)?;
            (lease.remaining_ttl(Instant::now()), lease.granted_ttl)
        };

        let mut keys: Vec<Vec<u8>> = self
            .lease_keys
            .read()
            .get(&id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        keys.sort();

        Some((ttl, granted_ttl, keys))
    }

    /// Live lease ids in ascending order.
    pub fn list(&self) -> Vec<LeaseId> {
        let mut ids: Vec<LeaseId> = self.leases.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Removes and returns every lease whose expiry is at or before `now`.
    pub fn take_expired(&self, now: Instant) -> Vec<ExpiredLease> {
        let mut expired = Vec::new();
        let mut queue = self.expiry_queue.write();

        while let Some(Reverse(next)) = queue.peek().copied() {
            if next.expires_at > now {
                break;
            }
            queue.pop();

            let mut leases = self.leases.write();
            // a renewal pushed a later entry; this one is stale
            let due = leases
                .get(&next.lease_id)
                .is_some_and(|lease| lease.expires_at <= now);
            if !due {
                continue;
            }
            leases.remove(&next.lease_id);
            drop(leases);

            let keys = self.take_keys(next.lease_id);
            debug!(lease_id = next.lease_id, key_count = keys.len(), "lease expired");
            expired.push(ExpiredLease {
                lease_id: next.lease_id,
                keys,
            });
        }

        expired
    }

    pub fn count(&self) -> usize {
        self.leases.read().len()
    }

    fn schedule(&self, lease: &Lease) {
        self.expiry_queue.write().push(Reverse(LeaseExpiry {
            expires_at: lease.expires_at,
            lease_id: lease.id,
        }));
    }

    fn take_keys(&self, id: LeaseId) -> Vec<Vec<u8>> {
        let mut keys: Vec<Vec<u8>> = self
            .lease_keys
            .write()
            .remove(&id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        keys.sort();
        keys
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_grant_and_revoke() {
        let manager = LeaseManager::new();

        let lease = manager.grant(0, 30).unwrap();
        assert!(lease.id > 0);
        assert_eq!(lease.granted_ttl, 30);

        let revoked_keys = manager.revoke(lease.id).unwrap();
        assert!(revoked_keys.is_empty());
        assert_eq!(manager.revoke(lease.id), Err(RpcError::LeaseNotFound));
    }

    #[tokio::test(start_paused = true)]
    async fn test_grant_validates_ttl() {
        let manager = LeaseManager::new();
        assert!(matches!(
            manager.grant(0, 0),
            Err(RpcError::InvalidArgument(_))
        ));
        assert_eq!(
            manager.grant(0, MAX_LEASE_TTL + 1).unwrap_err(),
            RpcError::LeaseTtlTooLarge
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_detach() {
        let manager = LeaseManager::new();

        let lease = manager.grant(0, 30).unwrap();
        manager.attach(lease.id, b"key2".to_vec()).unwrap();
        manager.attach(lease.id, b"key1".to_vec()).unwrap();

        let (_, _, keys) = manager.time_to_live(lease.id).unwrap();
        assert_eq!(keys, vec![b"key1".to_vec(), b"key2".to_vec()]);

        manager.detach(lease.id, b"key1");
        let (_, _, keys) = manager.time_to_live(lease.id).unwrap();
        assert_eq!(keys.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_postpones_expiry() {
        let manager = LeaseManager::new();
        let lease = manager.grant(0, 10).unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(manager.renew(lease.id), Some(10));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(manager.take_expired(Instant::now()).is_empty());
        let (remaining, granted, _) = manager.time_to_live(lease.id).unwrap();
        assert_eq!(granted, 10);
        assert!((3..=4).contains(&remaining));
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_expired_returns_keys() {
        let manager = LeaseManager::new();
        let lease = manager.grant(0, 1).unwrap();
        manager.attach(lease.id, b"key".to_vec()).unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;
        let expired = manager.take_expired(Instant::now());
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].lease_id, lease.id);
        assert_eq!(expired[0].keys, vec![b"key".to_vec()]);
        assert_eq!(manager.count(), 0);
        assert!(manager.time_to_live(lease.id).is_none());
    }
}
