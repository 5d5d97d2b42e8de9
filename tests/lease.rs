//! Lease keepalive behaviour against the embedded cluster.

mod common;

use std::time::Duration;

use rusd_client::lease::KeepAliveChannel;
use rusd_client::rpc::MAX_LEASE_TTL;
use rusd_client::{ClientConfig, KeepAliveConfig, LeaseError, TrackOptions};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

fn drain(ch: &mut KeepAliveChannel) {
    while ch.try_recv().is_ok() {}
}

async fn closes_within(ch: &mut KeepAliveChannel, window: Duration) -> bool {
    timeout(window, async { while ch.recv().await.is_some() {} })
        .await
        .is_ok()
}

#[tokio::test(start_paused = true)]
async fn test_undrained_channel_keeps_renewal_cadence() -> anyhow::Result<()> {
    let config = ClientConfig::default()
        .with_keep_alive(KeepAliveConfig::default().with_response_channel_size(1));
    let (cluster, client) = common::start_with(config);

    let lease = client.lease().grant(30).await?;
    let ch = client
        .lease()
        .keep_alive(lease.id, CancellationToken::new())
        .await?;

    sleep(Duration::from_secs(3)).await;
    let ttl = client.lease().time_to_live(lease.id, false).await?;
    assert!(
        (26..=28).contains(&ttl.ttl),
        "expected one renewal at registration, remaining ttl {}",
        ttl.ttl
    );
    assert_eq!(cluster.keep_alive_requests(lease.id), 1);

    // renewals continue every ttl/3 even though nobody reads
    sleep(Duration::from_secs(22)).await;
    let requests = cluster.keep_alive_requests(lease.id);
    assert!((3..=4).contains(&requests), "got {} renewals", requests);
    assert_eq!(ch.len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_many_leases_share_one_stream() -> anyhow::Result<()> {
    let (cluster, client) = common::start();

    // far more leases than the stream buffers requests for
    let mut channels = Vec::new();
    for _ in 0..200 {
        let lease = client.lease().grant(6).await?;
        channels.push(
            client
                .lease()
                .keep_alive(lease.id, CancellationToken::new())
                .await?,
        );
    }

    sleep(Duration::from_secs(30)).await;
    assert_eq!(cluster.lease_count(), 200);
    for ch in channels.iter_mut() {
        let id = ch.lease();
        let last = loop {
            match ch.try_recv() {
                Ok(_) => continue,
                Err(e) => break e,
            }
        };
        assert_eq!(last, TryRecvError::Empty, "channel of lease {} closed", id);
        assert!(client.lease().time_to_live(id, false).await?.ttl > 0);
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_revoking_one_lease_leaves_others_alive() -> anyhow::Result<()> {
    let (_cluster, client) = common::start();

    let a = client.lease().grant(9).await?;
    let b = client.lease().grant(9).await?;
    let mut ch_a = client.lease().keep_alive(a.id, CancellationToken::new()).await?;
    let mut ch_b = client.lease().keep_alive(b.id, CancellationToken::new()).await?;
    assert_eq!(ch_a.recv().await.map(|r| r.id), Some(a.id));

    client.lease().revoke(b.id).await?;
    // the next renewal of b is answered with ttl 0
    assert!(closes_within(&mut ch_b, Duration::from_secs(5)).await);

    drain(&mut ch_a);
    let resp = timeout(Duration::from_secs(5), ch_a.recv()).await?;
    assert_eq!(resp.map(|r| r.id), Some(a.id));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_require_leader_closes_on_leader_loss() -> anyhow::Result<()> {
    let (cluster, client) = common::start();

    let strict_lease = client.lease().grant(10).await?;
    let tolerant_lease = client.lease().grant(10).await?;
    let mut strict = client
        .lease()
        .keep_alive_with(
            strict_lease.id,
            TrackOptions::require_leader(),
            CancellationToken::new(),
        )
        .await?;
    let mut tolerant = client
        .lease()
        .keep_alive(tolerant_lease.id, CancellationToken::new())
        .await?;
    assert!(strict.recv().await.is_some());
    assert!(tolerant.recv().await.is_some());

    cluster.lose_leader();
    assert!(closes_within(&mut strict, Duration::from_secs(2)).await);

    sleep(Duration::from_secs(3)).await;
    drain(&mut tolerant);
    cluster.restore_leader();

    let resp = timeout(Duration::from_secs(6), tolerant.recv()).await?;
    assert_eq!(resp.map(|r| r.id), Some(tolerant_lease.id));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_close_shuts_every_channel_and_rejects_calls() -> anyhow::Result<()> {
    let (_cluster, client) = common::start();

    let mut channels = Vec::new();
    for _ in 0..3 {
        let lease = client.lease().grant(20).await?;
        channels.push(
            client
                .lease()
                .keep_alive(lease.id, CancellationToken::new())
                .await?,
        );
    }

    client.close().await;
    for ch in channels.iter_mut() {
        assert!(closes_within(ch, Duration::from_millis(100)).await);
    }

    let err = client
        .lease()
        .keep_alive(1, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, LeaseError::KeepAliveHalted { .. }));
    assert_eq!(client.lease().grant(10).await.unwrap_err(), LeaseError::Canceled);
    assert!(client.get("k").await.is_err());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_once() -> anyhow::Result<()> {
    let (_cluster, client) = common::start();

    let lease = client.lease().grant(10).await?;
    let resp = client.lease().keep_alive_once(lease.id).await?;
    assert_eq!(resp.id, lease.id);
    assert_eq!(resp.ttl, 10);

    client.lease().revoke(lease.id).await?;
    assert_eq!(
        client.lease().keep_alive_once(lease.id).await.unwrap_err(),
        LeaseError::NotFound
    );
    assert_eq!(
        client.lease().keep_alive_once(0).await.unwrap_err(),
        LeaseError::NotFound
    );
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_grant_rejects_oversized_ttl() {
    let (_cluster, client) = common::start();
    let err = client.lease().grant(MAX_LEASE_TTL + 1).await.unwrap_err();
    assert_eq!(err, LeaseError::TtlTooLarge);
}

#[tokio::test(start_paused = true)]
async fn test_time_to_live_and_list() -> anyhow::Result<()> {
    let (_cluster, client) = common::start();

    let lease = client.lease().grant(10).await?;
    let other = client.lease().grant(10).await?;
    client.put_with_lease("lease/b", "2", lease.id).await?;
    client.put_with_lease("lease/a", "1", lease.id).await?;

    let ttl = client.lease().time_to_live(lease.id, true).await?;
    assert_eq!(ttl.granted_ttl, 10);
    assert_eq!(ttl.keys, vec![b"lease/a".to_vec(), b"lease/b".to_vec()]);

    let ids: Vec<i64> = client
        .lease()
        .leases()
        .await?
        .leases
        .iter()
        .map(|status| status.id)
        .collect();
    assert_eq!(ids, vec![lease.id, other.id]);

    client.lease().revoke(lease.id).await?;
    assert_eq!(client.lease().time_to_live(lease.id, false).await?.ttl, -1);
    assert!(client.get_prefix("lease/").await?.kvs.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_first_response_timeout_on_stopped_member() -> anyhow::Result<()> {
    let (cluster, client) = common::start();

    let lease = client.lease().grant(10).await?;
    cluster.stop();

    let mut ch = client
        .lease()
        .keep_alive(lease.id, CancellationToken::new())
        .await?;
    assert!(!closes_within(&mut ch, Duration::from_secs(4)).await);
    assert!(closes_within(&mut ch, Duration::from_secs(2)).await);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_ttl_deadline_on_stopped_member() -> anyhow::Result<()> {
    let (cluster, client) = common::start();

    let lease = client.lease().grant(3).await?;
    let mut ch = client
        .lease()
        .keep_alive(lease.id, CancellationToken::new())
        .await?;
    assert!(ch.recv().await.is_some());

    cluster.stop();
    assert!(closes_within(&mut ch, Duration::from_secs(4)).await);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_revoked_during_outage_closes_on_reconnect() -> anyhow::Result<()> {
    let (cluster, client) = common::start();
    let admin = common::connect(&cluster);

    let lease = client.lease().grant(30).await?;
    let mut ch = client
        .lease()
        .keep_alive(lease.id, CancellationToken::new())
        .await?;
    assert!(ch.recv().await.is_some());

    // break the stream, then revoke before the client reconnects
    cluster.stop();
    cluster.restart();
    admin.lease().revoke(lease.id).await?;

    // the first renewal on the new stream is answered with ttl 0, well before
    // the 30s deadline
    assert!(closes_within(&mut ch, Duration::from_secs(12)).await);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_renewals_survive_stream_restart() -> anyhow::Result<()> {
    let (cluster, client) = common::start();

    let lease = client.lease().grant(6).await?;
    let mut ch = client
        .lease()
        .keep_alive(lease.id, CancellationToken::new())
        .await?;
    assert!(ch.recv().await.is_some());

    cluster.stop();
    sleep(Duration::from_millis(300)).await;
    cluster.restart();

    sleep(Duration::from_secs(20)).await;
    let ttl = client.lease().time_to_live(lease.id, false).await?;
    assert!(ttl.ttl > 0);
    drain(&mut ch);
    assert!(timeout(Duration::from_secs(3), ch.recv()).await?.is_some());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_cancelling_one_consumer_keeps_the_other() -> anyhow::Result<()> {
    let (_cluster, client) = common::start();

    let lease = client.lease().grant(30).await?;
    let first_scope = CancellationToken::new();
    let second_scope = CancellationToken::new();
    let mut first = client.lease().keep_alive(lease.id, first_scope).await?;
    let mut second = client
        .lease()
        .keep_alive(lease.id, second_scope.clone())
        .await?;

    second_scope.cancel();
    assert!(closes_within(&mut second, Duration::from_secs(1)).await);

    drain(&mut first);
    let resp = timeout(Duration::from_secs(12), first.recv()).await?;
    assert_eq!(resp.map(|r| r.id), Some(lease.id));
    assert_eq!(client.lease().multiplexer().tracked().await?, vec![lease.id]);
    Ok(())
}
