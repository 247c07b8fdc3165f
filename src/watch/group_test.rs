//! Unit tests for WatcherGroup membership and fan-out

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::*;
use crate::test_utils::assert_no_response;
use crate::test_utils::recv;
use crate::test_utils::server_stream;
use crate::test_utils::watcher_on;
use crate::WatchError;

fn range() -> KeyRange {
    KeyRange::new("foo", "fop")
}

/// Group fed by a test-owned upstream channel
fn started_group() -> (Arc<WatcherGroup>, mpsc::Sender<WatchResponse>, CancellationToken) {
    let token = CancellationToken::new();
    let (tx, rx) = mpsc::channel(16);
    let group = WatcherGroup::new(range(), token.clone(), UNINITIALIZED_REVISION);
    group.start(stream_from_receiver(rx, token.clone()));
    (group, tx, token)
}

#[tokio::test]
async fn test_add_returns_current_revision() {
    let (group, tx, _token) = started_group();
    let (stream, mut rx) = server_stream(1, 8);

    let rev = group.members().await.add(ReceiverId::new(1, 1), watcher_on(&stream, 1, range())).unwrap();
    assert_eq!(rev, UNINITIALIZED_REVISION);

    tx.send(WatchResponse::created(5, 77)).await.unwrap();
    let resp = recv(&mut rx).await;
    assert!(resp.created);
    assert_eq!(resp.watch_id, 1);
    assert_eq!(group.revision().await, 5);

    let (stream2, _rx2) = server_stream(2, 8);
    let rev = group.members().await.add(ReceiverId::new(2, 1), watcher_on(&stream2, 1, range())).unwrap();
    assert_eq!(rev, 5);
    assert_eq!(group.len().await, 2);
}

#[tokio::test]
async fn test_add_rejected_after_stop() {
    let (group, _tx, token) = started_group();

    group.stop().await;
    group.stop().await;
    assert!(token.is_cancelled());
    assert!(group.is_stopped().await);

    let (stream, _rx) = server_stream(1, 8);
    let err = group
        .members()
        .await
        .add(ReceiverId::new(1, 1), watcher_on(&stream, 1, range()))
        .unwrap_err();
    assert!(matches!(err, crate::Error::Watch(WatchError::GroupStopped { .. })));
    assert!(group.is_empty().await);
}

#[tokio::test]
async fn test_delete_is_noop_for_unknown_receiver() {
    let (group, _tx, _token) = started_group();
    let (stream, _rx) = server_stream(1, 8);
    let rid = ReceiverId::new(1, 1);

    let mut members = group.members().await;
    members.add(rid, watcher_on(&stream, 1, range())).unwrap();
    members.delete(&ReceiverId::new(1, 2));
    assert!(members.contains(&rid));
    members.delete(&rid);
    assert!(members.is_empty());
}

#[tokio::test]
async fn test_broadcast_reaches_every_member_in_order() {
    let (group, tx, _token) = started_group();
    let (s1, mut rx1) = server_stream(1, 16);
    let (s2, mut rx2) = server_stream(2, 16);
    {
        let mut members = group.members().await;
        members.add(ReceiverId::new(1, 10), watcher_on(&s1, 10, range())).unwrap();
        members.add(ReceiverId::new(2, 20), watcher_on(&s2, 20, range())).unwrap();
    }

    tx.send(WatchResponse::created(3, 0)).await.unwrap();
    for rev in 4..=6 {
        tx.send(WatchResponse::with_events(rev, vec![Event::put("foo", "v", rev)]))
            .await
            .unwrap();
    }

    for (rx, watch_id) in [(&mut rx1, 10), (&mut rx2, 20)] {
        let created = recv(rx).await;
        assert!(created.created);
        assert_eq!(created.watch_id, watch_id);
        let revs: Vec<i64> = [recv(rx).await, recv(rx).await, recv(rx).await]
            .iter()
            .map(|r| r.revision())
            .collect();
        assert_eq!(revs, vec![4, 5, 6]);
    }
}

#[tokio::test]
async fn test_revision_never_decreases() {
    let (group, tx, _token) = started_group();
    let (stream, mut rx) = server_stream(1, 16);
    group
        .members()
        .await
        .add(ReceiverId::new(1, 1), watcher_on(&stream, 1, range()))
        .unwrap();

    tx.send(WatchResponse::progress(9)).await.unwrap();
    recv(&mut rx).await;
    tx.send(WatchResponse::progress(4)).await.unwrap();
    // Wait until the fan-out task has consumed the stale marker
    tx.send(WatchResponse::progress(9)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(group.revision().await, 9);
}

#[tokio::test]
async fn test_stalled_member_does_not_block_others() {
    let (group, tx, _token) = started_group();
    // Stalled receiver: capacity 1, never read
    let (stalled, _stalled_rx) = server_stream(1, 1);
    let (healthy, mut healthy_rx) = server_stream(2, 16);
    {
        let mut members = group.members().await;
        members.add(ReceiverId::new(1, 1), watcher_on(&stalled, 1, range())).unwrap();
        members.add(ReceiverId::new(2, 1), watcher_on(&healthy, 1, range())).unwrap();
    }

    for rev in 1..=4 {
        tx.send(WatchResponse::progress(rev)).await.unwrap();
    }
    for rev in 1..=4 {
        assert_eq!(recv(&mut healthy_rx).await.revision(), rev);
    }
    assert!(stalled.is_canceled());
    assert!(!healthy.is_canceled());
}

#[tokio::test]
async fn test_stop_terminates_fan_out_task() {
    let (group, _tx, _token) = started_group();

    group.stop().await;
    timeout(Duration::from_millis(200), group.wait())
        .await
        .expect("fan-out task should exit after stop");
}

#[tokio::test]
async fn test_upstream_end_marks_group_stopped() {
    let (group, tx, token) = started_group();
    let (stream, mut rx) = server_stream(1, 8);
    let rid = ReceiverId::new(1, 1);
    group.members().await.add(rid, watcher_on(&stream, 1, range())).unwrap();

    drop(tx);
    timeout(Duration::from_millis(200), group.wait())
        .await
        .expect("fan-out task should exit when upstream ends");

    assert!(group.is_stopped().await);
    assert!(token.is_cancelled());
    // Receivers stay until the registry removes them
    assert!(group.contains(&rid).await);
    assert_no_response(&mut rx).await;
}
