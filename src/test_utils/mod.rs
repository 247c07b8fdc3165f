//! the test_utils folder here will share utils or test components between unit
//! tests
mod upstream;

pub(crate) use upstream::*;

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::watch::KeyRange;
use crate::watch::ServerStream;
use crate::watch::WatchCreateRequest;
use crate::watch::WatchResponse;
use crate::watch::Watcher;

pub(crate) const RECV_TIMEOUT: Duration = Duration::from_millis(500);

pub(crate) fn server_stream(
    id: u64,
    buffer: usize,
) -> (ServerStream, mpsc::Receiver<WatchResponse>) {
    let (tx, rx) = mpsc::channel(buffer);
    let stream = ServerStream::new(id, tx, CancellationToken::new(), Duration::from_millis(50));
    (stream, rx)
}

pub(crate) fn watcher_on(
    stream: &ServerStream,
    watch_id: i64,
    range: KeyRange,
) -> Watcher {
    Watcher::new(WatchCreateRequest::new(watch_id, range), stream.clone())
}

pub(crate) async fn recv(rx: &mut mpsc::Receiver<WatchResponse>) -> WatchResponse {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("Timeout waiting for watch response")
        .expect("Channel closed")
}

pub(crate) async fn assert_no_response(rx: &mut mpsc::Receiver<WatchResponse>) {
    let result = timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(result.is_err(), "Unexpected watch response: {:?}", result);
}
