#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use d_engine_proxy::watch::stream_from_receiver;
use d_engine_proxy::watch::KeyRange;
use d_engine_proxy::watch::ServerStream;
use d_engine_proxy::watch::UpstreamStream;
use d_engine_proxy::watch::WatchCreateRequest;
use d_engine_proxy::watch::WatchOptions;
use d_engine_proxy::watch::WatchResponse;
use d_engine_proxy::watch::WatchSource;
use d_engine_proxy::watch::Watcher;
use d_engine_proxy::watch::WatcherGroups;
use d_engine_proxy::WatchProxyConfig;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

pub const RECV_TIMEOUT: Duration = Duration::from_millis(1000);

/// Upstream subscription opened by [`FakeStore`]; tests push responses into it.
#[derive(Debug, Clone)]
pub struct Upstream {
    pub key: Bytes,
    pub options: WatchOptions,
    pub token: CancellationToken,
    tx: mpsc::Sender<WatchResponse>,
}

impl Upstream {
    pub async fn push(
        &self,
        resp: WatchResponse,
    ) {
        self.tx.send(resp).await.expect("upstream stream dropped");
    }

    /// Best effort push for subscriptions that may already be torn down.
    pub fn offer(
        &self,
        resp: WatchResponse,
    ) -> bool {
        self.tx.try_send(resp).is_ok()
    }
}

/// Store stand-in that records every watch opened against it.
#[derive(Debug, Clone, Default)]
pub struct FakeStore {
    opened: Arc<Mutex<Vec<Upstream>>>,
}

impl FakeStore {
    pub fn opened(&self) -> usize {
        self.opened.lock().len()
    }

    pub fn upstream(
        &self,
        index: usize,
    ) -> Upstream {
        self.opened.lock()[index].clone()
    }

    pub fn upstreams(&self) -> Vec<Upstream> {
        self.opened.lock().clone()
    }
}

impl WatchSource for FakeStore {
    fn watch(
        &self,
        token: CancellationToken,
        key: Bytes,
        options: WatchOptions,
    ) -> UpstreamStream {
        let (tx, rx) = mpsc::channel(256);
        self.opened.lock().push(Upstream {
            key,
            options,
            token: token.clone(),
            tx,
        });
        stream_from_receiver(rx, token)
    }
}

pub fn registry(store: &FakeStore) -> Arc<WatcherGroups> {
    let groups = WatcherGroups::new(
        Arc::new(store.clone()),
        CancellationToken::new(),
        WatchProxyConfig::default(),
    )
    .expect("default config is valid");
    Arc::new(groups)
}

pub fn client(
    stream_id: u64,
    buffer: usize,
) -> (ServerStream, mpsc::Receiver<WatchResponse>) {
    let (tx, rx) = mpsc::channel(buffer);
    let stream = ServerStream::new(stream_id, tx, CancellationToken::new(), Duration::from_millis(50));
    (stream, rx)
}

pub fn watcher(
    stream: &ServerStream,
    watch_id: i64,
    range: KeyRange,
) -> Watcher {
    Watcher::new(WatchCreateRequest::new(watch_id, range), stream.clone())
}

pub async fn recv(rx: &mut mpsc::Receiver<WatchResponse>) -> WatchResponse {
    timeout(RECV_TIMEOUT, rx.recv())
        .await
        .expect("Timeout waiting for watch response")
        .expect("Channel closed")
}

pub async fn assert_silent(rx: &mut mpsc::Receiver<WatchResponse>) {
    let result = timeout(Duration::from_millis(100), rx.recv()).await;
    assert!(result.is_err(), "Unexpected watch response: {:?}", result);
}
