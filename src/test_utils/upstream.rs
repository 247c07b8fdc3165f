use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::watch::stream_from_receiver;
use crate::watch::UpstreamStream;
use crate::watch::WatchOptions;
use crate::watch::WatchResponse;
use crate::watch::WatchSource;

/// One upstream subscription opened through [`ChannelWatchSource`].
#[derive(Debug, Clone)]
pub(crate) struct Subscription {
    pub key: Bytes,
    pub options: WatchOptions,
    pub token: CancellationToken,
    pub tx: mpsc::Sender<WatchResponse>,
}

impl Subscription {
    pub(crate) async fn push(
        &self,
        resp: WatchResponse,
    ) {
        self.tx.send(resp).await.expect("upstream stream dropped");
    }
}

/// In-memory upstream: every `watch` call opens a channel the test feeds.
#[derive(Debug, Clone, Default)]
pub(crate) struct ChannelWatchSource {
    subscriptions: Arc<Mutex<Vec<Subscription>>>,
}

impl ChannelWatchSource {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn opened(&self) -> usize {
        self.subscriptions.lock().len()
    }

    pub(crate) fn subscription(
        &self,
        index: usize,
    ) -> Subscription {
        self.subscriptions.lock()[index].clone()
    }

    pub(crate) fn last(&self) -> Subscription {
        self.subscriptions.lock().last().cloned().expect("no upstream subscription opened")
    }
}

impl WatchSource for ChannelWatchSource {
    fn watch(
        &self,
        token: CancellationToken,
        key: Bytes,
        options: WatchOptions,
    ) -> UpstreamStream {
        let (tx, rx) = mpsc::channel(64);
        self.subscriptions.lock().push(Subscription {
            key,
            options,
            token: token.clone(),
            tx,
        });
        stream_from_receiver(rx, token)
    }
}
