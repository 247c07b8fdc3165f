//! Per-connection watch bookkeeping
//!
//! A [`WatchStreamHandler`] is created for every client watch connection. It
//! owns the connection's outbound queue and cancellation token, and remembers
//! for each watch id whether the watch lives in a group or still runs as a
//! single watcher. Request decoding and response encoding happen elsewhere.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;

use super::ReceiverId;
use super::ServerStream;
use super::SingleExit;
use super::WatchCreateRequest;
use super::WatchResponse;
use super::Watcher;
use super::WatcherGroups;
use crate::Result;
use crate::WatchError;

#[derive(Debug, Clone)]
enum WatchMode {
    Grouped,
    /// Halt signal of the private loop
    Single(CancellationToken),
}

#[derive(Debug)]
pub struct WatchStreamHandler {
    stream: ServerStream,
    groups: Arc<WatcherGroups>,
    watchers: Arc<DashMap<i64, WatchMode>>,
}

impl WatchStreamHandler {
    /// Returns the handler and the receiving end of the connection's
    /// outbound queue.
    pub fn new(
        stream_id: u64,
        groups: Arc<WatcherGroups>,
    ) -> (Self, mpsc::Receiver<WatchResponse>) {
        let config = groups.config();
        let (watch_tx, watch_rx) = mpsc::channel(config.receiver_buffer_size);
        let stream = ServerStream::new(
            stream_id,
            watch_tx,
            groups.scope().child_token(),
            Duration::from_millis(config.send_timeout_ms),
        );

        info!(stream_id, "Watch stream opened");
        (
            Self {
                stream,
                groups,
                watchers: Arc::new(DashMap::new()),
            },
            watch_rx,
        )
    }

    pub fn id(&self) -> u64 {
        self.stream.id()
    }

    /// Cancelled when the client goes away or falls too far behind.
    pub fn token(&self) -> &CancellationToken {
        self.stream.token()
    }

    pub fn watch_count(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_grouped(
        &self,
        watch_id: i64,
    ) -> bool {
        self.watchers
            .get(&watch_id)
            .is_some_and(|mode| matches!(*mode, WatchMode::Grouped))
    }

    fn register(
        &self,
        watch_id: i64,
        mode: WatchMode,
    ) -> Result<()> {
        if self.stream.is_canceled() {
            return Err(WatchError::StreamClosed.into());
        }
        match self.watchers.entry(watch_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(WatchError::DuplicateWatcher(watch_id).into()),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(mode);
                Ok(())
            }
        }
    }

    /// Starts a grouped watch.
    pub async fn watch(
        &self,
        request: WatchCreateRequest,
    ) -> Result<()> {
        let watch_id = request.watch_id;
        self.register(watch_id, WatchMode::Grouped)?;

        let watcher = Watcher::new(request, self.stream.clone());
        self.groups.add_watcher(watcher.receiver_id(), watcher).await;
        Ok(())
    }

    /// Starts a watch on a private upstream subscription that coalesces into
    /// a group as soon as the registry accepts it.
    pub fn watch_single(
        &self,
        request: WatchCreateRequest,
    ) -> Result<()> {
        let watch_id = request.watch_id;
        let watcher = Watcher::new(request, self.stream.clone());

        let single = self.groups.new_single(watcher);
        let halt = single.halt_token();
        if let Err(e) = self.register(watch_id, WatchMode::Single(halt.clone())) {
            let mut single = single;
            single.retire();
            return Err(e);
        }

        let groups = Arc::clone(&self.groups);
        let watchers = Arc::clone(&self.watchers);
        let stream_id = self.id();
        tokio::spawn(async move {
            let exit = single.run(groups).await;
            debug!(stream_id, watch_id, ?exit, "Single watcher loop exited");

            // A halted loop no longer owns its map entry
            if halt.is_cancelled() {
                return;
            }
            match exit {
                SingleExit::Coalesced => {
                    if let Some(mut mode) = watchers.get_mut(&watch_id) {
                        *mode = WatchMode::Grouped;
                    }
                }
                SingleExit::Canceled => {}
                SingleExit::UpstreamClosed | SingleExit::ReceiverGone => {
                    watchers.remove_if(&watch_id, |_, mode| matches!(mode, WatchMode::Single(_)));
                }
            }
        });
        Ok(())
    }

    /// Cancels one watch. Returns the group revision at removal when the watch
    /// was grouped.
    pub async fn cancel_watch(
        &self,
        watch_id: i64,
    ) -> Result<Option<i64>> {
        let mode = self
            .watchers
            .get(&watch_id)
            .map(|entry| entry.value().clone())
            .ok_or(WatchError::UnknownWatcher(watch_id))?;

        // Halt before removing so a concurrent promotion sees it
        if let WatchMode::Single(halt) = mode {
            halt.cancel();
        }
        let revision = self
            .groups
            .remove_watcher(ReceiverId::new(self.id(), watch_id))
            .await;
        // The id stays taken until the registry no longer maps it
        self.watchers.remove(&watch_id);

        debug!(stream_id = self.id(), watch_id, ?revision, "Watch canceled");
        Ok(revision)
    }

    /// Tears down every watch of this connection.
    pub async fn close(self) {
        self.stream.token().cancel();

        let ids: Vec<i64> = self.watchers.iter().map(|entry| *entry.key()).collect();
        for watch_id in ids {
            if let Some((_, WatchMode::Single(halt))) = self.watchers.remove(&watch_id) {
                halt.cancel();
            }
            self.groups
                .remove_watcher(ReceiverId::new(self.id(), watch_id))
                .await;
        }
        info!(stream_id = self.id(), "Watch stream closed");
    }
}
