//! Watcher group: one upstream subscription fanned out to many receivers
//!
//! ```text
//!  upstream stream ──► run() ──► broadcast() ──┬─► Watcher A ─► client 1 queue
//!                       │                      ├─► Watcher B ─► client 2 queue
//!                 token.cancelled()            └─► Watcher C ─► client 1 queue
//! ```
//!
//! The receiver set is locked for the whole of one broadcast. Additions made
//! through [`GroupMembers`] therefore land strictly between two upstream
//! responses, which is what lets the registry send a synthetic created
//! acknowledgment before any later event reaches the new receiver.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio::sync::MutexGuard;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::KeyRange;
use super::ReceiverId;
use super::UpstreamStream;
use super::WatchResponse;
use super::Watcher;
use crate::Result;
use crate::WatchError;

#[derive(Debug)]
struct GroupState {
    receivers: HashMap<ReceiverId, Watcher>,
    /// Last observed upstream revision, never decreases
    revision: i64,
    stopped: bool,
}

#[derive(Debug)]
pub struct WatcherGroup {
    range: KeyRange,
    token: CancellationToken,
    state: Mutex<GroupState>,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl WatcherGroup {
    /// Creates a group that owns the upstream subscription scoped by `token`.
    ///
    /// `revision` is the last revision already observed on that subscription:
    /// [`UNINITIALIZED_REVISION`](super::UNINITIALIZED_REVISION) for a freshly
    /// opened one, the single watcher's revision when seeded by promotion.
    pub(crate) fn new(
        range: KeyRange,
        token: CancellationToken,
        revision: i64,
    ) -> Arc<Self> {
        Arc::new(Self {
            range,
            token,
            state: Mutex::new(GroupState {
                receivers: HashMap::new(),
                revision,
                stopped: false,
            }),
            handle: parking_lot::Mutex::new(None),
        })
    }

    pub fn range(&self) -> &KeyRange {
        &self.range
    }

    /// Spawns the fan-out task. Called once per group.
    pub(crate) fn start(
        self: &Arc<Self>,
        stream: UpstreamStream,
    ) {
        let handle = tokio::spawn(Arc::clone(self).run(stream));
        *self.handle.lock() = Some(handle);
    }

    /// Locks the receiver set.
    pub(crate) async fn members(&self) -> GroupMembers<'_> {
        GroupMembers {
            group: self,
            state: self.state.lock().await,
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.state.lock().await.receivers.is_empty()
    }

    pub async fn revision(&self) -> i64 {
        self.state.lock().await.revision
    }

    pub async fn is_stopped(&self) -> bool {
        self.state.lock().await.stopped
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.receivers.len()
    }

    pub async fn contains(
        &self,
        rid: &ReceiverId,
    ) -> bool {
        self.state.lock().await.receivers.contains_key(rid)
    }

    /// Cancels the upstream subscription. Idempotent.
    pub(crate) async fn stop(&self) {
        self.members().await.stop();
    }

    /// Waits for the fan-out task to exit.
    pub(crate) async fn wait(&self) {
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(range = %self.range, "Watcher group task failed: {:?}", e);
            }
        }
    }

    async fn run(
        self: Arc<Self>,
        mut stream: UpstreamStream,
    ) {
        debug!(range = %self.range, "Watcher group started");

        loop {
            let next = tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                next = stream.next() => next,
            };

            match next {
                Some(resp) => self.broadcast(resp).await,
                None => {
                    warn!(range = %self.range, "Upstream watch stream ended");
                    break;
                }
            }
        }

        self.members().await.stop();
        debug!(range = %self.range, "Watcher group stopped");
    }

    async fn broadcast(
        &self,
        resp: WatchResponse,
    ) {
        let mut state = self.state.lock().await;
        state.revision = state.revision.max(resp.revision());

        let resp = &resp;
        let results = join_all(
            state
                .receivers
                .iter_mut()
                .map(|(rid, watcher)| async move { (*rid, watcher.send(resp).await) }),
        )
        .await;

        for (rid, delivered) in results {
            if !delivered {
                trace!(range = %self.range, %rid, "Receiver gone, skipped");
            }
        }
    }
}

/// Exclusive access to a group's receiver set.
///
/// Holding this blocks the fan-out task between two broadcasts.
pub(crate) struct GroupMembers<'a> {
    group: &'a WatcherGroup,
    state: MutexGuard<'a, GroupState>,
}

impl GroupMembers<'_> {
    /// Inserts the receiver, or rejects it if the group is stopped.
    pub(crate) fn add(
        &mut self,
        rid: ReceiverId,
        watcher: Watcher,
    ) -> Result<i64> {
        if self.state.stopped {
            return Err(WatchError::GroupStopped {
                range: self.group.range.clone(),
            }
            .into());
        }
        self.state.receivers.insert(rid, watcher);
        Ok(self.state.revision)
    }

    pub(crate) fn delete(
        &mut self,
        rid: &ReceiverId,
    ) {
        self.state.receivers.remove(rid);
    }

    pub(crate) fn contains(
        &self,
        rid: &ReceiverId,
    ) -> bool {
        self.state.receivers.contains_key(rid)
    }

    pub(crate) fn receiver_ids(&self) -> impl Iterator<Item = &ReceiverId> {
        self.state.receivers.keys()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.state.receivers.is_empty()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.state.stopped
    }

    pub(crate) fn revision(&self) -> i64 {
        self.state.revision
    }

    /// Sends a synthetic created acknowledgment to one member.
    pub(crate) async fn send_created(
        &mut self,
        rid: &ReceiverId,
        revision: i64,
    ) -> bool {
        match self.state.receivers.get_mut(rid) {
            Some(watcher) => watcher.send_created(revision).await,
            None => false,
        }
    }

    pub(crate) fn stop(&mut self) {
        if !self.state.stopped {
            self.state.stopped = true;
            debug!(range = %self.group.range, "Stopping watcher group");
        }
        self.group.token.cancel();
    }
}
