//! Single watcher: a private upstream subscription for a lone receiver
//!
//! A single watcher reads its own upstream stream and delivers straight to
//! its receiver, skipping the group machinery. After every delivered response
//! it asks the registry to coalesce it. That request is made from inside the
//! delivery loop, between two reads, so nothing read from the private stream
//! is ever in flight when ownership of the stream moves to a new group.

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;

use super::KeyRange;
use super::ReceiverId;
use super::UpstreamStream;
use super::Watcher;
use super::WatcherGroups;

/// Why [`SingleWatcher::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SingleExit {
    /// Now served by a watcher group
    Coalesced,
    /// Halted by its owner
    Canceled,
    UpstreamClosed,
    ReceiverGone,
}

pub struct SingleWatcher {
    watcher: Watcher,
    /// `None` once handed to a group or retired
    stream: Option<UpstreamStream>,
    token: CancellationToken,
    halt: CancellationToken,
    /// Last revision read from the private stream
    last_store_rev: i64,
    /// Last revision fully delivered to the receiver
    last_delivered_rev: i64,
}

impl std::fmt::Debug for SingleWatcher {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("SingleWatcher")
            .field("watcher", &self.watcher)
            .field("live", &self.stream.is_some())
            .field("last_store_rev", &self.last_store_rev)
            .field("last_delivered_rev", &self.last_delivered_rev)
            .finish_non_exhaustive()
    }
}

impl SingleWatcher {
    /// Wraps a private upstream subscription; `token` must be the token it was
    /// opened with.
    pub fn new(
        watcher: Watcher,
        stream: UpstreamStream,
        token: CancellationToken,
    ) -> Self {
        Self {
            watcher,
            stream: Some(stream),
            token,
            halt: CancellationToken::new(),
            last_store_rev: 0,
            last_delivered_rev: 0,
        }
    }

    pub fn receiver_id(&self) -> ReceiverId {
        self.watcher.receiver_id()
    }

    pub fn range(&self) -> &KeyRange {
        self.watcher.range()
    }

    pub fn watcher(&self) -> &Watcher {
        &self.watcher
    }

    pub fn last_store_revision(&self) -> i64 {
        self.last_store_rev
    }

    /// Signal that stops the private loop without touching a group it may
    /// have been promoted into.
    pub fn halt_token(&self) -> CancellationToken {
        self.halt.clone()
    }

    pub fn is_halted(&self) -> bool {
        self.halt.is_cancelled()
    }

    /// Whether the private stream still belongs to this watcher.
    pub fn is_live(&self) -> bool {
        self.stream.is_some()
    }

    /// True when the private stream can move to a new group without dropping
    /// or duplicating anything: the stream is still owned here, the receiver
    /// is alive, and everything read so far reached the receiver.
    pub fn can_promote(&self) -> bool {
        self.stream.is_some()
            && !self.halt.is_cancelled()
            && !self.watcher.is_canceled()
            && self.last_delivered_rev == self.last_store_rev
    }

    /// Hands the private subscription over. After this the single watcher
    /// performs no further reads.
    pub(crate) fn take_upstream(&mut self) -> Option<(UpstreamStream, CancellationToken)> {
        self.stream.take().map(|stream| (stream, self.token.clone()))
    }

    /// Drops the private subscription if it is still owned here.
    pub fn retire(&mut self) {
        if let Some(stream) = self.stream.take() {
            self.token.cancel();
            drop(stream);
            trace!(rid = %self.receiver_id(), "Single watcher retired");
        }
    }

    /// Private delivery loop.
    pub async fn run(
        mut self,
        groups: Arc<WatcherGroups>,
    ) -> SingleExit {
        let halt = self.halt.clone();
        let token = self.token.clone();

        loop {
            let Some(stream) = self.stream.as_mut() else {
                return SingleExit::Coalesced;
            };

            let next = tokio::select! {
                biased;
                _ = halt.cancelled() => None,
                _ = token.cancelled() => Some(None),
                next = stream.next() => Some(next),
            };

            let Some(next) = next else {
                self.retire();
                return SingleExit::Canceled;
            };
            let Some(resp) = next else {
                debug!(rid = %self.receiver_id(), "Single watcher upstream ended");
                self.retire();
                return SingleExit::UpstreamClosed;
            };

            self.last_store_rev = self.last_store_rev.max(resp.revision());
            if !self.watcher.send(&resp).await {
                self.retire();
                return SingleExit::ReceiverGone;
            }
            self.last_delivered_rev = self.last_store_rev;

            if groups.maybe_join_watcher_single(&mut self).await {
                // Still owned if it joined an existing group
                self.retire();
                return SingleExit::Coalesced;
            }
        }
    }
}
