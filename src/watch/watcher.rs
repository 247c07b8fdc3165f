//! Receivers and bounded delivery
//!
//! A [`Watcher`] is one client-side watch. All watchers of one client
//! connection share a [`ServerStream`]: the connection's outbound queue and
//! its cancellation signal. Every send races the queue against that signal
//! and a send timeout, so neither a fan-out task nor the registry can be
//! parked behind a consumer that stopped reading.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use tracing::warn;

use super::Event;
use super::EventType;
use super::KeyRange;
use super::ReceiverId;
use super::WatchCreateRequest;
use super::WatchResponse;

/// Per-watcher event filter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchFilter {
    NoPut,
    NoDelete,
}

impl WatchFilter {
    pub fn matches(
        &self,
        event: &Event,
    ) -> bool {
        matches!(
            (self, event.event_type),
            (WatchFilter::NoPut, EventType::Put) | (WatchFilter::NoDelete, EventType::Delete)
        )
    }
}

/// Outbound half of one client connection.
#[derive(Debug, Clone)]
pub struct ServerStream {
    id: u64,
    watch_tx: mpsc::Sender<WatchResponse>,
    token: CancellationToken,
    send_timeout: Duration,
}

impl ServerStream {
    pub fn new(
        id: u64,
        watch_tx: mpsc::Sender<WatchResponse>,
        token: CancellationToken,
        send_timeout: Duration,
    ) -> Self {
        Self {
            id,
            watch_tx,
            token,
            send_timeout,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_canceled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Pushes one response to the client.
    ///
    /// Returns `false` if the stream is cancelled, closed, or did not accept
    /// the response within the send timeout. The last two cancel the stream:
    /// a consumer that cannot keep up is dropped rather than waited on.
    pub(crate) async fn send(
        &self,
        resp: WatchResponse,
    ) -> bool {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => false,
            res = self.watch_tx.send_timeout(resp, self.send_timeout) => {
                match res {
                    Ok(()) => true,
                    Err(SendTimeoutError::Timeout(resp)) => {
                        warn!(
                            stream_id = self.id,
                            watch_id = resp.watch_id,
                            timeout = ?self.send_timeout,
                            "Slow watch receiver, canceling stream"
                        );
                        self.token.cancel();
                        false
                    }
                    Err(SendTimeoutError::Closed(_)) => {
                        trace!(stream_id = self.id, "Watch stream closed by client");
                        self.token.cancel();
                        false
                    }
                }
            }
        }
    }
}

/// One client-side watch and its delivery state.
#[derive(Debug, Clone)]
pub struct Watcher {
    id: i64,
    range: KeyRange,
    filters: Vec<WatchFilter>,
    progress_notify: bool,
    stream: ServerStream,
    /// Highest event revision seen, delivered or filtered
    rev: i64,
    /// Highest header revision delivered
    header_rev: i64,
    created: bool,
}

impl Watcher {
    pub fn new(
        request: WatchCreateRequest,
        stream: ServerStream,
    ) -> Self {
        Self {
            id: request.watch_id,
            range: request.range,
            filters: request.filters,
            progress_notify: request.progress_notify,
            stream,
            rev: 0,
            header_rev: 0,
            created: false,
        }
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn range(&self) -> &KeyRange {
        &self.range
    }

    pub fn receiver_id(&self) -> ReceiverId {
        ReceiverId::new(self.stream.id(), self.id)
    }

    pub fn is_canceled(&self) -> bool {
        self.stream.is_canceled()
    }

    /// Highest event revision this watcher has seen
    pub fn revision(&self) -> i64 {
        self.rev
    }

    pub fn created_sent(&self) -> bool {
        self.created
    }

    /// Forwards an upstream response, re-stamped with this watcher's id.
    ///
    /// Events at or below the last seen revision are skipped, as are repeated
    /// created notifications and stale progress markers. Returns `true` when
    /// the response was delivered or intentionally dropped, `false` when the
    /// receiver is gone.
    pub(crate) async fn send(
        &mut self,
        resp: &WatchResponse,
    ) -> bool {
        if resp.is_progress_notify() && (!self.progress_notify || resp.revision() < self.header_rev) {
            return true;
        }
        if resp.created && self.created {
            return true;
        }

        let mut last_rev = self.rev;
        let mut events = Vec::with_capacity(resp.events.len());
        for ev in &resp.events {
            if ev.mod_revision <= self.rev {
                continue;
            }
            last_rev = last_rev.max(ev.mod_revision);
            if !self.filters.iter().any(|f| f.matches(ev)) {
                events.push(ev.clone());
            }
        }
        self.rev = last_rev;

        // Every event was filtered out
        if !resp.created && !resp.is_progress_notify() && events.is_empty() {
            return true;
        }

        let out = WatchResponse {
            header: resp.header,
            watch_id: self.id,
            created: resp.created,
            events,
        };
        if !self.stream.send(out).await {
            return false;
        }

        self.header_rev = self.header_rev.max(resp.revision());
        if resp.created {
            self.created = true;
        }
        trace!(
            stream_id = self.stream.id(),
            watch_id = self.id,
            revision = resp.revision(),
            "Watch response delivered"
        );
        true
    }

    /// Delivers a synthetic created acknowledgment at `revision`.
    pub(crate) async fn send_created(
        &mut self,
        revision: i64,
    ) -> bool {
        if self.created {
            return true;
        }
        if !self.stream.send(WatchResponse::created(revision, self.id)).await {
            return false;
        }
        self.created = true;
        self.header_rev = self.header_rev.max(revision);
        self.rev = self.rev.max(revision);
        true
    }
}
