//! Upstream watch source abstraction
//!
//! The proxy never talks to the store directly. Whatever transport opens,
//! streams and reconnects the store's watch implements [`WatchSource`]; the
//! registry only asks it for a stream scoped to a cancellation token.

use std::pin::Pin;

use bytes::Bytes;
use futures::Stream;
#[cfg(test)]
use mockall::automock;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use super::KeyRange;
use super::WatchResponse;
use crate::WatchProxyConfig;

/// Live upstream subscription. Ends when the source gives up or the token
/// it was opened with is cancelled.
pub type UpstreamStream = Pin<Box<dyn Stream<Item = WatchResponse> + Send>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchOptions {
    /// `None` watches the single key
    pub range_end: Option<Bytes>,
    pub progress_notify: bool,
    pub created_notify: bool,
}

impl WatchOptions {
    pub fn for_range(
        range: &KeyRange,
        config: &WatchProxyConfig,
    ) -> Self {
        Self {
            range_end: (!range.is_single_key()).then(|| range.end().clone()),
            progress_notify: config.progress_notify,
            created_notify: config.created_notify,
        }
    }
}

#[cfg_attr(test, automock)]
pub trait WatchSource: Send + Sync + 'static {
    /// Opens an upstream subscription starting at `key`.
    ///
    /// Must return without waiting for the first response. The stream must
    /// terminate once `token` is cancelled.
    fn watch(
        &self,
        token: CancellationToken,
        key: Bytes,
        options: WatchOptions,
    ) -> UpstreamStream;
}

/// Adapts a channel fed by a transport task into an [`UpstreamStream`] that
/// also ends on cancellation.
pub fn stream_from_receiver(
    rx: mpsc::Receiver<WatchResponse>,
    token: CancellationToken,
) -> UpstreamStream {
    use futures::StreamExt;

    Box::pin(ReceiverStream::new(rx).take_until(token.cancelled_owned()))
}
