//! Watch Proxy Error Hierarchy
//!
//! Failures in the watch multiplexing core are local and recoverable: the
//! caller picks another path (keep watching privately, treat as already
//! removed). Nothing here is fatal to the process.

use config::ConfigError;

use crate::watch::KeyRange;

#[doc(hidden)]
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration loading or validation failures
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Watch registry and fan-out failures
    #[error(transparent)]
    Watch(#[from] WatchError),
}

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    /// The group was stopped before the receiver could be added
    #[error("Watcher group for {range} is stopped")]
    GroupStopped { range: KeyRange },

    /// The single watcher still has events in flight or its receiver is gone
    #[error("Single watcher on {range} cannot be promoted")]
    NotPromotable { range: KeyRange },

    /// Joining would skip events the existing group already broadcast
    #[error("Single watcher on {range} at revision {revision} is behind group revision {group_revision}")]
    Lagging {
        range: KeyRange,
        revision: i64,
        group_revision: i64,
    },

    /// The single watcher's upstream stream was already handed off or halted
    #[error("Single watcher was retired")]
    SingleRetired,

    #[error("Watch id {0} is not registered on this stream")]
    UnknownWatcher(i64),

    #[error("Watch id {0} is already registered on this stream")]
    DuplicateWatcher(i64),

    /// Outbound queue of the client stream is closed
    #[error("Client watch stream closed")]
    StreamClosed,

    /// Range index and identity index disagree
    #[error("Index mismatch: {0}")]
    IndexMismatch(String),
}
