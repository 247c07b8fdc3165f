use config::ConfigError;
use serde::Deserialize;
use serde::Serialize;
use tracing::warn;

use crate::Error;
use crate::Result;

/// Watch multiplexing configuration
///
/// # Example
/// ```toml
/// [watch]
/// receiver_buffer_size = 128
/// send_timeout_ms = 50
/// progress_notify = true
/// created_notify = true
/// ```
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct WatchProxyConfig {
    /// Capacity of each client connection's outbound queue
    ///
    /// Shared by all watches of one connection. Larger queues absorb bursts
    /// before a slow client is canceled.
    ///
    /// **Default**: 128
    #[serde(default = "default_receiver_buffer_size")]
    pub receiver_buffer_size: usize,

    /// How long one delivery may wait on a full client queue (milliseconds)
    ///
    /// When exceeded the client connection is canceled as a slow consumer, so
    /// a group's fan-out is never held up for longer than this.
    ///
    /// **Default**: 50
    #[serde(default = "default_send_timeout_ms")]
    pub send_timeout_ms: u64,

    /// Ask upstream for progress notifications on group subscriptions
    ///
    /// **Default**: true
    #[serde(default = "default_true")]
    pub progress_notify: bool,

    /// Ask upstream for a created notification on group subscriptions
    ///
    /// Must stay enabled: receivers that join a group before its first
    /// revision rely on the upstream notification as their acknowledgment.
    ///
    /// **Default**: true
    #[serde(default = "default_true")]
    pub created_notify: bool,
}

impl Default for WatchProxyConfig {
    fn default() -> Self {
        Self {
            receiver_buffer_size: default_receiver_buffer_size(),
            send_timeout_ms: default_send_timeout_ms(),
            progress_notify: default_true(),
            created_notify: default_true(),
        }
    }
}

impl WatchProxyConfig {
    /// Validates watch configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.receiver_buffer_size == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch.receiver_buffer_size must be greater than 0".into(),
            )));
        }

        if self.receiver_buffer_size > 100_000 {
            warn!(
                "watch.receiver_buffer_size ({}) is very large; every client connection reserves this many slots",
                self.receiver_buffer_size
            );
        }

        if self.send_timeout_ms == 0 {
            return Err(Error::Config(ConfigError::Message(
                "watch.send_timeout_ms must be at least 1ms".into(),
            )));
        }

        if !self.created_notify {
            return Err(Error::Config(ConfigError::Message(
                "watch.created_notify must be enabled for grouped watches".into(),
            )));
        }

        Ok(())
    }
}

const fn default_receiver_buffer_size() -> usize {
    128
}

const fn default_send_timeout_ms() -> u64 {
    50
}

const fn default_true() -> bool {
    true
}
