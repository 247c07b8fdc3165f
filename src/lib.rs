//! Watch multiplexing core for a d-engine proxy.
//!
//! Clients of the proxy subscribe to key ranges. Subscriptions on the same
//! range are coalesced onto a single upstream watch, while every client keeps
//! its own created acknowledgment and lifecycle. See [`watch`] for the
//! moving parts.

mod config;
mod errors;
pub mod watch;

pub use self::config::*;
pub use self::errors::*;

//-----------------------------------------------------------
// Test utils

#[cfg(test)]
pub(crate) mod test_utils;
