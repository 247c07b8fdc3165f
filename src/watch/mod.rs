//! Watch multiplexing for the proxy
//!
//! Many clients subscribing to the same key range share one upstream
//! subscription. Each client still sees its own created acknowledgment and
//! can come and go without disturbing the others.
//!
//! # Architecture Overview
//!
//! ```text
//!  client conn 1 ─┐                                    ┌─► WatcherGroup [a, b) ─► upstream watch
//!  client conn 2 ─┼─► WatchStreamHandler ─► WatcherGroups ─┤
//!  client conn 3 ─┘         │                          └─► WatcherGroup [c]    ─► upstream watch
//!                           │
//!                           └─► SingleWatcher ─(promotion)─► new WatcherGroup, same upstream watch
//! ```
//!
//! - [`WatcherGroups`] is the registry. It keeps a range index and an identity
//!   index under one lock and decides whether a new receiver joins an existing
//!   group or opens a new upstream subscription.
//! - [`WatcherGroup`] owns one upstream subscription and a dedicated fan-out
//!   task pushing every response to every member.
//! - [`SingleWatcher`] is a private subscription for a lone receiver. It can be
//!   promoted into the seed of a new group, handing over its live stream
//!   instead of opening another.
//!
//! # Revisions
//!
//! A group starts at [`UNINITIALIZED_REVISION`] until its upstream created
//! notification arrives. Its revision never decreases afterwards. Receivers
//! joining an established group get a synthetic created acknowledgment at the
//! group's revision; receivers joining before that rely on the upstream one.
//!
//! # Delivery
//!
//! Every send to a client races the connection's queue against its
//! cancellation token and a send timeout. A client that stops reading is
//! canceled instead of stalling the fan-out for everyone else.

mod group;
mod registry;
mod single;
mod stream;
mod types;
mod upstream;
mod watcher;

#[cfg(test)]
mod group_test;

pub use group::*;
pub use registry::*;
pub use single::*;
pub use stream::*;
pub use types::*;
pub use upstream::*;
pub use watcher::*;
