use std::fmt;

use bytes::Bytes;

use super::WatchFilter;

/// Revision of a group whose upstream created notification has not arrived yet.
pub const UNINITIALIZED_REVISION: i64 = 0;

/// The `[key, end)` interval a subscription watches.
///
/// Equality and hash define grouping: two subscriptions with equal ranges
/// share one upstream subscription. An empty `end` watches `key` alone.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyRange {
    key: Bytes,
    end: Bytes,
}

impl KeyRange {
    pub fn new(
        key: impl Into<Bytes>,
        end: impl Into<Bytes>,
    ) -> Self {
        Self {
            key: key.into(),
            end: end.into(),
        }
    }

    pub fn single(key: impl Into<Bytes>) -> Self {
        Self::new(key, Bytes::new())
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    pub fn end(&self) -> &Bytes {
        &self.end
    }

    pub fn is_single_key(&self) -> bool {
        self.end.is_empty()
    }
}

impl fmt::Display for KeyRange {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        if self.is_single_key() {
            write!(f, "[{:?}]", self.key)
        } else {
            write!(f, "[{:?}, {:?})", self.key, self.end)
        }
    }
}

/// Identity of one client-side watch: the owning connection plus the watch id
/// the client chose on that connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReceiverId {
    pub stream_id: u64,
    pub watch_id: i64,
}

impl ReceiverId {
    pub fn new(
        stream_id: u64,
        watch_id: i64,
    ) -> Self {
        Self { stream_id, watch_id }
    }
}

impl fmt::Display for ReceiverId {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "{}/{}", self.stream_id, self.watch_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResponseHeader {
    pub revision: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub event_type: EventType,
    pub key: Bytes,
    /// Empty for deletes
    pub value: Bytes,
    pub mod_revision: i64,
}

impl Event {
    pub fn put(
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
        mod_revision: i64,
    ) -> Self {
        Self {
            event_type: EventType::Put,
            key: key.into(),
            value: value.into(),
            mod_revision,
        }
    }

    pub fn delete(
        key: impl Into<Bytes>,
        mod_revision: i64,
    ) -> Self {
        Self {
            event_type: EventType::Delete,
            key: key.into(),
            value: Bytes::new(),
            mod_revision,
        }
    }
}

/// One item of a watch stream, both upstream and towards the client.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WatchResponse {
    pub header: ResponseHeader,
    pub watch_id: i64,
    pub created: bool,
    pub events: Vec<Event>,
}

impl WatchResponse {
    /// Acknowledgment that a watch is active as of `revision`.
    pub fn created(
        revision: i64,
        watch_id: i64,
    ) -> Self {
        Self {
            header: ResponseHeader { revision },
            watch_id,
            created: true,
            events: Vec::new(),
        }
    }

    pub fn progress(revision: i64) -> Self {
        Self {
            header: ResponseHeader { revision },
            ..Default::default()
        }
    }

    pub fn with_events(
        revision: i64,
        events: Vec<Event>,
    ) -> Self {
        Self {
            header: ResponseHeader { revision },
            events,
            ..Default::default()
        }
    }

    pub fn revision(&self) -> i64 {
        self.header.revision
    }

    /// A progress marker carries a revision and nothing else.
    pub fn is_progress_notify(&self) -> bool {
        !self.created && self.events.is_empty() && self.header.revision != 0
    }
}

/// A decoded client request to start watching a range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchCreateRequest {
    pub watch_id: i64,
    pub range: KeyRange,
    pub filters: Vec<WatchFilter>,
    pub progress_notify: bool,
}

impl WatchCreateRequest {
    pub fn new(
        watch_id: i64,
        range: KeyRange,
    ) -> Self {
        Self {
            watch_id,
            range,
            filters: Vec::new(),
            progress_notify: true,
        }
    }

    pub fn with_filters(
        mut self,
        filters: Vec<WatchFilter>,
    ) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_progress_notify(
        mut self,
        progress_notify: bool,
    ) -> Self {
        self.progress_notify = progress_notify;
        self
    }
}
