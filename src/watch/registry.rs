//! Watcher group registry
//!
//! Owns two indices over the same receiver-to-group relation:
//!
//! - `by_range`: one live [`WatcherGroup`] per [`KeyRange`]
//! - `by_receiver`: the group each [`ReceiverId`] currently belongs to
//!
//! Both live behind a single async mutex and every structural change touches
//! them inside the same critical section. The lock is held across the
//! synthetic created acknowledgment of a join (bounded by the receiver's send
//! timeout) but never across a wait for upstream data.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::trace;

use super::KeyRange;
use super::ReceiverId;
use super::SingleWatcher;
use super::WatchOptions;
use super::WatchSource;
use super::Watcher;
use super::WatcherGroup;
use super::UNINITIALIZED_REVISION;
use crate::Result;
use crate::WatchError;
use crate::WatchProxyConfig;

#[derive(Debug, Default)]
struct Indices {
    by_range: HashMap<KeyRange, Arc<WatcherGroup>>,
    by_receiver: HashMap<ReceiverId, Arc<WatcherGroup>>,
}

pub struct WatcherGroups {
    source: Arc<dyn WatchSource>,
    /// Parent of every upstream subscription token
    scope: CancellationToken,
    config: WatchProxyConfig,
    indices: Mutex<Indices>,
}

impl std::fmt::Debug for WatcherGroups {
    fn fmt(
        &self,
        f: &mut std::fmt::Formatter<'_>,
    ) -> std::fmt::Result {
        f.debug_struct("WatcherGroups")
            .field("config", &self.config)
            .field("cancelled", &self.scope.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl WatcherGroups {
    /// Fails if `config` does not pass validation.
    pub fn new(
        source: Arc<dyn WatchSource>,
        scope: CancellationToken,
        config: WatchProxyConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            source,
            scope,
            config,
            indices: Mutex::new(Indices::default()),
        })
    }

    pub fn config(&self) -> &WatchProxyConfig {
        &self.config
    }

    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }

    /// Adds a receiver to the group for its range, creating the group and its
    /// upstream subscription if there is none.
    ///
    /// Joining an established group sends the receiver a created
    /// acknowledgment at the group's revision. Joining a group whose own
    /// created notification has not arrived yet sends nothing: the upstream
    /// notification will reach the receiver through the fan-out.
    pub async fn add_watcher(
        &self,
        rid: ReceiverId,
        watcher: Watcher,
    ) {
        let mut indices = self.indices.lock().await;
        Self::detach(&mut indices, &rid).await;

        let range = watcher.range().clone();
        if let Some(group) = indices.by_range.get(&range).cloned() {
            let mut members = group.members().await;
            if members.is_stopped() {
                debug!(range = %range, "Replacing stopped watcher group");
            } else {
                let Ok(revision) = members.add(rid, watcher) else {
                    return;
                };
                indices.by_receiver.insert(rid, Arc::clone(&group));
                debug!(%rid, range = %range, revision, "Watcher joined existing group");

                if revision == UNINITIALIZED_REVISION {
                    return;
                }
                if !members.send_created(&rid, revision).await {
                    trace!(%rid, "Receiver gone before created acknowledgment");
                }
                return;
            }
        }

        let token = self.scope.child_token();
        let stream = self.source.watch(
            token.clone(),
            range.key().clone(),
            WatchOptions::for_range(&range, &self.config),
        );

        let group = WatcherGroup::new(range.clone(), token, UNINITIALIZED_REVISION);
        if let Err(e) = group.members().await.add(rid, watcher) {
            debug!(%rid, "New watcher group rejected receiver: {}", e);
            return;
        }
        group.start(stream);

        indices.by_range.insert(range.clone(), Arc::clone(&group));
        indices.by_receiver.insert(rid, group);
        debug!(%rid, range = %range, "Watcher group created");
    }

    /// Removes a receiver from its group.
    ///
    /// Returns the group's revision at removal time, or `None` if the
    /// receiver is unknown. A group left empty is stopped and dropped from
    /// the range index.
    pub async fn remove_watcher(
        &self,
        rid: ReceiverId,
    ) -> Option<i64> {
        let mut indices = self.indices.lock().await;
        Self::detach(&mut indices, &rid).await
    }

    /// Folds a single watcher into shared grouping, keeping its live upstream
    /// subscription if it seeds a new group.
    ///
    /// Returns `false` when the existing group rejects it, when that group
    /// has already broadcast past the single watcher's last revision, or when
    /// it is not promotable. The caller then keeps it private.
    ///
    /// A receiver id still mapped to another group is detached from it first.
    pub async fn maybe_join_watcher_single(
        &self,
        single: &mut SingleWatcher,
    ) -> bool {
        match self.try_join_watcher_single(single).await {
            Ok(()) => true,
            Err(e) => {
                trace!(rid = %single.receiver_id(), "Single watcher stays private: {}", e);
                false
            }
        }
    }

    /// Same as [`maybe_join_watcher_single`](Self::maybe_join_watcher_single)
    /// but reports why a join failed.
    pub async fn try_join_watcher_single(
        &self,
        single: &mut SingleWatcher,
    ) -> Result<()> {
        let mut indices = self.indices.lock().await;

        // Checked under the lock: an owner halts first and removes second
        if single.is_halted() || !single.is_live() {
            return Err(WatchError::SingleRetired.into());
        }

        let rid = single.receiver_id();
        let range = single.range().clone();
        Self::detach(&mut indices, &rid).await;

        if let Some(group) = indices.by_range.get(&range).cloned() {
            let mut members = group.members().await;
            let group_revision = members.revision();
            if group_revision > single.last_store_revision() {
                return Err(WatchError::Lagging {
                    range,
                    revision: single.last_store_revision(),
                    group_revision,
                }
                .into());
            }
            members.add(rid, single.watcher().clone())?;
            indices.by_receiver.insert(rid, Arc::clone(&group));
            debug!(%rid, range = %range, "Single watcher joined existing group");
            return Ok(());
        }

        if !single.can_promote() {
            return Err(WatchError::NotPromotable { range }.into());
        }
        let (stream, token) = single.take_upstream().ok_or(WatchError::SingleRetired)?;
        let watcher = single.watcher().clone();

        let group = WatcherGroup::new(range.clone(), token, single.last_store_revision());
        group.members().await.add(rid, watcher)?;
        group.start(stream);

        indices.by_range.insert(range.clone(), Arc::clone(&group));
        indices.by_receiver.insert(rid, group);
        debug!(
            %rid,
            range = %range,
            revision = single.last_store_revision(),
            "Single watcher promoted to group"
        );
        Ok(())
    }

    /// Opens a private upstream subscription for a lone receiver.
    pub fn new_single(
        &self,
        watcher: Watcher,
    ) -> SingleWatcher {
        let token = self.scope.child_token();
        let stream = self.source.watch(
            token.clone(),
            watcher.range().key().clone(),
            WatchOptions::for_range(watcher.range(), &self.config),
        );
        SingleWatcher::new(watcher, stream, token)
    }

    /// Stops every group and clears both indices, then waits for the fan-out
    /// tasks to exit. Only for proxy shutdown.
    pub async fn stop(&self) {
        let mut indices = self.indices.lock().await;

        let mut groups: Vec<Arc<WatcherGroup>> = indices.by_range.drain().map(|(_, g)| g).collect();
        for (_, group) in indices.by_receiver.drain() {
            if !groups.iter().any(|g| Arc::ptr_eq(g, &group)) {
                groups.push(group);
            }
        }

        for group in &groups {
            group.stop().await;
        }
        for group in &groups {
            group.wait().await;
        }
        debug!(groups = groups.len(), "All watcher groups stopped");
    }

    /// The group currently registered for `range`.
    pub async fn group(
        &self,
        range: &KeyRange,
    ) -> Option<Arc<WatcherGroup>> {
        self.indices.lock().await.by_range.get(range).cloned()
    }

    pub async fn group_count(&self) -> usize {
        self.indices.lock().await.by_range.len()
    }

    pub async fn watcher_count(&self) -> usize {
        self.indices.lock().await.by_receiver.len()
    }

    pub async fn contains(
        &self,
        rid: &ReceiverId,
    ) -> bool {
        self.indices.lock().await.by_receiver.contains_key(rid)
    }

    /// Scans both indices for referential integrity in both directions and
    /// for a second live group on an already grouped range.
    pub async fn check_consistency(&self) -> Result<()> {
        let indices = self.indices.lock().await;

        let mut groups: Vec<&Arc<WatcherGroup>> = Vec::new();
        for group in indices.by_range.values().chain(indices.by_receiver.values()) {
            if !groups.iter().any(|g| Arc::ptr_eq(g, group)) {
                groups.push(group);
            }
        }
        for group in groups {
            let members = group.members().await;
            for rid in members.receiver_ids() {
                match indices.by_receiver.get(rid) {
                    Some(indexed) if Arc::ptr_eq(indexed, group) => {}
                    _ => {
                        return Err(WatchError::IndexMismatch(format!(
                            "member {rid} of group {} is not indexed to it",
                            group.range()
                        ))
                        .into());
                    }
                }
            }
        }

        for (range, group) in &indices.by_range {
            if group.range() != range {
                return Err(WatchError::IndexMismatch(format!("group {} indexed under {}", group.range(), range)).into());
            }
        }

        for (rid, group) in &indices.by_receiver {
            let members = group.members().await;
            if !members.contains(rid) {
                return Err(WatchError::IndexMismatch(format!("{rid} not a member of group {}", group.range())).into());
            }
            if members.is_stopped() {
                continue;
            }
            match indices.by_range.get(group.range()) {
                Some(indexed) if Arc::ptr_eq(indexed, group) => {}
                _ => {
                    return Err(WatchError::IndexMismatch(format!(
                        "{rid} belongs to a live group for {} that is not indexed by range",
                        group.range()
                    ))
                    .into());
                }
            }
        }
        Ok(())
    }

    /// Drops `rid` from its group and from the identity index, stopping and
    /// unindexing the group once it is empty.
    async fn detach(
        indices: &mut Indices,
        rid: &ReceiverId,
    ) -> Option<i64> {
        let group = indices.by_receiver.remove(rid)?;

        let mut members = group.members().await;
        members.delete(rid);
        let revision = members.revision();
        if members.is_empty() {
            members.stop();
            drop(members);
            if indices.by_range.get(group.range()).is_some_and(|g| Arc::ptr_eq(g, &group)) {
                indices.by_range.remove(group.range());
            }
        }
        debug!(%rid, range = %group.range(), revision, "Watcher removed");
        Some(revision)
    }
}
