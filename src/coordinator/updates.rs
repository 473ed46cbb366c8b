//! Versioned membership updates
//!
//! Every registry mutation stages the affected entry's state into a scratch
//! delta; `push_update` stamps the delta with the next version number and
//! queues it for the propagation engine. Updates stay queued until every
//! subscribed server has confirmed them, then get pruned.

use crate::common::types::{ServerId, ServerStatus, ServiceMask};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Version number carried by entries that have never confirmed anything.
/// Real versions start at 1.
pub const UNINITIALIZED_VERSION: u64 = 0;

/// One server's state as disseminated to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryState {
    pub server_id: ServerId,
    pub services: ServiceMask,
    pub service_locator: String,
    pub status: ServerStatus,
    pub expected_read_mbytes_per_sec: u32,
    pub replication_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    FullList,
    Update,
}

/// A full snapshot or one incremental delta, as pushed to subscribers.
///
/// In a `FullList` the servers appear in registry-index order; in an
/// `Update` they appear in mutation order, and order matters (a replacement
/// enlistment carries the remove of the old id before the add of the new).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipMessage {
    pub version: u64,
    pub kind: MessageKind,
    pub servers: Vec<EntryState>,
}

/// One queued update: the incremental delta at `version`, plus a full
/// snapshot built lazily the first time this version has to onboard a
/// subscriber that has never confirmed anything.
///
/// Payloads are `Arc`ed: the propagation worker holds a clone while an RPC
/// is in flight, so pruning the queue can never free an update out from
/// under an unacknowledged send.
#[derive(Debug)]
pub struct VersionedUpdate {
    pub version: u64,
    pub incremental: Arc<MembershipMessage>,
    pub full: Option<Arc<MembershipMessage>>,
}

/// Ordered buffer of versioned updates plus the scratch delta being built
/// by the current batch of mutations. Callers hold the registry lock.
#[derive(Debug, Default)]
pub struct UpdateBuffer {
    version: u64,
    scratch: Vec<EntryState>,
    queue: VecDeque<VersionedUpdate>,
}

impl UpdateBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current buffer head version; 0 until the first `push_update`.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Stage one entry's state into the scratch delta.
    pub fn stage(&mut self, state: EntryState) {
        self.scratch.push(state);
    }

    pub fn has_staged(&self) -> bool {
        !self.scratch.is_empty()
    }

    /// Stamp the scratch delta with the next version and queue it.
    /// Returns the new version, or `None` if nothing was staged.
    pub fn push_update(&mut self) -> Option<u64> {
        if self.scratch.is_empty() {
            return None;
        }
        self.version += 1;
        let message = MembershipMessage {
            version: self.version,
            kind: MessageKind::Update,
            servers: std::mem::take(&mut self.scratch),
        };
        self.queue.push_back(VersionedUpdate {
            version: self.version,
            incremental: Arc::new(message),
            full: None,
        });
        Some(self.version)
    }

    /// Drop every queued update with version ≤ `min_confirmed`.
    /// Returns true if the queue is now empty.
    pub fn prune(&mut self, min_confirmed: u64) -> bool {
        while self
            .queue
            .front()
            .is_some_and(|u| u.version <= min_confirmed)
        {
            self.queue.pop_front();
        }
        self.queue.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Number of updates still buffered.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// The queued update carrying exactly `version`, if still buffered.
    pub fn at_version(&mut self, version: u64) -> Option<&mut VersionedUpdate> {
        let front = self.queue.front()?.version;
        if version < front {
            return None;
        }
        let offset = (version - front) as usize;
        let update = self.queue.get_mut(offset)?;
        debug_assert_eq!(update.version, version);
        Some(update)
    }

    /// The most recent queued update.
    pub fn latest(&mut self) -> Option<&mut VersionedUpdate> {
        self.queue.back_mut()
    }

    /// Version of the oldest queued update, if any.
    pub fn oldest_version(&self) -> Option<u64> {
        self.queue.front().map(|u| u.version)
    }
}
