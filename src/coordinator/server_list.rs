//! Authoritative coordinator server list
//!
//! Single source of truth for cluster membership. Mutations are made
//! durable in two phases (an intent record, the in-memory change and its
//! side effects, then a commit record invalidating the intent) so a
//! coordinator failover can replay either half. Every mutation stages a
//! versioned delta that a dedicated worker thread pushes to all subscribed
//! servers; `sync` blocks until the whole cluster has confirmed the
//! current version.
//!
//! One mutex covers the registry, the update buffer, the propagation
//! counters, and the scan cursor. All public operations take it; internal
//! helpers expect it held. Tracker callbacks run under the lock and must
//! not re-enter.

use crate::common::types::{ServerId, ServerStatus, ServiceMask};
use crate::common::{Error, Result};
use crate::coordinator::log::{DurableLog, LogRecord, RecordId};
use crate::coordinator::propagation::{self, MembershipTransport, WorkUnit};
use crate::coordinator::recovery::RecoveryManager;
use crate::coordinator::registry::{Registry, ServerEntry};
use crate::coordinator::tracker::{ServerChangeEvent, ServerTracker};
use crate::coordinator::updates::{
    EntryState, MembershipMessage, MessageKind, UpdateBuffer, UNINITIALIZED_VERSION,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread;
use tracing::{debug, error, info, warn};

/// Round-robin scan cursor plus per-sweep accumulators.
#[derive(Debug, Default)]
struct ScanState {
    /// Slot index where the last `get_work` left off.
    search_index: usize,
    /// Minimum verified version observed so far in the current sweep;
    /// `None` until the sweep sees its first updatable server.
    min_version: Option<u64>,
    /// Version at which a full scan last found nothing to send. Scans
    /// short-circuit until a newer version invalidates it.
    no_work_found_for_epoch: u64,
}

struct Inner {
    registry: Registry,
    updates: UpdateBuffer,
    trackers: Vec<Box<dyn ServerTracker>>,

    /// Lower bound on `verified_version` across all updatable servers;
    /// everything at or below it can be pruned from the buffer.
    min_confirmed_version: u64,
    /// Number of update RPCs currently in flight.
    num_updating_servers: u64,
    last_scan: ScanState,

    next_replication_id: u64,
    replication_factor: usize,
}

/// Convergence counters exposed on the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterStats {
    pub version: u64,
    pub min_confirmed_version: u64,
    pub num_updating_servers: u64,
    pub buffered_updates: usize,
    pub masters: u32,
    pub backups: u32,
    pub converged: bool,
}

pub struct CoordinatorServerList {
    inner: Mutex<Inner>,
    /// Wakes the propagation worker: new updates queued, or stopping.
    has_updates_or_stop: Condvar,
    /// Wakes `sync` callers once the buffer drains.
    list_up_to_date: Condvar,
    stop_updater: AtomicBool,
    updater: Mutex<Option<thread::JoinHandle<()>>>,
    /// Handle to ourselves for spawning the worker thread.
    self_ref: Weak<CoordinatorServerList>,

    log: Arc<dyn DurableLog>,
    transport: Arc<dyn MembershipTransport>,
    recovery: Arc<dyn RecoveryManager>,
}

impl CoordinatorServerList {
    pub fn new(
        log: Arc<dyn DurableLog>,
        transport: Arc<dyn MembershipTransport>,
        recovery: Arc<dyn RecoveryManager>,
        replication_factor: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            inner: Mutex::new(Inner {
                registry: Registry::new(),
                updates: UpdateBuffer::new(),
                trackers: Vec::new(),
                min_confirmed_version: UNINITIALIZED_VERSION,
                num_updating_servers: 0,
                last_scan: ScanState::default(),
                next_replication_id: 1,
                replication_factor,
            }),
            has_updates_or_stop: Condvar::new(),
            list_up_to_date: Condvar::new(),
            stop_updater: AtomicBool::new(true),
            updater: Mutex::new(None),
            self_ref: self_ref.clone(),
            log,
            transport,
            recovery,
        })
    }

    // === Public mutations ===

    /// Enlist a server into the cluster, returning its new id.
    ///
    /// If `replaces` names a live entry, that server is forced down first;
    /// the resulting delta carries the removal of the old id before the
    /// addition of the new one, so members applying the update never see
    /// the replacement without the removal.
    pub fn enlist_server(
        &self,
        replaces: Option<ServerId>,
        services: ServiceMask,
        read_speed: u32,
        service_locator: &str,
    ) -> Result<ServerId> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        if let Some(replaces_id) = replaces {
            if inner.registry.get(replaces_id).is_some() {
                info!(
                    "{} is enlisting claiming to replace server id {}, which is still in the \
                     server list; taking its word for it and assuming the old server has failed",
                    service_locator, replaces_id
                );
                self.server_down_locked(inner, replaces_id)?;
            }
        }

        let new_id = inner.registry.generate_unique_id();

        let intent = self.log.append(
            &LogRecord::ServerEnlisting {
                server_id: new_id.as_u64(),
                services: services.0,
                read_speed,
                service_locator: service_locator.to_string(),
            },
            &[],
        )?;
        debug!("durable log: ServerEnlisting record {}", intent);
        if let Some(entry) = inner.registry.get_mut(new_id) {
            entry.server_info_log_id = intent;
        }

        self.enlist_complete(inner, new_id, services, read_speed, service_locator, intent)?;

        if let Some(replaced) = replaces {
            info!("newly enlisted server {} replaces server {}", new_id, replaced);
        }
        self.push_update_locked(inner);
        Ok(new_id)
    }

    /// Force a server out of the cluster.
    pub fn server_down(&self, server_id: ServerId) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        self.server_down_locked(inner, server_id)?;
        self.push_update_locked(inner);
        Ok(())
    }

    /// Remove a crashed server once its recovery has completed. The final
    /// delta reports the entry with status `Down`; the slot is freed.
    pub fn remove_after_recovery(&self, server_id: ServerId) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.remove(server_id)?;
        self.push_update_locked(inner);
        Ok(())
    }

    /// Reset the opaque metadata master recovery needs for `server_id`.
    ///
    /// Read-modify-write of the server's durable update record: an
    /// existing record is read back, mutated, and superseded by an append
    /// that invalidates it.
    pub fn set_master_recovery_info(&self, server_id: ServerId, info: &[u8]) -> Result<()> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        let old_record = inner
            .registry
            .get(server_id)
            .ok_or(Error::UnknownServerId(server_id))?
            .server_update_log_id;

        let record = if old_record != 0 {
            match self.log.read(old_record)? {
                LogRecord::ServerUpdate { server_id, .. } => LogRecord::ServerUpdate {
                    server_id,
                    master_recovery_info: info.to_vec(),
                },
                other => {
                    return Err(Error::Corrupted(format!(
                        "update record {} for server {} holds {:?}",
                        old_record, server_id, other
                    )))
                }
            }
        } else {
            LogRecord::ServerUpdate {
                server_id: server_id.as_u64(),
                master_recovery_info: info.to_vec(),
            }
        };

        let invalidates: Vec<RecordId> = if old_record != 0 { vec![old_record] } else { vec![] };
        let new_record = self.log.append(&record, &invalidates)?;
        self.recovery_info_complete(inner, server_id, info, new_record)
    }

    // === Queries ===

    /// Copy of the entry for `server_id`.
    pub fn get(&self, server_id: ServerId) -> Result<ServerEntry> {
        let inner = self.inner.lock().unwrap();
        inner
            .registry
            .get(server_id)
            .cloned()
            .ok_or(Error::UnknownServerId(server_id))
    }

    /// Number of masters with status `Up`.
    pub fn master_count(&self) -> u32 {
        self.inner.lock().unwrap().registry.num_masters()
    }

    /// Number of backups with status `Up`.
    pub fn backup_count(&self) -> u32 {
        self.inner.lock().unwrap().registry.num_backups()
    }

    /// Serialize the servers carrying any of the requested services, in
    /// registry-index order.
    pub fn serialize(&self, services: ServiceMask) -> MembershipMessage {
        let inner = self.inner.lock().unwrap();
        Self::snapshot(&inner.registry, inner.updates.version(), services)
    }

    /// Copies of every live backup entry, for placement rosters.
    pub fn live_backups(&self) -> Vec<ServerEntry> {
        let inner = self.inner.lock().unwrap();
        inner
            .registry
            .entries()
            .filter(|e| e.status == ServerStatus::Up && e.is_backup())
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> ClusterStats {
        let inner = self.inner.lock().unwrap();
        ClusterStats {
            version: inner.updates.version(),
            min_confirmed_version: inner.min_confirmed_version,
            num_updating_servers: inner.num_updating_servers,
            buffered_updates: inner.updates.len(),
            masters: inner.registry.num_masters(),
            backups: inner.registry.num_backups(),
            converged: Self::is_up_to_date(&inner),
        }
    }

    pub fn is_cluster_up_to_date(&self) -> bool {
        Self::is_up_to_date(&self.inner.lock().unwrap())
    }

    /// Subscribe an in-process tracker to membership changes.
    pub fn add_tracker(&self, tracker: Box<dyn ServerTracker>) {
        self.inner.lock().unwrap().trackers.push(tracker);
    }

    // === Recovery replay entry points ===

    /// Idempotently restore a server from its final `ServerEnlisted` record.
    pub fn recover_enlisted_server(
        &self,
        record: &LogRecord,
        record_id: RecordId,
    ) -> Result<ServerId> {
        let LogRecord::ServerEnlisted {
            server_id,
            services,
            read_speed,
            service_locator,
        } = record
        else {
            return Err(Error::Corrupted(format!(
                "recover_enlisted_server fed record {}",
                record_id
            )));
        };
        let id = Self::unpack_id(*server_id)?;
        debug!("recovering enlisted server {}", id);

        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.add(id, service_locator, ServiceMask(*services), *read_speed);
        if let Some(entry) = inner.registry.get_mut(id) {
            entry.server_info_log_id = record_id;
        }
        self.push_update_locked(inner);
        Ok(id)
    }

    /// Resume an enlistment that crashed after its `ServerEnlisting`
    /// intent: run the completion phase, appending the commit record.
    pub fn recover_enlist_server(
        &self,
        record: &LogRecord,
        record_id: RecordId,
    ) -> Result<ServerId> {
        let LogRecord::ServerEnlisting {
            server_id,
            services,
            read_speed,
            service_locator,
        } = record
        else {
            return Err(Error::Corrupted(format!(
                "recover_enlist_server fed record {}",
                record_id
            )));
        };
        let id = Self::unpack_id(*server_id)?;
        debug!("resuming enlistment of server {}", id);

        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        self.enlist_complete(
            inner,
            id,
            ServiceMask(*services),
            *read_speed,
            service_locator,
            record_id,
        )?;
        self.push_update_locked(inner);
        Ok(id)
    }

    /// Resume a server-down that crashed after its `ServerDown` record.
    pub fn recover_server_down(&self, record: &LogRecord, record_id: RecordId) -> Result<()> {
        let LogRecord::ServerDown { server_id } = record else {
            return Err(Error::Corrupted(format!(
                "recover_server_down fed record {}",
                record_id
            )));
        };
        let id = Self::unpack_id(*server_id)?;
        debug!("resuming server-down of {}", id);

        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        self.server_down_complete(inner, id, record_id)?;
        self.push_update_locked(inner);
        Ok(())
    }

    /// Restore recovery metadata from a surviving `ServerUpdate` record.
    pub fn recover_master_recovery_info(
        &self,
        record: &LogRecord,
        record_id: RecordId,
    ) -> Result<()> {
        let LogRecord::ServerUpdate {
            server_id,
            master_recovery_info,
        } = record
        else {
            return Err(Error::Corrupted(format!(
                "recover_master_recovery_info fed record {}",
                record_id
            )));
        };
        let id = Self::unpack_id(*server_id)?;
        debug!("recovering master recovery info for {}", id);

        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        self.recovery_info_complete(inner, id, master_recovery_info, record_id)
    }

    // === Propagation control ===

    /// Spawn the propagation worker if it isn't running, and nudge it.
    pub fn start_updater(&self) {
        let mut updater = self.updater.lock().unwrap();
        if updater.is_none() {
            if let Some(list) = self.self_ref.upgrade() {
                self.stop_updater.store(false, Ordering::SeqCst);
                *updater = Some(thread::spawn(move || propagation::update_loop(list)));
            }
        }
        self.has_updates_or_stop.notify_one();
    }

    /// Stop the propagation worker and join it. In-flight update RPCs are
    /// cancelled and their targets rolled back; the cluster may be left
    /// out of date. Call `sync` first to force a synchronization point.
    pub fn halt_updater(&self) {
        {
            let _guard = self.inner.lock().unwrap();
            self.stop_updater.store(true, Ordering::SeqCst);
            self.has_updates_or_stop.notify_one();
        }
        let handle = self.updater.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("membership updater thread panicked");
            }
        }
    }

    /// Block until every updatable server has confirmed the current
    /// version (or the registry is empty).
    pub fn sync(&self) {
        self.start_updater();
        let mut inner = self.inner.lock().unwrap();
        while !Self::is_up_to_date(&inner) {
            inner = self.list_up_to_date.wait(inner).unwrap();
        }
    }

    // === Worker-facing surface ===

    pub(crate) fn should_stop(&self) -> bool {
        self.stop_updater.load(Ordering::SeqCst)
    }

    pub(crate) fn transport(&self) -> Arc<dyn MembershipTransport> {
        Arc::clone(&self.transport)
    }

    /// Sleep until there are updates to send or the worker is stopping,
    /// waking `sync` callers while idle.
    pub(crate) fn wait_for_work(&self) {
        let mut inner = self.inner.lock().unwrap();
        while inner.min_confirmed_version == inner.updates.version() && !self.should_stop() {
            self.list_up_to_date.notify_all();
            inner = self.has_updates_or_stop.wait(inner).unwrap();
        }
    }

    /// Find one updatable server without an RPC already in flight and
    /// package what to send it. Every returned work unit MUST be matched
    /// by exactly one later `work_success` or `work_failed` for its
    /// target; the unit's payload stays valid regardless of pruning.
    ///
    /// The scan resumes where the previous call stopped, and on wrapping
    /// past index 0 it publishes the sweep's minimum verified version so
    /// confirmed updates can be pruned.
    pub fn get_work(&self) -> Option<WorkUnit> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        let version = inner.updates.version();
        // Nothing new since a fully fruitless scan: don't rescan until a
        // push or a completion invalidates the epoch.
        if inner.registry.is_empty()
            || (inner.num_updating_servers > 0
                && inner.last_scan.no_work_found_for_epoch == version)
        {
            return None;
        }

        let len = inner.registry.len();
        let mut i = inner.last_scan.search_index % len;
        let start = i;
        let mut num_updatable = 0u64;

        loop {
            let candidate = inner.registry.get_by_index(i as u32).and_then(|entry| {
                if entry.status == ServerStatus::Up && entry.services.has(ServiceMask::MEMBERSHIP)
                {
                    Some((
                        entry.server_id,
                        entry.verified_version,
                        entry.update_version,
                        entry.service_locator.clone(),
                    ))
                } else {
                    None
                }
            });

            if let Some((id, verified, update_version, locator)) = candidate {
                num_updatable += 1;
                let sweep_min = inner.last_scan.min_version.get_or_insert(verified);
                if verified < *sweep_min {
                    *sweep_min = verified;
                }

                if update_version != version && update_version == verified {
                    let work = if verified == UNINITIALIZED_VERSION {
                        // First contact: ship a full list, built lazily onto
                        // the newest buffered update.
                        let message = Self::full_snapshot_for_latest(inner);
                        WorkUnit {
                            target: id,
                            locator,
                            send_full_list: true,
                            update_version_tail: version,
                            message,
                        }
                    } else {
                        let tail = verified + 1;
                        let Some(update) = inner.updates.at_version(tail) else {
                            error!(
                                "update {} wanted for server {} is not buffered; mismatch \
                                 between scan state and buffer",
                                tail, id
                            );
                            return None;
                        };
                        WorkUnit {
                            target: id,
                            locator,
                            send_full_list: false,
                            update_version_tail: tail,
                            message: update.incremental.clone(),
                        }
                    };

                    inner.num_updating_servers += 1;
                    inner.last_scan.search_index = i;
                    if let Some(entry) = inner.registry.get_mut(work.target) {
                        entry.update_version = work.update_version_tail;
                    }
                    return Some(work);
                }
            }

            i = (i + 1) % len;
            if i == 0 {
                if let Some(min) = inner.last_scan.min_version.take() {
                    inner.min_confirmed_version = min;
                }
                Self::prune_locked(inner, &self.list_up_to_date);
            }
            if i == start {
                break;
            }
        }

        // With no updatable servers at all, every buffered update is
        // already moot.
        if num_updatable == 0 {
            inner.min_confirmed_version = version;
            Self::prune_locked(inner, &self.list_up_to_date);
        }
        inner.last_scan.no_work_found_for_epoch = version;
        None
    }

    /// The target acknowledged the update named by its work unit.
    pub fn work_success(&self, id: ServerId) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.dec_updating();

        let version = inner.updates.version();
        let mut rescan = false;
        match inner.registry.get_mut(id) {
            None => {
                // Unusual but not an error: the server was expunged while
                // its acknowledgment was in flight.
                debug!(
                    "server {} responded to a membership update but is no longer in the list",
                    id
                );
                return;
            }
            Some(entry) => {
                if entry.verified_version == entry.update_version {
                    error!(
                        "work_success invoked for server {} with no update outstanding; \
                         possible bookkeeping race",
                        id
                    );
                } else {
                    debug!(
                        "membership update success: server {} ({} => {})",
                        id, entry.verified_version, entry.update_version
                    );
                    entry.verified_version = entry.update_version;
                }
                if entry.verified_version < version {
                    rescan = true;
                }
            }
        }
        if rescan {
            inner.last_scan.no_work_found_for_epoch = 0;
        }
    }

    /// The update RPC for `id` failed; roll back so the next scan retries.
    pub fn work_failed(&self, id: ServerId) {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        inner.dec_updating();

        if let Some(entry) = inner.registry.get_mut(id) {
            entry.update_version = entry.verified_version;
            debug!(
                "membership update failed: server {} rolled back to version {}",
                id, entry.verified_version
            );
        }
        inner.last_scan.no_work_found_for_epoch = 0;
    }

    // === Internal helpers (lock held) ===

    fn enlist_complete(
        &self,
        inner: &mut Inner,
        id: ServerId,
        services: ServiceMask,
        read_speed: u32,
        service_locator: &str,
        intent: RecordId,
    ) -> Result<()> {
        inner.add(id, service_locator, services, read_speed);
        info!(
            "enlisting new server at {} (server id {}) supporting services: {}",
            service_locator, id, services
        );

        if services.has(ServiceMask::BACKUP) {
            debug!("backup at id {} has {} MB/s read", id, read_speed);
            inner.create_replication_groups();
        }

        let commit = self.log.append(
            &LogRecord::ServerEnlisted {
                server_id: id.as_u64(),
                services: services.0,
                read_speed,
                service_locator: service_locator.to_string(),
            },
            &[intent],
        )?;
        debug!("durable log: ServerEnlisted record {}", commit);
        if let Some(entry) = inner.registry.get_mut(id) {
            entry.server_info_log_id = commit;
        }
        Ok(())
    }

    fn server_down_locked(&self, inner: &mut Inner, id: ServerId) -> Result<()> {
        inner
            .registry
            .get(id)
            .ok_or(Error::UnknownServerId(id))?;
        let down_record = self
            .log
            .append(&LogRecord::ServerDown { server_id: id.as_u64() }, &[])?;
        debug!("durable log: ServerDown record {}", down_record);
        self.server_down_complete(inner, id, down_record)
    }

    fn server_down_complete(
        &self,
        inner: &mut Inner,
        id: ServerId,
        down_record: RecordId,
    ) -> Result<()> {
        // Copy taken before the crash so the recovery manager sees the
        // entry as it was while up.
        let entry = inner
            .registry
            .get(id)
            .ok_or(Error::UnknownServerId(id))?
            .clone();

        inner.crashed(id)?;
        if entry.is_master() {
            self.recovery.start_master_recovery(&entry);
        } else {
            // No recovery will run for this server, so nothing will remove
            // it later; transition it straight to removed.
            inner.remove(id)?;
        }

        inner.remove_replication_group(entry.replication_id);
        inner.create_replication_groups();

        let invalidates: Vec<RecordId> = [entry.server_info_log_id, down_record, entry.server_update_log_id]
            .into_iter()
            .filter(|&r| r != 0)
            .collect();
        self.log.invalidate(&invalidates)?;
        Ok(())
    }

    fn recovery_info_complete(
        &self,
        inner: &mut Inner,
        id: ServerId,
        info: &[u8],
        record: RecordId,
    ) -> Result<()> {
        match inner.registry.get_mut(id) {
            Some(entry) => {
                entry.server_update_log_id = record;
                entry.master_recovery_info = info.to_vec();
                Ok(())
            }
            None => {
                warn!("set_master_recovery_info: server {} doesn't exist", id);
                self.log.invalidate(&[record])?;
                Err(Error::ServerGone(id))
            }
        }
    }

    /// Queue the staged delta (if any) and wake the worker.
    fn push_update_locked(&self, inner: &mut Inner) {
        if let Some(version) = inner.updates.push_update() {
            debug!("queued membership update version {}", version);
            self.has_updates_or_stop.notify_one();
        }
    }

    fn prune_locked(inner: &mut Inner, list_up_to_date: &Condvar) {
        if inner.min_confirmed_version == UNINITIALIZED_VERSION {
            return;
        }
        if inner.min_confirmed_version > inner.updates.version() {
            error!(
                "inconsistent state: min_confirmed_version {} is beyond version {}; resetting",
                inner.min_confirmed_version,
                inner.updates.version()
            );
            inner.min_confirmed_version = 0;
            return;
        }
        if inner.updates.prune(inner.min_confirmed_version) {
            list_up_to_date.notify_all();
        }
    }

    fn is_up_to_date(inner: &Inner) -> bool {
        inner.registry.is_empty()
            || (inner.num_updating_servers == 0
                && inner.min_confirmed_version == inner.updates.version())
    }

    fn full_snapshot_for_latest(inner: &mut Inner) -> Arc<MembershipMessage> {
        if let Some(latest) = inner.updates.latest() {
            if let Some(full) = &latest.full {
                return full.clone();
            }
        }
        let snapshot = Arc::new(Self::snapshot(
            &inner.registry,
            inner.updates.version(),
            ServiceMask::ALL,
        ));
        if let Some(latest) = inner.updates.latest() {
            latest.full = Some(snapshot.clone());
        }
        snapshot
    }

    fn snapshot(registry: &Registry, version: u64, services: ServiceMask) -> MembershipMessage {
        MembershipMessage {
            version,
            kind: MessageKind::FullList,
            servers: registry
                .entries()
                .filter(|entry| entry.services.intersects(services))
                .map(|entry| entry.state())
                .collect(),
        }
    }

    fn unpack_id(raw: u64) -> Result<ServerId> {
        ServerId::from_u64(raw)
            .ok_or_else(|| Error::Corrupted(format!("record names invalid server id {:#x}", raw)))
    }

    #[cfg(test)]
    pub(crate) fn buffered_update(&self, version: u64) -> Option<Arc<MembershipMessage>> {
        let mut inner = self.inner.lock().unwrap();
        inner.updates.at_version(version).map(|u| u.incremental.clone())
    }
}

impl Inner {
    fn add(&mut self, id: ServerId, locator: &str, services: ServiceMask, read_speed: u32) {
        let state = self.registry.install(id, locator, services, read_speed).state();
        self.updates.stage(state.clone());
        self.notify_trackers(&state, ServerChangeEvent::ServerAdded);
    }

    /// Transition to crashed; a no-op when already crashed, so the crash
    /// and removal paths can compose without double-counting.
    fn crashed(&mut self, id: ServerId) -> Result<()> {
        let state = self.registry.mark_crashed(id)?.map(|entry| entry.state());
        if let Some(state) = state {
            self.updates.stage(state.clone());
            self.notify_trackers(&state, ServerChangeEvent::ServerCrashed);
        }
        Ok(())
    }

    /// Crash (idempotently), mark down, stage the final delta, and destroy
    /// the slot's entry. Trackers are notified with a copy: the slot is
    /// gone by notification time.
    fn remove(&mut self, id: ServerId) -> Result<()> {
        self.crashed(id)?;
        let entry = self.registry.take_down(id)?;
        let state = entry.state();
        self.updates.stage(state.clone());
        self.notify_trackers(&state, ServerChangeEvent::ServerRemoved);
        Ok(())
    }

    fn notify_trackers(&self, state: &EntryState, event: ServerChangeEvent) {
        for tracker in &self.trackers {
            tracker.enqueue_change(state, event);
        }
        for tracker in &self.trackers {
            tracker.fire_callback();
        }
    }

    fn dec_updating(&mut self) {
        if self.num_updating_servers > 0 {
            self.num_updating_servers -= 1;
        } else {
            error!(
                "num_updating_servers underflow; mismatched get_work and \
                 work_success/work_failed calls"
            );
        }
    }

    // === Replication grouping ===

    /// Give `id` a new replication group and stage the change so the
    /// cluster learns of it. Silently skipped for entries that are not up.
    fn set_replication_id(&mut self, id: ServerId, replication_id: u64) -> Result<()> {
        let entry = self
            .registry
            .get_mut(id)
            .ok_or(Error::UnknownServerId(id))?;
        if entry.status != ServerStatus::Up {
            return Ok(());
        }
        entry.replication_id = replication_id;
        let state = entry.state();
        self.updates.stage(state);
        Ok(())
    }

    /// Assign every member of `members` to `replication_id`. Fails on the
    /// first member missing from the registry without undoing earlier
    /// assignments; the next `create_replication_groups` converges.
    fn assign_replication_group(
        &mut self,
        replication_id: u64,
        members: &[ServerId],
    ) -> Result<()> {
        for &member in members {
            if self.registry.get(member).is_none() {
                return Err(Error::UnknownServerId(member));
            }
            self.set_replication_id(member, replication_id)?;
        }
        Ok(())
    }

    /// Gather all up, ungrouped backups and form as many full groups as
    /// possible, each under a fresh monotonically allocated id.
    fn create_replication_groups(&mut self) {
        let mut free: Vec<ServerId> = self
            .registry
            .entries()
            .filter(|e| {
                e.is_backup() && e.status == ServerStatus::Up && e.replication_id == 0
            })
            .map(|e| e.server_id)
            .collect();

        while free.len() >= self.replication_factor {
            let group: Vec<ServerId> = (0..self.replication_factor)
                .filter_map(|_| free.pop())
                .collect();
            let group_id = self.next_replication_id;
            self.next_replication_id += 1;
            if let Err(e) = self.assign_replication_group(group_id, &group) {
                warn!(
                    "replication group {} left partially assigned: {}",
                    group_id, e
                );
            } else {
                debug!("formed replication group {}: {:?}", group_id, group);
            }
        }
    }

    /// Reset `replication_id` to 0 for every backup in `group_id`.
    /// Group 0 is the unassigned pool and is never dissolved.
    fn remove_replication_group(&mut self, group_id: u64) {
        if group_id == 0 {
            return;
        }
        let members: Vec<ServerId> = self
            .registry
            .entries()
            .filter(|e| e.is_backup() && e.replication_id == group_id)
            .map(|e| e.server_id)
            .collect();
        if !members.is_empty() {
            // Members were just collected from the registry under this
            // lock, so the assignment cannot miss any of them.
            if let Err(e) = self.assign_replication_group(0, &members) {
                warn!("replication group {} not fully dissolved: {}", group_id, e);
            }
        }
    }
}
