//! In-memory server registry
//!
//! A slot table keyed by server index. Slot 0 is reserved and never
//! allocated; the table grows as servers enlist and never shrinks. Each
//! slot remembers the generation number to hand out next, so a `ServerId`
//! is unique for all time within one coordinator epoch.

use crate::common::types::{ServerId, ServerStatus, ServiceMask};
use crate::common::{Error, Result};
use crate::coordinator::log::RecordId;
use crate::coordinator::updates::{EntryState, UNINITIALIZED_VERSION};

/// Everything the coordinator tracks about one enlisted server.
#[derive(Debug, Clone)]
pub struct ServerEntry {
    pub server_id: ServerId,
    pub service_locator: String,
    pub services: ServiceMask,
    pub status: ServerStatus,

    /// Disk bandwidth hint in MB/s; meaningful only for backups.
    pub expected_read_mbytes_per_sec: u32,

    /// Replication group id; 0 means unassigned.
    pub replication_id: u64,

    /// Opaque blob owned by the master-recovery subsystem.
    pub master_recovery_info: Vec<u8>,

    /// Highest membership version this server has acknowledged.
    pub verified_version: u64,

    /// Version most recently sent to this server; equals
    /// `verified_version` when no update RPC is in flight.
    pub update_version: u64,

    /// Durable-log record holding this server's enlistment info (0 = none).
    pub server_info_log_id: RecordId,

    /// Durable-log record holding this server's latest update (0 = none).
    pub server_update_log_id: RecordId,
}

impl ServerEntry {
    fn new(server_id: ServerId, service_locator: String, services: ServiceMask) -> Self {
        Self {
            server_id,
            service_locator,
            services,
            status: ServerStatus::Up,
            expected_read_mbytes_per_sec: 0,
            replication_id: 0,
            master_recovery_info: Vec::new(),
            verified_version: UNINITIALIZED_VERSION,
            update_version: UNINITIALIZED_VERSION,
            server_info_log_id: 0,
            server_update_log_id: 0,
        }
    }

    /// Placeholder installed by `generate_unique_id` so the slot can't be
    /// handed out twice before `add` fills it in.
    fn placeholder(server_id: ServerId) -> Self {
        Self::new(server_id, String::new(), ServiceMask::empty())
    }

    pub fn is_master(&self) -> bool {
        self.services.has(ServiceMask::MASTER)
    }

    pub fn is_backup(&self) -> bool {
        self.services.has(ServiceMask::BACKUP)
    }

    /// Snapshot of the externally visible state, as staged into deltas and
    /// full lists.
    pub fn state(&self) -> EntryState {
        EntryState {
            server_id: self.server_id,
            services: self.services,
            service_locator: self.service_locator.clone(),
            status: self.status,
            expected_read_mbytes_per_sec: if self.is_backup() {
                self.expected_read_mbytes_per_sec
            } else {
                0
            },
            replication_id: self.replication_id,
        }
    }
}

#[derive(Debug, Default)]
struct Slot {
    next_generation: u32,
    entry: Option<ServerEntry>,
}

/// Slot table over every known server. Callers hold the coordinator lock.
#[derive(Debug)]
pub struct Registry {
    slots: Vec<Slot>,
    num_masters: u32,
    num_backups: u32,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            // Slot 0 is reserved: index 0 must never name a server.
            slots: vec![Slot::default()],
            num_masters: 0,
            num_backups: 0,
        }
    }

    /// Number of masters with status `Up`.
    pub fn num_masters(&self) -> u32 {
        self.num_masters
    }

    /// Number of backups with status `Up`.
    pub fn num_backups(&self) -> u32 {
        self.num_backups
    }

    /// Number of slots, occupied or not (never 0; slot 0 always exists).
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.len() <= 1
    }

    /// First unoccupied index, growing the table by one slot if full.
    /// Never returns 0.
    pub fn first_free_index(&mut self) -> u32 {
        let mut index = 1;
        while index < self.slots.len() {
            if self.slots[index].entry.is_none() {
                break;
            }
            index += 1;
        }
        if index >= self.slots.len() {
            self.slots.push(Slot::default());
        }
        debug_assert_ne!(index, 0);
        index as u32
    }

    /// Allocate a fresh `ServerId` and park a placeholder entry in its slot
    /// so a second allocation can't pick the same index. The generation is
    /// bumped on allocation, so the id stays unique even if the placeholder
    /// is later overwritten.
    pub fn generate_unique_id(&mut self) -> ServerId {
        let index = self.first_free_index();
        let slot = &mut self.slots[index as usize];
        let id = ServerId::new(index, slot.next_generation);
        slot.next_generation = slot.next_generation.wrapping_add(1);
        slot.entry = Some(ServerEntry::placeholder(id));
        id
    }

    /// Install an entry at `id.index`, resizing if needed (recovery replay
    /// adds entries whose slots were never allocated in this epoch).
    /// Returns a reference to the installed entry.
    pub fn install(
        &mut self,
        id: ServerId,
        service_locator: &str,
        services: ServiceMask,
        read_speed: u32,
    ) -> &ServerEntry {
        let index = id.index as usize;
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, Slot::default);
        }

        // Replay may reinstall over an existing entry (or the placeholder
        // from `generate_unique_id`); whatever it counted is superseded.
        if let Some(old) = self.slots[index].entry.take() {
            if old.status == ServerStatus::Up {
                if old.is_master() {
                    self.num_masters -= 1;
                }
                if old.is_backup() {
                    self.num_backups -= 1;
                }
            }
        }

        let slot = &mut self.slots[index];
        slot.next_generation = id.generation.wrapping_add(1);
        let mut entry = ServerEntry::new(id, service_locator.to_string(), services);

        if services.has(ServiceMask::MASTER) {
            self.num_masters += 1;
        }
        if services.has(ServiceMask::BACKUP) {
            self.num_backups += 1;
            entry.expected_read_mbytes_per_sec = read_speed;
        }

        slot.entry = Some(entry);
        slot.entry.as_ref().unwrap()
    }

    /// Transition an entry to `Crashed`, decrementing live counts.
    ///
    /// No-op if the entry is already crashed (`Ok(None)`); the caller must
    /// never pass a `Down` entry (those have been destroyed and fail the
    /// lookup anyway).
    pub fn mark_crashed(&mut self, id: ServerId) -> Result<Option<&ServerEntry>> {
        let slot_index = self.check(id)?;
        let entry = self.slots[slot_index].entry.as_mut().unwrap();
        if entry.status == ServerStatus::Crashed {
            return Ok(None);
        }
        debug_assert_ne!(entry.status, ServerStatus::Down);

        let is_master = entry.is_master();
        let is_backup = entry.is_backup();
        entry.status = ServerStatus::Crashed;
        if is_master {
            self.num_masters -= 1;
        }
        if is_backup {
            self.num_backups -= 1;
        }
        Ok(Some(self.slots[slot_index].entry.as_ref().unwrap()))
    }

    /// Mark an entry `Down` and free its slot, returning the final entry
    /// state (status `Down`) by value. The caller must have crashed the
    /// entry first.
    pub fn take_down(&mut self, id: ServerId) -> Result<ServerEntry> {
        let slot_index = self.check(id)?;
        let entry = self.slots[slot_index].entry.as_mut().unwrap();
        debug_assert_eq!(entry.status, ServerStatus::Crashed);
        entry.status = ServerStatus::Down;
        Ok(self.slots[slot_index].entry.take().unwrap())
    }

    /// Look up an entry by id; the generation must match.
    pub fn get(&self, id: ServerId) -> Option<&ServerEntry> {
        self.slots
            .get(id.index as usize)
            .and_then(|slot| slot.entry.as_ref())
            .filter(|entry| entry.server_id == id)
    }

    pub fn get_mut(&mut self, id: ServerId) -> Option<&mut ServerEntry> {
        self.slots
            .get_mut(id.index as usize)
            .and_then(|slot| slot.entry.as_mut())
            .filter(|entry| entry.server_id == id)
    }

    /// Look up whatever entry occupies `index`, if any.
    pub fn get_by_index(&self, index: u32) -> Option<&ServerEntry> {
        self.slots
            .get(index as usize)
            .and_then(|slot| slot.entry.as_ref())
    }

    pub fn get_by_index_mut(&mut self, index: u32) -> Option<&mut ServerEntry> {
        self.slots
            .get_mut(index as usize)
            .and_then(|slot| slot.entry.as_mut())
    }

    /// All occupied entries in index order.
    pub fn entries(&self) -> impl Iterator<Item = &ServerEntry> {
        self.slots.iter().filter_map(|slot| slot.entry.as_ref())
    }

    fn check(&self, id: ServerId) -> Result<usize> {
        let index = id.index as usize;
        let valid = self
            .slots
            .get(index)
            .and_then(|slot| slot.entry.as_ref())
            .is_some_and(|entry| entry.server_id == id);
        if valid {
            Ok(index)
        } else {
            Err(Error::UnknownServerId(id))
        }
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
