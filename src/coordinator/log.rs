//! Durable-log adapter
//!
//! Membership mutations are made crash-safe by logging intent and commit
//! records to a replicated configuration store. The core only depends on
//! the contract that a completed `append` is durable and that surviving
//! records can be replayed after a coordinator failover.
//!
//! The store itself is external. `SledLog` is a single-node stand-in kept
//! here for development and single-coordinator deployments; a production
//! cluster would point the adapter at a consensus-backed log service.

use crate::common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Stable id of a durable record. 0 means "no record".
pub type RecordId = u64;

/// One durable record. The tag discriminates replay handling: an orphaned
/// `ServerEnlisting` intent is completed, a `ServerEnlisted` commit is
/// restored idempotently, and so on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entry_type")]
pub enum LogRecord {
    ServerEnlisting {
        server_id: u64,
        services: u32,
        read_speed: u32,
        service_locator: String,
    },
    ServerEnlisted {
        server_id: u64,
        services: u32,
        read_speed: u32,
        service_locator: String,
    },
    ServerDown {
        server_id: u64,
    },
    ServerUpdate {
        server_id: u64,
        master_recovery_info: Vec<u8>,
    },
}

impl LogRecord {
    /// Packed id of the server this record concerns.
    pub fn server_id(&self) -> u64 {
        match self {
            LogRecord::ServerEnlisting { server_id, .. }
            | LogRecord::ServerEnlisted { server_id, .. }
            | LogRecord::ServerDown { server_id }
            | LogRecord::ServerUpdate { server_id, .. } => *server_id,
        }
    }
}

/// Contract with the replicated configuration store.
///
/// The adapter owns its leadership cursor: any mutating call made after the
/// store's head has moved past this coordinator fails with
/// [`Error::StaleLog`], which the caller must treat as fatal (the
/// coordinator is no longer leader and must step down).
pub trait DurableLog: Send + Sync {
    /// Durably append `record`, atomically invalidating the given records.
    /// Returns the stable id of the new record.
    fn append(&self, record: &LogRecord, invalidates: &[RecordId]) -> Result<RecordId>;

    /// Read a surviving record back.
    fn read(&self, id: RecordId) -> Result<LogRecord>;

    /// Invalidate records without appending anything.
    fn invalidate(&self, ids: &[RecordId]) -> Result<()>;

    /// Every surviving record in append order, for failover replay.
    fn records(&self) -> Result<Vec<(RecordId, LogRecord)>>;
}

/// In-memory log for tests and wiring experiments. `set_stale` simulates a
/// leadership change: every subsequent mutation fails with `StaleLog`.
#[derive(Debug)]
pub struct MemLog {
    inner: Mutex<MemLogInner>,
    stale: AtomicBool,
}

impl Default for MemLog {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct MemLogInner {
    next_id: RecordId,
    records: BTreeMap<RecordId, LogRecord>,
}

impl MemLog {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemLogInner {
                next_id: 1,
                records: BTreeMap::new(),
            }),
            stale: AtomicBool::new(false),
        }
    }

    /// Simulate losing leadership of the replicated log.
    pub fn set_stale(&self, stale: bool) {
        self.stale.store(stale, Ordering::SeqCst);
    }

    fn check_leader(&self) -> Result<()> {
        if self.stale.load(Ordering::SeqCst) {
            Err(Error::StaleLog)
        } else {
            Ok(())
        }
    }
}

impl DurableLog for MemLog {
    fn append(&self, record: &LogRecord, invalidates: &[RecordId]) -> Result<RecordId> {
        self.check_leader()?;
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;
        for old in invalidates {
            inner.records.remove(old);
        }
        inner.records.insert(id, record.clone());
        Ok(id)
    }

    fn read(&self, id: RecordId) -> Result<LogRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .get(&id)
            .cloned()
            .ok_or(Error::NoSuchRecord(id))
    }

    fn invalidate(&self, ids: &[RecordId]) -> Result<()> {
        self.check_leader()?;
        let mut inner = self.inner.lock().unwrap();
        for id in ids {
            inner.records.remove(id);
        }
        Ok(())
    }

    fn records(&self) -> Result<Vec<(RecordId, LogRecord)>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.records.iter().map(|(k, v)| (*k, v.clone())).collect())
    }
}

/// Sled-backed log. Records are bincode-encoded under big-endian u64 keys
/// so iteration order is append order.
pub struct SledLog {
    db: sled::Db,
}

impl SledLog {
    /// Open or create the log at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    fn next_id(&self) -> Result<RecordId> {
        match self.db.last()? {
            Some((key, _)) => Ok(decode_key(&key)? + 1),
            None => Ok(1),
        }
    }
}

fn decode_key(key: &[u8]) -> Result<RecordId> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| Error::Corrupted("log key is not 8 bytes".into()))?;
    Ok(u64::from_be_bytes(bytes))
}

fn decode_record(value: &[u8]) -> Result<LogRecord> {
    bincode::deserialize(value).map_err(|e| Error::Corrupted(e.to_string()))
}

impl DurableLog for SledLog {
    fn append(&self, record: &LogRecord, invalidates: &[RecordId]) -> Result<RecordId> {
        let id = self.next_id()?;
        let value =
            bincode::serialize(record).map_err(|e| Error::Internal(e.to_string()))?;
        self.db.insert(id.to_be_bytes(), value)?;
        for old in invalidates {
            self.db.remove(old.to_be_bytes())?;
        }
        self.db.flush()?;
        Ok(id)
    }

    fn read(&self, id: RecordId) -> Result<LogRecord> {
        match self.db.get(id.to_be_bytes())? {
            Some(value) => decode_record(&value),
            None => Err(Error::NoSuchRecord(id)),
        }
    }

    fn invalidate(&self, ids: &[RecordId]) -> Result<()> {
        for id in ids {
            self.db.remove(id.to_be_bytes())?;
        }
        self.db.flush()?;
        Ok(())
    }

    fn records(&self) -> Result<Vec<(RecordId, LogRecord)>> {
        let mut records = Vec::new();
        for item in self.db.iter() {
            let (key, value) = item?;
            records.push((decode_key(&key)?, decode_record(&value)?));
        }
        Ok(records)
    }
}
