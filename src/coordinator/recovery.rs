//! Coordinator failover recovery
//!
//! The master-recovery orchestrator is an external collaborator; the
//! membership core only needs to kick it when a master crashes. Boot-time
//! replay walks the surviving durable-log records and feeds each one to
//! the matching recovery entry point on the server list.

use crate::common::{Error, Result};
use crate::coordinator::log::{DurableLog, LogRecord};
use crate::coordinator::registry::ServerEntry;
use crate::coordinator::server_list::CoordinatorServerList;
use tracing::{info, warn};

/// Kicked exactly once per master crash, with the coordinator lock held.
/// Implementations must not call back into the server list; queue the work
/// and return.
pub trait RecoveryManager: Send + Sync {
    fn start_master_recovery(&self, entry: &ServerEntry);
}

/// Stand-in recovery manager that only records the kick. Deployments wire
/// the real orchestrator in through the same trait.
pub struct LoggingRecovery;

impl RecoveryManager for LoggingRecovery {
    fn start_master_recovery(&self, entry: &ServerEntry) {
        info!(
            "master recovery required for server {} at {}",
            entry.server_id, entry.service_locator
        );
    }
}

/// Replay every surviving durable record into `list` after a coordinator
/// failover. Records that name servers no longer present are tolerated:
/// they lost a race with an invalidation and the warn is the only trace
/// they leave.
///
/// Returns the number of records applied.
pub fn replay(list: &CoordinatorServerList, log: &dyn DurableLog) -> Result<usize> {
    let mut applied = 0;
    for (record_id, record) in log.records()? {
        let outcome = match &record {
            LogRecord::ServerEnlisted { .. } => {
                list.recover_enlisted_server(&record, record_id).map(|_| ())
            }
            LogRecord::ServerEnlisting { .. } => {
                list.recover_enlist_server(&record, record_id).map(|_| ())
            }
            LogRecord::ServerDown { .. } => list.recover_server_down(&record, record_id),
            LogRecord::ServerUpdate { .. } => {
                list.recover_master_recovery_info(&record, record_id)
            }
        };
        match outcome {
            Ok(()) => applied += 1,
            Err(Error::UnknownServerId(id)) | Err(Error::ServerGone(id)) => {
                warn!(
                    "skipping stale record {} for departed server {}",
                    record_id, id
                );
            }
            Err(e) => return Err(e),
        }
    }
    Ok(applied)
}
